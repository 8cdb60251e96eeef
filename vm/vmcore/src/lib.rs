// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core types and traits shared by the VM device models.

#![forbid(unsafe_code)]

pub mod line_interrupt;
