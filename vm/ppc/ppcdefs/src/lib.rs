// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PowerPC architecture definitions.
//!
//! This crate is meant to be imported by PowerPC-related code. It contains
//! only constants and type definitions; behavior belongs in the device
//! models.

#![forbid(unsafe_code)]

pub mod xive;
