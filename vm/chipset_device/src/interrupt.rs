// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt-related traits

use crate::ChipsetDevice;
use std::ops::RangeInclusive;

/// Implemented by devices that have incoming interrupt lines (e.g: an
/// interrupt controller).
pub trait LineInterruptTarget: ChipsetDevice {
    /// Sets an interrupt line state.
    fn set_irq(&mut self, vector: u32, high: bool);

    /// Returns the valid line ranges for this target.
    fn valid_lines(&self) -> &[RangeInclusive<u32>];
}
