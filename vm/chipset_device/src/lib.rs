// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and traits to model chipset devices, and associated chipset services.

#![forbid(unsafe_code)]

/// Implemented by any device that is considered part of the guest's "chipset"
/// (insofar as it exists on one or more system busses).
//
// DEVNOTE: keep this trait free of heavy bounds (diagnostics, saved state,
// etc.) so that test devices stay cheap to stub out.
pub trait ChipsetDevice: 'static + Send {
    /// Optionally returns a trait object to send MMIO intercepts to.
    #[inline(always)]
    fn supports_mmio(&mut self) -> Option<&mut dyn mmio::MmioIntercept> {
        None
    }

    /// Optionally returns a trait object to send interrupt line changes to.
    #[inline(always)]
    fn supports_line_interrupt_target(
        &mut self,
    ) -> Option<&mut dyn interrupt::LineInterruptTarget> {
        None
    }
}

pub mod interrupt;
pub mod io;
pub mod mmio;
