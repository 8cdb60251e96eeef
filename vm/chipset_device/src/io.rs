// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device IO result types.

/// An error related to the suitability of the IO request for the device. A
/// device should handle device-specific errors internally, and should return
/// `IoResult::Ok` in those conditions.
#[derive(Debug)]
pub enum IoError {
    /// The requested device register is not present.
    InvalidRegister,
    /// The access length is invalid for the specified address.
    InvalidAccessSize,
    /// The caller attempted to perform an unaligned access to the device
    /// registers.
    UnalignedAccess,
}

/// The result returned by a device MMIO operation, as in the methods of
/// [`MmioIntercept`](crate::mmio::MmioIntercept).
#[derive(Debug)]
#[must_use]
pub enum IoResult {
    /// The IO operation succeeded.
    Ok,
    /// The IO operation failed due to an access error.
    ///
    /// The caller should log the failure, then ignore writes, and fill the
    /// buffer with the bus error value (all ones for MMIO) on reads.
    Err(IoError),
}

impl IoResult {
    /// Asserts if `self` is not `IoResult::Ok`.
    #[track_caller]
    pub fn unwrap(self) {
        match self {
            IoResult::Ok => {}
            IoResult::Err(_) => panic!("unexpected IO result {:?}", self),
        }
    }
}
