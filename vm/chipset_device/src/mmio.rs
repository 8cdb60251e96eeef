// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MMIO intercepts

use crate::io::IoResult;
use crate::ChipsetDevice;
use std::ops::RangeInclusive;

/// Implemented by devices which use MMIO intercepts.
pub trait MmioIntercept: ChipsetDevice {
    /// Dispatch an MMIO read to the device with the given address.
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> IoResult;
    /// Dispatch an MMIO write to the device with the given address.
    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> IoResult;

    /// Report a set of static mmio regions (region_name, gpa_range) that
    /// cannot be remapped at runtime and are always registered.
    fn get_static_regions(&mut self) -> &[(&str, RangeInclusive<u64>)] {
        &[]
    }
}

/// A trait to register device-specific MMIO intercept regions.
pub trait RegisterMmioIntercept {
    /// Registers a new IO region of the given length.
    fn new_io_region(&mut self, region_name: &str, len: u64) -> Box<dyn ControlMmioIntercept>;
}

/// A trait to map/unmap a device-specific MMIO intercept region.
pub trait ControlMmioIntercept: Send + Sync {
    /// Return the region's name.
    fn region_name(&self) -> &str;

    /// Enables the IO region at the given address.
    ///
    /// This method will never fail, as devices are not expected to gracefully
    /// handle the case where an IO region overlaps with an existing region.
    fn map(&mut self, addr: u64);

    /// Disables the IO region.
    fn unmap(&mut self);

    /// Return the currently mapped address.
    ///
    /// Returns `None` if the region is currently unmapped.
    fn addr(&self) -> Option<u64>;

    /// Return the length of the region.
    fn len(&self) -> u64;

    /// Return the offset of `addr` from the region's base address.
    ///
    /// Returns `None` if the provided `addr` is outside of the memory
    /// region, or the region is currently unmapped.
    fn offset_of(&self, addr: u64) -> Option<u64>;
}

/// A zero sized type that has a no-op `impl` of [`RegisterMmioIntercept`].
///
/// As the name suggests, this type should be used when a [`ChipsetDevice`] is
/// hosted outside of a traditional "chipset" context, where some external
/// code is responsible for managing the device's MMIO intercepts.
pub struct ExternallyManagedMmioIntercepts;

impl RegisterMmioIntercept for ExternallyManagedMmioIntercepts {
    fn new_io_region(&mut self, _region_name: &str, _len: u64) -> Box<dyn ControlMmioIntercept> {
        Box::new(())
    }
}

impl ControlMmioIntercept for () {
    fn region_name(&self) -> &str {
        "(noop)"
    }
    fn map(&mut self, _addr: u64) {}
    fn unmap(&mut self) {}
    fn addr(&self) -> Option<u64> {
        None
    }
    fn len(&self) -> u64 {
        0
    }
    fn offset_of(&self, _addr: u64) -> Option<u64> {
        None
    }
}
