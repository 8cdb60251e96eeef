// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles shared by the device tests.

use crate::XiveNotifier;
use chipset_device::mmio::ControlMmioIntercept;
use chipset_device::mmio::RegisterMmioIntercept;
use parking_lot::Mutex;

/// A notification fabric that just records the forwarded LISNs.
#[derive(Default)]
pub struct TestFabric {
    lisns: Mutex<Vec<u32>>,
}

impl TestFabric {
    /// Drains and returns the LISNs notified so far.
    pub fn take(&self) -> Vec<u32> {
        std::mem::take(&mut self.lisns.lock())
    }
}

impl XiveNotifier for TestFabric {
    fn notify(&self, lisn: u32) {
        self.lisns.lock().push(lisn);
    }
}

/// A functional [`RegisterMmioIntercept`], unlike the externally-managed
/// no-op: the returned control resolves addresses once mapped.
pub struct TestMmioRegistration;

struct TestMmioRegion {
    name: String,
    len: u64,
    addr: Option<u64>,
}

impl RegisterMmioIntercept for TestMmioRegistration {
    fn new_io_region(&mut self, region_name: &str, len: u64) -> Box<dyn ControlMmioIntercept> {
        Box::new(TestMmioRegion {
            name: region_name.to_owned(),
            len,
            addr: None,
        })
    }
}

impl ControlMmioIntercept for TestMmioRegion {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn map(&mut self, addr: u64) {
        self.addr = Some(addr);
    }

    fn unmap(&mut self) {
        self.addr = None;
    }

    fn addr(&self) -> Option<u64> {
        self.addr
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn offset_of(&self, addr: u64) -> Option<u64> {
        let base = self.addr?;
        (addr >= base && addr < base + self.len).then(|| addr - base)
    }
}
