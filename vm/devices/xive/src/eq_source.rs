// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The EQ ESB source.
//!
//! Event queues carry two ESBs of their own, embedded in descriptor word 1:
//! ESn coalesces notifications at the queue level, ESe escalation events.
//! This device exposes them to the guest as an MMIO region of one even/odd
//! page pair per queue: the even page manages ESn, the odd page ESe. The
//! offset decoding mirrors the interrupt ESB pages, but since the bits live
//! in the descriptor, every access is a read-modify-write of the EQ through
//! the router's tables.

use crate::esb;
use crate::router::XiveRouter;
use crate::source::XiveSourceError;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::ControlMmioIntercept;
use chipset_device::mmio::MmioIntercept;
use chipset_device::mmio::RegisterMmioIntercept;
use chipset_device::ChipsetDevice;
use ppcdefs::xive::XIVE_ESB_4K;
use ppcdefs::xive::XIVE_ESB_64K;
use std::sync::Arc;

/// The MMIO region exposing the per-EQ ESB pairs.
pub struct XiveEqSource {
    // Static configuration
    nr_eqs: u32,
    esb_shift: u8,

    // Runtime glue
    router: Arc<XiveRouter>,
    esb_region: Box<dyn ControlMmioIntercept>,
}

impl XiveEqSource {
    /// Creates the ESB region for `nr_eqs` event queues of `router`'s
    /// block.
    pub fn new(
        nr_eqs: u32,
        esb_shift: u8,
        router: Arc<XiveRouter>,
        register_mmio: &mut dyn RegisterMmioIntercept,
    ) -> Result<Self, XiveSourceError> {
        if nr_eqs == 0 {
            return Err(XiveSourceError::NoIrqs);
        }
        if !matches!(esb_shift, XIVE_ESB_4K | XIVE_ESB_64K) {
            return Err(XiveSourceError::InvalidEsbShift(esb_shift));
        }

        // Each EQ is assigned an even/odd pair of pages: the even page
        // manages the ESn field, the odd page the ESe field.
        let esb_region =
            register_mmio.new_io_region("xive-eq-esb", (nr_eqs as u64) << (esb_shift + 1));

        Ok(Self {
            nr_eqs,
            esb_shift,
            router,
            esb_region,
        })
    }

    /// Returns the number of event queues covered by the region.
    pub fn nr_eqs(&self) -> u32 {
        self.nr_eqs
    }

    /// Returns the size of the ESB MMIO region in bytes.
    pub fn esb_len(&self) -> u64 {
        (self.nr_eqs as u64) << (self.esb_shift + 1)
    }

    /// Maps the ESB MMIO region at `base`.
    pub fn map_esb(&mut self, base: u64) {
        self.esb_region.map(base);
    }

    /// Returns the byte offset of the ESn (even) page of `eq_idx` within
    /// the region.
    pub fn esn_page_offset(&self, eq_idx: u32) -> u64 {
        assert!(eq_idx < self.nr_eqs);
        (eq_idx as u64) << (self.esb_shift + 1)
    }

    /// Returns the byte offset of the ESe (odd) page of `eq_idx` within
    /// the region.
    pub fn ese_page_offset(&self, eq_idx: u32) -> u64 {
        self.esn_page_offset(eq_idx) | 1 << self.esb_shift
    }

    /// Reads from the EQ ESB region: EOI, get and set-PQ operations on the
    /// page's ESB field.
    pub fn esb_read(&mut self, offset: u64, data: &mut [u8]) -> IoResult {
        if data.len() != 8 {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        let eq_blk = self.router.chip_id();
        let eq_idx = (offset >> (self.esb_shift + 1)) as u32;
        let op = offset & 0xfff;

        let Some(mut eqd) = self.router.tables().eqd(eq_blk, eq_idx) else {
            tracelimit::warn_ratelimited!(eq_blk, eq_idx, "no EQ descriptor");
            return IoResult::Err(IoError::InvalidRegister);
        };
        if !eqd.w0.valid() {
            tracelimit::warn_ratelimited!(eq_blk, eq_idx, "EQ descriptor is invalid");
            return IoResult::Err(IoError::InvalidRegister);
        }

        let is_esn = (offset >> self.esb_shift) & 1 == 0;
        let pq = if is_esn { eqd.w1.esn() } else { eqd.w1.ese() };

        let (pq, value) = match op {
            0x000..=0x7ff => {
                // An EOI that uncovers a queued event does not re-route it;
                // forwarding the coalesced notification from here is
                // deliberately left out.
                let (new, notify) = esb::eoi(pq);
                (new, notify as u64)
            }
            0x800..=0xbff => (pq, pq as u64),
            0xc00..=0xfff => {
                let (new, old) = esb::set(pq, ((op >> 8) & 0x3) as u8);
                (new, old as u64)
            }
            _ => unreachable!(),
        };

        let old = if is_esn { eqd.w1.esn() } else { eqd.w1.ese() };
        if pq != old {
            if is_esn {
                eqd.w1.set_esn(pq);
            } else {
                eqd.w1.set_ese(pq);
            }
            self.router.tables().set_eqd(eq_blk, eq_idx, eqd);
        }

        data.copy_from_slice(&value.to_be_bytes());
        IoResult::Ok
    }

    /// Stores to the EQ ESB region are invalid.
    pub fn esb_write(&mut self, offset: u64, _data: &[u8]) -> IoResult {
        tracelimit::warn_ratelimited!(offset, "invalid write to EQ ESB region");
        IoResult::Err(IoError::InvalidRegister)
    }
}

impl ChipsetDevice for XiveEqSource {
    fn supports_mmio(&mut self) -> Option<&mut dyn MmioIntercept> {
        Some(self)
    }
}

impl MmioIntercept for XiveEqSource {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        match self.esb_region.offset_of(addr) {
            Some(offset) => self.esb_read(offset, data),
            None => IoResult::Err(IoError::InvalidRegister),
        }
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> IoResult {
        match self.esb_region.offset_of(addr) {
            Some(offset) => self.esb_write(offset, data),
            None => IoResult::Err(IoError::InvalidRegister),
        }
    }
}
