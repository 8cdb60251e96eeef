// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The thread interrupt management context (TCTX).
//!
//! Each CPU thread owns a 64-byte register file organized as four 16-byte
//! rings, one per privilege level. The guest reaches the registers through
//! the thread interrupt management area (TIMA), four mirrored pages of the
//! same bank that differ only in which bytes they let that privilege level
//! see, plus a set of "special" offsets whose accesses have side effects
//! (acknowledge, priority updates).
//!
//! The interrupt state proper is three registers per ring: IPB, one bit per
//! pending priority; PIPR, the most favored pending priority; and CPPR, the
//! priority threshold the processor is willing to take. An exception is
//! outstanding (NSR.EO, output line high) exactly while `PIPR < CPPR`.

use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use ppcdefs::xive::cam_line;
use ppcdefs::xive::hw_cam_line;
use ppcdefs::xive::ipb_to_pipr;
use ppcdefs::xive::priority_to_ipb;
use ppcdefs::xive::Pir;
use ppcdefs::xive::TmQw0Word2;
use ppcdefs::xive::TmQw1Word2;
use ppcdefs::xive::TmQw2Word2;
use ppcdefs::xive::TmQw3Word2;
use ppcdefs::xive::TM_ACK_CNT;
use ppcdefs::xive::TM_AGE;
use ppcdefs::xive::TM_CPPR;
use ppcdefs::xive::TM_INC;
use ppcdefs::xive::TM_IPB;
use ppcdefs::xive::TM_LSMFB;
use ppcdefs::xive::TM_NSR;
use ppcdefs::xive::TM_OS_PAGE;
use ppcdefs::xive::TM_PIPR;
use ppcdefs::xive::TM_QW0_USER;
use ppcdefs::xive::TM_QW1_NSR_EO;
use ppcdefs::xive::TM_QW1_OS;
use ppcdefs::xive::TM_QW2_HV_POOL;
use ppcdefs::xive::TM_QW3_HV_PHYS;
use ppcdefs::xive::TM_RING_COUNT;
use ppcdefs::xive::TM_RING_SIZE;
use ppcdefs::xive::TM_SHIFT;
use ppcdefs::xive::TM_SPC_ACK_OS_REG;
use ppcdefs::xive::TM_SPC_SET_OS_PENDING;
use ppcdefs::xive::TM_WORD2;
use ppcdefs::xive::XIVE_PRIORITY_MAX;
use std::fmt;
use std::fmt::Display;
use vmcore::line_interrupt::LineInterrupt;

/// A ring of the thread interrupt management context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TmRing {
    /// QW0, the user ring.
    User,
    /// QW1, the OS ring.
    Os,
    /// QW2, the hypervisor pool ring.
    HvPool,
    /// QW3, the physical thread ring.
    HvPhys,
}

impl TmRing {
    /// Returns the byte offset of the ring within the context.
    pub fn base(self) -> usize {
        match self {
            TmRing::User => TM_QW0_USER,
            TmRing::Os => TM_QW1_OS,
            TmRing::HvPool => TM_QW2_HV_POOL,
            TmRing::HvPhys => TM_QW3_HV_PHYS,
        }
    }

    fn exception_mask(self) -> u8 {
        match self {
            TmRing::Os => TM_QW1_NSR_EO,
            _ => unreachable!("no exception support for ring {:?}", self),
        }
    }
}

// Per-byte accessibility of the context from each TIMA view:
//   0 - no access, 1 - write only, 2 - read only, 3 - read/write.
// The page with the lowest offset is the most privileged.
#[rustfmt::skip]
const TIMA_VIEW_HW: [u8; 64] = [
    /* QW0 user */ 3, 0, 0, 0,  0, 0, 0, 0,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW1 OS   */ 3, 3, 3, 3,  3, 3, 0, 3,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW2 pool */ 0, 0, 3, 3,  0, 0, 0, 0,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW3 phys */ 3, 3, 3, 3,  0, 3, 0, 3,  3, 0, 0, 3,  3, 3, 3, 0,
];

#[rustfmt::skip]
const TIMA_VIEW_HV: [u8; 64] = [
    /* QW0 user */ 3, 0, 0, 0,  0, 0, 0, 0,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW1 OS   */ 3, 3, 3, 3,  3, 3, 0, 3,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW2 pool */ 0, 0, 3, 3,  0, 0, 0, 0,  0, 3, 3, 3,  0, 0, 0, 0,
    /* QW3 phys */ 3, 3, 3, 3,  0, 3, 0, 3,  3, 0, 0, 3,  0, 0, 0, 0,
];

#[rustfmt::skip]
const TIMA_VIEW_OS: [u8; 64] = [
    /* QW0 user */ 3, 0, 0, 0,  0, 0, 0, 0,  3, 3, 3, 3,  0, 0, 0, 0,
    /* QW1 OS   */ 2, 3, 2, 2,  2, 2, 0, 2,  0, 0, 0, 0,  0, 0, 0, 0,
    /* QW2 pool */ 0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,
    /* QW3 phys */ 0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 3, 3, 0,
];

#[rustfmt::skip]
const TIMA_VIEW_USER: [u8; 64] = [
    /* QW0 user */ 3, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,
    /* QW1 OS   */ 0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,
    /* QW2 pool */ 0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,
    /* QW3 phys */ 0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,  0, 0, 0, 0,
];

const TIMA_VIEWS: [&[u8; 64]; 4] = [
    &TIMA_VIEW_HW,
    &TIMA_VIEW_HV,
    &TIMA_VIEW_OS,
    &TIMA_VIEW_USER,
];

/// Computes the per-byte access mask for an access at `offset`, aligned to
/// the most significant byte of the access as it appears on the bus.
fn tima_access_mask(offset: u64, len: usize, write: bool) -> u64 {
    let view = TIMA_VIEWS[((offset >> TM_SHIFT) & 0x3) as usize];
    let reg = (offset & 0x3f) as usize;
    let bit = if write { 0x1 } else { 0x2 };
    let mut mask = 0;
    for i in 0..len {
        if view.get(reg + i).is_some_and(|&b| b & bit != 0) {
            mask |= 0xffu64 << (8 * (len - i - 1));
        }
    }
    mask
}

/// The mapping of "special" TIMA operations by page, offset and access
/// size. An operation is also reachable from any more privileged (lower
/// numbered) page.
struct TimaOp {
    page: u8,
    op_offset: u64,
    len: usize,
    write: Option<fn(&mut XiveTctx, u64)>,
    read: Option<fn(&mut XiveTctx) -> u64>,
}

const TIMA_OPERATIONS: &[TimaOp] = &[
    // Below 2K: raw values and special operations without side effects.
    TimaOp {
        page: TM_OS_PAGE,
        op_offset: (TM_QW1_OS + TM_CPPR) as u64,
        len: 1,
        write: Some(|tctx, value| tctx.set_cppr(TmRing::Os, value as u8)),
        read: None,
    },
    // Above 2K: special operations with side effects.
    TimaOp {
        page: TM_OS_PAGE,
        op_offset: TM_SPC_ACK_OS_REG,
        len: 2,
        write: None,
        read: Some(|tctx| tctx.accept(TmRing::Os)),
    },
    TimaOp {
        page: TM_OS_PAGE,
        op_offset: TM_SPC_SET_OS_PENDING,
        len: 1,
        write: Some(|tctx, value| {
            tctx.ipb_update(TmRing::Os, value as u8);
            tctx.notify(TmRing::Os);
        }),
        read: None,
    },
];

fn find_tima_op(offset: u64, len: usize, write: bool) -> Option<&'static TimaOp> {
    let page = ((offset >> TM_SHIFT) & 0x3) as u8;
    let op_offset = offset & 0xfff;
    TIMA_OPERATIONS.iter().find(|op| {
        op.page >= page
            && op.op_offset == op_offset
            && op.len == len
            && if write {
                op.write.is_some()
            } else {
                op.read.is_some()
            }
    })
}

/// Saved state for a [`XiveTctx`].
#[derive(Debug, Clone)]
pub struct XiveTctxSavedState {
    /// The raw context registers.
    pub regs: [u8; TM_RING_COUNT * TM_RING_SIZE],
}

/// The per-thread interrupt management context.
pub struct XiveTctx {
    // Static configuration
    vcpu_id: u32,
    pir: Pir,
    /// The OS CAM line pushed at reset, when not running in hypervisor
    /// mode.
    os_cam: Option<u32>,

    // Runtime glue
    output: LineInterrupt,

    // Volatile state
    regs: [u8; TM_RING_COUNT * TM_RING_SIZE],
}

impl XiveTctx {
    /// Creates the thread context for `vcpu_id`, wired to `output`.
    ///
    /// In guest (non-hypervisor) mode the vCPU id is hardwired as the VP
    /// identifier and pushed into the OS CAM at reset.
    pub fn new(vcpu_id: u32, chip_id: u8, pir: Pir, hypervisor: bool, output: LineInterrupt) -> Self {
        let mut tctx = Self {
            vcpu_id,
            pir,
            os_cam: (!hypervisor).then(|| cam_line(chip_id, vcpu_id)),
            output,
            regs: [0; TM_RING_COUNT * TM_RING_SIZE],
        };
        tctx.reset();
        tctx
    }

    /// Resets the context registers.
    pub fn reset(&mut self) {
        self.regs = [0; TM_RING_COUNT * TM_RING_SIZE];

        self.regs[TM_QW1_OS + TM_LSMFB] = 0xff;
        self.regs[TM_QW1_OS + TM_ACK_CNT] = 0xff;
        self.regs[TM_QW1_OS + TM_AGE] = 0xff;

        // Seed PIPR from the (empty) IPB so the first CPPR update does not
        // see a phantom pending interrupt.
        self.regs[TM_QW1_OS + TM_PIPR] = ipb_to_pipr(self.regs[TM_QW1_OS + TM_IPB]);

        // The OS CAM is pushed by the hypervisor when the VP is scheduled
        // on a hardware thread.
        if let Some(os_cam) = self.os_cam {
            let w2 = TmQw1Word2::new().with_vo(true).with_os_cam(os_cam);
            self.regs[TM_QW1_OS + TM_WORD2..TM_QW1_OS + TM_WORD2 + 4]
                .copy_from_slice(&w2.into_bits().to_be_bytes());
        }
    }

    /// Returns the context state for saving.
    pub fn save(&self) -> XiveTctxSavedState {
        XiveTctxSavedState { regs: self.regs }
    }

    /// Restores previously saved state.
    pub fn restore(&mut self, state: XiveTctxSavedState) {
        self.regs = state.regs;
    }

    /// Returns a register byte of `ring`.
    pub fn ring_reg(&self, ring: TmRing, reg: usize) -> u8 {
        assert!(reg < TM_RING_SIZE);
        self.regs[ring.base() + reg]
    }

    /// Returns the output line of this thread.
    pub fn output(&self) -> &LineInterrupt {
        &self.output
    }

    fn ring_word2(&self, ring: TmRing) -> u32 {
        let base = ring.base() + TM_WORD2;
        u32::from_be_bytes([
            self.regs[base],
            self.regs[base + 1],
            self.regs[base + 2],
            self.regs[base + 3],
        ])
    }

    /// Records a pending interrupt of `priority` in the ring's IPB and
    /// recomputes PIPR.
    pub fn ipb_update(&mut self, ring: TmRing, priority: u8) {
        let base = ring.base();
        self.regs[base + TM_IPB] |= priority_to_ipb(priority);
        self.regs[base + TM_PIPR] = ipb_to_pipr(self.regs[base + TM_IPB]);
    }

    /// Raises the ring's exception and the output line if the pending
    /// priority is more favored than CPPR.
    pub fn notify(&mut self, ring: TmRing) {
        let base = ring.base();
        if self.regs[base + TM_PIPR] < self.regs[base + TM_CPPR] {
            self.regs[base + TM_NSR] |= ring.exception_mask();
            self.output.set_level(true);
        }
    }

    /// Sets the ring's CPPR. Values beyond the architected maximum priority
    /// mean "accept anything" (0xff).
    pub fn set_cppr(&mut self, ring: TmRing, cppr: u8) {
        let cppr = if cppr > XIVE_PRIORITY_MAX { 0xff } else { cppr };
        self.regs[ring.base() + TM_CPPR] = cppr;

        // CPPR has changed; a pending exception may now qualify.
        self.notify(ring);
    }

    /// Accepts the ring's pending exception, lowering the output line.
    ///
    /// Returns the acknowledge value: the previous NSR in the high byte and
    /// the updated CPPR in the low byte.
    pub fn accept(&mut self, ring: TmRing) -> u64 {
        let base = ring.base();
        let mask = ring.exception_mask();
        let nsr = self.regs[base + TM_NSR];

        self.output.set_level(false);

        if nsr & mask != 0 {
            let cppr = self.regs[base + TM_PIPR];
            self.regs[base + TM_CPPR] = cppr;

            // Reset the pending buffer bit.
            self.regs[base + TM_IPB] &= !priority_to_ipb(cppr);
            self.regs[base + TM_PIPR] = ipb_to_pipr(self.regs[base + TM_IPB]);

            // Drop the exception bit.
            self.regs[base + TM_NSR] &= !mask;
        }

        ((nsr as u64) << 8) | self.regs[base + TM_CPPR] as u64
    }

    fn hw_cam(&self, block_group: bool) -> u32 {
        hw_cam_line(block_group, self.pir.chip_id(), self.pir.thread_id())
    }

    /// Returns whether `ring`'s CAM line matches the given VP.
    fn ring_match(&self, ring: TmRing, vp_blk: u8, vp_idx: u32, logic_serv: u32) -> bool {
        let cam = cam_line(vp_blk, vp_idx);
        // Block-group CAM compares are not supported.
        let block_group = false;

        match ring {
            TmRing::HvPhys => {
                let w2 = TmQw3Word2::from(self.ring_word2(TmRing::HvPhys));
                w2.vt()
                    && self.hw_cam(block_group)
                        == hw_cam_line(block_group, vp_blk, vp_idx as u8)
            }
            TmRing::HvPool => {
                let w2 = TmQw2Word2::from(self.ring_word2(TmRing::HvPool));
                w2.vp() && cam == w2.pool_cam()
            }
            TmRing::Os => {
                let w2 = TmQw1Word2::from(self.ring_word2(TmRing::Os));
                w2.vo() && cam == w2.os_cam()
            }
            TmRing::User => {
                let os_w2 = TmQw1Word2::from(self.ring_word2(TmRing::Os));
                let user_w2 = TmQw0Word2::from(self.ring_word2(TmRing::User));
                os_w2.vo()
                    && cam == os_w2.os_cam()
                    && user_w2.vu()
                    && logic_serv == user_w2.logic_serv()
            }
        }
    }

    /// Returns the ring on which this thread is dispatched for the given
    /// VP, if any.
    ///
    /// Format 0 is a specific VP notification and tries the rings in
    /// decreasing privilege order; format 1 is a user-level event-based
    /// branch notification and only matches the user ring.
    pub fn presenter_match(
        &self,
        format1: bool,
        vp_blk: u8,
        vp_idx: u32,
        logic_serv: u32,
    ) -> Option<TmRing> {
        if format1 {
            self.ring_match(TmRing::User, vp_blk, vp_idx, logic_serv)
                .then_some(TmRing::User)
        } else {
            [TmRing::HvPhys, TmRing::HvPool, TmRing::Os]
                .into_iter()
                .find(|&ring| self.ring_match(ring, vp_blk, vp_idx, 0))
        }
    }

    fn tima_raw_read(&self, offset: u64, len: usize) -> Result<u64, IoError> {
        let ring_offset = (offset & 0x30) as usize;
        let reg = (offset & 0x3f) as usize;
        let mask = tima_access_mask(offset, len, false);

        // Only 4- and 8-byte loads are allowed, and the user ring is
        // excluded.
        if len < 4 || mask == 0 || ring_offset == TM_QW0_USER {
            tracelimit::warn_ratelimited!(offset, len, "invalid read access at TIMA");
            return Err(IoError::InvalidRegister);
        }

        let mut value = 0;
        for i in 0..len {
            value |=
                (self.regs.get(reg + i).copied().unwrap_or(0) as u64) << (8 * (len - i - 1));
        }

        // Filter out the bytes this view may not see.
        Ok(value & mask)
    }

    fn tima_raw_write(&mut self, offset: u64, value: u64, len: usize) -> IoResult {
        let ring_offset = (offset & 0x30) as usize;
        let reg = (offset & 0x3f) as usize;
        let mask = tima_access_mask(offset, len, true);

        // Only 4- and 8-byte stores are allowed, and the user ring is
        // excluded.
        if len < 4 || mask == 0 || ring_offset == TM_QW0_USER {
            tracelimit::warn_ratelimited!(offset, len, "invalid write access at TIMA");
            return IoResult::Err(IoError::InvalidRegister);
        }

        for i in 0..len {
            let byte_mask = (mask >> (8 * (len - i - 1))) as u8;
            if byte_mask != 0 {
                self.regs[reg + i] = ((value >> (8 * (len - i - 1))) as u8) & byte_mask;
            }
        }
        IoResult::Ok
    }

    /// Reads from the TIMA at `offset` (which includes the view page in
    /// bits 13:12). Values are returned big-endian.
    pub fn tima_read(&mut self, offset: u64, data: &mut [u8]) -> IoResult {
        let len = data.len();
        if !matches!(len, 1 | 2 | 4 | 8) {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        // The context is mapped twice within each page: accesses above 2K
        // perform specific state changes, accesses below read the register
        // values (with a handful of side-effect-free special operations).
        let value = if offset & 0x800 != 0 {
            let Some(op) = find_tima_op(offset, len, false) else {
                tracelimit::warn_ratelimited!(offset, len, "invalid read access to TIMA");
                return IoResult::Err(IoError::InvalidRegister);
            };
            (op.read.expect("filtered by find_tima_op"))(self)
        } else if let Some(op) = find_tima_op(offset, len, false) {
            (op.read.expect("filtered by find_tima_op"))(self)
        } else {
            match self.tima_raw_read(offset, len) {
                Ok(value) => value,
                Err(err) => return IoResult::Err(err),
            }
        };

        data.copy_from_slice(&value.to_be_bytes()[8 - len..]);
        IoResult::Ok
    }

    /// Writes to the TIMA at `offset` (which includes the view page in
    /// bits 13:12). Values are interpreted big-endian.
    pub fn tima_write(&mut self, offset: u64, data: &[u8]) -> IoResult {
        let len = data.len();
        if !matches!(len, 1 | 2 | 4 | 8) {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        let mut value = 0u64;
        for &b in data {
            value = value << 8 | b as u64;
        }

        if offset & 0x800 != 0 {
            let Some(op) = find_tima_op(offset, len, true) else {
                tracelimit::warn_ratelimited!(offset, len, "invalid write access at TIMA");
                return IoResult::Err(IoError::InvalidRegister);
            };
            (op.write.expect("filtered by find_tima_op"))(self, value);
            return IoResult::Ok;
        }

        if let Some(op) = find_tima_op(offset, len, true) {
            (op.write.expect("filtered by find_tima_op"))(self, value);
            return IoResult::Ok;
        }

        self.tima_raw_write(offset, value, len)
    }
}

impl Display for XiveTctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CPU[{:04x}]:   QW   NSR CPPR IPB LSMFB ACK# INC AGE PIPR  W2",
            self.vcpu_id
        )?;
        for (ring, name) in [
            (TmRing::HvPhys, "HW"),
            (TmRing::HvPool, "HV"),
            (TmRing::Os, "OS"),
            (TmRing::User, "USER"),
        ] {
            let base = ring.base();
            writeln!(
                f,
                "CPU[{:04x}]: {:>4}    {:02x}   {:02x}  {:02x}    {:02x}   {:02x}  {:02x}  {:02x}   {:02x}  {:08x}",
                self.vcpu_id,
                name,
                self.regs[base + TM_NSR],
                self.regs[base + TM_CPPR],
                self.regs[base + TM_IPB],
                self.regs[base + TM_LSMFB],
                self.regs[base + TM_ACK_CNT],
                self.regs[base + TM_INC],
                self.regs[base + TM_AGE],
                self.regs[base + TM_PIPR],
                self.ring_word2(ring),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppcdefs::xive::TM_HW_PAGE;
    use ppcdefs::xive::TM_USER_PAGE;
    use std::sync::Arc;
    use vmcore::line_interrupt::test_helpers::TestLineInterruptTarget;

    const HW_PAGE: u64 = (TM_HW_PAGE as u64) << TM_SHIFT;
    const OS_PAGE: u64 = (TM_OS_PAGE as u64) << TM_SHIFT;
    const USER_PAGE: u64 = (TM_USER_PAGE as u64) << TM_SHIFT;

    fn create_tctx(vcpu_id: u32) -> (Arc<TestLineInterruptTarget>, XiveTctx) {
        let intcon = TestLineInterruptTarget::new_arc();
        let output = LineInterrupt::new_with_target("tctx", intcon.clone(), 0);
        let pir = Pir::new()
            .with_chip_id(0)
            .with_thread_id(vcpu_id as u8);
        let tctx = XiveTctx::new(vcpu_id, 0, pir, false, output);
        (intcon, tctx)
    }

    fn tima_load(tctx: &mut XiveTctx, offset: u64, len: usize) -> u64 {
        let mut data = [0; 8];
        tctx.tima_read(offset, &mut data[..len]).unwrap();
        let mut value = 0;
        for &b in &data[..len] {
            value = value << 8 | b as u64;
        }
        value
    }

    fn tima_store(tctx: &mut XiveTctx, offset: u64, data: &[u8]) {
        tctx.tima_write(offset, data).unwrap();
    }

    #[test]
    fn reset_defaults() {
        let (_intcon, tctx) = create_tctx(5);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_LSMFB), 0xff);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_ACK_CNT), 0xff);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_AGE), 0xff);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_PIPR), 0xff);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_CPPR), 0);

        // The OS CAM was pushed for guest mode.
        let w2 = TmQw1Word2::from(tctx.ring_word2(TmRing::Os));
        assert!(w2.vo());
        assert_eq!(w2.os_cam(), cam_line(0, 5));
    }

    #[test]
    fn hypervisor_mode_pushes_no_cam() {
        let output = LineInterrupt::detached();
        let tctx = XiveTctx::new(3, 0, Pir::new(), true, output);
        assert_eq!(tctx.ring_word2(TmRing::Os), 0);
    }

    #[test]
    fn cppr_gates_notification() {
        let (intcon, mut tctx) = create_tctx(5);

        // Priority 1 pending with CPPR 0: 1 is not more favored than 0, so
        // no exception is raised and the ack reads back a zero NSR.
        tctx.ipb_update(TmRing::Os, 1);
        tctx.notify(TmRing::Os);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_IPB), 0x40);
        assert!(!intcon.is_high(0));
        assert_eq!(tima_load(&mut tctx, OS_PAGE + TM_SPC_ACK_OS_REG, 2), 0);

        // Raising CPPR to 2 lets the pending priority through.
        tima_store(&mut tctx, OS_PAGE + (TM_QW1_OS + TM_CPPR) as u64, &[2]);
        assert!(intcon.is_high(0));
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_NSR), TM_QW1_NSR_EO);

        // The ack returns the previous NSR and the accepted priority, and
        // clears the exception.
        let ack = tima_load(&mut tctx, OS_PAGE + TM_SPC_ACK_OS_REG, 2);
        assert_eq!(ack, 0x8001);
        assert!(!intcon.is_high(0));
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_IPB), 0);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_PIPR), 0xff);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_NSR), 0);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_CPPR), 1);
    }

    #[test]
    fn set_os_pending_notifies() {
        let (intcon, mut tctx) = create_tctx(5);
        tima_store(&mut tctx, OS_PAGE + (TM_QW1_OS + TM_CPPR) as u64, &[0xff]);

        tima_store(&mut tctx, OS_PAGE + TM_SPC_SET_OS_PENDING, &[3]);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_IPB), 0x10);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_PIPR), 3);
        assert!(intcon.is_high(0));
    }

    #[test]
    fn cppr_clamps_beyond_max_priority() {
        let (_intcon, mut tctx) = create_tctx(5);
        tctx.set_cppr(TmRing::Os, 0x20);
        assert_eq!(tctx.ring_reg(TmRing::Os, TM_CPPR), 0xff);
    }

    #[test]
    fn raw_access_follows_view_masks() {
        let (_intcon, mut tctx) = create_tctx(5);
        tctx.set_cppr(TmRing::Os, 2);
        tctx.ipb_update(TmRing::Os, 4);

        // NSR/CPPR/IPB/LSMFB are all readable from the OS view.
        assert_eq!(
            tima_load(&mut tctx, OS_PAGE + TM_QW1_OS as u64, 4),
            0x0002_08ff
        );

        // Only the CPPR byte is writable from the OS view; the raw store
        // has no notification side effects.
        tima_store(
            &mut tctx,
            OS_PAGE + TM_QW1_OS as u64,
            &[0xaa, 0x05, 0xaa, 0xaa],
        );
        assert_eq!(
            tima_load(&mut tctx, OS_PAGE + TM_QW1_OS as u64, 4),
            0x0005_08ff
        );

        // WORD2 is invisible from the OS view but readable from the HW
        // view.
        let mut data = [0; 4];
        assert!(matches!(
            tctx.tima_read(OS_PAGE + (TM_QW1_OS + TM_WORD2) as u64, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));
        assert_eq!(
            tima_load(&mut tctx, HW_PAGE + (TM_QW1_OS + TM_WORD2) as u64, 4),
            TmQw1Word2::new().with_vo(true).with_os_cam(5).into_bits() as u64
        );
    }

    #[test]
    fn raw_access_rules() {
        let (_intcon, mut tctx) = create_tctx(5);

        // Short raw accesses are invalid.
        let mut data = [0; 2];
        assert!(matches!(
            tctx.tima_read(OS_PAGE + TM_QW1_OS as u64, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));
        assert!(matches!(
            tctx.tima_write(HW_PAGE + TM_QW1_OS as u64, &[0; 2]),
            IoResult::Err(IoError::InvalidRegister)
        ));

        // The user ring is never accessed raw, even from the HW view.
        let mut data = [0; 4];
        assert!(matches!(
            tctx.tima_read(HW_PAGE + TM_QW0_USER as u64, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));

        // Unknown access sizes are rejected outright.
        let mut data = [0; 3];
        assert!(matches!(
            tctx.tima_read(OS_PAGE, &mut data),
            IoResult::Err(IoError::InvalidAccessSize)
        ));
    }

    #[test]
    fn special_ops_respect_privilege() {
        let (_intcon, mut tctx) = create_tctx(5);
        tctx.ipb_update(TmRing::Os, 0);
        tctx.set_cppr(TmRing::Os, 0xff);

        // An OS-page op is reachable from the more privileged HW page.
        let ack = tima_load(&mut tctx, HW_PAGE + TM_SPC_ACK_OS_REG, 2);
        assert_eq!(ack, 0x8000);

        // But not from the less privileged user page.
        let mut data = [0; 2];
        assert!(matches!(
            tctx.tima_read(USER_PAGE + TM_SPC_ACK_OS_REG, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));

        // Nor with the wrong size.
        let mut data = [0; 4];
        assert!(matches!(
            tctx.tima_read(OS_PAGE + TM_SPC_ACK_OS_REG, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));
    }

    #[test]
    fn presenter_matching() {
        let (_intcon, mut tctx) = create_tctx(5);

        // The OS ring matches the VP pushed at reset, for format 0 only.
        assert_eq!(tctx.presenter_match(false, 0, 5, 0), Some(TmRing::Os));
        assert_eq!(tctx.presenter_match(false, 0, 6, 0), None);
        assert_eq!(tctx.presenter_match(false, 1, 5, 0), None);
        assert_eq!(tctx.presenter_match(true, 0, 5, 0), None);

        // Validating the user ring makes format 1 match on VO + VU +
        // logical server. The user WORD2 is not reachable through raw TIMA
        // stores, so seed it through restore.
        let w2 = TmQw0Word2::new().with_vu(true).with_logic_serv(0x42);
        let mut state = tctx.save();
        state.regs[TM_QW0_USER + TM_WORD2..TM_QW0_USER + TM_WORD2 + 4]
            .copy_from_slice(&w2.into_bits().to_be_bytes());
        tctx.restore(state);
        assert_eq!(tctx.presenter_match(true, 0, 5, 0x42), Some(TmRing::User));
        assert_eq!(tctx.presenter_match(true, 0, 5, 0x41), None);

        // A valid physical-thread ring wins over the OS ring.
        tima_store(
            &mut tctx,
            HW_PAGE + (TM_QW3_HV_PHYS + TM_WORD2) as u64,
            &TmQw3Word2::new().with_vt(true).into_bits().to_be_bytes(),
        );
        assert_eq!(tctx.presenter_match(false, 0, 5, 0), Some(TmRing::HvPhys));
        // The hardwired CAM compares the chip and thread id from the PIR.
        assert_eq!(tctx.presenter_match(false, 1, 5, 0), None);
    }

    #[test]
    fn save_restore_roundtrip() {
        let (_intcon, mut tctx) = create_tctx(5);
        tctx.ipb_update(TmRing::Os, 3);
        let saved = tctx.save();

        let (_intcon2, mut other) = create_tctx(5);
        other.restore(saved);
        assert_eq!(other.ring_reg(TmRing::Os, TM_IPB), 0x10);
        assert_eq!(other.ring_reg(TmRing::Os, TM_PIPR), 3);
    }

    #[test]
    fn display_dumps_all_rings() {
        let (_intcon, tctx) = create_tctx(5);
        let dump = tctx.to_string();
        assert!(dump.contains("CPU[0005]:   QW"));
        assert!(dump.contains("OS"));
        assert!(dump.contains("USER"));
    }
}
