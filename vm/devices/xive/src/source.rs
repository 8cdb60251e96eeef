// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The XIVE event source (IVSE).
//!
//! An event source owns one Event State Buffer byte per interrupt plus a
//! bitmap marking which interrupts are level-sensitive (LSI) rather than
//! message-signalled (MSI). The source exposes an MMIO region of one page
//! (or a trigger/management page pair) per interrupt through which the
//! guest triggers, EOIs and manipulates the ESBs, and forwards notification
//! events to the fabric for routing.

use crate::esb;
use crate::XiveNotifier;
use bitfield_struct::bitfield;
use chipset_device::interrupt::LineInterruptTarget;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::ControlMmioIntercept;
use chipset_device::mmio::MmioIntercept;
use chipset_device::mmio::RegisterMmioIntercept;
use chipset_device::ChipsetDevice;
use ppcdefs::xive::EsbState;
use ppcdefs::xive::XIVE_ESB_4K;
use ppcdefs::xive::XIVE_ESB_4K_2PAGE;
use ppcdefs::xive::XIVE_ESB_64K;
use ppcdefs::xive::XIVE_ESB_64K_2PAGE;
use std::ops::RangeInclusive;
use std::sync::Weak;
use thiserror::Error;

/// The LSI assertion flag, kept in the status byte alongside the 2-bit ESB
/// state so that the raw line level survives P/Q coalescing.
const ESB_STATUS_ASSERTED: u8 = 0x4;

/// Event source configuration flags.
#[bitfield(u64)]
pub struct SourceFlags {
    /// The source supports EOI by store (offset 0x400) in addition to EOI
    /// by load.
    pub store_eoi: bool,
    #[bits(63)]
    _reserved: u64,
}

/// An error constructing a [`XiveSource`].
#[derive(Debug, Error)]
pub enum XiveSourceError {
    /// No interrupts were requested.
    #[error("number of interrupts needs to be greater than 0")]
    NoIrqs,
    /// The ESB page shift is not one of the architected settings.
    #[error("invalid ESB shift setting: {0}")]
    InvalidEsbShift(u8),
}

/// An error restoring a [`XiveSource`] from saved state.
#[derive(Debug, Error)]
pub enum XiveSourceRestoreError {
    /// The saved state describes a different number of interrupts.
    #[error("saved state interrupt count mismatch")]
    MismatchedIrqCount,
}

/// Saved state for a [`XiveSource`].
#[derive(Debug, Clone)]
pub struct XiveSourceSavedState {
    /// Per-interrupt ESB status bytes.
    pub status: Vec<u8>,
    /// The LSI bitmap.
    pub lsi_map: Vec<u64>,
}

/// A XIVE event source.
pub struct XiveSource {
    // Static configuration
    nr_irqs: u32,
    esb_shift: u8,
    esb_flags: SourceFlags,
    valid_lines: [RangeInclusive<u32>; 1],

    // Runtime glue
    notifier: Weak<dyn XiveNotifier>,
    esb_region: Box<dyn ControlMmioIntercept>,

    // Volatile state
    status: Vec<u8>,
    lsi_map: Vec<u64>,
}

impl XiveSource {
    /// The default ESB setting: two 64 KiB pages per interrupt, EOI by load
    /// only.
    pub const DEFAULT_ESB_SHIFT: u8 = XIVE_ESB_64K_2PAGE;

    /// Creates a new event source of `nr_irqs` interrupts, forwarding
    /// notifications to `notifier`.
    ///
    /// The ESB MMIO region is registered but left unmapped; the machine
    /// places it with [`map_esb`](Self::map_esb).
    pub fn new(
        nr_irqs: u32,
        esb_shift: u8,
        esb_flags: SourceFlags,
        notifier: Weak<dyn XiveNotifier>,
        register_mmio: &mut dyn RegisterMmioIntercept,
    ) -> Result<Self, XiveSourceError> {
        if nr_irqs == 0 {
            return Err(XiveSourceError::NoIrqs);
        }
        if !matches!(
            esb_shift,
            XIVE_ESB_4K | XIVE_ESB_4K_2PAGE | XIVE_ESB_64K | XIVE_ESB_64K_2PAGE
        ) {
            return Err(XiveSourceError::InvalidEsbShift(esb_shift));
        }

        let esb_region =
            register_mmio.new_io_region("xive-esb", (nr_irqs as u64) << esb_shift);

        Ok(Self {
            nr_irqs,
            esb_shift,
            esb_flags,
            valid_lines: [0..=nr_irqs - 1],
            notifier,
            esb_region,
            // PQs start as 0b01, which corresponds to "ints off".
            status: vec![EsbState::OFF.0; nr_irqs as usize],
            lsi_map: vec![0; nr_irqs.div_ceil(64) as usize],
        })
    }

    /// Returns the number of interrupts of this source.
    pub fn nr_irqs(&self) -> u32 {
        self.nr_irqs
    }

    /// Returns the size of the ESB MMIO region in bytes.
    pub fn esb_len(&self) -> u64 {
        (self.nr_irqs as u64) << self.esb_shift
    }

    /// Maps the ESB MMIO region at `base`.
    pub fn map_esb(&mut self, base: u64) {
        self.esb_region.map(base);
    }

    /// Unmaps the ESB MMIO region.
    pub fn unmap_esb(&mut self) {
        self.esb_region.unmap();
    }

    /// Marks `srcno` as level-sensitive. Interrupts are message-signalled
    /// (edge) by default.
    pub fn set_lsi(&mut self, srcno: u32) {
        assert!(srcno < self.nr_irqs);
        self.lsi_map[srcno as usize / 64] |= 1 << (srcno % 64);
    }

    /// Returns whether `srcno` is level-sensitive.
    pub fn irq_is_lsi(&self, srcno: u32) -> bool {
        assert!(srcno < self.nr_irqs);
        self.lsi_map[srcno as usize / 64] & (1 << (srcno % 64)) != 0
    }

    /// Returns the 2-bit ESB state of `srcno`.
    pub fn esb_get(&self, srcno: u32) -> u8 {
        assert!(srcno < self.nr_irqs);
        self.status[srcno as usize] & 0x3
    }

    /// Overwrites the 2-bit ESB state of `srcno`, returning the previous
    /// state.
    pub fn esb_set(&mut self, srcno: u32, pq: u8) -> u8 {
        assert!(srcno < self.nr_irqs);
        let (new, old) = esb::set(self.status[srcno as usize], pq);
        self.status[srcno as usize] = new;
        old
    }

    /// Resets the source. ESBs return to the off state; the LSI bitmap is
    /// preserved.
    pub fn reset(&mut self) {
        self.status.fill(EsbState::OFF.0);
    }

    /// Returns the source state for saving.
    pub fn save(&self) -> XiveSourceSavedState {
        XiveSourceSavedState {
            status: self.status.clone(),
            lsi_map: self.lsi_map.clone(),
        }
    }

    /// Restores previously saved state.
    pub fn restore(&mut self, state: XiveSourceSavedState) -> Result<(), XiveSourceRestoreError> {
        let XiveSourceSavedState { status, lsi_map } = state;
        if status.len() != self.status.len() || lsi_map.len() != self.lsi_map.len() {
            return Err(XiveSourceRestoreError::MismatchedIrqCount);
        }
        self.status = status;
        self.lsi_map = lsi_map;
        Ok(())
    }

    /// Returns the byte offset of the trigger page of `srcno` within the
    /// ESB region.
    pub fn esb_page_offset(&self, srcno: u32) -> u64 {
        assert!(srcno < self.nr_irqs);
        (srcno as u64) << self.esb_shift
    }

    /// Returns the byte offset of the management page of `srcno` within the
    /// ESB region. This is the trigger page when the source has a single
    /// page per interrupt.
    pub fn esb_mgmt_offset(&self, srcno: u32) -> u64 {
        let offset = self.esb_page_offset(srcno);
        if self.has_2page() {
            offset | 1 << (self.esb_shift - 1)
        } else {
            offset
        }
    }

    fn has_2page(&self) -> bool {
        matches!(self.esb_shift, XIVE_ESB_4K_2PAGE | XIVE_ESB_64K_2PAGE)
    }

    /// In a two-page setting, the even page of each pair only triggers; the
    /// odd page carries the EOI and management operations.
    fn is_trigger_page(&self, offset: u64) -> bool {
        self.has_2page() && (offset >> (self.esb_shift - 1)) & 1 == 0
    }

    /// Returns whether the event notification should be forwarded.
    fn lsi_trigger(&mut self, srcno: u32) -> bool {
        if EsbState(self.esb_get(srcno)) == EsbState::RESET {
            self.esb_set(srcno, EsbState::PENDING.0);
            true
        } else {
            false
        }
    }

    /// Returns whether the event notification should be forwarded.
    fn esb_trigger(&mut self, srcno: u32) -> bool {
        assert!(srcno < self.nr_irqs);
        let (new, notify) = esb::trigger(self.status[srcno as usize]);
        self.status[srcno as usize] = new;

        if self.irq_is_lsi(srcno) && EsbState(new & 0x3) == EsbState::QUEUED {
            tracelimit::warn_ratelimited!(srcno, "queued an event on LSI IRQ");
        }

        notify
    }

    /// Returns whether the event notification should be forwarded.
    fn esb_eoi(&mut self, srcno: u32) -> bool {
        assert!(srcno < self.nr_irqs);
        let (new, mut notify) = esb::eoi(self.status[srcno as usize]);
        self.status[srcno as usize] = new;

        // LSI sources do not set the Q bit, but they can still be asserted,
        // in which case a new event notification must be forwarded.
        if self.irq_is_lsi(srcno) && self.status[srcno as usize] & ESB_STATUS_ASSERTED != 0 {
            notify = self.lsi_trigger(srcno);
        }

        notify
    }

    /// Forwards the source event notification to the fabric.
    fn notify(&self, srcno: u32) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.notify(srcno);
        }
    }

    /// Reads from the ESB MMIO region. Loads on a management (or single)
    /// page EOI, query or update the interrupt's ESB; loads on a trigger
    /// page are invalid.
    pub fn esb_read(&mut self, offset: u64, data: &mut [u8]) -> IoResult {
        if data.len() != 8 {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        let srcno = (offset >> self.esb_shift) as u32;
        let op = offset & 0xfff;

        if self.is_trigger_page(offset) {
            tracelimit::warn_ratelimited!(srcno, offset, "invalid load on trigger page");
            return IoResult::Err(IoError::InvalidRegister);
        }

        let value = match op {
            0x000..=0x7ff => {
                let notify = self.esb_eoi(srcno);
                if notify {
                    self.notify(srcno);
                }
                notify as u64
            }
            0x800..=0xbff => self.esb_get(srcno) as u64,
            0xc00..=0xfff => self.esb_set(srcno, ((op >> 8) & 0x3) as u8) as u64,
            _ => unreachable!(),
        };

        data.copy_from_slice(&value.to_be_bytes());
        IoResult::Ok
    }

    /// Writes to the ESB MMIO region. Any store on a trigger page triggers;
    /// stores on a management (or single) page trigger, EOI or update the
    /// interrupt's ESB depending on the offset.
    pub fn esb_write(&mut self, offset: u64, data: &[u8]) -> IoResult {
        if data.len() != 8 {
            return IoResult::Err(IoError::InvalidAccessSize);
        }

        let srcno = (offset >> self.esb_shift) as u32;
        let op = offset & 0xfff;

        let notify = if self.is_trigger_page(offset) {
            self.esb_trigger(srcno)
        } else {
            match op {
                0x000..=0x3ff => self.esb_trigger(srcno),
                0x400..=0x7ff => {
                    if !self.esb_flags.store_eoi() {
                        tracelimit::warn_ratelimited!(srcno, "invalid store EOI");
                        return IoResult::Ok;
                    }
                    self.esb_eoi(srcno)
                }
                0xc00..=0xfff => {
                    self.esb_set(srcno, ((op >> 8) & 0x3) as u8);
                    false
                }
                _ => return IoResult::Err(IoError::InvalidRegister),
            }
        };

        if notify {
            self.notify(srcno);
        }
        IoResult::Ok
    }
}

impl ChipsetDevice for XiveSource {
    fn supports_mmio(&mut self) -> Option<&mut dyn MmioIntercept> {
        Some(self)
    }

    fn supports_line_interrupt_target(&mut self) -> Option<&mut dyn LineInterruptTarget> {
        Some(self)
    }
}

impl MmioIntercept for XiveSource {
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

impl LineInterruptTarget for XiveSource {
    fn set_irq(&mut self, srcno: u32, high: bool) {
        let notify = if self.irq_is_lsi(srcno) {
            if high {
                self.status[srcno as usize] |= ESB_STATUS_ASSERTED;
                self.lsi_trigger(srcno)
            } else {
                self.status[srcno as usize] &= !ESB_STATUS_ASSERTED;
                false
            }
        } else if high {
            self.esb_trigger(srcno)
        } else {
            false
        };

        if notify {
            self.notify(srcno);
        }
    }

    fn valid_lines(&self) -> &[RangeInclusive<u32>] {
        &self.valid_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestFabric;
    use crate::test_helpers::TestMmioRegistration;
    use chipset_device::mmio::ExternallyManagedMmioIntercepts;
    use ppcdefs::xive::ESB_GET;
    use ppcdefs::xive::ESB_LOAD_EOI;
    use ppcdefs::xive::ESB_SET_PQ_00;
    use ppcdefs::xive::ESB_SET_PQ_11;
    use ppcdefs::xive::ESB_STORE_EOI;
    use std::sync::Arc;

    fn create_source(esb_shift: u8, esb_flags: SourceFlags) -> (Arc<TestFabric>, XiveSource) {
        let fabric = Arc::new(TestFabric::default());
        let source = XiveSource::new(
            16,
            esb_shift,
            esb_flags,
            Arc::downgrade(&(fabric.clone() as Arc<dyn XiveNotifier>)),
            &mut ExternallyManagedMmioIntercepts,
        )
        .unwrap();
        (fabric, source)
    }

    fn esb_load(source: &mut XiveSource, offset: u64) -> u64 {
        let mut data = [0; 8];
        source.esb_read(offset, &mut data).unwrap();
        u64::from_be_bytes(data)
    }

    fn esb_store(source: &mut XiveSource, offset: u64) {
        source.esb_write(offset, &[0; 8]).unwrap();
    }

    #[test]
    fn construction_validation() {
        let fabric = Arc::new(TestFabric::default());
        assert!(matches!(
            XiveSource::new(
                0,
                XIVE_ESB_64K,
                SourceFlags::new(),
                Arc::downgrade(&(fabric.clone() as Arc<dyn XiveNotifier>)),
                &mut ExternallyManagedMmioIntercepts,
            ),
            Err(XiveSourceError::NoIrqs)
        ));
        assert!(matches!(
            XiveSource::new(
                16,
                15,
                SourceFlags::new(),
                Arc::downgrade(&(fabric.clone() as Arc<dyn XiveNotifier>)),
                &mut ExternallyManagedMmioIntercepts,
            ),
            Err(XiveSourceError::InvalidEsbShift(15))
        ));
    }

    #[test]
    fn msi_trigger_coalesces() {
        let (fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());

        // Turn IRQ 7 on first; a source comes out of reset with ints off.
        source.esb_set(7, EsbState::RESET.0);
        source.set_irq(7, true);
        assert_eq!(fabric.take(), [7]);
        assert_eq!(source.esb_get(7), EsbState::PENDING.0);

        // A second edge queues without a new notification.
        source.set_irq(7, true);
        assert_eq!(fabric.take(), []);
        assert_eq!(source.esb_get(7), EsbState::QUEUED.0);
    }

    #[test]
    fn load_eoi_forwards_queued_event() {
        let (fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        source.esb_set(7, EsbState::RESET.0);
        source.set_irq(7, true);
        source.set_irq(7, true);
        fabric.take();

        // The EOI drains the queued event: pending again, re-notified.
        let base = source.esb_mgmt_offset(7);
        assert_eq!(esb_load(&mut source, base + ESB_LOAD_EOI), 1);
        assert_eq!(fabric.take(), [7]);
        assert_eq!(source.esb_get(7), EsbState::PENDING.0);

        // And the next EOI finishes the cycle with nothing to forward.
        assert_eq!(esb_load(&mut source, base + ESB_LOAD_EOI), 0);
        assert_eq!(fabric.take(), []);
        assert_eq!(source.esb_get(7), EsbState::RESET.0);
    }

    #[test]
    fn get_and_set_pq_ops() {
        let (_fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        let base = source.esb_mgmt_offset(3);

        assert_eq!(esb_load(&mut source, base + ESB_GET), EsbState::OFF.0 as u64);

        // The set-PQ loads return the previous state.
        assert_eq!(
            esb_load(&mut source, base + ESB_SET_PQ_00),
            EsbState::OFF.0 as u64
        );
        assert_eq!(
            esb_load(&mut source, base + ESB_SET_PQ_11),
            EsbState::RESET.0 as u64
        );
        assert_eq!(esb_load(&mut source, base + ESB_GET), EsbState::QUEUED.0 as u64);

        // Set-PQ stores update without replying.
        esb_store(&mut source, base + ESB_SET_PQ_00 + 0x80);
        assert_eq!(source.esb_get(3), EsbState::RESET.0);
    }

    #[test]
    fn trigger_page_semantics() {
        let (fabric, mut source) = create_source(XIVE_ESB_64K_2PAGE, SourceFlags::new());
        source.esb_set(2, EsbState::RESET.0);

        // Loads on the trigger page are invalid.
        let trigger = source.esb_page_offset(2);
        let mut data = [0; 8];
        assert!(matches!(
            source.esb_read(trigger + ESB_GET, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));

        // Any store on the trigger page triggers, even at management
        // offsets.
        esb_store(&mut source, trigger + ESB_SET_PQ_00);
        assert_eq!(fabric.take(), [2]);
        assert_eq!(source.esb_get(2), EsbState::PENDING.0);

        // The odd page still carries the management operations.
        let mgmt = source.esb_mgmt_offset(2);
        assert_eq!(esb_load(&mut source, mgmt + ESB_GET), EsbState::PENDING.0 as u64);
    }

    #[test]
    fn store_eoi_requires_flag() {
        let (_fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        source.esb_set(1, EsbState::PENDING.0);

        // Without the flag the store is a logged no-op.
        let base = source.esb_mgmt_offset(1);
        esb_store(&mut source, base + ESB_STORE_EOI);
        assert_eq!(source.esb_get(1), EsbState::PENDING.0);

        let (_fabric, mut source) =
            create_source(XIVE_ESB_64K, SourceFlags::new().with_store_eoi(true));
        source.esb_set(1, EsbState::QUEUED.0);
        let base = source.esb_mgmt_offset(1);
        esb_store(&mut source, base + ESB_STORE_EOI);
        assert_eq!(source.esb_get(1), EsbState::PENDING.0);
    }

    #[test]
    fn lsi_level_semantics() {
        let (fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        source.set_lsi(2);
        source.esb_set(2, EsbState::RESET.0);

        // Assert notifies once.
        source.set_irq(2, true);
        assert_eq!(fabric.take(), [2]);
        assert_eq!(source.esb_get(2), EsbState::PENDING.0);

        // Deassert then EOI: no re-forward.
        source.set_irq(2, false);
        let base = source.esb_mgmt_offset(2);
        assert_eq!(esb_load(&mut source, base + ESB_LOAD_EOI), 0);
        assert_eq!(fabric.take(), []);
        assert_eq!(source.esb_get(2), EsbState::RESET.0);

        // Re-assert notifies again.
        source.set_irq(2, true);
        assert_eq!(fabric.take(), [2]);

        // EOI while still asserted re-enters pending and forwards.
        assert_eq!(esb_load(&mut source, base + ESB_LOAD_EOI), 1);
        assert_eq!(fabric.take(), [2]);
        assert_eq!(source.esb_get(2), EsbState::PENDING.0);
    }

    #[test]
    fn access_size_is_enforced() {
        let (_fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        let base = source.esb_mgmt_offset(0);
        let mut data = [0; 4];
        assert!(matches!(
            source.esb_read(base + ESB_GET, &mut data),
            IoResult::Err(IoError::InvalidAccessSize)
        ));
        assert!(matches!(
            source.esb_write(base, &[0; 4]),
            IoResult::Err(IoError::InvalidAccessSize)
        ));
    }

    #[test]
    fn reset_preserves_lsi_map() {
        let (_fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        source.set_lsi(5);
        source.esb_set(5, EsbState::QUEUED.0);
        source.reset();
        assert_eq!(source.esb_get(5), EsbState::OFF.0);
        assert!(source.irq_is_lsi(5));
    }

    #[test]
    fn save_restore_roundtrip() {
        let (_fabric, mut source) = create_source(XIVE_ESB_64K, SourceFlags::new());
        source.set_lsi(4);
        source.esb_set(4, EsbState::PENDING.0);
        let saved = source.save();

        let (_fabric2, mut restored) = create_source(XIVE_ESB_64K, SourceFlags::new());
        restored.restore(saved).unwrap();
        assert_eq!(restored.esb_get(4), EsbState::PENDING.0);
        assert!(restored.irq_is_lsi(4));

        // Restoring state for a differently-sized source fails.
        let fabric = Arc::new(TestFabric::default());
        let mut other = XiveSource::new(
            32,
            XIVE_ESB_64K,
            SourceFlags::new(),
            Arc::downgrade(&(fabric.clone() as Arc<dyn XiveNotifier>)),
            &mut ExternallyManagedMmioIntercepts,
        )
        .unwrap();
        assert!(matches!(
            other.restore(restored.save()),
            Err(XiveSourceRestoreError::MismatchedIrqCount)
        ));
    }

    #[test]
    fn mmio_dispatch_through_registered_region() {
        let fabric = Arc::new(TestFabric::default());
        let mut source = XiveSource::new(
            16,
            XIVE_ESB_4K,
            SourceFlags::new(),
            Arc::downgrade(&(fabric.clone() as Arc<dyn XiveNotifier>)),
            &mut TestMmioRegistration,
        )
        .unwrap();
        source.map_esb(0x2000_0000);

        source.esb_set(3, EsbState::RESET.0);
        let addr = 0x2000_0000 + source.esb_page_offset(3);
        source.mmio_write(addr, &[0; 8]).unwrap();
        assert_eq!(fabric.take(), [3]);

        let mut data = [0; 8];
        source.mmio_read(addr + ESB_GET, &mut data).unwrap();
        assert_eq!(u64::from_be_bytes(data), EsbState::PENDING.0 as u64);

        // Accesses outside the mapped region miss.
        assert!(matches!(
            source.mmio_read(0x1000_0000, &mut data),
            IoResult::Err(IoError::InvalidRegister)
        ));
    }
}
