// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The XIVE router (IVRE) and presenter (IVPE).
//!
//! The router receives event notifications from the sources, walks the
//! interrupt virtualization table to find the target event queue, pushes
//! the event data into the guest-resident queue and applies queue-level
//! coalescing through the EQ's embedded notification ESB. The presenter is
//! simple enough that it is merged into the router: it scans the registered
//! thread contexts for one whose CAM line matches the target virtual
//! processor and signals it, or records the interrupt in the VP's backlog
//! when the VP is not dispatched anywhere.
//!
//! Descriptor storage is pluggable: chip variants back the IVE/EQ/VP tables
//! by in-memory arrays, guest-resident tables walked by DMA, or cached
//! mirrors, all behind [`XiveTables`]. The router itself stays concrete.

use crate::esb;
use crate::tctx::TmRing;
use crate::tctx::XiveTctx;
use crate::XiveNotifier;
use guestmem::GuestMemory;
use parking_lot::Mutex;
use parking_lot::RwLock;
use ppcdefs::xive::priority_to_ipb;
use ppcdefs::xive::Eqd;
use ppcdefs::xive::EqdWord7Format0;
use ppcdefs::xive::EqdWord7Format1;
use ppcdefs::xive::Ive;
use ppcdefs::xive::Vpd;
use std::sync::Arc;
use std::sync::Weak;
use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::U32;

/// Storage for the three descriptor tables the router walks.
///
/// Lookups return `None` when the index is outside the table; stores return
/// false in the same case. Both are guest programming errors, handled by
/// the caller.
pub trait XiveTables: Send + Sync {
    /// Returns the interrupt virtualization entry for `lisn`.
    fn ive(&self, lisn: u32) -> Option<Ive>;
    /// Updates the interrupt virtualization entry for `lisn`.
    fn set_ive(&self, lisn: u32, ive: Ive) -> bool;
    /// Returns the event queue descriptor `eq_idx` of block `eq_blk`.
    fn eqd(&self, eq_blk: u8, eq_idx: u32) -> Option<Eqd>;
    /// Updates the event queue descriptor `eq_idx` of block `eq_blk`.
    fn set_eqd(&self, eq_blk: u8, eq_idx: u32, eqd: Eqd) -> bool;
    /// Returns the virtual processor descriptor `vp_idx` of block `vp_blk`.
    fn vpd(&self, vp_blk: u8, vp_idx: u32) -> Option<Vpd>;
    /// Updates the virtual processor descriptor `vp_idx` of block `vp_blk`.
    fn set_vpd(&self, vp_blk: u8, vp_idx: u32, vpd: Vpd) -> bool;
}

/// The XIVE router engine.
pub struct XiveRouter {
    // Static configuration
    chip_id: u8,

    // Runtime glue
    tables: Arc<dyn XiveTables>,
    memory: GuestMemory,

    // Thread contexts, registered by the CPUs that own them. Handles are
    // non-owning; contexts of torn-down CPUs are skipped and pruned.
    tctxs: RwLock<Vec<Weak<Mutex<XiveTctx>>>>,
}

impl XiveRouter {
    /// Creates a router for chip `chip_id` over the given descriptor
    /// storage and guest memory.
    pub fn new(chip_id: u8, tables: Arc<dyn XiveTables>, memory: GuestMemory) -> Self {
        Self {
            chip_id,
            tables,
            memory,
            tctxs: RwLock::new(Vec::new()),
        }
    }

    /// Returns the chip id of this router.
    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    /// Returns the descriptor storage.
    pub fn tables(&self) -> &Arc<dyn XiveTables> {
        &self.tables
    }

    /// Registers a CPU's thread context with the presenter.
    pub fn register_tctx(&self, tctx: &Arc<Mutex<XiveTctx>>) {
        let mut tctxs = self.tctxs.write();
        tctxs.retain(|t| t.strong_count() > 0);
        tctxs.push(Arc::downgrade(tctx));
        tracing::debug!(count = tctxs.len(), "registered thread context");
    }

    /// Appends one entry to the event queue and advances the queue pointer,
    /// flipping the generation bit on wrap.
    ///
    /// Returns false if the entry could not be written to guest memory; the
    /// queue does not advance in that case.
    fn eq_push(&self, eqd: &mut Eqd, data: u32) -> bool {
        let entries = eqd.queue_entries();
        let index = eqd.w1.page_off();
        let generation = eqd.w1.generation();

        let qaddr = eqd.queue_address() + ((index as u64) << 2);
        let qdata = U32::<BigEndian>::new(((generation as u32) << 31) | (data & 0x7fff_ffff));
        if let Err(err) = self.memory.write_plain(qaddr, &qdata) {
            tracelimit::warn_ratelimited!(
                error = &err as &dyn std::error::Error,
                qaddr,
                "failed to write EQ data"
            );
            return false;
        }

        let index = (index + 1) % entries;
        if index == 0 {
            eqd.w1.set_generation(!generation);
        }
        eqd.w1.set_page_off(index);
        true
    }

    /// An EQ trigger, from an event trigger or from queue-level management.
    fn eq_notify(&self, eq_blk: u8, eq_idx: u32, eq_data: u32) {
        // EQD cache lookup.
        let Some(mut eqd) = self.tables.eqd(eq_blk, eq_idx) else {
            tracelimit::warn_ratelimited!(eq_blk, eq_idx, "no EQ descriptor");
            return;
        };
        if !eqd.w0.valid() {
            tracelimit::warn_ratelimited!(eq_blk, eq_idx, "EQ descriptor is invalid");
            return;
        }

        if eqd.w0.enqueue() {
            // A failed queue write drops the notification after logging.
            if !self.eq_push(&mut eqd, eq_data) {
                return;
            }
            self.tables.set_eqd(eq_blk, eq_idx, eqd);
        }

        // Check the EQ's notification ESB for further coalescing in the
        // router.
        if !eqd.w0.ucond_notify() {
            let (pq, notify) = esb::trigger(eqd.w1.esn());
            if pq != eqd.w1.esn() {
                eqd.w1.set_esn(pq);
                self.tables.set_eqd(eq_blk, eq_idx, eqd);
            }

            // ESn[Q] was already set: end of notification.
            if !notify {
                return;
            }
        }

        // W7's format depends on the format bit in W6: format 0 notifies a
        // specific VP, format 1 is a user-level event-based branch
        // notification.
        let format1 = eqd.w6.format_bit();
        let w7f0 = EqdWord7Format0::from(eqd.w7);
        let priority = w7f0.priority();

        // A format-0 EQ at priority 0xff is masked.
        if !format1 && priority == 0xff {
            return;
        }

        self.presenter_notify(
            format1,
            eqd.w6.nvt_block(),
            eqd.w6.nvt_index(),
            w7f0.ignore(),
            priority,
            EqdWord7Format1::from(eqd.w7).log_server_id(),
        );
    }

    /// Finds the VP dispatched on a thread context and signals it, or
    /// records the interrupt in the VP's backlog.
    ///
    /// The parameters mirror what the notification carries on the bus.
    fn presenter_notify(
        &self,
        format1: bool,
        vp_blk: u8,
        vp_idx: u32,
        cam_ignore: bool,
        priority: u8,
        logic_serv: u32,
    ) {
        // VPD cache lookup.
        let Some(mut vpd) = self.tables.vpd(vp_blk, vp_idx) else {
            tracelimit::warn_ratelimited!(vp_blk, vp_idx, "no VP descriptor");
            return;
        };
        if !vpd.w0.valid() {
            tracelimit::warn_ratelimited!(vp_blk, vp_idx, "VP descriptor is invalid");
            return;
        }

        // A set ignore bit requests a logical server notification, where
        // the presenter picks a winning thread among several. Unsupported.
        if cam_ignore {
            tracelimit::warn_ratelimited!(
                vp_blk,
                vp_idx,
                "logical server notification is not supported"
            );
            return;
        }

        let mut matched: Option<(Arc<Mutex<XiveTctx>>, TmRing)> = None;
        for weak in self.tctxs.read().iter() {
            let Some(tctx) = weak.upgrade() else { continue };
            let ring = tctx
                .lock()
                .presenter_match(format1, vp_blk, vp_idx, logic_serv);
            if let Some(ring) = ring {
                if matched.is_some() {
                    // Duplicate matches are a modeling error.
                    tracelimit::warn_ratelimited!(
                        vp_blk,
                        vp_idx,
                        "already found a thread context for VP"
                    );
                    return;
                }
                matched = Some((tctx, ring));
            }
        }

        if let Some((tctx, ring)) = matched {
            let mut tctx = tctx.lock();
            tctx.ipb_update(ring, priority);
            tctx.notify(ring);
            return;
        }

        // No thread has the VP dispatched; record the interrupt in the
        // VP's backlog.
        tracelimit::warn_ratelimited!(vp_blk, vp_idx, "VP is not dispatched");
        vpd.w4.set_ipb(vpd.w4.ipb() | priority_to_ipb(priority));
        self.tables.set_vpd(vp_blk, vp_idx, vpd);
    }
}

impl XiveNotifier for XiveRouter {
    fn notify(&self, lisn: u32) {
        tracing::trace!(lisn, "event notification");

        // IVE cache lookup.
        let Some(ive) = self.tables.ive(lisn) else {
            tracelimit::warn_ratelimited!(lisn, "unknown LISN");
            return;
        };

        if !ive.valid() {
            tracelimit::warn_ratelimited!(lisn, "invalid LISN");
            return;
        }

        if ive.masked() {
            // Notification completed.
            return;
        }

        // The event trigger becomes an EQ trigger.
        self.eq_notify(ive.eq_block(), ive.eq_index(), ive.eq_data());
    }
}
