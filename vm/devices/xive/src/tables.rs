// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The default descriptor storage backend.

use crate::router::XiveTables;
use parking_lot::Mutex;
use ppcdefs::xive::Eqd;
use ppcdefs::xive::Ive;
use ppcdefs::xive::Vpd;

/// [`XiveTables`] backed by in-memory arrays for a single block.
///
/// EQ and VP lookups for any other block fail, as if the block were not
/// present on the bus.
pub struct InMemoryTables {
    block: u8,
    ives: Mutex<Vec<Ive>>,
    eqds: Mutex<Vec<Eqd>>,
    vpds: Mutex<Vec<Vpd>>,
}

impl InMemoryTables {
    /// Creates tables for `block` with all entries invalid.
    pub fn new(block: u8, nr_ives: u32, nr_eqds: u32, nr_vpds: u32) -> Self {
        Self {
            block,
            ives: Mutex::new(vec![Ive::new(); nr_ives as usize]),
            eqds: Mutex::new(vec![Eqd::off(); nr_eqds as usize]),
            vpds: Mutex::new(vec![Vpd::default(); nr_vpds as usize]),
        }
    }

    /// Returns the block this storage serves.
    pub fn block(&self) -> u8 {
        self.block
    }

    /// Resets every descriptor to its power-on value.
    pub fn reset(&self) {
        self.ives.lock().fill(Ive::new());
        self.eqds.lock().fill(Eqd::off());
        self.vpds.lock().fill(Vpd::default());
    }
}

impl XiveTables for InMemoryTables {
    fn ive(&self, lisn: u32) -> Option<Ive> {
        self.ives.lock().get(lisn as usize).copied()
    }

    fn set_ive(&self, lisn: u32, ive: Ive) -> bool {
        match self.ives.lock().get_mut(lisn as usize) {
            Some(entry) => {
                *entry = ive;
                true
            }
            None => false,
        }
    }

    fn eqd(&self, eq_blk: u8, eq_idx: u32) -> Option<Eqd> {
        if eq_blk != self.block {
            return None;
        }
        self.eqds.lock().get(eq_idx as usize).copied()
    }

    fn set_eqd(&self, eq_blk: u8, eq_idx: u32, eqd: Eqd) -> bool {
        if eq_blk != self.block {
            return false;
        }
        match self.eqds.lock().get_mut(eq_idx as usize) {
            Some(entry) => {
                *entry = eqd;
                true
            }
            None => false,
        }
    }

    fn vpd(&self, vp_blk: u8, vp_idx: u32) -> Option<Vpd> {
        if vp_blk != self.block {
            return None;
        }
        self.vpds.lock().get(vp_idx as usize).copied()
    }

    fn set_vpd(&self, vp_blk: u8, vp_idx: u32, vpd: Vpd) -> bool {
        if vp_blk != self.block {
            return false;
        }
        match self.vpds.lock().get_mut(vp_idx as usize) {
            Some(entry) => {
                *entry = vpd;
                true
            }
            None => false,
        }
    }
}
