// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! XIVE interrupt controller emulator.
//!
//! This emulates the POWER9 eXternal Interrupt Virtualization Engine as a
//! three-stage pipeline. An event source ([`source::XiveSource`], the IVSE)
//! owns one 2-bit Event State Buffer per interrupt and an MMIO region of
//! trigger/EOI/management pages. When an ESB transition warrants a
//! notification, the source forwards the logical interrupt source number to
//! the fabric ([`XiveNotifier`]). The router ([`router::XiveRouter`], the
//! IVRE) looks up the Interrupt Virtualization Entry for that LISN, pushes
//! the event data into the guest-resident event queue described by the EQ
//! descriptor and coalesces at the queue level through the EQ's embedded
//! ESBs. Finally the presenter (IVPE, merged into the router) matches the
//! EQ's target virtual processor against the CAM lines of every registered
//! thread context ([`tctx::XiveTctx`]) and, on a match, updates the ring's
//! pending priorities and raises the thread's output line.
//!
//! The guest drives the pipeline back down through MMIO: the ESB pages to
//! EOI or manipulate source state, the per-EQ ESB pages
//! ([`eq_source::XiveEqSource`]) for queue-level coalescing, and the thread
//! interrupt management area (TIMA) to accept and prioritize interrupts.

#![forbid(unsafe_code)]

pub mod eq_source;
pub mod esb;
pub mod router;
pub mod source;
pub mod tables;
pub mod tctx;

#[cfg(test)]
mod test_helpers;

/// The notification fabric connecting event sources to the router.
pub trait XiveNotifier: Send + Sync {
    /// Forwards the event notification for `lisn` for routing.
    fn notify(&self, lisn: u32);
}
