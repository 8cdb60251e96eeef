// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! XIVE (eXternal Interrupt Virtualization Engine) definitions for POWER9.
//!
//! The architecture numbers register bits MSB-first; the bitfields below map
//! those positions onto LSB-first fields, so the raw values match what a
//! big-endian guest reads from the descriptor tables.

use bitfield_struct::bitfield;
use std::fmt;

/// The lowest-favored interrupt priority. Priority 0 is the most favored;
/// values above this are treated as "masked" (0xff).
pub const XIVE_PRIORITY_MAX: u8 = 7;

/// The 2-bit Event State Buffer (ESB) state.
///
/// P (bit 1) records that an event is pending; Q (bit 0) that a further
/// event arrived while one was already pending. Guest stores can set any
/// two-bit value, so this is a transparent wrapper over the raw bits
/// rather than a Rust enum.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct EsbState(pub u8);

impl EsbState {
    pub const RESET: Self = Self(0b00);
    pub const OFF: Self = Self(0b01);
    pub const PENDING: Self = Self(0b10);
    pub const QUEUED: Self = Self(0b11);
}

impl fmt::Debug for EsbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RESET => f.write_str("RESET"),
            Self::OFF => f.write_str("OFF"),
            Self::PENDING => f.write_str("PENDING"),
            Self::QUEUED => f.write_str("QUEUED"),
            Self(other) => write!(f, "EsbState({other:#04b})"),
        }
    }
}

/// The P bit of a 2-bit ESB state.
pub const ESB_VAL_P: u8 = 0b10;
/// The Q bit of a 2-bit ESB state.
pub const ESB_VAL_Q: u8 = 0b01;

/// 4 KiB ESB pages.
pub const XIVE_ESB_4K: u8 = 12;
/// 4 KiB ESB pages, with a separate trigger page.
pub const XIVE_ESB_4K_2PAGE: u8 = 13;
/// 64 KiB ESB pages.
pub const XIVE_ESB_64K: u8 = 16;
/// 64 KiB ESB pages, with a separate trigger page.
pub const XIVE_ESB_64K_2PAGE: u8 = 17;

// ESB MMIO operations, decoded from the low 12 bits of the page offset.
// Stores in the first kilobyte trigger the source; loads there perform an
// EOI. The SET_PQ operations encode the new state in offset bits 9:8.
pub const ESB_LOAD_EOI: u64 = 0x000;
pub const ESB_STORE_EOI: u64 = 0x400;
pub const ESB_GET: u64 = 0x800;
pub const ESB_SET_PQ_00: u64 = 0xc00;
pub const ESB_SET_PQ_01: u64 = 0xd00;
pub const ESB_SET_PQ_10: u64 = 0xe00;
pub const ESB_SET_PQ_11: u64 = 0xf00;

/// Shift of one TIMA page (the TIMA is four 4 KiB views).
pub const TM_SHIFT: u64 = 12;

/// The hardware view of the TIMA, the most privileged.
pub const TM_HW_PAGE: u8 = 0;
/// The hypervisor view.
pub const TM_HV_PAGE: u8 = 1;
/// The OS view.
pub const TM_OS_PAGE: u8 = 2;
/// The user view, the least privileged.
pub const TM_USER_PAGE: u8 = 3;

// The four 16-byte rings of the thread interrupt management context.
pub const TM_QW0_USER: usize = 0x00;
pub const TM_QW1_OS: usize = 0x10;
pub const TM_QW2_HV_POOL: usize = 0x20;
pub const TM_QW3_HV_PHYS: usize = 0x30;

/// Number of rings in the context.
pub const TM_RING_COUNT: usize = 4;
/// Size of one ring in bytes.
pub const TM_RING_SIZE: usize = 0x10;

// Byte offsets within a ring.
pub const TM_NSR: usize = 0x0;
pub const TM_CPPR: usize = 0x1;
pub const TM_IPB: usize = 0x2;
pub const TM_LSMFB: usize = 0x3;
pub const TM_ACK_CNT: usize = 0x4;
pub const TM_INC: usize = 0x5;
pub const TM_AGE: usize = 0x6;
pub const TM_PIPR: usize = 0x7;
pub const TM_WORD2: usize = 0x8;

/// The exception-outstanding bit of the OS-ring NSR.
pub const TM_QW1_NSR_EO: u8 = 0x80;

// Special TIMA operations, decoded from the low 12 bits of the offset.
/// 2-byte load: acknowledge the OS interrupt and return NSR/CPPR.
pub const TM_SPC_ACK_OS_REG: u64 = 0x810;
/// 1-byte store: set an OS-ring IPB bit by priority.
pub const TM_SPC_SET_OS_PENDING: u64 = 0x812;

/// Thread context WORD2 as seen by the user ring (QW0).
#[bitfield(u32)]
pub struct TmQw0Word2 {
    #[bits(31)]
    pub logic_serv: u32,
    pub vu: bool,
}

/// Thread context WORD2 as seen by the OS ring (QW1).
#[bitfield(u32)]
pub struct TmQw1Word2 {
    #[bits(24)]
    pub os_cam: u32,
    #[bits(7)]
    _reserved: u32,
    pub vo: bool,
}

/// Thread context WORD2 as seen by the pool ring (QW2).
#[bitfield(u32)]
pub struct TmQw2Word2 {
    #[bits(24)]
    pub pool_cam: u32,
    #[bits(7)]
    _reserved: u32,
    pub vp: bool,
}

/// Thread context WORD2 as seen by the physical-thread ring (QW3).
#[bitfield(u32)]
pub struct TmQw3Word2 {
    #[bits(31)]
    _reserved: u32,
    pub vt: bool,
}

/// Layout of the Processor Identification Register as used to derive the
/// hardwired thread CAM line.
#[bitfield(u32)]
pub struct Pir {
    #[bits(7)]
    pub thread_id: u8,
    _reserved: bool,
    #[bits(4)]
    pub chip_id: u8,
    #[bits(20)]
    _reserved2: u32,
}

/// Interrupt Virtualization Entry: maps a LISN to an event queue and the
/// data to push into it.
#[bitfield(u64)]
pub struct Ive {
    #[bits(31)]
    pub eq_data: u32,
    pub masked: bool,
    #[bits(24)]
    pub eq_index: u32,
    #[bits(4)]
    pub eq_block: u8,
    #[bits(3)]
    _reserved: u64,
    pub valid: bool,
}

/// Event queue descriptor word 0: validity and queueing controls.
#[bitfield(u32)]
pub struct EqdWord0 {
    #[bits(16)]
    _reserved: u32,
    /// The queue holds `2^(qsize + 10)` 4-byte entries.
    #[bits(3)]
    pub qsize: u8,
    #[bits(4)]
    _reserved2: u32,
    pub escalate_ctl: bool,
    pub backlog: bool,
    pub ucond_notify: bool,
    pub enqueue: bool,
    #[bits(4)]
    _reserved3: u32,
    pub valid: bool,
}

/// Event queue descriptor word 1: the live queue pointer and the embedded
/// notification (ESn) and escalation (ESe) ESBs.
#[bitfield(u32)]
pub struct EqdWord1 {
    #[bits(22)]
    pub page_off: u32,
    pub generation: bool,
    #[bits(5)]
    _reserved: u32,
    #[bits(2)]
    pub ese: u8,
    #[bits(2)]
    pub esn: u8,
}

/// Event queue descriptor word 2: high bits of the queue base address.
#[bitfield(u32)]
pub struct EqdWord2 {
    #[bits(28)]
    pub qaddr_hi: u32,
    #[bits(4)]
    _reserved: u32,
}

/// Event queue descriptor word 6: the notification target.
#[bitfield(u32)]
pub struct EqdWord6 {
    #[bits(19)]
    pub nvt_index: u32,
    #[bits(4)]
    pub nvt_block: u8,
    /// Selects the word-7 format: clear for VP notification, set for
    /// user-level event-based branch notification.
    pub format_bit: bool,
    #[bits(8)]
    _reserved: u32,
}

/// Event queue descriptor word 7, format 0: VP notification parameters.
#[bitfield(u32)]
pub struct EqdWord7Format0 {
    #[bits(16)]
    _reserved: u32,
    pub priority: u8,
    #[bits(6)]
    _reserved2: u32,
    pub blk_grouping: bool,
    pub ignore: bool,
}

/// Event queue descriptor word 7, format 1: user-level EBB parameters.
#[bitfield(u32)]
pub struct EqdWord7Format1 {
    #[bits(31)]
    pub log_server_id: u32,
    pub wakeup: bool,
}

/// Event Queue Descriptor: a guest-resident circular buffer of event data
/// plus the notification parameters for its target VP.
#[derive(Debug, Copy, Clone)]
pub struct Eqd {
    pub w0: EqdWord0,
    pub w1: EqdWord1,
    pub w2: EqdWord2,
    pub w3: u32,
    /// Escalation words, unused by this model.
    pub w4: u32,
    pub w5: u32,
    pub w6: EqdWord6,
    pub w7: u32,
}

impl Eqd {
    /// The value after controller reset: invalid, with both embedded ESBs
    /// switched off.
    pub const fn off() -> Self {
        Self {
            w0: EqdWord0::new(),
            w1: EqdWord1::new()
                .with_esn(EsbState::OFF.0)
                .with_ese(EsbState::OFF.0),
            w2: EqdWord2::new(),
            w3: 0,
            w4: 0,
            w5: 0,
            w6: EqdWord6::new(),
            w7: 0,
        }
    }

    /// The 60-bit guest physical base address of the queue.
    pub const fn queue_address(&self) -> u64 {
        ((self.w2.qaddr_hi() as u64) << 32) | self.w3 as u64
    }

    /// The number of 4-byte entries in the queue.
    pub const fn queue_entries(&self) -> u32 {
        1 << (self.w0.qsize() + 10)
    }
}

impl Default for Eqd {
    fn default() -> Self {
        Self::off()
    }
}

/// Virtual processor (a.k.a. NVT) descriptor word 0.
#[bitfield(u32)]
pub struct VpdWord0 {
    #[bits(31)]
    _reserved: u32,
    pub valid: bool,
}

/// Virtual processor descriptor word 4: the backlog IPB recorded when the
/// VP is not dispatched on any thread.
#[bitfield(u32)]
pub struct VpdWord4 {
    #[bits(24)]
    _reserved: u32,
    pub ipb: u8,
}

/// Virtual Processor Descriptor, the routing target of an event queue.
#[derive(Debug, Copy, Clone)]
pub struct Vpd {
    pub w0: VpdWord0,
    pub w4: VpdWord4,
}

impl Default for Vpd {
    fn default() -> Self {
        Self {
            w0: VpdWord0::new(),
            w4: VpdWord4::new(),
        }
    }
}

/// Converts a priority number to its Interrupt Pending Buffer bit. The IPB
/// indicates a pending interrupt at the priority corresponding to the bit
/// number.
pub const fn priority_to_ipb(priority: u8) -> u8 {
    if priority > XIVE_PRIORITY_MAX {
        0
    } else {
        1 << (XIVE_PRIORITY_MAX - priority)
    }
}

/// Converts an Interrupt Pending Buffer to the Pending Interrupt Priority
/// Register value: the priority of the most favored pending notification,
/// or 0xff if none is pending.
pub const fn ipb_to_pipr(ipb: u8) -> u8 {
    if ipb == 0 {
        0xff
    } else {
        ipb.leading_zeros() as u8
    }
}

/// The CAM line identifying a virtual processor.
pub const fn cam_line(vp_blk: u8, vp_idx: u32) -> u32 {
    ((vp_blk as u32) << 19) | vp_idx
}

/// The hardwired CAM line of a physical thread (23 bits):
///
/// `0x000 || 0b1 || 4-bit chip number || 7-bit thread number`
///
/// and when the block grouping extension is enabled:
///
/// `4-bit chip number || 0x001 || 7-bit thread number`
pub const fn hw_cam_line(block_group: bool, chip_id: u8, tid: u8) -> u32 {
    if block_group {
        1 << 11 | ((chip_id & 0xf) as u32) << 7 | (tid & 0x7f) as u32
    } else {
        ((chip_id & 0xf) as u32) << 11 | 1 << 7 | (tid & 0x7f) as u32
    }
}
