// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register layouts for a CoreSight Trace Memory Controller configured as an
//! Embedded Trace Router (ETR).
//!
//! Offsets and bit positions follow the CoreSight TMC TRM (ARM DDI 0461),
//! chapter 3.

use bitfield::bitfield;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};

/// RAM Size register, in 32-bit words
pub const TMC_RSZ: u32 = 0x004;
pub const TMC_STS: u32 = 0x00c;
/// RAM Read Pointer, low word
pub const TMC_RRP: u32 = 0x014;
/// RAM Write Pointer, low word
pub const TMC_RWP: u32 = 0x018;
/// Trigger counter
pub const TMC_TRG: u32 = 0x01c;
pub const TMC_CTL: u32 = 0x020;
pub const TMC_MODE: u32 = 0x028;
pub const TMC_RRPHI: u32 = 0x038;
pub const TMC_RWPHI: u32 = 0x03c;
pub const TMC_AXICTL: u32 = 0x110;
/// Data Buffer Address, low word
pub const TMC_DBALO: u32 = 0x118;
pub const TMC_DBAHI: u32 = 0x11c;
pub const TMC_FFSR: u32 = 0x300;
pub const TMC_FFCR: u32 = 0x304;

/// CoreSight Lock Access Register
pub const CORESIGHT_LAR: u32 = 0xfb0;
pub const CORESIGHT_DEVID: u32 = 0xfc8;

/// Writing this to LAR unlocks the programming interface; anything else
/// locks it again.
pub const CORESIGHT_UNLOCK: u32 = 0xc5ac_ce55;

/// AXICTL bits that have to be cleared before programming an ETR session:
/// protection, cache control, scatter-gather mode and write burst length.
pub const AXICTL_CLEAR_MASK: u32 = 0xfbf;

/// A memory-mapped TMC register with a fixed offset.
pub trait TmcRegister: Copy + From<u32> + Into<u32> {
    const ADDRESS: u32;
    const NAME: &'static str;
}

macro_rules! tmc_register {
    ($ty:ident, $addr:expr, $name:literal) => {
        impl TmcRegister for $ty {
            const ADDRESS: u32 = $addr;
            const NAME: &'static str = $name;
        }

        impl From<u32> for $ty {
            fn from(raw: u32) -> $ty {
                $ty(raw)
            }
        }

        impl From<$ty> for u32 {
            fn from(reg: $ty) -> u32 {
                reg.0
            }
        }
    };
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Sts(u32);
    impl Debug;
    /// The circular buffer wrapped at least once since it was armed
    pub full, set_full: 0;
    pub triggered, set_triggered: 1;
    pub tmc_ready, set_tmc_ready: 2;
    pub ft_empty, set_ft_empty: 3;
    pub empty, set_empty: 4;
    pub mem_err, set_mem_err: 5;
}
tmc_register!(Sts, TMC_STS, "TMC/STS");

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Ctl(u32);
    impl Debug;
    pub capt_en, set_capt_en: 0;
}
tmc_register!(Ctl, TMC_CTL, "TMC/CTL");

bitfield! {
    /// Formatter and Flush Control
    #[derive(Clone, Copy, Default)]
    pub struct Ffcr(u32);
    impl Debug;
    pub en_fmt, set_en_fmt: 0;
    pub en_ti, set_en_ti: 1;
    pub fon_flin, set_fon_flin: 4;
    pub fon_trig_evt, set_fon_trig_evt: 5;
    pub flush_man, set_flush_man: 6;
    pub trigon_trigin, set_trigon_trigin: 8;
    pub stop_on_flush, set_stop_on_flush: 12;
}
tmc_register!(Ffcr, TMC_FFCR, "TMC/FFCR");

impl Ffcr {
    /// Formatter settings used for every capture session: formatting and
    /// trigger insertion on, flush on FLUSHIN and on trigger events, and
    /// TRIGIN acting as a trigger.
    pub fn for_capture() -> Ffcr {
        let mut ffcr = Ffcr::default();
        ffcr.set_en_fmt(true);
        ffcr.set_en_ti(true);
        ffcr.set_fon_flin(true);
        ffcr.set_fon_trig_evt(true);
        ffcr.set_trigon_trigin(true);
        ffcr
    }
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Axictl(u32);
    impl Debug;
    pub prot_ctl_b0, set_prot_ctl_b0: 0;
    pub prot_ctl_b1, set_prot_ctl_b1: 1;
    /// AXI write cache attributes
    pub u8, axcache, set_axcache: 5, 2;
    pub sct_gat_mode, set_sct_gat_mode: 7;
    pub u8, wr_burst_len, set_wr_burst_len: 11, 8;
    /// AXI read cache attributes, only present on some integrations
    pub u8, arcache, set_arcache: 19, 16;
}
tmc_register!(Axictl, TMC_AXICTL, "TMC/AXICTL");

/// Value for the cache attribute fields meaning "outer shareable,
/// write-back, read/write allocate".
pub const AXI_CACHE_OS: u8 = 0xf;

/// Value for the write burst length field meaning 16 transfers.
pub const AXI_WR_BURST_16: u8 = 0xf;

impl Axictl {
    /// Clear everything the driver programs, leaving unrelated
    /// implementation-defined bits alone.
    pub fn cleared(self) -> Axictl {
        Axictl(self.0 & !AXICTL_CLEAR_MASK)
    }
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct ModeReg(u32);
    impl Debug;
    pub u8, raw_mode, set_raw_mode: 1, 0;
}
tmc_register!(ModeReg, TMC_MODE, "TMC/MODE");

/// Operating modes of the TMC RAM
#[derive(PrimitiveEnum_u8, Copy, Clone, Debug, PartialEq, Eq)]
pub enum TmcMode {
    /// The RAM is a ring that keeps overwriting; the only mode an ETR sink uses
    CircularBuffer = 0x0,
    SoftwareFifo = 0x1,
    HardwareFifo = 0x2,
}

impl ModeReg {
    pub fn new(mode: TmcMode) -> ModeReg {
        let mut reg = ModeReg::default();
        reg.set_raw_mode(mode.to_primitive());
        reg
    }

    pub fn mode(&self) -> EnumCatchAll<TmcMode> {
        let raw = self.raw_mode();
        match TmcMode::from_primitive(raw) {
            Some(mode) => EnumCatchAll::Enum(mode),
            None => EnumCatchAll::CatchAll(raw),
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Devid(u32);
    impl Debug;
    pub u8, memwidth, set_memwidth: 10, 8;
}
tmc_register!(Devid, CORESIGHT_DEVID, "CS/DEVID");

impl Devid {
    pub fn mem_width(&self) -> Option<MemWidth> {
        MemWidth::from_u8(self.memwidth())
    }
}

/// Width of the trace memory data bus, as encoded in DEVID[10:8].
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum MemWidth {
    Bits32 = 0x2,
    Bits64 = 0x3,
    Bits128 = 0x4,
    Bits256 = 0x5,
}

impl MemWidth {
    pub fn from_bits(bits: u32) -> Option<MemWidth> {
        match bits {
            32 => Some(MemWidth::Bits32),
            64 => Some(MemWidth::Bits64),
            128 => Some(MemWidth::Bits128),
            256 => Some(MemWidth::Bits256),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            MemWidth::Bits32 => 32,
            MemWidth::Bits64 => 64,
            MemWidth::Bits128 => 128,
            MemWidth::Bits256 => 256,
        }
    }

    /// Alignment a value written to RRP must honour: the width of the trace
    /// memory bus or a 16 byte frame, whichever is larger.
    pub fn rrp_alignment(self) -> u64 {
        match self {
            MemWidth::Bits32 | MemWidth::Bits64 | MemWidth::Bits128 => 16,
            MemWidth::Bits256 => 32,
        }
    }
}

/// A memory width that isn't 32, 64, 128 or 256 bits
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported trace memory width: {0} bits")]
pub struct BadMemWidth(pub u32);

impl TryFrom<u32> for MemWidth {
    type Error = BadMemWidth;

    fn try_from(bits: u32) -> Result<MemWidth, BadMemWidth> {
        MemWidth::from_bits(bits).ok_or(BadMemWidth(bits))
    }
}

impl From<MemWidth> for u32 {
    fn from(width: MemWidth) -> u32 {
        width.bits()
    }
}

/// Split a bus address into the (low, high) words of a 64-bit register pair
pub fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Inverse of [`split_addr`]
pub fn join_addr(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}
