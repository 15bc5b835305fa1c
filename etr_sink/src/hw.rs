// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command set the sink needs from a tracer unit.
//!
//! [`crate::mmio::MmioTmc`] implements it on top of real registers and
//! [`crate::sim::SimulatedTmc`] implements it in memory.

use etr_regs::TmcMode;

/// How to arm a capture.
///
/// The sink only ever uses the circular buffer mode, in which the unit keeps
/// writing when it reaches the end of the buffer and wraps to the start,
/// overwriting the oldest data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArmFlags {
    pub mode: TmcMode,
    /// Number of words captured after a trigger before the unit stops
    pub trigger_counter: u32,
}

impl ArmFlags {
    pub fn circular(trigger_counter: u32) -> ArmFlags {
        ArmFlags {
            mode: TmcMode::CircularBuffer,
            trigger_counter,
        }
    }
}

/// Pointers and status reported by the unit at one instant.
///
/// The unit moves the write pointer on its own while it is armed, so these
/// are read fresh whenever they are needed and never kept around.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwPointers {
    /// RAM read pointer, as a bus address
    pub read: u64,
    /// RAM write pointer, as a bus address
    pub write: u64,
    /// The write pointer has lapped the read pointer, so data was lost
    pub full: bool,
}

/// Register-level operations on a tracer unit.
///
/// Every call is made with the owning sink's lock held, so implementations
/// never see two calls interleaved.
pub trait TraceSinkHw: Send {
    /// Program the buffer location and size and start capturing.
    fn arm(&mut self, base: u64, size: usize, flags: ArmFlags);

    /// Flush the unit's pipeline into the buffer and stop capturing. The
    /// pointer and status registers keep their values afterwards.
    fn disarm_and_flush(&mut self);

    /// Returns true if the buffer is full
    fn read_status(&mut self) -> bool;

    fn read_read_ptr(&mut self) -> u64;

    fn read_write_ptr(&mut self) -> u64;

    fn write_read_ptr(&mut self, addr: u64);

    fn read_pointers(&mut self) -> HwPointers {
        HwPointers {
            full: self.read_status(),
            read: self.read_read_ptr(),
            write: self.read_write_ptr(),
        }
    }
}
