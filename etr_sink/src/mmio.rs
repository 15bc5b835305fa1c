// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::Capabilities;
use crate::hw::{ArmFlags, TraceSinkHw};
use etr_regs::*;
use log::{trace, warn};
use std::ptr::NonNull;

// How many times to re-read a status bit before giving up on it
const POLL_ATTEMPTS: u32 = 100;

/// 32-bit access to a block of device registers.
pub trait RegisterIo: Send {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&mut self, offset: u32, value: u32);
}

/// Registers reached through a memory mapping.
pub struct VolatileRegisters {
    base: NonNull<u8>,
}

// The mapping is device memory, not tied to the thread that created it.
unsafe impl Send for VolatileRegisters {}

impl VolatileRegisters {
    /// # Safety
    ///
    /// `base` must point at a mapping of the unit's 4 KiB register frame that
    /// stays valid for the lifetime of the returned value, and nothing else
    /// may program the unit while it exists.
    pub unsafe fn new(base: NonNull<u8>) -> VolatileRegisters {
        VolatileRegisters { base }
    }

    fn reg(&self, offset: u32) -> *mut u32 {
        assert!(offset % 4 == 0 && offset < 0x1000, "bad register offset {offset:#x}");
        // SAFETY: in bounds of the frame promised to `new`
        unsafe { self.base.as_ptr().add(offset as usize).cast::<u32>() }
    }
}

impl RegisterIo for VolatileRegisters {
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: see `new`
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        // SAFETY: see `new`
        unsafe { self.reg(offset).write_volatile(value) }
    }
}

/// A TMC in ETR configuration, driven through its registers.
pub struct MmioTmc<R> {
    regs: R,
    caps: Capabilities,
}

impl<R: RegisterIo> MmioTmc<R> {
    pub fn new(regs: R, caps: Capabilities) -> MmioTmc<R> {
        MmioTmc { regs, caps }
    }

    /// Width of the trace memory interface as reported by the hardware.
    pub fn mem_width(&self) -> Option<MemWidth> {
        self.read::<Devid>().mem_width()
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn into_registers(self) -> R {
        self.regs
    }

    fn read<T: TmcRegister>(&self) -> T {
        T::from(self.regs.read32(T::ADDRESS))
    }

    fn write<T: TmcRegister>(&mut self, reg: T) {
        let value: u32 = reg.into();
        trace!("{} <- {value:#010x}", T::NAME);
        self.regs.write32(T::ADDRESS, value);
    }

    fn write_raw(&mut self, offset: u32, value: u32) {
        trace!("{offset:#05x} <- {value:#010x}");
        self.regs.write32(offset, value);
    }

    fn write_pair(&mut self, lo: u32, hi: u32, addr: u64) {
        let (addr_lo, addr_hi) = split_addr(addr);
        self.write_raw(lo, addr_lo);
        self.write_raw(hi, addr_hi);
    }

    fn read_pair(&self, lo: u32, hi: u32) -> u64 {
        join_addr(self.regs.read32(lo), self.regs.read32(hi))
    }

    fn unlock(&mut self) {
        self.regs.write32(CORESIGHT_LAR, CORESIGHT_UNLOCK);
    }

    fn lock(&mut self) {
        self.regs.write32(CORESIGHT_LAR, 0);
    }

    fn poll(&self, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..POLL_ATTEMPTS {
            if done(self) {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn wait_for_ready(&self) {
        if !self.poll(|tmc| tmc.read::<Sts>().tmc_ready()) {
            warn!("timed out waiting for TMCReady");
        }
    }

    fn flush_and_stop(&mut self) {
        let mut ffcr = self.read::<Ffcr>();
        ffcr.set_stop_on_flush(true);
        self.write(ffcr);
        ffcr.set_flush_man(true);
        self.write(ffcr);

        // FlushMan reads back as 1 until the flush has completed
        if !self.poll(|tmc| !tmc.read::<Ffcr>().flush_man()) {
            warn!("timed out waiting for manual flush to complete");
        }
        self.wait_for_ready();
    }
}

impl<R: RegisterIo> TraceSinkHw for MmioTmc<R> {
    fn arm(&mut self, base: u64, size: usize, flags: ArmFlags) {
        self.unlock();
        self.wait_for_ready();

        // RSZ counts 32-bit words; the config check keeps this in range
        self.write_raw(TMC_RSZ, (size / 4) as u32);
        self.write(ModeReg::new(flags.mode));

        let mut axictl = self.read::<Axictl>().cleared();
        axictl.set_prot_ctl_b1(true);
        axictl.set_wr_burst_len(AXI_WR_BURST_16);
        axictl.set_axcache(AXI_CACHE_OS);
        if self.caps.axi_arcache {
            axictl.set_arcache(AXI_CACHE_OS);
        }
        self.write(axictl);

        self.write_pair(TMC_DBALO, TMC_DBAHI, base);

        // Units that save and restore their pointers across power-down start
        // wherever they left off unless told otherwise.
        if self.caps.save_restore {
            self.write_pair(TMC_RRP, TMC_RRPHI, base);
            self.write_pair(TMC_RWP, TMC_RWPHI, base);
            let mut sts = self.read::<Sts>();
            sts.set_full(false);
            self.write(sts);
        }

        self.write(Ffcr::for_capture());
        self.write_raw(TMC_TRG, flags.trigger_counter);

        let mut ctl = Ctl::default();
        ctl.set_capt_en(true);
        self.write(ctl);

        self.lock();
    }

    fn disarm_and_flush(&mut self) {
        self.unlock();
        self.flush_and_stop();
        self.write(Ctl::default());
        self.lock();
    }

    fn read_status(&mut self) -> bool {
        self.read::<Sts>().full()
    }

    fn read_read_ptr(&mut self) -> u64 {
        self.read_pair(TMC_RRP, TMC_RRPHI)
    }

    fn read_write_ptr(&mut self) -> u64 {
        self.read_pair(TMC_RWP, TMC_RWPHI)
    }

    fn write_read_ptr(&mut self, addr: u64) {
        self.unlock();
        self.write_pair(TMC_RRP, TMC_RRPHI, addr);
        self.lock();
    }
}
