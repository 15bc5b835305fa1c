// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the tracer hardware and the DMA allocator.
//!
//! These let the sink run without a device: [`HostDma`] hands out heap
//! memory under made-up bus addresses, [`SimulatedTmc`] writes trace bytes
//! into it the way the unit's DMA engine would, and [`MemRegisters`] is a
//! register file for checking what [`crate::mmio::MmioTmc`] programs.

use crate::dma::{DmaAllocator, DmaRegion};
use crate::hw::{ArmFlags, TraceSinkHw};
use crate::mmio::RegisterIo;
use etr_regs::{Ffcr, Sts, TMC_FFCR, TMC_STS};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// First bus address handed out by [`HostDma`]
pub const HOST_DMA_BASE: u64 = 0x8000_0000;

const HOST_PAGE: u64 = 0x1000;

/// Allocation counters, for checking buffer lifetimes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DmaStats {
    pub allocations: usize,
    pub frees: usize,
    /// Frees of regions this allocator doesn't know about
    pub bad_frees: usize,
    pub live_bytes: usize,
}

struct LiveRegion {
    // Address of a leaked `Box<[u8]>`
    vaddr: usize,
    size: usize,
}

#[derive(Default)]
struct HostDmaInner {
    live: BTreeMap<u64, LiveRegion>,
    next_bus: u64,
    limit: Option<usize>,
    fail: bool,
    stats: DmaStats,
}

/// Heap-backed [`DmaAllocator`].
pub struct HostDma {
    inner: Mutex<HostDmaInner>,
}

impl Default for HostDma {
    fn default() -> Self {
        HostDma::new()
    }
}

impl HostDma {
    pub fn new() -> HostDma {
        HostDma {
            inner: Mutex::new(HostDmaInner {
                next_bus: HOST_DMA_BASE,
                ..Default::default()
            }),
        }
    }

    /// An allocator that refuses to have more than `bytes` outstanding.
    pub fn with_limit(bytes: usize) -> HostDma {
        let dma = HostDma::new();
        dma.inner.lock().limit = Some(bytes);
        dma
    }

    /// Make every allocation fail until called again with `false`.
    pub fn fail_allocations(&self, fail: bool) {
        self.inner.lock().fail = fail;
    }

    pub fn stats(&self) -> DmaStats {
        self.inner.lock().stats
    }

    /// Write `data` at bus address `paddr`, the way a bus master would.
    /// Returns false, writing nothing, unless the whole range lies in one
    /// live region.
    pub fn bus_write(&self, paddr: u64, data: &[u8]) -> bool {
        let inner = self.inner.lock();
        match Self::locate(&inner, paddr, data.len()) {
            Some(ptr) => {
                // SAFETY: `locate` checked the range is inside a live region
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                true
            }
            None => {
                warn!("bus write of {} bytes to unmapped {paddr:#x}", data.len());
                false
            }
        }
    }

    /// Read `len` bytes at bus address `paddr`.
    pub fn bus_read(&self, paddr: u64, len: usize) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let ptr = Self::locate(&inner, paddr, len)?;
        // SAFETY: as in `bus_write`
        Some(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    fn locate(inner: &HostDmaInner, paddr: u64, len: usize) -> Option<*mut u8> {
        let (&base, region) = inner.live.range(..=paddr).next_back()?;
        let offset = usize::try_from(paddr - base).ok()?;
        if offset.checked_add(len)? > region.size {
            return None;
        }
        Some((region.vaddr + offset) as *mut u8)
    }
}

impl DmaAllocator for HostDma {
    fn allocate(&self, size: usize) -> Option<DmaRegion> {
        let mut inner = self.inner.lock();
        if inner.fail || size == 0 {
            return None;
        }
        if let Some(limit) = inner.limit {
            if inner.stats.live_bytes + size > limit {
                debug!("host DMA limit of {limit:#x} bytes reached");
                return None;
            }
        }

        let memory = vec![0u8; size].into_boxed_slice();
        let vaddr = Box::into_raw(memory).cast::<u8>();
        let paddr = inner.next_bus;
        // Leave an unmapped page between regions so overruns don't land in
        // a neighbour.
        inner.next_bus += (size as u64).div_ceil(HOST_PAGE) * HOST_PAGE + HOST_PAGE;
        inner.live.insert(
            paddr,
            LiveRegion {
                vaddr: vaddr as usize,
                size,
            },
        );
        inner.stats.allocations += 1;
        inner.stats.live_bytes += size;

        // SAFETY: the box stays leaked until `free` gets this region back
        let vaddr = NonNull::new(vaddr)?;
        Some(unsafe { DmaRegion::from_raw_parts(vaddr, paddr, size) })
    }

    fn free(&self, region: DmaRegion) {
        let mut inner = self.inner.lock();
        match inner.live.remove(&region.paddr()) {
            Some(live) if live.size == region.size() && live.vaddr == region.vaddr().as_ptr() as usize => {
                inner.stats.frees += 1;
                inner.stats.live_bytes -= live.size;
                // SAFETY: this is the box leaked in `allocate`
                drop(unsafe { reclaim(live) });
            }
            Some(live) => {
                error!("free of {:#x} does not match its allocation", region.paddr());
                inner.stats.bad_frees += 1;
                inner.live.insert(region.paddr(), live);
            }
            None => {
                error!("free of unknown region {:#x}", region.paddr());
                inner.stats.bad_frees += 1;
            }
        }
    }
}

unsafe fn reclaim(live: LiveRegion) -> Box<[u8]> {
    Box::from_raw(std::ptr::slice_from_raw_parts_mut(
        live.vaddr as *mut u8,
        live.size,
    ))
}

impl Drop for HostDma {
    fn drop(&mut self) {
        for (_, live) in std::mem::take(&mut self.inner.get_mut().live) {
            // SAFETY: nothing can reach the region once the allocator is gone
            drop(unsafe { reclaim(live) });
        }
    }
}

#[derive(Default)]
struct SimState {
    armed: bool,
    base: u64,
    size: usize,
    // Offsets into the buffer
    rrp: usize,
    rwp: usize,
    // Bytes written since the read pointer was last moved, capped at `size`
    unread: usize,
    full: bool,
    flags: Option<ArmFlags>,
    arm_count: usize,
    disarm_count: usize,
    rrp_writes: Vec<u64>,
}

/// A tracer unit simulated in memory.
///
/// Clones share one unit, so a test can keep a handle while the sink owns
/// another.
#[derive(Clone)]
pub struct SimulatedTmc {
    dma: Arc<HostDma>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTmc {
    pub fn new(dma: Arc<HostDma>) -> SimulatedTmc {
        SimulatedTmc {
            dma,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Capture `data`: write it at the write pointer, wrapping at the end of
    /// the buffer. Returns how many bytes were captured, which is zero if
    /// the unit isn't armed.
    pub fn emit(&self, data: &[u8]) -> usize {
        let mut st = self.state.lock();
        if !st.armed || st.size == 0 {
            return 0;
        }

        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(st.size - st.rwp);
            self.dma.bus_write(st.base + st.rwp as u64, &rest[..n]);
            st.rwp = (st.rwp + n) % st.size;
            rest = &rest[n..];
        }

        if st.unread + data.len() >= st.size {
            st.full = true;
        }
        st.unread = (st.unread + data.len()).min(st.size);
        data.len()
    }

    /// Put the pointers somewhere specific, as offsets into the buffer.
    pub fn set_pointers(&self, read: usize, write: usize, full: bool) {
        let mut st = self.state.lock();
        let size = st.size.max(1);
        st.rrp = read % size;
        st.rwp = write % size;
        st.full = full;
        st.unread = if full {
            st.size
        } else {
            (st.rwp + size - st.rrp) % size
        };
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Bus address of the buffer most recently armed
    pub fn armed_base(&self) -> Option<u64> {
        let st = self.state.lock();
        st.flags.map(|_| st.base)
    }

    pub fn last_flags(&self) -> Option<ArmFlags> {
        self.state.lock().flags
    }

    pub fn arm_count(&self) -> usize {
        self.state.lock().arm_count
    }

    pub fn disarm_count(&self) -> usize {
        self.state.lock().disarm_count
    }

    /// Every value written to the read pointer, oldest first
    pub fn rrp_writes(&self) -> Vec<u64> {
        self.state.lock().rrp_writes.clone()
    }
}

impl TraceSinkHw for SimulatedTmc {
    fn arm(&mut self, base: u64, size: usize, flags: ArmFlags) {
        let mut st = self.state.lock();
        st.armed = true;
        st.base = base;
        st.size = size;
        st.rrp = 0;
        st.rwp = 0;
        st.unread = 0;
        st.full = false;
        st.flags = Some(flags);
        st.arm_count += 1;
    }

    fn disarm_and_flush(&mut self) {
        let mut st = self.state.lock();
        st.armed = false;
        st.disarm_count += 1;
    }

    fn read_status(&mut self) -> bool {
        self.state.lock().full
    }

    fn read_read_ptr(&mut self) -> u64 {
        let st = self.state.lock();
        st.base + st.rrp as u64
    }

    fn read_write_ptr(&mut self) -> u64 {
        let st = self.state.lock();
        st.base + st.rwp as u64
    }

    fn write_read_ptr(&mut self, addr: u64) {
        let mut st = self.state.lock();
        st.rrp_writes.push(addr);
        let offset = addr.wrapping_sub(st.base);
        if st.size == 0 || offset >= st.size as u64 {
            warn!("read pointer {addr:#x} is outside the buffer");
            return;
        }
        st.rrp = offset as usize;
        st.unread = (st.rwp + st.size - st.rrp) % st.size;
        st.full = false;
    }
}

/// A register file backed by a map.
///
/// TMCReady always reads as set, and a manual flush completes as soon as it
/// is requested.
pub struct MemRegisters {
    values: BTreeMap<u32, u32>,
    writes: Vec<(u32, u32)>,
}

impl Default for MemRegisters {
    fn default() -> Self {
        MemRegisters::new()
    }
}

impl MemRegisters {
    pub fn new() -> MemRegisters {
        let mut sts = Sts::default();
        sts.set_tmc_ready(true);

        let mut values = BTreeMap::new();
        values.insert(TMC_STS, u32::from(sts));
        MemRegisters {
            values,
            writes: Vec::new(),
        }
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.values.get(&offset).copied().unwrap_or(0)
    }

    /// Set a register without recording a write
    pub fn set(&mut self, offset: u32, value: u32) {
        self.values.insert(offset, value);
    }

    /// Every write, in order, as (offset, value)
    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl RegisterIo for MemRegisters {
    fn read32(&self, offset: u32) -> u32 {
        self.get(offset)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        self.writes.push((offset, value));
        let stored = if offset == TMC_FFCR {
            let mut ffcr = Ffcr(value);
            ffcr.set_flush_man(false);
            ffcr.into()
        } else {
            value
        };
        self.values.insert(offset, stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_addresses_do_not_overlap() {
        let dma = HostDma::new();
        let a = dma.allocate(0x1800).unwrap();
        let b = dma.allocate(0x1000).unwrap();
        assert_eq!(a.paddr(), HOST_DMA_BASE);
        assert!(b.paddr() >= a.paddr() + 0x2000);

        assert!(dma.bus_write(a.paddr() + 0x17fe, &[0xaa, 0xbb]));
        assert!(!dma.bus_write(a.paddr() + 0x17ff, &[0xaa, 0xbb]));
        assert_eq!(dma.bus_read(a.paddr() + 0x17fe, 2), Some(vec![0xaa, 0xbb]));

        dma.free(a);
        dma.free(b);
        assert_eq!(dma.stats().frees, 2);
    }

    #[test]
    fn failing_allocator() {
        let dma = HostDma::new();
        dma.fail_allocations(true);
        assert!(dma.allocate(0x1000).is_none());
        dma.fail_allocations(false);
        let region = dma.allocate(0x1000).unwrap();
        dma.free(region);
    }

    #[test]
    fn simulated_unit_wraps_and_reports_full() {
        let dma = Arc::new(HostDma::new());
        let region = dma.allocate(64).unwrap();
        let base = region.paddr();

        let mut tmc = SimulatedTmc::new(dma.clone());
        assert_eq!(tmc.emit(&[1; 8]), 0, "nothing is captured while disarmed");

        tmc.arm(base, 64, ArmFlags::circular(0));
        tmc.emit(&[1; 40]);
        let ptrs = tmc.read_pointers();
        assert_eq!((ptrs.read, ptrs.write, ptrs.full), (base, base + 40, false));

        tmc.emit(&[2; 30]);
        let ptrs = tmc.read_pointers();
        assert_eq!(ptrs.write, base + 6);
        assert!(ptrs.full);
        assert_eq!(dma.bus_read(base, 8).unwrap(), vec![2, 2, 2, 2, 2, 2, 1, 1]);

        tmc.write_read_ptr(base + 6);
        assert!(!tmc.read_status());
        assert_eq!(tmc.rrp_writes(), vec![base + 6]);

        dma.free(region);
    }

    #[test]
    fn mem_registers_complete_flushes() {
        let mut regs = MemRegisters::new();
        let mut ffcr = Ffcr::default();
        ffcr.set_flush_man(true);
        regs.write32(TMC_FFCR, ffcr.into());
        assert!(!Ffcr(regs.read32(TMC_FFCR)).flush_man());
        assert_eq!(regs.writes_to(TMC_FFCR), vec![0x40]);
        assert!(Sts(regs.read32(TMC_STS)).tmc_ready());
    }
}
