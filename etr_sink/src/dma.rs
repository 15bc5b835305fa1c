// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA-capable trace buffers and who owns them.

use crate::Error;
use log::debug;
use std::ptr::NonNull;
use std::sync::Arc;

/// A physically contiguous block of memory the tracer can write into.
#[derive(Debug)]
pub struct DmaRegion {
    vaddr: NonNull<u8>,
    paddr: u64,
    size: usize,
}

// A region is plain memory; whoever holds it may hand it to another thread.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `vaddr` must be valid for reads and writes of `size` bytes until the
    /// region is handed back to the allocator that produced it, and `paddr`
    /// must be the bus address the tracer uses for the same memory.
    pub unsafe fn from_raw_parts(vaddr: NonNull<u8>, paddr: u64, size: usize) -> DmaRegion {
        DmaRegion { vaddr, paddr, size }
    }

    pub fn vaddr(&self) -> NonNull<u8> {
        self.vaddr
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Source of DMA-capable memory.
///
/// `allocate` may block, so the sink never calls it with its lock held.
pub trait DmaAllocator: Send + Sync {
    /// Returns `None` when no memory is available.
    fn allocate(&self, size: usize) -> Option<DmaRegion>;

    fn free(&self, region: DmaRegion);
}

/// A trace buffer with exactly one owner.
///
/// The buffer goes back to its allocator when this is dropped, so it can be
/// freed at most once and can't be touched afterwards. Moving it between the
/// sink and a streaming session moves the only handle to the memory.
pub struct OwnedBuffer {
    region: Option<DmaRegion>,
    alloc: Arc<dyn DmaAllocator>,
}

impl OwnedBuffer {
    /// Allocate a buffer of `size` bytes.
    pub fn acquire(alloc: &Arc<dyn DmaAllocator>, size: usize) -> Result<OwnedBuffer, Error> {
        let region = alloc.allocate(size).ok_or(Error::OutOfMemory(size))?;
        debug!(
            "allocated {:#x} byte trace buffer at {:#x}",
            region.size(),
            region.paddr()
        );

        Ok(OwnedBuffer {
            region: Some(region),
            alloc: alloc.clone(),
        })
    }

    fn region(&self) -> &DmaRegion {
        // Only `drop` takes the region out
        self.region.as_ref().expect("buffer used after release")
    }

    pub fn paddr(&self) -> u64 {
        self.region().paddr()
    }

    pub fn size(&self) -> usize {
        self.region().size()
    }

    /// True if `addr` is a bus address inside the buffer
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.paddr() && addr - self.paddr() < self.size() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        let region = self.region();
        // SAFETY: `region` is valid for `size` bytes while we own it
        unsafe { std::slice::from_raw_parts(region.vaddr().as_ptr(), region.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let region = self.region();
        // SAFETY: as above, and `&mut self` makes this the only view
        unsafe { std::slice::from_raw_parts_mut(region.vaddr().as_ptr(), region.size()) }
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Give the memory back to the allocator.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            debug!("releasing trace buffer at {:#x}", region.paddr());
            self.alloc.free(region);
        }
    }
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::HostDma;

    #[test]
    fn buffer_is_freed_once_on_drop() {
        let dma = Arc::new(HostDma::new());
        let alloc: Arc<dyn DmaAllocator> = dma.clone();

        let mut buf = OwnedBuffer::acquire(&alloc, 0x2000).unwrap();
        assert_eq!(buf.size(), 0x2000);
        assert!(buf.contains(buf.paddr() + 0x1fff));
        assert!(!buf.contains(buf.paddr() + 0x2000));

        buf.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf.as_slice()[..4], &[1, 2, 3, 4]);
        buf.zero();
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.release();
        let stats = dma.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.bad_frees, 0);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn exhausted_allocator_reports_oom() {
        let dma = Arc::new(HostDma::with_limit(0x1000));
        let alloc: Arc<dyn DmaAllocator> = dma.clone();

        let _held = OwnedBuffer::acquire(&alloc, 0x1000).unwrap();
        assert!(matches!(
            OwnedBuffer::acquire(&alloc, 0x1000),
            Err(Error::OutOfMemory(0x1000))
        ));
    }
}
