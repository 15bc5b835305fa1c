// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{check_buffer_size, SinkConfig};
use crate::copy::barrier_packet;
use crate::dma::{DmaAllocator, OwnedBuffer};
use crate::hw::{ArmFlags, TraceSinkHw};
use crate::Error;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Who the sink is currently capturing for, if anyone
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    Disabled,
    /// Capturing into the sink's own buffer for later synchronous reads
    Continuous,
    /// Capturing into a streaming session's buffer
    Streaming,
}

/// The span of the sink's buffer holding the last continuous capture,
/// oldest byte first. It may wrap past the end of the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CapturedRegion {
    pub offset: usize,
    pub len: usize,
}

pub(crate) struct SinkState {
    pub mode: Mode,
    /// Buffer used by continuous capture. Kept across disable so the data
    /// can still be read.
    pub hw_buffer: Option<OwnedBuffer>,
    pub captured: Option<CapturedRegion>,
    /// A synchronous read holds `hw_buffer`
    pub draining: bool,
    /// The pending read interrupted continuous capture
    pub resume_after_read: bool,
    /// Bus address of the buffer the unit is capturing into
    pub armed: Option<u64>,
}

pub(crate) struct Inner {
    pub state: SinkState,
    pub hw: Box<dyn TraceSinkHw>,
}

/// Buffer manager for one tracer unit.
///
/// All state and all register programming sit behind one lock, which is
/// never held across an allocation, a free or a bulk copy.
pub struct EtrSink {
    config: SinkConfig,
    alloc: Arc<dyn DmaAllocator>,
    pub(crate) inner: Mutex<Inner>,
}

impl EtrSink {
    pub fn new(
        config: SinkConfig,
        hw: Box<dyn TraceSinkHw>,
        alloc: Arc<dyn DmaAllocator>,
    ) -> Result<EtrSink, Error> {
        config.validate()?;
        Ok(EtrSink {
            config,
            alloc,
            inner: Mutex::new(Inner {
                state: SinkState {
                    mode: Mode::Disabled,
                    hw_buffer: None,
                    captured: None,
                    draining: false,
                    resume_after_read: false,
                    armed: None,
                },
                hw,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().state.mode
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().state.draining
    }

    pub fn captured_region(&self) -> Option<CapturedRegion> {
        self.inner.lock().state.captured
    }

    /// True if the sink has a continuous-capture buffer, either in use or
    /// held over for reading
    pub fn holds_buffer(&self) -> bool {
        self.inner.lock().state.hw_buffer.is_some()
    }

    /// Allocate a trace buffer. Must not be called with the lock held.
    pub fn acquire(&self, size: usize) -> Result<OwnedBuffer, Error> {
        check_buffer_size(size)?;
        OwnedBuffer::acquire(&self.alloc, size)
    }

    /// Zero `buffer` and start the unit capturing into it
    pub(crate) fn arm(&self, hw: &mut dyn TraceSinkHw, buffer: &mut OwnedBuffer) -> u64 {
        buffer.zero();
        hw.arm(
            buffer.paddr(),
            buffer.size(),
            ArmFlags::circular(self.config.trigger_counter),
        );
        buffer.paddr()
    }

    /// Start continuous capture, or join the one already running.
    pub fn enable_continuous(&self) -> Result<(), Error> {
        let mut fresh: Option<OwnedBuffer> = None;
        loop {
            let mut inner = self.inner.lock();
            if inner.state.draining {
                return Err(Error::Busy);
            }
            match inner.state.mode {
                Mode::Continuous => {
                    debug!("{}: continuous capture already running", self.name());
                    return Ok(());
                }
                Mode::Streaming => return Err(Error::InvalidState(Mode::Streaming)),
                Mode::Disabled => {}
            }

            let mut buffer = match inner.state.hw_buffer.take() {
                Some(held) => held,
                None => match fresh.take() {
                    Some(buffer) => buffer,
                    None => {
                        drop(inner);
                        fresh = Some(self.acquire(self.config.buffer_size)?);
                        continue;
                    }
                },
            };

            let paddr = self.arm(inner.hw.as_mut(), &mut buffer);
            inner.state.hw_buffer = Some(buffer);
            inner.state.captured = None;
            inner.state.armed = Some(paddr);
            inner.state.mode = Mode::Continuous;
            drop(inner);

            info!("{}: continuous capture enabled", self.name());
            if let Some(unused) = fresh {
                debug!("{}: a buffer was already held, dropping the new one", self.name());
                unused.release();
            }
            return Ok(());
        }
    }

    /// Stop capturing. Leaving continuous mode keeps the buffer and records
    /// what it holds so it can be read.
    pub fn disable(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state.draining {
            // The read has already stopped the unit
            debug!("{}: disable ignored while a read is pending", self.name());
            return Ok(());
        }

        match inner.state.mode {
            Mode::Disabled => {}
            Mode::Continuous => self.disable_locked(&mut inner),
            Mode::Streaming => {
                inner.hw.disarm_and_flush();
                inner.state.armed = None;
                inner.state.mode = Mode::Disabled;
            }
        }
        info!("{}: disabled", self.name());
        Ok(())
    }

    /// Stop continuous capture and record the span that was captured.
    pub(crate) fn disable_locked(&self, inner: &mut Inner) {
        inner.hw.disarm_and_flush();
        let ptrs = inner.hw.read_pointers();
        inner.state.armed = None;
        inner.state.mode = Mode::Disabled;

        let buffer = match inner.state.hw_buffer.as_mut() {
            Some(buffer) => buffer,
            None => return,
        };
        let size = buffer.size();
        let write = (ptrs.write.wrapping_sub(buffer.paddr()) % size as u64) as usize;

        let region = if ptrs.full {
            // The unit wrapped, so the oldest byte is at the write pointer
            // and whatever preceded it was overwritten.
            let data = buffer.as_mut_slice();
            for (i, b) in barrier_packet().iter().enumerate() {
                data[(write + i) % size] = *b;
            }
            CapturedRegion {
                offset: write,
                len: size,
            }
        } else {
            CapturedRegion {
                offset: 0,
                len: write,
            }
        };
        debug!(
            "{}: captured {:#x} bytes at offset {:#x}{}",
            self.name(),
            region.len,
            region.offset,
            if ptrs.full { " (wrapped)" } else { "" }
        );
        inner.state.captured = Some(region);
    }

    /// Stop capture and give back the continuous-capture buffer.
    ///
    /// Fails with [`Error::Busy`] while a read holds the buffer. A streaming
    /// session keeps its own buffer until it ends.
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state.draining {
            return Err(Error::Busy);
        }
        if inner.state.armed.take().is_some() {
            inner.hw.disarm_and_flush();
        }
        inner.state.mode = Mode::Disabled;
        inner.state.captured = None;
        let held = inner.state.hw_buffer.take();
        drop(inner);

        if let Some(buffer) = held {
            buffer.release();
        }
        debug!("{}: shut down", self.name());
        Ok(())
    }
}

impl Drop for EtrSink {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state.armed.take().is_some() {
            inner.hw.disarm_and_flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{HostDma, SimulatedTmc};
    use barrier_packet::starts_with_barrier;
    use etr_regs::MemWidth;

    fn sink(size: usize) -> (EtrSink, SimulatedTmc, Arc<HostDma>) {
        let dma = Arc::new(HostDma::new());
        let tmc = SimulatedTmc::new(dma.clone());
        let sink = EtrSink::new(
            SinkConfig::new("etr0", size, MemWidth::Bits64),
            Box::new(tmc.clone()),
            dma.clone(),
        )
        .unwrap();
        (sink, tmc, dma)
    }

    #[test]
    fn mode_names() {
        assert_eq!(Mode::Streaming.to_string(), "streaming");
        assert_eq!("continuous".parse::<Mode>(), Ok(Mode::Continuous));
    }

    #[test]
    fn continuous_enable_is_shared() {
        let (sink, tmc, dma) = sink(4096);
        sink.enable_continuous().unwrap();
        sink.enable_continuous().unwrap();
        assert_eq!(sink.mode(), Mode::Continuous);
        assert_eq!(tmc.arm_count(), 1);
        assert_eq!(dma.stats().allocations, 1);
    }

    #[test]
    fn disable_records_linear_span() {
        let (sink, tmc, _dma) = sink(4096);
        sink.enable_continuous().unwrap();
        tmc.emit(&[7; 300]);
        sink.disable().unwrap();

        assert_eq!(sink.mode(), Mode::Disabled);
        assert_eq!(tmc.disarm_count(), 1);
        assert_eq!(
            sink.captured_region(),
            Some(CapturedRegion { offset: 0, len: 300 })
        );
        assert!(sink.holds_buffer());
    }

    #[test]
    fn disable_after_wrap_marks_the_gap() {
        let (sink, tmc, _dma) = sink(4096);
        sink.enable_continuous().unwrap();
        tmc.emit(&[1; 4000]);
        tmc.emit(&[2; 200]);
        sink.disable().unwrap();

        let region = sink.captured_region().unwrap();
        assert_eq!(region, CapturedRegion { offset: 104, len: 4096 });

        let inner = sink.inner.lock();
        let data = inner.state.hw_buffer.as_ref().unwrap().as_slice();
        assert!(starts_with_barrier(&data[104..]));
    }

    #[test]
    fn disable_when_disabled_is_a_no_op() {
        let (sink, tmc, _dma) = sink(4096);
        sink.disable().unwrap();
        assert_eq!(tmc.disarm_count(), 0);
        assert_eq!(sink.captured_region(), None);
    }

    #[test]
    fn failed_allocation_leaves_sink_disabled() {
        let (sink, tmc, dma) = sink(4096);
        dma.fail_allocations(true);
        assert!(matches!(sink.enable_continuous(), Err(Error::OutOfMemory(4096))));
        assert_eq!(sink.mode(), Mode::Disabled);
        assert!(!tmc.is_armed());
    }

    #[test]
    fn acquire_checks_size() {
        let (sink, _tmc, _dma) = sink(4096);
        assert!(matches!(sink.acquire(0), Err(Error::InvalidConfig(_))));
        assert!(matches!(sink.acquire(1000), Err(Error::InvalidConfig(_))));
        assert!(sink.acquire(8192).is_ok());
    }

    #[test]
    fn shutdown_releases_everything() {
        let (sink, tmc, dma) = sink(4096);
        sink.enable_continuous().unwrap();
        sink.shutdown().unwrap();
        assert!(!tmc.is_armed());
        assert!(!sink.holds_buffer());
        assert_eq!(dma.stats().live_bytes, 0);
    }

    #[test]
    fn drop_disarms() {
        let (sink, tmc, dma) = sink(4096);
        sink.enable_continuous().unwrap();
        drop(sink);
        assert!(!tmc.is_armed());
        assert_eq!(dma.stats().frees, 1);
    }
}
