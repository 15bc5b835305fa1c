// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming capture: a consumer-owned session that the sink copies new
//! trace data out to whenever the consumer says data is available.

use crate::copy::{copy_span, plan_copy, OutputCursor, PagedOutput};
use crate::dma::OwnedBuffer;
use crate::sink::{EtrSink, Mode};
use crate::Error;
use barrier_packet::BARRIER_LEN;
use log::{debug, info, warn};

/// One streaming capture, from start to end.
///
/// The session owns both its hardware buffer and the consumer's output ring,
/// so neither can be freed while the other side still uses it.
pub struct StreamingSession {
    buffer: OwnedBuffer,
    output: PagedOutput,
    cursor: OutputCursor,
    snapshot: bool,
    /// Bytes placed since the cursor was last set
    run_bytes: u64,
    bytes_emitted: u64,
}

impl StreamingSession {
    pub fn output(&self) -> &PagedOutput {
        &self.output
    }

    pub fn cursor(&self) -> OutputCursor {
        self.cursor
    }

    /// Absolute output position of the next byte to be written
    pub fn head(&self) -> u64 {
        self.cursor.position(&self.output)
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn run_bytes(&self) -> u64 {
        self.run_bytes
    }

    /// Total bytes placed in the output over the whole session
    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    /// Bus address of the session's hardware buffer
    pub fn buffer_paddr(&self) -> u64 {
        self.buffer.paddr()
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("buffer", &self.buffer)
            .field("cursor", &self.cursor)
            .field("snapshot", &self.snapshot)
            .field("bytes_emitted", &self.bytes_emitted)
            .finish()
    }
}

/// How far the consumer's ring moved
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Bytes written by this notification
    Advance(u64),
    /// Snapshot sessions report where the cursor now is instead
    Head(u64),
}

/// Result of one data-available notification
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuxUpdate {
    /// Some trace data was lost and a barrier marks the gap
    pub truncated: bool,
    pub progress: Progress,
    pub copied: usize,
}

impl EtrSink {
    /// Create a session with a fresh hardware buffer and an output ring of
    /// `page_count` pages of `page_size` bytes.
    pub fn on_session_start(
        &self,
        page_count: usize,
        page_size: usize,
        snapshot: bool,
    ) -> Result<StreamingSession, Error> {
        let output = PagedOutput::new(page_count, page_size)?;
        // Truncation keeps an aligned tail that must have room for the barrier
        let min_capacity = BARRIER_LEN.max(self.config().rrp_alignment());
        if output.capacity() < min_capacity {
            return Err(Error::InvalidConfig(format!(
                "output ring of {:#x} bytes is smaller than {min_capacity:#x}",
                output.capacity()
            )));
        }
        let buffer = self.acquire(self.config().buffer_size)?;
        debug!(
            "{}: new {}session, {page_count} pages of {page_size:#x} bytes",
            self.name(),
            if snapshot { "snapshot " } else { "" }
        );
        Ok(StreamingSession {
            buffer,
            output,
            cursor: OutputCursor::default(),
            snapshot,
            run_bytes: 0,
            bytes_emitted: 0,
        })
    }

    /// Tell the session where in its ring the next run starts.
    pub fn on_session_set_cursor(&self, session: &mut StreamingSession, head: u64) {
        session.cursor = OutputCursor::from_head(head, &session.output);
        session.run_bytes = 0;

        let capturing = self.inner.lock().state.armed == Some(session.buffer.paddr());
        if !capturing {
            session.buffer.zero();
        }
    }

    /// Start capturing into the session's buffer.
    pub fn enable_streaming(&self, session: &mut StreamingSession) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state.draining {
            return Err(Error::Busy);
        }
        if inner.state.mode != Mode::Disabled {
            return Err(Error::InvalidState(inner.state.mode));
        }

        // Data left over from continuous capture can't be read once
        // streaming owns the unit.
        let stale = inner.state.hw_buffer.take();
        inner.state.captured = None;

        let paddr = self.arm(inner.hw.as_mut(), &mut session.buffer);
        inner.state.armed = Some(paddr);
        inner.state.mode = Mode::Streaming;
        drop(inner);

        if let Some(buffer) = stale {
            debug!("{}: dropping unread continuous capture", self.name());
            buffer.release();
        }
        info!("{}: streaming capture enabled", self.name());
        Ok(())
    }

    /// Copy whatever the unit captured since the last notification into the
    /// session's ring.
    ///
    /// Returns `None` if the sink is no longer capturing for this session,
    /// which happens when a notification races with a disable.
    pub fn on_data_available(&self, session: &mut StreamingSession) -> Option<AuxUpdate> {
        let paddr = session.buffer.paddr();
        let size = session.buffer.size();

        let plan = {
            let mut inner = self.inner.lock();
            if inner.state.mode != Mode::Streaming || inner.state.armed != Some(paddr) {
                debug!("{}: ignoring notification for an idle session", self.name());
                return None;
            }
            let ptrs = inner.hw.read_pointers();
            let plan = plan_copy(
                ptrs,
                paddr,
                size,
                session.output.capacity(),
                self.config().rrp_alignment(),
            );
            if let Some(read) = plan.new_read {
                inner.hw.write_read_ptr(read);
            }
            plan
        };

        if plan.truncated {
            warn!(
                "{}: trace data lost, keeping the newest {:#x} bytes",
                self.name(),
                plan.len
            );
        }

        let copied = copy_span(
            session.buffer.as_slice(),
            plan.start,
            plan.len,
            plan.truncated,
            &mut session.output,
            &mut session.cursor,
        );

        if copied > 0 {
            let mut inner = self.inner.lock();
            if inner.state.armed == Some(paddr) {
                inner
                    .hw
                    .write_read_ptr(paddr + ((plan.start + plan.len) % size) as u64);
            }
        }

        session.run_bytes += copied as u64;
        session.bytes_emitted += copied as u64;
        let progress = if session.snapshot {
            Progress::Head(session.head())
        } else {
            Progress::Advance(copied as u64)
        };
        Some(AuxUpdate {
            truncated: plan.truncated,
            progress,
            copied,
        })
    }

    /// Finish a session, stopping capture if it is still running into the
    /// session's buffer, then free the buffer.
    pub fn on_session_end(&self, session: StreamingSession) {
        {
            let mut inner = self.inner.lock();
            if inner.state.armed == Some(session.buffer.paddr()) {
                inner.hw.disarm_and_flush();
                inner.state.armed = None;
                inner.state.mode = Mode::Disabled;
            }
        }
        debug!(
            "{}: session ended after {:#x} bytes",
            self.name(),
            session.bytes_emitted
        );
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::sim::{HostDma, SimulatedTmc};
    use etr_regs::MemWidth;
    use std::sync::Arc;

    fn sink() -> (EtrSink, SimulatedTmc, Arc<HostDma>) {
        let dma = Arc::new(HostDma::new());
        let tmc = SimulatedTmc::new(dma.clone());
        let sink = EtrSink::new(
            SinkConfig::new("etr0", 4096, MemWidth::Bits32),
            Box::new(tmc.clone()),
            dma.clone(),
        )
        .unwrap();
        (sink, tmc, dma)
    }

    #[test]
    fn set_cursor_wraps_and_resets_run() {
        let (sink, tmc, _dma) = sink();
        let mut session = sink.on_session_start(4, 1024, false).unwrap();
        sink.enable_streaming(&mut session).unwrap();
        tmc.emit(&[3; 64]);
        sink.on_data_available(&mut session).unwrap();
        assert_eq!(session.run_bytes(), 64);

        sink.on_session_set_cursor(&mut session, 4096 + 1030);
        assert_eq!(session.cursor(), OutputCursor { page: 1, offset: 6 });
        assert_eq!(session.run_bytes(), 0);
        assert_eq!(session.bytes_emitted(), 64);
        sink.on_session_end(session);
    }

    #[test]
    fn successive_notifications_see_only_new_data() {
        let (sink, tmc, _dma) = sink();
        let mut session = sink.on_session_start(2, 4096, false).unwrap();
        sink.enable_streaming(&mut session).unwrap();

        tmc.emit(&[1; 100]);
        let first = sink.on_data_available(&mut session).unwrap();
        assert_eq!(first.progress, Progress::Advance(100));

        let none = sink.on_data_available(&mut session).unwrap();
        assert_eq!(none.copied, 0);

        tmc.emit(&[2; 50]);
        let second = sink.on_data_available(&mut session).unwrap();
        assert_eq!(second.copied, 50);
        assert_eq!(session.output().read_wrapping(100, 50), vec![2; 50]);
        sink.on_session_end(session);
    }

    #[test]
    fn snapshot_reports_head() {
        let (sink, tmc, _dma) = sink();
        let mut session = sink.on_session_start(2, 4096, true).unwrap();
        sink.on_session_set_cursor(&mut session, 8000);
        sink.enable_streaming(&mut session).unwrap();
        tmc.emit(&[9; 300]);

        let update = sink.on_data_available(&mut session).unwrap();
        assert_eq!(update.progress, Progress::Head((8000 + 300) % 8192));
        assert!(!update.truncated);
        sink.on_session_end(session);
    }

    #[test]
    fn output_too_small_for_a_barrier() {
        let (sink, tmc, dma) = sink();
        assert!(matches!(
            sink.on_session_start(1, 8, false),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(dma.stats().allocations, 0);

        // The smallest accepted ring still gets a whole barrier on overflow
        let mut session = sink.on_session_start(2, 8, false).unwrap();
        sink.enable_streaming(&mut session).unwrap();
        tmc.emit(&[0x55; 100]);
        let update = sink.on_data_available(&mut session).unwrap();
        assert!(update.truncated);
        assert_eq!(update.copied, BARRIER_LEN);
        assert!(barrier_packet::starts_with_barrier(
            &session.output().read_wrapping(0, BARRIER_LEN)
        ));
        sink.on_session_end(session);
    }

    #[test]
    fn late_notification_is_ignored() {
        let (sink, tmc, _dma) = sink();
        let mut session = sink.on_session_start(1, 4096, false).unwrap();
        sink.enable_streaming(&mut session).unwrap();
        tmc.emit(&[1; 10]);
        sink.disable().unwrap();

        assert_eq!(sink.on_data_available(&mut session), None);
        assert_eq!(session.bytes_emitted(), 0);
        sink.on_session_end(session);
    }

    #[test]
    fn session_end_stops_capture_and_frees() {
        let (sink, tmc, dma) = sink();
        let mut session = sink.on_session_start(1, 4096, false).unwrap();
        sink.enable_streaming(&mut session).unwrap();
        sink.on_session_end(session);

        assert_eq!(sink.mode(), Mode::Disabled);
        assert!(!tmc.is_armed());
        assert_eq!(dma.stats().live_bytes, 0);
        assert_eq!(dma.stats().frees, 1);
    }
}
