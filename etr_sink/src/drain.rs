// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::dma::OwnedBuffer;
use crate::sink::{CapturedRegion, EtrSink, Mode};
use crate::Error;
use log::debug;

/// Exclusive access to the last continuous capture.
///
/// While this exists the sink won't start capturing or free the buffer.
/// Dropping it ends the read: capture resumes if the read interrupted it,
/// otherwise the buffer is freed.
pub struct TraceRead<'a> {
    sink: &'a EtrSink,
    buffer: Option<OwnedBuffer>,
    region: CapturedRegion,
}

impl EtrSink {
    /// Take a one-shot snapshot of the captured trace.
    ///
    /// Continuous capture is stopped for the duration of the read.
    pub fn begin_read(&self) -> Result<TraceRead<'_>, Error> {
        let mut inner = self.inner.lock();
        if inner.state.draining {
            return Err(Error::Busy);
        }

        let resume = match inner.state.mode {
            Mode::Streaming => return Err(Error::InvalidState(Mode::Streaming)),
            Mode::Continuous => {
                self.disable_locked(&mut inner);
                true
            }
            Mode::Disabled => false,
        };

        let region = inner.state.captured.ok_or(Error::NothingCaptured)?;
        let buffer = inner
            .state
            .hw_buffer
            .take()
            .ok_or(Error::NothingCaptured)?;
        inner.state.draining = true;
        inner.state.resume_after_read = resume;
        debug!(
            "{}: reading {:#x} captured bytes",
            self.name(),
            region.len
        );

        Ok(TraceRead {
            sink: self,
            buffer: Some(buffer),
            region,
        })
    }

    fn finish_read(&self, mut buffer: OwnedBuffer) {
        let mut inner = self.inner.lock();
        inner.state.draining = false;
        inner.state.captured = None;

        if std::mem::take(&mut inner.state.resume_after_read) {
            let paddr = self.arm(inner.hw.as_mut(), &mut buffer);
            inner.state.hw_buffer = Some(buffer);
            inner.state.armed = Some(paddr);
            inner.state.mode = Mode::Continuous;
            debug!("{}: read done, continuous capture resumed", self.name());
        } else {
            drop(inner);
            debug!("{}: read done", self.name());
            buffer.release();
        }
    }
}

impl TraceRead<'_> {
    fn buffer(&self) -> &OwnedBuffer {
        // Only `drop` takes the buffer out
        self.buffer.as_ref().expect("read already finished")
    }

    pub fn region(&self) -> CapturedRegion {
        self.region
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    /// The captured bytes in capture order, as the part up to the end of the
    /// buffer and the part that wrapped to its start.
    pub fn segments(&self) -> (&[u8], &[u8]) {
        let data = self.buffer().as_slice();
        let end = (self.region.offset + self.region.len).min(data.len());
        let first = &data[self.region.offset..end];
        let second = &data[..self.region.len - first.len()];
        (first, second)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let (first, second) = self.segments();
        [first, second].concat()
    }

    /// End the read. Same as dropping it.
    pub fn end(self) {
        drop(self)
    }
}

impl Drop for TraceRead<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.sink.finish_read(buffer);
        }
    }
}
