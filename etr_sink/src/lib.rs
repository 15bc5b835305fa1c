// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffer management for a CoreSight ETR trace sink.
//!
//! An [`EtrSink`] owns the state of one hardware tracer unit. Trace data can
//! be collected in one of two mutually exclusive ways:
//!
//! - **continuous** capture, where the unit records into a buffer owned by
//!   the sink and a tool later takes a one-shot snapshot with
//!   [`EtrSink::begin_read`];
//! - **streaming** capture, where a consumer opens a [`StreamingSession`]
//!   with its own buffer and the sink copies new data into the consumer's
//!   paged ring on every [`EtrSink::on_data_available`].

pub mod config;
pub mod copy;
pub mod dma;
pub mod drain;
pub mod hw;
pub mod mmio;
pub mod registry;
pub mod session;
pub mod sim;
pub mod sink;

pub use config::{Capabilities, SinkConfig};
pub use copy::{OutputCursor, PagedOutput};
pub use dma::{DmaAllocator, DmaRegion, OwnedBuffer};
pub use drain::TraceRead;
pub use hw::{ArmFlags, HwPointers, TraceSinkHw};
pub use registry::SinkRegistry;
pub use session::{AuxUpdate, Progress, StreamingSession};
pub use sink::{CapturedRegion, EtrSink, Mode};

/// Errors returned by sink operations.
///
/// None of these leave the sink in an unusable state; the operation that
/// failed simply had no effect.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A synchronous read currently owns the trace buffer, or another read is
    /// already pending. Retry once it has finished.
    #[error("trace sink is busy with a pending read")]
    Busy,

    /// The requested transition isn't valid from the mode the sink is in.
    #[error("operation not valid while the sink is {0}")]
    InvalidState(Mode),

    /// The DMA allocator couldn't provide a buffer; capture does not start.
    #[error("could not allocate {0} bytes of DMA memory")]
    OutOfMemory(usize),

    /// A read was requested but there is no captured data, either because
    /// nothing was ever captured or because it has been read already.
    #[error("no trace data has been captured")]
    NothingCaptured,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a sink named {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("could not parse sink configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
