// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! A barrier packet marks a discontinuity in captured trace data
//!
//! When the trace sink has to throw data away (the hardware buffer wrapped
//! over unread data, or the consumer's ring had less room than the hardware
//! buffer held), it overwrites the first bytes of the data it does keep with
//! this packet.  Trace decoders treat it as "synchronization lost here" and
//! resynchronize on the next alignment packet rather than decoding garbage
//! across the gap.
//!
//! This crate only defines the constants so that the sink and any downstream
//! decoder agree on them.  It has no dependencies and works in `no_std`.
#![cfg_attr(not(test), no_std)]

/// One 32-bit word of the barrier, as it appears in a formatted frame
pub const BARRIER_WORD: u32 = 0x7fff_ffff;

/// Number of barrier words in a barrier packet
pub const BARRIER_WORDS: usize = 4;

/// Length of a barrier packet in bytes
pub const BARRIER_LEN: usize = BARRIER_WORDS * 4;

/// The barrier packet as it is laid out in memory (little-endian words)
pub const BARRIER_PACKET: [u8; BARRIER_LEN] = [
    0xff, 0xff, 0xff, 0x7f, //
    0xff, 0xff, 0xff, 0x7f, //
    0xff, 0xff, 0xff, 0x7f, //
    0xff, 0xff, 0xff, 0x7f, //
];

/// Returns true if `bytes` starts with a complete barrier packet
pub fn starts_with_barrier(bytes: &[u8]) -> bool {
    bytes.starts_with(&BARRIER_PACKET)
}
