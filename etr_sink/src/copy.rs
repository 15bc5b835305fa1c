// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving trace data from the hardware ring into the consumer's paged ring.
//!
//! Both sides wrap independently: the hardware buffer is one linear block
//! that the unit wraps at its end, and the output is a ring of fixed-size
//! pages. Every chunk copied is bounded by whichever boundary comes first.

use crate::hw::HwPointers;
use crate::Error;
use barrier_packet::{BARRIER_LEN, BARRIER_WORD, BARRIER_WORDS};
use byteorder::{ByteOrder, LittleEndian};

/// The consumer's output ring: `page_count` pages of `page_size` bytes.
pub struct PagedOutput {
    pages: Vec<Box<[u8]>>,
    page_size: usize,
}

impl PagedOutput {
    /// `page_size` must be a non-zero multiple of 4 so barrier words never
    /// straddle a page.
    pub fn new(page_count: usize, page_size: usize) -> Result<PagedOutput, Error> {
        if page_count == 0 {
            return Err(Error::InvalidConfig("output ring has no pages".to_string()));
        }
        if page_size == 0 || page_size % 4 != 0 {
            return Err(Error::InvalidConfig(format!(
                "output page size {page_size} is not a non-zero multiple of 4"
            )));
        }
        page_count.checked_mul(page_size).ok_or_else(|| {
            Error::InvalidConfig(format!("{page_count} pages of {page_size} bytes overflows"))
        })?;

        Ok(PagedOutput {
            pages: (0..page_count)
                .map(|_| vec![0u8; page_size].into_boxed_slice())
                .collect(),
            page_size,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total bytes the ring holds
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.page_size
    }

    pub fn page(&self, index: usize) -> &[u8] {
        &self.pages[index]
    }

    /// Copy `len` bytes out of the ring starting at absolute position `head`,
    /// wrapping at the end.
    pub fn read_wrapping(&self, head: u64, len: usize) -> Vec<u8> {
        let mut cursor = OutputCursor::from_head(head, self);
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let page = &self.pages[cursor.page][cursor.offset..];
            let n = page.len().min(len - out.len());
            out.extend_from_slice(&page[..n]);
            cursor.advance(n, self);
        }
        out
    }

    /// Write `bytes` at `cursor`, moving the cursor past them.
    fn write(&mut self, cursor: &mut OutputCursor, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let page = &mut self.pages[cursor.page][cursor.offset..];
            let n = page.len().min(bytes.len());
            page[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            cursor.advance(n, self);
        }
    }
}

/// Write position in a [`PagedOutput`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputCursor {
    pub page: usize,
    pub offset: usize,
}

impl OutputCursor {
    /// Split an absolute head position, taken modulo the ring capacity,
    /// into a page index and offset.
    pub fn from_head(head: u64, out: &PagedOutput) -> OutputCursor {
        let pos = (head % out.capacity() as u64) as usize;
        OutputCursor {
            page: pos / out.page_size,
            offset: pos % out.page_size,
        }
    }

    /// Absolute position within the ring
    pub fn position(&self, out: &PagedOutput) -> u64 {
        (self.page * out.page_size + self.offset) as u64
    }

    pub fn advance(&mut self, n: usize, out: &PagedOutput) {
        let pos = self.page * out.page_size + self.offset + n;
        *self = OutputCursor::from_head(pos as u64, out);
    }
}

/// Bytes from `read` forward to `write` in a ring of `size` bytes
pub fn circular_distance(write: usize, read: usize, size: usize) -> usize {
    (write + size - read) % size
}

pub fn align_down(value: usize, alignment: usize) -> usize {
    value - value % alignment
}

/// Which part of the hardware buffer one notification should copy
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CopyPlan {
    /// Offset of the oldest byte to copy
    pub start: usize,
    pub len: usize,
    /// Data was lost, either to the unit wrapping or to lack of room
    pub truncated: bool,
    /// Read pointer to write back so the unit agrees on what was dropped
    pub new_read: Option<u64>,
}

pub(crate) fn plan_copy(
    ptrs: HwPointers,
    base: u64,
    size: usize,
    capacity: usize,
    alignment: usize,
) -> CopyPlan {
    let read = (ptrs.read.wrapping_sub(base) % size as u64) as usize;
    let write = (ptrs.write.wrapping_sub(base) % size as u64) as usize;

    // Once full the oldest data sits at the write pointer
    let available = if ptrs.full {
        size
    } else {
        circular_distance(write, read, size)
    };

    if available > capacity {
        let keep = align_down(capacity, alignment);
        let start = (write + size - keep) % size;
        CopyPlan {
            start,
            len: keep,
            truncated: true,
            new_read: Some(base + start as u64),
        }
    } else if ptrs.full {
        CopyPlan {
            start: write,
            len: size,
            truncated: true,
            new_read: None,
        }
    } else {
        CopyPlan {
            start: read,
            len: available,
            truncated: false,
            new_read: None,
        }
    }
}

/// The barrier packet, built from its words
pub(crate) fn barrier_packet() -> [u8; BARRIER_LEN] {
    let mut packet = [0u8; BARRIER_LEN];
    for word in 0..BARRIER_WORDS {
        LittleEndian::write_u32(&mut packet[word * 4..], BARRIER_WORD);
    }
    packet
}

/// Copy `len` bytes of the ring `src`, starting at offset `start`, to the
/// output at `cursor`. With `barrier`, the first bytes of the span are
/// replaced by a barrier packet. Returns the number of bytes placed.
pub(crate) fn copy_span(
    src: &[u8],
    start: usize,
    len: usize,
    barrier: bool,
    out: &mut PagedOutput,
    cursor: &mut OutputCursor,
) -> usize {
    let size = src.len();
    let mut done = 0;

    if barrier {
        let packet = barrier_packet();
        done = BARRIER_LEN.min(len);
        out.write(cursor, &packet[..done]);
    }

    let mut pos = (start + done) % size.max(1);
    while done < len {
        let n = (len - done)
            .min(size - pos)
            .min(out.page_size - cursor.offset);
        out.write(cursor, &src[pos..pos + n]);
        pos = (pos + n) % size;
        done += n;
    }
    done
}
