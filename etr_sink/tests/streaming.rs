// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use barrier_packet::{starts_with_barrier, BARRIER_LEN};
use etr_regs::MemWidth;
use etr_sink::sim::{HostDma, SimulatedTmc};
use etr_sink::{EtrSink, Mode, Progress, SinkConfig, StreamingSession, TraceSinkHw};
use std::sync::Arc;

fn setup(size: usize) -> (EtrSink, SimulatedTmc, Arc<HostDma>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dma = Arc::new(HostDma::new());
    let tmc = SimulatedTmc::new(dma.clone());
    let sink = EtrSink::new(
        SinkConfig::new("etr0", size, MemWidth::Bits128),
        Box::new(tmc.clone()),
        dma.clone(),
    )
    .unwrap();
    (sink, tmc, dma)
}

fn start(sink: &EtrSink, pages: usize, page_size: usize, head: u64) -> StreamingSession {
    let mut session = sink.on_session_start(pages, page_size, false).unwrap();
    sink.on_session_set_cursor(&mut session, head);
    sink.enable_streaming(&mut session).unwrap();
    session
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn small_span_fits() {
    let (sink, tmc, _dma) = setup(4096);
    let mut session = start(&sink, 1, 4096, 0);
    let data = pattern(100);
    tmc.emit(&data);

    let update = sink.on_data_available(&mut session).unwrap();
    assert!(!update.truncated);
    assert_eq!(update.copied, 100);
    assert_eq!(update.progress, Progress::Advance(100));
    assert_eq!(session.head(), 100);
    assert_eq!(session.output().read_wrapping(0, 100), data);
    sink.on_session_end(session);
}

#[test]
fn full_buffer_larger_than_output() {
    let (sink, tmc, _dma) = setup(4096);
    let mut session = start(&sink, 2, 1024, 512);
    let base = session.buffer_paddr();
    let data = pattern(4096);
    tmc.emit(&data);
    assert!(tmc.clone().read_status());

    let update = sink.on_data_available(&mut session).unwrap();
    assert!(update.truncated);
    assert_eq!(update.copied, 2048);
    assert_eq!(update.progress, Progress::Advance(2048));

    // Read pointer moved forward by 2048 so only the newest 2048 remain
    assert_eq!(tmc.rrp_writes()[0], base + 2048);

    let out = session.output().read_wrapping(512, 2048);
    assert!(starts_with_barrier(&out));
    assert_eq!(&out[BARRIER_LEN..], &data[2048 + BARRIER_LEN..]);
    sink.on_session_end(session);
}

#[test]
fn overflow_without_wrap() {
    let (sink, tmc, _dma) = setup(8192);
    let mut session = start(&sink, 2, 1024, 100);
    let data = pattern(3000);
    tmc.emit(&data);

    let update = sink.on_data_available(&mut session).unwrap();
    assert!(update.truncated);
    assert_eq!(update.copied, 2048);

    let out = session.output().read_wrapping(100, 2048);
    assert!(starts_with_barrier(&out));
    assert_eq!(&out[BARRIER_LEN..], &data[3000 - 2048 + BARRIER_LEN..]);
    assert_eq!(session.head(), (100 + 2048) % 2048);
    sink.on_session_end(session);
}

#[test]
fn full_buffer_that_fits_is_still_marked() {
    let (sink, tmc, _dma) = setup(4096);
    let mut session = start(&sink, 4, 4096, 0);
    let data = pattern(5000);
    tmc.emit(&data);

    let update = sink.on_data_available(&mut session).unwrap();
    assert!(update.truncated);
    assert_eq!(update.copied, 4096);
    let out = session.output().read_wrapping(0, 4096);
    assert!(starts_with_barrier(&out));
    assert_eq!(&out[BARRIER_LEN..], &data[5000 - 4096 + BARRIER_LEN..]);
    sink.on_session_end(session);
}

#[test]
fn span_across_both_wrap_points() {
    let (sink, tmc, dma) = setup(4096);
    let mut session = start(&sink, 4, 256, 1000);
    let base = session.buffer_paddr();

    let data = pattern(4096);
    assert!(dma.bus_write(base, &data));
    // 96 bytes before the hardware wrap, 200 after it; the output crosses
    // from page 3 into page 0 along the way.
    tmc.set_pointers(4000, 200, false);

    let update = sink.on_data_available(&mut session).unwrap();
    assert!(!update.truncated);
    assert_eq!(update.copied, 296);

    let linear: Vec<u8> = data[4000..].iter().chain(&data[..200]).copied().collect();
    assert_eq!(session.output().read_wrapping(1000, 296), linear);
    assert_eq!(session.head(), (1000 + 296) % 1024);
    sink.on_session_end(session);
}

#[test]
fn streaming_then_continuous() {
    let (sink, tmc, dma) = setup(4096);
    let session = start(&sink, 1, 4096, 0);
    assert_eq!(sink.mode(), Mode::Streaming);
    sink.on_session_end(session);
    assert_eq!(sink.mode(), Mode::Disabled);

    sink.enable_continuous().unwrap();
    tmc.emit(&[1; 32]);
    let read = sink.begin_read().unwrap();
    assert_eq!(read.len(), 32);
    drop(read);
    sink.shutdown().unwrap();
    assert_eq!(dma.stats().live_bytes, 0);
}

#[test]
fn notification_for_ended_run_is_ignored() {
    let (sink, tmc, _dma) = setup(4096);
    let mut old = start(&sink, 1, 4096, 0);
    tmc.emit(&[1; 64]);
    sink.disable().unwrap();

    let mut new = start(&sink, 1, 4096, 0);
    tmc.emit(&[2; 64]);
    assert_eq!(sink.on_data_available(&mut old), None);

    let update = sink.on_data_available(&mut new).unwrap();
    assert_eq!(update.copied, 64);
    assert_eq!(new.output().read_wrapping(0, 64), vec![2; 64]);

    sink.on_session_end(old);
    assert_eq!(sink.mode(), Mode::Streaming);
    sink.on_session_end(new);
    assert_eq!(sink.mode(), Mode::Disabled);
}
