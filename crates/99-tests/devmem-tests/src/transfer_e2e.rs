use crate::{anonymous_region, RecvStep, ScriptedSocket, SendStep, TxCall};
use devmem_engine::{
    run_receiver, run_sender, ArcStatsSink, EngineConfig, EngineError, GoodputReport, RecvMode,
    RunEnd, RxEvent, SendPlan, StatsSink, TransferEngine, TransferStats, TxFragment,
};
use dmabuf::page_size;
use frag_ledger::RxFragment;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TX_ID: u32 = 7;

fn engine(socket: ScriptedSocket) -> TransferEngine<ScriptedSocket, ArcStatsSink> {
    let config = EngineConfig {
        retry_backoff: Duration::from_micros(50),
        ..EngineConfig::default()
    };
    let mut engine = TransferEngine::new(config, ArcStatsSink::default());
    engine.attach(socket).expect("attach");
    engine
}

fn dma(token: u32, offset: u64, len: u32) -> RxFragment {
    RxFragment {
        token,
        offset,
        len,
        dmabuf_id: 1,
    }
}

#[test]
fn partial_sends_complete_as_one_transfer() {
    let socket = ScriptedSocket::new()
        .send(SendStep::Accept(3000))
        .send(SendStep::Accept(5000));
    let mut engine = engine(socket);

    let frag = TxFragment {
        dmabuf_id: TX_ID,
        offset: 4096,
        len: 16384,
    };
    assert_eq!(engine.send_zero_copy(&frag).expect("send"), 16384);

    let calls = &engine.socket().expect("socket").tx_calls;
    assert_eq!(
        calls,
        &vec![
            TxCall {
                dmabuf_id: TX_ID,
                offset: 4096,
                len: 3000
            },
            TxCall {
                dmabuf_id: TX_ID,
                offset: 7096,
                len: 5000
            },
            TxCall {
                dmabuf_id: TX_ID,
                offset: 12096,
                len: 8384
            },
        ]
    );

    let stats = engine.stats().snapshot();
    assert_eq!(stats.bytes, 16384);
    assert_eq!(stats.transfers, 1);
    assert_eq!(stats.fragments, 1);
}

#[test]
fn would_block_is_retried_and_counted() {
    let socket = ScriptedSocket::new()
        .send(SendStep::WouldBlock)
        .send(SendStep::WouldBlock)
        .send(SendStep::Accept(2))
        .send(SendStep::WouldBlock);
    let mut engine = engine(socket);

    assert_eq!(engine.send_copy(b"devmem").expect("send"), 6);
    assert_eq!(engine.socket().expect("socket").copied, b"devmem");

    let stats = engine.stats().snapshot();
    assert_eq!(stats.would_block, 3);
    assert_eq!(stats.transfers, 1);
}

#[test]
fn send_failure_closes_the_engine() {
    let socket = ScriptedSocket::new()
        .send(SendStep::Accept(10))
        .send(SendStep::Fail(libc::EPIPE));
    let mut engine = engine(socket);

    let err = engine.send_copy(&[0u8; 64]).expect_err("peer gone");
    assert!(matches!(&err, EngineError::Io(io) if io.raw_os_error() == Some(libc::EPIPE)));
    assert!(matches!(
        engine.send_copy(b"x"),
        Err(EngineError::Closing(_))
    ));
    assert_eq!(engine.stats().snapshot(), TransferStats::default());
}

#[test]
fn zero_byte_send_is_a_failure() {
    let mut engine = engine(ScriptedSocket::new().send(SendStep::Accept(0)));
    let err = engine.send_copy(b"abc").expect_err("no progress");
    assert!(matches!(&err, EngineError::Io(io) if io.kind() == std::io::ErrorKind::WriteZero));
}

#[test]
fn receiver_runs_until_end_of_stream() {
    let socket = ScriptedSocket::new()
        .recv(RecvStep::Deliver {
            dma: vec![dma(1, 0, 4096), dma(2, 4096, 4096)],
            linear: b"abcd".to_vec(),
        })
        .recv(RecvStep::WouldBlock)
        .recv(RecvStep::Deliver {
            dma: vec![dma(1, 8192, 1000)],
            linear: Vec::new(),
        })
        .recv(RecvStep::Eof);
    let mut engine = engine(socket);
    let cancel = Arc::new(AtomicBool::new(false));

    let summary = run_receiver(
        &mut engine,
        RecvMode::ZeroCopy,
        Duration::from_secs(5),
        &cancel,
        |_| {},
    )
    .expect("run");

    assert_eq!(summary.end, RunEnd::EndOfStream);
    assert_eq!(summary.stats.bytes, 4096 * 2 + 4 + 1000);
    assert_eq!(summary.stats.transfers, 2);
    assert_eq!(summary.stats.dma_fragments, 3);
    assert_eq!(summary.stats.linear_fragments, 1);
    assert_eq!(summary.stats.would_block, 1);
    assert_eq!(engine.ledger().outstanding_count(), 0);

    // Token 1 is reused by the kernel once the first loan came back.
    let released = engine.socket().expect("socket").released_tokens();
    assert_eq!(released, vec![1, 1, 2]);
}

#[test]
fn copy_mode_receiver_counts_plain_bytes() {
    let socket = ScriptedSocket::new()
        .recv(RecvStep::Bytes(vec![1; 300]))
        .recv(RecvStep::Bytes(vec![2; 200]))
        .recv(RecvStep::Eof);
    let mut engine = engine(socket);
    let cancel = Arc::new(AtomicBool::new(false));

    let summary = run_receiver(&mut engine, RecvMode::Copy, Duration::from_secs(5), &cancel, |_| {})
        .expect("run");

    assert_eq!(summary.end, RunEnd::EndOfStream);
    assert_eq!(summary.stats.bytes, 500);
    assert_eq!(summary.stats.transfers, 2);
    assert_eq!(summary.stats.dma_bytes, 0);
}

#[test]
fn copy_receive_exposes_linear_payload() {
    let mut engine = engine(ScriptedSocket::new().recv(RecvStep::Bytes(b"hello".to_vec())));
    let RxEvent::Delivered(batch) = engine.receive_copy().expect("receive") else {
        panic!("expected a delivery");
    };
    assert!(batch.loans.is_empty());
    assert_eq!(engine.linear_payload(&batch), b"hello");
}

#[test]
fn idle_receiver_stops_at_the_deadline() {
    let mut engine = engine(ScriptedSocket::new());
    let cancel = Arc::new(AtomicBool::new(false));

    let summary = run_receiver(
        &mut engine,
        RecvMode::ZeroCopy,
        Duration::from_millis(20),
        &cancel,
        |_| {},
    )
    .expect("run");

    assert_eq!(summary.end, RunEnd::DeadlineReached);
    assert_eq!(summary.stats.bytes, 0);
    assert!(summary.stats.would_block > 0);
    assert!(summary.elapsed >= Duration::from_millis(20));
}

#[test]
fn cancel_interrupts_an_idle_receive() {
    let mut engine = engine(ScriptedSocket::new());
    let cancel = Arc::new(AtomicBool::new(false));
    let raiser = {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.store(true, Ordering::Relaxed);
        })
    };

    let summary = run_receiver(
        &mut engine,
        RecvMode::ZeroCopy,
        Duration::from_secs(5),
        &cancel,
        |_| {},
    )
    .expect("run");
    raiser.join().expect("raiser thread");

    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(summary.elapsed < Duration::from_secs(2));
    assert!(summary.stats.would_block > 0);
    assert_eq!(engine.socket().expect("socket").shutdowns, 1);
}

#[test]
fn cancel_interrupts_a_blocked_send() {
    let mut socket = ScriptedSocket::new().send(SendStep::Accept(100));
    for _ in 0..200_000 {
        socket = socket.send(SendStep::WouldBlock);
    }
    let mut engine = engine(socket);
    let cancel = Arc::new(AtomicBool::new(false));
    let raiser = {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.store(true, Ordering::Relaxed);
        })
    };

    let summary = run_sender(
        &mut engine,
        SendPlan::Copy(&[0u8; 4096]),
        Duration::from_secs(5),
        &cancel,
        |_| {},
    )
    .expect("run");
    raiser.join().expect("raiser thread");

    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(summary.elapsed < Duration::from_secs(2));
    assert_eq!(summary.stats.bytes, 100);
    assert_eq!(summary.stats.transfers, 1);
}

#[test]
fn cancelled_sender_sends_nothing() {
    let mut engine = engine(ScriptedSocket::new());
    let cancel = Arc::new(AtomicBool::new(true));
    let frag = TxFragment {
        dmabuf_id: TX_ID,
        offset: 0,
        len: 4096,
    };

    let summary = run_sender(
        &mut engine,
        SendPlan::ZeroCopy(frag),
        Duration::from_secs(5),
        &cancel,
        |_| {},
    )
    .expect("run");

    assert_eq!(summary.end, RunEnd::Cancelled);
    assert_eq!(summary.stats.transfers, 0);
    assert!(engine.socket().expect("socket").tx_calls.is_empty());
    assert_eq!(engine.socket().expect("socket").shutdowns, 1);
}

#[test]
fn timed_sender_reuses_the_same_region_range() {
    let region = anonymous_region(4 * page_size());
    let frag = TxFragment::within(&region, TX_ID, page_size(), 2 * page_size()).expect("in bounds");
    let mut engine = engine(ScriptedSocket::new());
    let cancel = Arc::new(AtomicBool::new(false));
    let mut lines = Vec::new();

    let summary = run_sender(
        &mut engine,
        SendPlan::ZeroCopy(frag),
        Duration::from_millis(10),
        &cancel,
        |line| lines.push(line),
    )
    .expect("run");

    assert_eq!(summary.end, RunEnd::DeadlineReached);
    assert!(summary.stats.transfers > 0);
    assert_eq!(summary.stats.bytes, summary.stats.transfers * frag.len as u64);
    assert!(lines.is_empty(), "no progress line before the first interval");

    let calls = &engine.socket().expect("socket").tx_calls;
    assert!(calls
        .iter()
        .all(|call| call.dmabuf_id == TX_ID && call.offset == page_size() as u64));
}

#[test]
fn tx_fragment_must_fit_the_region() {
    let region = anonymous_region(page_size());
    assert!(TxFragment::within(&region, TX_ID, 0, page_size()).is_ok());
    assert!(TxFragment::within(&region, TX_ID, 1, page_size()).is_err());
    assert!(TxFragment::within(&region, TX_ID, usize::MAX, 2).is_err());
}

#[test]
fn large_region_pattern_reads_back() {
    const LEN: usize = 16 * 1024 * 1024;
    let mut region = anonymous_region(LEN);
    region.fill_test_pattern().expect("pattern");

    let bytes = region.slice(0, LEN).expect("whole region");
    assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));

    let tail = region.slice(LEN - 3, 3).expect("tail");
    assert_eq!(tail, &[0xfd, 0xfe, 0xff]);
}

#[test]
fn goodput_uses_mebibits() {
    let stats = TransferStats {
        bytes: 20 * 1024 * 1024,
        transfers: 20,
        ..TransferStats::default()
    };
    let report = GoodputReport::from_stats(&stats, Duration::from_secs(2));

    assert!((report.goodput_mbps - 80.0).abs() < 1e-9);
    assert!((report.transfer_rate - 10.0).abs() < 1e-9);
    assert!((report.average_transfer_size - 1024.0 * 1024.0).abs() < 1e-9);
}

#[derive(Clone, Debug)]
struct Receive {
    dma_lens: Vec<u32>,
    linear_len: usize,
}

fn receive() -> impl Strategy<Value = Receive> {
    (
        proptest::collection::vec(1u32..=4096, 0..6),
        0usize..512,
    )
        .prop_filter("empty receive reads as end of stream", |(dma, linear)| {
            !dma.is_empty() || *linear > 0
        })
        .prop_map(|(dma_lens, linear_len)| Receive {
            dma_lens,
            linear_len,
        })
}

proptest! {
    /// Every received byte is accounted to exactly one delivery path.
    #[test]
    fn dma_plus_linear_equals_bytes(receives in proptest::collection::vec(receive(), 1..12)) {
        let mut socket = ScriptedSocket::new();
        let mut token = 0u32;
        let mut offset = 0u64;
        let mut expected = 0u64;
        for rx in &receives {
            let dma = rx
                .dma_lens
                .iter()
                .map(|&len| {
                    token += 1;
                    offset += u64::from(len);
                    self::dma(token, offset - u64::from(len), len)
                })
                .collect::<Vec<_>>();
            expected += rx.dma_lens.iter().map(|&len| u64::from(len)).sum::<u64>();
            expected += rx.linear_len as u64;
            socket = socket.recv(RecvStep::Deliver { dma, linear: vec![0xab; rx.linear_len] });
        }
        socket = socket.recv(RecvStep::Eof);

        let mut engine = engine(socket);
        let cancel = Arc::new(AtomicBool::new(false));
        let summary = run_receiver(&mut engine, RecvMode::ZeroCopy, Duration::from_secs(5), &cancel, |_| {})
            .expect("run");

        prop_assert_eq!(summary.end, RunEnd::EndOfStream);
        prop_assert_eq!(summary.stats.bytes, expected);
        prop_assert_eq!(summary.stats.dma_bytes + summary.stats.linear_bytes, expected);
        prop_assert_eq!(summary.stats.transfers, receives.len() as u64);
        prop_assert_eq!(engine.ledger().outstanding_count(), 0);

        let report = summary.report();
        if expected > 0 {
            prop_assert!((report.dma_percent + report.linear_percent - 100.0).abs() < 1e-6);
        }
    }
}
