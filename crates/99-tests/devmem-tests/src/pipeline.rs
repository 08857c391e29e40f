//! Region, binding and engine wired together the way the server wires them.

use crate::{anonymous_region, RecvStep, ScriptedChannel, ScriptedSocket};
use devmem_engine::{
    ArcStatsSink, EngineConfig, EngineError, EngineState, RxEvent, StatsSink, TransferEngine,
};
use dmabuf::{page_size, RegionBusy};
use frag_ledger::{LedgerError, RxFragment};
use netdev_bind::{BindError, BindState, BinderConfig, InterfaceIndex, QueueBinder};
use std::sync::Arc;

const FAMILY: u16 = 0x1f;
const DMABUF_ID: u32 = 9;
const QUEUE: u32 = 15;

fn ifindex() -> InterfaceIndex {
    InterfaceIndex::new(2)
}

fn frag(token: u32, offset: u64, len: u32) -> RxFragment {
    RxFragment {
        token,
        offset,
        len,
        dmabuf_id: DMABUF_ID,
    }
}

fn engine(socket: ScriptedSocket) -> TransferEngine<ScriptedSocket, ArcStatsSink> {
    let mut engine = TransferEngine::new(EngineConfig::default(), ArcStatsSink::default());
    engine.attach(socket).expect("attach");
    engine
}

#[test]
fn family_lookup_then_bind_reports_dmabuf_id() {
    let mut lookup = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let mut binder = QueueBinder::resolve(&mut lookup, BinderConfig::default()).expect("resolve");
    assert_eq!(binder.family_id(), FAMILY);

    let region = anonymous_region(4 * page_size());
    let channel = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let log = Arc::clone(&channel.log);
    let binding = binder
        .bind_rx(channel, ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    assert_eq!(binding.dmabuf_id(), Some(DMABUF_ID));
    assert_eq!(log.lock().requests.len(), 1);
    drop(binding);
    assert_eq!(log.lock().closes, 1, "dropping a binding closes its channel");
}

#[test]
fn rejected_bind_leaves_region_free_to_bind_again() {
    let region = anonymous_region(page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());

    let err = binder
        .bind_rx(ScriptedChannel::rejecting(FAMILY, libc::EBUSY), ifindex(), QUEUE, region.handle())
        .expect_err("queue busy");
    assert!(matches!(err, BindError::Rejected { errno, .. } if errno == libc::EBUSY));
    assert_eq!(err.errno(), Some(libc::EBUSY));

    let binding = binder
        .bind_rx(ScriptedChannel::confirming(FAMILY, DMABUF_ID), ifindex(), QUEUE, region.handle())
        .expect("retry after rejection");
    assert!(binding.is_bound());
}

#[test]
fn silent_kernel_leaves_binding_unconfirmed() {
    let region = anonymous_region(page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let mut binding = binder
        .bind_tx(ScriptedChannel::silent(FAMILY), ifindex(), region.handle())
        .expect("bind tx");

    assert_eq!(binding.state(), BindState::Unconfirmed);
    assert_eq!(binding.dmabuf_id(), None);
    binding.mark_confirmed(4);
    assert_eq!(binding.dmabuf_id(), Some(4));
}

#[test]
fn receive_release_close_then_destroy() {
    let mut region = anonymous_region(4 * page_size());
    region.fill_test_pattern().expect("pattern");
    let page = page_size() as u32;

    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let channel = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let log = Arc::clone(&channel.log);
    let binding = binder
        .bind_rx(channel, ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    let socket = ScriptedSocket::new().recv(RecvStep::Deliver {
        dma: vec![frag(1, 0, page), frag(2, u64::from(page) + 3, 100)],
        linear: Vec::new(),
    });
    let mut engine = engine(socket);
    engine.hold_binding(binding);

    let RxEvent::Delivered(batch) = engine.receive_zero_copy().expect("receive") else {
        panic!("expected a delivery");
    };
    assert_eq!(batch.bytes, page as usize + 100);
    assert_eq!(batch.loans.len(), 2);
    for loan in &batch.loans {
        let bytes = loan.bytes(&region).expect("fragment inside region");
        assert_eq!(bytes.len(), loan.len());
        assert_eq!(bytes[0], loan.fragment().offset as u8);
    }

    let RegionBusy {
        region,
        outstanding,
    } = region
        .destroy(engine.ledger())
        .expect_err("loans are outstanding");
    assert_eq!(outstanding, 2);

    engine.release(batch.loans).expect("release");
    assert_eq!(engine.ledger().outstanding_count(), 0);
    assert_eq!(log.lock().closes, 0);

    assert_eq!(engine.begin_close(), EngineState::Closed);
    assert_eq!(log.lock().closes, 1);
    let socket = engine.socket().expect("socket");
    assert_eq!(socket.released_tokens(), vec![1, 2]);
    assert_eq!(socket.shutdowns, 1);

    region.destroy(engine.ledger()).expect("nothing on loan");
}

#[test]
fn draining_engine_closes_on_last_release_and_frees_the_region_key() {
    let region = anonymous_region(4 * page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let binding = binder
        .bind_rx(ScriptedChannel::confirming(FAMILY, DMABUF_ID), ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    let socket = ScriptedSocket::new().recv(RecvStep::Deliver {
        dma: vec![frag(5, 0, 512), frag(6, 512, 512)],
        linear: Vec::new(),
    });
    let mut engine = engine(socket);
    engine.hold_binding(binding);

    let RxEvent::Delivered(mut batch) = engine.receive_zero_copy().expect("receive") else {
        panic!("expected a delivery");
    };
    assert_eq!(engine.begin_close(), EngineState::Draining);
    assert!(matches!(
        engine.receive_zero_copy(),
        Err(EngineError::Closing(EngineState::Draining))
    ));

    let last = batch.loans.pop().expect("two loans");
    engine.release(batch.loans).expect("first release");
    assert_eq!(engine.state(), EngineState::Draining);
    engine.release([last]).expect("last release");
    assert_eq!(engine.state(), EngineState::Closed);

    // Teardown removed the registry entry, so the region can be bound again.
    binder
        .bind_rx(ScriptedChannel::confirming(FAMILY, DMABUF_ID), ifindex(), QUEUE, region.handle())
        .expect("rebind after teardown");
}

#[test]
fn second_binding_in_same_direction_is_refused() {
    let region = anonymous_region(page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let _rx = binder
        .bind_rx(ScriptedChannel::confirming(FAMILY, 1), ifindex(), QUEUE, region.handle())
        .expect("first rx");

    let err = binder
        .bind_rx(ScriptedChannel::confirming(FAMILY, 2), ifindex(), QUEUE + 1, region.handle())
        .expect_err("rx already bound");
    assert!(matches!(err, BindError::AlreadyBound { .. }));

    binder
        .bind_tx(ScriptedChannel::confirming(FAMILY, 3), ifindex(), region.handle())
        .expect("tx is a separate direction");
}

#[test]
fn duplicate_token_is_fatal_and_cleans_up() {
    let region = anonymous_region(4 * page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let channel = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let log = Arc::clone(&channel.log);
    let binding = binder
        .bind_rx(channel, ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    let socket = ScriptedSocket::new()
        .recv(RecvStep::Deliver {
            dma: vec![frag(3, 0, 64)],
            linear: Vec::new(),
        })
        .recv(RecvStep::Deliver {
            dma: vec![frag(4, 64, 64), frag(3, 128, 64)],
            linear: Vec::new(),
        });
    let mut engine = engine(socket);
    engine.hold_binding(binding);

    let RxEvent::Delivered(first) = engine.receive_zero_copy().expect("first receive") else {
        panic!("expected a delivery");
    };
    let err = engine.receive_zero_copy().expect_err("token 3 is still live");
    assert!(err.is_protocol_fault());
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::DuplicateToken { token: 3 })
    ));

    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(engine.ledger().outstanding_count(), 0);
    assert_eq!(engine.socket().expect("socket").released_tokens(), vec![3, 4]);
    assert_eq!(log.lock().closes, 1);

    // Loans issued before the failure are stale now.
    assert!(engine.release(first.loans).is_err());
    region.destroy(engine.ledger()).expect("ledger is empty");
}

#[test]
fn duplicate_at_batch_start_still_returns_the_rest_of_the_batch() {
    let region = anonymous_region(4 * page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let channel = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let log = Arc::clone(&channel.log);
    let binding = binder
        .bind_rx(channel, ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    let socket = ScriptedSocket::new()
        .recv(RecvStep::Deliver {
            dma: vec![frag(3, 0, 64)],
            linear: Vec::new(),
        })
        .recv(RecvStep::Deliver {
            dma: vec![frag(3, 64, 64), frag(4, 128, 64), frag(5, 192, 64)],
            linear: Vec::new(),
        });
    let mut engine = engine(socket);
    engine.hold_binding(binding);

    let RxEvent::Delivered(_first) = engine.receive_zero_copy().expect("first receive") else {
        panic!("expected a delivery");
    };
    let err = engine.receive_zero_copy().expect_err("token 3 is still live");
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::DuplicateToken { token: 3 })
    ));

    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(engine.ledger().outstanding_count(), 0);
    // 4 and 5 never reached the ledger but were loaned by the kernel all the same.
    assert_eq!(engine.socket().expect("socket").released_tokens(), vec![3, 4, 5]);
    assert_eq!(log.lock().closes, 1);
}

#[test]
fn socket_error_releases_everything_and_unbinds() {
    let region = anonymous_region(page_size());
    let mut binder = QueueBinder::with_family(FAMILY, BinderConfig::default());
    let channel = ScriptedChannel::confirming(FAMILY, DMABUF_ID);
    let log = Arc::clone(&channel.log);
    let binding = binder
        .bind_rx(channel, ifindex(), QUEUE, region.handle())
        .expect("bind rx");

    let socket = ScriptedSocket::new()
        .recv(RecvStep::Deliver {
            dma: vec![frag(10, 0, 256), frag(11, 256, 256)],
            linear: b"hdr".to_vec(),
        })
        .recv(RecvStep::Fail(libc::ECONNRESET));
    let mut engine = engine(socket);
    engine.hold_binding(binding);

    let RxEvent::Delivered(batch) = engine.receive_zero_copy().expect("receive") else {
        panic!("expected a delivery");
    };
    assert_eq!(engine.linear_payload(&batch), b"hdr");
    assert_eq!(batch.loans.len(), 2);

    let err = engine.receive_zero_copy().expect_err("reset");
    assert!(!err.is_protocol_fault());
    assert!(matches!(&err, EngineError::Io(io) if io.raw_os_error() == Some(libc::ECONNRESET)));

    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(engine.socket().expect("socket").released_tokens(), vec![10, 11]);
    assert_eq!(log.lock().closes, 1);

    let stats = engine.stats().snapshot();
    assert_eq!(stats.dma_bytes, 512);
    assert_eq!(stats.linear_bytes, 3);
    drop(region);
}

#[test]
fn release_shortfall_is_a_protocol_fault() {
    let mut socket = ScriptedSocket::new().recv(RecvStep::Deliver {
        dma: vec![frag(1, 0, 64), frag(2, 64, 64)],
        linear: Vec::new(),
    });
    socket.release_shortfall = 1;
    let mut engine = engine(socket);

    let RxEvent::Delivered(batch) = engine.receive_zero_copy().expect("receive") else {
        panic!("expected a delivery");
    };
    let err = engine.release(batch.loans).expect_err("kernel freed one of two");
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::ReleaseShortfall {
            requested: 2,
            freed: 1
        })
    ));
    assert_eq!(engine.state(), EngineState::Closed);
}
