// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use shoal_rs::{
    client::connection::{Connection, HandlerFactory},
    request::{dispatcher::EventDispatcher, suspender::DelayedSuspender},
    wire::fields::{FieldReader, FieldWriter},
};
use tokio::time::timeout;

use crate::integration_tests::common::{
    ECHO, STREAM, echo_factory, single_client, start_node, test_limits,
};

/// Message-type discriminators inside a streamed request body.
const REC: u8 = 0x10;
const ACK: u8 = 0x11;

/// Intra-request signal codes.
const SIG_DONE_READING: u8 = 1;
const SIG_STOP: u8 = 2;
const SIG_RESUME_WORKER: u8 = 3;

/// A node that answers a request with five numbered records and then waits
/// for a single acknowledgement; nothing is sent after the ack arrives.
fn streamer_factory() -> HandlerFactory {
    Arc::new(|mut req| {
        Box::pin(async move {
            if req.receive(|_| ()).await.is_err() {
                return;
            }
            for i in 0..5u32 {
                let mut w = FieldWriter::new();
                w.put_u8(REC);
                w.put_u32(i);
                if req.send(STREAM, w).await.is_err() {
                    return;
                }
            }
            let _ = req.receive(|b| b.first().copied()).await;
        })
    })
}

#[tokio::test]
async fn test_reader_and_controller_stop_cleanly() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, streamer_factory()).await;
    let conn = Connection::connect(&addr.to_string(), "client-a", &key, test_limits())
        .await
        .expect("connect");

    let mut req = conn.new_request().expect("request");
    let mut w = FieldWriter::new();
    w.put_trailing(Bytes::from_static(b"start"));
    req.send(STREAM, w).await.expect("start message");

    let records: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let acked = Arc::new(AtomicBool::new(false));

    let mut disp = EventDispatcher::new(req);

    let reader_records = Arc::clone(&records);
    let reader_acked = Arc::clone(&acked);
    disp.spawn(move |mut fib| async move {
        for _ in 0..5 {
            let body = fib.expect_message(REC).await.expect("record");
            let mut rd = FieldReader::new(&body);
            reader_records
                .lock()
                .expect("records lock")
                .push(rd.u32("record number").expect("record number"));
        }
        fib.fire_signal(SIG_DONE_READING);
        fib.wait_signal(SIG_STOP).await.expect("stop from controller");

        let mut w = FieldWriter::new();
        w.put_u8(ACK);
        fib.send(STREAM, w).await.expect("ack goes out");
        reader_acked.store(true, Ordering::SeqCst);
    });

    disp.spawn(move |mut fib| async move {
        fib.wait_signal(SIG_DONE_READING).await.expect("reader finished");
        fib.fire_signal(SIG_STOP);
    });

    timeout(Duration::from_secs(10), disp.run())
        .await
        .expect("dispatcher terminates")
        .expect("no connection error");

    assert_eq!(*records.lock().expect("records lock"), vec![0, 1, 2, 3, 4]);
    assert!(acked.load(Ordering::SeqCst), "ack was sent after the stop signal");

    stop.cancel();
}

#[tokio::test]
async fn test_send_slot_is_handed_over_in_fifo_order() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;
    let conn = Connection::connect(&addr.to_string(), "client-a", &key, test_limits())
        .await
        .expect("connect");

    let req = conn.new_request().expect("request");
    let mut disp = EventDispatcher::new(req);

    // Three coroutines send one tagged echo each, chained so the
    // registrations enter the queue in a known order. All echoes share one
    // discriminator, so the collector observes true arrival order.
    for tag in 0..3u8 {
        disp.spawn(move |mut fib| async move {
            if tag > 0 {
                fib.wait_signal(tag).await.expect("my turn");
            }
            let mut w = FieldWriter::new();
            w.put_u8(0x40);
            w.put_u8(tag);
            fib.send(ECHO, w).await.expect("tagged send");
            if tag < 2 {
                fib.fire_signal(tag + 1);
            }
        });
    }

    // Collect the three echoes in wire order.
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    disp.spawn(move |mut fib| async move {
        for _ in 0..3 {
            let body = fib.expect_message(0x40).await.expect("echo");
            sink.lock().expect("order lock").push(body[0]);
        }
    });

    timeout(Duration::from_secs(10), disp.run())
        .await
        .expect("dispatcher terminates")
        .expect("no connection error");

    assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
    stop.cancel();
}

#[tokio::test]
async fn test_abort_unregisters_and_kills_the_target() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;
    let conn = Connection::connect(&addr.to_string(), "client-a", &key, test_limits())
        .await
        .expect("connect");

    let req = conn.new_request().expect("request");
    let mut disp = EventDispatcher::new(req);

    // Waits for a message type nothing will ever send.
    let stuck = disp.spawn(|mut fib| async move {
        let _ = fib.expect_message(0x77).await;
        unreachable!("aborted before any such message exists");
    });

    disp.spawn(move |mut fib| async move {
        // One turn so the target is parked in its registration.
        fib.yield_once().await.expect("turn");
        fib.abort(stuck);
    });

    timeout(Duration::from_secs(10), disp.run())
        .await
        .expect("dispatcher terminates")
        .expect("abort cleaned the registry");

    stop.cancel();
}

#[tokio::test]
#[should_panic(expected = "two coroutines awaiting message type")]
async fn test_duplicate_message_type_registration_fails_loudly() {
    let (store, key) = single_client("client-a");
    let (addr, _stop) = start_node(store, echo_factory()).await;
    let conn = Connection::connect(&addr.to_string(), "client-a", &key, test_limits())
        .await
        .expect("connect");

    let req = conn.new_request().expect("request");
    let mut disp = EventDispatcher::new(req);
    for _ in 0..2 {
        disp.spawn(|mut fib| async move {
            let _ = fib.expect_message(9).await;
        });
    }
    let _ = disp.run().await;
}

#[tokio::test]
async fn test_delayed_suspender_pauses_the_worker_at_a_safe_point() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;
    let conn = Connection::connect(&addr.to_string(), "client-a", &key, test_limits())
        .await
        .expect("connect");

    let req = conn.new_request().expect("request");
    let mut disp = EventDispatcher::new(req);

    let suspender = Arc::new(DelayedSuspender::new(SIG_RESUME_WORKER));
    let progress = Arc::new(AtomicU32::new(0));

    let worker_susp = Arc::clone(&suspender);
    let worker_progress = Arc::clone(&progress);
    disp.spawn(move |mut fib| async move {
        for _ in 0..10 {
            worker_susp
                .suspend_if_requested(&mut fib)
                .await
                .expect("resumed");
            worker_progress.fetch_add(1, Ordering::SeqCst);
            fib.yield_once().await.expect("unit boundary");
        }
    });

    let ctl_susp = Arc::clone(&suspender);
    let ctl_progress = Arc::clone(&progress);
    disp.spawn(move |mut fib| async move {
        while ctl_progress.load(Ordering::SeqCst) < 3 {
            fib.yield_once().await.expect("turn");
        }
        ctl_susp.request_suspension();

        // The worker must stop at its next safe point and stay stopped.
        for _ in 0..5 {
            fib.yield_once().await.expect("turn");
        }
        let stalled = ctl_progress.load(Ordering::SeqCst);
        for _ in 0..5 {
            fib.yield_once().await.expect("turn");
        }
        assert_eq!(
            ctl_progress.load(Ordering::SeqCst),
            stalled,
            "worker kept running past the requested pause"
        );

        assert!(ctl_susp.resume_if_suspended(&fib), "worker was suspended");
    });

    timeout(Duration::from_secs(10), disp.run())
        .await
        .expect("dispatcher terminates")
        .expect("no connection error");

    assert_eq!(progress.load(Ordering::SeqCst), 10, "worker ran to completion");
    stop.cancel();
}
