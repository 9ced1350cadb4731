// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use shoal_rs::client::{
    connection::ConnStats,
    send::{IovCursor, write_msg},
};
use tokio::io::AsyncReadExt;

use crate::unit_tests::payload;

fn sample_fields() -> (Vec<Bytes>, Vec<u8>) {
    let fields = vec![
        Bytes::from_static(b"header!"),
        payload(1000, 3),
        Bytes::new(),
        payload(17, 7),
        Bytes::from_static(b"tail"),
    ];
    let total: Vec<u8> = fields.iter().flat_map(|b| b.iter().copied()).collect();
    (fields, total)
}

/// Simulate a writer that accepts `chunk` bytes per call.
fn drain_in_chunks(fields: Vec<Bytes>, chunk: usize) -> Vec<u8> {
    let mut cur = IovCursor::new(fields);
    let mut out = Vec::new();
    while !cur.is_done() {
        let mut accepted = 0;
        for slice in cur.io_slices() {
            if accepted == chunk {
                break;
            }
            let take = slice.len().min(chunk - accepted);
            out.extend_from_slice(&slice[..take]);
            accepted += take;
        }
        cur.advance(accepted);
    }
    out
}

#[test]
fn test_cursor_restores_the_exact_byte_stream() {
    let (_, expected) = sample_fields();
    for chunk in [1, 2, 3, 5, 7, 64, 999, 1001, 4096] {
        let (fields, _) = sample_fields();
        assert_eq!(
            drain_in_chunks(fields, chunk),
            expected,
            "chunk size {chunk}"
        );
    }
}

#[test]
fn test_cursor_accounts_remaining() {
    let (fields, expected) = sample_fields();
    let mut cur = IovCursor::new(fields);
    assert_eq!(cur.remaining(), expected.len());
    cur.advance(9); // crosses the first slice boundary
    assert_eq!(cur.remaining(), expected.len() - 9);
    cur.advance(cur.remaining());
    assert!(cur.is_done());
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn test_cursor_skips_empty_slices() {
    let cur = IovCursor::new(vec![Bytes::new(), Bytes::new()]);
    assert!(cur.is_done());
}

#[tokio::test]
async fn test_write_msg_survives_partial_acceptance() {
    // A tiny duplex buffer forces many short writes.
    let (mut tx, mut rx) = tokio::io::duplex(64);
    let (fields, expected) = sample_fields();
    let stats = ConnStats::default();

    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.expect("read side");
        got
    });

    write_msg(&mut tx, fields, &stats).await.expect("write completes");
    drop(tx);

    let got = reader.await.expect("reader task");
    assert_eq!(got, expected);

    let snap = stats.snapshot();
    assert_eq!(snap.msgs_out, 1);
    assert_eq!(snap.bytes_out, expected.len() as u64);
    assert!(snap.write_calls > 1, "64-byte pipe must fragment the write");
    assert!(snap.io_waits > 0);
}
