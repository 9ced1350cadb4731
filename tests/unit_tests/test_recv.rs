// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use shoal_rs::{
    client::{error::ConnError, recv::MsgReader},
    wire::{
        fields::FieldWriter,
        header::{DEFAULT_MAX_BODY_LEN, HEADER_LEN, MsgType},
    },
};
use tokio::io::AsyncWriteExt;

use crate::unit_tests::payload;

fn frame(ty: u8, body: Bytes) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_trailing(body);
    let fields = w
        .into_message(MsgType::new(ty), DEFAULT_MAX_BODY_LEN)
        .expect("fits");
    fields.iter().flat_map(|b| b.iter().copied()).collect()
}

/// Feed `stream` through the reader in the given chunk sizes and collect
/// every delivered message.
async fn deliver_chunked(stream: &[u8], chunks: &[usize]) -> Vec<(u8, Bytes)> {
    let (mut tx, mut rx) = tokio::io::duplex(stream.len() + 1);
    let mut reader = MsgReader::new(DEFAULT_MAX_BODY_LEN);
    let mut out = Vec::new();

    let mut offset = 0;
    for &chunk in chunks {
        let end = (offset + chunk).min(stream.len());
        tx.write_all(&stream[offset..end]).await.expect("write chunk");
        offset = end;

        // Drain everything this chunk completed.
        reader.fill(&mut rx).await.expect("fill");
        while let Some(msg) = reader.poll_buffered().expect("well-formed stream") {
            out.push((msg.msg_type.raw(), msg.body));
        }
    }
    assert_eq!(offset, stream.len(), "chunk list must cover the stream");
    out
}

#[tokio::test]
async fn test_n_messages_arrive_exactly_once_in_order() {
    let bodies: Vec<Bytes> = (0..6).map(|i| payload(i * 97, i as u8)).collect();
    let mut stream = Vec::new();
    for (i, b) in bodies.iter().enumerate() {
        stream.extend_from_slice(&frame(i as u8 + 1, b.clone()));
    }

    // One byte at a time; everything at once; odd chunk sizes.
    let chunkings: Vec<Vec<usize>> = vec![
        vec![1; stream.len()],
        vec![stream.len()],
        std::iter::repeat_n(13, stream.len().div_ceil(13)).collect(),
        std::iter::repeat_n(255, stream.len().div_ceil(255)).collect(),
    ];

    for chunks in chunkings {
        let got = deliver_chunked(&stream, &chunks).await;
        assert_eq!(got.len(), bodies.len(), "no duplicates, no omissions");
        for (i, (ty, body)) in got.iter().enumerate() {
            assert_eq!(*ty, i as u8 + 1);
            assert_eq!(body, &bodies[i]);
        }
    }
}

#[tokio::test]
async fn test_four_complete_frames_plus_partial_header() {
    // Four complete frames totalling a few KiB plus 12 bytes of a fifth
    // message; the fifth arrives once the rest is supplied.
    let four: Vec<Vec<u8>> =
        (0..4).map(|i| frame(10 + i, payload(1222, i))).collect();
    let fifth = frame(99, payload(40, 9));

    let mut first_read = Vec::new();
    for f in &four {
        first_read.extend_from_slice(f);
    }
    first_read.extend_from_slice(&fifth[..12]);

    let (mut tx, mut rx) = tokio::io::duplex(first_read.len() + fifth.len());
    let mut reader = MsgReader::new(DEFAULT_MAX_BODY_LEN);

    tx.write_all(&first_read).await.expect("first read worth of bytes");
    reader.fill(&mut rx).await.expect("fill");
    let mut got = Vec::new();
    while let Some(msg) = reader.poll_buffered().expect("parses") {
        got.push(msg);
    }
    assert_eq!(got.len(), 4, "exactly the four complete frames");
    for (i, msg) in got.iter().enumerate() {
        assert_eq!(msg.msg_type.raw(), 10 + i as u8);
    }

    tx.write_all(&fifth[12..]).await.expect("rest of fifth");
    let msg = reader.next_msg(&mut rx).await.expect("fifth completes");
    assert_eq!(msg.msg_type.raw(), 99);
    assert_eq!(msg.body, payload(40, 9));
}

#[tokio::test]
async fn test_zero_length_body_is_delivered_empty() {
    let stream = frame(7, Bytes::new());
    let got = deliver_chunked(&stream, &[stream.len()]).await;
    assert_eq!(got.len(), 1);
    assert!(got[0].1.is_empty());
}

#[tokio::test]
async fn test_single_message_mode_preserves_the_tail() {
    let a = frame(1, payload(100, 1));
    let b = frame(2, payload(50, 2));
    let mut stream = a.clone();
    stream.extend_from_slice(&b);

    let (mut tx, mut rx) = tokio::io::duplex(stream.len() + 1);
    tx.write_all(&stream).await.expect("write both frames");

    let mut reader = MsgReader::new(DEFAULT_MAX_BODY_LEN);
    let first = reader.next_msg(&mut rx).await.expect("first message");
    assert_eq!(first.msg_type.raw(), 1);
    // The second frame is still buffered, untouched.
    assert_eq!(reader.pending(), b.len());

    let second = reader.next_msg(&mut rx).await.expect("second message");
    assert_eq!(second.msg_type.raw(), 2);
    assert_eq!(reader.pending(), 0);
}

#[tokio::test]
async fn test_eof_is_connection_closed() {
    let (tx, mut rx) = tokio::io::duplex(16);
    drop(tx);
    let mut reader = MsgReader::new(DEFAULT_MAX_BODY_LEN);
    match reader.next_msg(&mut rx).await {
        Err(ConnError::ConnectionClosed) => {},
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_corrupted_header_poisons_the_stream() {
    let mut stream = frame(1, payload(10, 1));
    stream[HEADER_LEN - 1] ^= 0x40; // parity byte
    let (mut tx, mut rx) = tokio::io::duplex(64);
    tx.write_all(&stream).await.expect("write corrupt frame");

    let mut reader = MsgReader::new(DEFAULT_MAX_BODY_LEN);
    reader.fill(&mut rx).await.expect("fill");
    assert!(reader.poll_buffered().is_err());
}
