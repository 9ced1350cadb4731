// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection engine: socket ownership, framed send/receive paths, the
//! connection-setup handshake, and the request demultiplexer.

/// Shared helpers for the I/O paths.
pub mod common;
/// The connection driver: send FIFO, receive demux, shutdown fan-out.
pub mod connection;
/// Connection-fatal error taxonomy.
pub mod error;
/// Version and authentication exchange.
pub mod handshake;
/// Stream receive path.
pub mod recv;
/// Vector-I/O send path.
pub mod send;
