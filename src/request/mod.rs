// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The request side of the engine: one cooperative handler per request id,
//! multiplexed over a shared connection, with an optional per-request event
//! dispatcher for handlers that split work across several coroutines.

/// Fan-out of message types, signals, send readiness, and yields inside one
/// request.
pub mod dispatcher;
/// The request-on-connection handle and its suspend/resume operations.
pub mod request;
/// Controller-to-worker pause handshake.
pub mod suspender;
/// Requests waiting to be resumed at the next loop turn.
pub mod yield_queue;
