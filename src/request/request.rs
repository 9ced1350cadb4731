// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One cooperative request handler bound to one connection.
//!
//! A [`RequestOnConn`] suspends only inside the operations below; between
//! them the handler runs without observable interleaving. Each suspend is
//! paired with a resume carrying an event code: `Received = −1`,
//! `Sent = −2`, `YieldResumed = −3`, and non-negative application signals
//! fired through a [`RequestHandle`].
//!
//! Send/yield rendezvous carry a per-operation token minted from a
//! randomly-seeded counter; a resume echoing a stale token is a routing bug
//! and panics. Cross-task wake handles snapshot a generation stamp for the
//! same purpose.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bitflags::bitflags;
use bytes::Bytes;
use rand::RngExt;
use tokio::sync::mpsc;

use crate::{
    client::{
        connection::{Connection, Resume, ResumeKind, SendClaim, SendJob},
        error::{ConnError, ConnResult},
    },
    wire::fields::{FieldReader, FieldWriter, WireValue},
    wire::header::MsgType,
};

bitflags! {
    /// Which events the caller of [`RequestOnConn::next_event`] is prepared
    /// to handle. Anything else arriving is a programming error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const RECEIVE = 0b0001;
        const SENT    = 0b0010;
        const YIELD   = 0b0100;
        const RESUME  = 0b1000;
    }
}

/// The event that ended a suspension.
#[derive(Debug)]
pub enum ResumeCode {
    Received(Bytes),
    Sent,
    YieldResumed,
    Signal(u8),
}

impl ResumeCode {
    pub const RECEIVED: i32 = -1;
    pub const SENT: i32 = -2;
    pub const YIELD_RESUMED: i32 = -3;

    /// Numeric code: reserved negatives, signals as their `u8` value.
    pub fn code(&self) -> i32 {
        match self {
            ResumeCode::Received(_) => Self::RECEIVED,
            ResumeCode::Sent => Self::SENT,
            ResumeCode::YieldResumed => Self::YIELD_RESUMED,
            ResumeCode::Signal(c) => i32::from(*c),
        }
    }
}

/// Outcome of [`RequestOnConn::send_receive`].
#[derive(Debug)]
pub enum SendReceive<R> {
    /// The send hit the wire before anything arrived.
    Sent,
    /// A message arrived first; the send was cancelled and the callback ran.
    Received(R),
}

/// A single request multiplexed on a shared connection.
pub struct RequestOnConn {
    id: u64,
    conn: Arc<Connection>,
    inbox: mpsc::UnboundedReceiver<Resume>,
    generation: Arc<AtomicU64>,
    token_counter: u64,
    /// Token and claim of the send currently in the connection FIFO.
    pending_send: Option<(u64, Arc<SendClaim>)>,
    /// Token of an armed yield registration.
    pending_yield: Option<u64>,
    /// Payload handed to a receive callback; must be empty at every suspend.
    pending_recv: Option<Bytes>,
    /// Messages that arrived while this request was suspended for something
    /// other than receive; consumed before the inbox on the next receive.
    stashed_recv: VecDeque<Bytes>,
    /// Recorded connection exception; observed once, then every operation
    /// fails fast.
    dead: Option<ConnError>,
}

impl RequestOnConn {
    pub(crate) fn new(
        id: u64,
        conn: Arc<Connection>,
        inbox: mpsc::UnboundedReceiver<Resume>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            conn,
            inbox,
            generation,
            token_counter: rand::rng().random(),
            pending_send: None,
            pending_yield: None,
            pending_recv: None,
            stashed_recv: VecDeque::new(),
            dead: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Handle for other tasks to signal this request. The handle embeds the
    /// current generation stamp; firing it after
    /// [`invalidate_wake_handles`](Self::invalidate_wake_handles) panics.
    pub fn wake_handle(&self) -> RequestHandle {
        RequestHandle {
            conn: Arc::clone(&self.conn),
            id: self.id,
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Invalidate every handle minted so far.
    pub fn invalidate_wake_handles(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn next_token(&mut self) -> u64 {
        self.token_counter = self.token_counter.wrapping_add(1);
        self.token_counter
    }

    fn check_dead(&self) -> ConnResult<()> {
        match &self.dead {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Pop the next resume. The receive payload invariant is asserted at
    /// every suspend entry; a recorded connection exception is returned
    /// instead of suspending.
    async fn next_resume(&mut self) -> ConnResult<Resume> {
        assert!(
            self.pending_recv.is_none(),
            "receive payload not consumed before suspend"
        );
        self.check_dead()?;
        match self.inbox.recv().await {
            Some(Resume {
                kind: ResumeKind::Error(e),
                ..
            }) => {
                self.dead = Some(e.clone());
                Err(e)
            },
            Some(r) => Ok(r),
            None => {
                let e = self.conn.fault().unwrap_or(ConnError::ConnectionClosed);
                self.dead = Some(e.clone());
                Err(e)
            },
        }
    }

    /// Queue a message into the connection's send FIFO without waiting for
    /// it. The completion arrives as a `Sent` event.
    pub fn begin_send(&mut self, msg_type: MsgType, body: FieldWriter) -> ConnResult<()> {
        self.check_dead()?;
        assert!(
            self.pending_send.is_none(),
            "a send is already pending on this request"
        );
        let fields = body.into_request_message(
            self.id,
            msg_type,
            self.conn.limits().max_body_length,
        )?;
        let token = self.next_token();
        let claim = Arc::new(SendClaim::default());
        self.conn.enqueue_send(SendJob {
            request_id: self.id,
            token,
            fields,
            claim: Arc::clone(&claim),
        })?;
        self.pending_send = Some((token, claim));
        Ok(())
    }

    fn take_sent(&mut self, echoed: u64) {
        let (token, _) = self
            .pending_send
            .take()
            .expect("sent resume without a pending send");
        assert_eq!(echoed, token, "stale fiber resume token");
    }

    /// Queue the message and suspend until it is fully written. A message
    /// arriving in the meantime is a protocol error that shuts the
    /// connection down; any other resume is a bug.
    pub async fn send(&mut self, msg_type: MsgType, body: FieldWriter) -> ConnResult<()> {
        self.begin_send(msg_type, body)?;
        let resume = self.next_resume().await?;
        match resume.kind {
            ResumeKind::Sent => {
                self.take_sent(resume.token);
                Ok(())
            },
            ResumeKind::Received(_) => {
                let e = ConnError::protocol(
                    "message received while a plain send was pending",
                );
                self.conn.shutdown(e.clone());
                self.dead = Some(e.clone());
                Err(e)
            },
            other => panic!("unexpected resume {other:?} during plain send"),
        }
    }

    /// Like [`send`](Self::send), but external events are handed back to the
    /// caller instead of being asserted out. Returns the first event; when
    /// it is not `Sent`, the send is still pending and its completion must
    /// be collected through [`next_event`](Self::next_event).
    pub async fn send_and_handle_events(
        &mut self,
        msg_type: MsgType,
        body: FieldWriter,
    ) -> ConnResult<ResumeCode> {
        self.begin_send(msg_type, body)?;
        let resume = self.next_resume().await?;
        match resume.kind {
            ResumeKind::Sent => {
                self.take_sent(resume.token);
                Ok(ResumeCode::Sent)
            },
            ResumeKind::Received(b) => Ok(ResumeCode::Received(b)),
            ResumeKind::Signal(c) => Ok(ResumeCode::Signal(c)),
            ResumeKind::YieldResumed => {
                panic!("unexpected yield resume during send_and_handle_events")
            },
            ResumeKind::Error(_) => unreachable!("filtered by next_resume"),
        }
    }

    /// Suspend until a message for this request arrives and run the callback
    /// on its payload. The payload slice is valid only inside the callback.
    pub async fn receive<R>(
        &mut self,
        f: impl FnOnce(&[u8]) -> R,
    ) -> ConnResult<R> {
        self.check_dead()?;
        if let Some(body) = self.stashed_recv.pop_front() {
            return Ok(self.consume_payload(body, f));
        }
        let resume = self.next_resume().await?;
        match resume.kind {
            ResumeKind::Received(body) => Ok(self.consume_payload(body, f)),
            other => panic!("unexpected resume {other:?} during plain receive"),
        }
    }

    fn consume_payload<R>(&mut self, body: Bytes, f: impl FnOnce(&[u8]) -> R) -> R {
        self.pending_recv = Some(body);
        let out = {
            let body = self.pending_recv.as_deref().expect("just set");
            f(body)
        };
        self.pending_recv = None;
        out
    }

    /// Receive a body consisting of exactly one primitive field.
    pub async fn receive_value<T: WireValue>(&mut self) -> ConnResult<T> {
        let parsed: Result<T, ConnError> = self
            .receive(|body| {
                let mut rd = FieldReader::new(body);
                let v = T::read(&mut rd)?;
                if rd.remaining() != 0 {
                    return Err(ConnError::protocol(
                        "trailing bytes after single-value body",
                    ));
                }
                Ok(v)
            })
            .await?;
        match parsed {
            Ok(v) => Ok(v),
            Err(e) => {
                self.conn.shutdown(e.clone());
                self.dead = Some(e.clone());
                Err(e)
            },
        }
    }

    /// Race a send against the next incoming message. If the message wins,
    /// the queued send is cancelled (or, if the writer already owns it, its
    /// completion is absorbed) and the callback runs.
    pub async fn send_receive<R>(
        &mut self,
        f: impl FnOnce(&[u8]) -> R,
        msg_type: MsgType,
        body: FieldWriter,
    ) -> ConnResult<SendReceive<R>> {
        self.begin_send(msg_type, body)?;
        let resume = self.next_resume().await?;
        match resume.kind {
            ResumeKind::Sent => {
                self.take_sent(resume.token);
                Ok(SendReceive::Sent)
            },
            ResumeKind::Received(payload) => {
                let (_, claim) = self
                    .pending_send
                    .take()
                    .expect("send_receive without a pending send");
                if !claim.cancel() {
                    // The writer claimed the job first: its `Sent` is on the
                    // way and must not leak into a later suspend.
                    match self.next_resume().await {
                        Ok(Resume {
                            kind: ResumeKind::Sent,
                            ..
                        }) => {},
                        Ok(Resume {
                            kind: ResumeKind::Received(_),
                            ..
                        }) => {
                            let e = ConnError::protocol(
                                "message received while completing a cancelled send",
                            );
                            self.conn.shutdown(e.clone());
                            self.dead = Some(e.clone());
                            return Err(e);
                        },
                        Ok(other) => panic!(
                            "unexpected resume {:?} while absorbing a sent completion",
                            other.kind
                        ),
                        // Connection died mid-race; the receive still won,
                        // the error resurfaces at the next suspend.
                        Err(_) => {},
                    }
                }
                Ok(SendReceive::Received(self.consume_payload(payload, f)))
            },
            other => panic!("unexpected resume {other:?} during send_receive"),
        }
    }

    /// Register for the next loop turn without waiting.
    pub fn begin_yield(&mut self) -> ConnResult<()> {
        self.check_dead()?;
        assert!(
            self.pending_yield.is_none(),
            "a yield is already pending on this request"
        );
        let token = self.next_token();
        self.conn.enqueue_yield(self.id, token)?;
        self.pending_yield = Some(token);
        Ok(())
    }

    fn take_yield(&mut self, echoed: u64) {
        let token = self
            .pending_yield
            .take()
            .expect("yield resume without a pending yield");
        assert_eq!(echoed, token, "stale fiber resume token");
    }

    /// Let every other runnable coroutine take a turn.
    pub async fn yield_now(&mut self) -> ConnResult<()> {
        self.begin_yield()?;
        loop {
            let resume = self.next_resume().await?;
            match resume.kind {
                ResumeKind::YieldResumed => {
                    self.take_yield(resume.token);
                    return Ok(());
                },
                ResumeKind::Received(b) => self.stashed_recv.push_back(b),
                other => panic!("unexpected resume {other:?} during yield"),
            }
        }
    }

    /// Yield every `every`-th call; cheap enough for tight loops.
    pub async fn periodic_yield(
        &mut self,
        counter: &mut u32,
        every: u32,
    ) -> ConnResult<()> {
        *counter += 1;
        if *counter >= every {
            *counter = 0;
            self.yield_now().await?;
        }
        Ok(())
    }

    /// Terminate the whole connection; every other request on it observes
    /// `e` at its next suspend.
    pub fn shutdown_connection(&self, e: ConnError) {
        self.conn.shutdown(e);
    }

    /// Shut down with a protocol error stamped with the caller's location.
    #[track_caller]
    pub fn shutdown_with_protocol_error(&mut self, msg: impl Into<String>) -> ConnError {
        let e = ConnError::protocol(msg);
        self.conn.shutdown(e.clone());
        self.dead = Some(e.clone());
        e
    }

    /// Dispatcher primitive: suspend until any event allowed by `flags`
    /// happens. Events outside the mask are programming errors, except
    /// messages, which are stashed when receive is not selected.
    pub async fn next_event(&mut self, flags: EventFlags) -> ConnResult<ResumeCode> {
        self.check_dead()?;
        if flags.contains(EventFlags::RECEIVE)
            && let Some(b) = self.stashed_recv.pop_front()
        {
            return Ok(ResumeCode::Received(b));
        }
        loop {
            let resume = self.next_resume().await?;
            match resume.kind {
                ResumeKind::Received(b) => {
                    if flags.contains(EventFlags::RECEIVE) {
                        return Ok(ResumeCode::Received(b));
                    }
                    self.stashed_recv.push_back(b);
                },
                ResumeKind::Sent => {
                    assert!(
                        flags.contains(EventFlags::SENT),
                        "sent resume outside a send window"
                    );
                    self.take_sent(resume.token);
                    return Ok(ResumeCode::Sent);
                },
                ResumeKind::YieldResumed => {
                    assert!(
                        flags.contains(EventFlags::YIELD),
                        "yield resume without a yield registration"
                    );
                    self.take_yield(resume.token);
                    return Ok(ResumeCode::YieldResumed);
                },
                ResumeKind::Signal(c) => {
                    assert!(
                        flags.contains(EventFlags::RESUME),
                        "signal {c} fired at a request not accepting signals"
                    );
                    return Ok(ResumeCode::Signal(c));
                },
                ResumeKind::Error(_) => unreachable!("filtered by next_resume"),
            }
        }
    }
}

impl Drop for RequestOnConn {
    fn drop(&mut self) {
        self.conn.release_request(self.id);
    }
}

impl std::fmt::Debug for RequestOnConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOnConn")
            .field("id", &self.id)
            .field("send_pending", &self.pending_send.is_some())
            .field("yield_pending", &self.pending_yield.is_some())
            .field("dead", &self.dead)
            .finish()
    }
}

/// Cloneable cross-task handle to a live request.
#[derive(Clone)]
pub struct RequestHandle {
    conn: Arc<Connection>,
    id: u64,
    generation: u64,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resume the request's coroutine with an application signal code.
    ///
    /// Panics if the request invalidated its handles or was released: a
    /// stale handle firing is a routing bug, not a runtime condition.
    pub fn resume_fiber(&self, code: u8) {
        let current = self
            .conn
            .generation_of(self.id)
            .unwrap_or_else(|| panic!("resume of released request {}", self.id));
        assert_eq!(
            current.load(Ordering::Acquire),
            self.generation,
            "stale fiber resume token"
        );
        self.conn
            .resume(self.id, 0, ResumeKind::Signal(code));
    }

    pub fn shutdown_connection(&self, e: ConnError) {
        self.conn.shutdown(e);
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}
