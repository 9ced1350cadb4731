// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Intra-request event dispatcher.
//!
//! A request may split its work across several coroutines (say, a reader
//! streaming records and a controller watching for a stop condition). The
//! dispatcher is a reactor local to that one request: it pumps the
//! connection's event stream and fans four event kinds out to the coroutine
//! that registered interest:
//!
//! 1. **Messages by type** — the first body byte of every request-scoped
//!    message is a type discriminator; at most one coroutine may await each
//!    type, and a collision is a programmer error that fails loudly.
//! 2. **Signals** — `u8` codes passed coroutine to coroutine. Fired while
//!    the target runs, they queue; fired while it waits, they resume it.
//! 3. **Send readiness** — any number may register; exactly one holds the
//!    send slot at a time, strictly FIFO.
//! 4. **Yield** — all registrations are resumed together at the next loop
//!    turn, in registration order.
//!
//! A connection exception aborts every registered coroutine by resuming it
//! with the exception, then rethrows out of [`EventDispatcher::run`].

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    client::error::{ConnError, ConnResult},
    request::request::{EventFlags, RequestOnConn, ResumeCode},
    wire::{fields::FieldWriter, header::MsgType},
};

/// Identity of a coroutine inside one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u32);

enum Cmd {
    AwaitMessage { fiber: FiberId, ty: u8 },
    AwaitSignal { fiber: FiberId, code: u8 },
    FireSignal { code: u8 },
    Send { fiber: FiberId, msg_type: MsgType, body: FieldWriter },
    Yield { fiber: FiberId },
    Abort { by: FiberId, target: FiberId },
    Done { fiber: FiberId },
}

#[derive(Debug)]
enum FiberWake {
    Message(Bytes),
    SignalFired,
    Sent,
    Yielded,
    Fault(ConnError),
}

/// The capability handle a coroutine suspends through.
pub struct FiberCtx {
    id: FiberId,
    cmd: mpsc::UnboundedSender<Cmd>,
    wake: mpsc::UnboundedReceiver<FiberWake>,
}

impl FiberCtx {
    pub fn id(&self) -> FiberId {
        self.id
    }

    async fn wake(&mut self) -> ConnResult<FiberWake> {
        match self.wake.recv().await {
            Some(FiberWake::Fault(e)) => Err(e),
            Some(w) => Ok(w),
            None => Err(ConnError::ConnectionClosed),
        }
    }

    /// Suspend until a message with type discriminator `ty` arrives; the
    /// returned body has the discriminator stripped.
    pub async fn expect_message(&mut self, ty: u8) -> ConnResult<Bytes> {
        let _ = self.cmd.send(Cmd::AwaitMessage { fiber: self.id, ty });
        match self.wake().await? {
            FiberWake::Message(b) => Ok(b),
            other => panic!("unexpected wake {other:?} while awaiting message {ty}"),
        }
    }

    /// Suspend until another coroutine fires `code`.
    pub async fn wait_signal(&mut self, code: u8) -> ConnResult<()> {
        let _ = self.cmd.send(Cmd::AwaitSignal { fiber: self.id, code });
        match self.wake().await? {
            FiberWake::SignalFired => Ok(()),
            other => panic!("unexpected wake {other:?} while awaiting signal {code}"),
        }
    }

    /// Fire a signal at whichever coroutine of this request awaits `code`;
    /// queued if none does yet.
    pub fn fire_signal(&self, code: u8) {
        let _ = self.cmd.send(Cmd::FireSignal { code });
    }

    /// Queue for the send slot and suspend until the message is written.
    pub async fn send(&mut self, msg_type: MsgType, body: FieldWriter) -> ConnResult<()> {
        let _ = self.cmd.send(Cmd::Send {
            fiber: self.id,
            msg_type,
            body,
        });
        match self.wake().await? {
            FiberWake::Sent => Ok(()),
            other => panic!("unexpected wake {other:?} while sending"),
        }
    }

    /// Resume after one event-loop turn, together with every other
    /// yield-registered coroutine.
    pub async fn yield_once(&mut self) -> ConnResult<()> {
        let _ = self.cmd.send(Cmd::Yield { fiber: self.id });
        match self.wake().await? {
            FiberWake::Yielded => Ok(()),
            other => panic!("unexpected wake {other:?} while yielded"),
        }
    }

    /// Cancel another coroutine of this request: all its registrations are
    /// dropped and its task is killed. Aborting oneself is not permitted.
    pub fn abort(&self, target: FiberId) {
        assert_ne!(self.id, target, "a coroutine cannot abort itself");
        let _ = self.cmd.send(Cmd::Abort {
            by: self.id,
            target,
        });
    }
}

struct FiberState {
    wake_tx: mpsc::UnboundedSender<FiberWake>,
    join: JoinHandle<()>,
}

/// Reactor multiplexing one request's coroutines over the shared
/// connection.
pub struct EventDispatcher {
    req: RequestOnConn,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    fibers: HashMap<FiberId, FiberState>,
    msg_waiters: HashMap<u8, FiberId>,
    /// Messages that arrived between a consume and the next registration of
    /// their type; drained before the connection on registration.
    pending_messages: HashMap<u8, VecDeque<Bytes>>,
    signal_waiters: HashMap<u8, FiberId>,
    pending_signals: VecDeque<u8>,
    send_queue: VecDeque<(FiberId, MsgType, FieldWriter)>,
    send_in_flight: Option<FiberId>,
    yield_waiters: Vec<FiberId>,
    yield_armed: bool,
    next_fiber: u32,
}

enum LoopEvent {
    Cmd(Cmd),
    Conn(ConnResult<ResumeCode>),
}

impl EventDispatcher {
    pub fn new(req: RequestOnConn) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            req,
            cmd_tx,
            cmd_rx,
            fibers: HashMap::new(),
            msg_waiters: HashMap::new(),
            pending_messages: HashMap::new(),
            signal_waiters: HashMap::new(),
            pending_signals: VecDeque::new(),
            send_queue: VecDeque::new(),
            send_in_flight: None,
            yield_waiters: Vec::new(),
            yield_armed: false,
            next_fiber: 0,
        }
    }

    pub fn request(&self) -> &RequestOnConn {
        &self.req
    }

    /// Spawn a coroutine of this request.
    pub fn spawn<F, Fut>(&mut self, f: F) -> FiberId
    where
        F: FnOnce(FiberCtx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = FiberId(self.next_fiber);
        self.next_fiber += 1;

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let ctx = FiberCtx {
            id,
            cmd: self.cmd_tx.clone(),
            wake: wake_rx,
        };
        let done_tx = self.cmd_tx.clone();
        let fut = f(ctx);
        let join = tokio::spawn(async move {
            fut.await;
            let _ = done_tx.send(Cmd::Done { fiber: id });
        });
        self.fibers.insert(id, FiberState { wake_tx, join });
        id
    }

    /// Pump events until every coroutine has finished, handing the request
    /// back for further use. A connection exception aborts every coroutine
    /// with it and rethrows.
    pub async fn run(mut self) -> ConnResult<RequestOnConn> {
        loop {
            self.flush_signals();

            if self.send_in_flight.is_none()
                && let Some((fiber, msg_type, body)) = self.send_queue.pop_front()
            {
                if let Err(e) = self.req.begin_send(msg_type, body) {
                    return Err(self.abort_all(e));
                }
                self.send_in_flight = Some(fiber);
            }

            if !self.yield_waiters.is_empty() && !self.yield_armed {
                if let Err(e) = self.req.begin_yield() {
                    return Err(self.abort_all(e));
                }
                self.yield_armed = true;
            }

            if self.fibers.is_empty() {
                return Ok(self.req);
            }

            let mut flags = EventFlags::RECEIVE | EventFlags::RESUME;
            if self.send_in_flight.is_some() {
                flags |= EventFlags::SENT;
            }
            if self.yield_armed {
                flags |= EventFlags::YIELD;
            }

            let ev = {
                let req = &mut self.req;
                let cmd_rx = &mut self.cmd_rx;
                tokio::select! {
                    biased;
                    cmd = cmd_rx.recv() => {
                        LoopEvent::Cmd(cmd.expect("dispatcher holds a sender"))
                    },
                    code = req.next_event(flags) => LoopEvent::Conn(code),
                }
            };

            match ev {
                LoopEvent::Cmd(cmd) => self.apply(cmd),
                LoopEvent::Conn(Ok(code)) => {
                    if let Err(e) = self.route(code) {
                        return Err(self.abort_all(e));
                    }
                },
                LoopEvent::Conn(Err(e)) => return Err(self.abort_all(e)),
            }
        }
    }

    fn apply(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::AwaitMessage { fiber, ty } => {
                if let Some(body) = self
                    .pending_messages
                    .get_mut(&ty)
                    .and_then(VecDeque::pop_front)
                {
                    self.wake(fiber, FiberWake::Message(body));
                    return;
                }
                let prev = self.msg_waiters.insert(ty, fiber);
                assert!(
                    prev.is_none(),
                    "two coroutines awaiting message type {ty}"
                );
            },
            Cmd::AwaitSignal { fiber, code } => {
                if let Some(pos) = self.pending_signals.iter().position(|&c| c == code) {
                    self.pending_signals.remove(pos);
                    self.wake(fiber, FiberWake::SignalFired);
                } else {
                    let prev = self.signal_waiters.insert(code, fiber);
                    assert!(prev.is_none(), "two coroutines awaiting signal {code}");
                }
            },
            Cmd::FireSignal { code } => match self.signal_waiters.remove(&code) {
                Some(fiber) => self.wake(fiber, FiberWake::SignalFired),
                None => self.pending_signals.push_back(code),
            },
            Cmd::Send {
                fiber,
                msg_type,
                body,
            } => self.send_queue.push_back((fiber, msg_type, body)),
            Cmd::Yield { fiber } => self.yield_waiters.push(fiber),
            Cmd::Abort { by, target } => {
                assert_ne!(by, target, "a coroutine cannot abort itself");
                self.abort(target);
            },
            Cmd::Done { fiber } => {
                self.unregister(fiber);
                self.fibers.remove(&fiber);
            },
        }
    }

    fn route(&mut self, code: ResumeCode) -> ConnResult<()> {
        match code {
            ResumeCode::Sent => {
                let fiber = self
                    .send_in_flight
                    .take()
                    .expect("sent event with no nominated sender");
                self.wake(fiber, FiberWake::Sent);
            },
            ResumeCode::Received(body) => {
                let Some(&ty) = body.first() else {
                    return Err(self
                        .req
                        .shutdown_with_protocol_error("empty request-scoped body"));
                };
                let payload = body.slice(1..);
                match self.msg_waiters.remove(&ty) {
                    Some(fiber) => self.wake(fiber, FiberWake::Message(payload)),
                    // The consumer is between messages; hold it until the
                    // type is awaited again.
                    None => self
                        .pending_messages
                        .entry(ty)
                        .or_default()
                        .push_back(payload),
                }
            },
            ResumeCode::Signal(code) => match self.signal_waiters.remove(&code) {
                Some(fiber) => self.wake(fiber, FiberWake::SignalFired),
                None => self.pending_signals.push_back(code),
            },
            ResumeCode::YieldResumed => {
                self.yield_armed = false;
                for fiber in std::mem::take(&mut self.yield_waiters) {
                    self.wake(fiber, FiberWake::Yielded);
                }
            },
        }
        Ok(())
    }

    fn flush_signals(&mut self) {
        let mut undelivered = VecDeque::new();
        while let Some(code) = self.pending_signals.pop_front() {
            match self.signal_waiters.remove(&code) {
                Some(fiber) => self.wake(fiber, FiberWake::SignalFired),
                None => undelivered.push_back(code),
            }
        }
        self.pending_signals = undelivered;
    }

    /// Delivery is not cancelled mid-flight: once a wake is queued at the
    /// coroutine it stays delivered even if the registration set changes
    /// afterwards.
    fn wake(&self, fiber: FiberId, wake: FiberWake) {
        if let Some(st) = self.fibers.get(&fiber) {
            let _ = st.wake_tx.send(wake);
        }
    }

    fn unregister(&mut self, fiber: FiberId) {
        self.msg_waiters.retain(|_, f| *f != fiber);
        self.signal_waiters.retain(|_, f| *f != fiber);
        self.send_queue.retain(|(f, ..)| *f != fiber);
        self.yield_waiters.retain(|f| *f != fiber);
        // An in-flight send keeps its slot; the completion is dropped at
        // wake() once the fiber is gone.
    }

    /// Drop every registration for `target` and kill its task.
    pub fn abort(&mut self, target: FiberId) {
        self.unregister(target);
        if let Some(st) = self.fibers.remove(&target) {
            st.join.abort();
        }
    }

    fn abort_all(&mut self, e: ConnError) -> ConnError {
        for (_, st) in self.fibers.drain() {
            let _ = st.wake_tx.send(FiberWake::Fault(e.clone()));
        }
        self.msg_waiters.clear();
        self.pending_messages.clear();
        self.signal_waiters.clear();
        self.pending_signals.clear();
        self.send_queue.clear();
        self.send_in_flight = None;
        self.yield_waiters.clear();
        e
    }
}
