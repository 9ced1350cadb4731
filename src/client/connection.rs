// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection driver.
//!
//! A [`Connection`] owns one authenticated TCP socket and everything
//! multiplexed over it: the FIFO of messages waiting to be written, the
//! request-id → inbox demultiplexer for incoming messages, the yielded
//! request queue, and the single connection exception slot.
//!
//! Shutdown is one-shot and idempotent: the first error is recorded, every
//! live request is resumed with a clone of it, the socket tasks stop, and
//! all further registrations are rejected. A request that already had a
//! normal event queued observes that event first and the exception at its
//! following suspend.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rand::RngExt;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::hmac::Key,
    client::{
        common::RawMsg,
        error::{ConnError, ConnResult},
        handshake, recv::MsgReader, send,
    },
    request::{request::RequestOnConn, yield_queue::YieldQueue},
    wire::{fields::FieldReader, header::{DEFAULT_MAX_BODY_LEN, MsgType}},
};

/// Handler spawned by a node-side connection for each new request id.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type HandlerFactory = Arc<dyn Fn(RequestOnConn) -> HandlerFuture + Send + Sync>;

/// Tunables every connection carries.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    pub max_body_length: usize,
    pub io_timeout: Duration,
    pub tcp_nodelay: bool,
    /// Permitted |client − node| clock skew during authentication, seconds.
    pub auth_skew_limit: u64,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            max_body_length: DEFAULT_MAX_BODY_LEN,
            io_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            auth_skew_limit: 1800,
        }
    }
}

/// Which end of the connection this is. Request ids are namespaced per
/// direction so client- and node-assigned ids can never collide: clients
/// allocate odd ids, nodes even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Client,
    Node,
}

/// Internal resume message delivered to a request's inbox.
#[derive(Debug)]
pub(crate) struct Resume {
    /// Operation token echoed back for `Sent` / `YieldResumed`; 0 for kinds
    /// that are routed purely by the per-request inbox.
    pub token: u64,
    pub kind: ResumeKind,
}

#[derive(Debug)]
pub(crate) enum ResumeKind {
    Received(Bytes),
    Sent,
    YieldResumed,
    Signal(u8),
    Error(ConnError),
}

/// Claim state of a queued send: the writer claims it before touching the
/// socket, a racing cancellation claims it to drop the message instead.
#[derive(Debug, Default)]
pub(crate) struct SendClaim(AtomicU8);

const CLAIM_QUEUED: u8 = 0;
const CLAIM_WRITING: u8 = 1;
const CLAIM_CANCELLED: u8 = 2;

impl SendClaim {
    pub(crate) fn claim_for_write(&self) -> bool {
        self.0
            .compare_exchange(
                CLAIM_QUEUED,
                CLAIM_WRITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True if the message was still queued and is now dropped; false if the
    /// writer already owns it and a `Sent` resume is on its way.
    pub(crate) fn cancel(&self) -> bool {
        self.0
            .compare_exchange(
                CLAIM_QUEUED,
                CLAIM_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

pub(crate) struct SendJob {
    pub request_id: u64,
    pub token: u64,
    pub fields: Vec<Bytes>,
    pub claim: Arc<SendClaim>,
}

struct RequestSlot {
    event_tx: mpsc::UnboundedSender<Resume>,
    /// Wake-handle generation; a handle minted before the current generation
    /// is stale and firing it is a bug.
    generation: Arc<AtomicU64>,
}

/// One authenticated, multiplexed connection.
pub struct Connection {
    limits: ConnLimits,
    peer: SocketAddr,
    send_tx: mpsc::UnboundedSender<SendJob>,
    requests: DashMap<u64, RequestSlot>,
    next_request_id: AtomicU64,
    fault: OnceCell<ConnError>,
    cancel: CancellationToken,
    yields: YieldQueue,
    stats: Arc<ConnStats>,
    factory: Option<HandlerFactory>,
}

impl Connection {
    /// Connect to a node, run the client-side handshake, and start the
    /// driver tasks.
    pub async fn connect(
        addr: &str,
        name: &str,
        key: &Key,
        limits: ConnLimits,
    ) -> ConnResult<Arc<Self>> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnError::io("connect", e))?;
        stream
            .set_nodelay(limits.tcp_nodelay)
            .map_err(|e| ConnError::io("set_nodelay", e))?;

        handshake::client_authenticate(&mut stream, name, key, &limits).await?;
        Ok(Self::start(stream, limits, ConnRole::Client, None))
    }

    /// Wrap an already-authenticated socket. On the node side a factory
    /// spawns a handler for every request id not seen before.
    pub fn start(
        stream: TcpStream,
        limits: ConnLimits,
        role: ConnRole,
        factory: Option<HandlerFactory>,
    ) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (r, w) = stream.into_split();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            limits,
            peer,
            send_tx,
            requests: DashMap::new(),
            next_request_id: AtomicU64::new(match role {
                ConnRole::Client => 1,
                ConnRole::Node => 2,
            }),
            fault: OnceCell::new(),
            cancel: CancellationToken::new(),
            yields: YieldQueue::new(),
            stats: Arc::new(ConnStats::default()),
            factory,
        });

        tokio::spawn(Arc::clone(&conn).write_loop(w, send_rx));
        tokio::spawn(Arc::clone(&conn).read_loop(r));
        tokio::spawn(Arc::clone(&conn).yield_loop());

        conn
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn limits(&self) -> &ConnLimits {
        &self.limits
    }

    /// The recorded connection exception, if shutdown has begun.
    pub fn fault(&self) -> Option<ConnError> {
        self.fault.get().cloned()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Allocate the next request id and register a fresh request.
    pub fn new_request(self: &Arc<Self>) -> ConnResult<RequestOnConn> {
        if let Some(e) = self.fault.get() {
            return Err(e.clone());
        }
        let id = self.next_request_id.fetch_add(2, Ordering::Relaxed);
        Ok(self.install_request(id))
    }

    /// One-shot shutdown: record the exception, resume every live request
    /// with it, stop the socket tasks, reject further registrations.
    pub fn shutdown(&self, e: ConnError) {
        if self.fault.set(e.clone()).is_err() {
            return;
        }
        warn!(peer = %self.peer, error = %e, "connection shutdown");
        for slot in self.requests.iter() {
            let _ = slot.value().event_tx.send(Resume {
                token: 0,
                kind: ResumeKind::Error(e.clone()),
            });
        }
        self.cancel.cancel();
    }

    pub(crate) fn install_request(self: &Arc<Self>, id: u64) -> RequestOnConn {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(rand::rng().random()));
        self.requests.insert(id, RequestSlot {
            event_tx,
            generation: Arc::clone(&generation),
        });
        RequestOnConn::new(id, Arc::clone(self), event_rx, generation)
    }

    pub(crate) fn release_request(&self, id: u64) {
        self.requests.remove(&id);
        self.yields.remove(id);
    }

    pub(crate) fn enqueue_send(&self, job: SendJob) -> ConnResult<()> {
        if let Some(e) = self.fault.get() {
            return Err(e.clone());
        }
        self.send_tx
            .send(job)
            .map_err(|_| self.fault().unwrap_or(ConnError::ConnectionClosed))
    }

    pub(crate) fn enqueue_yield(&self, id: u64, token: u64) -> ConnResult<()> {
        if let Some(e) = self.fault.get() {
            return Err(e.clone());
        }
        self.yields.enqueue(id, token);
        Ok(())
    }

    pub(crate) fn resume(&self, id: u64, token: u64, kind: ResumeKind) {
        if let Some(slot) = self.requests.get(&id) {
            let _ = slot.event_tx.send(Resume { token, kind });
        }
    }

    /// Wake-handle generation for `id`, or `None` once released.
    pub(crate) fn generation_of(&self, id: u64) -> Option<Arc<AtomicU64>> {
        self.requests.get(&id).map(|s| Arc::clone(&s.generation))
    }

    async fn write_loop(
        self: Arc<Self>,
        mut w: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<SendJob>,
    ) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => return,
                j = rx.recv() => match j {
                    Some(j) => j,
                    None => return,
                },
            };
            if !job.claim.claim_for_write() {
                continue;
            }
            match send::write_msg(&mut w, job.fields, &self.stats).await {
                Ok(()) => self.resume(job.request_id, job.token, ResumeKind::Sent),
                Err(e) => {
                    self.shutdown(e);
                    return;
                },
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut r: OwnedReadHalf) {
        let mut reader = MsgReader::new(self.limits.max_body_length);
        loop {
            // Drain every complete buffered message before reading again.
            loop {
                match reader.poll_buffered() {
                    Ok(Some(msg)) => {
                        self.stats.account_msg_in(msg.body.len());
                        if let Err(e) = self.dispatch_msg(msg) {
                            self.shutdown(e);
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(we) => {
                        self.shutdown(we.into());
                        return;
                    },
                }
            }

            let n = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = reader.fill(&mut r) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        self.shutdown(e);
                        return;
                    },
                },
            };
            if n == 0 {
                self.shutdown(ConnError::ConnectionClosed);
                return;
            }
            self.stats.account_read_call(n);
        }
    }

    fn dispatch_msg(self: &Arc<Self>, msg: RawMsg) -> ConnResult<()> {
        if msg.msg_type == MsgType::AUTHENTICATION {
            return Err(ConnError::protocol(
                "authentication message after handshake",
            ));
        }

        let mut rd = FieldReader::new(&msg.body);
        let id = rd.u64("request id")?;
        let payload = msg.body.slice(msg.body.len() - rd.remaining()..);

        if let Some(slot) = self.requests.get(&id) {
            let _ = slot.event_tx.send(Resume {
                token: 0,
                kind: ResumeKind::Received(payload),
            });
            return Ok(());
        }

        let Some(factory) = &self.factory else {
            return Err(ConnError::protocol(format!(
                "message for unknown request id {id}"
            )));
        };

        // A request installed after the shutdown fan-out would never see the
        // exception; drop the message instead of spawning a handler nothing
        // can wake.
        if self.fault.get().is_some() {
            return Ok(());
        }

        // First message of a request the peer just opened: install the
        // request, queue the message so the handler's first receive sees it,
        // then hand the request to the application.
        debug!(peer = %self.peer, request_id = id, "new incoming request");
        let req = self.install_request(id);
        self.resume(id, 0, ResumeKind::Received(payload));
        // A shutdown that began between the guard above and the insert may
        // have finished its fan-out without this slot; the exception must
        // still reach the handler's next suspend.
        if let Some(e) = self.fault.get() {
            self.resume(id, 0, ResumeKind::Error(e.clone()));
        }
        tokio::spawn(factory.as_ref()(req));
        Ok(())
    }

    async fn yield_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                () = self.yields.armed() => {},
            }
            for (id, token) in self.yields.drain() {
                self.resume(id, token, ResumeKind::YieldResumed);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("live_requests", &self.requests.len())
            .field("fault", &self.fault.get())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observability counters

const HISTOGRAM_BUCKETS: usize = 25;

/// Log2-bucket size histogram: bucket `i` counts values in `[2^i, 2^(i+1))`,
/// the last bucket absorbs everything larger.
#[derive(Debug, Default)]
pub struct SizeHistogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl SizeHistogram {
    fn record(&self, size: usize) {
        let idx = if size == 0 {
            0
        } else {
            (usize::BITS - 1 - size.leading_zeros()) as usize
        };
        let idx = idx.min(HISTOGRAM_BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> [u64; HISTOGRAM_BUCKETS] {
        let mut out = [0u64; HISTOGRAM_BUCKETS];
        for (o, b) in out.iter_mut().zip(self.buckets.iter()) {
            *o = b.load(Ordering::Relaxed);
        }
        out
    }
}

/// Per-connection counters, updated atomically with their I/O events.
#[derive(Debug, Default)]
pub struct ConnStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
    read_calls: AtomicU64,
    write_calls: AtomicU64,
    io_waits: AtomicU64,
    msg_size_in: SizeHistogram,
    msg_size_out: SizeHistogram,
}

impl ConnStats {
    pub(crate) fn account_write_call(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.write_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_read_call(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        self.read_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_io_wait(&self) {
        self.io_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_msg_out(&self, len: usize) {
        self.msgs_out.fetch_add(1, Ordering::Relaxed);
        self.msg_size_out.record(len);
    }

    pub(crate) fn account_msg_in(&self, len: usize) {
        self.msgs_in.fetch_add(1, Ordering::Relaxed);
        self.msg_size_in.record(len);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            msgs_in: self.msgs_in.load(Ordering::Relaxed),
            msgs_out: self.msgs_out.load(Ordering::Relaxed),
            read_calls: self.read_calls.load(Ordering::Relaxed),
            write_calls: self.write_calls.load(Ordering::Relaxed),
            io_waits: self.io_waits.load(Ordering::Relaxed),
            msg_size_in: self.msg_size_in.snapshot(),
            msg_size_out: self.msg_size_out.snapshot(),
        }
    }
}

/// Readable point-in-time copy of [`ConnStats`].
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub read_calls: u64,
    pub write_calls: u64,
    pub io_waits: u64,
    pub msg_size_in: [u64; HISTOGRAM_BUCKETS],
    pub msg_size_out: [u64; HISTOGRAM_BUCKETS],
}
