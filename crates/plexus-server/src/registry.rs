//! The session registry: sole owner of the routing table.
//!
//! One task runs [`Registry::run`] and serializes everything that touches
//! the table: handshakes, teardown, outbound dispatch, and delivery of
//! inbound messages to the [`Handler`]. Everyone else talks to it through a
//! cloneable [`RegistryHandle`].
//!
//! A connection goes Connecting → PendingRegister → Established → Closed,
//! or Connecting → Aborted when the handler declines it. The identity is
//! assigned before the session is published, so dispatch never sees a
//! half-built session.

use crate::handler::{ConnectionMeta, Handler};
use crate::pump::{self, PumpExit};
use crate::router::Router;
use crate::session::{Phase, Session};
use plexus_core::{
    ClientId, Envelope, FrameWriter, PlexusError, PlexusResult, Transport, WireFormat,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What to do when the handler assigns an identity that is already
/// established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateIdentity {
    /// Abort the new connection and keep the existing session.
    #[default]
    Reject,
    /// Close the existing session, then establish the new one.
    Replace,
}

impl std::str::FromStr for DuplicateIdentity {
    type Err = PlexusError;

    fn from_str(s: &str) -> PlexusResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(PlexusError::Config(format!(
                "unknown duplicate identity policy: {other} (expected reject or replace)"
            ))),
        }
    }
}

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Per-session outbound queue length.
    pub mailbox_capacity: usize,
    /// Shared inbound queue length; full means readers wait.
    pub inbound_capacity: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    pub wire_format: WireFormat,
    pub duplicate_identity: DuplicateIdentity,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            inbound_capacity: 64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            wire_format: WireFormat::Json,
            duplicate_identity: DuplicateIdentity::Reject,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> PlexusResult<()> {
        if self.mailbox_capacity == 0 {
            return Err(PlexusError::Config("mailbox_capacity must be > 0".into()));
        }
        if self.inbound_capacity == 0 {
            return Err(PlexusError::Config("inbound_capacity must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(PlexusError::Config("max_message_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently in the routing table.
    pub established: usize,
    /// Handshakes that reached Established.
    pub accepted: u64,
    /// Handshakes that ended Aborted.
    pub rejected: u64,
    /// Established sessions that reached Closed.
    pub closed: u64,
    /// Messages handed to the application.
    pub inbound: u64,
    /// Inbound messages from sessions that were already closed.
    pub stale_inbound: u64,
    /// Messages enqueued into a mailbox.
    pub delivered: u64,
    /// Messages dropped because a mailbox was full.
    pub dropped_full: u64,
    /// Dispatches to identities with no established session.
    pub routing_misses: u64,
}

/// A decoded message from an inbound pump.
#[derive(Debug)]
pub struct Inbound {
    pub serial: u64,
    pub envelope: Envelope,
}

/// Reply to a connect request.
enum Handshake {
    Established {
        id: ClientId,
        mailbox: mpsc::Receiver<Envelope>,
    },
    Rejected(String),
}

enum Control {
    Connect {
        serial: u64,
        meta: ConnectionMeta,
        reply: oneshot::Sender<Handshake>,
    },
    Close {
        serial: u64,
    },
    Dispatch(Envelope),
    Clients(oneshot::Sender<Vec<ClientId>>),
    Stats(oneshot::Sender<RegistryStats>),
    Shutdown,
}

/// The registry task state. Consumed by [`Registry::run`].
pub struct Registry<H: Handler> {
    handler: H,
    config: RegistryConfig,
    /// Routing table: identity → established session.
    sessions: HashMap<ClientId, Session>,
    /// Serial → identity of every entry in `sessions`.
    live: HashMap<u64, ClientId>,
    stats: RegistryStats,
    control_rx: mpsc::UnboundedReceiver<Control>,
    inbound_rx: mpsc::Receiver<Inbound>,
}

impl<H: Handler> Registry<H> {
    /// Build a registry and the handle used to reach it. Nothing runs until
    /// [`run`](Self::run) is polled.
    pub fn new(handler: H, config: RegistryConfig) -> (Self, RegistryHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        let handle = RegistryHandle {
            control_tx,
            inbound_tx,
            next_serial: Arc::new(AtomicU64::new(1)),
            wire_format: config.wire_format,
            max_message_size: config.max_message_size,
        };
        let registry = Self {
            handler,
            config,
            sessions: HashMap::new(),
            live: HashMap::new(),
            stats: RegistryStats::default(),
            control_rx,
            inbound_rx,
        };
        (registry, handle)
    }

    /// Build a registry and run it on a new task.
    pub fn spawn(handler: H, config: RegistryConfig) -> (RegistryHandle, JoinHandle<()>) {
        let (registry, handle) = Self::new(handler, config);
        (handle, tokio::spawn(registry.run()))
    }

    /// Process events until shutdown or until every handle is dropped, then
    /// close all remaining sessions.
    pub async fn run(mut self) {
        info!(
            mailbox_capacity = self.config.mailbox_capacity,
            inbound_capacity = self.config.inbound_capacity,
            "registry started"
        );

        loop {
            tokio::select! {
                Some(cmd) = self.control_rx.recv() => {
                    if !self.handle_control(cmd) {
                        break;
                    }
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound);
                }
                else => break,
            }
        }

        self.close_all();
        info!(
            accepted = self.stats.accepted,
            closed = self.stats.closed,
            "registry stopped"
        );
    }

    /// Returns `false` when the loop should stop.
    fn handle_control(&mut self, cmd: Control) -> bool {
        match cmd {
            Control::Connect {
                serial,
                meta,
                reply,
            } => self.connect(serial, meta, reply),
            Control::Close { serial } => {
                self.drain_inbound();
                self.close(serial, "connection ended");
            }
            Control::Dispatch(msg) => {
                Router::new(&self.sessions, &mut self.stats).dispatch(msg);
            }
            Control::Clients(reply) => {
                let clients = Router::new(&self.sessions, &mut self.stats).clients();
                let _ = reply.send(clients);
            }
            Control::Stats(reply) => {
                let mut stats = self.stats.clone();
                stats.established = self.sessions.len();
                let _ = reply.send(stats);
            }
            Control::Shutdown => {
                info!(sessions = self.sessions.len(), "registry shutting down");
                return false;
            }
        }
        true
    }

    fn connect(&mut self, serial: u64, meta: ConnectionMeta, reply: oneshot::Sender<Handshake>) {
        trace!(serial, path = %meta.path, phase = ?Phase::Connecting, "handshake started");

        let id = match self.handler.assign_identity(&meta) {
            Some(id) if !id.is_empty() => id,
            _ => {
                self.abort(serial, Phase::Connecting, reply, "identity declined".into());
                return;
            }
        };
        advance(serial, Phase::Connecting, Phase::PendingRegister);

        if let Some(existing) = self.sessions.get(&id) {
            match self.config.duplicate_identity {
                DuplicateIdentity::Reject => {
                    warn!(client = %id, serial, existing = existing.serial, "identity already connected");
                    self.abort(
                        serial,
                        Phase::PendingRegister,
                        reply,
                        format!("identity already connected: {id}"),
                    );
                    return;
                }
                DuplicateIdentity::Replace => {
                    let old = existing.serial;
                    self.close(old, "replaced by new connection");
                }
            }
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let session = Session::new(id.clone(), serial, meta.remote_addr, mailbox_tx);
        self.sessions.insert(id.clone(), session);
        self.live.insert(serial, id.clone());
        advance(serial, Phase::PendingRegister, Phase::Established);

        let handshake = Handshake::Established {
            id: id.clone(),
            mailbox: mailbox_rx,
        };
        if reply.send(handshake).is_err() {
            // The accept path went away before it could start the pumps.
            self.live.remove(&serial);
            self.sessions.remove(&id);
            self.stats.rejected += 1;
            debug!(client = %id, serial, "connection dropped during handshake");
            return;
        }

        self.stats.accepted += 1;
        info!(
            client = %id,
            serial,
            remote = ?meta.remote_addr,
            sessions = self.sessions.len(),
            "session established"
        );
        let mut router = Router::new(&self.sessions, &mut self.stats);
        self.handler.on_connect(&id, &mut router);
    }

    fn abort(&mut self, serial: u64, from: Phase, reply: oneshot::Sender<Handshake>, reason: String) {
        advance(serial, from, Phase::Aborted);
        self.stats.rejected += 1;
        debug!(serial, reason = %reason, "connection aborted");
        let _ = reply.send(Handshake::Rejected(reason));
    }

    /// Remove an established session and notify the handler. Requests for
    /// serials that are no longer live are ignored, so each session closes
    /// once no matter how many close requests arrive.
    fn close(&mut self, serial: u64, reason: &str) {
        let Some(id) = self.live.remove(&serial) else {
            trace!(serial, "close for inactive session ignored");
            return;
        };
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let uptime = session.established_at.elapsed();
        let remote = session.remote_addr;
        let from = session.phase();
        advance(serial, from, session.close());
        self.stats.closed += 1;
        info!(
            client = %id,
            serial,
            remote = ?remote,
            uptime_ms = uptime.as_millis() as u64,
            reason,
            "session closed"
        );

        let mut router = Router::new(&self.sessions, &mut self.stats);
        self.handler.on_disconnect(&id, &mut router);
    }

    fn close_all(&mut self) {
        let serials: Vec<u64> = self.live.keys().copied().collect();
        for serial in serials {
            self.close(serial, "registry shutdown");
        }
    }

    /// Deliver what is already queued. A session's pump has finished
    /// forwarding before its Close is sent, so all of its messages are
    /// within the first `inbound_capacity` entries.
    fn drain_inbound(&mut self) {
        for _ in 0..self.config.inbound_capacity.max(1) {
            match self.inbound_rx.try_recv() {
                Ok(inbound) => self.handle_inbound(inbound),
                Err(_) => break,
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        if !self.live.contains_key(&inbound.serial) {
            self.stats.stale_inbound += 1;
            debug!(serial = inbound.serial, "message from closed session dropped");
            return;
        }
        self.stats.inbound += 1;
        let mut router = Router::new(&self.sessions, &mut self.stats);
        self.handler.on_message(inbound.envelope, &mut router);
    }
}

fn advance(serial: u64, from: Phase, to: Phase) {
    debug_assert!(from.can_advance_to(to), "illegal transition {from:?} -> {to:?}");
    trace!(serial, from = ?from, to = ?to, "phase transition");
}

/// Sends Close for a session when the accept path finishes, however it
/// finishes.
struct CloseGuard {
    serial: u64,
    control_tx: Option<mpsc::UnboundedSender<Control>>,
}

impl CloseGuard {
    fn disarm(mut self) {
        self.control_tx = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Close {
                serial: self.serial,
            });
        }
    }
}

/// Cheap, cloneable access to a running registry.
#[derive(Clone)]
pub struct RegistryHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    inbound_tx: mpsc::Sender<Inbound>,
    next_serial: Arc<AtomicU64>,
    wire_format: WireFormat,
    max_message_size: usize,
}

impl RegistryHandle {
    /// Run the handshake for a new connection and, once established, serve
    /// it until it closes.
    ///
    /// Resolves with the identity that was served after both pumps have
    /// stopped and the session has left the routing table. A declined
    /// connection has its transport closed and yields
    /// [`PlexusError::ConnectionRejected`].
    pub async fn accept_connection<T: Transport>(
        &self,
        transport: T,
        meta: ConnectionMeta,
    ) -> PlexusResult<ClientId> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (reader, mut writer) = transport.split();

        let guard = CloseGuard {
            serial,
            control_tx: Some(self.control_tx.clone()),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.control_tx.send(Control::Connect {
            serial,
            meta,
            reply: reply_tx,
        });

        let handshake = match sent {
            Ok(()) => reply_rx.await.map_err(|_| PlexusError::RegistryClosed),
            Err(_) => Err(PlexusError::RegistryClosed),
        };
        let (id, mailbox) = match handshake {
            Ok(Handshake::Established { id, mailbox }) => (id, mailbox),
            Ok(Handshake::Rejected(reason)) => {
                guard.disarm();
                let _ = writer.close().await;
                return Err(PlexusError::ConnectionRejected(reason));
            }
            Err(e) => {
                guard.disarm();
                let _ = writer.close().await;
                return Err(e);
            }
        };

        let mut outbound = tokio::spawn(pump::outbound(
            id.clone(),
            mailbox,
            writer,
            self.wire_format,
        ));
        let inbound = pump::inbound(
            id.clone(),
            serial,
            reader,
            self.wire_format,
            self.max_message_size,
            self.inbound_tx.clone(),
        );

        // The outbound pump only finishes once the registry has closed the
        // mailbox; if that happens first the session was closed from the
        // registry side and reading stops.
        let exit = tokio::select! {
            exit = inbound => Some(exit),
            _ = &mut outbound => None,
        };

        match exit {
            Some(exit) => {
                match &exit {
                    PumpExit::ReadError(e) => debug!(client = %id, error = %e, "inbound pump stopped"),
                    other => debug!(client = %id, exit = ?other, "inbound pump stopped"),
                }
                drop(guard);
                if let Err(e) = outbound.await {
                    warn!(client = %id, error = %e, "outbound pump panicked");
                }
            }
            None => {
                debug!(client = %id, "session closed by registry");
                drop(guard);
            }
        }

        Ok(id)
    }

    /// Route by `msg.to`, or broadcast when it is unset. Never blocks and
    /// never fails; unknown recipients are ignored.
    pub fn dispatch(&self, msg: Envelope) {
        if self.control_tx.send(Control::Dispatch(msg)).is_err() {
            trace!("registry closed, dispatch dropped");
        }
    }

    /// Send to a single client.
    pub fn send(&self, to: impl Into<ClientId>, msg: Envelope) {
        self.dispatch(msg.with_to(to));
    }

    /// Send to every established client.
    pub fn broadcast(&self, mut msg: Envelope) {
        msg.to = None;
        self.dispatch(msg);
    }

    /// Snapshot of the established identities, sorted.
    pub async fn clients(&self) -> PlexusResult<Vec<ClientId>> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Clients(tx))
            .map_err(|_| PlexusError::RegistryClosed)?;
        rx.await.map_err(|_| PlexusError::RegistryClosed)
    }

    pub async fn stats(&self) -> PlexusResult<RegistryStats> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Stats(tx))
            .map_err(|_| PlexusError::RegistryClosed)?;
        rx.await.map_err(|_| PlexusError::RegistryClosed)
    }

    /// Ask the registry to close every session and stop.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    /// Whether the registry task has stopped.
    pub fn is_closed(&self) -> bool {
        self.control_tx.is_closed()
    }
}
