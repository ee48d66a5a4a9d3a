//! Per-connection state owned by the registry.

use plexus_core::{ClientId, Envelope};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Handshake and lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transport accepted, identity not yet assigned.
    Connecting,
    /// Identity assigned, mailbox being created.
    PendingRegister,
    /// In the routing table; pumps running.
    Established,
    /// Identity declined; nothing was ever published.
    Aborted,
    /// Removed from the routing table, mailbox closed.
    Closed,
}

impl Phase {
    /// Legal transitions of the handshake state machine.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Connecting, Phase::PendingRegister)
                | (Phase::Connecting, Phase::Aborted)
                | (Phase::PendingRegister, Phase::Established)
                | (Phase::PendingRegister, Phase::Aborted)
                | (Phase::Established, Phase::Closed)
        )
    }
}

/// Result of a non-blocking mailbox enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Mailbox full; the new message was dropped.
    DroppedFull,
    /// The outbound pump is gone.
    Disconnected,
}

/// A published session. Only the registry creates, holds, and drops these.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: ClientId,
    pub serial: u64,
    pub remote_addr: Option<SocketAddr>,
    pub established_at: Instant,
    phase: Phase,
    /// Sole producer handle of the mailbox. Dropping it closes the mailbox.
    mailbox: mpsc::Sender<Envelope>,
}

impl Session {
    pub fn new(
        id: ClientId,
        serial: u64,
        remote_addr: Option<SocketAddr>,
        mailbox: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            id,
            serial,
            remote_addr,
            established_at: Instant::now(),
            phase: Phase::Established,
            mailbox,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deliver(&self, msg: Envelope) -> Delivery {
        match self.mailbox.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::DroppedFull,
            Err(TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }

    /// Close the mailbox by consuming the session.
    pub fn close(mut self) -> Phase {
        self.phase = Phase::Closed;
        self.phase
    }
}
