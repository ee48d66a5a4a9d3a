//! The per-session read and write loops.
//!
//! The inbound pump turns transport frames into envelopes and hands them to
//! the registry; the outbound pump drains the session mailbox into the
//! transport. Neither touches the routing table.

use crate::registry::Inbound;
use plexus_core::{ClientId, Envelope, FrameReader, FrameWriter, PlexusError, WireFormat};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Why an inbound pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The peer closed the connection cleanly.
    PeerClosed,
    /// The transport failed while reading.
    ReadError(PlexusError),
    /// The registry is no longer accepting inbound messages.
    RegistryGone,
}

/// Read, decode, and forward frames until the connection ends.
///
/// Forwarding waits when the registry's inbound queue is full, which
/// throttles every reader evenly.
pub async fn inbound<R: FrameReader>(
    id: ClientId,
    serial: u64,
    mut reader: R,
    format: WireFormat,
    max_message_size: usize,
    registry: mpsc::Sender<Inbound>,
) -> PumpExit {
    loop {
        let frame = match reader.recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(client = %id, "peer closed connection");
                return PumpExit::PeerClosed;
            }
            Err(e) if e.is_recoverable() => {
                warn!(client = %id, error = %e, "dropping inbound frame");
                continue;
            }
            Err(e) => {
                debug!(client = %id, error = %e, "read failed");
                return PumpExit::ReadError(e);
            }
        };

        let decoded = frame
            .check_size(max_message_size)
            .and_then(|()| format.decode(&frame));
        let mut envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client = %id, error = %e, "dropping inbound frame");
                continue;
            }
        };
        envelope.from = Some(id.clone());
        trace!(client = %id, kind = %envelope.kind, "inbound message");

        if registry.send(Inbound { serial, envelope }).await.is_err() {
            return PumpExit::RegistryGone;
        }
    }
}

/// Drain the mailbox into the transport until the registry closes it,
/// then close the transport. Returns the number of frames written.
///
/// Write failures are logged and the pump keeps draining: teardown is
/// driven by the inbound side noticing the dead connection.
pub async fn outbound<W: FrameWriter>(
    id: ClientId,
    mut mailbox: mpsc::Receiver<Envelope>,
    mut writer: W,
    format: WireFormat,
) -> u64 {
    let mut written = 0u64;
    let mut failures = 0u64;

    while let Some(envelope) = mailbox.recv().await {
        let frame = match format.encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client = %id, kind = %envelope.kind, error = %e, "encode failed");
                continue;
            }
        };
        match writer.send_frame(frame).await {
            Ok(()) => written += 1,
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!(client = %id, error = %e, "write failed");
                } else {
                    trace!(client = %id, error = %e, failures, "write failed");
                }
            }
        }
    }

    if let Err(e) = writer.close().await {
        debug!(client = %id, error = %e, "transport close failed");
    }
    debug!(client = %id, written, failures, "outbound pump finished");
    written
}
