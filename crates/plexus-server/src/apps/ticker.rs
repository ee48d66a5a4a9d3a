//! Counter broadcast.
//!
//! Every connection gets the next integer identity. A separate task
//! broadcasts `{"type": "message", "data": "<n>"}` each period, counting
//! up from zero.

use crate::handler::{ConnectionMeta, Handler};
use crate::registry::RegistryHandle;
use crate::router::Router;
use plexus_core::{ClientId, Envelope};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct TickerApp {
    last_id: u64,
}

impl TickerApp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Handler for TickerApp {
    fn assign_identity(&mut self, _meta: &ConnectionMeta) -> Option<ClientId> {
        self.last_id += 1;
        Some(ClientId::from(self.last_id))
    }

    fn on_message(&mut self, msg: Envelope, _router: &mut Router<'_>) {
        trace!(kind = %msg.kind, "ticker ignores client messages");
    }

    fn on_disconnect(&mut self, _id: &ClientId, _router: &mut Router<'_>) {}
}

/// Broadcast an increasing counter through `handle` every `period` until
/// the registry stops.
pub fn spawn_ticker(handle: RegistryHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut n: u64 = 0;
        loop {
            interval.tick().await;
            if handle.is_closed() {
                break;
            }
            handle.broadcast(Envelope::new("message", n.to_string()));
            n += 1;
        }
        debug!(ticks = n, "ticker stopped");
    })
}
