//! Outbound dispatch over the routing table.
//!
//! Delivery is best effort and at most once: each recipient gets a
//! non-blocking enqueue into its own mailbox, a full mailbox drops the new
//! message, and an unknown recipient is a silent miss.

use crate::registry::RegistryStats;
use crate::session::{Delivery, Session};
use plexus_core::{ClientId, Envelope};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Dispatch view of the routing table, handed to [`Handler`] callbacks.
///
/// [`Handler`]: crate::handler::Handler
pub struct Router<'a> {
    sessions: &'a HashMap<ClientId, Session>,
    stats: &'a mut RegistryStats,
}

impl<'a> Router<'a> {
    pub(crate) fn new(
        sessions: &'a HashMap<ClientId, Session>,
        stats: &'a mut RegistryStats,
    ) -> Self {
        Self { sessions, stats }
    }

    /// Route by `msg.to`: a single client, or everyone when unset.
    pub fn dispatch(&mut self, msg: Envelope) {
        match msg.to.clone() {
            Some(to) => self.send(&to, msg),
            None => self.broadcast(msg),
        }
    }

    /// Enqueue a message for one client. No-op if it is not established.
    pub fn send(&mut self, to: &ClientId, mut msg: Envelope) {
        let sessions = self.sessions;
        let Some(session) = sessions.get(to) else {
            self.stats.routing_misses += 1;
            trace!(to = %to, kind = %msg.kind, "no established session, dropping");
            return;
        };
        msg.to = Some(to.clone());
        self.enqueue(session, msg);
    }

    /// Enqueue a message for every established client.
    pub fn broadcast(&mut self, mut msg: Envelope) {
        msg.to = None;
        let sessions = self.sessions;
        for session in sessions.values() {
            self.enqueue(session, msg.clone());
        }
        debug!(kind = %msg.kind, recipients = sessions.len(), "broadcast");
    }

    pub fn is_connected(&self, id: &ClientId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Identities of all established clients, sorted.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn enqueue(&mut self, session: &Session, msg: Envelope) {
        match session.deliver(msg) {
            Delivery::Queued => self.stats.delivered += 1,
            Delivery::DroppedFull => {
                self.stats.dropped_full += 1;
                warn!(client = %session.id, "mailbox full, dropping message");
            }
            Delivery::Disconnected => {
                self.stats.routing_misses += 1;
                debug!(client = %session.id, "outbound pump gone, dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn table(
        ids: &[&str],
        capacity: usize,
    ) -> (
        HashMap<ClientId, Session>,
        HashMap<ClientId, mpsc::Receiver<Envelope>>,
    ) {
        let mut sessions = HashMap::new();
        let mut mailboxes = HashMap::new();
        for (serial, id) in ids.iter().enumerate() {
            let (tx, rx) = mpsc::channel(capacity);
            let id = ClientId::from(*id);
            sessions.insert(id.clone(), Session::new(id.clone(), serial as u64, None, tx));
            mailboxes.insert(id, rx);
        }
        (sessions, mailboxes)
    }

    #[test]
    fn send_reaches_only_the_recipient() {
        let (sessions, mut mailboxes) = table(&["alice", "bob"], 4);
        let mut stats = RegistryStats::default();
        let mut router = Router::new(&sessions, &mut stats);

        router.send(&"bob".into(), Envelope::new("reply", "hi"));

        let got = mailboxes.get_mut(&ClientId::from("bob")).unwrap().try_recv().unwrap();
        assert_eq!(got.to, Some(ClientId::from("bob")));
        assert!(mailboxes.get_mut(&ClientId::from("alice")).unwrap().try_recv().is_err());
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn unknown_recipient_is_a_silent_miss() {
        let (sessions, _mailboxes) = table(&["alice"], 4);
        let mut stats = RegistryStats::default();
        let mut router = Router::new(&sessions, &mut stats);

        router.dispatch(Envelope::new("x", 1).with_to("carol"));
        assert_eq!(stats.routing_misses, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn broadcast_isolates_full_mailboxes() {
        let (sessions, mut mailboxes) = table(&["a", "b", "c"], 1);
        let mut stats = RegistryStats::default();

        // Fill b's mailbox before the broadcast.
        Router::new(&sessions, &mut stats).send(&"b".into(), Envelope::new("first", 0));
        Router::new(&sessions, &mut stats).broadcast(Envelope::new("all", 1).with_to("ignored"));

        for id in ["a", "c"] {
            let got = mailboxes.get_mut(&ClientId::from(id)).unwrap().try_recv().unwrap();
            assert_eq!(got.kind, "all");
            assert!(got.is_broadcast());
        }
        let b = mailboxes.get_mut(&ClientId::from("b")).unwrap();
        assert_eq!(b.try_recv().unwrap().kind, "first");
        assert!(b.try_recv().is_err());
        assert_eq!(stats.dropped_full, 1);
        assert_eq!(stats.delivered, 3);
    }

    #[test]
    fn client_listing() {
        let (sessions, _mailboxes) = table(&["zed", "amy"], 1);
        let mut stats = RegistryStats::default();
        let router = Router::new(&sessions, &mut stats);
        assert_eq!(router.clients(), vec![ClientId::from("amy"), ClientId::from("zed")]);
        assert!(router.is_connected(&"zed".into()));
        assert!(!router.is_connected(&"bob".into()));
        assert_eq!(router.len(), 2);
    }
}
