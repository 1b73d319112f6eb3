//! Peers ("children") on the multicast group, including this node itself.

use crate::config::EffectiveRsmConfig;
use crate::seq::SequenceId;
use crate::slots::SlotRing;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Generates a candidate 16-bit connection id. Uniqueness on the group is
///  established by the hello/deny discovery protocol, not here.
pub fn random_connection_id() -> u16 {
    rand::thread_rng().gen()
}

/// The receive-side state this node keeps for one peer on the group: its
///  reassembly slots, the reader wake event, and the acknowledgement
///  bookkeeping for both directions.
pub struct Peer {
    id: u16,
    /// reassembly ring for data written by this peer
    pub(crate) ring: Mutex<SlotRing>,
    /// wakes a reader blocked on the ring (and `accept_sync` on the listener)
    pub(crate) wake: Notify,
    /// the sequence of this peer's stream we most recently ACKed; retransmits
    ///  for it (addressed at slower receivers) are dropped
    pub(crate) last_sequence_acked: Mutex<Option<SequenceId>>,
    /// the sequence of *our* stream this peer most recently ACKed
    pub(crate) ack_received: Mutex<Option<SequenceId>>,
}

impl Peer {
    pub fn new(id: u16, config: &EffectiveRsmConfig) -> Peer {
        Peer {
            id,
            ring: Mutex::new(SlotRing::new(config.ack_frequency, config.payload_size)),
            wake: Notify::new(),
            last_sequence_acked: Mutex::new(None),
            ack_received: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn close(&self) {
        self.ring.lock().unwrap().close();
        self.wake.notify_one();
    }
}

/// The set of peers known on the group, in discovery order. The local node is
///  a member of its own peer set; `accept_sync` hands out peers in order,
///  starting with the local one.
pub struct PeerSet {
    children: Vec<Arc<Peer>>,
    accepted: usize,
}

impl PeerSet {
    pub fn new() -> PeerSet {
        PeerSet {
            children: Vec::new(),
            accepted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn find(&self, id: u16) -> Option<Arc<Peer>> {
        self.children.iter().find(|p| p.id() == id).cloned()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.children.iter().any(|p| p.id() == id)
    }

    /// Adds a newly discovered peer; false if the id is already known.
    pub fn add(&mut self, peer: Arc<Peer>) -> bool {
        if self.contains(peer.id()) {
            return false;
        }
        debug!("new peer {}", peer.id());
        self.children.push(peer);
        true
    }

    pub fn remove(&mut self, id: u16) -> Option<Arc<Peer>> {
        let index = self.children.iter().position(|p| p.id() == id)?;
        let peer = self.children.remove(index);
        if index < self.accepted {
            self.accepted -= 1;
        }
        debug!("removed peer {}", id);
        Some(peer)
    }

    /// The next peer not yet handed out by `accept_sync`, if any.
    pub fn next_unaccepted(&mut self) -> Option<Arc<Peer>> {
        let peer = self.children.get(self.accepted)?.clone();
        self.accepted += 1;
        Some(peer)
    }

    pub fn has_unaccepted(&self) -> bool {
        self.accepted < self.children.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.children.iter()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.children.iter().map(|p| p.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RsmConfig;

    fn peer(id: u16) -> Arc<Peer> {
        Arc::new(Peer::new(id, &RsmConfig::default().effective()))
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut set = PeerSet::new();
        assert!(set.add(peer(7)));
        assert!(!set.add(peer(7)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_find_and_remove() {
        let mut set = PeerSet::new();
        set.add(peer(1));
        set.add(peer(2));

        assert_eq!(set.find(2).unwrap().id(), 2);
        assert!(set.find(3).is_none());

        assert_eq!(set.remove(1).unwrap().id(), 1);
        assert!(set.remove(1).is_none());
        assert_eq!(set.ids(), vec![2]);
    }

    #[test]
    fn test_accept_order() {
        let mut set = PeerSet::new();
        set.add(peer(5));
        set.add(peer(3));

        assert!(set.has_unaccepted());
        assert_eq!(set.next_unaccepted().unwrap().id(), 5);
        assert_eq!(set.next_unaccepted().unwrap().id(), 3);
        assert!(set.next_unaccepted().is_none());
        assert!(!set.has_unaccepted());
    }

    #[test]
    fn test_remove_accepted_keeps_cursor_consistent() {
        let mut set = PeerSet::new();
        set.add(peer(1));
        set.add(peer(2));
        set.add(peer(3));

        set.next_unaccepted();
        set.next_unaccepted();

        // removing an already-accepted peer must not skip peer 3
        set.remove(1);
        assert_eq!(set.next_unaccepted().unwrap().id(), 3);
    }
}
