//! Peer registry - the set of known peers and their connection state
//!
//! The registry only validates transitions; deciding *when* to move a peer is
//! the negotiator's job.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use nearcast_core::{
    DiscoveryInfo, NearcastError, NearcastResult, PeerId, SessionHandle, Timestamp,
};

/// Connection lifecycle of a peer
///
/// ```text
/// Discovered --> Inviting --> InviteSent --> Connected --> Disconnecting --> (removed)
///      ^            |             |              ^
///      +------------+-------------+              |
///      +-----------------------------------------+  (inbound session)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    Discovered,
    Inviting,
    InviteSent,
    Connected(SessionHandle),
    Disconnecting,
}

impl PeerState {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Discovered, Inviting)
                | (Discovered, Connected(_))
                | (Inviting, InviteSent)
                | (Inviting, Discovered)
                | (InviteSent, Connected(_))
                | (InviteSent, Discovered)
                | (Connected(_), Disconnecting)
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected(_))
    }

    /// Mid-negotiation peers must not be invited again
    pub fn is_negotiating(self) -> bool {
        matches!(self, PeerState::Inviting | PeerState::InviteSent)
    }

    pub fn session(self) -> Option<SessionHandle> {
        match self {
            PeerState::Connected(session) => Some(session),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PeerState::Discovered => "discovered",
            PeerState::Inviting => "inviting",
            PeerState::InviteSent => "invite-sent",
            PeerState::Connected(_) => "connected",
            PeerState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A known remote node
#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub state: PeerState,
    pub info: DiscoveryInfo,
    pub discovered_at: Timestamp,
    pub last_seen: Timestamp,
}

impl Peer {
    fn new(id: PeerId, info: DiscoveryInfo, now: Timestamp) -> Self {
        Peer {
            id,
            state: PeerState::Discovered,
            info,
            discovered_at: now,
            last_seen: now,
        }
    }
}

/// Registry of peers keyed by id
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unseen peer as `Discovered`, or refresh `last_seen`.
    ///
    /// A refresh never changes state. Non-empty discovery info replaces the
    /// stored info.
    pub fn upsert(&mut self, id: PeerId, info: DiscoveryInfo, now: Timestamp) -> &Peer {
        match self.peers.entry(id) {
            Entry::Occupied(entry) => {
                let peer = entry.into_mut();
                peer.last_seen = peer.last_seen.max(now);
                if !info.is_empty() {
                    peer.info = info;
                }
                peer
            }
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                entry.insert(Peer::new(id, info, now))
            }
        }
    }

    /// Delete a peer.
    ///
    /// Callers holding per-peer negotiation state must cancel it first; see
    /// `SessionNegotiator::remove_peer`.
    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Apply a validated transition, returning the previous state
    pub fn set_state(&mut self, id: &PeerId, next: PeerState) -> NearcastResult<PeerState> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| NearcastError::UnknownPeer(id.clone()))?;

        let previous = peer.state;
        if !previous.can_transition_to(next) {
            return Err(NearcastError::InvalidTransition {
                peer: id.clone(),
                from: previous.to_string(),
                to: next.to_string(),
            });
        }
        peer.state = next;
        Ok(previous)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn state(&self, id: &PeerId) -> Option<PeerState> {
        self.peers.get(id).map(|p| p.state)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Point-in-time copy of the connected set
    pub fn connected_peers(&self) -> BTreeSet<PeerId> {
        self.peers
            .values()
            .filter(|p| p.state.is_connected())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Peers currently `Discovered`, in id order
    pub fn discovered_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Discovered)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn ids(&self) -> BTreeSet<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(n: u64) -> PeerId {
        PeerId::new(format!("peer-{}", n), n)
    }

    #[test]
    fn test_upsert_inserts_discovered() {
        let mut registry = PeerRegistry::new();
        let p = registry.upsert(peer(1), DiscoveryInfo::new(), Timestamp(5));

        assert_eq!(p.state, PeerState::Discovered);
        assert_eq!(p.last_seen, Timestamp(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_refresh_keeps_state() {
        let mut registry = PeerRegistry::new();
        registry.upsert(peer(1), DiscoveryInfo::new(), Timestamp(5));
        registry.set_state(&peer(1), PeerState::Inviting).unwrap();

        let mut info = DiscoveryInfo::new();
        info.insert("model".into(), "x1".into());
        let p = registry.upsert(peer(1), info, Timestamp(9));

        assert_eq!(p.state, PeerState::Inviting);
        assert_eq!(p.last_seen, Timestamp(9));
        assert_eq!(p.discovered_at, Timestamp(5));
        assert_eq!(p.info.get("model").map(String::as_str), Some("x1"));
    }

    #[test]
    fn test_set_state_unknown_peer() {
        let mut registry = PeerRegistry::new();
        let err = registry.set_state(&peer(9), PeerState::Inviting).unwrap_err();
        assert_eq!(err, NearcastError::UnknownPeer(peer(9)));
    }

    #[test]
    fn test_set_state_rejects_invalid_transition() {
        let mut registry = PeerRegistry::new();
        registry.upsert(peer(1), DiscoveryInfo::new(), Timestamp::ZERO);

        let err = registry.set_state(&peer(1), PeerState::InviteSent).unwrap_err();
        assert!(matches!(err, NearcastError::InvalidTransition { .. }));
        assert_eq!(registry.state(&peer(1)), Some(PeerState::Discovered));
    }

    #[test]
    fn test_full_lifecycle_transitions() {
        let mut registry = PeerRegistry::new();
        let id = peer(1);
        registry.upsert(id.clone(), DiscoveryInfo::new(), Timestamp::ZERO);

        registry.set_state(&id, PeerState::Inviting).unwrap();
        registry.set_state(&id, PeerState::InviteSent).unwrap();
        registry
            .set_state(&id, PeerState::Connected(SessionHandle(3)))
            .unwrap();
        assert_eq!(registry.connected_peers().len(), 1);

        let previous = registry.set_state(&id, PeerState::Disconnecting).unwrap();
        assert_eq!(previous.session(), Some(SessionHandle(3)));
        assert!(registry.connected_peers().is_empty());
        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connected_peers_is_a_snapshot() {
        let mut registry = PeerRegistry::new();
        for n in 0..3 {
            registry.upsert(peer(n), DiscoveryInfo::new(), Timestamp::ZERO);
            registry
                .set_state(&peer(n), PeerState::Connected(SessionHandle(n)))
                .unwrap();
        }

        let snapshot = registry.connected_peers();
        registry.set_state(&peer(0), PeerState::Disconnecting).unwrap();
        registry.remove(&peer(0));

        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.connected_peers().len(), 2);
    }

    #[test]
    fn test_discovered_peers_sorted() {
        let mut registry = PeerRegistry::new();
        for n in [3, 1, 2] {
            registry.upsert(peer(n), DiscoveryInfo::new(), Timestamp::ZERO);
        }
        registry.set_state(&peer(2), PeerState::Inviting).unwrap();

        assert_eq!(registry.discovered_peers(), vec![peer(1), peer(3)]);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Found(u64),
        Lost(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u64..6).prop_map(Op::Found), (0u64..6).prop_map(Op::Lost)]
    }

    proptest! {
        #[test]
        fn test_registry_tracks_found_minus_lost(ops in proptest::collection::vec(op(), 0..64)) {
            let mut registry = PeerRegistry::new();
            let mut model = BTreeSet::new();

            for (tick, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Found(n) => {
                        registry.upsert(peer(n), DiscoveryInfo::new(), Timestamp(tick as u64));
                        model.insert(peer(n));
                    }
                    Op::Lost(n) => {
                        registry.remove(&peer(n));
                        model.remove(&peer(n));
                    }
                }
            }

            prop_assert_eq!(registry.ids(), model);
        }
    }
}
