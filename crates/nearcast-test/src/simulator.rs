//! Mesh simulator for multi-node testing
//!
//! Runs several `Node`s in one thread and plays the part of their radios:
//! commands a node emits are turned into events for the nodes they concern.
//! Time only moves when `advance` is called.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use nearcast_core::{
    AttemptId, DiscoveryInfo, InviteReply, LinkState, PeerId, SessionHandle, Timestamp,
    TrackedPayload, TransportEvent,
};
use nearcast_runtime::{Command, InvitationPolicy, Node, NodeConfig, NodeEvent, Notification};

use crate::chaos::{ChaosConfig, ChaosLink, ChaosStats};

/// Rounds `settle` runs before giving up on reaching quiescence
const MAX_SETTLE_ROUNDS: usize = 1_000;

/// A node plus everything it has told the application
pub struct SimulatedPeer {
    pub id: PeerId,
    node: Node,
    notifications: Vec<Notification>,
}

impl SimulatedPeer {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Payloads received from `from`, oldest first
    pub fn received_from(&self, from: &PeerId) -> Vec<&TrackedPayload> {
        self.notifications
            .iter()
            .filter_map(|n| match n {
                Notification::PayloadReceived { from: f, payload } if f == from => Some(payload),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub rounds: u64,
    pub commands_routed: u64,
    pub invites_delivered: u64,
    pub invites_lost: u64,
    pub data_delivered: u64,
    pub data_lost: u64,
}

/// In-process radio neighbourhood
pub struct Mesh {
    config: NodeConfig,
    peers: BTreeMap<PeerId, SimulatedPeer>,
    /// Unordered pairs currently within radio range
    in_range: BTreeSet<(PeerId, PeerId)>,
    /// Established sessions, keyed like `in_range`
    sessions: BTreeMap<(PeerId, PeerId), SessionHandle>,
    /// Invites delivered but not yet answered, keyed by (invitee, inviter)
    pending_invites: HashMap<(PeerId, PeerId), AttemptId>,
    /// Peers that never see invites sent to them
    unresponsive: BTreeSet<PeerId>,
    /// Directed links
    links: HashMap<(PeerId, PeerId), ChaosLink>,
    chaos: ChaosConfig,
    seed_counter: u64,
    next_session: u64,
    now: Timestamp,
    stats: MeshStats,
}

impl Mesh {
    pub fn new(config: NodeConfig) -> Self {
        Mesh {
            config,
            peers: BTreeMap::new(),
            in_range: BTreeSet::new(),
            sessions: BTreeMap::new(),
            pending_invites: HashMap::new(),
            unresponsive: BTreeSet::new(),
            links: HashMap::new(),
            chaos: ChaosConfig::perfect(),
            seed_counter: 0,
            next_session: 0,
            now: Timestamp::ZERO,
            stats: MeshStats::default(),
        }
    }

    /// Loss applied to links created from now on
    pub fn with_chaos(mut self, chaos: ChaosConfig, seed: u64) -> Self {
        self.chaos = chaos;
        self.seed_counter = seed;
        self
    }

    pub fn add_peer(&mut self, name: &str) -> PeerId {
        let id = self.next_id(name);
        let node = Node::new(id.clone(), self.config.clone());
        self.insert(id, node)
    }

    pub fn add_peer_with_policy(
        &mut self,
        name: &str,
        policy: impl InvitationPolicy + 'static,
    ) -> PeerId {
        let id = self.next_id(name);
        let node = Node::new(id.clone(), self.config.clone()).with_policy(policy);
        self.insert(id, node)
    }

    fn next_id(&self, name: &str) -> PeerId {
        PeerId::new(name, self.peers.len() as u64 + 1)
    }

    fn insert(&mut self, id: PeerId, node: Node) -> PeerId {
        self.peers.insert(
            id.clone(),
            SimulatedPeer {
                id: id.clone(),
                node,
                notifications: Vec::new(),
            },
        );
        id
    }

    pub fn peer(&self, id: &PeerId) -> Option<&SimulatedPeer> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn node(&self, id: &PeerId) -> Option<&Node> {
        self.peers.get(id).map(|p| &p.node)
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    pub fn link_stats(&self, from: &PeerId, to: &PeerId) -> Option<&ChaosStats> {
        self.links.get(&(from.clone(), to.clone())).map(|l| l.stats())
    }

    pub fn is_in_range(&self, a: &PeerId, b: &PeerId) -> bool {
        self.in_range.contains(&pair(a, b))
    }

    pub fn has_session(&self, a: &PeerId, b: &PeerId) -> bool {
        self.sessions.contains_key(&pair(a, b))
    }

    /// Both peers discover each other
    pub fn bring_into_range(&mut self, a: &PeerId, b: &PeerId) {
        if a == b || !self.in_range.insert(pair(a, b)) {
            return;
        }
        let mut info = DiscoveryInfo::new();
        info.insert("service".into(), self.config.service_id.to_string());

        self.deliver(a, TransportEvent::PeerFound {
            peer: b.clone(),
            info: info.clone(),
        });
        self.deliver(b, TransportEvent::PeerFound {
            peer: a.clone(),
            info,
        });
    }

    /// Both peers lose each other; any session between them is gone
    pub fn move_out_of_range(&mut self, a: &PeerId, b: &PeerId) {
        if !self.in_range.remove(&pair(a, b)) {
            return;
        }
        self.sessions.remove(&pair(a, b));
        self.pending_invites.remove(&(a.clone(), b.clone()));
        self.pending_invites.remove(&(b.clone(), a.clone()));

        self.deliver(a, TransportEvent::PeerLost { peer: b.clone() });
        self.deliver(b, TransportEvent::PeerLost { peer: a.clone() });
    }

    /// The session drops but the peers stay discoverable
    pub fn drop_session(&mut self, a: &PeerId, b: &PeerId) {
        if self.sessions.remove(&pair(a, b)).is_none() {
            return;
        }
        self.deliver(a, TransportEvent::LinkStateChanged {
            peer: b.clone(),
            state: LinkState::NotConnected,
        });
        self.deliver(b, TransportEvent::LinkStateChanged {
            peer: a.clone(),
            state: LinkState::NotConnected,
        });
    }

    /// Invites to `id` are sent but never arrive
    pub fn set_unresponsive(&mut self, id: &PeerId, unresponsive: bool) {
        if unresponsive {
            self.unresponsive.insert(id.clone());
        } else {
            self.unresponsive.remove(id);
        }
    }

    pub fn track(&mut self, id: &PeerId, payload: TrackedPayload) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.node.track(payload);
        }
    }

    /// Move every node's clock forward, then settle
    pub fn advance(&mut self, dt: Duration) {
        self.now = self.now.saturating_add(dt);
        for peer in self.peers.values_mut() {
            peer.node.tick(self.now);
        }
        self.settle();
    }

    /// Process and route until no node has anything left to do.
    /// Returns the number of rounds taken.
    pub fn settle(&mut self) -> usize {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();

        for round in 0..MAX_SETTLE_ROUNDS {
            let mut outgoing = Vec::new();
            let mut busy = false;

            for id in &ids {
                let Some(peer) = self.peers.get_mut(id) else {
                    continue;
                };
                if peer.node.process_pending() > 0 {
                    busy = true;
                }
                peer.notifications.extend(peer.node.drain_notifications());
                outgoing.extend(peer.node.drain_commands().into_iter().map(|c| (id.clone(), c)));
            }

            if !busy && outgoing.is_empty() {
                return round;
            }
            self.stats.rounds += 1;
            for (from, command) in outgoing {
                self.route(&from, command);
            }
        }
        MAX_SETTLE_ROUNDS
    }

    fn route(&mut self, from: &PeerId, command: Command) {
        self.stats.commands_routed += 1;
        match command {
            Command::SendInvite {
                peer,
                attempt,
                context,
                ..
            } => {
                if !self.is_in_range(from, &peer) {
                    self.deliver(from, NodeEvent::InviteSendFailed {
                        peer,
                        attempt,
                        reason: "out of range".into(),
                    });
                    return;
                }
                self.deliver(from, NodeEvent::InviteSent {
                    peer: peer.clone(),
                    attempt,
                });

                if self.unresponsive.contains(&peer) || !self.transmit(from, &peer) {
                    self.stats.invites_lost += 1;
                    return;
                }
                self.stats.invites_delivered += 1;
                self.pending_invites
                    .insert((peer.clone(), from.clone()), attempt);
                self.deliver(&peer, TransportEvent::InvitationReceived {
                    peer: from.clone(),
                    context,
                });
            }
            Command::RespondToInvitation { peer, accept } => {
                // `from` was invited by `peer`
                let Some(attempt) = self.pending_invites.remove(&(from.clone(), peer.clone()))
                else {
                    return;
                };

                if !accept || !self.is_in_range(from, &peer) {
                    self.deliver(&peer, NodeEvent::InviteAnswered {
                        peer: from.clone(),
                        attempt,
                        reply: InviteReply::Rejected,
                    });
                    return;
                }

                self.next_session += 1;
                let session = SessionHandle(self.next_session);
                self.sessions.insert(pair(from, &peer), session);

                self.deliver(&peer, NodeEvent::InviteAnswered {
                    peer: from.clone(),
                    attempt,
                    reply: InviteReply::Accepted(session),
                });
                // Both radios report the link; the inviter's report is redundant
                // unless it already gave up on the invite
                self.deliver(&peer, TransportEvent::LinkStateChanged {
                    peer: from.clone(),
                    state: LinkState::Connected(session),
                });
                self.deliver(from, TransportEvent::LinkStateChanged {
                    peer: peer.clone(),
                    state: LinkState::Connected(session),
                });
            }
            Command::SendData { peer, pass, bytes } => {
                if self.has_session(from, &peer) && self.transmit(from, &peer) {
                    self.stats.data_delivered += 1;
                    self.deliver(&peer, TransportEvent::DataReceived {
                        peer: from.clone(),
                        bytes,
                    });
                    self.deliver(from, NodeEvent::DataSent { peer, pass });
                } else {
                    self.stats.data_lost += 1;
                    self.deliver(from, NodeEvent::DataSendFailed {
                        peer,
                        pass,
                        reason: "link lost".into(),
                    });
                }
            }
            Command::CloseSession { peer, .. } => {
                if self.sessions.remove(&pair(from, &peer)).is_some() {
                    self.deliver(&peer, TransportEvent::LinkStateChanged {
                        peer: from.clone(),
                        state: LinkState::NotConnected,
                    });
                }
            }
        }
    }

    fn transmit(&mut self, from: &PeerId, to: &PeerId) -> bool {
        let key = (from.clone(), to.clone());
        if !self.links.contains_key(&key) {
            let seed = self.seed_counter;
            self.seed_counter += 1;
            self.links
                .insert(key.clone(), ChaosLink::new(self.chaos.clone(), seed));
        }
        self.links
            .get_mut(&key)
            .map_or(false, |link| link.transmit())
    }

    fn deliver(&mut self, to: &PeerId, event: impl Into<NodeEvent>) {
        if let Some(peer) = self.peers.get_mut(to) {
            peer.node.enqueue(event);
        }
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: i64) -> TrackedPayload {
        TrackedPayload::new().with("n", n)
    }

    #[test]
    fn test_mesh_connects_and_delivers() {
        let mut mesh = Mesh::new(NodeConfig::default());
        let a = mesh.add_peer("a");
        let b = mesh.add_peer("b");
        mesh.bring_into_range(&a, &b);

        mesh.track(&a, payload(1));
        mesh.settle();
        assert!(mesh.has_session(&a, &b));
        assert!(mesh.node(&a).unwrap().registry().connected_peers().contains(&b));
        assert!(mesh.node(&b).unwrap().registry().connected_peers().contains(&a));

        mesh.track(&a, payload(2));
        mesh.settle();
        let received = mesh.peer(&b).unwrap().received_from(&a);
        assert_eq!(received, vec![&payload(1), &payload(2)]);
        assert_eq!(mesh.stats().data_delivered, 1);
    }

    #[test]
    fn test_settle_is_idempotent() {
        let mut mesh = Mesh::new(NodeConfig::default());
        let a = mesh.add_peer("a");
        let b = mesh.add_peer("b");
        mesh.bring_into_range(&a, &b);
        mesh.settle();

        assert_eq!(mesh.settle(), 0);
    }

    #[test]
    fn test_out_of_range_invite_fails() {
        let mut mesh = Mesh::new(NodeConfig::default());
        let a = mesh.add_peer("a");
        let b = mesh.add_peer("b");
        mesh.bring_into_range(&a, &b);
        mesh.settle();

        // Radio range is gone but discovery has not noticed yet
        mesh.in_range.clear();
        mesh.track(&a, payload(1));
        mesh.settle();

        let stats = mesh.node(&a).unwrap().stats();
        assert_eq!(stats.invite_failures, 1);
        assert!(mesh.node(&a).unwrap().negotiator().is_empty());
    }

    #[test]
    fn test_hostile_links_lose_traffic() {
        let mut mesh = Mesh::new(NodeConfig::default()).with_chaos(ChaosConfig::hostile(), 3);
        let a = mesh.add_peer("a");
        let b = mesh.add_peer("b");
        mesh.bring_into_range(&a, &b);

        for n in 0..50 {
            mesh.track(&a, payload(n));
            mesh.advance(Duration::from_secs(11));
        }

        let link = mesh.link_stats(&a, &b).unwrap();
        assert!(link.sent > 0);
        assert_eq!(link.sent, link.delivered + link.lost);
    }
}
