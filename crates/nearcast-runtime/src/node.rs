//! Nearcast Node - ordered event processing
//!
//! The node never talks to the transport itself. It consumes `NodeEvent`s,
//! updates its components, and leaves work behind in two queues: `Command`s
//! for whoever owns the transport and `Notification`s for the application.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use nearcast_core::{
    AttemptId, DiscoveryInfo, InviteReply, LinkState, NearcastError, NearcastResult, PassId,
    PeerId, RadioState, SessionHandle, Timestamp, TrackedPayload, TransportEvent,
};
use nearcast_transport::{JsonCodec, PayloadCodec};

use crate::broadcast::{BroadcastCoordinator, FanOut, PassReport};
use crate::config::NodeConfig;
use crate::dispatcher::{EventDispatcher, NodeEvent};
use crate::negotiator::{InviteOutcome, LinkDown, LinkUp, SessionNegotiator};
use crate::policy::{AcceptAll, InvitationPolicy};
use crate::registry::{Peer, PeerRegistry};

/// Work for the transport owner
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SendInvite {
        peer: PeerId,
        attempt: AttemptId,
        context: Bytes,
        timeout: Duration,
    },
    SendData {
        peer: PeerId,
        pass: PassId,
        bytes: Bytes,
    },
    RespondToInvitation {
        peer: PeerId,
        accept: bool,
    },
    CloseSession {
        peer: PeerId,
        session: SessionHandle,
    },
}

/// Things the application may want to know about
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    PeerDiscovered(PeerId),
    PeerLost(PeerId),
    PeerConnected { peer: PeerId, session: SessionHandle },
    PeerDisconnected(PeerId),
    InviteFailed(NearcastError),
    InviteTimedOut(PeerId),
    DeliveryFailed { pass: PassId, error: NearcastError },
    PassAborted { pass: PassId, error: NearcastError },
    PayloadReceived { from: PeerId, payload: TrackedPayload },
    RadioStateChanged(RadioState),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub events_processed: u64,
    pub passes: u64,
    pub passes_aborted: u64,
    pub data_sends_attempted: u64,
    pub data_sends_succeeded: u64,
    pub data_send_failures: u64,
    pub invites_issued: u64,
    pub invites_sent: u64,
    pub invite_failures: u64,
    pub invites_accepted: u64,
    pub invites_rejected: u64,
    pub invites_timed_out: u64,
    pub invites_cancelled: u64,
    pub inbound_accepted: u64,
    pub inbound_rejected: u64,
    pub sessions_dropped: u64,
    pub payloads_received: u64,
    pub notifications_dropped: u64,
}

/// Point-in-time view of a node
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub local: PeerId,
    pub now: Timestamp,
    pub radio: RadioState,
    /// Known peers in id order
    pub peers: Vec<Peer>,
    pub connected: BTreeSet<PeerId>,
    pub payload: Arc<TrackedPayload>,
    pub outstanding_invites: usize,
    pub stats: RuntimeStats,
}

/// Nearcast node - the single owner of peer and payload state
pub struct Node {
    local: PeerId,
    config: NodeConfig,
    now: Timestamp,
    radio: RadioState,
    registry: PeerRegistry,
    negotiator: SessionNegotiator,
    broadcast: BroadcastCoordinator,
    dispatcher: EventDispatcher,
    policy: Box<dyn InvitationPolicy>,
    commands: VecDeque<Command>,
    notifications: VecDeque<Notification>,
    stats: RuntimeStats,
}

impl Node {
    /// Create a node with the JSON codec and the accept-all policy
    pub fn new(local: PeerId, config: NodeConfig) -> Self {
        let codec = Arc::new(JsonCodec::new(config.max_payload_bytes));
        Node {
            local,
            now: Timestamp::ZERO,
            radio: RadioState::default(),
            registry: PeerRegistry::new(),
            negotiator: SessionNegotiator::new(config.invite_timeout),
            broadcast: BroadcastCoordinator::new(codec),
            dispatcher: EventDispatcher::new(),
            policy: Box::new(AcceptAll),
            commands: VecDeque::new(),
            notifications: VecDeque::new(),
            stats: RuntimeStats::default(),
            config,
        }
    }

    /// Replace the payload codec. The tracked payload is reset.
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.broadcast = BroadcastCoordinator::new(codec);
        self
    }

    pub fn with_policy(mut self, policy: impl InvitationPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    pub fn broadcast(&self) -> &BroadcastCoordinator {
        &self.broadcast
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Queue an event for processing
    pub fn enqueue(&mut self, event: impl Into<NodeEvent>) {
        self.dispatcher.push(event.into());
    }

    /// Queue a payload change; the pass runs when the event is processed
    pub fn track(&mut self, payload: TrackedPayload) {
        self.enqueue(NodeEvent::Track {
            payload,
            reply: None,
        });
    }

    /// Queue a clock advance
    pub fn tick(&mut self, now: Timestamp) {
        self.enqueue(NodeEvent::Tick { now });
    }

    pub fn pending_events(&self) -> usize {
        self.dispatcher.len()
    }

    /// Process queued events, including any they queue, until idle.
    /// Returns the number of events processed.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Some(event) = self.dispatcher.next_event() {
            tracing::trace!(kind = event.kind(), "dispatching event");
            self.handle_event(event);
            self.stats.events_processed += 1;
            processed += 1;
        }
        processed
    }

    /// Get next command (if any)
    pub fn pop_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn drain_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    /// Get next notification (if any)
    pub fn pop_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let mut peers: Vec<Peer> = self.registry.iter().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        NodeSnapshot {
            local: self.local.clone(),
            now: self.now,
            radio: self.radio,
            peers,
            connected: self.registry.connected_peers(),
            payload: self.broadcast.current(),
            outstanding_invites: self.negotiator.len(),
            stats: self.stats.clone(),
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Transport(event) => self.handle_transport_event(event),
            NodeEvent::Track { payload, reply } => {
                let result = self.run_pass(payload);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            NodeEvent::InviteSent { peer, attempt } => self.on_invite_sent(peer, attempt),
            NodeEvent::InviteSendFailed {
                peer,
                attempt,
                reason,
            } => self.on_invite_send_failed(peer, attempt, reason),
            NodeEvent::InviteAnswered {
                peer,
                attempt,
                reply,
            } => self.on_invite_answered(peer, attempt, reply),
            NodeEvent::InviteTimedOut { peer, attempt } => self.on_invite_timed_out(peer, attempt),
            NodeEvent::DataSent { peer, pass } => {
                self.stats.data_sends_succeeded += 1;
                tracing::trace!(peer = %peer, pass = %pass, "payload delivered");
            }
            NodeEvent::DataSendFailed { peer, pass, reason } => {
                self.on_data_send_failed(peer, pass, reason)
            }
            NodeEvent::Tick { now } => self.on_tick(now),
            NodeEvent::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, info } => self.on_peer_found(peer, info),
            TransportEvent::PeerLost { peer } => self.on_peer_lost(peer),
            TransportEvent::InvitationReceived { peer, context } => {
                self.on_invitation_received(peer, context)
            }
            TransportEvent::LinkStateChanged { peer, state } => match state {
                LinkState::Connected(session) => self.on_link_up(peer, session),
                LinkState::NotConnected => self.on_link_down(peer),
                LinkState::Connecting => {
                    tracing::trace!(peer = %peer, "link connecting");
                }
            },
            TransportEvent::DataReceived { peer, bytes } => {
                if self.registry.contains(&peer) {
                    self.registry.upsert(peer.clone(), DiscoveryInfo::new(), self.now);
                }
                self.deliver_payload(peer, &bytes);
            }
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(state),
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    fn on_peer_found(&mut self, peer: PeerId, info: DiscoveryInfo) {
        let known = self.registry.contains(&peer);
        self.registry.upsert(peer.clone(), info, self.now);

        if known {
            tracing::trace!(peer = %peer, "peer refreshed");
        } else {
            tracing::info!(peer = %peer, "peer found");
            self.notify(Notification::PeerDiscovered(peer));
        }
    }

    fn on_peer_lost(&mut self, peer: PeerId) {
        let Some(removed) = self.negotiator.remove_peer(&mut self.registry, &peer) else {
            tracing::debug!(peer = %peer, "lost event for unknown peer ignored");
            return;
        };

        if let Some(attempt) = removed.cancelled {
            self.stats.invites_cancelled += 1;
            tracing::debug!(peer = %peer, attempt = %attempt.id, "outstanding invite cancelled");
        }
        if let Some(session) = removed.session {
            self.commands.push_back(Command::CloseSession {
                peer: peer.clone(),
                session,
            });
            self.notify(Notification::PeerDisconnected(peer.clone()));
        }

        tracing::info!(peer = %peer, "peer lost");
        self.notify(Notification::PeerLost(peer));
    }

    // ------------------------------------------------------------------
    // Inbound sessions
    // ------------------------------------------------------------------

    fn on_invitation_received(&mut self, peer: PeerId, context: Bytes) {
        let accept = self.policy.evaluate(&peer, &context);
        tracing::info!(peer = %peer, accept, "invitation received");

        if accept {
            self.stats.inbound_accepted += 1;
            if !self.registry.contains(&peer) {
                self.registry.upsert(peer.clone(), DiscoveryInfo::new(), self.now);
                self.notify(Notification::PeerDiscovered(peer.clone()));
            }
            if !context.is_empty() {
                self.deliver_payload(peer.clone(), &context);
            }
        } else {
            self.stats.inbound_rejected += 1;
        }

        self.commands
            .push_back(Command::RespondToInvitation { peer, accept });
    }

    fn on_link_up(&mut self, peer: PeerId, session: SessionHandle) {
        if !self.registry.contains(&peer) {
            self.registry.upsert(peer.clone(), DiscoveryInfo::new(), self.now);
        }

        let pending = self.negotiator.outstanding(&peer).map(|a| a.id);
        match self.negotiator.link_up(&mut self.registry, &peer, session) {
            Ok(LinkUp::InviteAccepted(attempt)) => {
                self.stats.invites_accepted += 1;
                tracing::info!(peer = %peer, attempt = %attempt, session = %session, "peer connected");
                self.notify(Notification::PeerConnected { peer, session });
            }
            Ok(LinkUp::Inbound) => {
                if let Some(attempt) = pending {
                    self.stats.invites_cancelled += 1;
                    tracing::debug!(peer = %peer, attempt = %attempt, "remote connected first, invite dropped");
                }
                tracing::info!(peer = %peer, session = %session, "inbound session connected");
                self.notify(Notification::PeerConnected { peer, session });
            }
            Ok(LinkUp::Ignored) => {
                tracing::debug!(peer = %peer, "link up ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "link up rejected");
            }
        }
    }

    fn on_link_down(&mut self, peer: PeerId) {
        match self.negotiator.link_down(&mut self.registry, &peer) {
            Ok(LinkDown::Disconnected(_)) => {
                self.stats.sessions_dropped += 1;
                tracing::info!(peer = %peer, "session dropped");
                self.notify(Notification::PeerDisconnected(peer));
            }
            Ok(LinkDown::InviteRejected(attempt)) => {
                self.stats.invites_rejected += 1;
                tracing::info!(peer = %peer, attempt = %attempt, "invite declined");
            }
            Ok(LinkDown::Ignored) => {
                tracing::debug!(peer = %peer, "link down ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "link down rejected");
            }
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        self.radio = state;
        if state.is_usable() || state == RadioState::Unknown {
            tracing::info!(radio = %state, "radio state changed");
        } else {
            tracing::warn!(radio = %state, "radio unavailable");
        }
        self.notify(Notification::RadioStateChanged(state));
    }

    fn deliver_payload(&mut self, from: PeerId, bytes: &[u8]) {
        match self.broadcast.codec().decode(bytes) {
            Ok(payload) => {
                self.stats.payloads_received += 1;
                tracing::debug!(peer = %from, keys = payload.len(), "payload received");
                self.notify(Notification::PayloadReceived { from, payload });
            }
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "dropping undecodable payload");
            }
        }
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    fn run_pass(&mut self, payload: TrackedPayload) -> NearcastResult<PassReport> {
        self.broadcast.track(payload);
        self.stats.passes += 1;

        let targets = self.registry.connected_peers();
        let (pass, planned) = self.broadcast.begin_pass(targets);
        let fan_out = match planned {
            Ok(fan_out) => fan_out,
            Err(e) => {
                self.stats.passes_aborted += 1;
                tracing::warn!(pass = %pass, error = %e, "fan-out pass aborted");
                self.notify(Notification::PassAborted {
                    pass,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        for peer in &fan_out.targets {
            self.stats.data_sends_attempted += 1;
            self.commands.push_back(Command::SendData {
                peer: peer.clone(),
                pass,
                bytes: fan_out.bytes.clone(),
            });
        }
        let invites = self.issue_invites(&fan_out);

        tracing::debug!(
            pass = %pass,
            deliveries = fan_out.targets.len(),
            invites,
            "fan-out pass issued"
        );
        Ok(PassReport {
            pass,
            deliveries: fan_out.targets.len(),
            invites,
        })
    }

    /// Invite every discovered peer not already negotiating
    fn issue_invites(&mut self, fan_out: &FanOut) -> usize {
        let timeout = self.negotiator.invite_timeout();
        let mut issued = 0;

        for peer in self.registry.discovered_peers() {
            if !self.negotiator.can_invite(&self.registry, &peer) {
                continue;
            }
            match self.negotiator.start_invite(
                &mut self.registry,
                &peer,
                Arc::clone(&fan_out.snapshot),
                self.now,
            ) {
                Ok(attempt) => {
                    self.stats.invites_issued += 1;
                    issued += 1;
                    tracing::debug!(peer = %peer, attempt = %attempt, "inviting peer");
                    self.commands.push_back(Command::SendInvite {
                        peer,
                        attempt,
                        context: fan_out.bytes.clone(),
                        timeout,
                    });
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "could not start invite");
                }
            }
        }
        issued
    }

    fn on_data_send_failed(&mut self, peer: PeerId, pass: PassId, reason: String) {
        self.stats.data_send_failures += 1;
        let error = NearcastError::DataSendFailed { peer, reason };
        tracing::warn!(pass = %pass, error = %error, "delivery failed; peer stays connected");
        self.notify(Notification::DeliveryFailed { pass, error });
    }

    // ------------------------------------------------------------------
    // Negotiation completions
    // ------------------------------------------------------------------

    fn on_invite_sent(&mut self, peer: PeerId, attempt: AttemptId) {
        match self
            .negotiator
            .invite_sent(&mut self.registry, &peer, attempt, self.now)
        {
            Ok(true) => {
                self.stats.invites_sent += 1;
                tracing::debug!(peer = %peer, attempt = %attempt, "invite sent");
            }
            Ok(false) => {
                tracing::debug!(peer = %peer, attempt = %attempt, "stale invite-sent ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, attempt = %attempt, error = %e, "invite-sent rejected");
            }
        }
    }

    fn on_invite_send_failed(&mut self, peer: PeerId, attempt: AttemptId, reason: String) {
        match self
            .negotiator
            .invite_send_failed(&mut self.registry, &peer, attempt)
        {
            Ok(Some(_)) => {
                self.stats.invite_failures += 1;
                let error = NearcastError::InviteSendFailed { peer, reason };
                tracing::warn!(attempt = %attempt, error = %error, "invite failed; peer remains eligible");
                self.notify(Notification::InviteFailed(error));
            }
            Ok(None) => {
                tracing::debug!(peer = %peer, attempt = %attempt, "stale invite failure ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, attempt = %attempt, error = %e, "invite failure rejected");
            }
        }
    }

    fn on_invite_answered(&mut self, peer: PeerId, attempt: AttemptId, reply: InviteReply) {
        match self
            .negotiator
            .invite_answered(&mut self.registry, &peer, attempt, reply)
        {
            Ok(Some(done)) => match (done.outcome, reply) {
                (InviteOutcome::Accepted, InviteReply::Accepted(session)) => {
                    self.stats.invites_accepted += 1;
                    tracing::info!(peer = %peer, attempt = %attempt, session = %session, "peer connected");
                    self.notify(Notification::PeerConnected { peer, session });
                }
                _ => {
                    self.stats.invites_rejected += 1;
                    tracing::info!(peer = %peer, attempt = %attempt, "invite declined");
                }
            },
            Ok(None) => {
                tracing::debug!(peer = %peer, attempt = %attempt, "late invite answer ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, attempt = %attempt, error = %e, "invite answer rejected");
            }
        }
    }

    fn on_invite_timed_out(&mut self, peer: PeerId, attempt: AttemptId) {
        match self.negotiator.time_out(&mut self.registry, &peer, attempt) {
            Ok(Some(_)) => {
                self.stats.invites_timed_out += 1;
                let error = NearcastError::Timeout { peer: peer.clone() };
                tracing::warn!(attempt = %attempt, error = %error, "peer back to discovered");
                self.notify(Notification::InviteTimedOut(peer));
            }
            Ok(None) => {
                tracing::debug!(peer = %peer, attempt = %attempt, "stale timeout ignored");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, attempt = %attempt, error = %e, "timeout rejected");
            }
        }
    }

    fn on_tick(&mut self, now: Timestamp) {
        self.now = self.now.max(now);
        for (peer, attempt) in self.negotiator.expired(self.now) {
            self.dispatcher
                .push(NodeEvent::InviteTimedOut { peer, attempt });
        }
    }

    fn notify(&mut self, notification: Notification) {
        if self.notifications.len() >= self.config.max_notifications
            && self.notifications.pop_front().is_some()
        {
            self.stats.notifications_dropped += 1;
        }
        self.notifications.push_back(notification);
    }
}
