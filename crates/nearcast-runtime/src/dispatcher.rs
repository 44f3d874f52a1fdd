//! Event dispatch - the single ordered stream every state change flows through
//!
//! Transport callbacks, application `track` calls, command completions and
//! timer expiries are all queued here and consumed one at a time. Nothing is
//! dropped and nothing interleaves.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use nearcast_core::{
    AttemptId, InviteReply, NearcastResult, PassId, PeerId, Timestamp, TrackedPayload,
    TransportEvent,
};

use crate::broadcast::PassReport;
use crate::node::NodeSnapshot;

/// Everything a node reacts to
#[derive(Debug)]
pub enum NodeEvent {
    /// Reported by the transport
    Transport(TransportEvent),
    /// Application replaced the tracked payload
    Track {
        payload: TrackedPayload,
        reply: Option<oneshot::Sender<NearcastResult<PassReport>>>,
    },
    /// An invite left the device
    InviteSent { peer: PeerId, attempt: AttemptId },
    /// An invite could not be sent
    InviteSendFailed {
        peer: PeerId,
        attempt: AttemptId,
        reason: String,
    },
    /// The remote answered an invite
    InviteAnswered {
        peer: PeerId,
        attempt: AttemptId,
        reply: InviteReply,
    },
    /// An invite deadline passed
    InviteTimedOut { peer: PeerId, attempt: AttemptId },
    DataSent { peer: PeerId, pass: PassId },
    DataSendFailed {
        peer: PeerId,
        pass: PassId,
        reason: String,
    },
    /// Advance the logical clock
    Tick { now: Timestamp },
    /// Read the node state in stream order
    Inspect { reply: oneshot::Sender<NodeSnapshot> },
}

impl NodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::Transport(TransportEvent::PeerFound { .. }) => "peer-found",
            NodeEvent::Transport(TransportEvent::PeerLost { .. }) => "peer-lost",
            NodeEvent::Transport(TransportEvent::InvitationReceived { .. }) => "invitation-received",
            NodeEvent::Transport(TransportEvent::LinkStateChanged { .. }) => "link-state-changed",
            NodeEvent::Transport(TransportEvent::DataReceived { .. }) => "data-received",
            NodeEvent::Transport(TransportEvent::RadioStateChanged(_)) => "radio-state-changed",
            NodeEvent::Track { .. } => "track",
            NodeEvent::InviteSent { .. } => "invite-sent",
            NodeEvent::InviteSendFailed { .. } => "invite-send-failed",
            NodeEvent::InviteAnswered { .. } => "invite-answered",
            NodeEvent::InviteTimedOut { .. } => "invite-timed-out",
            NodeEvent::DataSent { .. } => "data-sent",
            NodeEvent::DataSendFailed { .. } => "data-send-failed",
            NodeEvent::Tick { .. } => "tick",
            NodeEvent::Inspect { .. } => "inspect",
        }
    }
}

impl From<TransportEvent> for NodeEvent {
    fn from(event: TransportEvent) -> Self {
        NodeEvent::Transport(event)
    }
}

/// FIFO of pending node events
#[derive(Debug, Default)]
pub struct EventDispatcher {
    queue: VecDeque<NodeEvent>,
    enqueued: u64,
    dispatched: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: NodeEvent) {
        self.enqueued += 1;
        self.queue.push_back(event);
    }

    /// Next event in arrival order
    pub fn next_event(&mut self) -> Option<NodeEvent> {
        let event = self.queue.pop_front();
        if event.is_some() {
            self.dispatched += 1;
        }
        event
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}
