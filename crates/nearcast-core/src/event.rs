//! Transport-originated events
//!
//! Everything the radio/transport layer reports to the core. Transport
//! callbacks never touch node state directly; they translate platform
//! callbacks into these values and hand them to the node's event stream.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::{PeerId, SessionHandle};

/// Key/value info a peer publishes alongside its advertisement
pub type DiscoveryInfo = BTreeMap<String, String>;

/// Session link state as reported by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    NotConnected,
    Connecting,
    Connected(SessionHandle),
}

/// Local radio readiness
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// Whether the radio can currently discover and carry sessions
    pub fn is_usable(self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "powered off",
            RadioState::PoweredOn => "powered on",
        };
        f.write_str(name)
    }
}

/// Remote answer to an invite that was delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InviteReply {
    Accepted(SessionHandle),
    Rejected,
}

/// Events emitted by the transport
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Browsing found a peer advertising our service
    PeerFound { peer: PeerId, info: DiscoveryInfo },
    /// A previously found peer is no longer reachable
    PeerLost { peer: PeerId },
    /// A remote peer invites us into a session
    InvitationReceived { peer: PeerId, context: Bytes },
    /// Session link state changed for a peer
    LinkStateChanged { peer: PeerId, state: LinkState },
    /// Bytes arrived over an established session
    DataReceived { peer: PeerId, bytes: Bytes },
    /// Link-layer readiness changed
    RadioStateChanged(RadioState),
}

impl TransportEvent {
    /// Peer the event concerns, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            TransportEvent::PeerFound { peer, .. }
            | TransportEvent::PeerLost { peer }
            | TransportEvent::InvitationReceived { peer, .. }
            | TransportEvent::LinkStateChanged { peer, .. }
            | TransportEvent::DataReceived { peer, .. } => Some(peer),
            TransportEvent::RadioStateChanged(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_peer_accessor() {
        let peer = PeerId::new("a", 1);
        let found = TransportEvent::PeerFound {
            peer: peer.clone(),
            info: DiscoveryInfo::new(),
        };
        assert_eq!(found.peer(), Some(&peer));
        assert!(TransportEvent::RadioStateChanged(RadioState::PoweredOn)
            .peer()
            .is_none());
    }

    #[test]
    fn test_radio_usability() {
        assert!(RadioState::PoweredOn.is_usable());
        assert!(!RadioState::PoweredOff.is_usable());
        assert!(!RadioState::default().is_usable());
    }
}
