//! Inbound invitation policy

use std::collections::HashSet;

use nearcast_core::PeerId;

/// Decides whether to accept a session invitation from a remote peer
pub trait InvitationPolicy: Send + Sync {
    fn evaluate(&self, peer: &PeerId, context: &[u8]) -> bool;
}

/// Accept every invitation. No trust is established with the remote peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl InvitationPolicy for AcceptAll {
    fn evaluate(&self, _peer: &PeerId, _context: &[u8]) -> bool {
        true
    }
}

/// Accept only peers whose display name is listed
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    names: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }
}

impl InvitationPolicy for AllowList {
    fn evaluate(&self, peer: &PeerId, _context: &[u8]) -> bool {
        self.names.contains(peer.display_name())
    }
}
