//! Session negotiation - turns a discovered peer into a connected one
//!
//! At most one `InviteAttempt` exists per peer. Every completion (sent, send
//! failure, answer, timeout) names the attempt it belongs to; completions for
//! an attempt that no longer exists are stale and ignored, which is how
//! cancellation suppresses late answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nearcast_core::{
    AttemptId, InviteReply, NearcastError, NearcastResult, PeerId, SessionHandle, Timestamp,
    TrackedPayload,
};

use crate::registry::{Peer, PeerRegistry, PeerState};

/// Outcome of an invite attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InviteOutcome {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
    Failed,
    /// Peer was removed while the attempt was outstanding
    Cancelled,
}

/// One outstanding session-establishment request
#[derive(Clone, Debug)]
pub struct InviteAttempt {
    pub id: AttemptId,
    pub peer: PeerId,
    /// Payload snapshot carried as invite context
    pub payload: Arc<TrackedPayload>,
    pub started_at: Timestamp,
    pub sent_at: Option<Timestamp>,
    pub deadline: Option<Timestamp>,
    pub outcome: InviteOutcome,
    timeout_queued: bool,
}

impl InviteAttempt {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    fn finish(mut self, outcome: InviteOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Result of a link coming up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkUp {
    /// Our outstanding invite was accepted
    InviteAccepted(AttemptId),
    /// Session established without (or overriding) our own invite
    Inbound,
    /// Peer was already connected or is being torn down
    Ignored,
}

/// Result of a link going down
#[derive(Clone, Debug, PartialEq)]
pub enum LinkDown {
    /// Connected peer dropped and was removed
    Disconnected(Peer),
    /// Our outstanding invite was declined
    InviteRejected(AttemptId),
    Ignored,
}

/// A peer removed from the registry
#[derive(Clone, Debug)]
pub struct RemovedPeer {
    pub peer: Peer,
    /// Session that was up when the peer went away
    pub session: Option<SessionHandle>,
    pub cancelled: Option<InviteAttempt>,
}

/// Drives per-peer negotiation on top of the registry
#[derive(Debug)]
pub struct SessionNegotiator {
    invite_timeout: Duration,
    attempts: HashMap<PeerId, InviteAttempt>,
    next_attempt: u64,
}

impl SessionNegotiator {
    pub fn new(invite_timeout: Duration) -> Self {
        SessionNegotiator {
            invite_timeout,
            attempts: HashMap::new(),
            next_attempt: 0,
        }
    }

    pub fn invite_timeout(&self) -> Duration {
        self.invite_timeout
    }

    /// A peer is invitable when `Discovered` with no attempt outstanding
    pub fn can_invite(&self, registry: &PeerRegistry, peer: &PeerId) -> bool {
        registry.state(peer) == Some(PeerState::Discovered) && !self.attempts.contains_key(peer)
    }

    /// `Discovered -> Inviting`, creating the attempt
    pub fn start_invite(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        payload: Arc<TrackedPayload>,
        now: Timestamp,
    ) -> NearcastResult<AttemptId> {
        registry.set_state(peer, PeerState::Inviting)?;

        self.next_attempt += 1;
        let id = AttemptId(self.next_attempt);
        self.attempts.insert(
            peer.clone(),
            InviteAttempt {
                id,
                peer: peer.clone(),
                payload,
                started_at: now,
                sent_at: None,
                deadline: None,
                outcome: InviteOutcome::Pending,
                timeout_queued: false,
            },
        );
        Ok(id)
    }

    /// `Inviting -> InviteSent`, arming the deadline. False if stale.
    pub fn invite_sent(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        attempt: AttemptId,
        now: Timestamp,
    ) -> NearcastResult<bool> {
        let Some(record) = self.attempts.get_mut(peer) else {
            return Ok(false);
        };
        if record.id != attempt || record.is_sent() {
            return Ok(false);
        }

        registry.set_state(peer, PeerState::InviteSent)?;
        record.sent_at = Some(now);
        record.deadline = Some(now.saturating_add(self.invite_timeout));
        Ok(true)
    }

    /// `Inviting -> Discovered`; the peer stays invitable
    pub fn invite_send_failed(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        attempt: AttemptId,
    ) -> NearcastResult<Option<InviteAttempt>> {
        if !self.matches(peer, attempt, false) {
            return Ok(None);
        }
        registry.set_state(peer, PeerState::Discovered)?;
        Ok(self.take(peer, InviteOutcome::Failed))
    }

    /// `InviteSent -> Connected | Discovered`
    pub fn invite_answered(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        attempt: AttemptId,
        reply: InviteReply,
    ) -> NearcastResult<Option<InviteAttempt>> {
        if !self.matches(peer, attempt, true) {
            return Ok(None);
        }
        let outcome = match reply {
            InviteReply::Accepted(session) => {
                registry.set_state(peer, PeerState::Connected(session))?;
                InviteOutcome::Accepted
            }
            InviteReply::Rejected => {
                registry.set_state(peer, PeerState::Discovered)?;
                InviteOutcome::Rejected
            }
        };
        Ok(self.take(peer, outcome))
    }

    /// Attempts whose deadline has passed and whose timeout has not yet been
    /// queued. Each attempt is reported at most once.
    pub fn expired(&mut self, now: Timestamp) -> Vec<(PeerId, AttemptId)> {
        let mut expired: Vec<(PeerId, AttemptId)> = self
            .attempts
            .values_mut()
            .filter(|a| !a.timeout_queued && a.deadline.is_some_and(|d| d <= now))
            .map(|a| {
                a.timeout_queued = true;
                (a.peer.clone(), a.id)
            })
            .collect();
        expired.sort();
        expired
    }

    /// `InviteSent -> Discovered` after the deadline
    pub fn time_out(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        attempt: AttemptId,
    ) -> NearcastResult<Option<InviteAttempt>> {
        if !self.matches(peer, attempt, true) {
            return Ok(None);
        }
        registry.set_state(peer, PeerState::Discovered)?;
        Ok(self.take(peer, InviteOutcome::TimedOut))
    }

    /// Transport reports an established session with `peer`
    pub fn link_up(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        session: SessionHandle,
    ) -> NearcastResult<LinkUp> {
        match registry.state(peer) {
            Some(PeerState::InviteSent) => {
                registry.set_state(peer, PeerState::Connected(session))?;
                let attempt = self.take(peer, InviteOutcome::Accepted);
                Ok(attempt.map_or(LinkUp::Inbound, |a| LinkUp::InviteAccepted(a.id)))
            }
            Some(PeerState::Inviting) => {
                // Our invite never left, but the remote connected anyway
                registry.set_state(peer, PeerState::Discovered)?;
                registry.set_state(peer, PeerState::Connected(session))?;
                self.take(peer, InviteOutcome::Cancelled);
                Ok(LinkUp::Inbound)
            }
            Some(PeerState::Discovered) => {
                registry.set_state(peer, PeerState::Connected(session))?;
                Ok(LinkUp::Inbound)
            }
            Some(PeerState::Connected(_)) | Some(PeerState::Disconnecting) => Ok(LinkUp::Ignored),
            None => Err(NearcastError::UnknownPeer(peer.clone())),
        }
    }

    /// Transport reports the session with `peer` is down
    pub fn link_down(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
    ) -> NearcastResult<LinkDown> {
        match registry.state(peer) {
            Some(PeerState::Connected(_)) => {
                registry.set_state(peer, PeerState::Disconnecting)?;
                self.take(peer, InviteOutcome::Cancelled);
                let removed = registry
                    .remove(peer)
                    .ok_or_else(|| NearcastError::UnknownPeer(peer.clone()))?;
                Ok(LinkDown::Disconnected(removed))
            }
            Some(PeerState::InviteSent) => {
                registry.set_state(peer, PeerState::Discovered)?;
                let attempt = self.take(peer, InviteOutcome::Rejected);
                Ok(attempt.map_or(LinkDown::Ignored, |a| LinkDown::InviteRejected(a.id)))
            }
            _ => Ok(LinkDown::Ignored),
        }
    }

    /// Remove a peer, cancelling its outstanding attempt first
    pub fn remove_peer(&mut self, registry: &mut PeerRegistry, peer: &PeerId) -> Option<RemovedPeer> {
        let cancelled = self.take(peer, InviteOutcome::Cancelled);

        let session = match registry.state(peer)? {
            PeerState::Connected(session) => {
                // Connected peers pass through Disconnecting on the way out
                registry.set_state(peer, PeerState::Disconnecting).ok()?;
                Some(session)
            }
            _ => None,
        };

        registry.remove(peer).map(|peer| RemovedPeer {
            peer,
            session,
            cancelled,
        })
    }

    pub fn outstanding(&self, peer: &PeerId) -> Option<&InviteAttempt> {
        self.attempts.get(peer)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn matches(&self, peer: &PeerId, attempt: AttemptId, sent: bool) -> bool {
        self.attempts
            .get(peer)
            .is_some_and(|a| a.id == attempt && a.is_sent() == sent)
    }

    fn take(&mut self, peer: &PeerId, outcome: InviteOutcome) -> Option<InviteAttempt> {
        self.attempts.remove(peer).map(|a| a.finish(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearcast_core::DiscoveryInfo;
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn peer(n: u64) -> PeerId {
        PeerId::new(format!("peer-{}", n), n)
    }

    fn setup(peers: &[u64]) -> (PeerRegistry, SessionNegotiator) {
        let mut registry = PeerRegistry::new();
        for &n in peers {
            registry.upsert(peer(n), DiscoveryInfo::new(), Timestamp::ZERO);
        }
        (registry, SessionNegotiator::new(TIMEOUT))
    }

    fn payload() -> Arc<TrackedPayload> {
        Arc::new(TrackedPayload::new().with("x", 1))
    }

    #[test]
    fn test_invite_accept_connects() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);

        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        assert_eq!(registry.state(&id), Some(PeerState::Inviting));
        assert!(!negotiator.can_invite(&registry, &id));

        assert!(negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp(100))
            .unwrap());
        assert_eq!(registry.state(&id), Some(PeerState::InviteSent));
        assert_eq!(
            negotiator.outstanding(&id).unwrap().deadline,
            Some(Timestamp(10_100))
        );

        let done = negotiator
            .invite_answered(
                &mut registry,
                &id,
                attempt,
                InviteReply::Accepted(SessionHandle(5)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.outcome, InviteOutcome::Accepted);
        assert_eq!(
            registry.state(&id),
            Some(PeerState::Connected(SessionHandle(5)))
        );
        assert!(negotiator.is_empty());
    }

    #[test]
    fn test_send_failure_leaves_peer_invitable() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);

        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        let failed = negotiator
            .invite_send_failed(&mut registry, &id, attempt)
            .unwrap()
            .unwrap();

        assert_eq!(failed.outcome, InviteOutcome::Failed);
        assert_eq!(registry.state(&id), Some(PeerState::Discovered));
        assert!(negotiator.can_invite(&registry, &id));
    }

    #[test]
    fn test_reject_reverts_to_discovered() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);

        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
            .unwrap();
        let done = negotiator
            .invite_answered(&mut registry, &id, attempt, InviteReply::Rejected)
            .unwrap()
            .unwrap();

        assert_eq!(done.outcome, InviteOutcome::Rejected);
        assert_eq!(registry.state(&id), Some(PeerState::Discovered));
    }

    #[test]
    fn test_start_invite_requires_discovered() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();

        let err = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap_err();
        assert!(matches!(err, NearcastError::InvalidTransition { .. }));
        assert_eq!(negotiator.len(), 1);

        let err = negotiator
            .start_invite(&mut registry, &peer(9), payload(), Timestamp::ZERO)
            .unwrap_err();
        assert_eq!(err, NearcastError::UnknownPeer(peer(9)));
    }

    #[test]
    fn test_timeout_reported_once() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
            .unwrap();

        assert!(negotiator.expired(Timestamp(9_999)).is_empty());
        assert_eq!(negotiator.expired(Timestamp(10_000)), vec![(id.clone(), attempt)]);
        assert!(negotiator.expired(Timestamp(20_000)).is_empty());

        let done = negotiator
            .time_out(&mut registry, &id, attempt)
            .unwrap()
            .unwrap();
        assert_eq!(done.outcome, InviteOutcome::TimedOut);
        assert_eq!(registry.state(&id), Some(PeerState::Discovered));
        assert!(negotiator.time_out(&mut registry, &id, attempt).unwrap().is_none());
    }

    #[test]
    fn test_unsent_attempt_never_expires() {
        let (mut registry, mut negotiator) = setup(&[1]);
        negotiator
            .start_invite(&mut registry, &peer(1), payload(), Timestamp::ZERO)
            .unwrap();
        assert!(negotiator.expired(Timestamp(1_000_000)).is_empty());
    }

    #[test]
    fn test_remove_cancels_and_late_answer_is_noop() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
            .unwrap();

        let removed = negotiator.remove_peer(&mut registry, &id).unwrap();
        assert_eq!(
            removed.cancelled.map(|a| a.outcome),
            Some(InviteOutcome::Cancelled)
        );
        assert!(negotiator.is_empty());

        // Rediscovered under the same id: the old answer must not connect it
        registry.upsert(id.clone(), DiscoveryInfo::new(), Timestamp(1));
        let late = negotiator
            .invite_answered(
                &mut registry,
                &id,
                attempt,
                InviteReply::Accepted(SessionHandle(1)),
            )
            .unwrap();
        assert!(late.is_none());
        assert_eq!(registry.state(&id), Some(PeerState::Discovered));
    }

    #[test]
    fn test_remove_connected_reports_session() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        negotiator
            .link_up(&mut registry, &id, SessionHandle(8))
            .unwrap();

        let removed = negotiator.remove_peer(&mut registry, &id).unwrap();
        assert_eq!(removed.session, Some(SessionHandle(8)));
        assert_eq!(removed.peer.state, PeerState::Disconnecting);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_link_up_during_invite_sent_accepts() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();
        negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
            .unwrap();

        let up = negotiator
            .link_up(&mut registry, &id, SessionHandle(2))
            .unwrap();
        assert_eq!(up, LinkUp::InviteAccepted(attempt));

        // The transport's own answer arrives afterwards and is stale
        assert!(negotiator
            .invite_answered(
                &mut registry,
                &id,
                attempt,
                InviteReply::Accepted(SessionHandle(2))
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_link_up_while_inviting_is_inbound() {
        let (mut registry, mut negotiator) = setup(&[1]);
        let id = peer(1);
        let attempt = negotiator
            .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
            .unwrap();

        let up = negotiator
            .link_up(&mut registry, &id, SessionHandle(4))
            .unwrap();
        assert_eq!(up, LinkUp::Inbound);
        assert!(negotiator.is_empty());

        // Our own send completion is now stale
        assert!(!negotiator
            .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
            .unwrap());
        assert!(registry.state(&id).unwrap().is_connected());
    }

    #[test]
    fn test_link_down_paths() {
        let (mut registry, mut negotiator) = setup(&[1, 2, 3]);

        negotiator
            .link_up(&mut registry, &peer(1), SessionHandle(1))
            .unwrap();
        let down = negotiator.link_down(&mut registry, &peer(1)).unwrap();
        assert!(matches!(down, LinkDown::Disconnected(ref p) if p.id == peer(1)));
        assert!(!registry.contains(&peer(1)));

        let attempt = negotiator
            .start_invite(&mut registry, &peer(2), payload(), Timestamp::ZERO)
            .unwrap();
        negotiator
            .invite_sent(&mut registry, &peer(2), attempt, Timestamp::ZERO)
            .unwrap();
        assert_eq!(
            negotiator.link_down(&mut registry, &peer(2)).unwrap(),
            LinkDown::InviteRejected(attempt)
        );
        assert_eq!(registry.state(&peer(2)), Some(PeerState::Discovered));

        assert_eq!(
            negotiator.link_down(&mut registry, &peer(3)).unwrap(),
            LinkDown::Ignored
        );
    }

    proptest! {
        #[test]
        fn test_each_attempt_times_out_at_most_once(ticks in proptest::collection::vec(0u64..5_000, 1..40)) {
            let (mut registry, mut negotiator) = setup(&[1]);
            let id = peer(1);
            let attempt = negotiator
                .start_invite(&mut registry, &id, payload(), Timestamp::ZERO)
                .unwrap();
            negotiator
                .invite_sent(&mut registry, &id, attempt, Timestamp::ZERO)
                .unwrap();

            let mut now = Timestamp::ZERO;
            let mut reverts = 0;
            for step in ticks {
                now = Timestamp(now.as_millis() + step);
                for (p, a) in negotiator.expired(now) {
                    if negotiator.time_out(&mut registry, &p, a).unwrap().is_some() {
                        reverts += 1;
                    }
                }
            }

            let expected = if now >= Timestamp(10_000) { 1 } else { 0 };
            prop_assert_eq!(reverts, expected);
        }
    }
}
