//! In-process transport
//!
//! Records every call the core makes and answers invites according to a
//! per-peer script. Incoming events are not produced here; whoever drives the
//! node injects them directly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use nearcast_core::{
    InviteReply, NearcastError, NearcastResult, PeerId, ServiceId, SessionHandle,
};

use crate::{PendingInvite, Transport};

/// A call made on the transport
#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Advertise { service: ServiceId, local: PeerId },
    StopAdvertise,
    Browse { service: ServiceId },
    StopBrowse,
    SendInvite {
        peer: PeerId,
        context: Bytes,
        timeout: Duration,
    },
    RespondToInvitation { peer: PeerId, accept: bool },
    SendData { peer: PeerId, bytes: Bytes },
    CloseSession { peer: PeerId, session: SessionHandle },
}

/// How an invite to a given peer plays out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InviteScript {
    /// Delivered, answer withheld until `answer_invite`
    #[default]
    Hold,
    Accept(SessionHandle),
    Reject,
    /// Never leaves the device
    FailSend,
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<TransportCall>,
    default_invite: InviteScript,
    invite_scripts: HashMap<PeerId, InviteScript>,
    held_invites: HashMap<PeerId, oneshot::Sender<InviteReply>>,
    failing_data: HashSet<PeerId>,
    advertising: bool,
    browsing: bool,
}

/// Scriptable transport living entirely in memory
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script applied to peers without their own script
    pub fn set_default_invite(&self, script: InviteScript) {
        self.state.lock().default_invite = script;
    }

    pub fn set_invite_script(&self, peer: PeerId, script: InviteScript) {
        self.state.lock().invite_scripts.insert(peer, script);
    }

    /// Make every data send to `peer` fail
    pub fn fail_data_to(&self, peer: PeerId) {
        self.state.lock().failing_data.insert(peer);
    }

    pub fn restore_data_to(&self, peer: &PeerId) {
        self.state.lock().failing_data.remove(peer);
    }

    /// Answer a held invite. Returns false if none was held.
    pub fn answer_invite(&self, peer: &PeerId, reply: InviteReply) -> bool {
        let sender = self.state.lock().held_invites.remove(peer);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a held invite without answering
    pub fn abandon_invite(&self, peer: &PeerId) -> bool {
        self.state.lock().held_invites.remove(peer).is_some()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Payloads sent to `peer`, in order
    pub fn data_sent_to(&self, peer: &PeerId) -> Vec<Bytes> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::SendData { peer: p, bytes } if p == peer => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of invites sent to `peer`
    pub fn invites_sent_to(&self, peer: &PeerId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::SendInvite { peer: p, .. } if p == peer))
            .count()
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.state.lock().browsing
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
    }
}

impl Transport for MemoryTransport {
    async fn advertise(&self, service: &ServiceId, local: &PeerId) -> NearcastResult<()> {
        let mut state = self.state.lock();
        state.advertising = true;
        state.calls.push(TransportCall::Advertise {
            service: service.clone(),
            local: local.clone(),
        });
        Ok(())
    }

    async fn stop_advertise(&self) -> NearcastResult<()> {
        let mut state = self.state.lock();
        state.advertising = false;
        state.calls.push(TransportCall::StopAdvertise);
        Ok(())
    }

    async fn browse(&self, service: &ServiceId) -> NearcastResult<()> {
        let mut state = self.state.lock();
        state.browsing = true;
        state.calls.push(TransportCall::Browse {
            service: service.clone(),
        });
        Ok(())
    }

    async fn stop_browse(&self) -> NearcastResult<()> {
        let mut state = self.state.lock();
        state.browsing = false;
        state.calls.push(TransportCall::StopBrowse);
        Ok(())
    }

    async fn send_invite(
        &self,
        peer: &PeerId,
        context: Bytes,
        timeout: Duration,
    ) -> NearcastResult<PendingInvite> {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::SendInvite {
            peer: peer.clone(),
            context,
            timeout,
        });

        let script = state
            .invite_scripts
            .get(peer)
            .copied()
            .unwrap_or(state.default_invite);

        let (tx, rx) = oneshot::channel();
        match script {
            InviteScript::FailSend => {
                return Err(NearcastError::TransportError(format!(
                    "invite to {} refused by link layer",
                    peer
                )));
            }
            InviteScript::Accept(session) => {
                let _ = tx.send(InviteReply::Accepted(session));
            }
            InviteScript::Reject => {
                let _ = tx.send(InviteReply::Rejected);
            }
            InviteScript::Hold => {
                state.held_invites.insert(peer.clone(), tx);
            }
        }
        Ok(rx)
    }

    async fn respond_to_invitation(&self, peer: &PeerId, accept: bool) -> NearcastResult<()> {
        self.record(TransportCall::RespondToInvitation {
            peer: peer.clone(),
            accept,
        });
        Ok(())
    }

    async fn send_data(&self, peer: &PeerId, bytes: Bytes) -> NearcastResult<()> {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::SendData {
            peer: peer.clone(),
            bytes,
        });
        if state.failing_data.contains(peer) {
            tracing::trace!(peer = %peer, "memory transport dropping data send");
            return Err(NearcastError::TransportError(format!(
                "no route to {}",
                peer
            )));
        }
        Ok(())
    }

    async fn close_session(&self, peer: &PeerId, session: SessionHandle) -> NearcastResult<()> {
        self.record(TransportCall::CloseSession {
            peer: peer.clone(),
            session,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_advertise_and_browse_flags() {
        let transport = MemoryTransport::new();
        let service = ServiceId::new("tracker").unwrap();
        let local = PeerId::new("me", 1);

        block_on(async {
            transport.advertise(&service, &local).await.unwrap();
            transport.browse(&service).await.unwrap();
        });
        assert!(transport.is_advertising());
        assert!(transport.is_browsing());

        block_on(async {
            transport.stop_advertise().await.unwrap();
            transport.stop_browse().await.unwrap();
        });
        assert!(!transport.is_advertising());
        assert!(!transport.is_browsing());
        assert_eq!(transport.calls().len(), 4);
    }

    #[test]
    fn test_scripted_invites() {
        let transport = MemoryTransport::new();
        let accepter = PeerId::new("a", 1);
        let failer = PeerId::new("f", 2);
        transport.set_invite_script(accepter.clone(), InviteScript::Accept(SessionHandle(7)));
        transport.set_invite_script(failer.clone(), InviteScript::FailSend);

        let reply = block_on(async {
            let pending = transport
                .send_invite(&accepter, Bytes::new(), Duration::from_secs(10))
                .await
                .unwrap();
            pending.await.unwrap()
        });
        assert_eq!(reply, InviteReply::Accepted(SessionHandle(7)));

        let failed = block_on(transport.send_invite(&failer, Bytes::new(), Duration::from_secs(10)));
        assert!(failed.is_err());
        assert_eq!(transport.invites_sent_to(&failer), 1);
    }

    #[test]
    fn test_held_invite_answered_later() {
        let transport = MemoryTransport::new();
        let peer = PeerId::new("h", 3);

        let mut pending = block_on(transport.send_invite(&peer, Bytes::new(), Duration::from_secs(1)))
            .unwrap();
        assert!(pending.try_recv().is_err());

        assert!(transport.answer_invite(&peer, InviteReply::Rejected));
        assert_eq!(pending.try_recv().unwrap(), InviteReply::Rejected);
        assert!(!transport.answer_invite(&peer, InviteReply::Rejected));
    }

    #[test]
    fn test_failing_data_is_recorded() {
        let transport = MemoryTransport::new();
        let peer = PeerId::new("d", 4);
        transport.fail_data_to(peer.clone());

        assert!(block_on(transport.send_data(&peer, Bytes::from_static(b"x"))).is_err());
        transport.restore_data_to(&peer);
        assert!(block_on(transport.send_data(&peer, Bytes::from_static(b"y"))).is_ok());

        assert_eq!(transport.data_sent_to(&peer).len(), 2);
    }
}
