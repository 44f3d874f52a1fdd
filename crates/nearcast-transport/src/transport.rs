//! Transport capability
//!
//! The radio/link layer the core depends on. Implementations wrap a platform
//! stack (Bluetooth, Wi-Fi direct, LAN multicast) and report what they observe
//! as `TransportEvent`s through whatever sink the embedding runtime hands
//! them. The core only ever calls the operations below.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use nearcast_core::{InviteReply, NearcastResult, PeerId, ServiceId, SessionHandle};

/// Resolves with the remote answer once an invite has been delivered.
///
/// A dropped sender means the transport gave up waiting for an answer.
pub type PendingInvite = oneshot::Receiver<InviteReply>;

/// Link layer used by a node
pub trait Transport: Send + Sync + 'static {
    /// Start advertising `local` under `service`
    fn advertise(
        &self,
        service: &ServiceId,
        local: &PeerId,
    ) -> impl Future<Output = NearcastResult<()>> + Send;

    fn stop_advertise(&self) -> impl Future<Output = NearcastResult<()>> + Send;

    /// Start browsing for peers advertising `service`
    fn browse(&self, service: &ServiceId) -> impl Future<Output = NearcastResult<()>> + Send;

    fn stop_browse(&self) -> impl Future<Output = NearcastResult<()>> + Send;

    /// Deliver a session invite carrying `context`.
    ///
    /// `Ok` means the invite left this device; the remote answer arrives
    /// through the returned `PendingInvite`. `Err` means it was never sent.
    fn send_invite(
        &self,
        peer: &PeerId,
        context: Bytes,
        timeout: Duration,
    ) -> impl Future<Output = NearcastResult<PendingInvite>> + Send;

    /// Answer an invitation previously reported as `InvitationReceived`
    fn respond_to_invitation(
        &self,
        peer: &PeerId,
        accept: bool,
    ) -> impl Future<Output = NearcastResult<()>> + Send;

    /// Send bytes over an established session
    fn send_data(
        &self,
        peer: &PeerId,
        bytes: Bytes,
    ) -> impl Future<Output = NearcastResult<()>> + Send;

    /// Tear down an established session
    fn close_session(
        &self,
        peer: &PeerId,
        session: SessionHandle,
    ) -> impl Future<Output = NearcastResult<()>> + Send;
}
