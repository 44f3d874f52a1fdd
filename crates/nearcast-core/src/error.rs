//! Error types for Nearcast

use thiserror::Error;

use crate::PeerId;

/// Core Nearcast errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NearcastError {
    // Registry errors
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Invalid transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: PeerId,
        from: String,
        to: String,
    },

    // Negotiation errors
    #[error("Invite to {peer} failed: {reason}")]
    InviteSendFailed { peer: PeerId, reason: String },

    #[error("Invite to {peer} timed out")]
    Timeout { peer: PeerId },

    // Broadcast errors
    #[error("Data send to {peer} failed: {reason}")]
    DataSendFailed { peer: PeerId, reason: String },

    #[error("Payload encoding failed: {0}")]
    EncodingError(String),

    #[error("Payload decoding failed: {0}")]
    DecodingError(String),

    // Configuration errors
    #[error("Invalid service id: {0:?}")]
    InvalidServiceId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Node has shut down")]
    Shutdown,
}

impl NearcastError {
    /// Per-peer failures are recovered locally and never fail a broadcast
    pub fn is_per_peer(&self) -> bool {
        matches!(
            self,
            NearcastError::InviteSendFailed { .. }
                | NearcastError::DataSendFailed { .. }
                | NearcastError::Timeout { .. }
        )
    }
}

/// Result type for Nearcast operations
pub type NearcastResult<T> = Result<T, NearcastError>;
