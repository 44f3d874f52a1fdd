//! Broadcast coordination - owns the tracked payload and plans fan-out passes
//!
//! A pass encodes the current snapshot exactly once and targets the connected
//! set as it was when the pass began. Later `track` calls swap the snapshot
//! reference and never touch bytes already handed to a pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;

use nearcast_core::{NearcastResult, PassId, PeerId, TrackedPayload};
use nearcast_transport::PayloadCodec;

/// One planned fan-out pass
#[derive(Clone, Debug)]
pub struct FanOut {
    pub pass: PassId,
    pub snapshot: Arc<TrackedPayload>,
    /// Encoded snapshot, shared by every target
    pub bytes: Bytes,
    pub targets: Vec<PeerId>,
}

/// What a completed `track` call set in motion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassReport {
    pub pass: PassId,
    /// Data sends issued, one per connected peer
    pub deliveries: usize,
    /// Invites issued to discovered peers
    pub invites: usize,
}

/// Owner of the process-wide tracked payload
pub struct BroadcastCoordinator {
    current: Arc<TrackedPayload>,
    codec: Arc<dyn PayloadCodec>,
    next_pass: u64,
}

impl BroadcastCoordinator {
    pub fn new(codec: Arc<dyn PayloadCodec>) -> Self {
        BroadcastCoordinator {
            current: Arc::new(TrackedPayload::new()),
            codec,
            next_pass: 0,
        }
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<TrackedPayload> {
        Arc::clone(&self.current)
    }

    /// Replace the payload wholesale, returning the new snapshot
    pub fn track(&mut self, payload: TrackedPayload) -> Arc<TrackedPayload> {
        self.current = Arc::new(payload);
        self.current()
    }

    /// Plan a pass over `targets`.
    ///
    /// The pass id is consumed even when encoding fails so aborted passes can
    /// be reported.
    pub fn begin_pass(&mut self, targets: BTreeSet<PeerId>) -> (PassId, NearcastResult<FanOut>) {
        self.next_pass += 1;
        let pass = PassId(self.next_pass);
        let snapshot = self.current();

        let fan_out = self.codec.encode(&snapshot).map(|bytes| FanOut {
            pass,
            snapshot,
            bytes,
            targets: targets.into_iter().collect(),
        });
        (pass, fan_out)
    }

    pub fn passes_started(&self) -> u64 {
        self.next_pass
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }
}

impl std::fmt::Debug for BroadcastCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastCoordinator")
            .field("current", &self.current)
            .field("next_pass", &self.next_pass)
            .finish_non_exhaustive()
    }
}
