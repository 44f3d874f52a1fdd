//! End-to-end Integration Test Suite
//!
//! Scenarios that run several nodes through a `Mesh`:
//! - Discovery, invitation and fan-out between real nodes
//! - Invite timeouts and re-invitation on later passes
//! - Peers leaving range mid-negotiation
//! - Invariants that must hold after any sequence of events

use nearcast_core::PeerId;
use nearcast_runtime::{Node, RuntimeStats};

use crate::simulator::Mesh;

// ============================================================================
// INVARIANTS
// ============================================================================

/// Every invite a node issued has exactly one fate, or is still outstanding
pub fn check_invite_accounting(node: &Node) -> Result<(), String> {
    let stats: &RuntimeStats = node.stats();
    let resolved = stats.invites_accepted
        + stats.invites_rejected
        + stats.invites_timed_out
        + stats.invite_failures
        + stats.invites_cancelled;
    let outstanding = node.negotiator().len() as u64;

    if stats.invites_issued == resolved + outstanding {
        Ok(())
    } else {
        Err(format!(
            "{}: issued {} invites, {} resolved, {} outstanding",
            node.local_peer(),
            stats.invites_issued,
            resolved,
            outstanding
        ))
    }
}

/// A node is only connected to peers its radio can reach
pub fn check_connections_in_range(mesh: &Mesh, id: &PeerId) -> Result<(), String> {
    let Some(node) = mesh.node(id) else {
        return Err(format!("{}: not in mesh", id));
    };
    for peer in node.registry().connected_peers() {
        if !mesh.is_in_range(id, &peer) {
            return Err(format!("{}: connected to out-of-range {}", id, peer));
        }
    }
    Ok(())
}

/// Every outstanding invite belongs to a peer in an invite state
pub fn check_outstanding_invites(node: &Node) -> Result<(), String> {
    for peer in node.registry().iter() {
        let outstanding = node.negotiator().outstanding(&peer.id).is_some();
        if outstanding != peer.state.is_negotiating() {
            return Err(format!(
                "{}: {} is {} but outstanding invite = {}",
                node.local_peer(),
                peer.id,
                peer.state,
                outstanding
            ));
        }
    }
    Ok(())
}

/// Run every invariant on every node in the mesh
pub fn check_mesh(mesh: &Mesh) -> Result<(), String> {
    for id in mesh.peer_ids() {
        let node = mesh
            .node(&id)
            .ok_or_else(|| format!("{}: not in mesh", id))?;
        check_invite_accounting(node)?;
        check_outstanding_invites(node)?;
        check_connections_in_range(mesh, &id)?;
    }
    Ok(())
}
