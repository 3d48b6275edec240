//! The FDB (MAC) sync collaborator seam.
//!
//! MAC learning and its sync protocol live in a separate library; the
//! daemon only moves its opaque payloads across the peer channel and
//! keeps the sync orchestration honest. [`NullFdb`] stands in when no
//! library is attached: it has nothing to export and discards whatever it
//! receives.

use log::*;

use mlag_common::peer::MlagId;
use mlag_common::PortId;

/// What the daemon needs from an FDB sync implementation.
pub trait FdbSync: Send {
    /// Export the local table for a syncing peer, as opaque chunks.
    fn export(&mut self, peer: MlagId) -> Vec<Vec<u8>>;

    /// Apply a chunk received from a peer.
    fn apply(&mut self, peer: MlagId, payload: Vec<u8>);

    /// An MLAG port is going away; drop addresses learned on it.
    fn port_deleted(&mut self, port_id: PortId);
}

/// The detached collaborator.
#[derive(Debug, Default)]
pub struct NullFdb;

impl FdbSync for NullFdb {
    fn export(&mut self, _peer: MlagId) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn apply(&mut self, peer: MlagId, payload: Vec<u8>) {
        trace!(
            target: "mac-sync",
            "Discarding {} byte payload from peer {}", payload.len(), peer
        );
    }

    fn port_deleted(&mut self, _port_id: PortId) {}
}
