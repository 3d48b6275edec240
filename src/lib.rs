//! Multi-chassis link aggregation (MLAG) control-plane daemon.
//!
//! Two switches joined by an inter-peer link present themselves to LACP
//! partners as a single logical chassis. This workspace holds the pieces:
//!
//! * [`common`]: shared types. Time, peer and topology databases, the wire
//!   protocol, counters and the switch-driver seam.
//! * [`core`]: the protocol state machines. Peer health, master election,
//!   sync orchestration, LACP aggregator arbitration, L3 VLAN aggregation
//!   and MLAG port management.
//! * [`node`]: the daemon runtime. Dispatcher threads, heartbeat socket,
//!   peer channel, RPC surface and the `mlagd` binary entry point.

#[cfg(feature = "mlag-common")]
pub use mlag_common as common;

#[cfg(feature = "mlag-core")]
pub use mlag_core as core;

#[cfg(feature = "mlag-node")]
pub use mlag_node as node;
