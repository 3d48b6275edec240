//! Bus events.
//!
//! Events are the only channel between subsystems. The runtime copies each
//! published event into every subscribed dispatcher queue, into the class
//! given by [`Event::priority`].

use std::fmt;
use std::net::Ipv4Addr;

use mlag_common::message::{SelectionResponse, SyncKind, VlanStateEntry};
use mlag_common::peer::{HealthState, MlagId, PeerIndex, Role, SystemId};
use mlag_common::time::LocalDuration;
use mlag_common::topology::{IfIndex, IplId, VlanId};
use mlag_common::{LinkState, PortId};

use super::portmgr::PortGlobalState;

/// Queueing class of an event. Dispatchers drain `High` before `Medium`
/// before `Low`, FIFO within a class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Drained first.
    High,
    /// The default class.
    Medium,
    /// Drained last.
    Low,
}

/// The subsystems that run their own dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Subsystem {
    /// Peer liveness: heartbeat and the health state machines.
    Health,
    /// Election, sync, LACP, L3 and port management.
    Manager,
    /// The FDB sync collaborator.
    MacSync,
}

impl Subsystem {
    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Manager => "mlag",
            Self::MacSync => "mac-sync",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tunneled protocol a relayed PDU belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TunnelKind {
    /// IGMP snooping PDUs.
    Igmp,
    /// Spanning-tree PDUs.
    Xstp,
}

/// Payload of a role change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RoleChange {
    /// Role after the election.
    pub current: Role,
    /// Role before the election.
    pub previous: Role,
    /// Local IPL address, if configured.
    pub my_addr: Option<Ipv4Addr>,
    /// Peer IPL address, if configured.
    pub peer_addr: Option<Ipv4Addr>,
    /// The id this chassis now owns.
    pub my_peer_id: MlagId,
    /// The id of whichever chassis is master.
    pub master_peer_id: MlagId,
}

/// A typed bus event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The daemon started; protocol activity may begin.
    Started {
        /// The local chassis identity.
        system_id: SystemId,
    },
    /// Stop requested; every subsystem quiesces.
    Stop,
    /// A subsystem finished quiescing.
    StopDone {
        /// The subsystem.
        subsystem: Subsystem,
    },
    /// Final teardown after a stop has drained.
    Deinit,
    /// A peer record was created.
    PeerAdded {
        /// Local slot of the new peer.
        peer: PeerIndex,
        /// IPL the peer is reached through.
        ipl: IplId,
        /// Peer address.
        addr: Ipv4Addr,
        /// Control VLAN of the IPL.
        vlan: VlanId,
    },
    /// A peer record was destroyed.
    PeerRemoved {
        /// Local slot of the removed peer.
        peer: PeerIndex,
    },
    /// The local address of an IPL was configured or cleared.
    IplAddrConfigured {
        /// The link.
        ipl: IplId,
        /// New local address; `None` when cleared.
        local: Option<Ipv4Addr>,
    },
    /// An IPL was bound to (or unbound from) a switch port.
    IplPortBound {
        /// The link.
        ipl: IplId,
        /// The carrying port; `None` when unbound.
        port: Option<IfIndex>,
    },
    /// Local VLAN interfaces changed operational state (driver callback).
    VlanLocalStateChanged {
        /// The changed VLANs.
        entries: Vec<VlanStateEntry>,
    },
    /// A port changed operational state (driver callback).
    PortOperStateChanged {
        /// The port's driver handle.
        port_id: PortId,
        /// Whether this port carries an IPL.
        is_ipl: bool,
        /// The new state.
        state: LinkState,
    },
    /// Out-of-band management reachability changed for a chassis.
    MgmtStateChanged {
        /// The chassis the management plane reports on.
        system_id: SystemId,
        /// The new state.
        state: LinkState,
    },
    /// A monitored peer's heartbeat went up or down.
    HeartbeatStateChanged {
        /// Local slot of the peer.
        peer: PeerIndex,
        /// Identity carried in the peer's datagrams.
        system_id: SystemId,
        /// Up after three in-sequence datagrams; down on defect or timeout.
        state: LinkState,
    },
    /// A peer's health FSM entered a new state.
    PeerStateChanged {
        /// Election-assigned id of the peer.
        mlag_id: MlagId,
        /// The state entered.
        state: HealthState,
        /// The state was only announced on the way to another one (the
        /// `COMM_DOWN` flash when communications recover); consumers that
        /// act on losses should skip these.
        passing: bool,
    },
    /// Master election settled on a new role.
    RoleChanged(RoleChange),
    /// This chassis opened its sync phases towards the master.
    SyncStarted {
        /// The master being synced with.
        peer: MlagId,
    },
    /// A subsystem finished syncing a peer.
    SyncDone {
        /// The synced peer.
        peer: MlagId,
        /// The subsystem that converged.
        kind: SyncKind,
    },
    /// Every subsystem synced; the peer is fully active.
    PeerEnabled {
        /// The enabled peer.
        peer: MlagId,
    },
    /// The master asks the FDB collaborator to export its table to a peer.
    FdbExportRequest {
        /// Destination peer.
        peer: MlagId,
    },
    /// An FDB sync payload arrived for the MAC collaborator.
    FdbPayloadReceived {
        /// The sending chassis.
        peer: MlagId,
        /// Opaque collaborator payload.
        payload: Vec<u8>,
    },
    /// A tunneled PDU arrived from the peer.
    TunnelReceived {
        /// The tunneled protocol.
        kind: TunnelKind,
        /// The PDU.
        payload: Vec<u8>,
    },
    /// Verdict on an aggregator selection request.
    AggregatorResponse {
        /// Echo of the caller's request id.
        request_id: u32,
        /// The verdict.
        response: SelectionResponse,
        /// Port the request was for.
        port_id: PortId,
        /// Partner attributes currently holding the aggregator.
        partner_id: SystemId,
        /// Partner key currently holding the aggregator.
        partner_key: u16,
    },
    /// An aggregator lost its last user.
    AggregatorReleased {
        /// Port whose aggregator became free.
        port_id: PortId,
    },
    /// An MLAG port's pair-wide state changed.
    PortGlobalStateChanged {
        /// The port.
        port_id: PortId,
        /// Aggregated state across both chassis.
        state: PortGlobalState,
    },
    /// A port delete was requested; subsystems are being asked to
    /// acknowledge before the record is destroyed.
    PortDeleting {
        /// The port.
        port_id: PortId,
    },
    /// All subsystems acknowledged a port delete; the record is gone.
    PortDeleted {
        /// The port.
        port_id: PortId,
    },
    /// The keepalive interval was reconfigured.
    KeepaliveIntervalChanged(LocalDuration),
    /// The reload-delay was reconfigured.
    ReloadDelayChanged(LocalDuration),
    /// The LACP actor system id visible to partners changed.
    LacpSysIdChanged {
        /// The id now advertised.
        sys_id: SystemId,
    },
}

impl Event {
    /// The queueing class this event is dispatched with.
    pub fn priority(&self) -> Priority {
        match self {
            Self::Stop | Self::Deinit => Priority::High,
            Self::PortOperStateChanged { is_ipl: false, .. } => Priority::Low,
            _ => Priority::Medium,
        }
    }
}
