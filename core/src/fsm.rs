//! MLAG protocol state machine.
//!
//! [`StateMachine`] is the mlag-manager subsystem: configuration, master
//! election, sync orchestration, LACP arbitration, L3 VLAN aggregation and
//! port management, composed from sub-managers that each queue their own
//! [`Io`] output. The health subsystem is a machine of its own,
//! [`healthmgr::HealthManager`], hosted by a separate dispatcher; the two
//! talk only through bus [`Event`]s.

use crossbeam_channel as chan;
use log::*;

pub mod electmgr;
pub mod event;
pub mod healthmgr;
pub mod heartbeat;
pub mod l3mgr;
pub mod lacpmgr;
pub mod output;
pub mod portmgr;
pub mod syncmgr;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::Ipv4Addr;

use mlag_common::counters::Counters;
use mlag_common::dump::{IplDump, LacpDump, ManagerDump, PeerDump, PortDump};
use mlag_common::message::{Message, PortMode, SyncKind};
use mlag_common::peer::{HealthState, MlagId, PeerDb, PeerState, Role, SystemId};
use mlag_common::time::{Clock, LocalDuration};
use mlag_common::topology::{IfIndex, IplId, TopologyDb, VlanId};
use mlag_common::{PortId, KEEPALIVE_INTERVAL_MAX, KEEPALIVE_INTERVAL_MIN, RELOAD_DELAY_MAX};

use electmgr::ElectionManager;
use event::{Event, Subsystem, TunnelKind};
use l3mgr::L3Manager;
use lacpmgr::LacpManager;
use output::Outbox;
use portmgr::PortManager;
use syncmgr::SyncManager;

use thiserror::Error;

pub use healthmgr::HealthManager;
pub use output::Io;

/// Reason the peer channel is being torn down.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer is no longer healthy.
    PeerDown,
    /// Election moved the channel endpoints around.
    RoleChange,
    /// The daemon is stopping.
    Stop,
    /// A subsystem sync stalled.
    SyncTimeout(SyncKind),
    /// The peer sent something unintelligible, repeatedly.
    Protocol(&'static str),
    /// Torn down by external command.
    Command,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDown => write!(f, "peer down"),
            Self::RoleChange => write!(f, "role change"),
            Self::Stop => write!(f, "stopping"),
            Self::SyncTimeout(kind) => write!(f, "{} sync timed out", kind),
            Self::Protocol(err) => write!(f, "protocol error: {}", err),
            Self::Command => write!(f, "external command"),
        }
    }
}

/// A command-level error, mapped to an errno-style code at the RPC
/// boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The daemon has not been started.
    #[error("not started")]
    NotStarted,
    /// An argument was out of bounds.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The referenced object does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A table is full.
    #[error("no space left for {0}")]
    NoSpace(&'static str),
    /// Peer database failure.
    #[error(transparent)]
    Peer(#[from] mlag_common::peer::Error),
    /// Topology database failure.
    #[error(transparent)]
    Topology(#[from] mlag_common::topology::Error),
}

/// Protocol features enabled at start.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Features {
    /// Tunnel spanning-tree PDUs between the chassis.
    pub stp: bool,
    /// Arbitrate LACP aggregator selection.
    pub lacp: bool,
    /// Tunnel IGMP PDUs between the chassis.
    pub igmp: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            stp: false,
            lacp: true,
            igmp: false,
        }
    }
}

/// Status of one configured peer, as returned by state queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Local slot index.
    pub index: usize,
    /// Peer address.
    pub addr: Ipv4Addr,
    /// Election-assigned id, if decided.
    pub mlag_id: Option<MlagId>,
    /// Sync pipeline state.
    pub sync_state: PeerState,
    /// Learned chassis identity.
    pub system_id: Option<SystemId>,
}

/// A command or request that can be sent to the protocol.
pub enum Command {
    /// Begin protocol activity.
    Start {
        /// Local chassis identity.
        system_id: SystemId,
        /// Enabled features.
        features: Features,
    },
    /// Quiesce all subsystems.
    Stop,
    /// Create an IPL record.
    IplCreate(chan::Sender<Result<IplId, Error>>),
    /// Delete an IPL record.
    IplDelete(IplId, chan::Sender<Result<(), Error>>),
    /// Bind or unbind the port carrying an IPL.
    IplPortSet(IplId, Option<IfIndex>, chan::Sender<Result<(), Error>>),
    /// Configure IPL addressing; setting a new peer address retires the
    /// previous peer.
    IplIpSet {
        /// The link.
        ipl: IplId,
        /// Control VLAN.
        vlan: Option<VlanId>,
        /// Local address, `None` clears.
        local: Option<Ipv4Addr>,
        /// Peer address, `None` clears.
        peer: Option<Ipv4Addr>,
        /// Completion reply.
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Add an MLAG port.
    PortAdd(PortId, chan::Sender<Result<(), Error>>),
    /// Delete an MLAG port (two-phase).
    PortDelete(PortId, chan::Sender<Result<(), Error>>),
    /// Set an MLAG port's aggregation mode.
    PortModeSet(PortId, PortMode, chan::Sender<Result<(), Error>>),
    /// A subsystem acknowledged a pending port delete.
    PortDeleteAck(PortId, Subsystem),
    /// Reconfigure the keepalive interval.
    KeepaliveSet(LocalDuration, chan::Sender<Result<(), Error>>),
    /// Reconfigure the reload-delay.
    ReloadDelaySet(LocalDuration, chan::Sender<Result<(), Error>>),
    /// Configure the local LACP actor system id.
    LacpSysIdSet(SystemId),
    /// Query the advertised LACP actor system id.
    LacpActorParamsGet(chan::Sender<SystemId>),
    /// Ask for an aggregator.
    LacpSelectionRequest {
        /// Caller-chosen id echoed in the response event.
        request_id: u32,
        /// Port the partner is attached to.
        port_id: PortId,
        /// LACP partner system id.
        partner_id: SystemId,
        /// LACP partner key.
        partner_key: u16,
        /// Evict a mismatched holder.
        force: bool,
    },
    /// Release an aggregator.
    LacpSelectionRelease {
        /// Caller-chosen id.
        request_id: u32,
        /// The port.
        port_id: PortId,
    },
    /// Ship an FDB payload from the MAC collaborator to a peer.
    FdbExport(MlagId, Vec<u8>),
    /// The MAC collaborator finished exporting to a syncing peer.
    FdbSyncDone(MlagId),
    /// Relay a tunneled PDU to the peer.
    Tunnel(TunnelKind, Vec<u8>),
    /// Query configured peers.
    PeersStateGet(chan::Sender<Vec<PeerStatus>>),
    /// Query message counters.
    CountersGet(chan::Sender<Counters>),
    /// Clear message counters.
    CountersClear,
    /// Query the full manager snapshot.
    Dump(chan::Sender<ManagerDump>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { system_id, .. } => write!(f, "Start({:#x})", system_id),
            Self::Stop => write!(f, "Stop"),
            Self::IplCreate(_) => write!(f, "IplCreate"),
            Self::IplDelete(ipl, _) => write!(f, "IplDelete({})", ipl),
            Self::IplPortSet(ipl, port, _) => write!(f, "IplPortSet({}, {:?})", ipl, port),
            Self::IplIpSet {
                ipl, local, peer, ..
            } => write!(f, "IplIpSet({}, {:?}, {:?})", ipl, local, peer),
            Self::PortAdd(port, _) => write!(f, "PortAdd({})", port),
            Self::PortDelete(port, _) => write!(f, "PortDelete({})", port),
            Self::PortModeSet(port, mode, _) => {
                write!(f, "PortModeSet({}, {})", port, mode.as_str())
            }
            Self::PortDeleteAck(port, subsystem) => {
                write!(f, "PortDeleteAck({}, {})", port, subsystem)
            }
            Self::KeepaliveSet(interval, _) => write!(f, "KeepaliveSet({})", interval),
            Self::ReloadDelaySet(delay, _) => write!(f, "ReloadDelaySet({})", delay),
            Self::LacpSysIdSet(sys_id) => write!(f, "LacpSysIdSet({:#x})", sys_id),
            Self::LacpActorParamsGet(_) => write!(f, "LacpActorParamsGet"),
            Self::LacpSelectionRequest {
                request_id,
                port_id,
                ..
            } => write!(f, "LacpSelectionRequest({}, port {})", request_id, port_id),
            Self::LacpSelectionRelease {
                request_id,
                port_id,
            } => write!(f, "LacpSelectionRelease({}, port {})", request_id, port_id),
            Self::FdbExport(peer, payload) => {
                write!(f, "FdbExport({}, {} bytes)", peer, payload.len())
            }
            Self::FdbSyncDone(peer) => write!(f, "FdbSyncDone({})", peer),
            Self::Tunnel(kind, payload) => write!(f, "Tunnel({:?}, {} bytes)", kind, payload.len()),
            Self::PeersStateGet(_) => write!(f, "PeersStateGet"),
            Self::CountersGet(_) => write!(f, "CountersGet"),
            Self::CountersClear => write!(f, "CountersClear"),
            Self::Dump(_) => write!(f, "Dump"),
        }
    }
}

/// The mlag-manager subsystem machine.
#[derive(Debug)]
pub struct StateMachine<C> {
    outbox: Outbox,
    peers: PeerDb,
    topology: TopologyDb,
    electmgr: ElectionManager,
    syncmgr: SyncManager<C>,
    lacpmgr: LacpManager,
    l3mgr: L3Manager,
    portmgr: PortManager<C>,
    counters: Counters,
    features: Features,
    started: bool,
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        let next = self
            .outbox
            .next()
            .or_else(|| self.electmgr.next())
            .or_else(|| self.syncmgr.next())
            .or_else(|| self.lacpmgr.next())
            .or_else(|| self.l3mgr.next())
            .or_else(|| self.portmgr.next());

        match next {
            Some(Io::Event(e)) => {
                self.event(&e);
                Some(Io::Event(e))
            }
            Some(Io::Write(peer, message)) => {
                self.counters.record_tx(message.class());
                Some(Io::Write(peer, message))
            }
            other => other,
        }
    }
}

impl<C: Clock + Clone> StateMachine<C> {
    /// Construct a new protocol instance.
    pub fn new(clock: C) -> Self {
        Self {
            outbox: Outbox::default(),
            peers: PeerDb::new(),
            topology: TopologyDb::new(),
            electmgr: ElectionManager::new(),
            syncmgr: SyncManager::new(clock.clone()),
            lacpmgr: LacpManager::new(),
            l3mgr: L3Manager::new(),
            portmgr: PortManager::new(clock),
            counters: Counters::new(),
            features: Features::default(),
            started: false,
        }
    }
}

impl<C: Clock> StateMachine<C> {
    /// Whether the daemon is started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The elected role.
    pub fn role(&self) -> Role {
        self.electmgr.role()
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        trace!(target: "mlag", "Received command: {:?}", cmd);

        match cmd {
            Command::Start {
                system_id,
                features,
            } => self.start(system_id, features),
            Command::Stop => self.stop(),
            Command::IplCreate(reply) => {
                let result = self.topology.create().map_err(Error::from);
                reply.send(result).ok();
            }
            Command::IplDelete(ipl, reply) => {
                let result = self.ipl_delete(ipl);
                reply.send(result).ok();
            }
            Command::IplPortSet(ipl, port, reply) => {
                let result = self.ipl_port_set(ipl, port);
                reply.send(result).ok();
            }
            Command::IplIpSet {
                ipl,
                vlan,
                local,
                peer,
                reply,
            } => {
                let result = self.ipl_ip_set(ipl, vlan, local, peer);
                reply.send(result).ok();
            }
            Command::PortAdd(port_id, reply) => {
                let result = if self.portmgr.port_add(port_id) {
                    Ok(())
                } else {
                    Err(Error::Invalid("port already configured"))
                };
                reply.send(result).ok();
            }
            Command::PortDelete(port_id, reply) => {
                let result = if self.portmgr.port_delete(port_id) {
                    Ok(())
                } else {
                    Err(Error::NotFound("port"))
                };
                reply.send(result).ok();
            }
            Command::PortModeSet(port_id, mode, reply) => {
                let result = if self.portmgr.port_mode_set(port_id, mode) {
                    Ok(())
                } else {
                    Err(Error::NotFound("port"))
                };
                reply.send(result).ok();
            }
            Command::PortDeleteAck(port_id, subsystem) => {
                self.portmgr.port_delete_ack(port_id, subsystem);
            }
            Command::KeepaliveSet(interval, reply) => {
                let secs = interval.as_secs();
                let result = if (KEEPALIVE_INTERVAL_MIN..=KEEPALIVE_INTERVAL_MAX).contains(&secs) {
                    self.outbox.event(Event::KeepaliveIntervalChanged(interval));
                    Ok(())
                } else {
                    Err(Error::Invalid("keepalive interval"))
                };
                reply.send(result).ok();
            }
            Command::ReloadDelaySet(delay, reply) => {
                let result = if delay.as_secs() <= RELOAD_DELAY_MAX {
                    self.portmgr.reload_delay_set(delay);
                    self.outbox.event(Event::ReloadDelayChanged(delay));
                    Ok(())
                } else {
                    Err(Error::Invalid("reload delay"))
                };
                reply.send(result).ok();
            }
            Command::LacpSysIdSet(sys_id) => self.lacpmgr.sys_id_set(sys_id),
            Command::LacpActorParamsGet(reply) => {
                reply.send(self.lacpmgr.actor_sys_id()).ok();
            }
            Command::LacpSelectionRequest {
                request_id,
                port_id,
                partner_id,
                partner_key,
                force,
            } => {
                self.lacpmgr
                    .selection_request(request_id, port_id, partner_id, partner_key, force);
            }
            Command::LacpSelectionRelease {
                request_id,
                port_id,
            } => self.lacpmgr.selection_release(request_id, port_id),
            Command::FdbExport(peer, payload) => {
                self.outbox.write(peer, Message::FdbSync(payload));
            }
            Command::FdbSyncDone(peer) => self.syncmgr.fdb_export_done(peer),
            Command::Tunnel(kind, payload) => {
                let enabled = match kind {
                    TunnelKind::Igmp => self.features.igmp,
                    TunnelKind::Xstp => self.features.stp,
                };
                if !enabled {
                    return;
                }
                if let Some(remote) = self.electmgr.remote_id() {
                    let message = match kind {
                        TunnelKind::Igmp => Message::IgmpTunnel(payload),
                        TunnelKind::Xstp => Message::XstpTunnel(payload),
                    };
                    self.outbox.write(remote, message);
                }
            }
            Command::PeersStateGet(reply) => {
                reply.send(self.peer_statuses()).ok();
            }
            Command::CountersGet(reply) => {
                reply.send(self.counters.clone()).ok();
            }
            Command::CountersClear => self.counters.clear(),
            Command::Dump(reply) => {
                reply.send(self.dump()).ok();
            }
        }
    }

    fn start(&mut self, system_id: SystemId, features: Features) {
        if self.started {
            return;
        }
        info!(target: "mlag", "Starting, system id {:#x}", system_id);

        self.started = true;
        self.features = features;
        self.portmgr.start();
        self.l3mgr.start();
        self.lacpmgr.start(features.lacp);
        self.electmgr.start();
        self.outbox.event(Event::Started { system_id });
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!(target: "mlag", "Stopping");

        self.started = false;
        self.outbox.event(Event::Stop);
        self.electmgr.stop();
        self.syncmgr.stop();
        self.lacpmgr.stop();
        self.l3mgr.stop();
        self.portmgr.stop();
        self.outbox.event(Event::StopDone {
            subsystem: Subsystem::Manager,
        });
    }

    fn ipl_delete(&mut self, ipl: IplId) -> Result<(), Error> {
        let previous = self.topology.get(ipl).and_then(|record| record.peer_addr);
        if let Some(addr) = previous {
            self.retire_peer(&addr);
        }
        self.topology.delete(ipl)?;
        self.outbox.event(Event::IplPortBound { ipl, port: None });
        Ok(())
    }

    fn ipl_port_set(&mut self, ipl: IplId, port: Option<IfIndex>) -> Result<(), Error> {
        self.topology.bind_port(ipl, port)?;
        let vlan = self.topology.get(ipl).and_then(|i| i.vlan);
        self.l3mgr.set_ipl(port, vlan);
        self.outbox.event(Event::IplPortBound { ipl, port });
        Ok(())
    }

    fn ipl_ip_set(
        &mut self,
        ipl: IplId,
        vlan: Option<VlanId>,
        local: Option<Ipv4Addr>,
        peer: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        if peer.is_some() && vlan.is_none() {
            return Err(Error::Invalid("peer address requires a control VLAN"));
        }

        // Replacing the peer address retires the previous peer record.
        let previous = self.topology.set_addrs(ipl, vlan, local, peer)?;
        if let Some(previous) = previous {
            self.retire_peer(&previous);
        }

        if let Some(addr) = peer {
            if self.peers.by_addr(&addr).is_none() {
                let index = self.peers.add(ipl, addr)?;
                let vlan = vlan.expect("checked above");
                self.outbox.event(Event::PeerAdded {
                    peer: index,
                    ipl,
                    addr,
                    vlan,
                });
                self.l3mgr.peer_add();
            }
        }

        let port = self.topology.get(ipl).and_then(|i| i.port);
        self.l3mgr.set_ipl(port, vlan);
        self.electmgr.set_local_addr(local);
        self.electmgr.set_peer_addr(peer);
        self.outbox.event(Event::IplAddrConfigured { ipl, local });

        Ok(())
    }

    fn retire_peer(&mut self, addr: &Ipv4Addr) {
        let Some(index) = self.peers.by_addr(addr).map(|p| p.index) else {
            return;
        };
        info!(target: "mlag", "Retiring peer {} ({})", index, addr);

        self.peers.remove(index).ok();
        self.l3mgr.peer_del();
        self.electmgr.set_peer_addr(None);
        self.outbox.event(Event::PeerRemoved { peer: index });
    }

    /// A control message arrived over the peer channel.
    pub fn message_received(&mut self, from: MlagId, message: Message) {
        self.counters.record_rx(message.class());

        match message {
            Message::SyncStart { kind, peer_id } => {
                self.syncmgr.phase_opened(peer_id, kind);
                self.l3mgr.peer_tx_enabled(peer_id);
                self.ship_snapshot(peer_id, kind);
            }
            Message::SyncFinish { kind, peer_id } => {
                self.syncmgr.phase_done(peer_id, kind);
            }
            Message::MasterSyncDone { kind } => {
                let my_id = self.electmgr.my_id();
                self.outbox.write(
                    from,
                    Message::SyncFinish {
                        kind,
                        peer_id: my_id,
                    },
                );
                self.syncmgr.phase_done(from, kind);
            }
            Message::VlanLocalState { peer_id, entries } => {
                self.l3mgr.local_state_change(peer_id, &entries);
            }
            Message::VlanGlobalState { entries, .. } => {
                self.l3mgr.apply_global(&entries);
            }
            Message::LacpSelection(selection) => self.lacpmgr.handle_selection(selection),
            Message::LacpRelease { port_id } => self.lacpmgr.handle_release(port_id),
            Message::LacpSync {
                master_sys_id,
                entries,
            } => self.lacpmgr.apply_sync(master_sys_id, entries),
            Message::LacpSysIdUpdate { sys_id } => self.lacpmgr.handle_sys_id_update(sys_id),
            Message::PortOperState { port_id, state, .. } => {
                self.portmgr.remote_oper_change(port_id, state);
            }
            Message::PortSync { ports, .. } => self.portmgr.apply_sync(ports),
            Message::IgmpTunnel(payload) => self.outbox.event(Event::TunnelReceived {
                kind: TunnelKind::Igmp,
                payload,
            }),
            Message::XstpTunnel(payload) => self.outbox.event(Event::TunnelReceived {
                kind: TunnelKind::Xstp,
                payload,
            }),
            Message::FdbSync(payload) => self.outbox.event(Event::FdbPayloadReceived {
                peer: from,
                payload,
            }),
        }
    }

    /// Master: answer a sync phase with the local snapshot and its
    /// completion marker.
    fn ship_snapshot(&mut self, peer: MlagId, kind: SyncKind) {
        match kind {
            SyncKind::Ports => {
                let snapshot = self.portmgr.sync_snapshot();
                self.outbox.write(peer, snapshot);
                self.outbox.write(peer, Message::MasterSyncDone { kind });
            }
            SyncKind::L3 => {
                if let Some(snapshot) = self.l3mgr.master_snapshot() {
                    self.outbox.write(peer, snapshot);
                }
                self.outbox.write(peer, Message::MasterSyncDone { kind });
            }
            SyncKind::Lacp => {
                let snapshot = self.lacpmgr.sync_snapshot();
                self.outbox.write(peer, snapshot);
                self.outbox.write(peer, Message::MasterSyncDone { kind });
            }
            SyncKind::Mac => {
                // Completion follows the collaborator's export.
                self.syncmgr.fdb_export_requested(peer);
            }
        }
    }

    /// The peer channel came up.
    pub fn peer_connected(&mut self) {
        debug!(target: "mlag", "Peer channel connected");
        self.syncmgr.channel_changed(true);
    }

    /// The peer channel went down.
    pub fn peer_disconnected(&mut self, reason: DisconnectReason) {
        debug!(target: "mlag", "Peer channel disconnected: {}", reason);
        self.syncmgr.channel_changed(false);
    }

    /// A requested wake-up fired.
    pub fn timer_expired(&mut self) {
        self.syncmgr.timer_expired();
        self.portmgr.timer_expired();
    }

    /// React to a bus event published by another subsystem.
    pub fn received_event(&mut self, event: &Event) {
        match event {
            Event::HeartbeatStateChanged {
                peer,
                system_id,
                state,
            } => {
                if let Some(record) = self.peers.get_mut(*peer) {
                    record.system_id = Some(*system_id);
                }
                self.electmgr.set_peer_reachable(state.is_up());
            }
            Event::PeerStateChanged {
                mlag_id,
                state,
                passing,
            } => match state {
                _ if *passing => {}
                HealthState::Up => self.syncmgr.peer_health_changed(*mlag_id, true),
                HealthState::Down | HealthState::CommDown => {
                    self.syncmgr.peer_health_changed(*mlag_id, false);
                    self.lacpmgr.peer_down(*mlag_id);
                    self.l3mgr.peer_down(*mlag_id);
                    self.portmgr.peer_down();
                    self.outbox.hang_up(DisconnectReason::PeerDown);
                }
                // The settle period is not yet a loss.
                HealthState::DownWait | HealthState::NotExist => {}
            },
            Event::PortOperStateChanged {
                port_id,
                is_ipl,
                state,
            } => {
                if *is_ipl {
                    let ipl = self
                        .topology
                        .iter()
                        .find(|(_, record)| record.port == Some(*port_id as IfIndex))
                        .map(|(id, _)| id);
                    if let Some(ipl) = ipl {
                        self.topology.set_oper_state(ipl, *state).ok();
                    }
                } else {
                    self.portmgr.local_oper_change(*port_id, *state);
                }
            }
            Event::VlanLocalStateChanged { entries } => {
                self.l3mgr.local_vlan_change(entries.clone());
            }
            _ => {}
        }
    }

    /// Propagate an event internally to the sub-managers. Runs as events
    /// are drained, so a sub-manager's reaction lands in the same drain.
    fn event(&mut self, event: &Event) {
        match event {
            Event::RoleChanged(change) => {
                let my_id = change.my_peer_id;
                let remote = match change.current {
                    Role::Standalone => None,
                    Role::Master => Some(MlagId::SLAVE),
                    Role::Slave => Some(MlagId::MASTER),
                };
                // A lapse to standalone keeps the last known ids.
                if remote.is_some() {
                    let indices: Vec<_> = self.peers.iter().map(|p| p.index).collect();
                    for index in indices {
                        if let Some(peer) = self.peers.get_mut(index) {
                            peer.mlag_id = remote;
                        }
                    }
                }
                self.syncmgr.role_changed(change.current, my_id);
                self.lacpmgr.role_changed(change.current, my_id);
                self.l3mgr.role_changed(change.current, my_id);
                self.portmgr.role_changed(remote, my_id);
            }
            Event::SyncStarted { peer } => {
                // Follow the opens with this side's own state.
                let snapshot = self.portmgr.sync_snapshot();
                self.outbox.write(*peer, snapshot);
                if let Some(snapshot) = self.l3mgr.local_snapshot() {
                    self.outbox.write(*peer, snapshot);
                }
                let snapshot = self.lacpmgr.local_snapshot();
                self.outbox.write(*peer, snapshot);
            }
            Event::PeerEnabled { peer } => {
                self.l3mgr.peer_enabled(*peer);
            }
            _ => {}
        }
    }

    fn peer_statuses(&self) -> Vec<PeerStatus> {
        let mut statuses = Vec::new();
        for record in self.peers.iter() {
            statuses.push(PeerStatus {
                index: record.index,
                addr: record.addr,
                mlag_id: record.mlag_id,
                sync_state: record
                    .mlag_id
                    .map(|id| self.syncmgr.peer_state(id))
                    .unwrap_or(PeerState::Down),
                system_id: record.system_id,
            });
        }
        statuses
    }

    fn dump(&self) -> ManagerDump {
        let status = self.electmgr.status();

        ManagerDump {
            role: self.electmgr.role().as_str().to_owned(),
            my_addr: status
                .my_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            peer_addr: status
                .peer_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            peers: self
                .peer_statuses()
                .into_iter()
                .map(|status| PeerDump {
                    index: status.index as u32,
                    addr: status.addr.to_string(),
                    mlag_id: status.mlag_id.map(|id| id.0 as i32).unwrap_or(-1),
                    sync_state: status.sync_state.as_str().to_owned(),
                    system_id: status.system_id.unwrap_or(0),
                })
                .collect(),
            ipls: self
                .topology
                .iter()
                .map(|(id, record)| IplDump {
                    id: id as u32,
                    port: record.port.map(|p| p as i64).unwrap_or(-1),
                    local_addr: record
                        .local_addr
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                    peer_addr: record
                        .peer_addr
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                    vlan: record.vlan.map(|v| v.as_u16()).unwrap_or(0),
                    oper_state: record.oper_state.as_str().to_owned(),
                })
                .collect(),
            ports: self
                .portmgr
                .iter()
                .map(|(port_id, mode, local, global)| PortDump {
                    port_id,
                    mode: mode.as_str().to_owned(),
                    local_oper: local.as_str().to_owned(),
                    global: global.as_str().to_owned(),
                })
                .collect(),
            lacp: self
                .lacpmgr
                .entries()
                .map(|(port_id, entry)| LacpDump {
                    port_id: *port_id,
                    partner_id: entry.partner_id,
                    partner_key: entry.partner_key,
                    peer_uses: entry.peer_uses,
                })
                .collect(),
            ipl_vlans: self.l3mgr.membership().collect(),
            vlans_global_up: self.l3mgr.global_up_count() as u64,
            counters: self.counters.clone(),
        }
    }
}

#[cfg(test)]
mod fsm_tests {
    use super::*;
    use mlag_common::time::{LocalTime, RefClock};

    #[test]
    fn test_keepalive_bounds() {
        let mut machine = StateMachine::new(RefClock::new(LocalTime::from_secs(1)));
        let (tx, rx) = chan::unbounded();

        for (secs, ok) in [(0, false), (1, true), (30, true), (31, false)] {
            machine.command(Command::KeepaliveSet(
                LocalDuration::from_secs(secs),
                tx.clone(),
            ));
            assert_eq!(rx.recv().unwrap().is_ok(), ok, "keepalive {}s", secs);
        }
    }

    #[test]
    fn test_reload_delay_bounds() {
        let mut machine = StateMachine::new(RefClock::new(LocalTime::from_secs(1)));
        let (tx, rx) = chan::unbounded();

        for (secs, ok) in [(0, true), (300, true), (301, false)] {
            machine.command(Command::ReloadDelaySet(
                LocalDuration::from_secs(secs),
                tx.clone(),
            ));
            assert_eq!(rx.recv().unwrap().is_ok(), ok, "reload delay {}s", secs);
        }
    }

    #[test]
    fn test_peer_ip_replacement_retires_previous_peer() {
        let mut machine = StateMachine::new(RefClock::new(LocalTime::from_secs(1)));
        let (tx, rx) = chan::unbounded();
        machine.command(Command::IplCreate(tx));
        let ipl = rx.recv().unwrap().unwrap();

        let (tx, rx) = chan::unbounded();
        let vlan = Some(VlanId::new(100).unwrap());
        machine.command(Command::IplIpSet {
            ipl,
            vlan,
            local: Some(Ipv4Addr::new(10, 0, 0, 1)),
            peer: Some(Ipv4Addr::new(10, 0, 0, 2)),
            reply: tx.clone(),
        });
        rx.recv().unwrap().unwrap();

        machine.command(Command::IplIpSet {
            ipl,
            vlan,
            local: Some(Ipv4Addr::new(10, 0, 0, 1)),
            peer: Some(Ipv4Addr::new(10, 0, 0, 3)),
            reply: tx,
        });
        rx.recv().unwrap().unwrap();

        let events: Vec<Event> = (&mut machine)
            .filter_map(|io| match io {
                Io::Event(e) => Some(e),
                _ => None,
            })
            .collect();

        assert!(events.contains(&Event::PeerRemoved { peer: 0 }));
        let adds = events
            .iter()
            .filter(|e| matches!(e, Event::PeerAdded { .. }))
            .count();
        assert_eq!(adds, 2);
    }
}
