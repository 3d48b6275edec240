//! Typed daemon handle.
//!
//! [`Handle`] is returned by initialization and is the only way to drive
//! the daemon from outside: every operation of the RPC surface hangs off
//! it, so "called before init" is not expressible. Fire-and-forget
//! operations enqueue and return; queries wait on a reply channel with a
//! bounded timeout.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crossbeam_channel as chan;
use thiserror::Error;

use mlag_common::counters::Counters;
use mlag_common::dump::{DumpSnapshot, HealthDump};
use mlag_common::message::{PortMode, VlanStateEntry};
use mlag_common::peer::{HealthState, MlagId, PeerState, SystemId};
use mlag_common::time::LocalDuration;
use mlag_common::topology::{IfIndex, IplId, VlanId};
use mlag_common::{LinkState, PortId, MAX_PEERS};

use mlag_core::fsm::event::{Event, Subsystem, TunnelKind};
use mlag_core::fsm::{self, Command, Features, PeerStatus};

use crate::bus::QueueSender;
use crate::{HealthItem, HealthQuery, MacItem, ManagerItem};

/// How long a synchronous request may wait for its reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle-level error.
#[derive(Error, Debug)]
pub enum Error {
    /// The machine rejected the request.
    #[error(transparent)]
    Fsm(#[from] fsm::Error),
    /// No reply arrived in time.
    #[error("request timed out")]
    Timeout,
    /// Writing a dump failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One row of the peer state listing.
#[derive(Debug, Clone)]
pub struct PeerListEntry {
    /// Local slot index.
    pub index: usize,
    /// Peer address.
    pub addr: Ipv4Addr,
    /// Election-assigned id, if decided.
    pub mlag_id: Option<MlagId>,
    /// Health FSM state.
    pub health: HealthState,
    /// Sync pipeline state.
    pub sync_state: PeerState,
    /// Learned chassis identity.
    pub system_id: Option<SystemId>,
}

/// The daemon handle.
#[derive(Clone)]
pub struct Handle {
    manager: QueueSender<ManagerItem>,
    health: QueueSender<HealthItem>,
    mac: QueueSender<MacItem>,
}

impl Handle {
    pub(crate) fn new(
        manager: QueueSender<ManagerItem>,
        health: QueueSender<HealthItem>,
        mac: QueueSender<MacItem>,
    ) -> Self {
        Self {
            manager,
            health,
            mac,
        }
    }

    fn command(&self, command: Command) {
        self.manager.send(ManagerItem::Command(command));
    }

    fn publish(&self, event: Event) {
        self.health.send(HealthItem::Event(event.clone()));
        self.manager.send(ManagerItem::Event(event.clone()));
        self.mac.send(MacItem::Event(event));
    }

    fn wait<T>(&self, rx: chan::Receiver<T>) -> Result<T, Error> {
        rx.recv_timeout(REPLY_TIMEOUT).map_err(|_| Error::Timeout)
    }

    fn request<T>(
        &self,
        rx: chan::Receiver<Result<T, fsm::Error>>,
    ) -> Result<T, Error> {
        Ok(self.wait(rx)??)
    }

    /// Begin protocol activity.
    pub fn start(&self, system_id: SystemId, features: Features) {
        self.command(Command::Start {
            system_id,
            features,
        });
    }

    /// Quiesce the daemon.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Terminate all dispatchers. The handle is useless afterwards.
    pub fn shutdown(&self) {
        self.manager.send(ManagerItem::Shutdown);
        self.health.send(HealthItem::Shutdown);
        self.mac.send(MacItem::Shutdown);
    }

    /// Create an IPL record.
    pub fn ipl_create(&self) -> Result<IplId, Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::IplCreate(tx));
        self.request(rx)
    }

    /// Delete an IPL record.
    pub fn ipl_delete(&self, ipl: IplId) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::IplDelete(ipl, tx));
        self.request(rx)
    }

    /// Bind or unbind the port carrying an IPL.
    pub fn ipl_port_set(&self, ipl: IplId, port: Option<IfIndex>) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::IplPortSet(ipl, port, tx));
        self.request(rx)
    }

    /// Configure IPL addressing.
    pub fn ipl_ip_set(
        &self,
        ipl: IplId,
        vlan: Option<VlanId>,
        local: Option<Ipv4Addr>,
        peer: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::IplIpSet {
            ipl,
            vlan,
            local,
            peer,
            reply: tx,
        });
        self.request(rx)
    }

    /// Add an MLAG port.
    pub fn port_add(&self, port_id: PortId) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::PortAdd(port_id, tx));
        self.request(rx)
    }

    /// Delete an MLAG port.
    pub fn port_delete(&self, port_id: PortId) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::PortDelete(port_id, tx));
        self.request(rx)
    }

    /// Set an MLAG port's aggregation mode.
    pub fn port_mode_set(&self, port_id: PortId, mode: PortMode) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::PortModeSet(port_id, mode, tx));
        self.request(rx)
    }

    /// Reconfigure the keepalive interval.
    pub fn keepalive_set(&self, interval: LocalDuration) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::KeepaliveSet(interval, tx));
        self.request(rx)
    }

    /// Reconfigure the reload-delay.
    pub fn reload_delay_set(&self, delay: LocalDuration) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::ReloadDelaySet(delay, tx));
        self.request(rx)
    }

    /// Force or clear the local health defect flag.
    pub fn set_local_health(&self, defect: bool) {
        self.health.send(HealthItem::Query(HealthQuery::SetLocalDefect(defect)));
    }

    /// List configured peers with their health and sync states.
    pub fn peers_state_list_get(&self) -> Result<Vec<PeerListEntry>, Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::PeersStateGet(tx));
        let statuses: Vec<PeerStatus> = self.wait(rx)?;

        let (tx, rx) = chan::bounded(1);
        self.health
            .send(HealthItem::Query(HealthQuery::PeerStates(tx)));
        let health: [HealthState; MAX_PEERS] = self.wait(rx)?;

        Ok(statuses
            .into_iter()
            .map(|status| PeerListEntry {
                health: health
                    .get(status.index)
                    .copied()
                    .unwrap_or(HealthState::NotExist),
                index: status.index,
                addr: status.addr,
                mlag_id: status.mlag_id,
                sync_state: status.sync_state,
                system_id: status.system_id,
            })
            .collect())
    }

    /// Daemon-wide counters: the manager's message classes plus the
    /// health subsystem's heartbeat datagrams.
    pub fn counters_get(&self) -> Result<Counters, Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::CountersGet(tx));
        let mut counters: Counters = self.wait(rx)?;

        let (tx, rx) = chan::bounded(1);
        self.health.send(HealthItem::Query(HealthQuery::Dump(tx)));
        let health: HealthDump = self.wait(rx)?;

        for peer in &health.peers {
            counters.rx_heartbeat += peer.rx_heartbeat;
            counters.tx_heartbeat += peer.tx_heartbeat;
        }
        Ok(counters)
    }

    /// Clear all counters.
    pub fn counters_clear(&self) {
        self.command(Command::CountersClear);
        self.health
            .send(HealthItem::Query(HealthQuery::ClearStats));
    }

    /// Configure the local LACP actor system id.
    pub fn lacp_local_sys_id_set(&self, sys_id: SystemId) {
        self.command(Command::LacpSysIdSet(sys_id));
    }

    /// The LACP actor system id currently advertised to partners.
    pub fn lacp_actor_parameters_get(&self) -> Result<SystemId, Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::LacpActorParamsGet(tx));
        self.wait(rx)
    }

    /// Ask for an aggregator; the verdict arrives as a notification.
    pub fn lacp_selection_request(
        &self,
        request_id: u32,
        port_id: PortId,
        partner_id: SystemId,
        partner_key: u16,
        force: bool,
    ) {
        self.command(Command::LacpSelectionRequest {
            request_id,
            port_id,
            partner_id,
            partner_key,
            force,
        });
    }

    /// Release an aggregator.
    pub fn lacp_selection_release(&self, request_id: u32, port_id: PortId) {
        self.command(Command::LacpSelectionRelease {
            request_id,
            port_id,
        });
    }

    /// Driver callback: a switch port changed operational state.
    pub fn port_oper_state_changed(&self, port_id: PortId, is_ipl: bool, state: LinkState) {
        self.publish(Event::PortOperStateChanged {
            port_id,
            is_ipl,
            state,
        });
    }

    /// Management-plane callback: a chassis' out-of-band reachability
    /// changed.
    pub fn mgmt_state_changed(&self, system_id: SystemId, state: LinkState) {
        self.publish(Event::MgmtStateChanged { system_id, state });
    }

    /// Driver callback: local VLAN interfaces changed operational state.
    pub fn vlan_local_state_changed(&self, entries: Vec<VlanStateEntry>) {
        self.publish(Event::VlanLocalStateChanged { entries });
    }

    /// Ship an FDB payload to a peer, on behalf of the MAC collaborator.
    pub fn fdb_export(&self, peer: MlagId, payload: Vec<u8>) {
        self.command(Command::FdbExport(peer, payload));
    }

    /// The MAC collaborator finished exporting to a syncing peer.
    pub fn fdb_sync_done(&self, peer: MlagId) {
        self.command(Command::FdbSyncDone(peer));
    }

    /// Acknowledge a pending port delete on behalf of a subsystem.
    pub fn port_delete_ack(&self, port_id: PortId, subsystem: Subsystem) {
        self.command(Command::PortDeleteAck(port_id, subsystem));
    }

    /// Relay a tunneled PDU to the peer chassis.
    pub fn tunnel(&self, kind: TunnelKind, payload: Vec<u8>) {
        self.command(Command::Tunnel(kind, payload));
    }

    /// Write a JSON snapshot of the whole daemon to `path`.
    pub fn dump(&self, path: &Path) -> Result<(), Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::Dump(tx));
        let manager = self.wait(rx)?;

        let (tx, rx) = chan::bounded(1);
        self.health.send(HealthItem::Query(HealthQuery::Dump(tx)));
        let health = self.wait(rx)?;

        let snapshot = DumpSnapshot { health, manager };
        std::fs::write(path, microserde::json::to_string(&snapshot))?;
        Ok(())
    }
}
