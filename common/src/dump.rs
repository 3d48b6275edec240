//! State snapshots for the `dump` RPC.
//!
//! Everything here is plain strings and numbers so the whole tree
//! serializes to JSON directly.

use microserde::Serialize;

use crate::counters::Counters;

/// One peer's view in the health subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct HealthPeerDump {
    /// Local slot index.
    pub index: u32,
    /// Health FSM state.
    pub state: String,
    /// Heartbeat datagrams received.
    pub rx_heartbeat: u64,
    /// Heartbeat datagrams sent.
    pub tx_heartbeat: u64,
    /// Send failures.
    pub tx_errors: u64,
    /// Sequence gaps observed.
    pub rx_miss: u64,
    /// Receive timeouts.
    pub rx_timeout: u64,
}

/// Health subsystem snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthDump {
    /// Keepalive interval in milliseconds.
    pub keepalive_ms: u64,
    /// Monitored peers.
    pub peers: Vec<HealthPeerDump>,
}

/// One configured peer record.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDump {
    /// Local slot index.
    pub index: u32,
    /// Peer address.
    pub addr: String,
    /// Election-assigned id, `-1` when undecided.
    pub mlag_id: i32,
    /// Sync pipeline state.
    pub sync_state: String,
    /// Learned chassis identity, zero when unknown.
    pub system_id: u64,
}

/// One IPL record.
#[derive(Debug, Clone, Serialize)]
pub struct IplDump {
    /// IPL id.
    pub id: u32,
    /// Bound port interface index, `-1` when unbound.
    pub port: i64,
    /// Local address, empty when unset.
    pub local_addr: String,
    /// Peer address, empty when unset.
    pub peer_addr: String,
    /// Control VLAN, zero when unset.
    pub vlan: u16,
    /// Operational state of the bound port.
    pub oper_state: String,
}

/// One MLAG port record.
#[derive(Debug, Clone, Serialize)]
pub struct PortDump {
    /// The port.
    pub port_id: u64,
    /// Aggregation mode.
    pub mode: String,
    /// Local member state.
    pub local_oper: String,
    /// Pair-wide state.
    pub global: String,
}

/// One LACP aggregator entry.
#[derive(Debug, Clone, Serialize)]
pub struct LacpDump {
    /// The port.
    pub port_id: u64,
    /// Partner system id.
    pub partner_id: u64,
    /// Partner key.
    pub partner_key: u16,
    /// Use bitmap, bit = mlag id.
    pub peer_uses: u8,
}

/// Manager subsystem snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerDump {
    /// Elected role.
    pub role: String,
    /// Local IPL address, empty when unset.
    pub my_addr: String,
    /// Peer IPL address, empty when unset.
    pub peer_addr: String,
    /// Configured peers.
    pub peers: Vec<PeerDump>,
    /// Configured IPLs.
    pub ipls: Vec<IplDump>,
    /// MLAG ports.
    pub ports: Vec<PortDump>,
    /// LACP aggregator table.
    pub lacp: Vec<LacpDump>,
    /// VLANs the IPL is currently a member of.
    pub ipl_vlans: Vec<u16>,
    /// Globally-up VLAN count.
    pub vlans_global_up: u64,
    /// Message counters.
    pub counters: Counters,
}

/// The full daemon snapshot written by the `dump` RPC.
#[derive(Debug, Clone, Serialize)]
pub struct DumpSnapshot {
    /// Health subsystem.
    pub health: HealthDump,
    /// Manager subsystem.
    pub manager: ManagerDump,
}
