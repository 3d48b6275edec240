//! Peer database.
//!
//! One record per configured MLAG peer, created when the peer IP is set on
//! an IPL and destroyed on peer delete. The local slot index is stable for
//! the record's lifetime; the `mlag_id` is assigned later, by master
//! election.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::topology::IplId;
use crate::MAX_PEERS;

/// Stable local index of a peer record, `0..MAX_PEERS`.
pub type PeerIndex = usize;

/// A chassis identity, as learned from heartbeat datagrams.
pub type SystemId = u64;

/// Protocol-wide peer id assigned by master election: `0` is the master,
/// `1` the slave.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MlagId(pub u8);

impl MlagId {
    /// The id the elected master owns.
    pub const MASTER: MlagId = MlagId(0);
    /// The id the elected slave owns.
    pub const SLAVE: MlagId = MlagId(1);

    /// Whether this is the master's id.
    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }
}

impl fmt::Display for MlagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chassis role decided by master election.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// No reachable peer; this chassis runs alone.
    Standalone,
    /// This chassis owns centralized decisions.
    Master,
    /// The remote chassis owns centralized decisions.
    Slave,
}

impl Role {
    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer connectivity as reported by the health subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HealthState {
    /// Peer is fully reachable.
    Up,
    /// Peer is unreachable.
    Down,
    /// Peer lost protocol communications but management still sees it.
    CommDown,
    /// Communications lost; waiting out the settle period before deciding.
    DownWait,
    /// No such peer is configured.
    NotExist,
}

impl HealthState {
    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "peer-up",
            Self::Down => "peer-down",
            Self::CommDown => "comm-down",
            Self::DownWait => "down-wait",
            Self::NotExist => "not-exist",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer progress through the sync pipeline, as tracked by the manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// Not reachable, or not yet started.
    Down,
    /// Reachable; per-subsystem sync in flight.
    Start,
    /// May receive state updates while its own sync completes.
    TxEnable,
    /// Fully converged; counted in global decisions.
    Enable,
}

impl Default for PeerState {
    fn default() -> Self {
        Self::Down
    }
}

impl PeerState {
    /// Whether the peer should receive state-change traffic.
    pub fn is_tx_enabled(&self) -> bool {
        matches!(self, Self::TxEnable | Self::Enable)
    }

    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Start => "start",
            Self::TxEnable => "tx-enable",
            Self::Enable => "enable",
        }
    }
}

/// A configured MLAG peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Stable local slot index.
    pub index: PeerIndex,
    /// The IPL this peer is reached through.
    pub ipl_id: IplId,
    /// Peer address on the IPL subnet. Unique across the peer set.
    pub addr: Ipv4Addr,
    /// Chassis identity learned from the first heartbeat.
    pub system_id: Option<SystemId>,
    /// Election-assigned id, if a role has been decided.
    pub mlag_id: Option<MlagId>,
}

/// A peer database error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// All peer slots are occupied.
    #[error("peer table is full")]
    Full,
    /// A record with the same address already exists.
    #[error("peer {0} is already configured")]
    DuplicateAddress(Ipv4Addr),
    /// No record at the given index.
    #[error("peer {0} not found")]
    NotFound(PeerIndex),
}

/// Maps peer addresses to local peer records.
#[derive(Debug, Clone, Default)]
pub struct PeerDb {
    slots: [Option<PeerRecord>; MAX_PEERS],
}

impl PeerDb {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer reached through `ipl_id` at `addr`. Returns the stable
    /// index assigned to the record.
    pub fn add(&mut self, ipl_id: IplId, addr: Ipv4Addr) -> Result<PeerIndex, Error> {
        if self.by_addr(&addr).is_some() {
            return Err(Error::DuplicateAddress(addr));
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Full)?;

        self.slots[index] = Some(PeerRecord {
            index,
            ipl_id,
            addr,
            system_id: None,
            mlag_id: None,
        });

        Ok(index)
    }

    /// Remove the record at `index`.
    pub fn remove(&mut self, index: PeerIndex) -> Result<PeerRecord, Error> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(Error::NotFound(index))
    }

    /// Get the record at `index`.
    pub fn get(&self, index: PeerIndex) -> Option<&PeerRecord> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Get the record at `index`, mutably.
    pub fn get_mut(&mut self, index: PeerIndex) -> Option<&mut PeerRecord> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Look a record up by peer address.
    pub fn by_addr(&self, addr: &Ipv4Addr) -> Option<&PeerRecord> {
        self.iter().find(|p| p.addr == *addr)
    }

    /// Look a record up by its election-assigned id.
    pub fn by_mlag_id(&self, id: MlagId) -> Option<&PeerRecord> {
        self.iter().find(|p| p.mlag_id == Some(id))
    }

    /// Iterate over configured records.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.iter().flatten()
    }

    /// Number of configured records.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no peer is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_index() {
        let mut db = PeerDb::new();
        let a = db.add(0, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let b = db.add(0, Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!((a, b), (0, 1));

        db.remove(a).unwrap();
        assert_eq!(db.get(b).unwrap().addr, Ipv4Addr::new(10, 0, 0, 2));

        // The freed slot is reused; `b` keeps its index.
        let c = db.add(0, Ipv4Addr::new(10, 0, 0, 3)).unwrap();
        assert_eq!(c, 0);
        assert_eq!(db.get(b).unwrap().index, 1);
    }

    #[test]
    fn test_unique_address() {
        let mut db = PeerDb::new();
        db.add(0, Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        assert_eq!(
            db.add(0, Ipv4Addr::new(10, 0, 0, 1)),
            Err(Error::DuplicateAddress(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn test_full_table() {
        let mut db = PeerDb::new();
        for i in 0..MAX_PEERS {
            db.add(0, Ipv4Addr::new(10, 0, 0, 1 + i as u8)).unwrap();
        }
        assert_eq!(db.add(0, Ipv4Addr::new(10, 0, 0, 99)), Err(Error::Full));
    }
}
