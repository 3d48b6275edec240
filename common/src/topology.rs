//! Inter-peer link (IPL) records.
//!
//! An IPL binds a physical port, a control VLAN and the local/peer
//! addresses the control plane runs over. The design anticipates a single
//! IPL per peer pair; the table is sized by [`MAX_IPLS`](crate::MAX_IPLS).

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::{LinkState, MAX_IPLS};

/// Index of an IPL record, `0..MAX_IPLS`.
pub type IplId = usize;

/// Interface index of a switch port, as the driver knows it.
pub type IfIndex = u32;

/// A VLAN identifier in the valid `1..=4095` range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VlanId(u16);

impl VlanId {
    /// Largest valid VLAN id.
    pub const MAX: u16 = 4095;

    /// Validate and construct a VLAN id.
    pub fn new(id: u16) -> Result<Self, Error> {
        if id == 0 || id > Self::MAX {
            return Err(Error::InvalidVlan(id));
        }
        Ok(Self(id))
    }

    /// The numeric id.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for VlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A topology database error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The IPL table is full.
    #[error("no free IPL slot")]
    NoFreeSlot,
    /// No record with the given id.
    #[error("IPL {0} not found")]
    NotFound(IplId),
    /// VLAN id outside `1..=4095`.
    #[error("VLAN id {0} out of range")]
    InvalidVlan(u16),
}

/// A single inter-peer link record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipl {
    /// Port carrying the link, once bound.
    pub port: Option<IfIndex>,
    /// Local address on the IPL subnet.
    pub local_addr: Option<Ipv4Addr>,
    /// Peer address on the IPL subnet.
    pub peer_addr: Option<Ipv4Addr>,
    /// Control VLAN the addresses live on.
    pub vlan: Option<VlanId>,
    /// Operational state of the bound port.
    pub oper_state: LinkState,
}

/// The IPL table.
#[derive(Debug, Clone, Default)]
pub struct TopologyDb {
    ipls: [Option<Ipl>; MAX_IPLS],
}

impl TopologyDb {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new IPL record and return its id.
    pub fn create(&mut self) -> Result<IplId, Error> {
        let id = self
            .ipls
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeSlot)?;

        self.ipls[id] = Some(Ipl::default());
        Ok(id)
    }

    /// Delete the record with the given id.
    pub fn delete(&mut self, id: IplId) -> Result<Ipl, Error> {
        self.ipls
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(Error::NotFound(id))
    }

    /// Get an IPL record.
    pub fn get(&self, id: IplId) -> Option<&Ipl> {
        self.ipls.get(id).and_then(Option::as_ref)
    }

    /// Get an IPL record, mutably.
    pub fn get_mut(&mut self, id: IplId) -> Option<&mut Ipl> {
        self.ipls.get_mut(id).and_then(Option::as_mut)
    }

    /// Bind or unbind the port carrying the link.
    pub fn bind_port(&mut self, id: IplId, port: Option<IfIndex>) -> Result<(), Error> {
        let ipl = self.get_mut(id).ok_or(Error::NotFound(id))?;
        ipl.port = port;
        if port.is_none() {
            ipl.oper_state = LinkState::Down;
        }
        Ok(())
    }

    /// Set the addresses and control VLAN. Passing `None` clears them.
    ///
    /// Returns the previously configured peer address if it is being
    /// replaced: the caller must retire the peer record that referenced it.
    pub fn set_addrs(
        &mut self,
        id: IplId,
        vlan: Option<VlanId>,
        local: Option<Ipv4Addr>,
        peer: Option<Ipv4Addr>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        let ipl = self.get_mut(id).ok_or(Error::NotFound(id))?;
        let previous = match ipl.peer_addr {
            old @ Some(_) if old != peer => old,
            _ => None,
        };
        ipl.local_addr = local;
        ipl.peer_addr = peer;
        ipl.vlan = vlan;

        Ok(previous)
    }

    /// Record the operational state of the bound port.
    pub fn set_oper_state(&mut self, id: IplId, state: LinkState) -> Result<(), Error> {
        let ipl = self.get_mut(id).ok_or(Error::NotFound(id))?;
        ipl.oper_state = state;
        Ok(())
    }

    /// Operational state of the given link; `Down` when unknown.
    pub fn oper_state(&self, id: IplId) -> LinkState {
        self.get(id).map(|i| i.oper_state).unwrap_or(LinkState::Down)
    }

    /// Iterate over configured records.
    pub fn iter(&self) -> impl Iterator<Item = (IplId, &Ipl)> {
        self.ipls
            .iter()
            .enumerate()
            .filter_map(|(id, ipl)| ipl.as_ref().map(|i| (id, i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_bounds() {
        assert!(VlanId::new(0).is_err());
        assert!(VlanId::new(1).is_ok());
        assert!(VlanId::new(4095).is_ok());
        assert!(VlanId::new(4096).is_err());
    }

    #[test]
    fn test_peer_addr_replacement() {
        let mut db = TopologyDb::new();
        let id = db.create().unwrap();
        let vlan = Some(VlanId::new(100).unwrap());

        let old = Ipv4Addr::new(10, 0, 0, 2);
        let new = Ipv4Addr::new(10, 0, 0, 3);

        let prev = db
            .set_addrs(id, vlan, Some(Ipv4Addr::new(10, 0, 0, 1)), Some(old))
            .unwrap();
        assert_eq!(prev, None);

        // Re-setting the same peer address is not a replacement.
        let prev = db
            .set_addrs(id, vlan, Some(Ipv4Addr::new(10, 0, 0, 1)), Some(old))
            .unwrap();
        assert_eq!(prev, None);

        let prev = db
            .set_addrs(id, vlan, Some(Ipv4Addr::new(10, 0, 0, 1)), Some(new))
            .unwrap();
        assert_eq!(prev, Some(old));
    }

    #[test]
    fn test_unbind_clears_oper_state() {
        let mut db = TopologyDb::new();
        let id = db.create().unwrap();

        db.bind_port(id, Some(7)).unwrap();
        db.set_oper_state(id, LinkState::Up).unwrap();
        assert_eq!(db.oper_state(id), LinkState::Up);

        db.bind_port(id, None).unwrap();
        assert_eq!(db.oper_state(id), LinkState::Down);
    }
}
