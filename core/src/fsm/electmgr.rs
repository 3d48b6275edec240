//! Master election.
//!
//! Once the local and peer IPL addresses are both known and the peer
//! answers heartbeats, the chassis with the numerically smaller address
//! becomes master; the other becomes slave. With no reachable peer the
//! chassis runs standalone. The decision is sticky: it is only revisited
//! when heartbeat or address configuration changes.

use std::net::Ipv4Addr;

use log::*;

use mlag_common::peer::{MlagId, Role};

use super::event::{Event, RoleChange};
use super::output::{Io, Outbox};
use super::DisconnectReason;

/// The election sub-manager.
#[derive(Debug, Default)]
pub struct ElectionManager {
    outbox: Outbox,
    role: Option<Role>,
    local_addr: Option<Ipv4Addr>,
    peer_addr: Option<Ipv4Addr>,
    peer_reachable: bool,
    started: bool,
}

impl Iterator for ElectionManager {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl ElectionManager {
    /// Create an undecided election manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol activity began; run a first election.
    pub fn start(&mut self) {
        self.started = true;
        self.elect();
    }

    /// Quiesce and forget the decision.
    pub fn stop(&mut self) {
        if self.role.is_some() {
            self.outbox.hang_up(DisconnectReason::Stop);
        }
        self.role = None;
        self.peer_reachable = false;
        self.started = false;
    }

    /// The current role; standalone until something else is decided.
    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::Standalone)
    }

    /// The id this chassis owns under the current role.
    pub fn my_id(&self) -> MlagId {
        match self.role() {
            Role::Slave => MlagId::SLAVE,
            _ => MlagId::MASTER,
        }
    }

    /// The id of the remote peer, when a pair is formed.
    pub fn remote_id(&self) -> Option<MlagId> {
        match self.role() {
            Role::Master => Some(MlagId::SLAVE),
            Role::Slave => Some(MlagId::MASTER),
            Role::Standalone => None,
        }
    }

    /// Election status for queries and dumps.
    pub fn status(&self) -> RoleChange {
        RoleChange {
            current: self.role(),
            previous: self.role(),
            my_addr: self.local_addr,
            peer_addr: self.peer_addr,
            my_peer_id: self.my_id(),
            master_peer_id: MlagId::MASTER,
        }
    }

    /// The local IPL address changed.
    pub fn set_local_addr(&mut self, addr: Option<Ipv4Addr>) {
        self.local_addr = addr;
        self.elect();
    }

    /// The peer IPL address changed. Clearing it also clears
    /// reachability.
    pub fn set_peer_addr(&mut self, addr: Option<Ipv4Addr>) {
        self.peer_addr = addr;
        if addr.is_none() {
            self.peer_reachable = false;
        }
        self.elect();
    }

    /// The peer's heartbeat state changed.
    pub fn set_peer_reachable(&mut self, reachable: bool) {
        if self.peer_reachable != reachable {
            self.peer_reachable = reachable;
            self.elect();
        }
    }

    fn elect(&mut self) {
        if !self.started {
            return;
        }
        let Some(local) = self.local_addr else {
            return;
        };

        let role = match self.peer_addr {
            Some(peer) if self.peer_reachable => {
                // Addresses are distinct by configuration, a tie is
                // impossible.
                if u32::from(local) < u32::from(peer) {
                    Role::Master
                } else {
                    Role::Slave
                }
            }
            _ => Role::Standalone,
        };

        if self.role == Some(role) {
            return;
        }
        let previous = self.role();
        self.role = Some(role);

        info!(
            target: "mlag",
            "Election: {} -> {} (local {}, peer {})",
            previous,
            role,
            local,
            self.peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unset".to_owned()),
        );

        self.outbox.event(Event::RoleChanged(RoleChange {
            current: role,
            previous,
            my_addr: self.local_addr,
            peer_addr: self.peer_addr,
            my_peer_id: match role {
                Role::Slave => MlagId::SLAVE,
                _ => MlagId::MASTER,
            },
            master_peer_id: MlagId::MASTER,
        }));

        // The channel follows the role: the master listens, the slave
        // dials, a standalone chassis needs no channel.
        match role {
            Role::Master => {
                if previous == Role::Slave {
                    self.outbox.hang_up(DisconnectReason::RoleChange);
                }
                self.outbox.push(Io::Listen);
            }
            Role::Slave => {
                let master = self.peer_addr.expect("a slave always has a peer address");
                self.outbox.push(Io::Connect(master));
            }
            Role::Standalone => {
                if previous != Role::Standalone {
                    self.outbox.hang_up(DisconnectReason::RoleChange);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mgr: &mut ElectionManager) -> Vec<Io> {
        mgr.collect()
    }

    #[test]
    fn test_lower_address_wins() {
        let mut mgr = ElectionManager::new();
        mgr.start();
        mgr.set_local_addr(Some(Ipv4Addr::new(10, 0, 0, 1)));
        mgr.set_peer_addr(Some(Ipv4Addr::new(10, 0, 0, 2)));

        // Configured but unreachable: standalone.
        assert_eq!(mgr.role(), Role::Standalone);

        mgr.set_peer_reachable(true);
        assert_eq!(mgr.role(), Role::Master);
        assert_eq!(mgr.my_id(), MlagId::MASTER);

        let io = drain(&mut mgr);
        assert!(io.contains(&Io::Listen));
    }

    #[test]
    fn test_higher_address_is_slave() {
        let mut mgr = ElectionManager::new();
        mgr.start();
        mgr.set_local_addr(Some(Ipv4Addr::new(10, 0, 0, 2)));
        mgr.set_peer_addr(Some(Ipv4Addr::new(10, 0, 0, 1)));
        mgr.set_peer_reachable(true);

        assert_eq!(mgr.role(), Role::Slave);
        assert_eq!(mgr.my_id(), MlagId::SLAVE);

        let io = drain(&mut mgr);
        assert!(io.contains(&Io::Connect(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_role_is_sticky() {
        let mut mgr = ElectionManager::new();
        mgr.start();
        mgr.set_local_addr(Some(Ipv4Addr::new(10, 0, 0, 1)));
        mgr.set_peer_addr(Some(Ipv4Addr::new(10, 0, 0, 2)));
        mgr.set_peer_reachable(true);
        drain(&mut mgr);

        // Re-announcing the same conditions changes nothing.
        mgr.set_peer_reachable(true);
        mgr.set_local_addr(Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(drain(&mut mgr).is_empty());

        // Losing the heartbeat falls back to standalone.
        mgr.set_peer_reachable(false);
        assert_eq!(mgr.role(), Role::Standalone);
    }

    #[test]
    fn test_no_election_without_local_address() {
        let mut mgr = ElectionManager::new();
        mgr.start();
        mgr.set_peer_addr(Some(Ipv4Addr::new(10, 0, 0, 2)));
        mgr.set_peer_reachable(true);

        assert_eq!(mgr.role(), Role::Standalone);
        assert!(drain(&mut mgr).is_empty());
    }
}
