//! LACP aggregator arbitration.
//!
//! Both chassis advertise the same LACP actor, so only one MLAG port may
//! attach to a given `(partner system, partner key)` at a time. The master
//! arbitrates: the first requester takes the aggregator, matching
//! requesters share it, mismatching requesters are declined unless they
//! force, in which case the current holders are told to release and the
//! forcing request waits its turn. Entries are reference-counted by a
//! per-chassis use bitmap and disappear, with a release broadcast, when
//! the last user lets go.

use std::collections::BTreeMap;

use log::*;

use mlag_common::message::{LacpEntrySnapshot, LacpSelection, Message, SelectionResponse};
use mlag_common::peer::{MlagId, Role, SystemId};
use mlag_common::{PortId, MAX_PEERS};

use super::event::Event;
use super::output::{Io, Outbox};

/// Actor system id advertised before one is configured.
pub const INVALID_SYS_ID: SystemId = u64::MAX;

/// One arbitrated aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LacpEntry {
    /// Partner system holding the aggregator.
    pub partner_id: SystemId,
    /// Partner key holding the aggregator.
    pub partner_key: u16,
    /// Bitmap of chassis using the entry, bit = `mlag_id`.
    pub peer_uses: u8,
}

impl LacpEntry {
    fn uses(&self, id: MlagId) -> bool {
        self.peer_uses & (1 << id.0) != 0
    }

    fn set_use(&mut self, id: MlagId) {
        self.peer_uses |= 1 << id.0;
    }

    fn clear_use(&mut self, id: MlagId) {
        self.peer_uses &= !(1 << id.0);
    }

    fn is_free(&self) -> bool {
        self.peer_uses == 0
    }

    fn matches(&self, partner_id: SystemId, partner_key: u16) -> bool {
        self.partner_id == partner_id && self.partner_key == partner_key
    }
}

/// The LACP sub-manager.
#[derive(Debug)]
pub struct LacpManager {
    outbox: Outbox,
    entries: BTreeMap<PortId, LacpEntry>,
    /// Local requests awaiting a verdict, one per port.
    pending: BTreeMap<PortId, LacpSelection>,
    /// Arbiter side: forcing requests waiting for holders to release.
    evictions: BTreeMap<PortId, LacpSelection>,
    local_sys_id: Option<SystemId>,
    master_sys_id: Option<SystemId>,
    role: Role,
    my_id: MlagId,
    /// Arbitrate locally until the master's table has been synced.
    use_local_logic: bool,
    enabled: bool,
}

impl Iterator for LacpManager {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl LacpManager {
    /// Create an idle manager.
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            evictions: BTreeMap::new(),
            local_sys_id: None,
            master_sys_id: None,
            role: Role::Standalone,
            my_id: MlagId::MASTER,
            use_local_logic: true,
            enabled: false,
        }
    }

    /// Begin protocol activity.
    pub fn start(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Quiesce: drop every entry and request.
    pub fn stop(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.evictions.clear();
        self.master_sys_id = None;
        self.use_local_logic = true;
        self.enabled = false;
    }

    /// Whether LACP arbitration is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The actor system id currently advertised to LACP partners: the
    /// master's once synced, the local one otherwise.
    pub fn actor_sys_id(&self) -> SystemId {
        self.master_sys_id
            .or(self.local_sys_id)
            .unwrap_or(INVALID_SYS_ID)
    }

    /// Election settled. A slave promoted to arbiter starts from an empty
    /// table; holdings come back through the peers' sync. A master that
    /// merely lost its peer keeps its table.
    pub fn role_changed(&mut self, role: Role, my_id: MlagId) {
        let was_slave = self.role == Role::Slave;
        self.role = role;
        self.my_id = my_id;

        match role {
            Role::Master | Role::Standalone if was_slave => {
                debug!(target: "lacp", "Assuming arbiter role, table reset");
                self.entries.clear();
                self.evictions.clear();
                self.master_sys_id = None;
                self.use_local_logic = true;
            }
            Role::Slave => {
                // Arbitrate locally until the master's table arrives.
                self.use_local_logic = true;
                self.master_sys_id = None;
            }
            _ => {}
        }
    }

    /// Configure the local actor system id.
    pub fn sys_id_set(&mut self, sys_id: SystemId) {
        self.local_sys_id = Some(sys_id);
        info!(target: "lacp", "Local actor system id set to {:#x}", sys_id);

        if self.role != Role::Slave {
            self.outbox.event(Event::LacpSysIdChanged {
                sys_id: self.actor_sys_id(),
            });
            if self.role == Role::Master {
                self.outbox
                    .write(MlagId::SLAVE, Message::LacpSysIdUpdate { sys_id });
            }
        }
    }

    /// The master announced a new actor system id.
    pub fn handle_sys_id_update(&mut self, sys_id: SystemId) {
        self.master_sys_id = Some(sys_id);
        self.outbox.event(Event::LacpSysIdChanged { sys_id });
    }

    /// A local caller asks for an aggregator.
    pub fn selection_request(
        &mut self,
        request_id: u32,
        port_id: PortId,
        partner_id: SystemId,
        partner_key: u16,
        force: bool,
    ) {
        if !self.enabled {
            info!(target: "lacp", "Selection request while LACP disabled, ignored");
            return;
        }

        // An outstanding request on the same port is displaced.
        if let Some(previous) = self.pending.remove(&port_id) {
            self.reject(&previous);
        }

        let request = LacpSelection {
            is_response: false,
            response: SelectionResponse::Decline,
            force,
            select: true,
            mlag_id: self.my_id,
            request_id,
            port_id,
            partner_id,
            partner_key,
        };
        self.pending.insert(port_id, request);
        self.route_to_arbiter(request);
    }

    /// A local caller releases an aggregator.
    pub fn selection_release(&mut self, request_id: u32, port_id: PortId) {
        if !self.enabled {
            info!(target: "lacp", "Selection release while LACP disabled, ignored");
            return;
        }
        self.pending.remove(&port_id);

        let request = LacpSelection {
            is_response: false,
            response: SelectionResponse::Decline,
            force: false,
            select: false,
            mlag_id: self.my_id,
            request_id,
            port_id,
            partner_id: 0,
            partner_key: 0,
        };
        self.route_to_arbiter(request);
    }

    fn route_to_arbiter(&mut self, request: LacpSelection) {
        if self.role == Role::Slave && !self.use_local_logic {
            self.outbox
                .write(MlagId::MASTER, Message::LacpSelection(request));
        } else {
            self.handle_selection(request);
        }
    }

    /// Arbiter and response handling for a selection message.
    pub fn handle_selection(&mut self, msg: LacpSelection) {
        if !self.enabled {
            return;
        }

        if !msg.select {
            self.handle_release_request(msg);
        } else if !msg.is_response {
            debug!(
                target: "lacp",
                "Select port {} partner {:#x} key {} from peer {}",
                msg.port_id, msg.partner_id, msg.partner_key, msg.mlag_id
            );

            match self.entries.get_mut(&msg.port_id) {
                None => {
                    let mut entry = LacpEntry {
                        partner_id: msg.partner_id,
                        partner_key: msg.partner_key,
                        peer_uses: 0,
                    };
                    entry.set_use(msg.mlag_id);
                    self.entries.insert(msg.port_id, entry);
                    self.respond(msg, SelectionResponse::Accept, msg.partner_id, msg.partner_key);
                }
                Some(entry) if entry.matches(msg.partner_id, msg.partner_key) => {
                    entry.set_use(msg.mlag_id);
                    let (id, key) = (entry.partner_id, entry.partner_key);
                    self.respond(msg, SelectionResponse::Accept, id, key);
                }
                Some(entry) if !msg.force => {
                    let (id, key) = (entry.partner_id, entry.partner_key);
                    self.respond(msg, SelectionResponse::Decline, id, key);
                }
                Some(entry) => {
                    // Forced: holders are told to let go and the request
                    // waits for the port to free up.
                    let holders = entry.peer_uses;
                    info!(
                        target: "lacp",
                        "Forced selection for port {}, evicting holders {:#04b}",
                        msg.port_id, holders
                    );
                    if let Some(displaced) = self.evictions.insert(msg.port_id, msg) {
                        self.reject_remote(displaced);
                    }
                    for id in 0..MAX_PEERS as u8 {
                        let holder = MlagId(id);
                        if holders & (1 << id) != 0 {
                            self.notify_release(holder, msg.port_id);
                        }
                    }
                }
            }
        } else {
            self.handle_response(msg);
        }
    }

    fn handle_release_request(&mut self, msg: LacpSelection) {
        debug!(target: "lacp", "Release port {} from peer {}", msg.port_id, msg.mlag_id);

        let freed = match self.entries.get_mut(&msg.port_id) {
            None => true,
            Some(entry) => {
                entry.clear_use(msg.mlag_id);
                entry.is_free()
            }
        };

        if freed {
            self.entries.remove(&msg.port_id);
            self.broadcast_release(msg.port_id);
            self.process_eviction(msg.port_id);
        }
    }

    fn handle_response(&mut self, msg: LacpSelection) {
        let matches = self
            .pending
            .get(&msg.port_id)
            .map_or(false, |p| p.request_id == msg.request_id);

        if !matches {
            debug!(
                target: "lacp",
                "Ignoring response for port {} request {}", msg.port_id, msg.request_id
            );
            return;
        }
        self.pending.remove(&msg.port_id);
        self.outbox.event(Event::AggregatorResponse {
            request_id: msg.request_id,
            response: msg.response,
            port_id: msg.port_id,
            partner_id: msg.partner_id,
            partner_key: msg.partner_key,
        });
    }

    /// The master told this chassis to release an aggregator.
    pub fn handle_release(&mut self, port_id: PortId) {
        self.outbox.event(Event::AggregatorReleased { port_id });
    }

    fn respond(
        &mut self,
        mut msg: LacpSelection,
        response: SelectionResponse,
        partner_id: SystemId,
        partner_key: u16,
    ) {
        msg.is_response = true;
        msg.response = response;
        msg.partner_id = partner_id;
        msg.partner_key = partner_key;

        if msg.mlag_id == self.my_id {
            self.handle_response(msg);
        } else {
            self.outbox
                .write(msg.mlag_id, Message::LacpSelection(msg));
        }
    }

    fn reject(&mut self, request: &LacpSelection) {
        debug!(
            target: "lacp",
            "Rejecting pending request {} for port {}", request.request_id, request.port_id
        );
        self.outbox.event(Event::AggregatorResponse {
            request_id: request.request_id,
            response: SelectionResponse::Decline,
            port_id: request.port_id,
            partner_id: request.partner_id,
            partner_key: request.partner_key,
        });
    }

    fn reject_remote(&mut self, request: LacpSelection) {
        self.respond(
            request,
            SelectionResponse::Decline,
            request.partner_id,
            request.partner_key,
        );
    }

    fn notify_release(&mut self, holder: MlagId, port_id: PortId) {
        if holder == self.my_id {
            self.outbox.event(Event::AggregatorReleased { port_id });
        } else {
            self.outbox.write(holder, Message::LacpRelease { port_id });
        }
    }

    fn broadcast_release(&mut self, port_id: PortId) {
        for id in 0..MAX_PEERS as u8 {
            self.notify_release(MlagId(id), port_id);
        }
    }

    fn process_eviction(&mut self, port_id: PortId) {
        if let Some(request) = self.evictions.remove(&port_id) {
            info!(
                target: "lacp",
                "Port {} freed, serving forced request {}", port_id, request.request_id
            );
            self.handle_selection(request);
        }
    }

    /// A peer went away: clear its use bits everywhere; entries that free
    /// up are released. A slave losing its master falls back to local
    /// arbitration and gives up on outstanding requests.
    pub fn peer_down(&mut self, peer: MlagId) {
        if self.role == Role::Slave && peer == MlagId::MASTER {
            let outstanding: Vec<LacpSelection> = self.pending.values().copied().collect();
            self.pending.clear();
            for request in outstanding {
                self.reject(&request);
            }
            self.use_local_logic = true;
        }

        let freed: Vec<PortId> = self
            .entries
            .iter_mut()
            .filter_map(|(port, entry)| {
                if entry.uses(peer) {
                    entry.clear_use(peer);
                    entry.is_free().then_some(*port)
                } else {
                    None
                }
            })
            .collect();

        for port in freed {
            self.entries.remove(&port);
            self.notify_release(self.my_id, port);
            self.process_eviction(port);
        }

        // Forced requests from a dead peer will never be answered.
        self.evictions.retain(|_, req| req.mlag_id != peer);
    }

    /// The master's table, shipped to a syncing slave.
    pub fn sync_snapshot(&self) -> Message {
        Message::LacpSync {
            master_sys_id: self.actor_sys_id(),
            entries: self
                .entries
                .iter()
                .map(|(port, entry)| LacpEntrySnapshot {
                    port_id: *port,
                    partner_id: entry.partner_id,
                    partner_key: entry.partner_key,
                    peer_uses: entry.peer_uses,
                })
                .collect(),
        }
    }

    /// The slave's holdings, shipped with its `SyncStart`.
    pub fn local_snapshot(&self) -> Message {
        Message::LacpSync {
            master_sys_id: self.actor_sys_id(),
            entries: self
                .entries
                .iter()
                .filter(|(_, entry)| entry.uses(self.my_id))
                .map(|(port, entry)| LacpEntrySnapshot {
                    port_id: *port,
                    partner_id: entry.partner_id,
                    partner_key: entry.partner_key,
                    peer_uses: 1 << self.my_id.0,
                })
                .collect(),
        }
    }

    /// Apply a received table: a slave adopts the master's table wholesale,
    /// the master merges a syncing slave's holdings into its own.
    pub fn apply_sync(&mut self, master_sys_id: SystemId, entries: Vec<LacpEntrySnapshot>) {
        if self.role == Role::Slave {
            self.entries.clear();
            for snapshot in entries {
                self.entries.insert(
                    snapshot.port_id,
                    LacpEntry {
                        partner_id: snapshot.partner_id,
                        partner_key: snapshot.partner_key,
                        peer_uses: snapshot.peer_uses,
                    },
                );
            }
            self.use_local_logic = false;
            if master_sys_id != INVALID_SYS_ID && self.master_sys_id != Some(master_sys_id) {
                self.master_sys_id = Some(master_sys_id);
                self.outbox.event(Event::LacpSysIdChanged {
                    sys_id: master_sys_id,
                });
            }
        } else {
            for snapshot in entries {
                let entry = self
                    .entries
                    .entry(snapshot.port_id)
                    .or_insert_with(|| LacpEntry {
                        partner_id: snapshot.partner_id,
                        partner_key: snapshot.partner_key,
                        peer_uses: 0,
                    });
                entry.peer_uses |= snapshot.peer_uses;
            }
        }
    }

    /// Iterate over the aggregator table, for dumps.
    pub fn entries(&self) -> impl Iterator<Item = (&PortId, &LacpEntry)> {
        self.entries.iter()
    }

    /// Iterate over outstanding local requests, for dumps.
    pub fn pending(&self) -> impl Iterator<Item = (&PortId, &LacpSelection)> {
        self.pending.iter()
    }
}

impl Default for LacpManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> LacpManager {
        let mut mgr = LacpManager::new();
        mgr.start(true);
        mgr.role_changed(Role::Master, MlagId::MASTER);
        mgr
    }

    fn events(mgr: &mut LacpManager) -> Vec<Event> {
        mgr.filter_map(|io| match io {
            Io::Event(e) => Some(e),
            _ => None,
        })
        .collect()
    }

    fn remote_request(port: PortId, req: u32, partner: SystemId, key: u16, force: bool) -> LacpSelection {
        LacpSelection {
            is_response: false,
            response: SelectionResponse::Decline,
            force,
            select: true,
            mlag_id: MlagId::SLAVE,
            request_id: req,
            port_id: port,
            partner_id: partner,
            partner_key: key,
        }
    }

    #[test]
    fn test_first_requester_accepted() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);

        let events = events(&mut mgr);
        assert!(events.contains(&Event::AggregatorResponse {
            request_id: 1,
            response: SelectionResponse::Accept,
            port_id: 42,
            partner_id: 0xaa,
            partner_key: 7,
        }));
    }

    #[test]
    fn test_mismatch_declined_with_current_holder() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);
        events(&mut mgr);

        mgr.handle_selection(remote_request(42, 2, 0xbb, 9, false));
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.iter().any(|io| matches!(
            io,
            Io::Write(
                MlagId::SLAVE,
                Message::LacpSelection(LacpSelection {
                    is_response: true,
                    response: SelectionResponse::Decline,
                    partner_id: 0xaa,
                    partner_key: 7,
                    ..
                })
            )
        )));
    }

    #[test]
    fn test_matching_requester_shares_entry() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);
        mgr.handle_selection(remote_request(42, 2, 0xaa, 7, false));

        let (_, entry) = mgr.entries().next().unwrap();
        assert_eq!(entry.peer_uses, 0b11);
    }

    #[test]
    fn test_force_evicts_and_waits() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);
        events(&mut mgr);

        // Forced mismatch from the slave: the local holder is told to
        // release, no verdict yet.
        mgr.handle_selection(remote_request(42, 2, 0xbb, 9, true));
        let events_now = events(&mut mgr);
        assert!(events_now.contains(&Event::AggregatorReleased { port_id: 42 }));

        // Local engine complies and releases; the forced request is then
        // accepted.
        mgr.selection_release(3, 42);
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.iter().any(|io| matches!(
            io,
            Io::Write(
                MlagId::SLAVE,
                Message::LacpSelection(LacpSelection {
                    is_response: true,
                    response: SelectionResponse::Accept,
                    partner_id: 0xbb,
                    partner_key: 9,
                    ..
                })
            )
        )));
        let (_, entry) = mgr.entries().next().unwrap();
        assert!(entry.matches(0xbb, 9));
    }

    #[test]
    fn test_second_pending_displaces_first() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);
        events(&mut mgr);

        mgr.handle_selection(remote_request(42, 2, 0xbb, 9, true));
        mgr.handle_selection(remote_request(42, 3, 0xcc, 5, true));

        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.iter().any(|io| matches!(
            io,
            Io::Write(
                MlagId::SLAVE,
                Message::LacpSelection(LacpSelection {
                    is_response: true,
                    response: SelectionResponse::Decline,
                    request_id: 2,
                    ..
                })
            )
        )));
    }

    #[test]
    fn test_peer_down_releases_orphans() {
        let mut mgr = master();
        mgr.selection_request(1, 42, 0xaa, 7, false);
        mgr.handle_selection(remote_request(43, 2, 0xbb, 9, false));
        events(&mut mgr);

        mgr.peer_down(MlagId::SLAVE);

        // Port 43 was held only by the slave: released and gone. Port 42
        // is still held locally.
        let events = events(&mut mgr);
        assert!(events.contains(&Event::AggregatorReleased { port_id: 43 }));
        assert_eq!(mgr.entries().count(), 1);
        assert_eq!(*mgr.entries().next().unwrap().0, 42);
    }

    #[test]
    fn test_slave_forwards_to_master_after_sync() {
        let mut mgr = LacpManager::new();
        mgr.start(true);
        mgr.role_changed(Role::Slave, MlagId::SLAVE);
        mgr.apply_sync(0x99, vec![]);

        mgr.selection_request(1, 42, 0xaa, 7, false);
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.iter().any(|io| matches!(
            io,
            Io::Write(MlagId::MASTER, Message::LacpSelection(LacpSelection {
                is_response: false,
                select: true,
                ..
            }))
        )));

        // Adopting the master's sys id was announced.
        assert_eq!(mgr.actor_sys_id(), 0x99);
    }

    #[test]
    fn test_disabled_ignores_requests() {
        let mut mgr = LacpManager::new();
        mgr.start(false);
        mgr.role_changed(Role::Master, MlagId::MASTER);

        mgr.selection_request(1, 42, 0xaa, 7, false);
        assert!(events(&mut mgr).is_empty());
        assert_eq!(mgr.entries().count(), 0);
    }
}
