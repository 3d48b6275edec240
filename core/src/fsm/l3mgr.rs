//! L3 VLAN interface aggregation.
//!
//! Every chassis reports the local operational state of its VLAN
//! interfaces. The master folds those reports into a global view, where a
//! VLAN is globally up while any enabled peer has it up, and pushes diffs
//! to every enabled peer. Each chassis then keeps its IPL port's VLAN
//! membership aligned with the global view, so L3 traffic for a VLAN that
//! is only up on one chassis can cross the IPL.
//!
//! The control VLAN carrying the peer channel is special: it joins the IPL
//! when a peer is configured and is never removed while the pairing
//! exists.

use std::collections::BTreeSet;

use log::*;

use mlag_common::message::{Message, VlanStateEntry};
use mlag_common::nonempty::NonEmpty;
use mlag_common::peer::{MlagId, PeerState, Role};
use mlag_common::topology::{IfIndex, VlanId};
use mlag_common::driver::DriverOp;
use mlag_common::{LinkState, MAX_PEERS};

use super::output::{Io, Outbox};

const VLAN_COUNT: usize = VlanId::MAX as usize + 1;

/// The L3 sub-manager: master aggregation logic plus the local membership
/// side.
#[derive(Debug)]
pub struct L3Manager {
    outbox: Outbox,
    role: Role,
    my_id: MlagId,

    // Master state.
    peer_local: Vec<[LinkState; MAX_PEERS]>,
    global: Vec<LinkState>,
    peer_states: [PeerState; MAX_PEERS],

    // Local (peer) state.
    local: Vec<LinkState>,
    membership: BTreeSet<u16>,
    ipl_port: Option<IfIndex>,
    ipl_vlan: Option<VlanId>,
    peer_present: bool,
    started: bool,
}

impl Iterator for L3Manager {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl L3Manager {
    /// Create an idle manager.
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            role: Role::Standalone,
            my_id: MlagId::MASTER,
            peer_local: vec![[LinkState::Down; MAX_PEERS]; VLAN_COUNT],
            global: vec![LinkState::Down; VLAN_COUNT],
            peer_states: [PeerState::Down; MAX_PEERS],
            local: vec![LinkState::Down; VLAN_COUNT],
            membership: BTreeSet::new(),
            ipl_port: None,
            ipl_vlan: None,
            peer_present: false,
            started: false,
        }
    }

    /// Begin protocol activity.
    pub fn start(&mut self) {
        self.started = true;
        // The chassis' own reports always count.
        self.peer_states[self.my_id.0 as usize] = PeerState::Enable;
    }

    /// Quiesce: forget aggregate state, leave all VLANs except the control
    /// VLAN, which only goes when the pairing does.
    pub fn stop(&mut self) {
        for vlan in self.membership.clone() {
            if Some(vlan) != self.ipl_vlan.map(|v| v.as_u16()) {
                self.leave(vlan);
            }
        }
        self.peer_local = vec![[LinkState::Down; MAX_PEERS]; VLAN_COUNT];
        self.global = vec![LinkState::Down; VLAN_COUNT];
        self.peer_states = [PeerState::Down; MAX_PEERS];
        self.started = false;
    }

    /// Election settled. Moving into or out of the slave role resets the
    /// aggregate: a promoted chassis starts empty and is repopulated
    /// through sync, a demoted one defers to the new master. A master
    /// that merely lost its peer keeps aggregating its own reports.
    pub fn role_changed(&mut self, role: Role, my_id: MlagId) {
        let rebuilt = self.role == Role::Slave || role == Role::Slave;
        self.role = role;
        self.my_id = my_id;

        if !rebuilt {
            return;
        }
        self.peer_local = vec![[LinkState::Down; MAX_PEERS]; VLAN_COUNT];
        self.global = vec![LinkState::Down; VLAN_COUNT];
        self.peer_states = [PeerState::Down; MAX_PEERS];
        if self.started {
            self.peer_states[my_id.0 as usize] = PeerState::Enable;
            // Local interface states survive the role change; feed them
            // back into the fresh aggregate.
            let up: Vec<VlanStateEntry> = self.local_up_entries();
            if let Some(entries) = NonEmpty::from_vec(up) {
                self.report_local(entries);
            }
        }
    }

    /// The IPL configuration changed: which port carries it and which
    /// VLAN the control channel lives on.
    pub fn set_ipl(&mut self, port: Option<IfIndex>, vlan: Option<VlanId>) {
        if self.ipl_vlan != vlan {
            if let Some(old) = self.ipl_vlan {
                self.leave(old.as_u16());
            }
            self.ipl_vlan = vlan;
        }
        self.ipl_port = port;
        if self.peer_present {
            self.join_control_vlan();
        }
    }

    /// A peer was configured: the control VLAN joins the IPL and stays.
    pub fn peer_add(&mut self) {
        self.peer_present = true;
        self.join_control_vlan();
    }

    /// The pairing is gone: all aggregate-driven membership is torn down,
    /// the control VLAN included.
    pub fn peer_del(&mut self) {
        self.peer_present = false;
        for vlan in self.membership.clone() {
            self.leave(vlan);
        }
    }

    fn join_control_vlan(&mut self) {
        if let (Some(_), Some(vlan)) = (self.ipl_port, self.ipl_vlan) {
            self.join(vlan.as_u16());
        }
    }

    fn join(&mut self, vlan: u16) {
        if let Some(port) = self.ipl_port {
            if self.membership.insert(vlan) {
                self.outbox.driver(DriverOp::VlanMemberAdd {
                    port,
                    vlan: VlanId::new(vlan).expect("membership only holds valid ids"),
                });
            }
        }
    }

    fn leave(&mut self, vlan: u16) {
        if let Some(port) = self.ipl_port {
            if self.membership.remove(&vlan) {
                self.outbox.driver(DriverOp::VlanMemberRemove {
                    port,
                    vlan: VlanId::new(vlan).expect("membership only holds valid ids"),
                });
            }
        }
    }

    fn local_up_entries(&self) -> Vec<VlanStateEntry> {
        (1..VLAN_COUNT)
            .filter(|&v| self.local[v] == LinkState::Up)
            .map(|v| VlanStateEntry {
                vlan: VlanId::new(v as u16).expect("index is in range"),
                state: LinkState::Up,
            })
            .collect()
    }

    /// Local VLAN interfaces changed operational state.
    pub fn local_vlan_change(&mut self, changes: Vec<VlanStateEntry>) {
        let mut batch = Vec::new();
        for entry in changes {
            let slot = &mut self.local[entry.vlan.as_u16() as usize];
            if *slot != entry.state {
                *slot = entry.state;
                batch.push(entry);
            }
        }
        let Some(batch) = NonEmpty::from_vec(batch) else {
            return;
        };
        if !self.started {
            return;
        }
        self.report_local(batch);
    }

    fn report_local(&mut self, entries: NonEmpty<VlanStateEntry>) {
        match self.role {
            Role::Slave => {
                self.outbox.write(
                    MlagId::MASTER,
                    Message::VlanLocalState {
                        peer_id: self.my_id,
                        entries,
                    },
                );
            }
            // The master and a standalone chassis aggregate their own
            // reports directly.
            Role::Master | Role::Standalone => {
                let my_id = self.my_id;
                self.local_state_change(my_id, &entries);
            }
        }
    }

    fn calc_global(&mut self, vlan: usize) -> bool {
        let up = (0..MAX_PEERS).any(|p| {
            self.peer_states[p] == PeerState::Enable && self.peer_local[vlan][p] == LinkState::Up
        });
        let state = if up { LinkState::Up } else { LinkState::Down };

        if self.global[vlan] != state {
            self.global[vlan] = state;
            true
        } else {
            false
        }
    }

    /// Master: a peer reported local VLAN state. Touched VLANs are
    /// recomputed and any global change is pushed out.
    pub fn local_state_change(&mut self, from: MlagId, entries: &NonEmpty<VlanStateEntry>) {
        let mut diff = Vec::new();

        for entry in entries.iter() {
            let vlan = entry.vlan.as_u16() as usize;
            self.peer_local[vlan][from.0 as usize] = entry.state;

            // Reports are stored regardless, but only enabled peers move
            // the global state.
            if self.peer_states[from.0 as usize] == PeerState::Enable && self.calc_global(vlan) {
                diff.push(VlanStateEntry {
                    vlan: entry.vlan,
                    state: self.global[vlan],
                });
            }
        }
        self.push_global_diff(from, diff);
    }

    /// Master: a peer finished syncing; its stored reports now count.
    pub fn peer_enabled(&mut self, peer: MlagId) {
        info!(target: "l3", "Peer {} enabled, folding its reports into the aggregate", peer);
        self.peer_states[peer.0 as usize] = PeerState::Enable;
        if self.role != Role::Slave {
            self.full_recompute(peer);
        }
    }

    /// Master: a peer is partially synced and may receive diffs.
    pub fn peer_tx_enabled(&mut self, peer: MlagId) {
        if self.peer_states[peer.0 as usize] == PeerState::Down {
            self.peer_states[peer.0 as usize] = PeerState::TxEnable;
        }
    }

    /// Master: a peer went down; its reports no longer count.
    pub fn peer_down(&mut self, peer: MlagId) {
        if peer == self.my_id {
            return;
        }
        debug!(target: "l3", "Peer {} down, dropping its reports", peer);
        self.peer_states[peer.0 as usize] = PeerState::Down;
        for vlan in 1..VLAN_COUNT {
            self.peer_local[vlan][peer.0 as usize] = LinkState::Down;
        }
        if self.role != Role::Slave {
            self.full_recompute(peer);
        }
    }

    fn full_recompute(&mut self, trigger: MlagId) {
        let control = self.ipl_vlan.map(|v| v.as_u16() as usize);
        let mut diff = Vec::new();

        for vlan in 1..VLAN_COUNT {
            // The control VLAN's membership is pinned; the aggregate never
            // drives it.
            if Some(vlan) == control {
                continue;
            }
            if self.calc_global(vlan) {
                diff.push(VlanStateEntry {
                    vlan: VlanId::new(vlan as u16).expect("index is in range"),
                    state: self.global[vlan],
                });
            }
        }
        self.push_global_diff(trigger, diff);
    }

    fn push_global_diff(&mut self, trigger: MlagId, diff: Vec<VlanStateEntry>) {
        let Some(entries) = NonEmpty::from_vec(diff) else {
            return;
        };

        for id in 0..MAX_PEERS as u8 {
            let peer = MlagId(id);
            if !self.peer_states[id as usize].is_tx_enabled() {
                continue;
            }
            if peer == self.my_id {
                self.apply_global(&entries);
            } else {
                self.outbox.write(
                    peer,
                    Message::VlanGlobalState {
                        peer_id: trigger,
                        entries: entries.clone(),
                    },
                );
            }
        }
    }

    /// Program the IPL's VLAN membership from a global state diff.
    pub fn apply_global(&mut self, entries: &NonEmpty<VlanStateEntry>) {
        let control = self.ipl_vlan.map(|v| v.as_u16());

        for entry in entries.iter() {
            let vlan = entry.vlan.as_u16();
            match entry.state {
                LinkState::Up => self.join(vlan),
                // The control VLAN stays while the channel is needed.
                LinkState::Down if Some(vlan) != control => self.leave(vlan),
                LinkState::Down => {}
            }
        }
    }

    /// Master: the global view, shipped to a syncing slave.
    pub fn master_snapshot(&self) -> Option<Message> {
        let up: Vec<VlanStateEntry> = (1..VLAN_COUNT)
            .filter(|&v| self.global[v] == LinkState::Up)
            .map(|v| VlanStateEntry {
                vlan: VlanId::new(v as u16).expect("index is in range"),
                state: LinkState::Up,
            })
            .collect();

        NonEmpty::from_vec(up).map(|entries| Message::VlanGlobalState {
            peer_id: self.my_id,
            entries,
        })
    }

    /// Slave: the local reports, shipped with `SyncStart`.
    pub fn local_snapshot(&self) -> Option<Message> {
        NonEmpty::from_vec(self.local_up_entries()).map(|entries| Message::VlanLocalState {
            peer_id: self.my_id,
            entries,
        })
    }

    /// Number of globally-up VLANs, for dumps.
    pub fn global_up_count(&self) -> usize {
        (1..VLAN_COUNT)
            .filter(|&v| self.global[v] == LinkState::Up)
            .count()
    }

    /// Global state of one VLAN.
    pub fn global_state(&self, vlan: VlanId) -> LinkState {
        self.global[vlan.as_u16() as usize]
    }

    /// Current IPL membership, for dumps.
    pub fn membership(&self) -> impl Iterator<Item = u16> + '_ {
        self.membership.iter().copied()
    }
}

impl Default for L3Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn entry(id: u16, state: LinkState) -> VlanStateEntry {
        VlanStateEntry {
            vlan: vlan(id),
            state,
        }
    }

    fn batch(entries: Vec<VlanStateEntry>) -> NonEmpty<VlanStateEntry> {
        NonEmpty::from_vec(entries).unwrap()
    }

    fn master() -> L3Manager {
        let mut mgr = L3Manager::new();
        mgr.start();
        mgr.role_changed(Role::Master, MlagId::MASTER);
        mgr.set_ipl(Some(7), Some(vlan(100)));
        mgr.peer_add();
        (&mut mgr).for_each(drop);
        mgr
    }

    #[test]
    fn test_global_is_or_over_enabled_peers() {
        let mut mgr = master();
        mgr.peer_enabled(MlagId::SLAVE);

        // Local chassis reports 10 and 20; slave reports 20 and 30.
        mgr.local_vlan_change(vec![entry(10, LinkState::Up), entry(20, LinkState::Up)]);
        mgr.local_state_change(
            MlagId::SLAVE,
            &batch(vec![entry(20, LinkState::Up), entry(30, LinkState::Up)]),
        );

        for v in [10, 20, 30] {
            assert_eq!(mgr.global_state(vlan(v)), LinkState::Up, "vlan {}", v);
        }
    }

    #[test]
    fn test_peer_down_recomputes_batched_diff() {
        let mut mgr = master();
        mgr.peer_enabled(MlagId::SLAVE);
        mgr.local_vlan_change(vec![entry(10, LinkState::Up), entry(20, LinkState::Up)]);
        mgr.local_state_change(
            MlagId::SLAVE,
            &batch(vec![entry(20, LinkState::Up), entry(30, LinkState::Up)]),
        );
        (&mut mgr).for_each(drop);

        // Only 30 was up exclusively through the slave. One batched diff.
        mgr.peer_down(MlagId::SLAVE);
        assert_eq!(mgr.global_state(vlan(10)), LinkState::Up);
        assert_eq!(mgr.global_state(vlan(20)), LinkState::Up);
        assert_eq!(mgr.global_state(vlan(30)), LinkState::Down);

        // The slave is down, so nothing is written to it; membership on
        // the local side drops vlan 30.
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.contains(&Io::Driver(DriverOp::VlanMemberRemove {
            port: 7,
            vlan: vlan(30)
        })));
    }

    #[test]
    fn test_disabled_peer_reports_are_stored_not_counted() {
        let mut mgr = master();

        mgr.local_state_change(MlagId::SLAVE, &batch(vec![entry(40, LinkState::Up)]));
        assert_eq!(mgr.global_state(vlan(40)), LinkState::Down);

        // Enabling the peer folds the stored report in.
        mgr.peer_enabled(MlagId::SLAVE);
        assert_eq!(mgr.global_state(vlan(40)), LinkState::Up);
    }

    #[test]
    fn test_control_vlan_membership_is_pinned() {
        let mut mgr = master();
        mgr.peer_enabled(MlagId::SLAVE);

        // The control VLAN joined at peer add.
        assert!(mgr.membership().any(|v| v == 100));

        // A global-down diff for the control VLAN does not remove it.
        mgr.apply_global(&batch(vec![entry(100, LinkState::Down)]));
        assert!(mgr.membership().any(|v| v == 100));

        // Deleting the pairing finally releases it.
        mgr.peer_del();
        assert!(mgr.membership().next().is_none());
    }

    #[test]
    fn test_membership_follows_global_diffs() {
        let mut mgr = L3Manager::new();
        mgr.start();
        mgr.role_changed(Role::Slave, MlagId::SLAVE);
        mgr.set_ipl(Some(7), Some(vlan(100)));
        mgr.peer_add();
        (&mut mgr).for_each(drop);

        mgr.apply_global(&batch(vec![entry(10, LinkState::Up)]));
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.contains(&Io::Driver(DriverOp::VlanMemberAdd {
            port: 7,
            vlan: vlan(10)
        })));

        mgr.apply_global(&batch(vec![entry(10, LinkState::Down)]));
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.contains(&Io::Driver(DriverOp::VlanMemberRemove {
            port: 7,
            vlan: vlan(10)
        })));
    }

    #[test]
    fn test_slave_reports_to_master() {
        let mut mgr = L3Manager::new();
        mgr.start();
        mgr.role_changed(Role::Slave, MlagId::SLAVE);

        mgr.local_vlan_change(vec![entry(10, LinkState::Up)]);
        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.iter().any(|io| matches!(
            io,
            Io::Write(MlagId::MASTER, Message::VlanLocalState { .. })
        )));

        // Unchanged state is not re-reported.
        mgr.local_vlan_change(vec![entry(10, LinkState::Up)]);
        assert!((&mut mgr).next().is_none());
    }
}
