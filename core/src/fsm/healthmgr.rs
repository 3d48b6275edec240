//! Peer health subsystem.
//!
//! Hosts the keepalive engine and one five-state FSM per peer. The FSM is a
//! pure transition function; this module's [`HealthManager`] executes the
//! resulting actions, keeps the IPL and management link tables, and
//! publishes `PeerStateChanged` events for the rest of the daemon.

use log::*;

use mlag_common::message::HeartbeatPayload;
use mlag_common::peer::{HealthState, MlagId, PeerIndex, SystemId};
use mlag_common::time::{Clock, LocalDuration, LocalTime};
use mlag_common::topology::{IfIndex, IplId};
use mlag_common::{LinkState, MAX_IPLS, MAX_PEERS};

use super::event::{Event, Subsystem};
use super::heartbeat::{self, Heartbeat};
use super::output::{Io, Outbox};

/// How long a peer may sit in `DownWait` before communications are
/// declared lost.
pub const DOWN_WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);

/// Default keepalive interval.
pub const DEFAULT_KEEPALIVE: LocalDuration = LocalDuration::from_secs(1);

/// The per-peer health state machine, kept free of side effects so the
/// transition table can be tested directly.
pub mod transition {
    use super::*;

    /// FSM state.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub enum State {
        /// No peer configured in this slot.
        #[default]
        Idle,
        /// Peer configured but unreachable.
        PeerDown,
        /// Communications lost while management still saw the peer.
        CommDown,
        /// Fully reachable.
        PeerUp,
        /// Communications just dropped; waiting before declaring loss.
        DownWait,
    }

    /// FSM input.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Input {
        /// Peer configured on the given IPL.
        PeerAdd(IplId),
        /// Peer deconfigured.
        PeerDel,
        /// Heartbeat came up.
        KaUp,
        /// Heartbeat went down.
        KaDown,
        /// Management link came up.
        MgmtUp,
        /// Management link went down.
        MgmtDown,
        /// The IPL port changed operational state.
        IplChange,
        /// Election settled; observers want the current state re-announced.
        RoleChange,
        /// The `DownWait` period expired.
        Timer,
    }

    /// Link conditions sampled at the moment of the transition. `ka` is the
    /// FSM's cached heartbeat state, not the engine's.
    #[derive(Debug, Copy, Clone)]
    pub struct Guards {
        /// Cached heartbeat state.
        pub ka: LinkState,
        /// Operational state of the peer's IPL port.
        pub ipl: LinkState,
        /// Management link state for the peer.
        pub mgmt: LinkState,
    }

    /// Side effect requested by a transition. Entry notifications are the
    /// executor's job; these are the explicit reactions only.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Action {
        /// Update the cached heartbeat state.
        SetKa(LinkState),
        /// Remember which IPL the peer is reached through.
        RecordIpl(IplId),
        /// Announce a health state (the current one, re-announced).
        Notify(HealthState),
        /// Announce a state that is only being passed through.
        NotifyPassing(HealthState),
    }

    /// Apply one input. Returns the next state and the reactions to run.
    /// Inputs without a matching row leave the state untouched.
    pub fn step(state: State, input: Input, g: Guards) -> (State, Vec<Action>) {
        use Action::*;
        use Input::*;
        use LinkState::{Down, Up};
        use State::*;

        match (state, input) {
            (Idle, PeerAdd(ipl)) => (PeerDown, vec![RecordIpl(ipl)]),

            (PeerDown, PeerDel) => (Idle, vec![Notify(HealthState::Down)]),
            (PeerDown, MgmtUp) if g.ka == Up && g.ipl == Up => (PeerUp, vec![]),
            (PeerDown, MgmtUp) => (PeerDown, vec![]),
            (PeerDown, MgmtDown) => (PeerDown, vec![]),
            (PeerDown, KaUp) if g.mgmt == Up && g.ipl == Up => (PeerUp, vec![SetKa(Up)]),
            (PeerDown, KaUp) => (PeerDown, vec![SetKa(Up)]),
            (PeerDown, IplChange) if g.ipl == Up && g.ka == Up && g.mgmt == Up => {
                (PeerUp, vec![])
            }
            (PeerDown, IplChange) => (PeerDown, vec![]),
            (PeerDown, RoleChange) => (PeerDown, vec![Notify(HealthState::Down)]),

            (CommDown, PeerDel) => (Idle, vec![Notify(HealthState::Down)]),
            (CommDown, MgmtUp) if g.ka == Up && g.ipl == Up => (PeerUp, vec![]),
            (CommDown, MgmtUp) => (CommDown, vec![]),
            (CommDown, KaUp) if g.mgmt == Up && g.ipl == Up => (PeerUp, vec![SetKa(Up)]),
            (CommDown, KaUp) => (CommDown, vec![SetKa(Up)]),
            (CommDown, MgmtDown) => (PeerDown, vec![]),
            (CommDown, IplChange) if g.ipl == Up && g.ka == Up && g.mgmt == Up => {
                (PeerUp, vec![])
            }
            (CommDown, IplChange) => (CommDown, vec![]),
            (CommDown, RoleChange) => (CommDown, vec![Notify(HealthState::CommDown)]),

            (PeerUp, PeerDel) => (Idle, vec![Notify(HealthState::Down)]),
            (PeerUp, MgmtUp) => (PeerUp, vec![]),
            (PeerUp, MgmtDown) => (PeerUp, vec![]),
            (PeerUp, KaDown) if g.mgmt == Down => (PeerDown, vec![SetKa(Down)]),
            (PeerUp, KaDown) => (DownWait, vec![SetKa(Down)]),
            (PeerUp, IplChange) if g.ipl == Down && g.mgmt == Down => (PeerDown, vec![]),
            (PeerUp, IplChange) if g.ipl == Down => (DownWait, vec![]),
            (PeerUp, IplChange) => (PeerUp, vec![]),
            (PeerUp, RoleChange) => (PeerUp, vec![Notify(HealthState::Up)]),

            (DownWait, PeerDel) => (Idle, vec![Notify(HealthState::Down)]),
            (DownWait, MgmtDown) => (PeerDown, vec![]),
            (DownWait, KaDown) => (DownWait, vec![SetKa(Down)]),
            (DownWait, KaUp) if g.ipl == Up => {
                (PeerUp, vec![SetKa(Up), NotifyPassing(HealthState::CommDown)])
            }
            (DownWait, IplChange) if g.ipl == Down => (DownWait, vec![]),
            (DownWait, IplChange) if g.ipl == Up && g.ka == Up => {
                (PeerUp, vec![NotifyPassing(HealthState::CommDown)])
            }
            (DownWait, Timer) => (CommDown, vec![]),

            // Anything else is not consumed.
            (state, _) => (state, vec![]),
        }
    }

    /// The health state announced when entering a state, if any.
    pub fn entry_notification(state: State) -> Option<HealthState> {
        match state {
            State::Idle => None,
            State::PeerDown => Some(HealthState::Down),
            State::CommDown => Some(HealthState::CommDown),
            State::PeerUp => Some(HealthState::Up),
            State::DownWait => Some(HealthState::DownWait),
        }
    }
}

use transition::{Action, Guards, Input, State};

#[derive(Debug, Clone, Default)]
struct Slot {
    state: State,
    /// Heartbeat state as the FSM last recorded it.
    ka: LinkState,
    ipl_id: IplId,
    mlag_id: Option<MlagId>,
    down_wait_deadline: Option<LocalTime>,
}

/// Collects heartbeat engine effects so the manager can fold them into its
/// own state after the engine call returns.
#[derive(Debug, Default)]
struct Effects {
    edges: Vec<(PeerIndex, SystemId, heartbeat::State)>,
    sends: Vec<(PeerIndex, HeartbeatPayload)>,
}

impl heartbeat::Hooks for Effects {
    fn state_change(&mut self, peer: PeerIndex, system_id: SystemId, state: heartbeat::State) {
        self.edges.push((peer, system_id, state));
    }

    fn send(&mut self, peer: PeerIndex, payload: HeartbeatPayload) -> Result<(), ()> {
        self.sends.push((peer, payload));
        Ok(())
    }
}

/// The health subsystem machine.
#[derive(Debug)]
pub struct HealthManager<C> {
    clock: C,
    outbox: Outbox,
    heartbeat: Heartbeat,
    slots: [Slot; MAX_PEERS],
    ipl_states: [LinkState; MAX_IPLS],
    ipl_ports: [Option<IfIndex>; MAX_IPLS],
    /// Management reachability per peer. Assumed up until the management
    /// plane reports otherwise.
    mgmt_states: [LinkState; MAX_PEERS],
    keepalive: LocalDuration,
    started: bool,
}

impl<C: Clock> Iterator for HealthManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> HealthManager<C> {
    /// Create an idle health subsystem.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            outbox: Outbox::default(),
            heartbeat: Heartbeat::new(0),
            slots: Default::default(),
            ipl_states: [LinkState::Down; MAX_IPLS],
            ipl_ports: [None; MAX_IPLS],
            mgmt_states: [LinkState::Up; MAX_PEERS],
            keepalive: DEFAULT_KEEPALIVE,
            started: false,
        }
    }

    /// Begin protocol activity, advertising `system_id` to peers.
    pub fn start(&mut self, system_id: SystemId) {
        info!(target: "health", "Starting, system id {:#x}", system_id);

        self.heartbeat.set_system_id(system_id);
        self.heartbeat.start();
        self.started = true;
    }

    /// Quiesce: one final defect datagram per peer, FSMs reset without
    /// intermediate notifications, timers dropped.
    pub fn stop(&mut self) {
        info!(target: "health", "Stopping");

        let mut effects = Effects::default();
        self.heartbeat.stop(&mut effects);
        for (peer, payload) in effects.sends {
            self.outbox.heartbeat(peer, payload);
        }

        for slot in &mut self.slots {
            if slot.state != State::Idle {
                slot.state = State::PeerDown;
            }
            slot.ka = LinkState::Down;
            slot.down_wait_deadline = None;
        }
        self.started = false;

        self.outbox.event(Event::StopDone {
            subsystem: Subsystem::Health,
        });
    }

    /// Current keepalive interval.
    pub fn keepalive(&self) -> LocalDuration {
        self.keepalive
    }

    /// Force the local-defect flag, pushing the remote side down.
    pub fn set_local_defect(&mut self, defect: bool) {
        self.heartbeat.set_local_defect(defect);
    }

    /// A keepalive datagram arrived for `peer`.
    pub fn datagram_received(&mut self, peer: PeerIndex, datagram: &[u8]) {
        let payload = match HeartbeatPayload::from_bytes(datagram) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(target: "health", "Dropping malformed datagram from peer {}: {}", peer, err);
                return;
            }
        };

        let mut effects = Effects::default();
        if let Err(err) = self.heartbeat.recv(peer, &payload, &mut effects) {
            warn!(target: "health", "Heartbeat receive: {}", err);
            return;
        }
        self.apply_effects(effects);
    }

    /// The keepalive interval elapsed.
    pub fn tick(&mut self) {
        let mut effects = Effects::default();
        self.heartbeat.tick(&mut effects);
        self.apply_effects(effects);
    }

    /// A datagram queued earlier failed to send.
    pub fn datagram_send_failed(&mut self, peer: PeerIndex) {
        self.heartbeat.record_tx_error(peer);
    }

    /// Check `DownWait` deadlines against the clock.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();

        for peer in 0..MAX_PEERS {
            let expired = matches!(
                self.slots[peer].down_wait_deadline,
                Some(deadline) if now >= deadline
            );
            if expired {
                self.slots[peer].down_wait_deadline = None;
                self.apply(peer, Input::Timer);
            }
        }
    }

    /// React to a bus event.
    pub fn received_event(&mut self, event: &Event) {
        match event {
            Event::Started { system_id } => self.start(*system_id),
            Event::Stop => self.stop(),
            Event::PeerAdded { peer, ipl, .. } => self.peer_add(*peer, *ipl),
            Event::PeerRemoved { peer } => self.peer_remove(*peer),
            Event::MgmtStateChanged { system_id, state } => {
                self.mgmt_state_change(*system_id, *state)
            }
            Event::PortOperStateChanged {
                port_id,
                is_ipl: true,
                state,
            } => self.ipl_port_state_change(*port_id, *state),
            Event::IplPortBound { ipl, port } => self.ipl_port_bound(*ipl, *port),
            Event::RoleChanged(change) => self.role_change(change),
            Event::KeepaliveIntervalChanged(interval) => {
                debug!(target: "health", "Keepalive interval set to {}", interval);
                self.keepalive = *interval;
            }
            _ => {}
        }
    }

    fn peer_add(&mut self, peer: PeerIndex, ipl: IplId) {
        info!(target: "health", "Monitoring peer {} on IPL {}", peer, ipl);

        if let Err(err) = self.heartbeat.peer_add(peer) {
            error!(target: "health", "Peer add: {}", err);
            return;
        }
        self.apply(peer, Input::PeerAdd(ipl));
    }

    fn peer_remove(&mut self, peer: PeerIndex) {
        info!(target: "health", "Unmonitoring peer {}", peer);

        if let Err(err) = self.heartbeat.peer_remove(peer) {
            error!(target: "health", "Peer remove: {}", err);
            return;
        }
        self.apply(peer, Input::PeerDel);
        self.slots[peer] = Slot::default();
    }

    fn mgmt_state_change(&mut self, system_id: SystemId, state: LinkState) {
        let peer = (0..MAX_PEERS).find(|&p| {
            self.slots[p].state != State::Idle && self.heartbeat.peer_system_id(p) == Some(system_id)
        });
        let Some(peer) = peer else {
            debug!(
                target: "health",
                "Management state for unknown system {:#x} ignored", system_id
            );
            return;
        };

        self.mgmt_states[peer] = state;
        self.apply(
            peer,
            match state {
                LinkState::Up => Input::MgmtUp,
                LinkState::Down => Input::MgmtDown,
            },
        );
    }

    /// Remember which port carries an IPL, so oper-state callbacks can be
    /// routed back to it.
    pub fn ipl_port_bound(&mut self, ipl: IplId, port: Option<IfIndex>) {
        if let Some(slot) = self.ipl_ports.get_mut(ipl) {
            *slot = port;
            if port.is_none() {
                self.ipl_states[ipl] = LinkState::Down;
            }
        }
    }

    fn ipl_port_state_change(&mut self, port_id: u64, state: LinkState) {
        let Some(ipl) = (0..MAX_IPLS).find(|&i| self.ipl_ports[i] == Some(port_id as IfIndex))
        else {
            debug!(target: "health", "Oper state for unbound IPL port {} ignored", port_id);
            return;
        };
        if self.ipl_states[ipl] == state {
            return;
        }
        info!(target: "health", "IPL {} went {}", ipl, state.as_str());
        self.ipl_states[ipl] = state;

        for peer in 0..MAX_PEERS {
            if self.slots[peer].state != State::Idle && self.slots[peer].ipl_id == ipl {
                self.apply(peer, Input::IplChange);
            }
        }
    }

    fn role_change(&mut self, change: &super::event::RoleChange) {
        // Once a role is known, peers gain their protocol-wide id and
        // health notifications become addressable. A lapse to standalone
        // keeps the last known ids, so loss notifications still carry
        // them.
        let remote_id = match change.current {
            mlag_common::peer::Role::Standalone => None,
            _ => Some(MlagId(1 - change.my_peer_id.0)),
        };
        for peer in 0..MAX_PEERS {
            if self.slots[peer].state != State::Idle {
                if remote_id.is_some() {
                    self.slots[peer].mlag_id = remote_id;
                }
                self.apply(peer, Input::RoleChange);
            }
        }
    }

    fn apply_effects(&mut self, effects: Effects) {
        for (peer, payload) in effects.sends {
            self.outbox.heartbeat(peer, payload);
        }
        for (peer, system_id, state) in effects.edges {
            let state = match state {
                heartbeat::State::Up => LinkState::Up,
                _ => LinkState::Down,
            };
            self.outbox.event(Event::HeartbeatStateChanged {
                peer,
                system_id,
                state,
            });
            self.apply(
                peer,
                match state {
                    LinkState::Up => Input::KaUp,
                    LinkState::Down => Input::KaDown,
                },
            );
        }
    }

    fn apply(&mut self, peer: PeerIndex, input: Input) {
        let slot = &self.slots[peer];
        let guards = Guards {
            ka: slot.ka,
            ipl: self.ipl_states.get(slot.ipl_id).copied().unwrap_or(LinkState::Down),
            mgmt: self.mgmt_states[peer],
        };
        let current = slot.state;
        let (next, actions) = transition::step(current, input, guards);

        for action in actions {
            match action {
                Action::SetKa(state) => self.slots[peer].ka = state,
                Action::RecordIpl(ipl) => self.slots[peer].ipl_id = ipl,
                Action::Notify(state) => self.notify(peer, state, false),
                Action::NotifyPassing(state) => self.notify(peer, state, true),
            }
        }

        if next != current {
            debug!(
                target: "health",
                "Peer {}: {:?} -> {:?} on {:?}", peer, current, next, input
            );
            if current == State::Idle {
                self.slots[peer].ka = LinkState::Down;
            }
            if current == State::DownWait {
                self.slots[peer].down_wait_deadline = None;
            }
            self.slots[peer].state = next;

            if next == State::DownWait {
                let deadline = self.clock.local_time() + DOWN_WAIT_TIMEOUT;
                self.slots[peer].down_wait_deadline = Some(deadline);
                self.outbox.set_timer(DOWN_WAIT_TIMEOUT);
            }
            if let Some(state) = transition::entry_notification(next) {
                self.notify(peer, state, false);
            }
        }
    }

    fn notify(&mut self, peer: PeerIndex, state: HealthState, passing: bool) {
        // Peers without an elected id are not announceable yet.
        let Some(mlag_id) = self.slots[peer].mlag_id else {
            debug!(
                target: "health",
                "Peer {} is {} but has no mlag id, notification suppressed", peer, state
            );
            return;
        };
        info!(target: "health", "Peer {} ({}) is {}", peer, mlag_id, state);
        self.outbox.event(Event::PeerStateChanged {
            mlag_id,
            state,
            passing,
        });
    }

    /// Health state of every peer slot.
    pub fn peer_states(&self) -> [HealthState; MAX_PEERS] {
        let mut states = [HealthState::NotExist; MAX_PEERS];
        for (state, slot) in states.iter_mut().zip(&self.slots) {
            *state = match slot.state {
                State::Idle => HealthState::NotExist,
                State::PeerDown => HealthState::Down,
                State::CommDown => HealthState::CommDown,
                State::PeerUp => HealthState::Up,
                State::DownWait => HealthState::DownWait,
            };
        }
        states
    }

    /// Heartbeat statistics for a peer slot.
    pub fn heartbeat_stats(&self, peer: PeerIndex) -> Option<heartbeat::Stats> {
        self.heartbeat.stats(peer).ok()
    }

    /// Clear heartbeat statistics on every slot.
    pub fn stats_clear(&mut self) {
        for peer in 0..MAX_PEERS {
            self.heartbeat.stats_clear(peer).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transition::*;
    use super::*;
    use mlag_common::peer::Role;
    use mlag_common::time::RefClock;

    use super::super::event::RoleChange;

    fn guards(ka: LinkState, ipl: LinkState, mgmt: LinkState) -> Guards {
        Guards { ka, ipl, mgmt }
    }

    #[test]
    fn test_table_reachability() {
        use LinkState::{Down, Up};

        // Fully reachable peer comes up on heartbeat.
        let (next, actions) = step(State::PeerDown, Input::KaUp, guards(Down, Up, Up));
        assert_eq!(next, State::PeerUp);
        assert_eq!(actions, vec![Action::SetKa(Up)]);

        // IPL down keeps it peer-down, heartbeat cache still updates.
        let (next, actions) = step(State::PeerDown, Input::KaUp, guards(Down, Down, Up));
        assert_eq!(next, State::PeerDown);
        assert_eq!(actions, vec![Action::SetKa(Up)]);
    }

    #[test]
    fn test_table_ka_loss_splits_on_mgmt() {
        use LinkState::{Down, Up};

        // Management also lost: the peer is gone.
        let (next, _) = step(State::PeerUp, Input::KaDown, guards(Up, Up, Down));
        assert_eq!(next, State::PeerDown);

        // Management still sees it: wait before declaring loss.
        let (next, _) = step(State::PeerUp, Input::KaDown, guards(Up, Up, Up));
        assert_eq!(next, State::DownWait);
    }

    #[test]
    fn test_table_down_wait_recovery_notifies_comm_down_first() {
        use LinkState::Up;

        let (next, actions) = step(State::DownWait, Input::KaUp, guards(LinkState::Down, Up, Up));
        assert_eq!(next, State::PeerUp);
        assert_eq!(
            actions,
            vec![
                Action::SetKa(Up),
                Action::NotifyPassing(HealthState::CommDown)
            ]
        );
    }

    #[test]
    fn test_table_down_wait_timeout() {
        let (next, actions) = step(
            State::DownWait,
            Input::Timer,
            guards(LinkState::Down, LinkState::Down, LinkState::Up),
        );
        assert_eq!(next, State::CommDown);
        assert!(actions.is_empty());
    }

    fn converge(mgr: &mut HealthManager<RefClock>) {
        mgr.received_event(&Event::Started { system_id: 0x1 });
        mgr.received_event(&Event::PeerAdded {
            peer: 0,
            ipl: 0,
            addr: std::net::Ipv4Addr::new(10, 0, 0, 2),
            vlan: mlag_common::topology::VlanId::new(100).unwrap(),
        });
        mgr.ipl_port_bound(0, Some(7));
        mgr.received_event(&Event::PortOperStateChanged {
            port_id: 7,
            is_ipl: true,
            state: LinkState::Up,
        });
        for seq in 1..=3 {
            mgr.datagram_received(
                0,
                &HeartbeatPayload {
                    system_id: 0x2,
                    sequence: seq,
                    local_defect: false,
                    remote_defect: false,
                }
                .to_bytes(),
            );
        }
    }

    fn events(mgr: &mut HealthManager<RefClock>) -> Vec<Event> {
        mgr.filter_map(|io| match io {
            Io::Event(e) => Some(e),
            _ => None,
        })
        .collect()
    }

    #[test]
    fn test_manager_converges_to_peer_up() {
        let mut mgr = HealthManager::new(RefClock::new(LocalTime::from_secs(1)));
        converge(&mut mgr);

        assert_eq!(mgr.peer_states()[0], HealthState::Up);

        // Without an elected id, no peer-state notification is published,
        // but heartbeat edges are.
        let events = events(&mut mgr);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::HeartbeatStateChanged { state: LinkState::Up, .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::PeerStateChanged { .. })));
    }

    #[test]
    fn test_manager_notifies_once_role_is_known() {
        let mut mgr = HealthManager::new(RefClock::new(LocalTime::from_secs(1)));
        converge(&mut mgr);
        events(&mut mgr);

        mgr.received_event(&Event::RoleChanged(RoleChange {
            current: Role::Master,
            previous: Role::Standalone,
            my_addr: None,
            peer_addr: None,
            my_peer_id: MlagId::MASTER,
            master_peer_id: MlagId::MASTER,
        }));

        let events = events(&mut mgr);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PeerStateChanged {
                mlag_id: MlagId::SLAVE,
                state: HealthState::Up,
                ..
            }
        )));
    }

    #[test]
    fn test_down_wait_expiry_reaches_comm_down() {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = HealthManager::new(clock.clone());
        converge(&mut mgr);

        // Heartbeat times out while management still sees the peer.
        for _ in 0..=heartbeat::MESSAGE_THRESHOLD {
            mgr.tick();
        }
        assert_eq!(mgr.peer_states()[0], HealthState::DownWait);

        clock.elapse(DOWN_WAIT_TIMEOUT);
        mgr.timer_expired();
        assert_eq!(mgr.peer_states()[0], HealthState::CommDown);
    }

    #[test]
    fn test_ipl_flap_avoids_comm_down() {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = HealthManager::new(clock.clone());
        converge(&mut mgr);

        mgr.received_event(&Event::PortOperStateChanged {
            port_id: 7,
            is_ipl: true,
            state: LinkState::Down,
        });
        assert_eq!(mgr.peer_states()[0], HealthState::DownWait);

        // Port returns before the settle period runs out.
        clock.elapse(LocalDuration::from_secs(10));
        mgr.received_event(&Event::PortOperStateChanged {
            port_id: 7,
            is_ipl: true,
            state: LinkState::Up,
        });
        assert_eq!(mgr.peer_states()[0], HealthState::Up);

        // The stale deadline must not fire later.
        clock.elapse(DOWN_WAIT_TIMEOUT);
        mgr.timer_expired();
        assert_eq!(mgr.peer_states()[0], HealthState::Up);
    }

    #[test]
    fn test_stop_suppresses_intermediate_notifications() {
        let mut mgr = HealthManager::new(RefClock::new(LocalTime::from_secs(1)));
        converge(&mut mgr);

        // With a role assigned, notifications are addressable; the stop
        // path must still not emit any.
        mgr.received_event(&Event::RoleChanged(RoleChange {
            current: Role::Master,
            previous: Role::Standalone,
            my_addr: None,
            peer_addr: None,
            my_peer_id: MlagId::MASTER,
            master_peer_id: MlagId::MASTER,
        }));
        events(&mut mgr);

        mgr.received_event(&Event::Stop);

        let drained: Vec<_> = (&mut mgr).collect();
        assert!(drained.iter().any(|io| matches!(
            io,
            Io::Event(Event::StopDone {
                subsystem: Subsystem::Health
            })
        )));
        assert!(!drained
            .iter()
            .any(|io| matches!(io, Io::Event(Event::PeerStateChanged { .. }))));
        // The farewell datagram carries the local-defect flag.
        assert!(drained.iter().any(|io| matches!(
            io,
            Io::Heartbeat(_, HeartbeatPayload { local_defect: true, .. })
        )));
    }
}
