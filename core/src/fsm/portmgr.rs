//! MLAG port management.
//!
//! Tracks the aggregated ports split across the pair: their mode, their
//! local and remote operational state, and the pair-wide state derived
//! from both. Ports stay administratively disabled for the reload-delay
//! period after start, giving the IPL topology time to settle before
//! traffic is attracted.
//!
//! Deleting a port is two-phase: the bus is notified, interested
//! subsystems acknowledge, and only then is the port destroyed in the
//! driver.

use std::collections::BTreeMap;

use log::*;

use mlag_common::driver::DriverOp;
use mlag_common::message::{Message, PortMember, PortMode};
use mlag_common::peer::MlagId;
use mlag_common::time::{Clock, LocalDuration, LocalTime};
use mlag_common::{LinkState, PortId};

use super::event::{Event, Subsystem};
use super::output::{Io, Outbox};

/// Default reload-delay.
pub const DEFAULT_RELOAD_DELAY: LocalDuration = LocalDuration::from_secs(30);

/// Subsystems that must acknowledge a port delete before the record is
/// destroyed.
const DELETE_ACKS: [Subsystem; 1] = [Subsystem::MacSync];

/// Pair-wide state of an MLAG port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortGlobalState {
    /// No member is carrying traffic.
    Inactive,
    /// Only one chassis has an active member.
    ActivePartial,
    /// Both chassis have active members.
    ActiveFull,
    /// Administratively held down (reload-delay or configuration).
    Disabled,
}

impl PortGlobalState {
    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::ActivePartial => "active-partial",
            Self::ActiveFull => "active-full",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
struct Port {
    mode: PortMode,
    local_oper: LinkState,
    remote_oper: Option<LinkState>,
    admin_enabled: bool,
    global: PortGlobalState,
    /// Outstanding delete acknowledgements; non-empty means deleting.
    delete_acks: Vec<Subsystem>,
}

impl Port {
    fn new(admin_enabled: bool) -> Self {
        Self {
            mode: PortMode::Static,
            local_oper: LinkState::Down,
            remote_oper: None,
            admin_enabled,
            global: if admin_enabled {
                PortGlobalState::Inactive
            } else {
                PortGlobalState::Disabled
            },
            delete_acks: Vec::new(),
        }
    }

    fn compute_global(&self) -> PortGlobalState {
        if !self.admin_enabled {
            return PortGlobalState::Disabled;
        }
        let local = self.local_oper.is_up();
        let remote = self.remote_oper.map(|s| s.is_up()).unwrap_or(false);
        match (local, remote) {
            (true, true) => PortGlobalState::ActiveFull,
            (true, false) | (false, true) => PortGlobalState::ActivePartial,
            (false, false) => PortGlobalState::Inactive,
        }
    }
}

/// The port sub-manager.
#[derive(Debug)]
pub struct PortManager<C> {
    clock: C,
    outbox: Outbox,
    ports: BTreeMap<PortId, Port>,
    reload_delay: LocalDuration,
    /// While set, MLAG ports are held administratively down.
    gate_deadline: Option<LocalTime>,
    /// The remote chassis, once a pair is formed.
    remote: Option<MlagId>,
    my_id: MlagId,
    started: bool,
}

impl<C: Clock> Iterator for PortManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> PortManager<C> {
    /// Create an idle manager.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            outbox: Outbox::default(),
            ports: BTreeMap::new(),
            reload_delay: DEFAULT_RELOAD_DELAY,
            gate_deadline: None,
            remote: None,
            my_id: MlagId::MASTER,
            started: false,
        }
    }

    /// Begin protocol activity. Ports hold down for the reload-delay.
    pub fn start(&mut self) {
        self.started = true;

        if self.reload_delay > LocalDuration::ZERO {
            info!(
                target: "port",
                "Holding MLAG ports down for {} while topology settles", self.reload_delay
            );
            self.gate_deadline = Some(self.clock.local_time() + self.reload_delay);
            self.outbox.set_timer(self.reload_delay);

            let ports: Vec<PortId> = self.ports.keys().copied().collect();
            for port_id in ports {
                self.set_admin(port_id, false);
            }
        } else {
            self.gate_deadline = None;
        }
    }

    /// Quiesce. Port configuration survives a stop.
    pub fn stop(&mut self) {
        self.started = false;
        self.gate_deadline = None;
        self.remote = None;
        for port in self.ports.values_mut() {
            port.remote_oper = None;
        }
    }

    /// Election settled; remember who the remote chassis is.
    pub fn role_changed(&mut self, remote: Option<MlagId>, my_id: MlagId) {
        self.remote = remote;
        self.my_id = my_id;
    }

    /// Reconfigure the reload-delay.
    pub fn reload_delay_set(&mut self, delay: LocalDuration) {
        self.reload_delay = delay;
    }

    /// Check the reload-delay gate.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();
        let expired = matches!(self.gate_deadline, Some(deadline) if now >= deadline);
        if !expired {
            return;
        }
        info!(target: "port", "Reload-delay expired, enabling MLAG ports");
        self.gate_deadline = None;

        let ports: Vec<PortId> = self.ports.keys().copied().collect();
        for port_id in ports {
            self.set_admin(port_id, true);
        }
    }

    /// Create an MLAG port record.
    pub fn port_add(&mut self, port_id: PortId) -> bool {
        if self.ports.contains_key(&port_id) {
            warn!(target: "port", "Port {} already configured", port_id);
            return false;
        }
        let enabled = self.gate_deadline.is_none();
        self.ports.insert(port_id, Port::new(enabled));
        self.outbox.driver(DriverOp::PortCreate(port_id));
        if !enabled {
            self.outbox.driver(DriverOp::PortAdminSet {
                port_id,
                enabled: false,
            });
        }
        info!(target: "port", "Port {} added", port_id);
        true
    }

    /// Begin the two-phase delete of a port.
    pub fn port_delete(&mut self, port_id: PortId) -> bool {
        let Some(port) = self.ports.get_mut(&port_id) else {
            warn!(target: "port", "Delete of unknown port {}", port_id);
            return false;
        };
        if !port.delete_acks.is_empty() {
            return true;
        }
        port.delete_acks = DELETE_ACKS.to_vec();
        self.outbox.event(Event::PortDeleting { port_id });
        info!(target: "port", "Port {} deleting, waiting for acknowledgements", port_id);
        true
    }

    /// A subsystem acknowledged a pending delete.
    pub fn port_delete_ack(&mut self, port_id: PortId, subsystem: Subsystem) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        port.delete_acks.retain(|s| *s != subsystem);
        if port.delete_acks.is_empty() {
            self.ports.remove(&port_id);
            self.outbox.driver(DriverOp::PortDestroy(port_id));
            self.outbox.event(Event::PortDeleted { port_id });
            info!(target: "port", "Port {} destroyed", port_id);
        }
    }

    /// Configure a port's aggregation mode.
    pub fn port_mode_set(&mut self, port_id: PortId, mode: PortMode) -> bool {
        match self.ports.get_mut(&port_id) {
            Some(port) => {
                port.mode = mode;
                true
            }
            None => false,
        }
    }

    /// A local member changed operational state.
    pub fn local_oper_change(&mut self, port_id: PortId, state: LinkState) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        if port.local_oper == state {
            return;
        }
        port.local_oper = state;

        if let Some(remote) = self.remote {
            let my_id = self.my_id;
            self.outbox.write(
                remote,
                Message::PortOperState {
                    peer_id: my_id,
                    port_id,
                    state,
                },
            );
        }
        self.recompute(port_id);
    }

    /// The remote chassis reported a member state change.
    pub fn remote_oper_change(&mut self, port_id: PortId, state: LinkState) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            debug!(target: "port", "Remote state for unknown port {}", port_id);
            return;
        };
        port.remote_oper = Some(state);
        self.recompute(port_id);
    }

    /// Fold in the remote port table received during sync.
    pub fn apply_sync(&mut self, members: Vec<PortMember>) {
        for port in self.ports.values_mut() {
            port.remote_oper = None;
        }
        for member in members {
            if let Some(port) = self.ports.get_mut(&member.port_id) {
                port.remote_oper = Some(member.oper_state);
            } else {
                debug!(
                    target: "port",
                    "Peer has port {} which is not configured here", member.port_id
                );
            }
        }
        for port_id in self.ports.keys().copied().collect::<Vec<_>>() {
            self.recompute(port_id);
        }
    }

    /// The remote chassis went away; its member states are unknown.
    pub fn peer_down(&mut self) {
        for port in self.ports.values_mut() {
            port.remote_oper = None;
        }
        for port_id in self.ports.keys().copied().collect::<Vec<_>>() {
            self.recompute(port_id);
        }
    }

    /// The local port table, shipped with sync.
    pub fn sync_snapshot(&self) -> Message {
        Message::PortSync {
            peer_id: self.my_id,
            ports: self
                .ports
                .iter()
                .map(|(id, port)| PortMember {
                    port_id: *id,
                    mode: port.mode,
                    oper_state: port.local_oper,
                })
                .collect(),
        }
    }

    fn set_admin(&mut self, port_id: PortId, enabled: bool) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        if port.admin_enabled == enabled {
            return;
        }
        port.admin_enabled = enabled;
        self.outbox
            .driver(DriverOp::PortAdminSet { port_id, enabled });
        self.recompute(port_id);
    }

    fn recompute(&mut self, port_id: PortId) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        let state = port.compute_global();
        if state == port.global {
            return;
        }
        port.global = state;
        info!(target: "port", "Port {} is {}", port_id, state.as_str());
        self.outbox
            .event(Event::PortGlobalStateChanged { port_id, state });
    }

    /// Pair-wide state of a port.
    pub fn global_state(&self, port_id: PortId) -> Option<PortGlobalState> {
        self.ports.get(&port_id).map(|p| p.global)
    }

    /// Number of configured ports.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no port is configured.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Iterate over the port table, for dumps.
    pub fn iter(&self) -> impl Iterator<Item = (PortId, PortMode, LinkState, PortGlobalState)> + '_ {
        self.ports
            .iter()
            .map(|(id, p)| (*id, p.mode, p.local_oper, p.global))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlag_common::time::{LocalTime, RefClock};

    fn manager() -> (PortManager<RefClock>, RefClock) {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = PortManager::new(clock.clone());
        mgr.reload_delay_set(LocalDuration::ZERO);
        mgr.start();
        mgr.role_changed(Some(MlagId::SLAVE), MlagId::MASTER);
        (mgr, clock)
    }

    #[test]
    fn test_global_state_aggregation() {
        let (mut mgr, _) = manager();
        mgr.port_add(42);

        assert_eq!(mgr.global_state(42), Some(PortGlobalState::Inactive));

        mgr.local_oper_change(42, LinkState::Up);
        assert_eq!(mgr.global_state(42), Some(PortGlobalState::ActivePartial));

        mgr.remote_oper_change(42, LinkState::Up);
        assert_eq!(mgr.global_state(42), Some(PortGlobalState::ActiveFull));

        mgr.peer_down();
        assert_eq!(mgr.global_state(42), Some(PortGlobalState::ActivePartial));
    }

    #[test]
    fn test_local_change_is_reported_to_peer() {
        let (mut mgr, _) = manager();
        mgr.port_add(42);
        (&mut mgr).for_each(drop);

        mgr.local_oper_change(42, LinkState::Up);
        assert!((&mut mgr).any(|io| matches!(
            io,
            Io::Write(
                MlagId::SLAVE,
                Message::PortOperState {
                    port_id: 42,
                    state: LinkState::Up,
                    ..
                }
            )
        )));
    }

    #[test]
    fn test_reload_delay_gates_ports() {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = PortManager::new(clock.clone());
        mgr.port_add(42);
        mgr.start();

        mgr.local_oper_change(42, LinkState::Up);
        assert_eq!(mgr.global_state(42), Some(PortGlobalState::Disabled));

        clock.elapse(DEFAULT_RELOAD_DELAY);
        mgr.timer_expired();
        assert_eq!(mgr.global_state(42), Some(PortGlobalState::ActivePartial));

        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.contains(&Io::Driver(DriverOp::PortAdminSet {
            port_id: 42,
            enabled: true
        })));
    }

    #[test]
    fn test_two_phase_delete() {
        let (mut mgr, _) = manager();
        mgr.port_add(42);
        (&mut mgr).for_each(drop);

        assert!(mgr.port_delete(42));
        assert_eq!(mgr.len(), 1);
        assert!((&mut mgr).any(|io| matches!(
            io,
            Io::Event(Event::PortDeleting { port_id: 42 })
        )));

        mgr.port_delete_ack(42, Subsystem::MacSync);
        assert_eq!(mgr.len(), 0);

        let io: Vec<_> = (&mut mgr).collect();
        assert!(io.contains(&Io::Driver(DriverOp::PortDestroy(42))));
        assert!(io.contains(&Io::Event(Event::PortDeleted { port_id: 42 })));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let (mut mgr, _) = manager();
        assert!(mgr.port_add(42));
        assert!(!mgr.port_add(42));
    }
}
