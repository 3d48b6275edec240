//! Two-chassis protocol scenarios.
//!
//! Each test builds a pair of simulated chassis (a health machine and a
//! manager machine per side, on manually advanced clocks) and shuttles
//! the machines' I/O between them: heartbeat datagrams over a lossy "UDP"
//! link, control messages over a connectable "TCP" channel (with a real
//! encode/decode round-trip), and driver ops into a per-node log.

use std::net::Ipv4Addr;

use crossbeam_channel as chan;

use mlag_common::driver::DriverOp;
use mlag_common::message::{
    Decode, Encode, HeartbeatPayload, Message, SelectionResponse, VlanStateEntry,
};
use mlag_common::peer::{HealthState, MlagId, Role};
use mlag_common::time::{LocalDuration, LocalTime, RefClock};
use mlag_common::topology::{IfIndex, VlanId};
use mlag_common::LinkState;

use super::event::{Event, Subsystem};
use super::healthmgr::{HealthManager, DOWN_WAIT_TIMEOUT};
use super::output::Io;
use super::{Command, Features, StateMachine};

const IPL_PORT: u64 = 7;
const IPL_VLAN: u16 = 100;
const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

struct Node {
    clock: RefClock,
    health: HealthManager<RefClock>,
    manager: StateMachine<RefClock>,
    driver_ops: Vec<DriverOp>,
    events: Vec<Event>,
    heartbeats_sent: Vec<HeartbeatPayload>,
    listening: bool,
    dialing: bool,
}

impl Node {
    fn new(addr: Ipv4Addr, peer: Ipv4Addr, system_id: u64) -> Self {
        let clock = RefClock::new(LocalTime::from_secs(100));
        let mut node = Self {
            clock: clock.clone(),
            health: HealthManager::new(clock.clone()),
            manager: StateMachine::new(clock),
            driver_ops: Vec::new(),
            events: Vec::new(),
            heartbeats_sent: Vec::new(),
            listening: false,
            dialing: false,
        };

        let (tx, rx) = chan::unbounded();
        node.manager.command(Command::IplCreate(tx));
        let ipl = rx.recv().unwrap().unwrap();

        let (tx, rx) = chan::unbounded();
        node.manager
            .command(Command::IplPortSet(ipl, Some(IPL_PORT as IfIndex), tx));
        rx.recv().unwrap().unwrap();

        let (tx, rx) = chan::unbounded();
        node.manager.command(Command::IplIpSet {
            ipl,
            vlan: Some(VlanId::new(IPL_VLAN).unwrap()),
            local: Some(addr),
            peer: Some(peer),
            reply: tx,
        });
        rx.recv().unwrap().unwrap();

        node.manager.command(Command::Start {
            system_id,
            features: Features::default(),
        });
        node
    }

    fn my_id(&self) -> MlagId {
        match self.manager.role() {
            Role::Slave => MlagId::SLAVE,
            _ => MlagId::MASTER,
        }
    }

    fn lacp_request(&mut self, request_id: u32, port_id: u64, partner: u64, key: u16, force: bool) {
        self.manager.command(Command::LacpSelectionRequest {
            request_id,
            port_id,
            partner_id: partner,
            partner_key: key,
            force,
        });
    }

    fn responses(&self) -> Vec<(u32, SelectionResponse, u64, u16)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::AggregatorResponse {
                    request_id,
                    response,
                    partner_id,
                    partner_key,
                    ..
                } => Some((*request_id, *response, *partner_id, *partner_key)),
                _ => None,
            })
            .collect()
    }

    fn releases(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::AggregatorReleased { port_id } => Some(*port_id),
                _ => None,
            })
            .collect()
    }
}

struct World {
    a: Node,
    b: Node,
    udp_up: bool,
    ipl_up: bool,
    connected: bool,
}

impl World {
    fn new() -> Self {
        let mut world = Self {
            a: Node::new(ADDR_A, ADDR_B, 0xaaaa),
            b: Node::new(ADDR_B, ADDR_A, 0xbbbb),
            udp_up: true,
            ipl_up: false,
            connected: false,
        };
        // Configuration events must reach the health machines before the
        // port state does.
        world.pump();
        world.set_ipl(true);
        world
    }

    /// Flip the IPL port state on both chassis. A down IPL also severs
    /// the heartbeat path and the channel.
    fn set_ipl(&mut self, up: bool) {
        self.ipl_up = up;
        let event = Event::PortOperStateChanged {
            port_id: IPL_PORT,
            is_ipl: true,
            state: if up { LinkState::Up } else { LinkState::Down },
        };
        for node in [&mut self.a, &mut self.b] {
            node.health.received_event(&event);
            node.manager.received_event(&event);
        }
        if !up {
            self.sever();
        }
        self.pump();
    }

    fn sever(&mut self) {
        if self.connected {
            self.connected = false;
            self.a
                .manager
                .peer_disconnected(super::DisconnectReason::Command);
            self.b
                .manager
                .peer_disconnected(super::DisconnectReason::Command);
        }
    }

    /// Drain both machines, routing their I/O, until everything settles.
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut quiet = true;
            for side in [0, 1] {
                let io: Vec<Io> = {
                    let node = if side == 0 { &mut self.a } else { &mut self.b };
                    let mut io: Vec<Io> = (&mut node.health).collect();
                    io.extend(&mut node.manager);
                    io
                };
                if !io.is_empty() {
                    quiet = false;
                }
                for item in io {
                    self.route(side, item);
                }
                self.try_connect();
            }
            if quiet {
                return;
            }
        }
        panic!("world did not settle");
    }

    fn route(&mut self, side: usize, io: Io) {
        let from = if side == 0 {
            self.a.my_id()
        } else {
            self.b.my_id()
        };
        let (node, other) = if side == 0 {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        };

        match io {
            Io::Event(event) => {
                node.events.push(event.clone());
                node.health.received_event(&event);
                node.manager.received_event(&event);

                // The runtime's stand-in FDB collaborator: nothing to
                // export, acknowledge immediately.
                if let Event::FdbExportRequest { peer } = event {
                    node.manager.command(Command::FdbSyncDone(peer));
                }
            }
            Io::Heartbeat(_, payload) => {
                node.heartbeats_sent.push(payload);
                if self.udp_up && self.ipl_up {
                    other.health.datagram_received(0, &payload.to_bytes());
                }
            }
            Io::Write(_, message) => {
                if self.connected {
                    // Round-trip through the wire form, as the channel
                    // would.
                    let bytes = message.to_vec();
                    let decoded = Message::from_slice(&bytes).expect("codec round-trips");
                    other.manager.message_received(from, decoded);
                }
            }
            Io::Driver(op) => node.driver_ops.push(op),
            Io::Listen => {
                node.listening = true;
                node.dialing = false;
            }
            Io::Connect(_) => {
                node.dialing = true;
                node.listening = false;
            }
            Io::HangUp(_) => {
                node.listening = false;
                node.dialing = false;
                self.sever();
            }
            Io::SetTimer(_) => {}
        }
    }

    fn try_connect(&mut self) {
        if self.connected || !self.ipl_up {
            return;
        }
        let can = (self.a.listening && self.b.dialing) || (self.b.listening && self.a.dialing);
        if can {
            self.connected = true;
            self.a.manager.peer_connected();
            self.b.manager.peer_connected();
        }
    }

    /// Advance both chassis by whole keepalive intervals.
    fn tick(&mut self, seconds: u64) {
        for _ in 0..seconds {
            for node in [&mut self.a, &mut self.b] {
                node.clock.elapse(LocalDuration::from_secs(1));
            }
            self.a.health.tick();
            self.b.health.tick();
            self.pump();
            self.a.health.timer_expired();
            self.b.health.timer_expired();
            self.a.manager.timer_expired();
            self.b.manager.timer_expired();
            self.pump();
        }
    }

    fn converged() -> Self {
        let mut world = Self::new();
        world.tick(4);

        assert_eq!(world.a.manager.role(), Role::Master);
        assert_eq!(world.b.manager.role(), Role::Slave);
        world
    }
}

#[test]
fn test_two_peer_converge() {
    let mut world = World::converged();

    assert_eq!(world.a.health.peer_states()[0], HealthState::Up);
    assert_eq!(world.b.health.peer_states()[0], HealthState::Up);

    // Every subsystem reported sync done and the slave reached enable.
    let sync_done = world
        .a
        .events
        .iter()
        .filter(|e| matches!(e, Event::SyncDone { .. }))
        .count();
    assert_eq!(sync_done, 4);
    assert!(world.a.events.contains(&Event::PeerEnabled {
        peer: MlagId::SLAVE
    }));

    // Heartbeat counters move in both directions.
    let stats = world.a.health.heartbeat_stats(0).unwrap();
    assert!(stats.tx_heartbeat >= 3);
    assert!(stats.rx_heartbeat >= 3);

    world.tick(1);
    let later = world.a.health.heartbeat_stats(0).unwrap();
    assert!(later.tx_heartbeat > stats.tx_heartbeat);
    assert!(later.rx_heartbeat > stats.rx_heartbeat);
}

#[test]
fn test_heartbeat_loss_releases_remote_holdings() {
    let mut world = World::converged();

    // The slave acquires an aggregator on the master.
    world.b.lacp_request(1, 42, 0xaa, 7, false);
    world.pump();
    assert_eq!(
        world.b.responses(),
        vec![(1, SelectionResponse::Accept, 0xaa, 7)]
    );

    // All keepalive traffic disappears.
    world.udp_up = false;
    world.tick(5);
    assert_eq!(world.a.health.peer_states()[0], HealthState::DownWait);
    assert_eq!(world.b.health.peer_states()[0], HealthState::DownWait);

    // The settle period runs out: communications are declared lost, the
    // channel is gone, and the slave's holdings are released.
    world.tick(DOWN_WAIT_TIMEOUT.as_secs() + 1);
    assert!(!world.connected);
    assert!(world.a.releases().contains(&42));

    // Only remotely-held entries were dropped.
    let (tx, rx) = chan::unbounded();
    world.a.manager.command(Command::Dump(tx));
    assert!(rx.recv().unwrap().lacp.is_empty());
}

#[test]
fn test_ipl_flap_stays_out_of_comm_down() {
    let mut world = World::converged();

    // The master holds an aggregator of its own.
    world.a.lacp_request(1, 42, 0xaa, 7, false);
    world.pump();
    assert_eq!(
        world.a.responses(),
        vec![(1, SelectionResponse::Accept, 0xaa, 7)]
    );

    world.set_ipl(false);
    world.tick(6);
    assert_eq!(world.a.health.peer_states()[0], HealthState::DownWait);
    assert_eq!(world.b.health.peer_states()[0], HealthState::DownWait);

    // The port returns well inside the settle period.
    world.set_ipl(true);
    world.tick(6);

    assert_eq!(world.a.health.peer_states()[0], HealthState::Up);
    assert_eq!(world.b.health.peer_states()[0], HealthState::Up);

    // Neither side entered the comm-down state or released anything.
    for node in [&world.a, &world.b] {
        assert!(node.releases().is_empty());
        assert!(!node.events.iter().any(|e| matches!(
            e,
            Event::PeerStateChanged {
                state: HealthState::CommDown,
                passing: false,
                ..
            }
        )));
    }
    assert!(world.connected);
}

#[test]
fn test_lacp_contention_with_force() {
    let mut world = World::converged();

    // Master takes port 42 with partner X/7.
    world.a.lacp_request(1, 42, 0xaa, 7, false);
    world.pump();
    assert_eq!(
        world.a.responses(),
        vec![(1, SelectionResponse::Accept, 0xaa, 7)]
    );

    // Slave contends with partner Y/9: declined, told who holds it.
    world.b.lacp_request(2, 42, 0xbb, 9, false);
    world.pump();
    assert_eq!(
        world.b.responses(),
        vec![(2, SelectionResponse::Decline, 0xaa, 7)]
    );

    // Slave forces: the master's holder is told to release.
    world.b.lacp_request(3, 42, 0xbb, 9, true);
    world.pump();
    assert_eq!(world.a.releases(), vec![42]);

    // The master's LACP engine complies, and the forced request wins.
    world
        .a
        .manager
        .command(Command::LacpSelectionRelease {
            request_id: 4,
            port_id: 42,
        });
    world.pump();
    assert_eq!(
        world.b.responses().last(),
        Some(&(3, SelectionResponse::Accept, 0xbb, 9))
    );
}

#[test]
fn test_vlan_global_recompute() {
    let mut world = World::converged();

    fn vlans(entries: &[(u16, LinkState)]) -> Event {
        Event::VlanLocalStateChanged {
            entries: entries
                .iter()
                .map(|(id, state)| VlanStateEntry {
                    vlan: VlanId::new(*id).unwrap(),
                    state: *state,
                })
                .collect(),
        }
    }

    world
        .a
        .manager
        .received_event(&vlans(&[(10, LinkState::Up), (20, LinkState::Up)]));
    world.pump();
    world
        .b
        .manager
        .received_event(&vlans(&[(20, LinkState::Up), (30, LinkState::Up)]));
    world.pump();

    // Global view is the union; both IPLs carry all three VLANs.
    let (tx, rx) = chan::unbounded();
    world.a.manager.command(Command::Dump(tx));
    assert_eq!(rx.recv().unwrap().vlans_global_up, 3);
    for vlan in [10u16, 20, 30] {
        assert!(world.b.driver_ops.contains(&DriverOp::VlanMemberAdd {
            port: IPL_PORT as IfIndex,
            vlan: VlanId::new(vlan).unwrap(),
        }));
    }

    // The slave disappears: only VLAN 30 was exclusively its, and the
    // master's IPL membership drops it in one diff.
    world.a.driver_ops.clear();
    world.udp_up = false;
    world.tick(5 + DOWN_WAIT_TIMEOUT.as_secs());

    let (tx, rx) = chan::unbounded();
    world.a.manager.command(Command::Dump(tx));
    assert_eq!(rx.recv().unwrap().vlans_global_up, 2);
    assert!(world.a.driver_ops.contains(&DriverOp::VlanMemberRemove {
        port: IPL_PORT as IfIndex,
        vlan: VlanId::new(30).unwrap(),
    }));
    assert!(!world
        .a
        .driver_ops
        .iter()
        .any(|op| matches!(op, DriverOp::VlanMemberRemove { vlan, .. } if vlan.as_u16() == 10)));
}

#[test]
fn test_graceful_stop() {
    let mut world = World::converged();

    world.a.heartbeats_sent.clear();
    world.a.manager.command(Command::Stop);
    world.pump();

    // Both subsystems reported stop; the farewell datagram carries the
    // local-defect flag; the channel is gone.
    assert!(world.a.events.contains(&Event::StopDone {
        subsystem: Subsystem::Manager
    }));
    assert!(world.a.events.contains(&Event::StopDone {
        subsystem: Subsystem::Health
    }));
    assert!(world
        .a
        .heartbeats_sent
        .last()
        .map(|hb| hb.local_defect)
        .unwrap_or(false));
    assert!(!world.connected);

    // The far side sees the defect and declares the peer down at once.
    assert_eq!(world.b.health.peer_states()[0], HealthState::DownWait);

    let (tx, rx) = chan::unbounded();
    world.a.manager.command(Command::Dump(tx));
    assert!(rx.recv().unwrap().lacp.is_empty());
}
