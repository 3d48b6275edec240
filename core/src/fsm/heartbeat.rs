//! Keepalive engine.
//!
//! Each monitored peer gets a slot driven by received datagrams and the
//! periodic tick. A peer comes up after three consecutive in-sequence
//! datagrams with a clear remote-defect flag, and goes down on any defect,
//! identity change, or receive timeout. Sequence arithmetic is modulo 2^16.
//!
//! The engine performs no I/O: datagram sends and state edges go through
//! the injected [`Hooks`], which keeps the whole thing drivable from tests.

use log::*;
use thiserror::Error;

use mlag_common::message::HeartbeatPayload;
use mlag_common::peer::{PeerIndex, SystemId};
use mlag_common::MAX_PEERS;

/// Consecutive in-sequence datagrams required to declare a peer up; also
/// the number of silent ticks tolerated before declaring it down.
pub const MESSAGE_THRESHOLD: u16 = 3;

/// Monitoring state of one peer slot.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum State {
    /// No monitoring slot.
    #[default]
    Inactive,
    /// Monitored, not (yet) alive.
    Down,
    /// Alive.
    Up,
}

/// Per-peer datagram statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Datagrams received.
    pub rx_heartbeat: u64,
    /// Datagrams sent.
    pub tx_heartbeat: u64,
    /// Send failures reported by the hook.
    pub tx_errors: u64,
    /// Sequence gaps observed while up.
    pub rx_miss: u64,
    /// Receive timeouts that forced the peer down.
    pub rx_timeout: u64,
    /// Datagrams carrying a remote-defect flag.
    pub remote_defect: u64,
    /// Datagrams carrying a local-defect flag.
    pub local_defect: u64,
}

/// A keepalive engine error.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Peer index outside the slot table.
    #[error("peer {0} not found")]
    NotFound(PeerIndex),
    /// The slot is already being monitored.
    #[error("peer {0} is already monitored")]
    AlreadyActive(PeerIndex),
}

/// Injected effects: state edges and datagram sends.
pub trait Hooks {
    /// A peer slot changed state.
    fn state_change(&mut self, peer: PeerIndex, system_id: SystemId, state: State);

    /// Send a datagram to a peer. An `Err` is counted and otherwise
    /// ignored; sends are never fatal.
    fn send(&mut self, peer: PeerIndex, payload: HeartbeatPayload) -> Result<(), ()>;
}

#[derive(Debug, Clone, Default)]
struct Slot {
    state: State,
    tx_seq: u16,
    last_rx_seq: u16,
    last_rx_sys_id: SystemId,
    last_rx_tick: u16,
    consecutive: u16,
    /// Carried in outbound datagrams: tells the peer we consider it down.
    remote_defect: bool,
    stats: Stats,
}

impl Slot {
    fn reset(&mut self) {
        let stats = self.stats.clone();
        *self = Slot {
            state: State::Down,
            remote_defect: true,
            stats,
            ..Slot::default()
        };
    }
}

/// The keepalive engine.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    started: bool,
    /// Carried in outbound datagrams: forces the far side down.
    local_defect: bool,
    /// Local identity advertised in outbound datagrams.
    system_id: SystemId,
    ticks: u16,
    slots: [Slot; MAX_PEERS],
}

fn distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

impl Heartbeat {
    /// Create an idle engine advertising `system_id`.
    pub fn new(system_id: SystemId) -> Self {
        Self {
            system_id,
            ..Self::default()
        }
    }

    /// Begin sending and receiving. Existing slots restart from down.
    pub fn start(&mut self) {
        self.local_defect = false;
        for slot in &mut self.slots {
            if slot.state != State::Inactive {
                slot.reset();
            }
        }
        self.started = true;
    }

    /// Stop the engine. Each active peer gets one final datagram carrying
    /// the local-defect flag so the far side goes down immediately.
    pub fn stop<H: Hooks>(&mut self, hooks: &mut H) {
        self.local_defect = true;

        for peer in 0..MAX_PEERS {
            if self.slots[peer].state != State::Inactive {
                self.send_one(peer, hooks);
                self.slots[peer].reset();
            }
        }
        self.started = false;
    }

    /// Update the local identity advertised in outbound datagrams.
    pub fn set_system_id(&mut self, system_id: SystemId) {
        self.system_id = system_id;
    }

    /// Set the local-defect flag; the remote side will declare us down.
    pub fn set_local_defect(&mut self, defect: bool) {
        self.local_defect = defect;
    }

    /// Add a monitoring slot. The peer starts down.
    pub fn peer_add(&mut self, peer: PeerIndex) -> Result<(), Error> {
        let slot = self.slots.get_mut(peer).ok_or(Error::NotFound(peer))?;
        if slot.state != State::Inactive {
            return Err(Error::AlreadyActive(peer));
        }
        *slot = Slot::default();
        slot.reset();

        Ok(())
    }

    /// Remove a monitoring slot. No further edges are reported for it.
    pub fn peer_remove(&mut self, peer: PeerIndex) -> Result<(), Error> {
        let slot = self.slots.get_mut(peer).ok_or(Error::NotFound(peer))?;
        slot.state = State::Inactive;
        slot.stats = Stats::default();

        Ok(())
    }

    /// Hand a received datagram to the engine.
    pub fn recv<H: Hooks>(
        &mut self,
        peer: PeerIndex,
        payload: &HeartbeatPayload,
        hooks: &mut H,
    ) -> Result<(), Error> {
        let slot = self.slots.get_mut(peer).ok_or(Error::NotFound(peer))?;

        if !self.started {
            return Ok(());
        }
        if slot.state == State::Inactive {
            debug!(target: "health", "Peer {} not active, datagram ignored", peer);
            return Ok(());
        }

        trace!(
            target: "health",
            "Heartbeat peer {} seq {} remote {} local {}",
            peer, payload.sequence, payload.remote_defect, payload.local_defect
        );

        slot.stats.rx_heartbeat += 1;
        if payload.local_defect {
            slot.stats.local_defect += 1;
        }
        if payload.remote_defect {
            slot.stats.remote_defect += 1;
        }

        match slot.state {
            State::Down => {
                if distance(payload.sequence, slot.last_rx_seq) == 1 && !payload.remote_defect {
                    slot.consecutive += 1;
                } else {
                    slot.consecutive = 1;
                }
                slot.last_rx_seq = payload.sequence;
                slot.last_rx_sys_id = payload.system_id;
                slot.last_rx_tick = self.ticks;
                slot.remote_defect = false;

                if slot.consecutive == MESSAGE_THRESHOLD {
                    info!(target: "health", "Peer {} changed state to heartbeat up", peer);
                    slot.state = State::Up;
                    slot.consecutive = 0;

                    let system_id = slot.last_rx_sys_id;
                    hooks.state_change(peer, system_id, State::Up);
                }
            }
            State::Up => {
                if payload.remote_defect
                    || payload.local_defect
                    || slot.last_rx_sys_id != payload.system_id
                {
                    info!(
                        target: "health",
                        "Peer {} moved to heartbeat down, remote side reported error", peer
                    );
                    slot.state = State::Down;
                    slot.remote_defect = true;

                    let system_id = slot.last_rx_sys_id;
                    hooks.state_change(peer, system_id, State::Down);
                }

                let slot = &mut self.slots[peer];
                if distance(payload.sequence, slot.last_rx_seq) != 1 {
                    slot.stats.rx_miss += 1;
                } else {
                    slot.last_rx_tick = self.ticks;
                }
                slot.last_rx_seq = payload.sequence;
            }
            State::Inactive => unreachable!("handled above"),
        }

        Ok(())
    }

    /// Advance the engine one keepalive interval: time peers out, then send
    /// one datagram per active slot.
    pub fn tick<H: Hooks>(&mut self, hooks: &mut H) {
        self.ticks = self.ticks.wrapping_add(1);

        for peer in 0..MAX_PEERS {
            let slot = &mut self.slots[peer];
            if slot.state == State::Up
                && distance(self.ticks, slot.last_rx_tick) > MESSAGE_THRESHOLD
            {
                info!(target: "health", "Peer {} moved to heartbeat down, timeout", peer);
                slot.state = State::Down;
                slot.remote_defect = true;
                slot.stats.rx_timeout += 1;

                let system_id = slot.last_rx_sys_id;
                hooks.state_change(peer, system_id, State::Down);
            }
        }

        if !self.started {
            return;
        }
        for peer in 0..MAX_PEERS {
            if self.slots[peer].state != State::Inactive {
                self.send_one(peer, hooks);
            }
        }
    }

    fn send_one<H: Hooks>(&mut self, peer: PeerIndex, hooks: &mut H) {
        let slot = &mut self.slots[peer];
        let payload = HeartbeatPayload {
            system_id: self.system_id,
            sequence: slot.tx_seq,
            local_defect: self.local_defect,
            remote_defect: slot.remote_defect,
        };
        slot.tx_seq = slot.tx_seq.wrapping_add(1);

        match hooks.send(peer, payload) {
            Ok(()) => slot.stats.tx_heartbeat += 1,
            Err(()) => slot.stats.tx_errors += 1,
        }
    }

    /// Count a send failure reported after the datagram left the engine.
    pub fn record_tx_error(&mut self, peer: PeerIndex) {
        if let Some(slot) = self.slots.get_mut(peer) {
            slot.stats.tx_errors += 1;
        }
    }

    /// Monitoring state of each slot.
    pub fn states(&self) -> [State; MAX_PEERS] {
        let mut states = [State::Inactive; MAX_PEERS];
        for (state, slot) in states.iter_mut().zip(&self.slots) {
            *state = slot.state;
        }
        states
    }

    /// Identity last seen from a peer, if any datagram arrived.
    pub fn peer_system_id(&self, peer: PeerIndex) -> Option<SystemId> {
        self.slots
            .get(peer)
            .filter(|s| s.state != State::Inactive && s.stats.rx_heartbeat > 0)
            .map(|s| s.last_rx_sys_id)
    }

    /// Statistics snapshot for a peer.
    pub fn stats(&self, peer: PeerIndex) -> Result<Stats, Error> {
        self.slots
            .get(peer)
            .map(|s| s.stats.clone())
            .ok_or(Error::NotFound(peer))
    }

    /// Clear a peer's statistics.
    pub fn stats_clear(&mut self, peer: PeerIndex) -> Result<(), Error> {
        let slot = self.slots.get_mut(peer).ok_or(Error::NotFound(peer))?;
        slot.stats = Stats::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        edges: Vec<(PeerIndex, SystemId, State)>,
        sent: Vec<(PeerIndex, HeartbeatPayload)>,
        fail_sends: bool,
    }

    impl Hooks for Recorder {
        fn state_change(&mut self, peer: PeerIndex, system_id: SystemId, state: State) {
            self.edges.push((peer, system_id, state));
        }

        fn send(&mut self, peer: PeerIndex, payload: HeartbeatPayload) -> Result<(), ()> {
            if self.fail_sends {
                return Err(());
            }
            self.sent.push((peer, payload));
            Ok(())
        }
    }

    fn payload(seq: u16) -> HeartbeatPayload {
        HeartbeatPayload {
            system_id: 0xabc,
            sequence: seq,
            local_defect: false,
            remote_defect: false,
        }
    }

    fn engine() -> (Heartbeat, Recorder) {
        let mut hb = Heartbeat::new(0xdef);
        hb.peer_add(0).unwrap();
        hb.start();
        (hb, Recorder::default())
    }

    #[test]
    fn test_three_in_sequence_to_up() {
        let (mut hb, mut hooks) = engine();

        for seq in 1..=3 {
            hb.recv(0, &payload(seq), &mut hooks).unwrap();
        }
        assert_eq!(hooks.edges, vec![(0, 0xabc, State::Up)]);
    }

    #[test]
    fn test_out_of_sequence_restarts_count() {
        let (mut hb, mut hooks) = engine();

        hb.recv(0, &payload(1), &mut hooks).unwrap();
        hb.recv(0, &payload(2), &mut hooks).unwrap();
        hb.recv(0, &payload(9), &mut hooks).unwrap();
        assert!(hooks.edges.is_empty());

        hb.recv(0, &payload(10), &mut hooks).unwrap();
        hb.recv(0, &payload(11), &mut hooks).unwrap();
        assert_eq!(hooks.edges, vec![(0, 0xabc, State::Up)]);
    }

    #[test]
    fn test_sequence_wraps_around() {
        let (mut hb, mut hooks) = engine();

        hb.recv(0, &payload(u16::MAX - 1), &mut hooks).unwrap();
        hb.recv(0, &payload(u16::MAX), &mut hooks).unwrap();
        hb.recv(0, &payload(0), &mut hooks).unwrap();
        assert_eq!(hooks.edges, vec![(0, 0xabc, State::Up)]);
    }

    #[test]
    fn test_defect_forces_down() {
        let (mut hb, mut hooks) = engine();
        for seq in 1..=3 {
            hb.recv(0, &payload(seq), &mut hooks).unwrap();
        }

        let mut defect = payload(4);
        defect.local_defect = true;
        hb.recv(0, &defect, &mut hooks).unwrap();

        assert_eq!(
            hooks.edges,
            vec![(0, 0xabc, State::Up), (0, 0xabc, State::Down)]
        );
        // The next outbound datagram tells the peer we consider it down.
        hb.tick(&mut hooks);
        assert!(hooks.sent.last().unwrap().1.remote_defect);
    }

    #[test]
    fn test_system_id_change_forces_down() {
        let (mut hb, mut hooks) = engine();
        for seq in 1..=3 {
            hb.recv(0, &payload(seq), &mut hooks).unwrap();
        }

        let mut other = payload(4);
        other.system_id = 0x999;
        hb.recv(0, &other, &mut hooks).unwrap();
        assert_eq!(hooks.edges.last(), Some(&(0, 0xabc, State::Down)));
    }

    #[test]
    fn test_receive_timeout() {
        let (mut hb, mut hooks) = engine();
        for seq in 1..=3 {
            hb.recv(0, &payload(seq), &mut hooks).unwrap();
        }

        for _ in 0..=MESSAGE_THRESHOLD {
            hb.tick(&mut hooks);
        }
        assert_eq!(hooks.edges.last(), Some(&(0, 0xabc, State::Down)));
        assert_eq!(hb.stats(0).unwrap().rx_timeout, 1);
    }

    #[test]
    fn test_miss_does_not_reset_liveness() {
        let (mut hb, mut hooks) = engine();
        for seq in 1..=3 {
            hb.recv(0, &payload(seq), &mut hooks).unwrap();
        }

        // A gap counts as a miss but the peer stays up.
        hb.recv(0, &payload(6), &mut hooks).unwrap();
        assert_eq!(hb.stats(0).unwrap().rx_miss, 1);
        assert_eq!(hb.states()[0], State::Up);
    }

    #[test]
    fn test_stop_sends_final_defect() {
        let (mut hb, mut hooks) = engine();
        hb.stop(&mut hooks);

        let (_, last) = hooks.sent.last().unwrap();
        assert!(last.local_defect);

        // Stopped engines neither send nor receive.
        hooks.sent.clear();
        hb.tick(&mut hooks);
        assert!(hooks.sent.is_empty());
    }

    #[test]
    fn test_send_errors_are_counted() {
        let (mut hb, mut hooks) = engine();
        hooks.fail_sends = true;

        hb.tick(&mut hooks);
        assert_eq!(hb.stats(0).unwrap().tx_errors, 1);
        assert_eq!(hb.stats(0).unwrap().tx_heartbeat, 0);
    }

    #[test]
    fn test_unknown_peer() {
        let (mut hb, mut hooks) = engine();
        assert_eq!(
            hb.recv(9, &payload(1), &mut hooks),
            Err(Error::NotFound(9))
        );
        assert_eq!(hb.peer_add(0), Err(Error::AlreadyActive(0)));
    }
}
