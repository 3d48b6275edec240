//! Peer-start sync orchestration.
//!
//! When a remote peer becomes healthy, every subsystem runs a two-phase
//! sync with it: the slave opens each phase with `SyncStart` (plus its own
//! state), the master answers with its snapshot and `MasterSyncDone`, the
//! slave applies and closes with `SyncFinish`. A peer only reaches
//! `Enable`, and only then is counted in global decisions, once all four
//! subsystems have converged. A phase that stalls past its deadline aborts
//! the peer.

use log::*;

use mlag_common::message::{Message, SyncKind};
use mlag_common::peer::{MlagId, PeerState, Role};
use mlag_common::time::{Clock, LocalDuration, LocalTime};
use mlag_common::MAX_PEERS;

use super::event::Event;
use super::output::{Io, Outbox};
use super::DisconnectReason;

/// How long a single subsystem phase may take before the peer is aborted.
pub const SYNC_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct PeerSync {
    state: PeerState,
    /// Phases that completed (`SyncFinish` seen on the master, `MasterSyncDone`
    /// acknowledged on the slave).
    done: Vec<SyncKind>,
    /// Outstanding phases and their deadlines.
    deadlines: Vec<(SyncKind, LocalTime)>,
}

/// The sync orchestrator.
#[derive(Debug)]
pub struct SyncManager<C> {
    clock: C,
    outbox: Outbox,
    peers: [PeerSync; MAX_PEERS],
    role: Role,
    my_id: MlagId,
    /// Remote peer's health, as last announced.
    peer_up: bool,
    /// Channel connectivity, as reported by the runtime.
    channel_up: bool,
    /// The master is waiting on the FDB collaborator for this peer.
    fdb_export_pending: Option<MlagId>,
}

impl<C: Clock> Iterator for SyncManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> SyncManager<C> {
    /// Create an idle orchestrator.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            outbox: Outbox::default(),
            peers: Default::default(),
            role: Role::Standalone,
            my_id: MlagId::MASTER,
            peer_up: false,
            channel_up: false,
            fdb_export_pending: None,
        }
    }

    /// Reset all sync state.
    pub fn stop(&mut self) {
        self.peers = Default::default();
        self.peer_up = false;
        self.channel_up = false;
        self.fdb_export_pending = None;
    }

    /// Sync progress of a peer.
    pub fn peer_state(&self, peer: MlagId) -> PeerState {
        self.peers
            .get(peer.0 as usize)
            .map(|p| p.state)
            .unwrap_or(PeerState::Down)
    }

    /// Election settled.
    pub fn role_changed(&mut self, role: Role, my_id: MlagId) {
        self.role = role;
        self.my_id = my_id;
        // A role change invalidates whatever sync was in flight.
        self.peers = Default::default();
        self.fdb_export_pending = None;
        self.begin_if_ready();
    }

    /// The remote peer's health changed.
    pub fn peer_health_changed(&mut self, peer: MlagId, up: bool) {
        self.peer_up = up;
        if !up {
            self.peer_down(peer);
        } else {
            self.begin_if_ready();
        }
    }

    /// The peer channel connected or disconnected.
    pub fn channel_changed(&mut self, up: bool) {
        self.channel_up = up;
        if up {
            self.begin_if_ready();
        } else if let Some(peer) = self.remote() {
            self.peer_down(peer);
        }
    }

    fn remote(&self) -> Option<MlagId> {
        match self.role {
            Role::Master => Some(MlagId::SLAVE),
            Role::Slave => Some(MlagId::MASTER),
            Role::Standalone => None,
        }
    }

    /// On the slave, open every phase once the peer is healthy and the
    /// channel is up. The master side is driven by the slave's messages.
    fn begin_if_ready(&mut self) {
        if self.role != Role::Slave || !self.peer_up || !self.channel_up {
            return;
        }
        let master = MlagId::MASTER;
        let sync = &mut self.peers[master.0 as usize];
        if sync.state != PeerState::Down {
            return;
        }
        info!(target: "sync", "Peer {} is reachable, starting subsystem sync", master);

        sync.state = PeerState::Start;
        sync.done.clear();
        sync.deadlines.clear();

        let now = self.clock.local_time();
        for kind in SyncKind::ALL {
            self.peers[master.0 as usize]
                .deadlines
                .push((kind, now + SYNC_TIMEOUT));
            self.outbox.write(
                master,
                Message::SyncStart {
                    kind,
                    peer_id: self.my_id,
                },
            );
        }
        // Lets the machine append the local snapshots behind the opens.
        self.outbox.event(Event::SyncStarted { peer: master });
        self.outbox.set_timer(SYNC_TIMEOUT);
    }

    /// Master: a slave opened a phase. The caller ships the subsystem
    /// snapshot; this records the deadline for the phase to finish.
    pub fn phase_opened(&mut self, peer: MlagId, kind: SyncKind) {
        let now = self.clock.local_time();
        let sync = &mut self.peers[peer.0 as usize];

        if sync.state == PeerState::Down {
            info!(target: "sync", "Peer {} started syncing", peer);
            sync.state = PeerState::Start;
            sync.done.clear();
            sync.deadlines.clear();
        }
        sync.done.retain(|k| *k != kind);
        sync.deadlines.retain(|(k, _)| *k != kind);
        sync.deadlines.push((kind, now + SYNC_TIMEOUT));
        self.outbox.set_timer(SYNC_TIMEOUT);
    }

    /// Master: the FDB collaborator must export its table before the MAC
    /// phase can close.
    pub fn fdb_export_requested(&mut self, peer: MlagId) {
        self.fdb_export_pending = Some(peer);
        self.outbox.event(Event::FdbExportRequest { peer });
    }

    /// Master: the FDB collaborator finished exporting.
    pub fn fdb_export_done(&mut self, peer: MlagId) {
        if self.fdb_export_pending.take() != Some(peer) {
            debug!(target: "sync", "Unexpected FDB export completion for peer {}", peer);
            return;
        }
        self.outbox
            .write(peer, Message::MasterSyncDone { kind: SyncKind::Mac });
    }

    /// A phase completed: on the master, the slave sent `SyncFinish`; on
    /// the slave, the master sent `MasterSyncDone` (and the snapshot was
    /// already applied).
    pub fn phase_done(&mut self, peer: MlagId, kind: SyncKind) {
        let sync = &mut self.peers[peer.0 as usize];
        if sync.state == PeerState::Down {
            debug!(target: "sync", "Ignoring {} sync completion for down peer {}", kind, peer);
            return;
        }
        sync.deadlines.retain(|(k, _)| *k != kind);
        if !sync.done.contains(&kind) {
            sync.done.push(kind);
        }
        info!(
            target: "sync",
            "Peer {}: {} sync done ({}/{})", peer, kind, sync.done.len(), SyncKind::ALL.len()
        );
        self.outbox.event(Event::SyncDone { peer, kind });

        if sync.done.len() == SyncKind::ALL.len() {
            sync.state = PeerState::Enable;
            info!(target: "sync", "Peer {} enabled", peer);
            self.outbox.event(Event::PeerEnabled { peer });
        } else {
            sync.state = PeerState::TxEnable;
        }
    }

    /// A peer went away; its sync state resets.
    pub fn peer_down(&mut self, peer: MlagId) {
        let sync = &mut self.peers[peer.0 as usize];
        if sync.state != PeerState::Down {
            info!(target: "sync", "Peer {} down, sync state reset", peer);
        }
        *sync = PeerSync::default();
        if self.fdb_export_pending == Some(peer) {
            self.fdb_export_pending = None;
        }
    }

    /// Check phase deadlines; an expired phase aborts its peer.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();

        for id in 0..MAX_PEERS {
            let expired = self.peers[id]
                .deadlines
                .iter()
                .find(|(_, deadline)| now >= *deadline)
                .map(|(kind, _)| *kind);

            if let Some(kind) = expired {
                let peer = MlagId(id as u8);
                warn!(target: "sync", "Peer {}: {} sync timed out, aborting peer", peer, kind);

                self.peer_down(peer);
                self.outbox.hang_up(DisconnectReason::SyncTimeout(kind));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlag_common::time::RefClock;

    fn slave() -> (SyncManager<RefClock>, RefClock) {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = SyncManager::new(clock.clone());
        mgr.role_changed(Role::Slave, MlagId::SLAVE);
        mgr.channel_changed(true);
        mgr.peer_health_changed(MlagId::MASTER, true);
        (mgr, clock)
    }

    #[test]
    fn test_slave_opens_all_phases() {
        let (mut mgr, _) = slave();

        let starts: Vec<_> = (&mut mgr)
            .filter_map(|io| match io {
                Io::Write(_, Message::SyncStart { kind, .. }) => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(starts, SyncKind::ALL.to_vec());
    }

    #[test]
    fn test_peer_enables_after_all_phases() {
        let (mut mgr, _) = slave();
        (&mut mgr).for_each(drop);

        for kind in SyncKind::ALL {
            assert_eq!(mgr.peer_state(MlagId::MASTER),
                if kind == SyncKind::Ports { PeerState::Start } else { PeerState::TxEnable });
            mgr.phase_done(MlagId::MASTER, kind);
        }
        assert_eq!(mgr.peer_state(MlagId::MASTER), PeerState::Enable);

        let events: Vec<_> = (&mut mgr)
            .filter_map(|io| match io {
                Io::Event(e) => Some(e),
                _ => None,
            })
            .collect();
        assert!(events.contains(&Event::PeerEnabled {
            peer: MlagId::MASTER
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::SyncDone { .. }))
                .count(),
            4
        );
    }

    #[test]
    fn test_stalled_phase_aborts_peer() {
        let (mut mgr, clock) = slave();
        (&mut mgr).for_each(drop);

        mgr.phase_done(MlagId::MASTER, SyncKind::Ports);
        clock.elapse(SYNC_TIMEOUT + LocalDuration::from_secs(1));
        mgr.timer_expired();

        assert_eq!(mgr.peer_state(MlagId::MASTER), PeerState::Down);
        assert!((&mut mgr).any(|io| matches!(io, Io::HangUp(DisconnectReason::SyncTimeout(_)))));
    }

    #[test]
    fn test_master_waits_for_fdb_collaborator() {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let mut mgr = SyncManager::new(clock);
        mgr.role_changed(Role::Master, MlagId::MASTER);
        mgr.channel_changed(true);

        mgr.phase_opened(MlagId::SLAVE, SyncKind::Mac);
        mgr.fdb_export_requested(MlagId::SLAVE);
        assert!((&mut mgr).any(|io| matches!(
            io,
            Io::Event(Event::FdbExportRequest { .. })
        )));

        mgr.fdb_export_done(MlagId::SLAVE);
        assert!((&mut mgr).any(|io| matches!(
            io,
            Io::Write(MlagId::SLAVE, Message::MasterSyncDone { kind: SyncKind::Mac })
        )));
    }

    #[test]
    fn test_peer_down_resets_progress() {
        let (mut mgr, _) = slave();
        (&mut mgr).for_each(drop);

        mgr.phase_done(MlagId::MASTER, SyncKind::Ports);
        mgr.peer_health_changed(MlagId::MASTER, false);
        assert_eq!(mgr.peer_state(MlagId::MASTER), PeerState::Down);
    }
}
