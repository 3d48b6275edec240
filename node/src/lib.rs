//! MLAG daemon runtime.
//!
//! Hosts the protocol machines from `mlag-core` on their dispatcher
//! threads and owns everything with a file descriptor: the heartbeat UDP
//! socket, the peer TCP channel, the RPC Unix socket, the tick source and
//! the switch driver. [`run`] wires it all up and blocks until the daemon
//! is torn down through its [`Handle`].

pub mod bus;
pub mod channel;
pub mod fdb;
pub mod handle;
pub mod logger;
pub mod rpc;
pub mod udp;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use log::*;
use thiserror::Error;

use mlag_common::driver::SwitchDriver;
use mlag_common::dump::{HealthDump, HealthPeerDump};
use mlag_common::message::Message;
use mlag_common::peer::{HealthState, MlagId, PeerIndex, Role};
use mlag_common::time::{Clock, LocalTime};
use mlag_common::MAX_PEERS;

use mlag_core::fsm::event::{Event, Priority, Subsystem};
use mlag_core::fsm::healthmgr::HealthManager;
use mlag_core::fsm::output::Io;
use mlag_core::fsm::{Command, StateMachine};
use mlag_core::DisconnectReason;

use bus::{Queue, QueueItem, QueueSender, Router};
use channel::Channel;
use fdb::FdbSync;
use udp::{HeartbeatSocket, PeerAddrs};

pub use handle::Handle;

/// Times a busy channel send is requeued before communications are
/// declared lost.
const SEND_RETRY_LIMIT: u32 = 3;

/// Idle wait used when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// A runtime error.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket setup failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A dispatcher thread died.
    #[error("dispatcher thread panicked")]
    DispatcherDied,
}

/// The wall clock, as the machines see it.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// A health subsystem query.
pub enum HealthQuery {
    /// Health states of all peer slots.
    PeerStates(chan::Sender<[HealthState; MAX_PEERS]>),
    /// The subsystem's dump snapshot.
    Dump(chan::Sender<HealthDump>),
    /// Clear heartbeat statistics.
    ClearStats,
    /// Force or clear the local defect flag.
    SetLocalDefect(bool),
}

/// Work queued to the health dispatcher.
pub enum HealthItem {
    /// A bus event.
    Event(Event),
    /// A heartbeat datagram arrived.
    Datagram {
        /// Source peer slot.
        peer: PeerIndex,
        /// Raw datagram bytes.
        bytes: Vec<u8>,
    },
    /// The keepalive interval elapsed.
    Tick,
    /// A query from the handle.
    Query(HealthQuery),
    /// Terminate the dispatcher.
    Shutdown,
}

impl QueueItem for HealthItem {
    fn priority(&self) -> Priority {
        match self {
            Self::Shutdown => Priority::High,
            Self::Event(event) => event.priority(),
            Self::Tick => Priority::Low,
            Self::Datagram { .. } | Self::Query(_) => Priority::Medium,
        }
    }
}

/// Work queued to the mlag-manager dispatcher.
pub enum ManagerItem {
    /// A bus event.
    Event(Event),
    /// A command from the handle.
    Command(Command),
    /// A control message arrived over the channel.
    PeerMessage(Message),
    /// The channel connected.
    ChannelUp,
    /// The channel disconnected.
    ChannelDown(DisconnectReason),
    /// A busy send being retried.
    Resend {
        /// The unsent message.
        message: Message,
        /// Attempts so far.
        attempts: u32,
    },
    /// Terminate the dispatcher.
    Shutdown,
}

impl QueueItem for ManagerItem {
    fn priority(&self) -> Priority {
        match self {
            Self::Shutdown => Priority::High,
            Self::Event(event) => event.priority(),
            Self::Resend { .. } => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// Work queued to the mac-sync dispatcher.
pub enum MacItem {
    /// A bus event.
    Event(Event),
    /// Terminate the dispatcher.
    Shutdown,
}

impl QueueItem for MacItem {
    fn priority(&self) -> Priority {
        match self {
            Self::Shutdown => Priority::High,
            Self::Event(event) => event.priority(),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the RPC socket lives.
    pub rpc_socket: PathBuf,
    /// Port the peer channel runs on.
    pub control_port: u16,
    /// Port heartbeat datagrams travel on.
    pub heartbeat_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_socket: PathBuf::from(rpc::DEFAULT_SOCKET),
            control_port: channel::CONTROL_PORT,
            heartbeat_port: udp::HEARTBEAT_PORT,
        }
    }
}

/// Run the daemon until it is shut down through its handle. The RPC
/// server is spawned on the side; `driver` receives hardware programming
/// and `fdb` hosts the MAC sync collaborator.
pub fn run(
    config: Config,
    driver: Box<dyn SwitchDriver + Send>,
    fdb: Box<dyn FdbSync>,
) -> Result<(), Error> {
    info!("Initializing daemon..");

    let health_queue: Queue<HealthItem> = Queue::new();
    let manager_queue: Queue<ManagerItem> = Queue::new();
    let mac_queue: Queue<MacItem> = Queue::new();

    let router = Router::new(
        health_queue.sender(),
        manager_queue.sender(),
        mac_queue.sender(),
    );

    let keepalive_ms = Arc::new(AtomicU64::new(1000));
    let peer_addrs = Arc::new(Mutex::new(PeerAddrs::default()));

    let channel = Channel::new(
        manager_queue.sender(),
        Arc::clone(&keepalive_ms),
        config.control_port,
    );
    let socket = HeartbeatSocket::bind(
        health_queue.sender(),
        Arc::clone(&peer_addrs),
        config.heartbeat_port,
    )?;

    let handle = Handle::new(
        manager_queue.sender(),
        health_queue.sender(),
        mac_queue.sender(),
    );

    // Tick source: fires the heartbeat interval into the health queue.
    {
        let keepalive_ms = Arc::clone(&keepalive_ms);
        let ticks = health_queue.sender();
        thread::Builder::new()
            .name("ticker".to_owned())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(
                    keepalive_ms.load(Ordering::Relaxed).max(1),
                ));
                ticks.send(HealthItem::Tick);
            })
            .expect("spawn ticker thread");
    }

    // RPC server.
    {
        let handle = handle.clone();
        let path = config.rpc_socket.clone();
        thread::Builder::new()
            .name("rpc".to_owned())
            .spawn(move || {
                if let Err(err) = rpc::serve(&path, handle) {
                    error!(target: "rpc", "Server failed: {}", err);
                }
            })
            .expect("spawn rpc thread");
    }

    info!("Spawning dispatcher threads..");

    let health_thread = {
        let router = router.clone();
        let keepalive_ms = Arc::clone(&keepalive_ms);
        let peer_addrs = Arc::clone(&peer_addrs);
        thread::Builder::new()
            .name("health-dispatch".to_owned())
            .spawn(move || health_dispatch(health_queue, router, socket, keepalive_ms, peer_addrs))
            .expect("spawn health dispatcher")
    };

    let manager_thread = {
        let router = router.clone();
        let sender = manager_queue.sender();
        thread::Builder::new()
            .name("mlag-dispatch".to_owned())
            .spawn(move || manager_dispatch(manager_queue, sender, router, channel, driver))
            .expect("spawn mlag dispatcher")
    };

    let mac_thread = {
        let manager = handle.clone();
        thread::Builder::new()
            .name("mac-sync-dispatch".to_owned())
            .spawn(move || mac_dispatch(mac_queue, router, manager, fdb))
            .expect("spawn mac-sync dispatcher")
    };

    health_thread.join().map_err(|_| Error::DispatcherDied)?;
    manager_thread.join().map_err(|_| Error::DispatcherDied)?;
    mac_thread.join().map_err(|_| Error::DispatcherDied)?;

    info!("All dispatchers drained, exiting..");
    Ok(())
}

fn next_timeout(next_wake: Option<Instant>) -> Duration {
    next_wake
        .map(|at| at.saturating_duration_since(Instant::now()))
        .unwrap_or(IDLE_WAIT)
}

fn wake_due(next_wake: &mut Option<Instant>) -> bool {
    match next_wake {
        Some(at) if Instant::now() >= *at => {
            *next_wake = None;
            true
        }
        _ => false,
    }
}

fn schedule(next_wake: &mut Option<Instant>, after: Duration) {
    let at = Instant::now() + after;
    *next_wake = Some(next_wake.map_or(at, |current| current.min(at)));
}

fn health_dispatch(
    queue: Queue<HealthItem>,
    router: Router,
    socket: HeartbeatSocket,
    keepalive_ms: Arc<AtomicU64>,
    peer_addrs: Arc<Mutex<PeerAddrs>>,
) {
    let mut machine = HealthManager::new(SystemClock);
    let mut next_wake: Option<Instant> = None;

    loop {
        let item = queue.recv_timeout(next_timeout(next_wake));
        if wake_due(&mut next_wake) {
            machine.timer_expired();
        }

        match item {
            Some(HealthItem::Shutdown) | Some(HealthItem::Event(Event::Deinit)) => break,
            Some(HealthItem::Event(event)) => {
                // The datagram reader resolves sources to peer slots; keep
                // its map aligned with the peer set. The tick source and
                // the channel backoff follow the keepalive interval.
                match &event {
                    Event::PeerAdded { peer, addr, .. } => {
                        peer_addrs.lock().expect("peer addrs").insert(*peer, *addr);
                    }
                    Event::PeerRemoved { peer } => {
                        peer_addrs.lock().expect("peer addrs").remove(*peer);
                    }
                    Event::KeepaliveIntervalChanged(interval) => {
                        keepalive_ms.store(interval.as_millis() as u64, Ordering::Relaxed);
                    }
                    _ => {}
                }
                machine.received_event(&event);
            }
            Some(HealthItem::Datagram { peer, bytes }) => {
                machine.datagram_received(peer, &bytes);
            }
            Some(HealthItem::Tick) => machine.tick(),
            Some(HealthItem::Query(query)) => match query {
                HealthQuery::PeerStates(reply) => {
                    reply.send(machine.peer_states()).ok();
                }
                HealthQuery::Dump(reply) => {
                    reply.send(health_dump(&machine)).ok();
                }
                HealthQuery::ClearStats => machine.stats_clear(),
                HealthQuery::SetLocalDefect(defect) => machine.set_local_defect(defect),
            },
            None => {}
        }

        while let Some(io) = machine.next() {
            match io {
                Io::Heartbeat(peer, payload) => {
                    if let Err(err) = socket.send(peer, &payload) {
                        debug!(target: "health", "Datagram send to peer {} failed: {}", peer, err);
                        machine.datagram_send_failed(peer);
                    }
                }
                Io::Event(event) => router.publish(Subsystem::Health, event),
                Io::SetTimer(duration) => schedule(&mut next_wake, duration.into()),
                _ => {}
            }
        }
    }
    debug!(target: "health", "Dispatcher drained");
}

fn manager_dispatch(
    queue: Queue<ManagerItem>,
    sender: QueueSender<ManagerItem>,
    router: Router,
    channel: Channel,
    mut driver: Box<dyn SwitchDriver + Send>,
) {
    let mut machine = StateMachine::new(SystemClock);
    let mut next_wake: Option<Instant> = None;

    loop {
        let item = queue.recv_timeout(next_timeout(next_wake));
        if wake_due(&mut next_wake) {
            machine.timer_expired();
        }

        match item {
            Some(ManagerItem::Shutdown) | Some(ManagerItem::Event(Event::Deinit)) => break,
            Some(ManagerItem::Event(event)) => machine.received_event(&event),
            Some(ManagerItem::Command(command)) => machine.command(command),
            Some(ManagerItem::PeerMessage(message)) => {
                let from = match machine.role() {
                    Role::Master => MlagId::SLAVE,
                    _ => MlagId::MASTER,
                };
                machine.message_received(from, message);
            }
            Some(ManagerItem::ChannelUp) => machine.peer_connected(),
            Some(ManagerItem::ChannelDown(reason)) => machine.peer_disconnected(reason),
            Some(ManagerItem::Resend { message, attempts }) => {
                send_with_retry(&channel, &sender, message, attempts);
            }
            None => {}
        }

        for io in &mut machine {
            match io {
                Io::Write(_, message) => send_with_retry(&channel, &sender, message, 0),
                Io::Driver(op) => {
                    if let Err(err) = driver.apply(&op) {
                        error!(target: "mlag", "Driver rejected {:?}: {}", op, err);
                    }
                }
                Io::Listen => channel.listen(),
                Io::Connect(addr) => channel.connect(addr),
                Io::HangUp(reason) => channel.hang_up(reason),
                Io::Event(event) => router.publish(Subsystem::Manager, event),
                Io::SetTimer(duration) => schedule(&mut next_wake, duration.into()),
                Io::Heartbeat(..) => {}
            }
        }
    }
    debug!(target: "mlag", "Dispatcher drained");
}

fn send_with_retry(
    channel: &Channel,
    queue: &QueueSender<ManagerItem>,
    message: Message,
    attempts: u32,
) {
    match channel.send(&message) {
        Ok(()) => {}
        Err(channel::SendError::Busy) => {
            if attempts < SEND_RETRY_LIMIT {
                queue.send(ManagerItem::Resend {
                    message,
                    attempts: attempts + 1,
                });
            } else {
                warn!(target: "channel", "Send backlog persisted, declaring channel lost");
                channel.hang_up(DisconnectReason::Protocol("send retries exhausted"));
                queue.send(ManagerItem::ChannelDown(DisconnectReason::Protocol(
                    "send retries exhausted",
                )));
            }
        }
        // A broken channel announces itself; an unconnected one simply
        // drops control traffic.
        Err(channel::SendError::Broken(_)) | Err(channel::SendError::NotConnected) => {}
    }
}

fn mac_dispatch(
    queue: Queue<MacItem>,
    router: Router,
    handle: Handle,
    mut fdb: Box<dyn FdbSync>,
) {
    loop {
        match queue.recv_timeout(IDLE_WAIT) {
            Some(MacItem::Shutdown) | Some(MacItem::Event(Event::Deinit)) => break,
            Some(MacItem::Event(event)) => match event {
                Event::FdbExportRequest { peer } => {
                    for chunk in fdb.export(peer) {
                        handle.fdb_export(peer, chunk);
                    }
                    handle.fdb_sync_done(peer);
                }
                Event::FdbPayloadReceived { peer, payload } => fdb.apply(peer, payload),
                Event::PortDeleting { port_id } => {
                    fdb.port_deleted(port_id);
                    handle.port_delete_ack(port_id, Subsystem::MacSync);
                }
                Event::Stop => {
                    router.publish(
                        Subsystem::MacSync,
                        Event::StopDone {
                            subsystem: Subsystem::MacSync,
                        },
                    );
                }
                _ => {}
            },
            None => {}
        }
    }
    debug!(target: "mac-sync", "Dispatcher drained");
}

fn health_dump(machine: &HealthManager<SystemClock>) -> HealthDump {
    let states = machine.peer_states();
    let mut peers = Vec::new();

    for (index, state) in states.iter().enumerate() {
        if *state == HealthState::NotExist {
            continue;
        }
        let stats = machine.heartbeat_stats(index).unwrap_or_default();
        peers.push(HealthPeerDump {
            index: index as u32,
            state: state.as_str().to_owned(),
            rx_heartbeat: stats.rx_heartbeat,
            tx_heartbeat: stats.tx_heartbeat,
            tx_errors: stats.tx_errors,
            rx_miss: stats.rx_miss,
            rx_timeout: stats.rx_timeout,
        });
    }

    HealthDump {
        keepalive_ms: machine.keepalive().as_millis() as u64,
        peers,
    }
}
