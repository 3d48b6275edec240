//! Peer-channel transport.
//!
//! One framed TCP connection per peer pair on a fixed control port: the
//! elected master listens, the slave dials with bounded exponential
//! backoff. Frames are a 4-byte big-endian length followed by the encoded
//! message. Received messages and connectivity edges are queued to the
//! mlag-manager dispatcher; sends happen on the dispatcher thread with a
//! short write timeout, busy sockets are retried through the low-priority
//! queue.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::*;
use thiserror::Error;

use mlag_common::message::{Decode, Encode, Message, MAX_FRAME_SIZE};
use mlag_core::DisconnectReason;

use crate::bus::QueueSender;
use crate::ManagerItem;

/// Control port the channel runs on.
pub const CONTROL_PORT: u16 = 7776;

/// First reconnect delay.
pub const RECONNECT_SEED: Duration = Duration::from_secs(1);

/// How long a single frame write may take before the socket is considered
/// busy.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive decode failures tolerated before the connection is reset.
const DECODE_ERROR_LIMIT: u32 = 3;

/// How often detached threads re-check whether they are stale.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A channel send error.
#[derive(Error, Debug)]
pub enum SendError {
    /// No connection is established.
    #[error("channel is not connected")]
    NotConnected,
    /// The socket did not accept the frame in time; retry later.
    #[error("channel is busy")]
    Busy,
    /// The connection failed; it has been torn down.
    #[error("channel is broken: {0}")]
    Broken(std::io::Error),
}

#[derive(Default)]
struct Shared {
    stream: Option<TcpStream>,
    /// Bumped whenever the endpoint role changes; stale helper threads
    /// notice and exit.
    generation: u64,
    /// Identity of the installed connection, so a reader whose
    /// connection was replaced doesn't tear down its successor.
    conn: u64,
}

/// The peer-channel endpoint.
pub struct Channel {
    shared: Arc<Mutex<Shared>>,
    queue: QueueSender<ManagerItem>,
    /// Reconnect backoff cap follows the keepalive interval.
    keepalive_ms: Arc<AtomicU64>,
    port: u16,
}

impl Channel {
    /// Create an idle endpoint.
    pub fn new(
        queue: QueueSender<ManagerItem>,
        keepalive_ms: Arc<AtomicU64>,
        port: u16,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            queue,
            keepalive_ms,
            port,
        }
    }

    fn bump(&self) -> u64 {
        let mut shared = self.shared.lock().expect("channel lock");
        shared.generation += 1;
        if let Some(stream) = shared.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        shared.generation
    }

    fn generation(&self) -> u64 {
        self.shared.lock().expect("channel lock").generation
    }

    /// Master role: accept connections from the slave.
    pub fn listen(&self) {
        let generation = self.bump();
        let shared = Arc::clone(&self.shared);
        let queue = self.queue.clone();
        let port = self.port;

        thread::Builder::new()
            .name("channel-accept".to_owned())
            .spawn(move || {
                let listener = match TcpListener::bind(("0.0.0.0", port)) {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(target: "channel", "Listen on port {} failed: {}", port, err);
                        return;
                    }
                };
                listener
                    .set_nonblocking(true)
                    .expect("nonblocking listener");
                info!(target: "channel", "Listening on port {}", port);

                loop {
                    if shared.lock().expect("channel lock").generation != generation {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!(target: "channel", "Accepted peer connection from {}", addr);
                            install(&shared, &queue, stream, generation);
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(POLL_INTERVAL);
                        }
                        Err(err) => {
                            warn!(target: "channel", "Accept failed: {}", err);
                            thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
            })
            .expect("spawn channel accept thread");
    }

    /// Slave role: keep dialing the master until told otherwise.
    pub fn connect(&self, master: Ipv4Addr) {
        let generation = self.bump();
        let shared = Arc::clone(&self.shared);
        let queue = self.queue.clone();
        let keepalive_ms = Arc::clone(&self.keepalive_ms);
        let port = self.port;

        thread::Builder::new()
            .name("channel-dial".to_owned())
            .spawn(move || {
                let addr = SocketAddr::from((master, port));
                let mut backoff = RECONNECT_SEED;
                let rng = fastrand::Rng::new();

                loop {
                    {
                        let guard = shared.lock().expect("channel lock");
                        if guard.generation != generation {
                            return;
                        }
                        if guard.stream.is_some() {
                            drop(guard);
                            thread::sleep(POLL_INTERVAL);
                            continue;
                        }
                    }
                    match TcpStream::connect_timeout(&addr, Duration::from_secs(3)) {
                        Ok(stream) => {
                            info!(target: "channel", "Connected to master at {}", addr);
                            install(&shared, &queue, stream, generation);
                            backoff = RECONNECT_SEED;
                        }
                        Err(err) => {
                            debug!(
                                target: "channel",
                                "Connect to {} failed ({}), retrying in {:?}", addr, err, backoff
                            );
                            thread::sleep(backoff);

                            // Bounded exponential backoff with jitter,
                            // capped at the keepalive interval.
                            let cap = Duration::from_millis(
                                keepalive_ms.load(Ordering::Relaxed).max(1000),
                            );
                            let doubled = backoff * 2 + Duration::from_millis(rng.u64(0..100));
                            backoff = doubled.min(cap.max(RECONNECT_SEED));
                        }
                    }
                }
            })
            .expect("spawn channel dial thread");
    }

    /// Tear the connection down and stop all helper threads.
    pub fn hang_up(&self, reason: DisconnectReason) {
        debug!(target: "channel", "Hanging up: {}", reason);
        self.bump();
    }

    /// Send one framed message. `Busy` means the frame was not written
    /// and may be retried; `Broken` means the connection is gone.
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        let mut shared = self.shared.lock().expect("channel lock");
        let Some(stream) = shared.stream.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let payload = message.to_vec();
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        match stream.write_all(&frame) {
            Ok(()) => Ok(()),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(SendError::Busy)
            }
            Err(err) => {
                warn!(target: "channel", "Send failed: {}", err);
                if let Some(stream) = shared.stream.take() {
                    stream.shutdown(Shutdown::Both).ok();
                }
                self.queue.send(ManagerItem::ChannelDown(
                    DisconnectReason::Protocol("send failure"),
                ));
                Err(SendError::Broken(err))
            }
        }
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().expect("channel lock").stream.is_some()
    }
}

/// Adopt a fresh connection and start its reader.
fn install(
    shared: &Arc<Mutex<Shared>>,
    queue: &QueueSender<ManagerItem>,
    stream: TcpStream,
    generation: u64,
) {
    stream.set_nodelay(true).ok();
    stream.set_write_timeout(Some(WRITE_TIMEOUT)).ok();

    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            warn!(target: "channel", "Clone of connection failed: {}", err);
            return;
        }
    };

    let conn = {
        let mut guard = shared.lock().expect("channel lock");
        if guard.generation != generation {
            stream.shutdown(Shutdown::Both).ok();
            return;
        }
        // A new connection replaces a stale one.
        if let Some(old) = guard.stream.replace(stream) {
            old.shutdown(Shutdown::Both).ok();
        }
        guard.conn += 1;
        guard.conn
    };
    queue.send(ManagerItem::ChannelUp);

    let shared = Arc::clone(shared);
    let queue = queue.clone();

    thread::Builder::new()
        .name("channel-read".to_owned())
        .spawn(move || read_loop(shared, queue, reader, conn))
        .expect("spawn channel read thread");
}

fn read_loop(
    shared: Arc<Mutex<Shared>>,
    queue: QueueSender<ManagerItem>,
    mut stream: TcpStream,
    conn: u64,
) {
    let mut decode_errors = 0u32;

    let reason = loop {
        let mut header = [0u8; 4];
        if let Err(err) = stream.read_exact(&mut header) {
            debug!(target: "channel", "Connection closed: {}", err);
            break DisconnectReason::Protocol("connection closed");
        }
        let length = u32::from_be_bytes(header) as usize;
        if length < 2 || length > MAX_FRAME_SIZE {
            warn!(target: "channel", "Rejecting frame of {} bytes", length);
            break DisconnectReason::Protocol("bad frame length");
        }

        let mut payload = vec![0u8; length];
        if let Err(err) = stream.read_exact(&mut payload) {
            debug!(target: "channel", "Connection closed mid-frame: {}", err);
            break DisconnectReason::Protocol("connection closed");
        }

        match Message::from_slice(&payload) {
            Ok(message) => {
                decode_errors = 0;
                queue.send(ManagerItem::PeerMessage(message));
            }
            Err(err) => {
                // Dropped and counted; the connection is reset when the
                // peer keeps sending garbage.
                warn!(target: "channel", "Dropping undecodable frame: {}", err);
                decode_errors += 1;
                if decode_errors >= DECODE_ERROR_LIMIT {
                    break DisconnectReason::Protocol("repeated decode failures");
                }
            }
        }
    };

    let mut guard = shared.lock().expect("channel lock");
    if guard.conn == conn && guard.stream.is_some() {
        if let Some(stream) = guard.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        drop(guard);
        queue.send(ManagerItem::ChannelDown(reason));
    }
}
