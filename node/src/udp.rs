//! Heartbeat socket.
//!
//! One UDP socket per daemon, shared by all peers. The reader thread maps
//! source addresses back to peer slots and queues datagrams to the health
//! dispatcher; sends go straight out from the dispatcher thread.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;

use log::*;

use mlag_common::message::HeartbeatPayload;
use mlag_common::peer::PeerIndex;

use crate::bus::QueueSender;
use crate::HealthItem;

/// Port heartbeat datagrams travel on.
pub const HEARTBEAT_PORT: u16 = 7777;

/// Maps peer slots to their datagram destinations, and sources back to
/// slots. Updated by the health dispatcher on peer add/remove.
#[derive(Debug, Default)]
pub struct PeerAddrs {
    by_index: HashMap<PeerIndex, Ipv4Addr>,
    by_addr: HashMap<Ipv4Addr, PeerIndex>,
}

impl PeerAddrs {
    /// Register a peer's address.
    pub fn insert(&mut self, peer: PeerIndex, addr: Ipv4Addr) {
        self.by_index.insert(peer, addr);
        self.by_addr.insert(addr, peer);
    }

    /// Forget a peer.
    pub fn remove(&mut self, peer: PeerIndex) {
        if let Some(addr) = self.by_index.remove(&peer) {
            self.by_addr.remove(&addr);
        }
    }

    fn addr(&self, peer: PeerIndex) -> Option<Ipv4Addr> {
        self.by_index.get(&peer).copied()
    }

    fn peer(&self, addr: &Ipv4Addr) -> Option<PeerIndex> {
        self.by_addr.get(addr).copied()
    }
}

/// The heartbeat socket endpoint.
pub struct HeartbeatSocket {
    socket: UdpSocket,
    peers: Arc<Mutex<PeerAddrs>>,
    port: u16,
}

impl HeartbeatSocket {
    /// Bind the socket and start the reader thread.
    pub fn bind(
        queue: QueueSender<HealthItem>,
        peers: Arc<Mutex<PeerAddrs>>,
        port: u16,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        let reader = socket.try_clone()?;
        let reader_peers = Arc::clone(&peers);

        thread::Builder::new()
            .name("heartbeat-recv".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    let (len, from) = match reader.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(err) => {
                            debug!(target: "health", "Heartbeat socket closed: {}", err);
                            return;
                        }
                    };
                    let SocketAddr::V4(from) = from else {
                        continue;
                    };
                    let Some(peer) = reader_peers.lock().expect("peer addrs").peer(from.ip())
                    else {
                        trace!(target: "health", "Datagram from unknown source {}", from);
                        continue;
                    };
                    queue.send(HealthItem::Datagram {
                        peer,
                        bytes: buf[..len].to_vec(),
                    });
                }
            })
            .expect("spawn heartbeat reader thread");

        Ok(Self {
            socket,
            peers,
            port,
        })
    }

    /// Send one datagram to a peer slot.
    pub fn send(&self, peer: PeerIndex, payload: &HeartbeatPayload) -> io::Result<()> {
        let addr = self
            .peers
            .lock()
            .expect("peer addrs")
            .addr(peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "peer has no address"))?;

        self.socket
            .send_to(&payload.to_bytes(), (addr, self.port))
            .map(|_| ())
    }
}
