//! State-machine output. Used to communicate protocol actions with the
//! runtime reactor.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use mlag_common::driver::DriverOp;
use mlag_common::message::{HeartbeatPayload, Message};
use mlag_common::peer::{MlagId, PeerIndex};
use mlag_common::time::LocalDuration;

use super::event::Event;
use super::DisconnectReason;

/// Output of a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Io {
    /// Send a control message to a peer over the channel.
    Write(MlagId, Message),
    /// Send a keepalive datagram to a monitored peer.
    Heartbeat(PeerIndex, HeartbeatPayload),
    /// Program the switch.
    Driver(DriverOp),
    /// Start accepting peer-channel connections (elected master).
    Listen,
    /// Dial the master's channel endpoint (elected slave).
    Connect(Ipv4Addr),
    /// Tear the peer channel down.
    HangUp(DisconnectReason),
    /// Ask the reactor for a wake-up after the given duration.
    SetTimer(LocalDuration),
    /// Publish an event on the bus.
    Event(Event),
}

/// Queues protocol actions until the dispatcher drains them.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Pending actions, oldest first.
    queue: VecDeque<Io>,
}

impl Outbox {
    /// Push an action onto the queue.
    pub fn push(&mut self, io: Io) {
        self.queue.push_back(io);
    }

    /// Queue a control message to a peer.
    pub fn write(&mut self, peer: MlagId, message: Message) {
        self.push(Io::Write(peer, message));
    }

    /// Queue a keepalive datagram.
    pub fn heartbeat(&mut self, peer: PeerIndex, payload: HeartbeatPayload) {
        self.push(Io::Heartbeat(peer, payload));
    }

    /// Queue a switch programming operation.
    pub fn driver(&mut self, op: DriverOp) {
        self.push(Io::Driver(op));
    }

    /// Queue a wake-up request.
    pub fn set_timer(&mut self, duration: LocalDuration) {
        self.push(Io::SetTimer(duration));
    }

    /// Queue a bus event.
    pub fn event(&mut self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Queue a channel teardown.
    pub fn hang_up(&mut self, reason: DisconnectReason) {
        self.push(Io::HangUp(reason));
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}
