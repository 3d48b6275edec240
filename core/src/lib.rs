//! MLAG control-plane protocol state machines.
//!
//! Everything in this crate is deterministic: machines consume typed inputs
//! (configuration commands, peer messages, link events, timer expiry) and
//! emit [`fsm::Io`] actions. Sockets, threads and timers live in the
//! `mlag-node` runtime.
#![warn(missing_docs)]

pub mod fsm;

pub use fsm::event::Event;
pub use fsm::{Command, DisconnectReason, Io, StateMachine};
