//! The `mlagd` daemon binary.

use std::path::PathBuf;
use std::process;

use argh::FromArgs;

use mlag_common::driver::MemoryDriver;
use mlag_node::fdb::NullFdb;
use mlag_node::{channel, logger, rpc, udp, Config};

/// A multi-chassis link aggregation control-plane daemon.
#[derive(FromArgs)]
pub struct Options {
    /// path of the RPC socket
    #[argh(option, default = "PathBuf::from(rpc::DEFAULT_SOCKET)")]
    pub rpc_socket: PathBuf,

    /// peer channel control port
    #[argh(option, default = "channel::CONTROL_PORT")]
    pub control_port: u16,

    /// heartbeat datagram port
    #[argh(option, default = "udp::HEARTBEAT_PORT")]
    pub heartbeat_port: u16,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, default = "log::Level::Info")]
    pub log: log::Level,
}

fn main() {
    let options: Options = argh::from_env();

    if let Err(err) = logger::init(options.log) {
        eprintln!("Error: failed to initialize logger: {}", err);
        process::exit(1);
    }

    let config = Config {
        rpc_socket: options.rpc_socket,
        control_port: options.control_port,
        heartbeat_port: options.heartbeat_port,
    };

    // Detached from hardware, the daemon records programming ops in
    // memory and runs without a MAC sync library.
    if let Err(err) = mlag_node::run(config, Box::new(MemoryDriver::default()), Box::new(NullFdb)) {
        log::error!("Fatal: {}", err);
        process::exit(1);
    }
}
