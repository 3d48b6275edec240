//! RPC surface.
//!
//! A thin length-prefixed request/response layer over a Unix socket.
//! Requests are JSON documents naming a command and its arguments; they
//! translate directly onto the [`Handle`]. Responses carry a zero or
//! negative-errno code plus an optional JSON payload.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;

use log::*;
use microserde::{json, Deserialize, Serialize};

use mlag_common::message::PortMode;
use mlag_common::time::LocalDuration;
use mlag_common::topology::VlanId;

use mlag_core::fsm::{self, Features};

use crate::handle::{Error, Handle};

/// Default RPC socket path.
pub const DEFAULT_SOCKET: &str = "/var/run/mlagd.sock";

/// Largest request document accepted.
const MAX_REQUEST_SIZE: usize = 16 * 1024;

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EAFNOSUPPORT: i32 = 97;

/// A decoded RPC request. Unused arguments are simply absent.
#[derive(Debug, Default, Deserialize)]
pub struct Request {
    /// The command name.
    pub cmd: String,
    pub system_id: Option<u64>,
    pub stp: Option<bool>,
    pub lacp: Option<bool>,
    pub igmp: Option<bool>,
    pub ipl_id: Option<u32>,
    pub ifindex: Option<u32>,
    pub vlan: Option<u16>,
    pub local_ip: Option<String>,
    pub peer_ip: Option<String>,
    pub secs: Option<u64>,
    pub port_id: Option<u64>,
    pub mode: Option<String>,
    pub sys_id: Option<u64>,
    pub request_id: Option<u32>,
    pub partner_id: Option<u64>,
    pub partner_key: Option<u16>,
    pub force: Option<bool>,
    pub defect: Option<bool>,
    pub path: Option<String>,
}

/// An RPC response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Zero on success, a negative errno otherwise.
    pub code: i32,
    /// JSON payload for queries, empty otherwise.
    pub data: String,
}

impl Response {
    fn ok() -> Self {
        Self {
            code: 0,
            data: String::new(),
        }
    }

    fn with_data(data: String) -> Self {
        Self { code: 0, data }
    }

    fn err(code: i32) -> Self {
        Self {
            code: -code,
            data: String::new(),
        }
    }
}

#[derive(Serialize)]
struct PeerRow {
    index: u32,
    addr: String,
    mlag_id: i32,
    health: String,
    sync_state: String,
    system_id: u64,
}

fn errno(err: Error) -> i32 {
    match err {
        Error::Fsm(fsm::Error::NotStarted) => EPERM,
        Error::Fsm(fsm::Error::Invalid(_)) => EINVAL,
        Error::Fsm(fsm::Error::NotFound(_)) => ENOENT,
        Error::Fsm(fsm::Error::NoSpace(_)) => ENOSPC,
        Error::Fsm(fsm::Error::Peer(mlag_common::peer::Error::Full)) => ENOSPC,
        Error::Fsm(fsm::Error::Peer(mlag_common::peer::Error::NotFound(_))) => ENOENT,
        Error::Fsm(fsm::Error::Peer(_)) => EINVAL,
        Error::Fsm(fsm::Error::Topology(mlag_common::topology::Error::NoFreeSlot)) => ENOSPC,
        Error::Fsm(fsm::Error::Topology(mlag_common::topology::Error::NotFound(_))) => ENOENT,
        Error::Fsm(fsm::Error::Topology(_)) => EINVAL,
        Error::Timeout | Error::Io(_) => EIO,
    }
}

/// Parse an IP argument. Addresses of the wrong family are rejected with
/// their own code.
fn parse_ip(arg: &Option<String>) -> Result<Option<Ipv4Addr>, i32> {
    let Some(arg) = arg else {
        return Ok(None);
    };
    if arg.is_empty() {
        return Ok(None);
    }
    if let Ok(addr) = arg.parse::<Ipv4Addr>() {
        return Ok(Some(addr));
    }
    if arg.parse::<std::net::Ipv6Addr>().is_ok() {
        return Err(EAFNOSUPPORT);
    }
    Err(EINVAL)
}

fn parse_vlan(arg: Option<u16>) -> Result<Option<VlanId>, i32> {
    match arg {
        None => Ok(None),
        Some(id) => VlanId::new(id).map(Some).map_err(|_| EINVAL),
    }
}

/// Execute one request against the handle.
pub fn dispatch(handle: &Handle, request: &Request) -> Response {
    let result = execute(handle, request);
    match result {
        Ok(response) => response,
        Err(code) => Response::err(code),
    }
}

fn execute(handle: &Handle, request: &Request) -> Result<Response, i32> {
    let reply = |result: Result<(), Error>| -> Result<Response, i32> {
        match result {
            Ok(()) => Ok(Response::ok()),
            Err(err) => Err(errno(err)),
        }
    };

    match request.cmd.as_str() {
        "start" => {
            handle.start(
                request.system_id.ok_or(EINVAL)?,
                Features {
                    stp: request.stp.unwrap_or(false),
                    lacp: request.lacp.unwrap_or(true),
                    igmp: request.igmp.unwrap_or(false),
                },
            );
            Ok(Response::ok())
        }
        "stop" => {
            handle.stop();
            Ok(Response::ok())
        }
        "ipl_create" => {
            let ipl = handle.ipl_create().map_err(errno)?;
            Ok(Response::with_data(json::to_string(&(ipl as u32))))
        }
        "ipl_del" => {
            let ipl = request.ipl_id.ok_or(EINVAL)? as usize;
            reply(handle.ipl_delete(ipl))
        }
        "ipl_port_set" => {
            let ipl = request.ipl_id.ok_or(EINVAL)? as usize;
            reply(handle.ipl_port_set(ipl, request.ifindex))
        }
        "ipl_ip_set" => {
            let ipl = request.ipl_id.ok_or(EINVAL)? as usize;
            let vlan = parse_vlan(request.vlan)?;
            let local = parse_ip(&request.local_ip)?;
            let peer = parse_ip(&request.peer_ip)?;
            reply(handle.ipl_ip_set(ipl, vlan, local, peer))
        }
        "port_add" => reply(handle.port_add(request.port_id.ok_or(EINVAL)?)),
        "port_del" => reply(handle.port_delete(request.port_id.ok_or(EINVAL)?)),
        "port_mode_set" => {
            let mode = match request.mode.as_deref() {
                Some("static") => PortMode::Static,
                Some("lacp") => PortMode::Lacp,
                _ => return Err(EINVAL),
            };
            reply(handle.port_mode_set(request.port_id.ok_or(EINVAL)?, mode))
        }
        "keepalive_set" => {
            let secs = request.secs.ok_or(EINVAL)?;
            reply(handle.keepalive_set(LocalDuration::from_secs(secs)))
        }
        "reload_delay_set" => {
            let secs = request.secs.ok_or(EINVAL)?;
            reply(handle.reload_delay_set(LocalDuration::from_secs(secs)))
        }
        "local_health_set" => {
            handle.set_local_health(request.defect.unwrap_or(false));
            Ok(Response::ok())
        }
        "peers_state_list_get" => {
            let peers = handle.peers_state_list_get().map_err(errno)?;
            let rows: Vec<PeerRow> = peers
                .into_iter()
                .map(|peer| PeerRow {
                    index: peer.index as u32,
                    addr: peer.addr.to_string(),
                    mlag_id: peer.mlag_id.map(|id| id.0 as i32).unwrap_or(-1),
                    health: peer.health.as_str().to_owned(),
                    sync_state: peer.sync_state.as_str().to_owned(),
                    system_id: peer.system_id.unwrap_or(0),
                })
                .collect();
            Ok(Response::with_data(json::to_string(&rows)))
        }
        "counters_get" => {
            let counters = handle.counters_get().map_err(errno)?;
            Ok(Response::with_data(json::to_string(&counters)))
        }
        "counters_clear" => {
            handle.counters_clear();
            Ok(Response::ok())
        }
        "lacp_sys_id_set" => {
            handle.lacp_local_sys_id_set(request.sys_id.ok_or(EINVAL)?);
            Ok(Response::ok())
        }
        "lacp_actor_params_get" => {
            let sys_id = handle.lacp_actor_parameters_get().map_err(errno)?;
            Ok(Response::with_data(json::to_string(&sys_id)))
        }
        "lacp_selection_request" => {
            handle.lacp_selection_request(
                request.request_id.ok_or(EINVAL)?,
                request.port_id.ok_or(EINVAL)?,
                request.partner_id.ok_or(EINVAL)?,
                request.partner_key.ok_or(EINVAL)?,
                request.force.unwrap_or(false),
            );
            Ok(Response::ok())
        }
        "lacp_selection_release" => {
            handle.lacp_selection_release(
                request.request_id.ok_or(EINVAL)?,
                request.port_id.ok_or(EINVAL)?,
            );
            Ok(Response::ok())
        }
        "dump" => {
            let path = request.path.as_deref().ok_or(EINVAL)?;
            reply(handle.dump(Path::new(path)))
        }
        "deinit" => {
            handle.shutdown();
            Ok(Response::ok())
        }
        other => {
            debug!(target: "rpc", "Unknown command {:?}", other);
            Err(EINVAL)
        }
    }
}

/// Serve requests on `path` until the listener is closed. Each connection
/// gets its own thread.
pub fn serve(path: &Path, handle: Handle) -> std::io::Result<()> {
    // A previous daemon may have left its socket behind.
    std::fs::remove_file(path).ok();
    let listener = UnixListener::bind(path)?;
    info!(target: "rpc", "Serving on {}", path.display());

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target: "rpc", "Accept failed: {}", err);
                continue;
            }
        };
        let handle = handle.clone();

        thread::Builder::new()
            .name("rpc-conn".to_owned())
            .spawn(move || {
                if let Err(err) = serve_connection(stream, handle) {
                    debug!(target: "rpc", "Connection ended: {}", err);
                }
            })
            .expect("spawn rpc connection thread");
    }
    Ok(())
}

fn serve_connection(mut stream: UnixStream, handle: Handle) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_REQUEST_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }

        let mut body = vec![0u8; length];
        stream.read_exact(&mut body)?;

        let response = match std::str::from_utf8(&body)
            .ok()
            .and_then(|text| json::from_str::<Request>(text).ok())
        {
            Some(request) => {
                trace!(target: "rpc", "Request: {:?}", request.cmd);
                dispatch(&handle, &request)
            }
            None => Response::err(EINVAL),
        };

        let body = json::to_string(&response);
        stream.write_all(&(body.len() as u32).to_be_bytes())?;
        stream.write_all(body.as_bytes())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decoding() {
        let request: Request =
            json::from_str(r#"{"cmd": "port_add", "port_id": 42}"#).unwrap();
        assert_eq!(request.cmd, "port_add");
        assert_eq!(request.port_id, Some(42));
        assert_eq!(request.vlan, None);
    }

    #[test]
    fn test_vlan_bounds_rejected() {
        assert_eq!(parse_vlan(Some(0)), Err(EINVAL));
        assert_eq!(parse_vlan(Some(4096)), Err(EINVAL));
        assert!(parse_vlan(Some(4095)).is_ok());
    }

    #[test]
    fn test_ipv6_rejected_with_family_error() {
        assert_eq!(parse_ip(&Some("fe80::1".to_owned())), Err(EAFNOSUPPORT));
        assert_eq!(parse_ip(&Some("not-an-ip".to_owned())), Err(EINVAL));
        assert_eq!(
            parse_ip(&Some("10.0.0.1".to_owned())),
            Ok(Some(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }
}
