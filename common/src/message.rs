//! Peer-channel wire protocol.
//!
//! Every control message carries a dense `u16` opcode followed by its
//! payload; multi-byte fields travel big-endian. Framing (the 4-byte length
//! prefix) is the transport's job, this module only encodes and decodes
//! payloads.
//!
//! The heartbeat datagram is not framed; it is a fixed 12-byte packed
//! payload of its own, defined here as [`HeartbeatPayload`].

use std::io::{self, Read, Write};

use nonempty::NonEmpty;
use thiserror::Error;

use crate::counters::MessageClass;
use crate::peer::{MlagId, SystemId};
use crate::topology::VlanId;
use crate::{LinkState, PortId};

/// Largest frame the channel will accept.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A wire protocol error.
#[derive(Error, Debug)]
pub enum Error {
    /// Opcode not part of the protocol.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// Payload ended before the message was complete.
    #[error("truncated message")]
    Truncated,
    /// A field held a value outside its domain.
    #[error("invalid {0}")]
    InvalidField(&'static str),
    /// A batched message arrived with no entries.
    #[error("empty batch")]
    EmptyBatch,
    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Message opcodes. The values are wire protocol; renumbering is a
/// protocol change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    SyncStart = 10,
    SyncFinish = 11,
    MasterSyncDone = 12,
    VlanLocalState = 20,
    VlanGlobalState = 21,
    LacpSelection = 30,
    LacpRelease = 31,
    LacpSync = 32,
    LacpSysIdUpdate = 33,
    PortOperState = 40,
    PortSync = 41,
    IgmpTunnel = 50,
    XstpTunnel = 51,
    FdbSync = 52,
}

impl TryFrom<u16> for Opcode {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self, Error> {
        let opcode = match v {
            10 => Self::SyncStart,
            11 => Self::SyncFinish,
            12 => Self::MasterSyncDone,
            20 => Self::VlanLocalState,
            21 => Self::VlanGlobalState,
            30 => Self::LacpSelection,
            31 => Self::LacpRelease,
            32 => Self::LacpSync,
            33 => Self::LacpSysIdUpdate,
            40 => Self::PortOperState,
            41 => Self::PortSync,
            50 => Self::IgmpTunnel,
            51 => Self::XstpTunnel,
            52 => Self::FdbSync,
            other => return Err(Error::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Things that can write themselves to a byte stream in wire order.
pub trait Encode {
    /// Encode into `w`, returning the number of bytes written.
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize>;

    /// Encode into a fresh buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf)
            .expect("in-memory encoding doesn't fail");
        buf
    }
}

/// Things that can read themselves from a byte stream in wire order.
pub trait Decode: Sized {
    /// Decode from `r`.
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error>;

    /// Decode from a complete buffer.
    fn from_slice(buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = buf;
        Self::decode(&mut cursor)
    }
}

mod wire {
    //! Primitive big-endian readers and writers.

    use super::*;

    pub fn put_u8<W: Write>(w: &mut W, v: u8) -> io::Result<usize> {
        w.write_all(&[v])?;
        Ok(1)
    }

    pub fn put_u16<W: Write>(w: &mut W, v: u16) -> io::Result<usize> {
        w.write_all(&v.to_be_bytes())?;
        Ok(2)
    }

    pub fn put_u32<W: Write>(w: &mut W, v: u32) -> io::Result<usize> {
        w.write_all(&v.to_be_bytes())?;
        Ok(4)
    }

    pub fn put_u64<W: Write>(w: &mut W, v: u64) -> io::Result<usize> {
        w.write_all(&v.to_be_bytes())?;
        Ok(8)
    }

    pub fn put_bytes<W: Write>(w: &mut W, v: &[u8]) -> io::Result<usize> {
        let n = put_u32(w, v.len() as u32)?;
        w.write_all(v)?;
        Ok(n + v.len())
    }

    pub fn get_u8<R: Read>(r: &mut R) -> Result<u8, Error> {
        let mut buf = [0; 1];
        r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
        Ok(buf[0])
    }

    pub fn get_u16<R: Read>(r: &mut R) -> Result<u16, Error> {
        let mut buf = [0; 2];
        r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn get_u32<R: Read>(r: &mut R) -> Result<u32, Error> {
        let mut buf = [0; 4];
        r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn get_u64<R: Read>(r: &mut R) -> Result<u64, Error> {
        let mut buf = [0; 8];
        r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn get_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
        let len = get_u32(r)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::InvalidField("byte string length"));
        }
        let mut buf = vec![0; len];
        r.read_exact(&mut buf).map_err(|_| Error::Truncated)?;
        Ok(buf)
    }

    pub fn get_bool<R: Read>(r: &mut R) -> Result<bool, Error> {
        match get_u8(r)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidField("boolean")),
        }
    }

    pub fn get_link_state<R: Read>(r: &mut R) -> Result<LinkState, Error> {
        match get_u8(r)? {
            0 => Ok(LinkState::Down),
            1 => Ok(LinkState::Up),
            _ => Err(Error::InvalidField("link state")),
        }
    }
}

use wire::*;

/// The subsystems that run a per-peer sync phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncKind {
    /// MLAG port table.
    Ports = 0,
    /// L3 VLAN interface state.
    L3 = 1,
    /// FDB (MAC) table.
    Mac = 2,
    /// LACP aggregator attributes.
    Lacp = 3,
}

impl SyncKind {
    /// All sync phases, in the order they are started.
    pub const ALL: [SyncKind; 4] = [Self::Ports, Self::L3, Self::Mac, Self::Lacp];

    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ports => "ports",
            Self::L3 => "l3",
            Self::Mac => "mac",
            Self::Lacp => "lacp",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn get_sync_kind<R: Read>(r: &mut R) -> Result<SyncKind, Error> {
    match get_u8(r)? {
        0 => Ok(SyncKind::Ports),
        1 => Ok(SyncKind::L3),
        2 => Ok(SyncKind::Mac),
        3 => Ok(SyncKind::Lacp),
        _ => Err(Error::InvalidField("sync kind")),
    }
}

/// How an MLAG port bundles its members.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PortMode {
    /// Statically aggregated.
    Static = 0,
    /// LACP negotiated.
    Lacp = 1,
}

impl PortMode {
    /// Short string form, used in dumps and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Lacp => "lacp",
        }
    }
}

fn get_port_mode<R: Read>(r: &mut R) -> Result<PortMode, Error> {
    match get_u8(r)? {
        0 => Ok(PortMode::Static),
        1 => Ok(PortMode::Lacp),
        _ => Err(Error::InvalidField("port mode")),
    }
}

/// Verdict of an aggregator selection request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SelectionResponse {
    /// The requester may use the aggregator.
    Accept = 0,
    /// The aggregator is held with other partner attributes.
    Decline = 1,
}

/// One VLAN's operational state, as carried in batched state changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VlanStateEntry {
    /// The VLAN.
    pub vlan: VlanId,
    /// Its state.
    pub state: LinkState,
}

impl Encode for VlanStateEntry {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        Ok(put_u16(w, self.vlan.as_u16())? + put_u8(w, self.state as u8)?)
    }
}

impl Decode for VlanStateEntry {
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let vlan = VlanId::new(get_u16(r)?).map_err(|_| Error::InvalidField("vlan id"))?;
        let state = get_link_state(r)?;

        Ok(Self { vlan, state })
    }
}

/// An aggregator selection request or response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LacpSelection {
    /// `false` for a request, `true` for the master's verdict.
    pub is_response: bool,
    /// Verdict; only meaningful on responses.
    pub response: SelectionResponse,
    /// Requester asks to evict a mismatched holder.
    pub force: bool,
    /// `true` to select the aggregator, `false` to release it.
    pub select: bool,
    /// The requesting chassis.
    pub mlag_id: MlagId,
    /// Caller-chosen id echoed in the response.
    pub request_id: u32,
    /// Port the partner is attached to.
    pub port_id: PortId,
    /// LACP partner system id.
    pub partner_id: SystemId,
    /// LACP partner aggregation key.
    pub partner_key: u16,
}

impl Encode for LacpSelection {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = 0;
        n += put_u8(w, self.is_response as u8)?;
        n += put_u8(w, self.response as u8)?;
        n += put_u8(w, self.force as u8)?;
        n += put_u8(w, self.select as u8)?;
        n += put_u8(w, self.mlag_id.0)?;
        n += put_u32(w, self.request_id)?;
        n += put_u64(w, self.port_id)?;
        n += put_u64(w, self.partner_id)?;
        n += put_u16(w, self.partner_key)?;

        Ok(n)
    }
}

impl Decode for LacpSelection {
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            is_response: get_bool(r)?,
            response: match get_u8(r)? {
                0 => SelectionResponse::Accept,
                1 => SelectionResponse::Decline,
                _ => return Err(Error::InvalidField("selection response")),
            },
            force: get_bool(r)?,
            select: get_bool(r)?,
            mlag_id: MlagId(get_u8(r)?),
            request_id: get_u32(r)?,
            port_id: get_u64(r)?,
            partner_id: get_u64(r)?,
            partner_key: get_u16(r)?,
        })
    }
}

/// One aggregator entry, as shipped during LACP sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LacpEntrySnapshot {
    /// Port owning the aggregator.
    pub port_id: PortId,
    /// Current partner system id.
    pub partner_id: SystemId,
    /// Current partner key.
    pub partner_key: u16,
    /// Bitmap of chassis using the entry, bit = `mlag_id`.
    pub peer_uses: u8,
}

impl Encode for LacpEntrySnapshot {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        Ok(put_u64(w, self.port_id)?
            + put_u64(w, self.partner_id)?
            + put_u16(w, self.partner_key)?
            + put_u8(w, self.peer_uses)?)
    }
}

impl Decode for LacpEntrySnapshot {
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            port_id: get_u64(r)?,
            partner_id: get_u64(r)?,
            partner_key: get_u16(r)?,
            peer_uses: get_u8(r)?,
        })
    }
}

/// One MLAG port's membership, as shipped during port sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortMember {
    /// The port.
    pub port_id: PortId,
    /// Its aggregation mode.
    pub mode: PortMode,
    /// Its local operational state on the sending chassis.
    pub oper_state: LinkState,
}

impl Encode for PortMember {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        Ok(put_u64(w, self.port_id)?
            + put_u8(w, self.mode as u8)?
            + put_u8(w, self.oper_state as u8)?)
    }
}

impl Decode for PortMember {
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            port_id: get_u64(r)?,
            mode: get_port_mode(r)?,
            oper_state: get_link_state(r)?,
        })
    }
}

/// A peer-channel control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Slave opens a subsystem's sync phase.
    SyncStart {
        /// Subsystem being synced.
        kind: SyncKind,
        /// The slave's id.
        peer_id: MlagId,
    },
    /// Slave has applied the master's snapshot.
    SyncFinish {
        /// Subsystem being synced.
        kind: SyncKind,
        /// The slave's id.
        peer_id: MlagId,
    },
    /// Master has finished shipping its snapshot for a subsystem.
    MasterSyncDone {
        /// Subsystem being synced.
        kind: SyncKind,
    },
    /// Batched local VLAN state, slave to master.
    VlanLocalState {
        /// Reporting chassis.
        peer_id: MlagId,
        /// The changed VLANs. Never sent empty.
        entries: NonEmpty<VlanStateEntry>,
    },
    /// Batched global VLAN state diff, master to peers.
    VlanGlobalState {
        /// Chassis whose report triggered the diff.
        peer_id: MlagId,
        /// The changed VLANs. Never sent empty.
        entries: NonEmpty<VlanStateEntry>,
    },
    /// Aggregator selection request/response.
    LacpSelection(LacpSelection),
    /// An aggregator has no more users.
    LacpRelease {
        /// Port whose aggregator became free.
        port_id: PortId,
    },
    /// Master's aggregator table, shipped during LACP sync.
    LacpSync {
        /// The master's actor system id.
        master_sys_id: SystemId,
        /// Current aggregator entries.
        entries: Vec<LacpEntrySnapshot>,
    },
    /// The actor system id changed.
    LacpSysIdUpdate {
        /// New actor system id.
        sys_id: SystemId,
    },
    /// A remote MLAG port changed operational state.
    PortOperState {
        /// Reporting chassis.
        peer_id: MlagId,
        /// The port.
        port_id: PortId,
        /// Its new state.
        state: LinkState,
    },
    /// MLAG port membership snapshot, shipped during port sync.
    PortSync {
        /// Reporting chassis.
        peer_id: MlagId,
        /// Its configured MLAG ports.
        ports: Vec<PortMember>,
    },
    /// Opaque tunneled IGMP PDU.
    IgmpTunnel(Vec<u8>),
    /// Opaque tunneled xSTP PDU.
    XstpTunnel(Vec<u8>),
    /// Opaque FDB sync payload, relayed to the MAC collaborator.
    FdbSync(Vec<u8>),
}

impl Message {
    /// The message's opcode.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::SyncStart { .. } => Opcode::SyncStart,
            Self::SyncFinish { .. } => Opcode::SyncFinish,
            Self::MasterSyncDone { .. } => Opcode::MasterSyncDone,
            Self::VlanLocalState { .. } => Opcode::VlanLocalState,
            Self::VlanGlobalState { .. } => Opcode::VlanGlobalState,
            Self::LacpSelection(_) => Opcode::LacpSelection,
            Self::LacpRelease { .. } => Opcode::LacpRelease,
            Self::LacpSync { .. } => Opcode::LacpSync,
            Self::LacpSysIdUpdate { .. } => Opcode::LacpSysIdUpdate,
            Self::PortOperState { .. } => Opcode::PortOperState,
            Self::PortSync { .. } => Opcode::PortSync,
            Self::IgmpTunnel(_) => Opcode::IgmpTunnel,
            Self::XstpTunnel(_) => Opcode::XstpTunnel,
            Self::FdbSync(_) => Opcode::FdbSync,
        }
    }

    /// The accounting class the message belongs to.
    pub fn class(&self) -> MessageClass {
        match self {
            Self::IgmpTunnel(_) => MessageClass::IgmpTunnel,
            Self::XstpTunnel(_) => MessageClass::XstpTunnel,
            Self::FdbSync(_) => MessageClass::FdbSync,
            Self::LacpSelection(_)
            | Self::LacpRelease { .. }
            | Self::LacpSync { .. }
            | Self::LacpSysIdUpdate { .. } => MessageClass::Lacp,
            Self::PortOperState { .. } | Self::PortSync { .. } => MessageClass::PortNotification,
            _ => MessageClass::Notification,
        }
    }
}

fn put_vlan_batch<W: Write>(w: &mut W, entries: &NonEmpty<VlanStateEntry>) -> io::Result<usize> {
    let mut n = put_u16(w, entries.len() as u16)?;
    for entry in entries.iter() {
        n += entry.encode(w)?;
    }
    Ok(n)
}

fn get_vlan_batch<R: Read>(r: &mut R) -> Result<NonEmpty<VlanStateEntry>, Error> {
    let count = get_u16(r)? as usize;
    let mut entries = Vec::with_capacity(count.min(VlanId::MAX as usize));
    for _ in 0..count {
        entries.push(VlanStateEntry::decode(r)?);
    }
    NonEmpty::from_vec(entries).ok_or(Error::EmptyBatch)
}

impl Encode for Message {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut n = put_u16(w, self.opcode() as u16)?;

        match self {
            Self::SyncStart { kind, peer_id } | Self::SyncFinish { kind, peer_id } => {
                n += put_u8(w, *kind as u8)?;
                n += put_u8(w, peer_id.0)?;
            }
            Self::MasterSyncDone { kind } => {
                n += put_u8(w, *kind as u8)?;
            }
            Self::VlanLocalState { peer_id, entries }
            | Self::VlanGlobalState { peer_id, entries } => {
                n += put_u8(w, peer_id.0)?;
                n += put_vlan_batch(w, entries)?;
            }
            Self::LacpSelection(selection) => {
                n += selection.encode(w)?;
            }
            Self::LacpRelease { port_id } => {
                n += put_u64(w, *port_id)?;
            }
            Self::LacpSync {
                master_sys_id,
                entries,
            } => {
                n += put_u64(w, *master_sys_id)?;
                n += put_u16(w, entries.len() as u16)?;
                for entry in entries {
                    n += entry.encode(w)?;
                }
            }
            Self::LacpSysIdUpdate { sys_id } => {
                n += put_u64(w, *sys_id)?;
            }
            Self::PortOperState {
                peer_id,
                port_id,
                state,
            } => {
                n += put_u8(w, peer_id.0)?;
                n += put_u64(w, *port_id)?;
                n += put_u8(w, *state as u8)?;
            }
            Self::PortSync { peer_id, ports } => {
                n += put_u8(w, peer_id.0)?;
                n += put_u16(w, ports.len() as u16)?;
                for port in ports {
                    n += port.encode(w)?;
                }
            }
            Self::IgmpTunnel(pdu) | Self::XstpTunnel(pdu) | Self::FdbSync(pdu) => {
                n += put_bytes(w, pdu)?;
            }
        }

        Ok(n)
    }
}

impl Decode for Message {
    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let opcode = Opcode::try_from(get_u16(r)?)?;

        let message = match opcode {
            Opcode::SyncStart => Self::SyncStart {
                kind: get_sync_kind(r)?,
                peer_id: MlagId(get_u8(r)?),
            },
            Opcode::SyncFinish => Self::SyncFinish {
                kind: get_sync_kind(r)?,
                peer_id: MlagId(get_u8(r)?),
            },
            Opcode::MasterSyncDone => Self::MasterSyncDone {
                kind: get_sync_kind(r)?,
            },
            Opcode::VlanLocalState => Self::VlanLocalState {
                peer_id: MlagId(get_u8(r)?),
                entries: get_vlan_batch(r)?,
            },
            Opcode::VlanGlobalState => Self::VlanGlobalState {
                peer_id: MlagId(get_u8(r)?),
                entries: get_vlan_batch(r)?,
            },
            Opcode::LacpSelection => Self::LacpSelection(LacpSelection::decode(r)?),
            Opcode::LacpRelease => Self::LacpRelease {
                port_id: get_u64(r)?,
            },
            Opcode::LacpSync => {
                let master_sys_id = get_u64(r)?;
                let count = get_u16(r)? as usize;
                let mut entries = Vec::with_capacity(count.min(crate::MAX_PORTS));
                for _ in 0..count {
                    entries.push(LacpEntrySnapshot::decode(r)?);
                }
                Self::LacpSync {
                    master_sys_id,
                    entries,
                }
            }
            Opcode::LacpSysIdUpdate => Self::LacpSysIdUpdate {
                sys_id: get_u64(r)?,
            },
            Opcode::PortOperState => Self::PortOperState {
                peer_id: MlagId(get_u8(r)?),
                port_id: get_u64(r)?,
                state: get_link_state(r)?,
            },
            Opcode::PortSync => {
                let peer_id = MlagId(get_u8(r)?);
                let count = get_u16(r)? as usize;
                let mut ports = Vec::with_capacity(count.min(crate::MAX_PORTS));
                for _ in 0..count {
                    ports.push(PortMember::decode(r)?);
                }
                Self::PortSync { peer_id, ports }
            }
            Opcode::IgmpTunnel => Self::IgmpTunnel(get_bytes(r)?),
            Opcode::XstpTunnel => Self::XstpTunnel(get_bytes(r)?),
            Opcode::FdbSync => Self::FdbSync(get_bytes(r)?),
        };

        Ok(message)
    }
}

/// The UDP keepalive datagram. Exactly 12 bytes packed.
///
/// The sequence number travels big-endian. The system id travels in the
/// sender's native byte order: MLAG pairs are same-model chassis, so both
/// ends agree, and the id is only ever compared for equality.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Sender's chassis identity.
    pub system_id: SystemId,
    /// Per-peer transmit sequence.
    pub sequence: u16,
    /// Sender reports its own fault; forces the receiver down.
    pub local_defect: bool,
    /// Sender echoes that it considers the receiver down.
    pub remote_defect: bool,
}

impl HeartbeatPayload {
    /// Packed size on the wire.
    pub const SIZE: usize = 12;

    /// Pack into wire form.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0; Self::SIZE];
        buf[0..8].copy_from_slice(&self.system_id.to_ne_bytes());
        buf[8..10].copy_from_slice(&self.sequence.to_be_bytes());
        buf[10] = self.local_defect as u8;
        buf[11] = self.remote_defect as u8;
        buf
    }

    /// Unpack from wire form. Anything but exactly [`Self::SIZE`] bytes is
    /// rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::SIZE {
            return Err(Error::Truncated);
        }
        Ok(Self {
            system_id: SystemId::from_ne_bytes(buf[0..8].try_into().expect("length checked")),
            sequence: u16::from_be_bytes(buf[8..10].try_into().expect("length checked")),
            local_defect: buf[10] != 0,
            remote_defect: buf[11] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.to_vec();
        let decoded = Message::from_slice(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_message_roundtrip() {
        roundtrip(Message::SyncStart {
            kind: SyncKind::Lacp,
            peer_id: MlagId::SLAVE,
        });
        roundtrip(Message::VlanGlobalState {
            peer_id: MlagId::MASTER,
            entries: NonEmpty::from((
                VlanStateEntry {
                    vlan: VlanId::new(10).unwrap(),
                    state: LinkState::Up,
                },
                vec![VlanStateEntry {
                    vlan: VlanId::new(30).unwrap(),
                    state: LinkState::Down,
                }],
            )),
        });
        roundtrip(Message::LacpSelection(LacpSelection {
            is_response: true,
            response: SelectionResponse::Decline,
            force: false,
            select: true,
            mlag_id: MlagId::SLAVE,
            request_id: 77,
            port_id: 42,
            partner_id: 0xaabbccdd,
            partner_key: 7,
        }));
        roundtrip(Message::LacpSync {
            master_sys_id: 0x1122334455667788,
            entries: vec![LacpEntrySnapshot {
                port_id: 42,
                partner_id: 9,
                partner_key: 3,
                peer_uses: 0b11,
            }],
        });
        roundtrip(Message::PortSync {
            peer_id: MlagId::SLAVE,
            ports: vec![PortMember {
                port_id: 601,
                mode: PortMode::Lacp,
                oper_state: LinkState::Up,
            }],
        });
        roundtrip(Message::FdbSync(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_empty_vlan_batch_rejected() {
        // Opcode 20, peer 1, zero entries.
        let buf = [0, 20, 1, 0, 0];
        assert!(matches!(
            Message::from_slice(&buf),
            Err(Error::EmptyBatch)
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let buf = [0xff, 0xff];
        assert!(matches!(
            Message::from_slice(&buf),
            Err(Error::UnknownOpcode(0xffff))
        ));
    }

    #[test]
    fn test_truncated_message() {
        let msg = Message::LacpRelease { port_id: 42 };
        let encoded = msg.to_vec();
        assert!(matches!(
            Message::from_slice(&encoded[..encoded.len() - 1]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn test_heartbeat_payload_packing() {
        let payload = HeartbeatPayload {
            system_id: 0xdeadbeef,
            sequence: 0x0102,
            local_defect: false,
            remote_defect: true,
        };
        let bytes = payload.to_bytes();

        assert_eq!(bytes.len(), HeartbeatPayload::SIZE);
        assert_eq!(&bytes[8..10], &[0x01, 0x02]);
        assert_eq!(bytes[10], 0);
        assert_eq!(bytes[11], 1);
        assert_eq!(HeartbeatPayload::from_bytes(&bytes).unwrap(), payload);
        assert!(HeartbeatPayload::from_bytes(&bytes[..11]).is_err());
    }
}
