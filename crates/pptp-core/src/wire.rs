//! Byte layout of PPTP control messages, GRE units and the IPv4 header
//! in front of raw GRE packets.
//!
//! Control header:
//!
//! ```text
//! [0:2)  total length (big-endian)
//! [2:4)  message kind, 00 01 = control
//! [4:8)  magic cookie: 1A 2B 3C 4D (control) or 1B 2C 3D 4E (PPTP-IN-TCP)
//! [8:10) control message type
//! ```
//!
//! Call ids inside messages and GRE units are read and written as
//! little-endian 16-bit values.

use std::net::Ipv4Addr;

use crate::ids::CallId;

pub const MESSAGE_KIND_OFFSET: usize = 2;
pub const MAGIC_OFFSET: usize = 4;
pub const MESSAGE_TYPE_OFFSET: usize = 8;
pub const CONTROL_HEADER_LEN: usize = 10;

pub const MESSAGE_KIND_CONTROL: [u8; 2] = [0x00, 0x01];
pub const CONTROL_MAGIC: [u8; 4] = [0x1A, 0x2B, 0x3C, 0x4D];
pub const WRAP_MAGIC: [u8; 4] = [0x1B, 0x2C, 0x3D, 0x4E];

/// Start-Control-Connection messages are padded up to this length.
pub const START_CONTROL_MIN_LEN: usize = 156;
pub const CAPABILITY_MARKER_OFFSET: usize = 92;
pub const CAPABILITY_MARKER: &[u8] = b"PPTP-IN-TCP";

/// Call id of Outgoing-Call, Call-Clear, Disconnect, WAN-Error, Set-Link-Info.
pub const CALL_ID_OFFSET: usize = 12;
/// Peer id (reply) or serial number (request) of Outgoing-Call messages.
pub const PEER_ID_OFFSET: usize = 14;

pub const GRE_CALL_ID_OFFSET: usize = 6;
pub const GRE_MIN_LEN: usize = 8;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPPROTO_GRE: u8 = 47;
const IPV4_DEFAULT_TTL: u8 = 64;

/// Control message types the relay acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    StartControlRequest,
    StartControlReply,
    OutgoingCallRequest,
    OutgoingCallReply,
    CallClearRequest,
    CallDisconnectNotify,
    WanErrorNotify,
    SetLinkInfo,
    /// Any other type; forwarded untouched.
    Other(u16),
}

impl ControlType {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x01 => Self::StartControlRequest,
            0x02 => Self::StartControlReply,
            0x07 => Self::OutgoingCallRequest,
            0x08 => Self::OutgoingCallReply,
            0x0C => Self::CallClearRequest,
            0x0D => Self::CallDisconnectNotify,
            0x0E => Self::WanErrorNotify,
            0x0F => Self::SetLinkInfo,
            other => Self::Other(other),
        }
    }
}

/// What a buffer read from a control socket turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control(ControlType),
    /// A GRE unit tunneled over the control connection.
    Wrapped,
    /// Too short or not carrying a known magic cookie.
    Unrecognized,
}

/// Classify a buffer by its header.
pub fn classify(buf: &[u8]) -> FrameKind {
    if buf.len() < MAGIC_OFFSET + 4 || buf[MESSAGE_KIND_OFFSET..MAGIC_OFFSET] != MESSAGE_KIND_CONTROL {
        return FrameKind::Unrecognized;
    }
    let magic = &buf[MAGIC_OFFSET..MAGIC_OFFSET + 4];
    if magic == WRAP_MAGIC {
        FrameKind::Wrapped
    } else if magic == CONTROL_MAGIC && buf.len() >= CONTROL_HEADER_LEN {
        let code = u16::from_be_bytes([buf[MESSAGE_TYPE_OFFSET], buf[MESSAGE_TYPE_OFFSET + 1]]);
        FrameKind::Control(ControlType::from_code(code))
    } else {
        FrameKind::Unrecognized
    }
}

/// Read a little-endian 16-bit call id. `None` if the field is out of bounds.
pub fn read_call_id(buf: &[u8], offset: usize) -> Option<CallId> {
    let field = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([field[0], field[1]]) as CallId)
}

/// Write the low 16 bits of `id` as little-endian. Returns `false` if the
/// field is out of bounds.
pub fn write_call_id(buf: &mut [u8], offset: usize, id: CallId) -> bool {
    match buf.get_mut(offset..offset + 2) {
        Some(field) => {
            field.copy_from_slice(&(id as u16).to_le_bytes());
            true
        }
        None => false,
    }
}

/// Zero-pad a Start-Control-Connection message to its minimum length.
pub fn pad_start_control(buf: &mut Vec<u8>) {
    if buf.len() < START_CONTROL_MIN_LEN {
        buf.resize(START_CONTROL_MIN_LEN, 0);
    }
}

/// Whether the NUL-terminated string at the marker offset is the
/// PPTP-IN-TCP capability marker.
pub fn has_capability_marker(buf: &[u8]) -> bool {
    let end = CAPABILITY_MARKER_OFFSET + CAPABILITY_MARKER.len();
    buf.get(CAPABILITY_MARKER_OFFSET..end) == Some(CAPABILITY_MARKER) && buf.get(end) == Some(&0)
}

/// Write the marker and its terminating NUL. The buffer must already be padded.
pub fn write_capability_marker(buf: &mut [u8]) {
    let end = CAPABILITY_MARKER_OFFSET + CAPABILITY_MARKER.len();
    if buf.len() > end {
        buf[CAPABILITY_MARKER_OFFSET..end].copy_from_slice(CAPABILITY_MARKER);
        buf[end] = 0;
    }
}

/// Blank out a marker so it is not advertised downstream.
pub fn clear_capability_marker(buf: &mut [u8]) {
    if has_capability_marker(buf) {
        let end = CAPABILITY_MARKER_OFFSET + CAPABILITY_MARKER.len();
        buf[CAPABILITY_MARKER_OFFSET..=end].fill(0);
    }
}

/// Length of a leading IPv4 header, or 0 if the packet does not start with one.
pub fn ipv4_header_len(packet: &[u8]) -> usize {
    match packet.first() {
        Some(b) if b & 0xF0 == 0x40 => ((b & 0x0F) as usize) * 4,
        _ => 0,
    }
}

/// Source address of a packet that starts with an IPv4 header.
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if ipv4_header_len(packet) < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let src = packet.get(12..16)?;
    Some(Ipv4Addr::new(src[0], src[1], src[2], src[3]))
}

/// Locate the GRE unit inside a packet: returns its offset, skipping an
/// IPv4 header if one is present.
pub fn gre_unit_offset(packet: &[u8]) -> Option<usize> {
    let offset = ipv4_header_len(packet);
    if packet.len() < offset + GRE_MIN_LEN {
        return None;
    }
    Some(offset)
}

/// Patch the IPv4 header of a packet about to be re-sent on a
/// header-included raw socket. Identification and checksum are zeroed so the
/// kernel fills them in; a source of `0.0.0.0` lets the kernel pick one.
pub fn rewrite_ipv4_header(packet: &mut [u8], source: Ipv4Addr, destination: Ipv4Addr) {
    if packet.len() < IPV4_MIN_HEADER_LEN {
        return;
    }
    let total = packet.len().min(u16::MAX as usize) as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[4..6].fill(0);
    packet[10..12].fill(0);
    packet[12..16].copy_from_slice(&source.octets());
    packet[16..20].copy_from_slice(&destination.octets());
}

/// Build a GRE-over-IPv4 packet around a bare GRE unit.
pub fn build_ipv4_packet(unit: &[u8], source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
    packet[0] = 0x45;
    packet[8] = IPV4_DEFAULT_TTL;
    packet[9] = IPPROTO_GRE;
    packet.extend_from_slice(unit);
    rewrite_ipv4_header(&mut packet, source, destination);
    packet
}
