//! GRE data plane: receives GRE datagrams on a raw socket, resolves the link
//! they belong to, rewrites the call id and delivers them to the other side.
//!
//! Delivery takes one of two paths:
//!
//! - **Raw**: the IPv4 header is rewritten (or built, for units that arrived
//!   over PPTP-IN-TCP) and the datagram is sent on the header-included raw
//!   socket through a [`DatagramSink`].
//! - **Wrapped**: the bare GRE unit is framed with the PPTP-IN-TCP header and
//!   written to the destination side's control channel. The write is given
//!   [`FRAME_WRITE_TIMEOUT`]; a frame for an endpoint that is not reading is
//!   dropped rather than holding up every other link.

use crate::registry::{LinkRegistry, Route};
use pptp_core::wire::{
    build_ipv4_packet, gre_unit_offset, ipv4_source, read_call_id, rewrite_ipv4_header,
    write_call_id, GRE_CALL_ID_OFFSET, GRE_MIN_LEN, IPPROTO_GRE,
};
use pptp_core::{wrap_gre_unit, ProxyError, ProxyResult};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, warn};

/// Largest datagram read from the raw socket.
const MAX_DATAGRAM: usize = 65535;

/// How long a PPTP-IN-TCP frame may wait for its control channel.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Outbound half of the raw GRE socket.
pub trait DatagramSink: Send + Sync {
    /// Send a complete IPv4 packet (header included) to `destination`.
    fn send_datagram(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize>;
}

/// Raw IPv4 socket bound to protocol 47 with `IP_HDRINCL` set.
///
/// Requires `CAP_NET_RAW`.
pub struct GreSocket {
    fd: AsyncFd<Socket>,
}

impl GreSocket {
    pub fn open() -> ProxyResult<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(IPPROTO_GRE as i32)),
        )?;
        socket.set_header_included_v4(true)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }

    /// Receive one datagram, IPv4 header included.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl DatagramSink for GreSocket {
    fn send_datagram(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(destination, 0)));
        self.fd.get_ref().send_to(packet, &addr)
    }
}

/// Resolves and delivers GRE units for every live link.
///
/// Shared between the GRE receive task (raw datagrams) and the dispatch loop
/// (units unwrapped from PPTP-IN-TCP frames).
pub struct DataPlane {
    registry: Arc<LinkRegistry>,
    sink: Arc<dyn DatagramSink>,
    packet_dump: bool,
}

impl DataPlane {
    /// Create a data plane over the shared registry.
    ///
    /// # Arguments
    ///
    /// * `registry` - Links to resolve units against; only ever read here.
    /// * `sink` - Where raw datagrams go; the [`GreSocket`] in production.
    /// * `packet_dump` - Dump every delivered unit at trace level.
    pub fn new(registry: Arc<LinkRegistry>, sink: Arc<dyn DatagramSink>, packet_dump: bool) -> Self {
        Self {
            registry,
            sink,
            packet_dump,
        }
    }

    /// Handle one datagram read from the raw socket. The source is taken
    /// from its IPv4 header.
    pub async fn forward_packet(&self, packet: &[u8]) -> ProxyResult<()> {
        let source = ipv4_source(packet)
            .ok_or_else(|| ProxyError::Malformed("GRE datagram without an IPv4 header".into()))?;
        let offset = gre_unit_offset(packet).ok_or_else(|| {
            ProxyError::Malformed(format!("GRE datagram of {} bytes is too short", packet.len()))
        })?;
        self.deliver(packet.to_vec(), offset, source).await
    }

    /// Handle a bare GRE unit unwrapped from a PPTP-IN-TCP frame sent by
    /// the endpoint at `source`.
    pub async fn forward_unit(&self, unit: &[u8], source: Ipv4Addr) -> ProxyResult<()> {
        if unit.len() < GRE_MIN_LEN {
            return Err(ProxyError::Malformed(format!(
                "GRE unit of {} bytes is too short",
                unit.len()
            )));
        }
        self.deliver(unit.to_vec(), 0, source).await
    }

    async fn deliver(&self, mut packet: Vec<u8>, offset: usize, source: Ipv4Addr) -> ProxyResult<()> {
        let id_offset = offset + GRE_CALL_ID_OFFSET;
        let call_id = read_call_id(&packet, id_offset)
            .ok_or_else(|| ProxyError::Malformed("GRE unit without a call id".into()))?;

        let route = self
            .registry
            .find_peer(source, call_id)
            .await
            .ok_or(ProxyError::UnknownPeer {
                source_addr: source,
                call_id,
            })?;

        write_call_id(&mut packet, id_offset, route.real_id);
        debug!(
            source = %source,
            destination = %route.destination,
            call_id = format_args!("0x{call_id:X}"),
            real_id = format_args!("0x{:X}", route.real_id),
            wrapped = route.wrap,
            "GRE unit"
        );
        if self.packet_dump {
            crate::dump_packet("GRE", &packet[offset..]);
        }

        if route.wrap {
            self.send_wrapped(&route, &packet[offset..]).await
        } else {
            self.send_raw(&route, packet, offset)
        }
    }

    async fn send_wrapped(&self, route: &Route, unit: &[u8]) -> ProxyResult<()> {
        let frame = wrap_gre_unit(unit)?;
        route
            .link
            .channel(route.side)
            .write_all_within(&frame, FRAME_WRITE_TIMEOUT)
            .await?;
        Ok(())
    }

    fn send_raw(&self, route: &Route, mut packet: Vec<u8>, offset: usize) -> ProxyResult<()> {
        let source = route.spoof_source.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let datagram = if offset > 0 {
            rewrite_ipv4_header(&mut packet, source, route.destination);
            packet
        } else {
            build_ipv4_packet(&packet, source, route.destination)
        };
        self.sink.send_datagram(&datagram, route.destination)?;
        Ok(())
    }

    /// Receive loop of the GRE task. Per-packet failures are logged and the
    /// packet dropped; only a receive error on the socket ends the loop.
    pub async fn run(self: Arc<Self>, socket: Arc<GreSocket>) -> ProxyResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "GRE socket receive failed");
                    return Err(e.into());
                }
            };
            if let Err(e) = self.forward_packet(&buf[..n]).await {
                warn!(error = %e, "GRE packet dropped");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every datagram instead of sending it.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(Vec<u8>, Ipv4Addr)>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<(Vec<u8>, Ipv4Addr)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((packet.to_vec(), destination));
            Ok(packet.len())
        }
    }

    /// A minimal enhanced-GRE unit carrying `call_id` and a payload.
    pub fn gre_unit(call_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut unit = vec![0x30, 0x01, 0x88, 0x0B, 0x00, 0x00, 0x00, 0x00];
        unit[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        unit[6..8].copy_from_slice(&call_id.to_le_bytes());
        unit.extend_from_slice(payload);
        unit
    }
}
