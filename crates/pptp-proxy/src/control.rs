//! Control-message rewriter.
//!
//! Every read from a control socket is treated as one message and rewritten
//! in place before it is forwarded to the other side:
//!
//! - Start-Control-Connection request/reply: padded, PPTP-IN-TCP capability
//!   recorded and re-advertised (or stripped when the extension is off).
//! - Outgoing-Call request/reply: the sender's call id is swapped for a fake
//!   one from that side's pool.
//! - Call-Clear / Disconnect-Notify / WAN-Error / Set-Link-Info: the call id
//!   is swapped for its counterpart.
//! - PPTP-IN-TCP frames are not forwarded as-is; their GRE units go through
//!   the data plane. A control message following the frames in the same
//!   read is rewritten and forwarded as above.
//!
//! Anything else, including buffers too short to classify, passes through.

use crate::gre::DataPlane;
use crate::link::Link;
use crate::registry::LinkRegistry;
use pptp_core::wire::{
    clear_capability_marker, has_capability_marker, pad_start_control, read_call_id,
    write_call_id, write_capability_marker, CALL_ID_OFFSET, PEER_ID_OFFSET,
};
use pptp_core::{
    classify, unwrap_frames, ControlType, FrameKind, IdAllocator, ProxyError, ProxyResult, Side,
};
use std::io;
use tracing::{debug, warn};

/// Size of one read from a control socket.
pub const READ_BUF_LEN: usize = 4096;

/// State of a control connection after handling a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Open,
    /// The endpoint closed its side; the link should be removed.
    Closed,
}

/// Everything the rewriter needs besides the link itself.
pub struct ControlContext<'a> {
    pub registry: &'a LinkRegistry,
    pub data_plane: &'a DataPlane,
    pub ids: &'a mut IdAllocator,
    pub wrap_enabled: bool,
    pub packet_dump: bool,
}

/// Read once from `side`'s control socket, rewrite and forward.
///
/// An `Err` is link-fatal: read or write failure, protocol violation or an
/// exhausted id pool.
pub async fn handle_readable(
    link: &Link,
    side: Side,
    ctx: &mut ControlContext<'_>,
) -> ProxyResult<ReadOutcome> {
    let mut buf = vec![0u8; READ_BUF_LEN];
    let n = match link.channel(side).try_read(&mut buf) {
        Ok(0) => {
            debug!(side = %side, remote = %link.remote_name(), "control connection closed");
            return Ok(ReadOutcome::Closed);
        }
        Ok(n) => n,
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            return Ok(ReadOutcome::Open)
        }
        Err(e) => return Err(e.into()),
    };
    buf.truncate(n);

    if ctx.packet_dump {
        crate::dump_packet(side.as_str(), &buf);
    }

    if let Some(out) = rewrite(link, side, buf, ctx).await? {
        link.channel(side.opposite()).write_all(&out).await?;
    }
    Ok(ReadOutcome::Open)
}

/// Rewrite one message. `None` means nothing is forwarded on the control
/// channel.
async fn rewrite(
    link: &Link,
    side: Side,
    mut buf: Vec<u8>,
    ctx: &mut ControlContext<'_>,
) -> ProxyResult<Option<Vec<u8>>> {
    let kind = match classify(&buf) {
        FrameKind::Control(kind) => kind,
        FrameKind::Unrecognized => return Ok(Some(buf)),
        FrameKind::Wrapped => {
            let rest = forward_tunneled(link, side, &buf, ctx).await?;
            if rest.is_empty() {
                return Ok(None);
            }
            match classify(rest) {
                FrameKind::Control(kind) => {
                    let tail = rest.to_vec();
                    buf = tail;
                    kind
                }
                _ => {
                    warn!(side = %side, len = rest.len(), "incomplete PPTP-IN-TCP frame dropped");
                    return Ok(None);
                }
            }
        }
    };

    if rewrite_control(link, side, kind, &mut buf, ctx).await? {
        Ok(Some(buf))
    } else {
        Ok(None)
    }
}

/// Returns whether the message should still be forwarded.
async fn rewrite_control(
    link: &Link,
    side: Side,
    kind: ControlType,
    buf: &mut Vec<u8>,
    ctx: &mut ControlContext<'_>,
) -> ProxyResult<bool> {
    match kind {
        ControlType::StartControlRequest | ControlType::StartControlReply => {
            pad_start_control(buf);
            if ctx.wrap_enabled {
                if has_capability_marker(buf) {
                    debug!(side = %side, "peer supports PPTP-IN-TCP");
                    link.set_can_wrap(side);
                }
                write_capability_marker(buf);
            } else {
                clear_capability_marker(buf);
            }
        }

        ControlType::OutgoingCallRequest | ControlType::OutgoingCallReply => {
            let Some(real) = read_call_id(buf, CALL_ID_OFFSET) else {
                warn!(side = %side, len = buf.len(), ?kind, "short outgoing call message forwarded unmodified");
                return Ok(true);
            };
            let fake = ctx.ids.allocate(side)?;
            link.set_call_ids(side, real, fake);
            write_call_id(buf, CALL_ID_OFFSET, fake);

            if kind == ControlType::OutgoingCallReply {
                write_call_id(buf, PEER_ID_OFFSET, link.real_id(Side::Caller));
            }
            debug!(
                side = %side,
                ?kind,
                real = format_args!("0x{real:X}"),
                fake = format_args!("0x{fake:X}"),
                "call id mapped"
            );
        }

        ControlType::CallClearRequest
        | ControlType::CallDisconnectNotify
        | ControlType::WanErrorNotify
        | ControlType::SetLinkInfo => {
            let Some(id) = read_call_id(buf, CALL_ID_OFFSET) else {
                return Ok(true);
            };
            match ctx.registry.resolve_counterpart(id).await {
                Some(counterpart) => {
                    write_call_id(buf, CALL_ID_OFFSET, counterpart);
                    debug!(
                        side = %side,
                        ?kind,
                        id = format_args!("0x{id:X}"),
                        counterpart = format_args!("0x{counterpart:X}"),
                        "call id remapped"
                    );
                }
                None => {
                    warn!(side = %side, ?kind, error = %ProxyError::UnmappedCallId(id), "control message dropped");
                    return Ok(false);
                }
            }
        }

        ControlType::Other(_) => {}
    }
    Ok(true)
}

/// Route the GRE units of the frames at the start of `buf` and return the
/// bytes after them.
async fn forward_tunneled<'b>(
    link: &Link,
    side: Side,
    buf: &'b [u8],
    ctx: &ControlContext<'_>,
) -> ProxyResult<&'b [u8]> {
    if !ctx.wrap_enabled || !link.can_wrap(side) {
        return Err(ProxyError::Protocol(format!(
            "{side} sent a PPTP-IN-TCP frame without negotiating it"
        )));
    }

    let (units, rest) = match unwrap_frames(buf) {
        Ok(split) => split,
        Err(e) => {
            warn!(side = %side, error = %e, "PPTP-IN-TCP frame dropped");
            return Ok(&[]);
        }
    };
    let source = link.address(side);
    for unit in units {
        if let Err(e) = ctx.data_plane.forward_unit(unit, source).await {
            warn!(side = %side, error = %e, "tunneled GRE unit dropped");
        }
    }
    Ok(rest)
}
