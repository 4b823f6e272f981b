//! PPTP-IN-TCP framing: GRE units carried inside the control connection.
//!
//! Wire format: `[2-byte little-endian total length][00 01][1B 2C 3D 4E][GRE unit]`
//! where the total length includes the 8-byte header.

use crate::error::{ProxyError, ProxyResult};
use crate::wire::{MESSAGE_KIND_CONTROL, WRAP_MAGIC};

pub const WRAP_HEADER_LEN: usize = 8;

/// Prepend the PPTP-IN-TCP header to a GRE unit.
pub fn wrap_gre_unit(unit: &[u8]) -> ProxyResult<Vec<u8>> {
    let total = unit.len() + WRAP_HEADER_LEN;
    if total > u16::MAX as usize {
        return Err(ProxyError::Malformed(format!(
            "GRE unit of {} bytes is too large to wrap",
            unit.len()
        )));
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u16).to_le_bytes());
    frame.extend_from_slice(&MESSAGE_KIND_CONTROL);
    frame.extend_from_slice(&WRAP_MAGIC);
    frame.extend_from_slice(unit);
    Ok(frame)
}

/// Split a buffer read from a control socket into the GRE units of the
/// PPTP-IN-TCP frames at its start.
///
/// Returns the units plus the unparsed tail: whatever follows the last
/// complete frame, such as a control message sent in the same read or a
/// frame cut short by the read boundary. A frame header declaring a length
/// shorter than the header itself is an error.
pub fn unwrap_frames(buf: &[u8]) -> ProxyResult<(Vec<&[u8]>, &[u8])> {
    let mut units = Vec::new();
    let mut rest = buf;

    while rest.len() >= WRAP_HEADER_LEN
        && rest[2..4] == MESSAGE_KIND_CONTROL
        && rest[4..8] == WRAP_MAGIC
    {
        let total = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if total < WRAP_HEADER_LEN {
            return Err(ProxyError::Malformed(format!(
                "PPTP-IN-TCP length {total} is shorter than its header"
            )));
        }
        if total > rest.len() {
            break;
        }

        units.push(&rest[WRAP_HEADER_LEN..total]);
        rest = &rest[total..];
    }

    Ok((units, rest))
}
