//! Hex/ASCII rendering of packets for the extensive dump mode.

const BYTES_PER_LINE: usize = 16;

/// Render `buf` as lines of 16 hex bytes followed by their printable ASCII.
pub fn hex_dump(buf: &[u8]) -> Vec<String> {
    buf.chunks(BYTES_PER_LINE)
        .map(|chunk| {
            let hex: Vec<String> = chunk
                .iter()
                .map(|b| hex::encode_upper([*b]))
                .collect();
            let ascii: String = chunk
                .iter()
                .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
                .collect();
            format!("{:<48}  {}", hex.join(" "), ascii)
        })
        .collect()
}
