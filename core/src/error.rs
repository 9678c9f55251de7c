use thiserror::Error;

/// Errors raised while decoding or transporting server packets.
///
/// `Truncated` is recoverable when it happens during speculative parsing of
/// an optional field; everywhere else it means the packet is structurally
/// broken. `UnparseablePacket` always terminates the connection and keeps
/// the raw bytes so they can be hex-dumped for diagnostics.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated packet: wanted {wanted} byte(s) at offset {offset}, {remaining} left")]
    Truncated {
        offset: usize,
        wanted: usize,
        remaining: usize,
    },

    #[error("not a decimal digit: 0x{0:02x}")]
    BadDigit(u8),

    #[error("ascii decimal field overflows 64 bits at offset {0}")]
    DecimalOverflow(usize),

    #[error("unparseable packet for command {command:?}: {reason}")]
    UnparseablePacket {
        command: String,
        reason: String,
        packet: Vec<u8>,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Wraps a decode failure into the fatal, connection-ending form,
    /// attaching the offending packet for diagnostics.
    pub fn unparseable(command: &str, reason: impl ToString, packet: &[u8]) -> Self {
        ProtocolError::UnparseablePacket {
            command: command.to_string(),
            reason: reason.to_string(),
            packet: packet.to_vec(),
        }
    }
}

/// Renders bytes as an offset-prefixed hex/ASCII dump, 16 bytes per row.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:04x}:", row * 16));
        for b in chunk {
            out.push_str(&format!(" {b:02x}"));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  ");
        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) {
                b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
