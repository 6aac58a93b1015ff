use std::io::{self, Read, Write};

use crate::Bitfield;

/// A single control message of the simplified peer protocol, before any
/// payload bytes that follow it (piece data, in the `Piece` case) are read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `ESTABLISH`, optionally carrying the initiator's peer id.
    Establish(Option<String>),
    Established,
    Bitfield(String),
    Request(usize),
    Choked,
    /// Announces a raw piece payload of `length` bytes immediately
    /// following this line.
    Piece { index: usize, length: usize },
}

impl Line {
    pub fn encode(&self) -> String {
        match self {
            Line::Establish(None) => "ESTABLISH".to_string(),
            Line::Establish(Some(peer_id)) => format!("ESTABLISH:{}", peer_id),
            Line::Established => "ESTABLISHED".to_string(),
            Line::Bitfield(hex) => format!("BITFIELD:{}", hex),
            Line::Request(index) => format!("REQUEST:{}", index),
            Line::Choked => "CHOKED".to_string(),
            Line::Piece { index, length } => format!("PIECE:{}:{}", index, length),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, WireError> {
        // No delimiter of its own; a message is whatever one recv handed
        // back, so just trim stray NUL padding or whitespace.
        let raw = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if raw == "ESTABLISHED" {
            Ok(Line::Established)
        } else if raw == "ESTABLISH" {
            Ok(Line::Establish(None))
        } else if let Some(peer_id) = raw.strip_prefix("ESTABLISH:") {
            Ok(Line::Establish(Some(peer_id.to_string())))
        } else if raw == "CHOKED" {
            Ok(Line::Choked)
        } else if let Some(hex) = raw.strip_prefix("BITFIELD:") {
            Ok(Line::Bitfield(hex.to_string()))
        } else if let Some(rest) = raw.strip_prefix("REQUEST:") {
            let index = rest.parse().map_err(|_| WireError::Malformed(raw.to_string()))?;
            Ok(Line::Request(index))
        } else if let Some(rest) = raw.strip_prefix("PIECE:") {
            let (index, length) = rest.split_once(':').ok_or_else(|| WireError::Malformed(raw.to_string()))?;
            let index = index.parse().map_err(|_| WireError::Malformed(raw.to_string()))?;
            let length = length.parse().map_err(|_| WireError::Malformed(raw.to_string()))?;
            Ok(Line::Piece { index, length })
        } else {
            Err(WireError::Malformed(raw.to_string()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed protocol line: {0:?}")]
    Malformed(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("invalid bitfield hex")]
    InvalidBitfield,
}

/// Control messages carry no terminator of their own; each is expected to
/// arrive as exactly one `recv`. Sized generously to hold a bitfield for
/// torrents with several thousand pieces.
const CONTROL_BUFFER: usize = 4096;

pub fn write_line<W: Write>(w: &mut W, line: &Line) -> Result<(), WireError> {
    w.write_all(line.encode().as_bytes())?;
    w.flush()?;
    Ok(())
}

/// Reads one control message: a single `read` call is the whole message,
/// with no newline terminator to scan for.
pub fn read_line<R: Read>(r: &mut R) -> Result<Line, WireError> {
    let mut buf = [0u8; CONTROL_BUFFER];
    let n = r.read(&mut buf)?;
    if n == 0 {
        return Err(WireError::Closed);
    }
    let text = std::str::from_utf8(&buf[..n]).map_err(|_| WireError::Malformed("non-utf8 control message".to_string()))?;
    Line::parse(text)
}

pub fn encode_bitfield(bits: &Bitfield) -> String {
    hex::encode(bits.clone().into_vec())
}

pub fn decode_bitfield(hex_str: &str, num_pieces: usize) -> Result<Bitfield, WireError> {
    let bytes = hex::decode(hex_str).map_err(|_| WireError::InvalidBitfield)?;
    let mut bits = Bitfield::from_vec(bytes);
    // The wire encoding is byte-padded, so the decoded length may be up
    // to 7 bits longer than num_pieces; never shorter.
    bits.resize(num_pieces, false);
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request_line() {
        let line = Line::Request(42);
        let encoded = line.encode();
        assert_eq!(encoded, "REQUEST:42");
        assert_eq!(Line::parse(&encoded).unwrap(), line);
    }

    #[test]
    fn round_trips_piece_line() {
        let line = Line::Piece { index: 3, length: 16384 };
        assert_eq!(Line::parse(&line.encode()).unwrap(), line);
    }

    #[test]
    fn round_trips_establish_with_peer_id() {
        let line = Line::Establish(Some("abc123".to_string()));
        assert_eq!(Line::parse(&line.encode()).unwrap(), line);
        assert_eq!(Line::parse("ESTABLISH").unwrap(), Line::Establish(None));
    }

    #[test]
    fn bitfield_round_trips_and_trims_padding() {
        let mut bits = Bitfield::repeat(false, 5);
        bits.set(0, true);
        bits.set(4, true);
        let hex = encode_bitfield(&bits);
        let decoded = decode_bitfield(&hex, 5).unwrap();
        assert_eq!(decoded, bits);
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(Line::parse("GARBAGE").is_err());
    }

    #[test]
    fn read_line_does_not_require_a_newline_terminator() {
        let mut cursor = io::Cursor::new(b"REQUEST:7".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap(), Line::Request(7));
    }
}
