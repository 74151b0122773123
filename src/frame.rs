//! The sliver of CQL frame layout this crate needs for itself: the fixed 9-byte header. The
//! connection read loop must parse it before it knows how many more bytes to read, and must pull
//! the stream id out of it to route the eventual response to the right pending callback. Message
//! bodies (`STARTUP`/`READY`/`ERROR`/`QUERY`/`RESULT`) are handled by [`crate::codec`], built on
//! top of the value and protocol types [`cassandra_protocol`] provides.

use crate::error::{Error, Result};

pub use cassandra_protocol::frame::Version;

/// Length in bytes of a CQL frame header.
pub const HEADER_LEN: usize = 9;

/// The prefix of the header (everything but the body length) that's sufficient to classify a
/// response and route it to its pending callback.
pub const CLASSIFICATION_PREFIX_LEN: usize = 5;

/// CQL protocol version used for outbound frames unless configured otherwise.
pub const DEFAULT_VERSION: Version = Version::V4;

/// Opcodes this crate inspects directly. Re-exported narrowly rather than re-exporting all of
/// `cassandra_protocol::frame::Opcode` so call sites stay readable.
pub mod opcode {
    use cassandra_protocol::frame::Opcode;

    pub const ERROR: Opcode = Opcode::Error;
    pub const STARTUP: Opcode = Opcode::Startup;
    pub const READY: Opcode = Opcode::Ready;
    pub const QUERY: Opcode = Opcode::Query;
    pub const RESULT: Opcode = Opcode::Result;
}

/// A parsed frame header, decoded in two steps so the read loop can size its second `read_exact`
/// call before the body has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
    pub length: i32,
}

/// The on-wire byte for a protocol version, independent of whatever discriminant
/// `cassandra_protocol`'s enum happens to use internally.
pub fn version_byte(version: Version) -> u8 {
    match version {
        Version::V3 => 0x03,
        Version::V4 => 0x04,
        Version::V5 => 0x05,
        _ => 0x04,
    }
}

/// The on-wire byte for an opcode, independent of whatever discriminant
/// `cassandra_protocol`'s enum happens to use internally. Only the opcodes this crate ever
/// places in an outbound header are covered; anything else falls back to `OPTIONS` rather than
/// panicking, since we never actually send those frames.
pub fn opcode_byte(opcode: cassandra_protocol::frame::Opcode) -> u8 {
    use cassandra_protocol::frame::Opcode;
    match opcode {
        Opcode::Error => 0x00,
        Opcode::Startup => 0x01,
        Opcode::Ready => 0x02,
        Opcode::Authenticate => 0x03,
        Opcode::Options => 0x05,
        Opcode::Supported => 0x06,
        Opcode::Query => 0x07,
        Opcode::Result => 0x08,
        Opcode::Prepare => 0x09,
        Opcode::Execute => 0x0A,
        Opcode::Register => 0x0B,
        Opcode::Event => 0x0C,
        Opcode::Batch => 0x0D,
        Opcode::AuthChallenge => 0x0E,
        Opcode::AuthResponse => 0x0F,
        Opcode::AuthSuccess => 0x10,
        _ => 0x05,
    }
}

impl Header {
    /// Parses the fixed 9-byte header. `buf` must be exactly [`HEADER_LEN`] bytes, as delivered by
    /// the connection's `read_exact(9)` call.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let version = buf[0];
        let flags = buf[1];
        let stream = i16::from_be_bytes([buf[2], buf[3]]);
        let opcode = buf[4];
        let length = i32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        if length < 0 {
            return Err(Error::protocol(format!(
                "negative frame body length: {length}"
            )));
        }

        Ok(Header {
            version,
            flags,
            stream,
            opcode,
            length,
        })
    }

    /// Encodes the header for an outbound frame. `stream` is the id allocated by the connection;
    /// `body_len` is the already-serialized body's length.
    pub fn encode(version: u8, stream: i16, opcode: u8, body_len: i32) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = version;
        buf[1] = 0; // flags: no compression, no tracing, no custom payload, no warning
        buf[2..4].copy_from_slice(&stream.to_be_bytes());
        buf[4] = opcode;
        buf[5..9].copy_from_slice(&body_len.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn header_round_trip() {
        for (version, stream, opcode, length) in
            [(4u8, 0i16, 0x07u8, 0i32), (4, -1, 0x08, 4096), (3, 32_767, 0x00, 12)]
        {
            let encoded = Header::encode(version, stream, opcode, length);
            let decoded = Header::decode(&encoded).unwrap();
            assert_eq!(
                decoded,
                Header {
                    version,
                    flags: 0,
                    stream,
                    opcode,
                    length,
                }
            );
        }
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut buf = Header::encode(4, 0, 0x08, 0);
        buf[5] = 0xff;
        buf[6] = 0xff;
        buf[7] = 0xff;
        buf[8] = 0xff;
        assert!(Header::decode(&buf).is_err());
    }
}
