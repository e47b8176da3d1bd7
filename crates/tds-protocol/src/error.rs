//! Protocol-level error types.
//!
//! These errors describe malformed or unexpected wire data. They carry no
//! I/O or transport context — that's layered on by `mssql-codec`.

use crate::prelude::String;

/// Errors raised while framing, parsing, or encoding TDS wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// An unrecognized packet type byte.
    InvalidPacketType(u8),
    /// An unrecognized packet status byte combination.
    InvalidPacketStatus(u8),
    /// A packet header declared a length shorter than the 8-byte header itself.
    InvalidPacketLength(u16),
    /// A message ended before the declared length was reached.
    IncompletePacket {
        /// Bytes the header promised.
        expected: usize,
        /// Bytes actually available before the stream ended.
        actual: usize,
    },
    /// An unrecognized token type byte.
    InvalidTokenType(u8),
    /// A token's body ended before all of its fields could be read.
    UnexpectedEof,
    /// An unrecognized TDS type id in column metadata.
    InvalidTypeId(u8),
    /// A column value's length prefix was outside the bounds that type allows.
    InvalidLength {
        /// The wire type id whose length was invalid.
        type_id: u8,
        /// The length value read.
        length: i64,
    },
    /// An unrecognized PRELOGIN option token.
    InvalidPreloginOption(u8),
    /// An unrecognized ENVCHANGE sub-type.
    InvalidEnvChangeType(u8),
    /// A string field's UTF-16LE bytes did not decode cleanly.
    StringEncoding(String),
    /// A server error token exceeded internal nesting/size limits.
    Malformed(String),
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidPacketType(b) => write!(f, "invalid packet type: 0x{b:02X}"),
            Self::InvalidPacketStatus(b) => write!(f, "invalid packet status: 0x{b:02X}"),
            Self::InvalidPacketLength(len) => {
                write!(f, "packet length {len} is shorter than the 8-byte header")
            }
            Self::IncompletePacket { expected, actual } => write!(
                f,
                "incomplete packet: expected {expected} bytes, got {actual}"
            ),
            Self::InvalidTokenType(b) => write!(f, "invalid token type: 0x{b:02X}"),
            Self::UnexpectedEof => write!(f, "unexpected end of token stream"),
            Self::InvalidTypeId(b) => write!(f, "invalid TDS type id: 0x{b:02X}"),
            Self::InvalidLength { type_id, length } => write!(
                f,
                "invalid length {length} for type id 0x{type_id:02X}"
            ),
            Self::InvalidPreloginOption(b) => write!(f, "invalid PRELOGIN option: 0x{b:02X}"),
            Self::InvalidEnvChangeType(b) => write!(f, "invalid ENVCHANGE type: 0x{b:02X}"),
            Self::StringEncoding(msg) => write!(f, "string encoding error: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed token stream: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, ProtocolError>;
