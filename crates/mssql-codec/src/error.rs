//! Codec-level error types.

use thiserror::Error;

/// Errors raised while framing or assembling TDS packets over a transport.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Packet header declared a length shorter than the 8-byte header itself.
    #[error("invalid packet header")]
    InvalidHeader,

    /// A packet exceeded the negotiated maximum packet size.
    #[error("packet size {size} exceeds maximum of {max}")]
    PacketTooLarge {
        /// Declared or computed size of the offending packet.
        size: usize,
        /// Negotiated maximum packet size.
        max: usize,
    },

    /// The connection closed with a message only partially assembled.
    #[error("connection closed mid-message")]
    ConnectionClosed,

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
