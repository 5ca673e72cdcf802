//! Error types for the protocol crate.

use thiserror::Error;

/// Direction of a frame operation, used in framing error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reading a frame from the wire.
    Receiving,
    /// Writing a frame to the wire.
    Sending,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Receiving => f.write_str("receiving"),
            Direction::Sending => f.write_str("sending"),
        }
    }
}

/// Broad classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Declared-length violation or malformed length prefix.
    Framing,
    /// Invalid codec configuration (frame length out of range).
    Config,
    /// Negotiation failure: bad description, apply failure, transport setup.
    Handshake,
    /// The transport was closed before or during the operation.
    TransportClosed,
    /// A bounded wait expired.
    Timeout,
    /// Any other I/O failure on the underlying stream.
    Io,
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Frame errors
    /// A frame would carry more payload than its declared length.
    #[error("{direction} packet too long: {attempted} bytes exceeds declared length of {declared} bytes")]
    PacketTooLong {
        /// Whether the violation happened on read or write.
        direction: Direction,
        /// Declared frame length.
        declared: usize,
        /// Cumulative length the operation would have reached.
        attempted: usize,
    },

    /// The stream ended or misbehaved in the middle of a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A new frame length was supplied while a frame is still being written.
    #[error("frame in progress: {written} of {declared} bytes written")]
    FrameInProgress {
        /// Declared length of the open frame.
        declared: usize,
        /// Bytes written so far.
        written: usize,
    },

    // Configuration errors
    /// Requested frame length does not fit the 16-bit length prefix.
    #[error("maximum length ({max}) exceeded: {length}")]
    MaxLengthExceeded {
        /// Requested length.
        length: usize,
        /// Largest representable length.
        max: usize,
    },

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Handshake errors
    /// Offer/answer negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Connection errors
    /// The transport was closed.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Other I/O failure on the underlying stream.
    #[error("i/o error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::PacketTooLong { .. }
            | ProtocolError::MalformedFrame(_)
            | ProtocolError::FrameInProgress { .. } => ErrorKind::Framing,
            ProtocolError::MaxLengthExceeded { .. } => ErrorKind::Config,
            ProtocolError::Serialization(_)
            | ProtocolError::Deserialization(_)
            | ProtocolError::HandshakeFailed(_) => ErrorKind::Handshake,
            ProtocolError::TransportClosed(_) => ErrorKind::TransportClosed,
            ProtocolError::Timeout(_) => ErrorKind::Timeout,
            ProtocolError::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns true if the transport was closed.
    pub fn is_transport_closed(&self) -> bool {
        self.kind() == ErrorKind::TransportClosed
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::TransportClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
