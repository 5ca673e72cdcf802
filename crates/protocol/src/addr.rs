//! Logical peer addresses.
//!
//! Addresses only describe a peer; they carry no transport capability.

use std::fmt;

/// Network name reported for every address kind.
pub const NETWORK: &str = "WebRTC";

/// Identifies the remote (or local) side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PeerAddr {
    /// Anonymous peer. Used when only a single peer is reachable, as with a
    /// signaler over a point-to-point byte stream.
    #[default]
    Nil,
    /// Peer named by a plain identifier.
    Id(String),
    /// Peer named by API key, room and session.
    Session {
        /// API key of the signaling service.
        api_key: String,
        /// Room the session lives in.
        room_id: String,
        /// Session identifier within the room.
        session_id: String,
    },
}

impl PeerAddr {
    /// Creates an identifier address.
    pub fn id(id: impl Into<String>) -> Self {
        PeerAddr::Id(id.into())
    }

    /// Creates a session address.
    pub fn session(
        api_key: impl Into<String>,
        room_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        PeerAddr::Session {
            api_key: api_key.into(),
            room_id: room_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Name of the network the address belongs to.
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    /// Returns true for the anonymous address.
    pub fn is_nil(&self) -> bool {
        matches!(self, PeerAddr::Nil)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Nil => Ok(()),
            PeerAddr::Id(id) => f.write_str(id),
            PeerAddr::Session {
                api_key,
                room_id,
                session_id,
            } => write!(f, "{}/{}/{}", api_key, room_id, session_id),
        }
    }
}
