//! # dcnet
//!
//! Byte-stream connections over WebRTC data channels, negotiated across any
//! existing byte pipe (a TCP socket, a pair of pipes, stdin/stdout).
//!
//! ## Overview
//!
//! - **Signaling**: offer/answer exchange over a framed byte stream
//! - **Endpoints**: peer connections behind a small trait seam, backed by the
//!   `webrtc` crate or by in-process memory endpoints
//! - **Connections**: dial/listen/accept returning read/write/close handles
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            dial() / Listener::accept()                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  RwSignaler ── frames ──▶ raw byte pipe ──▶ remote side  │
//! ├─────────────────────────────────────────────────────────┤
//! │  PeerEndpoint (webrtc / memory) ──▶ DataTransport        │
//! ├─────────────────────────────────────────────────────────┤
//! │                      DataConn                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dcnet::{dial, Config, RwSignaler, WebRtcEndpointFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:50000").await?;
//!
//!     let factory = WebRtcEndpointFactory::new(config.webrtc_config());
//!     let signaler = RwSignaler::new(stream, factory, config.signaler_config())?;
//!
//!     let conn = dial(&signaler).await?;
//!     conn.write(b"Hello world!").await?;
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: Endpoint traits and their WebRTC and memory implementations
//! - [`signaling`]: The offer/answer handshake
//! - [`conn`]: Connection over a negotiated data transport
//! - [`listener`]: Dialing and accepting

pub mod config;
pub mod conn;
pub mod listener;
pub mod network;
pub mod signaling;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use conn::{DataConn, MAX_MESSAGE_SIZE};
pub use listener::{dial, dial_timeout, ensure_open, Listener, SignaledConn, DEFAULT_OPEN_TIMEOUT};
pub use network::{
    DataTransport, EndpointFactory, IceServer, MemoryEndpointFactory, MemoryNetwork,
    PeerEndpoint, WebRtcConfig, WebRtcEndpointFactory,
};
pub use protocol::{PeerAddr, ProtocolError};
pub use signaling::{HandshakeState, Role, RwSignaler, Signaler, SignalerConfig};
