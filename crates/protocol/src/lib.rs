//! # dcnet Protocol Library
//!
//! Wire-level building blocks for negotiating WebRTC data channels over an
//! arbitrary byte pipe.
//!
//! ## Overview
//!
//! - **Frame Codec**: 2-byte length-prefixed framing (RFC 4571) over any
//!   `AsyncRead`/`AsyncWrite`
//! - **Session Descriptions**: offer/answer messages carried one per frame
//! - **Peer Addresses**: descriptive names for the two ends of a connection
//! - **Errors**: one error type with a coarse [`ErrorKind`] classification
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Session Descriptions (JSON)       │  offer / answer
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  u16 length prefix
//! ├─────────────────────────────────────────┤
//! │     Raw byte pipe (TCP, stdio, ...)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Framer, SessionDescription};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> protocol::Result<()> {
//! let (a, b) = tokio::io::duplex(1024);
//! let mut left = Framer::new(a, 0)?;
//! let mut right = Framer::new(b, 0)?;
//!
//! let offer = SessionDescription::offer("v=0");
//! left.write_frame(&offer.to_json()?).await?;
//!
//! let frame = right.read_frame().await?.expect("frame");
//! assert_eq!(SessionDescription::from_json(&frame)?, offer);
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod error;
pub mod framing;
pub mod messages;

pub use addr::PeerAddr;
pub use error::{Direction, ErrorKind, ProtocolError, Result};
pub use framing::{
    FrameReader, FrameWriter, Framer, ReadStatus, LENGTH_PREFIX_SIZE, MAX_FRAME_LENGTH,
};
pub use messages::{SdpType, SessionDescription};
