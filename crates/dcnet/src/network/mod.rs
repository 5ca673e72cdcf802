//! Transport establishment behind a small trait seam.
//!
//! The signaler only needs a handful of operations from the peer connection
//! library: create an endpoint, produce and apply session descriptions, open
//! a data transport and learn when one is ready. These are expressed as
//! traits so the handshake can run over:
//! - WebRTC peer connections (`webrtc` crate) for real connections
//! - In-process memory endpoints for tests and self-checks

pub mod memory;
pub mod webrtc;

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::Result;
use protocol::messages::{SdpType, SessionDescription};

/// Invoked once for every data transport an endpoint makes available.
pub type ReadyCallback<T> = Box<dyn Fn(Arc<T>) + Send + Sync>;

/// Invoked once when a data transport opens.
pub type OpenCallback = Box<dyn FnOnce() + Send + Sync>;

/// A negotiated, message-oriented data transport (a data channel).
pub trait DataTransport: Send + Sync + 'static {
    /// Label the transport was created with.
    fn label(&self) -> String;

    /// Returns whether the transport is open for sending.
    fn is_open(&self) -> bool;

    /// Registers a callback fired when the transport opens.
    ///
    /// If the transport is already open the callback runs immediately.
    fn on_open(&self, callback: OpenCallback);

    /// Sends one message. Returns the number of bytes sent.
    fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize>>;

    /// Receives the next message, or `None` once the transport is closed.
    fn recv(&self) -> BoxFuture<'_, Option<Bytes>>;

    /// Closes the transport and releases the connection behind it.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// One side of a transport negotiation (a peer connection).
pub trait PeerEndpoint: Send + Sync + 'static {
    /// Data transport type produced by this endpoint.
    type Transport: DataTransport;

    /// Creates a data transport. Used by the initiator before the offer is
    /// produced; the responder learns about transports through
    /// [`PeerEndpoint::on_transport_ready`].
    fn create_data_transport<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Result<Arc<Self::Transport>>>;

    /// Produces the local description for the given role and installs it.
    fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> BoxFuture<'_, Result<SessionDescription>>;

    /// Applies a description received from the remote side.
    fn apply_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>>;

    /// Registers the callback fired for each data transport that becomes
    /// usable. Replaces any previous callback.
    fn on_transport_ready(&self, callback: ReadyCallback<Self::Transport>);

    /// Tears the endpoint down.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Creates endpoints from a fixed negotiation configuration.
pub trait EndpointFactory: Send + Sync + 'static {
    /// Endpoint type produced by this factory.
    type Endpoint: PeerEndpoint;

    /// Creates a fresh endpoint.
    fn create_endpoint(&self) -> BoxFuture<'_, Result<Arc<Self::Endpoint>>>;
}

/// Fire-once open notification with late subscribers.
///
/// Callbacks registered after the signal fired run immediately.
#[derive(Default)]
pub(crate) struct OpenSignal {
    state: Mutex<OpenState>,
}

#[derive(Default)]
struct OpenState {
    opened: bool,
    waiters: Vec<OpenCallback>,
}

impl OpenSignal {
    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).opened
    }

    pub(crate) fn subscribe(&self, callback: OpenCallback) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.opened {
            drop(state);
            callback();
        } else {
            state.waiters.push(callback);
        }
    }

    pub(crate) fn fire(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.opened = true;
            std::mem::take(&mut state.waiters)
        };
        for callback in waiters {
            callback();
        }
    }
}

// Re-export key types
pub use self::memory::{MemoryChannel, MemoryEndpoint, MemoryEndpointFactory, MemoryNetwork};
pub use self::webrtc::{IceServer, WebRtcConfig, WebRtcDataChannel, WebRtcEndpoint, WebRtcEndpointFactory};
