//! In-process endpoints that pair through session descriptions.
//!
//! A [`MemoryNetwork`] plays the role of the real-time transport: an offer
//! names a session on the network, the answerer attaches to it, and applying
//! the answer connects every data transport the offerer created to a fresh
//! counterpart on the answering side. No sockets are involved, so handshakes
//! can be exercised deterministically.
//!
//! The network also records every description produced and applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::messages::{SdpType, SessionDescription};
use tokio::sync::mpsc;

use super::{DataTransport, EndpointFactory, OpenCallback, OpenSignal, PeerEndpoint, ReadyCallback};

/// Capacity of the per-channel incoming message queue.
const MESSAGE_QUEUE_CAPACITY: usize = 256;

/// SDP attribute naming the memory session.
const SESSION_ATTRIBUTE: &str = "a=session:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Session {
    offerer: Weak<MemoryEndpoint>,
    answerer: Option<Weak<MemoryEndpoint>>,
}

#[derive(Default)]
struct NetworkState {
    next_session: u64,
    sessions: HashMap<String, Session>,
    produced: Vec<SessionDescription>,
    applied: Vec<SessionDescription>,
}

/// Shared switchboard connecting memory endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptions produced by endpoints, in order.
    pub fn produced_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.state).produced.clone()
    }

    /// Descriptions applied by endpoints, in order.
    pub fn applied_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.state).applied.clone()
    }

    fn open_session(&self, offerer: Weak<MemoryEndpoint>) -> String {
        let mut state = lock(&self.state);
        state.next_session += 1;
        let id = format!("session-{}", state.next_session);
        state.sessions.insert(
            id.clone(),
            Session {
                offerer,
                answerer: None,
            },
        );
        id
    }

    fn attach_answerer(&self, id: &str, answerer: Weak<MemoryEndpoint>) -> Result<()> {
        let mut state = lock(&self.state);
        let session = state.sessions.get_mut(id).ok_or_else(|| {
            ProtocolError::HandshakeFailed(format!("unknown memory session '{}'", id))
        })?;
        if session.answerer.is_some() {
            return Err(ProtocolError::HandshakeFailed(format!(
                "memory session '{}' already answered",
                id
            )));
        }
        if session.offerer.upgrade().is_none() {
            return Err(ProtocolError::HandshakeFailed(format!(
                "offerer of memory session '{}' is gone",
                id
            )));
        }
        session.answerer = Some(answerer);
        Ok(())
    }

    fn take_answerer(&self, id: &str) -> Result<Arc<MemoryEndpoint>> {
        let mut state = lock(&self.state);
        let session = state.sessions.remove(id).ok_or_else(|| {
            ProtocolError::HandshakeFailed(format!("unknown memory session '{}'", id))
        })?;
        session
            .answerer
            .and_then(|answerer| answerer.upgrade())
            .ok_or_else(|| {
                ProtocolError::HandshakeFailed(format!("memory session '{}' has no answerer", id))
            })
    }

    fn record_produced(&self, desc: &SessionDescription) {
        lock(&self.state).produced.push(desc.clone());
    }

    fn record_applied(&self, desc: &SessionDescription) {
        lock(&self.state).applied.push(desc.clone());
    }
}

/// One end of an in-memory data transport.
pub struct MemoryChannel {
    label: String,
    opened: OpenSignal,
    /// Sender into our own queue, handed to the peer when paired.
    inbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Sender into the peer's queue.
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryChannel {
    fn new(label: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        Arc::new(Self {
            label: label.into(),
            opened: OpenSignal::default(),
            inbox: Mutex::new(Some(tx)),
            outbox: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Connects two unpaired channels. Each one's inbox sender moves to the
    /// other, so closing one end ends the other's receive queue.
    fn pair(a: &MemoryChannel, b: &MemoryChannel) {
        *lock(&a.outbox) = lock(&b.inbox).take();
        *lock(&b.outbox) = lock(&a.inbox).take();
    }

    fn shut(&self) {
        lock(&self.outbox).take();
        lock(&self.inbox).take();
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("label", &self.label)
            .field("open", &self.opened.is_open())
            .field("connected", &lock(&self.outbox).is_some())
            .finish()
    }
}

impl DataTransport for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.opened.is_open()
    }

    fn on_open(&self, callback: OpenCallback) {
        self.opened.subscribe(callback);
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let tx = lock(&self.outbox).clone().ok_or_else(|| {
                ProtocolError::TransportClosed(format!("channel '{}' is not connected", self.label))
            })?;
            tx.send(Bytes::copy_from_slice(data)).await.map_err(|_| {
                ProtocolError::TransportClosed(format!("peer of channel '{}' is gone", self.label))
            })?;
            Ok(data.len())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move { self.incoming.lock().await.recv().await })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shut();
            Ok(())
        })
    }
}

#[derive(Default)]
struct EndpointState {
    channels: Vec<Arc<MemoryChannel>>,
    session: Option<String>,
    local: Option<SdpType>,
    closed: bool,
}

/// An in-process [`PeerEndpoint`] attached to a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    this: Weak<MemoryEndpoint>,
    state: Mutex<EndpointState>,
    ready: Mutex<Option<ReadyCallback<MemoryChannel>>>,
}

impl MemoryEndpoint {
    /// Creates an endpoint on the given network.
    pub fn new(network: MemoryNetwork) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            network,
            this: this.clone(),
            state: Mutex::new(EndpointState::default()),
            ready: Mutex::new(None),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if lock(&self.state).closed {
            return Err(ProtocolError::TransportClosed("endpoint closed".into()));
        }
        Ok(())
    }

    fn notify_ready(&self, transport: Arc<MemoryChannel>) {
        if let Some(callback) = lock(&self.ready).as_ref() {
            callback(transport);
        }
    }

    fn session_of(desc: &SessionDescription) -> Result<String> {
        desc.sdp
            .lines()
            .find_map(|line| line.strip_prefix(SESSION_ATTRIBUTE))
            .map(|id| id.trim().to_string())
            .ok_or_else(|| {
                ProtocolError::HandshakeFailed("description carries no memory session".into())
            })
    }

    /// Pairs every local channel with a new channel on the answerer, then
    /// opens both sides.
    fn connect(&self, answerer: &MemoryEndpoint) {
        let locals = lock(&self.state).channels.clone();
        for local in locals {
            let remote = MemoryChannel::new(local.label.clone());
            MemoryChannel::pair(&local, &remote);
            lock(&answerer.state).channels.push(remote.clone());

            remote.opened.fire();
            answerer.notify_ready(remote);
            local.opened.fire();
        }
    }
}

impl PeerEndpoint for MemoryEndpoint {
    type Transport = MemoryChannel;

    fn create_data_transport<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Result<Arc<MemoryChannel>>> {
        Box::pin(async move {
            self.ensure_open()?;
            let channel = MemoryChannel::new(label);

            // Locally created channels are ready once they open.
            let endpoint = self.this.clone();
            let weak = Arc::downgrade(&channel);
            channel.on_open(Box::new(move || {
                if let (Some(endpoint), Some(channel)) = (endpoint.upgrade(), weak.upgrade()) {
                    endpoint.notify_ready(channel);
                }
            }));

            lock(&self.state).channels.push(channel.clone());
            Ok(channel)
        })
    }

    fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> BoxFuture<'_, Result<SessionDescription>> {
        Box::pin(async move {
            self.ensure_open()?;
            let session = match sdp_type {
                SdpType::Offer => {
                    let id = self.network.open_session(self.this.clone());
                    lock(&self.state).session = Some(id.clone());
                    id
                }
                SdpType::Answer => {
                    let state = lock(&self.state);
                    match (&state.session, state.local) {
                        (Some(id), None) => id.clone(),
                        _ => {
                            return Err(ProtocolError::HandshakeFailed(
                                "cannot answer without a remote offer".into(),
                            ))
                        }
                    }
                }
            };
            lock(&self.state).local = Some(sdp_type);

            let sdp = format!("v=0\r\ns=memory\r\n{}{}\r\n", SESSION_ATTRIBUTE, session);
            let desc = SessionDescription { sdp_type, sdp };
            self.network.record_produced(&desc);
            Ok(desc)
        })
    }

    fn apply_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let session = Self::session_of(&desc)?;

            match desc.sdp_type {
                SdpType::Offer => {
                    self.network.attach_answerer(&session, self.this.clone())?;
                    lock(&self.state).session = Some(session);
                }
                SdpType::Answer => {
                    let offered = {
                        let state = lock(&self.state);
                        state.local == Some(SdpType::Offer)
                            && state.session.as_deref() == Some(session.as_str())
                    };
                    if !offered {
                        return Err(ProtocolError::HandshakeFailed(format!(
                            "answer for session '{}' does not match a local offer",
                            session
                        )));
                    }
                    let answerer = self.network.take_answerer(&session)?;
                    self.connect(&answerer);
                }
            }

            self.network.record_applied(&desc);
            Ok(())
        })
    }

    fn on_transport_ready(&self, callback: ReadyCallback<MemoryChannel>) {
        *lock(&self.ready) = Some(callback);
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let channels = {
                let mut state = lock(&self.state);
                state.closed = true;
                std::mem::take(&mut state.channels)
            };
            for channel in channels {
                channel.shut();
            }
            lock(&self.ready).take();
            Ok(())
        })
    }
}

/// Creates [`MemoryEndpoint`]s on one shared [`MemoryNetwork`].
#[derive(Clone, Default)]
pub struct MemoryEndpointFactory {
    network: MemoryNetwork,
}

impl MemoryEndpointFactory {
    /// Creates a factory on the given network.
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }

    /// Returns the network endpoints are attached to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl EndpointFactory for MemoryEndpointFactory {
    type Endpoint = MemoryEndpoint;

    fn create_endpoint(&self) -> BoxFuture<'_, Result<Arc<MemoryEndpoint>>> {
        Box::pin(async move { Ok(MemoryEndpoint::new(self.network.clone())) })
    }
}
