//! Offer/answer signaling over a raw byte stream.
//!
//! A [`Signaler`] drives one side of a session negotiation and hands back a
//! ready data transport. [`RwSignaler`] runs the exchange over any
//! `AsyncRead + AsyncWrite` stream, one JSON session description per frame:
//!
//! ```text
//! initiator                              responder
//!    │ ── [len][{"type":"offer",...}] ──▶ │
//!    │ ◀── [len][{"type":"answer",...}] ─ │
//!    │      (transport becomes ready)     │
//! ```
//!
//! The stream carries no peer identity, so both sides report
//! [`PeerAddr::Nil`]. A stream supports exactly one handshake;
//! renegotiation over the same stream is not supported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::addr::PeerAddr;
use protocol::error::{ProtocolError, Result};
use protocol::framing::Framer;
use protocol::messages::{SdpType, SessionDescription};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::network::{EndpointFactory, PeerEndpoint};

/// Default bound on a whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default label of the data transport opened by the initiator.
pub const DEFAULT_CHANNEL_LABEL: &str = "data";

/// A negotiated transport together with the remote peer's address.
pub type Negotiated<T> = (Arc<T>, PeerAddr);

/// Which side of the exchange a handshake plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer.
    Initiator,
    /// Waits for an offer and answers it.
    Responder,
}

impl Role {
    /// Description type this role expects from the remote side.
    fn expected_remote(self) -> SdpType {
        match self {
            Role::Initiator => SdpType::Answer,
            Role::Responder => SdpType::Offer,
        }
    }
}

/// Progress of a signaler's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake started yet.
    Idle,
    /// Creating and writing the local offer.
    SendingOffer,
    /// Waiting for the remote description.
    AwaitingRemoteDescription,
    /// Creating and writing the local answer.
    SendingAnswer,
    /// Descriptions exchanged, waiting for the transport to become ready.
    AwaitingTransport,
    /// A transport was handed to the caller.
    Complete,
    /// The handshake ended with an error.
    Failed,
}

/// Signaler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalerConfig {
    /// Upper bound on a handshake, from start until the transport is ready.
    pub handshake_timeout: Duration,
    /// Label of the data transport the initiator opens.
    pub channel_label: String,
}

impl Default for SignalerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

/// Drives one side of a transport negotiation.
pub trait Signaler: Send + Sync {
    /// Data transport produced by a successful handshake.
    type Transport: crate::network::DataTransport;

    /// Runs the handshake as the initiator.
    fn initiate(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>>;

    /// Runs the handshake as the responder.
    fn respond(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>>;

    /// Releases the signaling stream. Fails if already closed.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Address of the local side.
    fn local_addr(&self) -> PeerAddr;
}

impl<S: Signaler> Signaler for Arc<S> {
    type Transport = S::Transport;

    fn initiate(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>> {
        (**self).initiate()
    }

    fn respond(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>> {
        (**self).respond()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        (**self).close()
    }

    fn local_addr(&self) -> PeerAddr {
        (**self).local_addr()
    }
}

type Transport<F> = <<F as EndpointFactory>::Endpoint as PeerEndpoint>::Transport;

/// Signaler exchanging descriptions over a raw byte stream.
pub struct RwSignaler<S, F: EndpointFactory> {
    /// The framed stream while no handshake owns it. `None` once closed.
    stream: Arc<Mutex<Option<Framer<S>>>>,
    factory: F,
    config: SignalerConfig,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    state: Arc<watch::Sender<HandshakeState>>,
}

impl<S, F> RwSignaler<S, F>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: EndpointFactory,
{
    /// Creates a signaler owning `stream`.
    ///
    /// Endpoints for the handshake are created from `factory`, which carries
    /// the negotiation configuration.
    pub fn new(stream: S, factory: F, config: SignalerConfig) -> Result<Self> {
        let (state, _) = watch::channel(HandshakeState::Idle);
        Ok(Self {
            stream: Arc::new(Mutex::new(Some(Framer::new(stream, 0)?))),
            factory,
            config,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Arc::new(state),
        })
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    /// Subscribes to handshake state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Returns the signaler configuration.
    pub fn config(&self) -> &SignalerConfig {
        &self.config
    }

    async fn handshake(&self, role: Role) -> Result<Negotiated<Transport<F>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::TransportClosed("signaler closed".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::HandshakeFailed(
                "signaling stream already used for a handshake".into(),
            ));
        }

        let framer = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| ProtocolError::TransportClosed("signaler closed".into()))?;

        let endpoint = match self.factory.create_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.state.send_replace(HandshakeState::Failed);
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = mpsc::channel(1);
        endpoint.on_transport_ready(Box::new(move |transport| {
            if ready_tx.try_send(transport).is_err() {
                tracing::debug!("ignoring additional data transport");
            }
        }));

        let token = self.shutdown.child_token();
        let _guard = token.clone().drop_guard();
        let (done_tx, done_rx) = oneshot::channel();

        let task = HandshakeTask {
            role,
            framer,
            endpoint,
            ready_rx,
            label: self.config.channel_label.clone(),
            state: self.state.clone(),
            slot: self.stream.clone(),
            token: token.clone(),
        };
        tokio::spawn(task.run(done_tx));

        match tokio::time::timeout(self.config.handshake_timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::HandshakeFailed(
                "handshake task ended without a result".into(),
            )),
            Err(_) => {
                token.cancel();
                self.state.send_replace(HandshakeState::Failed);
                Err(ProtocolError::Timeout(format!(
                    "no transport after {:?}",
                    self.config.handshake_timeout
                )))
            }
        }
    }

    async fn close_stream(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::TransportClosed("signaler already closed".into()));
        }

        self.shutdown.cancel();
        let framer = self.stream.lock().await.take();
        if let Some(mut framer) = framer {
            if let Err(e) = framer.shutdown().await {
                tracing::debug!("failed to shut down signaling stream: {}", e);
            }
        }
        Ok(())
    }
}

impl<S, F> Signaler for RwSignaler<S, F>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: EndpointFactory,
{
    type Transport = Transport<F>;

    fn initiate(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>> {
        Box::pin(self.handshake(Role::Initiator))
    }

    fn respond(&self) -> BoxFuture<'_, Result<Negotiated<Self::Transport>>> {
        Box::pin(self.handshake(Role::Responder))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close_stream())
    }

    fn local_addr(&self) -> PeerAddr {
        PeerAddr::Nil
    }
}

/// Background half of a handshake. Owns the signaling stream until the
/// handshake ends.
struct HandshakeTask<S, E: PeerEndpoint> {
    role: Role,
    framer: Framer<S>,
    endpoint: Arc<E>,
    ready_rx: mpsc::Receiver<Arc<E::Transport>>,
    label: String,
    state: Arc<watch::Sender<HandshakeState>>,
    slot: Arc<Mutex<Option<Framer<S>>>>,
    token: CancellationToken,
}

impl<S, E> HandshakeTask<S, E>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    E: PeerEndpoint,
{
    async fn run(mut self, done: oneshot::Sender<Result<Negotiated<E::Transport>>>) {
        let token = self.token.clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProtocolError::TransportClosed(
                "signaler closed during handshake".into(),
            )),
            result = self.negotiate() => result,
        };

        match &result {
            Ok(_) => {
                self.set_state(HandshakeState::Complete);
                // Keep the stream open for the peer; close() releases it.
                let mut slot = self.slot.lock().await;
                if !token.is_cancelled() {
                    *slot = Some(self.framer);
                }
            }
            Err(e) => {
                tracing::warn!("{:?} handshake failed: {}", self.role, e);
                self.set_state(HandshakeState::Failed);
                if let Err(e) = self.endpoint.close().await {
                    tracing::debug!("failed to close endpoint: {}", e);
                }
                if let Err(e) = self.framer.shutdown().await {
                    tracing::debug!("failed to shut down signaling stream: {}", e);
                }
            }
        }

        let _ = done.send(result);
    }

    async fn negotiate(&mut self) -> Result<Negotiated<E::Transport>> {
        if self.role == Role::Initiator {
            self.set_state(HandshakeState::SendingOffer);
            self.endpoint.create_data_transport(&self.label).await?;
            let offer = self.endpoint.create_local_description(SdpType::Offer).await?;
            self.send_description(&offer).await?;
        }

        self.set_state(HandshakeState::AwaitingRemoteDescription);
        let remote = self.receive_description().await?;
        self.endpoint.apply_remote_description(remote).await?;

        if self.role == Role::Responder {
            self.set_state(HandshakeState::SendingAnswer);
            let answer = self.endpoint.create_local_description(SdpType::Answer).await?;
            self.send_description(&answer).await?;
        }

        self.set_state(HandshakeState::AwaitingTransport);
        let transport = self.ready_rx.recv().await.ok_or_else(|| {
            ProtocolError::HandshakeFailed("endpoint closed before a transport was ready".into())
        })?;

        tracing::debug!("{:?} handshake complete", self.role);
        Ok((transport, PeerAddr::Nil))
    }

    async fn send_description(&mut self, desc: &SessionDescription) -> Result<()> {
        let payload = desc.to_json()?;
        self.framer.write_frame(&payload).await?;
        tracing::debug!("sent {} ({} bytes)", desc.sdp_type, payload.len());
        Ok(())
    }

    async fn receive_description(&mut self) -> Result<SessionDescription> {
        let frame = self.framer.read_frame().await?.ok_or_else(|| {
            ProtocolError::TransportClosed(
                "signaling stream ended before a session description arrived".into(),
            )
        })?;
        let desc = SessionDescription::from_json(&frame)?;

        let expected = self.role.expected_remote();
        if desc.sdp_type != expected {
            return Err(ProtocolError::HandshakeFailed(format!(
                "expected {} but received {}",
                expected, desc.sdp_type
            )));
        }

        tracing::debug!("received {} ({} bytes)", desc.sdp_type, frame.len());
        Ok(desc)
    }

    fn set_state(&self, state: HandshakeState) {
        self.state.send_replace(state);
    }
}
