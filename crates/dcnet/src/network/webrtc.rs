//! WebRTC endpoints backed by the `webrtc` crate.
//!
//! This module implements the endpoint traits with:
//! - ICE server configuration (STUN/TURN)
//! - Non-trickle offer/answer: local descriptions are returned only after
//!   ICE gathering finished, so every candidate travels in one frame
//! - Data channels forwarded into bounded message queues

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use protocol::error::{ProtocolError, Result};
use protocol::messages::{SdpType, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{DataTransport, EndpointFactory, OpenCallback, OpenSignal, PeerEndpoint, ReadyCallback};

/// Default STUN servers for ICE connectivity.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default bound on ICE candidate gathering.
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-channel incoming message queue.
const MESSAGE_QUEUE_CAPACITY: usize = 256;

/// ICE server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// Username for TURN authentication (optional for STUN).
    pub username: Option<String>,
    /// Credential for TURN authentication (optional for STUN).
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Creates a new TURN server configuration with authentication.
    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Adds an additional URL to this server configuration.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Negotiation configuration for WebRTC endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcConfig {
    /// ICE servers for connectivity.
    pub ice_servers: Vec<IceServer>,
    /// How long to wait for ICE gathering before sending what we have.
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|&url| IceServer::stun(url))
                .collect(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }
}

impl WebRtcConfig {
    /// Creates a new WebRTC configuration with custom ICE servers.
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            ..Default::default()
        }
    }

    /// Adds an ICE server to the configuration.
    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Sets the ICE gathering bound.
    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Converts to WebRTC RTCConfiguration.
    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| {
        ProtocolError::HandshakeFailed(format!("invalid session description: {}", e))
    })
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(ProtocolError::HandshakeFailed(format!(
            "unsupported session description type: {}",
            other
        ))),
    }
}

/// A WebRTC data channel exposed as a [`DataTransport`].
///
/// Holds the peer connection so that closing the channel also tears down
/// the connection it runs on.
pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
    peer_connection: Arc<RTCPeerConnection>,
    opened: Arc<OpenSignal>,
    /// Sender side of the incoming queue. Dropped on close so `recv` ends.
    message_tx: Arc<tokio::sync::Mutex<Option<mpsc::Sender<Bytes>>>>,
    message_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl WebRtcDataChannel {
    /// Wraps a data channel and starts forwarding its messages.
    pub fn new(channel: Arc<RTCDataChannel>, peer_connection: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let message_tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));
        let opened = Arc::new(OpenSignal::default());

        let slot = message_tx.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let slot = slot.clone();
            Box::pin(async move {
                let tx = slot.lock().await.clone();
                if let Some(tx) = tx {
                    if let Err(e) = tx.send(msg.data).await {
                        tracing::error!("failed to forward message: {}", e);
                    }
                }
            })
        }));

        let slot = message_tx.clone();
        let label = channel.label().to_string();
        channel.on_close(Box::new(move || {
            let slot = slot.clone();
            let label = label.clone();
            Box::pin(async move {
                tracing::debug!("data channel '{}' closed", label);
                slot.lock().await.take();
            })
        }));

        let signal = opened.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                signal.fire();
            })
        }));

        Arc::new(Self {
            channel,
            peer_connection,
            opened,
            message_tx,
            message_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Returns the underlying data channel.
    pub fn data_channel(&self) -> &Arc<RTCDataChannel> {
        &self.channel
    }
}

impl std::fmt::Debug for WebRtcDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcDataChannel")
            .field("label", &self.channel.label())
            .field("open", &self.is_open())
            .finish()
    }
}

impl DataTransport for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.opened.is_open()
    }

    fn on_open(&self, callback: OpenCallback) {
        self.opened.subscribe(callback);
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            self.channel
                .send(&Bytes::copy_from_slice(data))
                .await
                .map_err(|e| ProtocolError::TransportClosed(format!("failed to send: {}", e)))
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move { self.message_rx.lock().await.recv().await })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.message_tx.lock().await.take();
            if let Err(e) = self.channel.close().await {
                tracing::debug!("failed to close data channel: {}", e);
            }
            self.peer_connection.close().await.map_err(|e| {
                ProtocolError::TransportClosed(format!("failed to close connection: {}", e))
            })
        })
    }
}

/// A WebRTC peer connection exposed as a [`PeerEndpoint`].
pub struct WebRtcEndpoint {
    /// The WebRTC peer connection.
    peer_connection: Arc<RTCPeerConnection>,
    /// Callback for transports that become usable.
    ready: Arc<Mutex<Option<ReadyCallback<WebRtcDataChannel>>>>,
    /// Channels created locally. Held until the endpoint closes so their
    /// open callbacks can still hand them out.
    channels: Mutex<Vec<Arc<WebRtcDataChannel>>>,
    gather_timeout: Duration,
}

fn notify_ready(
    ready: &Mutex<Option<ReadyCallback<WebRtcDataChannel>>>,
    transport: Arc<WebRtcDataChannel>,
) {
    let guard = ready.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(callback) => callback(transport),
        None => tracing::warn!("data channel '{}' ready with no listener", transport.label()),
    }
}

impl WebRtcEndpoint {
    /// Creates a new endpoint.
    ///
    /// This sets up the WebRTC API and creates a peer connection with the given configuration.
    pub async fn new(config: &WebRtcConfig) -> Result<Arc<Self>> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            ProtocolError::HandshakeFailed(format!("failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            ProtocolError::HandshakeFailed(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.to_rtc_configuration())
            .await
            .map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to create peer connection: {}", e))
            })?;
        let peer_connection = Arc::new(peer_connection);

        let endpoint = Arc::new(Self {
            peer_connection,
            ready: Arc::new(Mutex::new(None)),
            channels: Mutex::new(Vec::new()),
            gather_timeout: config.gather_timeout,
        });

        endpoint
            .peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                Box::pin(async move {
                    tracing::debug!("peer connection state changed: {:?}", state);
                })
            }));

        // Channels opened by the remote side. The handler lives inside the
        // peer connection, so it only holds a weak reference back to it.
        let ready = endpoint.ready.clone();
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(&endpoint.peer_connection);
        endpoint
            .peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let ready = ready.clone();
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(peer_connection) = weak.upgrade() else {
                        return;
                    };
                    tracing::debug!("data channel '{}' announced by remote", channel.label());
                    let transport = WebRtcDataChannel::new(channel, peer_connection);
                    notify_ready(&ready, transport);
                })
            }));

        Ok(endpoint)
    }

    /// Waits for ICE gathering to complete and returns the local description.
    async fn gathered_local_description(
        &self,
        mut gathered: mpsc::Receiver<()>,
    ) -> Result<RTCSessionDescription> {
        tokio::select! {
            _ = gathered.recv() => {}
            _ = tokio::time::sleep(self.gather_timeout) => {
                tracing::warn!("ICE gathering timeout, proceeding with current candidates");
            }
        }

        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| ProtocolError::HandshakeFailed("no local description available".into()))
    }

    fn gathering_complete(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.peer_connection.on_ice_gathering_state_change(Box::new(
            move |state: RTCIceGathererState| {
                let tx = tx.clone();
                Box::pin(async move {
                    if state == RTCIceGathererState::Complete {
                        let _ = tx.try_send(());
                    }
                })
            },
        ));
        rx
    }

    /// Returns the underlying peer connection for advanced operations.
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

impl PeerEndpoint for WebRtcEndpoint {
    type Transport = WebRtcDataChannel;

    fn create_data_transport<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Result<Arc<WebRtcDataChannel>>> {
        Box::pin(async move {
            // Ordered and reliable: the channel carries a byte stream.
            let options = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = self
                .peer_connection
                .create_data_channel(label, Some(options))
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!(
                        "failed to create data channel '{}': {}",
                        label, e
                    ))
                })?;

            let transport = WebRtcDataChannel::new(channel, self.peer_connection.clone());

            // Locally created channels are ready once they open.
            let ready = self.ready.clone();
            let weak = Arc::downgrade(&transport);
            transport.on_open(Box::new(move || {
                if let Some(transport) = weak.upgrade() {
                    notify_ready(&ready, transport);
                }
            }));

            self.channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transport.clone());
            Ok(transport)
        })
    }

    fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> BoxFuture<'_, Result<SessionDescription>> {
        Box::pin(async move {
            let desc = match sdp_type {
                SdpType::Offer => self.peer_connection.create_offer(None).await,
                SdpType::Answer => self.peer_connection.create_answer(None).await,
            }
            .map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to create {}: {}", sdp_type, e))
            })?;

            let gathered = self.gathering_complete();
            self.peer_connection
                .set_local_description(desc)
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!("failed to set local description: {}", e))
                })?;

            let local = self.gathered_local_description(gathered).await?;
            from_rtc_description(local)
        })
    }

    fn apply_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;
            self.peer_connection
                .set_remote_description(desc)
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!("failed to set remote description: {}", e))
                })
        })
    }

    fn on_transport_ready(&self, callback: ReadyCallback<WebRtcDataChannel>) {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ready.lock().unwrap_or_else(PoisonError::into_inner).take();
            self.channels.lock().unwrap_or_else(PoisonError::into_inner).clear();
            self.peer_connection.close().await.map_err(|e| {
                ProtocolError::TransportClosed(format!("failed to close connection: {}", e))
            })
        })
    }
}

/// Creates [`WebRtcEndpoint`]s from one [`WebRtcConfig`].
#[derive(Debug, Clone, Default)]
pub struct WebRtcEndpointFactory {
    config: WebRtcConfig,
}

impl WebRtcEndpointFactory {
    /// Creates a factory for the given configuration.
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration endpoints are created with.
    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }
}

impl EndpointFactory for WebRtcEndpointFactory {
    type Endpoint = WebRtcEndpoint;

    fn create_endpoint(&self) -> BoxFuture<'_, Result<Arc<WebRtcEndpoint>>> {
        Box::pin(WebRtcEndpoint::new(&self.config))
    }
}
