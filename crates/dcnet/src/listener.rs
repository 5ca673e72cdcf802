//! Dial and accept connections through a [`Signaler`].

use std::sync::Arc;
use std::time::Duration;

use protocol::addr::PeerAddr;
use protocol::error::{ProtocolError, Result};
use tokio::sync::oneshot;

use crate::conn::DataConn;
use crate::network::DataTransport;
use crate::signaling::Signaler;

/// Default time a negotiated transport gets to report that it is open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection type produced through a signaler.
pub type SignaledConn<S> = DataConn<<S as Signaler>::Transport>;

/// Opens a connection as the initiating side.
pub async fn dial<S: Signaler>(signaler: &S) -> Result<SignaledConn<S>> {
    dial_timeout(signaler, DEFAULT_OPEN_TIMEOUT).await
}

/// Like [`dial`], with an explicit bound on waiting for the transport to open.
pub async fn dial_timeout<S: Signaler>(
    signaler: &S,
    open_timeout: Duration,
) -> Result<SignaledConn<S>> {
    let (transport, remote_addr) = signaler.initiate().await?;
    ensure_open(&transport, open_timeout).await?;

    tracing::info!("dialed data channel '{}'", transport.label());
    Ok(DataConn::new(transport, signaler.local_addr(), remote_addr))
}

/// Waits until `transport` is open, for at most `timeout`.
pub async fn ensure_open<T: DataTransport>(transport: &Arc<T>, timeout: Duration) -> Result<()> {
    if transport.is_open() {
        return Ok(());
    }

    let (tx, rx) = oneshot::channel();
    transport.on_open(Box::new(move || {
        let _ = tx.send(());
    }));

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(ProtocolError::TransportClosed(format!(
            "data channel '{}' dropped before opening",
            transport.label()
        ))),
        Err(_) => Err(ProtocolError::Timeout(format!(
            "data channel '{}' not open after {:?}",
            transport.label(),
            timeout
        ))),
    }
}

/// Accepts connections negotiated by a signaler.
///
/// A signaler runs a single handshake, so only the first [`Listener::accept`]
/// can succeed; later calls report the failure from the signaler.
pub struct Listener<S: Signaler> {
    signaler: S,
    open_timeout: Duration,
}

impl<S: Signaler> Listener<S> {
    /// Creates a listener accepting through `signaler`.
    pub fn new(signaler: S) -> Self {
        Self {
            signaler,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    /// Sets how long an accepted transport gets to open.
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Waits for the remote side to dial and returns the connection.
    pub async fn accept(&self) -> Result<SignaledConn<S>> {
        let (transport, remote_addr) = self.signaler.respond().await?;
        ensure_open(&transport, self.open_timeout).await?;

        tracing::info!("accepted data channel '{}'", transport.label());
        Ok(DataConn::new(transport, self.signaler.local_addr(), remote_addr))
    }

    /// Closes the signaler and the stream it owns.
    pub async fn close(&self) -> Result<()> {
        self.signaler.close().await
    }

    /// Address of the local side, as reported by the signaler.
    pub fn addr(&self) -> PeerAddr {
        self.signaler.local_addr()
    }

    /// The signaler this listener accepts through.
    pub fn signaler(&self) -> &S {
        &self.signaler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemoryEndpointFactory, MemoryNetwork, OpenCallback};
    use crate::signaling::{RwSignaler, SignalerConfig};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use protocol::error::ErrorKind;
    use std::sync::Mutex;

    fn signalers() -> (
        RwSignaler<tokio::io::DuplexStream, MemoryEndpointFactory>,
        RwSignaler<tokio::io::DuplexStream, MemoryEndpointFactory>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let factory = MemoryEndpointFactory::new(MemoryNetwork::new());
        (
            RwSignaler::new(a, factory.clone(), SignalerConfig::default()).unwrap(),
            RwSignaler::new(b, factory, SignalerConfig::default()).unwrap(),
        )
    }

    /// Transport that never opens unless told to.
    #[derive(Default)]
    struct LazyTransport {
        waiters: Mutex<Vec<OpenCallback>>,
    }

    impl LazyTransport {
        fn open(&self) {
            let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
            for waiter in waiters {
                waiter();
            }
        }
    }

    impl DataTransport for LazyTransport {
        fn label(&self) -> String {
            "lazy".into()
        }

        fn is_open(&self) -> bool {
            false
        }

        fn on_open(&self, callback: OpenCallback) {
            self.waiters.lock().unwrap().push(callback);
        }

        fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize>> {
            Box::pin(async move { Ok(data.len()) })
        }

        fn recv(&self) -> BoxFuture<'_, Option<Bytes>> {
            Box::pin(async { None })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let (a, b) = signalers();
        let listener = Listener::new(b);

        let (dialed, accepted) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(dial(&a), listener.accept())
        })
        .await
        .expect("dial/accept timed out");
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        dialed.write(b"Hello world!").await.unwrap();
        let mut buf = [0u8; 32];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello world!");

        assert!(listener.addr().is_nil());
        assert!(dialed.remote_addr().is_nil());
    }

    #[tokio::test]
    async fn test_second_accept_fails() {
        let (a, b) = signalers();
        let listener = Listener::new(b);
        let (dialed, accepted) = tokio::join!(dial(&a), listener.accept());
        dialed.unwrap();
        accepted.unwrap();

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
    }

    #[tokio::test]
    async fn test_listener_close() {
        let (_a, b) = signalers();
        let listener = Listener::new(b);

        listener.close().await.unwrap();
        assert!(listener.close().await.is_err());
        assert!(listener.accept().await.unwrap_err().is_transport_closed());
    }

    #[tokio::test]
    async fn test_ensure_open_waits_for_open() {
        let transport = Arc::new(LazyTransport::default());

        let waiter = tokio::spawn({
            let transport = transport.clone();
            async move { ensure_open(&transport, Duration::from_secs(2)).await }
        });

        while transport.waiters.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.open();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ensure_open_times_out() {
        let transport = Arc::new(LazyTransport::default());
        let err = ensure_open(&transport, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_ensure_open_dropped_waiter() {
        let transport = Arc::new(LazyTransport::default());

        let waiter = tokio::spawn({
            let transport = transport.clone();
            async move { ensure_open(&transport, Duration::from_secs(2)).await }
        });

        while transport.waiters.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.waiters.lock().unwrap().clear();

        assert!(waiter.await.unwrap().unwrap_err().is_transport_closed());
    }
}
