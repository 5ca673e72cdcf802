//! Byte-stream connection over a message-oriented data transport.
//!
//! [`DataConn`] turns the messages of a [`DataTransport`] into a byte stream:
//! reads drain one message at a time, keeping whatever does not fit into the
//! caller's buffer for the next read. Writes larger than [`MAX_MESSAGE_SIZE`]
//! are split over several messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use protocol::addr::PeerAddr;
use protocol::error::{ProtocolError, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::network::DataTransport;

/// Largest payload sent in a single data-channel message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// A connection over an open data transport.
pub struct DataConn<T: DataTransport> {
    transport: Arc<T>,
    local_addr: PeerAddr,
    remote_addr: PeerAddr,
    /// Unread remainder of the last received message.
    pending: Mutex<Bytes>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl<T: DataTransport> DataConn<T> {
    /// Wraps a transport. The transport is expected to be open already.
    pub fn new(transport: Arc<T>, local_addr: PeerAddr, remote_addr: PeerAddr) -> Self {
        Self {
            transport,
            local_addr,
            remote_addr,
            pending: Mutex::new(Bytes::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reads into `buf`, returning the number of bytes read.
    ///
    /// Returns `Ok(0)` once the remote side has closed and everything it
    /// sent has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open("read")?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut pending = self.pending.lock().await;
        while pending.is_empty() {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(ProtocolError::TransportClosed("read on closed conn".into()));
                }
                next = self.transport.recv() => next,
            };
            match next {
                Some(message) => *pending = message,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(pending.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        Ok(n)
    }

    /// Writes all of `buf`, returning its length.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open("write")?;
        for chunk in buf.chunks(MAX_MESSAGE_SIZE) {
            self.transport.send(chunk).await?;
        }
        Ok(buf.len())
    }

    /// Closes the connection along with the transport and the peer
    /// connection behind it. Closing twice is an error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::TransportClosed("close on closed conn".into()));
        }
        self.shutdown.cancel();
        self.transport.close().await
    }

    /// Returns whether [`DataConn::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address of the local side.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Address of the remote side.
    pub fn remote_addr(&self) -> &PeerAddr {
        &self.remote_addr
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::TransportClosed(format!("{} on closed conn", op)));
        }
        Ok(())
    }
}

impl<T: DataTransport> std::fmt::Debug for DataConn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConn")
            .field("label", &self.transport.label())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        EndpointFactory, MemoryChannel, MemoryEndpointFactory, MemoryNetwork, PeerEndpoint,
    };
    use protocol::messages::SdpType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Negotiates two memory endpoints directly and returns both channels.
    async fn channel_pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let factory = MemoryEndpointFactory::new(MemoryNetwork::new());
        let offerer = factory.create_endpoint().await.unwrap();
        let answerer = factory.create_endpoint().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        answerer.on_transport_ready(Box::new(move |channel| {
            let _ = tx.send(channel);
        }));

        let local = offerer.create_data_transport("data").await.unwrap();
        let offer = offerer.create_local_description(SdpType::Offer).await.unwrap();
        answerer.apply_remote_description(offer).await.unwrap();
        let answer = answerer.create_local_description(SdpType::Answer).await.unwrap();
        offerer.apply_remote_description(answer).await.unwrap();

        (local, rx.recv().await.unwrap())
    }

    async fn conn_pair() -> (DataConn<MemoryChannel>, DataConn<MemoryChannel>) {
        let (a, b) = channel_pair().await;
        (
            DataConn::new(a, PeerAddr::Nil, PeerAddr::id("remote")),
            DataConn::new(b, PeerAddr::Nil, PeerAddr::Nil),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = conn_pair().await;

        assert_eq!(a.write(b"Hello world!").await.unwrap(), 12);

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello world!");
    }

    #[tokio::test]
    async fn test_small_buffer_keeps_remainder() {
        let (a, b) = conn_pair().await;
        a.write(b"abcdef").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(b.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (a, b) = conn_pair().await;
        let payload: Vec<u8> = (0..MAX_MESSAGE_SIZE * 2 + 100).map(|i| i as u8).collect();

        assert_eq!(a.write(&payload).await.unwrap(), payload.len());

        // First message is capped at the message size.
        let first = b.transport().recv().await.unwrap();
        assert_eq!(first.len(), MAX_MESSAGE_SIZE);

        let mut received = first.to_vec();
        let mut buf = vec![0u8; 4096];
        while received.len() < payload.len() {
            let n = b.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_remote_close_reads_eof() {
        let (a, b) = conn_pair().await;
        a.write(b"bye").await.unwrap();
        a.close().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 3);
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (a, _b) = conn_pair().await;
        a.close().await.unwrap();
        assert!(a.is_closed());

        let mut buf = [0u8; 8];
        assert!(a.read(&mut buf).await.unwrap_err().is_transport_closed());
        assert!(a.write(b"x").await.unwrap_err().is_transport_closed());

        let err = a.close().await.unwrap_err();
        assert_eq!(err.to_string(), "transport closed: close on closed conn");
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (a, _b) = conn_pair().await;
        let a = Arc::new(a);

        let reader = tokio::spawn({
            let a = a.clone();
            async move {
                let mut buf = [0u8; 8];
                a.read(&mut buf).await
            }
        });

        tokio::task::yield_now().await;
        a.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader still blocked after close")
            .unwrap();
        assert!(result.unwrap_err().is_transport_closed());
    }

    #[tokio::test]
    async fn test_addresses() {
        let (a, b) = conn_pair().await;
        assert!(a.local_addr().is_nil());
        assert_eq!(a.remote_addr().to_string(), "remote");
        assert!(b.remote_addr().is_nil());
    }
}
