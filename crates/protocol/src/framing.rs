//! Length-prefixed framing over reliable, ordered byte streams.
//!
//! # Frame Format
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (2 bytes) │ Payload (Length bytes)   │
//! │  big-endian u16  │                          │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! This is the RFC 4571 framing. The codec assumes the underlying stream
//! neither reorders nor loses bytes; it does not try to resynchronise.
//!
//! The reader hands out payload bytes incrementally and reports
//! [`ReadStatus::FrameComplete`] together with the last chunk of a frame.
//! A clean end of stream on a frame boundary is reported separately as
//! [`ReadStatus::EndOfStream`], so one stream can carry any number of frames.
//!
//! The writer commits the total frame length up front. The prefix is emitted
//! with the first write of a frame and later writes may not exceed the
//! committed length.

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};

use crate::error::{Direction, ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

/// Chunk size used by [`FrameReader::read_frame`].
const READ_CHUNK_SIZE: usize = 4096;

/// Outcome of a single [`FrameReader::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were delivered and the current frame has more to come.
    Partial,
    /// The returned bytes finish the current frame. The next read starts a
    /// new frame.
    FrameComplete,
    /// The stream ended cleanly between frames. No bytes were returned.
    EndOfStream,
}

fn checked_length(length: usize) -> Result<u16> {
    u16::try_from(length).map_err(|_| ProtocolError::MaxLengthExceeded {
        length,
        max: MAX_FRAME_LENGTH,
    })
}

/// Reads length-prefixed frames from an [`AsyncRead`].
///
/// Reads are bounded by the bytes left in the current frame, so the reader
/// never pulls bytes belonging to the next frame out of the stream.
///
/// `read` is not cancel-safe: dropping it mid-prefix loses the prefix bytes
/// already consumed.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    in_frame: bool,
    length: u16,
    consumed: u16,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a reader over the given stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            in_frame: false,
            length: 0,
            consumed: 0,
        }
    }

    /// Returns true while a frame has been started but not fully read.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Declared length of the frame being read, if any.
    pub fn declared_length(&self) -> Option<usize> {
        self.in_frame.then_some(self.length as usize)
    }

    /// Payload bytes still to be delivered for the current frame.
    pub fn remaining(&self) -> usize {
        if self.in_frame {
            (self.length - self.consumed) as usize
        } else {
            0
        }
    }

    /// Reads the next chunk of payload into `buf`.
    ///
    /// If no frame is in progress, the length prefix is read first and is
    /// not counted in the returned byte count.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        if !self.in_frame {
            match self.read_prefix().await? {
                Some(length) => {
                    self.length = length;
                    self.consumed = 0;
                    self.in_frame = true;
                }
                None => return Ok((0, ReadStatus::EndOfStream)),
            }
        }

        let remaining = self.remaining();
        if remaining == 0 {
            return Ok((0, self.close_frame()));
        }
        if buf.is_empty() {
            return Ok((0, ReadStatus::Partial));
        }

        let limit = remaining.min(buf.len());
        let n = match self.inner.read(&mut buf[..limit]).await {
            Ok(n) => n,
            Err(e) => {
                self.reset();
                return Err(e.into());
            }
        };

        if n == 0 {
            let err = ProtocolError::MalformedFrame(format!(
                "stream ended after {} of {} payload bytes",
                self.consumed, self.length
            ));
            self.reset();
            return Err(err);
        }

        let total = self.consumed as usize + n;
        if total > self.length as usize {
            let err = ProtocolError::PacketTooLong {
                direction: Direction::Receiving,
                declared: self.length as usize,
                attempted: total,
            };
            self.reset();
            return Err(err);
        }
        self.consumed = total as u16;

        if self.consumed == self.length {
            Ok((n, self.close_frame()))
        } else {
            Ok((n, ReadStatus::Partial))
        }
    }

    /// Reads one whole frame.
    ///
    /// Returns `None` if the stream ended cleanly before a new frame began.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let (n, status) = self.read(&mut chunk).await?;
            if payload.is_empty() {
                payload.reserve(n + self.remaining());
            }
            payload.extend_from_slice(&chunk[..n]);

            match status {
                ReadStatus::Partial => continue,
                ReadStatus::FrameComplete => return Ok(Some(payload)),
                ReadStatus::EndOfStream => return Ok(None),
            }
        }
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Consumes the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn read_prefix(&mut self) -> Result<Option<u16>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;

        while filled < LENGTH_PREFIX_SIZE {
            let n = self.inner.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::MalformedFrame(format!(
                    "stream ended inside length prefix ({} of {} bytes)",
                    filled, LENGTH_PREFIX_SIZE
                )));
            }
            filled += n;
        }

        Ok(Some(u16::from_be_bytes(prefix)))
    }

    fn close_frame(&mut self) -> ReadStatus {
        self.reset();
        ReadStatus::FrameComplete
    }

    fn reset(&mut self) {
        self.in_frame = false;
        self.consumed = 0;
    }
}

/// Writes length-prefixed frames to an [`AsyncWrite`].
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    in_frame: bool,
    length: u16,
    written: u16,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer whose first frame will be `length` bytes long.
    ///
    /// Fails with [`ProtocolError::MaxLengthExceeded`] if `length` does not
    /// fit the 16-bit prefix.
    pub fn new(inner: W, length: usize) -> Result<Self> {
        Ok(Self {
            inner,
            in_frame: false,
            length: checked_length(length)?,
            written: 0,
        })
    }

    /// Commits the length of the next frame.
    ///
    /// Only allowed between frames. Without a call the previous length is
    /// reused.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if self.in_frame {
            return Err(ProtocolError::FrameInProgress {
                declared: self.length as usize,
                written: self.written as usize,
            });
        }
        self.length = checked_length(length)?;
        Ok(())
    }

    /// Length committed for the current or next frame.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Returns true while a frame has been started but not fully written.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Writes part (or all) of the current frame's payload.
    ///
    /// A write that would exceed the committed length fails with
    /// [`ProtocolError::PacketTooLong`] and writes nothing.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let attempted = self.written as usize + buf.len();
        if attempted > self.length as usize {
            return Err(ProtocolError::PacketTooLong {
                direction: Direction::Sending,
                declared: self.length as usize,
                attempted,
            });
        }

        if !self.in_frame {
            let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + buf.len());
            out.extend_from_slice(&self.length.to_be_bytes());
            out.extend_from_slice(buf);
            self.inner.write_all(&out).await?;
            self.in_frame = true;
        } else if !buf.is_empty() {
            self.inner.write_all(buf).await?;
        }

        self.written = attempted as u16;
        if self.written == self.length {
            self.in_frame = false;
            self.written = 0;
        }

        self.inner.flush().await?;
        Ok(buf.len())
    }

    /// Writes `payload` as one complete frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.set_length(payload.len())?;
        self.write(payload).await?;
        Ok(())
    }

    /// Shuts down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Consumes the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// A frame reader and writer sharing one duplex stream.
#[derive(Debug)]
pub struct Framer<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Framer<S> {
    /// Splits `stream` into a frame reader and a frame writer whose first
    /// frame will be `length` bytes long.
    pub fn new(stream: S, length: usize) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half, length)?,
        })
    }

    /// Reads the next chunk of payload. See [`FrameReader::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        self.reader.read(buf).await
    }

    /// Reads one whole frame. See [`FrameReader::read_frame`].
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.read_frame().await
    }

    /// Writes part of the current frame. See [`FrameWriter::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writer.write(buf).await
    }

    /// Writes one complete frame. See [`FrameWriter::write_frame`].
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(payload).await
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Returns mutable access to both halves.
    pub fn parts_mut(
        &mut self,
    ) -> (&mut FrameReader<ReadHalf<S>>, &mut FrameWriter<WriteHalf<S>>) {
        (&mut self.reader, &mut self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use std::time::Duration;

    fn random_string(n: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(n)
            .map(char::from)
            .collect()
    }

    fn encoded(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_roundtrip_over_pipe() {
        for sequence in [String::new(), "abc".to_string(), random_string(MAX_FRAME_LENGTH)] {
            // A small pipe buffer forces the frame to be split across reads.
            let (client, server) = tokio::io::duplex(1024);
            let mut reader = FrameReader::new(server);
            let mut writer = FrameWriter::new(client, sequence.len()).unwrap();

            let expected = sequence.clone();
            let write_task = tokio::spawn(async move {
                let n = writer.write(expected.as_bytes()).await.unwrap();
                assert_eq!(n, expected.len(), "short write");
                writer
            });

            let result = tokio::time::timeout(Duration::from_secs(2), reader.read_frame())
                .await
                .expect("read timed out")
                .unwrap()
                .expect("stream ended before frame");

            write_task.await.unwrap();
            assert_eq!(result.len(), sequence.len());
            assert_eq!(result, sequence.as_bytes());
            assert!(!reader.in_frame());
        }
    }

    #[tokio::test]
    async fn test_writer_rejects_oversized_length() {
        let err = FrameWriter::new(Vec::new(), MAX_FRAME_LENGTH + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(matches!(
            err,
            ProtocolError::MaxLengthExceeded { length: 65536, max: 65535 }
        ));

        assert!(FrameWriter::new(Vec::new(), MAX_FRAME_LENGTH).is_ok());
    }

    #[tokio::test]
    async fn test_writer_rejects_overlong_write_without_output() {
        let mut writer = FrameWriter::new(Vec::new(), 3).unwrap();

        let err = writer.write(b"abcd").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
        assert!(writer.get_ref().is_empty());
        assert!(!writer.in_frame());

        // The codec is still usable afterwards.
        writer.write(b"abc").await.unwrap();
        assert_eq!(writer.get_ref(), &encoded(b"abc"));
    }

    #[tokio::test]
    async fn test_writer_accumulates_within_frame() {
        let mut writer = FrameWriter::new(Vec::new(), 6).unwrap();

        assert_eq!(writer.write(b"abc").await.unwrap(), 3);
        assert!(writer.in_frame());
        assert_eq!(writer.get_ref(), &[0u8, 6, b'a', b'b', b'c']);

        let err = writer.write(b"defg").await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PacketTooLong { declared: 6, attempted: 7, .. }
        ));

        writer.write(b"def").await.unwrap();
        assert!(!writer.in_frame());
        assert_eq!(writer.get_ref(), &encoded(b"abcdef"));
    }

    #[tokio::test]
    async fn test_writer_reuses_length_for_next_frame() {
        let mut writer = FrameWriter::new(Vec::new(), 2).unwrap();
        writer.write(b"ab").await.unwrap();
        writer.write(b"cd").await.unwrap();

        let mut expected = encoded(b"ab");
        expected.extend(encoded(b"cd"));
        assert_eq!(writer.get_ref(), &expected);
    }

    #[tokio::test]
    async fn test_set_length_rejected_mid_frame() {
        let mut writer = FrameWriter::new(Vec::new(), 4).unwrap();
        writer.write(b"ab").await.unwrap();

        let err = writer.set_length(10).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameInProgress { declared: 4, written: 2 }
        ));

        writer.write(b"cd").await.unwrap();
        writer.set_length(10).unwrap();
        assert_eq!(writer.length(), 10);
    }

    #[tokio::test]
    async fn test_zero_length_frame() {
        let mut writer = FrameWriter::new(Vec::new(), 0).unwrap();
        assert_eq!(writer.write(&[]).await.unwrap(), 0);
        assert_eq!(writer.get_ref(), &[0u8, 0]);
        assert!(!writer.in_frame());

        let bytes = writer.into_inner();
        let mut reader = FrameReader::new(&bytes[..]);
        let mut buf = [0u8; 8];
        assert_eq!(
            reader.read(&mut buf).await.unwrap(),
            (0, ReadStatus::FrameComplete)
        );
        assert_eq!(
            reader.read(&mut buf).await.unwrap(),
            (0, ReadStatus::EndOfStream)
        );
    }

    #[tokio::test]
    async fn test_reader_boundary_between_frames() {
        let mut bytes = encoded(b"hello");
        bytes.extend(encoded(b"world!"));
        let mut reader = FrameReader::new(&bytes[..]);

        // A large buffer must not swallow the next frame.
        let mut buf = [0u8; 64];
        let (n, status) = reader.read(&mut buf).await.unwrap();
        assert_eq!((n, status), (5, ReadStatus::FrameComplete));
        assert_eq!(&buf[..n], b"hello");
        assert!(!reader.in_frame());
        assert_eq!(reader.declared_length(), None);

        let (n, status) = reader.read(&mut buf).await.unwrap();
        assert_eq!((n, status), (6, ReadStatus::FrameComplete));
        assert_eq!(&buf[..n], b"world!");

        let (n, status) = reader.read(&mut buf).await.unwrap();
        assert_eq!((n, status), (0, ReadStatus::EndOfStream));
    }

    #[tokio::test]
    async fn test_reader_delivers_incrementally() {
        let bytes = encoded(b"hello");
        let mut reader = FrameReader::new(&bytes[..]);
        let mut buf = [0u8; 2];

        assert_eq!(reader.read(&mut buf).await.unwrap(), (2, ReadStatus::Partial));
        assert!(reader.in_frame());
        assert_eq!(reader.declared_length(), Some(5));
        assert_eq!(reader.remaining(), 3);

        assert_eq!(reader.read(&mut buf).await.unwrap(), (2, ReadStatus::Partial));
        assert_eq!(
            reader.read(&mut buf).await.unwrap(),
            (1, ReadStatus::FrameComplete)
        );
        assert_eq!(&buf[..1], b"o");
        assert!(!reader.in_frame());
    }

    #[tokio::test]
    async fn test_reader_truncated_prefix() {
        let bytes = [0u8];
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[tokio::test]
    async fn test_reader_truncated_payload() {
        let bytes = [0u8, 5, b'a', b'b'];
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
        assert!(!reader.in_frame());
    }

    #[tokio::test]
    async fn test_framer_exchanges_frames() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Framer::new(a, 0).unwrap();
        let mut right = Framer::new(b, 0).unwrap();

        left.write_frame(b"offer").await.unwrap();
        assert_eq!(right.read_frame().await.unwrap().unwrap(), b"offer");

        right.write_frame(b"answer").await.unwrap();
        assert_eq!(left.read_frame().await.unwrap().unwrap(), b"answer");

        left.shutdown().await.unwrap();
        drop(left);
        assert_eq!(right.read_frame().await.unwrap(), None);
    }
}
