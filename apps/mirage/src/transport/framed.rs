use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::protocol::{wire, MAX_MESSAGE_SIZE};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed for writing")]
    Closed,
    #[error("peer sent a {0}-byte message, over the {MAX_MESSAGE_SIZE}-byte limit")]
    Oversized(usize),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Receive side of a length-delimited message stream.
///
/// Incoming bytes accumulate in an internal buffer and frames are cut
/// from it, so `recv` is safe to use inside `select!`: a dropped call
/// never loses a partially received frame. Bytes pulled off the wire
/// beyond the last frame stay buffered and are surrendered by
/// [`into_parts`] when the connection switches to raw forwarding.
///
/// [`into_parts`]: FramedReader::into_parts
pub struct FramedReader<R> {
    inner: R,
    buf: BytesMut,
    /// Remaining and declared size of an oversized body being drained.
    drain: Option<(usize, usize)>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            drain: None,
        }
    }

    /// Receive the next message body. Returns `Ok(None)` on a clean
    /// close at a frame boundary. An oversized body is drained in full
    /// before the error returns, so the next frame is still readable.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some((mut remaining, declared)) = self.drain.take() {
                let take = remaining.min(self.buf.len());
                self.buf.advance(take);
                remaining -= take;
                if remaining > 0 {
                    self.drain = Some((remaining, declared));
                    if self.fill().await? == 0 {
                        return Err(TransportError::Truncated);
                    }
                    continue;
                }
                return Err(TransportError::Oversized(declared));
            }

            if self.buf.len() >= wire::HEADER_LEN {
                let declared =
                    u32::from_be_bytes(self.buf[..wire::HEADER_LEN].try_into().unwrap()) as usize;
                if declared > MAX_MESSAGE_SIZE {
                    self.buf.advance(wire::HEADER_LEN);
                    self.drain = Some((declared, declared));
                    continue;
                }
                if self.buf.len() >= wire::HEADER_LEN + declared {
                    self.buf.advance(wire::HEADER_LEN);
                    return Ok(Some(self.buf.split_to(declared).freeze()));
                }
            }

            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::Truncated)
                };
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, TransportError> {
        if self.buf.capacity() - self.buf.len() < READ_CHUNK {
            self.buf.reserve(READ_CHUNK);
        }
        Ok(self.inner.read_buf(&mut self.buf).await?)
    }

    /// Surrender the raw stream plus any bytes already pulled off it
    /// beyond the last parsed frame.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.inner, self.buf.freeze())
    }
}

/// Send side of a length-delimited message stream. Once `finish` has
/// begun the half-close, further sends fail with [`TransportError::Closed`].
pub struct FramedWriter<W> {
    inner: W,
    open: bool,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub async fn send(&mut self, body: Bytes) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Oversized(body.len()));
        }
        let mut frame = BytesMut::with_capacity(wire::HEADER_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        match self.inner.write_all(&frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.open = false;
                Err(err.into())
            }
        }
    }

    /// Half-close: flush anything queued, then shut down the write
    /// direction. Idempotent.
    pub async fn finish(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub type ConnReader = FramedReader<OwnedReadHalf>;
pub type ConnWriter = FramedWriter<OwnedWriteHalf>;

pub fn split(stream: TcpStream) -> (ConnReader, ConnWriter) {
    let (read, write) = stream.into_split();
    (FramedReader::new(read), FramedWriter::new(write))
}

/// Reassemble the raw stream from its framed halves so the connection
/// can switch to byte forwarding. Returns the residual bytes that were
/// already read past the last frame; they belong at the front of the
/// forwarded stream.
pub fn reunite(reader: ConnReader, writer: ConnWriter) -> io::Result<(TcpStream, Bytes)> {
    let (read, residual) = reader.into_parts();
    let stream = read
        .reunite(writer.into_inner())
        .map_err(io::Error::other)?;
    Ok((stream, residual))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        FramedWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        FramedReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (_, near_write) = tokio::io::split(near);
        let (far_read, _) = tokio::io::split(far);
        (FramedWriter::new(near_write), FramedReader::new(far_read))
    }

    #[tokio::test]
    async fn bodies_round_trip_through_framing() {
        let (mut writer, mut reader) = pair();
        writer.send(Bytes::from_static(b"hello")).await.unwrap();
        writer.send(Bytes::new()).await.unwrap();
        writer.send(Bytes::from(vec![7u8; 900])).await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(reader.recv().await.unwrap().unwrap().len(), 0);
        assert_eq!(reader.recv().await.unwrap().unwrap().len(), 900);
    }

    #[tokio::test]
    async fn clean_close_at_frame_boundary_is_none() {
        let (mut writer, mut reader) = pair();
        writer.send(Bytes::from_static(b"bye")).await.unwrap();
        writer.finish().await.unwrap();

        assert!(reader.recv().await.unwrap().is_some());
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_frame_is_truncated() {
        let (near, far) = tokio::io::duplex(1024);
        let (_, mut near_write) = tokio::io::split(near);
        let (far_read, _) = tokio::io::split(far);
        let mut reader = FramedReader::new(far_read);

        // Declare 10 bytes, deliver 3, then close.
        near_write.write_all(&10u32.to_be_bytes()).await.unwrap();
        near_write.write_all(b"abc").await.unwrap();
        near_write.shutdown().await.unwrap();

        assert!(matches!(
            reader.recv().await,
            Err(TransportError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_drained_without_losing_the_next_one() {
        let (near, far) = tokio::io::duplex(4 * 1024 * 1024);
        let (_, mut near_write) = tokio::io::split(near);
        let (far_read, _) = tokio::io::split(far);
        let mut reader = FramedReader::new(far_read);

        let oversized = vec![0u8; MAX_MESSAGE_SIZE + 1];
        near_write
            .write_all(&(oversized.len() as u32).to_be_bytes())
            .await
            .unwrap();
        near_write.write_all(&oversized).await.unwrap();
        near_write.write_all(&4u32.to_be_bytes()).await.unwrap();
        near_write.write_all(b"next").await.unwrap();

        assert!(matches!(
            reader.recv().await,
            Err(TransportError::Oversized(_))
        ));
        assert_eq!(reader.recv().await.unwrap().unwrap().as_ref(), b"next");
    }

    #[tokio::test]
    async fn send_after_finish_fails_closed() {
        let (mut writer, _reader) = pair();
        writer.finish().await.unwrap();
        assert!(matches!(
            writer.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn bytes_past_the_last_frame_survive_the_handover() {
        let (near, far) = tokio::io::duplex(1024);
        let (_, mut near_write) = tokio::io::split(near);
        let (far_read, _) = tokio::io::split(far);
        let mut reader = FramedReader::new(far_read);

        // One frame immediately followed by raw non-frame bytes, the
        // way a display server greets as soon as forwarding starts.
        near_write.write_all(&2u32.to_be_bytes()).await.unwrap();
        near_write.write_all(b"okRFB 003.008\n").await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap().as_ref(), b"ok");
        let (_stream, residual) = reader.into_parts();
        assert_eq!(residual.as_ref(), b"RFB 003.008\n");
    }
}
