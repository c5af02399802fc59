use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay raw bytes between two streams until either direction ends,
/// then tear the pair down by dropping both. Byte order is preserved
/// per direction; the directions are otherwise independent.
///
/// `residual` holds bytes already received from `a` before the switch
/// to forwarding; they are delivered to `b` ahead of everything else.
/// Once a connection enters this function it is never parsed as a
/// message stream again.
pub async fn relay<A, B>(a: A, residual: Bytes, b: B) -> io::Result<u64>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let outbound = async {
        if !residual.is_empty() {
            b_write.write_all(&residual).await?;
        }
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await?;
        Ok(copied + residual.len() as u64)
    };
    let inbound = tokio::io::copy(&mut b_read, &mut a_write);
    tokio::pin!(outbound);
    tokio::pin!(inbound);

    let (direction, result) = tokio::select! {
        r = &mut outbound => ("outbound", r),
        r = &mut inbound => ("inbound", r),
    };
    match &result {
        Ok(bytes) => {
            debug!(target: "mirage::transport", direction, bytes, "relay finished")
        }
        Err(err) => {
            debug!(target: "mirage::transport", direction, error = %err, "relay failed")
        }
    }
    result
}
