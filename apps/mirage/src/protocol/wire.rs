use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Message, MAX_MESSAGE_SIZE};

/// Frame header: message body length, big-endian.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message body is {0} bytes, over the {MAX_MESSAGE_SIZE}-byte limit")]
    Oversized(usize),
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serialize a message body as a named-field MessagePack map.
pub fn encode_body(message: &Message) -> Result<Bytes, WireError> {
    let body = rmp_serde::to_vec_named(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized(body.len()));
    }
    Ok(Bytes::from(body))
}

/// Decode a message body. Unknown fields are ignored for forward
/// compatibility; an unknown `type` is an error.
pub fn decode_body(body: &[u8]) -> Result<Message, WireError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Serialize a message with its length prefix, ready to write.
pub fn encode_frame(message: &Message) -> Result<Bytes, WireError> {
    let body = encode_body(message)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}
