//! Role-specific state machines over the framed connection. Each
//! endpoint owns its socket: every exit path, clean or not, closes it.
//!
//! Messages are parsed strictly in arrival order: one message is fully
//! decoded and dispatched before the next length prefix is touched.
//! The framed reader is cancellation-safe, so endpoints can wait for a
//! message and for other events in one `select!` without risking a
//! torn frame.

use thiserror::Error;

use crate::protocol::{wire, Message, WireError};
use crate::transport::framed::ConnReader;
use crate::transport::TransportError;

pub mod client;
pub mod server;

pub use client::{AuthInfo, ClientEndpoint, ClientEvent, ViewerTunnel};
pub use server::{serve_connection, ServerEndpointConfig};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer violated the protocol: {0}")]
    Protocol(String),
    #[error("peer reported an error: {0}")]
    Remote(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("viewer attach failed: {0}")]
    Viewer(String),
    #[error("connection lost")]
    ConnectionLost,
}

/// One receive step, classified for the state machines.
#[derive(Debug)]
pub(crate) enum Incoming {
    Msg(Message),
    /// Clean close at a frame boundary.
    Eof,
    /// Fatal receive failure.
    Failed(EndpointError),
    /// Oversized or undecodable frame. The stream itself stayed
    /// consistent; how to react is the endpoint's call.
    Malformed(EndpointError),
}

pub(crate) async fn next_incoming(reader: &mut ConnReader) -> Incoming {
    match reader.recv().await {
        Ok(Some(body)) => match wire::decode_body(&body) {
            Ok(message) => Incoming::Msg(message),
            Err(err) => Incoming::Malformed(err.into()),
        },
        Ok(None) => Incoming::Eof,
        Err(err @ TransportError::Oversized(_)) => Incoming::Malformed(err.into()),
        Err(err) => Incoming::Failed(err.into()),
    }
}
