use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{next_incoming, EndpointError, Incoming};
use crate::protocol::{wire, Message, VmState};
use crate::transport::framed::{self, ConnReader, ConnWriter};

/// Server-reported session parameters from `auth-ok`.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub state: VmState,
    pub name: String,
    pub max_mouse_rate: u32,
    pub server_timeout_min: u64,
    pub server_timeout_max: u64,
}

/// Server-initiated notifications surfaced while the session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StartupProgress { fraction: f64 },
    StartupComplete { check_display: bool },
    StartupCancelled,
    StartupRejectedMemory,
    StartupFailed { message: String },
    VmStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Unauthenticated,
    Running,
    Closed,
}

/// Client side of the control connection.
///
/// Commands are only legal in the states the protocol allows them in;
/// calling one elsewhere is a bug in the caller and panics rather than
/// putting an illegal message on the wire. Messages from the server
/// that do not fit the current state terminate the connection as a
/// protocol error.
pub struct ClientEndpoint {
    conn_id: Uuid,
    reader: ConnReader,
    writer: ConnWriter,
    state: ClientState,
}

/// The connection after the viewer handshake: a raw display stream
/// plus whatever display bytes were already pulled off the wire while
/// the last message was parsed. Consumers must deliver `residual`
/// before anything read from `stream`.
pub struct ViewerTunnel {
    pub stream: TcpStream,
    pub residual: Bytes,
}

impl ClientEndpoint {
    pub async fn connect(addr: SocketAddr) -> Result<Self, EndpointError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| EndpointError::Transport(err.into()))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let conn_id = Uuid::new_v4();
        debug!(target: "mirage::endpoint", %conn_id, "client connection opened");
        let (reader, writer) = framed::split(stream);
        Self {
            conn_id,
            reader,
            writer,
            state: ClientState::Unauthenticated,
        }
    }

    /// Present the token and wait for the verdict. On success the
    /// session is running; on `auth-failed` the connection is closed
    /// and the error is fatal (retrying cannot help).
    pub async fn authenticate(&mut self, token: &str) -> Result<AuthInfo, EndpointError> {
        self.require(ClientState::Unauthenticated, "authenticate");
        self.send(Message::Authenticate {
            token: token.to_string(),
        })
        .await?;
        match self.next_message().await? {
            Message::AuthOk {
                state,
                name,
                max_mouse_rate,
                server_timeout_min,
                server_timeout_max,
            } => {
                self.state = ClientState::Running;
                info!(target: "mirage::endpoint", conn_id = %self.conn_id, vm = %name, "authenticated");
                Ok(AuthInfo {
                    state,
                    name,
                    max_mouse_rate,
                    server_timeout_min,
                    server_timeout_max,
                })
            }
            Message::AuthFailed { error } => {
                self.close().await;
                Err(EndpointError::AuthFailed(error))
            }
            Message::Error { message } => {
                self.close().await;
                Err(EndpointError::Remote(message))
            }
            other => {
                self.protocol_error(format!(
                    "unexpected message {} while authenticating",
                    other.kind()
                ))
                .await
            }
        }
    }

    pub async fn start_vm(&mut self) -> Result<(), EndpointError> {
        self.require(ClientState::Running, "start the VM");
        self.send(Message::StartVm).await
    }

    pub async fn stop_vm(&mut self) -> Result<(), EndpointError> {
        self.require(ClientState::Running, "stop the VM");
        self.send(Message::StopVm).await
    }

    pub async fn startup_cancel(&mut self) -> Result<(), EndpointError> {
        self.require(ClientState::Running, "cancel startup");
        self.send(Message::StartupCancel).await
    }

    /// Wait for the next server notification.
    pub async fn next_event(&mut self) -> Result<ClientEvent, EndpointError> {
        self.require(ClientState::Running, "wait for events");
        match self.next_message().await? {
            Message::StartupProgress { fraction } => Ok(ClientEvent::StartupProgress { fraction }),
            Message::StartupComplete { check_display } => {
                Ok(ClientEvent::StartupComplete { check_display })
            }
            Message::StartupCancelled => Ok(ClientEvent::StartupCancelled),
            Message::StartupRejectedMemory => Ok(ClientEvent::StartupRejectedMemory),
            Message::StartupFailed { message } => Ok(ClientEvent::StartupFailed { message }),
            Message::VmStopped => Ok(ClientEvent::VmStopped),
            Message::Error { message } => {
                self.close().await;
                Err(EndpointError::Remote(message))
            }
            other => {
                self.protocol_error(format!("unexpected message {}", other.kind()))
                    .await
            }
        }
    }

    /// Request the viewer attach and turn the connection into the raw
    /// display stream. A `vm-stopped` arriving mid-handshake is the
    /// benign race with a server-side stop and is ignored.
    pub async fn attach_viewer(mut self) -> Result<ViewerTunnel, EndpointError> {
        self.require(ClientState::Running, "attach the viewer");
        self.send(Message::AttachViewer).await?;
        loop {
            match self.next_message().await? {
                Message::AttachingViewer => {
                    info!(target: "mirage::endpoint", conn_id = %self.conn_id, "entering forwarding mode");
                    let ClientEndpoint { reader, writer, .. } = self;
                    let (stream, residual) = framed::reunite(reader, writer)
                        .map_err(|err| EndpointError::Transport(err.into()))?;
                    return Ok(ViewerTunnel { stream, residual });
                }
                Message::VmStopped => continue,
                Message::Error { message } => {
                    self.close().await;
                    return Err(EndpointError::Remote(message));
                }
                other => {
                    return self
                        .protocol_error(format!(
                            "unexpected message {} while attaching viewer",
                            other.kind()
                        ))
                        .await
                }
            }
        }
    }

    /// Graceful local close.
    pub async fn shutdown(mut self) {
        self.close().await;
    }

    fn require(&self, expected: ClientState, action: &str) {
        assert!(
            self.state == expected,
            "cannot {action} in state {:?}",
            self.state
        );
    }

    async fn next_message(&mut self) -> Result<Message, EndpointError> {
        match next_incoming(&mut self.reader).await {
            Incoming::Msg(message) => {
                debug!(
                    target: "mirage::endpoint",
                    conn_id = %self.conn_id,
                    kind = message.kind(),
                    "received"
                );
                Ok(message)
            }
            Incoming::Eof => {
                self.state = ClientState::Closed;
                Err(EndpointError::ConnectionLost)
            }
            Incoming::Failed(err) => {
                self.state = ClientState::Closed;
                Err(err)
            }
            Incoming::Malformed(err) => {
                let detail = err.to_string();
                warn!(target: "mirage::endpoint", conn_id = %self.conn_id, %detail, "protocol violation");
                self.state = ClientState::Closed;
                let _ = self
                    .send(Message::Error {
                        message: detail.clone(),
                    })
                    .await;
                let _ = self.writer.finish().await;
                Err(EndpointError::Protocol(detail))
            }
        }
    }

    async fn protocol_error<T>(&mut self, detail: String) -> Result<T, EndpointError> {
        warn!(target: "mirage::endpoint", conn_id = %self.conn_id, %detail, "protocol violation");
        self.state = ClientState::Closed;
        let _ = self
            .send(Message::Error {
                message: detail.clone(),
            })
            .await;
        let _ = self.writer.finish().await;
        Err(EndpointError::Protocol(detail))
    }

    async fn close(&mut self) {
        self.state = ClientState::Closed;
        let _ = self.writer.finish().await;
    }

    async fn send(&mut self, message: Message) -> Result<(), EndpointError> {
        debug!(
            target: "mirage::endpoint",
            conn_id = %self.conn_id,
            kind = message.kind(),
            "sending"
        );
        let body = wire::encode_body(&message)?;
        self.writer.send(body).await?;
        Ok(())
    }
}
