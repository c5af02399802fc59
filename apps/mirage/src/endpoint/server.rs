use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{next_incoming, EndpointError, Incoming};
use crate::protocol::{wire, Message};
use crate::session::{VmController, VmError, VmEvent};
use crate::transport::framed::{self, ConnReader, ConnWriter};
use crate::transport::forward;

/// Per-listener settings echoed to clients in `auth-ok`.
#[derive(Debug, Clone)]
pub struct ServerEndpointConfig {
    pub auth_token: String,
    pub max_mouse_rate: u32,
    pub server_timeout_min: u64,
    pub server_timeout_max: u64,
}

/// Drive one client connection to completion. Whatever the outcome,
/// the socket is closed by the time this returns; a viewer attach ends
/// with the connection spent as a display tunnel.
pub async fn serve_connection(
    stream: TcpStream,
    config: Arc<ServerEndpointConfig>,
    controller: Arc<dyn VmController>,
) -> Result<(), EndpointError> {
    let conn_id = Uuid::new_v4();
    let peer = stream.peer_addr().ok();
    stream.set_nodelay(true).ok();
    debug!(target: "mirage::endpoint", %conn_id, ?peer, "connection accepted");

    let (reader, writer) = framed::split(stream);
    let conn = ServerConn {
        conn_id,
        reader,
        writer,
        config,
        controller,
    };
    let result = conn.run().await;
    match &result {
        Ok(()) => debug!(target: "mirage::endpoint", %conn_id, "connection finished"),
        Err(err) => debug!(target: "mirage::endpoint", %conn_id, error = %err, "connection failed"),
    }
    result
}

struct ServerConn {
    conn_id: Uuid,
    reader: ConnReader,
    writer: ConnWriter,
    config: Arc<ServerEndpointConfig>,
    controller: Arc<dyn VmController>,
}

enum Turn {
    Incoming(Incoming),
    Event(Result<VmEvent, RecvError>),
}

impl ServerConn {
    async fn run(mut self) -> Result<(), EndpointError> {
        // Unauthenticated: only `authenticate` advances the state.
        // Anything else draws an error reply and changes nothing.
        loop {
            match next_incoming(&mut self.reader).await {
                Incoming::Msg(Message::Authenticate { token }) => {
                    if token == self.config.auth_token {
                        let hello = Message::AuthOk {
                            state: self.controller.vm_state(),
                            name: self.controller.vm_name().to_string(),
                            max_mouse_rate: self.config.max_mouse_rate,
                            server_timeout_min: self.config.server_timeout_min,
                            server_timeout_max: self.config.server_timeout_max,
                        };
                        self.send(hello).await?;
                        info!(target: "mirage::endpoint", conn_id = %self.conn_id, "client authenticated");
                        break;
                    }
                    warn!(target: "mirage::endpoint", conn_id = %self.conn_id, "bad auth token");
                    let _ = self
                        .send(Message::AuthFailed {
                            error: "Authentication failed".into(),
                        })
                        .await;
                    let _ = self.writer.finish().await;
                    return Err(EndpointError::AuthFailed("bad token".into()));
                }
                Incoming::Msg(other) => {
                    debug!(
                        target: "mirage::endpoint",
                        conn_id = %self.conn_id,
                        kind = other.kind(),
                        "message before authentication"
                    );
                    self.send(Message::Error {
                        message: "Not authenticated".into(),
                    })
                    .await?;
                }
                Incoming::Eof => return Ok(()),
                Incoming::Failed(err) => return Err(err),
                Incoming::Malformed(err) => return self.protocol_error(err.to_string()).await,
            }
        }

        // Authenticated: interleave client commands with VM lifecycle
        // events. Messages on the socket keep strict arrival order.
        let mut events = self.controller.subscribe();
        loop {
            let turn = tokio::select! {
                incoming = next_incoming(&mut self.reader) => Turn::Incoming(incoming),
                event = events.recv() => Turn::Event(event),
            };
            match turn {
                Turn::Incoming(Incoming::Msg(message)) => match message {
                    Message::StartVm => {
                        let result = self.controller.start_vm().await;
                        self.report_op("start-vm", result).await?;
                    }
                    Message::StopVm => {
                        let result = self.controller.stop_vm().await;
                        self.report_op("stop-vm", result).await?;
                    }
                    Message::StartupCancel => {
                        let result = self.controller.startup_cancel().await;
                        self.report_op("startup-cancel", result).await?;
                    }
                    Message::AttachViewer => return self.attach_viewer().await,
                    Message::Error { message } => {
                        warn!(target: "mirage::endpoint", conn_id = %self.conn_id, %message, "client reported an error");
                        let _ = self.writer.finish().await;
                        return Err(EndpointError::Remote(message));
                    }
                    other => {
                        return self
                            .protocol_error(format!("unexpected message {}", other.kind()))
                            .await
                    }
                },
                Turn::Incoming(Incoming::Eof) => return Ok(()),
                Turn::Incoming(Incoming::Failed(err)) => return Err(err),
                Turn::Incoming(Incoming::Malformed(err)) => {
                    return self.protocol_error(err.to_string()).await
                }
                Turn::Event(Ok(event)) => self.relay_event(event).await?,
                Turn::Event(Err(RecvError::Lagged(skipped))) => {
                    // Progress events are advisory; dropping some under
                    // load is preferable to stalling the reactor.
                    warn!(target: "mirage::endpoint", conn_id = %self.conn_id, skipped, "event stream lagged");
                }
                Turn::Event(Err(RecvError::Closed)) => {
                    let _ = self.writer.finish().await;
                    return Ok(());
                }
            }
        }
    }

    /// Report the outcome of a controller operation invoked on behalf
    /// of the client; a refusal becomes a startup failure rather than a
    /// teardown.
    async fn report_op(
        &mut self,
        op: &str,
        result: Result<(), VmError>,
    ) -> Result<(), EndpointError> {
        if let Err(err) = result {
            warn!(target: "mirage::endpoint", conn_id = %self.conn_id, op, error = %err, "controller call failed");
            self.send(Message::StartupFailed {
                message: err.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn attach_viewer(mut self) -> Result<(), EndpointError> {
        let display = match self.controller.attach_viewer().await {
            Ok(display) => display,
            Err(err) => {
                let detail = format!("viewer attach failed: {err}");
                let _ = self
                    .send(Message::Error {
                        message: detail.clone(),
                    })
                    .await;
                let _ = self.writer.finish().await;
                return Err(EndpointError::Viewer(detail));
            }
        };
        self.send(Message::AttachingViewer).await?;
        info!(target: "mirage::endpoint", conn_id = %self.conn_id, "entering forwarding mode");

        let ServerConn { reader, writer, .. } = self;
        let (client, residual) = framed::reunite(reader, writer)
            .map_err(|err| EndpointError::Transport(err.into()))?;
        forward::relay(client, residual, display)
            .await
            .map_err(|err| EndpointError::Transport(err.into()))?;
        Ok(())
    }

    async fn relay_event(&mut self, event: VmEvent) -> Result<(), EndpointError> {
        let message = match event {
            VmEvent::StartupProgress { count, total } => Message::StartupProgress {
                fraction: if total == 0 {
                    0.0
                } else {
                    (count as f64 / total as f64).clamp(0.0, 1.0)
                },
            },
            VmEvent::StartupComplete { check_display } => {
                Message::StartupComplete { check_display }
            }
            VmEvent::StartupCancelled => Message::StartupCancelled,
            VmEvent::StartupRejectedMemory => Message::StartupRejectedMemory,
            VmEvent::StartupFailed { error } => Message::StartupFailed { message: error },
            VmEvent::VmStopped => Message::VmStopped,
        };
        self.send(message).await
    }

    async fn send(&mut self, message: Message) -> Result<(), EndpointError> {
        let body = wire::encode_body(&message)?;
        self.writer.send(body).await?;
        Ok(())
    }

    /// Best-effort error report to the peer, then local shutdown.
    async fn protocol_error(&mut self, detail: String) -> Result<(), EndpointError> {
        warn!(target: "mirage::endpoint", conn_id = %self.conn_id, %detail, "protocol violation");
        let _ = self
            .send(Message::Error {
                message: detail.clone(),
            })
            .await;
        let _ = self.writer.finish().await;
        Err(EndpointError::Protocol(detail))
    }
}
