//! Thin-client `connect` flow: dial, authenticate, follow startup
//! progress, and optionally bridge the attached display to a local
//! port. Transport failures feed the reconnect timer; authentication
//! and protocol failures are fatal.

use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::addr::VmAddr;
use crate::endpoint::{ClientEndpoint, ClientEvent, EndpointError};
use crate::protocol::VmState;
use crate::reconnect::ReconnectTimer;
use crate::transport::forward;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub addr: VmAddr,
    /// Ask the server to start the VM if it is stopped.
    pub start: bool,
    /// Bridge the attached display to `127.0.0.1:<port>`.
    pub viewer: Option<u16>,
}

enum SessionEnd {
    /// The session concluded; nothing left to do.
    Finished,
}

pub async fn run(options: ConnectOptions) -> anyhow::Result<()> {
    let mut timer = ReconnectTimer::default();
    loop {
        timer.attempt();
        timer.fired().await;
        match session(&options, &mut timer).await {
            Ok(SessionEnd::Finished) => return Ok(()),
            Err(err) if is_fatal(&err) => return Err(anyhow!(err)),
            Err(err) => {
                warn!(target: "mirage::client", error = %err, "connection lost; will retry");
            }
        }
    }
}

fn is_fatal(err: &EndpointError) -> bool {
    // Credentials do not become valid by waiting, and a peer that
    // violates the protocol will violate it again.
    matches!(
        err,
        EndpointError::AuthFailed(_)
            | EndpointError::Protocol(_)
            | EndpointError::Remote(_)
            | EndpointError::Wire(_)
            | EndpointError::Viewer(_)
    )
}

async fn session(
    options: &ConnectOptions,
    timer: &mut ReconnectTimer,
) -> Result<SessionEnd, EndpointError> {
    let target = resolve(&options.addr).await?;
    let mut endpoint = ClientEndpoint::connect(target).await?;
    let info = endpoint.authenticate(&options.addr.password).await?;
    timer.reset();
    info!(
        target: "mirage::client",
        vm = %info.name,
        state = ?info.state,
        "session established"
    );

    if let Some(port) = options.viewer {
        if info.state == VmState::Running {
            return bridge_viewer(endpoint, port).await;
        }
    }

    let mut starting = false;
    if options.start && info.state == VmState::Stopped {
        endpoint.start_vm().await?;
        starting = true;
    }

    loop {
        let turn = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            event = endpoint.next_event() => Some(event),
        };
        let event = match turn {
            None => {
                info!(target: "mirage::client", "interrupted");
                if starting {
                    endpoint.startup_cancel().await?;
                }
                endpoint.shutdown().await;
                return Ok(SessionEnd::Finished);
            }
            Some(event) => event?,
        };
        match event {
            ClientEvent::StartupProgress { fraction } => {
                info!(target: "mirage::client", "startup {:>3.0}%", fraction * 100.0);
            }
            ClientEvent::StartupComplete { check_display } => {
                starting = false;
                info!(target: "mirage::client", check_display, "VM is running");
                if let Some(port) = options.viewer {
                    return bridge_viewer(endpoint, port).await;
                }
            }
            ClientEvent::StartupCancelled => {
                info!(target: "mirage::client", "startup cancelled");
                return Ok(SessionEnd::Finished);
            }
            ClientEvent::StartupRejectedMemory => {
                error!(target: "mirage::client", "server rejected startup: not enough memory");
                return Ok(SessionEnd::Finished);
            }
            ClientEvent::StartupFailed { message } => {
                error!(target: "mirage::client", %message, "startup failed");
                return Ok(SessionEnd::Finished);
            }
            ClientEvent::VmStopped => {
                info!(target: "mirage::client", "VM stopped");
                return Ok(SessionEnd::Finished);
            }
        }
    }
}

async fn resolve(addr: &VmAddr) -> Result<SocketAddr, EndpointError> {
    let mut candidates = tokio::net::lookup_host((addr.host.as_str(), addr.port))
        .await
        .map_err(|err| EndpointError::Transport(err.into()))?;
    candidates.next().ok_or_else(|| {
        EndpointError::Transport(
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}", addr.host),
            )
            .into(),
        )
    })
}

/// Expose the forwarded display on a local port for one display
/// client, then relay until either side closes.
async fn bridge_viewer(
    endpoint: ClientEndpoint,
    port: u16,
) -> Result<SessionEnd, EndpointError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|err| EndpointError::Transport(err.into()))?;
    let local = listener
        .local_addr()
        .map_err(|err| EndpointError::Transport(err.into()))?;
    info!(target: "mirage::client", %local, "waiting for a display client");

    let (viewer, peer) = listener
        .accept()
        .await
        .map_err(|err| EndpointError::Transport(err.into()))?;
    info!(target: "mirage::client", %peer, "display client connected; attaching viewer");

    let tunnel = endpoint.attach_viewer().await?;
    forward::relay(tunnel.stream, tunnel.residual, viewer)
        .await
        .map_err(|err| EndpointError::Transport(err.into()))?;
    info!(target: "mirage::client", "viewer session ended");
    Ok(SessionEnd::Finished)
}

pub async fn run_from_address(
    address: &str,
    start: bool,
    viewer: Option<u16>,
) -> anyhow::Result<()> {
    let addr = VmAddr::parse(address).context("invalid server address")?;
    run(ConnectOptions {
        addr,
        start,
        viewer,
    })
    .await
}
