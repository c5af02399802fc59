use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use super::VmController;
use crate::endpoint::{serve_connection, ServerEndpointConfig};

/// Accept loop: one endpoint task per client connection, all sharing
/// the controller.
pub struct SessionServer {
    listener: TcpListener,
    config: Arc<ServerEndpointConfig>,
    controller: Arc<dyn VmController>,
}

impl SessionServer {
    pub async fn bind(
        addr: &str,
        config: ServerEndpointConfig,
        controller: Arc<dyn VmController>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(
            target: "mirage::session",
            addr = %self.listener.local_addr()?,
            "listening for clients"
        );
        loop {
            let (stream, _) = self.listener.accept().await?;
            let config = Arc::clone(&self.config);
            let controller = Arc::clone(&self.controller);
            tokio::spawn(async move {
                // Outcomes are logged inside the endpoint.
                let _ = serve_connection(stream, config, controller).await;
            });
        }
    }
}
