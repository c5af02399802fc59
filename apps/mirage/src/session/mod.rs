//! Orchestration boundary between the wire protocol and whatever
//! actually supervises the VM. The supervisor stays behind
//! [`VmController`]; endpoints translate its events 1:1 into messages
//! and its operations are invoked 1:1 from client commands.

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::protocol::VmState;

pub mod chunkstats;
pub mod local;
pub mod server;

pub use local::LocalController;
pub use server::SessionServer;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("display is unavailable: {0}")]
    Display(#[source] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// Lifecycle events emitted by the VM supervisor. Fanned out to every
/// authenticated endpoint.
#[derive(Debug, Clone)]
pub enum VmEvent {
    StartupProgress { count: u64, total: u64 },
    StartupComplete { check_display: bool },
    StartupCancelled,
    StartupRejectedMemory,
    StartupFailed { error: String },
    VmStopped,
}

/// Contract with the external VM supervisor. Implementations must be
/// safe to share across connection tasks.
#[async_trait]
pub trait VmController: Send + Sync {
    /// One-time setup before the listener starts accepting.
    async fn initialize(&self) -> Result<(), VmError>;

    fn vm_name(&self) -> &str;

    fn vm_state(&self) -> VmState;

    async fn start_vm(&self) -> Result<(), VmError>;

    async fn stop_vm(&self) -> Result<(), VmError>;

    async fn startup_cancel(&self) -> Result<(), VmError>;

    /// Open a fresh connection to the VM's display for one viewer.
    async fn attach_viewer(&self) -> Result<TcpStream, VmError>;

    /// Subscribe to lifecycle events. Every subscriber sees events in
    /// emission order.
    fn subscribe(&self) -> broadcast::Receiver<VmEvent>;

    async fn shutdown(&self);
}
