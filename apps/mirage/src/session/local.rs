use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::chunkstats::{self, ChunkStatsDir};
use super::{VmController, VmError, VmEvent};
use crate::protocol::VmState;

const EVENT_CAPACITY: usize = 64;

/// Supervisor bridge for the common deployment: the VM itself is
/// managed out-of-process, its display listens on a local address, and
/// startup progress is read from the cache driver's stat directory.
pub struct LocalController {
    name: String,
    display_addr: String,
    chunk_stats: Option<PathBuf>,
    check_display: bool,
    state: Arc<Mutex<VmState>>,
    startup: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<VmEvent>,
}

impl LocalController {
    pub fn new(
        name: impl Into<String>,
        display_addr: impl Into<String>,
        chunk_stats: Option<PathBuf>,
        check_display: bool,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            display_addr: display_addr.into(),
            chunk_stats,
            check_display,
            state: Arc::new(Mutex::new(VmState::Stopped)),
            startup: Mutex::new(None),
            events,
        })
    }

    fn set_state(&self, next: VmState) {
        *self.state.lock().expect("vm state lock poisoned") = next;
    }

    fn abort_startup(&self) {
        if let Some(handle) = self
            .startup
            .lock()
            .expect("startup lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl VmController for LocalController {
    async fn initialize(&self) -> Result<(), VmError> {
        if let Some(root) = &self.chunk_stats {
            let stats = ChunkStatsDir::new(root.clone());
            match stats.total_chunks().await {
                Ok(total) => {
                    info!(target: "mirage::session", total, root = %root.display(), "chunk stats available")
                }
                Err(err) => {
                    warn!(target: "mirage::session", root = %root.display(), error = %err, "chunk stats unreadable; progress reporting degraded")
                }
            }
        }
        Ok(())
    }

    fn vm_name(&self) -> &str {
        &self.name
    }

    fn vm_state(&self) -> VmState {
        *self.state.lock().expect("vm state lock poisoned")
    }

    async fn start_vm(&self) -> Result<(), VmError> {
        {
            let mut state = self.state.lock().expect("vm state lock poisoned");
            match *state {
                VmState::Stopped => *state = VmState::Starting,
                // Starting or running already; nothing to do.
                _ => return Ok(()),
            }
        }
        info!(target: "mirage::session", vm = %self.name, "starting");

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let stats = self.chunk_stats.clone().map(ChunkStatsDir::new);
        let check_display = self.check_display;
        let handle = tokio::spawn(async move {
            if let Some(stats) = stats {
                if let Err(err) = chunkstats::watch_startup(&stats, &events).await {
                    warn!(target: "mirage::session", error = %err, "startup progress unavailable");
                    *state.lock().expect("vm state lock poisoned") = VmState::Stopped;
                    let _ = events.send(VmEvent::StartupFailed {
                        error: format!("cache driver stats unavailable: {err}"),
                    });
                    return;
                }
            }
            *state.lock().expect("vm state lock poisoned") = VmState::Running;
            let _ = events.send(VmEvent::StartupComplete { check_display });
        });
        *self.startup.lock().expect("startup lock poisoned") = Some(handle);
        Ok(())
    }

    async fn stop_vm(&self) -> Result<(), VmError> {
        self.abort_startup();
        self.set_state(VmState::Stopped);
        info!(target: "mirage::session", vm = %self.name, "stopped");
        let _ = self.events.send(VmEvent::VmStopped);
        Ok(())
    }

    async fn startup_cancel(&self) -> Result<(), VmError> {
        let cancelled = {
            let mut state = self.state.lock().expect("vm state lock poisoned");
            if *state == VmState::Starting {
                *state = VmState::Stopped;
                true
            } else {
                false
            }
        };
        if cancelled {
            self.abort_startup();
            info!(target: "mirage::session", vm = %self.name, "startup cancelled");
            let _ = self.events.send(VmEvent::StartupCancelled);
        }
        Ok(())
    }

    async fn attach_viewer(&self) -> Result<TcpStream, VmError> {
        TcpStream::connect(&self.display_addr)
            .await
            .map_err(VmError::Display)
    }

    fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        self.abort_startup();
        self.set_state(VmState::Stopped);
    }
}
