//! Wire protocol between a thin client and the VM host: typed messages
//! with a `type` discriminator, carried in length-prefixed MessagePack
//! frames. The same connection later drops out of message framing
//! entirely and relays raw display bytes.

use serde::{Deserialize, Serialize};

pub mod wire;

pub use wire::{decode_body, encode_body, encode_frame, WireError};

/// Default TCP port for the control connection.
pub const DEFAULT_PORT: u16 = 18923;

/// Scheme used in user-facing addresses (`vmnetx://host[:port]/<password>`).
pub const URL_SCHEME: &str = "vmnetx";

/// Upper bound on a single message body. Larger frames are drained off
/// the wire and rejected so the stream stays parseable.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Lifecycle state of the remote VM, as reported in `auth-ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Every message that can cross the control connection, in both
/// directions. Serialized as a self-describing map keyed by field name,
/// with the variant name in the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Authenticate {
        token: String,
    },
    AuthOk {
        state: VmState,
        name: String,
        max_mouse_rate: u32,
        server_timeout_min: u64,
        server_timeout_max: u64,
    },
    AuthFailed {
        error: String,
    },
    AttachViewer,
    AttachingViewer,
    StartVm,
    StopVm,
    StartupCancel,
    StartupProgress {
        fraction: f64,
    },
    StartupComplete {
        check_display: bool,
    },
    StartupCancelled,
    StartupRejectedMemory,
    StartupFailed {
        message: String,
    },
    VmStopped,
    Error {
        message: String,
    },
}

impl Message {
    /// The `type` discriminator this message serializes under.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Authenticate { .. } => "authenticate",
            Message::AuthOk { .. } => "auth-ok",
            Message::AuthFailed { .. } => "auth-failed",
            Message::AttachViewer => "attach-viewer",
            Message::AttachingViewer => "attaching-viewer",
            Message::StartVm => "start-vm",
            Message::StopVm => "stop-vm",
            Message::StartupCancel => "startup-cancel",
            Message::StartupProgress { .. } => "startup-progress",
            Message::StartupComplete { .. } => "startup-complete",
            Message::StartupCancelled => "startup-cancelled",
            Message::StartupRejectedMemory => "startup-rejected-memory",
            Message::StartupFailed { .. } => "startup-failed",
            Message::VmStopped => "vm-stopped",
            Message::Error { .. } => "error",
        }
    }
}
