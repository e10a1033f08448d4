//! # crowdiq-session
//!
//! Client-side supervision of one camera's live connection to the CrowdIQ
//! inference backend.  The backend pulls video from the camera's source URI,
//! runs inference, and pushes processed JPEG frames over a per-camera
//! websocket; this crate owns everything on the near side of that socket:
//!
//! - one-shot stream validation before a session is opened
//! - the persistent socket connection with capped exponential reconnect
//! - frame-liveness tracking and status reconciliation when frames stall
//! - start/stop commands against the HTTP control plane
//! - the durable "active camera / inference started" record that lets a
//!   session resume after a process restart
//!
//! The supervisor runs as a single task and exposes its state through
//! `tokio::sync::watch` channels, so any number of observers can follow the
//! connection state and the latest display frame without touching the state
//! machine itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod control;
pub mod sink;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use control::{ControlPlane, HttpControlPlane, InferenceStatus, StopOutcome};
pub use sink::{DisplayFrame, FrameSink};
pub use store::{JsonFileStore, SessionStore};
pub use supervisor::{Backoff, SessionHandle, SessionSupervisor, INFERENCE_STOPPED};
pub use transport::{SocketMessage, Transport, WsTransport};

/// Maximum silent interval tolerated on a connected session before the
/// supervisor reconciles with the control plane.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(3000);

/// First reconnect delay; doubles per consecutive failure.
pub const RECONNECT_BASE: Duration = Duration::from_millis(3000);

/// Reconnect delay cap.
pub const RECONNECT_MAX: Duration = Duration::from_millis(30_000);

/// Source URI sentinel for local-capture cameras.  These have no stream
/// address the backend could probe, so validation is skipped for them.
pub const LOCAL_SOURCE: &str = "local";

#[derive(Error, Debug)]
pub enum SessionError {
    /// Stream validation rejected the source.  Carries the backend's detail
    /// string verbatim so the UI can show it as-is.
    #[error("{0}")]
    Validation(String),
    /// A control-plane request failed.  Carries the backend's detail string
    /// verbatim.
    #[error("{0}")]
    Control(String),
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error("session store I/O failed: {0}")]
    Store(#[from] std::io::Error),
    #[error("session store encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session supervisor is no longer running")]
    SupervisorGone,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// The persisted record of the camera a session supervises.
///
/// Field names mirror the camera document the management API hands out, so a
/// stored record round-trips unchanged.  Everything beyond `camera_id` and
/// `source_uri` is display metadata the session logic treats as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCamera {
    #[serde(rename = "_id")]
    pub camera_id: String,
    #[serde(rename = "stream_link")]
    pub source_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<String>,
}

impl ActiveCamera {
    pub fn new(camera_id: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            source_uri: source_uri.into(),
            name: None,
            location: None,
            stream_type: None,
            last_active: None,
        }
    }

    /// Whether this record carries enough to open a session.  An incomplete
    /// record is not an error, just nothing to supervise.
    pub fn is_supervisable(&self) -> bool {
        !self.camera_id.is_empty() && !self.source_uri.is_empty()
    }

    pub fn is_local(&self) -> bool {
        self.source_uri == LOCAL_SOURCE
    }
}

/// Connection state of the supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Validating,
    Connecting,
    Connected,
    /// No frames for a full liveness window; a status check is in flight.
    /// The socket stays open and the session is still considered live.
    Reconciling,
    /// Validation or connection failed terminally; a fresh start may retry.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconciling)
    }
}

/// What observers see at every transition.
///
/// `connected == false` with a populated `error` means "show the reason";
/// with no error it means "not yet attempted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            error: None,
        }
    }
}
