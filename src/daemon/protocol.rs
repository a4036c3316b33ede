//! Daemon states and the notifications a daemon emits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Daemon lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Never started
    #[default]
    Null,
    /// Start hook is running
    Starting,
    /// Daemon is running
    Started,
    /// Stop hook is running
    Stopping,
    /// Daemon is stopped
    Stopped,
    /// Start hook failed or the workload reported a failure
    Failed,
}

impl DaemonState {
    /// Check if the daemon is running
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonState::Started)
    }

    /// States a daemon may be started from
    pub fn can_start(&self) -> bool {
        matches!(self, DaemonState::Null | DaemonState::Stopped)
    }

    /// States a daemon may be stopped from
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            DaemonState::Starting | DaemonState::Started | DaemonState::Failed
        )
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Null => "null",
            DaemonState::Starting => "starting",
            DaemonState::Started => "started",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
            DaemonState::Failed => "failed",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification broadcast to daemon observers
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Emitted on every state transition
    StateChanged(DaemonState),
    /// Emitted when the daemon reports a failure
    Failed(HostError),
}
