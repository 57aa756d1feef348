use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// Lifecycle state reported by the cluster for a running service.
/// An absent state means the service is not running (or does not exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Pending,
    Created,
    Restarting,
    Running,
    Removing,
    Paused,
    Exited,
    Dead,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Pending => "PENDING",
            ServiceState::Created => "CREATED",
            ServiceState::Restarting => "RESTARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Removing => "REMOVING",
            ServiceState::Paused => "PAUSED",
            ServiceState::Exited => "EXITED",
            ServiceState::Dead => "DEAD",
        }
    }

    /// Render an optional state the way failure titles show it.
    pub fn describe(state: Option<ServiceState>) -> &'static str {
        state.map(ServiceState::as_str).unwrap_or("nonexistent")
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polled status of a cluster service. Unknown fields are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusSnapshot {
    #[serde(default)]
    pub alive_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_nodes: Option<Vec<String>>,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ServiceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClusterStatusSnapshot {
    pub fn from_value(v: &serde_json::Value) -> CoreResult<Self> {
        serde_json::from_value(v.clone()).map_err(|e| CoreError::Snapshot(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.state == Some(ServiceState::Running)
    }
}

/// Severity tag attached to event-log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}
