//! Container record model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, BackendKind, BackendState, ContainerInfo, ResourceUpdate, Vmid};
use crate::container::ContainerConfig;

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Provisioned, never started
    Created,
    Running,
    Stopped,
    /// Frozen in memory
    Paused,
    Removed,
    /// Backend reported something we cannot map
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Removed => write!(f, "removed"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ContainerState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ContainerState::Created),
            "running" => Ok(ContainerState::Running),
            "stopped" | "exited" => Ok(ContainerState::Stopped),
            "paused" => Ok(ContainerState::Paused),
            "removed" => Ok(ContainerState::Removed),
            "unknown" => Ok(ContainerState::Unknown),
            other => Err(crate::Error::InvalidArgument(format!("unknown container state '{}'", other))),
        }
    }
}

impl From<BackendState> for ContainerState {
    fn from(state: BackendState) -> Self {
        match state {
            BackendState::Created => ContainerState::Created,
            BackendState::Running => ContainerState::Running,
            BackendState::Stopped => ContainerState::Stopped,
            BackendState::Paused => ContainerState::Paused,
            BackendState::Unknown => ContainerState::Unknown,
        }
    }
}

/// What the orchestrator remembers about one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub pod_id: Option<String>,
    pub name: String,
    pub vmid: Vmid,
    pub state: ContainerState,
    pub backend: BackendKind,
    pub config: ContainerConfig,
    /// Native config as provisioned, with applied updates folded in
    pub native: BackendConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Resource changes made while stopped, applied at next start
    #[serde(default)]
    pub pending_resources: Option<ResourceUpdate>,
}

impl ContainerRecord {
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.labels
    }
}

/// Narrowing criteria for `list_containers`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFilter {
    pub id_prefix: Option<String>,
    pub state: Option<ContainerState>,
    /// Every selector key must be present with an equal value
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn state(mut self, state: ContainerState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, id: &str, state: ContainerState, labels: &BTreeMap<String, String>) -> bool {
        if let Some(ref prefix) = self.id_prefix {
            if !id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(wanted) = self.state {
            if wanted != state {
                return false;
            }
        }
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Record merged with live backend information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub vmid: Vmid,
    pub backend: BackendKind,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub ip_address: Option<String>,
    pub memory_used_mb: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub native: BackendConfig,
    pub pending_resources: Option<ResourceUpdate>,
}

impl ContainerStatus {
    /// Merge a record with what the backend reports right now.
    ///
    /// Without backend information the record's own state is reported.
    pub fn merge(record: &ContainerRecord, live: Option<&ContainerInfo>) -> Self {
        let state = match live.map(|i| i.state) {
            // The backend cannot distinguish never-started from stopped
            Some(BackendState::Stopped) if record.state == ContainerState::Created => ContainerState::Created,
            Some(BackendState::Unknown) | None => record.state,
            Some(other) => other.into(),
        };
        Self {
            id: record.id.clone(),
            vmid: record.vmid,
            backend: record.backend,
            state,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: live.and_then(|i| i.exit_code).or(record.exit_code),
            pid: live.and_then(|i| i.pid),
            ip_address: live.and_then(|i| i.ip_address.clone()),
            memory_used_mb: live.and_then(|i| i.memory_used_mb),
            uptime_secs: live.and_then(|i| i.uptime_secs),
            image: record.config.image.clone(),
            labels: record.config.labels.clone(),
            annotations: record.config.annotations.clone(),
            native: record.native.clone(),
            pending_resources: record.pending_resources.clone(),
        }
    }
}
