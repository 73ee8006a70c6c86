//! Backend driver contract
//!
//! Every runtime (native LXC, Proxmox-managed LXC, Proxmox-managed VMs,
//! crun) implements [`BackendDriver`]. Drivers know nothing about routing or
//! identity mapping: they address resources by the numeric VMID the
//! orchestrator hands them.

pub mod command;
pub mod crun;
pub mod lxc;
pub mod proxmox;

pub use self::crun::CrunDriver;
pub use self::lxc::LxcDriver;
pub use self::proxmox::{GuestType, ProxmoxClient, ProxmoxDriver};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::container::{Mount, NetworkConfig};
use crate::error::{BackendError, BackendResult};
use crate::{Error, Result};

/// Proxmox numeric guest identifier
pub type Vmid = u32;

/// The runtime a container is executed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    /// Native LXC via the lxc-* tools
    #[serde(rename = "lxc")]
    Lxc,
    /// LXC container managed through the Proxmox API
    #[serde(rename = "pve-lxc")]
    ProxmoxLxc,
    /// QEMU VM managed through the Proxmox API
    #[serde(rename = "pve-vm")]
    ProxmoxVm,
    /// OCI bundle executed by crun
    #[serde(rename = "crun")]
    Crun,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Lxc,
        BackendKind::ProxmoxLxc,
        BackendKind::ProxmoxVm,
        BackendKind::Crun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lxc => "lxc",
            BackendKind::ProxmoxLxc => "pve-lxc",
            BackendKind::ProxmoxVm => "pve-vm",
            BackendKind::Crun => "crun",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lxc" => Ok(BackendKind::Lxc),
            "pve-lxc" | "proxmox-lxc" => Ok(BackendKind::ProxmoxLxc),
            "pve-vm" | "proxmox-vm" | "qemu" => Ok(BackendKind::ProxmoxVm),
            "crun" | "oci" => Ok(BackendKind::Crun),
            other => Err(Error::Config(format!("unknown backend kind '{}'", other))),
        }
    }
}

/// Status of a resource as reported by its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Created,
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Created => write!(f, "created"),
            BackendState::Running => write!(f, "running"),
            BackendState::Stopped => write!(f, "stopped"),
            BackendState::Paused => write!(f, "paused"),
            BackendState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Live information about one backend resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub vmid: Vmid,
    pub name: Option<String>,
    pub state: BackendState,
    pub pid: Option<u32>,
    pub ip_address: Option<String>,
    pub memory_used_mb: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub exit_code: Option<i32>,
}

impl ContainerInfo {
    pub fn new(vmid: Vmid, state: BackendState) -> Self {
        Self {
            vmid,
            name: None,
            state,
            pid: None,
            ip_address: None,
            memory_used_mb: None,
            uptime_secs: None,
            exit_code: None,
        }
    }
}

/// Output of a command run inside a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Backend-native configuration produced from a generic container config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub vmid: Vmid,
    pub hostname: String,
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub cores: Option<u32>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    /// Template, image, clone source or rootfs path depending on the backend
    pub rootfs: String,
    pub network: Option<NetworkConfig>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl BackendConfig {
    /// Fold a resource update into the stored native config
    pub fn apply(&mut self, update: &ResourceUpdate) {
        if let Some(mb) = update.memory_mb {
            self.memory_mb = mb;
        }
        if let Some(shares) = update.cpu_shares {
            self.cpu_shares = shares;
        }
        if update.cpu_quota.is_some() {
            self.cpu_quota = update.cpu_quota;
        }
        if update.cpu_period.is_some() {
            self.cpu_period = update.cpu_period;
        }
        if update.cores.is_some() {
            self.cores = update.cores;
        }
    }
}

/// Resource changes in backend units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub memory_mb: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cores: Option<u32>,
}

impl ResourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none()
            && self.cpu_shares.is_none()
            && self.cpu_quota.is_none()
            && self.cpu_period.is_none()
            && self.cores.is_none()
    }

    /// Combine with a newer update; fields set in `newer` win
    pub fn merge(self, newer: &ResourceUpdate) -> ResourceUpdate {
        ResourceUpdate {
            memory_mb: newer.memory_mb.or(self.memory_mb),
            cpu_shares: newer.cpu_shares.or(self.cpu_shares),
            cpu_quota: newer.cpu_quota.or(self.cpu_quota),
            cpu_period: newer.cpu_period.or(self.cpu_period),
            cores: newer.cores.or(self.cores),
        }
    }
}

/// Uniform operation set implemented once per backend kind.
///
/// Calls block for the duration of an external process or HTTP round-trip.
#[cfg_attr(test, mockall::automock)]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provision the backend-native resource
    fn create(&self, config: &BackendConfig) -> BackendResult<()>;

    fn start(&self, vmid: Vmid) -> BackendResult<()>;

    /// Request shutdown, allowing `timeout` for a clean stop when given
    fn stop(&self, vmid: Vmid, timeout: Option<Duration>) -> BackendResult<()>;

    fn delete(&self, vmid: Vmid) -> BackendResult<()>;

    fn list(&self) -> BackendResult<Vec<ContainerInfo>>;

    fn info(&self, vmid: Vmid) -> BackendResult<ContainerInfo>;

    /// Run a command inside the resource.
    ///
    /// A command that ran to completion is `Ok` whatever its exit code;
    /// running past `timeout` is `Timeout`.
    fn exec(&self, vmid: Vmid, command: &[String], timeout: Duration) -> BackendResult<ExecResult>;

    fn update_resources(&self, vmid: Vmid, update: &ResourceUpdate) -> BackendResult<()>;

    fn pause(&self, _vmid: Vmid) -> BackendResult<()> {
        Err(BackendError::UnsupportedOperation(format!("{} cannot pause", self.kind())))
    }

    fn resume(&self, _vmid: Vmid) -> BackendResult<()> {
        Err(BackendError::UnsupportedOperation(format!("{} cannot resume", self.kind())))
    }
}

/// Drivers available to the orchestrator, one per backend kind
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<BackendKind, Arc<dyn BackendDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from runtime configuration.
    ///
    /// LXC and crun are always registered; the Proxmox drivers only when an
    /// API endpoint is configured.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(LxcDriver::new(config.lxc.clone())));
        registry.register(Arc::new(CrunDriver::new(
            config.crun.clone(),
            config.bundle_root(),
        )));

        if let Some(ref pve) = config.proxmox {
            let client = Arc::new(ProxmoxClient::new(pve.clone())?);
            registry.register(Arc::new(ProxmoxDriver::new(client.clone(), GuestType::Lxc)));
            registry.register(Arc::new(ProxmoxDriver::new(client, GuestType::Qemu)));
        }

        Ok(registry)
    }

    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        tracing::debug!(backend = %driver.kind(), "Registered backend driver");
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn with(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn BackendDriver>> {
        self.drivers.get(&kind).cloned().ok_or_else(|| {
            Error::backend(
                kind,
                BackendError::UnsupportedOperation(format!("no driver registered for {}", kind)),
            )
        })
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse_and_display() {
        assert_eq!("pve-vm".parse::<BackendKind>().unwrap(), BackendKind::ProxmoxVm);
        assert_eq!("OCI".parse::<BackendKind>().unwrap(), BackendKind::Crun);
        assert!("docker".parse::<BackendKind>().is_err());
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_backend_kind_serde_names() {
        let json = serde_json::to_string(&BackendKind::ProxmoxLxc).unwrap();
        assert_eq!(json, "\"pve-lxc\"");
    }

    #[test]
    fn test_resource_update_merge() {
        let pending = ResourceUpdate {
            memory_mb: Some(512),
            cpu_shares: Some(1024),
            ..Default::default()
        };
        let newer = ResourceUpdate {
            memory_mb: Some(1024),
            ..Default::default()
        };
        let merged = pending.merge(&newer);
        assert_eq!(merged.memory_mb, Some(1024));
        assert_eq!(merged.cpu_shares, Some(1024));
        assert!(ResourceUpdate::default().is_empty());
    }

    #[test]
    fn test_registry_missing_driver() {
        let registry = DriverRegistry::new();
        let err = registry.get(BackendKind::ProxmoxVm).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedOperation);
    }
}
