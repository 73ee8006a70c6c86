//! Runtime configuration
//!
//! Loaded once at startup from a TOML file. Routing rules live here too; a
//! reload replaces the whole rule set (see [`crate::Router::reload`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::router::RoutingRule;
use crate::{Error, Result};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/pve-cri";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding the VMID map, container records and crun bundles
    pub state_dir: PathBuf,
    /// Backend used when no routing rule matches; `"none"` disables the
    /// fallback so unmatched containers are refused
    #[serde(with = "fallback_runtime")]
    pub default_runtime: Option<BackendKind>,
    pub rules: Vec<RoutingRule>,
    pub stop_poll_interval_ms: u64,
    pub stop_poll_attempts: u32,
    /// Grace period for the best-effort stop before removal
    pub remove_grace_secs: u64,
    /// How long a released VMID stays unavailable for new containers
    pub vmid_quarantine_secs: u64,
    pub proxmox: Option<ProxmoxSettings>,
    pub lxc: LxcSettings,
    pub crun: CrunSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            default_runtime: Some(BackendKind::Lxc),
            rules: Vec::new(),
            stop_poll_interval_ms: 1000,
            stop_poll_attempts: 30,
            remove_grace_secs: 30,
            vmid_quarantine_secs: 0,
            proxmox: None,
            lxc: LxcSettings::default(),
            crun: CrunSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxSettings {
    /// e.g. `https://pve1.example.com:8006`
    pub api_url: String,
    pub node: String,
    /// `user@realm!tokenname`
    pub token_id: String,
    pub token_secret: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// Storage used for container root disks, e.g. `local-lvm:8`
    #[serde(default = "default_rootfs_storage")]
    pub rootfs_storage: String,
    /// Binary used for `pct exec`
    #[serde(default = "default_pct")]
    pub pct_binary: String,
}

fn default_true() -> bool {
    true
}

fn default_api_timeout() -> u64 {
    30
}

fn default_rootfs_storage() -> String {
    "local-lvm:8".to_string()
}

fn default_pct() -> String {
    "pct".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LxcSettings {
    /// LXC path (`-P`)
    pub lxc_path: PathBuf,
    /// Template used when the image is not a `dist:release:arch` triple
    pub template: String,
}

impl Default for LxcSettings {
    fn default() -> Self {
        Self {
            lxc_path: PathBuf::from("/var/lib/lxc"),
            template: "download".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrunSettings {
    pub binary: PathBuf,
    /// crun state directory (`--root`); crun's default when unset
    pub root: Option<PathBuf>,
}

impl Default for CrunSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("crun"),
            root: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), rules = config.rules.len(), "Loaded runtime config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::Config("state_dir cannot be empty".into()));
        }
        if self.stop_poll_attempts == 0 {
            return Err(Error::Config("stop_poll_attempts must be at least 1".into()));
        }
        if let Some(ref pve) = self.proxmox {
            if pve.node.is_empty() {
                return Err(Error::Config("proxmox.node cannot be empty".into()));
            }
            if !pve.api_url.starts_with("http://") && !pve.api_url.starts_with("https://") {
                return Err(Error::Config(format!("proxmox.api_url is not a URL: {}", pve.api_url)));
            }
        }
        let needs_pve = self
            .rules
            .iter()
            .map(|r| r.backend)
            .chain(self.default_runtime)
            .any(|k| matches!(k, BackendKind::ProxmoxLxc | BackendKind::ProxmoxVm));
        if needs_pve && self.proxmox.is_none() {
            tracing::warn!("Proxmox backends are routed to but no [proxmox] section is configured");
        }
        Ok(())
    }

    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    pub fn default_runtime(mut self, kind: Option<BackendKind>) -> Self {
        self.default_runtime = kind;
        self
    }

    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn stop_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.stop_poll_interval_ms = interval.as_millis() as u64;
        self.stop_poll_attempts = attempts;
        self
    }

    pub fn vmid_quarantine(mut self, window: Duration) -> Self {
        self.vmid_quarantine_secs = window.as_secs();
        self
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn remove_grace(&self) -> Duration {
        Duration::from_secs(self.remove_grace_secs)
    }

    pub fn quarantine(&self) -> Duration {
        Duration::from_secs(self.vmid_quarantine_secs)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.state_dir.join("vmids.json")
    }

    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join("containers.json")
    }

    pub fn bundle_root(&self) -> PathBuf {
        self.state_dir.join("bundles")
    }
}

mod fallback_runtime {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::backend::BackendKind;

    const NONE: &str = "none";

    pub fn serialize<S: Serializer>(kind: &Option<BackendKind>, serializer: S) -> Result<S::Ok, S::Error> {
        match kind {
            Some(kind) => kind.serialize(serializer),
            None => serializer.serialize_str(NONE),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<BackendKind>, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.trim().eq_ignore_ascii_case(NONE) {
            return Ok(None);
        }
        name.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stop_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.stop_poll_attempts, 30);
        assert_eq!(config.remove_grace(), Duration::from_secs(30));
        assert_eq!(config.mapping_path(), PathBuf::from("/var/lib/pve-cri/vmids.json"));
        // Works without a [proxmox] section
        assert_eq!(config.default_runtime, Some(BackendKind::Lxc));
        assert!(config.proxmox.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_runtime_none_and_aliases() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.default_runtime, Some(BackendKind::Lxc));

        let config = RuntimeConfig::from_toml_str("default_runtime = \"none\"").unwrap();
        assert!(config.default_runtime.is_none());

        let config = RuntimeConfig::from_toml_str("default_runtime = \"qemu\"").unwrap();
        assert_eq!(config.default_runtime, Some(BackendKind::ProxmoxVm));

        let rendered = serde_json::to_value(RuntimeConfig::new().default_runtime(None)).unwrap();
        assert_eq!(rendered["default_runtime"], "none");
    }

    #[test]
    fn test_from_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            state_dir = "/tmp/pve-cri"
            default_runtime = "lxc"

            [[rules]]
            backend = "crun"
            container_mask = "oci-.*"
            priority = 10

            [[rules]]
            backend = "pve-vm"
            priority = 5
            namespaces = { isolation = "vm" }

            [proxmox]
            api_url = "https://pve1:8006"
            node = "pve1"
            token_id = "root@pam!cri"
            token_secret = "secret"
            verify_tls = false
            "#,
        )
        .unwrap();

        assert_eq!(config.default_runtime, Some(BackendKind::Lxc));
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].namespaces.get("isolation").map(String::as_str), Some("vm"));
        let pve = config.proxmox.unwrap();
        assert!(!pve.verify_tls);
        assert_eq!(pve.timeout_secs, 30);
        assert_eq!(pve.rootfs_storage, "local-lvm:8");
        assert_eq!(config.lxc.template, "download");
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::from_toml_str("stop_poll_attempts = 0").is_err());
        assert!(RuntimeConfig::from_toml_str(
            r#"
            [proxmox]
            api_url = "pve1:8006"
            node = "pve1"
            token_id = "a"
            token_secret = "b"
            "#
        )
        .is_err());
        assert!(RuntimeConfig::from_toml_str("default_runtime = \"docker\"").is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = RuntimeConfig::new()
            .state_dir("/srv/cri")
            .default_runtime(None)
            .stop_poll(Duration::from_millis(10), 3);
        assert_eq!(config.bundle_root(), PathBuf::from("/srv/cri/bundles"));
        assert_eq!(config.stop_poll_interval(), Duration::from_millis(10));
        assert!(config.default_runtime.is_none());
    }
}
