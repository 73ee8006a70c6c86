//! Container configuration with builder pattern

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Generic, CRI-shaped container configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    /// Template, image reference, clone source or rootfs path
    pub image: String,
    pub hostname: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub resources: Resources,
    pub network: Option<NetworkConfig>,
    /// Namespaces the router matches rules against
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge: String,
    /// CIDR address or `dhcp`
    pub ip: Option<String>,
    pub gateway: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "vmbr0".to_string(),
            ip: None,
            gateway: None,
        }
    }
}

/// CRI-style resource limits, in CRI units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_limit_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.memory_limit_bytes.is_none()
            && self.cpu_shares.is_none()
            && self.cpu_quota.is_none()
            && self.cpu_period.is_none()
    }

    /// Quota is positive or -1 for unlimited; a period of 0 is meaningless
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(quota) = self.cpu_quota {
            if quota < 0 && quota != -1 {
                return Err(crate::Error::InvalidArgument(format!(
                    "cpu quota must be positive or -1, got {}",
                    quota
                )));
            }
        }
        if self.cpu_period == Some(0) {
            return Err(crate::Error::InvalidArgument("cpu period cannot be 0".into()));
        }
        Ok(())
    }
}

impl ContainerConfig {
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::InvalidContainerId("name cannot be empty".into()));
        }
        self.resources.validate()?;
        for mount in &self.mounts {
            if !mount.container_path.starts_with('/') {
                return Err(crate::Error::InvalidArgument(format!(
                    "mount target must be absolute: {}",
                    mount.container_path
                )));
            }
        }
        Ok(())
    }

    /// Entrypoint followed by its arguments
    pub fn full_command(&self) -> Vec<String> {
        self.command.iter().chain(self.args.iter()).cloned().collect()
    }
}

#[derive(Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    pub fn namespace(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.namespaces.insert(name.into(), value.into());
        self
    }

    pub fn mount(mut self, host: impl Into<String>, container: impl Into<String>, read_only: bool) -> Self {
        self.config.mounts.push(Mount {
            host_path: host.into(),
            container_path: container.into(),
            read_only,
        });
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.config.resources.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn cpu_shares(mut self, shares: u64) -> Self {
        self.config.resources.cpu_shares = Some(shares);
        self
    }

    pub fn cpu_quota(mut self, quota: i64, period: u64) -> Self {
        self.config.resources.cpu_quota = Some(quota);
        self.config.resources.cpu_period = Some(period);
        self
    }

    pub fn network(mut self, bridge: impl Into<String>, ip: Option<String>) -> Self {
        self.config.network = Some(NetworkConfig {
            bridge: bridge.into(),
            ip,
            gateway: None,
        });
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<ContainerConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ContainerConfig::builder()
            .name("web")
            .image("local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst")
            .memory_bytes(512 * 1024 * 1024)
            .cpu_shares(2048)
            .label("app", "web")
            .namespace("tier", "frontend")
            .mount("/srv/data", "/data", true)
            .build();

        assert_eq!(config.name, "web");
        assert_eq!(config.resources.memory_limit_bytes, Some(536_870_912));
        assert_eq!(config.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(config.mounts.len(), 1);
        assert!(config.mounts[0].read_only);
    }

    #[test]
    fn test_config_validation() {
        assert!(ContainerConfig::builder().build().validate().is_err());

        let config = ContainerConfig::builder().name("web").mount("/a", "relative", false).build();
        assert!(config.validate().is_err());

        let config = ContainerConfig::builder().name("web").cpu_quota(50_000, 0).build();
        assert!(config.validate().is_err());

        let config = ContainerConfig::builder().name("web").cpu_quota(-1, 100_000).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resources_validation() {
        assert!(Resources::default().validate().is_ok());

        let quota = |q| Resources {
            cpu_quota: Some(q),
            ..Default::default()
        };
        assert!(quota(50_000).validate().is_ok());
        assert!(quota(-1).validate().is_ok());
        assert!(matches!(quota(-5).validate(), Err(crate::Error::InvalidArgument(_))));

        let zero_period = Resources {
            cpu_period: Some(0),
            ..Default::default()
        };
        assert!(zero_period.validate().is_err());
    }

    #[test]
    fn test_full_command() {
        let mut config = ContainerConfig::builder().name("web").command(["nginx"]).build();
        config.args = vec!["-g".into(), "daemon off;".into()];
        assert_eq!(config.full_command(), vec!["nginx", "-g", "daemon off;"]);
    }

    #[test]
    fn test_config_serialization_defaults() {
        let config: ContainerConfig =
            serde_json::from_str(r#"{"name":"web","image":"debian","hostname":null,"working_dir":null,"network":null}"#)
                .unwrap();
        assert!(config.mounts.is_empty());
        assert!(config.resources.is_empty());
    }
}
