//! Conversion from CRI-shaped configuration to backend-native form

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, ResourceUpdate, Vmid};
use crate::container::{ContainerConfig, Mount, Resources};

/// Most mount points any backend accepts (Proxmox `mp0`..`mp7`)
pub const MAX_MOUNT_POINTS: usize = 8;

pub const DEFAULT_MEMORY_MB: u64 = 512;

/// cgroup v1 default weight
pub const DEFAULT_CPU_SHARES: u64 = 1024;

const MIB: u64 = 1024 * 1024;

/// Bytes to MiB, rounding up so a limit is never silently lowered
pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(MIB)
}

/// Whole cores needed to honour a CFS quota; `None` for unlimited
pub fn cores_from_quota(quota: Option<i64>, period: Option<u64>) -> Option<u32> {
    let quota = quota.filter(|q| *q > 0)? as u64;
    let period = period.filter(|p| *p > 0).unwrap_or(100_000);
    Some(quota.div_ceil(period).max(1) as u32)
}

/// Keep the first [`MAX_MOUNT_POINTS`] mounts, warning about each one dropped
pub fn cap_mounts(id: &str, mounts: &[Mount]) -> Vec<Mount> {
    for (index, dropped) in mounts.iter().enumerate().skip(MAX_MOUNT_POINTS) {
        tracing::warn!(
            container = %id,
            index,
            host_path = %dropped.host_path,
            container_path = %dropped.container_path,
            limit = MAX_MOUNT_POINTS,
            "Mount point limit exceeded, dropping mount"
        );
    }
    mounts.iter().take(MAX_MOUNT_POINTS).cloned().collect()
}

/// Build the native config a driver provisions from
pub fn to_backend_config(id: &str, vmid: Vmid, config: &ContainerConfig) -> BackendConfig {
    let resources = &config.resources;
    let hostname = config
        .hostname
        .clone()
        .unwrap_or_else(|| sanitize_hostname(&config.name));

    BackendConfig {
        vmid,
        hostname,
        memory_mb: resources
            .memory_limit_bytes
            .filter(|b| *b > 0)
            .map(bytes_to_mb)
            .unwrap_or(DEFAULT_MEMORY_MB),
        cpu_shares: resources.cpu_shares.filter(|s| *s > 0).unwrap_or(DEFAULT_CPU_SHARES),
        cores: cores_from_quota(resources.cpu_quota, resources.cpu_period),
        cpu_quota: resources.cpu_quota,
        cpu_period: resources.cpu_period,
        rootfs: config.image.clone(),
        network: config.network.clone(),
        mounts: cap_mounts(id, &config.mounts),
        env: config.env.clone(),
        command: config.full_command(),
        working_dir: config.working_dir.clone(),
        labels: config.labels.clone(),
    }
}

/// Convert CRI resource deltas into backend units
pub fn to_resource_update(resources: &Resources) -> ResourceUpdate {
    ResourceUpdate {
        memory_mb: resources.memory_limit_bytes.filter(|b| *b > 0).map(bytes_to_mb),
        cpu_shares: resources.cpu_shares.filter(|s| *s > 0),
        cpu_quota: resources.cpu_quota,
        cpu_period: resources.cpu_period,
        cores: cores_from_quota(resources.cpu_quota, resources.cpu_period),
    }
}

/// Hostnames are limited to 63 chars of `[a-z0-9-]`
pub fn sanitize_hostname(name: &str) -> String {
    let mut host: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    host.truncate(63);
    let host = host.trim_matches('-').to_string();
    if host.is_empty() {
        "container".to_string()
    } else {
        host
    }
}

// =============================================================================
// OCI runtime spec (config.json for crun bundles)
// =============================================================================

pub const OCI_VERSION: &str = "1.0.2";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub linux: OciLinux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    pub resources: OciResources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMemory {
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// Runtime spec for a crun bundle whose root filesystem lives at `rootfs`
pub fn oci_spec(config: &BackendConfig, rootfs: &str) -> OciSpec {
    let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    if !config.env.contains_key("PATH") {
        env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
    }

    let args = if config.command.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        config.command.clone()
    };

    let mut mounts = default_oci_mounts();
    mounts.extend(config.mounts.iter().map(|m| OciMount {
        destination: m.container_path.clone(),
        mount_type: "bind".to_string(),
        source: m.host_path.clone(),
        options: vec![
            "rbind".to_string(),
            if m.read_only { "ro" } else { "rw" }.to_string(),
        ],
    }));

    let mut namespaces: Vec<OciNamespace> = ["pid", "ipc", "uts", "mount"]
        .iter()
        .map(|t| OciNamespace { ns_type: t.to_string() })
        .collect();
    if config.network.is_some() {
        namespaces.push(OciNamespace {
            ns_type: "network".to_string(),
        });
    }

    OciSpec {
        oci_version: OCI_VERSION.to_string(),
        root: OciRoot {
            path: rootfs.to_string(),
            readonly: false,
        },
        process: OciProcess {
            terminal: false,
            user: OciUser { uid: 0, gid: 0 },
            args,
            env,
            cwd: config.working_dir.clone().unwrap_or_else(|| "/".to_string()),
        },
        hostname: config.hostname.clone(),
        mounts,
        annotations: config.labels.clone(),
        linux: OciLinux {
            namespaces,
            resources: OciResources {
                memory: Some(OciMemory {
                    limit: mb_to_bytes(config.memory_mb) as i64,
                }),
                cpu: Some(OciCpu {
                    shares: Some(config.cpu_shares),
                    quota: config.cpu_quota.filter(|q| *q > 0),
                    period: config.cpu_period,
                }),
            },
        },
    }
}

fn default_oci_mounts() -> Vec<OciMount> {
    let mount = |destination: &str, mount_type: &str, options: &[&str]| OciMount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: mount_type.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    };
    vec![
        mount("/proc", "proc", &[]),
        mount("/dev", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        mount("/dev/pts", "devpts", &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        mount("/dev/shm", "tmpfs", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_mb_rounds_up() {
        assert_eq!(bytes_to_mb(512 * MIB), 512);
        assert_eq!(bytes_to_mb(512 * MIB + 1), 513);
        assert_eq!(bytes_to_mb(1), 1);
        assert_eq!(bytes_to_mb(0), 0);
    }

    #[test]
    fn test_cores_from_quota() {
        assert_eq!(cores_from_quota(Some(150_000), Some(100_000)), Some(2));
        assert_eq!(cores_from_quota(Some(50_000), None), Some(1));
        assert_eq!(cores_from_quota(Some(-1), Some(100_000)), None);
        assert_eq!(cores_from_quota(None, Some(100_000)), None);
    }

    #[test]
    fn test_nine_mounts_keep_first_eight() {
        let mut builder = ContainerConfig::builder().name("web");
        for i in 0..9 {
            builder = builder.mount(format!("/srv/{}", i), format!("/mnt/{}", i), false);
        }
        let config = builder.build();

        let native = to_backend_config("pod-1-web", 4242, &config);
        assert_eq!(native.mounts.len(), MAX_MOUNT_POINTS);
        assert_eq!(native.mounts.last().unwrap().host_path, "/srv/7");
    }

    #[test]
    fn test_backend_config_defaults_and_conversion() {
        let config = ContainerConfig::builder()
            .name("Web_Server")
            .image("debian:bookworm:amd64")
            .memory_bytes(512 * MIB)
            .cpu_quota(200_000, 100_000)
            .command(["nginx"])
            .build();
        let native = to_backend_config("pod-1-Web_Server", 300, &config);

        assert_eq!(native.vmid, 300);
        assert_eq!(native.hostname, "web-server");
        assert_eq!(native.memory_mb, 512);
        assert_eq!(native.cpu_shares, DEFAULT_CPU_SHARES);
        assert_eq!(native.cores, Some(2));
        assert_eq!(native.rootfs, "debian:bookworm:amd64");
        assert_eq!(native.command, vec!["nginx"]);

        let bare = to_backend_config("pod-1-x", 301, &ContainerConfig::builder().name("x").build());
        assert_eq!(bare.memory_mb, DEFAULT_MEMORY_MB);
    }

    #[test]
    fn test_resource_update() {
        let update = to_resource_update(&Resources {
            memory_limit_bytes: Some(MIB * 1024),
            cpu_shares: Some(0),
            cpu_quota: None,
            cpu_period: None,
        });
        assert_eq!(update.memory_mb, Some(1024));
        assert_eq!(update.cpu_shares, None);
        assert!(to_resource_update(&Resources::default()).is_empty());
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("My.App_01"), "my-app-01");
        assert_eq!(sanitize_hostname("__"), "container");
        assert_eq!(sanitize_hostname(&"a".repeat(100)).len(), 63);
    }

    #[test]
    fn test_oci_spec() {
        let config = ContainerConfig::builder()
            .name("nginx")
            .memory_bytes(256 * MIB)
            .env("FOO", "bar")
            .mount("/srv/html", "/usr/share/nginx/html", true)
            .build();
        let native = to_backend_config("pod-1-nginx", 500, &config);
        let spec = oci_spec(&native, "/var/lib/images/nginx/rootfs");
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["root"]["path"], "/var/lib/images/nginx/rootfs");
        assert_eq!(json["process"]["args"][0], "/bin/sh");
        assert_eq!(json["linux"]["resources"]["memory"]["limit"], 256 * MIB);
        assert!(spec.process.env.contains(&"FOO=bar".to_string()));
        let bind = spec.mounts.last().unwrap();
        assert_eq!(bind.mount_type, "bind");
        assert!(bind.options.contains(&"ro".to_string()));
        assert!(!spec.linux.namespaces.iter().any(|n| n.ns_type == "network"));
    }
}
