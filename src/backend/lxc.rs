//! Native LXC driver built on the lxc-* command line tools

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use super::command::{self, DEFAULT_TIMEOUT};
use super::{BackendConfig, BackendDriver, BackendKind, BackendState, ContainerInfo, ExecResult, ResourceUpdate, Vmid};
use crate::config::LxcSettings;
use crate::error::{BackendError, BackendResult};

/// Keys this driver owns in a container's LXC config
const MEMORY_KEY: &str = "lxc.cgroup2.memory.max";
const WEIGHT_KEY: &str = "lxc.cgroup2.cpu.weight";
const CPU_MAX_KEY: &str = "lxc.cgroup2.cpu.max";

pub struct LxcDriver {
    settings: LxcSettings,
}

impl LxcDriver {
    pub fn new(settings: LxcSettings) -> Self {
        Self { settings }
    }

    fn config_path(&self, vmid: Vmid) -> PathBuf {
        self.settings.lxc_path.join(vmid.to_string()).join("config")
    }

    /// `-n <vmid> -P <lxc_path>` followed by `extra`
    fn args(&self, vmid: Vmid, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            vmid.to_string(),
            "-P".to_string(),
            self.settings.lxc_path.to_string_lossy().into_owned(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    fn tool(&self, tool: &str, vmid: Vmid, extra: &[&str]) -> BackendResult<String> {
        command::check(tool, self.args(vmid, extra), DEFAULT_TIMEOUT)
    }

    fn create_args(&self, config: &BackendConfig) -> BackendResult<Vec<String>> {
        let mut args = self.args(config.vmid, &[]);
        match ImageSource::parse(&config.rootfs, &self.settings.template)? {
            ImageSource::Download { dist, release, arch } => {
                args.extend(["-t", "download", "--", "-d", dist, "-r", release, "-a", arch].map(String::from));
            }
            ImageSource::Directory(_) => args.extend(["-t", "none"].map(String::from)),
            ImageSource::Template(template) => args.extend(["-t".to_string(), template.to_string()]),
        }
        Ok(args)
    }

    fn append_config(&self, config: &BackendConfig) -> BackendResult<()> {
        let path = self.config_path(config.vmid);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        file.write_all(render_config(config).as_bytes())
            .map_err(|e| io_error(&path, e))
    }

    /// Undo a half-finished create; the original error is what the caller sees
    fn roll_back(&self, vmid: Vmid) {
        if let Err(e) = self.delete(vmid) {
            tracing::warn!(vmid, error = %e, "Failed to roll back LXC container");
        }
    }

    fn set_cgroup(&self, vmid: Vmid, key: &str, value: &str) -> BackendResult<()> {
        self.tool("lxc-cgroup", vmid, &[key, value]).map(|_| ())
    }
}

impl BackendDriver for LxcDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxc
    }

    fn create(&self, config: &BackendConfig) -> BackendResult<()> {
        let args = self.create_args(config)?;
        tracing::info!(vmid = config.vmid, image = %config.rootfs, "Creating LXC container");
        command::check("lxc-create", &args, DEFAULT_TIMEOUT)?;

        if let Err(e) = self.append_config(config) {
            self.roll_back(config.vmid);
            return Err(e);
        }
        Ok(())
    }

    fn start(&self, vmid: Vmid) -> BackendResult<()> {
        self.tool("lxc-start", vmid, &["-d"])?;
        Ok(())
    }

    fn stop(&self, vmid: Vmid, timeout: Option<Duration>) -> BackendResult<()> {
        let secs = timeout.map(|t| t.as_secs().to_string());
        let extra: Vec<&str> = match secs {
            Some(ref s) if s != "0" => vec!["-t", s.as_str()],
            Some(_) => vec!["-k"],
            None => vec![],
        };
        let run_for = timeout.map_or(DEFAULT_TIMEOUT, |t| t + DEFAULT_TIMEOUT);
        let output = command::run("lxc-stop", self.args(vmid, &extra), run_for)?;
        if output.success() || output.message().contains("not running") {
            Ok(())
        } else {
            Err(command::classify("lxc-stop", &output))
        }
    }

    fn delete(&self, vmid: Vmid) -> BackendResult<()> {
        self.tool("lxc-destroy", vmid, &["-f"])?;
        Ok(())
    }

    fn list(&self) -> BackendResult<Vec<ContainerInfo>> {
        let lxc_path = self.settings.lxc_path.to_string_lossy();
        let args = ["-P", &*lxc_path, "--fancy", "--fancy-format", "NAME,STATE,PID,IPV4"];
        let output = command::check("lxc-ls", args, DEFAULT_TIMEOUT)?;
        Ok(parse_ls(&output))
    }

    fn info(&self, vmid: Vmid) -> BackendResult<ContainerInfo> {
        let output = self.tool("lxc-info", vmid, &[])?;
        Ok(parse_info(vmid, &output))
    }

    fn exec(&self, vmid: Vmid, cmd: &[String], timeout: Duration) -> BackendResult<ExecResult> {
        if cmd.is_empty() {
            return Err(BackendError::InvalidInput("empty command".into()));
        }
        let mut args = self.args(vmid, &["--"]);
        args.extend(cmd.iter().cloned());

        let output = command::run("lxc-attach", &args, timeout)?;
        Ok(ExecResult {
            exit_code: output.status.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn update_resources(&self, vmid: Vmid, update: &ResourceUpdate) -> BackendResult<()> {
        let path = self.config_path(vmid);
        let current = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let limits = cgroup_limits(update);
        let rewritten = rewrite_keys(&current, &limits);
        crate::identity::store::write_atomic(&path, rewritten.as_bytes())
            .map_err(|e| BackendError::runtime(format!("{}: {}", path.display(), e)))?;

        if self.info(vmid)?.state == BackendState::Running {
            for (key, value) in &limits {
                let cgroup_key = key.trim_start_matches("lxc.cgroup2.");
                self.set_cgroup(vmid, cgroup_key, value)?;
            }
        }
        tracing::debug!(vmid, keys = limits.len(), "Updated LXC resource limits");
        Ok(())
    }

    fn pause(&self, vmid: Vmid) -> BackendResult<()> {
        self.tool("lxc-freeze", vmid, &[])?;
        Ok(())
    }

    fn resume(&self, vmid: Vmid) -> BackendResult<()> {
        self.tool("lxc-unfreeze", vmid, &[])?;
        Ok(())
    }
}

fn io_error(path: &std::path::Path, e: std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BackendError::NotFound(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied(path.display().to_string()),
        _ => BackendError::runtime(format!("{}: {}", path.display(), e)),
    }
}

/// Where a container's root filesystem comes from
#[derive(Debug, PartialEq, Eq)]
enum ImageSource<'a> {
    /// `dist:release:arch` fetched by the download template
    Download {
        dist: &'a str,
        release: &'a str,
        arch: &'a str,
    },
    /// Pre-populated rootfs directory
    Directory(&'a str),
    /// Named lxc template
    Template(&'a str),
}

impl<'a> ImageSource<'a> {
    fn parse(image: &'a str, fallback: &'a str) -> BackendResult<Self> {
        if image.starts_with('/') {
            return Ok(ImageSource::Directory(image));
        }
        let parts: Vec<&str> = image.split(':').collect();
        match parts.as_slice() {
            [dist, release, arch] if parts.iter().all(|p| !p.is_empty()) => Ok(ImageSource::Download {
                dist: *dist,
                release: *release,
                arch: *arch,
            }),
            [name] if !name.is_empty() => Ok(ImageSource::Template(*name)),
            [""] if fallback != "download" => Ok(ImageSource::Template(fallback)),
            _ => Err(BackendError::InvalidInput(format!(
                "image '{}' is neither dist:release:arch, a template name nor an absolute rootfs path",
                image
            ))),
        }
    }
}

/// cgroup v1 shares to cgroup v2 weight
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

fn cgroup_limits(update: &ResourceUpdate) -> Vec<(&'static str, String)> {
    let mut limits = Vec::new();
    if let Some(mb) = update.memory_mb {
        limits.push((MEMORY_KEY, format!("{}M", mb)));
    }
    if let Some(shares) = update.cpu_shares {
        limits.push((WEIGHT_KEY, shares_to_weight(shares).to_string()));
    }
    if let Some(quota) = update.cpu_quota {
        let period = update.cpu_period.unwrap_or(100_000);
        let value = if quota > 0 {
            format!("{} {}", quota, period)
        } else {
            format!("max {}", period)
        };
        limits.push((CPU_MAX_KEY, value));
    }
    limits
}

/// Config lines appended after lxc-create
pub fn render_config(config: &BackendConfig) -> String {
    let mut out = String::from("\n# pve-cri\n");
    let _ = writeln!(out, "lxc.uts.name = {}", config.hostname);

    if config.rootfs.starts_with('/') {
        let _ = writeln!(out, "lxc.rootfs.path = dir:{}", config.rootfs);
    }

    let limits = cgroup_limits(&ResourceUpdate {
        memory_mb: Some(config.memory_mb),
        cpu_shares: Some(config.cpu_shares),
        cpu_quota: config.cpu_quota,
        cpu_period: config.cpu_period,
        cores: None,
    });
    for (key, value) in limits {
        let _ = writeln!(out, "{} = {}", key, value);
    }

    if let Some(ref net) = config.network {
        let _ = writeln!(out, "lxc.net.0.type = veth");
        let _ = writeln!(out, "lxc.net.0.link = {}", net.bridge);
        let _ = writeln!(out, "lxc.net.0.flags = up");
        if let Some(ref ip) = net.ip {
            if ip != "dhcp" {
                let _ = writeln!(out, "lxc.net.0.ipv4.address = {}", ip);
            }
        }
        if let Some(ref gw) = net.gateway {
            let _ = writeln!(out, "lxc.net.0.ipv4.gateway = {}", gw);
        }
    }

    for mount in &config.mounts {
        let target = mount.container_path.trim_start_matches('/');
        let options = if mount.read_only { "bind,create=dir,ro" } else { "bind,create=dir" };
        let _ = writeln!(out, "lxc.mount.entry = {} {} none {} 0 0", mount.host_path, target, options);
    }

    for (key, value) in &config.env {
        let _ = writeln!(out, "lxc.environment = {}={}", key, value);
    }

    if !config.command.is_empty() {
        let _ = writeln!(out, "lxc.init.cmd = {}", config.command.join(" "));
    }
    if let Some(ref cwd) = config.working_dir {
        let _ = writeln!(out, "lxc.init.cwd = {}", cwd);
    }
    out
}

/// Replace the value of each key in an LXC config, appending missing keys
fn rewrite_keys(content: &str, values: &[(&str, String)]) -> String {
    let mut pending: Vec<&(&str, String)> = values.iter().collect();
    let mut out = String::with_capacity(content.len());

    for line in content.lines() {
        let key = line.split('=').next().map(str::trim).unwrap_or_default();
        if let Some(pos) = pending.iter().position(|(k, _)| *k == key) {
            let (k, v) = pending.remove(pos);
            let _ = writeln!(out, "{} = {}", k, v);
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    for (k, v) in pending {
        let _ = writeln!(out, "{} = {}", k, v);
    }
    out
}

fn parse_state(state: &str) -> BackendState {
    match state.trim().to_ascii_uppercase().as_str() {
        "RUNNING" => BackendState::Running,
        "STOPPED" => BackendState::Stopped,
        "FROZEN" => BackendState::Paused,
        _ => BackendState::Unknown,
    }
}

/// Parse `lxc-ls --fancy --fancy-format NAME,STATE,PID,IPV4`.
///
/// Containers whose name is not a VMID are not ours and are skipped.
fn parse_ls(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let vmid: Vmid = cols.next()?.parse().ok()?;
            let mut info = ContainerInfo::new(vmid, parse_state(cols.next()?));
            info.name = Some(vmid.to_string());
            info.pid = cols.next().and_then(|p| p.parse().ok());
            info.ip_address = cols
                .next()
                .map(|ip| ip.trim_end_matches(',').to_string())
                .filter(|ip| ip != "-");
            Some(info)
        })
        .collect()
}

/// Parse `lxc-info` key/value output
fn parse_info(vmid: Vmid, output: &str) -> ContainerInfo {
    let mut info = ContainerInfo::new(vmid, BackendState::Unknown);
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => info.name = Some(value.to_string()),
            "State" => info.state = parse_state(value),
            "PID" => info.pid = value.parse().ok(),
            "IP" if info.ip_address.is_none() => info.ip_address = Some(value.to_string()),
            "Memory use" => info.memory_used_mb = parse_size_mb(value),
            _ => {}
        }
    }
    info
}

/// `12.34 MiB` style sizes to whole MiB
fn parse_size_mb(value: &str) -> Option<u64> {
    let (number, unit) = value.split_once(' ')?;
    let number: f64 = number.parse().ok()?;
    let mb = match unit.trim() {
        "bytes" | "B" => number / (1024.0 * 1024.0),
        "KiB" => number / 1024.0,
        "MiB" => number,
        "GiB" => number * 1024.0,
        _ => return None,
    };
    Some(mb.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Mount, NetworkConfig};

    fn config() -> BackendConfig {
        BackendConfig {
            vmid: 4242,
            hostname: "web".into(),
            memory_mb: 512,
            cpu_shares: 1024,
            cores: None,
            cpu_quota: Some(50_000),
            cpu_period: Some(100_000),
            rootfs: "debian:bookworm:amd64".into(),
            network: Some(NetworkConfig {
                bridge: "lxcbr0".into(),
                ip: Some("10.0.3.10/24".into()),
                gateway: Some("10.0.3.1".into()),
            }),
            mounts: vec![Mount::new("/srv/data", "/data").read_only()],
            env: [("FOO".to_string(), "bar".to_string())].into(),
            command: vec!["/sbin/init".into()],
            working_dir: None,
            labels: Default::default(),
        }
    }

    #[test]
    fn test_failed_rollback_is_logged() {
        #[derive(Clone, Default)]
        struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

        impl std::io::Write for LogBuffer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
            type Writer = LogBuffer;

            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        // Nothing exists under an empty lxc path, so the destroy always fails
        let dir = tempfile::TempDir::new().unwrap();
        let driver = LxcDriver::new(LxcSettings {
            lxc_path: dir.path().to_path_buf(),
            ..Default::default()
        });

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || driver.roll_back(4242));

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Failed to roll back LXC container"));
        assert!(output.contains("4242"));
    }

    #[test]
    fn test_image_source() {
        assert_eq!(
            ImageSource::parse("debian:bookworm:amd64", "download").unwrap(),
            ImageSource::Download {
                dist: "debian",
                release: "bookworm",
                arch: "amd64"
            }
        );
        assert_eq!(
            ImageSource::parse("/var/lib/rootfs/web", "download").unwrap(),
            ImageSource::Directory("/var/lib/rootfs/web")
        );
        assert_eq!(ImageSource::parse("busybox", "download").unwrap(), ImageSource::Template("busybox"));
        assert_eq!(ImageSource::parse("", "busybox").unwrap(), ImageSource::Template("busybox"));
        assert!(ImageSource::parse("", "download").is_err());
        assert!(ImageSource::parse("debian::amd64", "download").is_err());
    }

    #[test]
    fn test_create_args() {
        let driver = LxcDriver::new(LxcSettings::default());
        let args = driver.create_args(&config()).unwrap();
        assert_eq!(
            args,
            vec![
                "-n", "4242", "-P", "/var/lib/lxc", "-t", "download", "--", "-d", "debian", "-r", "bookworm",
                "-a", "amd64"
            ]
        );
    }

    #[test]
    fn test_render_config() {
        let rendered = render_config(&config());
        assert!(rendered.contains("lxc.uts.name = web\n"));
        assert!(rendered.contains("lxc.cgroup2.memory.max = 512M\n"));
        assert!(rendered.contains("lxc.cgroup2.cpu.weight = 39\n"));
        assert!(rendered.contains("lxc.cgroup2.cpu.max = 50000 100000\n"));
        assert!(rendered.contains("lxc.net.0.link = lxcbr0\n"));
        assert!(rendered.contains("lxc.net.0.ipv4.address = 10.0.3.10/24\n"));
        assert!(rendered.contains("lxc.mount.entry = /srv/data data none bind,create=dir,ro 0 0\n"));
        assert!(rendered.contains("lxc.environment = FOO=bar\n"));
        assert!(rendered.contains("lxc.init.cmd = /sbin/init\n"));
        assert!(!rendered.contains("lxc.rootfs.path"));
    }

    #[test]
    fn test_shares_to_weight() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(0), 1);
    }

    #[test]
    fn test_rewrite_keys() {
        let content = "lxc.uts.name = web\nlxc.cgroup2.memory.max = 512M\n";
        let rewritten = rewrite_keys(
            content,
            &[(MEMORY_KEY, "1024M".to_string()), (WEIGHT_KEY, "100".to_string())],
        );
        assert_eq!(
            rewritten,
            "lxc.uts.name = web\nlxc.cgroup2.memory.max = 1024M\nlxc.cgroup2.cpu.weight = 100\n"
        );
    }

    #[test]
    fn test_parse_ls() {
        let output = "\
NAME      STATE   PID  IPV4
4242      RUNNING 1234 10.0.3.10, 10.0.3.11
777       STOPPED -    -
legacy    RUNNING 99   10.0.3.2
";
        let infos = parse_ls(output);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].vmid, 4242);
        assert_eq!(infos[0].state, BackendState::Running);
        assert_eq!(infos[0].pid, Some(1234));
        assert_eq!(infos[0].ip_address.as_deref(), Some("10.0.3.10"));
        assert_eq!(infos[1].state, BackendState::Stopped);
        assert_eq!(infos[1].pid, None);
        assert_eq!(infos[1].ip_address, None);
    }

    #[test]
    fn test_parse_info() {
        let output = "\
Name:           4242
State:          FROZEN
PID:            1234
IP:             10.0.3.10
Memory use:     12.60 MiB
";
        let info = parse_info(4242, output);
        assert_eq!(info.state, BackendState::Paused);
        assert_eq!(info.pid, Some(1234));
        assert_eq!(info.ip_address.as_deref(), Some("10.0.3.10"));
        assert_eq!(info.memory_used_mb, Some(13));
    }

    #[test]
    fn test_exec_rejects_empty_command() {
        let driver = LxcDriver::new(LxcSettings::default());
        let err = driver.exec(4242, &[], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }
}
