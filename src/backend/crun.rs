//! OCI containers executed by crun
//!
//! Each container gets a bundle directory `<bundle_root>/<vmid>` holding a
//! generated `config.json` whose root points at an unpacked image root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::command::{self, DEFAULT_TIMEOUT};
use super::{BackendConfig, BackendDriver, BackendKind, BackendState, ContainerInfo, ExecResult, ResourceUpdate, Vmid};
use crate::config::CrunSettings;
use crate::convert::{mb_to_bytes, oci_spec};
use crate::error::{BackendError, BackendResult};
use crate::retry::RetryPolicy;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct CrunDriver {
    settings: CrunSettings,
    bundle_root: PathBuf,
}

/// One entry of `crun list --format json` or the output of `crun state`
#[derive(Debug, Deserialize)]
struct CrunState {
    id: String,
    #[serde(default)]
    pid: Option<u32>,
    status: String,
}

impl CrunDriver {
    pub fn new(settings: CrunSettings, bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            bundle_root: bundle_root.into(),
        }
    }

    pub fn bundle_dir(&self, vmid: Vmid) -> PathBuf {
        self.bundle_root.join(vmid.to_string())
    }

    /// Global flags followed by `args`
    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::new();
        if let Some(ref root) = self.settings.root {
            full.push("--root".to_string());
            full.push(root.to_string_lossy().into_owned());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    fn crun(&self, args: &[&str]) -> BackendResult<String> {
        command::check(&self.settings.binary, self.args(args), DEFAULT_TIMEOUT)
    }

    fn write_bundle(&self, config: &BackendConfig) -> BackendResult<PathBuf> {
        if config.rootfs.is_empty() {
            return Err(BackendError::InvalidInput("crun needs a rootfs path".into()));
        }
        let rootfs = Path::new(&config.rootfs);
        if !rootfs.is_absolute() {
            return Err(BackendError::InvalidInput(format!(
                "rootfs must be an absolute path: {}",
                config.rootfs
            )));
        }
        if !rootfs.is_dir() {
            return Err(BackendError::NotFound(format!("rootfs {}", config.rootfs)));
        }

        let dir = self.bundle_dir(config.vmid);
        fs::create_dir_all(&dir).map_err(|e| bundle_error(&dir, e))?;

        let spec = oci_spec(config, &config.rootfs);
        let bytes = serde_json::to_vec_pretty(&spec)
            .map_err(|e| BackendError::runtime(format!("cannot encode config.json: {}", e)))?;
        let path = dir.join("config.json");
        crate::identity::store::write_atomic(&path, &bytes)
            .map_err(|e| BackendError::runtime(format!("{}: {}", path.display(), e)))?;
        Ok(dir)
    }

    fn remove_bundle(&self, vmid: Vmid) {
        let dir = self.bundle_dir(vmid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(vmid, bundle = %dir.display(), error = %e, "Failed to remove crun bundle"),
        }
    }

    fn kill(&self, id: &str, signal: &str) -> BackendResult<()> {
        self.crun(&["kill", id, signal]).map(|_| ())
    }

    fn wait_stopped(&self, vmid: Vmid, within: Duration) -> BackendResult<bool> {
        let attempts = (within.as_millis() / STATE_POLL_INTERVAL.as_millis()).max(1) as u32 + 1;
        let stopped = RetryPolicy::new(STATE_POLL_INTERVAL, attempts).run(|_| {
            let state = self.info(vmid)?.state;
            Ok::<_, BackendError>((state == BackendState::Stopped).then_some(()))
        })?;
        Ok(stopped.is_some())
    }
}

impl BackendDriver for CrunDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Crun
    }

    fn create(&self, config: &BackendConfig) -> BackendResult<()> {
        let dir = self.write_bundle(config)?;
        let id = config.vmid.to_string();
        let log = dir.join("crun.log");
        let dir_arg = dir.to_string_lossy();
        let log_arg = log.to_string_lossy();
        let args = self.args(&["--log", &*log_arg, "create", "--bundle", &*dir_arg, id.as_str()]);

        tracing::info!(vmid = config.vmid, bundle = %dir.display(), "Creating crun container");
        let output = command::run_detached(&self.settings.binary, &args, DEFAULT_TIMEOUT)?;
        if !output.success() {
            let failed = command::CommandOutput {
                stderr: log_tail(&log),
                ..output
            };
            self.remove_bundle(config.vmid);
            return Err(command::classify("crun create", &failed));
        }
        Ok(())
    }

    fn start(&self, vmid: Vmid) -> BackendResult<()> {
        self.crun(&["start", &vmid.to_string()]).map(|_| ())
    }

    fn stop(&self, vmid: Vmid, timeout: Option<Duration>) -> BackendResult<()> {
        let id = vmid.to_string();
        if self.info(vmid)?.state == BackendState::Stopped {
            return Ok(());
        }
        let grace = timeout.unwrap_or(DEFAULT_STOP_GRACE);

        self.kill(&id, "TERM")?;
        if self.wait_stopped(vmid, grace)? {
            return Ok(());
        }

        tracing::warn!(vmid, grace_secs = grace.as_secs(), "crun container ignored SIGTERM, sending SIGKILL");
        self.kill(&id, "KILL")?;
        if self.wait_stopped(vmid, Duration::from_secs(5))? {
            Ok(())
        } else {
            Err(BackendError::Timeout(grace))
        }
    }

    fn delete(&self, vmid: Vmid) -> BackendResult<()> {
        let result = self.crun(&["delete", "--force", &vmid.to_string()]).map(|_| ());
        self.remove_bundle(vmid);
        result
    }

    fn list(&self) -> BackendResult<Vec<ContainerInfo>> {
        let output = self.crun(&["list", "--format", "json"])?;
        parse_list(&output)
    }

    fn info(&self, vmid: Vmid) -> BackendResult<ContainerInfo> {
        let output = self.crun(&["state", &vmid.to_string()])?;
        let state: CrunState = serde_json::from_str(&output)
            .map_err(|e| BackendError::runtime(format!("malformed crun state: {}", e)))?;
        Ok(to_info(vmid, &state))
    }

    fn exec(&self, vmid: Vmid, cmd: &[String], timeout: Duration) -> BackendResult<ExecResult> {
        if cmd.is_empty() {
            return Err(BackendError::InvalidInput("empty command".into()));
        }
        let id = vmid.to_string();
        let mut args = self.args(&["exec", &id]);
        args.extend(cmd.iter().cloned());

        let output = command::run(&self.settings.binary, &args, timeout)?;
        Ok(ExecResult {
            exit_code: output.status.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn update_resources(&self, vmid: Vmid, update: &ResourceUpdate) -> BackendResult<()> {
        let flags = update_flags(update);
        if flags.is_empty() {
            return Ok(());
        }
        let id = vmid.to_string();
        let mut args: Vec<&str> = vec!["update"];
        args.extend(flags.iter().map(String::as_str));
        args.push(&id);
        self.crun(&args).map(|_| ())
    }

    fn pause(&self, vmid: Vmid) -> BackendResult<()> {
        self.crun(&["pause", &vmid.to_string()]).map(|_| ())
    }

    fn resume(&self, vmid: Vmid) -> BackendResult<()> {
        self.crun(&["resume", &vmid.to_string()]).map(|_| ())
    }
}

fn bundle_error(path: &Path, e: std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied(path.display().to_string()),
        _ => BackendError::runtime(format!("{}: {}", path.display(), e)),
    }
}

/// Last non-empty line of crun's log, which holds the failure reason
fn log_tail(log: &Path) -> String {
    fs::read_to_string(log)
        .ok()
        .and_then(|content| content.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string))
        .unwrap_or_default()
}

fn parse_state(status: &str) -> BackendState {
    match status {
        "created" | "creating" => BackendState::Created,
        "running" => BackendState::Running,
        "stopped" => BackendState::Stopped,
        "paused" => BackendState::Paused,
        _ => BackendState::Unknown,
    }
}

fn to_info(vmid: Vmid, state: &CrunState) -> ContainerInfo {
    let mut info = ContainerInfo::new(vmid, parse_state(&state.status));
    info.name = Some(state.id.clone());
    info.pid = state.pid.filter(|p| *p > 0);
    info
}

/// Only containers named by a VMID are ours
fn parse_list(output: &str) -> BackendResult<Vec<ContainerInfo>> {
    if output.trim().is_empty() || output.trim() == "null" {
        return Ok(Vec::new());
    }
    let states: Vec<CrunState> = serde_json::from_str(output)
        .map_err(|e| BackendError::runtime(format!("malformed crun list: {}", e)))?;
    Ok(states
        .iter()
        .filter_map(|s| s.id.parse::<Vmid>().ok().map(|vmid| to_info(vmid, s)))
        .collect())
}

fn update_flags(update: &ResourceUpdate) -> Vec<String> {
    let mut flags = Vec::new();
    if let Some(mb) = update.memory_mb {
        flags.push(format!("--memory={}", mb_to_bytes(mb)));
    }
    if let Some(shares) = update.cpu_shares {
        flags.push(format!("--cpu-share={}", shares));
    }
    if let Some(quota) = update.cpu_quota {
        flags.push(format!("--cpu-quota={}", quota));
    }
    if let Some(period) = update.cpu_period {
        flags.push(format!("--cpu-period={}", period));
    }
    flags
}
