//! Proxmox VE driver
//!
//! One HTTP client per node, shared by two drivers: Proxmox-managed LXC
//! containers (`/lxc`) and QEMU virtual machines (`/qemu`). Long-running
//! API calls return a task id (UPID) which is polled until the task ends.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;

use super::command;
use super::lxc::shares_to_weight;
use super::{BackendConfig, BackendDriver, BackendKind, BackendState, ContainerInfo, ExecResult, ResourceUpdate, Vmid};
use crate::config::ProxmoxSettings;
use crate::convert::MAX_MOUNT_POINTS;
use crate::error::{BackendError, BackendResult};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

type Params = Vec<(String, String)>;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Slack added on top of a guest shutdown timeout when waiting for its task
const TASK_SLACK: Duration = Duration::from_secs(30);

/// Blocking Proxmox API client authenticated with an API token
pub struct ProxmoxClient {
    http: Client,
    api_root: String,
    settings: ProxmoxSettings,
}

impl ProxmoxClient {
    pub fn new(settings: ProxmoxSettings) -> Result<Self> {
        let token = format!("PVEAPIToken={}={}", settings.token_id, settings.token_secret);
        let mut auth = HeaderValue::from_str(&token)
            .map_err(|_| Error::Config("proxmox token contains invalid characters".into()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        if !settings.verify_tls {
            tracing::warn!(api_url = %settings.api_url, "TLS certificate verification disabled for Proxmox API");
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| Error::Config(format!("cannot build Proxmox HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_root: format!("{}/api2/json", settings.api_url.trim_end_matches('/')),
            settings,
        })
    }

    pub fn node(&self) -> &str {
        &self.settings.node
    }

    pub fn settings(&self) -> &ProxmoxSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    pub fn get(&self, path: &str) -> BackendResult<Value> {
        self.send(self.http.get(self.url(path)), path)
    }

    pub fn get_with(&self, path: &str, query: &[(&str, String)]) -> BackendResult<Value> {
        self.send(self.http.get(self.url(path)).query(query), path)
    }

    pub fn post(&self, path: &str, params: &Params) -> BackendResult<Value> {
        self.send(self.http.post(self.url(path)).form(params), path)
    }

    pub fn put(&self, path: &str, params: &Params) -> BackendResult<Value> {
        self.send(self.http.put(self.url(path)).form(params), path)
    }

    pub fn delete(&self, path: &str, query: &[(&str, String)]) -> BackendResult<Value> {
        self.send(self.http.delete(self.url(path)).query(query), path)
    }

    fn send(&self, request: RequestBuilder, path: &str) -> BackendResult<Value> {
        let response = request.send().map_err(|e| self.transport_error(path, e))?;
        let status = response.status();
        let body = response.text().map_err(|e| self.transport_error(path, e))?;

        if !status.is_success() {
            return Err(classify_status(status, path, &body));
        }
        unwrap_data(path, &body)
    }

    fn transport_error(&self, path: &str, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(Duration::from_secs(self.settings.timeout_secs))
        } else {
            BackendError::runtime(format!("{}: {}", path, e))
        }
    }

    /// Block until a task finishes, failing if it ends unsuccessfully
    pub fn wait_task(&self, upid: &str, budget: Duration) -> BackendResult<()> {
        let attempts = (budget.as_secs() / TASK_POLL_INTERVAL.as_secs()).max(1) as u32 + 1;
        let policy = RetryPolicy::new(TASK_POLL_INTERVAL, attempts);
        let path = format!("/nodes/{}/tasks/{}/status", self.settings.node, upid);

        let outcome = policy.run(|_| {
            let status = self.get(&path)?;
            task_outcome(&status)
        })?;

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(exit)) => Err(BackendError::runtime(format!("task {} failed: {}", upid, exit))),
            None => Err(BackendError::Timeout(budget)),
        }
    }

    /// Wait for the task a call returned, if it returned one
    fn finish(&self, data: &Value, budget: Duration) -> BackendResult<()> {
        match data.as_str() {
            Some(upid) if upid.starts_with("UPID:") => self.wait_task(upid, budget),
            _ => Ok(()),
        }
    }
}

/// Extract the `data` member of a Proxmox response envelope
fn unwrap_data(path: &str, body: &str) -> BackendResult<Value> {
    let mut envelope: Value = serde_json::from_str(body)
        .map_err(|e| BackendError::runtime(format!("{}: malformed response: {}", path, e)))?;
    envelope
        .get_mut("data")
        .map(Value::take)
        .ok_or_else(|| BackendError::runtime(format!("{}: response has no data member", path)))
}

fn classify_status(status: StatusCode, path: &str, body: &str) -> BackendError {
    let detail = error_detail(body).unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    let message = format!("{} ({}): {}", path, status.as_u16(), detail);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::PermissionDenied(message),
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::BAD_REQUEST => BackendError::InvalidInput(message),
        _ if detail.contains("does not exist") => BackendError::NotFound(message),
        _ => BackendError::RuntimeError {
            message,
            exit_code: None,
        },
    }
}

/// Proxmox puts parameter errors in `errors` and other failures in `message`
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if let Some(errors) = value.get("errors").and_then(Value::as_object) {
        let joined: Vec<String> = errors
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default().trim()))
            .collect();
        return Some(joined.join("; "));
    }
    value.get("message").and_then(Value::as_str).map(|m| m.trim().to_string())
}

/// `Ok(None)` while running; `Some(Err(exitstatus))` when the task failed
fn task_outcome(status: &Value) -> BackendResult<Option<std::result::Result<(), String>>> {
    match status.get("status").and_then(Value::as_str) {
        Some("running") => Ok(None),
        Some("stopped") => {
            let exit = status.get("exitstatus").and_then(Value::as_str).unwrap_or("unknown");
            if exit == "OK" || exit.starts_with("WARNINGS") {
                Ok(Some(Ok(())))
            } else {
                Ok(Some(Err(exit.to_string())))
            }
        }
        other => Err(BackendError::runtime(format!("unexpected task status {:?}", other))),
    }
}

/// Guest flavour managed through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestType {
    Lxc,
    Qemu,
}

impl GuestType {
    pub fn path(&self) -> &'static str {
        match self {
            GuestType::Lxc => "lxc",
            GuestType::Qemu => "qemu",
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            GuestType::Lxc => BackendKind::ProxmoxLxc,
            GuestType::Qemu => BackendKind::ProxmoxVm,
        }
    }
}

pub struct ProxmoxDriver {
    client: Arc<ProxmoxClient>,
    guest: GuestType,
}

impl ProxmoxDriver {
    pub fn new(client: Arc<ProxmoxClient>, guest: GuestType) -> Self {
        Self { client, guest }
    }

    fn collection(&self) -> String {
        format!("/nodes/{}/{}", self.client.node(), self.guest.path())
    }

    fn guest_path(&self, vmid: Vmid) -> String {
        format!("{}/{}", self.collection(), vmid)
    }

    fn task_budget(&self) -> Duration {
        Duration::from_secs(self.client.settings().timeout_secs) + TASK_SLACK
    }

    fn status_call(&self, vmid: Vmid, action: &str, params: Params, budget: Duration) -> BackendResult<()> {
        let path = format!("{}/status/{}", self.guest_path(vmid), action);
        let upid = self.client.post(&path, &params)?;
        self.client.finish(&upid, budget)
    }

    fn create_qemu(&self, config: &BackendConfig) -> BackendResult<()> {
        if !config.mounts.is_empty() {
            tracing::warn!(
                vmid = config.vmid,
                mounts = config.mounts.len(),
                "Bind mounts are not supported for virtual machines, ignoring"
            );
        }

        match config.rootfs.parse::<Vmid>() {
            Ok(source) => {
                tracing::info!(vmid = config.vmid, source, "Cloning Proxmox VM");
                let params = vec![
                    ("newid".to_string(), config.vmid.to_string()),
                    ("name".to_string(), config.hostname.clone()),
                    ("full".to_string(), "1".to_string()),
                ];
                let upid = self.client.post(&format!("{}/{}/clone", self.collection(), source), &params)?;
                self.client.finish(&upid, self.task_budget())?;

                let upid = self.client.put(
                    &format!("{}/config", self.guest_path(config.vmid)),
                    &qemu_limit_params(config),
                )?;
                self.client.finish(&upid, self.task_budget())
            }
            Err(_) => {
                tracing::info!(vmid = config.vmid, disk = %config.rootfs, "Creating Proxmox VM");
                let upid = self.client.post(&self.collection(), &qemu_create_params(config))?;
                self.client.finish(&upid, self.task_budget())
            }
        }
    }

    fn exec_lxc(&self, vmid: Vmid, cmd: &[String], timeout: Duration) -> BackendResult<ExecResult> {
        let mut args = vec!["exec".to_string(), vmid.to_string(), "--".to_string()];
        args.extend(cmd.iter().cloned());

        let output = command::run(&self.client.settings().pct_binary, &args, timeout)?;
        Ok(ExecResult {
            exit_code: output.status.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run through the QEMU guest agent and poll for completion
    fn exec_qemu(&self, vmid: Vmid, cmd: &[String], timeout: Duration) -> BackendResult<ExecResult> {
        let agent = format!("{}/agent", self.guest_path(vmid));
        let params: Params = cmd.iter().map(|arg| ("command".to_string(), arg.clone())).collect();
        let started = self.client.post(&format!("{}/exec", agent), &params)?;
        let pid = started
            .get("pid")
            .and_then(value_u64)
            .ok_or_else(|| BackendError::runtime("guest agent returned no pid"))?;

        let attempts = (timeout.as_millis() / EXEC_POLL_INTERVAL.as_millis()).max(1) as u32 + 1;
        let policy = RetryPolicy::new(EXEC_POLL_INTERVAL, attempts);
        let status_path = format!("{}/exec-status", agent);
        let result = policy.run(|_| {
            let status = self.client.get_with(&status_path, &[("pid", pid.to_string())])?;
            Ok::<_, BackendError>(parse_exec_status(&status))
        })?;

        result.ok_or(BackendError::Timeout(timeout))
    }
}

impl BackendDriver for ProxmoxDriver {
    fn kind(&self) -> BackendKind {
        self.guest.kind()
    }

    fn create(&self, config: &BackendConfig) -> BackendResult<()> {
        match self.guest {
            GuestType::Lxc => {
                tracing::info!(vmid = config.vmid, template = %config.rootfs, "Creating Proxmox container");
                let params = lxc_create_params(config, &self.client.settings().rootfs_storage);
                let upid = self.client.post(&self.collection(), &params)?;
                self.client.finish(&upid, self.task_budget())
            }
            GuestType::Qemu => self.create_qemu(config),
        }
    }

    fn start(&self, vmid: Vmid) -> BackendResult<()> {
        self.status_call(vmid, "start", Vec::new(), self.task_budget())
    }

    fn stop(&self, vmid: Vmid, timeout: Option<Duration>) -> BackendResult<()> {
        let result = match timeout {
            Some(t) => self.status_call(
                vmid,
                "shutdown",
                vec![
                    ("timeout".to_string(), t.as_secs().to_string()),
                    ("forceStop".to_string(), "1".to_string()),
                ],
                t + TASK_SLACK,
            ),
            None => self.status_call(vmid, "stop", Vec::new(), self.task_budget()),
        };
        match result {
            Err(BackendError::RuntimeError { ref message, .. }) if message.contains("not running") => Ok(()),
            other => other,
        }
    }

    fn delete(&self, vmid: Vmid) -> BackendResult<()> {
        let query = [("purge", "1".to_string()), ("destroy-unreferenced-disks", "1".to_string())];
        let upid = self.client.delete(&self.guest_path(vmid), &query)?;
        self.client.finish(&upid, self.task_budget())
    }

    fn list(&self) -> BackendResult<Vec<ContainerInfo>> {
        let data = self.client.get(&self.collection())?;
        let entries = data
            .as_array()
            .ok_or_else(|| BackendError::runtime("guest list is not an array"))?;
        Ok(entries.iter().filter_map(|e| parse_status(None, e)).collect())
    }

    fn info(&self, vmid: Vmid) -> BackendResult<ContainerInfo> {
        let data = self.client.get(&format!("{}/status/current", self.guest_path(vmid)))?;
        parse_status(Some(vmid), &data).ok_or_else(|| BackendError::NotFound(format!("guest {}", vmid)))
    }

    fn exec(&self, vmid: Vmid, cmd: &[String], timeout: Duration) -> BackendResult<ExecResult> {
        if cmd.is_empty() {
            return Err(BackendError::InvalidInput("empty command".into()));
        }
        match self.guest {
            GuestType::Lxc => self.exec_lxc(vmid, cmd, timeout),
            GuestType::Qemu => self.exec_qemu(vmid, cmd, timeout),
        }
    }

    fn update_resources(&self, vmid: Vmid, update: &ResourceUpdate) -> BackendResult<()> {
        let params = update_params(update);
        if params.is_empty() {
            return Ok(());
        }
        let upid = self.client.put(&format!("{}/config", self.guest_path(vmid)), &params)?;
        self.client.finish(&upid, self.task_budget())
    }

    fn pause(&self, vmid: Vmid) -> BackendResult<()> {
        self.status_call(vmid, "suspend", Vec::new(), self.task_budget())
    }

    fn resume(&self, vmid: Vmid) -> BackendResult<()> {
        self.status_call(vmid, "resume", Vec::new(), self.task_budget())
    }
}

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn net0(config: &BackendConfig, model: Option<&str>) -> Option<String> {
    let net = config.network.as_ref()?;
    let mut parts = Vec::new();
    match model {
        Some(model) => parts.push(model.to_string()),
        None => parts.push("name=eth0".to_string()),
    }
    parts.push(format!("bridge={}", net.bridge));
    if model.is_none() {
        parts.push(format!("ip={}", net.ip.as_deref().unwrap_or("dhcp")));
        if let Some(ref gw) = net.gateway {
            parts.push(format!("gw={}", gw));
        }
    }
    Some(parts.join(","))
}

fn cpulimit(quota: Option<i64>, period: Option<u64>) -> Option<String> {
    let quota = quota.filter(|q| *q > 0)?;
    let period = period.filter(|p| *p > 0).unwrap_or(100_000);
    Some(format!("{:.2}", quota as f64 / period as f64))
}

fn lxc_create_params(config: &BackendConfig, storage: &str) -> Params {
    let mut params = vec![
        param("vmid", config.vmid),
        param("hostname", &config.hostname),
        param("ostemplate", &config.rootfs),
        param("rootfs", storage),
        param("memory", config.memory_mb),
        param("cpuunits", shares_to_weight(config.cpu_shares)),
    ];
    if let Some(cores) = config.cores {
        params.push(param("cores", cores));
    }
    if let Some(limit) = cpulimit(config.cpu_quota, config.cpu_period) {
        params.push(param("cpulimit", limit));
    }
    if let Some(net) = net0(config, None) {
        params.push(param("net0", net));
    }
    for (index, mount) in config.mounts.iter().take(MAX_MOUNT_POINTS).enumerate() {
        let mut spec = format!("{},mp={}", mount.host_path, mount.container_path);
        if mount.read_only {
            spec.push_str(",ro=1");
        }
        params.push((format!("mp{}", index), spec));
    }
    params
}

fn qemu_limit_params(config: &BackendConfig) -> Params {
    let mut params = vec![
        param("memory", config.memory_mb),
        param("cpuunits", shares_to_weight(config.cpu_shares)),
    ];
    if let Some(cores) = config.cores {
        params.push(param("cores", cores));
    }
    if let Some(limit) = cpulimit(config.cpu_quota, config.cpu_period) {
        params.push(param("cpulimit", limit));
    }
    if let Some(net) = net0(config, Some("virtio")) {
        params.push(param("net0", net));
    }
    params
}

fn qemu_create_params(config: &BackendConfig) -> Params {
    let mut params = vec![
        param("vmid", config.vmid),
        param("name", &config.hostname),
        param("scsi0", &config.rootfs),
        param("scsihw", "virtio-scsi-pci"),
        param("ostype", "l26"),
        param("agent", "1"),
    ];
    params.extend(qemu_limit_params(config));
    params
}

fn update_params(update: &ResourceUpdate) -> Params {
    let mut params = Vec::new();
    if let Some(mb) = update.memory_mb {
        params.push(param("memory", mb));
    }
    if let Some(shares) = update.cpu_shares {
        params.push(param("cpuunits", shares_to_weight(shares)));
    }
    if let Some(cores) = update.cores {
        params.push(param("cores", cores));
    }
    if let Some(quota) = update.cpu_quota {
        match cpulimit(Some(quota), update.cpu_period) {
            Some(limit) => params.push(param("cpulimit", limit)),
            None => params.push(param("cpulimit", 0)),
        }
    }
    params
}

/// Proxmox returns numbers as either JSON numbers or strings
fn value_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str()?.parse().ok())
}

fn parse_status(vmid: Option<Vmid>, value: &Value) -> Option<ContainerInfo> {
    let vmid = match vmid {
        Some(v) => v,
        None => value.get("vmid").and_then(value_u64)? as Vmid,
    };

    let status = value.get("status").and_then(Value::as_str).unwrap_or("unknown");
    let qmp = value.get("qmpstatus").and_then(Value::as_str);
    let state = match (status, qmp) {
        (_, Some("paused")) | (_, Some("suspended")) => BackendState::Paused,
        ("running", _) => BackendState::Running,
        ("stopped", _) => BackendState::Stopped,
        _ => BackendState::Unknown,
    };

    let mut info = ContainerInfo::new(vmid, state);
    info.name = value.get("name").and_then(Value::as_str).map(String::from);
    info.pid = value.get("pid").and_then(value_u64).map(|p| p as u32);
    info.memory_used_mb = value.get("mem").and_then(value_u64).map(|b| b / (1024 * 1024));
    info.uptime_secs = value.get("uptime").and_then(value_u64);
    Some(info)
}

fn parse_exec_status(value: &Value) -> Option<ExecResult> {
    let exited = value.get("exited").and_then(value_u64).unwrap_or(0) == 1
        || value.get("exited").and_then(Value::as_bool) == Some(true);
    if !exited {
        return None;
    }
    let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    Some(ExecResult {
        exit_code: value.get("exitcode").and_then(Value::as_i64).unwrap_or(-1) as i32,
        stdout: text("out-data"),
        stderr: text("err-data"),
    })
}
