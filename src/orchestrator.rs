//! Lifecycle orchestration across backends
//!
//! Sequences the router, the identity mapper and the backend drivers for
//! each CRI-style call. Redundant transitions (start when running, stop when
//! stopped, pause when paused) succeed without touching the backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::backend::{BackendDriver, BackendKind, BackendState, ContainerInfo, DriverRegistry, ExecResult, Vmid};
use crate::config::RuntimeConfig;
use crate::container::{ContainerConfig, Resources};
use crate::convert::{to_backend_config, to_resource_update};
use crate::error::BackendError;
use crate::identity::{
    ContainerIdentity, FileStore, IdentityMapper, KeyedStore, MappingContext, MappingEntry, MemoryStore, VmidRange,
};
use crate::record::{ContainerFilter, ContainerRecord, ContainerState, ContainerStatus};
use crate::retry::RetryPolicy;
use crate::router::{Router, RoutingRule};
use crate::{Error, Result};

const MAX_ID_LEN: usize = 128;

/// Default grace period for the stop that precedes removal
pub const DEFAULT_REMOVE_GRACE: Duration = Duration::from_secs(30);

/// Id the orchestrator assigns to `name` inside `pod_id`
pub fn container_id(pod_id: &str, name: &str) -> String {
    format!("{}-{}", pod_id, name)
}

/// Ids become backend names and file keys: `[A-Za-z0-9_.-]`, at most 128 chars
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidContainerId("id cannot be empty".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidContainerId(format!(
            "{} is longer than {} characters",
            id, MAX_ID_LEN
        )));
    }
    if let Some(bad) = id.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(Error::InvalidContainerId(format!("{} contains '{}'", id, bad)));
    }
    Ok(())
}

type LockMap = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds one container id's lifecycle mutex.
///
/// The map entry lives only while some caller holds or waits on it, so ids
/// that never resolve to a container leave nothing behind.
struct IdGuard<'a> {
    locks: &'a LockMap,
    id: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<'a> IdGuard<'a> {
    fn acquire(locks: &'a LockMap, id: &str) -> Self {
        // Clone under the map lock, block on the id lock outside it
        let lock = locks.lock().entry(id.to_string()).or_default().clone();
        Self {
            locks,
            id: id.to_string(),
            guard: Some(lock.lock_arc()),
        }
    }
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.guard.take();
        if locks.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.id);
        }
    }
}

pub struct Orchestrator {
    router: Router,
    identity: IdentityMapper,
    drivers: DriverRegistry,
    records: Box<dyn KeyedStore<ContainerRecord>>,
    /// One mutex per container id; lifecycle calls on the same id serialize
    locks: LockMap,
    stop_poll: RetryPolicy,
    remove_grace: Duration,
}

impl Orchestrator {
    /// Build an orchestrator with file-backed state under `config.state_dir`
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir)?;

        let identity = IdentityMapper::with_options(
            Box::new(FileStore::<MappingEntry>::open(config.mapping_path())?),
            VmidRange::default(),
            config.quarantine(),
        )?;
        let records: FileStore<ContainerRecord> = FileStore::open(config.records_path())?;
        let drivers = DriverRegistry::from_config(&config)?;
        let router = Router::new(config.rules.clone(), config.default_runtime);

        tracing::info!(
            state_dir = %config.state_dir.display(),
            backends = ?drivers.kinds(),
            rules = config.rules.len(),
            "Orchestrator ready"
        );

        Ok(Self::from_parts(router, identity, drivers, Box::new(records))
            .with_stop_poll(RetryPolicy::new(config.stop_poll_interval(), config.stop_poll_attempts))
            .with_remove_grace(config.remove_grace()))
    }

    pub fn from_parts(
        router: Router,
        identity: IdentityMapper,
        drivers: DriverRegistry,
        records: Box<dyn KeyedStore<ContainerRecord>>,
    ) -> Self {
        Self {
            router,
            identity,
            drivers,
            records,
            locks: Mutex::new(HashMap::new()),
            stop_poll: RetryPolicy::default(),
            remove_grace: DEFAULT_REMOVE_GRACE,
        }
    }

    /// Volatile orchestrator, for tests and dry runs
    pub fn in_memory(router: Router, drivers: DriverRegistry) -> Self {
        Self::from_parts(router, IdentityMapper::in_memory(), drivers, Box::new(MemoryStore::new()))
    }

    pub fn with_stop_poll(mut self, policy: RetryPolicy) -> Self {
        self.stop_poll = policy;
        self
    }

    pub fn with_remove_grace(mut self, grace: Duration) -> Self {
        self.remove_grace = grace;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn identity(&self) -> &IdentityMapper {
        &self.identity
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    fn lock_id(&self, id: &str) -> IdGuard<'_> {
        IdGuard::acquire(&self.locks, id)
    }

    fn record(&self, id: &str) -> Result<ContainerRecord> {
        self.records
            .get(id)?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    fn driver(&self, kind: BackendKind) -> Result<Arc<dyn BackendDriver>> {
        self.drivers.get(kind)
    }

    fn live_info(&self, driver: &dyn BackendDriver, vmid: Vmid) -> Result<ContainerInfo> {
        driver.info(vmid).map_err(|e| Error::backend(driver.kind(), e))
    }

    /// Provision a container, returning its id
    pub fn create_container(&self, pod_id: &str, config: ContainerConfig) -> Result<String> {
        if pod_id.is_empty() {
            return Err(Error::InvalidContainerId("pod id cannot be empty".into()));
        }
        config.validate()?;
        let id = container_id(pod_id, &config.name);
        validate_id(&id)?;

        let _guard = self.lock_id(&id);

        if self.identity.contains(&id)? || self.records.contains(&id)? {
            return Err(Error::ContainerAlreadyExists(id));
        }

        let backend = self.router.select(&id, &config.namespaces)?;
        let driver = self.driver(backend)?;
        let vmid = self
            .identity
            .allocate(&id, MappingContext::new(backend, Some(pod_id.to_string())))?;
        let native = to_backend_config(&id, vmid, &config);

        if let Err(e) = driver.create(&native) {
            self.release_mapping(&id);
            return Err(Error::backend(backend, e));
        }

        let record = ContainerRecord {
            id: id.clone(),
            pod_id: Some(pod_id.to_string()),
            name: config.name.clone(),
            vmid,
            state: ContainerState::Created,
            backend,
            config,
            native,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pending_resources: None,
        };
        if let Err(e) = self.records.put(&id, record) {
            if let Err(cleanup) = driver.delete(vmid) {
                tracing::warn!(container = %id, vmid, error = %cleanup, "Failed to roll back backend resource");
            }
            self.release_mapping(&id);
            return Err(e);
        }

        tracing::info!(container = %id, vmid, backend = %backend, "Container created");
        Ok(id)
    }

    fn release_mapping(&self, id: &str) {
        if let Err(e) = self.identity.remove_mapping(id) {
            tracing::warn!(container = %id, error = %e, "Failed to release VMID mapping");
        }
    }

    pub fn start_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id);

        let mut record = self.record(id)?;
        let driver = self.driver(record.backend)?;
        let backend = record.backend;

        match self.live_info(driver.as_ref(), record.vmid)?.state {
            BackendState::Running => {
                tracing::warn!(container = %id, vmid = record.vmid, "Container already running");
                if record.state != ContainerState::Running {
                    record.state = ContainerState::Running;
                    self.records.put(id, record)?;
                }
                return Ok(());
            }
            BackendState::Paused => {
                return Err(Error::invalid_state(id, ContainerState::Paused, "created or stopped"));
            }
            _ => {}
        }

        if let Some(pending) = record.pending_resources.take() {
            driver
                .update_resources(record.vmid, &pending)
                .map_err(|e| Error::backend(backend, e))?;
            tracing::info!(container = %id, vmid = record.vmid, "Applied deferred resource update");
            record.native.apply(&pending);
        }

        driver.start(record.vmid).map_err(|e| Error::backend(backend, e))?;

        record.state = ContainerState::Running;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        record.exit_code = None;
        let vmid = record.vmid;
        self.records.put(id, record)?;

        tracing::info!(container = %id, vmid, backend = %backend, "Container started");
        Ok(())
    }

    /// Stop a container, waiting for the backend to report it stopped.
    ///
    /// `timeout` is the clean-shutdown grace handed to the backend; `None`
    /// uses the backend's default. Fails with `StopTimedOut` when the stop
    /// poll budget runs out, leaving the record untouched.
    pub fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.lock_id(id);

        let mut record = self.record(id)?;
        let driver = self.driver(record.backend)?;
        let backend = record.backend;
        let vmid = record.vmid;

        let current = self.live_info(driver.as_ref(), vmid)?.state;
        if matches!(current, BackendState::Stopped | BackendState::Created) {
            tracing::warn!(container = %id, vmid, state = %record.state, "Container not running, nothing to stop");
            if matches!(record.state, ContainerState::Running | ContainerState::Paused) {
                record.state = ContainerState::Stopped;
                record.finished_at = Some(Utc::now());
                self.records.put(id, record)?;
            }
            return Ok(());
        }

        driver.stop(vmid, timeout).map_err(|e| Error::backend(backend, e))?;

        let stopped = self.stop_poll.run(|attempt| {
            let info = self.live_info(driver.as_ref(), vmid)?;
            tracing::debug!(container = %id, vmid, attempt, state = %info.state, "Waiting for stop");
            Ok::<_, Error>((info.state == BackendState::Stopped).then_some(info))
        })?;

        let Some(info) = stopped else {
            let waited = self.stop_poll.budget();
            tracing::warn!(container = %id, vmid, waited_secs = waited.as_secs(), "Container did not stop in time");
            return Err(Error::StopTimedOut {
                id: id.to_string(),
                waited,
            });
        };

        record.state = ContainerState::Stopped;
        record.finished_at = Some(Utc::now());
        record.exit_code = info.exit_code.or(record.exit_code);
        self.records.put(id, record)?;

        tracing::info!(container = %id, vmid, backend = %backend, "Container stopped");
        Ok(())
    }

    /// Delete a container and release its VMID.
    ///
    /// A running container is stopped first on a best-effort basis. A
    /// backend that no longer knows the resource counts as deleted.
    pub fn remove_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id);

        let (vmid, backend) = match self.records.get(id)? {
            Some(record) => (record.vmid, record.backend),
            None => {
                // Mapping without record: a create that died halfway
                let identity = self
                    .identity
                    .identity(id)
                    .map_err(|_| Error::ContainerNotFound(id.to_string()))?;
                tracing::warn!(container = %id, vmid = identity.vmid, "Removing orphaned VMID mapping");
                (identity.vmid, identity.backend_kind)
            }
        };
        let driver = self.driver(backend)?;

        match driver.info(vmid) {
            Ok(info) if matches!(info.state, BackendState::Running | BackendState::Paused) => {
                if let Err(e) = driver.stop(vmid, Some(self.remove_grace)) {
                    tracing::warn!(container = %id, vmid, error = %e, "Stop before removal failed, deleting anyway");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(container = %id, vmid, error = %e, "Status before removal unavailable"),
        }

        match driver.delete(vmid) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(container = %id, vmid, "Backend resource already gone");
            }
            Err(e) => return Err(Error::backend(backend, e)),
        }

        match self.identity.remove_mapping(id) {
            Ok(_) | Err(Error::MappingNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.records.remove(id)?;

        tracing::info!(container = %id, vmid, backend = %backend, "Container removed");
        Ok(())
    }

    /// Recorded containers joined with what their backends report
    pub fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<ContainerStatus>> {
        let records = self.records.entries()?;
        let kinds: BTreeSet<BackendKind> = records.iter().map(|(_, r)| r.backend).collect();

        let mut live: HashMap<(BackendKind, Vmid), ContainerInfo> = HashMap::new();
        let mut listed: BTreeSet<BackendKind> = BTreeSet::new();
        for kind in kinds {
            let infos = self
                .driver(kind)
                .and_then(|d| d.list().map_err(|e| Error::backend(kind, e)));
            match infos {
                Ok(infos) => {
                    listed.insert(kind);
                    live.extend(infos.into_iter().map(|i| ((kind, i.vmid), i)));
                }
                Err(e) => {
                    tracing::warn!(backend = %kind, error = %e, "Backend listing failed, reporting recorded state");
                }
            }
        }

        Ok(records
            .iter()
            .map(|(_, record)| {
                let info = live.get(&(record.backend, record.vmid));
                let mut status = ContainerStatus::merge(record, info);
                if info.is_none() && listed.contains(&record.backend) {
                    status.state = ContainerState::Unknown;
                }
                status
            })
            .filter(|s| filter.map_or(true, |f| f.matches(&s.id, s.state, &s.labels)))
            .collect())
    }

    pub fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let record = self.record(id)?;
        let driver = self.driver(record.backend)?;

        match driver.info(record.vmid) {
            Ok(info) => Ok(ContainerStatus::merge(&record, Some(&info))),
            Err(e) if e.is_not_found() => {
                tracing::warn!(container = %id, vmid = record.vmid, "Backend does not know this container");
                let mut status = ContainerStatus::merge(&record, None);
                status.state = ContainerState::Unknown;
                Ok(status)
            }
            Err(e) => Err(Error::backend(record.backend, e)),
        }
    }

    /// Change resource limits, hot when running and deferred to the next
    /// start otherwise
    pub fn update_container_resources(&self, id: &str, resources: &Resources) -> Result<()> {
        resources.validate()?;

        let _guard = self.lock_id(id);

        let mut record = self.record(id)?;
        let update = to_resource_update(resources);
        if update.is_empty() {
            tracing::debug!(container = %id, "Empty resource update ignored");
            return Ok(());
        }
        let driver = self.driver(record.backend)?;

        let state = self.live_info(driver.as_ref(), record.vmid)?.state;
        if matches!(state, BackendState::Running | BackendState::Paused) {
            driver
                .update_resources(record.vmid, &update)
                .map_err(|e| Error::backend(record.backend, e))?;
            record.native.apply(&update);
            tracing::info!(container = %id, vmid = record.vmid, "Resources updated");
        } else {
            record.pending_resources = Some(match record.pending_resources.take() {
                Some(pending) => pending.merge(&update),
                None => update,
            });
            tracing::info!(container = %id, vmid = record.vmid, "Resource update deferred until next start");
        }

        merge_resources(&mut record.config.resources, resources);
        self.records.put(id, record)
    }

    /// Run a command to completion inside a running container.
    ///
    /// The backend is asked for the live state first; a record that lags
    /// behind it is brought up to date. A non-zero exit is a normal result;
    /// running past `timeout` is `CommandTimeout`.
    pub fn exec_sync(&self, id: &str, command: &[String], timeout: Duration) -> Result<ExecResult> {
        if command.is_empty() {
            return Err(Error::InvalidArgument("exec command cannot be empty".into()));
        }
        let record = self.record(id)?;
        let driver = self.driver(record.backend)?;

        let live = self.live_info(driver.as_ref(), record.vmid)?.state;
        if live != BackendState::Running {
            self.observe_state(id, &record, live);
            let current = match ContainerState::from(live) {
                ContainerState::Stopped if record.state == ContainerState::Created => ContainerState::Created,
                observed => observed,
            };
            return Err(Error::invalid_state(id, current, "running"));
        }
        if record.state != ContainerState::Running {
            self.observe_state(id, &record, live);
        }

        match driver.exec(record.vmid, command, timeout) {
            Ok(result) => {
                tracing::debug!(container = %id, exit_code = result.exit_code, "Exec finished");
                Ok(result)
            }
            Err(BackendError::Timeout(_)) => Err(Error::CommandTimeout {
                id: id.to_string(),
                timeout,
            }),
            Err(e) => Err(Error::backend(record.backend, e)),
        }
    }

    /// Bring a record in line with the state its backend reports. A record
    /// still in `created` stays there until the container first runs.
    fn observe_state(&self, id: &str, seen: &ContainerRecord, live: BackendState) {
        let next = match (seen.state, live) {
            (ContainerState::Running, BackendState::Running) => return,
            (ContainerState::Created, BackendState::Stopped | BackendState::Created) => return,
            (ContainerState::Stopped, BackendState::Created) => return,
            (_, BackendState::Unknown) => return,
            (_, live) => ContainerState::from(live),
        };
        if next == seen.state {
            return;
        }

        let _guard = self.lock_id(id);
        let refreshed = self.records.get(id).and_then(|record| match record {
            Some(mut record) if record.state == seen.state => {
                if next == ContainerState::Stopped {
                    record.finished_at = Some(Utc::now());
                }
                record.state = next;
                self.records.put(id, record)
            }
            _ => Ok(()),
        });
        match refreshed {
            Ok(()) => tracing::info!(container = %id, from = %seen.state, to = %next, "Record state refreshed from backend"),
            Err(e) => tracing::warn!(container = %id, error = %e, "Failed to refresh record state"),
        }
    }

    pub fn pause_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id);

        let mut record = self.record(id)?;
        let driver = self.driver(record.backend)?;
        match self.live_info(driver.as_ref(), record.vmid)?.state {
            BackendState::Paused => {
                tracing::warn!(container = %id, "Container already paused");
            }
            BackendState::Running => {
                driver.pause(record.vmid).map_err(|e| Error::backend(record.backend, e))?;
                tracing::info!(container = %id, vmid = record.vmid, "Container paused");
            }
            other => return Err(Error::invalid_state(id, ContainerState::from(other), "running")),
        }
        record.state = ContainerState::Paused;
        self.records.put(id, record)
    }

    pub fn resume_container(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id);

        let mut record = self.record(id)?;
        let driver = self.driver(record.backend)?;
        match self.live_info(driver.as_ref(), record.vmid)?.state {
            BackendState::Running => {
                tracing::warn!(container = %id, "Container already running");
            }
            BackendState::Paused => {
                driver.resume(record.vmid).map_err(|e| Error::backend(record.backend, e))?;
                tracing::info!(container = %id, vmid = record.vmid, "Container resumed");
            }
            other => return Err(Error::invalid_state(id, ContainerState::from(other), "paused")),
        }
        record.state = ContainerState::Running;
        self.records.put(id, record)
    }

    /// Swap the routing rules; running containers keep their backend
    pub fn reload_routes(&self, rules: Vec<RoutingRule>) {
        self.router.reload(rules);
    }

    /// Backend a container with this id and namespaces would be routed to
    pub fn route(&self, id: &str, namespaces: &BTreeMap<String, String>) -> Result<BackendKind> {
        self.router.select(id, namespaces)
    }

    pub fn resolve(&self, id: &str) -> Result<ContainerIdentity> {
        self.identity.identity(id)
    }
}

fn merge_resources(current: &mut Resources, update: &Resources) {
    if update.memory_limit_bytes.is_some() {
        current.memory_limit_bytes = update.memory_limit_bytes;
    }
    if update.cpu_shares.is_some() {
        current.cpu_shares = update.cpu_shares;
    }
    if update.cpu_quota.is_some() {
        current.cpu_quota = update.cpu_quota;
    }
    if update.cpu_period.is_some() {
        current.cpu_period = update.cpu_period;
    }
}
