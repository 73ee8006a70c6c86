//! Async facade over the orchestrator
//!
//! Orchestrator calls block on external processes and HTTP round-trips, so
//! each call runs on tokio's blocking pool. An RPC front end holds one
//! [`RuntimeService`] and clones it per request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendKind, ExecResult};
use crate::container::{ContainerConfig, Resources};
use crate::identity::ContainerIdentity;
use crate::orchestrator::Orchestrator;
use crate::record::{ContainerFilter, ContainerStatus};
use crate::router::RoutingRule;
use crate::{Error, Result};

#[derive(Clone)]
pub struct RuntimeService {
    orchestrator: Arc<Orchestrator>,
}

impl RuntimeService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self::from_shared(Arc::new(orchestrator))
    }

    pub fn from_shared(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Orchestrator) -> Result<T> + Send + 'static,
    {
        let orchestrator = self.orchestrator.clone();
        tokio::task::spawn_blocking(move || call(orchestrator.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("orchestrator task failed: {}", e)))?
    }

    pub async fn create_container(&self, pod_id: impl Into<String>, config: ContainerConfig) -> Result<String> {
        let pod_id = pod_id.into();
        self.blocking(move |o| o.create_container(&pod_id, config)).await
    }

    pub async fn start_container(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.start_container(&id)).await
    }

    pub async fn stop_container(&self, id: impl Into<String>, timeout: Option<Duration>) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.stop_container(&id, timeout)).await
    }

    pub async fn remove_container(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.remove_container(&id)).await
    }

    pub async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<ContainerStatus>> {
        self.blocking(move |o| o.list_containers(filter.as_ref())).await
    }

    pub async fn container_status(&self, id: impl Into<String>) -> Result<ContainerStatus> {
        let id = id.into();
        self.blocking(move |o| o.container_status(&id)).await
    }

    pub async fn update_container_resources(&self, id: impl Into<String>, resources: Resources) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.update_container_resources(&id, &resources)).await
    }

    pub async fn exec_sync(&self, id: impl Into<String>, command: Vec<String>, timeout: Duration) -> Result<ExecResult> {
        let id = id.into();
        self.blocking(move |o| o.exec_sync(&id, &command, timeout)).await
    }

    pub async fn pause_container(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.pause_container(&id)).await
    }

    pub async fn resume_container(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.blocking(move |o| o.resume_container(&id)).await
    }

    /// Routing is in-memory, so these two run inline
    pub fn reload_routes(&self, rules: Vec<RoutingRule>) {
        self.orchestrator.reload_routes(rules);
    }

    pub fn route(&self, id: &str, namespaces: &BTreeMap<String, String>) -> Result<BackendKind> {
        self.orchestrator.route(id, namespaces)
    }

    pub async fn resolve(&self, id: impl Into<String>) -> Result<ContainerIdentity> {
        let id = id.into();
        self.blocking(move |o| o.resolve(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendState, ContainerInfo, DriverRegistry, MockBackendDriver};
    use crate::router::Router;

    fn service() -> RuntimeService {
        let mut mock = MockBackendDriver::new();
        mock.expect_kind().return_const(BackendKind::Crun);
        mock.expect_create().returning(|_| Ok(()));
        mock.expect_info()
            .returning(|vmid| Ok(ContainerInfo::new(vmid, BackendState::Stopped)));
        mock.expect_start().returning(|_| Ok(()));
        mock.expect_delete().returning(|_| Ok(()));

        let router = Router::new(vec![], Some(BackendKind::Crun));
        RuntimeService::new(Orchestrator::in_memory(router, DriverRegistry::new().with(Arc::new(mock))))
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let service = service();

        let id = service
            .create_container("pod-1", ContainerConfig::builder().name("job").build())
            .await
            .unwrap();
        service.start_container(id.clone()).await.unwrap();

        let resolved = service.resolve(id.clone()).await.unwrap();
        assert_eq!(resolved.backend_kind, BackendKind::Crun);

        service.remove_container(id.clone()).await.unwrap();
        let err = service.container_status(id).await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_vmids() {
        let service = service();

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let config = ContainerConfig::builder().name(format!("c{}", i)).build();
                service.create_container("pod-1", config).await
            }));
        }

        let mut vmids = std::collections::BTreeSet::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            vmids.insert(service.resolve(id).await.unwrap().vmid);
        }
        assert_eq!(vmids.len(), 8);
    }
}
