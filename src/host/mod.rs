//! Service host - named registry of worker-backed services.
//!
//! The host spawns workers through a [`WorkerSpawner`], waits for their
//! spawn acknowledgement, and keeps one [`Service`] per name. It also serves
//! the front-end channel bridge.

mod frontend;
mod service;
mod spawner;

pub use frontend::{
    front_end_link, ClientGrant, FrontEndEndpoint, FrontEndLink, GrantError, NewClientRequest,
};
pub use service::{Service, ServiceInfo, ServiceState};
pub use spawner::{
    LocalSpawner, ProcessSpawner, SpawnedWorker, WorkerControl, WorkerEvent, WorkerSpawner,
    ENV_IN_CHILD_PROCESS, ENV_SERVICE_NAME, KILLED_EXIT_CODE, STARTUP_FAILURE_EXIT_CODE,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinHandle;

use crate::client::MessageClient;
use crate::port::MessagePort;
use crate::types::{ClientId, Config, Error, Result, ServiceName, SpawnOptions};

struct HostInner {
    spawner: Arc<dyn WorkerSpawner>,
    config: Config,
    services: RwLock<HashMap<ServiceName, Service>>,
}

impl fmt::Debug for HostInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInner")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

/// Registry of running services. Clones share the registry.
#[derive(Debug, Clone)]
pub struct ServiceHost {
    inner: Arc<HostInner>,
}

impl ServiceHost {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: Config) -> Self {
        Self {
            inner: Arc::new(HostInner {
                spawner,
                config,
                services: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Service lifecycle
    // =========================================================================

    /// Spawn `entry` as service `name` and wait until it is ready.
    ///
    /// A worker that exits before acknowledging fails with `StartupExit` and
    /// leaves no registry entry behind.
    pub async fn create_service(
        &self,
        name: ServiceName,
        entry: &str,
        mut options: SpawnOptions,
    ) -> Result<Service> {
        self.ensure_vacant(&name)?;
        if options.service_name.is_none() {
            options.service_name = Some(name.to_string());
        }

        let worker = self.inner.spawner.spawn(entry, &options).await.map_err(|err| {
            tracing::error!(service = %name, entry, error = %err, "unable to spawn worker");
            err
        })?;
        let service = Service::start(
            name.clone(),
            entry,
            worker,
            self.inner.config.requests.default_timeout,
        )?;

        if !self.insert_vacant(&name, &service) {
            tracing::warn!(service = %name, "service registered while spawning, discarding worker");
            // Best effort; the caller only learns about the name clash.
            let _ = service.stop().await;
            return Err(Error::already_registered(format!("service {}", name)));
        }
        tracing::info!(service = %name, entry, pid = ?service.pid(), "created service");

        if let Err(err) = service.when_ready().await {
            tracing::error!(service = %name, error = %err, "service failed to start");
            if let Err(cleanup) = self.destroy_service(&name).await {
                tracing::warn!(service = %name, error = %cleanup, "unable to clean up failed service");
            }
            return Err(err);
        }
        Ok(service)
    }

    /// Remove `name` from the registry and stop its worker.
    /// Returns the exit code.
    pub async fn destroy_service(&self, name: &ServiceName) -> Result<i32> {
        let service = self
            .write_services()
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))?;
        let code = service.stop().await?;
        tracing::info!(service = %name, code, "destroyed service");
        Ok(code)
    }

    /// Stop every service. Failures are logged, not returned.
    pub async fn destroy_all(&self) -> usize {
        let services: Vec<Service> = self.write_services().drain().map(|(_, s)| s).collect();
        let stopped = futures::future::join_all(services.iter().map(Service::stop)).await;
        for (service, outcome) in services.iter().zip(&stopped) {
            if let Err(err) = outcome {
                tracing::error!(service = %service.name(), error = %err, "unable to stop service");
            }
        }
        tracing::info!(count = services.len(), "destroyed all services");
        services.len()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get_service(&self, name: &ServiceName) -> Option<Service> {
        self.read_services().get(name).cloned()
    }

    /// Snapshot of every registered service, sorted by name.
    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self.read_services().values().map(Service::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn require(&self, name: &ServiceName) -> Result<Service> {
        self.get_service(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))
    }

    fn ensure_vacant(&self, name: &ServiceName) -> Result<()> {
        if self.read_services().contains_key(name) {
            return Err(Error::already_registered(format!("service {}", name)));
        }
        Ok(())
    }

    fn insert_vacant(&self, name: &ServiceName, service: &Service) -> bool {
        let mut services = self.write_services();
        if services.contains_key(name) {
            return false;
        }
        services.insert(name.clone(), service.clone());
        true
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub fn create_message_channel(
        &self,
        name: &ServiceName,
        client_id: ClientId,
    ) -> Result<MessagePort> {
        self.require(name)?.create_message_channel(client_id)
    }

    pub fn create_main_client(&self, name: &ServiceName, client_id: ClientId) -> Result<MessageClient> {
        self.require(name)?.create_main_client(client_id)
    }

    /// Answer front-end channel requests until every [`FrontEndLink`] is gone.
    pub fn serve_front_end(&self, mut endpoint: FrontEndEndpoint) -> JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(request) = endpoint.next_request().await {
                let grant = match host
                    .create_message_channel(&request.service_name, request.client_id.clone())
                {
                    Ok(port) => {
                        tracing::debug!(service = %request.service_name, client_id = %request.client_id, "granting channel to front-end");
                        ClientGrant::granted(request, port)
                    }
                    Err(err) => {
                        tracing::error!(service = %request.service_name, client_id = %request.client_id, error = %err, "unable to grant channel");
                        ClientGrant::failed(request, &err)
                    }
                };
                endpoint.grant(grant);
            }
            tracing::debug!("front-end control link closed");
        })
    }

    fn read_services(&self) -> RwLockReadGuard<'_, HashMap<ServiceName, Service>> {
        self.inner.services.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_services(&self) -> RwLockWriteGuard<'_, HashMap<ServiceName, Service>> {
        self.inner.services.write().unwrap_or_else(|e| e.into_inner())
    }
}
