use crate::errors::{Error, Result};
use crate::managers::stacks::StackModel;
use crate::managers::tunnel::{SocketTunnel, TunnelStatus};
use crate::services::command::CommandExecutor;
use crate::services::echo::Echo;
use crate::services::engine::{EngineSecrets, EngineServices, ObjectApi};
use crate::services::remote_configs::RemoteConfigs;
use crate::services::inventory::{HostDiscovery, HostRecord};
use crate::services::settings::Settings;
use crate::services::shell::{Connector, RemoteShell};
use crate::utils::local_socket::Endpoint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Tracks which hosts currently have an active manager in this process.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    active: Arc<DashMap<String, Uuid>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, host_id: &str) -> bool {
        self.active.contains_key(host_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn claim(&self, host_id: &str) -> Result<RegistrySlot> {
        match self.active.entry(host_id.to_string()) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "a manager for host '{}' is already active",
                host_id
            ))),
            Entry::Vacant(slot) => {
                let token = Uuid::new_v4();
                slot.insert(token);
                Ok(RegistrySlot {
                    active: self.active.clone(),
                    host_id: host_id.to_string(),
                    token,
                })
            }
        }
    }
}

/// Frees the host's registry entry when dropped.
struct RegistrySlot {
    active: Arc<DashMap<String, Uuid>>,
    host_id: String,
    token: Uuid,
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.host_id, |_, token| *token == self.token);
    }
}

/// Opens scope-bound managers: one remote session, one tunnel and one
/// engine client per acquired host.
#[derive(Clone)]
pub struct SwarmManager {
    connector: Arc<dyn Connector>,
    settings: Arc<Settings>,
    echo: Arc<dyn Echo>,
    registry: ManagerRegistry,
}

impl SwarmManager {
    pub fn new(connector: Arc<dyn Connector>, settings: Arc<Settings>, echo: Arc<dyn Echo>) -> Self {
        Self {
            connector,
            settings,
            echo,
            registry: ManagerRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ManagerRegistry {
        &self.registry
    }

    /// Connects to `host`, opens the tunnel and binds an engine client to it.
    /// Anything set up before a failure is torn down again.
    pub async fn acquire(&self, host: HostRecord) -> Result<ManagerHandle> {
        let slot = self.registry.claim(&host.id)?;

        let connector = self.connector.clone();
        let target = host.clone();
        let shell = tokio::task::spawn_blocking(move || connector.connect(&target))
            .await
            .map_err(|err| Error::Unreachable(format!("connect task failed: {}", err)))??;

        let executor = CommandExecutor::new(shell.clone(), self.echo.clone(), host.label());
        let tunnel = SocketTunnel::new(executor.clone(), self.settings.clone());
        let endpoint = match tunnel.open().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                disconnect(shell).await;
                return Err(err);
            }
        };
        let engine = match EngineServices::connect(&endpoint, self.settings.engine_timeout_secs) {
            Ok(engine) => engine,
            Err(err) => {
                tunnel.close().await;
                disconnect(shell).await;
                return Err(err);
            }
        };

        tracing::info!(host = %host.label(), endpoint = %endpoint, "manager acquired");
        Ok(ManagerHandle {
            host,
            shell,
            executor,
            tunnel,
            endpoint,
            engine,
            settings: self.settings.clone(),
            released: AtomicBool::new(false),
            slot: Mutex::new(Some(slot)),
        })
    }

    /// Acquires the first manager discovery reports for `stack`.
    pub async fn find(
        &self,
        discovery: &dyn HostDiscovery,
        stack: Option<&str>,
    ) -> Result<ManagerHandle> {
        let host = discovery.find(stack).await?;
        self.acquire(host).await
    }

    /// Runs `f` against a freshly acquired manager and releases it whether
    /// or not `f` succeeded.
    pub async fn scoped<F, Fut, T>(&self, host: HostRecord, f: F) -> Result<T>
    where
        F: FnOnce(Arc<ManagerHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = Arc::new(self.acquire(host).await?);
        let outcome = f(handle.clone()).await;
        handle.release().await;
        outcome
    }
}

/// A live manager. Release it explicitly; dropping it still tears the
/// tunnel and session down, just without waiting for the accept loop.
pub struct ManagerHandle {
    host: HostRecord,
    shell: Arc<dyn RemoteShell>,
    executor: CommandExecutor,
    tunnel: SocketTunnel,
    endpoint: Endpoint,
    engine: EngineServices,
    settings: Arc<Settings>,
    released: AtomicBool,
    slot: Mutex<Option<RegistrySlot>>,
}

impl ManagerHandle {
    pub fn host(&self) -> &HostRecord {
        &self.host
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn tunnel(&self) -> &SocketTunnel {
        &self.tunnel
    }

    pub fn tunnel_status(&self) -> TunnelStatus {
        self.tunnel.status()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn engine(&self) -> &EngineServices {
        &self.engine
    }

    pub fn stacks(&self) -> StackModel {
        StackModel::new(Arc::new(self.engine.clone()))
    }

    /// Swarm secrets, through the tunnel.
    pub fn secrets(&self) -> Arc<dyn ObjectApi> {
        Arc::new(EngineSecrets::new(self.engine.docker().clone()))
    }

    /// Swarm configs, through the `docker` CLI on the manager session.
    pub fn configs(&self) -> Arc<dyn ObjectApi> {
        Arc::new(RemoteConfigs::new(self.executor.clone()))
    }

    /// The variable off-the-shelf engine clients read to find the endpoint.
    pub fn command_env(&self) -> (String, String) {
        (
            self.settings.endpoint_env_var.clone(),
            self.endpoint.docker_host(),
        )
    }

    /// Sets [`Self::command_env`] on the current process.
    pub fn publish_env(&self) {
        let (name, value) = self.command_env();
        std::env::set_var(&name, &value);
        tracing::debug!(name = %name, value = %value, "endpoint published to environment");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Closes the tunnel and the remote session. Safe to call repeatedly.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tunnel.close().await;
        disconnect(self.shell.clone()).await;
        self.slot
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        tracing::info!(host = %self.host.label(), "manager released");
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(host = %self.host.label(), "manager dropped without release");
            self.shell.disconnect();
        }
    }
}

async fn disconnect(shell: Arc<dyn RemoteShell>) {
    if let Err(err) = tokio::task::spawn_blocking(move || shell.disconnect()).await {
        tracing::warn!(error = %err, "session disconnect task failed");
    }
}
