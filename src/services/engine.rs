use crate::constants::stack as stack_constants;
use crate::errors::{Error, Result};
use crate::utils::local_socket::Endpoint;
use async_trait::async_trait;
use base64::Engine as _;
use bollard::models::{
    NetworkAttachmentConfig, Secret, SecretSpec, Service, ServiceSpec, TaskSpec,
    TaskSpecContainerSpec,
};
use bollard::query_parameters::{ListSecretsOptions, ListServicesOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

static ENGINE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,62}$").expect("engine name regex")
});

/// Stacks, services, secrets and configs share the engine's naming rule.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if ENGINE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid_spec(format!("invalid {} name '{}'", what, name)))
    }
}

/// A service as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRef {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub image: Option<String>,
}

impl ServiceRef {
    pub fn namespace(&self) -> Option<&str> {
        self.labels
            .get(stack_constants::NAMESPACE_LABEL)
            .map(String::as_str)
    }
}

/// Everything needed to create one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub image: String,
    /// Replaces the image entrypoint.
    pub command: Option<Vec<String>>,
    /// Arguments passed to the entrypoint.
    pub args: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub networks: Vec<String>,
}

impl ServiceDefinition {
    fn to_spec(&self) -> ServiceSpec {
        let networks = if self.networks.is_empty() {
            None
        } else {
            Some(
                self.networks
                    .iter()
                    .map(|target| NetworkAttachmentConfig {
                        target: Some(target.clone()),
                        ..Default::default()
                    })
                    .collect(),
            )
        };
        ServiceSpec {
            name: Some(self.name.clone()),
            labels: Some(self.labels.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(self.image.clone()),
                    command: self.command.clone(),
                    args: self.args.clone(),
                    env: (!self.env.is_empty()).then(|| self.env.clone()),
                    hostname: self.hostname.clone(),
                    user: self.user.clone(),
                    dir: self.working_dir.clone(),
                    ..Default::default()
                }),
                networks,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// The slice of the engine's service API the stack model needs.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    async fn list_services(&self) -> Result<Vec<ServiceRef>>;

    /// Returns the id of the created service.
    async fn create_service(&self, definition: &ServiceDefinition) -> Result<String>;

    async fn remove_service(&self, id: &str) -> Result<()>;
}

/// `ServiceApi` over a bollard client.
#[derive(Debug, Clone)]
pub struct EngineServices {
    docker: Docker,
}

impl EngineServices {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Client for the engine behind a local tunnel endpoint.
    pub fn connect(endpoint: &Endpoint, timeout_secs: u64) -> Result<Self> {
        let docker = match endpoint {
            Endpoint::Unix(path) => {
                let path = path.to_string_lossy();
                Docker::connect_with_unix(&path, timeout_secs, API_DEFAULT_VERSION)?
            }
            Endpoint::Tcp(addr) => {
                let addr = format!("http://{}", addr);
                Docker::connect_with_http(&addr, timeout_secs, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ServiceApi for EngineServices {
    async fn list_services(&self) -> Result<Vec<ServiceRef>> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions>)
            .await?;
        Ok(services.into_iter().filter_map(service_ref).collect())
    }

    async fn create_service(&self, definition: &ServiceDefinition) -> Result<String> {
        let response = self
            .docker
            .create_service(definition.to_spec(), None)
            .await?;
        response.id.ok_or_else(|| {
            Error::Engine(format!(
                "engine returned no id for service '{}'",
                definition.name
            ))
        })
    }

    async fn remove_service(&self, id: &str) -> Result<()> {
        self.docker.delete_service(id).await?;
        Ok(())
    }
}

/// A named swarm object holding opaque data (a secret or a config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmObject {
    pub id: String,
    pub name: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SwarmObject {
    pub fn matches(&self, id_or_name: &str) -> bool {
        self.id == id_or_name || self.name == id_or_name
    }
}

/// List/create/remove over one kind of swarm object.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// `secret` or `config`, for messages.
    fn kind(&self) -> &'static str;

    async fn list(&self) -> Result<Vec<SwarmObject>>;

    /// Returns the id of the created object.
    async fn create(&self, name: &str, data: Bytes) -> Result<String>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Looks an object up by exact id or name.
    async fn find(&self, id_or_name: &str) -> Result<SwarmObject> {
        self.list()
            .await?
            .into_iter()
            .find(|object| object.matches(id_or_name))
            .ok_or_else(|| Error::not_found(format!("{} '{}'", self.kind(), id_or_name)))
    }
}

/// Swarm secrets through the engine API.
#[derive(Debug, Clone)]
pub struct EngineSecrets {
    docker: Docker,
}

impl EngineSecrets {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ObjectApi for EngineSecrets {
    fn kind(&self) -> &'static str {
        "secret"
    }

    async fn list(&self) -> Result<Vec<SwarmObject>> {
        let secrets = self
            .docker
            .list_secrets(None::<ListSecretsOptions>)
            .await?;
        Ok(secrets.into_iter().filter_map(secret_object).collect())
    }

    async fn create(&self, name: &str, data: Bytes) -> Result<String> {
        validate_name("secret", name)?;
        let spec = SecretSpec {
            name: Some(name.to_string()),
            data: Some(base64::engine::general_purpose::STANDARD.encode(&data)),
            ..Default::default()
        };
        let response = self.docker.create_secret(spec).await?;
        Ok(response.id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker.delete_secret(id).await?;
        Ok(())
    }
}

fn secret_object(secret: Secret) -> Option<SwarmObject> {
    let id = secret.id?;
    let name = secret
        .spec
        .and_then(|spec| spec.name)
        .unwrap_or_else(|| id.clone());
    Some(SwarmObject {
        updated_at: secret.updated_at.as_deref().and_then(parse_engine_time),
        id,
        name,
    })
}

/// Engine timestamps are RFC 3339 with nanoseconds.
pub fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn service_ref(service: Service) -> Option<ServiceRef> {
    let id = service.id?;
    let spec = service.spec.unwrap_or_default();
    let image = spec
        .task_template
        .and_then(|task| task.container_spec)
        .and_then(|container| container.image);
    Some(ServiceRef {
        name: spec.name.unwrap_or_else(|| id.clone()),
        id,
        labels: spec.labels.unwrap_or_default(),
        image,
    })
}
