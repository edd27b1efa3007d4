//! Swarm configs managed through the `docker` CLI on the manager itself.
//!
//! The engine client library has no config endpoints, so these calls run
//! over the manager's ssh session instead of the tunnel. Payloads are
//! staged as base64 in a remote temp file, then piped into
//! `docker config create`.

use crate::constants::configs as config_constants;
use crate::errors::{Error, Result};
use crate::services::command::{CommandExecutor, CommandOutput};
use crate::services::engine::{parse_engine_time, validate_name, ObjectApi, SwarmObject};
use async_trait::async_trait;
use base64::Engine as _;
use bollard::models::Config;
use bytes::Bytes;

#[derive(Clone)]
pub struct RemoteConfigs {
    executor: CommandExecutor,
}

impl RemoteConfigs {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    async fn capture(&self, command: String) -> Result<CommandOutput> {
        let executor = self.executor.clone();
        tokio::task::spawn_blocking(move || executor.capture(&command))
            .await
            .map_err(|err| Error::execution(format!("config command task failed: {}", err)))?
    }

    async fn checked(&self, command: String) -> Result<CommandOutput> {
        let output = self.capture(command.clone()).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(command_failure(&command, &output))
        }
    }
}

#[async_trait]
impl ObjectApi for RemoteConfigs {
    fn kind(&self) -> &'static str {
        "config"
    }

    async fn list(&self) -> Result<Vec<SwarmObject>> {
        let output = self
            .checked(config_constants::LIST_COMMAND.to_string())
            .await?;
        parse_inspect(&output.stdout)
    }

    async fn create(&self, name: &str, data: Bytes) -> Result<String> {
        validate_name("config", name)?;
        let temp = self
            .checked(config_constants::TEMP_FILE_COMMAND.to_string())
            .await?
            .stdout_text();
        if temp.is_empty() {
            return Err(Error::execution("mktemp printed no path"));
        }
        let temp = quote(&temp)?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        if let Err(err) = self.stage(&temp, &encoded).await {
            if let Err(cleanup) = self.capture(format!("rm -f {}", temp)).await {
                tracing::warn!(error = %cleanup, "cannot remove staged config payload");
            }
            return Err(err);
        }
        let created = self
            .checked(format!(
                "base64 -d {temp} | docker config create {name} -; status=$?; rm -f {temp}; exit $status",
                temp = temp,
                name = quote(name)?
            ))
            .await?;

        let id = created.stdout_text();
        if id.is_empty() {
            return Err(Error::Engine(format!("engine returned no id for config '{}'", name)));
        }
        tracing::info!(config = name, id = %id, "config created");
        Ok(id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.checked(format!("docker config rm {}", quote(id)?))
            .await?;
        Ok(())
    }
}

impl RemoteConfigs {
    async fn stage(&self, temp: &str, encoded: &str) -> Result<()> {
        // Base64 output is ASCII, so byte chunks stay on character boundaries.
        for chunk in encoded.as_bytes().chunks(config_constants::UPLOAD_CHUNK_CHARS) {
            let chunk = String::from_utf8_lossy(chunk);
            self.checked(format!("printf '%s' '{}' >> {}", chunk, temp))
                .await?;
        }
        Ok(())
    }
}

fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|err| Error::invalid_spec(format!("cannot quote '{}': {}", word, err)))
}

fn command_failure(command: &str, output: &CommandOutput) -> Error {
    let stderr = output.stderr_text();
    let lowered = stderr.to_lowercase();
    if lowered.contains("not found") || lowered.contains("no such") {
        Error::not_found(stderr)
    } else if lowered.contains("already exists") {
        Error::conflict(stderr)
    } else {
        Error::Engine(format!(
            "'{}' exited with {}: {}",
            command, output.status, stderr
        ))
    }
}

fn parse_inspect(stdout: &[u8]) -> Result<Vec<SwarmObject>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let configs: Vec<Config> = serde_json::from_slice(stdout)
        .map_err(|err| Error::Engine(format!("unreadable config listing: {}", err)))?;
    let mut objects: Vec<SwarmObject> = configs
        .into_iter()
        .filter_map(|config| {
            let id = config.id?;
            let name = config
                .spec
                .and_then(|spec| spec.name)
                .unwrap_or_else(|| id.clone());
            Some(SwarmObject {
                updated_at: config.updated_at.as_deref().and_then(parse_engine_time),
                id,
                name,
            })
        })
        .collect();
    objects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(objects)
}
