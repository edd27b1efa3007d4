//! Stack deploy documents (the compose v3 subset this tool understands).
//!
//! Every recognised service key is listed in [`ServiceOptions`]. A handful
//! of keys are accepted but not applied (`healthcheck`, `deploy`, `secrets`,
//! `ports`); they are surfaced through [`ServiceOptions::dropped_keys`] so
//! callers can warn about them. Anything else fails to parse.

use crate::constants::stack as stack_constants;
use crate::errors::{Error, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Root of a stack file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackFile {
    #[serde(default)]
    pub version: Option<String>,

    /// Services keyed by name; creation follows key order.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOptions>,

    #[serde(default)]
    pub networks: Option<Value>,

    #[serde(default)]
    pub volumes: Option<Value>,

    #[serde(default)]
    pub secrets: Option<Value>,

    #[serde(default)]
    pub configs: Option<Value>,
}

impl StackFile {
    pub fn parse(content: &str) -> Result<Self> {
        let file: StackFile = serde_yaml::from_str(content)?;
        if file.services.is_empty() {
            return Err(Error::invalid_spec("stack file defines no services"));
        }
        Ok(file)
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::invalid_spec(format!("{}: {}", path.display(), err)))?;
        Self::parse(&content)
    }

    /// Top-level sections that are accepted but not applied.
    pub fn dropped_sections(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.networks.is_some() {
            out.push("networks");
        }
        if self.volumes.is_some() {
            out.push("volumes");
        }
        if self.secrets.is_some() {
            out.push("secrets");
        }
        if self.configs.is_some() {
            out.push("configs");
        }
        out
    }
}

/// Options for one service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceOptions {
    pub image: String,

    #[serde(default)]
    pub command: Option<CommandLine>,

    #[serde(default)]
    pub entrypoint: Option<CommandLine>,

    #[serde(default)]
    pub environment: Option<Environment>,

    #[serde(default)]
    pub labels: Option<Labels>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub networks: Option<Networks>,

    // Accepted for compatibility, not applied.
    #[serde(default)]
    pub healthcheck: Option<Value>,

    #[serde(default)]
    pub deploy: Option<Value>,

    #[serde(default)]
    pub secrets: Option<Value>,

    #[serde(default)]
    pub ports: Option<Value>,
}

impl ServiceOptions {
    pub fn dropped_keys(&self) -> Vec<&'static str> {
        let present = [
            self.healthcheck.is_some(),
            self.deploy.is_some(),
            self.secrets.is_some(),
            self.ports.is_some(),
        ];
        stack_constants::DROPPED_SERVICE_KEYS
            .iter()
            .zip(present)
            .filter_map(|(key, present)| present.then_some(*key))
            .collect()
    }
}

/// `command`/`entrypoint` as a shell string or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Shell strings are split with POSIX shell word rules, quotes included.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        match self {
            CommandLine::Shell(line) => shlex::split(line).ok_or_else(|| {
                Error::invalid_spec(format!("unbalanced quoting in command '{}'", line))
            }),
            CommandLine::Argv(argv) => Ok(argv.clone()),
        }
    }
}

/// Environment as a map or a list of `KEY=value` entries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Option<ScalarValue>>),
    List(Vec<String>),
}

impl Environment {
    /// `KEY=value` entries; map keys without a value become bare `KEY`.
    pub fn to_entries(&self) -> Vec<String> {
        match self {
            Environment::Map(map) => map
                .iter()
                .map(|(key, value)| match value {
                    Some(value) => format!("{}={}", key, value.as_text()),
                    None => key.clone(),
                })
                .collect(),
            Environment::List(list) => list.clone(),
        }
    }
}

/// Labels as a map or a list of `key=value` entries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Labels {
    Map(BTreeMap<String, ScalarValue>),
    List(Vec<String>),
}

impl Labels {
    pub fn to_map(&self) -> HashMap<String, String> {
        match self {
            Labels::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.as_text()))
                .collect(),
            Labels::List(list) => list
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (entry.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// Service networks as a list or a map keyed by network name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Networks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Value>>),
}

impl Networks {
    pub fn names(&self) -> Vec<String> {
        match self {
            Networks::List(list) => list.clone(),
            Networks::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// YAML scalars people write in env/label maps (`PORT: 8080`, `DEBUG: true`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarValue {
    pub fn as_text(&self) -> String {
        match self {
            ScalarValue::Text(text) => text.clone(),
            ScalarValue::Integer(value) => value.to_string(),
            ScalarValue::Float(value) => value.to_string(),
            ScalarValue::Bool(value) => value.to_string(),
        }
    }
}
