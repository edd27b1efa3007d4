use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A swarm manager node as reported by host discovery. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub dns_name: String,
    pub stack: Option<String>,
    pub state: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl HostRecord {
    pub fn new(id: impl Into<String>, dns_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dns_name: dns_name.into(),
            stack: None,
            state: "running".to_string(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// `<id>@<stack>`, used as the echo prompt.
    pub fn label(&self) -> String {
        format!("{}@{}", self.id, self.stack.as_deref().unwrap_or("-"))
    }
}

impl fmt::Display for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.stack.as_deref().unwrap_or("-"),
            self.state,
            self.dns_name
        )
    }
}

/// Source of candidate manager hosts (a cloud inventory in production).
#[async_trait]
pub trait HostDiscovery: Send + Sync {
    async fn list(&self, stack: Option<&str>) -> Result<Vec<HostRecord>>;

    async fn find(&self, stack: Option<&str>) -> Result<HostRecord> {
        self.list(stack).await?.into_iter().next().ok_or_else(|| {
            Error::not_found(format!(
                "manager not found for stack \"{}\"",
                stack.unwrap_or("")
            ))
        })
    }
}

/// Fixed host list, e.g. from `--host stack=dns` flags.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: Vec<HostRecord>,
}

impl StaticInventory {
    pub fn new(hosts: Vec<HostRecord>) -> Self {
        Self { hosts }
    }

    /// Parses `stack=dns` pairs; a bare `dns` yields a host without a stack.
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (stack, dns) = match entry.split_once('=') {
                Some((stack, dns)) => (Some(stack.trim()), dns.trim()),
                None => (None, entry),
            };
            if dns.is_empty() || stack.map(str::is_empty).unwrap_or(false) {
                return Err(Error::Config(format!(
                    "host entry '{}' must look like stack=dns-name",
                    entry
                )));
            }
            let mut record = HostRecord::new(dns, dns);
            if let Some(stack) = stack {
                record = record.with_stack(stack);
            }
            hosts.push(record);
        }
        Ok(Self { hosts })
    }
}

#[async_trait]
impl HostDiscovery for StaticInventory {
    async fn list(&self, stack: Option<&str>) -> Result<Vec<HostRecord>> {
        Ok(self
            .hosts
            .iter()
            .filter(|host| host.state == "running")
            .filter(|host| match stack {
                Some(wanted) => host.stack.as_deref() == Some(wanted),
                None => true,
            })
            .cloned()
            .collect())
    }
}
