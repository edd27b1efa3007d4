use crate::constants::configs as config_constants;
use crate::errors::{Error, Result};
use crate::services::blob_store::BlobStore;
use crate::services::engine::{validate_name, ObjectApi, SwarmObject};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Whether a config has a copy in the backup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Backed,
    Missing,
    /// Only the backup exists; the swarm has no such config.
    BackupOnly,
    /// No backup store configured.
    Unknown,
}

impl BackupState {
    pub fn mark(self) -> char {
        match self {
            BackupState::Backed => '*',
            BackupState::Missing => '!',
            BackupState::BackupOnly => '-',
            BackupState::Unknown => '?',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub id: Option<String>,
    pub name: String,
    pub backup: BackupState,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    /// Names that already exist in the swarm and were left alone.
    pub skipped: Vec<String>,
}

/// Config copies of one swarm, stored under `swarms/<swarm>/configs/<name>`.
#[derive(Clone)]
pub struct ConfigArchive {
    store: Arc<dyn BlobStore>,
    swarm: String,
}

impl ConfigArchive {
    pub fn new(store: Arc<dyn BlobStore>, swarm: impl Into<String>) -> Self {
        Self {
            store,
            swarm: swarm.into(),
        }
    }

    fn prefix(&self) -> String {
        format!(
            "{}/{}/configs/",
            config_constants::BACKUP_KEY_PREFIX,
            self.swarm
        )
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Backed-up config names with their modification times.
    pub async fn list(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let prefix = self.prefix();
        Ok(self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let name = entry.key.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| (name.to_string(), entry.last_modified))
            })
            .collect())
    }

    pub async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.store.put(&self.key(name), data).await
    }

    /// The backed-up content of a config.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        validate_name("config", name)?;
        self.store
            .get(&self.key(name))
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found(format!(
                    "no backup of config {} for swarm {}",
                    name, self.swarm
                )),
                other => other,
            })
    }
}

/// Swarm configs of one swarm, kept in step with an optional archive.
#[derive(Clone)]
pub struct ConfigBackups {
    configs: Arc<dyn ObjectApi>,
    archive: Option<ConfigArchive>,
    swarm: String,
}

impl ConfigBackups {
    pub fn new(
        configs: Arc<dyn ObjectApi>,
        store: Option<Arc<dyn BlobStore>>,
        swarm: impl Into<String>,
    ) -> Self {
        let swarm = swarm.into();
        Self {
            configs,
            archive: store.map(|store| ConfigArchive::new(store, swarm.clone())),
            swarm,
        }
    }

    fn archive(&self) -> Result<&ConfigArchive> {
        self.archive.as_ref().ok_or_else(|| {
            Error::Config("no backup store configured (set SWARMLINK_BACKUP_DIR)".to_string())
        })
    }

    /// Creates the config and, unless `backup` is off, stores a copy. The
    /// store is checked before anything is created.
    pub async fn create(&self, name: &str, data: Bytes, backup: bool) -> Result<String> {
        validate_name("config", name)?;
        let archive = if backup { Some(self.archive()?) } else { None };
        let id = self.configs.create(name, data.clone()).await?;
        if let Some(archive) = archive {
            if let Err(err) = archive.put(name, data).await {
                return Err(Error::partial(
                    vec![format!("config {}", name)],
                    format!("backup of {}", name),
                    err,
                ));
            }
            tracing::info!(swarm = %self.swarm, config = name, "config backed up");
        }
        Ok(id)
    }

    /// Swarm configs with their backup state, sorted by name. With
    /// `include_backups`, backups without a live config are listed too.
    pub async fn list(&self, include_backups: bool) -> Result<Vec<ConfigEntry>> {
        let backups = if include_backups || self.archive.is_some() {
            Some(self.archive()?.list().await?)
        } else {
            None
        };
        let mut entries: BTreeMap<String, ConfigEntry> = BTreeMap::new();
        for object in self.configs.list().await? {
            let backup = match &backups {
                Some(backups) if backups.contains_key(&object.name) => BackupState::Backed,
                Some(_) => BackupState::Missing,
                None => BackupState::Unknown,
            };
            entries.insert(
                object.name.clone(),
                ConfigEntry {
                    id: Some(object.id),
                    name: object.name,
                    backup,
                    modified: object.updated_at,
                },
            );
        }
        if include_backups {
            for (name, modified) in backups.unwrap_or_default() {
                entries.entry(name.clone()).or_insert(ConfigEntry {
                    id: None,
                    name,
                    backup: BackupState::BackupOnly,
                    modified: Some(modified),
                });
            }
        }
        Ok(entries.into_values().collect())
    }

    /// Recreates configs from their backups. Configs that still exist in
    /// the swarm are skipped. With `all`, every backup is a candidate.
    pub async fn restore(&self, names: &[String], all: bool) -> Result<RestoreReport> {
        let archive = self.archive()?;
        let backups = archive.list().await?;
        let live: HashMap<String, SwarmObject> = self
            .configs
            .list()
            .await?
            .into_iter()
            .map(|object| (object.name.clone(), object))
            .collect();
        let targets: Vec<String> = if all {
            backups.keys().cloned().collect()
        } else {
            names.to_vec()
        };

        let mut report = RestoreReport::default();
        for name in targets {
            if live.contains_key(&name) {
                tracing::warn!(swarm = %self.swarm, config = %name, "config exists, restore skipped");
                report.skipped.push(name);
                continue;
            }
            let data = match archive.get(&name).await {
                Ok(data) => data,
                Err(err) => return Err(Error::partial(report.restored, name, err)),
            };
            if let Err(err) = self.configs.create(&name, data).await {
                return Err(Error::partial(report.restored, name, err));
            }
            tracing::info!(swarm = %self.swarm, config = %name, "config restored");
            report.restored.push(name);
        }
        Ok(report)
    }

    /// Removes configs from the swarm; backups are kept. Every name must
    /// exist before anything is removed.
    pub async fn remove(&self, names: &[String]) -> Result<Vec<String>> {
        let live: HashMap<String, SwarmObject> = self
            .configs
            .list()
            .await?
            .into_iter()
            .map(|object| (object.name.clone(), object))
            .collect();
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let object = live.get(name).ok_or_else(|| {
                Error::not_found(format!("config {} not found in swarm {}", name, self.swarm))
            })?;
            targets.push(object.clone());
        }

        let mut removed = Vec::with_capacity(targets.len());
        for object in targets {
            if let Err(err) = self.configs.remove(&object.id).await {
                return Err(Error::partial(removed, object.name, err));
            }
            tracing::info!(swarm = %self.swarm, config = %object.name, "config removed");
            removed.push(object.name);
        }
        Ok(removed)
    }

    /// The backed-up content of a config.
    pub async fn cat(&self, name: &str) -> Result<Bytes> {
        self.archive()?.get(name).await
    }
}
