//! Durable single-snapshot backup of a guest user's projects.
//!
//! Each identity has exactly one snapshot and one info record. A new backup
//! overwrites both; there is no history.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryBackupStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackupStorage;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};
use crate::migration::migrate_projects;
use crate::model::{now, Project, Timestamp};

pub const FORMAT_VERSION: u32 = 2;

const SNAPSHOT_KEY: &str = "snapshot";
const INFO_KEY: &str = "info";

/// Keyed blob store scoped by identity.
pub trait BackupStorage {
    fn get(&self, identity: &str, name: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, identity: &str, name: &str, value: &[u8]) -> Result<()>;
    fn delete(&mut self, identity: &str, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestBackup {
    pub projects: Vec<Project>,
    #[serde(default)]
    pub current_project_id: Option<String>,
    pub saved_at: Timestamp,
    pub format_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub project_count: usize,
    pub saved_at: Timestamp,
    #[serde(default)]
    pub current_project_id: Option<String>,
    pub format_version: u32,
}

pub struct GuestBackupStore<S: BackupStorage> {
    storage: S,
}

impl<S: BackupStorage> GuestBackupStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn backup(
        &mut self,
        projects: &[Project],
        current_project: Option<&Project>,
        identity: &str,
    ) -> Result<BackupInfo> {
        let snapshot = GuestBackup {
            projects: projects.to_vec(),
            current_project_id: current_project.map(|p| p.id.clone()),
            saved_at: now(),
            format_version: FORMAT_VERSION,
        };
        let info = BackupInfo {
            project_count: snapshot.projects.len(),
            saved_at: snapshot.saved_at,
            current_project_id: snapshot.current_project_id.clone(),
            format_version: FORMAT_VERSION,
        };

        self.storage
            .put(identity, SNAPSHOT_KEY, &serde_json::to_vec(&snapshot)?)
            .with_context(|| format!("failed to write backup for {identity}"))?;
        self.storage
            .put(identity, INFO_KEY, &serde_json::to_vec(&info)?)
            .with_context(|| format!("failed to write backup info for {identity}"))?;

        tracing::info!(identity, projects = info.project_count, "guest backup saved");
        Ok(info)
    }

    /// The stored snapshot, with every project migrated to the current schema.
    pub fn restore(&self, identity: &str) -> Result<Option<GuestBackup>> {
        let Some(raw) = self
            .storage
            .get(identity, SNAPSHOT_KEY)
            .with_context(|| format!("failed to read backup for {identity}"))?
        else {
            return Ok(None);
        };

        let mut backup: GuestBackup = serde_json::from_slice(&raw)?;
        let report = migrate_projects(std::mem::take(&mut backup.projects));
        for error in &report.errors {
            tracing::warn!(identity, error = %error, "backup project left unmigrated");
        }
        backup.projects = report.migrated;
        Ok(Some(backup))
    }

    pub fn has_backup(&self, identity: &str) -> Result<bool> {
        Ok(self.storage.get(identity, SNAPSHOT_KEY)?.is_some())
    }

    pub fn get_info(&self, identity: &str) -> Result<Option<BackupInfo>> {
        self.storage
            .get(identity, INFO_KEY)?
            .map(|raw| serde_json::from_slice(&raw).map_err(Into::into))
            .transpose()
    }

    pub fn clear(&mut self, identity: &str) -> Result<()> {
        self.storage.delete(identity, SNAPSHOT_KEY)?;
        self.storage.delete(identity, INFO_KEY)?;
        tracing::debug!(identity, "guest backup cleared");
        Ok(())
    }
}

/// Merges a restored backup into the projects already in memory.
///
/// Ids only in the backup are added. For ids on both sides the later
/// `last_modified` wins; on a tie the in-memory copy stays. Existing order is
/// kept, backup-only projects follow in backup order.
pub fn merge_with_backup(existing: &[Project], backup: &[Project]) -> Vec<Project> {
    let from_backup: HashMap<&str, &Project> = backup.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut merged: Vec<Project> = existing
        .iter()
        .map(|local| match from_backup.get(local.id.as_str()) {
            Some(saved) if saved.last_modified > local.last_modified => (*saved).clone(),
            _ => local.clone(),
        })
        .collect();

    let known: std::collections::HashSet<&str> = existing.iter().map(|p| p.id.as_str()).collect();
    merged.extend(backup.iter().filter(|p| !known.contains(p.id.as_str())).cloned());
    merged
}
