use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sync_engine::{
    merge_with_backup, migrate_projects, ConflictStrategy, GuestBackupStore, MigrationFailure, NetworkProfile,
    Project, SqliteBackupStorage, SqliteRemote, SyncConfig, SyncController, SyncCoordinator, SyncOptions,
    SyncResult,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn read_projects(path: &Path) -> Result<Vec<Project>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn write_projects(out: Option<&Path>, projects: &[Project]) -> Result<()> {
    let json = serde_json::to_string_pretty(projects)?;
    match out {
        Some(path) => fs::write(path, json).with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn open_remote(path: &Path) -> Result<Arc<SqliteRemote>> {
    let remote = SqliteRemote::open(&path.to_string_lossy())
        .with_context(|| format!("opening remote store {}", path.display()))?;
    Ok(Arc::new(remote))
}

/// Waits for background migration writes; the receiver closes once the
/// coordinator and every spawned persist have dropped their senders.
async fn drain_migration_failures(mut failures: UnboundedReceiver<MigrationFailure>) {
    while let Some(failure) = failures.recv().await {
        tracing::warn!(project_id = %failure.project_id, error = %failure.error, "migration was not persisted");
    }
}

fn report(result: &SyncResult) {
    for conflict in &result.conflicts {
        match conflict.resolution {
            Some(side) => tracing::info!(
                project_id = %conflict.project_id,
                kind = ?conflict.conflict_type,
                kept = %side,
                "conflict resolved"
            ),
            None => tracing::warn!(
                project_id = %conflict.project_id,
                kind = ?conflict.conflict_type,
                "conflict needs manual resolution"
            ),
        }
    }
    for error in &result.errors {
        tracing::error!(%error, "sync error");
    }
}

pub async fn merge(
    config: &SyncConfig,
    user: &str,
    local: &Path,
    remote: &Path,
    strategy: ConflictStrategy,
    out: Option<&Path>,
) -> Result<()> {
    let projects = read_projects(local)?;
    let (coordinator, failures) = SyncCoordinator::new(open_remote(remote)?, config.clone());

    let result = coordinator
        .merge_local_and_remote(user, &projects, SyncOptions { strategy })
        .await;
    drop(coordinator);
    drain_migration_failures(failures).await;

    report(&result);
    write_projects(out, &result.merged)?;
    if !result.success {
        bail!("merge finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

pub async fn incremental(
    config: &SyncConfig,
    user: &str,
    local: &Path,
    remote: &Path,
    since: DateTime<Utc>,
    out: Option<&Path>,
) -> Result<()> {
    let projects = read_projects(local)?;
    let (coordinator, failures) = SyncCoordinator::new(open_remote(remote)?, config.clone());

    let result = coordinator.perform_incremental_sync(user, since, &projects).await;
    drop(coordinator);
    drain_migration_failures(failures).await;

    report(&result);
    write_projects(out, &result.merged)?;
    if !result.success {
        bail!("incremental sync finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

pub async fn push(config: &SyncConfig, profile: NetworkProfile, user: &str, local: &Path, remote: &Path) -> Result<()> {
    let projects = read_projects(local)?;
    let controller = SyncController::new(open_remote(remote)?, config.connectivity.clone(), profile);

    let mut failed = Vec::new();
    for project in &projects {
        let outcome = controller
            .sync_project_with_retry(user, project, config.retry.max_retries, |status| {
                tracing::warn!(
                    project_id = %project.id,
                    retry = status.retry,
                    delay_ms = status.delay.as_millis() as u64,
                    "retrying: {}",
                    status.error
                );
            })
            .await;
        if !outcome.success {
            failed.push(project.id.clone());
        }
    }

    if !failed.is_empty() {
        bail!("{} ({} project(s) not synced: {})", controller.profile().failure_message, failed.len(), failed.join(", "));
    }
    tracing::info!(projects = projects.len(), "all projects pushed");
    Ok(())
}

pub fn migrate(input: &Path, out: Option<&Path>) -> Result<()> {
    let report = migrate_projects(read_projects(input)?);
    for error in &report.errors {
        tracing::warn!(%error, "left unmigrated");
    }
    write_projects(out, &report.migrated)
}

pub fn backup(identity: &str, local: &Path, store: &Path, current: Option<&str>) -> Result<()> {
    let projects = read_projects(local)?;
    let current = match current {
        Some(id) => Some(
            projects
                .iter()
                .find(|p| p.id == id)
                .with_context(|| format!("current project {id} is not in {}", local.display()))?,
        ),
        None => None,
    };

    let storage = SqliteBackupStorage::open(&store.to_string_lossy())?;
    let info = GuestBackupStore::new(storage).backup(&projects, current, identity)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

pub fn restore(identity: &str, store: &Path, merge_into: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let storage = SqliteBackupStorage::open(&store.to_string_lossy())?;
    let Some(backup) = GuestBackupStore::new(storage).restore(identity)? else {
        bail!("no backup for {identity}");
    };

    let projects = match merge_into {
        Some(path) => merge_with_backup(&read_projects(path)?, &backup.projects),
        None => backup.projects,
    };
    write_projects(out, &projects)
}
