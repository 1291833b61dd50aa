//! Local/remote reconciliation.
//!
//! The coordinator is the only component that decides push vs. pull for a
//! whole project. Conflict detection is timestamp proximity: two edits less
//! than `conflict.threshold_ms` apart are treated as concurrent. There are no
//! server sequence numbers or vector clocks behind it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{Error, Result, ResultExt};
use crate::gate::{GateBlock, SyncGate};
use crate::migration::{migrate_projects, MigrationEngine, MigrationFailure};
use crate::model::{advance, now, Project, Timestamp};
use crate::remote::{ProjectSubscription, RemoteStore};
use crate::rounds::{ProjectRoundService, RoundSyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    LocalNewer,
    RemoteNewer,
    BothModified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    /// Leave the local copy in place and hand the conflict to the caller.
    ManualResolve,
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" => Ok(ConflictStrategy::RemoteWins),
            "newest-wins" => Ok(ConflictStrategy::NewestWins),
            "manual" | "manual-resolve" => Ok(ConflictStrategy::ManualResolve),
            other => Err(Error::Config(format!("unknown conflict strategy '{other}'"))),
        }
    }
}

/// Which copy a resolved conflict kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    pub project_id: String,
    pub local: Project,
    pub remote: Project,
    pub conflict_type: ConflictType,
    /// `None` when left for the user.
    pub resolution: Option<Side>,
}

/// An explicit decision for a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Local,
    Remote,
    Custom(Project),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub strategy: ConflictStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub merged: Vec<Project>,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<String>,
    /// Ids written to the remote.
    pub pushed: Vec<String>,
    /// Ids taken from the remote.
    pub pulled: Vec<String>,
}

impl SyncResult {
    fn failed(local: &[Project], error: String) -> Self {
        Self {
            success: false,
            merged: local.to_vec(),
            errors: vec![error],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Created,
    Updated(RoundSyncReport),
    SkippedRemoteNewer(Box<Project>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotDecision {
    Applied(Vec<Project>),
    Deferred(GateBlock),
}

pub fn classify_conflict(local: &Project, remote: &Project, threshold_ms: u64) -> ConflictType {
    let diff = local.last_modified_millis() - remote.last_modified_millis();
    if diff.unsigned_abs() < threshold_ms {
        ConflictType::BothModified
    } else if diff > 0 {
        ConflictType::LocalNewer
    } else {
        ConflictType::RemoteNewer
    }
}

/// Strictly newer local wins; equal timestamps go to the remote copy.
pub fn newest(local: &Project, remote: &Project) -> Side {
    if local.last_modified > remote.last_modified {
        Side::Local
    } else {
        Side::Remote
    }
}

/// Local inputs get the same upgrade as remote reads, best-effort.
fn migrate_local(projects: &[Project]) -> Vec<Project> {
    let report = migrate_projects(projects.to_vec());
    for error in &report.errors {
        tracing::warn!(%error, "local project left unmigrated");
    }
    report.migrated
}

/// Equal apart from the modification time.
fn same_content(a: &Project, b: &Project) -> bool {
    if a.last_modified == b.last_modified {
        return a == b;
    }
    let mut b = b.clone();
    b.last_modified = a.last_modified;
    *a == b
}

pub struct SyncCoordinator<R: RemoteStore + 'static> {
    remote: Arc<R>,
    service: ProjectRoundService<R>,
    migration: MigrationEngine<R>,
    gate: SyncGate,
    config: SyncConfig,
}

impl<R: RemoteStore + 'static> SyncCoordinator<R> {
    /// The receiver reports background migration writes that failed.
    pub fn new(remote: Arc<R>, config: SyncConfig) -> (Self, mpsc::UnboundedReceiver<MigrationFailure>) {
        let (migration, failures) = MigrationEngine::new(Arc::clone(&remote));
        let coordinator = Self {
            service: ProjectRoundService::new(Arc::clone(&remote)),
            remote,
            migration,
            gate: SyncGate::new(config.gate.clone()),
            config,
        };
        (coordinator, failures)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn rounds(&self) -> &ProjectRoundService<R> {
        &self.service
    }

    pub fn subscribe(&self, user_id: &str) -> ProjectSubscription {
        self.remote.subscribe_to_user_projects(user_id)
    }

    fn threshold(&self) -> u64 {
        self.config.conflict.threshold_ms
    }

    fn finish(&self, result: &SyncResult) {
        if result.success {
            self.gate.record_sync_completed(Instant::now());
        } else if let Some(e) = result.errors.first() {
            self.gate.set_error(e.clone());
        }
    }

    /// Full two-way merge of every project of `user_id`.
    pub async fn merge_local_and_remote(
        &self,
        user_id: &str,
        local_projects: &[Project],
        options: SyncOptions,
    ) -> SyncResult {
        let remote = match self.service.get_user_projects_with_rounds(user_id).await {
            Ok(projects) => self.migration.migrate_all_for_read(user_id, projects),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "could not read remote projects");
                let result = SyncResult::failed(local_projects, e.to_string());
                self.finish(&result);
                return result;
            }
        };
        let remote_by_id: HashMap<&str, &Project> = remote.iter().map(|p| (p.id.as_str(), p)).collect();
        let local_projects = migrate_local(local_projects);

        let mut result = SyncResult::default();
        for local in &local_projects {
            let Some(remote) = remote_by_id.get(local.id.as_str()) else {
                match self.push_new(user_id, local).await {
                    Ok(()) => result.pushed.push(local.id.clone()),
                    Err(e) => result.errors.push(format!("project {}: {e}", local.id)),
                }
                result.merged.push(local.clone());
                continue;
            };

            if same_content(local, remote) {
                result.merged.push(local.clone());
                continue;
            }

            let (kept, conflict) = self.resolve_pair(user_id, local, remote, options.strategy).await;
            if let Some(conflict) = conflict {
                match conflict.resolution {
                    Some(Side::Local) => result.pushed.push(local.id.clone()),
                    Some(Side::Remote) => result.pulled.push(local.id.clone()),
                    None => {}
                }
                result.conflicts.push(conflict);
            }
            result.merged.push(kept);
        }

        let local_ids: HashSet<&str> = local_projects.iter().map(|p| p.id.as_str()).collect();
        for project in remote.iter().filter(|p| !local_ids.contains(p.id.as_str())) {
            tracing::debug!(project_id = %project.id, "adopting remote-only project");
            result.pulled.push(project.id.clone());
            result.merged.push(project.clone());
        }

        result.success = result.errors.is_empty();
        tracing::info!(
            user_id,
            merged = result.merged.len(),
            conflicts = result.conflicts.len(),
            pushed = result.pushed.len(),
            pulled = result.pulled.len(),
            errors = result.errors.len(),
            "merge finished"
        );
        self.finish(&result);
        result
    }

    /// Returns the copy to keep and the conflict to report, if any.
    async fn resolve_pair(
        &self,
        user_id: &str,
        local: &Project,
        remote: &Project,
        strategy: ConflictStrategy,
    ) -> (Project, Option<SyncConflict>) {
        let conflict_type = classify_conflict(local, remote, self.threshold());
        let mut conflict = SyncConflict {
            project_id: local.id.clone(),
            local: local.clone(),
            remote: remote.clone(),
            conflict_type,
            resolution: None,
        };

        let side = match strategy {
            ConflictStrategy::LocalWins => Side::Local,
            ConflictStrategy::RemoteWins => Side::Remote,
            ConflictStrategy::NewestWins => newest(local, remote),
            ConflictStrategy::ManualResolve => {
                tracing::debug!(project_id = %local.id, ?conflict_type, "conflict left for manual resolution");
                return (local.clone(), Some(conflict));
            }
        };

        match side {
            Side::Remote => {
                tracing::debug!(project_id = %local.id, ?conflict_type, "taking remote copy");
                conflict.resolution = Some(Side::Remote);
                (remote.clone(), Some(conflict))
            }
            Side::Local => match self.write_existing(user_id, local, None).await {
                Ok(_) => {
                    tracing::debug!(project_id = %local.id, ?conflict_type, "pushed local copy");
                    conflict.resolution = Some(Side::Local);
                    (local.clone(), Some(conflict))
                }
                Err(e) => {
                    tracing::warn!(project_id = %local.id, error = %e, "could not push winning local copy, dropping conflict");
                    (local.clone(), None)
                }
            },
        }
    }

    async fn push_new(&self, user_id: &str, project: &Project) -> Result<()> {
        let _write = self.gate.begin_local_write();
        let _persist = self.migration.lock_writes().await;
        tracing::debug!(project_id = %project.id, "pushing local-only project");
        self.service.create_project_with_rounds(user_id, project).await
    }

    async fn write_existing(
        &self,
        user_id: &str,
        project: &Project,
        modified_round_ids: Option<&[String]>,
    ) -> Result<RoundSyncReport> {
        let _write = self.gate.begin_local_write();
        let _persist = self.migration.lock_writes().await;
        self.service
            .update_project_with_rounds(user_id, project, modified_round_ids)
            .await
    }

    /// Applies an explicit decision. The kept copy is stamped newer than both
    /// sides so that it wins every later merge, then persisted.
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        conflict: &SyncConflict,
        resolution: Resolution,
    ) -> Result<Project> {
        let mut chosen = match resolution {
            Resolution::Local => conflict.local.clone(),
            Resolution::Remote => conflict.remote.clone(),
            Resolution::Custom(project) => project,
        };
        if chosen.id != conflict.project_id {
            return Err(Error::validation(
                "project",
                &chosen.id,
                format!("resolution does not match conflict on {}", conflict.project_id),
            ));
        }

        let floor = conflict
            .local
            .last_modified
            .max(conflict.remote.last_modified)
            .max(chosen.last_modified);
        chosen.last_modified = advance(floor, now());

        let _write = self.gate.begin_local_write();
        let _persist = self.migration.lock_writes().await;
        self.service
            .save_project(user_id, &chosen)
            .await
            .with_context(|| format!("failed to persist resolution for {}", chosen.id))?;
        tracing::info!(project_id = %chosen.id, "conflict resolved");
        Ok(chosen)
    }

    /// Pushes one project unless the remote holds a strictly newer copy.
    pub async fn sync_project_changes(&self, user_id: &str, project: &Project) -> Result<SyncOutcome> {
        self.push_changes(user_id, project, None).await
    }

    /// Like [`Self::sync_project_changes`], writing only the listed rounds.
    pub async fn sync_round_changes(
        &self,
        user_id: &str,
        project: &Project,
        modified_round_ids: &[String],
    ) -> Result<SyncOutcome> {
        self.push_changes(user_id, project, Some(modified_round_ids)).await
    }

    async fn push_changes(
        &self,
        user_id: &str,
        project: &Project,
        modified_round_ids: Option<&[String]>,
    ) -> Result<SyncOutcome> {
        let remote_root = self
            .remote
            .get_project(user_id, &project.id)
            .await
            .with_context(|| format!("failed to read project {}", project.id))?;

        let outcome = match remote_root {
            Some(root) if root.last_modified > project.last_modified => {
                let rounds = self
                    .remote
                    .get_project_rounds(user_id, &project.id)
                    .await
                    .with_context(|| format!("failed to read rounds of project {}", project.id))?;
                let remote = self
                    .migration
                    .migrate_for_read(user_id, Project::from_documents(root, rounds));
                tracing::debug!(project_id = %project.id, "remote is newer, skipping push");
                SyncOutcome::SkippedRemoteNewer(Box::new(remote))
            }
            Some(_) => SyncOutcome::Updated(self.write_existing(user_id, project, modified_round_ids).await?),
            None => {
                self.push_new(user_id, project).await?;
                SyncOutcome::Created
            }
        };
        Ok(outcome)
    }

    pub async fn delete_project(&self, user_id: &str, project_id: &str) -> Result<()> {
        let _write = self.gate.begin_local_write();
        let _persist = self.migration.lock_writes().await;
        self.service.delete_project_with_rounds(user_id, project_id).await
    }

    /// Remote projects modified after `since`, rounds attached and migrated.
    async fn fetch_changed_since(&self, user_id: &str, since: Timestamp) -> Result<Vec<Project>> {
        let roots = self
            .remote
            .get_user_projects(user_id)
            .await
            .with_context(|| format!("failed to read projects of user {user_id}"))?;

        let mut changed = Vec::new();
        for root in roots.into_iter().filter(|p| p.last_modified > since) {
            let rounds = self
                .remote
                .get_project_rounds(user_id, &root.id)
                .await
                .with_context(|| format!("failed to read rounds of project {}", root.id))?;
            changed.push(
                self.migration
                    .migrate_for_read(user_id, Project::from_documents(root, rounds)),
            );
        }
        Ok(changed)
    }

    /// Pulls only what changed remotely since `last_sync_time`. Local
    /// projects the remote did not touch are left as they are.
    pub async fn perform_incremental_sync(
        &self,
        user_id: &str,
        last_sync_time: Timestamp,
        local_projects: &[Project],
    ) -> SyncResult {
        let changed = match self.fetch_changed_since(user_id, last_sync_time).await {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "incremental sync could not read remote");
                let result = SyncResult::failed(local_projects, e.to_string());
                self.finish(&result);
                return result;
            }
        };

        let mut result = SyncResult {
            merged: migrate_local(local_projects),
            ..SyncResult::default()
        };
        for remote in changed {
            let Some(i) = result.merged.iter().position(|p| p.id == remote.id) else {
                result.pulled.push(remote.id.clone());
                result.merged.push(remote);
                continue;
            };
            let local = result.merged[i].clone();
            if same_content(&local, &remote) {
                continue;
            }

            let conflict_type = classify_conflict(&local, &remote, self.threshold());
            let side = match conflict_type {
                ConflictType::LocalNewer => Side::Local,
                ConflictType::RemoteNewer => Side::Remote,
                ConflictType::BothModified => newest(&local, &remote),
            };

            let applied = match side {
                Side::Remote => {
                    result.pulled.push(remote.id.clone());
                    result.merged[i] = remote.clone();
                    Some(Side::Remote)
                }
                Side::Local => match self.write_existing(user_id, &local, None).await {
                    Ok(_) => {
                        result.pushed.push(local.id.clone());
                        Some(Side::Local)
                    }
                    Err(e) if conflict_type == ConflictType::LocalNewer => {
                        result.errors.push(format!("project {}: {e}", local.id));
                        None
                    }
                    Err(e) => {
                        tracing::warn!(project_id = %local.id, error = %e, "could not push winning local copy, dropping conflict");
                        None
                    }
                },
            };

            if conflict_type == ConflictType::BothModified && applied.is_some() {
                result.conflicts.push(SyncConflict {
                    project_id: local.id.clone(),
                    local,
                    remote,
                    conflict_type,
                    resolution: applied,
                });
            }
        }

        result.success = result.errors.is_empty();
        tracing::info!(
            user_id,
            since = %last_sync_time,
            pushed = result.pushed.len(),
            pulled = result.pulled.len(),
            conflicts = result.conflicts.len(),
            "incremental sync finished"
        );
        self.finish(&result);
        result
    }

    /// Merges a pushed remote snapshot into `local`, unless the gate says the
    /// snapshot may be older than what the user just did.
    pub fn apply_remote_snapshot(&self, user_id: &str, local: &[Project], snapshot: Vec<Project>) -> SnapshotDecision {
        if let Some(block) = self.gate.check(Instant::now()) {
            tracing::warn!(user_id, reason = %block, "deferring remote snapshot");
            return SnapshotDecision::Deferred(block);
        }

        let mut incoming: Vec<Project> = self.migration.migrate_all_for_read(user_id, snapshot);
        let mut merged: Vec<Project> = local
            .iter()
            .map(|mine| match incoming.iter().position(|p| p.id == mine.id) {
                Some(j) => {
                    let theirs = incoming.remove(j);
                    if theirs.last_modified > mine.last_modified {
                        theirs
                    } else {
                        mine.clone()
                    }
                }
                None => mine.clone(),
            })
            .collect();
        merged.extend(incoming);
        SnapshotDecision::Applied(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{from_millis, Chart, Round};
    use crate::remote::{Fault, MemoryRemote, RemoteOp};
    use pretty_assertions::assert_eq;

    fn project(id: &str, name: &str, ts: i64) -> Project {
        let mut p = Project::new(id, name);
        p.created_date = from_millis(0);
        p.last_modified = from_millis(ts);
        let mut chart = Chart::new(format!("{id}-c1"), "Body", from_millis(0));
        chart.rounds = vec![Round::new(format!("{id}-r1"), 1), Round::new(format!("{id}-r2"), 2)];
        p.current_chart_id = Some(chart.id.clone());
        p.charts = Some(vec![chart]);
        p
    }

    fn setup() -> (Arc<MemoryRemote>, SyncCoordinator<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let (coordinator, _failures) = SyncCoordinator::new(Arc::clone(&remote), SyncConfig::default());
        (remote, coordinator)
    }

    fn newest_wins() -> SyncOptions {
        SyncOptions::default()
    }

    fn names(projects: &[Project]) -> Vec<(&str, &str)> {
        projects.iter().map(|p| (p.id.as_str(), p.name.as_str())).collect()
    }

    #[test]
    fn test_classify_conflict() {
        let local = project("p1", "a", 1_000);
        assert_eq!(classify_conflict(&local, &project("p1", "b", 3_000), 1_000), ConflictType::RemoteNewer);
        assert_eq!(classify_conflict(&local, &project("p1", "b", 1_500), 1_000), ConflictType::BothModified);
        assert_eq!(classify_conflict(&local, &project("p1", "b", 0), 1_000), ConflictType::LocalNewer);
        assert_eq!(newest(&local, &project("p1", "b", 1_000)), Side::Remote, "ties go to remote");
    }

    #[tokio::test]
    async fn test_remote_newer_is_adopted_without_write() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 3_000));
        remote.clear_calls();

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 1_000)], newest_wins())
            .await;

        assert!(result.success);
        assert_eq!(names(&result.merged), vec![("p1", "remote")]);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::RemoteNewer);
        assert_eq!(result.conflicts[0].resolution, Some(Side::Remote));
        assert_eq!(remote.count(RemoteOp::UpdateProject), 0);
    }

    #[tokio::test]
    async fn test_close_timestamps_are_both_modified() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_500));

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 1_000)], newest_wins())
            .await;

        assert_eq!(result.conflicts[0].conflict_type, ConflictType::BothModified);
        assert_eq!(names(&result.merged), vec![("p1", "remote")]);
    }

    #[tokio::test]
    async fn test_both_modified_with_local_ahead_pushes_local() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_000));

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 1_500)], newest_wins())
            .await;

        assert!(result.success);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::BothModified);
        assert_eq!(result.conflicts[0].resolution, Some(Side::Local));
        assert_eq!(result.pushed, vec!["p1"]);
        assert_eq!(names(&result.merged), vec![("p1", "local")]);
        assert_eq!(remote.stored_project("u1", "p1").unwrap().name, "local");
    }

    #[tokio::test]
    async fn test_pushed_local_survives_background_migration_of_remote() {
        let (remote, coordinator) = setup();
        let mut legacy = Project::new("p1", "remote");
        legacy.charts = None;
        legacy.pattern = vec![Round::new("p1-r1", 1)];
        legacy.last_modified = from_millis(1_000);
        remote.seed_project("u1", &legacy);

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 5_000)], newest_wins())
            .await;
        assert_eq!(result.pushed, vec!["p1"]);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let stored = remote.stored_project("u1", "p1").unwrap();
        assert_eq!(stored.name, "local");
        assert_eq!(stored.last_modified, from_millis(5_000));
        let mut rounds = remote.stored_round_ids("u1", "p1");
        rounds.sort();
        assert_eq!(rounds, vec!["p1-r1", "p1-r2"]);
    }

    #[tokio::test]
    async fn test_legacy_local_project_is_pushed_migrated() {
        let (remote, coordinator) = setup();
        let mut legacy = Project::new("p1", "Mittens");
        legacy.charts = None;
        legacy.pattern = vec![Round::new("p1-r1", 1)];

        let result = coordinator
            .merge_local_and_remote("u1", &[legacy], newest_wins())
            .await;

        assert_eq!(result.pushed, vec!["p1"]);
        assert!(crate::migration::is_multi_chart_project(&result.merged[0]));
        let stored = remote.stored_project("u1", "p1").unwrap();
        assert_eq!(stored.current_chart_id.as_deref(), Some("p1-chart-1"));
        assert_eq!(remote.stored_round_ids("u1", "p1"), vec!["p1-r1"]);
    }

    #[tokio::test]
    async fn test_local_winner_is_written_back() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_000));

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 5_000)], newest_wins())
            .await;

        assert_eq!(result.conflicts[0].conflict_type, ConflictType::LocalNewer);
        assert_eq!(result.conflicts[0].resolution, Some(Side::Local));
        assert_eq!(result.pushed, vec!["p1"]);
        assert_eq!(remote.stored_project("u1", "p1").unwrap().name, "local");
    }

    #[tokio::test]
    async fn test_failed_write_back_drops_conflict_and_keeps_local() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_000));
        remote.inject(Fault::network("unavailable").on(&[RemoteOp::UpdateProject]));

        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 5_000)], newest_wins())
            .await;

        assert!(result.success);
        assert!(result.conflicts.is_empty());
        assert_eq!(names(&result.merged), vec![("p1", "local")]);
    }

    #[tokio::test]
    async fn test_manual_resolve_keeps_local_and_reports() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_200));
        remote.clear_calls();

        let options = SyncOptions {
            strategy: ConflictStrategy::ManualResolve,
        };
        let result = coordinator
            .merge_local_and_remote("u1", &[project("p1", "local", 1_000)], options)
            .await;

        assert_eq!(names(&result.merged), vec![("p1", "local")]);
        assert_eq!(result.conflicts[0].resolution, None);
        assert_eq!(remote.round_writes() + remote.count(RemoteOp::UpdateProject), 0);

        let resolved = coordinator
            .resolve_conflict("u1", &result.conflicts[0], Resolution::Remote)
            .await
            .unwrap();
        assert_eq!(resolved.name, "remote");
        assert!(resolved.last_modified > from_millis(1_200));
        assert_eq!(remote.stored_project("u1", "p1").unwrap().last_modified, resolved.last_modified);
    }

    #[tokio::test]
    async fn test_strategies_override_timestamps() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 9_000));

        let result = coordinator
            .merge_local_and_remote(
                "u1",
                &[project("p1", "local", 1_000)],
                SyncOptions {
                    strategy: ConflictStrategy::LocalWins,
                },
            )
            .await;
        assert_eq!(names(&result.merged), vec![("p1", "local")]);
        assert_eq!(remote.stored_project("u1", "p1").unwrap().name, "local");
    }

    #[tokio::test]
    async fn test_custom_resolution_beats_both_sides() {
        let (remote, coordinator) = setup();
        let conflict = SyncConflict {
            project_id: "p1".into(),
            local: project("p1", "local", 1_000),
            remote: project("p1", "remote", 1_400),
            conflict_type: ConflictType::BothModified,
            resolution: None,
        };
        let custom = project("p1", "merged by hand", 0);

        let saved = coordinator
            .resolve_conflict("u1", &conflict, Resolution::Custom(custom))
            .await
            .unwrap();
        assert!(saved.last_modified > from_millis(1_400));
        assert_eq!(remote.stored_project("u1", "p1").unwrap().name, "merged by hand");

        let wrong = Resolution::Custom(project("p2", "other", 0));
        assert!(coordinator.resolve_conflict("u1", &conflict, wrong).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_equal_content_is_in_sync() {
        let (remote, coordinator) = setup();
        let p = project("p1", "same", 1_000);
        remote.seed_project("u1", &p);

        let mut local = p.clone();
        local.last_modified = from_millis(1_300);
        let result = coordinator.merge_local_and_remote("u1", &[local], newest_wins()).await;

        assert!(result.conflicts.is_empty());
        assert!(result.pushed.is_empty() && result.pulled.is_empty());
    }

    #[tokio::test]
    async fn test_local_only_pushed_and_remote_only_adopted_in_order() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("r-only", "from remote", 1_000));

        let local = vec![project("b", "B", 1_000), project("a", "A", 1_000)];
        let result = coordinator.merge_local_and_remote("u1", &local, newest_wins()).await;

        assert_eq!(
            names(&result.merged),
            vec![("b", "B"), ("a", "A"), ("r-only", "from remote")]
        );
        assert_eq!(result.pushed, vec!["b", "a"]);
        assert_eq!(result.pulled, vec!["r-only"]);
        assert_eq!(remote.stored_round_ids("u1", "a"), vec!["a-r1", "a-r2"]);
    }

    #[tokio::test]
    async fn test_push_failure_is_isolated() {
        let (remote, coordinator) = setup();
        remote.inject(Fault::permission("denied").on(&[RemoteOp::CreateProject]).times(1));

        let local = vec![project("a", "A", 1_000), project("b", "B", 1_000)];
        let result = coordinator.merge_local_and_remote("u1", &local, newest_wins()).await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("project a:"));
        assert_eq!(result.merged.len(), 2);
        assert_eq!(result.pushed, vec!["b"]);
        assert_eq!(coordinator.gate().error_pending().as_deref(), Some(result.errors[0].as_str()));
    }

    #[tokio::test]
    async fn test_remote_read_failure_returns_local_unchanged() {
        let (remote, coordinator) = setup();
        remote.set_online(false);

        let local = vec![project("a", "A", 1_000)];
        let result = coordinator.merge_local_and_remote("u1", &local, newest_wins()).await;

        assert!(!result.success);
        assert_eq!(result.merged, local);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_project_changes_outcomes() {
        let (remote, coordinator) = setup();
        let mut p = project("p1", "v1", 1_000);

        assert_eq!(coordinator.sync_project_changes("u1", &p).await.unwrap(), SyncOutcome::Created);

        p.name = "v2".into();
        p.last_modified = from_millis(2_000);
        assert!(matches!(
            coordinator.sync_project_changes("u1", &p).await.unwrap(),
            SyncOutcome::Updated(_)
        ));

        let stale = project("p1", "stale", 1_500);
        match coordinator.sync_project_changes("u1", &stale).await.unwrap() {
            SyncOutcome::SkippedRemoteNewer(remote_copy) => {
                assert_eq!(remote_copy.name, "v2");
                assert_eq!(remote_copy.charts()[0].rounds.len(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(remote.stored_project("u1", "p1").unwrap().name, "v2");
    }

    #[tokio::test]
    async fn test_sync_round_changes_writes_only_hinted_rounds() {
        let (remote, coordinator) = setup();
        let mut p = project("p1", "v1", 1_000);
        remote.seed_project("u1", &p);
        remote.clear_calls();

        for round in p.current_chart_mut().unwrap().rounds.iter_mut() {
            round.notes = Some("edited".into());
        }
        p.last_modified = from_millis(2_000);
        coordinator
            .sync_round_changes("u1", &p, &["p1-r2".to_string()])
            .await
            .unwrap();

        assert_eq!(remote.round_writes(), 1);
    }

    #[tokio::test]
    async fn test_incremental_sync_only_pulls_recent_changes() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("old", "old remote", 1_000));
        remote.seed_project("u1", &project("new", "new remote", 9_000));
        remote.seed_project("u1", &project("mine", "remote mine", 6_000));

        let local = vec![project("old", "old local", 500), project("mine", "local mine", 8_000)];
        let result = coordinator
            .perform_incremental_sync("u1", from_millis(5_000), &local)
            .await;

        assert!(result.success);
        assert_eq!(
            names(&result.merged),
            vec![("old", "old local"), ("mine", "local mine"), ("new", "new remote")]
        );
        assert_eq!(result.pushed, vec!["mine"]);
        assert_eq!(result.pulled, vec!["new"]);
        assert_eq!(remote.stored_project("u1", "mine").unwrap().name, "local mine");
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_both_modified_is_reported() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 6_200));

        let result = coordinator
            .perform_incremental_sync("u1", from_millis(5_000), &[project("p1", "local", 6_000)])
            .await;

        assert_eq!(names(&result.merged), vec![("p1", "remote")]);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].resolution, Some(Side::Remote));
    }

    #[tokio::test]
    async fn test_snapshot_deferred_right_after_sync() {
        let (remote, coordinator) = setup();
        remote.seed_project("u1", &project("p1", "remote", 1_000));
        coordinator.merge_local_and_remote("u1", &[], newest_wins()).await;

        let decision = coordinator.apply_remote_snapshot("u1", &[], vec![project("p1", "remote", 1_000)]);
        assert!(matches!(decision, SnapshotDecision::Deferred(GateBlock::RecentSync { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_applied_keeps_newer_and_local_only() {
        let (_remote, coordinator) = setup();
        let local = vec![project("a", "local a", 5_000), project("b", "local b", 1_000)];
        let snapshot = vec![project("a", "remote a", 1_000), project("b", "remote b", 2_000), project("c", "remote c", 1)];

        match coordinator.apply_remote_snapshot("u1", &local, snapshot) {
            SnapshotDecision::Applied(merged) => assert_eq!(
                names(&merged),
                vec![("a", "local a"), ("b", "remote b"), ("c", "remote c")]
            ),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("newest-wins".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::NewestWins);
        assert_eq!("manual".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::ManualResolve);
        assert!("coin-flip".parse::<ConflictStrategy>().is_err());
    }
}
