//! Lazy upgrade from the single-pattern schema to multi-chart projects.
//!
//! Migration is pure and deterministic: the same input always yields the same
//! output, so re-running it (or racing two background persists of it) is safe.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::model::{Chart, Project};
use crate::remote::RemoteStore;
use crate::rounds::{validate_rounds, ProjectRoundService};

pub const DEFAULT_CHART_NAME: &str = "Main Chart";

pub fn default_chart_id(project_id: &str) -> String {
    format!("{project_id}-chart-1")
}

pub fn is_legacy_project(project: &Project) -> bool {
    !project.pattern.is_empty() && project.charts().is_empty()
}

pub fn is_multi_chart_project(project: &Project) -> bool {
    !project.charts().is_empty()
}

/// Returns the multi-chart form of `project`.
///
/// The legacy pattern moves into a default chart which becomes current;
/// the legacy progress fields stay as a mirror. `last_modified` is left
/// alone so a migrated copy never looks newer than its source.
pub fn migrate_project_to_multi_chart(project: &Project) -> Project {
    if is_multi_chart_project(project) {
        return project.clone();
    }

    let mut migrated = project.clone();
    if is_legacy_project(project) {
        let mut chart = Chart::new(default_chart_id(&project.id), DEFAULT_CHART_NAME, project.created_date);
        chart.last_modified = project.last_modified;
        chart.rounds = std::mem::take(&mut migrated.pattern);
        chart.current_round = project.current_round;
        chart.current_stitch = project.current_stitch;
        chart.is_completed = project.is_completed;

        migrated.current_chart_id = Some(chart.id.clone());
        migrated.charts = Some(vec![chart]);
    } else if migrated.charts.is_none() {
        migrated.charts = Some(Vec::new());
    }
    migrated
}

/// Checks the invariants a migrated project must hold.
pub fn validate_project(project: &Project) -> Result<()> {
    let mut chart_ids = HashSet::new();
    for chart in project.charts() {
        if !chart_ids.insert(chart.id.as_str()) {
            return Err(Error::validation("chart", &chart.id, "duplicate chart id"));
        }
    }
    validate_rounds(&project.round_documents())
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// False when at least one project was left unmigrated.
    pub success: bool,
    /// Every input project, migrated where possible, in input order.
    pub migrated: Vec<Project>,
    pub errors: Vec<String>,
}

/// Best-effort batch migration. A project whose migrated form is invalid is
/// kept as it was and its error collected.
pub fn migrate_projects(projects: Vec<Project>) -> MigrationReport {
    let mut migrated = Vec::with_capacity(projects.len());
    let mut errors = Vec::new();

    for project in projects {
        let candidate = migrate_project_to_multi_chart(&project);
        match validate_project(&candidate) {
            Ok(()) => migrated.push(candidate),
            Err(e) => {
                errors.push(format!("project {}: {e}", project.id));
                migrated.push(project);
            }
        }
    }

    if !errors.is_empty() {
        tracing::warn!(failed = errors.len(), "some projects could not be migrated");
    }
    MigrationReport {
        success: errors.is_empty(),
        migrated,
        errors,
    }
}

/// A background persist of a migrated project that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub project_id: String,
    pub error: String,
}

/// Migrates projects on the read path and writes upgrades back in the background.
///
/// A background persist only lands while the remote root is still the
/// unmigrated copy it was derived from. Writers that share the engine take
/// [`MigrationEngine::lock_writes`] so the check and the write of a persist
/// never interleave with theirs.
pub struct MigrationEngine<R: RemoteStore + 'static> {
    remote: Arc<R>,
    service: ProjectRoundService<R>,
    failures: mpsc::UnboundedSender<MigrationFailure>,
    writes: Arc<Mutex<()>>,
}

impl<R: RemoteStore + 'static> MigrationEngine<R> {
    pub fn new(remote: Arc<R>) -> (Self, mpsc::UnboundedReceiver<MigrationFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let engine = Self {
            service: ProjectRoundService::new(Arc::clone(&remote)),
            remote,
            failures,
            writes: Arc::new(Mutex::new(())),
        };
        (engine, rx)
    }

    /// Returns the migrated project immediately. If migration changed
    /// anything, the upgrade is persisted by a detached task; the caller
    /// never waits on it.
    pub fn migrate_for_read(&self, user_id: &str, project: Project) -> Project {
        let migrated = migrate_project_to_multi_chart(&project);
        if migrated == project {
            return migrated;
        }
        if let Err(e) = validate_project(&migrated) {
            tracing::warn!(project_id = %project.id, error = %e, "migrated project is invalid, serving original");
            return project;
        }

        tracing::info!(project_id = %project.id, "migrated project to multi-chart");
        self.persist_in_background(user_id, migrated.clone());
        migrated
    }

    /// Held for the duration of a write to projects this engine may persist.
    pub async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.writes).lock_owned().await
    }

    pub fn migrate_all_for_read(&self, user_id: &str, projects: Vec<Project>) -> Vec<Project> {
        projects
            .into_iter()
            .map(|p| self.migrate_for_read(user_id, p))
            .collect()
    }

    fn persist_in_background(&self, user_id: &str, project: Project) {
        let failures = self.failures.clone();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let _ = failures.send(MigrationFailure {
                    project_id: project.id,
                    error: e.to_string(),
                });
                return;
            }
        };

        let remote = Arc::clone(&self.remote);
        let service = self.service.clone();
        let writes = Arc::clone(&self.writes);
        let user_id = user_id.to_string();
        handle.spawn(async move {
            let _writes = writes.lock_owned().await;
            let report = |error: String| {
                tracing::warn!(project_id = %project.id, %error, "failed to persist migration");
                let _ = failures.send(MigrationFailure {
                    project_id: project.id.clone(),
                    error,
                });
            };

            // migration keeps last_modified, so a matching unmigrated root is the source
            match remote.get_project(&user_id, &project.id).await {
                Ok(Some(root)) if root.last_modified == project.last_modified && !is_multi_chart_project(&root) => {}
                Ok(_) => {
                    tracing::debug!(project_id = %project.id, "remote changed since read, migration not persisted");
                    return;
                }
                Err(e) => return report(e.to_string()),
            }
            if let Err(e) = service.update_project_with_rounds(&user_id, &project, None).await {
                report(e.to_string());
            }
        });
    }
}
