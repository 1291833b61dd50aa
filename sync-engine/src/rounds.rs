//! Project/round persistence and the round differ.
//!
//! A project is two kinds of remote documents: the root and one sub-document
//! per round. Writes are ordered so that a crash never leaves a round
//! without its project: updates write rounds before the root, deletes remove
//! rounds before the root. Nothing here is transactional.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;

use crate::error::{Error, Result, ResultExt};
use crate::model::{Project, Round, RoundDoc};
use crate::remote::RemoteStore;

/// Rejects a malformed round before anything is written.
pub fn validate_round(round: &Round) -> Result<()> {
    if round.id.trim().is_empty() {
        return Err(Error::validation("round", "", "round id is empty"));
    }
    if round.round_number < 1 {
        return Err(Error::validation(
            "round",
            &round.id,
            format!("invalid round number {}", round.round_number),
        ));
    }
    Ok(())
}

/// Validates a raw round document as written by any client. Stitch
/// collections must be arrays when present.
pub fn validate_round_document(value: &serde_json::Value) -> Result<()> {
    let id = value.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    if id.trim().is_empty() {
        return Err(Error::validation("round", "", "round id is missing"));
    }
    match value.get("roundNumber").and_then(|v| v.as_i64()) {
        Some(n) if n >= 1 => {}
        _ => {
            return Err(Error::validation(
                "round",
                id,
                "round number is missing or invalid",
            ))
        }
    }
    for field in ["stitches", "stitchGroups", "patternItems"] {
        if let Some(v) = value.get(field) {
            if !v.is_array() {
                return Err(Error::validation("round", id, format!("{field} is not an array")));
            }
        }
    }
    Ok(())
}

/// Validates every round and checks ids are unique within the project.
pub fn validate_rounds(rounds: &[RoundDoc]) -> Result<()> {
    let mut seen = HashSet::new();
    for doc in rounds {
        validate_round(&doc.round)?;
        if !seen.insert(doc.id()) {
            return Err(Error::validation("round", doc.id(), "duplicate round id"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl RoundSyncReport {
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

pub struct ProjectRoundService<R: RemoteStore> {
    remote: Arc<R>,
}

impl<R: RemoteStore> Clone for ProjectRoundService<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
        }
    }
}

impl<R: RemoteStore> ProjectRoundService<R> {
    pub fn new(remote: Arc<R>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Brings the remote round collection in line with `local_rounds`.
    ///
    /// With `modified_round_ids`, only those rounds are written and the remote
    /// collection is never read: ids present locally are updated (or created
    /// if the remote has never seen them) and ids absent locally are deleted.
    /// Without it, the full remote id set is diffed against the local one.
    pub async fn sync_rounds(
        &self,
        user_id: &str,
        project_id: &str,
        local_rounds: &[RoundDoc],
        modified_round_ids: Option<&[String]>,
    ) -> Result<RoundSyncReport> {
        validate_rounds(local_rounds)?;

        let report = match modified_round_ids {
            Some(ids) => self.sync_modified(user_id, project_id, local_rounds, ids).await?,
            None => self.sync_full(user_id, project_id, local_rounds).await?,
        };

        tracing::debug!(
            project_id,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            "rounds synced"
        );
        Ok(report)
    }

    async fn sync_modified(
        &self,
        user_id: &str,
        project_id: &str,
        local_rounds: &[RoundDoc],
        ids: &[String],
    ) -> Result<RoundSyncReport> {
        let mut report = RoundSyncReport::default();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match local_rounds.iter().find(|r| r.id() == id) {
                Some(doc) => match self.remote.update_round(user_id, project_id, doc).await {
                    Ok(()) => report.updated.push(id.clone()),
                    Err(e) if e.is_not_found() => {
                        self.remote
                            .create_round(user_id, project_id, doc)
                            .await
                            .with_context(|| format!("failed to create round {id}"))?;
                        report.created.push(id.clone());
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("failed to update round {id}"));
                    }
                },
                None => {
                    self.remote
                        .delete_round(user_id, project_id, id)
                        .await
                        .with_context(|| format!("failed to delete round {id}"))?;
                    report.deleted.push(id.clone());
                }
            }
        }
        Ok(report)
    }

    async fn sync_full(&self, user_id: &str, project_id: &str, local_rounds: &[RoundDoc]) -> Result<RoundSyncReport> {
        let mut report = RoundSyncReport::default();

        let remote_ids: HashSet<String> = self
            .remote
            .get_project_round_ids(user_id, project_id)
            .await
            .with_context(|| format!("failed to read rounds of project {project_id}"))?
            .into_iter()
            .collect();
        let local_ids: HashSet<&str> = local_rounds.iter().map(|r| r.id()).collect();

        let mut stale: Vec<&String> = remote_ids.iter().filter(|id| !local_ids.contains(id.as_str())).collect();
        stale.sort();
        for id in stale {
            self.remote
                .delete_round(user_id, project_id, id)
                .await
                .with_context(|| format!("failed to delete round {id}"))?;
            report.deleted.push(id.clone());
        }

        for doc in local_rounds {
            let id = doc.id();
            if remote_ids.contains(id) {
                self.remote
                    .update_round(user_id, project_id, doc)
                    .await
                    .with_context(|| format!("failed to update round {id}"))?;
                report.updated.push(id.to_string());
            } else {
                self.remote
                    .create_round(user_id, project_id, doc)
                    .await
                    .with_context(|| format!("failed to create round {id}"))?;
                report.created.push(id.to_string());
            }
        }
        Ok(report)
    }

    /// Root first, then every round concurrently.
    pub async fn create_project_with_rounds(&self, user_id: &str, project: &Project) -> Result<()> {
        let rounds = project.round_documents();
        validate_rounds(&rounds)?;

        self.remote
            .create_project(user_id, project)
            .await
            .with_context(|| format!("failed to create project {}", project.id))?;

        try_join_all(rounds.iter().map(|doc| async move {
            self.remote
                .create_round(user_id, &project.id, doc)
                .await
                .with_context(|| format!("failed to create round {}", doc.id()))
        }))
        .await?;

        tracing::debug!(project_id = %project.id, rounds = rounds.len(), "project created");
        Ok(())
    }

    /// Rounds first, then the root.
    pub async fn update_project_with_rounds(
        &self,
        user_id: &str,
        project: &Project,
        modified_round_ids: Option<&[String]>,
    ) -> Result<RoundSyncReport> {
        let rounds = project.round_documents();
        let report = self
            .sync_rounds(user_id, &project.id, &rounds, modified_round_ids)
            .await
            .with_context(|| format!("failed to sync rounds of project {}", project.id))?;

        self.remote
            .update_project(user_id, project)
            .await
            .with_context(|| format!("failed to update project {}", project.id))?;
        Ok(report)
    }

    /// Creates the project if the remote has no root for it, otherwise updates.
    pub async fn save_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let exists = self
            .remote
            .get_project(user_id, &project.id)
            .await
            .with_context(|| format!("failed to read project {}", project.id))?
            .is_some();
        if exists {
            self.update_project_with_rounds(user_id, project, None).await?;
        } else {
            self.create_project_with_rounds(user_id, project).await?;
        }
        Ok(())
    }

    /// Rounds first, root last: an interrupted delete leaves at worst a
    /// childless root, never a parentless round.
    pub async fn delete_project_with_rounds(&self, user_id: &str, project_id: &str) -> Result<()> {
        let ids = self
            .remote
            .get_project_round_ids(user_id, project_id)
            .await
            .with_context(|| format!("failed to read rounds of project {project_id}"))?;

        for id in &ids {
            self.remote
                .delete_round(user_id, project_id, id)
                .await
                .with_context(|| format!("failed to delete round {id}"))?;
        }
        self.remote
            .delete_project(user_id, project_id)
            .await
            .with_context(|| format!("failed to delete project {project_id}"))?;

        tracing::debug!(project_id, rounds = ids.len(), "project deleted");
        Ok(())
    }

    pub async fn get_project_with_rounds(&self, user_id: &str, project_id: &str) -> Result<Option<Project>> {
        let root = self
            .remote
            .get_project(user_id, project_id)
            .await
            .with_context(|| format!("failed to read project {project_id}"))?;
        let Some(root) = root else {
            return Ok(None);
        };
        let rounds = self
            .remote
            .get_project_rounds(user_id, project_id)
            .await
            .with_context(|| format!("failed to read rounds of project {project_id}"))?;
        Ok(Some(Project::from_documents(root, rounds)))
    }

    pub async fn get_user_projects_with_rounds(&self, user_id: &str) -> Result<Vec<Project>> {
        let roots = self
            .remote
            .get_user_projects(user_id)
            .await
            .with_context(|| format!("failed to read projects of user {user_id}"))?;

        let mut projects = Vec::with_capacity(roots.len());
        for root in roots {
            let rounds = self
                .remote
                .get_project_rounds(user_id, &root.id)
                .await
                .with_context(|| format!("failed to read rounds of project {}", root.id))?;
            projects.push(Project::from_documents(root, rounds));
        }
        Ok(projects)
    }
}
