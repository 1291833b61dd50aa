mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::{Fault, MemoryRemote};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRemote;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{Project, RoundDoc};

/// The remote document store the engine syncs against.
///
/// Project documents are stored without round content (see
/// [`Project::root_document`]); rounds live in per-project sub-documents.
/// `update_round` on a missing round fails with [`crate::Error::NotFound`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_user_projects(&self, user_id: &str) -> Result<Vec<Project>>;
    async fn get_project(&self, user_id: &str, project_id: &str) -> Result<Option<Project>>;
    async fn create_project(&self, user_id: &str, project: &Project) -> Result<()>;
    async fn update_project(&self, user_id: &str, project: &Project) -> Result<()>;
    async fn delete_project(&self, user_id: &str, project_id: &str) -> Result<()>;

    /// Dropping the returned subscription unsubscribes.
    fn subscribe_to_user_projects(&self, user_id: &str) -> ProjectSubscription;

    async fn create_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()>;
    async fn update_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()>;
    async fn delete_round(&self, user_id: &str, project_id: &str, round_id: &str) -> Result<()>;
    async fn get_project_rounds(&self, user_id: &str, project_id: &str) -> Result<Vec<RoundDoc>>;

    async fn get_project_round_ids(&self, user_id: &str, project_id: &str) -> Result<Vec<String>> {
        let rounds = self.get_project_rounds(user_id, project_id).await?;
        Ok(rounds.into_iter().map(|r| r.round.id).collect())
    }

    async fn enable_network(&self) -> Result<()>;
    async fn disable_network(&self) -> Result<()>;
    async fn test_connection(&self) -> bool;
}

/// Every project of one user, with rounds attached, as of one remote write.
#[derive(Debug, Clone)]
pub struct ProjectsSnapshot {
    pub user_id: String,
    pub projects: Vec<Project>,
}

pub struct ProjectSubscription {
    user_id: String,
    rx: broadcast::Receiver<ProjectsSnapshot>,
}

impl ProjectSubscription {
    pub(crate) fn new(user_id: &str, rx: broadcast::Receiver<ProjectsSnapshot>) -> Self {
        Self {
            user_id: user_id.to_string(),
            rx,
        }
    }

    /// Next snapshot for this user. Skipped-over snapshots are not replayed;
    /// only the latest state matters. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Vec<Project>> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) if snapshot.user_id == self.user_id => return Some(snapshot.projects),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, user_id = %self.user_id, "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Latest pending snapshot without waiting, if any.
    pub fn try_latest(&mut self) -> Option<Vec<Project>> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) if snapshot.user_id == self.user_id => latest = Some(snapshot.projects),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return latest,
            }
        }
    }
}

/// Operations recorded in a store's call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetUserProjects,
    GetProject,
    CreateProject,
    UpdateProject,
    DeleteProject,
    CreateRound,
    UpdateRound,
    DeleteRound,
    GetProjectRounds,
    EnableNetwork,
    DisableNetwork,
    TestConnection,
}

impl RemoteOp {
    pub fn is_round_write(self) -> bool {
        matches!(self, RemoteOp::CreateRound | RemoteOp::UpdateRound | RemoteOp::DeleteRound)
    }

    /// Operations that touch documents, as opposed to connection control.
    pub fn is_data_op(self) -> bool {
        !matches!(
            self,
            RemoteOp::EnableNetwork | RemoteOp::DisableNetwork | RemoteOp::TestConnection
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub project_id: Option<String>,
    pub round_id: Option<String>,
}
