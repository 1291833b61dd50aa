use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::classifier::{classify, ErrorClass};
use super::connection::ConnectionController;
use super::profile::NetworkProfile;
use crate::config::ConnectivityConfig;
use crate::model::Project;
use crate::remote::RemoteStore;
use crate::rounds::ProjectRoundService;

/// Reported to the caller before each backoff sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStatus {
    /// 1-based retry number.
    pub retry: u32,
    pub delay: Duration,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub success: bool,
    /// Writes actually issued.
    pub attempts: u32,
    pub retries: u32,
    pub error: Option<String>,
    /// Set on failure, from the active profile.
    pub user_message: Option<String>,
}

/// Pushes a project with connectivity checks, backoff and connection restarts.
pub struct SyncController<R: RemoteStore> {
    service: ProjectRoundService<R>,
    connection: ConnectionController<R>,
    profile: NetworkProfile,
}

impl<R: RemoteStore> SyncController<R> {
    pub fn new(remote: Arc<R>, connectivity: ConnectivityConfig, profile: NetworkProfile) -> Self {
        Self {
            service: ProjectRoundService::new(Arc::clone(&remote)),
            connection: ConnectionController::new(remote, connectivity),
            profile,
        }
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    pub fn connection(&self) -> &ConnectionController<R> {
        &self.connection
    }

    pub async fn sync_project_with_retry<F>(
        &self,
        user_id: &str,
        project: &Project,
        max_retries: u32,
        mut on_retry: F,
    ) -> RetryOutcome
    where
        F: FnMut(&RetryStatus),
    {
        let mut attempts = 0;
        let mut retries = 0;

        loop {
            if !self.connection.is_online().await && !self.connection.wait_for_reconnection().await {
                let error = "client is offline".to_string();
                if retries >= max_retries {
                    return self.fail(project, attempts, retries, error);
                }
                retries += 1;
                on_retry(&RetryStatus {
                    retry: retries,
                    delay: Duration::ZERO,
                    error,
                });
                tracing::warn!(project_id = %project.id, retry = retries, "still offline");
                continue;
            }

            attempts += 1;
            let err = match self.service.save_project(user_id, project).await {
                Ok(()) => {
                    tracing::debug!(project_id = %project.id, attempts, "project synced");
                    return RetryOutcome {
                        success: true,
                        attempts,
                        retries,
                        error: None,
                        user_message: None,
                    };
                }
                Err(e) => e,
            };

            let class = classify(&err);
            if class == ErrorClass::Network && self.profile.restart_on_network_error {
                if let Err(e) = self.connection.restart_connection().await {
                    tracing::warn!(error = %e, "connection restart failed");
                }
            }

            if !self.profile.should_retry(class) || retries >= max_retries {
                return self.fail(project, attempts, retries, err.to_string());
            }

            retries += 1;
            let status = RetryStatus {
                retry: retries,
                delay: self.profile.backoff(retries, class),
                error: err.to_string(),
            };
            tracing::warn!(
                project_id = %project.id,
                retry = retries,
                delay_ms = status.delay.as_millis() as u64,
                error = %err,
                "sync failed, retrying"
            );
            on_retry(&status);
            sleep(status.delay).await;
        }
    }

    fn fail(&self, project: &Project, attempts: u32, retries: u32, error: String) -> RetryOutcome {
        tracing::error!(project_id = %project.id, attempts, retries, error = %error, "sync gave up");
        RetryOutcome {
            success: false,
            attempts,
            retries,
            error: Some(error),
            user_message: Some(self.profile.failure_message.clone()),
        }
    }
}
