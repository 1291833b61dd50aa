use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ProjectSubscription, ProjectsSnapshot, RemoteCall, RemoteOp, RemoteStore};
use crate::error::{Error, Result};
use crate::model::{Project, RoundDoc};

const SNAPSHOT_CAPACITY: usize = 64;
const CALL_LOG_CAPACITY: usize = 1024;

/// In-process remote store.
///
/// Used for guest sessions and as the test double for the engine: it keeps a
/// call log of the most recent operations and supports injected faults and
/// simulated outages.
pub struct MemoryRemote {
    state: Mutex<State>,
    snapshots: broadcast::Sender<ProjectsSnapshot>,
}

#[derive(Default)]
struct State {
    projects: HashMap<String, BTreeMap<String, Project>>,
    rounds: HashMap<(String, String), BTreeMap<String, RoundDoc>>,
    reachable: bool,
    network_enabled: bool,
    faults: Vec<Fault>,
    calls: VecDeque<RemoteCall>,
    call_log_capacity: usize,
}

/// An injected failure. `ops` empty means every data operation.
#[derive(Debug, Clone)]
pub struct Fault {
    ops: Vec<RemoteOp>,
    kind: FaultKind,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Network(String),
    Permission(String),
    Storage(String),
}

impl Fault {
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Network(message.into()))
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Permission(message.into()))
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Storage(message.into()))
    }

    fn new(kind: FaultKind) -> Self {
        Self {
            ops: Vec::new(),
            kind,
            remaining: None,
        }
    }

    pub fn on(mut self, ops: &[RemoteOp]) -> Self {
        self.ops = ops.to_vec();
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: RemoteOp) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if self.ops.is_empty() {
            op.is_data_op()
        } else {
            self.ops.contains(&op)
        }
    }

    fn to_error(&self) -> Error {
        match &self.kind {
            FaultKind::Network(m) => Error::Network(m.clone()),
            FaultKind::Permission(m) => Error::PermissionDenied(m.clone()),
            FaultKind::Storage(m) => Error::Storage(m.clone()),
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_call_log(CALL_LOG_CAPACITY)
    }

    /// Keeps at most `capacity` calls in the log, dropping the oldest.
    pub fn with_call_log(capacity: usize) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            state: Mutex::new(State {
                reachable: true,
                network_enabled: true,
                call_log_capacity: capacity,
                ..State::default()
            }),
            snapshots,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a project (rounds included) without touching the call log.
    pub fn seed_project(&self, user_id: &str, project: &Project) {
        let mut state = self.lock();
        state
            .projects
            .entry(user_id.to_string())
            .or_default()
            .insert(project.id.clone(), project.root_document());
        let rounds = state
            .rounds
            .entry((user_id.to_string(), project.id.clone()))
            .or_default();
        rounds.clear();
        for doc in project.round_documents() {
            rounds.insert(doc.round.id.clone(), doc);
        }
    }

    /// Stores a raw round document without touching the call log.
    pub fn seed_round(&self, user_id: &str, project_id: &str, round: RoundDoc) {
        self.lock()
            .rounds
            .entry((user_id.to_string(), project_id.to_string()))
            .or_default()
            .insert(round.round.id.clone(), round);
    }

    /// Simulates the backend becoming (un)reachable.
    pub fn set_online(&self, online: bool) {
        self.lock().reachable = online;
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.iter().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, op: RemoteOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn round_writes(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.op.is_round_write()).count()
    }

    /// Stored root document, without the call log.
    pub fn stored_project(&self, user_id: &str, project_id: &str) -> Option<Project> {
        self.lock()
            .projects
            .get(user_id)
            .and_then(|p| p.get(project_id))
            .cloned()
    }

    pub fn stored_round_ids(&self, user_id: &str, project_id: &str) -> Vec<String> {
        self.lock()
            .rounds
            .get(&(user_id.to_string(), project_id.to_string()))
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Records the call, then fails it if the store is offline or a fault matches.
    fn begin(&self, state: &mut State, op: RemoteOp, project_id: Option<&str>, round_id: Option<&str>) -> Result<()> {
        if state.call_log_capacity > 0 {
            if state.calls.len() == state.call_log_capacity {
                state.calls.pop_front();
            }
            state.calls.push_back(RemoteCall {
                op,
                project_id: project_id.map(str::to_string),
                round_id: round_id.map(str::to_string),
            });
        }

        if op.is_data_op() && !(state.reachable && state.network_enabled) {
            return Err(Error::Network("client is offline".into()));
        }

        if let Some(fault) = state.faults.iter_mut().find(|f| f.matches(op)) {
            if let Some(n) = fault.remaining.as_mut() {
                *n -= 1;
            }
            return Err(fault.to_error());
        }
        Ok(())
    }

    fn assemble(state: &State, user_id: &str, root: &Project) -> Project {
        let rounds = state
            .rounds
            .get(&(user_id.to_string(), root.id.clone()))
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        Project::from_documents(root.clone(), rounds)
    }

    fn publish(&self, state: &State, user_id: &str) {
        if self.snapshots.receiver_count() == 0 {
            return;
        }
        let projects = state
            .projects
            .get(user_id)
            .map(|p| p.values().map(|root| Self::assemble(state, user_id, root)).collect())
            .unwrap_or_default();
        let _ = self.snapshots.send(ProjectsSnapshot {
            user_id: user_id.to_string(),
            projects,
        });
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get_user_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::GetUserProjects, None, None)?;
        Ok(state
            .projects
            .get(user_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_project(&self, user_id: &str, project_id: &str) -> Result<Option<Project>> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::GetProject, Some(project_id), None)?;
        Ok(state.projects.get(user_id).and_then(|p| p.get(project_id)).cloned())
    }

    async fn create_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::CreateProject, Some(&project.id), None)?;
        state
            .projects
            .entry(user_id.to_string())
            .or_default()
            .insert(project.id.clone(), project.root_document());
        self.publish(&state, user_id);
        Ok(())
    }

    async fn update_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::UpdateProject, Some(&project.id), None)?;
        let slot = state
            .projects
            .get_mut(user_id)
            .and_then(|p| p.get_mut(&project.id))
            .ok_or_else(|| Error::NotFound(format!("project {}", project.id)))?;
        *slot = project.root_document();
        self.publish(&state, user_id);
        Ok(())
    }

    async fn delete_project(&self, user_id: &str, project_id: &str) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::DeleteProject, Some(project_id), None)?;
        if let Some(projects) = state.projects.get_mut(user_id) {
            projects.remove(project_id);
        }
        self.publish(&state, user_id);
        Ok(())
    }

    fn subscribe_to_user_projects(&self, user_id: &str) -> ProjectSubscription {
        ProjectSubscription::new(user_id, self.snapshots.subscribe())
    }

    async fn create_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::CreateRound, Some(project_id), Some(round.id()))?;
        state
            .rounds
            .entry((user_id.to_string(), project_id.to_string()))
            .or_default()
            .insert(round.id().to_string(), round.clone());
        self.publish(&state, user_id);
        Ok(())
    }

    async fn update_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::UpdateRound, Some(project_id), Some(round.id()))?;
        let slot = state
            .rounds
            .get_mut(&(user_id.to_string(), project_id.to_string()))
            .and_then(|r| r.get_mut(round.id()))
            .ok_or_else(|| Error::NotFound(format!("round {} in project {}", round.id(), project_id)))?;
        *slot = round.clone();
        self.publish(&state, user_id);
        Ok(())
    }

    async fn delete_round(&self, user_id: &str, project_id: &str, round_id: &str) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::DeleteRound, Some(project_id), Some(round_id))?;
        if let Some(rounds) = state.rounds.get_mut(&(user_id.to_string(), project_id.to_string())) {
            rounds.remove(round_id);
        }
        self.publish(&state, user_id);
        Ok(())
    }

    async fn get_project_rounds(&self, user_id: &str, project_id: &str) -> Result<Vec<RoundDoc>> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::GetProjectRounds, Some(project_id), None)?;
        Ok(state
            .rounds
            .get(&(user_id.to_string(), project_id.to_string()))
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn enable_network(&self) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::EnableNetwork, None, None)?;
        state.network_enabled = true;
        Ok(())
    }

    async fn disable_network(&self) -> Result<()> {
        let mut state = self.lock();
        self.begin(&mut state, RemoteOp::DisableNetwork, None, None)?;
        state.network_enabled = false;
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let mut state = self.lock();
        let _ = self.begin(&mut state, RemoteOp::TestConnection, None, None);
        state.reachable && state.network_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{from_millis, Round};

    fn project(id: &str) -> Project {
        let mut p = Project::new(id, "Scarf");
        p.last_modified = from_millis(1_000);
        p
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let remote = MemoryRemote::new();
        let mut p = project("p1");
        p.pattern = vec![Round::new("r1", 1)];

        remote.create_project("u1", &p).await.unwrap();
        let stored = remote.get_project("u1", "p1").await.unwrap().unwrap();
        assert!(stored.pattern.is_empty(), "root documents carry no rounds");

        assert!(remote.get_project("u2", "p1").await.unwrap().is_none());
        assert_eq!(remote.get_user_projects("u1").await.unwrap().len(), 1);
        assert_eq!(remote.count(RemoteOp::CreateProject), 1);
    }

    #[tokio::test]
    async fn test_call_log_keeps_most_recent() {
        let remote = MemoryRemote::with_call_log(2);
        remote.create_project("u1", &project("p1")).await.unwrap();
        remote.get_project("u1", "p1").await.unwrap();
        remote.delete_project("u1", "p1").await.unwrap();

        let ops: Vec<_> = remote.calls().iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![RemoteOp::GetProject, RemoteOp::DeleteProject]);

        let silent = MemoryRemote::with_call_log(0);
        silent.create_project("u1", &project("p1")).await.unwrap();
        assert!(silent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_round_requires_existing() {
        let remote = MemoryRemote::new();
        let doc = RoundDoc::from_round(&Round::new("r1", 1), None);

        let err = remote.update_round("u1", "p1", &doc).await.unwrap_err();
        assert!(err.is_not_found());

        remote.create_round("u1", "p1", &doc).await.unwrap();
        remote.update_round("u1", "p1", &doc).await.unwrap();
        assert_eq!(remote.round_writes(), 3);
    }

    #[tokio::test]
    async fn test_fault_injection_is_scoped_and_counted() {
        let remote = MemoryRemote::new();
        remote.seed_project("u1", &project("p1"));
        remote.inject(Fault::network("unavailable").on(&[RemoteOp::UpdateProject]).times(1));

        let p = project("p1");
        assert!(remote.update_project("u1", &p).await.is_err());
        assert!(remote.update_project("u1", &p).await.is_ok());
        assert!(remote.get_project("u1", "p1").await.is_ok());
        assert_eq!(remote.count(RemoteOp::UpdateProject), 2);
    }

    #[tokio::test]
    async fn test_offline_fails_data_ops_but_not_probe() {
        let remote = MemoryRemote::new();
        remote.set_online(false);

        let err = remote.get_user_projects("u1").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(!remote.test_connection().await);

        remote.set_online(true);
        remote.disable_network().await.unwrap();
        assert!(!remote.test_connection().await);
        remote.enable_network().await.unwrap();
        assert!(remote.test_connection().await);
    }

    #[tokio::test]
    async fn test_subscription_receives_assembled_snapshots() {
        let remote = MemoryRemote::new();
        let mut sub = remote.subscribe_to_user_projects("u1");
        let mut other = remote.subscribe_to_user_projects("u2");

        remote.create_project("u1", &project("p1")).await.unwrap();
        let doc = RoundDoc::from_round(&Round::new("r1", 1), None);
        remote.create_round("u1", "p1", &doc).await.unwrap();

        let latest = sub.try_latest().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].pattern.len(), 1);
        assert!(other.try_latest().is_none());
    }
}
