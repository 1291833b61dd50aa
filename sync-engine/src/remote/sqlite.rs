use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;

use super::{ProjectSubscription, ProjectsSnapshot, RemoteStore};
use crate::error::{Error, Result};
use crate::model::{Project, RoundDoc};
use crate::rounds::validate_round_document;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS remote_projects (
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    doc TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    PRIMARY KEY (user_id, project_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS remote_rounds (
    user_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    round_id TEXT NOT NULL,
    doc TEXT NOT NULL,
    PRIMARY KEY (user_id, project_id, round_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rounds_project ON remote_rounds(user_id, project_id);

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

const SNAPSHOT_CAPACITY: usize = 16;

/// Document store kept in a SQLite file: projects and rounds as JSON.
///
/// Round documents are validated when read back, so a malformed row surfaces
/// as a validation error instead of a half-parsed round.
pub struct SqliteRemote {
    conn: Mutex<Connection>,
    network_enabled: AtomicBool,
    snapshots: broadcast::Sender<ProjectsSnapshot>,
}

impl SqliteRemote {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(INIT_SQL)?;
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            network_enabled: AtomicBool::new(true),
            snapshots,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        if !self.network_enabled.load(Ordering::SeqCst) {
            return Err(Error::Network("client is offline".into()));
        }
        self.conn
            .lock()
            .map_err(|_| Error::Storage("connection mutex poisoned".into()))
    }

    fn read_projects(conn: &Connection, user_id: &str) -> Result<Vec<Project>> {
        let mut stmt = conn.prepare(
            "SELECT doc FROM remote_projects WHERE user_id = ?1 ORDER BY last_modified, project_id",
        )?;
        let docs = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(Error::from))
            .collect()
    }

    fn read_rounds(conn: &Connection, user_id: &str, project_id: &str) -> Result<Vec<RoundDoc>> {
        let mut stmt = conn.prepare(
            "SELECT doc FROM remote_rounds WHERE user_id = ?1 AND project_id = ?2 ORDER BY round_id",
        )?;
        let docs = stmt
            .query_map(params![user_id, project_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        docs.iter()
            .map(|doc| {
                let value: serde_json::Value = serde_json::from_str(doc)?;
                validate_round_document(&value)?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    fn publish(&self, conn: &Connection, user_id: &str) {
        if self.snapshots.receiver_count() == 0 {
            return;
        }
        let assembled = Self::read_projects(conn, user_id).and_then(|roots| {
            roots
                .into_iter()
                .map(|root| {
                    let rounds = Self::read_rounds(conn, user_id, &root.id)?;
                    Ok(Project::from_documents(root, rounds))
                })
                .collect::<Result<Vec<_>>>()
        });
        match assembled {
            Ok(projects) => {
                let _ = self.snapshots.send(ProjectsSnapshot {
                    user_id: user_id.to_string(),
                    projects,
                });
            }
            Err(e) => tracing::warn!(user_id, error = %e, "failed to build snapshot"),
        }
    }

    /// Inserts a raw round document without validation. Used to load
    /// documents written by other clients.
    pub fn put_raw_round(&self, user_id: &str, project_id: &str, round_id: &str, doc: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO remote_rounds (user_id, project_id, round_id, doc) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, project_id, round_id, doc.to_string()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    async fn get_user_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        Self::read_projects(&conn, user_id)
    }

    async fn get_project(&self, user_id: &str, project_id: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM remote_projects WHERE user_id = ?1 AND project_id = ?2",
                params![user_id, project_id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Error::from)).transpose()
    }

    async fn create_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let conn = self.conn()?;
        let doc = serde_json::to_string(&project.root_document())?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO remote_projects (user_id, project_id, doc, last_modified) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, project.id, doc, project.last_modified_millis()],
        )?;
        if inserted == 0 {
            return Err(Error::Storage(format!("project {} already exists", project.id)));
        }
        self.publish(&conn, user_id);
        Ok(())
    }

    async fn update_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let conn = self.conn()?;
        let doc = serde_json::to_string(&project.root_document())?;
        let updated = conn.execute(
            "UPDATE remote_projects SET doc = ?3, last_modified = ?4 WHERE user_id = ?1 AND project_id = ?2",
            params![user_id, project.id, doc, project.last_modified_millis()],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("project {}", project.id)));
        }
        self.publish(&conn, user_id);
        Ok(())
    }

    async fn delete_project(&self, user_id: &str, project_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM remote_projects WHERE user_id = ?1 AND project_id = ?2",
            params![user_id, project_id],
        )?;
        self.publish(&conn, user_id);
        Ok(())
    }

    fn subscribe_to_user_projects(&self, user_id: &str) -> ProjectSubscription {
        ProjectSubscription::new(user_id, self.snapshots.subscribe())
    }

    async fn create_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO remote_rounds (user_id, project_id, round_id, doc) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, project_id, round.id(), serde_json::to_string(round)?],
        )?;
        self.publish(&conn, user_id);
        Ok(())
    }

    async fn update_round(&self, user_id: &str, project_id: &str, round: &RoundDoc) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE remote_rounds SET doc = ?4 WHERE user_id = ?1 AND project_id = ?2 AND round_id = ?3",
            params![user_id, project_id, round.id(), serde_json::to_string(round)?],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("round {} in project {}", round.id(), project_id)));
        }
        self.publish(&conn, user_id);
        Ok(())
    }

    async fn delete_round(&self, user_id: &str, project_id: &str, round_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM remote_rounds WHERE user_id = ?1 AND project_id = ?2 AND round_id = ?3",
            params![user_id, project_id, round_id],
        )?;
        self.publish(&conn, user_id);
        Ok(())
    }

    async fn get_project_rounds(&self, user_id: &str, project_id: &str) -> Result<Vec<RoundDoc>> {
        let conn = self.conn()?;
        Self::read_rounds(&conn, user_id, project_id)
    }

    async fn get_project_round_ids(&self, user_id: &str, project_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT round_id FROM remote_rounds WHERE user_id = ?1 AND project_id = ?2 ORDER BY round_id",
        )?;
        let ids = stmt
            .query_map(params![user_id, project_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn enable_network(&self) -> Result<()> {
        self.network_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_network(&self) -> Result<()> {
        self.network_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.conn() {
            Ok(conn) => conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok(),
            Err(_) => false,
        }
    }
}
