use rusqlite::{params, Connection, OptionalExtension};

use super::BackupStorage;
use crate::error::Result;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS guest_backups (
    identity TEXT NOT NULL,
    name TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (identity, name)
) WITHOUT ROWID;

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

pub struct SqliteBackupStorage {
    conn: Connection,
}

impl SqliteBackupStorage {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(INIT_SQL)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl BackupStorage for SqliteBackupStorage {
    fn get(&self, identity: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM guest_backups WHERE identity = ?1 AND name = ?2",
                params![identity, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, identity: &str, name: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO guest_backups (identity, name, value) VALUES (?1, ?2, ?3)",
            params![identity, name, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, identity: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM guest_backups WHERE identity = ?1 AND name = ?2",
            params![identity, name],
        )?;
        Ok(())
    }
}
