use std::collections::HashMap;

use super::BackupStorage;
use crate::error::Result;

pub struct MemoryBackupStorage {
    entries: HashMap<(String, String), Vec<u8>>,
}

impl MemoryBackupStorage {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl Default for MemoryBackupStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStorage for MemoryBackupStorage {
    fn get(&self, identity: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(&(identity.to_string(), name.to_string())).cloned())
    }

    fn put(&mut self, identity: &str, name: &str, value: &[u8]) -> Result<()> {
        self.entries
            .insert((identity.to_string(), name.to_string()), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, identity: &str, name: &str) -> Result<()> {
        self.entries.remove(&(identity.to_string(), name.to_string()));
        Ok(())
    }
}
