//! In-memory storage implementation for testing
//!
//! No disk I/O, no persistence across restarts. Used by unit tests where
//! speed matters and side effects are unwanted.

use super::{Storage, StorageError};
use crate::core::raft_core::LogEntry;

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        Ok(self.term)
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.term = term;
        Ok(())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.voted_for)
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        // Entries are 1-indexed: entry at index N sits at position N-1
        if from_index > 0 {
            let truncate_pos = (from_index - 1) as usize;
            if truncate_pos < self.log.len() {
                self.log.truncate(truncate_pos);
            }
        } else {
            self.log.clear();
        }
        Ok(())
    }
}
