//! Storage abstraction for Raft persistent state
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: current_term, voted_for, and log entries.
//!
//! - `MemoryStorage`: fast, in-memory storage for tests
//! - `FileStorage`: file-based storage with CRC32 checksums

pub mod file;
pub mod memory;

use thiserror::Error;

use crate::core::raft_core::LogEntry;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability: data must survive crashes and a
/// save must not return until the update is stable. Operations are
/// synchronous to keep the core logic simple; the `Send` bound is required
/// for use behind the async lock.
pub trait Storage: Send {
    /// Load the current term; 0 on a fresh node
    fn load_term(&self) -> Result<u64, StorageError>;

    /// Save the current term durably
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// Load the vote record; None if no vote has been cast
    fn load_voted_for(&self) -> Result<Option<u64>, StorageError>;

    /// Save the vote record durably
    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError>;

    /// Load all log entries
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= from_index (conflict resolution)
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;
}
