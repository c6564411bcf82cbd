//! State machine abstraction for Raft
//!
//! The state machine is the application logic that Raft coordinates. The
//! consensus core treats commands as opaque bytes; only the state machine
//! interprets them. When entries are committed they are applied here, in
//! log order, exactly once per index.

use std::sync::{Arc, Mutex};

/// Result of applying a command: output bytes on success, message on error
pub type ApplyResult = Result<Vec<u8>, String>;

/// State machine trait - the application logic that Raft coordinates
///
/// Implementations must be deterministic: applying the same commands in the
/// same order must produce the same state on every node. An empty command
/// is the leader's internal no-op and must be accepted and ignored.
pub trait StateMachine: Send {
    /// Check a command before it is appended to the log, so a submission
    /// that can never apply is rejected without spending a log slot
    fn validate(&self, command: &[u8]) -> Result<(), String>;

    /// Apply a committed command
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// Shared record of applied commands for testing
pub type AppliedCommands = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test state machine that records every applied command to a shared vec
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec so tests can inspect applied commands
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn validate(&self, _command: &[u8]) -> Result<(), String> {
        Ok(())
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied.lock().unwrap().push(command.to_vec());
        Ok(Vec::new())
    }
}
