//! Simple key-value store state machine
//!
//! Commands are a tagged JSON variant at this boundary; the consensus core
//! below only ever moves their serialized bytes:
//! - `{"type":"set","key":K,"value":V}` - set a key, returns the value
//! - `{"type":"delete","key":K}` - delete a key, errors with NOT_FOUND
//!
//! Reads use the `get()` method directly and bypass the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{ApplyResult, StateMachine};

/// Commands accepted by the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    /// Serialize for submission through the consensus core
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("kv command serialization cannot fail")
    }

    /// Deserialize a command payload
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("malformed command: {}", e))
    }
}

/// Simple in-memory key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value directly (bypasses the log)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// All key-value pairs
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared key-value store usable for both Raft apply and direct reads
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for KeyValueStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        // The leader's no-op is always valid
        if command.is_empty() {
            return Ok(());
        }
        KvCommand::decode(command).map(|_| ())
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        if command.is_empty() {
            return Ok(Vec::new());
        }

        match KvCommand::decode(command)? {
            KvCommand::Set { key, value } => {
                let output = value.clone().into_bytes();
                self.data.insert(key, value);
                Ok(output)
            }
            KvCommand::Delete { key } => {
                if self.data.remove(&key).is_some() {
                    Ok(Vec::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
        }
    }
}

impl StateMachine for SharedKvStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        self.lock().unwrap().validate(command)
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.lock().unwrap().apply(command)
    }
}
