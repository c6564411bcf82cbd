//! State machine layer for Raft
//!
//! - `KeyValueStore`: simple key-value store driven by tagged commands
//! - `TestStateMachine`: records commands for testing

pub mod kv;
pub mod traits;

pub use traits::{AppliedCommands, ApplyResult, StateMachine, TestStateMachine};
