//! Kickstart storage execution library
//!
//! This library executes the storage commands of a kickstart script against an
//! abstract installer device tree.

pub mod cli;
pub mod commands;
pub mod config_file;
pub mod context;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod resolve;
pub mod run_state;
pub mod sizing;
pub mod types;

// Re-export main types for convenience
pub use commands::Command;
pub use config_file::StorageSpec;
pub use context::{AliasTable, RunContext};
pub use engine::{DeviceId, MemoryEngine, StorageEngine, StorageError};
pub use error::{ErrorKind, KickstartError};
pub use orchestrator::{execute_storage, execute_storage_tracked};
pub use run_state::{RunStage, RunTracker, RunTransitionError, StageOutcome};
