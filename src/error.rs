//! Error handling for kickstart storage execution
//!
//! Every failure raised while executing a storage command is a `KickstartError`.
//! Each variant carries the script line of the command that produced it, and every
//! error is fatal: the run stops at the first one with no rollback.

use thiserror::Error;

use crate::engine::StorageError;

/// Main error type for command execution
#[derive(Error, Debug)]
pub enum KickstartError {
    /// A mandatory device spec, member or alias resolved to nothing (or to too much)
    #[error("line {line}: {message}")]
    Reference { line: usize, message: String },

    /// A field violates a domain rule (mount point, size, duplicate name, fs type)
    #[error("line {line}: {message}")]
    Validation { line: usize, message: String },

    /// The target pool/device does not exist or lacks a prerequisite
    #[error("line {line}: {message}")]
    State { line: usize, message: String },

    /// Escrow certificate download failed or the network is unavailable
    #[error("line {line}: {message}")]
    Network { line: usize, message: String },

    /// The storage engine rejected an action; surfaced unchanged
    #[error("line {line}: {source}")]
    Engine {
        line: usize,
        #[source]
        source: StorageError,
    },
}

/// Coarse classification of a `KickstartError`, handy for matching in callers and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Reference,
    Validation,
    State,
    Network,
    Engine,
}

/// Result type alias for command execution
pub type Result<T> = std::result::Result<T, KickstartError>;

impl KickstartError {
    /// Create a reference error
    pub fn reference(line: usize, msg: impl Into<String>) -> Self {
        Self::Reference { line, message: msg.into() }
    }

    /// Create a validation error
    pub fn validation(line: usize, msg: impl Into<String>) -> Self {
        Self::Validation { line, message: msg.into() }
    }

    /// Create a state error
    pub fn state(line: usize, msg: impl Into<String>) -> Self {
        Self::State { line, message: msg.into() }
    }

    /// Create a network error
    pub fn network(line: usize, msg: impl Into<String>) -> Self {
        Self::Network { line, message: msg.into() }
    }

    /// Wrap an engine failure
    pub fn engine(line: usize, source: StorageError) -> Self {
        Self::Engine { line, source }
    }

    /// Script line of the command that failed
    pub fn line(&self) -> usize {
        match self {
            Self::Reference { line, .. }
            | Self::Validation { line, .. }
            | Self::State { line, .. }
            | Self::Network { line, .. }
            | Self::Engine { line, .. } => *line,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Reference { .. } => ErrorKind::Reference,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::State { .. } => ErrorKind::State,
            Self::Network { .. } => ErrorKind::Network,
            Self::Engine { .. } => ErrorKind::Engine,
        }
    }
}

/// Attach a script line to engine results.
pub trait AtLine<T> {
    fn at_line(self, line: usize) -> Result<T>;
}

impl<T> AtLine<T> for std::result::Result<T, StorageError> {
    fn at_line(self, line: usize) -> Result<T> {
        self.map_err(|e| KickstartError::engine(line, e))
    }
}
