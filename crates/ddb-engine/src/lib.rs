//! Container engine boundary for ddb.
//!
//! This crate implements the only side of ddb that talks to a container daemon:
//! the blocking `ContainerEngine` trait with a Docker backend (bollard driven on a
//! private tokio runtime) and an in-memory mock backend, plus the plain data types
//! exchanged across the boundary (image records, build events, run specs).

pub mod docker;
pub mod engine;
pub mod mock;

pub use engine::{
    select_engine, AccessMode, BuildEvent, BuildEvents, BuildRequest, ContainerEngine,
    ImageRecord, Mount, OutputChunks, RunSpec,
};
pub use mock::MockEngine;

use thiserror::Error;

/// Why a removal request was refused by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalFailure {
    /// The object does not exist (any more).
    NotFound,
    /// The object is already being removed, or is in use.
    Conflict,
    Other,
}

impl RemovalFailure {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            _ => Self::Other,
        }
    }

    /// Not-found and conflict both mean somebody else got there first.
    pub fn is_benign(self) -> bool {
        matches!(self, Self::NotFound | Self::Conflict)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine '{0}' is not available")]
    Unavailable(String),
    #[error("cannot connect to container engine: {0}")]
    Connect(String),
    #[error("{operation} failed: {message}")]
    Api { operation: String, message: String },
    #[error("removing {target} failed: {message}")]
    Removal {
        target: String,
        failure: RemovalFailure,
        message: String,
    },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("interrupted")]
    Interrupted,
}

impl EngineError {
    pub fn api(operation: &str, message: impl ToString) -> Self {
        Self::Api {
            operation: operation.to_owned(),
            message: message.to_string(),
        }
    }

    /// True for a removal refused because the object is gone or already going.
    pub fn is_benign_removal(&self) -> bool {
        matches!(self, Self::Removal { failure, .. } if failure.is_benign())
    }
}
