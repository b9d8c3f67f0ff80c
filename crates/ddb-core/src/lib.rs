//! Core of ddb: cached provisioning images and ephemeral package-build containers.
//!
//! Every operation receives an explicit `ContainerEngine`. The `Session` ties the
//! pieces together: the resolver looks up a cached image by its ownership labels,
//! the builder provisions one when there is none, the runner drives a throwaway
//! container through create, stream, wait and cleanup, and the janitor removes
//! images left behind by older schema versions.

pub mod builder;
pub mod concurrency;
pub mod janitor;
pub mod labels;
pub mod resolver;
pub mod runner;
pub mod session;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use janitor::CleanReport;
pub use runner::{RunOutcome, RunRequest};
pub use session::{BuildReport, PackageBuild, Session};

use ddb_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("engine error: {0}")]
    Engine(EngineError),
    #[error("image build failed: {0}")]
    BuildFailed(String),
    #[error("image build stream ended without an error or an image id")]
    BuildStreamEnded,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interrupted")]
    Interrupted,
}

impl From<EngineError> for CoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Interrupted => Self::Interrupted,
            other => Self::Engine(other),
        }
    }
}
