use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// An image as listed by the engine, with its labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Creation time in seconds since the epoch.
    pub created: i64,
}

/// One decoded event from the engine's streaming build API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// The build failed; carries the engine's message.
    Error(String),
    /// The build finished and produced this image id.
    Success(String),
    /// Pull/progress status, carries no build output.
    Status(String),
    /// An incremental line of build output.
    Log(String),
}

pub struct BuildRequest {
    /// Human-readable image name.
    pub tag: String,
    pub labels: HashMap<String, String>,
    /// Tar archive holding the recipe and everything it copies.
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub mode: AccessMode,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            host: host.into(),
            target: target.to_owned(),
            mode: AccessMode::ReadOnly,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            host: host.into(),
            target: target.to_owned(),
            mode: AccessMode::ReadWrite,
        }
    }

    /// Docker bind syntax: `host:target:mode`.
    pub fn bind_spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.target,
            self.mode.as_str()
        )
    }
}

/// Everything needed to start one ephemeral container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub environment: BTreeMap<String, String>,
    pub tty: bool,
    /// Ask the engine to remove the container when it stops. Only a hint.
    pub auto_remove: bool,
}

impl RunSpec {
    pub fn mount(&self, target: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.target == target)
    }

    /// Environment in `KEY=VALUE` form.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

pub type BuildEvents<'a> = Box<dyn Iterator<Item = Result<BuildEvent, EngineError>> + 'a>;
pub type OutputChunks<'a> = Box<dyn Iterator<Item = Result<Vec<u8>, EngineError>> + 'a>;

/// Blocking interface to a container engine.
///
/// Streaming calls hand back lazy iterators: each `next()` pulls one chunk from
/// the daemon, and a consumed stream cannot be restarted.
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn list_images(&self) -> Result<Vec<ImageRecord>, EngineError>;

    fn inspect_image(&self, id: &str) -> Result<ImageRecord, EngineError>;

    fn build_image(&self, request: BuildRequest) -> Result<BuildEvents<'_>, EngineError>;

    /// Create and start a detached container, returning its id.
    fn create_container(&self, spec: &RunSpec) -> Result<String, EngineError>;

    /// Follow the combined stdout/stderr of a running container.
    fn attach_output(&self, container_id: &str) -> Result<OutputChunks<'_>, EngineError>;

    /// Block until the container's process exits and return its exit code.
    fn wait_container(&self, container_id: &str) -> Result<i64, EngineError>;

    /// Forced removal. Refusals come back as `EngineError::Removal`.
    fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;

    fn remove_image(&self, image_id: &str) -> Result<(), EngineError>;
}

pub fn select_engine(
    name: &str,
    should_stop: fn() -> bool,
) -> Result<Box<dyn ContainerEngine>, EngineError> {
    match name {
        "docker" => Ok(Box::new(
            crate::docker::DockerEngine::connect()?.with_cancel_check(should_stop),
        )),
        "mock" => Ok(Box::new(crate::mock::MockEngine::new())),
        other => Err(EngineError::Unavailable(other.to_owned())),
    }
}
