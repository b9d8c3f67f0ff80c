use crate::concurrency::shutdown_requested;
use crate::CoreError;
use ddb_engine::{ContainerEngine, EngineError, Mount, RunSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SOURCE_MOUNT: &str = "/source-ro";
pub const OUTPUT_MOUNT: &str = "/output";
pub const DEPENDENCY_MOUNT: &str = "/dependencies";
pub const RUN_SCRIPT_MOUNT: &str = "/run.sh";

/// Script that drives the package build inside the container.
pub const RUN_SCRIPT: &str = include_str!("../scripts/run.sh");

/// Host directories for one package build. Paths must be absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dependency_dir: Option<PathBuf>,
}

/// Numeric identity that should own the build artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    #[allow(unsafe_code)]
    pub fn current() -> Self {
        // SAFETY: getuid()/getgid() take no arguments and cannot fail.
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub container_id: String,
    /// `None` when the engine removed the container before its status was read.
    pub exit_code: Option<i64>,
}

pub fn run_spec(image: &str, request: &RunRequest, script: &Path, identity: Identity) -> RunSpec {
    let mut mounts = vec![
        Mount::read_only(&request.source_dir, SOURCE_MOUNT),
        Mount::read_write(&request.output_dir, OUTPUT_MOUNT),
        Mount::read_only(script, RUN_SCRIPT_MOUNT),
    ];
    if let Some(dir) = &request.dependency_dir {
        mounts.push(Mount::read_only(dir, DEPENDENCY_MOUNT));
    }

    RunSpec {
        image: image.to_owned(),
        command: vec!["bash".to_owned(), RUN_SCRIPT_MOUNT.to_owned()],
        mounts,
        environment: BTreeMap::from([
            ("USER".to_owned(), identity.uid.to_string()),
            ("GROUP".to_owned(), identity.gid.to_string()),
        ]),
        tty: true,
        // The daemon would remove the container as soon as it exits, racing the
        // wait for its exit code. The guard removes it instead.
        auto_remove: false,
    }
}

/// Force-remove a container. Already gone or already going counts as success.
pub fn remove_container(engine: &dyn ContainerEngine, id: &str) -> Result<(), CoreError> {
    match engine.remove_container(id) {
        Ok(()) => {
            debug!("removed container {id}");
            Ok(())
        }
        Err(e) if e.is_benign_removal() => {
            debug!("container {id} already removed: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Owns a created container until it is removed.
///
/// `release` removes it and reports the result; dropping an unreleased guard
/// (a panic unwinding through the run) removes it and can only log.
struct ContainerGuard<'a> {
    engine: &'a dyn ContainerEngine,
    id: String,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(engine: &'a dyn ContainerEngine, id: String) -> Self {
        Self {
            engine,
            id,
            armed: true,
        }
    }

    fn release(mut self) -> Result<(), CoreError> {
        self.armed = false;
        remove_container(self.engine, &self.id)
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = remove_container(self.engine, &self.id) {
                warn!("failed to remove container {}: {e}", self.id);
            }
        }
    }
}

/// Run the package build in a throwaway container from `image`.
pub fn run(
    engine: &dyn ContainerEngine,
    image: &str,
    request: &RunRequest,
    out: &mut dyn Write,
) -> Result<RunOutcome, CoreError> {
    run_with_cancel(engine, image, request, out, shutdown_requested)
}

/// Like [`run`], stopping early once `should_stop` returns true.
///
/// Whatever happens after the container is created, exactly one forced
/// removal is attempted before this returns or unwinds.
pub fn run_with_cancel(
    engine: &dyn ContainerEngine,
    image: &str,
    request: &RunRequest,
    out: &mut dyn Write,
    should_stop: impl Fn() -> bool,
) -> Result<RunOutcome, CoreError> {
    let script_dir = tempfile::Builder::new().prefix("ddb-run-").tempdir()?;
    let script = script_dir.path().join("run.sh");
    std::fs::write(&script, RUN_SCRIPT)?;

    let spec = run_spec(image, request, &script, Identity::current());
    let container_id = engine.create_container(&spec)?;
    info!("created container {container_id} from {image}");

    let guard = ContainerGuard::new(engine, container_id.clone());
    let result = stream_and_wait(engine, &container_id, out, &should_stop);
    let cleanup = guard.release();

    match (result, cleanup) {
        (Ok(exit_code), Ok(())) => Ok(RunOutcome {
            container_id,
            exit_code,
        }),
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!("failed to remove container {container_id}: {cleanup}");
            Err(e)
        }
    }
}

fn stream_and_wait(
    engine: &dyn ContainerEngine,
    id: &str,
    out: &mut dyn Write,
    should_stop: &impl Fn() -> bool,
) -> Result<Option<i64>, CoreError> {
    for chunk in engine.attach_output(id)? {
        out.write_all(&chunk?)?;
        out.flush()?;
        if should_stop() {
            return Err(CoreError::Interrupted);
        }
    }
    if should_stop() {
        return Err(CoreError::Interrupted);
    }

    match engine.wait_container(id) {
        Ok(code) => {
            debug!("container {id} exited with {code}");
            Ok(Some(code))
        }
        Err(EngineError::ContainerNotFound(_)) => {
            warn!("container {id} was removed before its exit status could be read");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
