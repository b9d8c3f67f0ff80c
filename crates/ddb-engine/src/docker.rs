use crate::engine::{
    BuildEvent, BuildEvents, BuildRequest, ContainerEngine, ImageRecord, OutputChunks, RunSpec,
};
use crate::{EngineError, RemovalFailure};
use bollard::errors::Error as BollardError;
use bollard::models::{BuildInfo, ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptions, CreateContainerOptions, ListImagesOptions, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// How often a blocked stream read re-checks the cancellation predicate.
const CANCEL_POLL: Duration = Duration::from_millis(200);

type BoxedStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T, BollardError>> + 'a>>;

/// Docker daemon backend.
///
/// bollard is async; every trait method drives it to completion on a private
/// current-thread runtime, so callers see plain blocking calls.
pub struct DockerEngine {
    docker: Docker,
    runtime: Runtime,
    should_stop: fn() -> bool,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let docker = {
            let _guard = runtime.enter();
            Docker::connect_with_local_defaults()
                .map_err(|e| EngineError::Connect(e.to_string()))?
        };
        Ok(Self {
            docker,
            runtime,
            should_stop: || false,
        })
    }

    /// Streams stop with `EngineError::Interrupted` once `should_stop` returns true.
    #[must_use]
    pub fn with_cancel_check(mut self, should_stop: fn() -> bool) -> Self {
        self.should_stop = should_stop;
        self
    }

    fn pulled<'a, T>(
        &'a self,
        operation: &'static str,
        stream: BoxedStream<'a, T>,
        recover: fn(&'static str, BollardError) -> Result<T, EngineError>,
    ) -> Pulled<'a, T> {
        Pulled {
            engine: self,
            operation,
            stream,
            recover,
            finished: false,
        }
    }
}

/// A daemon stream read one item per `next()`.
struct Pulled<'a, T> {
    engine: &'a DockerEngine,
    operation: &'static str,
    stream: BoxedStream<'a, T>,
    recover: fn(&'static str, BollardError) -> Result<T, EngineError>,
    finished: bool,
}

impl<T> Iterator for Pulled<'_, T> {
    type Item = Result<T, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let should_stop = self.engine.should_stop;
        let stream = &mut self.stream;
        let item = self.engine.runtime.block_on(async {
            tokio::select! {
                item = stream.next() => item.map(Ok),
                () = cancelled(should_stop) => Some(Err(EngineError::Interrupted)),
            }
        });

        match item {
            None => {
                self.finished = true;
                None
            }
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Some(Ok(Ok(value))) => Some(Ok(value)),
            Some(Ok(Err(e))) => Some((self.recover)(self.operation, e)),
        }
    }
}

async fn cancelled(should_stop: fn() -> bool) {
    loop {
        if should_stop() {
            return;
        }
        tokio::time::sleep(CANCEL_POLL).await;
    }
}

fn api_error<T>(operation: &'static str, e: BollardError) -> Result<T, EngineError> {
    Err(EngineError::api(operation, e))
}

/// The daemon reports a failed build step as a stream error; keep it as an event.
fn build_error_as_event(
    operation: &'static str,
    e: BollardError,
) -> Result<Result<BuildEvent, EngineError>, EngineError> {
    match e {
        BollardError::DockerStreamError { error } => Ok(Ok(BuildEvent::Error(error))),
        other => Err(EngineError::api(operation, other)),
    }
}

/// Classify one build message: error, then final image id, then status,
/// then output.
fn build_event(info: BuildInfo) -> Result<BuildEvent, EngineError> {
    if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
        return Ok(BuildEvent::Error(message));
    }
    if let Some(id) = info.aux.and_then(|aux| aux.id) {
        return Ok(BuildEvent::Success(id));
    }
    if let Some(status) = info.status {
        return Ok(BuildEvent::Status(status));
    }
    info.stream.map(BuildEvent::Log).ok_or_else(|| {
        EngineError::api(
            "build_image",
            "event carries no error, image id, status or output",
        )
    })
}

fn removal_error(target: &str, e: BollardError) -> EngineError {
    match e {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Removal {
            target: target.to_owned(),
            failure: RemovalFailure::from_status(status_code),
            message,
        },
        other => EngineError::Removal {
            target: target.to_owned(),
            failure: RemovalFailure::Other,
            message: other.to_string(),
        },
    }
}

impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>, EngineError> {
        let summaries = self
            .runtime
            .block_on(self.docker.list_images(None::<ListImagesOptions>))
            .map_err(|e| EngineError::api("list_images", e))?;

        Ok(summaries
            .into_iter()
            .map(|s| ImageRecord {
                id: s.id,
                labels: s.labels,
                created: s.created,
            })
            .collect())
    }

    fn inspect_image(&self, id: &str) -> Result<ImageRecord, EngineError> {
        // The listing carries labels and a numeric creation time in one call.
        self.list_images()?
            .into_iter()
            .find(|image| image.id == id)
            .ok_or_else(|| EngineError::ImageNotFound(id.to_owned()))
    }

    fn build_image(&self, request: BuildRequest) -> Result<BuildEvents<'_>, EngineError> {
        debug!(
            "building {} from a {}-byte context",
            request.tag,
            request.context.len()
        );
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_owned(),
            t: Some(request.tag),
            rm: true,
            labels: Some(request.labels),
            ..BuildImageOptions::default()
        };
        let stream = self
            .docker
            .build_image(
                options,
                None,
                Some(bollard::body_full(Bytes::from(request.context))),
            )
            .map(|item| item.map(build_event));

        let events = self
            .pulled("build_image", Box::pin(stream), build_error_as_event)
            .map(|event| event.and_then(|event| event));
        Ok(Box::new(events))
    }

    fn create_container(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env_pairs()),
            tty: Some(spec.tty),
            host_config: Some(HostConfig {
                binds: Some(spec.mounts.iter().map(crate::Mount::bind_spec).collect()),
                auto_remove: Some(spec.auto_remove),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.runtime.block_on(async {
            let created = self
                .docker
                .create_container(None::<CreateContainerOptions>, body)
                .await
                .map_err(|e| EngineError::api("create_container", e))?;
            for warning in &created.warnings {
                warn!("engine: {warning}");
            }

            if let Err(e) = self
                .docker
                .start_container(&created.id, None::<StartContainerOptions>)
                .await
            {
                // Never started, so nobody else will clean it up.
                if let Err(removal) = self
                    .docker
                    .remove_container(
                        &created.id,
                        Some(RemoveContainerOptionsBuilder::new().force(true).build()),
                    )
                    .await
                {
                    warn!("failed to remove unstarted container {}: {removal}", created.id);
                }
                return Err(EngineError::api("start_container", e));
            }
            Ok(created.id)
        })
    }

    fn attach_output(&self, container_id: &str) -> Result<OutputChunks<'_>, EngineError> {
        let stream = self.docker.logs(
            container_id,
            Some(
                LogsOptionsBuilder::new()
                    .follow(true)
                    .stdout(true)
                    .stderr(true)
                    .build(),
            ),
        );
        let chunks = self
            .pulled("logs", Box::pin(stream), api_error)
            .map(|out| out.map(|out| out.into_bytes().to_vec()));
        Ok(Box::new(chunks))
    }

    fn wait_container(&self, container_id: &str) -> Result<i64, EngineError> {
        let mut stream = Box::pin(
            self.docker
                .wait_container(container_id, None::<WaitContainerOptions>),
        );
        let first = self.runtime.block_on(stream.next());
        match first {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            })) => Err(EngineError::ContainerNotFound(container_id.to_owned())),
            Some(Err(e)) => Err(EngineError::api("wait_container", e)),
            None => Err(EngineError::api(
                "wait_container",
                "stream ended without an exit status",
            )),
        }
    }

    fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.runtime
            .block_on(self.docker.remove_container(
                container_id,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            ))
            .map_err(|e| removal_error(container_id, e))
    }

    fn remove_image(&self, image_id: &str) -> Result<(), EngineError> {
        self.runtime
            .block_on(
                self.docker
                    .remove_image(image_id, None::<RemoveImageOptions>, None),
            )
            .map(|_| ())
            .map_err(|e| removal_error(image_id, e))
    }
}
