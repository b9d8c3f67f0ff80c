use crate::engine::{
    BuildEvent, BuildEvents, BuildRequest, ContainerEngine, ImageRecord, OutputChunks, RunSpec,
};
use crate::{EngineError, RemovalFailure};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A scripted piece of container output.
#[derive(Debug, Clone)]
pub enum MockChunk {
    Data(Vec<u8>),
    /// The stream fails with an API error.
    Fail(String),
    /// The stream reports an interrupt, as a cancelled Docker stream does.
    Interrupt,
    /// Pulling this chunk panics.
    Panic,
}

impl MockChunk {
    pub fn text(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }
}

/// Every engine call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListImages,
    InspectImage(String),
    BuildImage(String),
    CreateContainer(String),
    AttachOutput(String),
    WaitContainer(String),
    RemoveContainer(String),
    RemoveImage(String),
}

/// The inputs of the last build request.
#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub tag: String,
    pub labels: HashMap<String, String>,
    pub context: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    images: Vec<ImageRecord>,
    containers: HashMap<String, RunSpec>,
    build_script: Option<Vec<BuildEvent>>,
    pending_events: VecDeque<BuildEvent>,
    build_interrupt_at: Option<usize>,
    events_pulled: usize,
    last_build: Option<RecordedBuild>,
    output_script: Option<Vec<MockChunk>>,
    pending_output: VecDeque<MockChunk>,
    last_run: Option<RunSpec>,
    exit_code: i64,
    auto_remove_on_exit: bool,
    vanish_on_exit: bool,
    container_removal: Option<RemovalFailure>,
    image_removal: HashMap<String, RemovalFailure>,
    calls: Vec<MockCall>,
    next_id: u64,
    clock: i64,
}

impl MockState {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory engine with scripted behaviour, for tests and dry runs.
///
/// Without a build script, a build succeeds and registers a new image carrying
/// the requested labels. Without an output script, a container prints one
/// line and exits with the configured code (0 by default).
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking output script must not wedge the cleanup that follows it.
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_image(&self, id: &str, labels: &[(&str, &str)], created: i64) {
        let mut state = self.state();
        state.clock = state.clock.max(created);
        state.images.push(ImageRecord {
            id: id.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            created,
        });
    }

    pub fn script_build(&self, events: Vec<BuildEvent>) {
        self.state().build_script = Some(events);
    }

    /// The next build stream reports an interrupt after `events` events.
    pub fn interrupt_build_after(&self, events: usize) {
        self.state().build_interrupt_at = Some(events);
    }

    pub fn script_output(&self, chunks: Vec<MockChunk>) {
        self.state().output_script = Some(chunks);
    }

    pub fn set_exit_code(&self, code: i64) {
        self.state().exit_code = code;
    }

    /// Containers created with `auto_remove` disappear once their output ends.
    pub fn set_auto_remove_on_exit(&self, enabled: bool) {
        self.state().auto_remove_on_exit = enabled;
    }

    /// Containers disappear once their output ends whatever they asked for, as
    /// when another tool removes them.
    pub fn set_vanish_on_exit(&self, enabled: bool) {
        self.state().vanish_on_exit = enabled;
    }

    pub fn fail_container_removal(&self, failure: RemovalFailure) {
        self.state().container_removal = Some(failure);
    }

    pub fn fail_image_removal(&self, image_id: &str, failure: RemovalFailure) {
        self.state()
            .image_removal
            .insert(image_id.to_owned(), failure);
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.state().images.clone()
    }

    pub fn live_containers(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn last_build(&self) -> Option<RecordedBuild> {
        self.state().last_build.clone()
    }

    pub fn last_run(&self) -> Option<RunSpec> {
        self.state().last_run.clone()
    }

    /// How many build events the consumer actually pulled.
    pub fn build_events_pulled(&self) -> usize {
        self.state().events_pulled
    }

    fn next_build_event(&self) -> Option<Result<BuildEvent, EngineError>> {
        let mut state = self.state();
        if state.build_interrupt_at == Some(state.events_pulled) {
            state.build_interrupt_at = None;
            return Some(Err(EngineError::Interrupted));
        }
        let event = state.pending_events.pop_front()?;
        state.events_pulled += 1;

        if let BuildEvent::Success(id) = &event {
            let labels = state
                .last_build
                .as_ref()
                .map(|b| b.labels.clone())
                .unwrap_or_default();
            let created = state.tick();
            state.images.retain(|image| image.id != *id);
            state.images.push(ImageRecord {
                id: id.clone(),
                labels,
                created,
            });
        }
        Some(Ok(event))
    }

    fn next_output_chunk(&self, container_id: &str) -> Option<Result<Vec<u8>, EngineError>> {
        // Taken under the lock, acted on after it is released.
        let chunk = {
            let mut state = self.state();
            let chunk = state.pending_output.pop_front();
            if chunk.is_none() {
                // The process exited; an auto-removing engine drops the container now.
                let auto_remove = state.auto_remove_on_exit
                    && state
                        .containers
                        .get(container_id)
                        .is_some_and(|spec| spec.auto_remove);
                if auto_remove || state.vanish_on_exit {
                    state.containers.remove(container_id);
                }
            }
            chunk?
        };
        match chunk {
            MockChunk::Data(bytes) => Some(Ok(bytes)),
            MockChunk::Fail(message) => Some(Err(EngineError::api("logs", message))),
            MockChunk::Interrupt => Some(Err(EngineError::Interrupted)),
            MockChunk::Panic => panic!("mock output stream panicked"),
        }
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>, EngineError> {
        let mut state = self.state();
        state.calls.push(MockCall::ListImages);
        Ok(state.images.clone())
    }

    fn inspect_image(&self, id: &str) -> Result<ImageRecord, EngineError> {
        let mut state = self.state();
        state.calls.push(MockCall::InspectImage(id.to_owned()));
        state
            .images
            .iter()
            .find(|image| image.id == id)
            .cloned()
            .ok_or_else(|| EngineError::ImageNotFound(id.to_owned()))
    }

    fn build_image(&self, request: BuildRequest) -> Result<BuildEvents<'_>, EngineError> {
        {
            let mut state = self.state();
            state.calls.push(MockCall::BuildImage(request.tag.clone()));
            let events = match state.build_script.clone() {
                Some(events) => events,
                None => {
                    let id = state.fresh_id("sha256:");
                    vec![
                        BuildEvent::Status("Pulling base image".to_owned()),
                        BuildEvent::Log("Step 1/3 : FROM base\n".to_owned()),
                        BuildEvent::Log("Step 2/3 : COPY setup.sh /setup.sh\n".to_owned()),
                        BuildEvent::Log("Step 3/3 : RUN bash /setup.sh\n".to_owned()),
                        BuildEvent::Success(id),
                    ]
                }
            };
            state.pending_events = events.into();
            state.events_pulled = 0;
            state.last_build = Some(RecordedBuild {
                tag: request.tag,
                labels: request.labels,
                context: request.context,
            });
        }
        Ok(Box::new(std::iter::from_fn(move || {
            self.next_build_event()
        })))
    }

    fn create_container(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let mut state = self.state();
        state
            .calls
            .push(MockCall::CreateContainer(spec.image.clone()));
        if !state.images.iter().any(|image| image.id == spec.image) {
            return Err(EngineError::ImageNotFound(spec.image.clone()));
        }
        let id = state.fresh_id("ctr-");
        state.containers.insert(id.clone(), spec.clone());
        state.last_run = Some(spec.clone());
        state.pending_output = state
            .output_script
            .clone()
            .unwrap_or_else(|| vec![MockChunk::text("mock: dpkg-buildpackage\n")])
            .into();
        Ok(id)
    }

    fn attach_output(&self, container_id: &str) -> Result<OutputChunks<'_>, EngineError> {
        {
            let mut state = self.state();
            state
                .calls
                .push(MockCall::AttachOutput(container_id.to_owned()));
            if !state.containers.contains_key(container_id) {
                return Err(EngineError::ContainerNotFound(container_id.to_owned()));
            }
        }
        let container_id = container_id.to_owned();
        Ok(Box::new(std::iter::from_fn(move || {
            self.next_output_chunk(&container_id)
        })))
    }

    fn wait_container(&self, container_id: &str) -> Result<i64, EngineError> {
        let mut state = self.state();
        state
            .calls
            .push(MockCall::WaitContainer(container_id.to_owned()));
        if !state.containers.contains_key(container_id) {
            return Err(EngineError::ContainerNotFound(container_id.to_owned()));
        }
        Ok(state.exit_code)
    }

    fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state
            .calls
            .push(MockCall::RemoveContainer(container_id.to_owned()));
        if let Some(failure) = state.container_removal {
            return Err(EngineError::Removal {
                target: container_id.to_owned(),
                failure,
                message: "scripted removal failure".to_owned(),
            });
        }
        if state.containers.remove(container_id).is_none() {
            return Err(EngineError::Removal {
                target: container_id.to_owned(),
                failure: RemovalFailure::NotFound,
                message: format!("No such container: {container_id}"),
            });
        }
        Ok(())
    }

    fn remove_image(&self, image_id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.calls.push(MockCall::RemoveImage(image_id.to_owned()));
        if let Some(failure) = state.image_removal.get(image_id).copied() {
            return Err(EngineError::Removal {
                target: image_id.to_owned(),
                failure,
                message: "scripted removal failure".to_owned(),
            });
        }
        let before = state.images.len();
        state.images.retain(|image| image.id != image_id);
        if state.images.len() == before {
            return Err(EngineError::Removal {
                target: image_id.to_owned(),
                failure: RemovalFailure::NotFound,
                message: format!("No such image: {image_id}"),
            });
        }
        Ok(())
    }
}
