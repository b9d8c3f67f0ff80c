use crate::janitor::{self, CleanReport};
use crate::runner::{self, RunRequest};
use crate::{builder, resolver, CoreError};
use ddb_engine::ContainerEngine;
use serde::Serialize;
use std::io::Write;
use tracing::info;

/// One package build, with the distribution already validated and every
/// path already absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageBuild {
    pub dist: String,
    pub run: RunRequest,
    /// Provision a fresh image even when a cached one exists.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BuildReport {
    pub image_id: String,
    /// Whether the image was provisioned by this build.
    pub built: bool,
    pub container_id: String,
    pub exit_code: Option<i64>,
}

/// Entry point for the `build` and `clean` flows over an injected engine.
pub struct Session<'a> {
    engine: &'a dyn ContainerEngine,
    notifier: Box<dyn Fn(&str) + 'a>,
}

impl<'a> Session<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self {
            engine,
            notifier: Box::new(|msg| info!("{msg}")),
        }
    }

    /// Route user-facing progress notes somewhere other than the log.
    #[must_use]
    pub fn with_notifier(mut self, notifier: impl Fn(&str) + 'a) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    fn note(&self, msg: &str) {
        (self.notifier)(msg);
    }

    /// Find or provision the image, then build the package in a throwaway
    /// container. Image build output and container output go to `out`.
    pub fn build(
        &self,
        request: &PackageBuild,
        out: &mut dyn Write,
    ) -> Result<BuildReport, CoreError> {
        let cached = if request.force {
            None
        } else {
            self.note("Checking for prebuilt image...");
            resolver::find_image(self.engine, &request.dist)?
        };

        let (image, built) = match cached {
            Some(image) => (image, false),
            None => {
                if request.force {
                    self.note("--force was passed; building image...");
                } else {
                    self.note("No image found: building one...");
                }
                (builder::build_image(self.engine, &request.dist, out)?, true)
            }
        };

        self.note("Creating temporary container...");
        let outcome = runner::run(self.engine, &image.id, &request.run, out)?;

        Ok(BuildReport {
            image_id: image.id,
            built,
            container_id: outcome.container_id,
            exit_code: outcome.exit_code,
        })
    }

    /// Remove images provisioned by other schema versions.
    pub fn clean(&self) -> Result<CleanReport, CoreError> {
        self.note("Cleaning up old images...");
        janitor::clean(self.engine, &|msg| self.note(msg))
    }
}
