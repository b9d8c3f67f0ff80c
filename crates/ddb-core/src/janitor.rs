use crate::labels;
use crate::CoreError;
use ddb_engine::ContainerEngine;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CleanReport {
    /// Ids of the removed images, in listing order.
    pub removed: Vec<String>,
}

impl CleanReport {
    pub fn cleaned(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Remove every image whose schema-version label exists and is not current.
///
/// Images without the label belong to someone else and are left alone. The
/// first failed removal aborts the sweep.
pub fn clean(
    engine: &dyn ContainerEngine,
    progress: &dyn Fn(&str),
) -> Result<CleanReport, CoreError> {
    let mut report = CleanReport::default();
    for image in engine.list_images()? {
        if !labels::is_stale(&image.labels) {
            continue;
        }
        info!(
            "removing image {} (schema version {})",
            image.id,
            image
                .labels
                .get(labels::VERSION_LABEL)
                .map_or("?", String::as_str)
        );
        progress(&format!("Removing old image {}...", image.id));
        engine.remove_image(&image.id)?;
        report.removed.push(image.id);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{DIST_LABEL, SCHEMA_VERSION, VERSION_LABEL};
    use ddb_engine::{EngineError, MockEngine, RemovalFailure};

    fn seeded() -> MockEngine {
        let engine = MockEngine::new();
        engine.add_image(
            "current",
            &[(DIST_LABEL, "ubuntu:20.04"), (VERSION_LABEL, SCHEMA_VERSION)],
            1,
        );
        engine.add_image(
            "old",
            &[(DIST_LABEL, "ubuntu:20.04"), (VERSION_LABEL, "old")],
            2,
        );
        engine.add_image("unlabeled", &[], 3);
        engine
    }

    #[test]
    fn removes_exactly_the_stale_images() {
        let engine = seeded();
        let report = clean(&engine, &|_| {}).unwrap();

        assert_eq!(report.removed, ["old"]);
        assert!(report.cleaned());
        let left: Vec<String> = engine.images().into_iter().map(|i| i.id).collect();
        assert_eq!(left, ["current", "unlabeled"]);
    }

    #[test]
    fn second_sweep_removes_nothing() {
        let engine = seeded();
        clean(&engine, &|_| {}).unwrap();
        let report = clean(&engine, &|_| {}).unwrap();

        assert!(!report.cleaned());
        assert_eq!(engine.images().len(), 2);
    }

    #[test]
    fn version_label_alone_is_enough_to_be_owned() {
        let engine = MockEngine::new();
        engine.add_image("versioned", &[(VERSION_LABEL, "legacy")], 1);
        engine.add_image("dist-only", &[(DIST_LABEL, "debian:buster")], 2);

        let report = clean(&engine, &|_| {}).unwrap();
        assert_eq!(report.removed, ["versioned"]);
    }

    #[test]
    fn removal_failure_propagates() {
        let engine = seeded();
        engine.fail_image_removal("old", RemovalFailure::Conflict);

        let err = clean(&engine, &|_| {}).unwrap_err();
        assert!(matches!(err, CoreError::Engine(EngineError::Removal { .. })));
        assert_eq!(engine.images().len(), 3);
    }
}
