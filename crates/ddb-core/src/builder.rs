use crate::labels;
use crate::CoreError;
use ddb_engine::{BuildEvent, BuildRequest, ContainerEngine, ImageRecord};
use std::io::Write;
use tracing::{debug, info};

/// Provisioning script baked into every image at `/setup.sh`.
pub const SETUP_SCRIPT: &str = include_str!("../scripts/setup.sh");

pub fn recipe(dist: &str) -> String {
    format!("FROM {dist}\nCOPY setup.sh /setup.sh\nRUN bash /setup.sh\n")
}

/// Tar archive with exactly the recipe and the provisioning script.
pub fn build_context(dist: &str) -> Result<Vec<u8>, CoreError> {
    let mut ar = tar::Builder::new(Vec::new());
    append_file(&mut ar, "Dockerfile", recipe(dist).as_bytes(), 0o644)?;
    append_file(&mut ar, "setup.sh", SETUP_SCRIPT.as_bytes(), 0o755)?;
    Ok(ar.into_inner()?)
}

fn append_file(
    ar: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> Result<(), CoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    // Fixed metadata keeps identical inputs byte-identical.
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    ar.append_data(&mut header, name, data)?;
    Ok(())
}

/// Provision an image for `dist`, copying build output to `out` as it arrives.
///
/// The first error event fails the build and the first image id ends it; no
/// event after either is pulled. A stream that ends with neither breaks the
/// engine's contract and is reported as `CoreError::BuildStreamEnded`.
pub fn build_image(
    engine: &dyn ContainerEngine,
    dist: &str,
    out: &mut dyn Write,
) -> Result<ImageRecord, CoreError> {
    let request = BuildRequest {
        tag: labels::image_tag(dist),
        labels: labels::owned_labels(dist),
        context: build_context(dist)?,
    };
    info!("building image {}", request.tag);

    for event in engine.build_image(request)? {
        match event? {
            BuildEvent::Error(message) => return Err(CoreError::BuildFailed(message)),
            BuildEvent::Success(id) => {
                debug!("build produced {id}");
                return Ok(engine.inspect_image(&id)?);
            }
            BuildEvent::Status(_) => {}
            BuildEvent::Log(line) => {
                out.write_all(line.as_bytes())?;
                out.flush()?;
            }
        }
    }

    Err(CoreError::BuildStreamEnded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{DIST_LABEL, SCHEMA_VERSION, VERSION_LABEL};
    use ddb_engine::MockEngine;
    use std::io::Read;

    fn log(s: &str) -> BuildEvent {
        BuildEvent::Log(s.to_owned())
    }

    #[test]
    fn recipe_derives_from_distribution() {
        let recipe = recipe("i386/ubuntu:20.04");
        let lines: Vec<&str> = recipe.lines().collect();
        assert_eq!(
            lines,
            [
                "FROM i386/ubuntu:20.04",
                "COPY setup.sh /setup.sh",
                "RUN bash /setup.sh"
            ]
        );
    }

    #[test]
    fn context_holds_exactly_recipe_and_script() {
        let context = build_context("debian:bookworm").unwrap();
        let mut archive = tar::Archive::new(context.as_slice());

        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            entries.push((path, mode, body));
        }

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "Dockerfile");
        assert_eq!(entries[0].2, recipe("debian:bookworm"));
        assert_eq!(entries[1].0, "setup.sh");
        assert_eq!(entries[1].1, 0o755);
        assert_eq!(entries[1].2, SETUP_SCRIPT);
    }

    #[test]
    fn context_is_reproducible() {
        assert_eq!(
            build_context("ubuntu:20.04").unwrap(),
            build_context("ubuntu:20.04").unwrap()
        );
    }

    #[test]
    fn build_is_tagged_and_labeled() {
        let engine = MockEngine::new();
        let mut out = Vec::new();
        let image = build_image(&engine, "ubuntu:20.04", &mut out).unwrap();

        let request = engine.last_build().unwrap();
        assert_eq!(request.tag, "ddb-image-ubuntu:20.04");
        assert_eq!(request.labels.get(DIST_LABEL).unwrap(), "ubuntu:20.04");
        assert_eq!(request.labels.get(VERSION_LABEL).unwrap(), SCHEMA_VERSION);
        assert_eq!(image.labels, request.labels);
        assert!(String::from_utf8(out).unwrap().contains("Step 1/3"));
    }

    #[test]
    fn log_lines_printed_in_order_and_status_ignored() {
        let engine = MockEngine::new();
        engine.script_build(vec![
            log("one\n"),
            BuildEvent::Status("Downloading".to_owned()),
            log("two"),
            log("\n"),
            log("three\n"),
            BuildEvent::Success("sha256:built".to_owned()),
        ]);
        let mut out = Vec::new();
        let image = build_image(&engine, "ubuntu:20.04", &mut out).unwrap();

        assert_eq!(image.id, "sha256:built");
        assert_eq!(String::from_utf8(out).unwrap(), "one\ntwo\nthree\n");
    }

    #[test]
    fn error_event_is_fatal_and_stops_the_stream() {
        let engine = MockEngine::new();
        engine.script_build(vec![
            log("Step 3/3 : RUN bash /setup.sh\n"),
            BuildEvent::Error("returned a non-zero code: 100".to_owned()),
            log("after error\n"),
            BuildEvent::Success("sha256:late".to_owned()),
        ]);
        let mut out = Vec::new();
        let err = build_image(&engine, "ubuntu:20.04", &mut out).unwrap_err();

        assert!(matches!(err, CoreError::BuildFailed(ref m) if m.contains("code: 100")));
        assert_eq!(engine.build_events_pulled(), 2);
        assert!(!String::from_utf8(out).unwrap().contains("after error"));
        assert!(engine.images().is_empty());
    }

    #[test]
    fn interrupt_mid_build_stops_the_stream() {
        let engine = MockEngine::new();
        engine.script_build(vec![
            log("Step 1/3 : FROM ubuntu:20.04\n"),
            log("Step 2/3 : COPY setup.sh /setup.sh\n"),
            BuildEvent::Success("sha256:never".to_owned()),
        ]);
        engine.interrupt_build_after(1);
        let mut out = Vec::new();
        let err = build_image(&engine, "ubuntu:20.04", &mut out).unwrap_err();

        assert!(matches!(err, CoreError::Interrupted));
        assert_eq!(engine.build_events_pulled(), 1);
        assert_eq!(String::from_utf8(out).unwrap(), "Step 1/3 : FROM ubuntu:20.04\n");
        assert!(engine.images().is_empty());
    }

    #[test]
    fn success_stops_the_stream() {
        let engine = MockEngine::new();
        engine.script_build(vec![
            BuildEvent::Success("sha256:first".to_owned()),
            log("trailing\n"),
            BuildEvent::Error("never seen".to_owned()),
        ]);
        let mut out = Vec::new();
        let image = build_image(&engine, "ubuntu:20.04", &mut out).unwrap();

        assert_eq!(image.id, "sha256:first");
        assert_eq!(engine.build_events_pulled(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn stream_without_result_is_a_protocol_violation() {
        let engine = MockEngine::new();
        engine.script_build(vec![log("partial\n"), BuildEvent::Status("x".to_owned())]);
        let mut out = Vec::new();
        let err = build_image(&engine, "ubuntu:20.04", &mut out).unwrap_err();

        assert!(matches!(err, CoreError::BuildStreamEnded));
        assert_eq!(String::from_utf8(out).unwrap(), "partial\n");
    }
}
