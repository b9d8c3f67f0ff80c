use ddb_core::labels::{self, DIST_LABEL, SCHEMA_VERSION, VERSION_LABEL};
use ddb_core::runner::run_with_cancel;
use ddb_core::{resolver, CoreError, PackageBuild, RunRequest, Session};
use ddb_engine::mock::{MockCall, MockChunk};
use ddb_engine::{BuildEvent, ContainerEngine, MockEngine, RemovalFailure};
use std::path::PathBuf;

const DIST: &str = "debian:bullseye";

fn package(force: bool) -> PackageBuild {
    PackageBuild {
        dist: DIST.to_owned(),
        run: RunRequest {
            source_dir: PathBuf::from("/work/hello"),
            output_dir: PathBuf::from("/work/out"),
            dependency_dir: Some(PathBuf::from("/work/deps")),
        },
        force,
    }
}

fn removals(engine: &MockEngine) -> usize {
    engine.count_calls(|c| matches!(c, MockCall::RemoveContainer(_)))
}

fn builds(engine: &MockEngine) -> usize {
    engine.count_calls(|c| matches!(c, MockCall::BuildImage(_)))
}

#[test]
fn cached_image_is_reused_without_building() {
    let engine = MockEngine::new();
    engine.add_image(
        "sha256:cached",
        &[(DIST_LABEL, DIST), (VERSION_LABEL, SCHEMA_VERSION)],
        10,
    );
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.image_id, "sha256:cached");
    assert!(!report.built);
    assert_eq!(builds(&engine), 0);
    assert_eq!(engine.last_run().unwrap().image, "sha256:cached");
}

#[test]
fn first_build_provisions_then_second_build_hits_cache() {
    let engine = MockEngine::new();
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let first = session.build(&package(false), &mut out).unwrap();
    let second = session.build(&package(false), &mut out).unwrap();

    assert!(first.built);
    assert!(!second.built);
    assert_eq!(first.image_id, second.image_id);
    assert_eq!(builds(&engine), 1);

    let build = engine.last_build().unwrap();
    assert_eq!(build.tag, labels::image_tag(DIST));
    assert_eq!(build.labels, labels::owned_labels(DIST));
}

#[test]
fn forced_build_supersedes_the_cached_image() {
    let engine = MockEngine::new();
    engine.add_image(
        "sha256:old",
        &[(DIST_LABEL, DIST), (VERSION_LABEL, SCHEMA_VERSION)],
        10,
    );
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(true), &mut out).unwrap();
    assert!(report.built);
    assert_ne!(report.image_id, "sha256:old");

    let found = resolver::find_image(&engine, DIST).unwrap().unwrap();
    assert_eq!(found.id, report.image_id);
    assert_eq!(engine.images().len(), 2);
}

#[test]
fn images_for_other_distributions_are_ignored() {
    let engine = MockEngine::new();
    engine.add_image(
        "sha256:focal",
        &[(DIST_LABEL, "ubuntu:20.04"), (VERSION_LABEL, SCHEMA_VERSION)],
        10,
    );
    engine.add_image("sha256:legacy", &[(DIST_LABEL, DIST), (VERSION_LABEL, "old")], 11);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();
    assert!(report.built);
    assert_eq!(builds(&engine), 1);
}

#[test]
fn build_output_and_container_output_share_the_sink() {
    let engine = MockEngine::new();
    engine.script_build(vec![
        BuildEvent::Status("pulling base".into()),
        BuildEvent::Log("Step 1/3 : FROM debian:bullseye\n".into()),
        BuildEvent::Success("sha256:fresh".into()),
    ]);
    engine.script_output(vec![
        MockChunk::text("dpkg-buildpackage: info: source package hello\n"),
        MockChunk::text("dpkg-buildpackage: info: binary-only upload\n"),
    ]);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.image_id, "sha256:fresh");
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Step 1/3 : FROM debian:bullseye\n\
         dpkg-buildpackage: info: source package hello\n\
         dpkg-buildpackage: info: binary-only upload\n"
    );
}

#[test]
fn failed_image_build_creates_no_container() {
    let engine = MockEngine::new();
    engine.script_build(vec![
        BuildEvent::Log("Step 2/3 : RUN /setup.sh\n".into()),
        BuildEvent::Error("The command '/bin/sh -c /setup.sh' returned 100".into()),
    ]);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let err = session.build(&package(false), &mut out).unwrap_err();

    assert!(matches!(err, CoreError::BuildFailed(ref m) if m.contains("returned 100")));
    assert_eq!(
        engine.count_calls(|c| matches!(c, MockCall::CreateContainer(_))),
        0
    );
}

#[test]
fn container_is_removed_after_success() {
    let engine = MockEngine::new();
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.exit_code, Some(0));
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn container_is_removed_after_failing_package_build() {
    let engine = MockEngine::new();
    engine.set_exit_code(2);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.exit_code, Some(2));
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn container_is_removed_after_stream_failure() {
    let engine = MockEngine::new();
    engine.script_output(vec![
        MockChunk::text("building...\n"),
        MockChunk::Fail("connection reset".into()),
    ]);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    assert!(session.build(&package(false), &mut out).is_err());
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn container_is_removed_after_interrupt() {
    let engine = MockEngine::new();
    engine.add_image(
        "sha256:cached",
        &[(DIST_LABEL, DIST), (VERSION_LABEL, SCHEMA_VERSION)],
        1,
    );
    engine.script_output(vec![MockChunk::text("one\n"), MockChunk::text("two\n")]);

    let mut out = Vec::new();
    let err = run_with_cancel(&engine, "sha256:cached", &package(false).run, &mut out, || true)
        .unwrap_err();

    assert!(matches!(err, CoreError::Interrupted));
    assert_eq!(out, b"one\n");
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn failed_package_build_is_reported_under_auto_remove() {
    let engine = MockEngine::new();
    engine.set_auto_remove_on_exit(true);
    engine.set_exit_code(2);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.exit_code, Some(2));
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn vanished_container_still_counts_as_cleaned() {
    let engine = MockEngine::new();
    engine.set_vanish_on_exit(true);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();

    assert_eq!(report.exit_code, None);
    assert_eq!(removals(&engine), 1);
    assert!(engine.live_containers().is_empty());
}

#[test]
fn unexpected_cleanup_failure_is_reported() {
    let engine = MockEngine::new();
    engine.fail_container_removal(RemovalFailure::Other);
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let err = session.build(&package(false), &mut out).unwrap_err();
    assert!(matches!(err, CoreError::Engine(_)));
    assert_eq!(removals(&engine), 1);
}

#[test]
fn clean_removes_only_stale_images_and_is_idempotent() {
    let engine = MockEngine::new();
    engine.add_image(
        "current",
        &[(DIST_LABEL, DIST), (VERSION_LABEL, SCHEMA_VERSION)],
        1,
    );
    engine.add_image("old", &[(DIST_LABEL, DIST), (VERSION_LABEL, "old")], 2);
    engine.add_image("unlabeled", &[], 3);
    let session = Session::new(&engine).with_notifier(|_| {});

    let first = session.clean().unwrap();
    assert_eq!(first.removed, ["old"]);

    let second = session.clean().unwrap();
    assert!(!second.cleaned());

    let left: Vec<String> = engine.list_images().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(left, ["current", "unlabeled"]);
}

#[test]
fn clean_leaves_images_built_by_this_version() {
    let engine = MockEngine::new();
    let session = Session::new(&engine).with_notifier(|_| {});

    let mut out = Vec::new();
    let report = session.build(&package(false), &mut out).unwrap();
    assert!(!session.clean().unwrap().cleaned());

    let found = resolver::find_image(&engine, DIST).unwrap().unwrap();
    assert_eq!(found.id, report.image_id);
}
