//! Labels that mark an image as owned by ddb.
//!
//! An image is a cache hit only when both labels match the request exactly.
//! Images without the version label are never touched.

use std::collections::HashMap;

pub const DIST_LABEL: &str = "ddb-image-dist";
pub const VERSION_LABEL: &str = "ddb-version";

/// Bumped whenever the provisioning recipe changes incompatibly.
pub const SCHEMA_VERSION: &str = "0";

pub fn owned_labels(dist: &str) -> HashMap<String, String> {
    HashMap::from([
        (DIST_LABEL.to_owned(), dist.to_owned()),
        (VERSION_LABEL.to_owned(), SCHEMA_VERSION.to_owned()),
    ])
}

/// Image reference for a provisioned `dist`, e.g. `ddb-image-ubuntu:20.04`.
pub fn image_tag(dist: &str) -> String {
    format!("ddb-image-{dist}")
}

pub fn matches(labels: &HashMap<String, String>, dist: &str) -> bool {
    matches_version(labels, dist, SCHEMA_VERSION)
}

pub fn matches_version(labels: &HashMap<String, String>, dist: &str, version: &str) -> bool {
    labels.get(DIST_LABEL).map(String::as_str) == Some(dist)
        && labels.get(VERSION_LABEL).map(String::as_str) == Some(version)
}

pub fn is_stale(labels: &HashMap<String, String>) -> bool {
    is_stale_for(labels, SCHEMA_VERSION)
}

/// Owned by some ddb version, but not by `version`.
pub fn is_stale_for(labels: &HashMap<String, String>, version: &str) -> bool {
    labels
        .get(VERSION_LABEL)
        .is_some_and(|found| found != version)
}
