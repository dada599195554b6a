// Shared helpers for integration tests.
//
// Provides a temporary-directory-backed plan fixture so each integration
// test can write a plan file and scratch state without repeating filesystem
// boilerplate.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// An isolated plan fixture backed by a [`tempfile::TempDir`].
///
/// The directory holds both the plan file and any scratch files the plan's
/// steps touch; it is deleted automatically when dropped.
pub struct PlanFixture {
    dir: tempfile::TempDir,
}

impl PlanFixture {
    /// Create an empty fixture.
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    /// Root of the scratch directory.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `name` inside the scratch directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `content` as the fixture's plan file and return its path.
    ///
    /// Occurrences of `{root}` in `content` are replaced with the scratch
    /// directory path, so plans can reference fixture-local files.
    pub fn write_plan(&self, content: &str) -> PathBuf {
        let resolved = content.replace("{root}", &self.dir.path().display().to_string());
        let path = self.path("plan.toml");
        std::fs::write(&path, resolved).expect("write plan file");
        path
    }
}
