#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use bcpw_core::{Exporter, ExporterConfig};

/// A fake export tool living in its own temp directory.
///
/// The script receives the real command line, so `$1` is the query, `$2`
/// the subcommand and `$3` the destination.
pub struct FakeTool {
    pub dir: tempfile::TempDir,
}

impl FakeTool {
    /// Create a `bcp` shell script with the given body.
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        write_script(dir.path(), body);
        Self { dir }
    }

    /// Build a test `ExporterConfig` pointing at this tool.
    pub fn config(&self) -> ExporterConfig {
        ExporterConfig::new("db01", "exporter", "s3cret").with_tool_path(self.dir.path())
    }

    pub fn exporter(&self) -> Exporter {
        Exporter::new(self.config())
    }

    pub fn exporter_with_timeout(&self, timeout: Duration) -> Exporter {
        Exporter::new(self.config().with_execution_timeout(Some(timeout)))
    }
}

/// Write an executable `bcp` shell script into `dir`.
pub fn write_script(dir: &Path, body: &str) {
    let path = dir.join("bcp");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write tool script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod tool script");
}
