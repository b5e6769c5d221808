//! Orchestration of the external bulk-copy tool.
//!
//! The tool is an opaque executable: it gets a command line, optional stdin
//! data, and either writes its export to stdout or to the destination it was
//! given. Everything here is about driving that process safely: building the
//! command line, launching, pumping bytes, enforcing the deadline, and
//! turning exit codes and stderr into typed errors.

pub mod classify;
pub mod command;
pub mod events;
pub mod launcher;
pub mod pipe;
pub mod pump;
pub mod runner;
pub mod status;

/// Shared test helpers for exporter tests.
#[cfg(test)]
pub(crate) mod test_helpers {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use crate::config::ExporterConfig;

    /// Write an executable `bcp` shell script into `dir`.
    pub fn write_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("bcp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write tool script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod tool script");
        path
    }

    /// Config pointing at a fake tool in `dir`.
    pub fn config_for(dir: &Path) -> ExporterConfig {
        ExporterConfig::new("db01", "exporter", "s3cret").with_tool_path(dir)
    }
}
