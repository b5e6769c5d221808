//! Starts the export tool as a child process.
//!
//! Resolves the executable against the configured tool directory, checks
//! that it can be executed, spawns it with the requested stream redirection
//! and applies the configured scheduling priority.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::command::CommandLine;
use crate::config::{ExporterConfig, ProcessPriority};
use crate::error::ExportError;

/// Which of the child's standard streams are redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirects {
    /// Pipe stdin (only when the caller supplies an input stream).
    pub stdin: bool,
}

/// Work out which program to run.
///
/// `<tool_path>/<exe_name>` is preferred when it exists; otherwise the bare
/// executable name is left to `PATH` lookup. A tool directory that does not
/// exist is a setup failure, as is a resolved file without execute
/// permission.
///
/// The returned path is absolute, since the child starts in the tool
/// directory and a relative program would be looked up from there.
pub async fn resolve_program(config: &ExporterConfig) -> Result<PathBuf, ExportError> {
    let tool_dir = tokio::fs::canonicalize(&config.tool_path)
        .await
        .map_err(|_| ExportError::ToolPathNotFound(config.tool_path.clone()))?;
    if !tokio::fs::metadata(&tool_dir).await.is_ok_and(|meta| meta.is_dir()) {
        return Err(ExportError::ToolPathNotFound(config.tool_path.clone()));
    }

    let candidate = tool_dir.join(&config.exe_name);
    match tokio::fs::metadata(&candidate).await {
        Ok(meta) if meta.is_file() => {
            let mode = meta.permissions().mode();
            if mode & 0o111 == 0 {
                return Err(ExportError::PermissionDenied(format!(
                    "{} is not executable (mode {mode:#o})",
                    candidate.display()
                )));
            }
            Ok(candidate)
        }
        _ => Ok(PathBuf::from(&config.exe_name)),
    }
}

/// Spawn the tool for `command`.
///
/// Stderr and stdout are always piped; stdin is piped only when requested.
/// The working directory is the tool directory. The child is killed if its
/// handle is dropped before it has been reaped.
pub fn spawn(
    program: &Path,
    config: &ExporterConfig,
    command: &CommandLine,
    redirects: Redirects,
) -> Result<Child, ExportError> {
    let mut cmd = Command::new(program);
    cmd.args(command.args())
        .current_dir(&config.tool_path)
        .stdin(if redirects.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ExportError::Spawn {
        program: program.display().to_string(),
        source,
    })?;

    tracing::info!(
        pid = child.id(),
        program = %program.display(),
        command = %command,
        "Started bcp process",
    );

    if config.priority != ProcessPriority::Normal {
        if let Some(pid) = child.id() {
            apply_priority(pid, config.priority);
        }
    }

    Ok(child)
}

/// Set the scheduling priority of `pid`. Best-effort: failures are logged.
pub fn apply_priority(pid: u32, priority: ProcessPriority) {
    let nice = priority.nice_value();
    // SAFETY: setpriority only reads its scalar arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(pid, ?priority, error = %err, "Failed to set bcp process priority");
    } else {
        tracing::debug!(pid, ?priority, nice, "Applied bcp process priority");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::export::test_helpers::{config_for, write_tool};

    #[tokio::test]
    async fn missing_tool_directory_is_rejected() {
        let config = ExporterConfig::new("s", "u", "p").with_tool_path("/nonexistent/bcp/dir");
        let err = resolve_program(&config).await.unwrap_err();
        assert_matches!(err, ExportError::ToolPathNotFound(_));
        assert!(err.is_setup_failure());
    }

    #[tokio::test]
    async fn tool_in_directory_is_preferred() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_tool(dir.path(), "exit 0\n");
        let config = config_for(dir.path());
        let program = resolve_program(&config).await.expect("resolve");
        let expected = dir.path().canonicalize().expect("canonicalize").join("bcp");
        assert_eq!(program, expected);
    }

    #[tokio::test]
    async fn relative_tool_directory_resolves_to_absolute_program() {
        let dir = tempfile::tempdir_in(".").expect("temp dir");
        write_tool(dir.path(), "exit 0\n");
        // Name relative to the test's working directory.
        let relative = PathBuf::from(dir.path().file_name().expect("dir name"));
        let config = config_for(&relative);

        let program = resolve_program(&config).await.expect("resolve");
        assert!(program.is_absolute());
        assert_eq!(program, dir.path().canonicalize().expect("canonicalize").join("bcp"));

        let command = CommandLine::build(&config, "out.csv", "SELECT 1");
        let mut child = spawn(&program, &config, &command, Redirects { stdin: false })
            .expect("spawn from a relative tool directory");
        let status = child.wait().await.expect("wait");
        assert!(status.success());
    }

    #[tokio::test]
    async fn falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config_for(dir.path()).with_exe_name("true");
        let program = resolve_program(&config).await.expect("resolve");
        assert_eq!(program, PathBuf::from("true"));
    }

    #[tokio::test]
    async fn non_executable_tool_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("bcp"), "#!/bin/sh\n").expect("write");
        let config = config_for(dir.path());
        let err = resolve_program(&config).await.unwrap_err();
        assert_matches!(err, ExportError::PermissionDenied(_));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_setup_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config_for(dir.path());
        let command = CommandLine::build(&config, "out.csv", "SELECT 1");
        let err = spawn(
            Path::new("definitely-not-a-real-bcp-binary"),
            &config,
            &command,
            Redirects { stdin: false },
        )
        .unwrap_err();
        assert_matches!(err, ExportError::Spawn { .. });
        assert!(err.is_setup_failure());
    }

    #[tokio::test]
    async fn lowering_priority_is_applied() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_tool(dir.path(), "sleep 5\n");
        let config = config_for(dir.path()).with_priority(ProcessPriority::Idle);
        let program = resolve_program(&config).await.expect("resolve");
        let command = CommandLine::build(&config, "out.csv", "SELECT 1");
        let mut child = spawn(&program, &config, &command, Redirects { stdin: false })
            .expect("spawn");

        let pid = child.id().expect("pid");
        // SAFETY: getpriority only reads its scalar arguments.
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
        assert_eq!(nice, 19);

        child.kill().await.expect("kill");
    }
}
