use std::path::PathBuf;
use std::time::Duration;

/// Exit code reported when the process was aborted before completion.
pub const ABORTED_CODE: i32 = -1;

/// Exit code reported when the process exceeded its execution timeout.
pub const TIMEOUT_CODE: i32 = -2;

/// Code shared by every failure that happened before the tool could run.
pub const SETUP_FAILURE_CODE: i32 = -3;

/// Code for I/O failures while pumping data to or from the tool.
pub const IO_FAILURE_CODE: i32 = -4;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot execute bcp command: query is missing")]
    QueryMissing,

    #[error("cannot execute bcp command: invalid query template: {0}")]
    InvalidQueryTemplate(String),

    #[error("cannot execute bcp command: tool path not found: {}", .0.display())]
    ToolPathNotFound(PathBuf),

    #[error("cannot execute bcp command: permission denied: {0}")]
    PermissionDenied(String),

    #[error("cannot execute bcp command: an export is already running on this instance")]
    AlreadyRunning,

    #[error("cannot execute bcp command: failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot execute bcp command: failed to create pipe endpoint: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("I/O error while streaming bcp data: {0}")]
    Io(#[from] std::io::Error),

    /// The tool exited with a non-zero code. The message is the captured
    /// stderr, one line per entry, in emission order.
    #[error("{stderr}")]
    ToolFailed { exit_code: i32, stderr: String },

    #[error("bcp process exceeded execution timeout ({timeout:?}) and was aborted")]
    Timeout { timeout: Duration },

    #[error("bcp process was aborted")]
    Aborted,
}

impl ExportError {
    /// Numeric code carried by this failure.
    ///
    /// Tool failures carry the tool's own exit code; the others use the
    /// negative sentinels defined in this module.
    pub fn code(&self) -> i32 {
        match self {
            Self::ToolFailed { exit_code, .. } => *exit_code,
            Self::Timeout { .. } => TIMEOUT_CODE,
            Self::Aborted => ABORTED_CODE,
            Self::Io(_) => IO_FAILURE_CODE,
            _ => SETUP_FAILURE_CODE,
        }
    }

    /// `true` when the failure happened before the tool produced an exit code.
    pub fn is_setup_failure(&self) -> bool {
        self.code() == SETUP_FAILURE_CODE
    }
}

/// Errors raised while loading [`ExporterConfig`](crate::config::ExporterConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
