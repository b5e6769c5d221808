//! Turns a finished process into success or a typed failure.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::error::{ExportError, ABORTED_CODE};

/// Offset added to the signal number for a tool killed by a signal, as
/// shells report it.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Exit code plus the stderr lines captured while the tool ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub exit_code: i32,
    /// Stderr lines in the order the tool emitted them.
    pub stderr_lines: Vec<String>,
}

impl ErrorRecord {
    /// Build a record from an exit status.
    ///
    /// A process killed by a signal is recorded as `128 + signal`, so an
    /// external SIGKILL (137) stays distinct from an orchestrator abort.
    pub fn from_status(status: ExitStatus, stderr_lines: Vec<String>) -> Self {
        let exit_code = status
            .code()
            .or_else(|| status.signal().map(|signal| SIGNAL_EXIT_BASE + signal))
            .unwrap_or(ABORTED_CODE);
        Self {
            exit_code,
            stderr_lines,
        }
    }

    /// Stderr lines joined by `\n`.
    pub fn message(&self) -> String {
        self.stderr_lines.join("\n")
    }

    /// Exit code 0 is success whatever stderr says; anything else is a
    /// [`ExportError::ToolFailed`] carrying the code and the stderr text.
    ///
    /// On success the stderr lines are handed back for reporting.
    pub fn into_result(self) -> Result<Vec<String>, ExportError> {
        if self.exit_code == 0 {
            return Ok(self.stderr_lines);
        }
        Err(ExportError::ToolFailed {
            exit_code: self.exit_code,
            stderr: self.message(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn zero_exit_succeeds_despite_stderr() {
        let record = ErrorRecord::from_status(
            ExitStatus::from_raw(0),
            lines(&["Starting copy...", "1000 rows copied."]),
        );
        let kept = record.into_result().expect("success");
        assert_eq!(kept, lines(&["Starting copy...", "1000 rows copied."]));
    }

    #[test]
    fn nonzero_exit_carries_code_and_ordered_stderr() {
        // Raw wait status for `exit(3)`.
        let record = ErrorRecord::from_status(
            ExitStatus::from_raw(3 << 8),
            lines(&["SQLState = 42S02", "Invalid object name 'dbo.Missing'"]),
        );
        assert_eq!(record.exit_code, 3);
        let err = record.into_result().unwrap_err();
        assert_matches!(err, ExportError::ToolFailed { exit_code: 3, .. });
        assert_eq!(err.code(), 3);
        assert_eq!(
            err.to_string(),
            "SQLState = 42S02\nInvalid object name 'dbo.Missing'"
        );
    }

    #[test]
    fn nonzero_exit_without_stderr_has_empty_message() {
        let record = ErrorRecord {
            exit_code: 1,
            stderr_lines: Vec::new(),
        };
        let err = record.into_result().unwrap_err();
        assert_eq!(err.to_string(), "");
    }

    #[test]
    fn signal_death_is_recorded_shell_style() {
        // Raw wait status for termination by SIGKILL.
        let record = ErrorRecord::from_status(
            ExitStatus::from_raw(libc::SIGKILL),
            lines(&["Killed"]),
        );
        assert_eq!(record.exit_code, 137);
        let err = record.into_result().unwrap_err();
        assert_matches!(err, ExportError::ToolFailed { exit_code: 137, .. });
        assert_ne!(err.code(), ExportError::Aborted.code());
    }

    #[test]
    fn sigterm_is_distinct_from_sigkill() {
        let record = ErrorRecord::from_status(ExitStatus::from_raw(libc::SIGTERM), Vec::new());
        assert_eq!(record.exit_code, 143);
    }
}
