//! Lifecycle states of an exporter run.

use std::fmt;

use serde::Serialize;

/// Where the most recent run of an [`Exporter`](super::runner::Exporter)
/// stands.
///
/// `NotStarted -> Running -> {Completed, TimedOut, Aborted}`. A run that
/// fails before the process is created never leaves `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotStarted,
    Running,
    /// The process exited on its own (successfully or not).
    Completed,
    /// The execution timeout elapsed and the process was killed.
    TimedOut,
    /// The process was killed on request, or after a streaming failure.
    Aborted,
}

impl RunState {
    /// `true` once the run has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!RunState::NotStarted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(RunState::Aborted.is_terminal());
    }

    #[test]
    fn display_matches_serialized_name() {
        for state in [
            RunState::NotStarted,
            RunState::Running,
            RunState::Completed,
            RunState::TimedOut,
            RunState::Aborted,
        ] {
            let json = serde_json::to_string(&state).expect("serialize");
            assert_eq!(json, format!("\"{state}\""));
        }
    }
}
