//! Line events emitted while the export tool runs.
//!
//! Stderr lines are always published. Stdout lines are published only when
//! the caller did not ask for stdout to be captured into a stream.

use serde::Serialize;
use tokio::sync::broadcast;

/// Broadcast channel capacity for line events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Which standard stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A single line read from the child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: StreamKind,
    /// Line text without its trailing newline.
    pub line: String,
}

/// Create the sender side of the line event channel.
pub fn channel() -> broadcast::Sender<OutputLine> {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish a line. Having no subscribers is not an error.
pub fn publish(tx: &broadcast::Sender<OutputLine>, stream: StreamKind, line: &str) {
    let _ = tx.send(OutputLine {
        stream,
        line: line.to_string(),
    });
}
