//! `bcpw-core`: drives an external bulk-copy export tool as a child process.
//!
//! Builds the tool's command line, launches it, pumps data through its
//! standard streams or a named pipe, enforces execution timeouts, supports
//! abort, and classifies failures from exit codes and stderr.

pub mod config;
pub mod error;
pub mod export;

pub use config::{ExporterConfig, ProcessPriority};
pub use error::{ConfigError, ExportError};
pub use export::events::{OutputLine, StreamKind};
pub use export::runner::{ExportOutcome, ExportRequest, Exporter};
pub use export::status::RunState;
