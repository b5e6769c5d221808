//! Exporter configuration: connection credentials and tool settings.
//!
//! [`ExporterConfig`] is fixed for the lifetime of an
//! [`Exporter`](crate::export::runner::Exporter); everything that varies per
//! run lives in [`ExportRequest`](crate::export::runner::ExportRequest).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default executable name of the export tool.
pub const DEFAULT_EXE_NAME: &str = "bcp";

/// Default tool subcommand (export the result of a query).
pub const DEFAULT_SUBCOMMAND: &str = "queryout";

/// Default data format flags: character mode, comma field terminator.
pub const DEFAULT_FORMAT_FLAGS: [&str; 2] = ["-c", "-t,"];

/// Env var overriding the directory the tool is launched from.
pub const TOOL_PATH_ENV: &str = "BCP_TOOL_PATH";

/// Scheduling priority applied to the child process after start.
///
/// Maps onto Unix nice values. Anything above `Normal` usually requires
/// elevated privileges; failures to apply it are logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPriority {
    Idle,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl ProcessPriority {
    /// Nice value passed to `setpriority(2)`.
    pub fn nice_value(self) -> i32 {
        match self {
            Self::Idle => 19,
            Self::BelowNormal => 10,
            Self::Normal => 0,
            Self::AboveNormal => -5,
            Self::High => -10,
            Self::RealTime => -20,
        }
    }
}

impl FromStr for ProcessPriority {
    type Err = String;

    /// Case-insensitive; `-` and `_` are ignored (`below-normal`,
    /// `BelowNormal` and `below_normal` are equivalent).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "idle" => Ok(Self::Idle),
            "belownormal" => Ok(Self::BelowNormal),
            "normal" => Ok(Self::Normal),
            "abovenormal" => Ok(Self::AboveNormal),
            "high" => Ok(Self::High),
            "realtime" => Ok(Self::RealTime),
            _ => Err(format!("unknown process priority '{s}'")),
        }
    }
}

/// Connection and tool settings for an exporter instance.
#[derive(Clone)]
pub struct ExporterConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    /// Directory the tool lives in; also the child's working directory.
    pub tool_path: PathBuf,
    /// Executable name, resolved inside `tool_path` first, then on `PATH`.
    pub exe_name: String,
    /// Tool subcommand placed after the query (default `queryout`).
    pub subcommand: String,
    /// Data format flags placed after the destination.
    pub format_flags: Vec<String>,
    /// Extra flags appended after the format flags.
    pub custom_args: Vec<String>,
    pub priority: ProcessPriority,
    /// Deadline measured from process start. `None` waits indefinitely.
    pub execution_timeout: Option<Duration>,
}

impl ExporterConfig {
    /// Create a configuration with default tool settings.
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            tool_path: default_tool_path(),
            exe_name: DEFAULT_EXE_NAME.to_string(),
            subcommand: DEFAULT_SUBCOMMAND.to_string(),
            format_flags: DEFAULT_FORMAT_FLAGS.iter().map(|f| f.to_string()).collect(),
            custom_args: Vec::new(),
            priority: ProcessPriority::Normal,
            execution_timeout: None,
        }
    }

    pub fn with_tool_path(mut self, tool_path: impl Into<PathBuf>) -> Self {
        self.tool_path = tool_path.into();
        self
    }

    pub fn with_exe_name(mut self, exe_name: impl Into<String>) -> Self {
        self.exe_name = exe_name.into();
        self
    }

    pub fn with_subcommand(mut self, subcommand: impl Into<String>) -> Self {
        self.subcommand = subcommand.into();
        self
    }

    pub fn with_format_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.format_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_custom_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: ProcessPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                      | Default                          |
    /// |------------------------------|----------------------------------|
    /// | `BCP_SERVER`                 | required                         |
    /// | `BCP_USERNAME`               | required                         |
    /// | `BCP_PASSWORD`               | required                         |
    /// | `BCP_TOOL_PATH`              | directory of current executable  |
    /// | `BCP_EXE_NAME`               | `bcp`                            |
    /// | `BCP_CUSTOM_ARGS`            | none (whitespace-separated)      |
    /// | `BCP_PRIORITY`               | `normal`                         |
    /// | `BCP_EXECUTION_TIMEOUT_SECS` | none                             |
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = required_env("BCP_SERVER")?;
        let username = required_env("BCP_USERNAME")?;
        let password = required_env("BCP_PASSWORD")?;

        let mut config = Self::new(server, username, password);

        if let Ok(exe_name) = std::env::var("BCP_EXE_NAME") {
            config.exe_name = exe_name;
        }

        if let Ok(custom) = std::env::var("BCP_CUSTOM_ARGS") {
            config.custom_args = custom.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(priority) = std::env::var("BCP_PRIORITY") {
            config.priority = priority.parse().map_err(|_| ConfigError::Invalid {
                name: "BCP_PRIORITY",
                value: priority.clone(),
            })?;
        }

        if let Ok(secs) = std::env::var("BCP_EXECUTION_TIMEOUT_SECS") {
            let parsed: u64 = secs.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "BCP_EXECUTION_TIMEOUT_SECS",
                value: secs.clone(),
            })?;
            config.execution_timeout = Some(Duration::from_secs(parsed));
        }

        Ok(config)
    }
}

impl fmt::Debug for ExporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .field("tool_path", &self.tool_path)
            .field("exe_name", &self.exe_name)
            .field("subcommand", &self.subcommand)
            .field("format_flags", &self.format_flags)
            .field("custom_args", &self.custom_args)
            .field("priority", &self.priority)
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// Directory the tool is launched from when none is configured.
///
/// `BCP_TOOL_PATH` wins; otherwise the directory holding the current
/// executable, falling back to the current directory.
pub fn default_tool_path() -> PathBuf {
    if let Some(path) = std::env::var_os(TOOL_PATH_ENV) {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
