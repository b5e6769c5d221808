//! Export orchestration: one tool process per run, with timeout and abort.
//!
//! [`Exporter`] owns the configuration and at most one running process.
//! [`Exporter::run`] wires the caller's streams directly to the child's
//! stdio; [`Exporter::run_to_pipe`] hands the tool a FIFO as its
//! destination and collects the data from there. Either way the call
//! completes only after the process has exited and every byte has been
//! delivered.
//!
//! The execution timeout and [`Exporter::abort`] cover the whole run, not
//! just the process: a background process the tool leaves behind holding
//! its stdout, stderr or the FIFO open cannot stall a run past its deadline.

use std::future::{pending, Future};
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::classify::ErrorRecord;
use super::command::{format_query, CommandLine};
use super::events::{self, OutputLine, StreamKind};
use super::launcher::{self, Redirects};
use super::pipe::{PipeEndpoint, PipeKeeper};
use super::pump;
use super::status::RunState;
use crate::config::ExporterConfig;
use crate::error::ExportError;

/// Caller-supplied stream the tool's stdin is fed from.
pub type InputStream<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Caller-supplied stream the tool's stdout is copied into.
pub type OutputStream<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Everything that varies between runs.
///
/// The query is optional only so that a missing query surfaces as
/// [`ExportError::QueryMissing`] rather than a panic.
pub struct ExportRequest<'a> {
    destination: String,
    query: Option<String>,
    args: Vec<String>,
    input: Option<InputStream<'a>>,
    output: Option<OutputStream<'a>>,
}

impl<'a> ExportRequest<'a> {
    /// Start a request exporting to `destination` (a path or pipe address).
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            query: None,
            args: Vec::new(),
            input: None,
            output: None,
        }
    }

    /// Query template with positional `{0}`, `{1}`, ... placeholders.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Positional arguments substituted into the query template.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Feed the tool's stdin from `input`.
    pub fn input<R>(mut self, input: &'a mut R) -> Self
    where
        R: AsyncRead + Unpin + Send,
    {
        self.input = Some(input);
        self
    }

    /// Copy the tool's stdout into `output` instead of publishing it as
    /// line events.
    pub fn output<W>(mut self, output: &'a mut W) -> Self
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.output = Some(output);
        self
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Informational stderr lines emitted by the tool.
    pub stderr_lines: Vec<String>,
    /// Bytes fed to the tool's stdin.
    pub bytes_in: u64,
    /// Bytes captured from stdout or the pipe.
    pub bytes_out: u64,
}

/// Per-instance run bookkeeping.
#[derive(Default)]
struct Slot {
    /// Abort token of the active run; `None` when idle.
    token: Option<CancellationToken>,
    state: RunState,
}

/// Clears the active-run slot however the run ends.
struct ActiveRun<'a> {
    exporter: &'a Exporter,
    token: CancellationToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.exporter.slot().token = None;
    }
}

/// Pipe-handoff side of a run: our write end of the FIFO and the drain of
/// the listener into the caller's stream.
struct Handoff<'a> {
    keeper: PipeKeeper,
    drain: Pin<Box<dyn Future<Output = io::Result<u64>> + Send + 'a>>,
}

/// How a run ended.
enum Ended {
    Finished(Result<Collected, ExportError>),
    TimedOut(Duration),
    Aborted,
}

/// Everything gathered once the process has exited and its streams are
/// fully drained.
struct Collected {
    pumped: Pumped,
    /// Bytes drained from the pipe in handoff mode.
    piped: Option<u64>,
    stderr_lines: Vec<String>,
}

/// Result of the direct-mode pumps plus the final exit status.
struct Pumped {
    status: std::process::ExitStatus,
    bytes_in: u64,
    bytes_out: u64,
}

/// Launches the export tool and manages its lifecycle.
///
/// Share it behind an `Arc` to call [`abort`](Self::abort) from another
/// task while a run is in flight.
pub struct Exporter {
    config: ExporterConfig,
    /// Names this instance's pipe endpoint.
    instance_id: Uuid,
    events: broadcast::Sender<OutputLine>,
    slot: Mutex<Slot>,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config,
            instance_id: Uuid::new_v4(),
            events: events::channel(),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        self.slot().state
    }

    /// Receive stderr lines (always) and stdout lines (when stdout is not
    /// captured into a stream) as the tool emits them.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.events.subscribe()
    }

    /// Kill the running process, if any.
    ///
    /// Safe to call from any task or thread at any time; with no run in
    /// flight it does nothing.
    pub fn abort(&self) {
        let slot = self.slot();
        if let Some(token) = &slot.token {
            tracing::info!(instance = %self.instance_id, "Aborting bcp process");
            token.cancel();
        }
    }

    /// Run the tool to completion, streaming directly through its stdio.
    pub async fn run(&self, request: ExportRequest<'_>) -> Result<ExportOutcome, ExportError> {
        let active = self.begin_run()?;
        self.execute(request, None, &active).await
    }

    /// Run the tool with a FIFO as its destination and collect what it
    /// writes there into `output`.
    ///
    /// On success `output` holds exactly the bytes the tool wrote to the
    /// pipe and is positioned at its start.
    pub async fn run_to_pipe<W, I, S>(
        &self,
        output: &mut W,
        query: impl Into<String>,
        args: I,
    ) -> Result<ExportOutcome, ExportError>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send + ?Sized,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let active = self.begin_run()?;

        let endpoint = PipeEndpoint::create(&self.instance_id)?;
        let (keeper, listener) = endpoint.listen()?;
        let request = ExportRequest::new(endpoint.address())
            .query(query)
            .args(args);
        let handoff = Handoff {
            keeper,
            drain: Box::pin(listener.drain_into(output)),
        };

        let result = self.execute(request, Some(handoff), &active).await;
        drop(endpoint);
        result
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunState) {
        self.slot().state = state;
    }

    /// Claim the instance for one run.
    fn begin_run(&self) -> Result<ActiveRun<'_>, ExportError> {
        let mut slot = self.slot();
        if slot.token.is_some() {
            return Err(ExportError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        slot.token = Some(token.clone());
        slot.state = RunState::NotStarted;
        drop(slot);

        Ok(ActiveRun {
            exporter: self,
            token,
        })
    }

    async fn execute(
        &self,
        request: ExportRequest<'_>,
        handoff: Option<Handoff<'_>>,
        active: &ActiveRun<'_>,
    ) -> Result<ExportOutcome, ExportError> {
        let ExportRequest {
            destination,
            query,
            args,
            input,
            output,
        } = request;

        let template = query.ok_or(ExportError::QueryMissing)?;
        let query = format_query(&template, &args)?;
        let command = CommandLine::build(&self.config, &destination, &query);
        let program = launcher::resolve_program(&self.config).await?;

        let mut child = launcher::spawn(
            &program,
            &self.config,
            &command,
            Redirects {
                stdin: input.is_some(),
            },
        )?;
        self.set_state(RunState::Running);
        let start = Instant::now();

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(pump::read_lines(
                stderr,
                StreamKind::Stderr,
                self.events.clone(),
                true,
            ))
        });
        let mut stdout = child.stdout.take();
        let stdout_task = if output.is_none() {
            stdout.take().map(|stdout| {
                tokio::spawn(pump::read_lines(
                    stdout,
                    StreamKind::Stdout,
                    self.events.clone(),
                    false,
                ))
            })
        } else {
            None
        };
        let readers: Vec<AbortHandle> = stderr_task
            .iter()
            .chain(stdout_task.iter())
            .map(JoinHandle::abort_handle)
            .collect();
        let stdin = child.stdin.take();
        let (keeper, pipe_drain) = match handoff {
            Some(Handoff { keeper, drain }) => (Some(keeper), Some(drain)),
            None => (None, None),
        };

        let work = async {
            let process = async {
                let pumped = pump_and_wait(&mut child, input, stdin, stdout, output).await;
                // The tool's write end is closed once it has exited; dropping
                // ours lets the listener reach end-of-file.
                drop(keeper);
                pumped
            };
            let piped = async {
                match pipe_drain {
                    Some(drain) => drain.await.map(Some).map_err(ExportError::Io),
                    None => Ok(None),
                }
            };
            let (pumped, piped) = tokio::try_join!(process, piped)?;

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            let stderr_lines = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            Ok::<_, ExportError>(Collected {
                pumped,
                piped,
                stderr_lines,
            })
        };

        let ended = tokio::select! {
            result = work => Ended::Finished(result),
            timeout = expire(self.config.execution_timeout) => Ended::TimedOut(timeout),
            () = active.token.cancelled() => Ended::Aborted,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match ended {
            Ended::Finished(Ok(collected)) => {
                self.set_state(RunState::Completed);

                let Collected {
                    pumped,
                    piped,
                    stderr_lines,
                } = collected;
                let bytes_out = piped.unwrap_or(pumped.bytes_out);
                let record = ErrorRecord::from_status(pumped.status, stderr_lines);
                let exit_code = record.exit_code;
                match record.into_result() {
                    Ok(stderr_lines) => {
                        tracing::info!(
                            exit_code,
                            duration_ms,
                            bytes_in = pumped.bytes_in,
                            bytes_out,
                            "bcp process completed",
                        );
                        Ok(ExportOutcome {
                            exit_code,
                            duration_ms,
                            stderr_lines,
                            bytes_in: pumped.bytes_in,
                            bytes_out,
                        })
                    }
                    Err(e) => {
                        tracing::error!(exit_code, duration_ms, error = %e, "bcp process failed");
                        Err(e)
                    }
                }
            }
            Ended::Finished(Err(e)) => {
                tracing::error!(error = %e, "Streaming to bcp process failed");
                stop_readers(&readers);
                terminate(&mut child).await;
                self.set_state(RunState::Aborted);
                Err(e)
            }
            Ended::TimedOut(timeout) => {
                tracing::warn!(?timeout, "bcp process exceeded execution timeout");
                stop_readers(&readers);
                terminate(&mut child).await;
                self.set_state(RunState::TimedOut);
                Err(ExportError::Timeout { timeout })
            }
            Ended::Aborted => {
                stop_readers(&readers);
                terminate(&mut child).await;
                self.set_state(RunState::Aborted);
                Err(ExportError::Aborted)
            }
        }
    }
}

/// Feed stdin and drain stdout concurrently, then reap the process.
async fn pump_and_wait(
    child: &mut Child,
    input: Option<InputStream<'_>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    output: Option<OutputStream<'_>>,
) -> Result<Pumped, ExportError> {
    let feed = async {
        match (input, stdin) {
            (Some(input), Some(stdin)) => pump::copy_to_stdin(input, stdin).await,
            _ => Ok(0),
        }
    };
    let drain = async {
        match (stdout, output) {
            (Some(mut stdout), Some(output)) => pump::copy_stdout_to(&mut stdout, output).await,
            _ => Ok(0),
        }
    };
    let (bytes_in, bytes_out) = tokio::try_join!(feed, drain)?;
    let status = child.wait().await?;

    Ok(Pumped {
        status,
        bytes_in,
        bytes_out,
    })
}

/// Resolve after `timeout`, or never when there is none.
async fn expire(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep(timeout).await;
            timeout
        }
        None => pending().await,
    }
}

/// Stop line readers still parked on a stream a stray process holds open.
fn stop_readers(readers: &[AbortHandle]) {
    for reader in readers {
        reader.abort();
    }
}

/// Kill and reap `child`. A process that is already gone counts as stopped.
async fn terminate(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        tracing::debug!(?pid, error = %e, "bcp process already stopped");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(?pid, error = %e, "Failed to reap bcp process");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::export::test_helpers::{config_for, write_tool};

    #[tokio::test]
    async fn missing_query_fails_before_spawning() {
        let dir = tempfile::tempdir().expect("temp dir");
        let exporter = Exporter::new(config_for(dir.path()));
        let err = exporter.run(ExportRequest::new("out.csv")).await.unwrap_err();
        assert_matches!(err, ExportError::QueryMissing);
        assert_eq!(exporter.state(), RunState::NotStarted);
    }

    #[tokio::test]
    async fn tool_receives_formatted_command_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_tool(dir.path(), "for a in \"$@\"; do printf '%s\\n' \"$a\"; done\n");
        let exporter = Exporter::new(config_for(dir.path()));

        let mut output = Vec::new();
        let outcome = exporter
            .run(
                ExportRequest::new("/data/out.csv")
                    .query("SELECT * FROM {0} WHERE Name = \"{1}\"")
                    .args(["Orders", "O'Brien"])
                    .output(&mut output),
            )
            .await
            .expect("run");

        assert_eq!(outcome.exit_code, 0);
        let text = String::from_utf8(output).expect("utf8");
        let tokens: Vec<&str> = text.lines().collect();
        assert_eq!(
            tokens,
            vec![
                "SELECT * FROM Orders WHERE Name = \"O'Brien\"",
                "queryout",
                "/data/out.csv",
                "-c",
                "-t,",
                "-S",
                "db01",
                "-U",
                "exporter",
                "-P",
                "s3cret",
            ]
        );
        assert_eq!(exporter.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn working_directory_is_tool_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_tool(dir.path(), "pwd\n");
        let exporter = Exporter::new(config_for(dir.path()));

        let mut output = Vec::new();
        exporter
            .run(ExportRequest::new("out.csv").query("SELECT 1").output(&mut output))
            .await
            .expect("run");

        let expected = dir.path().canonicalize().expect("canonicalize");
        let reported = std::path::PathBuf::from(String::from_utf8(output).expect("utf8").trim());
        assert_eq!(reported.canonicalize().expect("canonicalize"), expected);
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_tool(dir.path(), "sleep 5\n");
        let exporter = Arc::new(Exporter::new(config_for(dir.path())));

        let first = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move {
                exporter
                    .run(ExportRequest::new("out.csv").query("SELECT 1"))
                    .await
            })
        };
        while exporter.state() != RunState::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = exporter
            .run(ExportRequest::new("out.csv").query("SELECT 1"))
            .await
            .unwrap_err();
        assert_matches!(err, ExportError::AlreadyRunning);

        exporter.abort();
        let first = first.await.expect("join");
        assert_matches!(first, Err(ExportError::Aborted));
    }

    #[tokio::test]
    async fn pipe_run_collects_tool_output_and_rewinds() {
        let dir = tempfile::tempdir().expect("temp dir");
        // $3 is the destination, i.e. the pipe address.
        write_tool(dir.path(), "printf 'id,name\\n1,alpha\\n' > \"$3\"\n");
        let exporter = Exporter::new(config_for(dir.path()));

        let mut output = Cursor::new(Vec::new());
        let outcome = exporter
            .run_to_pipe(&mut output, "SELECT * FROM {0}", ["T"])
            .await
            .expect("run");

        assert_eq!(outcome.bytes_out, 16);
        assert_eq!(output.position(), 0);
        assert_eq!(output.into_inner(), b"id,name\n1,alpha\n");
    }
}
