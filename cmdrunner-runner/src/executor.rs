use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use cmdrunner_core::{CmdRunnerError, ExecutionOutcome, Result, Termination};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::ExecuteRequest;

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

/// Runs one external process to completion, timeout or cancellation.
///
/// Both output pipes are drained by their own tasks from the moment the
/// process starts, so a child that fills one pipe while nobody reads the
/// other cannot block. On timeout or cancellation the process (and on Unix
/// its whole process group) is killed, reaped, and whatever output was
/// captured so far is returned.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kill_grace: Duration,
}

#[derive(Default)]
struct Captured {
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    stdin_done: bool,
}

impl Captured {
    fn streams_closed(&self) -> bool {
        self.stdout.is_some() && self.stderr.is_some()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Upper bound on reaping and draining after a forced kill.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Execute without an external cancellation signal.
    pub async fn run(&self, request: &ExecuteRequest) -> Result<ExecutionOutcome> {
        self.execute(request, &CancellationToken::new()).await
    }

    /// Execute a process, racing its completion against the request timeout
    /// and `cancel`.
    ///
    /// Fails only when the request is invalid or the process cannot be
    /// launched. Timeout and cancellation are reported in the outcome.
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        request.validate()?;

        let started_at = Utc::now();
        let start_instant = Instant::now();

        let mut child = spawn_child(request)?;
        let pid = child.id();
        debug!(pid = ?pid, command = %request.display(), "process started");

        let stop_draining = CancellationToken::new();
        let mut stdout_task = spawn_drain(child.stdout.take(), stop_draining.clone());
        let mut stderr_task = spawn_drain(child.stderr.take(), stop_draining.clone());
        let mut stdin_task = spawn_stdin_writer(child.stdin.take(), request.stdin.clone());

        let mut captured = Captured::default();
        let mut status: Option<io::Result<ExitStatus>> = None;

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let termination = loop {
            tokio::select! {
                out = &mut stdout_task, if captured.stdout.is_none() => {
                    captured.stdout = Some(join_output(out));
                }
                err = &mut stderr_task, if captured.stderr.is_none() => {
                    captured.stderr = Some(join_output(err));
                }
                _ = &mut stdin_task, if !captured.stdin_done => {
                    captured.stdin_done = true;
                }
                // Exit status is only read once both pipes hit EOF.
                exit = child.wait(), if captured.streams_closed() && captured.stdin_done => {
                    status = Some(exit);
                    break Termination::Exited;
                }
                _ = &mut deadline => break Termination::TimedOut,
                _ = cancel.cancelled() => break Termination::Cancelled,
            }
        };

        if termination != Termination::Exited {
            warn!(
                pid = ?pid,
                timeout_ms = request.timeout.as_millis() as u64,
                termination = ?termination,
                "terminating process"
            );
            stdin_task.abort();
            terminate(&mut child, pid);

            let grace = tokio::time::sleep(self.kill_grace);
            tokio::pin!(grace);

            while !(captured.streams_closed() && status.is_some()) {
                tokio::select! {
                    out = &mut stdout_task, if captured.stdout.is_none() => {
                        captured.stdout = Some(join_output(out));
                    }
                    err = &mut stderr_task, if captured.stderr.is_none() => {
                        captured.stderr = Some(join_output(err));
                    }
                    exit = child.wait(), if status.is_none() => {
                        status = Some(exit);
                    }
                    _ = &mut grace => {
                        debug!(pid = ?pid, "kill grace elapsed before pipes closed");
                        break;
                    }
                }
            }

            // Readers still blocked at this point belong to descendants that
            // escaped the kill; keep what they produced so far.
            stop_draining.cancel();
            if captured.stdout.is_none() {
                captured.stdout = Some(join_output(stdout_task.await));
            }
            if captured.stderr.is_none() {
                captured.stderr = Some(join_output(stderr_task.await));
            }
        }

        let exit_code = match status {
            Some(Ok(status)) => status.code().unwrap_or(-1),
            Some(Err(e)) => {
                warn!(pid = ?pid, error = %e, "failed to read exit status");
                -1
            }
            None => -1,
        };

        let duration_ms = start_instant.elapsed().as_millis() as u64;
        let completed_at = Utc::now();

        info!(
            executable = %request.executable,
            exit_code,
            termination = ?termination,
            duration_ms,
            "process finished"
        );

        Ok(ExecutionOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&captured.stdout.unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&captured.stderr.unwrap_or_default()).into_owned(),
            termination,
            duration_ms,
            started_at,
            completed_at,
        })
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_child(request: &ExecuteRequest) -> Result<Child> {
    let program = resolve_program(request)?;

    let mut std_cmd = std::process::Command::new(&program);
    std_cmd
        .args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &request.working_directory {
        std_cmd.current_dir(dir);
    }

    // Own process group, so a forced kill also reaches grandchildren.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|source| CmdRunnerError::LaunchFailure {
        executable: request.executable.clone(),
        source,
    })
}

/// Resolve bare program names against `PATH` (the request's own `PATH` if it
/// sets one). Anything with a path separator is used as given.
fn resolve_program(request: &ExecuteRequest) -> Result<PathBuf> {
    let executable = request.executable.as_str();
    if executable.contains('/') || executable.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(executable));
    }

    let path_override = request
        .env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone());

    let resolved = match path_override {
        Some(paths) => {
            let cwd = std::env::current_dir()?;
            which::which_in(executable, Some(paths), cwd)
        }
        None => which::which(executable),
    };

    resolved.map_err(|e| CmdRunnerError::LaunchFailure {
        executable: executable.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
    })
}

fn spawn_drain<R>(pipe: Option<R>, stop: CancellationToken) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let Some(mut pipe) = pipe else {
            return buf;
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                read = pipe.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "output pipe read failed");
                        break;
                    }
                },
                _ = stop.cancelled() => break,
            }
        }
        buf
    })
}

fn spawn_stdin_writer(pipe: Option<ChildStdin>, input: Option<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (Some(mut pipe), Some(input)) = (pipe, input) else {
            return;
        };
        // A child that exits without reading its input closes the pipe on us.
        if let Err(e) = pipe.write_all(input.as_bytes()).await {
            debug!(error = %e, "stdin write failed");
        }
        if let Err(e) = pipe.shutdown().await {
            debug!(error = %e, "stdin close failed");
        }
    })
}

fn join_output(joined: std::result::Result<Vec<u8>, tokio::task::JoinError>) -> Vec<u8> {
    joined.unwrap_or_else(|e| {
        warn!(error = %e, "output reader task failed");
        Vec::new()
    })
}

/// Best-effort forced termination. Failures (usually "already exited") are
/// logged and swallowed.
fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // `pid` leads the group created at spawn and is not reaped yet.
        if let Some(pid) = pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed, process already exited");
    }
}
