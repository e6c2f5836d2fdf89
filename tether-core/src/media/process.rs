//! Spawning, observing and terminating one pipeline stage.
//!
//! Each stage is started in its own process group (Unix) so that
//! anything it forks is terminated with it. A reaper task owns the
//! child and publishes its exit through a `watch` channel; a second
//! task drains stderr into a bounded tail.

use std::collections::VecDeque;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::chain::{StageRole, StageSpec};
use crate::error::PipelineError;

/// Lines of stderr kept per stage.
pub const STDERR_TAIL_LINES: usize = 10;

// ── StageExit ────────────────────────────────────────────────────

/// How a stage process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageExit {
    Status(ExitStatus),
    /// The wait itself failed; the process state is unknown.
    WaitFailed(String),
}

impl StageExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Status(s) if s.success())
    }
}

impl fmt::Display for StageExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "{s}"),
            Self::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

// ── StageProcess ─────────────────────────────────────────────────

/// Handle to one running stage. Clones observe the same process.
#[derive(Debug, Clone)]
pub struct StageProcess {
    pub index: usize,
    pub role: StageRole,
    pub program: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<StageExit>>,
    /// Asks the reaper to kill the direct child.
    kill: CancellationToken,
    tail: Arc<Mutex<VecDeque<String>>>,
    stderr_closed: CancellationToken,
}

impl StageProcess {
    /// Spawn `spec` with the given stdin. When `pipe_stdout` is set the
    /// stage's stdout is returned for the next stage; otherwise it is
    /// discarded.
    pub fn spawn(
        index: usize,
        spec: &StageSpec,
        stdin: Stdio,
        pipe_stdout: bool,
    ) -> Result<(Self, Option<ChildStdout>), PipelineError> {
        let mut command = build_command(spec);
        command
            .stdin(stdin)
            .stdout(if pipe_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::configure(&mut command);

        let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
            stage: index,
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_closed = CancellationToken::new();
        match child.stderr.take() {
            Some(stderr) => {
                tokio::spawn(drain_stderr(
                    stderr,
                    Arc::clone(&tail),
                    stderr_closed.clone(),
                    spec.program.clone(),
                ));
            }
            None => stderr_closed.cancel(),
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let reaper_kill = kill.clone();
        let program = spec.program.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                r = child.wait() => r,
                _ = reaper_kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        trace!(program = %program, error = %e, "kill on exited child");
                    }
                    child.wait().await
                }
            };
            let exit = match waited {
                Ok(status) => StageExit::Status(status),
                Err(e) => StageExit::WaitFailed(e.to_string()),
            };
            debug!(program = %program, pid, %exit, "stage exited");
            exit_tx.send_replace(Some(exit));
        });

        debug!(stage = index, program = %spec.program, pid, role = %spec.role, "stage started");
        Ok((
            Self {
                index,
                role: spec.role,
                program: spec.program.clone(),
                pid,
                exit: exit_rx,
                kill,
                tail,
                stderr_closed,
            },
            stdout,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit(&self) -> Option<StageExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolve once the process has been reaped. `None` if the reaper
    /// vanished without reporting.
    pub async fn wait_exit(&self) -> Option<StageExit> {
        let mut rx = self.exit.clone();
        let exit = rx.wait_for(Option::is_some).await.ok()?;
        exit.clone()
    }

    /// The last [`STDERR_TAIL_LINES`] lines of stderr, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    /// Wait up to `limit` for stderr to reach EOF, so the tail is
    /// complete after an exit.
    pub async fn settle_stderr(&self, limit: Duration) {
        if timeout(limit, self.stderr_closed.cancelled()).await.is_err() {
            trace!(program = %self.program, "stderr still open after exit");
        }
    }

    /// Ask the stage (and its process tree) to exit.
    pub async fn terminate(&self) {
        let Some(pid) = self.pid else { return };
        if let Err(e) = platform::terminate_tree(pid).await {
            warn!(pid, program = %self.program, error = %e, "graceful stop signal failed");
        }
    }

    /// Kill the stage and its process tree.
    pub async fn force_kill(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = platform::kill_tree(pid).await {
                warn!(pid, program = %self.program, error = %e, "kill signal failed");
            }
        }
        self.kill.cancel();
    }

    /// Kill whatever is left of the stage's process tree after the
    /// stage itself has exited.
    pub async fn sweep(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = platform::sweep_tree(pid).await {
                trace!(pid, error = %e, "sweep failed");
            }
        }
    }
}

fn build_command(spec: &StageSpec) -> Command {
    if spec.shell {
        return shell_command(spec.command_line());
    }
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    command
}

#[cfg(windows)]
fn shell_command(line: String) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell_command(line: String) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

async fn drain_stderr(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    closed: CancellationToken,
    program: String,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                trace!(program = %program, "{line}");
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                trace!(program = %program, error = %e, "stderr read failed");
                break;
            }
        }
    }
    closed.cancel();
}

// ── Probe ────────────────────────────────────────────────────────

/// Run the stage's probe command once, bounded by `limit`.
pub async fn probe(spec: &StageSpec, limit: Duration) -> Result<(), PipelineError> {
    let Some(args) = &spec.probe else {
        return Ok(());
    };
    let missing = |detail: String| PipelineError::ProcessMissing {
        program: spec.program.clone(),
        detail,
    };

    let mut command = Command::new(&spec.program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(limit, command.status()).await {
        Err(_) => Err(missing(format!("no response within {limit:?}"))),
        Ok(Err(e)) => Err(missing(e.to_string())),
        Ok(Ok(status)) if !status.success() => Err(missing(format!("probe exited with {status}"))),
        Ok(Ok(_)) => {
            debug!(program = %spec.program, "probe ok");
            Ok(())
        }
    }
}

// ── Platform ─────────────────────────────────────────────────────

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    use tokio::process::Command;

    /// New process group, led by the child.
    pub fn configure(command: &mut Command) {
        command.process_group(0);
    }

    pub async fn terminate_tree(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    pub async fn kill_tree(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }

    pub async fn sweep_tree(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }

    fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::process::Stdio;
    use tokio::process::Command;

    pub fn configure(_command: &mut Command) {}

    pub async fn terminate_tree(pid: u32) -> std::io::Result<()> {
        taskkill(&["/T", "/PID", &pid.to_string()]).await
    }

    pub async fn kill_tree(pid: u32) -> std::io::Result<()> {
        taskkill(&["/F", "/T", "/PID", &pid.to_string()]).await
    }

    pub async fn sweep_tree(_pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    async fn taskkill(args: &[&str]) -> std::io::Result<()> {
        // A nonzero status here means the tree is already gone.
        Command::new("taskkill")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|_| ())
    }
}

/// No process-tree primitive: only the direct child is killed, by the
/// reaper, and there is no graceful request.
#[cfg(not(any(unix, windows)))]
mod platform {
    use tokio::process::Command;

    pub fn configure(_command: &mut Command) {}

    pub async fn terminate_tree(_pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    pub async fn kill_tree(_pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    pub async fn sweep_tree(_pid: u32) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> StageSpec {
        StageSpec::new(StageRole::Consumer, "sh", ["-c", script]).without_probe()
    }

    #[tokio::test]
    async fn exit_status_and_stderr_tail() {
        let script = "for i in 1 2 3 4 5 6 7 8 9 10 11 12; do echo line$i >&2; done; exit 4";
        let (stage, stdout) = StageProcess::spawn(0, &sh(script), Stdio::null(), false).unwrap();
        assert!(stdout.is_none());

        let exit = stage.wait_exit().await.unwrap();
        assert!(!exit.success());
        assert!(matches!(&exit, StageExit::Status(s) if s.code() == Some(4)));

        stage.settle_stderr(Duration::from_secs(2)).await;
        let tail = stage.stderr_tail();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.first().map(String::as_str), Some("line3"));
        assert_eq!(tail.last().map(String::as_str), Some("line12"));
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_stage() {
        let (stage, _) = StageProcess::spawn(0, &sh("sleep 30"), Stdio::null(), false).unwrap();
        assert!(!stage.has_exited());
        stage.terminate().await;
        let exit = timeout(Duration::from_secs(5), stage.wait_exit())
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn shell_stage_runs_command_line() {
        let spec = StageSpec::new(StageRole::Transport, "echo", ["piped", ">&2"])
            .via_shell()
            .without_probe();
        let (stage, _) = StageProcess::spawn(0, &spec, Stdio::null(), false).unwrap();
        assert!(stage.wait_exit().await.unwrap().success());
        stage.settle_stderr(Duration::from_secs(2)).await;
        assert_eq!(stage.stderr_tail(), vec!["piped".to_string()]);
    }

    #[tokio::test]
    async fn probe_reports_missing_program() {
        let spec = StageSpec::new(StageRole::Consumer, "tether-no-such-program", ["x"]);
        let err = probe(&spec, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessMissing);

        let failing = StageSpec::new(StageRole::Consumer, "sh", ["x"]).with_probe(["-c", "exit 1"]);
        assert!(probe(&failing, Duration::from_secs(5)).await.is_err());

        let ok = StageSpec::new(StageRole::Consumer, "sh", ["x"]).with_probe(["-c", "exit 0"]);
        probe(&ok, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn probe_times_out() {
        let slow = StageSpec::new(StageRole::Consumer, "sh", ["x"]).with_probe(["-c", "sleep 10"]);
        let err = probe(&slow, Duration::from_millis(200)).await.unwrap_err();
        assert!(err.to_string().contains("no response"));
    }
}
