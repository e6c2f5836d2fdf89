//! Start, watch and stop a media pipeline.
//!
//! The supervisor never restarts anything. It reports each lifecycle
//! change as a [`PipelineEvent`]; whether an unexpected stop deserves a
//! restart is the caller's decision.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, trace, warn};

use super::process::{self, StageExit, StageProcess};
use super::chain::PipelineSpec;
use crate::error::PipelineError;
use crate::state::PipelineState;

/// How long the monitor waits for a dead stage's stderr to drain.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Time between the graceful request and the kill.
    pub grace: Duration,
    /// Time allowed for a killed process to be reaped.
    pub kill: Duration,
    pub probe_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            kill: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// How the terminal stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Zero status without a stop request.
    NormalExit { program: String },
    /// Nonzero status (or a lost wait) without a stop request.
    AbnormalExit {
        program: String,
        status: String,
        stderr_tail: Vec<String>,
    },
    /// The caller asked for it; never reported.
    ExpectedStop,
}

impl ExitOutcome {
    pub fn classify(
        stop_requested: bool,
        program: &str,
        exit: Option<&StageExit>,
        stderr_tail: Vec<String>,
    ) -> Self {
        if stop_requested {
            return Self::ExpectedStop;
        }
        match exit {
            Some(exit) if exit.success() => Self::NormalExit {
                program: program.to_string(),
            },
            Some(exit) => Self::AbnormalExit {
                program: program.to_string(),
                status: exit.to_string(),
                stderr_tail,
            },
            None => Self::AbnormalExit {
                program: program.to_string(),
                status: "unknown".to_string(),
                stderr_tail,
            },
        }
    }

    /// The error to surface, for abnormal exits.
    pub fn error(&self) -> Option<PipelineError> {
        match self {
            Self::AbnormalExit {
                program,
                status,
                stderr_tail,
            } => Some(PipelineError::AbnormalExit {
                program: program.clone(),
                status: status.clone(),
                stderr_tail: stderr_tail.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Started { name: String, pids: Vec<u32> },
    /// The terminal stage ended on its own; the rest of the chain has
    /// been torn down.
    UnexpectedlyStopped { name: String, outcome: ExitOutcome },
    /// A caller's `stop()` finished.
    Stopped { name: String },
}

// ── Supervisor ───────────────────────────────────────────────────

struct ActivePipeline {
    name: String,
    stages: Vec<StageProcess>,
}

struct Inner {
    options: SupervisorOptions,
    state: Mutex<PipelineState>,
    active: Mutex<Option<ActivePipeline>>,
    stop_requested: AtomicBool,
    /// Serializes `start` and `stop`. The monitor never takes it.
    lifecycle: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl Inner {
    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            trace!("pipeline event dropped, no listener");
        }
    }
}

/// Owns at most one running pipeline at a time.
#[derive(Clone)]
pub struct MediaPipelineSupervisor {
    inner: Arc<Inner>,
}

impl MediaPipelineSupervisor {
    pub fn new(options: SupervisorOptions) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            options,
            state: Mutex::new(PipelineState::Idle),
            active: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn options(&self) -> SupervisorOptions {
        self.inner.options
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().is_running()
    }

    /// Name of the running pipeline, if any.
    pub fn pipeline_name(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|a| a.name.clone())
    }

    /// Pids of the running stages, in chain order.
    pub fn stage_pids(&self) -> Vec<u32> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.stages.iter().filter_map(StageProcess::pid).collect())
            .unwrap_or_default()
    }

    /// Check that every stage's program answers its probe.
    pub async fn probe(&self, spec: &PipelineSpec) -> Result<(), PipelineError> {
        for stage in &spec.stages {
            process::probe(stage, self.inner.options.probe_timeout).await?;
        }
        Ok(())
    }

    /// Probe, then spawn the chain and begin monitoring it.
    pub async fn start(&self, spec: PipelineSpec) -> Result<(), PipelineError> {
        spec.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;

        if matches!(
            *self.inner.state.lock(),
            PipelineState::Running { .. } | PipelineState::Stopping
        ) {
            return Err(PipelineError::InvalidState("pipeline already active"));
        }

        self.probe(&spec).await?;
        self.inner.stop_requested.store(false, Ordering::SeqCst);

        let stages = self.spawn_chain(&spec).await?;
        self.inner.state.lock().start()?;

        let pids: Vec<u32> = stages.iter().filter_map(StageProcess::pid).collect();
        let terminal = stages.last().cloned();
        info!(pipeline = %spec.name, ?pids, "pipeline started");
        *self.inner.active.lock() = Some(ActivePipeline {
            name: spec.name.clone(),
            stages,
        });
        self.inner.emit(PipelineEvent::Started {
            name: spec.name.clone(),
            pids,
        });

        if let Some(terminal) = terminal {
            let handle = tokio::spawn(monitor(Arc::clone(&self.inner), spec.name, terminal));
            *self.inner.monitor.lock() = Some(handle);
        }
        Ok(())
    }

    /// Stop with the configured grace and kill periods.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let SupervisorOptions { grace, kill, .. } = self.inner.options;
        self.stop_with(grace, kill).await
    }

    /// Terminate every stage: a graceful request, up to `grace` for
    /// them to exit, then a kill and up to `kill` to reap them.
    ///
    /// Idempotent. Concurrent and repeated calls return once the
    /// pipeline is down; only the call that did the work emits
    /// [`PipelineEvent::Stopped`].
    pub async fn stop_with(&self, grace: Duration, kill: Duration) -> Result<(), PipelineError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_requested.store(true, Ordering::SeqCst);

        let stopping = self.inner.state.lock().begin_stop();
        let active = self.inner.active.lock().take();
        let result = match &active {
            Some(active) => terminate_stages(&active.stages, grace, kill).await,
            None => Ok(()),
        };

        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!(error = %e, "pipeline monitor ended abnormally");
            }
        }

        if stopping {
            self.inner.state.lock().finish_stop();
            let name = active.map(|a| a.name).unwrap_or_default();
            info!(pipeline = %name, "pipeline stopped");
            self.inner.emit(PipelineEvent::Stopped { name });
        }
        result
    }

    async fn spawn_chain(&self, spec: &PipelineSpec) -> Result<Vec<StageProcess>, PipelineError> {
        let mut stages = Vec::with_capacity(spec.stages.len());
        if let Err(e) = spawn_into(spec, &mut stages) {
            let SupervisorOptions { grace, kill, .. } = self.inner.options;
            if let Err(cleanup) = terminate_stages(&stages, grace, kill).await {
                warn!(error = %cleanup, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(stages)
    }
}

/// Spawn in order, each stage reading the previous one's stdout.
fn spawn_into(spec: &PipelineSpec, stages: &mut Vec<StageProcess>) -> Result<(), PipelineError> {
    let mut upstream: Option<ChildStdout> = None;
    for (index, stage) in spec.stages.iter().enumerate() {
        let stdin: Stdio = match upstream.take() {
            Some(stdout) => stdout.try_into().map_err(|source| PipelineError::Spawn {
                stage: index,
                program: stage.program.clone(),
                source,
            })?,
            None => Stdio::null(),
        };
        let is_last = index + 1 == spec.stages.len();
        let (process, stdout) = StageProcess::spawn(index, stage, stdin, !is_last)?;
        stages.push(process);
        upstream = stdout;
    }
    Ok(())
}

async fn monitor(inner: Arc<Inner>, name: String, terminal: StageProcess) {
    let exit = terminal.wait_exit().await;
    if inner.stop_requested.load(Ordering::SeqCst) {
        debug!(pipeline = %name, "terminal stage exited on request");
        return;
    }

    terminal.settle_stderr(STDERR_SETTLE).await;
    let outcome = ExitOutcome::classify(
        inner.stop_requested.load(Ordering::SeqCst),
        &terminal.program,
        exit.as_ref(),
        terminal.stderr_tail(),
    );
    if outcome == ExitOutcome::ExpectedStop || !inner.state.lock().exit_unexpectedly() {
        return;
    }

    match outcome.error() {
        Some(e) => error!(pipeline = %name, error = %e, "pipeline stopped unexpectedly"),
        None => warn!(pipeline = %name, program = %terminal.program, "pipeline ended on its own"),
    }

    let active = inner.active.lock().take();
    if let Some(active) = active {
        let SupervisorOptions { grace, kill, .. } = inner.options;
        if let Err(e) = terminate_stages(&active.stages, grace, kill).await {
            error!(pipeline = %name, error = %e, "could not tear down remaining stages");
        }
    }
    inner.emit(PipelineEvent::UnexpectedlyStopped { name, outcome });
}

// ── Termination ──────────────────────────────────────────────────

async fn terminate_stages(
    stages: &[StageProcess],
    grace: Duration,
    kill: Duration,
) -> Result<(), PipelineError> {
    for stage in stages.iter().filter(|s| !s.has_exited()) {
        stage.terminate().await;
    }

    let survivors = wait_until(stages.iter().collect(), Instant::now() + grace).await;
    if !survivors.is_empty() {
        let pids: Vec<u32> = survivors.iter().filter_map(|s| s.pid()).collect();
        warn!(?pids, ?grace, "graceful stop timed out, killing");
        for stage in &survivors {
            stage.force_kill().await;
        }

        let stuck = wait_until(survivors, Instant::now() + kill).await;
        if let Some(stage) = stuck.first() {
            let pid = stage.pid().unwrap_or_default();
            error!(pid, program = %stage.program, "process survived kill");
            return Err(PipelineError::TerminationTimeout {
                pid,
                waited: grace + kill,
            });
        }
    }

    for stage in stages {
        stage.sweep().await;
    }
    Ok(())
}

/// Wait for each stage until `deadline`; return the ones still alive.
async fn wait_until(stages: Vec<&StageProcess>, deadline: Instant) -> Vec<&StageProcess> {
    let mut alive = Vec::new();
    for stage in stages {
        if timeout_at(deadline, stage.wait_exit()).await.is_err() {
            alive.push(stage);
        }
    }
    alive
}

// ── Tests ────────────────────────────────────────────────────────
