//! Media pipeline lifecycle.

use std::time::Instant;

use crate::error::PipelineError;

/// The current phase of a [`MediaPipelineSupervisor`](crate::media::MediaPipelineSupervisor).
///
/// ```text
///  Idle ──► Running ──► Stopping ──► Stopped ──► Running ...
///              │                        ▲
///              └────────────────────────┘   (unexpected exit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Running {
        since: Instant,
    },
    /// `stop()` is terminating the stages.
    Stopping,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running { .. } => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Valid from: `Idle`, `Stopped`.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self {
            Self::Idle | Self::Stopped => {
                *self = Self::Running {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(PipelineError::InvalidState("pipeline already active")),
        }
    }

    /// Valid from: `Running`. Returns `false` when there is nothing
    /// to stop, so repeated stops are no-ops.
    pub fn begin_stop(&mut self) -> bool {
        if self.is_running() {
            *self = Self::Stopping;
            true
        } else {
            false
        }
    }

    /// Leave `Running` after an exit nobody asked for.
    ///
    /// Returns `true` only for the caller that made the transition.
    pub fn exit_unexpectedly(&mut self) -> bool {
        if self.is_running() {
            *self = Self::Stopped;
            true
        } else {
            false
        }
    }

    pub fn finish_stop(&mut self) {
        *self = Self::Stopped;
    }
}
