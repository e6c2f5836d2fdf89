//! Link lifecycle state machine.
//!
//! `LinkState` models one TCP session from construction to teardown,
//! with validated transitions that return `Result` instead of
//! panicking.

use std::time::{Duration, Instant};

use crate::error::LinkError;

// ── LinkState ────────────────────────────────────────────────────

/// The current phase of a [`LinkSession`](crate::network::LinkSession).
///
/// ```text
///  Idle ──► Connecting ──► Connected ──► Closing ──► Closed
///   │            │              │            │          ▲
///   │            ├──────────────┴────────────┴─► Failed │
///   └────────────┴──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Constructed, never opened.
    #[default]
    Idle,

    /// TCP connect in flight.
    Connecting,

    /// Socket up, receive loop running.
    Connected {
        /// When the session entered `Connected`.
        since: Instant,
    },

    /// `close()` is tearing the session down.
    Closing,

    /// Orderly end: local close or remote EOF. Terminal.
    Closed,

    /// Connect failure, reset or write failure. Terminal.
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// `Closed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// How long the session has been connected; `None` otherwise.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`. Sessions are single-use.
    pub fn begin_connect(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(LinkError::InvalidState("cannot open: session already used")),
        }
    }

    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LinkError::InvalidState(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connected`.
    pub fn begin_close(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Connected { .. } => {
                *self = Self::Closing;
                Ok(())
            }
            _ => Err(LinkError::InvalidState("cannot close: not connected")),
        }
    }

    /// Enter `Closed`.
    ///
    /// Valid from every non-terminal state: `Idle` (never opened),
    /// `Connecting` (closed mid-connect), `Connected` (remote EOF) and
    /// `Closing`. An already-terminal state is left alone so the first
    /// outcome wins.
    pub fn finish_close(&mut self) {
        if !self.is_terminal() {
            *self = Self::Closed;
        }
    }

    /// Enter `Failed`.
    ///
    /// Valid from any non-terminal state except `Idle`. A `Closing`
    /// session still fails if its teardown races with a reset.
    pub fn fail(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Connecting | Self::Connected { .. } | Self::Closing => {
                *self = Self::Failed;
                Ok(())
            }
            Self::Closed | Self::Failed => Ok(()),
            Self::Idle => Err(LinkError::InvalidState("cannot fail: never opened")),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
