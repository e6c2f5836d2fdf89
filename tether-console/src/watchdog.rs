//! Restart policy for pipelines that stop on their own.
//!
//! The supervisor only reports unexpected stops. This decides whether
//! the console may start the pipeline again: at most `max_restarts`
//! restarts inside a sliding `window`, each after `backoff`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::WatchdogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Restart { after: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    max_restarts: u32,
    window: Duration,
    backoff: Duration,
    restarts: VecDeque<Instant>,
}

impl Watchdog {
    pub fn new(max_restarts: u32, window: Duration, backoff: Duration) -> Self {
        Self {
            max_restarts,
            window,
            backoff,
            restarts: VecDeque::with_capacity(max_restarts as usize),
        }
    }

    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(
            config.max_restarts,
            Duration::from_secs(config.window_secs),
            Duration::from_millis(config.backoff_ms),
        )
    }

    pub fn on_unexpected_stop(&mut self) -> Decision {
        self.on_unexpected_stop_at(Instant::now())
    }

    /// Decide with an explicit clock (useful for testing).
    pub fn on_unexpected_stop_at(&mut self, now: Instant) -> Decision {
        while self
            .restarts
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            self.restarts.pop_front();
        }
        if self.restarts.len() >= self.max_restarts as usize {
            return Decision::GiveUp;
        }
        self.restarts.push_back(now);
        Decision::Restart {
            after: self.backoff,
        }
    }

    /// Restarts granted within the current window.
    pub fn recent_restarts(&self) -> usize {
        self.restarts.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────
