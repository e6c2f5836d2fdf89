//! Topic-indexed dispatch of downlink bus messages.
//!
//! [`TopicRouter`] keeps, per topic, a bounded ring of recent messages,
//! an arrival count and a rate estimate, and fans each message out to
//! the callbacks registered for its topic plus any wildcard callbacks.
//!
//! All state sits behind one mutex. Callbacks are copied out of the
//! registry under the lock and invoked after it is released, so a
//! callback may call back into the router.

mod stats;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{EnvelopeError, FrameError};
use crate::message::{BusMessage, ControlCommand};
use crate::network::FrameHandler;

pub use stats::RateEstimator;

/// Consumer callback. Runs synchronously on the dispatching thread.
pub type Callback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

// ── Config / read-side types ─────────────────────────────────────

/// Bounds for per-topic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Messages kept per topic.
    pub history_capacity: usize,
    /// Arrivals feeding the rate estimate.
    pub rate_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            rate_window: RateEstimator::DEFAULT_WINDOW,
        }
    }
}

/// Handle returned by the `subscribe*` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Per-topic statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSummary {
    pub topic: String,
    /// Messages seen since creation or the last reset.
    pub count: u64,
    pub rate_hz: f64,
    pub last_arrival: Instant,
}

// ── Internal state ───────────────────────────────────────────────

struct TopicState {
    buffer: VecDeque<Arc<BusMessage>>,
    count: u64,
    rate: RateEstimator,
    last_arrival: Instant,
}

impl TopicState {
    fn new(config: &RouterConfig, now: Instant) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.history_capacity),
            count: 0,
            rate: RateEstimator::with_window(config.rate_window),
            last_arrival: now,
        }
    }
}

enum Filter {
    Topic(String),
    All,
}

struct Subscription {
    id: SubscriptionId,
    filter: Filter,
    callback: Callback,
}

#[derive(Default)]
struct RouterInner {
    topics: HashMap<String, TopicState>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
    rejected: u64,
}

// ── TopicRouter ──────────────────────────────────────────────────

/// Bounded per-topic history, rate statistics and fan-out.
pub struct TopicRouter {
    config: RouterConfig,
    inner: Mutex<RouterInner>,
    /// Messages dropped by full channel subscribers.
    dropped: Arc<AtomicU64>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        let config = RouterConfig {
            history_capacity: config.history_capacity.max(1),
            rate_window: config.rate_window,
        };
        Self {
            config,
            inner: Mutex::new(RouterInner::default()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> RouterConfig {
        self.config
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Record `message` and hand it to every matching callback.
    pub fn dispatch(&self, message: BusMessage) {
        self.dispatch_at(message, Instant::now());
    }

    /// [`dispatch`](Self::dispatch) with an explicit arrival time
    /// (useful for testing).
    pub fn dispatch_at(&self, message: BusMessage, arrival: Instant) {
        let message = Arc::new(message);

        let callbacks: Vec<Callback> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let state = match inner.topics.entry(message.topic.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    debug!(topic = %entry.key(), "new topic");
                    entry.insert(TopicState::new(&self.config, arrival))
                }
            };

            if state.buffer.len() == self.config.history_capacity {
                state.buffer.pop_front();
            }
            state.buffer.push_back(Arc::clone(&message));
            state.count += 1;
            state.rate.record_at(arrival);
            state.last_arrival = arrival;

            inner
                .subscriptions
                .iter()
                .filter(|s| match &s.filter {
                    Filter::All => true,
                    Filter::Topic(t) => *t == message.topic,
                })
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        for callback in callbacks {
            callback(&message);
        }
    }

    /// Validate a decoded frame as a bus message, then dispatch it.
    ///
    /// Frames that are not a valid envelope, or that carry a known
    /// control topic with an unusable payload, are counted and
    /// rejected. Unknown topics are accepted.
    pub fn dispatch_value(&self, value: Value) -> Result<(), EnvelopeError> {
        let checked = BusMessage::from_value(value)
            .and_then(|msg| ControlCommand::parse(&msg).map(|_| msg));

        match checked {
            Ok(message) => {
                self.dispatch(message);
                Ok(())
            }
            Err(e) => {
                self.inner.lock().rejected += 1;
                warn!(error = %e, "rejected bus message");
                Err(e)
            }
        }
    }

    /// Clear all topic data. Subscriptions are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.topics.clear();
        inner.rejected = 0;
        debug!("router reset");
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Call `callback` for every message on `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(Filter::Topic(topic.into()), Arc::new(callback))
    }

    /// Call `callback` for every message on every topic.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(Filter::All, Arc::new(callback))
    }

    /// Deliver `topic` through a bounded channel instead of a callback.
    ///
    /// The consumer drains on its own schedule. When the channel is
    /// full the new message is dropped for this subscriber and counted
    /// in [`dropped`](Self::dropped).
    pub fn subscribe_channel(
        &self,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::clone(&self.dropped);
        let id = self.subscribe(topic, move |message: &BusMessage| {
            if let Err(e) = tx.try_send(message.clone()) {
                if matches!(e, mpsc::error::TrySendError::Full(_)) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                trace!(topic = %message.topic, "channel subscriber did not take message");
            }
        });
        (id, rx)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        inner.subscriptions.len() != before
    }

    fn register(&self, filter: Filter, callback: Callback) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            filter,
            callback,
        });
        id
    }

    // ── Read side ────────────────────────────────────────────────

    /// Every known topic, sorted by name.
    pub fn topics(&self) -> Vec<TopicSummary> {
        let inner = self.inner.lock();
        let mut out: Vec<TopicSummary> = inner
            .topics
            .iter()
            .map(|(topic, state)| TopicSummary {
                topic: topic.clone(),
                count: state.count,
                rate_hz: state.rate.rate_hz(),
                last_arrival: state.last_arrival,
            })
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }

    /// Retained messages for `topic`, oldest first.
    pub fn history(&self, topic: &str) -> Vec<Arc<BusMessage>> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|s| s.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, topic: &str) -> Option<Arc<BusMessage>> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|s| s.buffer.back().cloned())
    }

    pub fn count(&self, topic: &str) -> u64 {
        self.inner.lock().topics.get(topic).map_or(0, |s| s.count)
    }

    pub fn rate_hz(&self, topic: &str) -> f64 {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0.0, |s| s.rate.rate_hz())
    }

    /// Frames rejected by [`dispatch_value`](Self::dispatch_value).
    pub fn rejected(&self) -> u64 {
        self.inner.lock().rejected
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHandler for TopicRouter {
    fn on_frame(&self, frame: Value) {
        // Rejections are logged and counted by dispatch_value.
        let _ = self.dispatch_value(frame);
    }

    fn on_parse_error(&self, error: &FrameError) {
        trace!(%error, "router saw malformed frame");
    }
}

// ── Tests ────────────────────────────────────────────────────────
