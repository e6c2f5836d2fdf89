//! Fixed-rate controller sampling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ButtonMap, ControllerSample, InputDevice};
use crate::error::{LinkError, SamplerError};
use crate::message::unix_now;
use crate::network::LinkSession;

// ── SampleSink ───────────────────────────────────────────────────

/// Where samples go. A failed send stops the sampler.
#[async_trait]
pub trait SampleSink: Send + Sync + 'static {
    async fn send_sample(&self, sample: &ControllerSample) -> Result<(), LinkError>;
}

#[async_trait]
impl SampleSink for LinkSession {
    async fn send_sample(&self, sample: &ControllerSample) -> Result<(), LinkError> {
        self.send(sample).await
    }
}

// ── SamplerConfig ────────────────────────────────────────────────

/// Configuration for [`ControllerSampler`].
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Samples per second.
    pub rate_hz: f64,
    /// Stick deadzone, fraction of full scale.
    pub deadzone: f64,
    pub buttons: ButtonMap,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            rate_hz: 20.0,
            deadzone: 0.1,
            buttons: ButtonMap::xbox(),
        }
    }
}

impl SamplerConfig {
    pub const MAX_RATE_HZ: f64 = 1000.0;

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    fn validate(&self) -> Result<(), SamplerError> {
        if !(self.rate_hz > 0.0 && self.rate_hz <= Self::MAX_RATE_HZ) {
            return Err(SamplerError::InvalidConfig("rate_hz must be in (0, 1000]"));
        }
        if !(0.0..=1.0).contains(&self.deadzone) {
            return Err(SamplerError::InvalidConfig("deadzone must be in [0, 1]"));
        }
        Ok(())
    }
}

// ── ControllerSampler ────────────────────────────────────────────

/// Polls an [`InputDevice`] at a fixed rate and sends each sample.
///
/// Pacing is best-effort: a tick that overruns its period is not
/// followed by a catch-up burst, so at most one sample goes out per
/// period. The sampler never retries or reconnects; a failed send
/// ends it and the error is returned once from [`wait`](Self::wait)
/// or [`stop`](Self::stop).
pub struct ControllerSampler {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), SamplerError>>>,
    samples_sent: Arc<AtomicU64>,
}

impl ControllerSampler {
    /// Start sampling on the current Tokio runtime.
    pub fn spawn<D, S>(device: D, sink: S, config: SamplerConfig) -> Result<Self, SamplerError>
    where
        D: InputDevice,
        S: SampleSink,
    {
        config.validate()?;

        let cancel = CancellationToken::new();
        let samples_sent = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(
            device,
            sink,
            config,
            cancel.clone(),
            Arc::clone(&samples_sent),
        ));

        Ok(Self {
            cancel,
            task: Some(task),
            samples_sent,
        })
    }

    pub fn samples_sent(&self) -> u64 {
        self.samples_sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the sampler to end on its own.
    ///
    /// Returns the number of samples sent, or the send error that
    /// stopped it. Cancel-safe; once it has returned, later calls
    /// return `Ok` immediately.
    pub async fn wait(&mut self) -> Result<u64, SamplerError> {
        if let Some(task) = self.task.as_mut() {
            let joined = task.await;
            self.task = None;
            match joined {
                Ok(result) => result?,
                Err(e) => return Err(SamplerError::Task(e.to_string())),
            }
        }
        Ok(self.samples_sent())
    }

    /// Stop sampling and join the task.
    pub async fn stop(&mut self) -> Result<u64, SamplerError> {
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for ControllerSampler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<D: InputDevice, S: SampleSink>(
    mut device: D,
    sink: S,
    config: SamplerConfig,
    cancel: CancellationToken,
    samples_sent: Arc<AtomicU64>,
) -> Result<(), SamplerError> {
    let mut ticker = tokio::time::interval(config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(device = device.name(), rate_hz = config.rate_hz, "sampler started");

    let mut device_ok = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let raw = match device.read() {
            Ok(raw) => {
                if !device_ok {
                    info!(device = device.name(), "input device readable again");
                    device_ok = true;
                }
                raw
            }
            Err(e) => {
                if device_ok {
                    warn!(device = device.name(), error = %e, "input device read failed, skipping ticks");
                    device_ok = false;
                } else {
                    debug!(error = %e, "tick skipped");
                }
                continue;
            }
        };

        let sample = ControllerSample::from_raw(&raw, config.deadzone, &config.buttons, unix_now());
        if let Err(e) = sink.send_sample(&sample).await {
            error!(error = %e, sent = samples_sent.load(Ordering::Relaxed), "sample send failed, sampler stopping");
            return Err(SamplerError::Send(e));
        }
        samples_sent.fetch_add(1, Ordering::Relaxed);
    }

    info!(sent = samples_sent.load(Ordering::Relaxed), "sampler stopped");
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::input::{NeutralDevice, RawInputState};
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Records samples; optionally slow, optionally failing after `n`.
    #[derive(Clone, Default)]
    struct TestSink {
        delay: Duration,
        fail_after: Option<usize>,
        seen: Arc<Mutex<Vec<ControllerSample>>>,
        started: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl SampleSink for TestSink {
        async fn send_sample(&self, sample: &ControllerSample) -> Result<(), LinkError> {
            self.started.lock().push(Instant::now());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut seen = self.seen.lock();
            if self.fail_after.is_some_and(|n| seen.len() >= n) {
                return Err(LinkError::LinkBroken("broken pipe".into()));
            }
            seen.push(sample.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_with_slow_sink() {
        let sink = TestSink {
            delay: Duration::from_millis(12),
            ..Default::default()
        };
        let config = SamplerConfig {
            rate_hz: 50.0,
            ..Default::default()
        };
        let mut sampler = ControllerSampler::spawn(NeutralDevice::new(), sink.clone(), config).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = sampler.stop().await.unwrap();

        assert!((49..=51).contains(&sent), "sent {sent}");
        assert_eq!(sent as usize, sink.seen.lock().len());
        assert!(!sampler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_send_does_not_burst() {
        // Each send takes 2.5 periods; skipped ticks are not replayed.
        let sink = TestSink {
            delay: Duration::from_millis(125),
            ..Default::default()
        };
        let config = SamplerConfig {
            rate_hz: 20.0,
            ..Default::default()
        };
        let period = config.period();
        let mut sampler = ControllerSampler::spawn(NeutralDevice::new(), sink.clone(), config).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = sampler.stop().await.unwrap();

        // At most one send per 125ms slot, plus the one in flight at stop.
        assert!(sent <= 9, "sent {sent}");
        let started = sink.started.lock();
        assert!(started.len() >= 2);
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= period, "gap {:?}", pair[1] - pair[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_stops_and_surfaces_once() {
        let sink = TestSink {
            fail_after: Some(3),
            ..Default::default()
        };
        let mut sampler =
            ControllerSampler::spawn(NeutralDevice::new(), sink, SamplerConfig::default()).unwrap();

        let err = sampler.wait().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LinkBroken);
        assert_eq!(sampler.samples_sent(), 3);
        assert!(!sampler.is_running());

        // Already surfaced.
        assert_eq!(sampler.stop().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn device_errors_skip_ticks() {
        struct Flaky(u32);
        impl InputDevice for Flaky {
            fn read(&mut self) -> Result<RawInputState, DeviceError> {
                self.0 += 1;
                if self.0 % 2 == 0 {
                    Err(DeviceError::Read("timeout".into()))
                } else {
                    NeutralDevice::new().read()
                }
            }
        }

        let sink = TestSink::default();
        let config = SamplerConfig {
            rate_hz: 10.0,
            ..Default::default()
        };
        let mut sampler = ControllerSampler::spawn(Flaky(0), sink.clone(), config).unwrap();
        tokio::time::sleep(Duration::from_millis(1950)).await;
        let sent = sampler.stop().await.unwrap();

        // 20 ticks, every other one readable.
        assert_eq!(sent, 10);
        assert_eq!(sink.seen.lock().len(), 10);
    }

    #[tokio::test]
    async fn rejects_bad_config() {
        let bad_rate = SamplerConfig {
            rate_hz: 0.0,
            ..Default::default()
        };
        assert!(ControllerSampler::spawn(NeutralDevice::new(), TestSink::default(), bad_rate).is_err());

        let bad_deadzone = SamplerConfig {
            deadzone: 1.5,
            ..Default::default()
        };
        assert!(
            ControllerSampler::spawn(NeutralDevice::new(), TestSink::default(), bad_deadzone).is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn samples_carry_deadzone_and_timestamp() {
        struct Drift;
        impl InputDevice for Drift {
            fn read(&mut self) -> Result<RawInputState, DeviceError> {
                Ok(RawInputState {
                    axes: vec![0.04, 0.6, -0.02, -0.9, 1.0, -1.0],
                    buttons: vec![false, true],
                    hats: vec![(0, 1)],
                })
            }
        }

        let sink = TestSink::default();
        let mut sampler = ControllerSampler::spawn(Drift, sink.clone(), SamplerConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sampler.stop().await.unwrap();

        let seen = sink.seen.lock();
        let first = seen.first().unwrap();
        assert_eq!(first.left_stick_x, 0.0);
        assert_eq!(first.left_stick_y, 0.6);
        assert_eq!(first.right_stick_x, 0.0);
        assert_eq!(first.right_trigger, -1.0);
        assert_eq!(first.dpad_y, 1);
        assert_eq!(first.named_buttons.get("b_button"), Some(&true));
        assert_eq!(first.buttons.get("button_1"), Some(&true));
        assert!(first.timestamp > 1_600_000_000.0);
    }
}
