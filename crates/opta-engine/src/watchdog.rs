//! Periodic backend health probing with a consecutive-failure threshold.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opta_core::health::HealthProbe;
use opta_core::settings::WatchdogSettings;

#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Consecutive failures before an alert fires.
    pub threshold: u32,
}

impl WatchdogConfig {
    pub fn from_settings(settings: &WatchdogSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms.max(1)),
            threshold: settings.threshold.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogAlert {
    pub target: String,
    pub consecutive_failures: u32,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogStatus {
    pub running: bool,
    pub consecutive_failures: u32,
    pub notified: bool,
}

type AlertFn = Box<dyn Fn(&WatchdogAlert) + Send + Sync>;
type RecoveryFn = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    running: bool,
    generation: u64,
    consecutive_failures: u32,
    notified: bool,
    cancel: Option<CancellationToken>,
}

struct Inner {
    probe: Arc<dyn HealthProbe>,
    config: WatchdogConfig,
    on_alert: AlertFn,
    on_recovery: Option<RecoveryFn>,
    state: Mutex<State>,
}

/// Probes a backend every `interval`. After `threshold` consecutive failures
/// the alert callback fires once; it re-arms only after a successful probe.
///
/// Callbacks run with the watchdog's state locked, which is what guarantees
/// none fires after [`Watchdog::stop`] returns. They must not call back into
/// the watchdog.
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new<F>(probe: Arc<dyn HealthProbe>, config: WatchdogConfig, on_alert: F) -> Self
    where
        F: Fn(&WatchdogAlert) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                probe,
                config,
                on_alert: Box::new(on_alert),
                on_recovery: None,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Also call `on_recovery` with the target when a probe succeeds after an
    /// alert. Must be set before `start`.
    pub fn with_recovery<F>(mut self, on_recovery: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.on_recovery = Some(Box::new(on_recovery)),
            None => warn!("watchdog already running; recovery callback ignored"),
        }
        self
    }

    /// Start probing. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.generation += 1;
        state.consecutive_failures = 0;
        state.notified = false;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());

        info!(
            target_name = %self.inner.probe.target(),
            interval_ms = self.inner.config.interval.as_millis() as u64,
            threshold = self.inner.config.threshold,
            "watchdog started"
        );
        tokio::spawn(watch(Arc::clone(&self.inner), state.generation, cancel));
    }

    /// Stop probing. No callback fires after this returns.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.generation += 1;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        info!(target_name = %self.inner.probe.target(), "watchdog stopped");
    }

    pub fn status(&self) -> WatchdogStatus {
        let state = self.inner.state.lock();
        WatchdogStatus {
            running: state.running,
            consecutive_failures: state.consecutive_failures,
            notified: state.notified,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    let period = inner.config.interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let target = inner.probe.target();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(period, inner.probe.probe()) => match r {
                Ok(r) => r,
                Err(_) => Err(format!("probe timed out after {}ms", period.as_millis())),
            },
        };

        let mut state = inner.state.lock();
        if !state.running || state.generation != generation {
            return;
        }
        match outcome {
            Ok(()) => {
                if state.notified {
                    info!(target_name = %target, "backend recovered");
                    if let Some(on_recovery) = &inner.on_recovery {
                        on_recovery(&target);
                    }
                }
                state.consecutive_failures = 0;
                state.notified = false;
            }
            Err(reason) => {
                state.consecutive_failures += 1;
                debug!(target_name = %target, failures = state.consecutive_failures, reason = %reason, "probe failed");
                if state.consecutive_failures >= inner.config.threshold && !state.notified {
                    state.notified = true;
                    warn!(target_name = %target, failures = state.consecutive_failures, reason = %reason, "backend unhealthy");
                    (inner.on_alert)(&WatchdogAlert {
                        target: target.clone(),
                        consecutive_failures: state.consecutive_failures,
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeProbe {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("connection refused".into())
            }
        }

        fn target(&self) -> String {
            "lmx".into()
        }
    }

    struct Harness {
        probe: Arc<FakeProbe>,
        alerts: Arc<Mutex<Vec<WatchdogAlert>>>,
        recoveries: Arc<AtomicUsize>,
        watchdog: Watchdog,
    }

    fn harness(threshold: u32) -> Harness {
        let probe = Arc::new(FakeProbe::default());
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let recoveries = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&alerts);
        let recovered = Arc::clone(&recoveries);
        let watchdog = Watchdog::new(
            Arc::clone(&probe) as Arc<dyn HealthProbe>,
            WatchdogConfig {
                interval: Duration::from_secs(1),
                threshold,
            },
            move |alert| sink.lock().push(alert.clone()),
        )
        .with_recovery(move |_| {
            recovered.fetch_add(1, Ordering::SeqCst);
        });
        Harness {
            probe,
            alerts,
            recoveries,
            watchdog,
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn alerts_once_at_threshold() {
        let h = harness(2);
        h.watchdog.start();

        advance(1500).await;
        assert!(h.alerts.lock().is_empty());

        advance(1000).await;
        let alerts = h.alerts.lock().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].target, "lmx");
        assert_eq!(alerts[0].consecutive_failures, 2);
        assert_eq!(alerts[0].reason, "connection refused");

        advance(3000).await;
        assert_eq!(h.alerts.lock().len(), 1);
        let status = h.watchdog.status();
        assert!(status.running && status.notified);
        assert_eq!(status.consecutive_failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_and_rearms() {
        let h = harness(2);
        h.watchdog.start();
        advance(2500).await;
        assert_eq!(h.alerts.lock().len(), 1);

        h.probe.healthy.store(true, Ordering::SeqCst);
        advance(1000).await;
        assert_eq!(h.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.watchdog.status(),
            WatchdogStatus {
                running: true,
                consecutive_failures: 0,
                notified: false
            }
        );

        h.probe.healthy.store(false, Ordering::SeqCst);
        advance(2000).await;
        assert_eq!(h.alerts.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_stop() {
        let h = harness(2);
        h.watchdog.start();
        advance(1500).await;
        h.watchdog.stop();

        advance(10_000).await;
        assert!(h.alerts.lock().is_empty());
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), 1);
        assert!(!h.watchdog.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_restartable() {
        let h = harness(1);
        h.watchdog.start();
        h.watchdog.start();
        advance(2500).await;
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.alerts.lock().len(), 1);

        h.watchdog.stop();
        h.watchdog.start();
        assert_eq!(h.watchdog.status().consecutive_failures, 0);
        advance(1500).await;
        assert_eq!(h.alerts.lock().len(), 2);
    }

    #[test]
    fn config_clamps_zeroes() {
        let config = WatchdogConfig::from_settings(&WatchdogSettings {
            enabled: true,
            interval_ms: 0,
            threshold: 0,
        });
        assert_eq!(config.threshold, 1);
        assert_eq!(config.interval, Duration::from_millis(1));
    }
}
