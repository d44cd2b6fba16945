use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use beacon_core::{Clock, MotionClassifier, MotionConfig, MotionEvent, MotionSample, MotionSnapshot};
use futures_util::StreamExt;
use tokio::sync::watch;

use crate::scheduler::{Scheduler, TaskHandle};
use crate::source::{SensorError, SensorSource};

/// How often the stationary timeout is re-checked when no samples arrive.
pub const HYSTERESIS_TICK: Duration = Duration::from_secs(1);

/// Owns the classifier and publishes its snapshot on every edge.
pub struct MotionMonitor {
    shared: Arc<Shared>,
    _task: Option<TaskHandle>,
}

struct Shared {
    classifier: Mutex<MotionClassifier>,
    snapshot_tx: watch::Sender<MotionSnapshot>,
    clock: Arc<dyn Clock>,
}

impl MotionMonitor {
    /// A monitor fed by hand through [`MotionMonitor::feed`].
    pub fn new(config: MotionConfig, clock: Arc<dyn Clock>) -> Self {
        let (snapshot_tx, _) = watch::channel(MotionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                classifier: Mutex::new(MotionClassifier::new(config)),
                snapshot_tx,
                clock,
            }),
            _task: None,
        }
    }

    /// Consume `source` on a background task until the scheduler shuts down.
    pub fn spawn(
        config: MotionConfig,
        clock: Arc<dyn Clock>,
        source: &dyn SensorSource,
        scheduler: &Scheduler,
    ) -> Self {
        let mut monitor = Self::new(config, clock);
        let shared = Arc::clone(&monitor.shared);
        let mut samples = source.samples();

        monitor._task = Some(scheduler.spawn(move |token| async move {
            let mut hysteresis = tokio::time::interval(HYSTERESIS_TICK);
            hysteresis.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = samples.next() => match next {
                        Some(Ok(sample)) => {
                            shared.feed(&sample);
                        }
                        Some(Err(SensorError::Read(msg))) => {
                            tracing::debug!("dropped motion sample: {msg}");
                        }
                        Some(Err(e @ SensorError::Unavailable(_))) => {
                            tracing::warn!("{e}; falling back to fixed cadence");
                            shared.mark_unavailable();
                        }
                        None => {
                            tracing::warn!("motion sensor stream ended; falling back to fixed cadence");
                            shared.mark_unavailable();
                            break;
                        }
                    },
                    _ = hysteresis.tick() => {
                        shared.tick();
                    }
                }
            }
        }));
        monitor
    }

    pub fn subscribe(&self) -> watch::Receiver<MotionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn feed(&self, sample: &MotionSample) -> Option<MotionEvent> {
        self.shared.feed(sample)
    }

    pub fn mark_unavailable(&self) -> Option<MotionEvent> {
        self.shared.mark_unavailable()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.shared.lock().dropped_samples()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MotionClassifier> {
        self.classifier.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feed(&self, sample: &MotionSample) -> Option<MotionEvent> {
        let mut classifier = self.lock();
        let event = classifier.observe(sample);
        self.publish(&classifier, event)
    }

    fn tick(&self) -> Option<MotionEvent> {
        let mut classifier = self.lock();
        let event = classifier.tick(self.clock.now_ms());
        self.publish(&classifier, event)
    }

    fn mark_unavailable(&self) -> Option<MotionEvent> {
        let mut classifier = self.lock();
        let event = classifier.mark_unavailable(self.clock.now_ms());
        self.publish(&classifier, event)
    }

    fn publish(
        &self,
        classifier: &MotionClassifier,
        event: Option<MotionEvent>,
    ) -> Option<MotionEvent> {
        let event = event?;
        match event {
            MotionEvent::StateChanged { from, to, .. } => {
                tracing::info!(from = from.as_str(), to = to.as_str(), "motion state changed");
            }
            MotionEvent::TrulyStationary { since_ms, .. } => {
                tracing::info!(since_ms, "device truly stationary");
            }
        }
        self.snapshot_tx.send_replace(classifier.snapshot());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{ManualClock, MotionState, STANDARD_GRAVITY, SensorKind};
    use futures_util::stream::{self, BoxStream};

    use crate::scheduler::TokioClock;
    use crate::sim::{Scenario, SimulatedSensor};

    fn accel(ts: i64, z: f64) -> MotionSample {
        MotionSample::new(SensorKind::Accelerometer, ts, 0.0, 0.0, z)
    }

    fn shaky(ts: i64, i: usize) -> MotionSample {
        let z = STANDARD_GRAVITY + if i % 2 == 0 { 3.0 } else { -3.0 };
        accel(ts, z)
    }

    struct Scripted(Vec<Result<MotionSample, SensorError>>);

    impl SensorSource for Scripted {
        fn samples(&self) -> BoxStream<'static, Result<MotionSample, SensorError>> {
            Box::pin(stream::iter(self.0.clone()))
        }
    }

    #[test]
    fn test_feed_publishes_edges_only() {
        let clock = ManualClock::new(0);
        let monitor = MotionMonitor::new(MotionConfig::default(), Arc::new(clock));
        let mut rx = monitor.subscribe();
        assert_eq!(rx.borrow_and_update().state, MotionState::Unknown);

        let events: Vec<_> = (0..20)
            .filter_map(|i| monitor.feed(&shaky(i as i64 * 100, i)))
            .collect();
        assert_eq!(events.len(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, MotionState::Moving);
        assert_eq!(monitor.snapshot().state, MotionState::Moving);

        // Still moving: more samples, no new edge, nothing published.
        monitor.feed(&shaky(2_100, 1));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_mark_unavailable_publishes_unknown() {
        let clock = ManualClock::new(0);
        let monitor = MotionMonitor::new(MotionConfig::default(), Arc::new(clock));
        for i in 0..10 {
            monitor.feed(&shaky(i as i64 * 100, i));
        }
        let rx = monitor.subscribe();
        assert!(monitor.mark_unavailable().is_some());
        assert_eq!(rx.borrow().state, MotionState::Unknown);
        assert!(monitor.mark_unavailable().is_none(), "already Unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_degrades_to_unknown() {
        let samples: Vec<_> = (0..10).map(|i| Ok(shaky(i as i64 * 100, i))).collect();
        let clock = ManualClock::new(5_000);
        let scheduler = Scheduler::new();
        let monitor = MotionMonitor::spawn(
            MotionConfig::default(),
            Arc::new(clock),
            &Scripted(samples),
            &scheduler,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = monitor.snapshot();
        // Moving first, then the end of the stream forced Unknown at t=5000.
        assert_eq!(snap.state, MotionState::Unknown);
        assert_eq!(snap.since_ms, Some(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_tick_without_samples() {
        let config = MotionConfig {
            stationary_timeout_ms: 3_000,
            ..MotionConfig::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(0));
        let scheduler = Scheduler::new();
        let sensor = SimulatedSensor::new(Scenario::Still, Arc::clone(&clock), 7);
        let monitor = MotionMonitor::spawn(config, clock, &sensor, &scheduler);
        let rx = monitor.subscribe();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snap = *rx.borrow();
        assert_eq!(snap.state, MotionState::Stationary);
        assert!(snap.truly_stationary);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_sensor_still_reaches_truly_stationary() {
        // Ten still samples, then a sensor that never yields again.
        let still: Vec<_> = (0..10)
            .map(|i| Ok(accel(i * 100, STANDARD_GRAVITY)))
            .collect();
        struct Quiet(Vec<Result<MotionSample, SensorError>>);
        impl SensorSource for Quiet {
            fn samples(&self) -> BoxStream<'static, Result<MotionSample, SensorError>> {
                Box::pin(stream::iter(self.0.clone()).chain(stream::pending()))
            }
        }

        let config = MotionConfig {
            stationary_timeout_ms: 3_000,
            ..MotionConfig::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(0));
        let scheduler = Scheduler::new();
        let monitor = MotionMonitor::spawn(config, clock, &Quiet(still), &scheduler);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let snap = monitor.snapshot();
        assert_eq!(snap.state, MotionState::Stationary);
        assert!(!snap.truly_stationary);

        // Only the hysteresis timer can promote it now.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(monitor.snapshot().truly_stationary);
        scheduler.shutdown();
    }
}
