//! Adaptive position sampling.
//!
//! While tracking, one timer drives acquisitions at the cadence the
//! [`SamplingPolicy`] picks for the current motion snapshot. A watcher task
//! re-evaluates on every motion edge and either leaves the timer alone,
//! retunes accuracy in place, defers until the schedule is old enough, or
//! replaces the timer.
//!
//! Acquisitions run on their own task tied to the tracking session, so a
//! reschedule never kills a fix in progress but `stop()` does.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use beacon_core::{
    AcquisitionParams, ActiveSchedule, Clock, MotionSnapshot, Reading, RescheduleDecision,
    SamplingPolicy,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::scheduler::{Scheduler, TaskHandle};
use crate::source::{AcquireError, DeviceContext, PositionProvider};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    pub tracking: bool,
    pub cycles_fired: u64,
    /// Cycles skipped because the device is parked and a recent fix exists.
    pub skipped: u64,
    /// Cycles that found an acquisition still running.
    pub busy: u64,
    pub acquired: u64,
    pub failed: u64,
    pub reschedules: u64,
    pub retunes: u64,
    pub deferrals: u64,
    pub active: Option<AcquisitionParams>,
}

pub struct AdaptiveSampler {
    inner: Arc<Inner>,
}

struct Inner {
    policy: SamplingPolicy,
    provider: Arc<dyn PositionProvider>,
    device: Arc<dyn DeviceContext>,
    motion: watch::Receiver<MotionSnapshot>,
    readings: mpsc::UnboundedSender<Reading>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    next_session_id: u64,
    /// Session whose acquisition is running, if any.
    in_flight: Option<u64>,
    last_success_ms: Option<i64>,
    stats: SamplerStats,
}

struct Session {
    id: u64,
    scheduler: Scheduler,
    active: ActiveSchedule,
    timer: TaskHandle,
    deferred: Option<TaskHandle>,
    _watcher: TaskHandle,
}

impl AdaptiveSampler {
    /// Successful readings come out of the returned receiver, each exactly once.
    pub fn new(
        policy: SamplingPolicy,
        provider: Arc<dyn PositionProvider>,
        device: Arc<dyn DeviceContext>,
        motion: watch::Receiver<MotionSnapshot>,
        clock: Arc<dyn Clock>,
        scheduler: &Scheduler,
    ) -> (Self, mpsc::UnboundedReceiver<Reading>) {
        let (readings, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            policy,
            provider,
            device,
            motion,
            readings,
            clock,
            scheduler: scheduler.child(),
            state: Mutex::new(State::default()),
        });
        (Self { inner }, rx)
    }

    /// Idle → Tracking. The first acquisition fires immediately. No-op while
    /// already tracking.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.session.is_some() {
            return;
        }
        let id = state.next_session_id;
        state.next_session_id += 1;

        let scheduler = self.inner.scheduler.child();
        let snapshot = *self.inner.motion.borrow();
        let params = self.inner.policy.params_for(&snapshot);
        let now = self.inner.clock.now_ms();

        let timer = Inner::start_timer(&self.inner, &scheduler, id, params, true);
        let watcher = Inner::spawn_watcher(&self.inner, &scheduler, id);
        state.session = Some(Session {
            id,
            scheduler,
            active: ActiveSchedule {
                params,
                started_at_ms: now,
            },
            timer,
            deferred: None,
            _watcher: watcher,
        });
        state.stats.tracking = true;
        state.stats.active = Some(params);
        tracing::info!(
            interval_ms = params.interval_ms,
            accuracy = params.accuracy.as_str(),
            motion = snapshot.state.as_str(),
            "tracking started"
        );
    }

    /// Tracking → Idle. Cancels the timer, any deferred re-evaluation and any
    /// acquisition in flight before returning. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        let Some(session) = state.session.take() else {
            return;
        };
        session.timer.cancel();
        session.scheduler.shutdown();
        // The cancelled acquisition no longer blocks the next session.
        state.in_flight = None;
        state.stats.tracking = false;
        state.stats.active = None;
        tracing::info!("tracking stopped");
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    pub fn stats(&self) -> SamplerStats {
        self.inner.lock().stats.clone()
    }
}

impl Drop for AdaptiveSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_timer(
        this: &Arc<Self>,
        scheduler: &Scheduler,
        session_id: u64,
        params: AcquisitionParams,
        immediate: bool,
    ) -> TaskHandle {
        let weak = Arc::downgrade(this);
        let on_tick = move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_tick(session_id);
            }
        };
        let every = params.interval();
        let delay = if immediate { std::time::Duration::ZERO } else { every };
        scheduler.schedule_after(delay, every, on_tick)
    }

    fn spawn_watcher(this: &Arc<Self>, scheduler: &Scheduler, session_id: u64) -> TaskHandle {
        let weak = Arc::downgrade(this);
        let mut motion = this.motion.clone();
        motion.mark_unchanged();
        scheduler.spawn(move |token| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = motion.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        motion.mark_unchanged();
                        match weak.upgrade() {
                            Some(inner) => inner.reevaluate(session_id),
                            None => break,
                        }
                    }
                }
            }
        })
    }

    fn on_tick(self: &Arc<Self>, session_id: u64) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let Some(session) = state.session.as_ref().filter(|s| s.id == session_id) else {
            return;
        };
        let params = session.active.params;
        let token = session.scheduler.token().clone();
        state.stats.cycles_fired += 1;

        if state.in_flight == Some(session_id) {
            state.stats.busy += 1;
            tracing::debug!("previous acquisition still running; cycle skipped");
            return;
        }
        let snapshot = *self.motion.borrow();
        if self
            .policy
            .should_skip(snapshot.truly_stationary, state.last_success_ms, now)
        {
            state.stats.skipped += 1;
            tracing::debug!("parked with a recent fix; cycle skipped");
            return;
        }
        state.in_flight = Some(session_id);
        drop(state);

        let guard = InFlightGuard {
            inner: Arc::downgrade(self),
            session_id,
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let acquire = tokio::time::timeout(
                params.timeout(),
                inner.provider.acquire(params.accuracy, params.timeout()),
            );
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                r = acquire => r.unwrap_or(Err(AcquireError::Timeout)),
            };
            inner.finish(session_id, result);
        });
    }

    fn finish(&self, session_id: u64, result: Result<beacon_core::Position, AcquireError>) {
        let mut state = self.lock();
        let live = state
            .session
            .as_ref()
            .is_some_and(|s| s.id == session_id && !s.scheduler.is_shut_down());
        if !live {
            return;
        }
        match result {
            Ok(position) => {
                let reading = Reading::from_position(position, self.device.snapshot());
                state.last_success_ms = Some(self.clock.now_ms());
                state.stats.acquired += 1;
                tracing::debug!(
                    origin_id = %reading.origin_id,
                    accuracy = reading.accuracy,
                    "position acquired"
                );
                // Sent under the lock so a concurrent stop() cannot race past it.
                if self.readings.send(reading).is_err() {
                    tracing::warn!("reading dropped: delivery is gone");
                }
            }
            Err(e) => {
                state.stats.failed += 1;
                tracing::warn!("acquisition failed: {e}");
            }
        }
    }

    fn reevaluate(self: &Arc<Self>, session_id: u64) {
        let now = self.clock.now_ms();
        let snapshot = *self.motion.borrow();
        let candidate = self.policy.params_for(&snapshot);

        let mut state = self.lock();
        let State { session, stats, .. } = &mut *state;
        let Some(session) = session.as_mut().filter(|s| s.id == session_id) else {
            return;
        };

        match self.policy.evaluate(&session.active, candidate, now) {
            RescheduleDecision::Keep => {}
            RescheduleDecision::Retune(params) => {
                let retuned = AcquisitionParams {
                    interval_ms: session.active.params.interval_ms,
                    ..params
                };
                if retuned != session.active.params {
                    session.active.params = retuned;
                    stats.retunes += 1;
                    stats.active = Some(retuned);
                    tracing::debug!(accuracy = retuned.accuracy.as_str(), "sampling retuned");
                }
            }
            RescheduleDecision::Defer { remaining } => {
                if session.deferred.is_none() {
                    stats.deferrals += 1;
                    let weak = Arc::downgrade(self);
                    session.deferred = Some(session.scheduler.once(remaining, move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.clear_deferred(session_id);
                            inner.reevaluate(session_id);
                        }
                    }));
                    tracing::debug!(remaining_ms = remaining.as_millis() as u64, "reschedule deferred");
                }
            }
            RescheduleDecision::Reschedule(params) => {
                session.timer = Inner::start_timer(self, &session.scheduler, session_id, params, false);
                session.active = ActiveSchedule {
                    params,
                    started_at_ms: now,
                };
                session.deferred = None;
                stats.reschedules += 1;
                stats.active = Some(params);
                tracing::info!(
                    interval_ms = params.interval_ms,
                    accuracy = params.accuracy.as_str(),
                    motion = snapshot.state.as_str(),
                    truly_stationary = snapshot.truly_stationary,
                    "sampling rescheduled"
                );
            }
        }
    }

    fn clear_deferred(&self, session_id: u64) {
        let mut state = self.lock();
        if let Some(session) = state.session.as_mut().filter(|s| s.id == session_id) {
            session.deferred = None;
        }
    }
}

/// Clears the in-flight marker however the acquisition task ends, unless a
/// newer session has already claimed it.
struct InFlightGuard {
    inner: Weak<Inner>,
    session_id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.lock();
            if state.in_flight == Some(self.session_id) {
                state.in_flight = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use beacon_core::MotionState;

    use crate::scheduler::TokioClock;
    use crate::sim::{SimulatedProvider, StaticContext};

    struct Rig {
        sampler: AdaptiveSampler,
        readings: mpsc::UnboundedReceiver<Reading>,
        provider: Arc<SimulatedProvider>,
        motion: watch::Sender<MotionSnapshot>,
        _scheduler: Scheduler,
    }

    fn rig(policy: SamplingPolicy, latency: Duration) -> Rig {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(1_000_000));
        let provider = Arc::new(SimulatedProvider::new(Arc::clone(&clock), 3).with_latency(latency));
        let (motion, motion_rx) = watch::channel(MotionSnapshot::default());
        let scheduler = Scheduler::new();
        let (sampler, readings) = AdaptiveSampler::new(
            policy,
            Arc::clone(&provider) as Arc<dyn PositionProvider>,
            Arc::new(StaticContext::default()),
            motion_rx,
            clock,
            &scheduler,
        );
        Rig {
            sampler,
            readings,
            provider,
            motion,
            _scheduler: scheduler,
        }
    }

    fn snapshot(state: MotionState, truly_stationary: bool) -> MotionSnapshot {
        MotionSnapshot {
            state,
            truly_stationary,
            confidence: 1.0,
            since_ms: Some(0),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Reading>) -> Vec<Reading> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_immediately_with_unknown_fallback() {
        let mut rig = rig(SamplingPolicy::default(), Duration::from_millis(200));
        rig.sampler.start();
        assert!(rig.sampler.is_tracking());
        assert_eq!(rig.sampler.stats().active, Some(SamplingPolicy::default().unknown));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let got = drain(&mut rig.readings);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].battery_level, Some(0.8));
        assert_eq!(got[0].signal_strength, Some(-70));

        // Unknown cadence is 30 s.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain(&mut rig.readings).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let rig = rig(SamplingPolicy::default(), Duration::from_millis(200));
        rig.sampler.start();
        rig.sampler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let mut rig = rig(SamplingPolicy::default(), Duration::from_secs(5));
        rig.sampler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.provider.calls(), 1, "acquisition in flight");

        rig.sampler.stop();
        rig.sampler.stop();
        assert!(!rig.sampler.is_tracking());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(rig.provider.calls(), 1, "no acquisition after stop");
        assert!(drain(&mut rig.readings).is_empty(), "in-flight fix was discarded");
        assert_eq!(rig.sampler.stats().acquired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_fires_immediately_despite_cancelled_fix() {
        let mut rig = rig(SamplingPolicy::default(), Duration::from_millis(500));
        rig.sampler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.provider.calls(), 1);

        rig.sampler.stop();
        rig.sampler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = rig.sampler.stats();
        assert_eq!(stats.busy, 0, "{stats:?}");
        assert_eq!(stats.acquired, 1);
        assert_eq!(rig.provider.calls(), 2);
        assert_eq!(drain(&mut rig.readings).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_in_flight() {
        let mut policy = SamplingPolicy::default();
        policy.unknown = AcquisitionParams::new(1_000, beacon_core::Accuracy::Balanced, 10_000);
        let rig = rig(policy, Duration::from_millis(3_500));
        rig.sampler.start();

        tokio::time::sleep(Duration::from_secs(20)).await;
        let stats = rig.sampler.stats();
        assert_eq!(rig.provider.max_in_flight(), 1);
        assert!(stats.busy > 0, "{stats:?}");
        // Fixes start at 0, 4, 8, 12 and 16 s; each takes 3.5 s.
        assert_eq!(stats.acquired, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_cadence() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(0));
        let provider = Arc::new(
            SimulatedProvider::new(Arc::clone(&clock), 1)
                .with_latency(Duration::from_millis(100))
                .failing_every(2),
        );
        let (_motion, motion_rx) = watch::channel(MotionSnapshot::default());
        let scheduler = Scheduler::new();
        let (sampler, mut readings) = AdaptiveSampler::new(
            SamplingPolicy::default(),
            Arc::clone(&provider) as Arc<dyn PositionProvider>,
            Arc::new(StaticContext::default()),
            motion_rx,
            clock,
            &scheduler,
        );
        sampler.start();

        // Fires at 0, 30, 60, 90 s.
        tokio::time::sleep(Duration::from_secs(95)).await;
        let stats = sampler.stats();
        assert_eq!(stats.cycles_fired, 4);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.acquired, 2);
        assert_eq!(drain(&mut readings).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_edge_reschedules_after_dwell() {
        let policy = SamplingPolicy::default();
        let mut rig = rig(policy.clone(), Duration::from_millis(100));
        rig.sampler.start();
        tokio::time::sleep(Duration::from_secs(6)).await;
        drain(&mut rig.readings);

        // Schedule is 6 s old: past the 5 s dwell, so this restarts at 10 s.
        rig.motion.send_replace(snapshot(MotionState::Moving, false));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = rig.sampler.stats();
        assert_eq!(stats.reschedules, 1);
        assert_eq!(stats.active, Some(policy.moving));

        // First tick of the new schedule comes one interval later.
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(drain(&mut rig.readings).is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut rig.readings).len(), 1);
    }

    /// Moving → Stationary → Moving inside one second must not restart the timer.
    #[tokio::test(start_paused = true)]
    async fn test_flapping_motion_does_not_thrash() {
        let policy = SamplingPolicy::default();
        let rig = rig(policy.clone(), Duration::from_millis(100));
        rig.motion.send_replace(snapshot(MotionState::Moving, false));
        rig.sampler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        rig.motion.send_replace(snapshot(MotionState::Stationary, false));
        tokio::time::sleep(Duration::from_millis(300)).await;
        rig.motion.send_replace(snapshot(MotionState::Moving, false));
        tokio::time::sleep(Duration::from_millis(300)).await;
        rig.motion.send_replace(snapshot(MotionState::Stationary, false));
        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.motion.send_replace(snapshot(MotionState::Moving, false));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = rig.sampler.stats();
        assert_eq!(stats.reschedules, 0);
        assert_eq!(stats.deferrals, 1, "one pending re-evaluation, not one per flap");

        // When the dwell elapses the re-evaluation sees Moving again: nothing to do.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stats = rig.sampler.stats();
        assert_eq!(stats.reschedules, 0);
        assert_eq!(stats.active, Some(policy.moving));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_change_applies_after_dwell() {
        let policy = SamplingPolicy::default();
        let rig = rig(policy.clone(), Duration::from_millis(100));
        rig.motion.send_replace(snapshot(MotionState::Moving, false));
        rig.sampler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        rig.motion.send_replace(snapshot(MotionState::Stationary, false));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.sampler.stats().reschedules, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = rig.sampler.stats();
        assert_eq!(stats.reschedules, 1);
        assert_eq!(stats.active, Some(policy.stationary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_device_skips_cycles_inside_parked_cadence() {
        let mut policy = SamplingPolicy::default();
        // Within the retune delta of the stationary cadence: the parked edge
        // keeps the 60 s timer and only lowers accuracy.
        policy.truly_stationary.interval_ms = policy.stationary.interval_ms + 1_000;
        let mut rig = rig(policy.clone(), Duration::from_millis(100));
        rig.motion.send_replace(snapshot(MotionState::Stationary, false));
        rig.sampler.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rig.readings).len(), 1);

        rig.motion.send_replace(snapshot(MotionState::Stationary, true));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = rig.sampler.stats();
        assert_eq!(stats.retunes, 1);
        assert_eq!(stats.reschedules, 0);
        assert_eq!(stats.active.map(|p| p.accuracy), Some(policy.truly_stationary.accuracy));

        // Tick at 60 s: the last fix is 59.9 s old, under the 61 s parked cadence.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rig.sampler.stats().skipped, 1);
        assert!(drain(&mut rig.readings).is_empty());

        // Tick at 120 s: old enough.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(drain(&mut rig.readings).len(), 1);
        assert_eq!(rig.provider.calls(), 2);
    }

    #[test]
    fn test_stats_default_idle() {
        let stats = SamplerStats::default();
        assert!(!stats.tracking);
        assert!(stats.active.is_none());
    }
}
