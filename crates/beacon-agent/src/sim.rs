//! In-process stand-ins for hardware and network collaborators. The CLI's
//! `run` command drives the whole pipeline with these; tests use them to
//! script outages, rejections and slow fixes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_core::{
    Accuracy, Clock, DeviceSnapshot, MotionSample, Payload, Position, STANDARD_GRAVITY, SensorKind,
};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use uuid::Uuid;

use crate::source::{
    AcquireError, ConnectivityObserver, Credentials, DeviceContext, PositionProvider, RemoteSink,
    SendError, SensorSource,
};

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Motion pattern produced by [`SimulatedSensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Walk,
    Still,
    /// Alternate: walk for `walk`, then sit still for `still`.
    Mixed { walk: Duration, still: Duration },
}

impl Scenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "walk" => Some(Scenario::Walk),
            "still" => Some(Scenario::Still),
            "mixed" => Some(Scenario::Mixed {
                walk: Duration::from_secs(120),
                still: Duration::from_secs(420),
            }),
            _ => None,
        }
    }

    fn walking_at(&self, elapsed: Duration) -> bool {
        match *self {
            Scenario::Walk => true,
            Scenario::Still => false,
            Scenario::Mixed { walk, still } => {
                let cycle = (walk + still).as_millis().max(1);
                elapsed.as_millis() % cycle < walk.as_millis()
            }
        }
    }
}

/// Accelerometer at 10 Hz following a [`Scenario`].
pub struct SimulatedSensor {
    scenario: Scenario,
    clock: Arc<dyn Clock>,
    seed: u64,
}

impl SimulatedSensor {
    pub fn new(scenario: Scenario, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            scenario,
            clock,
            seed,
        }
    }
}

impl SensorSource for SimulatedSensor {
    fn samples(&self) -> BoxStream<'static, Result<MotionSample, crate::source::SensorError>> {
        let scenario = self.scenario;
        let clock = Arc::clone(&self.clock);
        let mut rng = SmallRng::seed_from_u64(self.seed);

        Box::pin(async_stream::stream! {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
            let mut step = 0u64;
            loop {
                ticker.tick().await;
                step += 1;
                let noise = rng.random_range(-0.02..0.02);
                let z = if scenario.walking_at(started.elapsed()) {
                    // Roughly a 2 Hz gait.
                    STANDARD_GRAVITY + (step as f64 * 1.3).sin() * 2.5 + noise
                } else {
                    STANDARD_GRAVITY + noise
                };
                let x = rng.random_range(-0.01..0.01);
                yield Ok(MotionSample::new(SensorKind::Accelerometer, clock.now_ms(), x, 0.0, z));
            }
        })
    }
}

/// Position provider with scripted latency and failures.
pub struct SimulatedProvider {
    clock: Arc<dyn Clock>,
    latency: Duration,
    fail_every: Option<u32>,
    denied: bool,
    rng: Mutex<SmallRng>,
    calls: AtomicU32,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimulatedProvider {
    pub fn new(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            clock,
            latency: Duration::from_millis(500),
            fail_every: None,
            denied: false,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            calls: AtomicU32::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every `n`th call reports no fix.
    pub fn failing_every(mut self, n: u32) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn denied(mut self) -> Self {
        self.denied = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `acquire` calls seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PositionProvider for SimulatedProvider {
    fn acquire(
        &self,
        accuracy: Accuracy,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Position, AcquireError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            let _guard = InFlight(Arc::clone(&self.in_flight));

            if self.denied {
                return Err(AcquireError::PermissionDenied);
            }
            if self.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(AcquireError::Timeout);
            }
            tokio::time::sleep(self.latency).await;
            if self.fail_every.is_some_and(|n| call % n == 0) {
                return Err(AcquireError::NoFix);
            }

            let radius = match accuracy {
                Accuracy::High => 5.0,
                Accuracy::Balanced => 25.0,
                Accuracy::Low => 100.0,
            };
            let (dlat, dlon, speed) = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                (
                    rng.random_range(-0.0005..0.0005),
                    rng.random_range(-0.0005..0.0005),
                    rng.random_range(0.0..1.6),
                )
            };
            Ok(Position {
                latitude: 52.5200 + dlat,
                longitude: 13.4050 + dlon,
                accuracy: radius,
                altitude: Some(34.0),
                speed: Some(speed),
                heading: None,
                timestamp_ms: self.clock.now_ms(),
            })
        })
    }
}

/// Connectivity flipped by hand.
pub struct ToggleConnectivity {
    tx: watch::Sender<bool>,
}

impl ToggleConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ConnectivityObserver for ToggleConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn check(&self) -> bool {
        self.is_online()
    }
}

/// Accepts everything and remembers it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Payload>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, payload: &Payload) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
    }
}

impl RemoteSink for RecordingSink {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            self.record(payload);
            Ok(())
        })
    }
}

/// A sink that can be taken down or told to reject specific payloads.
#[derive(Default)]
pub struct FlakySink {
    accepted: RecordingSink,
    down: AtomicBool,
    rejected: Mutex<HashSet<Uuid>>,
    attempts: AtomicU32,
}

impl FlakySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While down every send fails with a network error.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Answer HTTP 500 for this origin id from now on.
    pub fn reject(&self, origin_id: Uuid) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(origin_id);
    }

    pub fn accepted(&self) -> Vec<Payload> {
        self.accepted.sent()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RemoteSink for FlakySink {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(SendError::Network("connection refused".into()));
            }
            let rejected = self
                .rejected
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&payload.origin_id());
            if rejected {
                return Err(SendError::Rejected {
                    status: 500,
                    message: "internal server error".into(),
                });
            }
            self.accepted.record(payload);
            Ok(())
        })
    }
}

/// Fixed battery and signal readings.
#[derive(Debug, Clone, Copy)]
pub struct StaticContext {
    snapshot: DeviceSnapshot,
}

impl StaticContext {
    pub fn new(snapshot: DeviceSnapshot) -> Self {
        Self { snapshot }
    }
}

impl Default for StaticContext {
    fn default() -> Self {
        Self::new(DeviceSnapshot {
            battery_level: Some(0.8),
            signal_strength: Some(-70),
        })
    }
}

impl DeviceContext for StaticContext {
    fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot
    }
}
