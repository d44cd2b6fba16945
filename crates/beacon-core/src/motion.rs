//! Motion classification from raw inertial samples.
//!
//! Keeps a short rolling window of acceleration magnitudes and gyroscope
//! magnitudes and turns them into a Moving / Stationary verdict:
//!
//! - moving when the acceleration magnitude standard deviation exceeds
//!   `motion_threshold × motion_sensitivity`, or when the mean angular speed
//!   exceeds `gyro_threshold`;
//! - stationary otherwise;
//! - unknown until the window has filled, and whenever the sensor is lost.
//!
//! Work per sample is O(buffer). Events are returned to the caller instead of
//! invoked through callbacks, so the classifier stays synchronous and owns no
//! channels.

use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;
use crate::constants::{
    GYRO_THRESHOLD, MAX_SAMPLE_GAP_MS, MOTION_BUFFER_SIZE, MOTION_SENSITIVITY, MOTION_THRESHOLD,
    STATIONARY_TIMEOUT_MS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Samples per rolling window.
    pub buffer_size: usize,
    /// Standard deviation of acceleration magnitude (m/s²) that means motion.
    pub motion_threshold: f64,
    /// Scales `motion_threshold`.
    pub motion_sensitivity: f64,
    /// Mean angular speed (rad/s) that means motion.
    pub gyro_threshold: f64,
    pub stationary_timeout_ms: u64,
    pub max_sample_gap_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            buffer_size: MOTION_BUFFER_SIZE,
            motion_threshold: MOTION_THRESHOLD,
            motion_sensitivity: MOTION_SENSITIVITY,
            gyro_threshold: GYRO_THRESHOLD,
            stationary_timeout_ms: STATIONARY_TIMEOUT_MS,
            max_sample_gap_ms: MAX_SAMPLE_GAP_MS,
        }
    }
}

impl MotionConfig {
    pub fn effective_threshold(&self) -> f64 {
        self.motion_threshold * self.motion_sensitivity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Raw acceleration including gravity.
    Accelerometer,
    /// Angular velocity.
    Gyroscope,
    /// Gravity-compensated acceleration, for platforms that only expose that.
    UserAcceleration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub kind: SensorKind,
    pub timestamp_ms: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MotionSample {
    pub fn new(kind: SensorKind, timestamp_ms: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            kind,
            timestamp_ms,
            x,
            y,
            z,
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Unknown,
    Moving,
    Stationary,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionState::Unknown => "unknown",
            MotionState::Moving => "moving",
            MotionState::Stationary => "stationary",
        }
    }
}

/// Point-in-time view of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSnapshot {
    pub state: MotionState,
    pub truly_stationary: bool,
    /// Distance of the deciding statistic from its threshold, in [0, 1].
    pub confidence: f64,
    /// When the current state was entered.
    pub since_ms: Option<i64>,
}

impl Default for MotionSnapshot {
    fn default() -> Self {
        Self {
            state: MotionState::Unknown,
            truly_stationary: false,
            confidence: 0.0,
            since_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionEvent {
    /// Edge transition of the motion state.
    StateChanged {
        from: MotionState,
        to: MotionState,
        at_ms: i64,
    },
    /// Stationary has now held for the full timeout.
    TrulyStationary { since_ms: i64, at_ms: i64 },
}

/// Fixed-capacity circular buffer of scalar magnitudes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    values: Vec<f64>,
    capacity: usize,
    head: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            self.values[self.head] = value;
        }
        self.head = (self.head + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.head = 0;
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }
}

pub struct MotionClassifier {
    config: MotionConfig,
    accel: RingBuffer,
    gyro: RingBuffer,
    state: MotionState,
    since_ms: Option<i64>,
    truly_stationary: bool,
    confidence: f64,
    last_sample_ms: Option<i64>,
    dropped: u64,
}

impl MotionClassifier {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            accel: RingBuffer::new(config.buffer_size),
            gyro: RingBuffer::new(config.buffer_size),
            config,
            state: MotionState::Unknown,
            since_ms: None,
            truly_stationary: false,
            confidence: 0.0,
            last_sample_ms: None,
            dropped: 0,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            state: self.state,
            truly_stationary: self.truly_stationary,
            confidence: self.confidence,
            since_ms: self.since_ms,
        }
    }

    /// Samples rejected because a component was NaN or infinite.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }

    /// Feed one sample. Returns an event only on an edge.
    pub fn observe(&mut self, sample: &MotionSample) -> Option<MotionEvent> {
        if !sample.is_finite() {
            self.dropped += 1;
            return None;
        }

        let ts = sample.timestamp_ms;
        if let Some(last) = self.last_sample_ms
            && ts.saturating_sub(last) > self.config.max_sample_gap_ms as i64
        {
            self.accel.clear();
            self.gyro.clear();
        }
        // Late samples are still counted but never move the gap reference backwards.
        self.last_sample_ms = Some(self.last_sample_ms.map_or(ts, |last| last.max(ts)));

        match sample.kind {
            SensorKind::Gyroscope => self.gyro.push(sample.magnitude()),
            SensorKind::Accelerometer | SensorKind::UserAcceleration => {
                self.accel.push(sample.magnitude());
            }
        }

        if !self.accel.is_full() {
            return self.check_hysteresis(ts);
        }

        let (moving, confidence) = self.classify();
        self.confidence = confidence;
        let next = if moving {
            MotionState::Moving
        } else {
            MotionState::Stationary
        };

        if next != self.state {
            Some(self.transition(next, ts))
        } else {
            self.check_hysteresis(ts)
        }
    }

    /// Re-evaluate the stationary timeout without a new sample.
    pub fn tick(&mut self, now_ms: i64) -> Option<MotionEvent> {
        self.check_hysteresis(now_ms)
    }

    /// The sensor source failed or went away.
    pub fn mark_unavailable(&mut self, now_ms: i64) -> Option<MotionEvent> {
        self.accel.clear();
        self.gyro.clear();
        self.confidence = 0.0;
        if self.state == MotionState::Unknown {
            return None;
        }
        Some(self.transition(MotionState::Unknown, now_ms))
    }

    /// Forget everything, back to the initial Unknown state. Emits nothing.
    pub fn reset(&mut self) {
        self.accel.clear();
        self.gyro.clear();
        self.state = MotionState::Unknown;
        self.since_ms = None;
        self.truly_stationary = false;
        self.confidence = 0.0;
        self.last_sample_ms = None;
    }

    fn classify(&self) -> (bool, f64) {
        let threshold = self.config.effective_threshold();
        let std_dev = self.accel.std_dev();
        let accel_moving = std_dev > threshold;
        let accel_margin = margin(std_dev, threshold);

        let gyro_mean = self.gyro.is_full().then(|| self.gyro.mean());
        let gyro_moving = gyro_mean.is_some_and(|m| m > self.config.gyro_threshold);
        let gyro_margin = gyro_mean.map(|m| margin(m, self.config.gyro_threshold));

        let moving = accel_moving || gyro_moving;
        let confidence = if moving {
            // Strongest of the statistics that voted for motion.
            let a = if accel_moving { accel_margin } else { 0.0 };
            let g = if gyro_moving {
                gyro_margin.unwrap_or(0.0)
            } else {
                0.0
            };
            a.max(g)
        } else {
            // Stillness is only as certain as the closest call.
            gyro_margin.map_or(accel_margin, |g| accel_margin.min(g))
        };
        (moving, confidence)
    }

    fn transition(&mut self, next: MotionState, at_ms: i64) -> MotionEvent {
        let from = self.state;
        self.state = next;
        self.since_ms = Some(at_ms);
        self.truly_stationary = next == MotionState::Stationary && self.config.stationary_timeout_ms == 0;
        MotionEvent::StateChanged {
            from,
            to: next,
            at_ms,
        }
    }

    fn check_hysteresis(&mut self, now_ms: i64) -> Option<MotionEvent> {
        if self.state != MotionState::Stationary || self.truly_stationary {
            return None;
        }
        let since = self.since_ms?;
        let held = elapsed_between(since, now_ms);
        if held.as_millis() < u128::from(self.config.stationary_timeout_ms) {
            return None;
        }
        self.truly_stationary = true;
        Some(MotionEvent::TrulyStationary {
            since_ms: since,
            at_ms: now_ms,
        })
    }
}

fn margin(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    ((value - threshold).abs() / threshold).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::STANDARD_GRAVITY;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const STEP_MS: i64 = 100;

    fn accel(ts: i64, z: f64) -> MotionSample {
        MotionSample::new(SensorKind::Accelerometer, ts, 0.0, 0.0, z)
    }

    fn gyro(ts: i64, rate: f64) -> MotionSample {
        MotionSample::new(SensorKind::Gyroscope, ts, rate, 0.0, 0.0)
    }

    /// Feed `count` still samples starting at `start`, collecting events.
    fn feed_still(c: &mut MotionClassifier, start: i64, count: usize) -> Vec<MotionEvent> {
        (0..count)
            .filter_map(|i| {
                let jitter = if i % 2 == 0 { 0.01 } else { -0.01 };
                c.observe(&accel(start + i as i64 * STEP_MS, STANDARD_GRAVITY + jitter))
            })
            .collect()
    }

    fn feed_shaking(c: &mut MotionClassifier, start: i64, count: usize) -> Vec<MotionEvent> {
        (0..count)
            .filter_map(|i| {
                let swing = if i % 2 == 0 { 3.0 } else { -3.0 };
                c.observe(&accel(start + i as i64 * STEP_MS, STANDARD_GRAVITY + swing))
            })
            .collect()
    }

    #[test]
    fn test_ring_buffer_statistics() {
        let mut buf = RingBuffer::new(4);
        for v in [2.0, 4.0, 4.0, 4.0] {
            buf.push(v);
        }
        assert!(buf.is_full());
        assert_relative_eq!(buf.mean(), 3.5);
        assert_relative_eq!(buf.std_dev(), 0.75_f64.sqrt());

        // Overwrites the oldest value (2.0).
        buf.push(4.0);
        assert_eq!(buf.len(), 4);
        assert_relative_eq!(buf.std_dev(), 0.0);

        buf.clear();
        assert!(buf.is_empty());
        assert_relative_eq!(buf.mean(), 0.0);
    }

    #[test]
    fn test_magnitude() {
        let s = MotionSample::new(SensorKind::Accelerometer, 0, 3.0, 4.0, 12.0);
        assert_relative_eq!(s.magnitude(), 13.0);
    }

    #[test]
    fn test_still_device_becomes_stationary_once_buffer_full() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        let events = feed_still(&mut c, 0, MOTION_BUFFER_SIZE);
        assert_eq!(
            events,
            vec![MotionEvent::StateChanged {
                from: MotionState::Unknown,
                to: MotionState::Stationary,
                at_ms: (MOTION_BUFFER_SIZE as i64 - 1) * STEP_MS,
            }]
        );
        let snap = c.snapshot();
        assert_eq!(snap.state, MotionState::Stationary);
        assert!(!snap.truly_stationary);
        assert!(snap.confidence > 0.9, "far below threshold: {}", snap.confidence);
    }

    #[test]
    fn test_shaking_device_is_moving() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        let events = feed_shaking(&mut c, 0, 20);
        assert_eq!(events.len(), 1, "one edge, then repeated observations: {events:?}");
        assert_eq!(c.state(), MotionState::Moving);
    }

    #[test]
    fn test_repeated_state_emits_nothing() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_still(&mut c, 0, MOTION_BUFFER_SIZE);
        let more = feed_still(&mut c, MOTION_BUFFER_SIZE as i64 * STEP_MS, 50);
        assert!(more.is_empty(), "{more:?}");
    }

    #[test]
    fn test_gyroscope_alone_signals_motion() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        for i in 0..MOTION_BUFFER_SIZE as i64 {
            c.observe(&gyro(i * STEP_MS, 0.5));
        }
        let events = feed_still(&mut c, MOTION_BUFFER_SIZE as i64 * STEP_MS, MOTION_BUFFER_SIZE);
        assert_eq!(c.state(), MotionState::Moving);
        assert!(matches!(
            events.as_slice(),
            [MotionEvent::StateChanged {
                to: MotionState::Moving,
                ..
            }]
        ));
    }

    #[test]
    fn test_rotation_with_quiet_accelerometer_moves_on_gyro_sample() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_still(&mut c, 0, MOTION_BUFFER_SIZE);
        assert_eq!(c.state(), MotionState::Stationary);

        let start = MOTION_BUFFER_SIZE as i64 * STEP_MS;
        let events: Vec<_> = (0..MOTION_BUFFER_SIZE as i64)
            .filter_map(|i| c.observe(&gyro(start + i * 10, 0.5)))
            .collect();
        assert_eq!(c.state(), MotionState::Moving);
        assert!(matches!(
            events.as_slice(),
            [MotionEvent::StateChanged {
                from: MotionState::Stationary,
                to: MotionState::Moving,
                ..
            }]
        ));
    }

    #[test]
    fn test_sensitivity_raises_the_bar() {
        let config = MotionConfig {
            motion_sensitivity: 10.0,
            ..MotionConfig::default()
        };
        let mut c = MotionClassifier::new(config);
        feed_shaking(&mut c, 0, 20);
        assert_eq!(c.state(), MotionState::Stationary);
    }

    #[test]
    fn test_truly_stationary_fires_exactly_once() {
        let config = MotionConfig {
            stationary_timeout_ms: 2_000,
            ..MotionConfig::default()
        };
        let mut c = MotionClassifier::new(config);
        // 60 samples at 100ms = 6 seconds of stillness.
        let events = feed_still(&mut c, 0, 60);
        let truly: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MotionEvent::TrulyStationary { .. }))
            .collect();
        assert_eq!(truly.len(), 1, "{events:?}");
        assert!(c.snapshot().truly_stationary);

        // Ticks after the fact do not fire again.
        assert_eq!(c.tick(60_000), None);
    }

    #[test]
    fn test_tick_reaches_truly_stationary_without_samples() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_still(&mut c, 0, MOTION_BUFFER_SIZE);
        let entered = c.snapshot().since_ms.unwrap();

        assert_eq!(c.tick(entered + STATIONARY_TIMEOUT_MS as i64 - 1), None);
        assert_eq!(
            c.tick(entered + STATIONARY_TIMEOUT_MS as i64),
            Some(MotionEvent::TrulyStationary {
                since_ms: entered,
                at_ms: entered + STATIONARY_TIMEOUT_MS as i64,
            })
        );
        assert_eq!(c.tick(entered + 2 * STATIONARY_TIMEOUT_MS as i64), None);
    }

    #[test]
    fn test_motion_clears_truly_stationary() {
        let config = MotionConfig {
            stationary_timeout_ms: 500,
            ..MotionConfig::default()
        };
        let mut c = MotionClassifier::new(config);
        feed_still(&mut c, 0, 30);
        assert!(c.snapshot().truly_stationary);

        feed_shaking(&mut c, 3_000, 10);
        let snap = c.snapshot();
        assert_eq!(snap.state, MotionState::Moving);
        assert!(!snap.truly_stationary);
    }

    #[test]
    fn test_gap_clears_buffers_and_holds_state() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_still(&mut c, 0, MOTION_BUFFER_SIZE);

        // Long silence, then a burst of shaking shorter than the window.
        let resume = 60_000;
        let events = feed_shaking(&mut c, resume, MOTION_BUFFER_SIZE - 1);
        assert!(events.is_empty(), "partial window must not classify: {events:?}");
        assert_eq!(c.state(), MotionState::Stationary);

        let events = feed_shaking(&mut c, resume + 900, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(c.state(), MotionState::Moving);
    }

    #[test]
    fn test_non_finite_samples_are_dropped() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        assert_eq!(c.observe(&accel(0, f64::NAN)), None);
        assert_eq!(c.observe(&accel(1, f64::INFINITY)), None);
        assert_eq!(c.dropped_samples(), 2);
        assert_eq!(c.state(), MotionState::Unknown);
    }

    #[test]
    fn test_unavailable_reports_unknown_once() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_still(&mut c, 0, MOTION_BUFFER_SIZE);

        let event = c.mark_unavailable(5_000);
        assert_eq!(
            event,
            Some(MotionEvent::StateChanged {
                from: MotionState::Stationary,
                to: MotionState::Unknown,
                at_ms: 5_000,
            })
        );
        assert_eq!(c.mark_unavailable(6_000), None);
        assert_eq!(c.tick(10_000_000), None, "unknown never becomes truly stationary");
    }

    #[test]
    fn test_reset_returns_to_unknown() {
        let mut c = MotionClassifier::new(MotionConfig::default());
        feed_shaking(&mut c, 0, 20);
        c.reset();
        assert_eq!(c.snapshot(), MotionSnapshot::default());
    }

    proptest! {
        #[test]
        fn prop_partial_window_never_transitions(
            magnitudes in proptest::collection::vec(0.0f64..40.0, 0..MOTION_BUFFER_SIZE),
            gyros in proptest::collection::vec(0.0f64..5.0, 0..30),
        ) {
            let mut c = MotionClassifier::new(MotionConfig::default());
            for (i, g) in gyros.iter().enumerate() {
                prop_assert_eq!(c.observe(&gyro(i as i64, *g)), None);
            }
            for (i, m) in magnitudes.iter().enumerate() {
                prop_assert_eq!(c.observe(&accel(100 + i as i64, *m)), None);
            }
            prop_assert_eq!(c.state(), MotionState::Unknown);
        }

        #[test]
        fn prop_confidence_is_bounded(
            magnitudes in proptest::collection::vec(0.0f64..40.0, MOTION_BUFFER_SIZE..40),
        ) {
            let mut c = MotionClassifier::new(MotionConfig::default());
            for (i, m) in magnitudes.iter().enumerate() {
                c.observe(&accel(i as i64 * STEP_MS, *m));
                let confidence = c.snapshot().confidence;
                prop_assert!((0.0..=1.0).contains(&confidence));
            }
        }

        #[test]
        fn prop_events_alternate_states(
            magnitudes in proptest::collection::vec(5.0f64..15.0, 0..200),
        ) {
            let mut c = MotionClassifier::new(MotionConfig::default());
            let mut last = MotionState::Unknown;
            for (i, m) in magnitudes.iter().enumerate() {
                if let Some(MotionEvent::StateChanged { from, to, .. }) =
                    c.observe(&accel(i as i64 * STEP_MS, *m))
                {
                    prop_assert_eq!(from, last);
                    prop_assert_ne!(from, to);
                    last = to;
                }
            }
        }
    }
}
