//! Classifier and policy working together: a commute, a long stop, and a
//! noisy borderline signal, checked against the cadence the policy picks.

use beacon_core::{
    Accuracy, ActiveSchedule, MotionClassifier, MotionConfig, MotionEvent, MotionSample,
    MotionState, RescheduleDecision, STANDARD_GRAVITY, SamplingPolicy, SensorKind,
};

const STEP_MS: i64 = 100;

fn walk(c: &mut MotionClassifier, start: i64, count: usize) -> Vec<MotionEvent> {
    (0..count)
        .filter_map(|i| {
            let ts = start + i as i64 * STEP_MS;
            let bounce = (i as f64 * 1.7).sin() * 2.5;
            c.observe(&MotionSample::new(
                SensorKind::Accelerometer,
                ts,
                0.3,
                0.2,
                STANDARD_GRAVITY + bounce,
            ))
        })
        .collect()
}

fn rest(c: &mut MotionClassifier, start: i64, count: usize) -> Vec<MotionEvent> {
    (0..count)
        .filter_map(|i| {
            let ts = start + i as i64 * STEP_MS;
            c.observe(&MotionSample::new(
                SensorKind::Accelerometer,
                ts,
                0.0,
                0.0,
                STANDARD_GRAVITY + if i % 3 == 0 { 0.02 } else { 0.0 },
            ))
        })
        .collect()
}

/// Walk for a minute, then put the phone on a desk for six minutes.
#[test]
fn commute_then_desk() {
    let config = MotionConfig::default();
    let timeout = config.stationary_timeout_ms as i64;
    let mut c = MotionClassifier::new(config);
    let policy = SamplingPolicy::default();

    let walking = walk(&mut c, 0, 600);
    assert_eq!(c.state(), MotionState::Moving);
    assert_eq!(walking.len(), 1, "one edge into Moving: {walking:?}");
    assert_eq!(policy.params_for(&c.snapshot()).accuracy, Accuracy::High);

    let desk_start = 60_000;
    let desk = rest(&mut c, desk_start, 3_600);
    let changes: Vec<_> = desk
        .iter()
        .filter(|e| matches!(e, MotionEvent::StateChanged { .. }))
        .collect();
    let truly: Vec<_> = desk
        .iter()
        .filter(|e| matches!(e, MotionEvent::TrulyStationary { .. }))
        .collect();
    assert_eq!(changes.len(), 1, "{desk:?}");
    assert_eq!(truly.len(), 1, "{desk:?}");

    let snap = c.snapshot();
    assert_eq!(snap.state, MotionState::Stationary);
    assert!(snap.truly_stationary);
    let entered = snap.since_ms.unwrap();
    assert!(entered >= desk_start);
    if let MotionEvent::TrulyStationary { since_ms, at_ms } = truly[0] {
        assert_eq!(*since_ms, entered);
        assert!(at_ms - since_ms >= timeout);
    }

    assert_eq!(policy.params_for(&snap), policy.truly_stationary);
}

/// Moving -> Stationary -> Moving inside one second must not restart cadence.
#[test]
fn borderline_noise_does_not_thrash() {
    let policy = SamplingPolicy::default();
    let active = ActiveSchedule {
        params: policy.moving,
        started_at_ms: 1_000,
    };

    let flips = [
        (1_200, MotionState::Stationary),
        (1_500, MotionState::Moving),
        (1_900, MotionState::Stationary),
    ];
    let mut restarts = 0;
    for (now, state) in flips {
        match policy.evaluate(&active, policy.params(state, false), now) {
            RescheduleDecision::Reschedule(_) => restarts += 1,
            RescheduleDecision::Defer { remaining } => {
                assert!(remaining.as_millis() > 0);
            }
            RescheduleDecision::Keep | RescheduleDecision::Retune(_) => {}
        }
    }
    assert_eq!(restarts, 0);

    // Once the dwell has passed, a real change goes through.
    let later = 1_000 + policy.reschedule_dwell_ms as i64;
    assert_eq!(
        policy.evaluate(&active, policy.stationary, later),
        RescheduleDecision::Reschedule(policy.stationary)
    );
}

/// A sensor that dies mid-walk degrades to the fixed fallback cadence.
#[test]
fn sensor_loss_falls_back() {
    let mut c = MotionClassifier::new(MotionConfig::default());
    let policy = SamplingPolicy::default();
    walk(&mut c, 0, 50);
    assert_eq!(c.state(), MotionState::Moving);

    let event = c.mark_unavailable(5_000);
    assert!(matches!(
        event,
        Some(MotionEvent::StateChanged {
            to: MotionState::Unknown,
            ..
        })
    ));
    assert_eq!(policy.params_for(&c.snapshot()), policy.unknown);
}
