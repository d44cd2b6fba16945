//! Adaptive sampling policy.
//!
//! Maps the motion verdict to acquisition parameters and decides whether a
//! running schedule should be replaced. Pure functions over explicit
//! timestamps; the async sampler owns the timers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;
use crate::constants::{MIN_INTERVAL_DELTA_MS, RESCHEDULE_DWELL_MS};
use crate::motion::{MotionSnapshot, MotionState};

/// Accuracy hint forwarded to the position provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    High,
    Balanced,
    Low,
}

impl Accuracy {
    pub fn as_str(self) -> &'static str {
        match self {
            Accuracy::High => "high",
            Accuracy::Balanced => "balanced",
            Accuracy::Low => "low",
        }
    }
}

/// How often to acquire and how hard to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub interval_ms: u64,
    pub accuracy: Accuracy,
    pub timeout_ms: u64,
}

impl AcquisitionParams {
    pub const fn new(interval_ms: u64, accuracy: Accuracy, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            accuracy,
            timeout_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    /// Interval changes smaller than this retune in place.
    pub min_interval_delta_ms: u64,
    /// Minimum schedule age before a restart is allowed.
    pub reschedule_dwell_ms: u64,
    pub moving: AcquisitionParams,
    pub stationary: AcquisitionParams,
    pub truly_stationary: AcquisitionParams,
    /// Fixed fallback while the motion sensor is unavailable.
    pub unknown: AcquisitionParams,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            moving: AcquisitionParams::new(10_000, Accuracy::High, 10_000),
            stationary: AcquisitionParams::new(60_000, Accuracy::Balanced, 15_000),
            truly_stationary: AcquisitionParams::new(300_000, Accuracy::Low, 15_000),
            unknown: AcquisitionParams::new(30_000, Accuracy::Balanced, 15_000),
            min_interval_delta_ms: MIN_INTERVAL_DELTA_MS,
            reschedule_dwell_ms: RESCHEDULE_DWELL_MS,
        }
    }
}

/// The schedule currently driving acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSchedule {
    pub params: AcquisitionParams,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleDecision {
    /// Nothing to change.
    Keep,
    /// Same cadence; swap accuracy/timeout without touching the timer.
    Retune(AcquisitionParams),
    /// The active schedule is too young; ask again after `remaining`.
    Defer { remaining: Duration },
    /// Cancel the active schedule and start this one now.
    Reschedule(AcquisitionParams),
}

impl SamplingPolicy {
    pub fn params(&self, state: MotionState, truly_stationary: bool) -> AcquisitionParams {
        match state {
            MotionState::Moving => self.moving,
            MotionState::Stationary if truly_stationary => self.truly_stationary,
            MotionState::Stationary => self.stationary,
            MotionState::Unknown => self.unknown,
        }
    }

    pub fn params_for(&self, snapshot: &MotionSnapshot) -> AcquisitionParams {
        self.params(snapshot.state, snapshot.truly_stationary)
    }

    /// Skip a cycle when the device is parked and a recent reading exists.
    pub fn should_skip(&self, truly_stationary: bool, last_success_ms: Option<i64>, now_ms: i64) -> bool {
        if !truly_stationary {
            return false;
        }
        match last_success_ms {
            Some(last) => elapsed_between(last, now_ms) < self.truly_stationary.interval(),
            None => false,
        }
    }

    /// Decide what a motion change means for the running schedule.
    ///
    /// Elapsed time is measured on the clock from `active.started_at_ms`,
    /// never by counting how often the timer fired.
    pub fn evaluate(
        &self,
        active: &ActiveSchedule,
        candidate: AcquisitionParams,
        now_ms: i64,
    ) -> RescheduleDecision {
        if candidate == active.params {
            return RescheduleDecision::Keep;
        }
        let delta = active.params.interval_ms.abs_diff(candidate.interval_ms);
        if delta <= self.min_interval_delta_ms {
            return RescheduleDecision::Retune(candidate);
        }
        let age = elapsed_between(active.started_at_ms, now_ms);
        let dwell = Duration::from_millis(self.reschedule_dwell_ms);
        if age < dwell {
            return RescheduleDecision::Defer {
                remaining: dwell - age,
            };
        }
        RescheduleDecision::Reschedule(candidate)
    }

    /// Every interval must be positive and every timeout bounded.
    pub fn validate(&self) -> Result<(), String> {
        for (name, p) in [
            ("moving", &self.moving),
            ("stationary", &self.stationary),
            ("truly_stationary", &self.truly_stationary),
            ("unknown", &self.unknown),
        ] {
            if p.interval_ms == 0 {
                return Err(format!("sampling.{name}.interval_ms must be positive"));
            }
            if p.timeout_ms == 0 {
                return Err(format!("sampling.{name}.timeout_ms must be positive"));
            }
        }
        if self.moving.interval_ms > self.stationary.interval_ms {
            return Err("sampling.moving.interval_ms exceeds sampling.stationary.interval_ms".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SamplingPolicy {
        SamplingPolicy::default()
    }

    fn active(params: AcquisitionParams, started_at_ms: i64) -> ActiveSchedule {
        ActiveSchedule {
            params,
            started_at_ms,
        }
    }

    #[test]
    fn test_moving_is_faster_and_sharper() {
        let p = policy();
        let moving = p.params(MotionState::Moving, false);
        let still = p.params(MotionState::Stationary, false);
        let parked = p.params(MotionState::Stationary, true);

        assert!(moving.interval_ms < still.interval_ms);
        assert!(still.interval_ms < parked.interval_ms);
        assert_eq!(moving.accuracy, Accuracy::High);
        assert_eq!(parked.accuracy, Accuracy::Low);
        assert!(moving.timeout_ms <= still.timeout_ms);
    }

    #[test]
    fn test_unknown_uses_fixed_fallback() {
        let p = policy();
        assert_eq!(p.params(MotionState::Unknown, false), p.unknown);
        // truly_stationary cannot be set without Stationary, but must not matter.
        assert_eq!(p.params(MotionState::Unknown, true), p.unknown);
    }

    #[test]
    fn test_skip_only_when_truly_stationary_and_recent() {
        let p = policy();
        let now = 1_000_000;
        assert!(!p.should_skip(false, Some(now - 1_000), now));
        assert!(!p.should_skip(true, None, now));
        assert!(p.should_skip(true, Some(now - 1_000), now));
        assert!(!p.should_skip(
            true,
            Some(now - p.truly_stationary.interval_ms as i64),
            now
        ));
    }

    #[test]
    fn test_same_params_keep() {
        let p = policy();
        let a = active(p.moving, 0);
        assert_eq!(p.evaluate(&a, p.moving, 60_000), RescheduleDecision::Keep);
    }

    #[test]
    fn test_small_interval_change_retunes_in_place() {
        let p = policy();
        let a = active(p.moving, 0);
        let candidate = AcquisitionParams::new(p.moving.interval_ms + 500, Accuracy::Balanced, 12_000);
        assert_eq!(
            p.evaluate(&a, candidate, 0),
            RescheduleDecision::Retune(candidate)
        );
    }

    #[test]
    fn test_young_schedule_defers() {
        let p = policy();
        let a = active(p.moving, 10_000);
        assert_eq!(
            p.evaluate(&a, p.stationary, 10_800),
            RescheduleDecision::Defer {
                remaining: Duration::from_millis(p.reschedule_dwell_ms - 800)
            }
        );
    }

    #[test]
    fn test_mature_schedule_reschedules() {
        let p = policy();
        let a = active(p.moving, 10_000);
        let now = 10_000 + p.reschedule_dwell_ms as i64;
        assert_eq!(
            p.evaluate(&a, p.stationary, now),
            RescheduleDecision::Reschedule(p.stationary)
        );
    }

    #[test]
    fn test_flapping_within_one_second_never_reschedules() {
        let p = policy();
        let a = active(p.moving, 0);
        // Moving -> Stationary -> Moving inside 900ms.
        for (now, candidate) in [(300, p.stationary), (600, p.moving), (900, p.stationary)] {
            let decision = p.evaluate(&a, candidate, now);
            assert!(
                matches!(
                    decision,
                    RescheduleDecision::Keep | RescheduleDecision::Defer { .. }
                ),
                "t={now}: {decision:?}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut p = policy();
        assert!(p.validate().is_ok());
        p.unknown.interval_ms = 0;
        assert!(p.validate().unwrap_err().contains("unknown"));
    }
}
