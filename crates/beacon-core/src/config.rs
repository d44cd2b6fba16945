//! One configuration schema for every tunable in the pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DRAIN_INTERVAL_MS, MAX_RETRIES, RETENTION_MS, SEND_TIMEOUT_MS, SETTLE_DELAY_MS,
    SWEEP_INTERVAL_MS,
};
use crate::motion::MotionConfig;
use crate::policy::SamplingPolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub send_timeout_ms: u64,
    pub settle_delay_ms: u64,
    /// Age after which Synced items are purged.
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
    /// Fallback drain cadence while online. Zero disables it.
    pub drain_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            send_timeout_ms: SEND_TIMEOUT_MS,
            settle_delay_ms: SETTLE_DELAY_MS,
            retention_ms: RETENTION_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            drain_interval_ms: DRAIN_INTERVAL_MS,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn drain_interval(&self) -> Option<Duration> {
        (self.drain_interval_ms > 0).then(|| Duration::from_millis(self.drain_interval_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub motion: MotionConfig,
    pub sampling: SamplingPolicy,
    pub delivery: DeliveryConfig,
}

impl BeaconConfig {
    pub fn validate(&self) -> Result<(), String> {
        let m = &self.motion;
        if m.buffer_size == 0 {
            return Err("motion.buffer_size must be positive".into());
        }
        if !positive(m.motion_threshold) || !positive(m.motion_sensitivity) {
            return Err("motion.motion_threshold and motion.motion_sensitivity must be positive".into());
        }
        if !positive(m.gyro_threshold) {
            return Err("motion.gyro_threshold must be positive".into());
        }
        self.sampling.validate()?;
        let d = &self.delivery;
        if d.max_retries == 0 {
            return Err("delivery.max_retries must be at least 1".into());
        }
        if d.send_timeout_ms == 0 || d.sweep_interval_ms == 0 {
            return Err("delivery.send_timeout_ms and delivery.sweep_interval_ms must be positive".into());
        }
        Ok(())
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}
