/// Length of the rolling magnitude buffers.
pub const MOTION_BUFFER_SIZE: usize = 10;

/// Accelerometer magnitude standard deviation (m/s²) above which the device is moving.
pub const MOTION_THRESHOLD: f64 = 0.5;

/// Multiplier on [`MOTION_THRESHOLD`]. Above 1.0 the classifier needs more shaking.
pub const MOTION_SENSITIVITY: f64 = 1.0;

/// Mean angular speed (rad/s) above which rotation alone counts as motion.
pub const GYRO_THRESHOLD: f64 = 0.1;

/// How long Stationary must hold before the device is truly stationary (5 minutes).
pub const STATIONARY_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// A silence longer than this between samples invalidates the buffers.
pub const MAX_SAMPLE_GAP_MS: u64 = 10_000;

/// Delivery attempts per queue item before it is abandoned.
pub const MAX_RETRIES: u32 = 3;

/// Synced items older than this are purged (7 days).
pub const RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Pause before a drain re-checks connectivity, so a flapping link settles.
pub const SETTLE_DELAY_MS: u64 = 1_000;

/// Upper bound on a single remote send.
pub const SEND_TIMEOUT_MS: u64 = 15_000;

/// Retention sweep cadence (1 hour).
pub const SWEEP_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Fallback drain cadence while online (5 minutes).
pub const DRAIN_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Interval changes at or below this never restart the acquisition timer.
pub const MIN_INTERVAL_DELTA_MS: u64 = 1_000;

/// Minimum age of the active schedule before a motion change may replace it.
pub const RESCHEDULE_DWELL_MS: u64 = 5_000;

/// Standard gravity, used by the simulators.
pub const STANDARD_GRAVITY: f64 = 9.806_65;
