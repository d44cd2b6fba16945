//! Beacon telemetry core.
//!
//! Decides when a device should sample its position and models what has to
//! reach the remote sink:
//!
//! - [`motion`]: rolling-window motion classifier with stationary hysteresis
//! - [`policy`]: motion state to acquisition cadence, reschedule guard, skip rule
//! - [`retry`]: retry budget for queued deliveries
//! - [`model`]: readings, events, queue items and sync runs
//!
//! Zero I/O. Timers, storage and transport live in `beacon-agent` and
//! `beacon-store`.

pub mod clock;
pub mod config;
pub mod constants;
pub mod model;
pub mod motion;
pub mod policy;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, elapsed_between, format_timestamp};
pub use config::{BeaconConfig, DeliveryConfig};
pub use constants::{MAX_RETRIES, MOTION_BUFFER_SIZE, STANDARD_GRAVITY};
pub use model::{
    DeviceSnapshot, DrainTrigger, ItemKey, ItemKind, ItemStatus, Payload, Position, QueueItem,
    QueueStats, Reading, SyncRun, TelemetryEvent,
};
pub use motion::{
    MotionClassifier, MotionConfig, MotionEvent, MotionSample, MotionSnapshot, MotionState,
    RingBuffer, SensorKind,
};
pub use policy::{
    Accuracy, AcquisitionParams, ActiveSchedule, RescheduleDecision, SamplingPolicy,
};
pub use retry::{RetryDecision, RetryPolicy, decide};
