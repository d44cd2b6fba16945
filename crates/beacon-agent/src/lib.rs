//! Beacon agent runtime.
//!
//! The tokio half of the pipeline. [`monitor::MotionMonitor`] classifies the
//! sensor stream, [`sampler::AdaptiveSampler`] acquires positions at the
//! cadence the motion state calls for, [`delivery::Delivery`] sends or
//! queues each reading, and [`sync::SyncEngine`] drains the queue when
//! connectivity returns. [`agent::Agent`] wires them together.

pub mod agent;
pub mod connectivity;
pub mod delivery;
pub mod http;
pub mod monitor;
pub mod retention;
pub mod sampler;
pub mod scheduler;
pub mod sim;
pub mod source;
pub mod sync;

pub use agent::{Agent, Collaborators};
pub use connectivity::ConnectivityMonitor;
pub use delivery::{Delivery, SubmitOutcome};
pub use http::HttpSink;
pub use monitor::MotionMonitor;
pub use retention::{RetentionSweeper, SweepReport};
pub use sampler::{AdaptiveSampler, SamplerStats};
pub use scheduler::{Scheduler, TaskHandle, TokioClock};
pub use source::{
    AcquireError, ConnectivityObserver, Credentials, DeviceContext, PositionProvider, RemoteSink,
    SendError, SensorError, SensorSource,
};
pub use sync::{DrainOutcome, SharedStore, SyncEngine, Transport};
