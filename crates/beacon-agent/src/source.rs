//! The collaborators the pipeline talks to: motion sensors, the position
//! provider, the remote sink, the connectivity observer and device context.
//!
//! Everything here is object-safe so the agent can hold `Arc<dyn ..>` and
//! tests can swap in the simulators from [`crate::sim`].

use std::fmt;
use std::time::Duration;

use beacon_core::{Accuracy, DeviceSnapshot, MotionSample, Payload, Position};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

// --- Errors ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// No sensor hardware, or access was revoked.
    Unavailable(String),
    /// A single read failed; the stream may continue.
    Read(String),
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Unavailable(msg) => write!(f, "sensor unavailable: {msg}"),
            SensorError::Read(msg) => write!(f, "sensor read failed: {msg}"),
        }
    }
}

impl std::error::Error for SensorError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    NoFix,
    Timeout,
    PermissionDenied,
    Provider(String),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NoFix => write!(f, "no position fix"),
            AcquireError::Timeout => write!(f, "position acquisition timed out"),
            AcquireError::PermissionDenied => write!(f, "location permission denied"),
            AcquireError::Provider(msg) => write!(f, "position provider error: {msg}"),
        }
    }
}

impl std::error::Error for AcquireError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    Network(String),
    Rejected { status: u16, message: String },
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Network(msg) => write!(f, "network error: {msg}"),
            SendError::Rejected { status, message } => {
                write!(f, "rejected by server (HTTP {status}): {message}")
            }
            SendError::Timeout => write!(f, "send timed out"),
        }
    }
}

impl std::error::Error for SendError {}

// --- Collaborators ---

/// Bearer credentials attached to every send.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.token.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials").field("token", &token).finish()
    }
}

/// Best-effort stream of motion samples. It may drop samples, yield errors,
/// or end; the monitor degrades to Unknown in the last two cases.
pub trait SensorSource: Send + Sync {
    fn samples(&self) -> BoxStream<'static, Result<MotionSample, SensorError>>;
}

pub trait PositionProvider: Send + Sync {
    fn acquire(
        &self,
        accuracy: Accuracy,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Position, AcquireError>>;
}

/// Used for both direct sends and queue drains.
pub trait RemoteSink: Send + Sync {
    fn send<'a>(
        &'a self,
        payload: &'a Payload,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), SendError>>;
}

pub trait ConnectivityObserver: Send + Sync {
    /// Current reachability as a watch channel; every change is an edge.
    fn subscribe(&self) -> watch::Receiver<bool>;
    fn check(&self) -> bool;
}

pub trait DeviceContext: Send + Sync {
    fn snapshot(&self) -> DeviceSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = Credentials::bearer("s3cret");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn test_send_error_display() {
        let err = SendError::Rejected {
            status: 422,
            message: "bad latitude".into(),
        };
        assert_eq!(err.to_string(), "rejected by server (HTTP 422): bad latitude");
        assert_eq!(SendError::Timeout.to_string(), "send timed out");
    }
}
