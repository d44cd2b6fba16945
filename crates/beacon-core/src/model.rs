//! Telemetry records and the bookkeeping types of the delivery queue.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A raw fix as returned by a position provider.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in metres.
    pub accuracy: f64,
    pub altitude: Option<f64>,
    /// Metres per second.
    pub speed: Option<f64>,
    /// Degrees clockwise from true north.
    pub heading: Option<f64>,
    pub timestamp_ms: i64,
}

/// Battery and radio state sampled alongside a fix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Charge in [0, 1].
    pub battery_level: Option<f64>,
    /// Signal strength in dBm.
    pub signal_strength: Option<i32>,
}

/// One location telemetry sample plus device context.
///
/// `origin_id` is assigned once at creation and travels with every delivery
/// attempt so the server can drop duplicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub origin_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<i32>,
    pub timestamp_ms: i64,
}

impl Reading {
    pub fn from_position(position: Position, device: DeviceSnapshot) -> Self {
        Self {
            origin_id: Uuid::new_v4(),
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy: position.accuracy,
            altitude: position.altitude,
            speed: position.speed,
            heading: position.heading,
            battery_level: device.battery_level,
            signal_strength: device.signal_strength,
            timestamp_ms: position.timestamp_ms,
        }
    }
}

/// A non-location event (check-in, geofence crossing, app lifecycle...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub origin_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
}

impl TelemetryEvent {
    pub fn new(event_type: &str, payload: serde_json::Value, timestamp_ms: i64) -> Self {
        Self {
            origin_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload,
            timestamp_ms,
        }
    }
}

/// What travels to the remote sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Reading(Reading),
    Event(TelemetryEvent),
}

impl Payload {
    pub fn origin_id(&self) -> Uuid {
        match self {
            Payload::Reading(r) => r.origin_id,
            Payload::Event(e) => e.origin_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Reading,
    Event,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Reading => "reading",
            ItemKind::Event => "event",
        }
    }
}

/// Identifies a row across the two queue tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub kind: ItemKind,
    pub id: i64,
}

impl ItemKey {
    pub fn reading(id: i64) -> Self {
        Self {
            kind: ItemKind::Reading,
            id,
        }
    }

    pub fn event(id: i64) -> Self {
        Self {
            kind: ItemKind::Event,
            id,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.id)
    }
}

/// Queue item lifecycle. Synced and Abandoned are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Synced,
    Abandoned,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Synced => "synced",
            ItemStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "synced" => Some(ItemStatus::Synced),
            "abandoned" => Some(ItemStatus::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }

    /// Only Pending may move, and only forward.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::Pending, ItemStatus::Synced) | (ItemStatus::Pending, ItemStatus::Abandoned)
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem {
    pub key: ItemKey,
    pub payload: Payload,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Why a drain started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Connectivity came back.
    Reconnect,
    /// Operator or API request.
    Manual,
    /// Fallback timer while online.
    Periodic,
}

impl DrainTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            DrainTrigger::Reconnect => "reconnect",
            DrainTrigger::Manual => "manual",
            DrainTrigger::Periodic => "periodic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reconnect" => Some(DrainTrigger::Reconnect),
            "manual" => Some(DrainTrigger::Manual),
            "periodic" => Some(DrainTrigger::Periodic),
            _ => None,
        }
    }
}

/// Summary of one completed drain. Never mutated once recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: DrainTrigger,
    pub item_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    /// Subset of `failure_count` that exhausted its retries in this run.
    pub abandoned_count: u32,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub first_error: Option<String>,
}

/// Per-status counts for operator inspection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_readings: u64,
    pub pending_events: u64,
    pub synced_readings: u64,
    pub synced_events: u64,
    pub abandoned_readings: u64,
    pub abandoned_events: u64,
    pub oldest_pending_ms: Option<i64>,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.pending_readings + self.pending_events
    }

    pub fn synced(&self) -> u64 {
        self.synced_readings + self.synced_events
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned_readings + self.abandoned_events
    }
}
