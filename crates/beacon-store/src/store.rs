use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use beacon_core::{
    Clock, DrainTrigger, ItemKey, ItemKind, ItemStatus, Payload, QueueItem, QueueStats, Reading,
    RetryDecision, RetryPolicy, SyncRun, SystemClock, TelemetryEvent,
};

use crate::error::{Result, StoreError};
use crate::schema;

/// Result of counting one failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub retry_count: u32,
    pub status: ItemStatus,
}

/// The durable offline queue.
///
/// Every public method is a single statement or a single transaction, so a
/// crash can never leave a half-applied update behind.
pub struct Store {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn, clock })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn, clock })
    }

    // --- Enqueue ---

    /// Persist a payload as Pending. Enqueueing the same origin id twice
    /// returns the existing row instead of duplicating it.
    pub fn enqueue(&self, payload: &Payload) -> Result<ItemKey> {
        match payload {
            Payload::Reading(r) => self.enqueue_reading(r),
            Payload::Event(e) => self.enqueue_event(e),
        }
    }

    pub fn enqueue_reading(&self, reading: &Reading) -> Result<ItemKey> {
        let now = self.clock.now_ms();
        self.conn.execute(
            "INSERT INTO readings_queue (origin_id, latitude, longitude, accuracy, altitude, speed,
                 heading, battery_level, signal_strength, reading_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(origin_id) DO NOTHING",
            params![
                reading.origin_id.to_string(),
                reading.latitude,
                reading.longitude,
                reading.accuracy,
                reading.altitude,
                reading.speed,
                reading.heading,
                reading.battery_level,
                reading.signal_strength,
                reading.timestamp_ms,
                now,
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM readings_queue WHERE origin_id = ?1",
            [reading.origin_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(ItemKey::reading(id))
    }

    pub fn enqueue_event(&self, event: &TelemetryEvent) -> Result<ItemKey> {
        let now = self.clock.now_ms();
        let payload = serde_json::to_string(&event.payload)?;
        self.conn.execute(
            "INSERT INTO events_queue (origin_id, event_type, payload, event_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(origin_id) DO NOTHING",
            params![
                event.origin_id.to_string(),
                event.event_type,
                payload,
                event.timestamp_ms,
                now,
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM events_queue WHERE origin_id = ?1",
            [event.origin_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(ItemKey::event(id))
    }

    // --- Drain support ---

    /// Pending items still inside the retry budget, oldest first across both queues.
    pub fn pending_candidates(&self, policy: RetryPolicy) -> Result<Vec<QueueItem>> {
        let mut items = self.load_readings("WHERE status = 'pending'", [])?;
        items.extend(self.load_events("WHERE status = 'pending'", [])?);
        items.retain(|item| policy.is_eligible(item.retry_count));
        items.sort_by_key(|item| (item.created_at_ms, item.key));
        Ok(items)
    }

    pub fn get_item(&self, key: ItemKey) -> Result<Option<QueueItem>> {
        let mut items = match key.kind {
            ItemKind::Reading => self.load_readings("WHERE id = ?1", params![key.id])?,
            ItemKind::Event => self.load_events("WHERE id = ?1", params![key.id])?,
        };
        Ok(items.pop())
    }

    /// Pending → Synced. Returns false when the item was not Pending, in which
    /// case nothing changes.
    pub fn mark_synced(&self, key: ItemKey) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let Some((status, _)) = current_state(&tx, key)? else {
            return Ok(false);
        };
        if !status.can_transition_to(ItemStatus::Synced) {
            return Ok(false);
        }
        tx.execute(
            &format!(
                "UPDATE {} SET status = 'synced', last_error = NULL, updated_at = ?1 WHERE id = ?2",
                table(key.kind)
            ),
            params![self.clock.now_ms(), key.id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Count one failed attempt and abandon the item once the budget is spent.
    pub fn record_failure(
        &self,
        key: ItemKey,
        error: &str,
        policy: RetryPolicy,
    ) -> Result<FailureOutcome> {
        let table = table(key.kind);
        let tx = self.conn.unchecked_transaction()?;

        let (status, retry_count) = current_state(&tx, key)?
            .ok_or_else(|| StoreError::InvalidData(format!("queue item not found: {key}")))?;
        if status.is_terminal() {
            return Err(StoreError::InvalidData(format!(
                "queue item {key} is already {}",
                status.as_str()
            )));
        }

        let retry_count = retry_count + 1;
        let next = match policy.decide(retry_count) {
            RetryDecision::Retry { .. } => ItemStatus::Pending,
            RetryDecision::Abandon => ItemStatus::Abandoned,
        };
        tx.execute(
            &format!(
                "UPDATE {table} SET retry_count = ?1, status = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?5"
            ),
            params![
                retry_count,
                next.as_str(),
                error,
                self.clock.now_ms(),
                key.id
            ],
        )?;
        tx.commit()?;

        if next == ItemStatus::Abandoned {
            tracing::warn!(item = %key, retry_count, "delivery abandoned: {error}");
        }
        Ok(FailureOutcome {
            retry_count,
            status: next,
        })
    }

    // --- Sync history ---

    pub fn record_sync_run(&self, run: &SyncRun) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_runs (id, trigger_kind, item_count, success_count, failure_count,
                 abandoned_count, start_time, end_time, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id.to_string(),
                run.trigger.as_str(),
                run.item_count,
                run.success_count,
                run.failure_count,
                run.abandoned_count,
                run.started_at_ms,
                run.ended_at_ms,
                run.first_error,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, trigger_kind, item_count, success_count, failure_count, abandoned_count,
                    start_time, end_time, error_message
             FROM sync_runs ORDER BY start_time DESC, rowid DESC LIMIT ?1",
        )?;
        let rows: Vec<(String, String, u32, u32, u32, u32, i64, i64, Option<String>)> = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(
                |(id, trigger, item_count, success_count, failure_count, abandoned_count, started, ended, first_error)| {
                    Ok(SyncRun {
                        id: parse_uuid(&id)?,
                        trigger: DrainTrigger::parse(&trigger).ok_or_else(|| {
                            StoreError::InvalidData(format!("unknown drain trigger '{trigger}'"))
                        })?,
                        item_count,
                        success_count,
                        failure_count,
                        abandoned_count,
                        started_at_ms: started,
                        ended_at_ms: ended,
                        first_error,
                    })
                },
            )
            .collect()
    }

    // --- Inspection ---

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for kind in [ItemKind::Reading, ItemKind::Event] {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT status, COUNT(*) FROM {} GROUP BY status",
                table(kind)
            ))?;
            let counts: Vec<(String, u64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            for (status, count) in counts {
                let slot = match (kind, parse_status(&status)?) {
                    (ItemKind::Reading, ItemStatus::Pending) => &mut stats.pending_readings,
                    (ItemKind::Reading, ItemStatus::Synced) => &mut stats.synced_readings,
                    (ItemKind::Reading, ItemStatus::Abandoned) => &mut stats.abandoned_readings,
                    (ItemKind::Event, ItemStatus::Pending) => &mut stats.pending_events,
                    (ItemKind::Event, ItemStatus::Synced) => &mut stats.synced_events,
                    (ItemKind::Event, ItemStatus::Abandoned) => &mut stats.abandoned_events,
                };
                *slot = count;
            }
        }
        stats.oldest_pending_ms = self.conn.query_row(
            "SELECT MIN(created_at) FROM (
                 SELECT created_at FROM readings_queue WHERE status = 'pending'
                 UNION ALL
                 SELECT created_at FROM events_queue WHERE status = 'pending'
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(stats)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM readings_queue WHERE status = 'pending')
                  + (SELECT COUNT(*) FROM events_queue WHERE status = 'pending')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn list_abandoned(&self) -> Result<Vec<QueueItem>> {
        let mut items = self.load_readings("WHERE status = 'abandoned' ORDER BY created_at, id", [])?;
        items.extend(self.load_events("WHERE status = 'abandoned' ORDER BY created_at, id", [])?);
        items.sort_by_key(|item| (item.created_at_ms, item.key));
        Ok(items)
    }

    // --- Retention ---

    /// Delete Synced items last updated before `cutoff_ms`. Pending and
    /// Abandoned rows are never touched.
    pub fn purge_synced_before(&self, cutoff_ms: i64) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut purged = 0;
        for kind in [ItemKind::Reading, ItemKind::Event] {
            purged += tx.execute(
                &format!(
                    "DELETE FROM {} WHERE status = 'synced' AND updated_at < ?1",
                    table(kind)
                ),
                [cutoff_ms],
            )?;
        }
        tx.commit()?;
        Ok(purged)
    }

    pub fn prune_sync_runs_before(&self, cutoff_ms: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_runs WHERE end_time < ?1", [cutoff_ms])?;
        Ok(rows)
    }

    /// Operator action: drop every Abandoned item.
    pub fn clear_abandoned(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let cleared = tx.execute("DELETE FROM readings_queue WHERE status = 'abandoned'", [])?
            + tx.execute("DELETE FROM events_queue WHERE status = 'abandoned'", [])?;
        tx.commit()?;
        Ok(cleared)
    }

    pub fn checkpoint_truncate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // --- Row mapping ---

    fn load_readings<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, origin_id, latitude, longitude, accuracy, altitude, speed, heading,
                    battery_level, signal_strength, reading_time, status, retry_count, last_error,
                    created_at, updated_at
             FROM readings_queue {filter}"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                let reading = RawReading {
                    id: row.get(0)?,
                    origin_id: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    accuracy: row.get(4)?,
                    altitude: row.get(5)?,
                    speed: row.get(6)?,
                    heading: row.get(7)?,
                    battery_level: row.get(8)?,
                    signal_strength: row.get(9)?,
                    reading_time: row.get(10)?,
                };
                Ok((reading, RawMeta::from_row(row, 11)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(r, meta)| {
                let reading = Reading {
                    origin_id: parse_uuid(&r.origin_id)?,
                    latitude: r.latitude,
                    longitude: r.longitude,
                    accuracy: r.accuracy,
                    altitude: r.altitude,
                    speed: r.speed,
                    heading: r.heading,
                    battery_level: r.battery_level,
                    signal_strength: r.signal_strength,
                    timestamp_ms: r.reading_time,
                };
                meta.into_item(ItemKey::reading(r.id), Payload::Reading(reading))
            })
            .collect()
    }

    fn load_events<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, origin_id, event_type, payload, event_time, status, retry_count, last_error,
                    created_at, updated_at
             FROM events_queue {filter}"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                let id: i64 = row.get(0)?;
                let origin_id: String = row.get(1)?;
                let event_type: String = row.get(2)?;
                let payload: String = row.get(3)?;
                let event_time: i64 = row.get(4)?;
                Ok((id, origin_id, event_type, payload, event_time, RawMeta::from_row(row, 5)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, origin_id, event_type, payload, event_time, meta)| {
                let event = TelemetryEvent {
                    origin_id: parse_uuid(&origin_id)?,
                    event_type,
                    payload: serde_json::from_str(&payload)?,
                    timestamp_ms: event_time,
                };
                meta.into_item(ItemKey::event(id), Payload::Event(event))
            })
            .collect()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint_truncate() {
            tracing::debug!("WAL checkpoint on close failed: {e}");
        }
    }
}

struct RawReading {
    id: i64,
    origin_id: String,
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    altitude: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    battery_level: Option<f64>,
    signal_strength: Option<i32>,
    reading_time: i64,
}

/// Queue bookkeeping columns shared by both tables, in schema order.
struct RawMeta {
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawMeta {
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            status: row.get(offset)?,
            retry_count: row.get(offset + 1)?,
            last_error: row.get(offset + 2)?,
            created_at: row.get(offset + 3)?,
            updated_at: row.get(offset + 4)?,
        })
    }

    fn into_item(self, key: ItemKey, payload: Payload) -> Result<QueueItem> {
        Ok(QueueItem {
            key,
            payload,
            status: parse_status(&self.status)?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at_ms: self.created_at,
            updated_at_ms: self.updated_at,
        })
    }
}

fn table(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Reading => "readings_queue",
        ItemKind::Event => "events_queue",
    }
}

/// Status and retry count of one item, or None when it does not exist.
fn current_state(conn: &Connection, key: ItemKey) -> Result<Option<(ItemStatus, u32)>> {
    let row: Option<(String, u32)> = conn
        .query_row(
            &format!("SELECT status, retry_count FROM {} WHERE id = ?1", table(key.kind)),
            [key.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(status, retry_count)| Ok((parse_status(&status)?, retry_count)))
        .transpose()
}

fn parse_status(s: &str) -> Result<ItemStatus> {
    ItemStatus::parse(s).ok_or_else(|| StoreError::InvalidData(format!("unknown status '{s}'")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}
