//! Queue drain.
//!
//! One drain at a time: a trigger arriving while a drain runs is coalesced
//! into it and reports [`DrainOutcome::AlreadyRunning`]. Items go out one by
//! one, oldest first; every outcome is written back before the next send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beacon_core::{Clock, DrainTrigger, ItemStatus, Payload, RetryPolicy, SyncRun};
use beacon_store::{Store, StoreError};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::source::{ConnectivityObserver, Credentials, RemoteSink, SendError};

/// The SQLite connection, shared by everything that touches the queue.
pub type SharedStore = Arc<Mutex<Store>>;

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Completed(SyncRun),
    AlreadyRunning,
    /// Connectivity was gone again after the settle delay.
    Offline,
    /// Candidates could not be loaded; nothing was sent.
    Failed(String),
}

/// A sink plus the credentials and deadline every send uses.
#[derive(Clone)]
pub struct Transport {
    sink: Arc<dyn RemoteSink>,
    credentials: Credentials,
    timeout: Duration,
}

impl Transport {
    pub fn new(sink: Arc<dyn RemoteSink>, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            sink,
            credentials,
            timeout,
        }
    }

    pub async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        match tokio::time::timeout(self.timeout, self.sink.send(payload, &self.credentials)).await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }
}

pub struct SyncEngine {
    store: SharedStore,
    transport: Transport,
    connectivity: Arc<dyn ConnectivityObserver>,
    retry: RetryPolicy,
    settle_delay: Duration,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    pending_tx: watch::Sender<u64>,
}

/// Releases the single-flight flag on every exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        transport: Transport,
        connectivity: Arc<dyn ConnectivityObserver>,
        retry: RetryPolicy,
        settle_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            store,
            transport,
            connectivity,
            retry,
            settle_delay,
            clock,
            running: AtomicBool::new(false),
            pending_tx,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivityObserver> {
        &self.connectivity
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Pending item count, republished after every enqueue and drain.
    pub fn pending_rx(&self) -> watch::Receiver<u64> {
        self.pending_tx.subscribe()
    }

    pub async fn refresh_pending(&self) -> Result<u64, StoreError> {
        let count = self.store.lock().await.pending_count()?;
        self.pending_tx.send_replace(count);
        Ok(count)
    }

    pub async fn drain(&self, trigger: DrainTrigger) -> DrainOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            tracing::debug!(trigger = trigger.as_str(), "drain already in progress");
            return DrainOutcome::AlreadyRunning;
        };

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        if !self.connectivity.check() {
            tracing::info!(trigger = trigger.as_str(), "offline after settle delay; drain skipped");
            return DrainOutcome::Offline;
        }

        let started_at_ms = self.clock.now_ms();
        let candidates = match self.store.lock().await.pending_candidates(self.retry) {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("failed to load drain candidates: {e}");
                return DrainOutcome::Failed(e.to_string());
            }
        };

        let mut run = SyncRun {
            id: Uuid::new_v4(),
            trigger,
            item_count: candidates.len() as u32,
            success_count: 0,
            failure_count: 0,
            abandoned_count: 0,
            started_at_ms,
            ended_at_ms: started_at_ms,
            first_error: None,
        };

        for item in candidates {
            match self.transport.send(&item.payload).await {
                Ok(()) => match self.store.lock().await.mark_synced(item.key) {
                    Ok(true) => run.success_count += 1,
                    Ok(false) => {
                        tracing::debug!(item = %item.key, "item settled elsewhere during drain");
                    }
                    Err(e) => {
                        tracing::error!(item = %item.key, "failed to mark item synced: {e}");
                        note_failure(&mut run, format!("storage: {e}"));
                    }
                },
                Err(send_err) => {
                    let message = send_err.to_string();
                    tracing::warn!(item = %item.key, retry_count = item.retry_count, "delivery failed: {message}");
                    note_failure(&mut run, message.clone());
                    match self.store.lock().await.record_failure(item.key, &message, self.retry) {
                        Ok(outcome) if outcome.status == ItemStatus::Abandoned => {
                            run.abandoned_count += 1;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(item = %item.key, "failed to record delivery failure: {e}");
                        }
                    }
                }
            }
        }

        run.ended_at_ms = self.clock.now_ms();
        if let Err(e) = self.store.lock().await.record_sync_run(&run) {
            tracing::error!("failed to record sync run: {e}");
        }
        if let Err(e) = self.refresh_pending().await {
            tracing::error!("failed to refresh pending count: {e}");
        }
        tracing::info!(
            trigger = trigger.as_str(),
            items = run.item_count,
            ok = run.success_count,
            failed = run.failure_count,
            abandoned = run.abandoned_count,
            "drain complete"
        );
        DrainOutcome::Completed(run)
    }
}

fn note_failure(run: &mut SyncRun, message: String) {
    run.failure_count += 1;
    run.first_error.get_or_insert(message);
}
