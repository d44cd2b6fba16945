use std::sync::Arc;
use std::time::Duration;

use beacon_core::{BeaconConfig, Clock, Payload, Reading};
use beacon_store::{Store, StoreError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connectivity::ConnectivityMonitor;
use crate::delivery::Delivery;
use crate::monitor::MotionMonitor;
use crate::retention::RetentionSweeper;
use crate::sampler::AdaptiveSampler;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::source::{
    ConnectivityObserver, Credentials, DeviceContext, PositionProvider, RemoteSink, SensorSource,
};
use crate::sync::{SyncEngine, Transport};

/// How long shutdown lets the forwarder keep sending directly before it
/// switches to queueing everything that is left.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the agent does not own.
pub struct Collaborators {
    pub sensor: Box<dyn SensorSource>,
    pub provider: Arc<dyn PositionProvider>,
    pub sink: Arc<dyn RemoteSink>,
    pub connectivity: Arc<dyn ConnectivityObserver>,
    pub device: Arc<dyn DeviceContext>,
    pub credentials: Credentials,
}

/// The assembled pipeline: motion monitor → sampler → delivery → queue,
/// plus the connectivity-driven drain and the retention sweep.
pub struct Agent {
    scheduler: Scheduler,
    monitor: MotionMonitor,
    sampler: AdaptiveSampler,
    engine: Arc<SyncEngine>,
    delivery: Arc<Delivery>,
    forwarder: JoinHandle<()>,
    flush: CancellationToken,
    _tasks: Vec<TaskHandle>,
}

impl Agent {
    /// Wire every component and start tracking. Must run inside a tokio runtime.
    pub fn start(
        config: &BeaconConfig,
        store: Store,
        parts: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Scheduler::new();
        let store = Arc::new(Mutex::new(store));

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Transport::new(
                parts.sink,
                parts.credentials,
                config.delivery.send_timeout(),
            ),
            Arc::clone(&parts.connectivity),
            config.delivery.retry_policy(),
            config.delivery.settle_delay(),
            Arc::clone(&clock),
        ));
        let delivery = Arc::new(Delivery::new(Arc::clone(&engine)));

        let monitor = MotionMonitor::spawn(
            config.motion.clone(),
            Arc::clone(&clock),
            parts.sensor.as_ref(),
            &scheduler,
        );
        let (sampler, readings) = AdaptiveSampler::new(
            config.sampling.clone(),
            parts.provider,
            parts.device,
            monitor.subscribe(),
            Arc::clone(&clock),
            &scheduler,
        );

        let flush = CancellationToken::new();
        let forwarder = tokio::spawn(forward(readings, Arc::clone(&delivery), flush.clone()));

        let mut tasks = vec![ConnectivityMonitor::spawn(
            parts.connectivity,
            Arc::clone(&engine),
            &scheduler,
            config.delivery.drain_interval(),
        )];
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.delivery.retention(),
        ));
        tasks.push(sweeper.spawn(&scheduler, config.delivery.sweep_interval()));

        sampler.start();
        tracing::info!("agent started");

        Self {
            scheduler,
            monitor,
            sampler,
            engine,
            delivery,
            forwarder,
            flush,
            _tasks: tasks,
        }
    }

    pub fn monitor(&self) -> &MotionMonitor {
        &self.monitor
    }

    pub fn sampler(&self) -> &AdaptiveSampler {
        &self.sampler
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn delivery(&self) -> &Arc<Delivery> {
        &self.delivery
    }

    /// Stop sampling, persist readings already acquired, cancel every
    /// background task and checkpoint the WAL.
    pub async fn shutdown(self) -> Result<(), StoreError> {
        self.sampler.stop();
        // Dropping the sampler closes the readings channel; the forwarder then
        // finishes whatever is still buffered.
        drop(self.sampler);
        let mut forwarder = self.forwarder;
        let joined = match tokio::time::timeout(FLUSH_TIMEOUT, &mut forwarder).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("direct sends still running at shutdown; queueing the rest");
                self.flush.cancel();
                forwarder.await
            }
        };
        if let Err(e) = joined {
            tracing::error!("reading forwarder panicked: {e}");
        }

        self.scheduler.shutdown();
        let store = self.engine.store().lock().await;
        store.checkpoint_truncate()?;
        tracing::info!("agent stopped");
        Ok(())
    }
}

/// Hand each reading to delivery. Once `flush` fires, the send in progress is
/// abandoned and it and every reading still buffered go straight to the queue.
async fn forward(
    mut readings: mpsc::UnboundedReceiver<Reading>,
    delivery: Arc<Delivery>,
    flush: CancellationToken,
) {
    while let Some(reading) = readings.recv().await {
        let payload = Payload::Reading(reading);
        tokio::select! {
            biased;
            _ = flush.cancelled() => {
                persist(&delivery, &payload).await;
                break;
            }
            result = delivery.submit_payload(payload.clone()) => {
                if let Err(e) = result {
                    tracing::error!("failed to persist reading: {e}");
                }
            }
        }
    }
    while let Some(reading) = readings.recv().await {
        persist(&delivery, &Payload::Reading(reading)).await;
    }
}

async fn persist(delivery: &Delivery, payload: &Payload) {
    if let Err(e) = delivery.persist(payload).await {
        tracing::error!(origin_id = %payload.origin_id(), "failed to persist reading: {e}");
    }
}
