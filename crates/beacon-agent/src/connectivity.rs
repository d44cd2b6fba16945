use std::sync::Arc;
use std::time::Duration;

use beacon_core::DrainTrigger;
use tokio::time::{Interval, MissedTickBehavior};

use crate::scheduler::{Scheduler, TaskHandle};
use crate::source::ConnectivityObserver;
use crate::sync::SyncEngine;

/// Turns connectivity edges into drains.
pub struct ConnectivityMonitor;

impl ConnectivityMonitor {
    /// Watch `observer` and drain on every offline → online edge. With
    /// `periodic` set, also drain on that cadence while online.
    pub fn spawn(
        observer: Arc<dyn ConnectivityObserver>,
        engine: Arc<SyncEngine>,
        scheduler: &Scheduler,
        periodic: Option<Duration>,
    ) -> TaskHandle {
        let drains = scheduler.child();
        scheduler.spawn(move |token| async move {
            let mut rx = observer.subscribe();
            let mut online = *rx.borrow_and_update();
            let mut fallback = periodic.map(|every| {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            tracing::debug!(online, "connectivity monitor started");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = *rx.borrow_and_update();
                        if now_online && !online {
                            tracing::info!("connectivity restored");
                            spawn_drain(&drains, &engine, DrainTrigger::Reconnect);
                        } else if !now_online && online {
                            tracing::info!("connectivity lost");
                        }
                        online = now_online;
                    }
                    _ = next_tick(&mut fallback) => {
                        if observer.check() {
                            spawn_drain(&drains, &engine, DrainTrigger::Periodic);
                        }
                    }
                }
            }
            drains.shutdown();
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn spawn_drain(drains: &Scheduler, engine: &Arc<SyncEngine>, trigger: DrainTrigger) {
    let engine = Arc::clone(engine);
    let token = drains.token().child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            outcome = engine.drain(trigger) => {
                tracing::debug!(trigger = trigger.as_str(), ?outcome, "drain finished");
            }
        }
    });
}
