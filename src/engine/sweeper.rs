use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SweeperConfig;
use crate::engine::orchestrator::DispatchOrchestrator;
use crate::models::dispatch::{DispatchOutcome, DispatchTrigger};
use crate::notify::NotificationHistory;
use crate::observability::metrics::Metrics;
use crate::store::{OrderStore, StoreResult};

/// Periodic location/telemetry upkeep owned by another service.
#[async_trait]
pub trait MaintenanceHook: Send + Sync {
    async fn tick(&self);
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcomes: Vec<(Uuid, DispatchOutcome)>,
}

/// Reconciliation loop that re-drives orders a missed change event left behind.
pub struct BackgroundSweeper {
    orchestrator: Arc<DispatchOrchestrator>,
    orders: Arc<dyn OrderStore>,
    history: Arc<dyn NotificationHistory>,
    maintenance: Option<Arc<dyn MaintenanceHook>>,
    config: SweeperConfig,
    metrics: Metrics,
}

impl BackgroundSweeper {
    pub fn new(
        orchestrator: Arc<DispatchOrchestrator>,
        orders: Arc<dyn OrderStore>,
        history: Arc<dyn NotificationHistory>,
        config: SweeperConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            orchestrator,
            orders,
            history,
            maintenance: None,
            config,
            metrics,
        }
    }

    pub fn with_maintenance(mut self, hook: Arc<dyn MaintenanceHook>) -> Self {
        self.maintenance = Some(hook);
        self
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = ticker(self.config.sweep_interval);
        let mut maintenance = ticker(self.config.maintenance_interval);
        let mut purge = ticker(self.config.purge_interval);

        info!(
            sweep_secs = self.config.sweep_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "background sweeper started"
        );

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep_once(Utc::now()).await {
                        error!(error = %err, "stale order sweep failed");
                    }
                }
                _ = maintenance.tick() => {
                    if let Some(hook) = &self.maintenance {
                        hook.tick().await;
                    }
                }
                _ = purge.tick() => {
                    if let Err(err) = self.purge_once(Utc::now()).await {
                        error!(error = %err, "notification history purge failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("background sweeper stopped");
    }

    /// Re-dispatches every pending order untouched for longer than the staleness threshold.
    ///
    /// Before that it stores rejections whose write failed and releases orders still assigned to
    /// a driver who rejected them.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let flushed = self.orchestrator.flush_unconfirmed_rejections().await;
        if flushed > 0 {
            info!(flushed, "stored rejections that failed to persist earlier");
        }

        let mut outcomes = match self.orchestrator.reconcile_rejected_assignments().await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                error!(error = %err, "rejected assignment reconciliation failed");
                Vec::new()
            }
        };

        let cutoff = now - to_chrono(self.config.stale_after);
        let stale = self.orders.list_stale_pending(cutoff).await?;

        if stale.is_empty() {
            debug!("no stale pending orders");
        } else {
            info!(count = stale.len(), "re-dispatching stale pending orders");
            outcomes.extend(
                join_all(stale.iter().map(|order| async move {
                    let outcome = self
                        .orchestrator
                        .dispatch(order.id, DispatchTrigger::Sweep)
                        .await;
                    (order.id, outcome)
                }))
                .await,
            );
        }

        self.metrics
            .sweeper_redispatched_total
            .inc_by(outcomes.len() as u64);
        Ok(SweepReport { outcomes })
    }

    /// Removes notification history older than the retention window.
    pub async fn purge_once(&self, now: DateTime<Utc>) -> Result<usize, crate::notify::NotifyError> {
        let cutoff = now - to_chrono(self.config.notification_retention);
        let removed = self.history.purge_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, "purged old notification history");
        }
        Ok(removed)
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}
