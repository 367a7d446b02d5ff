use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::intake::OrderIntakeListener;
use crate::engine::orchestrator::{Collaborators, DispatchOrchestrator};
use crate::engine::queue::QueueManager;
use crate::engine::sweeper::BackgroundSweeper;
use crate::notify::memory::{RecordingAlerts, RecordingNotifier};
use crate::observability::metrics::Metrics;
use crate::store::memory::MemoryStore;
use crate::store::ChangeFeed;

/// Every service of the process, built once at startup and shared by reference.
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<RecordingAlerts>,
    pub orchestrator: Arc<DispatchOrchestrator>,
    pub listener: Arc<OrderIntakeListener>,
    pub sweeper: Arc<BackgroundSweeper>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let metrics = Metrics::new();
        let store = Arc::new(MemoryStore::new(
            config.event_buffer_size,
            config.queue_table_enabled,
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let alerts = Arc::new(RecordingAlerts::new());

        let queue = Arc::new(
            QueueManager::new(
                store.queue_store(),
                notifier.clone(),
                metrics.clone(),
                config.dispatch.queue_notify_limit,
            )
            .with_retry_policy(
                config.dispatch.collaborator_retries,
                config.dispatch.retry_backoff,
            ),
        );

        let orchestrator = Arc::new(DispatchOrchestrator::new(
            Collaborators {
                orders: store.clone(),
                drivers: store.clone(),
                rejections: store.clone(),
                queue,
                notifier: notifier.clone(),
                alerts: alerts.clone(),
            },
            config.dispatch.clone(),
            metrics.clone(),
            config.event_buffer_size,
        ));

        let listener = Arc::new(OrderIntakeListener::new(
            orchestrator.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
        ));

        let sweeper = Arc::new(BackgroundSweeper::new(
            orchestrator.clone(),
            store.clone(),
            notifier.clone(),
            config.sweeper.clone(),
            metrics.clone(),
        ));

        Self {
            store,
            notifier,
            alerts,
            orchestrator,
            listener,
            sweeper,
            metrics,
        }
    }

    /// Starts the change-feed listener and the sweeper; both stop when `shutdown` flips.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(
                self.listener
                    .clone()
                    .run(self.store.subscribe(), shutdown.clone()),
            ),
            tokio::spawn(self.sweeper.clone().run(shutdown)),
        ]
    }
}
