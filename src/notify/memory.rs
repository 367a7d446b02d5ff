use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::notify::{
    Alert, AlertChannel, Notification, NotificationGateway, NotificationHistory,
    NotificationRecord, NotifyError,
};

/// Gateway that logs every delivery and keeps the attempt history in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    history: DashMap<Uuid, NotificationRecord>,
    failures_remaining: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` deliveries fail.
    pub fn fail_next(&self, times: u32) {
        self.failures_remaining.store(times, Ordering::SeqCst);
    }

    /// Inserts a record as-is, used to seed history.
    pub fn insert_record(&self, record: NotificationRecord) {
        self.history.insert(record.id, record);
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<NotificationRecord> =
            self.history.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.sent_at);
        records
    }

    /// Delivered notifications for one target.
    pub fn delivered_to(&self, target: Uuid) -> Vec<Notification> {
        self.records()
            .into_iter()
            .filter(|r| r.delivered && r.target == target)
            .map(|r| r.notification)
            .collect()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NotificationGateway for RecordingNotifier {
    async fn notify(&self, target: Uuid, notification: Notification) -> Result<(), NotifyError> {
        let delivered = !self.take_failure();
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            target,
            notification: notification.clone(),
            delivered,
            sent_at: Utc::now(),
        };
        self.history.insert(record.id, record);

        if !delivered {
            return Err(NotifyError::DeliveryFailed {
                target,
                reason: "push provider rejected the message".to_string(),
            });
        }

        info!(target_id = %target, title = %notification.title, "notification sent");
        Ok(())
    }
}

#[async_trait]
impl NotificationHistory for RecordingNotifier {
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, NotifyError> {
        let mut removed = 0;
        self.history.retain(|_, record| {
            let keep = record.sent_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/// Operator alert channel that writes alerts to the log and keeps them for inspection.
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: DashMap<Uuid, (DateTime<Utc>, Alert)>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<(DateTime<Utc>, Alert)> =
            self.alerts.iter().map(|e| e.value().clone()).collect();
        alerts.sort_by_key(|(raised_at, _)| *raised_at);
        alerts.into_iter().map(|(_, alert)| alert).collect()
    }
}

#[async_trait]
impl AlertChannel for RecordingAlerts {
    async fn alert(&self, alert: Alert) -> Result<(), NotifyError> {
        warn!(title = %alert.title, message = %alert.message, "operator alert raised");
        self.alerts.insert(Uuid::new_v4(), (Utc::now(), alert));
        Ok(())
    }
}
