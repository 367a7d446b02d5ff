//! Outbound notification and operator alert collaborators.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").map(String::as_str)
    }

    pub fn order_id(&self) -> Option<Uuid> {
        self.metadata.get("order_id").and_then(|raw| raw.parse().ok())
    }
}

/// One delivery attempt kept in the notification history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub target: Uuid,
    pub notification: Notification,
    pub delivered: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NotifyError {
    #[error("delivery to {target} failed: {reason}")]
    DeliveryFailed { target: Uuid, reason: String },

    #[error("alert channel unavailable: {0}")]
    AlertChannel(String),
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, target: Uuid, notification: Notification) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait NotificationHistory: Send + Sync {
    /// Deletes history records sent before `cutoff`, returning how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, NotifyError>;
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn alert(&self, alert: Alert) -> Result<(), NotifyError>;
}
