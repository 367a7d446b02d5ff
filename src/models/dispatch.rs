use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub rating_score: f64,
    pub availability_score: f64,
    pub workload_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    pub driver_id: Uuid,
    pub score: f64,
    pub distance_miles: Option<f64>,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rejection {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    WaitingForDriver,
    Assigned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub order_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueStatus,
}

/// What caused a dispatch cycle to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTrigger {
    Inserted,
    Reopened,
    Sweep,
    Rejection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastReason {
    BelowThreshold,
    NoCoordinates,
    OutsideRadius,
    CollaboratorFailure,
    AssignRacesExhausted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    NoDriversAvailable,
    NoAlternativeDriver,
}

impl EscalationReason {
    pub fn alert_title(self) -> &'static str {
        match self {
            EscalationReason::NoDriversAvailable => "No drivers available",
            EscalationReason::NoAlternativeDriver => "No alternative driver",
        }
    }
}

/// Result of one dispatch decision cycle. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    AutoAssigned {
        driver_id: Uuid,
        candidate: ScoredCandidate,
    },
    Broadcasted {
        recipients: Vec<Uuid>,
        reason: BroadcastReason,
    },
    /// Escalated and held in the queue until a driver accepts.
    Queued {
        reason: EscalationReason,
        alerted_drivers: usize,
    },
    /// Escalated without a queue holding (queue table absent or unwritable).
    Escalated {
        reason: EscalationReason,
        alerted_drivers: usize,
    },
    Skipped {
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::AutoAssigned { .. } => "auto_assigned",
            DispatchOutcome::Broadcasted { .. } => "broadcasted",
            DispatchOutcome::Queued { .. } => "queued",
            DispatchOutcome::Escalated { .. } => "escalated",
            DispatchOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub order_id: Uuid,
    pub trigger: DispatchTrigger,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AcceptOutcome {
    Accepted,
    /// The guard no longer matched: another driver won, or the order was cancelled.
    AlreadyTaken,
    /// The driver previously rejected this order.
    Declined,
}
