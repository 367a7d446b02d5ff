use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::OrderStatus;

pub const ORDERS_TABLE: &str = "orders";
pub const DRIVERS_TABLE: &str = "drivers";
pub const REJECTION_SIGNALS_TABLE: &str = "order_rejection_signals";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row change as delivered by the store's change feed, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Value,
    #[serde(default)]
    pub old_record: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    OrderInserted {
        order_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        driver_id: Option<Uuid>,
    },
    DriverRejected {
        order_id: Uuid,
        driver_id: Uuid,
    },
    DriverCameOnline {
        driver_id: Uuid,
    },
}

impl ChangeEvent {
    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            ChangeEvent::OrderInserted { order_id }
            | ChangeEvent::OrderStatusChanged { order_id, .. }
            | ChangeEvent::DriverRejected { order_id, .. } => Some(*order_id),
            ChangeEvent::DriverCameOnline { .. } => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Deserialize)]
struct OrderRow {
    id: Uuid,
    status: OrderStatus,
    #[serde(default)]
    driver_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct DriverRow {
    id: Uuid,
    is_online: bool,
}

#[derive(Deserialize)]
struct RejectionSignalRow {
    order_id: Uuid,
    driver_id: Uuid,
}

impl ChangeRecord {
    /// Validates the record and turns it into an engine event.
    ///
    /// `Ok(None)` means the change is well-formed but irrelevant to dispatch, e.g. an order update
    /// that did not touch the status.
    pub fn decode(&self) -> Result<Option<ChangeEvent>, DecodeError> {
        match self.table.as_str() {
            ORDERS_TABLE => self.decode_order(),
            DRIVERS_TABLE => self.decode_driver(),
            REJECTION_SIGNALS_TABLE => {
                let row: RejectionSignalRow = parse_row(&self.record, "record")?;
                Ok(Some(ChangeEvent::DriverRejected {
                    order_id: row.order_id,
                    driver_id: row.driver_id,
                }))
            }
            other => Err(DecodeError::UnknownTable(other.to_string())),
        }
    }

    fn decode_order(&self) -> Result<Option<ChangeEvent>, DecodeError> {
        let new: OrderRow = parse_row(&self.record, "record")?;
        match self.kind {
            ChangeKind::Insert => Ok(Some(ChangeEvent::OrderInserted { order_id: new.id })),
            ChangeKind::Update => {
                let old_value = self
                    .old_record
                    .as_ref()
                    .ok_or(DecodeError::MissingField("old_record"))?;
                let old: OrderRow = parse_row(old_value, "old_record")?;
                if old.status == new.status {
                    return Ok(None);
                }
                Ok(Some(ChangeEvent::OrderStatusChanged {
                    order_id: new.id,
                    from: old.status,
                    to: new.status,
                    driver_id: new.driver_id.or(old.driver_id),
                }))
            }
        }
    }

    fn decode_driver(&self) -> Result<Option<ChangeEvent>, DecodeError> {
        let new: DriverRow = parse_row(&self.record, "record")?;
        let was_online = match (&self.kind, &self.old_record) {
            (ChangeKind::Update, Some(old)) => parse_row::<DriverRow>(old, "old_record")?.is_online,
            _ => false,
        };

        if new.is_online && !was_online {
            Ok(Some(ChangeEvent::DriverCameOnline { driver_id: new.id }))
        } else {
            Ok(None)
        }
    }
}

fn parse_row<T: serde::de::DeserializeOwned>(
    value: &Value,
    field: &'static str,
) -> Result<T, DecodeError> {
    if value.is_null() {
        return Err(DecodeError::MissingField(field));
    }
    serde_json::from_value(value.clone()).map_err(|err| DecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}
