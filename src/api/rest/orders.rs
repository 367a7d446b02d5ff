use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::dispatch::{AcceptOutcome, QueueEntry};
use crate::models::driver::GeoPoint;
use crate::models::order::{Order, OrderGuard, OrderPatch, OrderStatus};
use crate::state::AppState;
use crate::store::OrderStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/reject", post(reject_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/reopen", post(reopen_order))
        .route("/orders/:id/progress", post(progress_order))
        .route("/queue", get(list_queue))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub pickup_address: String,
    pub delivery_address: String,
    pub pickup: Option<GeoPoint>,
    pub delivery: Option<GeoPoint>,
    pub total: f64,
}

#[derive(Deserialize)]
pub struct DriverActionRequest {
    pub driver_id: Uuid,
}

#[derive(Serialize)]
pub struct AcceptResponse {
    pub outcome: AcceptOutcome,
    pub order: Option<Order>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    if payload.pickup_address.trim().is_empty() || payload.delivery_address.trim().is_empty() {
        return Err(AppError::BadRequest("addresses cannot be empty".to_string()));
    }
    if !payload.total.is_finite() || payload.total < 0.0 {
        return Err(AppError::BadRequest("total must be a non-negative amount".to_string()));
    }

    let order = Order::new(
        payload.customer_id,
        payload.pickup_address,
        payload.delivery_address,
        payload.pickup,
        payload.delivery,
        payload.total,
    );

    // Dispatch is triggered by the change feed, not by this handler.
    let order = state.store.insert_order(order).await?;
    Ok(Json(order))
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.store.list_orders())
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(load_order(&state, id).await?))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverActionRequest>,
) -> Result<Json<AcceptResponse>, AppError> {
    load_order(&state, id).await?;
    let outcome = state.orchestrator.accept(id, payload.driver_id).await?;
    let order = state.store.get_order(id).await?;
    Ok(Json(AcceptResponse { outcome, order }))
}

async fn reject_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverActionRequest>,
) -> Result<StatusCode, AppError> {
    load_order(&state, id).await?;
    state.store.signal_rejection(id, payload.driver_id);
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    transition(
        &state,
        id,
        OrderGuard::status_in(&OrderStatus::CANCELLABLE),
        OrderPatch::unassigned(OrderStatus::Cancelled),
    )
    .await
}

async fn reopen_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    transition(
        &state,
        id,
        OrderGuard::status_in(&[OrderStatus::Cancelled]),
        OrderPatch::unassigned(OrderStatus::Pending),
    )
    .await
}

async fn progress_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverActionRequest>,
) -> Result<Json<Order>, AppError> {
    let order = load_order(&state, id).await?;
    let next = order.status.next_in_delivery().ok_or_else(|| {
        AppError::Conflict(format!("order {id} cannot advance from {}", order.status))
    })?;

    transition(
        &state,
        id,
        OrderGuard::held_by(payload.driver_id, order.status),
        OrderPatch {
            status: next,
            driver_id: Some(payload.driver_id),
        },
    )
    .await
}

async fn list_queue(State(state): State<Arc<AppState>>) -> Result<Json<Vec<QueueEntry>>, AppError> {
    Ok(Json(state.orchestrator.queue().list_waiting().await?))
}

async fn load_order(state: &AppState, id: Uuid) -> Result<Order, AppError> {
    state
        .store
        .get_order(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))
}

async fn transition(
    state: &AppState,
    id: Uuid,
    guard: OrderGuard,
    patch: OrderPatch,
) -> Result<Json<Order>, AppError> {
    let current = load_order(state, id).await?;
    let target = patch.status;

    if !state.store.update_order_if(id, &guard, patch).await? {
        return Err(AppError::Conflict(format!(
            "order {id} cannot move from {} to {target}",
            current.status
        )));
    }

    Ok(Json(load_order(state, id).await?))
}
