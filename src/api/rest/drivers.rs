use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::{Driver, GeoPoint};
use crate::state::AppState;
use crate::store::DriverStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(create_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", patch(update_driver_location))
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct CreateDriverRequest {
    pub name: String,
    pub location: Option<GeoPoint>,
    pub rating: Option<f64>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default = "default_true")]
    pub is_approved: bool,
    #[serde(default = "default_true")]
    pub onboarding_completed: bool,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub is_online: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

async fn create_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name,
        location: payload.location,
        is_online: payload.is_online,
        is_approved: payload.is_approved,
        onboarding_completed: payload.onboarding_completed,
        rating: payload.rating.map(|rating| rating.clamp(0.0, 5.0)),
        is_busy: false,
        updated_at: Utc::now(),
    };

    let driver = state.store.upsert_driver(driver).await?;
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    Json(state.store.list_drivers())
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state.store.set_online(id, payload.is_online).await?;
    Ok(Json(driver))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state.store.set_location(id, payload.location).await?;
    Ok(Json(driver))
}
