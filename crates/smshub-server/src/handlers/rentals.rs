//! 租用相关接口
//!
//! 所有业务判断都在 `SmsHub` 里，这里只负责解析请求、调用、序列化。

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use smshub_core::provider::duration_hours;
use smshub_core::{
    CacheRead, ManualRegistration, RemoveOutcome, RentRequest, Rental, RentalChange, RentalView,
    SyncOutcome, UpsertOutcome,
};
use tracing::info;

use crate::{AppState, auth::CurrentCaller, errors::AppResult};

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    #[serde(with = "duration_hours")]
    pub duration: chrono::Duration,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub assignee: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct TestMessageBody {
    #[serde(default = "default_test_sender")]
    pub sender: String,
    pub body: String,
}

fn default_test_sender() -> String {
    "TEST".to_string()
}

pub async fn list_rentals_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Query(query): Query<RefreshQuery>,
) -> AppResult<Json<CacheRead<Vec<Rental>>>> {
    Ok(Json(state.hub.list_rentals(&caller, query.refresh).await?))
}

pub async fn rent_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Json(request): Json<RentRequest>,
) -> AppResult<(StatusCode, Json<Rental>)> {
    let rental = state.hub.rent(&caller, request).await?;
    info!("租号: caller={}, rental_id={}, phone={}", caller.id, rental.id, rental.phone_number);
    Ok((StatusCode::CREATED, Json(rental)))
}

pub async fn register_manual_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Json(registration): Json<ManualRegistration>,
) -> AppResult<(StatusCode, Json<Rental>)> {
    let rental = state.hub.register_manual(&caller, registration).await?;
    Ok((StatusCode::CREATED, Json(rental)))
}

/// 已经结束或不存在的租用返回 204，重复调用结果一致
pub async fn remove_rental_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let response = match state.hub.remove(&caller, &id).await? {
        RemoveOutcome::Cancelled(change) => (StatusCode::OK, Json(change)).into_response(),
        RemoveOutcome::Deleted | RemoveOutcome::AlreadyGone => StatusCode::NO_CONTENT.into_response(),
    };
    Ok(response)
}

pub async fn extend_rental_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
    Json(body): Json<ExtendBody>,
) -> AppResult<Json<RentalChange>> {
    Ok(Json(state.hub.extend(&caller, &id, body.duration).await?))
}

pub async fn cancel_rental_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
) -> AppResult<Json<RentalChange>> {
    Ok(Json(state.hub.cancel(&caller, &id).await?))
}

pub async fn rental_status_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
    Query(query): Query<RefreshQuery>,
) -> AppResult<Json<RentalView>> {
    Ok(Json(state.hub.rental_status(&caller, &id, query.refresh).await?))
}

pub async fn sync_rental_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
) -> AppResult<Json<SyncOutcome>> {
    Ok(Json(state.hub.sync(&caller, &id).await?))
}

pub async fn assign_rental_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
    Json(body): Json<AssignBody>,
) -> AppResult<Json<Rental>> {
    Ok(Json(state.hub.assign(&caller, &id, body.assignee, body.force).await?))
}

pub async fn inject_test_message_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
    Json(body): Json<TestMessageBody>,
) -> AppResult<(StatusCode, Json<UpsertOutcome>)> {
    let outcome = state.hub.inject_test_message(&caller, &id, &body.sender, &body.body).await?;
    let status = if outcome.inserted { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

pub async fn unseen_count_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let unseen = state.hub.unseen_count(&caller, &id).await?;
    Ok(Json(json!({ "rentalId": id, "unseen": unseen })))
}

pub async fn mark_viewed_handler(
    State(state): State<AppState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.hub.mark_viewed(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
