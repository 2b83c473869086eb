pub mod rentals;

use axum::{Json, extract::State};
use serde_json::{Value, json};
use smshub_core::build_info;

use crate::AppState;

/// 存活检查 + 构建信息
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let status = if state.hub.is_shutting_down() { "stopping" } else { "ok" };
    Json(json!({
        "status": status,
        "build": build_info(),
        "providers": state.hub.provider_kinds(),
    }))
}
