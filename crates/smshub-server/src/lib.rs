//! SmsHub HTTP 服务
//!
//! 把 `smshub-core` 的操作暴露成 `/api/v1` 下的 JSON 接口。

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;


use axum::Router;
use smshub_core::SmsHub;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SmsHub>,
}

impl AppState {
    pub fn new(hub: Arc<SmsHub>) -> Self {
        Self { hub }
    }
}

pub fn create_router(state: AppState) -> Router {
    routes::create_api_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
