use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::{
    AppState,
    handlers::{health_handler, rentals},
};

/// v1 路由
pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/rentals",
            get(rentals::list_rentals_handler).post(rentals::rent_handler),
        )
        .route("/rentals/manual", post(rentals::register_manual_handler))
        .route("/rentals/{id}", delete(rentals::remove_rental_handler))
        .route("/rentals/{id}/extend", post(rentals::extend_rental_handler))
        .route("/rentals/{id}/cancel", post(rentals::cancel_rental_handler))
        .route("/rentals/{id}/status", get(rentals::rental_status_handler))
        .route("/rentals/{id}/sync", post(rentals::sync_rental_handler))
        .route("/rentals/{id}/assign", post(rentals::assign_rental_handler))
        .route("/rentals/{id}/messages/test", post(rentals::inject_test_message_handler))
        .route(
            "/rentals/{id}/viewed",
            get(rentals::unseen_count_handler).post(rentals::mark_viewed_handler),
        )
}
