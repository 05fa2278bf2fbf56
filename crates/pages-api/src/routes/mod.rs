//! API routes.

pub mod health;
pub mod status;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/v0", status::router())
        .merge(health::router())
        .with_state(state)
}
