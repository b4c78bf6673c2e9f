use axum::{Router, routing::get};

use crate::api::{
    ApiState,
    handlers::{downloads, health, status},
};

pub(crate) fn build_app(state: ApiState) -> Router<()> {
    let v1 = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/downloads", get(downloads));

    Router::new().nest("/api/v1", v1).with_state(state)
}
