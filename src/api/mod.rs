//! API layer -- axum routes, handlers, and error translation.

mod error;
mod flash;
mod routes;
pub mod state;

pub use self::error::ApiError;
use self::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the control router around the process's single worker.
pub fn router(state: AppState) -> Router {
    routes::dut_routes()
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
