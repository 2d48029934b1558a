//! Control surface route definitions.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::ApiError;
use super::flash;
use super::state::AppState;
use crate::capture::CaptureAction;
use crate::target::ResolutionError;
use crate::worker::NetworkRequest;

pub fn dut_routes() -> Router<AppState> {
    Router::new()
        .route("/dut/on", post(power_on))
        .route("/dut/off", post(power_off))
        .route("/dut/readOutput", post(read_output))
        .route("/dut/network", post(network))
        .route("/dut/ip", get(resolve_ip))
        .route("/dut/capture", post(capture_start).get(capture_stop))
        .route(
            "/dut/flash",
            post(flash::flash).layer(DefaultBodyLimit::disable()),
        )
        .route("/contract", get(contract))
        .route("/teardown", post(teardown))
        .route("/proxy", post(proxy))
        .route("/health", get(health))
}

type ApiResult<T> = Result<T, ApiError>;

async fn power_on(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.worker.power_on().await?;
    Ok("OK")
}

async fn power_off(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.worker.power_off().await?;
    Ok("OK")
}

/// Replies with the console text gathered since the last call, where older
/// workers replied a bare `OK`. Clients treating any 200 as success are
/// unaffected.
async fn read_output(State(state): State<AppState>) -> ApiResult<String> {
    Ok(state.worker.read_output().await?)
}

async fn network(
    State(state): State<AppState>,
    payload: Result<Json<NetworkRequest>, JsonRejection>,
) -> ApiResult<&'static str> {
    let Json(config) = payload?;
    state.worker.network(config).await?;
    Ok("OK")
}

#[derive(Deserialize)]
struct TargetBody {
    target: Option<String>,
}

/// `GET /dut/ip` carries its target in a JSON body.
async fn resolve_ip(State(state): State<AppState>, body: Bytes) -> ApiResult<String> {
    let target = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<TargetBody>(&body)?.target
    };
    let target = target.ok_or(ResolutionError::TargetMissing)?;

    let address = state.resolver.resolve(&target).await?;
    info!(%target, %address, "resolved target");
    Ok(address.to_string())
}

async fn contract(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.contract.to_string(),
    )
}

async fn capture_start(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.worker.capture_screen(CaptureAction::Start).await?;
    Ok("OK")
}

async fn capture_stop(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.worker.capture_screen(CaptureAction::Stop).await?;
    Ok("OK")
}

async fn teardown(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.worker.teardown().await?;
    info!("teardown complete, server stays up for inspection");
    Ok("OK")
}

#[derive(Deserialize)]
struct ProxyBody {
    #[serde(default)]
    port: Option<Value>,
}

/// Kept so old suites keep working; no proxy is started.
async fn proxy(body: Bytes) -> &'static str {
    warn!("proxy endpoint has been deprecated, returning localhost");
    let port = serde_json::from_slice::<ProxyBody>(&body)
        .ok()
        .and_then(|b| b.port)
        .filter(|p| !p.is_null());
    if port.is_some() {
        "127.0.0.1"
    } else {
        "OK"
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workerType": state.worker.worker_type().as_str(),
    }))
}
