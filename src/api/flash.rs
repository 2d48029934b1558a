//! `POST /dut/flash` -- a streamed response for a multi-minute operation.
//!
//! The handler starts one driver task and returns immediately with a
//! `202 text/event-stream` body fed by that task. The driver selects over
//! the backend flash future, its progress channel and a keep-alive interval.
//! Leaving the loop drops the interval, so heartbeats stop before the
//! terminal line. The driver does not depend on the client: if the client
//! disconnects the lines go nowhere and the flash runs to completion.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::error::ApiError;
use super::state::AppState;
use crate::flash::progress::{self, ProgressEvent};
use crate::flash::FlashRequest;
use crate::worker::Worker;

/// Upper bound for a JSON flash descriptor body.
const DESCRIPTOR_LIMIT: usize = 64 * 1024;

const HEARTBEAT_LINE: &str = "status: pending";
const DONE_LINE: &str = "status: done";

#[derive(Deserialize)]
struct FlashDescriptor {
    image: PathBuf,
}

pub async fn flash(State(state): State<AppState>, request: Request) -> Response {
    let flash_request = match build_request(&state.workdir, request).await {
        Ok(flash_request) => flash_request,
        Err(e) => return e.into_response(),
    };

    let (lines_tx, lines_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(drive(
        Arc::clone(&state.worker),
        flash_request,
        state.keepalive,
        lines_tx,
    ));

    let body = futures::stream::unfold(lines_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, std::convert::Infallible>(line), rx))
    });

    (
        StatusCode::ACCEPTED,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Raw image bytes, or a JSON `{"image": path}` naming a file on the rig.
async fn build_request(workdir: &Path, request: Request) -> Result<FlashRequest, ApiError> {
    if is_json(request.headers()) {
        let body = axum::body::to_bytes(request.into_body(), DESCRIPTOR_LIMIT).await?;
        let descriptor: FlashDescriptor = serde_json::from_slice(&body)?;
        let path = resolve_image_path(workdir, &descriptor.image)?;
        info!(image = %path.display(), "flashing image from rig filesystem");
        return Ok(FlashRequest::from_file(path));
    }

    let size = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    info!(size = ?size, "flashing image from request body");
    Ok(FlashRequest::from_stream(Box::pin(stream), size))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

/// Image paths are confined to the workdir; relative ones are taken from it.
fn resolve_image_path(workdir: &Path, image: &Path) -> Result<PathBuf, ApiError> {
    if image.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ApiError::new(format!(
            "image path must not contain '..': {}",
            image.display()
        )));
    }
    let path = workdir.join(image);
    if !path.starts_with(workdir) {
        return Err(ApiError::new(format!(
            "image path must be inside {}: {}",
            workdir.display(),
            image.display()
        )));
    }
    Ok(path)
}

async fn drive(
    worker: Arc<dyn Worker>,
    request: FlashRequest,
    keepalive: Duration,
    out: mpsc::UnboundedSender<Bytes>,
) {
    let (progress_tx, mut progress_rx) = progress::channel();
    let operation = worker.flash(request, progress_tx);
    tokio::pin!(operation);

    let mut heartbeat = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            result = &mut operation => break result,
            Some(event) = progress_rx.recv() => send(&out, progress_line(&event)),
            _ = heartbeat.tick() => send(&out, HEARTBEAT_LINE.to_string()),
        }
    };
    drop(heartbeat);

    // Events queued just before the flash settled.
    while let Ok(event) = progress_rx.try_recv() {
        send(&out, progress_line(&event));
    }

    match result {
        Ok(()) => {
            info!("flash complete");
            send(&out, DONE_LINE.to_string());
        }
        Err(e) => {
            error!(error = %e, "flash failed");
            send(&out, format!("error: {}", e));
        }
    }
}

fn progress_line(event: &ProgressEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("progress: {}", json)
}

fn send(out: &mpsc::UnboundedSender<Bytes>, line: String) {
    if out.send(Bytes::from(line + "\n")).is_err() {
        debug!("flash client gone, continuing without it");
    }
}
