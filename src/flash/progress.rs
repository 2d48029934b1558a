//! Progress events for in-flight flash operations.
//!
//! Each flash call gets its own bounded channel. The route that started the
//! flash holds the receiver, so events never leak across calls.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

/// Events buffered before a writer waits for the consumer.
pub const PROGRESS_CAPACITY: usize = 64;

/// Progress of one destination. Destinations are reported independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub destination: String,
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Bytes per second since the previous event.
    pub throughput: f64,
    /// Bytes per second since the destination started.
    pub average_throughput: f64,
    pub complete: bool,
}

/// Sending half handed to the worker backend.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSender {
    /// A sender whose events go nowhere.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Deliver an event. A consumer that went away is not an error.
    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Open a progress channel for one flash call.
pub fn channel() -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(PROGRESS_CAPACITY);
    (ProgressSender { tx: Some(tx) }, rx)
}

/// Rate-limited throughput meter for a single destination.
pub(crate) struct Meter {
    destination: String,
    total: Option<u64>,
    interval: Duration,
    started: Instant,
    last_emit: Instant,
    last_bytes: u64,
}

impl Meter {
    pub(crate) fn new(destination: &str, total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            destination: destination.to_string(),
            total,
            interval,
            started: now,
            last_emit: now,
            last_bytes: 0,
        }
    }

    /// An event if at least one interval has passed since the last one.
    pub(crate) fn update(&mut self, written: u64) -> Option<ProgressEvent> {
        if self.last_emit.elapsed() < self.interval {
            return None;
        }
        Some(self.event(written, false))
    }

    /// The final event for this destination, always produced.
    pub(crate) fn finish(&mut self, written: u64) -> ProgressEvent {
        self.event(written, true)
    }

    fn event(&mut self, written: u64, complete: bool) -> ProgressEvent {
        let now = Instant::now();
        let window = now.duration_since(self.last_emit).as_secs_f64();
        let overall = now.duration_since(self.started).as_secs_f64();
        let rate = |bytes: u64, secs: f64| if secs > 0.0 { bytes as f64 / secs } else { 0.0 };

        let percentage = self.total.filter(|t| *t > 0).map(|t| {
            let pct = written as f64 * 100.0 / t as f64;
            pct.min(100.0)
        });

        let event = ProgressEvent {
            destination: self.destination.clone(),
            bytes_written: written,
            total_bytes: self.total,
            percentage,
            throughput: rate(written.saturating_sub(self.last_bytes), window),
            average_throughput: rate(written, overall),
            complete,
        };
        self.last_emit = now;
        self.last_bytes = written;
        event
    }
}
