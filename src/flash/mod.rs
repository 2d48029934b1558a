//! Flash pipeline -- stream one OS image into every destination at once.
//!
//! The image is read once and each chunk is fanned out to one writer task per
//! destination through a bounded queue, so wall-clock time follows the
//! slowest destination. A destination that fails drops out of the fan-out
//! while the others keep going. The call returns only after every writer
//! task has finished.

pub mod progress;

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use self::progress::{Meter, ProgressSender};

/// Chunked image bytes, as delivered by the HTTP body or a file reader.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("no flash destinations configured")]
    NoDestinations,

    #[error("failed to open image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image stream failed: {0}")]
    Source(#[source] io::Error),

    #[error("failed to write image to {}", join_failures(.0))]
    Destinations(Vec<DestinationFailure>),
}

/// One destination that did not receive the full image.
#[derive(Debug, Clone, Error)]
#[error("{destination} ({reason})")]
pub struct DestinationFailure {
    pub destination: String,
    pub reason: String,
}

fn join_failures(failures: &[DestinationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Request & destinations
// ---------------------------------------------------------------------------

pub enum ImageSource {
    Stream(ByteStream),
    File(PathBuf),
}

/// A single flash call's input. Consumed by [`write_image`].
pub struct FlashRequest {
    pub source: ImageSource,
    /// Image size when known up front (`Content-Length` or file length).
    pub size: Option<u64>,
}

impl FlashRequest {
    pub fn from_stream(stream: ByteStream, size: Option<u64>) -> Self {
        Self {
            source: ImageSource::Stream(stream),
            size,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ImageSource::File(path.into()),
            size: None,
        }
    }

    async fn open(self) -> Result<(ByteStream, Option<u64>), FlashError> {
        match self.source {
            ImageSource::Stream(stream) => Ok((stream, self.size)),
            ImageSource::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|source| FlashError::Image {
                        path: path.clone(),
                        source,
                    })?;
                let size = match file.metadata().await {
                    Ok(meta) => Some(meta.len()),
                    Err(_) => self.size,
                };
                Ok((Box::pin(ReaderStream::new(file)), size))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// Existing device node; never created or truncated.
    BlockDevice,
    /// Regular file, created and truncated before writing.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub path: PathBuf,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn block_device(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            kind: DestinationKind::BlockDevice,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            kind: DestinationKind::File,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub progress_interval: Duration,
    pub queue_depth: usize,
}

impl From<&FlashConfig> for FlashOptions {
    fn from(config: &FlashConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            queue_depth: config.queue_depth.max(1),
        }
    }
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self::from(&FlashConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Write the image to all destinations concurrently.
///
/// Returns the number of image bytes read. Progress already emitted for
/// destinations that succeeded stands even when the overall call fails.
pub async fn write_image(
    request: FlashRequest,
    destinations: &[Destination],
    options: &FlashOptions,
    progress: ProgressSender,
) -> Result<u64, FlashError> {
    fan_out(request, destinations, options, progress, open_file_sink).await
}

async fn fan_out(
    request: FlashRequest,
    destinations: &[Destination],
    options: &FlashOptions,
    progress: ProgressSender,
    open: OpenSink,
) -> Result<u64, FlashError> {
    if destinations.is_empty() {
        return Err(FlashError::NoDestinations);
    }

    let (mut source, total) = request.open().await?;
    let cancel = CancellationToken::new();

    info!(
        destinations = destinations.len(),
        total_bytes = ?total,
        "flashing image"
    );

    let mut queues = Vec::with_capacity(destinations.len());
    let mut writers = Vec::with_capacity(destinations.len());
    for dest in destinations {
        let (tx, rx) = mpsc::channel::<Bytes>(options.queue_depth.max(1));
        queues.push((dest.name.clone(), tx));
        writers.push((
            dest.name.clone(),
            tokio::spawn(write_destination(
                dest.clone(),
                open,
                rx,
                total,
                options.progress_interval,
                progress.clone(),
                cancel.clone(),
            )),
        ));
    }

    let mut read: u64 = 0;
    let mut source_error = None;
    while let Some(chunk) = source.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                source_error = Some(e);
                break;
            }
        };
        read += chunk.len() as u64;

        let sent = futures::future::join_all(queues.iter().map(|(_, tx)| tx.send(chunk.clone()))).await;
        let mut outcomes = sent.into_iter();
        queues.retain(|(name, _)| {
            let alive = matches!(outcomes.next(), Some(Ok(())));
            if !alive {
                warn!(destination = %name, "destination stopped accepting data");
            }
            alive
        });

        if queues.is_empty() {
            warn!("every destination failed, abandoning image stream");
            break;
        }
    }

    if source_error.is_some() {
        cancel.cancel();
    }
    // Closing the queues is end-of-image for the writers.
    drop(queues);

    let mut failures = Vec::new();
    for (name, writer) in writers {
        match writer.await {
            Ok(Ok(written)) => debug!(destination = %name, written, "destination complete"),
            Ok(Err(failure)) => failures.push(failure),
            Err(e) => failures.push(DestinationFailure {
                destination: name,
                reason: format!("writer task failed: {}", e),
            }),
        }
    }

    if let Some(e) = source_error {
        return Err(FlashError::Source(e));
    }
    if !failures.is_empty() {
        return Err(FlashError::Destinations(failures));
    }

    info!(bytes = read, destinations = destinations.len(), "image written");
    Ok(read)
}

async fn write_destination(
    dest: Destination,
    open: OpenSink,
    mut rx: mpsc::Receiver<Bytes>,
    total: Option<u64>,
    interval: Duration,
    progress: ProgressSender,
    cancel: CancellationToken,
) -> Result<u64, DestinationFailure> {
    let fail = |reason: String| DestinationFailure {
        destination: dest.name.clone(),
        reason,
    };

    let mut sink = open(dest.clone())
        .await
        .map_err(|e| fail(format!("open failed: {}", e)))?;
    let mut meter = Meter::new(&dest.name, total, interval);
    let mut written: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(fail("cancelled".to_string())),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };

        sink.write_chunk(&chunk)
            .await
            .map_err(|e| fail(format!("write failed at byte {}: {}", written, e)))?;
        written += chunk.len() as u64;

        if let Some(event) = meter.update(written) {
            progress.emit(event).await;
        }
    }

    sink.commit()
        .await
        .map_err(|e| fail(format!("sync failed: {}", e)))?;

    progress.emit(meter.finish(written)).await;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Where one destination's bytes end up.
#[async_trait]
trait Sink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Flush and make the written data durable.
    async fn commit(&mut self) -> io::Result<()>;
}

#[async_trait]
impl Sink for tokio::fs::File {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk).await
    }

    async fn commit(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.sync_all().await
    }
}

type OpenSink = fn(Destination) -> BoxFuture<'static, io::Result<Box<dyn Sink>>>;

fn open_file_sink(dest: Destination) -> BoxFuture<'static, io::Result<Box<dyn Sink>>> {
    async move {
        let file = open_destination(&dest.path, dest.kind).await?;
        Ok(Box::new(file) as Box<dyn Sink>)
    }
    .boxed()
}

async fn open_destination(path: &Path, kind: DestinationKind) -> io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if kind == DestinationKind::File {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        options.create(true).truncate(true);
    }
    options.open(path).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
