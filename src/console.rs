//! Shared DUT console buffer.
//!
//! A background task feeds bytes from the serial device (or the guest's
//! stdout) into the buffer; `readOutput` drains whatever arrived since the
//! previous read.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ConsoleBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    bytes: Mutex<Vec<u8>>,
    notify: Notify,
    max_bytes: usize,
}

impl ConsoleBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bytes: Mutex::new(Vec::new()),
                notify: Notify::new(),
                max_bytes: max_bytes.max(1),
            }),
        }
    }

    /// Append bytes, discarding the oldest ones past the size cap.
    pub async fn push(&self, data: &[u8]) {
        let mut bytes = self.inner.bytes.lock().await;
        bytes.extend_from_slice(data);
        if bytes.len() > self.inner.max_bytes {
            let mut cut = bytes.len() - self.inner.max_bytes;
            // Never keep half a character at the front.
            while cut < bytes.len() && is_continuation(bytes[cut]) {
                cut += 1;
            }
            bytes.drain(..cut);
        }
        drop(bytes);
        self.inner.notify.notify_waiters();
    }

    /// Take everything captured since the last drain.
    ///
    /// When nothing is buffered, waits up to `wait` for new data and returns
    /// whatever is there afterwards, possibly nothing. A character split
    /// across reads stays buffered until its remaining bytes arrive.
    pub async fn drain(&self, wait: Duration) -> String {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a push between check and wait is seen.
        notified.as_mut().enable();

        {
            let mut bytes = self.inner.bytes.lock().await;
            let text = take_text(&mut bytes);
            if !text.is_empty() {
                return text;
            }
        }

        let _ = tokio::time::timeout(wait, notified).await;
        take_text(&mut *self.inner.bytes.lock().await)
    }

    pub async fn clear(&self) {
        self.inner.bytes.lock().await.clear();
    }

    /// Spawn a task copying `reader` into the buffer until EOF or error.
    pub fn attach<R>(&self, name: &str, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => {
                        debug!(source = %name, "console source closed");
                        break;
                    }
                    Ok(n) => buffer.push(&chunk[..n]).await,
                    Err(e) => {
                        warn!(source = %name, error = %e, "console read failed");
                        break;
                    }
                }
            }
        })
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Decode the buffer, leaving an incomplete trailing character in place.
fn take_text(bytes: &mut Vec<u8>) -> String {
    let keep = incomplete_tail(bytes);
    let tail = bytes.split_off(bytes.len() - keep);
    let text = String::from_utf8_lossy(bytes).into_owned();
    *bytes = tail;
    text
}

/// Length of a UTF-8 sequence cut short at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    match (start..bytes.len()).rev().find(|&i| !is_continuation(bytes[i])) {
        Some(lead) => match std::str::from_utf8(&bytes[lead..]) {
            Err(e) if e.error_len().is_none() => bytes.len() - lead,
            _ => 0,
        },
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Serial devices
// ---------------------------------------------------------------------------

/// A serial console opened non-blocking and driven by the reactor.
///
/// Dropping the port (or aborting the task reading it) closes the device at
/// once; no read is left parked on the blocking pool.
#[cfg(unix)]
pub struct SerialPort {
    fd: tokio::io::unix::AsyncFd<std::fs::File>,
}

#[cfg(unix)]
impl SerialPort {
    /// Must be called from within the runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        Ok(Self {
            fd: tokio::io::unix::AsyncFd::new(file)?,
        })
    }
}

#[cfg(unix)]
impl AsyncRead for SerialPort {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::io::Read;
        use std::task::Poll;

        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| {
                let mut file: &std::fs::File = fd.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Open a serial console for [`ConsoleBuffer::attach`].
#[cfg(unix)]
pub fn open_serial(path: &Path) -> io::Result<SerialPort> {
    SerialPort::open(path)
}

#[cfg(not(unix))]
pub fn open_serial(path: &Path) -> io::Result<tokio::fs::File> {
    std::fs::File::open(path).map(tokio::fs::File::from_std)
}
