//! Screen capture sessions.
//!
//! A session is one supervised GStreamer pipeline writing JPEG frames into a
//! fresh directory. The hardware rig feeds it from the HDMI capture card,
//! the virtual rig from the guest's VNC display.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `POST /dut/capture` starts, `GET /dut/capture` stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureAction {
    Start,
    Stop,
}

impl std::fmt::Display for CaptureAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureAction::Start => write!(f, "start"),
            CaptureAction::Stop => write!(f, "stop"),
        }
    }
}

/// Time `gst-launch` gets to push end-of-stream and close the last frame.
const EOS_GRACE: Duration = Duration::from_secs(5);

struct Session {
    id: Uuid,
    dir: PathBuf,
    child: Child,
}

pub struct ScreenCapture {
    program: String,
    source: String,
    output_dir: PathBuf,
    session: Mutex<Option<Session>>,
}

impl ScreenCapture {
    pub fn new(program: impl Into<String>, source: impl Into<String>, output_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            source: source.into(),
            output_dir,
            session: Mutex::new(None),
        }
    }

    /// Pipeline description handed to `gst-launch-1.0`.
    pub fn pipeline_args(&self, dir: &Path) -> Vec<String> {
        let mut args = vec!["-e".to_string()];
        args.extend(self.source.split_whitespace().map(str::to_string));
        args.extend(
            [
                "!",
                "videoconvert",
                "!",
                "videorate",
                "!",
                "video/x-raw,framerate=1/1",
                "!",
                "jpegenc",
                "!",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push("multifilesink".to_string());
        args.push(format!("location={}/%06d.jpg", dir.display()));
        args
    }

    /// Start a session. Starting while one is running restarts it.
    pub async fn start(&self) -> Result<PathBuf> {
        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.take() {
            warn!(session = %previous.id, "capture already running, restarting");
            stop_session(previous).await;
        }

        let id = Uuid::new_v4();
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let dir = self.output_dir.join(format!("{}-{}", stamp, id));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create capture directory {}", dir.display()))?;

        let child = Command::new(&self.program)
            .args(self.pipeline_args(&dir))
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn capture pipeline '{}'", self.program))?;

        info!(session = %id, dir = %dir.display(), "screen capture started");
        *guard = Some(Session {
            id,
            dir: dir.clone(),
            child,
        });
        Ok(dir)
    }

    /// Stop the running session, if any. Returns its directory.
    pub async fn stop(&self) -> Option<PathBuf> {
        let session = self.session.lock().await.take()?;
        let dir = session.dir.clone();
        stop_session(session).await;
        Some(dir)
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

async fn stop_session(mut session: Session) {
    match interrupt_child(&mut session.child, EOS_GRACE).await {
        Ok(status) => debug!(session = %session.id, %status, "capture pipeline exited"),
        Err(e) => warn!(session = %session.id, error = %e, "failed to stop capture pipeline"),
    }
    info!(session = %session.id, dir = %session.dir.display(), "screen capture stopped");
}

/// SIGINT (which `-e` turns into end-of-stream), then SIGKILL after `grace`.
async fn interrupt_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("capture pipeline ignored SIGINT, killing it");
            child.kill().await?;
            child.wait().await
        }
    }
}
