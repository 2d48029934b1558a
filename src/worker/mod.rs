//! Worker backends -- uniform DUT lifecycle control over different rigs.
//!
//! The server holds exactly one `Arc<dyn Worker>`, chosen at startup by
//! [`build`] from the configured worker type. Routes never branch on the
//! backend.

pub mod qemu;
pub mod testbot;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::capture::CaptureAction;
use crate::config::WorkerConfig;
use crate::flash::progress::ProgressSender;
use crate::flash::{FlashError, FlashRequest};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("power control failed: {0}")]
    Power(String),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error("invalid network configuration: {0}")]
    NetworkConfig(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("unknown worker type '{requested}' (supported: {})", .supported.join(", "))]
    UnknownType {
        requested: String,
        supported: Vec<&'static str>,
    },
}

// ---------------------------------------------------------------------------
// Worker types & registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    #[serde(rename = "testbot_hat")]
    TestbotHat,
    #[serde(rename = "qemu")]
    Qemu,
}

impl WorkerType {
    pub const ALL: [WorkerType; 2] = [WorkerType::TestbotHat, WorkerType::Qemu];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::TestbotHat => "testbot_hat",
            WorkerType::Qemu => "qemu",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerType {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WorkerError::UnknownType {
                requested: s.to_string(),
                supported: WorkerType::ALL.iter().map(|t| t.as_str()).collect(),
            })
    }
}

type Constructor = fn(&WorkerConfig) -> Arc<dyn Worker>;

fn new_testbot(config: &WorkerConfig) -> Arc<dyn Worker> {
    Arc::new(testbot::TestbotWorker::new(config))
}

fn new_qemu(config: &WorkerConfig) -> Arc<dyn Worker> {
    Arc::new(qemu::QemuWorker::new(config))
}

/// Worker type to constructor. The only place backends are named.
const REGISTRY: [(WorkerType, Constructor); 2] = [
    (WorkerType::TestbotHat, new_testbot),
    (WorkerType::Qemu, new_qemu),
];

/// Construct the backend selected by `config.identity.worker_type`.
pub fn build(config: &WorkerConfig) -> Result<Arc<dyn Worker>, WorkerError> {
    let kind: WorkerType = config.identity.worker_type.parse()?;
    let (_, construct) = REGISTRY
        .iter()
        .find(|(t, _)| *t == kind)
        .ok_or_else(|| WorkerError::BackendUnavailable(format!("no constructor for {}", kind)))?;
    info!(worker_type = %kind, "constructing worker backend");
    Ok(construct(config))
}

// ---------------------------------------------------------------------------
// Network requests
// ---------------------------------------------------------------------------

/// Body of `POST /dut/network`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkRequest {
    #[serde(default)]
    pub wired: Option<WiredConfig>,
    #[serde(default)]
    pub wireless: Option<WirelessConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WiredConfig {
    /// Share the rig's uplink with the DUT.
    #[serde(default)]
    pub nat: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WirelessConfig {
    pub ssid: String,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub nat: bool,
}

impl NetworkRequest {
    /// Backend-independent checks.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if let Some(wireless) = &self.wireless {
            if wireless.ssid.is_empty() || wireless.ssid.len() > 32 {
                return Err(WorkerError::NetworkConfig(
                    "ssid must be between 1 and 32 bytes".to_string(),
                ));
            }
            if let Some(psk) = &wireless.psk {
                if psk.len() < 8 || psk.len() > 63 {
                    return Err(WorkerError::NetworkConfig(
                        "psk must be between 8 and 63 characters".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker contract
// ---------------------------------------------------------------------------

/// Device lifecycle contract every rig backend implements.
///
/// Mutating calls are expected one at a time; the server does not serialize
/// them. After [`Worker::teardown`], the next mutating call runs setup again.
#[async_trait]
pub trait Worker: Send + Sync {
    fn worker_type(&self) -> WorkerType;

    /// One-time initialization; failure is fatal at startup.
    async fn setup(&self) -> Result<(), WorkerError>;

    async fn power_on(&self) -> Result<(), WorkerError>;

    /// Idempotent.
    async fn power_off(&self) -> Result<(), WorkerError>;

    /// Write an image to the backend's storage, reporting progress.
    async fn flash(&self, request: FlashRequest, progress: ProgressSender) -> Result<(), WorkerError>;

    async fn network(&self, config: NetworkRequest) -> Result<(), WorkerError>;

    /// Console output captured since the previous call.
    async fn read_output(&self) -> Result<String, WorkerError>;

    /// `Stop` without a running capture is a no-op.
    async fn capture_screen(&self, action: CaptureAction) -> Result<(), WorkerError>;

    /// Release everything `setup` acquired. Safe to repeat.
    async fn teardown(&self) -> Result<(), WorkerError>;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    TornDown,
}

/// Shared setup/teardown bookkeeping for backends.
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub async fn mark(&self, state: LifecycleState) {
        *self.state.lock().await = state;
    }

    /// True when the backend must (re)run setup before serving a mutating call.
    pub async fn needs_setup(&self) -> bool {
        let state = *self.state.lock().await;
        if state == LifecycleState::TornDown {
            debug!("backend was torn down, reinitializing");
        }
        state != LifecycleState::Ready
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a helper program to completion, returning stdout.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> anyhow::Result<String> {
    use anyhow::Context;

    debug!(%program, ?args, "running helper command");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
