//! TOML configuration for the rig worker.
//!
//! Layered model: a TOML file (path from `--config`, the `RIGWORKER_CONFIG`
//! environment variable, or `/etc/rigworker/rigworker.toml`), compiled-in
//! defaults for anything missing, then the environment variables injected by
//! the device supervisor (`BALENA_DEVICE_UUID`, `WORKER_TYPE`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Standard system location of the config file.
const SYSTEM_CONFIG_PATH: &str = "/etc/rigworker/rigworker.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkdirConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub screen_capture: ScreenCaptureConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub flash: FlashConfig,
    #[serde(default)]
    pub testbot: TestbotConfig,
    #[serde(default)]
    pub qemu: QemuConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded worker configuration");
        Ok(config)
    }

    /// Resolve the configuration the process should run with.
    ///
    /// An explicitly requested file must load; the `RIGWORKER_CONFIG` and
    /// system locations fall back to defaults with a warning. Environment
    /// overrides are applied last in every case.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `RIGWORKER_CONFIG` environment variable.
    /// 2. `/etc/rigworker/rigworker.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("RIGWORKER_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RIGWORKER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply the supervisor-provided environment on top of the file config.
    ///
    /// `lookup` abstracts `std::env::var` so the mapping can be tested
    /// without touching the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(uuid) = set("BALENA_DEVICE_UUID") {
            self.identity.device_uuid = Some(uuid);
        }
        if let Some(worker_type) = set("WORKER_TYPE") {
            self.identity.worker_type = worker_type;
        }
        if let Some(key) = set("BALENA_API_KEY") {
            self.identity.api_key = Some(key);
        }
        if let Some(url) = set("BALENA_API_URL") {
            self.identity.api_url = url;
        }
        if let Some(workdir) = set("RIGWORKER_WORKDIR") {
            self.worker.workdir = PathBuf::from(workdir);
        }
    }

    /// Heartbeat period for long-running streamed responses.
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.server.keepalive_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who this worker is and how it reaches the device-management service.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Device identifier assigned by the device-management service.
    pub device_uuid: Option<String>,
    /// Worker type selector (`testbot_hat` or `qemu`).
    pub worker_type: String,
    /// Bearer credential used only for tag lookup.
    pub api_key: Option<String>,
    /// Base URL of the device-management API.
    pub api_url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_uuid: None,
            worker_type: "testbot_hat".to_string(),
            api_key: None,
            api_url: "https://api.balena-cloud.com/".to_string(),
        }
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("device_uuid", &self.device_uuid)
            .field("worker_type", &self.worker_type)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP control surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the control API listener.
    pub bind: String,
    /// Interval between `status: pending` keep-alive writes (milliseconds).
    pub keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2000".to_string(),
            keepalive_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Workdir
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkdirConfig {
    /// Scratch directory for images, disks and captures.
    pub workdir: PathBuf,
}

impl Default for WorkdirConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/data"),
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Host-side interfaces the rig uses to give the DUT connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wired interface facing the DUT.
    pub wired_interface: Option<String>,
    /// Wireless interface used to host an access point for the DUT.
    pub wireless_interface: Option<String>,
    /// Path (or bare command name resolved via `$PATH`) to `nmcli`.
    pub nmcli_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wired_interface: Some("eth1".to_string()),
            wireless_interface: Some("wlan0".to_string()),
            nmcli_path: "nmcli".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Screen capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenCaptureConfig {
    /// Whether this rig has a capture path at all.
    pub enabled: bool,
    /// GStreamer launcher binary.
    pub program: String,
    /// Source element override; each backend has its own default.
    pub source: Option<String>,
    /// Where capture sessions are written. Defaults to `<workdir>/capture`.
    pub output_dir: Option<PathBuf>,
}

impl Default for ScreenCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "gst-launch-1.0".to_string(),
            source: None,
            output_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// How long `readOutput` waits for new bytes when the buffer is empty.
    pub read_wait_ms: u64,
    /// Oldest bytes are discarded beyond this size.
    pub max_buffer_bytes: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            read_wait_ms: 1_000,
            max_buffer_bytes: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Minimum interval between progress events per destination (milliseconds).
    pub progress_interval_ms: u64,
    /// Chunks buffered per destination before the reader waits.
    pub queue_depth: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 500,
            queue_depth: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Testbot HAT
// ---------------------------------------------------------------------------

/// Physical controller board wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbotConfig {
    /// GPIO value file driving the DUT power relay (`1` = on).
    pub power_gpio: PathBuf,
    /// GPIO value file switching the SD mux (`1` = host, `0` = DUT).
    pub sd_mux_gpio: Option<PathBuf>,
    /// Block devices that receive the image when flashing.
    pub block_devices: Vec<PathBuf>,
    /// Serial device wired to the DUT console.
    pub serial_device: Option<PathBuf>,
    /// Settle time after toggling power or the SD mux (milliseconds).
    pub settle_ms: u64,
    /// GStreamer source for the capture card.
    pub capture_source: String,
}

impl Default for TestbotConfig {
    fn default() -> Self {
        Self {
            power_gpio: PathBuf::from("/sys/class/gpio/gpio26/value"),
            sd_mux_gpio: Some(PathBuf::from("/sys/class/gpio/gpio20/value")),
            block_devices: vec![PathBuf::from("/dev/sda")],
            serial_device: Some(PathBuf::from("/dev/ttyS0")),
            settle_ms: 1_000,
            capture_source: "v4l2src device=/dev/video0".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// QEMU
// ---------------------------------------------------------------------------

/// Virtual machine guest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuConfig {
    /// Emulator binary.
    pub binary: String,
    /// Guest CPU count.
    pub cpus: u32,
    /// Guest memory, in QEMU size syntax.
    pub memory: String,
    /// Virtual disk image, relative to the workdir unless absolute.
    pub disk_image: PathBuf,
    /// Optional UEFI firmware image.
    pub firmware: Option<PathBuf>,
    /// VNC display number exposed for screen capture.
    pub vnc_display: u16,
    /// Use hardware acceleration when available.
    pub kvm: bool,
    /// Arguments appended verbatim.
    pub extra_args: Vec<String>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            cpus: 4,
            memory: "2G".to_string(),
            disk_image: PathBuf::from("disk.img"),
            firmware: None,
            vnc_display: 0,
            kvm: true,
            extra_args: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
