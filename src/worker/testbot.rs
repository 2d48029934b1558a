//! Testbot HAT backend -- a physical controller board wired to the DUT.
//!
//! Power and the SD mux are GPIO lines exposed as sysfs value files; the
//! image goes to the block device(s) the mux exposes to the rig host; the
//! console is a serial device; network reachability is provided by the rig's
//! own interfaces through NetworkManager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    run_command, Lifecycle, LifecycleState, NetworkRequest, WiredConfig, WirelessConfig, Worker,
    WorkerError, WorkerType,
};
use crate::capture::{CaptureAction, ScreenCapture};
use crate::config::{NetworkConfig, WorkerConfig};
use crate::console::{self, ConsoleBuffer};
use crate::flash::progress::ProgressSender;
use crate::flash::{self, Destination, FlashOptions, FlashRequest};

const WIRED_CONNECTION: &str = "rig-wired";
const WIRELESS_CONNECTION: &str = "rig-wireless";

pub struct TestbotWorker {
    lifecycle: Lifecycle,
    power_gpio: PathBuf,
    sd_mux_gpio: Option<PathBuf>,
    block_devices: Vec<PathBuf>,
    serial_device: Option<PathBuf>,
    settle: Duration,
    network: NetworkConfig,
    console: ConsoleBuffer,
    console_wait: Duration,
    console_task: Mutex<Option<JoinHandle<()>>>,
    capture: Option<ScreenCapture>,
    flash_options: FlashOptions,
}

impl TestbotWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        let capture = config.screen_capture.enabled.then(|| {
            let source = config
                .screen_capture
                .source
                .clone()
                .unwrap_or_else(|| config.testbot.capture_source.clone());
            let output_dir = config
                .screen_capture
                .output_dir
                .clone()
                .unwrap_or_else(|| config.worker.workdir.join("capture"));
            ScreenCapture::new(config.screen_capture.program.clone(), source, output_dir)
        });

        Self {
            lifecycle: Lifecycle::new(),
            power_gpio: config.testbot.power_gpio.clone(),
            sd_mux_gpio: config.testbot.sd_mux_gpio.clone(),
            block_devices: config.testbot.block_devices.clone(),
            serial_device: config.testbot.serial_device.clone(),
            settle: Duration::from_millis(config.testbot.settle_ms),
            network: config.network.clone(),
            console: ConsoleBuffer::new(config.console.max_buffer_bytes),
            console_wait: Duration::from_millis(config.console.read_wait_ms),
            console_task: Mutex::new(None),
            capture,
            flash_options: FlashOptions::from(&config.flash),
        }
    }

    async fn ensure_ready(&self) -> Result<(), WorkerError> {
        if self.lifecycle.needs_setup().await {
            self.setup().await?;
        }
        Ok(())
    }

    async fn set_power(&self, on: bool) -> Result<(), WorkerError> {
        write_gpio(&self.power_gpio, on)
            .await
            .map_err(|e| WorkerError::Power(format!("{}: {}", self.power_gpio.display(), e)))?;
        debug!(on, "DUT power line set");
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Route the DUT storage to the rig host (`true`) or back to the DUT.
    async fn set_mux_to_host(&self, host: bool) -> Result<(), WorkerError> {
        let Some(mux) = &self.sd_mux_gpio else {
            return Ok(());
        };
        write_gpio(mux, host)
            .await
            .map_err(|e| WorkerError::BackendUnavailable(format!("SD mux {}: {}", mux.display(), e)))?;
        debug!(host, "SD mux switched");
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn apply_nmcli(&self, steps: Vec<NmcliStep>) -> Result<(), WorkerError> {
        for step in steps {
            let args: Vec<&str> = step.args.iter().map(String::as_str).collect();
            match run_command(&self.network.nmcli_path, &args).await {
                Ok(_) => {}
                Err(e) if step.tolerate_failure => {
                    debug!(error = %e, "ignoring nmcli failure");
                }
                Err(e) => return Err(WorkerError::NetworkConfig(e.to_string())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for TestbotWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::TestbotHat
    }

    async fn setup(&self) -> Result<(), WorkerError> {
        check_gpio(&self.power_gpio).await?;
        if let Some(mux) = &self.sd_mux_gpio {
            check_gpio(mux).await?;
        }

        if let Some(serial) = &self.serial_device {
            match console::open_serial(serial) {
                Ok(port) => {
                    let task = self.console.attach(&serial.display().to_string(), port);
                    if let Some(old) = self.console_task.lock().await.replace(task) {
                        old.abort();
                    }
                }
                Err(e) => warn!(device = %serial.display(), error = %e, "console unavailable"),
            }
        }

        // Known state: DUT off, storage on the DUT side.
        self.set_power(false).await?;
        self.set_mux_to_host(false).await?;

        self.lifecycle.mark(LifecycleState::Ready).await;
        info!(
            power_gpio = %self.power_gpio.display(),
            block_devices = self.block_devices.len(),
            "testbot worker ready"
        );
        Ok(())
    }

    async fn power_on(&self) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        self.set_mux_to_host(false).await?;
        self.set_power(true).await?;
        info!("DUT powered on");
        Ok(())
    }

    async fn power_off(&self) -> Result<(), WorkerError> {
        self.set_power(false).await?;
        info!("DUT powered off");
        Ok(())
    }

    async fn flash(&self, request: FlashRequest, progress: ProgressSender) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        self.power_off().await?;
        self.set_mux_to_host(true).await?;

        let destinations: Vec<Destination> = self
            .block_devices
            .iter()
            .map(Destination::block_device)
            .collect();
        let result = flash::write_image(request, &destinations, &self.flash_options, progress).await;

        // The DUT must get its storage back whatever happened.
        if let Err(e) = self.set_mux_to_host(false).await {
            warn!(error = %e, "failed to return SD mux to the DUT");
        }

        result?;
        Ok(())
    }

    async fn network(&self, config: NetworkRequest) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        config.validate()?;

        let mut steps = Vec::new();
        match (&config.wired, &self.network.wired_interface) {
            (Some(wired), Some(iface)) => steps.extend(wired_steps(iface, wired)),
            (Some(_), None) => {
                return Err(WorkerError::NetworkConfig(
                    "no wired interface configured on this rig".to_string(),
                ))
            }
            (None, _) => steps.push(NmcliStep::down(WIRED_CONNECTION)),
        }
        match (&config.wireless, &self.network.wireless_interface) {
            (Some(wireless), Some(iface)) => steps.extend(wireless_steps(iface, wireless)),
            (Some(_), None) => {
                return Err(WorkerError::NetworkConfig(
                    "no wireless interface configured on this rig".to_string(),
                ))
            }
            (None, _) => steps.push(NmcliStep::down(WIRELESS_CONNECTION)),
        }

        self.apply_nmcli(steps).await?;
        info!(wired = config.wired.is_some(), wireless = config.wireless.is_some(), "network applied");
        Ok(())
    }

    async fn read_output(&self) -> Result<String, WorkerError> {
        Ok(self.console.drain(self.console_wait).await)
    }

    async fn capture_screen(&self, action: CaptureAction) -> Result<(), WorkerError> {
        match (action, &self.capture) {
            (CaptureAction::Start, Some(capture)) => {
                self.ensure_ready().await?;
                capture
                    .start()
                    .await
                    .map_err(|e| WorkerError::Capture(format!("{:#}", e)))?;
            }
            (CaptureAction::Start, None) => {
                return Err(WorkerError::Capture(
                    "screen capture is not enabled on this rig".to_string(),
                ))
            }
            (CaptureAction::Stop, Some(capture)) => {
                capture.stop().await;
            }
            (CaptureAction::Stop, None) => {}
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), WorkerError> {
        if self.lifecycle.state().await != LifecycleState::Ready {
            return Ok(());
        }

        if let Some(capture) = &self.capture {
            capture.stop().await;
        }
        if let Err(e) = self.set_power(false).await {
            warn!(error = %e, "failed to power off DUT during teardown");
        }
        if let Some(task) = self.console_task.lock().await.take() {
            task.abort();
        }
        self.console.clear().await;

        self.lifecycle.mark(LifecycleState::TornDown).await;
        info!("testbot worker torn down");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GPIO
// ---------------------------------------------------------------------------

async fn write_gpio(path: &Path, high: bool) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(if high { b"1" } else { b"0" }).await?;
    file.flush().await
}

async fn check_gpio(path: &Path) -> Result<(), WorkerError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map(|_| ())
        .map_err(|e| WorkerError::BackendUnavailable(format!("GPIO {}: {}", path.display(), e)))
}

// ---------------------------------------------------------------------------
// NetworkManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct NmcliStep {
    args: Vec<String>,
    tolerate_failure: bool,
}

impl NmcliStep {
    fn required(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            tolerate_failure: false,
        }
    }

    fn optional(args: &[&str]) -> Self {
        Self {
            tolerate_failure: true,
            ..Self::required(args)
        }
    }

    fn down(connection: &str) -> Self {
        Self::optional(&["connection", "down", connection])
    }
}

fn ipv4_method(nat: bool) -> &'static str {
    if nat {
        "shared"
    } else {
        "link-local"
    }
}

fn wired_steps(iface: &str, wired: &WiredConfig) -> Vec<NmcliStep> {
    vec![
        NmcliStep::optional(&["connection", "delete", WIRED_CONNECTION]),
        NmcliStep::required(&[
            "connection",
            "add",
            "type",
            "ethernet",
            "ifname",
            iface,
            "con-name",
            WIRED_CONNECTION,
            "ipv4.method",
            ipv4_method(wired.nat),
            "ipv6.method",
            "ignore",
        ]),
        NmcliStep::required(&["connection", "up", WIRED_CONNECTION]),
    ]
}

fn wireless_steps(iface: &str, wireless: &WirelessConfig) -> Vec<NmcliStep> {
    let mut hotspot = vec![
        "device",
        "wifi",
        "hotspot",
        "ifname",
        iface,
        "con-name",
        WIRELESS_CONNECTION,
        "ssid",
        wireless.ssid.as_str(),
    ];
    if let Some(psk) = &wireless.psk {
        hotspot.extend(["password", psk.as_str()]);
    }

    let mut steps = vec![
        NmcliStep::optional(&["connection", "delete", WIRELESS_CONNECTION]),
        NmcliStep::required(&hotspot),
    ];
    if !wireless.nat {
        steps.push(NmcliStep::required(&[
            "connection",
            "modify",
            WIRELESS_CONNECTION,
            "ipv4.method",
            ipv4_method(false),
        ]));
        steps.push(NmcliStep::required(&["connection", "up", WIRELESS_CONNECTION]));
    }
    steps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::progress;

    struct Rig {
        _dir: tempfile::TempDir,
        power: PathBuf,
        mux: PathBuf,
        devices: Vec<PathBuf>,
        worker: TestbotWorker,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let power = dir.path().join("power");
        let mux = dir.path().join("mux");
        let devices = vec![dir.path().join("sda"), dir.path().join("sdb")];
        for path in [&power, &mux].into_iter().chain(devices.iter()) {
            std::fs::write(path, b"").unwrap();
        }

        let mut config = WorkerConfig::default();
        config.worker.workdir = dir.path().to_path_buf();
        config.testbot.power_gpio = power.clone();
        config.testbot.sd_mux_gpio = Some(mux.clone());
        config.testbot.block_devices = devices.clone();
        config.testbot.serial_device = None;
        config.testbot.settle_ms = 0;
        config.flash.progress_interval_ms = 0;
        config.console.read_wait_ms = 10;
        config.network.nmcli_path = "/nonexistent/nmcli".into();

        Rig {
            worker: TestbotWorker::new(&config),
            _dir: dir,
            power,
            mux,
            devices,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_setup_leaves_dut_off() {
        let rig = rig();
        rig.worker.setup().await.unwrap();
        assert_eq!(read(&rig.power), "0");
        assert_eq!(read(&rig.mux), "0");
    }

    #[tokio::test]
    async fn test_setup_fails_without_gpio() {
        let mut config = WorkerConfig::default();
        config.testbot.power_gpio = PathBuf::from("/nonexistent/gpio/value");
        let worker = TestbotWorker::new(&config);
        assert!(matches!(
            worker.setup().await,
            Err(WorkerError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_power_cycle_and_idempotent_off() {
        let rig = rig();
        rig.worker.setup().await.unwrap();
        rig.worker.power_on().await.unwrap();
        assert_eq!(read(&rig.power), "1");
        rig.worker.power_off().await.unwrap();
        rig.worker.power_off().await.unwrap();
        assert_eq!(read(&rig.power), "0");
    }

    #[tokio::test]
    async fn test_flash_writes_all_block_devices() {
        let rig = rig();
        rig.worker.setup().await.unwrap();
        rig.worker.power_on().await.unwrap();

        let (tx, mut rx) = progress::channel();
        let image: flash::ByteStream = Box::pin(futures::stream::iter(vec![Ok(
            bytes::Bytes::from_static(b"os-image"),
        )]));
        rig.worker
            .flash(FlashRequest::from_stream(image, Some(8)), tx)
            .await
            .unwrap();

        for device in &rig.devices {
            assert_eq!(read(device), "os-image");
        }
        // Flashing powers the DUT off and hands storage back afterwards.
        assert_eq!(read(&rig.power), "0");
        assert_eq!(read(&rig.mux), "0");

        let mut seen = std::collections::HashSet::new();
        while let Ok(event) = rx.try_recv() {
            seen.insert(event.destination);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_twice_then_power_on_reinitializes() {
        let rig = rig();
        rig.worker.setup().await.unwrap();
        rig.worker.teardown().await.unwrap();
        rig.worker.teardown().await.unwrap();
        assert_eq!(rig.worker.lifecycle.state().await, LifecycleState::TornDown);

        rig.worker.power_on().await.unwrap();
        assert_eq!(rig.worker.lifecycle.state().await, LifecycleState::Ready);
        assert_eq!(read(&rig.power), "1");
    }

    #[cfg(unix)]
    #[test]
    fn test_teardown_releases_silent_serial_console() {
        use std::io::Write;

        let rig = rig();
        let fifo = rig._dir.path().join("ttyS0");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        let mut config = WorkerConfig::default();
        config.testbot.power_gpio = rig.power.clone();
        config.testbot.sd_mux_gpio = None;
        config.testbot.serial_device = Some(fifo.clone());
        config.testbot.settle_ms = 0;
        config.console.read_wait_ms = 5000;

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            let writer = runtime.block_on(async {
                let worker = TestbotWorker::new(&config);
                worker.setup().await.unwrap();
                let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();
                writer.write_all(b"login: ").unwrap();
                assert_eq!(worker.read_output().await.unwrap(), "login: ");

                // The DUT is off now and the line goes quiet.
                worker.teardown().await.unwrap();
                writer
            });
            drop(runtime);
            drop(writer);
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("runtime shutdown blocked after teardown");
    }

    #[tokio::test]
    async fn test_capture_stop_without_start_is_noop() {
        let rig = rig();
        rig.worker.capture_screen(CaptureAction::Stop).await.unwrap();
        assert!(matches!(
            rig.worker.capture_screen(CaptureAction::Start).await,
            Err(WorkerError::Capture(_))
        ));
    }

    #[tokio::test]
    async fn test_network_failure_is_network_config_error() {
        let rig = rig();
        rig.worker.setup().await.unwrap();
        let req = NetworkRequest {
            wired: Some(WiredConfig { nat: true }),
            wireless: None,
        };
        assert!(matches!(
            rig.worker.network(req).await,
            Err(WorkerError::NetworkConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_read_output_is_empty_without_console() {
        let rig = rig();
        assert_eq!(rig.worker.read_output().await.unwrap(), "");
    }

    #[test]
    fn test_wired_steps_select_ipv4_method() {
        let steps = wired_steps("eth1", &WiredConfig { nat: true });
        assert!(steps[0].tolerate_failure);
        assert!(steps[1].args.contains(&"shared".to_string()));
        assert!(steps[1].args.contains(&"eth1".to_string()));
        let isolated = wired_steps("eth1", &WiredConfig { nat: false });
        assert!(isolated[1].args.contains(&"link-local".to_string()));
    }

    #[test]
    fn test_wireless_steps_include_password_when_given() {
        let open = wireless_steps(
            "wlan0",
            &WirelessConfig {
                ssid: "rig".into(),
                psk: None,
                nat: true,
            },
        );
        assert_eq!(open.len(), 2);
        assert!(!open[1].args.contains(&"password".to_string()));

        let secured = wireless_steps(
            "wlan0",
            &WirelessConfig {
                ssid: "rig".into(),
                psk: Some("supersecret".into()),
                nat: false,
            },
        );
        assert!(secured[1].args.ends_with(&["password".to_string(), "supersecret".to_string()]));
        assert_eq!(secured.len(), 4);
    }
}
