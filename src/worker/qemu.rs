//! QEMU backend -- the DUT is a guest process on the rig host.
//!
//! Power is the guest process itself, the DUT's storage is a raw disk image
//! in the workdir, the console is the guest serial port on stdout and the
//! screen is the guest's VNC display.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{run_command, Lifecycle, LifecycleState, NetworkRequest, Worker, WorkerError, WorkerType};
use crate::capture::{CaptureAction, ScreenCapture};
use crate::config::{QemuConfig, WorkerConfig};
use crate::console::ConsoleBuffer;
use crate::flash::progress::ProgressSender;
use crate::flash::{self, Destination, FlashOptions, FlashRequest};

/// How the guest NIC is wired on the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestNic {
    /// User-mode networking with NAT to the host uplink.
    Nat,
    /// User-mode networking restricted to the host.
    Isolated,
    /// No NIC at all.
    Disconnected,
}

impl GuestNic {
    fn args(&self) -> Vec<String> {
        let netdev = match self {
            GuestNic::Nat => "user,id=net0",
            GuestNic::Isolated => "user,id=net0,restrict=on",
            GuestNic::Disconnected => return vec!["-nic".into(), "none".into()],
        };
        vec![
            "-netdev".into(),
            netdev.into(),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
        ]
    }
}

pub struct QemuWorker {
    lifecycle: Lifecycle,
    config: QemuConfig,
    workdir: PathBuf,
    disk: PathBuf,
    guest: Mutex<Option<Child>>,
    nic: Mutex<GuestNic>,
    console: ConsoleBuffer,
    console_wait: std::time::Duration,
    capture: Option<ScreenCapture>,
    flash_options: FlashOptions,
}

impl QemuWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        let workdir = config.worker.workdir.clone();
        let disk = if config.qemu.disk_image.is_absolute() {
            config.qemu.disk_image.clone()
        } else {
            workdir.join(&config.qemu.disk_image)
        };

        let capture = config.screen_capture.enabled.then(|| {
            let source = config.screen_capture.source.clone().unwrap_or_else(|| {
                format!("rfbsrc host=127.0.0.1 port={}", 5900 + config.qemu.vnc_display)
            });
            let output_dir = config
                .screen_capture
                .output_dir
                .clone()
                .unwrap_or_else(|| workdir.join("capture"));
            ScreenCapture::new(config.screen_capture.program.clone(), source, output_dir)
        });

        Self {
            lifecycle: Lifecycle::new(),
            config: config.qemu.clone(),
            workdir,
            disk,
            guest: Mutex::new(None),
            nic: Mutex::new(GuestNic::Nat),
            console: ConsoleBuffer::new(config.console.max_buffer_bytes),
            console_wait: std::time::Duration::from_millis(config.console.read_wait_ms),
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

    /// Full emulator command line for one boot.
    pub fn guest_args(&self, nic: GuestNic, kvm: bool) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.config.memory.clone(),
            "-smp".to_string(),
            self.config.cpus.to_string(),
            "-drive".to_string(),
            format!("file={},format=raw,if=virtio", self.disk.display()),
            "-serial".to_string(),
            "stdio".to_string(),
            "-display".to_string(),
            "none".to_string(),
            "-vnc".to_string(),
            format!(":{}", self.config.vnc_display),
        ];
        if kvm {
            args.push("-enable-kvm".to_string());
        }
        if let Some(firmware) = &self.config.firmware {
            args.push("-bios".to_string());
            args.push(firmware.display().to_string());
        }
        args.extend(nic.args());
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    async fn guest_running(&self) -> bool {
        let mut guest = self.guest.lock().await;
        match guest.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                info!(%status, "guest exited on its own");
                guest.take();
                false
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to poll guest process");
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl Worker for QemuWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Qemu
    }

    async fn setup(&self) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(&self.workdir).await.map_err(|e| {
            WorkerError::BackendUnavailable(format!("workdir {}: {}", self.workdir.display(), e))
        })?;

        let version = run_command(&self.config.binary, &["--version"])
            .await
            .map_err(|e| WorkerError::BackendUnavailable(format!("{:#}", e)))?;

        self.lifecycle.mark(LifecycleState::Ready).await;
        info!(
            binary = %self.config.binary,
            version = version.lines().next().unwrap_or_default(),
            disk = %self.disk.display(),
            "qemu worker ready"
        );
        Ok(())
    }

    async fn power_on(&self) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        if self.guest_running().await {
            info!("guest already running");
            return Ok(());
        }
        if !self.disk.exists() {
            return Err(WorkerError::Power(format!(
                "no disk image at {}, flash one first",
                self.disk.display()
            )));
        }

        let nic = *self.nic.lock().await;
        let kvm = self.config.kvm && Path::new("/dev/kvm").exists();
        let mut child = Command::new(&self.config.binary)
            .args(self.guest_args(nic, kvm))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Power(format!("failed to start {}: {}", self.config.binary, e)))?;

        if let Some(stdout) = child.stdout.take() {
            self.console.attach("qemu-serial", stdout);
        }
        info!(pid = ?child.id(), ?nic, kvm, "guest started");
        *self.guest.lock().await = Some(child);
        Ok(())
    }

    async fn power_off(&self) -> Result<(), WorkerError> {
        let Some(mut child) = self.guest.lock().await.take() else {
            return Ok(());
        };
        child
            .kill()
            .await
            .map_err(|e| WorkerError::Power(format!("failed to stop guest: {}", e)))?;
        info!("guest stopped");
        Ok(())
    }

    async fn flash(&self, request: FlashRequest, progress: ProgressSender) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        self.power_off().await?;
        let destinations = [Destination::file(&self.disk)];
        flash::write_image(request, &destinations, &self.flash_options, progress).await?;
        Ok(())
    }

    async fn network(&self, config: NetworkRequest) -> Result<(), WorkerError> {
        self.ensure_ready().await?;
        config.validate()?;
        if config.wireless.is_some() {
            return Err(WorkerError::NetworkConfig(
                "wireless networking is not supported by the qemu worker".to_string(),
            ));
        }

        let nic = match &config.wired {
            Some(wired) if wired.nat => GuestNic::Nat,
            Some(_) => GuestNic::Isolated,
            None => GuestNic::Disconnected,
        };
        *self.nic.lock().await = nic;

        if self.guest_running().await {
            warn!(?nic, "guest is running, network change applies from the next power on");
        } else {
            info!(?nic, "guest network configured");
        }
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
        if let Err(e) = self.power_off().await {
            warn!(error = %e, "failed to stop guest during teardown");
        }
        self.console.clear().await;
        self.lifecycle.mark(LifecycleState::TornDown).await;
        info!("qemu worker torn down");
        Ok(())
    }
}
