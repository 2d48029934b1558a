//! Control API behaviour, exercised through the router with `oneshot`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt; // for `oneshot`

use rigworker::api::{self, state::AppState};
use rigworker::capture::CaptureAction;
use rigworker::config::WorkerConfig;
use rigworker::contract::{Contract, DeviceTag};
use rigworker::flash::progress::{ProgressEvent, ProgressSender};
use rigworker::flash::FlashRequest;
use rigworker::target::{ResolutionError, TargetResolver};
use rigworker::worker::{self, NetworkRequest, Worker, WorkerError, WorkerType};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeWorker {
    fail_power: bool,
    fail_flash: bool,
    flash_duration: Duration,
    power_calls: AtomicUsize,
    network_calls: AtomicUsize,
}

fn event(destination: &str, complete: bool) -> ProgressEvent {
    ProgressEvent {
        destination: destination.to_string(),
        bytes_written: 4,
        total_bytes: Some(4),
        percentage: Some(100.0),
        throughput: 1.0,
        average_throughput: 1.0,
        complete,
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Qemu
    }

    async fn setup(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn power_on(&self) -> Result<(), WorkerError> {
        self.power_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_power {
            return Err(WorkerError::Power("relay not responding".into()));
        }
        Ok(())
    }

    async fn power_off(&self) -> Result<(), WorkerError> {
        self.power_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flash(&self, _request: FlashRequest, progress: ProgressSender) -> Result<(), WorkerError> {
        progress.emit(event("A", false)).await;
        progress.emit(event("B", false)).await;
        tokio::time::sleep(self.flash_duration).await;
        progress.emit(event("A", true)).await;
        if self.fail_flash {
            return Err(WorkerError::Flash(rigworker::flash::FlashError::Destinations(vec![
                rigworker::flash::DestinationFailure {
                    destination: "B".into(),
                    reason: "write failed".into(),
                },
            ])));
        }
        progress.emit(event("B", true)).await;
        Ok(())
    }

    async fn network(&self, _config: NetworkRequest) -> Result<(), WorkerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_output(&self) -> Result<String, WorkerError> {
        Ok("login: ".to_string())
    }

    async fn capture_screen(&self, _action: CaptureAction) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeResolver {
    calls: AtomicUsize,
}

#[async_trait]
impl TargetResolver for FakeResolver {
    async fn resolve(&self, target: &str) -> Result<IpAddr, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match target {
            "dut.local" => Ok("10.0.0.7".parse().unwrap()),
            other => Err(ResolutionError::Unresolved {
                target: other.to_string(),
                reason: "no such host".into(),
            }),
        }
    }
}

fn contract() -> Contract {
    let mut contract = Contract::new(Some("abc123".into()), "qemu");
    contract.fold_tags(&[DeviceTag::new("screencapture", "true"), DeviceTag::new("foo", "bar")]);
    contract
}

fn app_with(worker: Arc<dyn Worker>, resolver: Arc<FakeResolver>, keepalive: Duration) -> Router {
    let state = AppState::new(worker, resolver, &contract(), keepalive, PathBuf::from("/tmp"));
    api::router(state)
}

fn app(worker: Arc<FakeWorker>) -> Router {
    app_with(worker, Arc::new(FakeResolver::default()), Duration::from_secs(5))
}

async fn call(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn call_json(app: &Router, method: Method, uri: &str, json: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

// ---------------------------------------------------------------------------
// Simple routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_power_routes_return_ok() {
    let worker = Arc::new(FakeWorker::default());
    let app = app(worker.clone());

    assert_eq!(call(&app, Method::POST, "/dut/on", Body::empty()).await, (StatusCode::OK, "OK".into()));
    assert_eq!(call(&app, Method::POST, "/dut/off", Body::empty()).await, (StatusCode::OK, "OK".into()));
    assert_eq!(call(&app, Method::POST, "/dut/off", Body::empty()).await, (StatusCode::OK, "OK".into()));
    assert_eq!(worker.power_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_backend_failure_is_500_with_message() {
    let worker = Arc::new(FakeWorker {
        fail_power: true,
        ..Default::default()
    });
    let (status, body) = call(&app(worker), Method::POST, "/dut/on", Body::empty()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "power control failed: relay not responding");
}

#[tokio::test]
async fn test_read_output_returns_console_text() {
    let (status, body) = call(
        &app(Arc::new(FakeWorker::default())),
        Method::POST,
        "/dut/readOutput",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "login: ");
}

#[tokio::test]
async fn test_capture_routes() {
    let app = app(Arc::new(FakeWorker::default()));
    // Stop first: no capture running is not an error.
    assert_eq!(call(&app, Method::GET, "/dut/capture", Body::empty()).await.0, StatusCode::OK);
    assert_eq!(call(&app, Method::POST, "/dut/capture", Body::empty()).await.1, "OK");
    assert_eq!(call(&app, Method::GET, "/dut/capture", Body::empty()).await.1, "OK");
}

#[tokio::test]
async fn test_network_rejects_malformed_payload_before_backend() {
    let worker = Arc::new(FakeWorker::default());
    let app = app(worker.clone());

    let (status, _) = call_json(&app, Method::POST, "/dut/network", r#"{"wired": "#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (status, _) = call_json(&app, Method::POST, "/dut/network", r#"{"bogus": 1}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (status, _) = call_json(
        &app,
        Method::POST,
        "/dut/network",
        r#"{"wired": {"nat": true, "natt": false}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(worker.network_calls.load(Ordering::SeqCst), 0);

    let (status, body) = call_json(&app, Method::POST, "/dut/network", r#"{"wired": {"nat": true}}"#).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
    assert_eq!(worker.network_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_target_never_reaches_resolver() {
    let resolver = Arc::new(FakeResolver::default());
    let app = app_with(Arc::new(FakeWorker::default()), resolver.clone(), Duration::from_secs(5));

    let (status, body) = call_json(&app, Method::GET, "/dut/ip", "{}").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Target missing"));

    let (status, body) = call(&app, Method::GET, "/dut/ip", Body::empty()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Target missing"));

    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_target_resolution() {
    let resolver = Arc::new(FakeResolver::default());
    let app = app_with(Arc::new(FakeWorker::default()), resolver.clone(), Duration::from_secs(5));

    let (status, body) = call_json(&app, Method::GET, "/dut/ip", r#"{"target":"dut.local"}"#).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "10.0.0.7"));

    let (status, body) = call_json(&app, Method::GET, "/dut/ip", r#"{"target":"nowhere"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("nowhere"));
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_contract_is_stable_and_filtered() {
    let app = app(Arc::new(FakeWorker::default()));
    let (status, first) = call(&app, Method::GET, "/contract", Body::empty()).await;
    let (_, second) = call(&app, Method::GET, "/contract", Body::empty()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    let json: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(json["uuid"], "abc123");
    assert_eq!(json["workerType"], "qemu");
    assert_eq!(json["screencapture"], true);
    assert!(json.get("foo").is_none());
}

#[tokio::test]
async fn test_deprecated_proxy_stub() {
    let app = app(Arc::new(FakeWorker::default()));
    assert_eq!(call_json(&app, Method::POST, "/proxy", r#"{"port": 8123}"#).await.1, "127.0.0.1");
    assert_eq!(call_json(&app, Method::POST, "/proxy", "{}").await.1, "OK");
    assert_eq!(call(&app, Method::POST, "/proxy", Body::empty()).await.1, "OK");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (status, body) = call(&app(Arc::new(FakeWorker::default())), Method::GET, "/nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "not found");
}

// ---------------------------------------------------------------------------
// Flash streaming
// ---------------------------------------------------------------------------

fn lines(body: &str) -> Vec<&str> {
    body.lines().filter(|l| !l.is_empty()).collect()
}

fn is_terminal(line: &str) -> bool {
    line == "status: done" || line.starts_with("error:")
}

#[tokio::test]
async fn test_flash_streams_heartbeat_progress_then_done() {
    let worker = Arc::new(FakeWorker {
        flash_duration: Duration::from_millis(200),
        ..Default::default()
    });
    let app = app_with(worker, Arc::new(FakeResolver::default()), Duration::from_millis(20));

    let (status, body) = call(&app, Method::POST, "/dut/flash", Body::from("image-bytes")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let lines = lines(&body);
    let terminal: Vec<_> = lines.iter().filter(|l| is_terminal(l)).collect();
    assert_eq!(terminal, vec![&"status: done"]);
    assert_eq!(lines.last(), Some(&"status: done"));

    let first_pending = lines.iter().position(|l| *l == "status: pending");
    assert!(first_pending.is_some(), "no heartbeat in {:?}", lines);

    for dest in ["A", "B"] {
        let marker = format!("\"destination\":\"{}\"", dest);
        assert!(
            lines.iter().any(|l| l.starts_with("progress: ") && l.contains(&marker)),
            "no progress for {dest}"
        );
    }
}

#[tokio::test]
async fn test_flash_failure_ends_with_single_error_line() {
    let worker = Arc::new(FakeWorker {
        fail_flash: true,
        flash_duration: Duration::from_millis(10),
        ..Default::default()
    });
    let app = app_with(worker, Arc::new(FakeResolver::default()), Duration::from_secs(5));

    let (status, body) = call(&app, Method::POST, "/dut/flash", Body::from("image-bytes")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let lines = lines(&body);
    let terminal: Vec<_> = lines.iter().filter(|l| is_terminal(l)).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(*lines.last().unwrap(), "error: failed to write image to B (write failed)");
    // Progress for the destination that finished stays in the stream.
    assert!(lines.iter().any(|l| l.contains("\"destination\":\"A\"") && l.contains("\"complete\":true")));
}

#[tokio::test]
async fn test_flash_rejects_parent_dir_descriptor() {
    let app = app(Arc::new(FakeWorker::default()));
    let (status, body) = call_json(&app, Method::POST, "/dut/flash", r#"{"image":"../etc/shadow"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains(".."));
}

#[tokio::test]
async fn test_flash_rejects_image_outside_workdir() {
    let app = app(Arc::new(FakeWorker::default()));
    let (status, body) = call_json(&app, Method::POST, "/dut/flash", r#"{"image":"/dev/sda"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("inside /tmp"));
}

// ---------------------------------------------------------------------------
// Real backends share the route contract
// ---------------------------------------------------------------------------

struct Backend {
    _dir: tempfile::TempDir,
    app: Router,
}

fn backend(kind: WorkerType) -> Backend {
    let dir = tempfile::tempdir().unwrap();
    let mut config = WorkerConfig::default();
    config.identity.worker_type = kind.as_str().to_string();
    config.worker.workdir = dir.path().to_path_buf();
    config.console.read_wait_ms = 10;

    let power = dir.path().join("power");
    let devices = vec![dir.path().join("sda"), dir.path().join("sdb")];
    std::fs::write(&power, b"").unwrap();
    for device in &devices {
        std::fs::write(device, b"").unwrap();
    }
    config.testbot.power_gpio = power;
    config.testbot.sd_mux_gpio = None;
    config.testbot.serial_device = None;
    config.testbot.block_devices = devices;
    config.flash.progress_interval_ms = 0;
    config.testbot.settle_ms = 0;
    config.qemu.binary = "true".to_string();

    let worker = worker::build(&config).unwrap();
    let contract = Contract::new(None, kind.as_str());
    let state = AppState::new(
        worker,
        Arc::new(FakeResolver::default()),
        &contract,
        Duration::from_millis(20),
        config.worker.workdir.clone(),
    );
    Backend {
        _dir: dir,
        app: api::router(state),
    }
}

#[tokio::test]
async fn test_every_backend_exposes_the_same_contract() {
    for kind in WorkerType::ALL {
        let backend = backend(kind);
        let app = &backend.app;

        assert_eq!(call(app, Method::POST, "/dut/off", Body::empty()).await, (StatusCode::OK, "OK".into()), "{kind}");
        assert_eq!(call(app, Method::POST, "/dut/off", Body::empty()).await, (StatusCode::OK, "OK".into()), "{kind}");
        assert_eq!(call(app, Method::GET, "/dut/capture", Body::empty()).await, (StatusCode::OK, "OK".into()), "{kind}");
        assert_eq!(call(app, Method::POST, "/dut/readOutput", Body::empty()).await, (StatusCode::OK, String::new()), "{kind}");

        let (status, body) = call(app, Method::GET, "/dut/ip", Body::empty()).await;
        assert_eq!((status, body.as_str()), (StatusCode::INTERNAL_SERVER_ERROR, "Target missing"), "{kind}");

        let (_, contract) = call(app, Method::GET, "/contract", Body::empty()).await;
        assert_eq!(contract, format!(r#"{{"workerType":"{}"}}"#, kind));

        // Flash then teardown; teardown must succeed and may be repeated.
        let (status, body) = call(app, Method::POST, "/dut/flash", Body::from("os-image")).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{kind}");
        assert_eq!(lines(&body).last(), Some(&"status: done"), "{kind}: {body}");
        assert_eq!(call(app, Method::POST, "/teardown", Body::empty()).await.1, "OK", "{kind}");
        assert_eq!(call(app, Method::POST, "/teardown", Body::empty()).await.1, "OK", "{kind}");
    }
}

#[tokio::test]
async fn test_testbot_power_on_after_teardown_reinitializes() {
    let backend = backend(WorkerType::TestbotHat);
    let app = &backend.app;
    assert_eq!(call(app, Method::POST, "/teardown", Body::empty()).await.1, "OK");
    assert_eq!(call(app, Method::POST, "/dut/on", Body::empty()).await, (StatusCode::OK, "OK".into()));
    assert_eq!(
        std::fs::read_to_string(backend._dir.path().join("power")).unwrap(),
        "1"
    );
}

#[tokio::test]
async fn test_qemu_rejects_wireless_network() {
    let backend = backend(WorkerType::Qemu);
    let (status, body) = call_json(
        &backend.app,
        Method::POST,
        "/dut/network",
        r#"{"wireless":{"ssid":"rig-ap"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("wireless networking is not supported"));
}

#[tokio::test]
async fn test_testbot_flash_reports_every_block_device() {
    let backend = backend(WorkerType::TestbotHat);
    let (status, body) = call(&backend.app, Method::POST, "/dut/flash", Body::from("os-image")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let lines = lines(&body);
    let done = lines.iter().position(|l| *l == "status: done").expect("no done line");
    assert_eq!(done, lines.len() - 1);
    assert_eq!(lines.iter().filter(|l| is_terminal(l)).count(), 1);

    for name in ["sda", "sdb"] {
        let device = backend._dir.path().join(name);
        let marker = format!("\"destination\":\"{}\"", device.display());
        let progress = lines
            .iter()
            .position(|l| l.starts_with("progress: ") && l.contains(&marker))
            .unwrap_or_else(|| panic!("no progress for {name} in {lines:?}"));
        assert!(progress < done);
        assert_eq!(std::fs::read(&device).unwrap(), b"os-image");
    }
}
