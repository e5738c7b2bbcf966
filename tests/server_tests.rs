//! Tests for the HTTP request router.
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot` and checks
//! the dispatch order: open paths, device-id gate, sdk-version gate.

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use common::{Behavior, DEVICE_ID, RecordingFirmware, SDK_VERSION, ScriptedRuntime, daemon_with};
use jaguar_daemon::server::{FAVICON_URL, ServerState, router};
use jaguar_daemon::{
    DISCOVERY_METHOD, Daemon, DiscoveryMessage, FIRMWARE_DEADLINE, HEADER_CONTAINER_NAME,
    HEADER_CONTAINER_TIMEOUT, HEADER_DEVICE_ID, HEADER_DISABLED, HEADER_SDK_VERSION, ImageId,
    RegistryEntry,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    _temp: TempDir,
    daemon: Arc<Daemon>,
    runtime: Arc<ScriptedRuntime>,
    firmware: Arc<RecordingFirmware>,
    state: ServerState,
}

fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let runtime = ScriptedRuntime::new();
    let firmware = RecordingFirmware::new();
    let daemon = daemon_with(&temp, runtime.clone(), firmware.clone());
    let state = ServerState::new(daemon.clone(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    Harness {
        _temp: temp,
        daemon,
        runtime,
        firmware,
        state,
    }
}

fn request(method: Method, path: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(path)
}

fn authorized(method: Method, path: &str) -> axum::http::request::Builder {
    request(method, path)
        .header(HEADER_DEVICE_ID, DEVICE_ID)
        .header(HEADER_SDK_VERSION, SDK_VERSION)
}

async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router(h.state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

// =============================================================================
// Open Paths
// =============================================================================

#[tokio::test]
async fn test_identify_needs_no_headers() {
    let h = harness();
    let (status, body) = send(&h, request(Method::GET, "/identify").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["method"], DISCOVERY_METHOD);

    let payload = DiscoveryMessage::parse_identify(&body).unwrap().unwrap();
    assert_eq!(payload.id, DEVICE_ID);
    assert_eq!(payload.name, "bench");
    assert_eq!(payload.sdk_version, SDK_VERSION);
    assert_eq!(payload.address, "http://10.0.0.7:0");
}

#[tokio::test]
async fn test_info_page_and_assets_are_open() {
    let h = harness();

    let (status, body) = send(&h, request(Method::GET, "/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("bench"));

    let (status, _) = send(&h, request(Method::GET, "/index.html").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&h, request(Method::GET, "/style.css").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_favicon_redirects() {
    let h = harness();
    let response = router(h.state.clone())
        .oneshot(request(Method::GET, "/favicon.ico").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], FAVICON_URL);
}

// =============================================================================
// Device-id Gate
// =============================================================================

#[tokio::test]
async fn test_wrong_device_id_is_forbidden() {
    let h = harness();

    for path in ["/ping", "/list", "/uninstall", "/firmware", "/install", "/run"] {
        let method = if path == "/ping" || path == "/list" { Method::GET } else { Method::PUT };
        let req = request(method, path)
            .header(HEADER_DEVICE_ID, "00000000-0000-0000-0000-000000000000")
            .header(HEADER_SDK_VERSION, SDK_VERSION)
            .header(HEADER_CONTAINER_NAME, "blink")
            .body(Body::from("image"))
            .unwrap();
        let (status, body) = send(&h, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
        assert!(String::from_utf8(body).unwrap().contains(DEVICE_ID));
    }

    assert!(h.daemon.registry().is_empty());
    assert_eq!(RecordingFirmware::count(&h.firmware.writes), 0);
}

#[tokio::test]
async fn test_missing_device_id_is_forbidden() {
    let h = harness();
    let (status, _) = send(&h, request(Method::GET, "/ping").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_ping() {
    let h = harness();
    let req = request(Method::GET, "/ping")
        .header(HEADER_DEVICE_ID, DEVICE_ID)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"status":"OK"}"#);
}

// =============================================================================
// SDK-version Gate
// =============================================================================

#[tokio::test]
async fn test_sdk_mismatch_is_not_acceptable() {
    let h = harness();

    for path in ["/install", "/run"] {
        let req = request(Method::PUT, path)
            .header(HEADER_DEVICE_ID, DEVICE_ID)
            .header(HEADER_SDK_VERSION, "v0.0.1")
            .header(HEADER_CONTAINER_NAME, "blink")
            .body(Body::from("image"))
            .unwrap();
        let (status, body) = send(&h, req).await;
        let message = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::NOT_ACCEPTABLE, "{path}");
        assert!(message.contains(SDK_VERSION) && message.contains("v0.0.1"));
    }

    assert!(h.daemon.registry().is_empty());
    assert!(h.runtime.starts().is_empty());
}

#[tokio::test]
async fn test_uninstall_skips_sdk_check() {
    let h = harness();
    let req = request(Method::PUT, "/uninstall")
        .header(HEADER_DEVICE_ID, DEVICE_ID)
        .header(HEADER_CONTAINER_NAME, "never-installed")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h, req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let h = harness();
    let (status, _) = send(&h, authorized(Method::GET, "/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Install / List / Uninstall
// =============================================================================

#[tokio::test]
async fn test_install_list_uninstall() {
    let h = harness();

    let req = authorized(Method::PUT, "/install")
        .header(HEADER_CONTAINER_NAME, "blink")
        .header(HEADER_CONTAINER_TIMEOUT, "30")
        .body(Body::from("blink-image"))
        .unwrap();
    let (status, _) = send(&h, req).await;
    assert_eq!(status, StatusCode::OK);
    h.runtime.wait_for_starts("blink", 1).await;

    let req = authorized(Method::GET, "/list").body(Body::empty()).unwrap();
    let (status, body) = send(&h, req).await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<RegistryEntry> = rmp_serde::from_slice(&body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "blink");
    assert_eq!(entries[0].image, ImageId::of(b"blink-image"));
    assert_eq!(entries[0].attributes.get("jag.timeout"), Some(&serde_json::json!(30)));

    for _ in 0..2 {
        let req = authorized(Method::PUT, "/uninstall")
            .header(HEADER_CONTAINER_NAME, "blink")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h, req).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert!(h.daemon.registry().is_empty());
}

#[tokio::test]
async fn test_install_without_name_is_bad_request() {
    let h = harness();
    let req = authorized(Method::PUT, "/install").body(Body::from("x")).unwrap();
    let (status, _) = send(&h, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_disabled_install_waits_for_boot() {
    let h = harness();
    let req = authorized(Method::PUT, "/install")
        .header(HEADER_CONTAINER_NAME, "owner")
        .header(HEADER_DISABLED, "true")
        .body(Body::from("owner-image"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(h.daemon.registry().get("owner").is_some());
    assert!(h.runtime.starts().is_empty());
    assert!(!h.state.is_stopping());
}

// =============================================================================
// Run
// =============================================================================

#[tokio::test]
async fn test_run_starts_anonymous_container() {
    let h = harness();
    let req = authorized(Method::PUT, "/run")
        .header(HEADER_CONTAINER_NAME, "scratch")
        .body(Body::from("scratch-image"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::OK);
    h.runtime.wait_for_starts("scratch", 1).await;
    assert!(h.daemon.registry().is_empty());
    assert!(!h.state.is_stopping());
}

#[tokio::test]
async fn test_disabled_run_ends_serve_cycle() {
    let h = harness();
    h.runtime.set("owner", Behavior::Hold);

    let req = authorized(Method::PUT, "/run")
        .header(HEADER_CONTAINER_NAME, "owner")
        .header(HEADER_DISABLED, "1")
        .body(Body::from("owner-image"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(h.state.is_stopping());
    assert!(h.daemon.handshake().is_disabled());
    assert!(h.runtime.starts().is_empty(), "container waits for network-free");

    let req = authorized(Method::PUT, "/run")
        .header(HEADER_DISABLED, "1")
        .body(Body::from("second-image"))
        .unwrap();
    let (status, _) = send(&h, req).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let episode = h.daemon.handshake().take_pending().unwrap();
    let handed = tokio::spawn(episode.hand_over());
    h.runtime.wait_for_starts("owner", 1).await;
    h.runtime.release("owner", 0);
    handed.await.unwrap();
    assert!(!h.daemon.handshake().is_disabled());
}

#[tokio::test(start_paused = true)]
async fn test_install_while_flash_is_busy_is_unavailable() {
    let h = harness();
    let holder = {
        let flash = h.daemon.flash().clone();
        tokio::spawn(async move {
            flash
                .run("firmware", FIRMWARE_DEADLINE, futures::future::pending::<jaguar_daemon::Result<()>>())
                .await
        })
    };
    while !h.daemon.flash().is_busy() {
        tokio::task::yield_now().await;
    }

    let req = authorized(Method::PUT, "/install")
        .header(HEADER_CONTAINER_NAME, "blink")
        .body(Body::from("image"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.daemon.registry().get("blink").is_none());
    assert!(h.runtime.starts().is_empty());

    holder.abort();
}

// =============================================================================
// Firmware
// =============================================================================

#[tokio::test]
async fn test_firmware_upload_sets_upgrade_pending() {
    let h = harness();
    let req = request(Method::PUT, "/firmware")
        .header(HEADER_DEVICE_ID, DEVICE_ID)
        .header(header::CONTENT_LENGTH, "8")
        .body(Body::from("firmware"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(RecordingFirmware::count(&h.firmware.writes), 1);
    assert_eq!(h.firmware.written_bytes.load(Ordering::SeqCst), 8);
    assert!(h.daemon.firmware().upgrade_pending());
    assert!(h.state.is_stopping());
}

#[tokio::test]
async fn test_short_firmware_upload_fails() {
    let h = harness();
    let req = request(Method::PUT, "/firmware")
        .header(HEADER_DEVICE_ID, DEVICE_ID)
        .header(header::CONTENT_LENGTH, "100")
        .body(Body::from("firmware"))
        .unwrap();
    let (status, _) = send(&h, req).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!h.daemon.firmware().upgrade_pending());
    assert!(!h.state.is_stopping());
}
