//! Serves the real router on an ephemeral port and drives it with raw
//! HTTP/1.1 requests.

use std::net::SocketAddr;
use std::sync::Arc;

use pax_core::MarketEngine;
use pax_core::config::PaxConfig;
use pax_daemon::api;
use pax_daemon::notify::{DigestNotificationQueue, LogDigestSink};
use pax_daemon::state::{DaemonStateHandle, SharedState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve() -> (SocketAddr, SharedState) {
    let notifications = Arc::new(DigestNotificationQueue::new(20, Arc::new(LogDigestSink)));
    let engine = MarketEngine::builder(PaxConfig::default())
        .notifier(notifications.clone())
        .build();
    let state: SharedState = Arc::new(DaemonStateHandle::new(engine, notifications));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Sends one request and returns `(status, body)`.
async fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let (addr, _state) = serve().await;
    let (status, body) = request(addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""status":"ok""#));
}

#[tokio::test]
async fn test_lease_routes_and_static_sweep_path() {
    let (addr, _state) = serve().await;

    let (status, _) =
        request(addr, "POST", "/leases/solar/award", Some(r#"{"holder":"0xHolder"}"#)).await;
    assert_eq!(status, 200);

    let (status, body) = request(addr, "GET", "/leases/solar", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""status":"ACTIVE""#));

    let (status, body) = request(addr, "POST", "/leases/sweep", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""success":true"#));

    let (status, body) =
        request(addr, "POST", "/leases/solar/renew", Some(r#"{"actor":"0xStranger"}"#)).await;
    assert_eq!(status, 409);
    assert!(body.contains("STATE_CONFLICT"));
}

#[tokio::test]
async fn test_bounty_deposit_and_release() {
    let (addr, _state) = serve().await;

    let (status, body) = request(
        addr,
        "POST",
        "/bounties",
        Some(r#"{"vertical":"mortgage","owner":"0xOwner","amount":"40.00"}"#),
    )
    .await;
    assert_eq!(status, 200);
    let pool_id = body
        .split(r#""pool_id":""#)
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();

    let (status, body) = request(
        addr,
        "POST",
        &format!("/bounties/{pool_id}/release"),
        Some(r#"{"amount":"40.00"}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""deactivated":true"#));

    let (status, _) =
        request(addr, "POST", "/bounties/pool-missing/release", Some(r#"{"amount":"1"}"#))
            .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_consent_is_recorded() {
    let (addr, state) = serve().await;
    let (status, _) =
        request(addr, "POST", "/consent", Some(r#"{"actor":"0xA","consented":true}"#)).await;
    assert_eq!(status, 204);
    assert!(state.notifications().has_consent("0xa"));
}
