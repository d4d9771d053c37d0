use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::app::Console;
use crate::clock::SystemClock;
use crate::config::AppConfig;
use crate::error::{AuthError, FetchError};
use crate::storage::MemoryStorage;
use crate::transport::ReqwestTransport;
use crate::usage::{aggregate, collect_usage_details};

const KEY: &str = "sk-local-management";

fn spawn_axum_server(app: axum::Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    listener.set_nonblocking(true).expect("nonblocking");
    let listener = tokio::net::TcpListener::from_std(listener).expect("to tokio listener");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {KEY}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid management key" })),
    )
        .into_response()
}

fn management_server(config_hits: Arc<AtomicUsize>) -> axum::Router {
    axum::Router::new()
        .route(
            "/v0/management/config",
            get(move |headers: HeaderMap| async move {
                config_hits.fetch_add(1, Ordering::SeqCst);
                if !authorized(&headers) {
                    return unauthorized();
                }
                (
                    StatusCode::OK,
                    [
                        ("x-cpa-version", "6.3.1"),
                        ("x-cpa-build-date", "2025-06-01"),
                    ],
                    Json(json!({ "debug": false, "port": 8317 })),
                )
                    .into_response()
            }),
        )
        .route(
            "/v0/management/usage",
            get(|headers: HeaderMap| async move {
                if !authorized(&headers) {
                    return unauthorized();
                }
                Json(json!({
                    "usage": { "apis": { "POST /v1/chat/completions": { "models": { "gpt-4o": {
                        "details": [
                            { "timestamp": "2025-06-01T10:00:00Z", "source": "a", "auth_index": 0, "failed": false },
                            { "timestamp": "2025-06-01T10:00:05Z", "source": "a", "auth_index": 0, "failed": true },
                            { "timestamp": "2025-06-01T10:00:09Z", "source": "b", "auth_index": "1", "failed": false }
                        ]
                    } } } } }
                }))
                .into_response()
            }),
        )
}

fn live_console() -> Console {
    Console::with_parts(
        AppConfig::default(),
        Arc::new(ReqwestTransport::with_client(
            reqwest::Client::builder()
                .no_proxy()
                .build()
                .expect("client"),
        )),
        Arc::new(MemoryStorage::new()),
        Arc::new(SystemClock),
    )
}

#[tokio::test]
async fn login_and_fetch_against_local_management_server() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (addr, handle) = spawn_axum_server(management_server(hits.clone()));
    let console = live_console();

    let session = console
        .session
        .login(&format!("{addr}/v0/management/"), KEY)
        .await
        .expect("login");
    assert_eq!(session.endpoint_base, format!("http://{addr}"));
    assert_eq!(session.server_version.as_deref(), Some("6.3.1"));
    assert_eq!(session.server_build_date.as_deref(), Some("2025-06-01"));

    let cfg = console.config.fetch_config(false).await.expect("config");
    assert_eq!(cfg["port"], json!(8317));
    console.config.fetch_config(false).await.expect("cached");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let payload = console.usage_store().refresh().await.expect("usage");
    let agg = aggregate(&collect_usage_details(&payload));
    assert_eq!(agg.total_requests, 3);
    assert_eq!(agg.by_source["a"].success_rate, 50.0);
    assert_eq!(agg.by_auth_index["1"].load_rate, 33.33);

    handle.abort();
}

#[tokio::test]
async fn wrong_key_is_rejected_with_server_message() {
    let (addr, handle) = spawn_axum_server(management_server(Arc::new(AtomicUsize::new(0))));
    let console = live_console();

    let err = console
        .session
        .login(&addr.to_string(), "sk-wrong")
        .await
        .expect_err("rejected");
    assert_eq!(
        err,
        AuthError::Rejected {
            status: 401,
            message: "invalid management key".to_string()
        }
    );
    assert!(!console.session.is_authenticated());
    assert_eq!(
        console.config.fetch_config(false).await,
        Err(FetchError::NotConfigured)
    );

    handle.abort();
}

#[tokio::test]
async fn unreachable_endpoint_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    drop(listener);

    let console = live_console();
    let err = console
        .session
        .login(&addr.to_string(), KEY)
        .await
        .expect_err("no server");
    assert!(matches!(err, AuthError::Network(_)), "got {err:?}");
}
