//! In-process backend doubles for async tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use bytes::Bytes;
use serde_json::Value;

use crate::proxy::correlation::REQUEST_ID_HEADER;

/// How the mock backend answers every request.
#[derive(Debug, Clone, Copy)]
pub struct BackendBehavior {
    pub status: StatusCode,
    pub delay: Duration,
}

impl BackendBehavior {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub request_id: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct MockState {
    behavior: BackendBehavior,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockBackend {
    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }
}

/// Serve `behavior` on an ephemeral localhost port, recording every request.
pub async fn spawn_backend(behavior: BackendBehavior) -> MockBackend {
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        behavior,
        received: received.clone(),
    };
    let app = Router::new().fallback(record).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBackend { addr, received }
}

async fn record(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(ReceivedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        request_id: headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });
    if !state.behavior.delay.is_zero() {
        tokio::time::sleep(state.behavior.delay).await;
    }
    state.behavior.status
}

/// An address nothing listens on: bound once, then released.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
