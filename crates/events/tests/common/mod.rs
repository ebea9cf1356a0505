use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use vigil_core::correlation::CorrelationEngine;
use vigil_core::record::{CameraIdentity, CanonicalRecord};
use vigil_core::violation::ViolationEvent;

/// One request captured by [`StubServer`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct StubState {
    status: StatusCode,
    captured: Arc<Mutex<Vec<Captured>>>,
}

/// In-process HTTP endpoint that records every POST and answers `status`.
pub struct StubServer {
    pub addr: SocketAddr,
    captured: Arc<Mutex<Vec<Captured>>>,
}

impl StubServer {
    pub async fn start(status: StatusCode) -> Self {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let state = StubState {
            status,
            captured: Arc::clone(&captured),
        };
        let app = Router::new()
            .route("/hook", post(capture))
            .route("/fcm/send", post(capture))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, captured }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn captured(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }
}

async fn capture(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .captured
        .lock()
        .unwrap()
        .push(Captured { authorization, body });
    state.status
}

pub fn record(plate: Option<&str>, evidence: Option<&str>) -> CanonicalRecord {
    let event = ViolationEvent {
        jurisdiction: "pune".into(),
        track_id: 123,
        vehicle_type: "HMV".into(),
        plate: plate.map(str::to_string),
        evidence_path: evidence.map(str::to_string),
        raw: None,
    };
    CorrelationEngine::new(CameraIdentity::default()).correlate(event, None)
}
