#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schat::error::{Result, SyncError};
use schat::storage::{MemoryStore, SessionStorage, SessionStore};
use schat::sync::transport::{ApiResponse, HttpBackend, OutboundRequest, TransportClient, REFRESH_PATH};
use schat::sync::{ConnectionState, PushChannel, Session};

type Responder = Box<dyn Fn(&OutboundRequest) -> Result<ApiResponse> + Send + Sync>;

/// Scripted HTTP backend that records every request it sees
pub struct MockBackend {
    responder: Responder,
    delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockBackend {
    pub fn new(responder: impl Fn(&OutboundRequest) -> Result<ApiResponse> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            delays: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Hold responses for `path` back by `delay`
    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.path == path).count()
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls_to(REFRESH_PATH)
    }
}

#[async_trait]
impl HttpBackend for MockBackend {
    async fn execute(&self, request: &OutboundRequest) -> Result<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = self.delays.lock().unwrap().get(&request.path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(request)
    }
}

pub fn respond(status: u16, body: Value) -> Result<ApiResponse> {
    Ok(ApiResponse::new(status, body.to_string()))
}

pub fn unreachable_server() -> Result<ApiResponse> {
    Err(SyncError::Network("connection refused".to_string()))
}

/// Push channel double with a settable state
pub struct MockPush {
    state: Mutex<ConnectionState>,
    reject_sends: Mutex<bool>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl MockPush {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            reject_sends: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Report `Connected` but fail sends, as when the socket drops mid-call
    pub fn reject_sends(&self) {
        *self.reject_sends.lock().unwrap() = true;
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

impl PushChannel for MockPush {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn send(&self, destination: &str, payload: &Value) -> Result<()> {
        if *self.state.lock().unwrap() != ConnectionState::Connected || *self.reject_sends.lock().unwrap() {
            return Err(SyncError::NotConnected);
        }
        self.sent.lock().unwrap().push((destination.to_string(), payload.clone()));
        Ok(())
    }
}

pub fn alice_session(access: &str, refresh: &str) -> Session {
    Session {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        token_type: "Bearer".to_string(),
        user_id: 7,
        username: "alice".to_string(),
        email: "a@x.com".to_string(),
        roles: ["user".to_string()].into_iter().collect(),
    }
}

/// Login body in the `{token, type}` shape
pub fn alice_login_body() -> Value {
    json!({
        "token": "A1", "refreshToken": "R1", "type": "Bearer",
        "id": 7, "username": "alice", "email": "a@x.com", "roles": ["user"]
    })
}

pub fn message_json(id: i64, second: u32, content: &str) -> Value {
    json!({
        "id": id,
        "content": content,
        "sender": "bob",
        "timestamp": format!("2024-03-01T10:00:{:02}", second),
    })
}

/// Transport over an in-memory store, optionally holding a session
pub fn transport(backend: Arc<MockBackend>, session: Option<Session>) -> (TransportClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let storage = SessionStorage::new(store.clone() as Arc<dyn SessionStore>);
    if let Some(session) = session {
        storage.save_session(&session);
    }
    (TransportClient::new(backend, storage), store)
}
