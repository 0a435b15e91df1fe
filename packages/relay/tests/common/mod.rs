#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use agent_relay::clock::ManualClock;
use agent_relay::hub::{CommandFuture, SessionHub, UpstreamCommands};
use agent_relay::router::{build_router, AppState, AuthConfig};
use agent_relay_error::RelayError;
use agent_relay_protocol::{MessageEnvelope, PermissionReply, UpstreamEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    FetchMessages {
        session_id: String,
    },
    ListSessions,
    SendMessage {
        session_id: String,
        body: Value,
    },
    RespondPermission {
        session_id: String,
        permission_id: String,
        reply: PermissionReply,
    },
    Abort {
        session_id: String,
    },
}

/// In-process stand-in for the upstream command API. Records every call;
/// optionally rejects commands to exercise the error path.
#[derive(Default)]
pub struct MockCommands {
    calls: StdMutex<Vec<RecordedCall>>,
    history: StdMutex<HashMap<String, Vec<MessageEnvelope>>>,
    sessions: StdMutex<Vec<Value>>,
    reject_commands: AtomicBool,
}

impl MockCommands {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn set_history(&self, session_id: &str, history: Vec<MessageEnvelope>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(session_id.to_string(), history);
    }

    pub fn set_sessions(&self, sessions: Vec<Value>) {
        *self.sessions.lock().expect("sessions lock") = sessions;
    }

    pub fn reject_commands(&self, reject: bool) {
        self.reject_commands.store(reject, Ordering::SeqCst);
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn rejection(&self) -> Option<RelayError> {
        self.reject_commands
            .load(Ordering::SeqCst)
            .then(|| RelayError::UpstreamRejected {
                status: 500,
                body: Some("mock rejection".to_string()),
                session_id: None,
            })
    }
}

impl UpstreamCommands for MockCommands {
    fn fetch_messages(&self, session_id: &str) -> CommandFuture<'_, Vec<MessageEnvelope>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.record(RecordedCall::FetchMessages {
                session_id: session_id.clone(),
            });
            if let Some(err) = self.rejection() {
                return Err(err);
            }
            Ok(self
                .history
                .lock()
                .expect("history lock")
                .get(&session_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn list_sessions(&self) -> CommandFuture<'_, Vec<Value>> {
        Box::pin(async move {
            self.record(RecordedCall::ListSessions);
            if let Some(err) = self.rejection() {
                return Err(err);
            }
            Ok(self.sessions.lock().expect("sessions lock").clone())
        })
    }

    fn send_message(&self, session_id: &str, body: Value) -> CommandFuture<'_, ()> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.record(RecordedCall::SendMessage { session_id, body });
            match self.rejection() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> CommandFuture<'_, ()> {
        let session_id = session_id.to_string();
        let permission_id = permission_id.to_string();
        Box::pin(async move {
            self.record(RecordedCall::RespondPermission {
                session_id,
                permission_id,
                reply,
            });
            match self.rejection() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn abort(&self, session_id: &str) -> CommandFuture<'_, ()> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.record(RecordedCall::Abort { session_id });
            match self.rejection() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

pub struct TestApp {
    pub app: Router,
    pub hub: Arc<SessionHub>,
    pub commands: Arc<MockCommands>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_auth(AuthConfig::disabled())
    }

    pub fn with_auth(auth: AuthConfig) -> Self {
        let commands = Arc::new(MockCommands::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let hub = Arc::new(SessionHub::new(commands.clone(), clock.clone()));
        let app = build_router(AppState::new(auth, hub.clone()));
        Self {
            app,
            hub,
            commands,
            clock,
        }
    }

    /// Feed one raw upstream frame through the ingest path.
    pub fn ingest(&self, frame: &Value) {
        self.hub.ingest_frame(frame);
    }

    pub fn apply(&self, event: &UpstreamEvent) {
        self.hub.apply_event(event);
    }
}

// --- upstream frame builders ------------------------------------------------

pub fn message_updated(session_id: &str, message_id: &str, created: i64) -> Value {
    json!({
        "type": "message.updated",
        "properties": {
            "info": {
                "id": message_id,
                "sessionID": session_id,
                "role": "assistant",
                "time": {"created": created}
            }
        }
    })
}

pub fn message_removed(session_id: &str, message_id: &str) -> Value {
    json!({
        "type": "message.removed",
        "properties": {"sessionID": session_id, "messageID": message_id}
    })
}

pub fn text_part_updated(session_id: &str, message_id: &str, part_id: &str, text: &str) -> Value {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": part_id,
                "messageID": message_id,
                "sessionID": session_id,
                "type": "text",
                "text": text
            }
        }
    })
}

pub fn tool_part_updated(
    session_id: &str,
    message_id: &str,
    part_id: &str,
    call_id: &str,
    status: &str,
) -> Value {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": part_id,
                "messageID": message_id,
                "sessionID": session_id,
                "type": "tool",
                "tool": "bash",
                "callID": call_id,
                "state": {"status": status, "title": "run command"}
            }
        }
    })
}

pub fn part_removed(session_id: &str, message_id: &str, part_id: &str) -> Value {
    json!({
        "type": "message.part.removed",
        "properties": {
            "sessionID": session_id,
            "messageID": message_id,
            "partID": part_id
        }
    })
}

pub fn permission_asked(session_id: &str, permission_id: &str, title: &str) -> Value {
    json!({
        "type": "permission.asked",
        "properties": {
            "id": permission_id,
            "sessionID": session_id,
            "title": title,
            "metadata": {"tool": "bash"}
        }
    })
}

pub fn permission_replied(session_id: &str, permission_id: &str) -> Value {
    json!({
        "type": "permission.replied",
        "properties": {
            "sessionID": session_id,
            "permissionID": permission_id,
            "reply": "once"
        }
    })
}

// --- http helpers -----------------------------------------------------------

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn send_status(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

/// One parsed SSE block: a data frame or a comment (keepalive).
#[derive(Debug, Clone, PartialEq)]
pub enum SseBlock {
    Data(Value),
    Comment(String),
}

pub fn parse_sse_block(block: &str) -> Option<SseBlock> {
    let mut data = String::new();
    let mut comment = None;
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if let Some(rest) = line.strip_prefix(':') {
            comment = Some(rest.trim().to_string());
        }
    }
    if !data.is_empty() {
        return serde_json::from_str(&data).ok().map(SseBlock::Data);
    }
    comment.map(SseBlock::Comment)
}

/// Incremental reader over an SSE response body.
pub struct SseReader {
    stream: axum::body::BodyDataStream,
    buffer: String,
}

impl SseReader {
    pub async fn connect(app: &Router, uri: &str) -> Self {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("sse request");
        let response = app.clone().oneshot(request).await.expect("sse response");
        assert_eq!(response.status(), StatusCode::OK, "sse status");
        Self {
            stream: response.into_body().into_data_stream(),
            buffer: String::new(),
        }
    }

    /// Next parsed block, or None when the stream ends or the timeout hits.
    pub async fn next_block(&mut self, timeout: Duration) -> Option<SseBlock> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(split) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..split + 2).collect();
                if let Some(parsed) = parse_sse_block(&block) {
                    return Some(parsed);
                }
                continue;
            }

            let chunk = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .ok()??;
            let chunk = chunk.expect("body chunk");
            self.buffer
                .push_str(std::str::from_utf8(&chunk).expect("utf8 sse chunk"));
        }
    }

    /// Next data frame, skipping keepalive comments.
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Value> {
        loop {
            match self.next_block(timeout).await? {
                SseBlock::Data(value) => return Some(value),
                SseBlock::Comment(_) => continue,
            }
        }
    }
}

/// Parse a serialized `{sessionId, state}` frame produced by the hub.
pub fn frame_value(frame: &Arc<String>) -> Value {
    serde_json::from_str(frame).expect("frame json")
}
