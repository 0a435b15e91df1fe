use std::convert::Infallible;
use std::sync::Arc;

use agent_relay_error::{ProblemDetails, RelayError};
use agent_relay_protocol::PermissionReply;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, Stream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use crate::downstream::DownstreamFrame;
use crate::hub::SessionHub;

const API_PREFIX: &str = "/v1";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub struct AppState {
    auth: AuthConfig,
    hub: Arc<SessionHub>,
}

impl AppState {
    pub fn new(auth: AuthConfig, hub: Arc<SessionHub>) -> Self {
        Self { auth, hub }
    }

    pub fn hub(&self) -> Arc<SessionHub> {
        self.hub.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id/state", get(get_session_state))
        .route("/sessions/:session_id/state/sse", get(get_session_state_sse))
        .route("/sessions/:session_id/messages", post(post_message))
        .route(
            "/sessions/:session_id/permissions/:permission_id/reply",
            post(reply_permission),
        )
        .route("/sessions/:session_id/buffering/enable", post(enable_buffering))
        .route(
            "/sessions/:session_id/buffering/disable",
            post(disable_buffering),
        )
        .route("/sessions/:session_id/abort", post(abort_session))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let router = Router::new()
        .nest(API_PREFIX, v1_router)
        .layer(TraceLayer::new_for_http());
    (router, shared)
}

#[derive(Debug)]
enum ApiError {
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(value: RelayError) -> Self {
        Self::Relay(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(RelayError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    match value.split_once(' ') {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "bearer" | "token" => Some(rest.trim().to_string()),
            _ => None,
        },
        None => Some(value.to_string()),
    }
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Upstream's session listing, annotated with the relay's own `lastUpdate`
/// where the store already tracks the session.
async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Value>>, ApiError> {
    let commands = state.hub.commands();
    let mut sessions = commands.list_sessions().await?;

    let last_updates = state.hub.last_updates();
    for session in &mut sessions {
        let Some(object) = session.as_object_mut() else {
            continue;
        };
        let known = object
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| last_updates.get(id))
            .copied();
        if let Some(last_update) = known {
            object.insert("lastUpdate".to_string(), json!(last_update));
        }
    }
    Ok(Json(sessions))
}

/// Polling fallback: one full `{sessionId, state}` snapshot.
async fn get_session_state(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let frame = state.hub.snapshot(&session_id).await;
    (
        [(header::CONTENT_TYPE, "application/json")],
        frame.as_str().to_owned(),
    )
        .into_response()
}

struct SubscriptionGuard {
    hub: Arc<SessionHub>,
    session_id: String,
    subscriber_id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.session_id, self.subscriber_id);
    }
}

/// The long-lived stream. The first frame is always a full snapshot; every
/// later frame is the entire current state, never a diff. Keepalives are
/// inert SSE comments.
async fn get_session_state_sse(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber_id, receiver) = state.hub.subscribe(&session_id).await;
    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        session_id,
        subscriber_id,
    };

    let stream = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        match receiver.recv().await {
            Some(DownstreamFrame::State(frame)) => {
                let event = Event::default().data(frame.as_str());
                Some((Ok(event), (receiver, guard)))
            }
            Some(DownstreamFrame::Keepalive) => {
                Some((Ok(Event::default().comment("keepalive")), (receiver, guard)))
            }
            None => None,
        }
    });

    Sse::new(stream)
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    text: String,
    /// `provider/model`, forwarded as the upstream's model selection.
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

fn build_prompt_body(request: &SendMessageRequest) -> Result<Value, RelayError> {
    let mut body = json!({
        "parts": [{"type": "text", "text": request.text}]
    });
    if let Some(model) = &request.model {
        let Some((provider_id, model_id)) = model.split_once('/') else {
            return Err(RelayError::InvalidRequest {
                message: format!("model must be provider/model, got {model:?}"),
            });
        };
        body["model"] = json!({"providerID": provider_id, "modelID": model_id});
    }
    if let Some(agent) = &request.agent {
        body["agent"] = json!(agent);
    }
    Ok(body)
}

/// Fire-and-forget: the assistant's activity comes back over the event
/// feed, not in this response.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<StatusCode, ApiError> {
    let body = build_prompt_body(&request)?;
    let commands = state.hub.commands();
    commands.send_message(&session_id, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
struct PermissionReplyRequest {
    reply: PermissionReply,
}

async fn reply_permission(
    State(state): State<Arc<AppState>>,
    Path((session_id, permission_id)): Path<(String, String)>,
    Json(request): Json<PermissionReplyRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .hub
        .respond(&session_id, &permission_id, request.reply)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_buffering(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.hub.enable_buffering(&session_id);
    StatusCode::NO_CONTENT
}

async fn disable_buffering(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.hub.disable_buffering(&session_id);
    StatusCode::NO_CONTENT
}

async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let commands = state.hub.commands();
    commands.abort(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
