//! HTTP client for the upstream collaborator: the OpenCode-compatible agent
//! server that produces the event feed and accepts commands.
//!
//! Commands are fire-and-forget from the relay's point of view — their
//! effects are observed later as ingested events, never as return values.

use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_protocol::{MessageEnvelope, PermissionReply};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

const HEALTH_ENDPOINTS: [&str; 2] = ["app", "health"];
const HEALTH_ATTEMPTS: usize = 20;
const HEALTH_DELAY_MS: u64 = 150;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
    }

    /// Probe the upstream until it answers, with a bounded retry loop. A
    /// failure here is non-fatal — the ingester's reconnect backoff owns
    /// recovery once the process is up.
    pub async fn wait_for_health(&self) -> Result<(), RelayError> {
        for _ in 0..HEALTH_ATTEMPTS {
            for endpoint in HEALTH_ENDPOINTS {
                match self.request(Method::GET, &format!("/{endpoint}")).send().await {
                    Ok(response) if response.status().is_success() => return Ok(()),
                    Ok(_) | Err(_) => {}
                }
            }
            debug!(base_url = %self.base_url, "upstream health probe failed; retrying");
            sleep(Duration::from_millis(HEALTH_DELAY_MS)).await;
        }

        Err(RelayError::UpstreamUnavailable {
            message: format!("no healthy response from {}", self.base_url),
        })
    }

    /// Open the single event feed. The response body is the raw SSE byte
    /// stream; the ingester parses the framing.
    pub async fn open_event_stream(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<Response, RelayError> {
        let mut builder = self
            .request(Method::GET, "/event")
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(last_event_id) = last_event_id {
            builder = builder.header("Last-Event-ID", last_event_id);
        }

        let response = builder.send().await.map_err(|err| RelayError::StreamError {
            message: format!("event stream connect failed: {err}"),
        })?;

        if !response.status().is_success() {
            return Err(RelayError::StreamError {
                message: format!("event stream returned HTTP {}", response.status()),
            });
        }

        Ok(response)
    }

    /// Full message history for one session, `[{info, parts}]`.
    pub async fn fetch_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageEnvelope>, RelayError> {
        let response = self
            .request(Method::GET, &format!("/session/{session_id}/message"))
            .send()
            .await
            .map_err(unavailable)?;
        let response = check_status(response, Some(session_id)).await?;
        response.json().await.map_err(|err| RelayError::StreamError {
            message: format!("history decode failed: {err}"),
        })
    }

    /// All sessions the upstream currently knows about.
    pub async fn list_sessions(&self) -> Result<Vec<Value>, RelayError> {
        let response = self
            .request(Method::GET, "/session")
            .send()
            .await
            .map_err(unavailable)?;
        let response = check_status(response, None).await?;
        response.json().await.map_err(|err| RelayError::StreamError {
            message: format!("session list decode failed: {err}"),
        })
    }

    /// Submit a user prompt. The resulting assistant activity arrives over
    /// the event feed.
    pub async fn send_message(&self, session_id: &str, body: Value) -> Result<(), RelayError> {
        let response = self
            .request(Method::POST, &format!("/session/{session_id}/message"))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        check_status(response, Some(session_id)).await?;
        Ok(())
    }

    /// Reply to a pending permission. Local state is not touched — removal
    /// happens when the upstream's `permission.replied` event comes back.
    pub async fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), RelayError> {
        let response = self
            .request(
                Method::POST,
                &format!("/session/{session_id}/permissions/{permission_id}"),
            )
            .json(&serde_json::json!({"response": reply.as_str()}))
            .send()
            .await
            .map_err(unavailable)?;
        check_status(response, Some(session_id)).await?;
        Ok(())
    }

    /// Interrupt the session's running turn.
    pub async fn abort(&self, session_id: &str) -> Result<(), RelayError> {
        let response = self
            .request(Method::POST, &format!("/session/{session_id}/abort"))
            .send()
            .await
            .map_err(unavailable)?;
        check_status(response, Some(session_id)).await?;
        Ok(())
    }
}

fn unavailable(err: reqwest::Error) -> RelayError {
    RelayError::UpstreamUnavailable {
        message: err.to_string(),
    }
}

async fn check_status(
    response: Response,
    session_id: Option<&str>,
) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        if let Some(session_id) = session_id {
            return Err(RelayError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
    }

    let body = response.text().await.ok().filter(|text| !text.is_empty());
    Err(RelayError::UpstreamRejected {
        status: status.as_u16(),
        body,
        session_id: session_id.map(str::to_string),
    })
}
