use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    SessionNotFound,
    UpstreamUnavailable,
    UpstreamRejected,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-relay:error:invalid_request",
            Self::TokenInvalid => "urn:agent-relay:error:token_invalid",
            Self::SessionNotFound => "urn:agent-relay:error:session_not_found",
            Self::UpstreamUnavailable => "urn:agent-relay:error:upstream_unavailable",
            Self::UpstreamRejected => "urn:agent-relay:error:upstream_rejected",
            Self::StreamError => "urn:agent-relay:error:stream_error",
            Self::Timeout => "urn:agent-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::SessionNotFound => "Session Not Found",
            Self::UpstreamUnavailable => "Upstream Unavailable",
            Self::UpstreamRejected => "Upstream Rejected",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::SessionNotFound => 404,
            Self::UpstreamUnavailable => 502,
            Self::UpstreamRejected => 502,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

/// RFC 9457 problem document returned by every failing HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },
    #[error("upstream rejected command: {status}")]
    UpstreamRejected {
        status: u16,
        body: Option<String>,
        session_id: Option<String>,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::UpstreamUnavailable { .. } => ErrorType::UpstreamUnavailable,
            Self::UpstreamRejected { .. } => ErrorType::UpstreamRejected,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::UpstreamRejected {
                status,
                body,
                session_id,
            } => {
                extensions.insert("upstreamStatus".to_string(), Value::from(*status));
                if let Some(body) = body {
                    extensions.insert("upstreamBody".to_string(), Value::String(body.clone()));
                }
                if let Some(session_id) = session_id {
                    extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
                }
            }
            Self::TokenInvalid { message } | Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
