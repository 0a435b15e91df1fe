use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::records::{MessageInfo, MessagePart, Permission};

/// One decoded frame from the upstream event feed.
///
/// The feed is an open set; kinds the relay merges are decoded into typed
/// variants and everything else lands in `Unrecognized`, which the merge
/// step accepts and ignores.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    MessageUpdated {
        info: MessageInfo,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PartUpdated {
        part: MessagePart,
    },
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    PermissionAsked {
        permission: Permission,
    },
    PermissionReplied {
        session_id: String,
        permission_id: String,
    },
    Unrecognized {
        kind: String,
        session_id: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event frame has no type field")]
    MissingKind,
    #[error("malformed {kind} event: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct PartUpdatedProps {
    part: MessagePart,
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Debug, Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    // Newer upstreams send permissionID, older ones requestID.
    #[serde(rename = "permissionID", default)]
    permission_id: Option<String>,
    #[serde(rename = "requestID", default)]
    request_id: Option<String>,
}

impl UpstreamEvent {
    /// Decode one `{type, properties}` frame. Exhaustive over the kinds the
    /// relay merges; anything else becomes `Unrecognized`.
    pub fn decode(value: &Value) -> Result<Self, EventDecodeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventDecodeError::MissingKind)?;
        let props = value.get("properties").cloned().unwrap_or(Value::Null);

        let malformed = |source| EventDecodeError::Malformed {
            kind: kind.to_string(),
            source,
        };

        match kind {
            "message.updated" => {
                let props: MessageUpdatedProps =
                    serde_json::from_value(props).map_err(malformed)?;
                Ok(Self::MessageUpdated { info: props.info })
            }
            "message.removed" => {
                let props: MessageRemovedProps =
                    serde_json::from_value(props).map_err(malformed)?;
                Ok(Self::MessageRemoved {
                    session_id: props.session_id,
                    message_id: props.message_id,
                })
            }
            "message.part.updated" => {
                let props: PartUpdatedProps = serde_json::from_value(props).map_err(malformed)?;
                let mut part = props.part;
                if part.session_id.is_none() {
                    part.session_id = props.session_id;
                }
                Ok(Self::PartUpdated { part })
            }
            "message.part.removed" => {
                let props: PartRemovedProps = serde_json::from_value(props).map_err(malformed)?;
                Ok(Self::PartRemoved {
                    session_id: props.session_id,
                    message_id: props.message_id,
                    part_id: props.part_id,
                })
            }
            "permission.asked" => {
                let permission: Permission = serde_json::from_value(props).map_err(malformed)?;
                Ok(Self::PermissionAsked { permission })
            }
            "permission.replied" => {
                let props: PermissionRepliedProps =
                    serde_json::from_value(props).map_err(malformed)?;
                let permission_id = props
                    .permission_id
                    .or(props.request_id)
                    .ok_or_else(|| EventDecodeError::Malformed {
                        kind: kind.to_string(),
                        source: serde_json::Error::custom("missing permissionID"),
                    })?;
                Ok(Self::PermissionReplied {
                    session_id: props.session_id,
                    permission_id,
                })
            }
            other => Ok(Self::Unrecognized {
                kind: other.to_string(),
                session_id: extract_session_id(value).map(str::to_string),
            }),
        }
    }

    /// The session this event is scoped to, when one can be extracted.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessageUpdated { info } => Some(info.session_id.as_str()),
            Self::MessageRemoved { session_id, .. }
            | Self::PartRemoved { session_id, .. }
            | Self::PermissionReplied { session_id, .. } => Some(session_id.as_str()),
            Self::PartUpdated { part } => part.session_id.as_deref(),
            Self::PermissionAsked { permission } => Some(permission.session_id.as_str()),
            Self::Unrecognized { session_id, .. } => session_id.as_deref(),
        }
    }
}

/// Session-id extraction for raw frames: the direct properties field, then
/// the nested message-info field, then the nested part field.
pub fn extract_session_id(value: &Value) -> Option<&str> {
    value
        .pointer("/properties/sessionID")
        .and_then(Value::as_str)
        .or_else(|| {
            value
                .pointer("/properties/info/sessionID")
                .and_then(Value::as_str)
        })
        .or_else(|| {
            value
                .pointer("/properties/part/sessionID")
                .and_then(Value::as_str)
        })
}
