//! Wire types shared between the relay engine and the upstream client.
//!
//! The upstream collaborator is an OpenCode-compatible server: one SSE event
//! feed of `{type, properties}` frames plus a request/response command
//! surface. Everything here mirrors those wire shapes, including the
//! `sessionID`/`messageID`/`callID` field casing.

mod events;
mod records;

pub use events::{extract_session_id, EventDecodeError, UpstreamEvent};
pub use records::{
    MessageEnvelope, MessageInfo, MessagePart, MessageRole, MessageTime, PartKind, Permission,
    PermissionReply, TokenUsage, ToolState, ToolStatus,
};
