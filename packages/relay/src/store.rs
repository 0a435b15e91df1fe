use std::collections::HashMap;

use agent_relay_protocol::{
    MessageEnvelope, MessageInfo, MessagePart, MessageRole, MessageTime, PartKind, Permission,
    UpstreamEvent,
};
use schemars::JsonSchema;
use serde::Serialize;
use utoipa::ToSchema;

/// Pending approvals for one session. `active_id` is always the queue head;
/// the invariant is re-established after every mutation.
#[derive(Debug, Clone, Default, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionQueueState {
    pub by_id: HashMap<String, Permission>,
    pub queue: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_id: Option<String>,
}

impl PermissionQueueState {
    fn resync_active(&mut self) {
        self.active_id = self.queue.first().cloned();
        debug_assert_eq!(self.queue.len(), self.by_id.len());
    }
}

/// Where a tool call currently lives: the owning message and part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolRef {
    pub message_id: String,
    pub part_id: String,
}

/// The per-session aggregate every downstream frame is a snapshot of.
///
/// Mutated only from the ingester's event-processing path (single logical
/// writer); everything downstream sees is a serialized copy.
#[derive(Debug, Clone, Default, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub messages: Vec<MessageEnvelope>,
    pub permissions: PermissionQueueState,
    pub tools_by_call: HashMap<String, ToolRef>,
    pub last_update: i64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one decoded event. Returns whether the state mutated (and a
    /// frame should fan out). Unrecognized kinds are accepted and ignored.
    pub fn apply(&mut self, event: &UpstreamEvent, now_ms: i64) -> bool {
        match event {
            UpstreamEvent::MessageUpdated { info } => self.upsert_message(info.clone()),
            UpstreamEvent::MessageRemoved { message_id, .. } => self.remove_message(message_id),
            UpstreamEvent::PartUpdated { part } => self.upsert_part(part.clone()),
            UpstreamEvent::PartRemoved {
                message_id,
                part_id,
                ..
            } => self.remove_part(message_id, part_id),
            UpstreamEvent::PermissionAsked { permission } => {
                self.announce_permission(permission.clone())
            }
            UpstreamEvent::PermissionReplied { permission_id, .. } => {
                self.resolve_permission(permission_id)
            }
            UpstreamEvent::Unrecognized { .. } => return false,
        }

        self.touch(now_ms);
        true
    }

    /// Seed from the upstream history endpoint. Messages already merged
    /// from live events win over their history copies.
    pub fn seed_history(&mut self, history: Vec<MessageEnvelope>, now_ms: i64) {
        if history.is_empty() {
            return;
        }
        for envelope in history {
            if self
                .messages
                .iter()
                .any(|existing| existing.info.id == envelope.info.id)
            {
                continue;
            }
            for part in &envelope.parts {
                self.index_tool_part(part);
            }
            self.messages.push(envelope);
        }
        self.touch(now_ms);
    }

    fn touch(&mut self, now_ms: i64) {
        // lastUpdate is monotonically non-decreasing even if the injected
        // clock steps backwards.
        self.last_update = self.last_update.max(now_ms);
        self.messages
            .sort_by_key(|envelope| envelope.info.time.created);
    }

    fn upsert_message(&mut self, info: MessageInfo) {
        match self
            .messages
            .iter_mut()
            .find(|envelope| envelope.info.id == info.id)
        {
            Some(existing) => existing.info = info,
            None => self.messages.push(MessageEnvelope {
                info,
                parts: Vec::new(),
            }),
        }
    }

    fn remove_message(&mut self, message_id: &str) {
        self.messages
            .retain(|envelope| envelope.info.id != message_id);
        self.tools_by_call
            .retain(|_, tool| tool.message_id != message_id);
    }

    fn upsert_part(&mut self, part: MessagePart) {
        let position = self
            .messages
            .iter()
            .position(|envelope| envelope.info.id == part.message_id);
        let index = match position {
            Some(index) => index,
            None => {
                // Parts can stream in ahead of their message.updated frame;
                // create a placeholder owner that the real info will replace.
                self.messages.push(MessageEnvelope {
                    info: MessageInfo {
                        id: part.message_id.clone(),
                        session_id: part.session_id.clone().unwrap_or_default(),
                        role: MessageRole::Assistant,
                        time: MessageTime::default(),
                        cost: None,
                        tokens: None,
                        model_id: None,
                        extra: Default::default(),
                    },
                    parts: Vec::new(),
                });
                self.messages.len() - 1
            }
        };
        let message = &mut self.messages[index];

        match message
            .parts
            .iter_mut()
            .find(|existing| existing.id == part.id)
        {
            Some(existing) => *existing = part.clone(),
            None => message.parts.push(part.clone()),
        }

        self.index_tool_part(&part);
    }

    fn remove_part(&mut self, message_id: &str, part_id: &str) {
        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|envelope| envelope.info.id == message_id)
        {
            message.parts.retain(|part| part.id != part_id);
        }
        self.tools_by_call.retain(|_, tool| tool.part_id != part_id);
    }

    fn index_tool_part(&mut self, part: &MessagePart) {
        if part.kind != PartKind::Tool {
            return;
        }
        let Some(call_id) = &part.call_id else {
            return;
        };
        if part.state.is_none() {
            return;
        }
        self.tools_by_call.insert(
            call_id.clone(),
            ToolRef {
                message_id: part.message_id.clone(),
                part_id: part.id.clone(),
            },
        );
    }

    fn announce_permission(&mut self, permission: Permission) {
        let permissions = &mut self.permissions;
        if permissions.by_id.contains_key(&permission.id) {
            return;
        }
        permissions.queue.push(permission.id.clone());
        permissions.by_id.insert(permission.id.clone(), permission);
        permissions.resync_active();
    }

    fn resolve_permission(&mut self, permission_id: &str) {
        let permissions = &mut self.permissions;
        if permissions.by_id.remove(permission_id).is_none() {
            return;
        }
        permissions.queue.retain(|id| id != permission_id);
        permissions.resync_active();
    }
}
