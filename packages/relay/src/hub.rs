use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use agent_relay_error::RelayError;
use agent_relay_protocol::{MessageEnvelope, PermissionReply, UpstreamEvent};
use agent_relay_upstream::UpstreamClient;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::downstream::{ConnectionManager, DownstreamFrame};
use crate::store::SessionState;

pub type CommandFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send + 'a>>;

/// The upstream command surface, abstracted so tests can inject a mock
/// transport through the composition root.
pub trait UpstreamCommands: Send + Sync + 'static {
    fn fetch_messages(&self, session_id: &str) -> CommandFuture<'_, Vec<MessageEnvelope>>;
    fn list_sessions(&self) -> CommandFuture<'_, Vec<Value>>;
    fn send_message(&self, session_id: &str, body: Value) -> CommandFuture<'_, ()>;
    fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> CommandFuture<'_, ()>;
    fn abort(&self, session_id: &str) -> CommandFuture<'_, ()>;
}

impl UpstreamCommands for UpstreamClient {
    fn fetch_messages(&self, session_id: &str) -> CommandFuture<'_, Vec<MessageEnvelope>> {
        let session_id = session_id.to_string();
        Box::pin(async move { UpstreamClient::fetch_messages(self, &session_id).await })
    }

    fn list_sessions(&self) -> CommandFuture<'_, Vec<Value>> {
        Box::pin(UpstreamClient::list_sessions(self))
    }

    fn send_message(&self, session_id: &str, body: Value) -> CommandFuture<'_, ()> {
        let session_id = session_id.to_string();
        Box::pin(async move { UpstreamClient::send_message(self, &session_id, body).await })
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
            UpstreamClient::respond_permission(self, &session_id, &permission_id, reply).await
        })
    }

    fn abort(&self, session_id: &str) -> CommandFuture<'_, ()> {
        let session_id = session_id.to_string();
        Box::pin(async move { UpstreamClient::abort(self, &session_id).await })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateFrame<'a> {
    session_id: &'a str,
    state: &'a SessionState,
}

fn serialize_frame(session_id: &str, state: &SessionState) -> Arc<String> {
    match serde_json::to_string(&StateFrame { session_id, state }) {
        Ok(json) => Arc::new(json),
        Err(err) => {
            warn!(session_id, error = %err, "frame serialization failed");
            Arc::new(serde_json::json!({"sessionId": session_id}).to_string())
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    state: SessionState,
    buffering: bool,
    buffered: Vec<Arc<String>>,
}

#[derive(Default)]
struct HubInner {
    sessions: HashMap<String, SessionSlot>,
    connections: ConnectionManager,
}

/// The single place upstream events become per-session state and fan out
/// to downstream subscribers.
///
/// All mutation happens inside the ingester's event-processing path, one
/// decoded event at a time; the mutex is held only across the synchronous
/// merge + fan-out step, never across I/O.
pub struct SessionHub {
    inner: StdMutex<HubInner>,
    commands: Arc<dyn UpstreamCommands>,
    clock: Arc<dyn Clock>,
}

impl SessionHub {
    pub fn new(commands: Arc<dyn UpstreamCommands>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: StdMutex::new(HubInner::default()),
            commands,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn commands(&self) -> Arc<dyn UpstreamCommands> {
        self.commands.clone()
    }

    /// One raw frame off the feed: decode, route, merge, fan out. Malformed
    /// frames are logged and dropped; the caller's read loop continues.
    pub fn ingest_frame(&self, value: &Value) {
        match UpstreamEvent::decode(value) {
            Ok(event) => self.apply_event(&event),
            Err(err) => warn!(error = %err, "dropping malformed event frame"),
        }
    }

    /// Merge one decoded event and deliver the resulting snapshot frame to
    /// subscribers (or the session's buffer while the gate is on). Delivery
    /// completes before the caller can process the next event, so
    /// per-session frame order equals merge order.
    pub fn apply_event(&self, event: &UpstreamEvent) {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            debug!("dropping event with no session id");
            return;
        };
        let now_ms = self.clock.now_ms();

        let mut inner = self.lock();
        let inner = &mut *inner;
        let slot = inner.sessions.entry(session_id.clone()).or_default();
        if !slot.state.apply(event, now_ms) {
            return;
        }
        let frame = serialize_frame(&session_id, &slot.state);
        if slot.buffering {
            slot.buffered.push(frame);
            return;
        }
        inner.connections.push(&session_id, frame);
    }

    /// Current snapshot frame for a session, seeding from upstream history
    /// the first time the session is asked for.
    pub async fn snapshot(&self, session_id: &str) -> Arc<String> {
        self.seed_if_unknown(session_id).await;
        let mut inner = self.lock();
        let slot = inner.sessions.entry(session_id.to_string()).or_default();
        serialize_frame(session_id, &slot.state)
    }

    /// Register a downstream subscriber. The returned channel's first frame
    /// is always a full snapshot.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<DownstreamFrame>) {
        self.seed_if_unknown(session_id).await;
        let mut inner = self.lock();
        let inner = &mut *inner;
        let slot = inner.sessions.entry(session_id.to_string()).or_default();
        let snapshot = serialize_frame(session_id, &slot.state);
        inner.connections.subscribe(session_id, snapshot)
    }

    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        self.lock().connections.unsubscribe(session_id, subscriber_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock().connections.subscriber_count(session_id)
    }

    /// Turn the buffering gate on: frames for this session are held back
    /// in order instead of reaching subscribers. Idempotent.
    pub fn enable_buffering(&self, session_id: &str) {
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .buffering = true;
    }

    /// Turn the gate off and replay every held frame, in original order,
    /// exactly once. A no-op when the gate was never enabled.
    pub fn disable_buffering(&self, session_id: &str) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(slot) = inner.sessions.get_mut(session_id) else {
            return;
        };
        slot.buffering = false;
        let buffered = std::mem::take(&mut slot.buffered);
        for frame in buffered {
            inner.connections.push(session_id, frame);
        }
    }

    /// Forward a permission reply upstream. The local queue entry is left
    /// alone — it goes away when the upstream's `permission.replied` event
    /// comes back. Replies for ids the store no longer holds are silently
    /// dropped (duplicate clicks, races with another responder).
    pub async fn respond(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<bool, RelayError> {
        let present = self
            .lock()
            .sessions
            .get(session_id)
            .map(|slot| slot.state.permissions.by_id.contains_key(permission_id))
            .unwrap_or(false);
        if !present {
            debug!(session_id, permission_id, "ignoring reply for unknown permission");
            return Ok(false);
        }

        self.commands
            .respond_permission(session_id, permission_id, reply)
            .await?;
        Ok(true)
    }

    /// `lastUpdate` per session known to the store.
    pub fn last_updates(&self) -> HashMap<String, i64> {
        self.lock()
            .sessions
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state.last_update))
            .collect()
    }

    async fn seed_if_unknown(&self, session_id: &str) {
        let known = self.lock().sessions.contains_key(session_id);
        if known {
            return;
        }

        let history = match self.commands.fetch_messages(session_id).await {
            Ok(history) => history,
            Err(err) => {
                debug!(session_id, error = %err, "history seed failed; starting empty");
                Vec::new()
            }
        };
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();
        let slot = inner.sessions.entry(session_id.to_string()).or_default();
        slot.state.seed_history(history, now_ms);
    }
}
