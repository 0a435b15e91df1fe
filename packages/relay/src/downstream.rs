use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::debug;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One frame on a downstream channel: either a serialized full-state
/// snapshot or an inert keepalive (rendered as an SSE comment).
#[derive(Debug, Clone)]
pub enum DownstreamFrame {
    State(Arc<String>),
    Keepalive,
}

struct SubscriberHandle {
    id: u64,
    sender: mpsc::UnboundedSender<DownstreamFrame>,
    keepalive: JoinHandle<()>,
}

impl SubscriberHandle {
    fn deliver(&self, frame: DownstreamFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    fn retire(&self) {
        // Removal owns the abort, so the keepalive timer stops exactly once
        // no matter how the handle died.
        self.keepalive.abort();
    }
}

/// Live downstream subscriptions, tracked per session. A session with no
/// subscribers has no entry here; its state in the store is unaffected.
#[derive(Default)]
pub struct ConnectionManager {
    by_session: HashMap<String, Vec<SubscriberHandle>>,
    next_id: u64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and enqueue its snapshot as the first frame —
    /// a fresh subscription never sits idle waiting for the next mutation.
    pub fn subscribe(
        &mut self,
        session_id: &str,
        snapshot: Arc<String>,
    ) -> (u64, mpsc::UnboundedReceiver<DownstreamFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(DownstreamFrame::State(snapshot));

        let keepalive_sender = sender.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = interval_at(
                Instant::now() + KEEPALIVE_INTERVAL,
                KEEPALIVE_INTERVAL,
            );
            loop {
                ticker.tick().await;
                if keepalive_sender.send(DownstreamFrame::Keepalive).is_err() {
                    break;
                }
            }
        });

        self.next_id += 1;
        let id = self.next_id;
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .push(SubscriberHandle {
                id,
                sender,
                keepalive,
            });
        (id, receiver)
    }

    /// Deliver one frame to every live subscriber of the session. A dead
    /// handle is removed silently and never blocks delivery to the rest.
    pub fn push(&mut self, session_id: &str, frame: Arc<String>) {
        let Some(handles) = self.by_session.get_mut(session_id) else {
            return;
        };
        handles.retain(|handle| {
            let alive = handle.deliver(DownstreamFrame::State(frame.clone()));
            if !alive {
                debug!(session_id, subscriber = handle.id, "dropping dead subscriber");
                handle.retire();
            }
            alive
        });
        if handles.is_empty() {
            self.by_session.remove(session_id);
        }
    }

    /// Explicit disconnect. Idempotent: a second call for the same id is a
    /// no-op.
    pub fn unsubscribe(&mut self, session_id: &str, subscriber_id: u64) {
        let Some(handles) = self.by_session.get_mut(session_id) else {
            return;
        };
        if let Some(position) = handles.iter().position(|handle| handle.id == subscriber_id) {
            handles.remove(position).retire();
        }
        if handles.is_empty() {
            self.by_session.remove(session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.by_session
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
