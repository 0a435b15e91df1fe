use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay_upstream::UpstreamClient;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::hub::SessionHub;

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^k, cap)`
/// for k consecutive failures so far.
pub fn reconnect_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let mult = 1u32 << exp;
    base.checked_mul(mult).unwrap_or(BACKOFF_CAP).min(BACKOFF_CAP)
}

/// Owns the single read of the upstream event feed.
///
/// Exactly one read loop runs at a time (guarded by `in_flight`); it knows
/// nothing about sessions — it decodes SSE framing and hands each JSON
/// payload to the hub.
pub struct Ingester {
    upstream: UpstreamClient,
    hub: Arc<SessionHub>,
    in_flight: AtomicBool,
}

impl Ingester {
    pub fn new(upstream: UpstreamClient, hub: Arc<SessionHub>) -> Self {
        Self {
            upstream,
            hub,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Start the read loop. Returns `None` when one is already running.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("event feed reader already running");
            return None;
        }
        let ingester = self.clone();
        Some(tokio::spawn(async move {
            ingester.run().await;
            ingester.in_flight.store(false, Ordering::SeqCst);
        }))
    }

    async fn run(&self) {
        let mut attempt: u32 = 0;
        let mut base = BACKOFF_BASE;
        let mut last_event_id: Option<String> = None;

        loop {
            match self.upstream.open_event_stream(last_event_id.as_deref()).await {
                Ok(response) => {
                    info!(base_url = %self.upstream.base_url(), "event feed connected");
                    attempt = 0;
                    self.read_stream(response, &mut last_event_id, &mut base)
                        .await;
                }
                Err(err) => {
                    warn!(error = %err, "event feed connect failed");
                }
            }

            attempt += 1;
            let delay = reconnect_backoff(base, attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            sleep(delay).await;
        }
    }

    /// Drain one open stream until it ends. Malformed payloads are dropped;
    /// they never terminate the loop.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        last_event_id: &mut Option<String>,
        base: &mut Duration,
    ) {
        let mut stream = response.bytes_stream().eventsource();

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "event feed read failed");
                    return;
                }
            };

            if !event.id.trim().is_empty() {
                *last_event_id = Some(event.id.trim().to_string());
            }
            if let Some(retry) = event.retry {
                *base = retry.min(BACKOFF_CAP);
            }

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(value) => self.hub.ingest_frame(&value),
                Err(err) => warn!(error = %err, "skipping non-JSON event payload"),
            }
        }

        info!("event feed ended");
    }
}
