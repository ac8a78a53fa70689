use std::sync::Arc;

use async_trait::async_trait;
use taberna_shared::domain::MesaClosed;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("listener {listener} failed: {reason}")]
    Listener { listener: String, reason: String },
}

/// Receives domain events emitted by the maintenance core. Implementations
/// may see the same event more than once and must dedupe on
/// `event_id` or `slug`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &MesaClosed) -> Result<(), EventError>;
}

/// Writes one audit line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &MesaClosed) -> Result<(), EventError> {
        info!(
            target: "taberna::audit",
            event_id = %event.event_id,
            slug = %event.slug,
            mesa_id = %event.mesa_id,
            manager_id = event.manager_id,
            confirmed = event.confirmed_count,
            closed_at = %event.closed_at.to_rfc3339(),
            "mesa closed"
        );
        Ok(())
    }
}

/// In-process channel; every subscriber gets every event published after it
/// subscribed.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<MesaClosed>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MesaClosed> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: &MesaClosed) -> Result<(), EventError> {
        // Sending only fails when nobody listens, which is not an error here.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Delivers to each sink in order. A failing sink does not keep the event
/// from the ones after it; the first failure is reported once all ran.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn publish(&self, event: &MesaClosed) -> Result<(), EventError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.publish(event).await {
                warn!(event_id = %event.event_id, error = %err, "events: sink failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
