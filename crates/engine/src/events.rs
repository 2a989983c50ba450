//! Run progress events

use lumen_common::RunStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

/// Informational notifications for whoever is watching a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Page {
        run_id: String,
        page_id: String,
        outcome: Outcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Run {
        run_id: String,
        outcome: Outcome,
        status: RunStatus,
    },
}

/// Fan-out channel; publishing never blocks and never fails
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
