//! Best-effort notification channel from the core to the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Notifications delivered to the UI layer. Emission never blocks; with no
/// subscribers (or lagging ones) events are simply dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConsoleEvent {
    #[serde(rename_all = "camelCase")]
    MessageReceived {
        subscription_id: String,
        message_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StreamError {
        subscription_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    EmulatorReady { profile_id: String },
    #[serde(rename_all = "camelCase")]
    EmulatorError { profile_id: String, message: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConsoleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { sender }
    }

    pub fn emit(&self, event: ConsoleEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.sender.subscribe()
    }

    /// Stream adapter for UI event loops.
    pub fn stream(&self) -> BroadcastStream<ConsoleEvent> {
        BroadcastStream::new(self.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
