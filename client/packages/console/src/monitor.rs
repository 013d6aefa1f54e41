//! Per-subscription streaming-pull sessions and the registry that owns them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use pubsub_console_error::ConsoleError;

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::connection::{ConnectionManager, MessageHandler, SubscriberClient};
use crate::events::{ConsoleEvent, EventBus};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping for one live receive loop.
struct StreamSession {
    cancel: watch::Sender<bool>,
    done: Option<oneshot::Receiver<()>>,
    auto_ack: Arc<AtomicBool>,
}

/// Registry of streaming-pull sessions, at most one per subscription id.
///
/// The session map lock covers bookkeeping only; receive loops run as
/// independent tasks and outlive no `stop_stream` call by more than the
/// bounded wait.
pub struct MonitorManager {
    connection: Arc<ConnectionManager>,
    events: EventBus,
    sessions: StdMutex<HashMap<String, StreamSession>>,
    buffers: StdMutex<HashMap<String, Arc<MessageBuffer>>>,
    stop_timeout: Duration,
}

impl MonitorManager {
    pub fn new(connection: Arc<ConnectionManager>, events: EventBus) -> Self {
        Self {
            connection,
            events,
            sessions: StdMutex::new(HashMap::new()),
            buffers: StdMutex::new(HashMap::new()),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Begin streaming from a subscription. Fails when no connection is
    /// active; a second start for the same id is a no-op. Returns once the
    /// loop is spawned, without waiting for a first message.
    pub fn start_stream(&self, subscription_id: &str, auto_ack: bool) -> Result<(), ConsoleError> {
        let handle = self.connection.handle().ok_or(ConsoleError::NotConnected)?;
        let buffer = self.buffer_for(subscription_id);

        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(ConsoleError::StreamFailed {
                    subscription_id: subscription_id.to_string(),
                    message: "session registry unavailable".to_string(),
                })
            }
        };
        if sessions.contains_key(subscription_id) {
            return Ok(());
        }

        let auto_ack_flag = Arc::new(AtomicBool::new(auto_ack));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        sessions.insert(
            subscription_id.to_string(),
            StreamSession {
                cancel: cancel_tx,
                done: Some(done_rx),
                auto_ack: auto_ack_flag.clone(),
            },
        );
        drop(sessions);

        spawn_receive_loop(
            handle.client,
            subscription_id.to_string(),
            buffer,
            auto_ack_flag,
            cancel_rx,
            self.events.clone(),
            done_tx,
        );
        Ok(())
    }

    /// Cancel the session and wait for its loop to retire, up to the bound.
    /// With nothing tracked for the id this succeeds silently: rapid
    /// start/stop races from the UI are legitimate, not errors. On timeout
    /// the loop is expected to observe cancellation and close the signal
    /// later; cancellation is not retried.
    pub async fn stop_stream(&self, subscription_id: &str) -> Result<(), ConsoleError> {
        let session = match self.sessions.lock() {
            Ok(mut sessions) => sessions.remove(subscription_id),
            Err(_) => None,
        };
        let Some(mut session) = session else {
            return Ok(());
        };

        let _ = session.cancel.send(true);
        let Some(done) = session.done.take() else {
            return Ok(());
        };
        match timeout(self.stop_timeout, done).await {
            // A RecvError here still means the loop is gone: the sender only
            // drops when the task exits.
            Ok(_) => Ok(()),
            Err(_) => Err(ConsoleError::StopTimeout {
                subscription_id: subscription_id.to_string(),
            }),
        }
    }

    /// Applies to subsequently received messages only; already-buffered,
    /// unacknowledged messages are unaffected. Silent no-op when untracked.
    pub fn set_auto_ack(&self, subscription_id: &str, enabled: bool) {
        if let Ok(sessions) = self.sessions.lock() {
            if let Some(session) = sessions.get(subscription_id) {
                session.auto_ack.store(enabled, Ordering::Relaxed);
            }
        }
    }

    pub fn is_monitoring(&self, subscription_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(subscription_id))
            .unwrap_or(false)
    }

    /// Snapshot of everything buffered for a subscription, oldest first.
    pub fn get_buffer(&self, subscription_id: &str) -> Vec<BufferedMessage> {
        if let Ok(buffers) = self.buffers.lock() {
            if let Some(buffer) = buffers.get(subscription_id) {
                return buffer.get_all();
            }
        }
        Vec::new()
    }

    pub fn set_buffer_limit(&self, subscription_id: &str, max_size: usize) {
        if let Ok(buffers) = self.buffers.lock() {
            if let Some(buffer) = buffers.get(subscription_id) {
                buffer.set_max_size(max_size);
            }
        }
    }

    pub fn clear_buffer(&self, subscription_id: &str) {
        if let Ok(buffers) = self.buffers.lock() {
            if let Some(buffer) = buffers.get(subscription_id) {
                buffer.clear();
            }
        }
    }

    /// Stop every session and drop all buffers. Runs before a handle swap so
    /// no data from the previous project survives into the next one.
    pub async fn reset(&self) {
        let ids: Vec<String> = match self.sessions.lock() {
            Ok(sessions) => sessions.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        let results = join_all(ids.iter().map(|id| self.stop_stream(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(
                    subscription = %id,
                    error = %err,
                    "session did not stop cleanly during reset"
                );
            }
        }
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.clear();
        }
    }

    fn buffer_for(&self, subscription_id: &str) -> Arc<MessageBuffer> {
        match self.buffers.lock() {
            Ok(mut buffers) => buffers
                .entry(subscription_id.to_string())
                .or_insert_with(|| Arc::new(MessageBuffer::new()))
                .clone(),
            Err(_) => Arc::new(MessageBuffer::new()),
        }
    }
}

fn spawn_receive_loop(
    client: Arc<dyn SubscriberClient>,
    subscription_id: String,
    buffer: Arc<MessageBuffer>,
    auto_ack: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
    events: EventBus,
    done: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        // Dropped on every exit path (success, cancellation, or error) so
        // `stop_stream` always observes completion.
        let _done = done;

        let handler: MessageHandler = {
            let subscription_id = subscription_id.clone();
            let buffer = buffer.clone();
            let auto_ack = auto_ack.clone();
            let events = events.clone();
            Box::new(move |pulled, reply| {
                let message = BufferedMessage::from(pulled);
                let message_id = message.id.clone();
                buffer.add(message);
                events.emit(ConsoleEvent::MessageReceived {
                    subscription_id: subscription_id.clone(),
                    message_id,
                });
                if auto_ack.load(Ordering::Relaxed) {
                    reply.ack();
                }
            })
        };

        let result = client.pull(&subscription_id, cancel.clone(), handler).await;
        let cancelled = *cancel.borrow();
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                // Subscription deleted while streaming, e.g. cleanup racing
                // teardown. Expected; no notification.
                tracing::debug!(
                    subscription = %subscription_id,
                    "streaming pull ended: subscription gone"
                );
            }
            Err(err) if cancelled => {
                tracing::debug!(
                    subscription = %subscription_id,
                    error = %err,
                    "streaming pull errored after cancellation"
                );
            }
            Err(err) => {
                tracing::warn!(
                    subscription = %subscription_id,
                    error = %err,
                    "streaming pull failed"
                );
                events.emit(ConsoleEvent::StreamError {
                    subscription_id: subscription_id.clone(),
                    message: err.to_string(),
                });
            }
        }
    });
}
