//! Test doubles for the connection seam.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Notify};

use pubsub_console_error::{ConsoleError, ReceiveError};

use crate::connection::{AckReply, Connector, MessageHandler, PulledMessage, SubscriberClient};

/// Scripted subscriber client: tests push messages and failures in, the pull
/// loop drains them; acknowledgements are recorded.
#[derive(Default)]
pub struct MockSubscriberClient {
    queue: StdMutex<VecDeque<PulledMessage>>,
    pending_error: StdMutex<Option<ReceiveError>>,
    acked: Arc<StdMutex<Vec<String>>>,
    notify: Notify,
    pulls_started: AtomicUsize,
    close_calls: AtomicUsize,
    block_close: AtomicBool,
}

impl MockSubscriberClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client whose `close` never completes, for close-timeout scenarios.
    pub fn with_blocking_close() -> Arc<Self> {
        let client = Self::default();
        client.block_close.store(true, Ordering::SeqCst);
        Arc::new(client)
    }

    /// Convenience builder for a pulled message with the given payload.
    pub fn message(id: &str, payload: &[u8]) -> PulledMessage {
        PulledMessage {
            id: id.to_string(),
            publish_time: None,
            data: payload.to_vec(),
            attributes: None,
            delivery_attempt: 0,
            ordering_key: None,
        }
    }

    /// Enqueue a message for delivery to the active pull loop.
    pub fn push(&self, message: PulledMessage) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Make the pull loop terminate with this error once the queue drains.
    pub fn fail_pull(&self, error: ReceiveError) {
        if let Ok(mut pending) = self.pending_error.lock() {
            *pending = Some(error);
        }
        self.notify.notify_one();
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn pulls_started(&self) -> usize {
        self.pulls_started.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

struct MockAckReply {
    id: String,
    sink: Arc<StdMutex<Vec<String>>>,
}

impl AckReply for MockAckReply {
    fn ack(self: Box<Self>) {
        if let Ok(mut ids) = self.sink.lock() {
            ids.push(self.id);
        }
    }
}

impl SubscriberClient for MockSubscriberClient {
    fn pull(
        &self,
        _subscription_id: &str,
        cancel: watch::Receiver<bool>,
        mut handler: MessageHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), ReceiveError>> + Send + '_>> {
        self.pulls_started.fetch_add(1, Ordering::SeqCst);
        let mut cancel = cancel;
        Box::pin(async move {
            loop {
                if *cancel.borrow() {
                    return Ok(());
                }
                let next = self.queue.lock().ok().and_then(|mut queue| queue.pop_front());
                if let Some(message) = next {
                    let reply = MockAckReply {
                        id: message.id.clone(),
                        sink: self.acked.clone(),
                    };
                    handler(message, Box::new(reply));
                    continue;
                }
                if let Some(error) = self
                    .pending_error
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.take())
                {
                    return Err(error);
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if self.block_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

/// Connector returning scripted clients in order; records every connect.
#[derive(Default)]
pub struct MockConnector {
    clients: StdMutex<VecDeque<Arc<MockSubscriberClient>>>,
    connects: StdMutex<Vec<(String, Option<String>)>>,
    fail_next: StdMutex<Option<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_clients(clients: Vec<Arc<MockSubscriberClient>>) -> Arc<Self> {
        let connector = Self::default();
        if let Ok(mut queue) = connector.clients.lock() {
            queue.extend(clients);
        }
        Arc::new(connector)
    }

    pub fn enqueue_client(&self, client: Arc<MockSubscriberClient>) {
        if let Ok(mut queue) = self.clients.lock() {
            queue.push_back(client);
        }
    }

    pub fn fail_next(&self, message: &str) {
        if let Ok(mut fail) = self.fail_next.lock() {
            *fail = Some(message.to_string());
        }
    }

    /// Every `(project_id, endpoint)` pair connected so far.
    pub fn connects(&self) -> Vec<(String, Option<String>)> {
        self.connects
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        project_id: &str,
        endpoint: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn SubscriberClient>, ConsoleError>> + Send + '_>>
    {
        let project_id = project_id.to_string();
        let endpoint = endpoint.map(ToOwned::to_owned);
        Box::pin(async move {
            if let Ok(mut log) = self.connects.lock() {
                log.push((project_id, endpoint));
            }
            if let Some(message) = self.fail_next.lock().ok().and_then(|mut fail| fail.take()) {
                return Err(ConsoleError::ConnectFailed { message });
            }
            let client = self
                .clients
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front());
            match client {
                Some(client) => Ok(client as Arc<dyn SubscriberClient>),
                None => Err(ConsoleError::ConnectFailed {
                    message: "no scripted client available".to_string(),
                }),
            }
        })
    }
}

/// A pulled message with attributes and delivery metadata, for decode tests.
pub fn rich_message(id: &str, payload: &[u8], attempt: i32) -> PulledMessage {
    let mut attributes = HashMap::new();
    attributes.insert("origin".to_string(), "test".to_string());
    PulledMessage {
        id: id.to_string(),
        publish_time: Some(chrono::Utc::now()),
        data: payload.to_vec(),
        attributes: Some(attributes),
        delivery_attempt: attempt,
        ordering_key: Some("ord-1".to_string()),
    }
}
