//! Ownership of the single active connection handle, plus the seam traits
//! the handle is built from.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::timeout;

use pubsub_console_emulator_manager::EmulatorManager;
use pubsub_console_error::{ConsoleError, ReceiveError};

use crate::buffer::BufferedMessage;
use crate::profile::Profile;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One message as delivered by the streaming-pull seam, before buffering.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub id: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub data: Vec<u8>,
    pub attributes: Option<HashMap<String, String>>,
    pub delivery_attempt: i32,
    pub ordering_key: Option<String>,
}

impl From<PulledMessage> for BufferedMessage {
    fn from(message: PulledMessage) -> Self {
        Self {
            id: message.id,
            publish_time: message.publish_time,
            received_at: Utc::now(),
            data: message.data,
            attributes: message.attributes.unwrap_or_default(),
            delivery_attempt: (message.delivery_attempt > 0).then_some(message.delivery_attempt),
            ordering_key: message.ordering_key.filter(|key| !key.is_empty()),
        }
    }
}

/// Per-message acknowledge capability handed to the pull handler. Without an
/// ack the service redelivers once the deadline elapses; there is no local
/// retry or nack.
pub trait AckReply: Send {
    fn ack(self: Box<Self>);
}

pub type MessageHandler = Box<dyn FnMut(PulledMessage, Box<dyn AckReply>) + Send>;

/// Receive capability on an open connection.
///
/// `pull` blocks until `cancel` observes `true` (returning `Ok`) or the
/// stream fails; the handler runs once per delivered message. The returned
/// future may borrow `self` only, so implementations clone the subscription
/// id up front.
pub trait SubscriberClient: Send + Sync + 'static {
    fn pull(
        &self,
        subscription_id: &str,
        cancel: watch::Receiver<bool>,
        handler: MessageHandler,
    ) -> Pin<Box<dyn Future<Output = Result<(), ReceiveError>> + Send + '_>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>>;
}

/// Connect capability: builds a client for a project, optionally against an
/// alternate endpoint (emulator mode).
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        project_id: &str,
        endpoint: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn SubscriberClient>, ConsoleError>> + Send + '_>>;
}

/// The active connection: client plus the project it is bound to.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub client: Arc<dyn SubscriberClient>,
    pub project_id: String,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

/// Single source of truth for "are we connected, to what, via what handle".
///
/// Mutations hold the lock for the pointer swap only; closing the previous
/// handle happens outside it so readers are never blocked by slow teardown.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    emulators: EmulatorManager,
    active: RwLock<Option<ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, emulators: EmulatorManager) -> Self {
        Self {
            connector,
            emulators,
            active: RwLock::new(None),
        }
    }

    /// Build and install a handle for the profile. A managed-emulator profile
    /// first waits for its instance to report ready; that failure aborts the
    /// connect verbatim.
    pub async fn connect(&self, profile: &Profile) -> Result<(), ConsoleError> {
        let endpoint = match &profile.emulator {
            Some(config) => {
                let endpoint = self.emulators.ensure_ready(&profile.id, config).await?;
                Some(endpoint.address())
            }
            None => profile.endpoint.clone(),
        };

        let client = self
            .connector
            .connect(&profile.project_id, endpoint.as_deref())
            .await?;
        self.install(ConnectionHandle {
            client,
            project_id: profile.project_id.clone(),
        });
        Ok(())
    }

    /// Swap in a new active handle. The previous one is closed in the
    /// background with a bounded timeout; a close that outlives the bound is
    /// abandoned (the old connection's own cleanup reclaims it eventually)
    /// so a wedged transport can never block a fresh connection.
    pub fn install(&self, handle: ConnectionHandle) {
        let old = match self.active.write() {
            Ok(mut guard) => guard.replace(handle),
            Err(_) => return,
        };
        let Some(old) = old else { return };
        tokio::spawn(async move {
            match timeout(CLOSE_TIMEOUT, old.client.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        project = %old.project_id,
                        error = %err,
                        "closing replaced connection failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        project = %old.project_id,
                        "closing replaced connection timed out; handle abandoned"
                    );
                }
            }
        });
    }

    /// Close and clear the active handle. The handle is cleared before the
    /// close completes, so readers see "not connected" even while teardown
    /// drags; a close timeout is reported to the caller, who should treat
    /// the old connection as a possible zombie.
    pub async fn disconnect(&self) -> Result<(), ConsoleError> {
        let old = match self.active.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(old) = old else {
            return Ok(());
        };
        match timeout(CLOSE_TIMEOUT, old.client.close()).await {
            Ok(result) => result,
            Err(_) => Err(ConsoleError::CloseTimeout {
                timeout_ms: CLOSE_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.active.read().ok().and_then(|guard| guard.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn project_id(&self) -> Option<String> {
        self.active
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|handle| handle.project_id.clone()))
    }
}
