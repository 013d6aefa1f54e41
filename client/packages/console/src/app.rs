//! Composition root: wires the connection, monitoring, and emulator
//! components and exposes the caller-facing API.

use std::sync::Arc;

use tokio::sync::broadcast;

use pubsub_console_emulator_manager::{
    EmulatorConfig, EmulatorEvent, EmulatorInstance, EmulatorManager, EmulatorManagerConfig,
    ProcessControl,
};
use pubsub_console_error::ConsoleError;

use crate::buffer::BufferedMessage;
use crate::connection::{ConnectionManager, Connector};
use crate::events::{ConsoleEvent, EventBus};
use crate::monitor::MonitorManager;
use crate::profile::Profile;

/// The console core as seen by the application shell. Construct inside a
/// Tokio runtime; background tasks are spawned onto it.
pub struct Console {
    connection: Arc<ConnectionManager>,
    monitors: Arc<MonitorManager>,
    emulators: EmulatorManager,
    events: EventBus,
}

impl Console {
    pub fn new(connector: Arc<dyn Connector>, control: Arc<dyn ProcessControl>) -> Self {
        Self::with_emulator_config(connector, control, EmulatorManagerConfig::default())
    }

    pub fn with_emulator_config(
        connector: Arc<dyn Connector>,
        control: Arc<dyn ProcessControl>,
        config: EmulatorManagerConfig,
    ) -> Self {
        let events = EventBus::new();
        let emulators = EmulatorManager::new(control, config);
        Self::assemble(connector, emulators, events)
    }

    /// Wire up around an existing emulator manager (tests inject a probed
    /// one here).
    pub fn with_emulators(connector: Arc<dyn Connector>, emulators: EmulatorManager) -> Self {
        Self::assemble(connector, emulators, EventBus::new())
    }

    fn assemble(
        connector: Arc<dyn Connector>,
        emulators: EmulatorManager,
        events: EventBus,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(connector, emulators.clone()));
        let monitors = Arc::new(MonitorManager::new(connection.clone(), events.clone()));
        spawn_emulator_bridge(emulators.subscribe(), events.clone());
        Self {
            connection,
            monitors,
            emulators,
            events,
        }
    }

    /// Connect with a profile, retiring every monitor first so nothing from
    /// the previous project leaks into the new one.
    pub async fn connect(&self, profile: &Profile) -> Result<(), ConsoleError> {
        self.monitors.reset().await;
        self.connection.connect(profile).await
    }

    pub async fn disconnect(&self) -> Result<(), ConsoleError> {
        self.monitors.reset().await;
        self.connection.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn project_id(&self) -> Option<String> {
        self.connection.project_id()
    }

    pub fn start_monitor(&self, subscription_id: &str, auto_ack: bool) -> Result<(), ConsoleError> {
        self.monitors.start_stream(subscription_id, auto_ack)
    }

    pub async fn stop_monitor(&self, subscription_id: &str) -> Result<(), ConsoleError> {
        self.monitors.stop_stream(subscription_id).await
    }

    pub fn set_auto_ack(&self, subscription_id: &str, enabled: bool) {
        self.monitors.set_auto_ack(subscription_id, enabled);
    }

    pub fn buffered_messages(&self, subscription_id: &str) -> Vec<BufferedMessage> {
        self.monitors.get_buffer(subscription_id)
    }

    pub fn set_buffer_limit(&self, subscription_id: &str, max_size: usize) {
        self.monitors.set_buffer_limit(subscription_id, max_size);
    }

    pub async fn emulator_start(
        &self,
        profile_id: &str,
        config: &EmulatorConfig,
    ) -> Result<(), ConsoleError> {
        self.emulators.start(profile_id, config).await
    }

    pub async fn emulator_stop(&self, profile_id: &str) -> Result<(), ConsoleError> {
        self.emulators.stop(profile_id).await
    }

    pub fn emulator_status(&self, profile_id: &str) -> Option<EmulatorInstance> {
        self.emulators.get_status(profile_id)
    }

    pub async fn emulator_stop_all(&self) {
        self.emulators.stop_all().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    pub fn monitors(&self) -> &MonitorManager {
        &self.monitors
    }

    pub fn emulators(&self) -> &EmulatorManager {
        &self.emulators
    }
}

fn spawn_emulator_bridge(mut source: broadcast::Receiver<EmulatorEvent>, events: EventBus) {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(EmulatorEvent::Ready { profile_id }) => {
                    events.emit(ConsoleEvent::EmulatorReady { profile_id });
                }
                Ok(EmulatorEvent::Error {
                    profile_id,
                    message,
                }) => {
                    events.emit(ConsoleEvent::EmulatorError {
                        profile_id,
                        message,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
