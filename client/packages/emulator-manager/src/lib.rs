//! Lifecycle management for locally-run Pub/Sub emulator instances.
//!
//! One instance per profile, named deterministically so an instance left
//! running by a previous session can be adopted instead of duplicated. The
//! bookkeeping map is guarded by a narrow lock; process spawning, readiness
//! probing, and teardown all happen outside it.

use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::time::{sleep, timeout};

use pubsub_console_error::ConsoleError;

pub mod docker;
pub mod testing;

pub const DEFAULT_PORT: u16 = 8085;
pub const DEFAULT_IMAGE: &str = "gcr.io/google.com/cloudsdktool/google-cloud-cli:emulators";
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const ALL_INTERFACES: &str = "0.0.0.0";

const EVENT_CHANNEL_SIZE: usize = 64;
const SUPERVISOR_RETIRE_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL: Duration = Duration::from_millis(100);

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Emulator instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Tracked state for one profile's emulator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulatorInstance {
    pub profile_id: String,
    pub container_name: String,
    /// Bind host of the instance, not necessarily the host to connect to.
    pub host: String,
    pub port: u16,
    pub status: EmulatorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmulatorInstance {
    /// Host a local client should dial. An instance bound to all interfaces
    /// is still reached over loopback.
    pub fn connect_host(&self) -> &str {
        if self.host == ALL_INTERFACES {
            DEFAULT_BIND_HOST
        } else {
            &self.host
        }
    }
}

/// Per-profile emulator settings as stored in a profile. Unset fields fall
/// back to the defaults when the instance is started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmulatorConfig {
    pub port: Option<u16>,
    pub image: Option<String>,
    /// Binding beyond localhost is an explicit opt-in.
    pub bind_all_interfaces: bool,
    /// Mounted into the instance for persistence across restarts.
    pub data_dir: Option<PathBuf>,
}

impl EmulatorConfig {
    pub fn resolve(&self) -> EffectiveSettings {
        EffectiveSettings {
            bind_host: if self.bind_all_interfaces {
                ALL_INTERFACES
            } else {
                DEFAULT_BIND_HOST
            }
            .to_string(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            image: self
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            data_dir: self.data_dir.clone(),
        }
    }
}

/// Emulator settings with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub bind_host: String,
    pub port: u16,
    pub image: String,
    pub data_dir: Option<PathBuf>,
}

impl EffectiveSettings {
    pub fn launch_spec(&self, name: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            image: self.image.clone(),
            bind_host: self.bind_host.clone(),
            port: self.port,
            data_dir: self.data_dir.clone(),
        }
    }

    pub fn probe_host(&self) -> &str {
        if self.bind_host == ALL_INTERFACES {
            DEFAULT_BIND_HOST
        } else {
            &self.bind_host
        }
    }
}

/// Arguments handed to the process runtime when launching an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub bind_host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
}

/// Where an externally-run instance stands according to the process runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalState {
    NotFound,
    Running,
    Exited,
}

/// Seam to the external process runtime. `runtime_available` is a preflight
/// that fails before any per-profile state is recorded; the rest operate on
/// a named instance.
pub trait ProcessControl: Send + Sync + 'static {
    fn runtime_available(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>>;

    fn inspect(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ExternalState, ConsoleError>> + Send + '_>>;

    fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>>;

    fn stop(
        &self,
        name: &str,
        grace: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>>;

    fn remove(
        &self,
        name: &str,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>>;
}

/// Readiness check against the instance's bound address.
pub trait ReadinessProbe: Send + Sync + 'static {
    fn ready(&self, host: &str, port: u16) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Probes over HTTP; any response at all means the listener is up.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl ReadinessProbe for HttpProbe {
    fn ready(&self, host: &str, port: u16) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let url = format!("http://{host}:{port}/");
        Box::pin(async move {
            self.client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
                .is_ok()
        })
    }
}

/// Notifications about background state changes of tracked instances.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EmulatorEvent {
    #[serde(rename_all = "camelCase")]
    Ready { profile_id: String },
    #[serde(rename_all = "camelCase")]
    Error { profile_id: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorManagerConfig {
    pub ready_attempts: usize,
    pub ready_interval: Duration,
    pub stop_grace: Duration,
    pub exit_poll_interval: Duration,
}

impl Default for EmulatorManagerConfig {
    fn default() -> Self {
        Self {
            ready_attempts: 30,
            ready_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            exit_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Host and port of a ready instance, as acknowledged by `ensure_ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorEndpoint {
    pub host: String,
    pub port: u16,
}

impl EmulatorEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct EmulatorManager {
    inner: Arc<Inner>,
}

struct Inner {
    control: Arc<dyn ProcessControl>,
    probe: Arc<dyn ReadinessProbe>,
    config: EmulatorManagerConfig,
    /// Serializes start/stop so racing callers cannot double-launch. Readers
    /// of the instance map are never blocked by it.
    start_lock: Mutex<()>,
    instances: StdMutex<HashMap<String, Tracked>>,
    events: broadcast::Sender<EmulatorEvent>,
}

struct Tracked {
    instance: EmulatorInstance,
    run_id: u64,
    cancel: watch::Sender<bool>,
    supervisor_done: Option<oneshot::Receiver<()>>,
}

impl EmulatorManager {
    pub fn new(control: Arc<dyn ProcessControl>, config: EmulatorManagerConfig) -> Self {
        Self::with_probe(control, Arc::new(HttpProbe::new()), config)
    }

    pub fn with_probe(
        control: Arc<dyn ProcessControl>,
        probe: Arc<dyn ReadinessProbe>,
        config: EmulatorManagerConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                control,
                probe,
                config,
                start_lock: Mutex::new(()),
                instances: StdMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmulatorEvent> {
        self.inner.events.subscribe()
    }

    /// Ensure an instance for this profile is up or coming up. No-op when one
    /// is already `Running` or `Starting`; adopts a matching externally-run
    /// instance; otherwise removes stale leftovers, verifies the port, and
    /// launches. Readiness is awaited asynchronously; observe it via
    /// `get_status` or wait with `ensure_ready`.
    pub async fn start(
        &self,
        profile_id: &str,
        config: &EmulatorConfig,
    ) -> Result<(), ConsoleError> {
        let _guard = self.inner.start_lock.lock().await;

        if matches!(
            self.status_of(profile_id),
            Some(EmulatorStatus::Starting | EmulatorStatus::Running)
        ) {
            return Ok(());
        }

        self.inner.control.runtime_available().await?;

        let settings = config.resolve();
        let name = instance_name(profile_id);

        match self.inner.control.inspect(&name).await? {
            ExternalState::Running => {
                // Left over from a prior session: reuse instead of spawning a twin.
                tracing::info!(
                    profile = %profile_id,
                    container = %name,
                    "adopting running emulator instance"
                );
                self.track_and_supervise(profile_id, &name, &settings, true);
                return Ok(());
            }
            ExternalState::Exited => {
                tracing::debug!(container = %name, "removing stale emulator container");
                self.inner.control.remove(&name, true).await?;
            }
            ExternalState::NotFound => {}
        }

        ensure_port_free(&settings.bind_host, settings.port)?;
        self.inner.control.launch(&settings.launch_spec(&name)).await?;
        tracing::info!(
            profile = %profile_id,
            container = %name,
            port = settings.port,
            "emulator launched; awaiting readiness"
        );
        self.track_and_supervise(profile_id, &name, &settings, false);
        Ok(())
    }

    /// Track an externally-running instance for this profile without ever
    /// launching one. Returns whether an instance was found.
    pub async fn adopt(
        &self,
        profile_id: &str,
        config: &EmulatorConfig,
    ) -> Result<bool, ConsoleError> {
        let _guard = self.inner.start_lock.lock().await;

        if matches!(
            self.status_of(profile_id),
            Some(EmulatorStatus::Starting | EmulatorStatus::Running)
        ) {
            return Ok(true);
        }

        self.inner.control.runtime_available().await?;

        let settings = config.resolve();
        let name = instance_name(profile_id);
        match self.inner.control.inspect(&name).await? {
            ExternalState::Running => {
                self.track_and_supervise(profile_id, &name, &settings, true);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Start if needed, then wait until the instance reports `Running`. This
    /// is the readiness acknowledgement connection setup relies on; failures
    /// carry the recorded instance error.
    pub async fn ensure_ready(
        &self,
        profile_id: &str,
        config: &EmulatorConfig,
    ) -> Result<EmulatorEndpoint, ConsoleError> {
        self.start(profile_id, config).await?;

        let wait_limit = self.inner.config.ready_interval * self.inner.config.ready_attempts as u32
            + Duration::from_secs(5);
        let started = tokio::time::Instant::now();
        loop {
            match self.get_status(profile_id) {
                Some(instance) if instance.status == EmulatorStatus::Running => {
                    return Ok(EmulatorEndpoint {
                        host: instance.connect_host().to_string(),
                        port: instance.port,
                    });
                }
                Some(instance) if instance.status == EmulatorStatus::Error => {
                    return Err(ConsoleError::EmulatorNotReady {
                        profile_id: profile_id.to_string(),
                        message: instance
                            .error
                            .unwrap_or_else(|| "emulator entered error state".to_string()),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(ConsoleError::EmulatorNotReady {
                        profile_id: profile_id.to_string(),
                        message: "emulator was stopped while waiting for readiness".to_string(),
                    });
                }
            }
            if started.elapsed() > wait_limit {
                return Err(ConsoleError::EmulatorNotReady {
                    profile_id: profile_id.to_string(),
                    message: "timed out waiting for the emulator to become ready".to_string(),
                });
            }
            sleep(READY_POLL).await;
        }
    }

    /// Tear down this profile's instance. No-op when nothing is tracked.
    /// Always ends with the bookkeeping for the profile cleared; teardown
    /// hiccups are logged, not returned, since force-remove already ran.
    pub async fn stop(&self, profile_id: &str) -> Result<(), ConsoleError> {
        let _guard = self.inner.start_lock.lock().await;

        let live = match self.inner.instances.lock() {
            Ok(mut instances) => match instances.get_mut(profile_id) {
                None => None,
                Some(tracked) if tracked.instance.status == EmulatorStatus::Stopped => {
                    instances.remove(profile_id);
                    None
                }
                Some(tracked) => {
                    tracked.instance.status = EmulatorStatus::Stopping;
                    let _ = tracked.cancel.send(true);
                    Some((
                        tracked.instance.container_name.clone(),
                        tracked.supervisor_done.take(),
                    ))
                }
            },
            Err(_) => None,
        };
        let Some((name, supervisor_done)) = live else {
            return Ok(());
        };

        if let Some(done) = supervisor_done {
            let _ = timeout(SUPERVISOR_RETIRE_TIMEOUT, done).await;
        }

        if let Err(err) = self
            .inner
            .control
            .stop(&name, self.inner.config.stop_grace)
            .await
        {
            tracing::warn!(container = %name, error = %err, "cooperative emulator stop failed");
        }
        match self.inner.control.inspect(&name).await {
            Ok(ExternalState::Running) => {
                if let Err(err) = self.inner.control.remove(&name, true).await {
                    tracing::warn!(container = %name, error = %err, "force removing emulator failed");
                }
            }
            Ok(ExternalState::Exited) => {
                if let Err(err) = self.inner.control.remove(&name, false).await {
                    tracing::debug!(container = %name, error = %err, "removing stopped emulator failed");
                }
            }
            Ok(ExternalState::NotFound) => {}
            Err(err) => {
                tracing::warn!(container = %name, error = %err, "post-stop inspection failed")
            }
        }

        if let Ok(mut instances) = self.inner.instances.lock() {
            instances.remove(profile_id);
        }
        Ok(())
    }

    /// Stop every tracked instance; used at application shutdown.
    pub async fn stop_all(&self) {
        let profiles: Vec<String> = match self.inner.instances.lock() {
            Ok(instances) => instances.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        let results = join_all(profiles.iter().map(|profile_id| self.stop(profile_id))).await;
        for (profile_id, result) in profiles.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(profile = %profile_id, error = %err, "emulator did not stop cleanly");
            }
        }
    }

    /// Snapshot of the tracked instance. Mutating the returned value has no
    /// effect on internal state.
    pub fn get_status(&self, profile_id: &str) -> Option<EmulatorInstance> {
        self.inner
            .instances
            .lock()
            .ok()
            .and_then(|instances| instances.get(profile_id).map(|t| t.instance.clone()))
    }

    pub fn is_running(&self, profile_id: &str) -> bool {
        self.status_of(profile_id) == Some(EmulatorStatus::Running)
    }

    fn status_of(&self, profile_id: &str) -> Option<EmulatorStatus> {
        self.get_status(profile_id).map(|instance| instance.status)
    }

    fn track_and_supervise(
        &self,
        profile_id: &str,
        name: &str,
        settings: &EffectiveSettings,
        adopted: bool,
    ) {
        let run_id = RUN_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let instance = EmulatorInstance {
            profile_id: profile_id.to_string(),
            container_name: name.to_string(),
            host: settings.bind_host.clone(),
            port: settings.port,
            status: if adopted {
                EmulatorStatus::Running
            } else {
                EmulatorStatus::Starting
            },
            error: None,
        };
        if let Ok(mut instances) = self.inner.instances.lock() {
            // Replacing a stale entry drops its cancel sender, which retires
            // the old supervisor.
            instances.insert(
                profile_id.to_string(),
                Tracked {
                    instance,
                    run_id,
                    cancel: cancel_tx,
                    supervisor_done: Some(done_rx),
                },
            );
        }

        self.spawn_supervisor(
            profile_id.to_string(),
            name.to_string(),
            settings.probe_host().to_string(),
            settings.port,
            run_id,
            !adopted,
            cancel_rx,
            done_tx,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_supervisor(
        &self,
        profile_id: String,
        name: String,
        probe_host: String,
        port: u16,
        run_id: u64,
        await_ready: bool,
        mut cancel: watch::Receiver<bool>,
        done: oneshot::Sender<()>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Dropped on every exit path so `stop` can observe retirement.
            let _done = done;

            if *cancel.borrow() {
                return;
            }

            if await_ready {
                let mut ready = false;
                for _ in 0..manager.inner.config.ready_attempts {
                    if manager.inner.probe.ready(&probe_host, port).await {
                        ready = true;
                        break;
                    }
                    tokio::select! {
                        _ = sleep(manager.inner.config.ready_interval) => {}
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                return;
                            }
                        }
                    }
                }
                if *cancel.borrow() {
                    return;
                }
                if !ready {
                    manager.record_error(
                        &profile_id,
                        run_id,
                        &format!(
                            "no readiness response from {probe_host}:{port} after {} probes",
                            manager.inner.config.ready_attempts
                        ),
                    );
                    return;
                }
                if !manager.mark_running(&profile_id, run_id) {
                    return;
                }
            }

            let _ = manager.inner.events.send(EmulatorEvent::Ready {
                profile_id: profile_id.clone(),
            });

            loop {
                tokio::select! {
                    _ = sleep(manager.inner.config.exit_poll_interval) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return;
                        }
                    }
                }
                match manager.inner.control.inspect(&name).await {
                    Ok(ExternalState::Running) => {}
                    Ok(_) => {
                        manager.record_exit(&profile_id, run_id);
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(container = %name, error = %err, "instance inspection failed");
                    }
                }
            }
        });
    }

    fn mark_running(&self, profile_id: &str, run_id: u64) -> bool {
        if let Ok(mut instances) = self.inner.instances.lock() {
            if let Some(tracked) = instances.get_mut(profile_id) {
                if tracked.run_id == run_id && tracked.instance.status == EmulatorStatus::Starting {
                    tracked.instance.status = EmulatorStatus::Running;
                    tracked.instance.error = None;
                    return true;
                }
            }
        }
        false
    }

    /// Record a readiness failure, but only while the instance is still
    /// `Starting` for the same run; a state that moved on for another reason
    /// is left alone.
    fn record_error(&self, profile_id: &str, run_id: u64, message: &str) {
        let mut recorded = false;
        if let Ok(mut instances) = self.inner.instances.lock() {
            if let Some(tracked) = instances.get_mut(profile_id) {
                if tracked.run_id == run_id && tracked.instance.status == EmulatorStatus::Starting {
                    tracked.instance.status = EmulatorStatus::Error;
                    tracked.instance.error = Some(message.to_string());
                    recorded = true;
                }
            }
        }
        if recorded {
            tracing::warn!(profile = %profile_id, error = %message, "emulator failed to become ready");
            let _ = self.inner.events.send(EmulatorEvent::Error {
                profile_id: profile_id.to_string(),
                message: message.to_string(),
            });
        }
    }

    fn record_exit(&self, profile_id: &str, run_id: u64) {
        let message = "emulator exited unexpectedly";
        let mut recorded = false;
        if let Ok(mut instances) = self.inner.instances.lock() {
            if let Some(tracked) = instances.get_mut(profile_id) {
                if tracked.run_id == run_id
                    && matches!(
                        tracked.instance.status,
                        EmulatorStatus::Running | EmulatorStatus::Starting
                    )
                {
                    tracked.instance.status = EmulatorStatus::Error;
                    tracked.instance.error = Some(message.to_string());
                    recorded = true;
                }
            }
        }
        if recorded {
            tracing::warn!(profile = %profile_id, "emulator exited unexpectedly");
            let _ = self.inner.events.send(EmulatorEvent::Error {
                profile_id: profile_id.to_string(),
                message: message.to_string(),
            });
        }
    }
}

/// Deterministic instance name for a profile. Pure, so adoption of an
/// existing instance and name-based cleanup are testable without the
/// process layer.
pub fn instance_name(profile_id: &str) -> String {
    let sanitized: String = profile_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("pubsub-emulator-{sanitized}")
}

fn ensure_port_free(host: &str, port: u16) -> Result<(), ConsoleError> {
    match TcpListener::bind((host, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(ConsoleError::PortInUse { port }),
    }
}
