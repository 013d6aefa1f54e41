//! In-memory process control and probe doubles for lifecycle tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use pubsub_console_error::ConsoleError;

use crate::{ExternalState, LaunchSpec, ProcessControl, ReadinessProbe};

#[derive(Default)]
struct ControlState {
    runtime_error: Option<String>,
    launch_error: Option<String>,
    /// Container name -> running flag.
    containers: HashMap<String, bool>,
    launches: Vec<LaunchSpec>,
    stops: Vec<String>,
    removes: Vec<(String, bool)>,
}

/// Scripted process runtime: containers are rows in a map, launches and
/// teardowns are recorded for assertions.
#[derive(Default)]
pub struct MockProcessControl {
    state: StdMutex<ControlState>,
}

impl MockProcessControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `runtime_available` fail, simulating a missing or unreachable daemon.
    pub fn deny_runtime(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.runtime_error = Some(message.to_string());
        }
    }

    pub fn fail_next_launch(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.launch_error = Some(message.to_string());
        }
    }

    /// Seed a container as if something outside this process created it.
    pub fn add_container(&self, name: &str, running: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.containers.insert(name.to_string(), running);
        }
    }

    /// Simulate the instance dying out from under the manager.
    pub fn mark_exited(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(running) = state.containers.get_mut(name) {
                *running = false;
            }
        }
    }

    pub fn container_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.containers.get(name).copied())
            .unwrap_or(false)
    }

    pub fn container_exists(&self, name: &str) -> bool {
        self.state
            .lock()
            .ok()
            .map(|state| state.containers.contains_key(name))
            .unwrap_or(false)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state
            .lock()
            .map(|state| state.launches.clone())
            .unwrap_or_default()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.stops.clone())
            .unwrap_or_default()
    }

    pub fn removes(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .map(|state| state.removes.clone())
            .unwrap_or_default()
    }
}

impl ProcessControl for MockProcessControl {
    fn runtime_available(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        Box::pin(async move {
            let denial = self
                .state
                .lock()
                .ok()
                .and_then(|state| state.runtime_error.clone());
            match denial {
                Some(message) => Err(ConsoleError::EmulatorUnavailable { message }),
                None => Ok(()),
            }
        })
    }

    fn inspect(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ExternalState, ConsoleError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let found = self
                .state
                .lock()
                .ok()
                .and_then(|state| state.containers.get(&name).copied());
            Ok(match found {
                None => ExternalState::NotFound,
                Some(true) => ExternalState::Running,
                Some(false) => ExternalState::Exited,
            })
        })
    }

    fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let spec = spec.clone();
        Box::pin(async move {
            if let Ok(mut state) = self.state.lock() {
                if let Some(message) = state.launch_error.take() {
                    return Err(ConsoleError::ProcessControl { message });
                }
                state.containers.insert(spec.name.clone(), true);
                state.launches.push(spec);
            }
            Ok(())
        })
    }

    fn stop(
        &self,
        name: &str,
        _grace: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            if let Ok(mut state) = self.state.lock() {
                if let Some(running) = state.containers.get_mut(&name) {
                    *running = false;
                }
                state.stops.push(name);
            }
            Ok(())
        })
    }

    fn remove(
        &self,
        name: &str,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            if let Ok(mut state) = self.state.lock() {
                state.containers.remove(&name);
                state.removes.push((name, force));
            }
            Ok(())
        })
    }
}

/// Probe that reports ready after a configurable number of checks.
pub struct MockProbe {
    ready_after: usize,
    checks: AtomicUsize,
}

impl MockProbe {
    /// Ready on the first check.
    pub fn ready() -> Arc<Self> {
        Self::after(0)
    }

    /// Never reports ready, forcing the readiness attempts to run out.
    pub fn never() -> Arc<Self> {
        Self::after(usize::MAX)
    }

    /// Ready once `failures` checks have failed.
    pub fn after(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            ready_after: failures,
            checks: AtomicUsize::new(0),
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl ReadinessProbe for MockProbe {
    fn ready(&self, _host: &str, _port: u16) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let check = self.checks.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { check >= self.ready_after })
    }
}
