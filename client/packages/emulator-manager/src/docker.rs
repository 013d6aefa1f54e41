//! Docker-backed [`ProcessControl`] driving the `docker` CLI.

use std::future::Future;
use std::pin::Pin;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use pubsub_console_error::ConsoleError;

use crate::{ExternalState, LaunchSpec, ProcessControl};

/// Port the emulator listens on inside the container; the requested host
/// port is published onto it.
const EMULATOR_INTERNAL_PORT: u16 = 8085;
const EMULATOR_DATA_MOUNT: &str = "/var/pubsub-data";

#[derive(Debug, Clone)]
pub struct DockerControl {
    binary: String,
}

impl DockerControl {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use an alternate CLI, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ConsoleError> {
        Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|err| ConsoleError::EmulatorUnavailable {
                message: format!("container runtime not found ({}): {err}", self.binary),
            })
    }
}

impl Default for DockerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for DockerControl {
    fn runtime_available(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        Box::pin(async move {
            let output = self
                .run(vec![
                    "version".to_string(),
                    "--format".to_string(),
                    "{{.Server.Version}}".to_string(),
                ])
                .await?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ConsoleError::EmulatorUnavailable {
                    message: format!("container daemon unreachable: {}", stderr_message(&output)),
                })
            }
        })
    }

    fn inspect(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ExternalState, ConsoleError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let output = self
                .run(vec![
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Running}}".to_string(),
                    name,
                ])
                .await?;
            if !output.status.success() {
                let stderr = stderr_message(&output);
                if stderr.contains("No such object") || stderr.contains("No such container") {
                    return Ok(ExternalState::NotFound);
                }
                return Err(ConsoleError::ProcessControl {
                    message: format!("inspect failed: {stderr}"),
                });
            }
            let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
            Ok(if running {
                ExternalState::Running
            } else {
                ExternalState::Exited
            })
        })
    }

    fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let args = launch_args(spec);
        Box::pin(async move {
            let output = self.run(args).await?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ConsoleError::ProcessControl {
                    message: format!("launch failed: {}", stderr_message(&output)),
                })
            }
        })
    }

    fn stop(
        &self,
        name: &str,
        grace: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().max(1).to_string(),
            name.to_string(),
        ];
        Box::pin(async move {
            let output = self.run(args).await?;
            if output.status.success() || is_missing(&output) {
                Ok(())
            } else {
                Err(ConsoleError::ProcessControl {
                    message: format!("stop failed: {}", stderr_message(&output)),
                })
            }
        })
    }

    fn remove(
        &self,
        name: &str,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsoleError>> + Send + '_>> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        Box::pin(async move {
            let output = self.run(args).await?;
            if output.status.success() || is_missing(&output) {
                Ok(())
            } else {
                Err(ConsoleError::ProcessControl {
                    message: format!("remove failed: {}", stderr_message(&output)),
                })
            }
        })
    }
}

/// `docker run` arguments for an emulator instance. Kept separate so the
/// launch contract (bind address, published port, data mount, name) is
/// testable without a daemon.
fn launch_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--publish".to_string(),
        format!(
            "{}:{}:{}",
            spec.bind_host, spec.port, EMULATOR_INTERNAL_PORT
        ),
    ];
    if let Some(data_dir) = &spec.data_dir {
        args.push("--volume".to_string());
        args.push(format!("{}:{}", data_dir.display(), EMULATOR_DATA_MOUNT));
    }
    args.push(spec.image.clone());
    args.extend(
        [
            "gcloud",
            "beta",
            "emulators",
            "pubsub",
            "start",
            "--host-port",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    args.push(format!("0.0.0.0:{EMULATOR_INTERNAL_PORT}"));
    if spec.data_dir.is_some() {
        args.push("--data-dir".to_string());
        args.push(EMULATOR_DATA_MOUNT.to_string());
    }
    args
}

fn stderr_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("{}", output.status)
    } else {
        trimmed.to_string()
    }
}

fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("No such container") || stderr.contains("No such object")
}
