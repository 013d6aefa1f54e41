use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NotConnected,
    ConnectFailed,
    CloseTimeout,
    StreamFailed,
    StopTimeout,
    EmulatorUnavailable,
    PortInUse,
    EmulatorNotReady,
    ProcessControl,
}

impl ErrorType {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::ConnectFailed => "connect_failed",
            Self::CloseTimeout => "close_timeout",
            Self::StreamFailed => "stream_failed",
            Self::StopTimeout => "stop_timeout",
            Self::EmulatorUnavailable => "emulator_unavailable",
            Self::PortInUse => "port_in_use",
            Self::EmulatorNotReady => "emulator_not_ready",
            Self::ProcessControl => "process_control",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::NotConnected => "Not Connected",
            Self::ConnectFailed => "Connect Failed",
            Self::CloseTimeout => "Close Timed Out",
            Self::StreamFailed => "Stream Failed",
            Self::StopTimeout => "Stop Timed Out",
            Self::EmulatorUnavailable => "Emulator Unavailable",
            Self::PortInUse => "Port In Use",
            Self::EmulatorNotReady => "Emulator Not Ready",
            Self::ProcessControl => "Process Control Failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {message}")]
    ConnectFailed { message: String },
    #[error("connection close timed out after {timeout_ms}ms")]
    CloseTimeout { timeout_ms: u64 },
    #[error("stream failed for {subscription_id}: {message}")]
    StreamFailed {
        subscription_id: String,
        message: String,
    },
    #[error("stop timed out for {subscription_id}")]
    StopTimeout { subscription_id: String },
    #[error("emulator runtime unavailable: {message}")]
    EmulatorUnavailable { message: String },
    #[error("port {port} already in use")]
    PortInUse { port: u16 },
    #[error("emulator not ready for {profile_id}: {message}")]
    EmulatorNotReady {
        profile_id: String,
        message: String,
    },
    #[error("process control failed: {message}")]
    ProcessControl { message: String },
}

impl ConsoleError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::NotConnected => ErrorType::NotConnected,
            Self::ConnectFailed { .. } => ErrorType::ConnectFailed,
            Self::CloseTimeout { .. } => ErrorType::CloseTimeout,
            Self::StreamFailed { .. } => ErrorType::StreamFailed,
            Self::StopTimeout { .. } => ErrorType::StopTimeout,
            Self::EmulatorUnavailable { .. } => ErrorType::EmulatorUnavailable,
            Self::PortInUse { .. } => ErrorType::PortInUse,
            Self::EmulatorNotReady { .. } => ErrorType::EmulatorNotReady,
            Self::ProcessControl { .. } => ErrorType::ProcessControl,
        }
    }

    /// Message shown to the user. Connection problems need a next step,
    /// stream problems are transient (the service redelivers), emulator
    /// problems surface the recorded instance error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected => {
                "No active connection. Connect to a profile first.".to_string()
            }
            Self::ConnectFailed { message } => {
                format!("Could not connect: {message}. Check the profile's project and credentials.")
            }
            Self::CloseTimeout { timeout_ms } => format!(
                "The previous connection did not close within {timeout_ms}ms and was abandoned."
            ),
            Self::StreamFailed {
                subscription_id,
                message,
            } => format!(
                "Monitoring {subscription_id} was interrupted ({message}). Undelivered messages will be redelivered."
            ),
            Self::StopTimeout { subscription_id } => format!(
                "Stopping the monitor for {subscription_id} timed out; the stream is still winding down."
            ),
            Self::EmulatorUnavailable { message } => format!(
                "The container runtime is unavailable: {message}. Start Docker and try again."
            ),
            Self::PortInUse { port } => format!(
                "Port {port} is already in use. Pick another port in the profile's emulator settings."
            ),
            Self::EmulatorNotReady {
                profile_id,
                message,
            } => format!("The emulator for {profile_id} failed to become ready: {message}"),
            Self::ProcessControl { message } => message.clone(),
        }
    }
}

/// Terminal outcome of a streaming pull, as reported by the receive seam.
/// The stream loop treats `NotFound` as an expected teardown race and
/// anything else as unexpected unless its own cancellation token fired.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("subscription not found: {subscription_id}")]
    NotFound { subscription_id: String },
    #[error("receive stream failed: {message}")]
    Stream { message: String },
}

impl ReceiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
