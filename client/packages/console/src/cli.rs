//! Command-line entry for driving the emulator lifecycle headlessly.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pubsub_console_emulator_manager::docker::DockerControl;
use pubsub_console_emulator_manager::{EmulatorConfig, EmulatorManager, EmulatorManagerConfig};
use pubsub_console_error::ConsoleError;

#[derive(Parser, Debug)]
#[command(name = "pubsub-console", bin_name = "pubsub-console")]
#[command(about = "Pub/Sub console core utilities", version)]
#[command(arg_required_else_help = true)]
pub struct ConsoleCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage local Pub/Sub emulator instances.
    Emulator(EmulatorArgs),
}

#[derive(Args, Debug)]
pub struct EmulatorArgs {
    #[command(subcommand)]
    command: EmulatorCommand,
}

#[derive(Subcommand, Debug)]
pub enum EmulatorCommand {
    /// Start the emulator for a profile and wait until it is ready.
    Start(EmulatorStartArgs),
    /// Stop the emulator for a profile.
    Stop { profile: String },
    /// Print the tracked emulator status for a profile as JSON.
    Status { profile: String },
    /// Stop every tracked emulator instance.
    StopAll,
}

#[derive(Args, Debug)]
pub struct EmulatorStartArgs {
    profile: String,

    #[arg(long, short = 'p')]
    port: Option<u16>,

    #[arg(long)]
    image: Option<String>,

    /// Bind to all interfaces instead of localhost only.
    #[arg(long = "bind-all")]
    bind_all: bool,

    /// Mount this directory into the instance for persistence.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Persist under the default data directory for the profile.
    #[arg(long, conflicts_with = "data_dir")]
    persist: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

pub fn run_console() -> Result<(), CliError> {
    let cli = ConsoleCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: &Command) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let manager = EmulatorManager::new(
            Arc::new(DockerControl::new()),
            EmulatorManagerConfig::default(),
        );
        match command {
            Command::Emulator(args) => run_emulator(&manager, &args.command).await,
        }
    })
}

async fn run_emulator(
    manager: &EmulatorManager,
    command: &EmulatorCommand,
) -> Result<(), CliError> {
    match command {
        EmulatorCommand::Start(args) => {
            let config = EmulatorConfig {
                port: args.port,
                image: args.image.clone(),
                bind_all_interfaces: args.bind_all,
                data_dir: args
                    .data_dir
                    .clone()
                    .or_else(|| args.persist.then(|| default_data_dir(&args.profile))),
            };
            let endpoint = manager.ensure_ready(&args.profile, &config).await?;
            println!("emulator ready at {}", endpoint.address());
            Ok(())
        }
        EmulatorCommand::Stop { profile } => {
            // A one-shot process starts with empty bookkeeping; adopt a
            // running instance first so the stop actually reaches it.
            manager.adopt(profile, &EmulatorConfig::default()).await?;
            manager.stop(profile).await?;
            println!("emulator stopped");
            Ok(())
        }
        EmulatorCommand::Status { profile } => {
            match manager.get_status(profile) {
                Some(instance) => println!("{}", serde_json::to_string_pretty(&instance)?),
                None => println!("not tracked"),
            }
            Ok(())
        }
        EmulatorCommand::StopAll => {
            manager.stop_all().await;
            Ok(())
        }
    }
}

fn default_data_dir(profile: &str) -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("pubsub-console").join("emulator").join(profile))
        .unwrap_or_else(|| PathBuf::from(".").join(".pubsub-console").join(profile))
}
