use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use handoff_server::config::{load_config, validate_config, LogFormat, ServerConfig};
use handoff_server::http::build_router;
use handoff_server::lifecycle::{run_generation, signals};
use handoff_server::observability::init_logging;
use handoff_server::upgrade::{Coordinator, ExecSpawner};

#[derive(Parser, Debug)]
#[command(name = "handoff-server")]
#[command(about = "HTTP server with zero-downtime upgrades (SIGHUP to upgrade)", long_about = None)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.address.
    #[arg(long)]
    address: Option<String>,

    /// Override upgrade.drain_timeout_secs.
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Override upgrade.pid_file.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Override logging.format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(address) = &self.address {
            config.listener.address = address.clone();
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.upgrade.drain_timeout_secs = secs;
        }
        if let Some(path) = &self.pid_file {
            config.upgrade.pid_file = Some(path.clone());
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

fn load(cli: &Cli) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(errors) = validate_config(&config) {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(format!("invalid configuration: {}", joined.join(", ")).into());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Before anything slow: an early SIGHUP must not hit the default action.
    let (events, _signal_task) = match signals::listen() {
        Ok(listening) => listening,
        Err(e) => {
            eprintln!("handoff-server: failed to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("handoff-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("handoff-server: {e}");
        return ExitCode::FAILURE;
    }

    match run(config, events).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: ServerConfig,
    events: mpsc::Receiver<signals::ControlEvent>,
) -> Result<u8, Box<dyn std::error::Error>> {
    let spawner = match &config.upgrade.executable {
        Some(program) => ExecSpawner::new(program, std::env::args_os().skip(1)),
        None => ExecSpawner::current_process()?,
    };

    let coordinator = Arc::new(Coordinator::from_env(
        config.upgrade.settings(),
        config.listener.backlog,
        Box::new(spawner.clone()),
    )?);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        successor = coordinator.is_successor(),
        parent_pid = coordinator.parent_pid(),
        executable = %spawner.program().display(),
        address = %config.listener.address,
        drain_timeout_secs = config.upgrade.drain_timeout_secs,
        "handoff-server starting"
    );

    let router = build_router(&config.http);

    let exit = run_generation(&config, coordinator, router, events).await?;

    tracing::info!(
        outcome = ?exit,
        exit_code = exit.exit_code(),
        pid = std::process::id(),
        "Shutdown complete"
    );
    Ok(u8::try_from(exit.exit_code()).unwrap_or(1))
}
