use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use handoff_server::http::X_REQUEST_ID;
use handoff_server::upgrade::read_pid_file;

#[derive(Parser)]
#[command(name = "handoffctl")]
#[command(about = "Management CLI for handoff-server", long_about = None)]
struct Cli {
    /// Pid file written by the server generation that owns the listeners.
    #[arg(short, long, default_value = "/run/handoff-server.pid")]
    pid_file: PathBuf,

    /// Base URL of the server.
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a successor and hand over the listeners (SIGHUP)
    Upgrade,
    /// Drain and stop the current generation (SIGTERM)
    Stop,
    /// Show the current pid and probe GET /
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Upgrade => {
            let pid = signal_server(&cli.pid_file, Signal::SIGHUP)?;
            println!("Sent SIGHUP to {pid}; watch {} for the successor pid", cli.pid_file.display());
        }
        Commands::Stop => {
            let pid = signal_server(&cli.pid_file, Signal::SIGTERM)?;
            println!("Sent SIGTERM to {pid}");
        }
        Commands::Status => {
            match read_pid_file(&cli.pid_file) {
                Ok(pid) => println!("pid: {pid}"),
                Err(e) => println!("pid: unknown ({e})"),
            }

            let res = reqwest::Client::new().get(format!("{}/", cli.url)).send().await?;
            let status = res.status();
            let request_id = res
                .headers()
                .get(X_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            let body = res.text().await?;

            println!("status: {status}");
            println!("request id: {request_id}");
            println!("body: {body}");

            if !status.is_success() {
                return Err(format!("server answered {status}").into());
            }
        }
    }

    Ok(())
}

fn signal_server(pid_file: &std::path::Path, signal: Signal) -> Result<u32, Box<dyn std::error::Error>> {
    let pid = read_pid_file(pid_file)
        .map_err(|e| format!("cannot read pid file {}: {e}", pid_file.display()))?;
    let raw = i32::try_from(pid)?;
    kill(Pid::from_raw(raw), signal)?;
    Ok(pid)
}
