#![deny(unsafe_code)]

//! Warden CLI: runs the daemon and talks to it over its control socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use warden_config::AppConfig;
use warden_core::ipc::DaemonStatus;
use warden_core::signals::parse_forwardable;
use warden_core::{
    Daemon, IpcClient, RemoteCommandSession, SessionError, SignalForwarder, Termination,
};

/// Exit status for a session ended by local cancellation.
const EXIT_CANCELLED: i32 = 130;

/// Warden: a privileged network daemon and its control plane.
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/warden/warden.toml")]
    config: PathBuf,

    /// Control socket to talk to, overriding `daemon.socket_path`.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (requires root).
    Service,

    /// Show the daemon's API and build version.
    Version,

    /// Show whether the network override is active.
    Status,

    /// Release the network override.
    Pause,

    /// Reinstall the network override.
    Resume,

    /// Ask the daemon to shut down.
    Quit,

    /// Append lines from standard input to the daemon's log.
    Log,

    /// Run a command inside the daemon's context.
    ///
    /// Everything after `run` is passed through unparsed.
    Run {
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "COMMAND"
        )]
        args: Vec<String>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = load_config(&cli.config).await?;
    let config = loaded.clone().unwrap_or_default();

    // Set up tracing subscriber with verbosity level
    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if loaded.is_none() {
        debug!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.daemon.socket_path.clone());
    let client = IpcClient::new(&socket);

    match cli.command {
        Commands::Service => cmd_service(config).await?,
        Commands::Version => cmd_version(&client).await?,
        Commands::Status => cmd_status(&client).await?,
        Commands::Pause => cmd_pause(&client).await?,
        Commands::Resume => cmd_resume(&client).await?,
        Commands::Quit => cmd_quit(&client).await?,
        Commands::Log => cmd_log(&client).await?,
        Commands::Run { args } => {
            let code = cmd_run(&client, &config, args).await?;
            // Local stdin is read on a blocking thread that would otherwise
            // hold the runtime open until the next line of input.
            std::process::exit(code);
        }
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_service(config: AppConfig) -> Result<()> {
    info!("Starting warden daemon");
    Daemon::new(config).run().await?;
    Ok(())
}

async fn cmd_version(client: &IpcClient) -> Result<()> {
    let version = client.version().await?;
    println!("client: {}", warden_core::build_info::version_string());
    println!(
        "daemon: {} (API {})",
        version.version, version.api_version
    );
    Ok(())
}

async fn cmd_status(client: &IpcClient) -> Result<()> {
    let status = client.status().await?.status;
    println!("{status}");
    if status == DaemonStatus::NoNetwork {
        anyhow::bail!("network override is installed but not working");
    }
    Ok(())
}

async fn cmd_pause(client: &IpcClient) -> Result<()> {
    client.pause().await?.into_result()?;
    println!("Network override paused");
    Ok(())
}

async fn cmd_resume(client: &IpcClient) -> Result<()> {
    client.resume().await?.into_result()?;
    println!("Network override resumed");
    Ok(())
}

async fn cmd_quit(client: &IpcClient) -> Result<()> {
    let resp = client.quit().await?;
    println!("{}", resp.message);
    Ok(())
}

async fn cmd_log(client: &IpcClient) -> Result<()> {
    let resp = client.logger(tokio::io::stdin()).await?;
    debug!(lines = resp.lines, "log lines delivered");
    Ok(())
}

async fn cmd_run(client: &IpcClient, config: &AppConfig, args: Vec<String>) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let signals = parse_forwardable(&config.session.forward_signals)?;
    let forwarder = SignalForwarder::listen(&signals).context("cannot listen for signals")?;

    let stream = client.run_command().await?;
    let session = RemoteCommandSession::stdio()
        .with_interrupts(forwarder.subscribe())
        .with_grace_period(config.session.grace_period())
        .with_chunk_size(config.session.stdin_chunk_size);

    match session.run(stream, args, cwd).await {
        Ok(Termination::Completed) => Ok(0),
        Ok(Termination::Cancelled) => Ok(EXIT_CANCELLED),
        Ok(Termination::HardCancelled) => {
            eprintln!("warden: remote command did not stop in time, giving up");
            Ok(EXIT_CANCELLED)
        }
        Err(SessionError::Remote(err)) => {
            eprintln!("warden: {err}");
            Ok(i32::try_from(err.category.code()).unwrap_or(1).max(1))
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or `None` if it does not exist.
async fn load_config(path: &Path) -> Result<Option<AppConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let config = AppConfig::load(path)
        .await
        .with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(Some(config))
}
