//! Sluice Tunnel
//!
//! Carries TCP connections over plain HTTP request/response exchanges so they
//! survive networks that only let HTTP through, possibly via a forward proxy.
//!
//! The same binary runs both halves:
//! - `sluice client` - a local HTTP proxy that applications point at
//! - `sluice server` - the relay that dials the real targets

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod client;
mod config;
mod error;
mod protocol;
mod server;
mod transport;

use auth::Credentials;
use client::{ClientSettings, TunnelClient};
use config::{Config, DEFAULT_CLIENT_LISTEN, DEFAULT_SERVER_LISTEN, DEFAULT_SERVER_URL};
use protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_POLL_MAX, DEFAULT_POLL_MIN, DEFAULT_PROXY_AGENT};
use server::{PollSettings, RelayState, ServerSettings};
use transport::RelayTransport;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Tunnel TCP connections over HTTP polling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream forward proxy (host:port) for outgoing HTTP
    #[arg(short = 'P', long, global = true, env = "SLUICE_PROXY")]
    proxy: Option<String>,

    /// Basic auth username shared by client and server
    #[arg(long, global = true, env = "SLUICE_USER")]
    user: Option<String>,

    /// Basic auth password shared by client and server
    #[arg(long, global = true, env = "SLUICE_PASS")]
    pass: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the local proxy that applications connect to
    Client(ClientArgs),

    /// Run the relay that opens the real connections
    Server(ServerArgs),

    /// Write a config file with the built-in defaults
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Relay server URL (`http://` is assumed when missing)
    #[arg(short = 'S', long, env = "SLUICE_SERVER")]
    server: Option<String>,

    /// Local address to accept proxy connections on
    #[arg(short = 'L', long, env = "SLUICE_CLIENT_LISTEN")]
    listen: Option<String>,

    /// Read size for local connections
    #[arg(short = 'b', long)]
    buffer_size: Option<usize>,

    /// Wait between empty polls, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the relay endpoints on
    #[arg(short = 'L', long, env = "SLUICE_SERVER_LISTEN")]
    listen: Option<String>,

    /// Read size for remote connections
    #[arg(short = 'b', long)]
    buffer_size: Option<usize>,

    /// Name sent in the connection-established line
    #[arg(long)]
    proxy_agent: Option<String>,

    /// Shortest poll wait, in milliseconds
    #[arg(long)]
    poll_min_ms: Option<u64>,

    /// Longest poll wait, in milliseconds
    #[arg(long)]
    poll_max_ms: Option<u64>,

    /// Bound on dialing targets and on passthrough requests, in seconds
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Drop sessions that go this many seconds without a poll
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    if let Commands::InitConfig { force } = cli.command {
        return run_init_config(&config_path, force);
    }

    let config = Config::load_from(&config_path)?;
    let auth = resolve_credentials(cli.user, cli.pass, &config)?;

    match cli.command {
        Commands::Client(args) => run_client(args, cli.proxy, auth, config).await,
        Commands::Server(args) => run_server(args, cli.proxy, auth, config).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn run_client(
    args: ClientArgs,
    proxy: Option<String>,
    auth: Option<Credentials>,
    config: Config,
) -> Result<()> {
    let server = with_scheme(
        &args
            .server
            .or(config.client.server)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
    );
    let listen = args
        .listen
        .or(config.client.listen)
        .unwrap_or_else(|| DEFAULT_CLIENT_LISTEN.to_string());
    let forward_proxy = proxy.or(config.client.forward_proxy);

    let mut settings = ClientSettings {
        auth,
        ..ClientSettings::default()
    };
    if let Some(size) = args.buffer_size.or(config.client.buffer_size) {
        settings.buffer_size = size;
    }
    if let Some(ms) = args.poll_interval_ms.or(config.client.poll_interval_ms) {
        settings.poll_interval = Duration::from_millis(ms);
    }

    let transport = RelayTransport::new(forward_proxy, protocol::DEFAULT_REQUEST_TIMEOUT)
        .context("Failed to build HTTP client")?;
    let client = TunnelClient::new(&server, transport, settings)
        .with_context(|| format!("Invalid server URL: {}", server))?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    Arc::new(client).run(listener).await?;
    Ok(())
}

async fn run_server(
    args: ServerArgs,
    proxy: Option<String>,
    auth: Option<Credentials>,
    config: Config,
) -> Result<()> {
    let listen = args
        .listen
        .or(config.server.listen)
        .unwrap_or_else(|| DEFAULT_SERVER_LISTEN.to_string());
    let forward_proxy = proxy.or(config.server.forward_proxy);

    let min = Duration::from_millis(
        args.poll_min_ms
            .or(config.server.poll_min_ms)
            .unwrap_or(DEFAULT_POLL_MIN.as_millis() as u64),
    );
    let max = Duration::from_millis(
        args.poll_max_ms
            .or(config.server.poll_max_ms)
            .unwrap_or(DEFAULT_POLL_MAX.as_millis() as u64),
    );
    if min.is_zero() || min > max {
        anyhow::bail!(
            "Invalid poll bounds: minimum {:?} must be non-zero and at most maximum {:?}",
            min,
            max
        );
    }

    let mut settings = ServerSettings {
        buffer_size: args
            .buffer_size
            .or(config.server.buffer_size)
            .unwrap_or(DEFAULT_BUFFER_SIZE),
        poll: PollSettings { min, max },
        proxy_agent: args
            .proxy_agent
            .or(config.server.proxy_agent)
            .unwrap_or_else(|| DEFAULT_PROXY_AGENT.to_string()),
        auth,
        ..ServerSettings::default()
    };
    if let Some(secs) = args.request_timeout_secs.or(config.server.request_timeout_secs) {
        settings.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.idle_timeout_secs.or(config.server.idle_timeout_secs) {
        settings.idle_timeout = Duration::from_secs(secs);
    }
    if settings.idle_timeout <= settings.poll.max {
        anyhow::bail!(
            "Idle timeout {:?} must be longer than the maximum poll wait {:?}",
            settings.idle_timeout,
            settings.poll.max
        );
    }

    let transport = RelayTransport::new(forward_proxy, settings.request_timeout)
        .context("Failed to build HTTP client")?;
    let state = RelayState::new(transport, settings);

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    server::serve(listener, state).await?;
    Ok(())
}

fn run_init_config(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite it.",
            path.display()
        );
    }

    Config::with_defaults().save_to(path)?;
    println!("Config written to {}", path.display());
    Ok(())
}

/// Credentials from the command line win as a pair; half a pair is an error.
fn resolve_credentials(
    user: Option<String>,
    pass: Option<String>,
    config: &Config,
) -> Result<Option<Credentials>> {
    match (user, pass) {
        (Some(user), Some(pass)) => Ok(Some(Credentials::new(user, pass))),
        (None, None) => Ok(config.auth.credentials()),
        _ => anyhow::bail!("--user and --pass must be given together"),
    }
}

fn with_scheme(server: &str) -> String {
    if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
