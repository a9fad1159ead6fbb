//! Janus - transparent forward proxy with response caching, host blocking,
//! and per-client audit logging.
//!
//! The `run` subcommand starts both listeners (plaintext HTTP and the
//! sniffed-TLS tunnel); the remaining subcommands manage the persisted
//! block-list and exit.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use janus_proxy::{
    ProxyServer, ServerConfig, DEFAULT_HTTP_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_TUNNEL_PORT,
};
use janus_storage::{AuditLog, Storage};

/// Janus - transparent forward proxy
#[derive(Parser, Debug)]
#[command(name = "janus", version, about)]
struct Args {
    /// Data directory (database, cache, logs); defaults to the app data dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy listeners
    Run {
        /// Bind address for both listeners
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Plaintext HTTP listener port
        #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
        http_port: u16,

        /// Sniffed-TLS tunnel listener port
        #[arg(long, default_value_t = DEFAULT_TUNNEL_PORT)]
        tunnel_port: u16,

        /// Maximum concurrently served connections
        #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,
    },
    /// Add a host to the block-list
    Block {
        /// Hostname or address to block
        host: String,
    },
    /// Remove hosts from the block-list
    Unblock {
        /// Hostnames to unblock
        hosts: Vec<String>,
    },
    /// List blocked hosts
    Blocked {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Initialize logging with daily file rotation under the data directory,
/// plus console output.
fn init_logging(
    args: &Args,
    data_dir: &PathBuf,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("janus={},warn", args.log_level)));

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("janus")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only.
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => Storage::default_data_dir().context("determining data directory")?,
    };
    let _guard = init_logging(&args, &data_dir);

    let storage = Storage::open(&data_dir).context("opening storage")?;

    match args.command {
        Command::Run {
            bind,
            http_port,
            tunnel_port,
            max_connections,
        } => {
            let audit =
                AuditLog::open(data_dir.join("audit.log")).context("opening audit log")?;

            let config = ServerConfig::new()
                .with_http_addr(SocketAddr::new(bind, http_port))
                .with_tunnel_addr(SocketAddr::new(bind, tunnel_port))
                .with_max_connections(max_connections);

            let handle = ProxyServer::new(config, storage, audit)
                .start()
                .await
                .context("starting proxy")?;

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutting down");
            handle.stop().await;
        }
        Command::Block { host } => {
            let entry = storage.block_address(&host).context("blocking host")?;
            if entry.ip.is_empty() {
                println!("blocked {} (unresolved)", entry.hostname);
            } else {
                println!("blocked {} ({})", entry.hostname, entry.ip);
            }
        }
        Command::Unblock { hosts } => {
            let removed = storage.unblock_hosts(&hosts).context("unblocking hosts")?;
            println!("removed {removed} host(s) from the block-list");
        }
        Command::Blocked { json } => {
            let blocked = storage.list_blocked().context("listing blocked hosts")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&blocked)?);
            } else if blocked.is_empty() {
                println!("block-list is empty");
            } else {
                for entry in blocked {
                    println!("{}\t{}", entry.hostname, entry.ip);
                }
            }
        }
    }

    Ok(())
}
