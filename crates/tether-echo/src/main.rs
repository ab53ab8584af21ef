use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tether_channel::Channel;
use tether_echo::{EchoConfig, EchoServer, run_client};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tether-echo",
    about = "Echo requests over a tether shared-memory channel",
    version,
    author,
    long_about = "Runs an echo worker on one end of a channel and a request client on the other, either as two processes over named shared memory (serve / client) or within one process (local)."
)]
struct Cli {
    /// Set the logging level (overridden by RUST_LOG)
    #[arg(short, long, value_enum, default_value = "info", env = "TETHER_LOG_LEVEL")]
    log_level: LogLevel,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true, env = "TETHER_ECHO_CONFIG")]
    config: Option<PathBuf>,

    /// Channel name
    #[arg(long, global = true, env = "TETHER_CHANNEL")]
    name: Option<String>,

    /// Region size per direction in bytes
    #[arg(long, global = true, env = "TETHER_REGION_SIZE")]
    size: Option<u32>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the channel and answer requests
    Serve {
        /// Seconds to keep answering
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Open an existing channel and send requests
    Client {
        /// Number of requests
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },

    /// Run the echo worker and the client in this process
    Local {
        /// Number of requests
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },
}

#[derive(Serialize)]
struct Report<'a, T: Serialize> {
    role: &'a str,
    #[serde(flatten)]
    details: T,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EchoConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EchoConfig::default(),
    };
    if let Some(name) = &cli.name {
        config.channel.name.clone_from(name);
    }
    if let Some(size) = cli.size {
        config.channel.region_size = size;
    }

    match cli.command {
        Commands::Serve { duration } => {
            if let Some(secs) = duration {
                config.serve_secs = secs;
            }
            serve(&config, cli.json)
        }
        Commands::Client { count } => {
            if let Some(count) = count {
                config.requests = count;
            }
            client(&config, cli.json)
        }
        Commands::Local { count } => {
            if let Some(count) = count {
                config.requests = count;
            }
            local(&config, cli.json)
        }
    }
}

fn serve(config: &EchoConfig, json: bool) -> anyhow::Result<()> {
    let channel = Channel::create(&config.channel)
        .with_context(|| format!("creating channel {}", config.channel.name))?;
    let server = EchoServer::spawn(Arc::new(channel), config.thread.clone())?;
    server.start()?;
    info!(
        "Serving channel {} for {}s",
        config.channel.name, config.serve_secs
    );

    server.wait_stopped(config.serve_timeout())?;
    server.stop()?;
    server.check()?;
    print_report("serve", server.summary(), json)
}

fn client(config: &EchoConfig, json: bool) -> anyhow::Result<()> {
    let channel = Channel::open(&config.channel)
        .with_context(|| format!("opening channel {}", config.channel.name))?;
    let report = run_client(&channel, config.requests, config.reply_timeout())?;
    print_report("client", report, json)
}

fn local(config: &EchoConfig, json: bool) -> anyhow::Result<()> {
    let (near, far) = Channel::pair(config.channel.region_size)?;
    let server = EchoServer::spawn(Arc::new(far), config.thread.clone())?;
    server.start()?;

    let result = run_client(&near, config.requests, config.reply_timeout());
    server.stop()?;
    server.wait_stopped(config.serve_timeout())?;
    server.check()?;
    let report = result?;

    print_report("client", report, json)?;
    print_report("serve", server.summary(), json)
}

fn print_report<T: Serialize + std::fmt::Debug>(
    role: &str,
    details: T,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        let report = Report { role, details };
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("{role}: {details:#?}");
    }
    Ok(())
}
