// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use logship::driver::LogDriver;
use logship::info::ContainerInfo;
use logship::insights::config::{
    InsightsConfig, WorkerDefaults, BATCH_INTERVAL_KEY, ENDPOINT_KEY, GZIP_KEY, TOKEN_KEY,
    VERIFY_CONNECTION_KEY,
};
use logship::insights::RemoteLogger;
use logship::plugin::PluginServer;
use logship::stream::LogRecord;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/logship.sock";
const DEFAULT_LOG_DIR: &str = "/var/log/docker";

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Serve the logging plugin on a unix socket
    Serve(Box<ServeArgs>),

    /// Send a test message through the delivery path
    Log(Box<LogArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logship")]
#[command(bin_name = "logship")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// Unix socket the daemon connects to
    #[arg(long, env = "LOGSHIP_SOCKET_PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket_path: String,

    /// Directory for per-container JSON log files
    #[arg(long, env = "LOGSHIP_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    log_dir: String,

    /// Capacity of each delivery worker's input queue
    #[arg(long, env = "LOGSHIP_CHANNEL_SIZE", default_value_t = 4096)]
    channel_size: usize,

    /// Undelivered envelopes retained before the oldest are dropped
    #[arg(long, env = "LOGSHIP_BUFFER_MAX", default_value_t = 10240)]
    buffer_max: usize,

    /// Timeout for each delivery request
    #[arg(long, env = "LOGSHIP_SEND_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    send_timeout: Duration,
}

#[derive(Debug, clap::Args)]
struct LogArgs {
    /// Telemetry endpoint URL
    #[arg(long, env = "LOGSHIP_ENDPOINT")]
    endpoint: Option<String>,

    /// Instrumentation key
    #[arg(long = "key", short = 'k', env = "LOGSHIP_KEY")]
    key: String,

    /// Enable gzip compression
    #[arg(long, short = 'c')]
    compress: bool,

    /// Verify the connection before sending
    #[arg(long)]
    verify_connection: bool,

    /// Message to send; reads lines from stdin when absent
    message: Option<String>,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve(args)) => {
            let _guard = match setup_logging() {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };
            if let Err(e) = run_serve(args) {
                error!(error = %e, "failed to run plugin server");
                return ExitCode::from(1);
            }
        }
        Some(Commands::Log(args)) => {
            let _guard = match setup_logging() {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };
            if let Err(e) = run_log(args) {
                error!(error = %e, "failed to send message");
                return ExitCode::from(1);
            }
        }
        _ => {
            // unreachable: a subcommand is required
            error!("must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_serve(args: Box<ServeArgs>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let defaults = WorkerDefaults {
        channel_capacity: args.channel_size,
        buffer_maximum: args.buffer_max,
        send_timeout: args.send_timeout,
    };

    let driver = Arc::new(LogDriver::new(defaults, &args.log_dir));
    let server = PluginServer::new(&args.socket_path, driver);

    let cancel_token = CancellationToken::new();
    let mut join_set = JoinSet::new();
    {
        let token = cancel_token.clone();
        join_set.spawn(async move { server.serve(token).await });
    }

    select! {
        _ = signal_wait() => {
            info!("Shutdown signal received.");
            cancel_token.cancel();
        }
        result = join_set.join_next() => {
            if let Some(result) = result {
                result??;
            }
        }
    }

    while let Some(result) = join_set.join_next().await {
        result??;
    }

    Ok(())
}

#[tokio::main]
async fn run_log(args: Box<LogArgs>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut info = ContainerInfo {
        container_id: "logship-cli".to_string(),
        daemon_name: "logship".to_string(),
        ..Default::default()
    };
    info.config.insert(TOKEN_KEY.to_string(), args.key.clone());
    if let Some(endpoint) = &args.endpoint {
        info.config.insert(ENDPOINT_KEY.to_string(), endpoint.clone());
    }
    info.config
        .insert(GZIP_KEY.to_string(), args.compress.to_string());
    info.config.insert(
        VERIFY_CONNECTION_KEY.to_string(),
        args.verify_connection.to_string(),
    );
    // Short interval so one-off messages leave promptly.
    info.config
        .insert(BATCH_INTERVAL_KEY.to_string(), "1s".to_string());

    let config = InsightsConfig::resolve(&info.config, &WorkerDefaults::default())?;
    let logger = RemoteLogger::open(config, &info).await?;

    match &args.message {
        Some(message) => {
            logger.log(cli_record(message)).await?;
        }
        None => {
            use tokio::io::AsyncBufReadExt;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Some(line) = lines.next_line().await? {
                if line == "exit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                logger.log(cli_record(&line)).await?;
            }
        }
    }

    // Drains the worker so everything queued is flushed before exit.
    logger.close().await;
    Ok(())
}

fn cli_record(message: &str) -> LogRecord {
    LogRecord {
        line: bytes::Bytes::from(message.as_bytes().to_vec()),
        source: "stdout".to_string(),
        partial: false,
        timestamp: chrono::Utc::now(),
        attrs: Vec::new(),
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging() -> Result<LoggerGuard, Box<dyn Error + Send + Sync>> {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

fn sig(kind: SignalKind) -> tokio::signal::unix::Signal {
    signal(kind).expect("failed to register signal handler")
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {}
        _ = sig_int.recv() => {}
    }
}
