//! Snare - intercepting HTTP(S) proxy.
//!
//! Runs the MITM proxy and bridges it to an operator over stdio:
//! - stdout: observer events, one JSON object per line
//! - stdin: control commands (decisions, intercept toggles, clear, stats)
//! - stderr and the log directory: diagnostics

mod console;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use directories::ProjectDirs;
use snare_core::{Direction, InterceptAction, SnareConfig};
use snare_proxy::{Pipeline, PipelineConfig, ProcessorMode, ProxyConfig, ProxyServer};
use tokio::io::BufReader;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Snare - intercepting HTTP(S) proxy
#[derive(Parser, Debug)]
#[command(name = "snare", version, about)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:9080
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// CA certificate (PEM)
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// CA private key (PEM)
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Hold requests for an operator decision
    #[arg(long)]
    intercept_requests: bool,

    /// Hold responses for an operator decision
    #[arg(long)]
    intercept_responses: bool,

    /// Drop intercepted transactions whose decision times out
    #[arg(long)]
    fail_closed: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "snare", "Snare").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
///
/// Console output goes to stderr; stdout carries events.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "snare={0},snare_core={0},snare_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("snare")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Loads the configuration file and applies command-line overrides.
fn load_settings(args: &Args) -> anyhow::Result<SnareConfig> {
    let path = args.config.clone().or_else(SnareConfig::default_path);
    let mut settings = match path {
        Some(path) => {
            tracing::debug!("Reading configuration from {:?}", path);
            SnareConfig::load_or_default(&path)?
        }
        None => SnareConfig::default(),
    };
    apply_overrides(&mut settings, args);
    settings.validate()?;
    Ok(settings)
}

fn apply_overrides(settings: &mut SnareConfig, args: &Args) {
    if let Some(addr) = args.listen {
        settings.proxy.host = addr.ip().to_string();
        settings.proxy.port = addr.port();
    }
    if let Some(cert) = &args.ca_cert {
        settings.proxy.ca_cert = Some(cert.clone());
    }
    if let Some(key) = &args.ca_key {
        settings.proxy.ca_key = Some(key.clone());
    }
    if args.intercept_requests {
        settings.intercept.request = true;
    }
    if args.intercept_responses {
        settings.intercept.response = true;
    }
    if args.fail_closed {
        settings.intercept.on_timeout = InterceptAction::Drop;
    }
}

/// Registers the built-in read-only processors.
fn register_traffic_log(pipeline: &Pipeline) {
    pipeline.processors().register_request(
        |req| {
            tracing::debug!("-> {} {}", req.method(), req.uri());
            false
        },
        ProcessorMode::ReadOnly,
    );
    pipeline.processors().register_response(
        |res| {
            tracing::debug!("<- {} ({} bytes)", res.status(), res.body().len());
            false
        },
        ProcessorMode::ReadOnly,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Snare...");
    tracing::debug!("Args: {:?}", args);

    let settings = load_settings(&args)?;

    let (pipeline, events) = Pipeline::new(PipelineConfig::from_settings(&settings));
    pipeline.set_scope(settings.compiled_scope()?);
    pipeline.set_intercept(Direction::Request, settings.intercept.request);
    pipeline.set_intercept(Direction::Response, settings.intercept.response);
    register_traffic_log(&pipeline);

    let server = ProxyServer::new(ProxyConfig::from_settings(&settings)?, pipeline.clone())?;
    let handle = server.start()?;
    tracing::info!("Proxy listening on {}", handle.addr());

    let printer = tokio::spawn(console::print_events(events, tokio::io::stdout()));
    let reader = tokio::spawn(console::read_commands(
        BufReader::new(tokio::io::stdin()),
        pipeline.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    handle.stop().await;
    reader.abort();
    printer.abort();

    tracing::info!("Snare shutting down");
    Ok(())
}
