//! # Kraken Proxy
//!
//! HTTP companion service for a KrakenSDR direction-finding receiver.
//!
//! Tails the receiver's bearing output into a short-lived cache, writes
//! receiver settings on request and sequences power to the receiver
//! hardware.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use kraken_proxy::config::{Config, LoggingConfig};
use kraken_proxy::ingest::{self, version, IngestCache};
use kraken_proxy::keepalive::{self, KeepAlive};
use kraken_proxy::power::probes::SystemProbes;
use kraken_proxy::power::relay::SysfsGpioRelay;
use kraken_proxy::power::{PowerSequencer, PowerTimings};
use kraken_proxy::server::{self, AppState};
use kraken_proxy::settings::SettingsStore;

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "KRAKEN_PROXY_CONFIG";

/// Configuration file used when none is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix for rolling log files
const LOG_FILE_PREFIX: &str = "kraken-proxy.log";

/// Main entry point for Kraken Proxy
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, `KRAKEN_PROXY_CONFIG` or the default path)
///    - Apply environment overrides and set up logging
///    - Detect the receiver version and back up its settings
///
/// 2. **Run**
///    - Poll the measurement file in the background
///    - Hold the receiver web UI push channel open
///    - Serve the HTTP API
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C stops the server, then the background tasks
///
/// # Errors
///
/// Returns error if the configuration is invalid or the listener cannot be bound.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;

    let _log_guard = init_logging(&config.logging);

    info!("Kraken Proxy v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path.display());

    let receiver_paths = config.receiver_paths();
    let receiver_settings = SettingsStore::new(&receiver_paths.settings_file);
    match receiver_settings.backup(&receiver_paths.backup_dir, chrono::Local::now()) {
        Ok(path) => info!("Receiver settings backed up to {}", path.display()),
        Err(e) => warn!(
            "Could not back up {}: {}",
            receiver_paths.settings_file.display(),
            e
        ),
    }

    let local_settings = SettingsStore::optional(&config.paths.local_settings);
    let array_angle = match local_settings.load() {
        Ok(settings) => settings.array_angle,
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", local_settings.path().display(), e);
            None
        }
    };

    let format_version = version::detect(&config.paths.doa_root);
    info!("Receiver format version: {}", format_version);

    let cache = Arc::new(
        IngestCache::new(&receiver_paths.doa_file, &config.ingest, format_version)
            .with_receiver_settings(receiver_settings.clone())
            .with_orientation_offset(array_angle),
    );
    let poller = ingest::spawn_poller(
        cache.clone(),
        Duration::from_millis(config.ingest.poll_interval_ms),
    );

    let keepalive = config.receiver.keepalive_enabled.then(|| {
        let client = KeepAlive::from_config(&config.receiver);
        info!("Keeping receiver push channel {} open", client.url());
        keepalive::spawn_keepalive(client)
    });

    let sequencer = PowerSequencer::new(
        Arc::new(SystemProbes::from_config(&config.power)),
        Arc::new(SysfsGpioRelay::from_config(&config.power)),
        PowerTimings::from(&config.power),
    );
    let power_controllable = server::power_controllable(config.power.enabled);
    if !power_controllable {
        info!("Power control disabled on this host");
    }

    let state = Arc::new(AppState {
        cache,
        receiver_settings,
        local_settings,
        sequencer: Arc::new(sequencer),
        power_controllable,
    });

    info!("Press Ctrl+C to exit");
    let result = server::run_server(
        state,
        &config.server.host,
        config.server.port,
        shutdown_signal(),
    )
    .await;

    poller.abort();
    if let Some(keepalive) = keepalive {
        keepalive.abort();
    }
    info!("Kraken Proxy stopped");
    result.with_context(|| format!("Server on {}:{} failed", config.server.host, config.server.port))
}

/// Pick the configuration file: argument, then environment, then default
fn config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Initialize tracing.
///
/// `RUST_LOG` wins over the configured level. With `file_dir` set, output
/// also goes to a daily rolling file; the returned guard must live as long
/// as the process.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    match &config.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            warn!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
