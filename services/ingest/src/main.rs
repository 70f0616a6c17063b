//! TrafficStats Camera Event Listener
//!
//! Subscribes to a network camera's alarm stream, classifies tripwire and
//! intrusion alarms, and records them for the dashboard.
//!
//! # Architecture
//!
//! ```text
//! Camera -> ConnectionSupervisor -> EventClassifier -> IntrusionDebounce -> ChannelSink -> EventRecorder
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with INGEST__)
//!
//! See `config.rs` for detailed configuration options.

use trafficstats_ingest::config::{IngestConfig, LoggingConfig};
use trafficstats_ingest::recorder::EventRecorder;
use trafficstats_ingest::{ChannelSink, ConnectionSupervisor, EventClassifier, IntrusionDebounce};

use config::ConfigError;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let (config, file_error) = load_config(IngestConfig::load, IngestConfig::from_env)?;

    // Initialize logging
    init_logging(&config.logging)?;

    if let Some(e) = file_error {
        warn!(error = %e, "Failed to load config from files, using environment");
    }

    info!(
        service = "trafficstats-ingest",
        version = env!("CARGO_PKG_VERSION"),
        host = %config.camera.host,
        "Starting camera event listener"
    );

    // Missing credentials are fatal before any connection attempt
    config.validate()?;

    run_listener(config).await
}

/// Load configuration from files, falling back to the environment.
///
/// Logging is not set up yet, so the file error is handed back to be
/// reported once it is.
fn load_config<F, E>(
    from_files: F,
    from_env: E,
) -> Result<(IngestConfig, Option<ConfigError>), ConfigError>
where
    F: FnOnce() -> Result<IngestConfig, ConfigError>,
    E: FnOnce() -> Result<IngestConfig, ConfigError>,
{
    match from_files() {
        Ok(config) => Ok((config, None)),
        Err(e) => Ok((from_env()?, Some(e))),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("trafficstats_ingest={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// Wire the listener to the recorder and run until a shutdown signal.
async fn run_listener(config: IngestConfig) -> anyhow::Result<()> {
    let (channel_sink, events_rx) = ChannelSink::new(config.sink.channel_capacity);
    let sink = IntrusionDebounce::new(
        channel_sink,
        Duration::from_secs(config.classifier.intrusion_debounce_secs),
    );

    let recorder = EventRecorder::new(&config.sink);
    let recorder_handle = tokio::spawn(recorder.run(events_rx));

    let supervisor = ConnectionSupervisor::new(
        config.camera.clone(),
        EventClassifier::new(config.classifier.clone()),
        sink,
    )?;
    let status = supervisor.status();

    let shutdown = CancellationToken::new();
    let listener_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        let status = status.clone();
        async move {
            shutdown_signal().await;
            info!(state = %status.state(), "Initiating graceful shutdown...");
            shutdown.cancel();
        }
    });

    // The supervisor owns the last sink sender; the recorder drains and ends
    // once it is gone.
    let stats = match listener_handle.await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "Listener task exited unexpectedly");
            status.stats()
        }
    };
    let recorded = recorder_handle.await.unwrap_or_default();

    info!(
        frames_received = stats.frames_received,
        events_delivered = stats.events_delivered,
        events_dropped = stats.events_dropped,
        duplicates_suppressed = stats.duplicates_suppressed,
        reconnect_count = stats.reconnect_count,
        auth_failures = stats.auth_failures,
        events_recorded = recorded,
        "Final statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_only(host: &str) -> Result<IngestConfig, ConfigError> {
        config::Config::builder()
            .set_override("camera.host", host)?
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_file_error_is_returned_with_fallback() {
        let (config, file_error) = load_config(
            || Err(ConfigError::Message("bad default.toml".to_string())),
            || camera_only("from-env.local"),
        )
        .unwrap();

        assert_eq!(config.camera.host, "from-env.local");
        assert!(file_error.unwrap().to_string().contains("bad default.toml"));
    }

    #[test]
    fn test_no_file_error_when_files_load() {
        let (_, file_error) =
            load_config(|| camera_only("from-files.local"), || panic!("environment not consulted"))
                .unwrap();
        assert!(file_error.is_none());
    }

    #[test]
    fn test_both_sources_failing_is_an_error() {
        let result = load_config(
            || Err(ConfigError::Message("files".to_string())),
            || Err(ConfigError::Message("env".to_string())),
        );
        assert!(result.unwrap_err().to_string().contains("env"));
    }
}
