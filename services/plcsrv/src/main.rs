//! PLC communication service
//!
//! Connects to the configured press controller, loads its signal table and
//! logs every changed snapshot until Ctrl+C or SIGTERM. SIGHUP re-reads the
//! logging level from the config file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use common::logging::{self, LogConfig};
use common::shutdown::wait_for_shutdown;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use plcsrv::config::{PlcsrvConfig, DEFAULT_CONFIG_PATH, SERVICE_NAME};
use plcsrv::{PlcService, PollerEvent, TransportEvent};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "plcsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "PLC Communication Service",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// PLC host, overrides the device record
    #[arg(long)]
    host: Option<String>,

    /// PLC Modbus TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Modbus slave id
    #[arg(short = 's', long)]
    slave_id: Option<u8>,

    /// Processor type (omron, siemens, mitsubishi)
    #[arg(long)]
    processor: Option<String>,

    /// Signal definition file (JSON array)
    #[arg(long)]
    signals: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(short = 'i', long)]
    interval: Option<u64>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn apply(&self, config: &mut PlcsrvConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(host) = &self.host {
            config.device.ip_address = host.clone();
            // A host given on the command line is enough to identify the device
            if config.device.device_id <= 0 {
                config.device.device_id = 1;
            }
        }
        if let Some(port) = self.port {
            config.device.port = i64::from(port);
        }
        if let Some(slave_id) = self.slave_id {
            config.device.slave_id = i64::from(slave_id);
        }
        if let Some(processor) = &self.processor {
            config.processor_type = processor.clone();
        }
        if let Some(signals) = &self.signals {
            config.signals_file = Some(signals.clone());
        }
        if let Some(interval) = self.interval {
            config.polling.interval_ms = interval;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = PlcsrvConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    args.apply(&mut config);

    logging::init_with_config(LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level: config.logging.level.clone(),
        log_dir: config.logging.file.then(|| config.logging.dir.clone()),
        enable_json: config.logging.json,
        ansi: true,
    })
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    match &config.source {
        Some(path) => info!("Config: {}", path.display()),
        None => warn!("Config file {} not found, using defaults", args.config.display()),
    }

    config.validate().context("Invalid configuration")?;
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        "Starting {} v{} ({} @ {}:{})",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.processor(),
        config.device.ip_address,
        config.device.port
    );

    let service = PlcService::new(config);
    spawn_event_logger(&service);
    #[cfg(unix)]
    spawn_log_level_reload(args.clone());
    service.start().context("Failed to start PLC service")?;

    let signal = wait_for_shutdown().await;
    info!("Shutdown signal received: {}", signal);

    if tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .is_err()
    {
        warn!("Shutdown timed out");
    }
    Ok(())
}

/// Re-read `logging.level` on SIGHUP. A `--log-level` flag still wins.
#[cfg(unix)]
fn spawn_log_level_reload(args: Args) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {}", e);
            return;
        },
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let mut config = match PlcsrvConfig::load_from(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    error!("Reload of {} failed: {}", args.config.display(), e);
                    continue;
                },
            };
            args.apply(&mut config);

            let directive = logging::filter_directive(
                &LogConfig {
                    service_name: SERVICE_NAME.to_string(),
                    level: config.logging.level,
                    ..Default::default()
                },
                None,
            );
            match logging::set_log_level(&directive) {
                Ok(()) => debug!("Active log filter: {}", logging::get_log_level()),
                Err(e) => error!("{}", e),
            }
        }
    });
}

fn spawn_event_logger(service: &PlcService) {
    let mut transport_events = service.transport().subscribe();
    tokio::spawn(async move {
        loop {
            match transport_events.recv().await {
                Ok(TransportEvent::StateChanged(state)) => info!("Connection: {}", state),
                Ok(TransportEvent::ReconnectAttempt(n)) => debug!("Reconnect attempt {}", n),
                Ok(TransportEvent::Error(e)) => error!("PLC error: {}", e),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} transport events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut poller_events = service.poller().subscribe();
    tokio::spawn(async move {
        loop {
            match poller_events.recv().await {
                Ok(PollerEvent::ValuesChanged(values)) => {
                    match serde_json::to_string(values.as_ref()) {
                        Ok(json) => info!("Values: {}", json),
                        Err(e) => warn!("Cannot serialize snapshot: {}", e),
                    }
                },
                Ok(PollerEvent::PollingChanged(on)) => info!("Polling {}", if on { "on" } else { "off" }),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} snapshots", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
