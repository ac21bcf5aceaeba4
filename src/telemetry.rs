//! Tracing setup.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub quiet: bool,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, quiet: bool, logging: LoggingConfig) -> Self {
        Self {
            verbosity,
            quiet,
            logging,
        }
    }
}

/// Initialize the global subscriber. `TOTEM_LOG` overrides the verbosity
/// flags with a full filter directive. Safe to call more than once; later
/// calls are no-ops (tests).
pub fn init(config: TelemetryConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(&config).into())
        .with_env_var("TOTEM_LOG")
        .from_env_lossy();

    if !config.logging.stdout {
        let _ = tracing_subscriber::registry().with(filter).try_init();
        return;
    }

    let layer = match config.logging.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

fn level_from_verbosity(config: &TelemetryConfig) -> Level {
    if config.quiet {
        return Level::ERROR;
    }
    match config.verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
