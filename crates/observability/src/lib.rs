//! Logging for plexus nodes.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default level for plexus crates when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Extra comma-separated filter directives, e.g. `plexus_swarm=trace`.
    pub filter: Option<String>,
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level; extra directives
/// from [`LogConfig::filter`] are applied on top.
pub fn init_logging(config: &LogConfig) -> eyre::Result<()> {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,plexus={}", config.level)));

    if let Some(extra) = &config.filter {
        for directive in extra.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(directive.trim().parse()?);
        }
    }

    let layer = fmt::Layer::new().with_ansi(!config.json);
    let layer = if config.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Test logging through the libtest capture writer. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
