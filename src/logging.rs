use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat, LoggingConfig};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber. Events go to stderr so stdout stays free
/// for command output.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let logging = config.logging.as_ref();
    let log_level = resolve_log_level(logging, cli_level_override)?;

    match resolve_log_format(logging) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_log_level(
    logging: Option<&LoggingConfig>,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
        .unwrap_or(DEFAULT_LOG_LEVEL);

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(logging: Option<&LoggingConfig>) -> LogFormat {
    logging
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
