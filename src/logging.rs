//! Diagnostics go to stderr; stdout carries command output only.

use std::io::IsTerminal as _;

use anyhow::{Context as _, anyhow};
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    /// Level comes from `--log-level`, then `[logging].level`, then `info`.
    /// Format comes from `[logging].format`, then `fallback_format`.
    pub fn resolve(
        config: &Config,
        cli_level_override: Option<&str>,
        fallback_format: LogFormat,
    ) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let raw_level = cli_level_override
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or(DEFAULT_LOG_LEVEL);
        let level = raw_level
            .trim()
            .to_ascii_lowercase()
            .parse::<LevelFilter>()
            .map_err(|_| {
                anyhow!(
                    "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
                )
            })?;
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(fallback_format);
        Ok(Self { level, format })
    }
}

/// Installs the process-wide subscriber writing to stderr.
pub fn init(settings: LogSettings) -> anyhow::Result<()> {
    let ansi = settings.format == LogFormat::Pretty && std::io::stderr().is_terminal();
    tracing::subscriber::set_global_default(subscriber(settings, ansi, std::io::stderr))
        .context("install logging subscriber")
}

fn subscriber<W>(settings: LogSettings, ansi: bool, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer);
    match settings.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    }
}
