//! Logging setup for hearth binaries.

use std::fmt;
use tracing_subscriber::EnvFilter;

/// Log configuration of a hearth process. Every flag also reads from the
/// daemon's environment, so service units can configure logging without
/// touching argv.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity: trace|debug|info|warn|error|off
    #[arg(
        long = "log.level",
        env = "HEARTH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        ignore_case = true,
        value_enum,
        global = true
    )]
    pub level: LogLevel,

    /// The log output format. Defaults to colored text on a terminal and
    /// jsonl otherwise.
    #[arg(
        long = "log.format",
        env = "HEARTH_LOG_FORMAT",
        value_enum,
        global = true
    )]
    pub format: Option<LogFormat>,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        })
    }
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Plain text without colors.
    Text,
    /// Plain text with colors, for interactive terminals.
    Color,
}

impl LogArgs {
    /// The effective filter. An explicit `RUST_LOG` takes precedence over
    /// the level flag, so per-module directives keep working.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }

    /// Installs the process-wide subscriber. Panics if called twice.
    pub fn init(&self) {
        let format = self.format.unwrap_or_else(|| {
            if atty::is(atty::Stream::Stderr) {
                LogFormat::Color
            } else {
                LogFormat::Json
            }
        });
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(self.filter())
            .with_target(true);

        match format {
            LogFormat::Json => builder.json().flatten_event(true).init(),
            LogFormat::Text => builder.with_ansi(false).init(),
            LogFormat::Color => builder.with_ansi(true).init(),
        }
    }
}
