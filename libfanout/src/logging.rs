//! Logging setup shared by the fanout binaries
//!
//! Both `fanout-send` and `fanout-queue` log to stderr so stdout stays free
//! for machine-readable output. The format and level can be chosen on the
//! command line or through `FANOUT_LOG_FORMAT` / `FANOUT_LOG_LEVEL`;
//! `RUST_LOG` still wins when it is set.
//!
//! ```no_run
//! use libfanout::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "debug").init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "FANOUT_LOG_FORMAT";
pub const LEVEL_ENV: &str = "FANOUT_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain single-line output
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                other
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>) -> Self {
        Self {
            format,
            level: level.into(),
        }
    }

    /// Read format and level from the environment, falling back to text/info
    pub fn from_env() -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let level = std::env::var(LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        Self::new(format, level)
    }

    /// Force debug level (the `--verbose` flag)
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = "debug".to_string();
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber.
    ///
    /// # Panics
    ///
    /// Panics if a global subscriber was already installed.
    pub fn init(&self) {
        let filter = self.filter();

        match self.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true)
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::fmt()
                    .pretty()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .with_line_number(true)
                    .with_file(true)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .init();
            }
        }
    }
}
