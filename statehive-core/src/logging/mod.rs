//! Logging subsystem for statehive
//!
//! Store diagnostics go through `tracing`; this module only installs the
//! subscriber. `RUST_LOG` replaces the configured level entirely when set.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Output shape of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// Text without the event timestamp
    Untimed,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub with_target: bool,
    /// Extra `EnvFilter` directives, e.g. `statehive_core::sync=trace`
    pub directives: Vec<String>,
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self { level, with_target: true, ..Default::default() }
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut directives = self.level.as_str().to_string();
        for directive in &self.directives {
            directives.push(',');
            directives.push_str(directive);
        }
        EnvFilter::try_new(&directives)
            .map_err(|e| LoggingError::InvalidConfiguration(format!("{}: {}", directives, e)))
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(section: &LoggingConfig) -> Result<Self, Self::Error> {
        let format = match (section.json_format, section.with_timestamp) {
            (true, _) => LogFormat::Json,
            (false, true) => LogFormat::Text,
            (false, false) => LogFormat::Untimed,
        };
        Ok(LogConfig::new(section.level.parse()?)
            .format(format)
            .with_target(section.with_target))
    }
}

/// Initialize logging at `info`
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::new(LogLevel::Info))
}

/// Install the global subscriber. Fails if one is already set.
///
/// # Example
/// ```
/// use statehive_core::logging::{init_logging_with_config, LogConfig, LogFormat, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug)
///     .format(LogFormat::Untimed)
///     .directive("statehive_core::sync=trace");
/// let _ = init_logging_with_config(config);
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(config.filter()?);
    let target = config.with_target;

    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(target)).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(target)).try_init(),
        LogFormat::Untimed => {
            registry.with(fmt::layer().without_time().with_target(target)).try_init()
        }
    };

    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}
