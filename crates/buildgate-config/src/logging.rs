//! Runtime log level control.
//!
//! The active level lives in a [`LogControl`] owned by whoever initialised
//! tracing and handed by reference to anything that needs to read or change
//! it. Changing the level swaps the subscriber's `EnvFilter` in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt, reload};

use crate::gate::LoggingSettings;
use crate::{ConfigError, ConfigResult};

/// Verbosity of the coordinator's logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Operational logging (`info`).
    #[default]
    Default,
    Debug,
    Trace,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Default => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Default => "default",
            other => other.as_filter(),
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "info" => Ok(LogLevel::Default),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidValue {
                field: "log level".to_string(),
                message: format!("unknown level: {}", other),
            }),
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Owned, synchronized access to the active log level.
pub struct LogControl {
    level: RwLock<LogLevel>,
    filter: Option<FilterHandle>,
}

impl LogControl {
    /// A control not attached to any subscriber. Level changes are recorded
    /// but filter nothing.
    pub fn detached(level: LogLevel) -> Self {
        Self {
            level: RwLock::new(level),
            filter: None,
        }
    }

    pub fn level(&self) -> LogLevel {
        *self
            .level
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switch to `level`, reloading the subscriber filter when attached.
    pub fn set_level(&self, level: LogLevel) -> ConfigResult<()> {
        let mut current = self
            .level
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(handle) = &self.filter {
            handle
                .reload(EnvFilter::new(level.as_filter()))
                .map_err(|e| ConfigError::LogControl(e.to_string()))?;
        }

        let previous = *current;
        *current = level;
        if previous != level {
            tracing::info!(from = %previous, to = %level, "Log level changed");
        }
        Ok(())
    }

    /// Parse and apply a level name.
    pub fn set_level_named(&self, name: &str) -> ConfigResult<LogLevel> {
        let level: LogLevel = name.parse()?;
        self.set_level(level)?;
        Ok(level)
    }
}

/// Install the global tracing subscriber and return its level control.
///
/// `RUST_LOG`, when set, decides the initial filter; the configured level
/// still becomes the control's recorded level.
pub fn init_tracing(settings: &LoggingSettings) -> ConfigResult<LogControl> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_filter()));
    let (filter, handle) = reload::Layer::new(filter);

    let json = settings.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_fmt::layer().json()))
        .with((!json).then(tracing_fmt::layer))
        .try_init()
        .map_err(|e| ConfigError::LogControl(e.to_string()))?;

    Ok(LogControl {
        level: RwLock::new(settings.level),
        filter: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("default".parse::<LogLevel>().unwrap(), LogLevel::Default);
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Default);
        assert_eq!(" DEBUG ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("nope".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for level in [
            LogLevel::Default,
            LogLevel::Debug,
            LogLevel::Trace,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_detached_control_records_level() {
        let control = LogControl::detached(LogLevel::Default);
        control.set_level(LogLevel::Debug).unwrap();
        assert_eq!(control.level(), LogLevel::Debug);

        assert_eq!(control.set_level_named("default").unwrap(), LogLevel::Default);
        assert_eq!(control.level(), LogLevel::Default);
    }

    #[test]
    fn test_invalid_level_leaves_state_alone() {
        let control = LogControl::detached(LogLevel::Debug);
        assert!(control.set_level_named("nope").is_err());
        assert_eq!(control.level(), LogLevel::Debug);
    }

    #[test]
    fn test_control_is_shareable_across_threads() {
        let control = std::sync::Arc::new(LogControl::detached(LogLevel::Default));
        let writer = {
            let control = control.clone();
            std::thread::spawn(move || control.set_level(LogLevel::Trace).unwrap())
        };
        writer.join().unwrap();
        assert_eq!(control.level(), LogLevel::Trace);
    }
}
