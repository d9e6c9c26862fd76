//! Coordinator configuration parsing.
//!
//! ```kdl
//! queue "buildgate-deferrals" {
//!     batch-size 10
//!     initial-delay-secs 0
//! }
//! lock {
//!     ttl-secs 3600
//! }
//! retry {
//!     max-attempts 3
//!     initial-delay-ms 1000
//!     max-delay-ms 16000
//!     multiplier 2.0
//! }
//! resubmit {
//!     interval-secs 60
//!     relay-capacity 100
//! }
//! logging {
//!     level "default"
//!     format "text"
//! }
//! database-url "postgres://buildgate@127.0.0.1:5432/buildgate"
//! ```
//!
//! Every section is optional.

use buildgate_core::queue::MAX_RECEIVE_BATCH;
use buildgate_core::{ExponentialBackoff, Retry};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::logging::LogLevel;
use crate::{ConfigError, ConfigResult};

static QUEUE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+(\.fifo)?$").expect("static regex"));

const MAX_QUEUE_NAME_LEN: usize = 80;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    pub queue: QueueSettings,
    pub lock: LockSettings,
    pub retry: RetrySettings,
    pub resubmit: ResubmitSettings,
    pub logging: LoggingSettings,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    /// Messages read per resubmit pass.
    pub batch_size: usize,
    /// Delay before a freshly deferred build becomes visible.
    pub initial_delay: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "buildgate-deferrals".to_string(),
            batch_size: MAX_RECEIVE_BATCH,
            initial_delay: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Age after which an unreleased lock may be preempted.
    pub ttl: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self {
            max_attempts: 3,
            initial_delay: backoff.initial_delay,
            max_delay: backoff.max_delay,
            multiplier: backoff.multiplier,
        }
    }
}

impl RetrySettings {
    pub fn to_retry(&self) -> Retry {
        Retry::new(
            self.max_attempts,
            ExponentialBackoff::new(self.initial_delay, self.max_delay, self.multiplier),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResubmitSettings {
    pub interval: Duration,
    /// Bound of the relay channel towards the dispatcher.
    pub relay_capacity: usize,
}

impl Default for ResubmitSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            relay_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub json: bool,
}

/// Read and parse a configuration file.
pub fn load_gate_config(path: impl AsRef<Path>) -> ConfigResult<GateConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_gate_config(&text)
}

/// Parse coordinator configuration from KDL text.
pub fn parse_gate_config(kdl: &str) -> ConfigResult<GateConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = GateConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "queue" => config.queue = parse_queue(node)?,
            "lock" => config.lock = parse_lock(node)?,
            "retry" => config.retry = parse_retry(node)?,
            "resubmit" => config.resubmit = parse_resubmit(node)?,
            "logging" => config.logging = parse_logging(node)?,
            "database-url" | "database_url" => {
                config.database_url = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("database-url".to_string()))?,
                );
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueSettings> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("queue name".to_string()))?;
    validate_queue_name(&name)?;

    let mut settings = QueueSettings {
        name,
        ..QueueSettings::default()
    };

    for child in children(node) {
        match child.name().value() {
            "batch-size" => {
                let size = require_int(child, "queue batch-size")?;
                if size < 1 || size > MAX_RECEIVE_BATCH as i128 {
                    return Err(invalid(
                        "queue batch-size",
                        format!("must be between 1 and {}", MAX_RECEIVE_BATCH),
                    ));
                }
                settings.batch_size = size as usize;
            }
            "initial-delay-secs" => {
                let secs = require_non_negative(child, "queue initial-delay-secs")?;
                settings.initial_delay = (secs > 0).then(|| Duration::from_secs(secs));
            }
            _ => {}
        }
    }

    Ok(settings)
}

fn parse_lock(node: &KdlNode) -> ConfigResult<LockSettings> {
    let mut settings = LockSettings::default();
    for child in children(node) {
        if child.name().value() == "ttl-secs" {
            let secs = require_non_negative(child, "lock ttl-secs")?;
            if secs == 0 {
                return Err(invalid("lock ttl-secs", "must be positive".to_string()));
            }
            settings.ttl = Duration::from_secs(secs);
        }
    }
    Ok(settings)
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetrySettings> {
    let mut settings = RetrySettings::default();
    for child in children(node) {
        match child.name().value() {
            "max-attempts" => {
                let attempts = require_non_negative(child, "retry max-attempts")?;
                if attempts == 0 || attempts > u32::MAX as u64 {
                    return Err(invalid(
                        "retry max-attempts",
                        "must be a positive 32-bit integer".to_string(),
                    ));
                }
                settings.max_attempts = attempts as u32;
            }
            "initial-delay-ms" => {
                settings.initial_delay =
                    Duration::from_millis(require_non_negative(child, "retry initial-delay-ms")?);
            }
            "max-delay-ms" => {
                settings.max_delay =
                    Duration::from_millis(require_non_negative(child, "retry max-delay-ms")?);
            }
            "multiplier" => {
                let multiplier = get_first_number_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("retry multiplier".to_string()))?;
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(invalid(
                        "retry multiplier",
                        format!("{} is below 1.0", multiplier),
                    ));
                }
                settings.multiplier = multiplier;
            }
            _ => {}
        }
    }

    if settings.max_delay < settings.initial_delay {
        return Err(invalid(
            "retry max-delay-ms",
            "must not be smaller than initial-delay-ms".to_string(),
        ));
    }
    Ok(settings)
}

fn parse_resubmit(node: &KdlNode) -> ConfigResult<ResubmitSettings> {
    let mut settings = ResubmitSettings::default();
    for child in children(node) {
        match child.name().value() {
            "interval-secs" => {
                let secs = require_non_negative(child, "resubmit interval-secs")?;
                if secs == 0 {
                    return Err(invalid(
                        "resubmit interval-secs",
                        "must be positive".to_string(),
                    ));
                }
                settings.interval = Duration::from_secs(secs);
            }
            "relay-capacity" => {
                let capacity = require_non_negative(child, "resubmit relay-capacity")?;
                if capacity == 0 {
                    return Err(invalid(
                        "resubmit relay-capacity",
                        "must be positive".to_string(),
                    ));
                }
                settings.relay_capacity = capacity as usize;
            }
            _ => {}
        }
    }
    Ok(settings)
}

fn parse_logging(node: &KdlNode) -> ConfigResult<LoggingSettings> {
    let mut settings = LoggingSettings::default();
    for child in children(node) {
        match child.name().value() {
            "level" => {
                let level = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("logging level".to_string()))?;
                settings.level = level.parse()?;
            }
            "format" => match get_first_string_arg(child).as_deref() {
                Some("json") => settings.json = true,
                Some("text") | None => settings.json = false,
                Some(other) => {
                    return Err(invalid(
                        "logging format",
                        format!("unknown format: {}", other),
                    ));
                }
            },
            "json" => {
                return Err(invalid(
                    "logging json",
                    "use format \"json\" or format \"text\"".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(settings)
}

fn validate_queue_name(name: &str) -> ConfigResult<()> {
    if name.len() > MAX_QUEUE_NAME_LEN || !QUEUE_NAME.is_match(name) {
        return Err(invalid(
            "queue name",
            format!(
                "'{}' must be 1-{} characters of letters, digits, '-' or '_'",
                name, MAX_QUEUE_NAME_LEN
            ),
        ));
    }
    Ok(())
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    }
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_first_number_arg(node: &KdlNode) -> Option<f64> {
    let value = node.entries().iter().find(|e| e.name().is_none())?.value();
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

fn require_int(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    get_first_int_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn require_non_negative(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = require_int(node, field)?;
    u64::try_from(value).map_err(|_| invalid(field, format!("{} is out of range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_gate_config("").unwrap();
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.initial_delay, None);
        assert_eq!(config.lock.ttl, Duration::from_secs(3600));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.resubmit.relay_capacity, 100);
        assert_eq!(config.logging.level, LogLevel::Default);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            queue "buildgate-deferrals" {
                batch-size 5
                initial-delay-secs 1
            }

            lock {
                ttl-secs 900
            }

            retry {
                max-attempts 4
                initial-delay-ms 250
                max-delay-ms 2000
                multiplier 3
            }

            resubmit {
                interval-secs 30
                relay-capacity 8
            }

            logging {
                level "debug"
                format "json"
            }

            database-url "postgres://buildgate@localhost/buildgate"
        "#;

        let config = parse_gate_config(kdl).unwrap();
        assert_eq!(config.queue.name, "buildgate-deferrals");
        assert_eq!(config.queue.batch_size, 5);
        assert_eq!(config.queue.initial_delay, Some(Duration::from_secs(1)));
        assert_eq!(config.lock.ttl, Duration::from_secs(900));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_millis(2000));
        assert_eq!(config.retry.multiplier, 3.0);
        assert_eq!(config.retry.to_retry().max_attempts(), 4);
        assert_eq!(config.resubmit.interval, Duration::from_secs(30));
        assert_eq!(config.resubmit.relay_capacity, 8);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://buildgate@localhost/buildgate")
        );
    }

    #[test]
    fn test_fifo_queue_name_is_accepted() {
        let config = parse_gate_config(r#"queue "builds.fifo""#).unwrap();
        assert_eq!(config.queue.name, "builds.fifo");
    }

    #[test]
    fn test_rejects_bad_queue_name() {
        let result = parse_gate_config(r#"queue "no spaces allowed""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_queue_requires_name() {
        let result = parse_gate_config("queue");
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let kdl = r#"
            queue "deferrals" {
                batch-size 11
            }
        "#;
        assert!(matches!(
            parse_gate_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let kdl = r#"
            lock {
                ttl-secs 0
            }
        "#;
        assert!(matches!(
            parse_gate_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_negative_delay() {
        let kdl = r#"
            retry {
                initial-delay-ms -5
            }
        "#;
        assert!(matches!(
            parse_gate_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let kdl = r#"
            logging {
                level "loud"
            }
        "#;
        assert!(matches!(
            parse_gate_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_logging_format_text_and_default() {
        let config = parse_gate_config(
            r#"
            logging {
                level "default"
                format "text"
            }
        "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, LogLevel::Default);
        assert!(!config.logging.json);

        let config = parse_gate_config(r#"logging { level "warn"; }"#).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_rejects_unknown_logging_format() {
        let kdl = r#"
            logging {
                format "xml"
            }
        "#;
        assert!(matches!(
            parse_gate_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_json_child_is_rejected_not_ignored() {
        let kdl = r#"
            logging {
                json "yes"
            }
        "#;
        match parse_gate_config(kdl).unwrap_err() {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "logging json"),
            other => panic!("Expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = load_gate_config("/nonexistent/buildgate/gate.kdl");
        assert!(matches!(result.unwrap_err(), ConfigError::Io(_)));
    }
}
