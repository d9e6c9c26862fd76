//! KDL configuration parsing for the BuildGate build coordinator.
//!
//! This crate handles:
//! - Coordinator configuration (gate.kdl)
//! - Runtime log level control

pub mod error;
pub mod gate;
pub mod logging;

pub use error::{ConfigError, ConfigResult};
pub use gate::{
    GateConfig, LockSettings, LoggingSettings, QueueSettings, ResubmitSettings, RetrySettings,
    load_gate_config, parse_gate_config,
};
pub use logging::{LogControl, LogLevel};
