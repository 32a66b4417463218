//! Error types for the metering core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum MeterError {
    /// Rule failed validation on install
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule {
        /// set.name identifier of the offending rule
        rule: String,
        /// what was wrong
        reason: String,
    },

    /// Filter definition rejected
    #[error("invalid filter '{0}': {1}")]
    InvalidFilter(String, String),

    /// Classifier capacity exceeded (rules, chunks or phases)
    #[error("classifier capacity exceeded: {0}")]
    ClassifierCapacity(String),

    /// Unknown metric or export module
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// Module rejected its parameters
    #[error("module '{module}' rejected parameters: {reason}")]
    ModuleParams {
        /// module name
        module: String,
        /// module-reported reason
        reason: String,
    },

    /// Rule id not present
    #[error("no such rule: {0}")]
    NoSuchRule(String),

    /// Packet source is dead
    #[error("packet source error: {0}")]
    SourceDead(String),

    /// Another instance is already running
    #[error("already running (pid {0})")]
    AlreadyRunning(u32),

    /// Malformed trace file
    #[error("bad trace file: {0}")]
    BadTrace(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the core
pub type MeterResult<T> = Result<T, MeterError>;

impl MeterError {
    /// Short machine-readable code for control-channel replies.
    pub fn code(&self) -> &'static str {
        match self {
            MeterError::InvalidRule { .. } => "invalid_rule",
            MeterError::InvalidFilter(..) => "invalid_filter",
            MeterError::ClassifierCapacity(_) => "capacity",
            MeterError::UnknownModule(_) => "unknown_module",
            MeterError::ModuleParams { .. } => "module_params",
            MeterError::NoSuchRule(_) => "no_such_rule",
            MeterError::SourceDead(_) => "source_dead",
            MeterError::AlreadyRunning(_) => "already_running",
            MeterError::BadTrace(_) => "bad_trace",
            MeterError::Io(_) => "io",
        }
    }
}
