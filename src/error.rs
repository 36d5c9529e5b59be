use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use thiserror::Error;

use crate::status::Stage;


#[derive(Debug, Error)]
pub enum Error {
    #[error("task {0} is already registered")]
    DuplicateTask(String),

    #[error("{kind}: {message}")]
    ComputationFailed { kind: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid artifact id: {0:?}")]
    InvalidArtifact(String),

    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("status of {task} has no {property:?} property")]
    MissingProperty { task: String, property: &'static str },

    #[error("status of {task} has an invalid {property:?} property: {value:?}")]
    InvalidProperty { task: String, property: &'static str, value: String },

    #[error("referrable object {0} not found")]
    ReferrableNotFound(String),

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("dependency cycle through {0}")]
    DependencyCycle(String),

    #[error("cache file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache record error: {0}")]
    Json(#[from] serde_json::Error),
}


#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} is already processing")]
    AlreadyProcessing(String),

    #[error("{key} cannot move from {from:?} to {to:?}")]
    InvalidTransition { key: String, from: Stage, to: Stage },

    #[error("storage error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("could not publish result of {key}: {message}")]
    Publish { key: String, message: String },
}


/// Failure of a single computation attempt.
///
/// The captured backtrace is only populated when `RUST_BACKTRACE` or
/// `RUST_LIB_BACKTRACE` asks for it.
pub struct ComputationError {
    message: String,
    backtrace: Backtrace,
}

impl ComputationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message followed by the backtrace, when one was captured.
    pub fn diagnostic(&self) -> String {
        match self.backtrace.status() {
            BacktraceStatus::Captured => format!("{}\n{}", self.message, self.backtrace),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Debug for ComputationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ComputationError: {}", self.message)
    }
}

impl fmt::Display for ComputationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ComputationError {}

impl From<std::io::Error> for ComputationError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("io error: {}", err))
    }
}

impl From<serde_json::Error> for ComputationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("record error: {}", err))
    }
}

impl From<Error> for ComputationError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}
