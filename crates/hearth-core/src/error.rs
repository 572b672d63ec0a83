//! Error taxonomy shared by every Hearth component.
//!
//! Each variant is a reason a caller can act on. Internal failures from
//! extraction libraries, the filesystem, or model backends are mapped
//! onto one of these before they leave the component that saw them.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// Terminal outcome of a cancelled task. Not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Stable machine-readable code, used in task events and error turns.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::CorruptInput(_) => "corrupt_input",
            Error::ModelUnavailable(_) => "model_unavailable",
            Error::GenerationTimeout(_) => "generation_timeout",
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::NotFound(_) => "not_found",
            Error::CorruptState(_) => "corrupt_state",
            Error::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
