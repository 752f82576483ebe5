//! Error types for the navigation engine.
//!
//! Expected failure modes of an extraction run (no headings found, inference
//! timeouts, incomplete decision trees) are reported as [`Issue`]s on the run
//! result. `EngineError` covers the cases where no usable result exists.
//!
//! [`Issue`]: crate::issue::Issue

use policy_nav_inference::InferenceError;
use thiserror::Error;

use crate::issue::Issue;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that abort an engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A strict run hit a structural invariant violation or an invalid tree.
    #[error("strict validation failed: {0}")]
    StrictValidation(Issue),

    /// A tree operation would break the arena's parent/child structure.
    #[error("structure error: {0}")]
    Structure(String),

    /// Caller-supplied options are out of range.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// The inference client could not be constructed.
    #[error("inference setup failed: {0}")]
    Inference(#[from] InferenceError),

    /// Snapshot storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A background stage panicked or was aborted.
    #[error("stage '{stage}' did not complete: {reason}")]
    StageJoin { stage: &'static str, reason: String },
}
