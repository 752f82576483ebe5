//! # Inference
//!
//! Advisory text classification for the policy navigation engine.
//!
//! The engine consults an external model for three narrow tasks: resolving
//! ambiguous headings, naming decision outcomes, and typing domain entities.
//! Every call is optional and fallible. Answers are labels with a confidence
//! score that the caller validates before use.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Inference Client                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  InferenceService ──► GuardedClassifier ──► Classification     │
//! │       │                    │                                    │
//! │       ▼                    ▼                                    │
//! │  HttpInferenceService  timeout / retry / ClassificationCache   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod guard;
pub mod provider;

pub use cache::ClassificationCache;
pub use error::{InferenceError, Result};
pub use guard::{GuardSettings, GuardedClassifier};
pub use provider::{
    API_KEY_ENV, Classification, ClassifyRequest, HttpInferenceService, InferenceService,
    TaskKind,
};
