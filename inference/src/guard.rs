//! Timeout, retry and caching around an [`InferenceService`].
//!
//! Every call the engine makes to an external model goes through a
//! [`GuardedClassifier`]: each attempt is bounded by a timeout, retryable
//! failures are retried a bounded number of times, and the answer must use
//! one of the labels the caller offered.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::ClassificationCache;
use crate::error::{InferenceError, Result};
use crate::provider::{Classification, ClassifyRequest, InferenceService};

/// Limits applied to every guarded call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Timeout per attempt, in milliseconds.
    pub timeout_ms: u64,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Base backoff between attempts, in milliseconds (multiplied by attempt number).
    pub backoff_ms: u64,

    /// Cache capacity; zero disables caching.
    pub cache_entries: usize,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 2,
            backoff_ms: 200,
            cache_entries: 1_024,
        }
    }
}

impl GuardSettings {
    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A classifier that never waits unboundedly.
#[derive(Clone)]
pub struct GuardedClassifier {
    service: Arc<dyn InferenceService>,
    settings: GuardSettings,
    cache: Option<ClassificationCache>,
}

impl GuardedClassifier {
    /// Wrap a service with the given limits.
    pub fn new(service: Arc<dyn InferenceService>, settings: GuardSettings) -> Self {
        let cache = (settings.cache_entries > 0)
            .then(|| ClassificationCache::new(settings.cache_entries));
        Self {
            service,
            settings,
            cache,
        }
    }

    /// Name of the wrapped provider.
    pub fn provider_name(&self) -> &str {
        self.service.name()
    }

    /// The limits in effect.
    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    /// Classify with timeout, bounded retries, label validation and caching.
    pub async fn classify(&self, request: ClassifyRequest) -> Result<Classification> {
        if !self.service.is_available() {
            return Err(InferenceError::Unavailable(format!(
                "provider '{}' is not available",
                self.service.name()
            )));
        }

        if let Some(ref cache) = self.cache {
            if let Some(hit) = cache.get(&request.text, request.task, &request.labels).await {
                debug!(task = request.task.as_str(), "Classification cache hit");
                return Ok(hit);
            }
        }

        let timeout = self.settings.timeout();
        let attempts = self.settings.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(timeout, self.service.classify(request.clone())).await;

            let error = match outcome {
                Ok(Ok(classification)) => {
                    if !classification.is_one_of(&request.labels) {
                        // A label outside the offered set is never retried.
                        return Err(InferenceError::InvalidResponse(format!(
                            "label '{}' not among {:?}",
                            classification.label, request.labels
                        )));
                    }
                    if let Some(ref cache) = self.cache {
                        cache
                            .put(
                                &request.text,
                                request.task,
                                &request.labels,
                                classification.clone(),
                            )
                            .await;
                    }
                    return Ok(classification);
                }
                Ok(Err(err)) => err,
                Err(_) => InferenceError::Timeout {
                    timeout_ms: self.settings.timeout_ms,
                },
            };

            if !error.is_retryable() || attempt == attempts {
                warn!(
                    task = request.task.as_str(),
                    attempt,
                    error = %error,
                    "Classification failed"
                );
                return Err(error);
            }

            debug!(
                task = request.task.as_str(),
                attempt,
                error = %error,
                "Retrying classification"
            );
            last_error = Some(error);
            tokio::time::sleep(Duration::from_millis(
                self.settings.backoff_ms * u64::from(attempt),
            ))
            .await;
        }

        Err(last_error.unwrap_or(InferenceError::Unavailable(
            "no attempts were made".to_string(),
        )))
    }
}
