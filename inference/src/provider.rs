//! Classification providers.
//!
//! The engine only ever asks one question of an external model: "which of
//! these labels best describes this span of text, and how sure are you?".
//! Everything returned here is advisory; callers re-validate labels against
//! their own structural rules before acting on them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{InferenceError, Result};

/// Environment variable consulted for the provider API key.
pub const API_KEY_ENV: &str = "POLICY_NAV_INFERENCE_API_KEY";

/// What the caller wants the span classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Is this line a heading, and at which level?
    HeadingDisambiguation,
    /// Which outcome does this clause lead to?
    DecisionOutcome,
    /// What kind of domain entity is this term?
    EntityTyping,
}

impl TaskKind {
    /// Stable wire name for the task.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeadingDisambiguation => "heading_disambiguation",
            Self::DecisionOutcome => "decision_outcome",
            Self::EntityTyping => "entity_typing",
        }
    }
}

/// Request for classifying a span of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    /// The span to classify.
    pub text: String,

    /// The classification task.
    pub task: TaskKind,

    /// Labels the caller is prepared to accept.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ClassifyRequest {
    /// Create a new classification request.
    pub fn new(text: impl Into<String>, task: TaskKind) -> Self {
        Self {
            text: text.into(),
            task,
            labels: Vec::new(),
        }
    }

    /// Restrict the answer to the given labels.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// A label with the provider's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// The chosen label.
    pub label: String,

    /// Confidence score (0.0 to 1.0).
    pub confidence: f32,
}

impl Classification {
    /// Create a new classification.
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Whether the label is one of `allowed` (case-insensitive).
    pub fn is_one_of(&self, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|a| a.eq_ignore_ascii_case(&self.label))
    }
}

/// Trait for classification providers.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Classify a span of text.
    async fn classify(&self, request: ClassifyRequest) -> Result<Classification>;

    /// Check if the provider is usable (endpoint set, credentials present, ...).
    fn is_available(&self) -> bool;
}

/// HTTP classification provider.
///
/// Speaks a minimal JSON protocol: `POST {base_url}/classify` with
/// `{"text", "task", "labels"}` and expects `{"label", "confidence"}`.
pub struct HttpInferenceService {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: Option<String>,

    /// HTTP client.
    client: reqwest::Client,

    /// Model name forwarded to the service, if any.
    model: Option<String>,
}

impl HttpInferenceService {
    /// Create a provider with no endpoint; configure with [`Self::with_base_url`].
    pub fn new() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV).ok(),
            base_url: None,
            client: reqwest::Client::new(),
            model: None,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    /// Set the model forwarded with every request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Use a client with a transport-level timeout.
    ///
    /// The guard applies its own timeout as well; this one only bounds
    /// connection setup and body transfer inside a single attempt.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }
}

impl Default for HttpInferenceService {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyResponseBody {
    label: String,
    confidence: f32,
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    fn name(&self) -> &str {
        "http"
    }

    async fn classify(&self, request: ClassifyRequest) -> Result<Classification> {
        let base_url = self
            .base_url
            .as_ref()
            .ok_or(InferenceError::ProviderNotConfigured)?;

        debug!(task = request.task.as_str(), "Sending classification request");

        let mut body = serde_json::json!({
            "text": request.text,
            "task": request.task.as_str(),
            "labels": request.labels,
        });
        if let Some(ref model) = self.model {
            body["model"] = serde_json::json!(model);
        }

        let mut builder = self
            .client
            .post(format!("{base_url}/classify"))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref api_key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);

            return Err(InferenceError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            || status == reqwest::StatusCode::BAD_GATEWAY
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            return Err(InferenceError::Unavailable(format!("status {status}")));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::ApiRequest(format!(
                "status {status}: {error_text}"
            )));
        }

        let text = response.text().await?;
        let parsed: ClassifyResponseBody = serde_json::from_str(&text)?;

        if !(0.0..=1.0).contains(&parsed.confidence) || parsed.label.trim().is_empty() {
            return Err(InferenceError::InvalidResponse(format!(
                "label {:?} with confidence {}",
                parsed.label, parsed.confidence
            )));
        }

        info!(
            task = request.task.as_str(),
            label = %parsed.label,
            confidence = parsed.confidence,
            "Classification received"
        );

        Ok(Classification::new(parsed.label, parsed.confidence))
    }

    fn is_available(&self) -> bool {
        self.base_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_classification_clamps_confidence() {
        let c = Classification::new("section", 1.7);
        assert_eq!(c.confidence, 1.0);
        assert!(c.is_one_of(&["SECTION".to_string()]));
        assert!(!c.is_one_of(&["chapter".to_string()]));
    }

    #[test]
    fn test_unconfigured_provider_is_unavailable() {
        let provider = HttpInferenceService::new();
        assert!(!provider.is_available());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_errors() {
        let provider = HttpInferenceService::new();
        let err = provider
            .classify(ClassifyRequest::new("1.1 Scope", TaskKind::HeadingDisambiguation))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::ProviderNotConfigured));
    }

    #[tokio::test]
    async fn test_classify_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "task": "heading_disambiguation"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"label": "section", "confidence": 0.82})),
            )
            .mount(&server)
            .await;

        let provider = HttpInferenceService::new()
            .with_base_url(server.uri())
            .with_api_key("secret");

        let result = provider
            .classify(
                ClassifyRequest::new("INCOME DOCUMENTATION", TaskKind::HeadingDisambiguation)
                    .with_labels(["chapter", "section", "not_heading"]),
            )
            .await
            .unwrap();

        assert_eq!(result, Classification::new("section", 0.82));
    }

    #[tokio::test]
    async fn test_classify_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let provider = HttpInferenceService::new().with_base_url(server.uri());
        let err = provider
            .classify(ClassifyRequest::new("x", TaskKind::EntityTyping))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InferenceError::RateLimited {
                retry_after_secs: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_classify_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = HttpInferenceService::new().with_base_url(server.uri());
        let err = provider
            .classify(ClassifyRequest::new("x", TaskKind::DecisionOutcome))
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_classify_rejects_out_of_range_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"label": "approve", "confidence": 4.0})),
            )
            .mount(&server)
            .await;

        let provider = HttpInferenceService::new().with_base_url(server.uri());
        let err = provider
            .classify(ClassifyRequest::new("x", TaskKind::DecisionOutcome))
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::InvalidResponse(_)));
    }
}
