//! Engine configuration.
//!
//! One [`EngineConfig`] aggregates the per-stage configurations and the
//! inference client settings. Every table is optional in TOML; missing
//! fields take their defaults.
//!
//! ```toml
//! [navigation]
//! decision_threshold = 0.5
//!
//! [chunker]
//! target_tokens = 384
//!
//! [validator]
//! allow_synthesis = true
//!
//! [inference]
//! enabled = true
//! endpoint = "http://localhost:8080"
//! min_confidence = 0.6
//!
//! [inference.guard]
//! timeout_ms = 3000
//! max_retries = 1
//! ```

use std::path::Path;
use std::sync::Arc;

use policy_nav_inference::{GuardSettings, GuardedClassifier, HttpInferenceService};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunker::ChunkerConfig;
use crate::decision::DecisionConfig;
use crate::entity::EntityExtractorConfig;
use crate::error::{EngineError, Result};
use crate::extractor::NavigationConfig;
use crate::relationship::RelationshipConfig;
use crate::validator::ValidatorConfig;

/// Environment variable overriding the inference endpoint.
pub const INFERENCE_URL_ENV: &str = "POLICY_NAV_INFERENCE_URL";

/// Settings for the optional inference client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Whether any stage may consult the inference service.
    pub enabled: bool,

    /// Base URL of the classification service.
    pub endpoint: Option<String>,

    /// Model name forwarded with each request.
    pub model: Option<String>,

    /// Answers below this confidence are rejected.
    pub min_confidence: f32,

    /// Timeout, retry, backoff and cache limits.
    pub guard: GuardSettings,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: None,
            min_confidence: 0.6,
            guard: GuardSettings::default(),
        }
    }
}

impl InferenceSettings {
    /// Build the guarded HTTP classifier, or `None` when inference is off
    /// or no endpoint is configured.
    pub fn build_classifier(&self) -> Result<Option<GuardedClassifier>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(endpoint) = self.endpoint.as_deref() else {
            debug!("Inference enabled without an endpoint; running pattern-only");
            return Ok(None);
        };

        let mut service = HttpInferenceService::new()
            .with_base_url(endpoint)
            .with_request_timeout(self.guard.timeout())?;
        if let Some(model) = &self.model {
            service = service.with_model(model.clone());
        }

        info!(endpoint, "Inference client configured");
        Ok(Some(GuardedClassifier::new(
            Arc::new(service),
            self.guard.clone(),
        )))
    }
}

/// Configuration for every stage of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub navigation: NavigationConfig,
    pub chunker: ChunkerConfig,
    pub relationships: RelationshipConfig,
    pub decisions: DecisionConfig,
    pub validator: ValidatorConfig,
    pub entities: EntityExtractorConfig,
    pub inference: InferenceSettings,
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Self::from_toml_str(&contents)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::InvalidOptions(e.to_string()))
    }

    /// Check values that would make a stage misbehave.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EngineError::InvalidOptions(format!(
                    "{name} must be within 0..=1, got {value}"
                )))
            }
        };
        unit(
            "navigation.min_heading_confidence",
            self.navigation.min_heading_confidence,
        )?;
        unit(
            "navigation.decision_threshold",
            self.navigation.decision_threshold,
        )?;
        unit(
            "relationships.min_strength",
            self.relationships.min_strength,
        )?;
        unit("inference.min_confidence", self.inference.min_confidence)?;

        if self.chunker.target_tokens == 0 || self.chunker.chars_per_token == 0 {
            return Err(EngineError::InvalidOptions(
                "chunker sizes must be positive".to_string(),
            ));
        }
        if self.decisions.max_paths == 0 {
            return Err(EngineError::InvalidOptions(
                "decisions.max_paths must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `POLICY_NAV_INFERENCE_URL` when set: it enables inference and
    /// replaces the configured endpoint.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(INFERENCE_URL_ENV) {
            if !url.trim().is_empty() {
                self.inference.enabled = true;
                self.inference.endpoint = Some(url.trim().to_string());
            }
        }
        self
    }

    pub fn with_navigation(mut self, navigation: NavigationConfig) -> Self {
        self.navigation = navigation;
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_relationships(mut self, relationships: RelationshipConfig) -> Self {
        self.relationships = relationships;
        self
    }

    pub fn with_decisions(mut self, decisions: DecisionConfig) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_entities(mut self, entities: EntityExtractorConfig) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_inference(mut self, inference: InferenceSettings) -> Self {
        self.inference = inference;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [chunker]
            target_tokens = 256

            [inference]
            enabled = true
            endpoint = "http://localhost:9000"

            [inference.guard]
            timeout_ms = 750
            "#,
        )
        .unwrap();

        assert_eq!(config.chunker.target_tokens, 256);
        assert_eq!(config.chunker.chars_per_token, 4);
        assert_eq!(config.inference.guard.timeout_ms, 750);
        assert_eq!(config.inference.guard.max_retries, 2);
        assert_eq!(config.validator.min_leaves, 3);
        assert!(config.inference.enabled);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert!(!config.inference.enabled);
        assert_eq!(config.decisions.max_paths, 64);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let err = EngineConfig::from_toml_str("[navigation]\ndecision_threshold = 1.5\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));

        let err = EngineConfig::from_toml_str("[chunker]\ntarget_tokens = \"big\"\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default().with_validator(ValidatorConfig {
            allow_synthesis: false,
            ..ValidatorConfig::default()
        });
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert!(!parsed.validator.allow_synthesis);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[entities]\nvalidate_ranges = false\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.entities.validate_ranges);

        let missing = EngineConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_classifier_needs_enabled_endpoint() {
        let off = InferenceSettings::default();
        assert!(off.build_classifier().unwrap().is_none());

        let no_endpoint = InferenceSettings {
            enabled: true,
            ..InferenceSettings::default()
        };
        assert!(no_endpoint.build_classifier().unwrap().is_none());

        let on = InferenceSettings {
            enabled: true,
            endpoint: Some("http://localhost:9000".to_string()),
            ..InferenceSettings::default()
        };
        let classifier = on.build_classifier().unwrap().unwrap();
        assert_eq!(classifier.provider_name(), "http");
    }
}
