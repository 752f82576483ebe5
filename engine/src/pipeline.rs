//! Document processing pipeline.
//!
//! [`PolicyPipeline::process_document`] is the single entry point: raw text
//! plus a format hint in, an [`ExtractionResult`] out. Stages:
//!
//! 1. navigation extraction (headings, TOC, decision flags)
//! 2. semantic chunking
//! 3. relationship detection and graph reconciliation, run on the blocking
//!    pool while
//! 4. decision trees are extracted, validated and auto-completed
//! 5. entity extraction
//!
//! Expected failures are recorded as issues on the result. A strict run
//! returns `EngineError::StrictValidation` at the first structural violation
//! or invalid decision tree instead.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use policy_nav_inference::GuardedClassifier;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{HierarchicalChunk, SemanticChunker};
use crate::config::EngineConfig;
use crate::decision::{self, DecisionTree, DecisionTreeExtractor, TreeCompleteness};
use crate::entity::{Entity, EntityExtractor};
use crate::error::{EngineError, Result};
use crate::extractor::NavigationExtractor;
use crate::graph::{GraphBuildResult, NavigationGraphBuilder};
use crate::ids;
use crate::issue::{Issue, IssueKind, Severity};
use crate::navigation::NavigationTree;
use crate::patterns::DocumentFormat;
use crate::quality::QualityReport;
use crate::relationship::ChunkRelationshipManager;
use crate::validator::{DecisionTreeValidator, ValidationResult};

/// How a run treats structural violations and invalid decision trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Fail the run at the first violation.
    Strict,
    /// Record violations as issues and return what was built.
    #[default]
    Lenient,
}

impl std::str::FromStr for Strictness {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown strictness '{other}'")),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Soft chunk size in tokens.
    pub target_chunk_size: usize,

    /// Fraction of the target size repeated between consecutive chunks.
    pub overlap_ratio: f32,

    pub strictness: Strictness,

    /// Consult the inference service, if one is configured.
    pub inference_enabled: bool,

    /// Caller-supplied document id; derived from the text when absent.
    pub document_id: Option<String>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            target_chunk_size: 512,
            overlap_ratio: 0.15,
            strictness: Strictness::Lenient,
            inference_enabled: false,
            document_id: None,
        }
    }
}

impl ProcessOptions {
    pub const MIN_CHUNK_SIZE: usize = 16;
    pub const MAX_CHUNK_SIZE: usize = 8_192;

    pub fn strict(mut self) -> Self {
        self.strictness = Strictness::Strict;
        self
    }

    pub fn with_inference(mut self, enabled: bool) -> Self {
        self.inference_enabled = enabled;
        self
    }

    pub fn with_chunking(mut self, target_chunk_size: usize, overlap_ratio: f32) -> Self {
        self.target_chunk_size = target_chunk_size;
        self.overlap_ratio = overlap_ratio;
        self
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_CHUNK_SIZE..=Self::MAX_CHUNK_SIZE).contains(&self.target_chunk_size) {
            return Err(EngineError::InvalidOptions(format!(
                "target chunk size {} outside {}..={}",
                self.target_chunk_size,
                Self::MIN_CHUNK_SIZE,
                Self::MAX_CHUNK_SIZE
            )));
        }
        if !(0.0..0.5).contains(&self.overlap_ratio) {
            return Err(EngineError::InvalidOptions(format!(
                "overlap ratio {} outside 0..0.5",
                self.overlap_ratio
            )));
        }
        if let Some(id) = &self.document_id {
            if id.trim().is_empty() {
                return Err(EngineError::InvalidOptions(
                    "document id must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub nodes: usize,
    pub chunks: usize,
    pub relationships: usize,
    pub decision_trees: usize,
    pub complete_trees: usize,
    pub entities: usize,
    pub warnings: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run:")?;
        writeln!(f, "  Nodes: {}", self.nodes)?;
        writeln!(f, "  Chunks: {}", self.chunks)?;
        writeln!(f, "  Relationships: {}", self.relationships)?;
        writeln!(
            f,
            "  Decision trees: {} ({} complete)",
            self.decision_trees, self.complete_trees
        )?;
        writeln!(f, "  Entities: {}", self.entities)?;
        writeln!(
            f,
            "  Issues: {} warnings, {} errors",
            self.warnings, self.errors
        )?;
        write!(f, "  Elapsed: {}ms", self.elapsed_ms)
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: String,
    pub format: DocumentFormat,
    pub tree: NavigationTree,
    pub chunks: Vec<HierarchicalChunk>,

    /// Absent when the run was cancelled before the graph stage finished.
    pub graph: Option<GraphBuildResult>,

    /// Validated, auto-completed trees, in flagged-node order.
    pub decision_trees: Vec<DecisionTree>,
    pub validations: Vec<ValidationResult>,
    pub quality_report: QualityReport,
    pub entities: Vec<Entity>,
    pub issues: Vec<Issue>,

    /// Set when cancellation stopped the run early. Every structure present
    /// is complete for the stages that finished.
    pub partial: bool,
    pub stats: RunStats,
    pub processed_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues_of(kind).next().is_some()
    }

    /// No error-severity issues and the run was not cut short.
    pub fn is_success(&self) -> bool {
        !self.partial && !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn tree_for_node(&self, node_id: &str) -> Option<&DecisionTree> {
        self.decision_trees
            .iter()
            .find(|t| t.root.node_id == node_id)
    }
}

/// Stage 4 output.
#[derive(Default)]
struct DecisionStage {
    trees: Vec<DecisionTree>,
    validations: Vec<ValidationResult>,
    report: QualityReport,
    issues: Vec<Issue>,
    cancelled: bool,
}

/// Runs the extraction stages over one document at a time.
///
/// A pipeline holds no per-run state; clones share the inference client and
/// may process different documents concurrently.
#[derive(Clone, Default)]
pub struct PolicyPipeline {
    config: EngineConfig,
    classifier: Option<GuardedClassifier>,
}

impl PolicyPipeline {
    /// Build a pipeline, constructing the inference client the configuration
    /// describes.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let classifier = config.inference.build_classifier()?;
        Ok(Self { config, classifier })
    }

    /// Build a pipeline without an inference client.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            classifier: None,
        }
    }

    /// Use `classifier` for assisted stages.
    pub fn with_classifier(mut self, classifier: GuardedClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Process one document to completion.
    pub async fn process_document(
        &self,
        raw_text: &str,
        format: DocumentFormat,
        options: &ProcessOptions,
    ) -> Result<ExtractionResult> {
        self.process_document_with_cancel(raw_text, format, options, &CancellationToken::new())
            .await
    }

    /// Process one document, checking `cancel` between units of work.
    ///
    /// On cancellation the result holds the stages that completed and
    /// `partial` is set.
    pub async fn process_document_with_cancel(
        &self,
        raw_text: &str,
        format: DocumentFormat,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        options.validate()?;
        let started = Instant::now();
        let document_id = options
            .document_id
            .clone()
            .unwrap_or_else(|| ids::document_id(raw_text));
        let strict = options.strictness == Strictness::Strict;
        let min_confidence = self.config.inference.min_confidence;

        let mut issues = Vec::new();
        let classifier = if options.inference_enabled {
            if self.classifier.is_none() {
                issues.push(Issue::warning(
                    IssueKind::InferenceServiceUnavailable,
                    "inference requested but no service is configured; running pattern-only",
                ));
            }
            self.classifier.clone()
        } else {
            None
        };

        info!(
            document_id = %document_id,
            format = format.as_str(),
            bytes = raw_text.len(),
            inference = classifier.is_some(),
            "Processing document"
        );

        // Stage 1: navigation.
        let mut navigator = NavigationExtractor::new(self.config.navigation.clone());
        if let Some(classifier) = &classifier {
            navigator = navigator.with_classifier(classifier.clone(), min_confidence);
        }
        let navigation = navigator
            .extract_assisted(raw_text, format, &document_id, cancel)
            .await;
        issues.extend(navigation.issues);
        let tree = navigation.tree;
        if strict {
            fail_on_structural(&issues)?;
        }

        let mut result = ExtractionResult {
            document_id: document_id.clone(),
            format,
            tree,
            chunks: Vec::new(),
            graph: None,
            decision_trees: Vec::new(),
            validations: Vec::new(),
            quality_report: QualityReport::default(),
            entities: Vec::new(),
            issues: Vec::new(),
            partial: false,
            stats: RunStats::default(),
            processed_at: Utc::now(),
        };
        if navigation.cancelled || cancel.is_cancelled() {
            return Ok(finish_cancelled(result, issues, "navigation", started));
        }

        // Stage 2: chunks.
        let chunker = SemanticChunker::with_config(self.config.chunker.clone());
        let chunked = chunker.chunk_until(
            &result.tree,
            raw_text,
            options.target_chunk_size,
            options.overlap_ratio,
            cancel,
        );
        debug!(chunks = chunked.chunks.len(), "Chunking complete");
        if chunked.cancelled {
            result.chunks = chunked.chunks;
            return Ok(finish_cancelled(result, issues, "chunking", started));
        }

        // Stages 3 and 4 need only the tree and the chunks.
        let tree = Arc::new(result.tree);
        let chunks = Arc::new(chunked.chunks);
        let graph_task = {
            let tree = Arc::clone(&tree);
            let chunks = Arc::clone(&chunks);
            let manager = ChunkRelationshipManager::new(self.config.relationships.clone());
            tokio::task::spawn_blocking(move || {
                let relationships = manager.build_relationships(&chunks, &tree);
                NavigationGraphBuilder::new().build(&tree, &chunks, &relationships)
            })
        };
        let (graph, decisions) = tokio::join!(
            graph_task,
            self.decide(&tree, &chunks, classifier.as_ref(), cancel)
        );
        let mut graph = graph.map_err(|e| EngineError::StageJoin {
            stage: "graph",
            reason: e.to_string(),
        })?;

        result.tree = Arc::unwrap_or_clone(tree);
        result.chunks = Arc::unwrap_or_clone(chunks);
        issues.extend(graph.warnings.iter().cloned());
        issues.extend(decisions.issues);
        if strict {
            fail_on_structural(&issues)?;
            if let Some(invalid) = decisions
                .validations
                .iter()
                .find(|v| v.status == TreeCompleteness::Invalid)
            {
                let issue = invalid
                    .structural_issues()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| {
                        Issue::error(
                            IssueKind::StructuralInvariantViolation,
                            "decision tree is invalid",
                        )
                        .with_subject(&invalid.tree_id)
                    });
                return Err(EngineError::StrictValidation(issue));
            }
        }

        graph.attach_decision_trees(decisions.trees.clone());
        result.graph = Some(graph);
        result.decision_trees = decisions.trees;
        result.validations = decisions.validations;
        result.quality_report = decisions.report;
        if decisions.cancelled || cancel.is_cancelled() {
            return Ok(finish_cancelled(result, issues, "decision trees", started));
        }

        // Stage 5: entities.
        let mut entity_extractor = EntityExtractor::new(self.config.entities.clone());
        if let Some(classifier) = &classifier {
            entity_extractor = entity_extractor.with_classifier(classifier.clone(), min_confidence);
        }
        let entities = entity_extractor
            .extract_assisted(&result.tree, &result.chunks, cancel)
            .await;
        issues.extend(entities.issues);
        result.entities = entities.entities;
        if entities.cancelled {
            return Ok(finish_cancelled(result, issues, "entities", started));
        }

        result.issues = issues;
        result.stats = run_stats(&result, started);
        info!(
            document_id = %result.document_id,
            nodes = result.stats.nodes,
            chunks = result.stats.chunks,
            relationships = result.stats.relationships,
            trees = result.stats.decision_trees,
            complete = result.stats.complete_trees,
            entities = result.stats.entities,
            warnings = result.stats.warnings,
            elapsed_ms = result.stats.elapsed_ms,
            "Document processed"
        );
        Ok(result)
    }

    /// Process independent documents concurrently. Results keep input order.
    pub async fn process_many(
        &self,
        documents: Vec<(String, DocumentFormat)>,
        options: &ProcessOptions,
    ) -> Vec<Result<ExtractionResult>> {
        let mut set = JoinSet::new();
        let count = documents.len();
        for (index, (text, format)) in documents.into_iter().enumerate() {
            let pipeline = self.clone();
            let options = ProcessOptions {
                document_id: None,
                ..options.clone()
            };
            set.spawn(async move {
                let outcome = pipeline.process_document(&text, format, &options).await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<Result<ExtractionResult>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => warn!(error = %e, "Document task did not complete"),
            }
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(EngineError::StageJoin {
                        stage: "document",
                        reason: "task aborted".to_string(),
                    })
                })
            })
            .collect()
    }

    async fn decide(
        &self,
        tree: &NavigationTree,
        chunks: &[HierarchicalChunk],
        classifier: Option<&GuardedClassifier>,
        cancel: &CancellationToken,
    ) -> DecisionStage {
        let mut extractor = DecisionTreeExtractor::new(self.config.decisions.clone());
        if let Some(classifier) = classifier {
            extractor =
                extractor.with_classifier(classifier.clone(), self.config.inference.min_confidence);
        }
        let extraction = extractor.extract_assisted(tree, chunks, cancel).await;
        let validator = DecisionTreeValidator::new(self.config.validator.clone());

        let mut stage = DecisionStage {
            issues: extraction.issues,
            cancelled: extraction.cancelled,
            ..DecisionStage::default()
        };
        stage.issues.extend(decision::empty_trees(&extraction.trees));
        for extracted in &extraction.trees {
            let tree = validator.auto_complete(extracted);
            let validation = validator.validate(&tree);
            if validation.status != extracted.status {
                debug!(
                    tree_id = %tree.id,
                    from = extracted.status.as_str(),
                    to = validation.status.as_str(),
                    "Decision tree auto-completed"
                );
            }
            stage.issues.extend(validation.issues.iter().cloned());
            stage.validations.push(validation);
            stage.trees.push(tree);
        }
        stage.report = validator.report(&stage.trees);
        stage
    }
}

fn fail_on_structural(issues: &[Issue]) -> Result<()> {
    match issues.iter().find(|i| i.is_structural()) {
        Some(issue) => Err(EngineError::StrictValidation(issue.clone())),
        None => Ok(()),
    }
}

fn finish_cancelled(
    mut result: ExtractionResult,
    mut issues: Vec<Issue>,
    stage: &str,
    started: Instant,
) -> ExtractionResult {
    warn!(document_id = %result.document_id, stage, "Run cancelled");
    issues.push(
        Issue::warning(
            IssueKind::Cancelled,
            format!("run cancelled during {stage}; later stages were skipped"),
        )
        .with_subject(&result.document_id),
    );
    result.issues = issues;
    result.partial = true;
    result.stats = run_stats(&result, started);
    result
}

fn run_stats(result: &ExtractionResult, started: Instant) -> RunStats {
    RunStats {
        nodes: result.tree.len(),
        chunks: result.chunks.len(),
        relationships: result
            .graph
            .as_ref()
            .map_or(0, |g| g.graph.relationships.len()),
        decision_trees: result.decision_trees.len(),
        complete_trees: result
            .decision_trees
            .iter()
            .filter(|t| t.is_complete)
            .count(),
        entities: result.entities.len(),
        warnings: result
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count(),
        errors: result
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
