//! # Policy Navigation Engine
//!
//! Turns the plain text of a policy manual into a hierarchical navigation
//! structure and executable decision trees:
//!
//! - **Navigation extraction**: chapters, sections and subsections with
//!   provenance, TOC corroboration and decision-flow flags
//! - **Semantic chunking**: heading-bounded chunks that never split a
//!   decision clause
//! - **Relationships**: evidence-scored edges between chunks
//! - **Decision trees**: ROOT -> BRANCH -> LEAF trees with guaranteed
//!   APPROVE / DECLINE / REFER outcomes, validated and auto-completed
//! - **Entities**: thresholds, ranges and domain vocabulary with their
//!   navigation path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     process_document                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  raw text ──► NavigationExtractor ──► NavigationTree            │
//! │                                            │                    │
//! │                                            ▼                    │
//! │                                     SemanticChunker             │
//! │                                            │                    │
//! │                 ┌──────────────────────────┴────────┐           │
//! │                 ▼                                   ▼           │
//! │   ChunkRelationshipManager            DecisionTreeExtractor     │
//! │                 │                                   │           │
//! │                 ▼                                   ▼           │
//! │   NavigationGraphBuilder              DecisionTreeValidator     │
//! │                 └──────────────┬────────────────────┘           │
//! │                                ▼                                │
//! │             EntityExtractor ──► ExtractionResult                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inference assistance is optional. Every call goes through a
//! [`policy_nav_inference::GuardedClassifier`]; failures degrade to the
//! pattern-only result and are recorded as issues.

mod assist;

// Structure
pub mod extractor;
pub mod ids;
pub mod navigation;
pub mod node;
pub mod patterns;

// Content
pub mod chunker;
pub mod entity;
pub mod graph;
pub mod relationship;

// Decisions
pub mod decision;
pub mod validator;

// Run plumbing
pub mod config;
pub mod error;
pub mod issue;
pub mod pipeline;
pub mod quality;
pub mod storage;

pub use chunker::{ChunkStats, ChunkType, ChunkerConfig, HierarchicalChunk, SemanticChunker};
pub use config::{EngineConfig, InferenceSettings};
pub use decision::{
    BranchTarget, Condition, DecisionBranch, DecisionConfig, DecisionLeaf, DecisionPath,
    DecisionTree, DecisionTreeExtractor, TreeCompleteness,
};
pub use entity::{Entity, EntityExtractor, EntityExtractorConfig, EntityType};
pub use error::{EngineError, Result};
pub use extractor::{NavigationConfig, NavigationExtractor};
pub use graph::{GraphBuildResult, NavigationGraph, NavigationGraphBuilder, NavigationGraphMetrics};
pub use issue::{Issue, IssueKind, Severity};
pub use navigation::{NavigationStats, NavigationTree};
pub use node::{NavigationNode, NodeType, SourceSpan};
pub use patterns::{ComparisonOp, DocumentFormat, OutcomeKind};
pub use pipeline::{ExtractionResult, PolicyPipeline, ProcessOptions, RunStats, Strictness};
pub use quality::{NavigationQuality, QualityReport, TreeQuality};
pub use relationship::{ChunkRelationship, ChunkRelationshipManager, RelationshipType};
pub use storage::{Snapshot, SnapshotSink, SnapshotStore};
pub use validator::{DecisionTreeValidator, ValidationResult, ValidatorConfig};
