//! Typed relationships between chunks.
//!
//! Each relationship type has an independent detector that turns chunk
//! features into [`RelationshipCandidate`]s, one per piece of evidence. The
//! reducer ([`merge_candidates`]) folds candidates for the same
//! (source, target, type) into one [`ChunkRelationship`]: strength is the sum
//! of evidence weights (one per detection method, capped at 1), confidence is
//! the best method confidence. Edges below the minimum strength are dropped,
//! so most relationships need more than one weak signal to survive.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunker::{self, ChunkType, HierarchicalChunk};
use crate::ids;
use crate::navigation::NavigationTree;
use crate::node::NavigationNode;
use crate::patterns::{self, CrossReference, OutcomeKind};

/// Type of relationship between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Ancestor node's chunk to a descendant node's chunk.
    ParentChild,
    /// Earlier to later chunk in reading order.
    Sequential,
    /// A chunk points at another section.
    References,
    /// Decision root to an evaluation criterion.
    DecisionBranch,
    /// Criterion to the chunk stating its outcome.
    DecisionOutcome,
    /// A rule to the condition or exception that qualifies it.
    Conditional,
    /// Detail or example to the statement it expands.
    Elaborates,
    /// Summary to the passage it summarizes.
    Summarizes,
    /// Chunks citing the same external document.
    InterDocument,
    /// Matrix/grid to the guideline text that uses it.
    MatrixGuideline,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 10] = [
        Self::ParentChild,
        Self::Sequential,
        Self::References,
        Self::DecisionBranch,
        Self::DecisionOutcome,
        Self::Conditional,
        Self::Elaborates,
        Self::Summarizes,
        Self::InterDocument,
        Self::MatrixGuideline,
    ];

    /// Get a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentChild => "PARENT_CHILD",
            Self::Sequential => "SEQUENTIAL",
            Self::References => "REFERENCES",
            Self::DecisionBranch => "DECISION_BRANCH",
            Self::DecisionOutcome => "DECISION_OUTCOME",
            Self::Conditional => "CONDITIONAL",
            Self::Elaborates => "ELABORATES",
            Self::Summarizes => "SUMMARIZES",
            Self::InterDocument => "INTER_DOCUMENT",
            Self::MatrixGuideline => "MATRIX_GUIDELINE",
        }
    }
}

/// How a piece of relationship evidence was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Position in the navigation tree or chunk order.
    Structural,
    /// "see Section 2.1".
    ExplicitReference,
    /// A bare "Section 2.1" mention.
    BareReference,
    /// The target's heading title appears in the text.
    TitleMention,
    NumericComparison,
    RequirementLanguage,
    ConditionalLanguage,
    OutcomeLanguage,
    ElaborationMarker,
    SummaryMarker,
    /// Shared significant vocabulary.
    TermOverlap,
    /// Shared numeric values.
    SharedNumbers,
    TableMention,
    ExternalCitation,
}

impl DetectionMethod {
    /// Reliability of the method, independent of the matched text.
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Structural => 1.0,
            Self::ExplicitReference => 0.9,
            Self::NumericComparison => 0.85,
            Self::OutcomeLanguage | Self::ExternalCitation => 0.8,
            Self::RequirementLanguage => 0.75,
            Self::ConditionalLanguage | Self::ElaborationMarker | Self::SummaryMarker => 0.7,
            Self::BareReference | Self::TitleMention | Self::SharedNumbers | Self::TableMention => {
                0.6
            }
            Self::TermOverlap => 0.5,
        }
    }
}

/// Evidence for a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEvidence {
    pub method: DetectionMethod,

    /// The text or pattern that provides evidence.
    pub matched_text: String,

    /// Strength contribution from this evidence.
    pub weight: f32,
}

/// One detector's vote for an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipCandidate {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub evidence: RelationshipEvidence,
}

impl RelationshipCandidate {
    pub fn new(
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
        method: DetectionMethod,
        matched_text: impl Into<String>,
        weight: f32,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relationship_type,
            evidence: RelationshipEvidence {
                method,
                matched_text: matched_text.into(),
                weight,
            },
        }
    }
}

/// A directed, typed edge between two chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRelationship {
    /// Unique identifier.
    pub id: String,

    pub source_id: String,

    pub target_id: String,

    pub relationship_type: RelationshipType,

    /// Combined evidence weight (0.0 to 1.0).
    pub strength: f32,

    /// Reliability of the best detection method (0.0 to 1.0).
    pub confidence: f32,

    /// Evidence supporting this relationship.
    pub evidence: Vec<RelationshipEvidence>,
}

impl ChunkRelationship {
    /// Whether more than one detection method backs this edge.
    pub fn is_corroborated(&self) -> bool {
        self.evidence.len() > 1
    }

    /// Get a string representation of this relationship.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{} --[{}]--> {}",
            self.source_id,
            self.relationship_type.as_str(),
            self.target_id
        )
    }
}

/// Configuration for relationship detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    /// Minimum combined strength for an edge to be kept.
    pub min_strength: f32,

    /// Minimum term overlap (Jaccard) counted as evidence.
    pub min_term_overlap: f32,

    /// Titles shorter than this are not matched by name.
    pub min_title_len: usize,

    /// How many following chunks are searched for a criterion's outcome.
    pub outcome_window: usize,

    /// Upper bound on targets per summary chunk.
    pub max_summary_targets: usize,

    /// Minimum term overlap between a summary and a passage it summarizes.
    pub min_summary_overlap: f32,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            min_strength: 0.5,
            min_term_overlap: 0.15,
            min_title_len: 12,
            outcome_window: 3,
            max_summary_targets: 5,
            min_summary_overlap: 0.2,
        }
    }
}

/// Features of one chunk, computed once per run.
struct ChunkFeatures<'a> {
    chunk: &'a HierarchicalChunk,
    text: &'a str,
    lower: String,
    terms: HashSet<String>,
    numbers: HashSet<String>,
    refs: Vec<CrossReference>,
    comparison: Option<String>,
    requirement: bool,
    conditional: Option<String>,
    outcome: Option<(OutcomeKind, String)>,
    elaboration: Option<String>,
    summary: bool,
    table: Option<String>,
}

impl<'a> ChunkFeatures<'a> {
    fn new(chunk: &'a HierarchicalChunk) -> Self {
        let text = chunk.own_text();
        let header = chunk.chunk_type == ChunkType::Header;
        Self {
            chunk,
            text,
            lower: text.to_lowercase(),
            terms: patterns::significant_terms(text),
            numbers: patterns::numeric_tokens(text),
            refs: if header {
                Vec::new()
            } else {
                patterns::cross_references(text)
            },
            comparison: patterns::comparisons(text).into_iter().next().map(|c| c.matched),
            requirement: patterns::has_requirement(text),
            conditional: patterns::conditional_keyword(text),
            outcome: patterns::find_outcome(text),
            elaboration: patterns::elaboration_marker(text),
            summary: chunk.chunk_type == ChunkType::Summary || patterns::is_summary_text(text),
            table: patterns::table_mention(text),
        }
    }

    fn is_header(&self) -> bool {
        self.chunk.chunk_type == ChunkType::Header
    }

    fn is_criterion(&self) -> bool {
        !self.is_header()
            && (self.comparison.is_some() || self.requirement || self.conditional.is_some())
    }
}

/// Shared read-only state for the detectors.
pub struct DetectionContext<'a> {
    tree: &'a NavigationTree,
    config: &'a RelationshipConfig,
    features: Vec<ChunkFeatures<'a>>,
    /// Feature indices per node, in chunk order.
    by_node: HashMap<&'a str, Vec<usize>>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(
        chunks: &'a [HierarchicalChunk],
        tree: &'a NavigationTree,
        config: &'a RelationshipConfig,
    ) -> Self {
        let mut ordered: Vec<&HierarchicalChunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.sequence);
        let features: Vec<ChunkFeatures<'a>> = ordered.into_iter().map(ChunkFeatures::new).collect();

        let mut by_node: HashMap<&'a str, Vec<usize>> = HashMap::new();
        for (idx, f) in features.iter().enumerate() {
            by_node.entry(f.chunk.node_id.as_str()).or_default().push(idx);
        }
        Self {
            tree,
            config,
            features,
            by_node,
        }
    }

    fn node_chunks(&self, node_id: &str) -> &[usize] {
        self.by_node.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// First body chunk of a node, or its header when it has no body.
    fn anchor(&self, node_id: &str) -> Option<usize> {
        let own = self.node_chunks(node_id);
        own.iter()
            .copied()
            .find(|&i| !self.features[i].is_header())
            .or_else(|| own.first().copied())
    }

    /// Chunks of `node` and all its descendants, in chunk order.
    fn subtree(&self, node: &NavigationNode) -> Vec<usize> {
        let mut idx: Vec<usize> = self.node_chunks(&node.id).to_vec();
        for d in self.tree.descendants(&node.id) {
            idx.extend_from_slice(self.node_chunks(&d.id));
        }
        idx.sort_unstable();
        idx
    }

    fn id(&self, idx: usize) -> &str {
        &self.features[idx].chunk.id
    }

    fn candidate(
        &self,
        source: usize,
        target: usize,
        relationship_type: RelationshipType,
        method: DetectionMethod,
        matched: impl Into<String>,
        weight: f32,
    ) -> RelationshipCandidate {
        RelationshipCandidate::new(
            self.id(source),
            self.id(target),
            relationship_type,
            method,
            matched,
            weight,
        )
    }

    fn overlap(&self, a: usize, b: usize) -> f32 {
        patterns::term_overlap(&self.features[a].terms, &self.features[b].terms)
    }
}

/// Explicit and bare section references, corroborated by title mentions.
pub fn detect_references(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    let titled: Vec<&NavigationNode> = ctx
        .tree
        .nodes_in_order()
        .filter(|n| !n.is_root() && n.title.len() >= ctx.config.min_title_len)
        .collect();

    for (i, f) in ctx.features.iter().enumerate() {
        if f.is_header() {
            continue;
        }
        for r in &f.refs {
            let Some(node) = ctx.tree.find_by_numbering(&r.numbering) else {
                continue;
            };
            if node.id == f.chunk.node_id {
                continue;
            }
            let Some(target) = ctx.anchor(&node.id) else {
                continue;
            };
            let (method, weight) = if r.explicit {
                (DetectionMethod::ExplicitReference, 0.7)
            } else {
                (DetectionMethod::BareReference, 0.4)
            };
            out.push(ctx.candidate(
                i,
                target,
                RelationshipType::References,
                method,
                r.matched.clone(),
                weight,
            ));
        }

        for node in &titled {
            if node.id == f.chunk.node_id {
                continue;
            }
            let title = node.title.to_lowercase();
            if !f.lower.contains(&title) {
                continue;
            }
            if let Some(target) = ctx.anchor(&node.id) {
                out.push(ctx.candidate(
                    i,
                    target,
                    RelationshipType::References,
                    DetectionMethod::TitleMention,
                    node.title.clone(),
                    0.3,
                ));
            }
        }
    }
    out
}

/// Decision branches: from a flagged node's anchor to each criterion chunk
/// in its subtree. Decision outcomes: from a criterion to the next chunks
/// stating an outcome.
pub fn detect_decisions(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    for node in ctx.tree.flagged_nodes() {
        let Some(&root) = ctx.node_chunks(&node.id).first() else {
            continue;
        };
        let scope = ctx.subtree(node);

        for &i in &scope {
            let f = &ctx.features[i];
            if i == root || !f.is_criterion() {
                continue;
            }
            let label = node.label();
            out.push(ctx.candidate(
                root,
                i,
                RelationshipType::DecisionBranch,
                DetectionMethod::Structural,
                label,
                0.2,
            ));
            if let Some(ref c) = f.comparison {
                out.push(ctx.candidate(
                    root,
                    i,
                    RelationshipType::DecisionBranch,
                    DetectionMethod::NumericComparison,
                    c.clone(),
                    0.4,
                ));
            }
            if f.requirement {
                out.push(ctx.candidate(
                    root,
                    i,
                    RelationshipType::DecisionBranch,
                    DetectionMethod::RequirementLanguage,
                    "requirement",
                    0.3,
                ));
            }
            if let Some(ref kw) = f.conditional {
                out.push(ctx.candidate(
                    root,
                    i,
                    RelationshipType::DecisionBranch,
                    DetectionMethod::ConditionalLanguage,
                    kw.clone(),
                    0.2,
                ));
            }
        }

        for (pos, &i) in scope.iter().enumerate() {
            let f = &ctx.features[i];
            if !f.is_criterion() {
                continue;
            }
            for (step, &j) in scope
                .iter()
                .skip(pos + 1)
                .take(ctx.config.outcome_window)
                .enumerate()
            {
                let Some((ref outcome, ref matched)) = ctx.features[j].outcome else {
                    continue;
                };
                out.push(ctx.candidate(
                    i,
                    j,
                    RelationshipType::DecisionOutcome,
                    DetectionMethod::OutcomeLanguage,
                    format!("{} ({matched})", outcome.label()),
                    0.4,
                ));
                if step == 0 {
                    out.push(ctx.candidate(
                        i,
                        j,
                        RelationshipType::DecisionOutcome,
                        DetectionMethod::Structural,
                        "adjacent",
                        0.2,
                    ));
                }
                if let Some(ref kw) = f.conditional {
                    out.push(ctx.candidate(
                        i,
                        j,
                        RelationshipType::DecisionOutcome,
                        DetectionMethod::ConditionalLanguage,
                        kw.clone(),
                        0.2,
                    ));
                }
            }
        }
    }
    out
}

const EXCEPTION_OPENERS: [&str; 6] = ["unless", "except", "provided", "however", "if", "when"];

/// Conditional edges: "subject to Section N" references, and exception
/// chunks that qualify the chunk before them.
pub fn detect_conditionals(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    for (i, f) in ctx.features.iter().enumerate() {
        if f.is_header() {
            continue;
        }
        for r in f.refs.iter().filter(|r| r.conditional) {
            let Some(node) = ctx.tree.find_by_numbering(&r.numbering) else {
                continue;
            };
            if node.id == f.chunk.node_id {
                continue;
            }
            let Some(target) = ctx.anchor(&node.id) else {
                continue;
            };
            out.push(ctx.candidate(
                i,
                target,
                RelationshipType::Conditional,
                DetectionMethod::ConditionalLanguage,
                r.matched.clone(),
                0.4,
            ));
            if r.explicit {
                out.push(ctx.candidate(
                    i,
                    target,
                    RelationshipType::Conditional,
                    DetectionMethod::ExplicitReference,
                    r.matched.clone(),
                    0.3,
                ));
            }
        }

        let opener = f.lower.trim_start();
        let Some(kw) = EXCEPTION_OPENERS.iter().find(|kw| {
            opener
                .strip_prefix(**kw)
                .is_some_and(|rest| rest.starts_with(|c: char| !c.is_alphanumeric()))
        }) else {
            continue;
        };
        let Some(prev) = previous_body_chunk(ctx, i) else {
            continue;
        };
        out.push(ctx.candidate(
            prev,
            i,
            RelationshipType::Conditional,
            DetectionMethod::ConditionalLanguage,
            *kw,
            0.3,
        ));
        out.push(ctx.candidate(
            prev,
            i,
            RelationshipType::Conditional,
            DetectionMethod::Structural,
            "adjacent",
            0.1,
        ));
        let overlap = ctx.overlap(prev, i);
        if overlap >= ctx.config.min_term_overlap {
            out.push(ctx.candidate(
                prev,
                i,
                RelationshipType::Conditional,
                DetectionMethod::TermOverlap,
                format!("{overlap:.2}"),
                0.2,
            ));
        }
    }
    out
}

fn previous_body_chunk(ctx: &DetectionContext<'_>, idx: usize) -> Option<usize> {
    let own = ctx.node_chunks(&ctx.features[idx].chunk.node_id);
    let pos = own.iter().position(|&i| i == idx)?;
    let prev = *own.get(pos.checked_sub(1)?)?;
    (!ctx.features[prev].is_header()).then_some(prev)
}

/// Elaboration: an example or detail chunk to the statement it expands,
/// either the previous chunk of its node or an ancestor chunk restating the
/// same figures.
pub fn detect_elaborations(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    for (i, f) in ctx.features.iter().enumerate() {
        if f.is_header() {
            continue;
        }
        if let Some(ref marker) = f.elaboration {
            if let Some(prev) = previous_body_chunk(ctx, i) {
                out.push(ctx.candidate(
                    i,
                    prev,
                    RelationshipType::Elaborates,
                    DetectionMethod::ElaborationMarker,
                    marker.clone(),
                    0.4,
                ));
                let overlap = ctx.overlap(i, prev);
                if overlap >= ctx.config.min_term_overlap {
                    out.push(ctx.candidate(
                        i,
                        prev,
                        RelationshipType::Elaborates,
                        DetectionMethod::TermOverlap,
                        format!("{overlap:.2}"),
                        0.2,
                    ));
                }
            }
        }

        if f.numbers.is_empty() {
            continue;
        }
        let ancestry = ctx.tree.ancestry(&f.chunk.node_id);
        for ancestor in ancestry.iter().rev().skip(1) {
            for &a in ctx.node_chunks(&ancestor.id) {
                let fa = &ctx.features[a];
                if fa.is_header() {
                    continue;
                }
                let shared: Vec<&String> = f.numbers.intersection(&fa.numbers).collect();
                let overlap = ctx.overlap(i, a);
                if shared.is_empty() || overlap < ctx.config.min_term_overlap {
                    continue;
                }
                let mut shown: Vec<&str> = shared.iter().map(|s| s.as_str()).collect();
                shown.sort_unstable();
                out.push(ctx.candidate(
                    i,
                    a,
                    RelationshipType::Elaborates,
                    DetectionMethod::SharedNumbers,
                    shown.join(", "),
                    0.3,
                ));
                out.push(ctx.candidate(
                    i,
                    a,
                    RelationshipType::Elaborates,
                    DetectionMethod::TermOverlap,
                    format!("{overlap:.2}"),
                    0.2,
                ));
            }
        }
    }
    out
}

/// Summaries to the passages whose vocabulary they cover.
pub fn detect_summaries(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    for (i, f) in ctx.features.iter().enumerate() {
        if !f.summary || f.is_header() {
            continue;
        }
        let mut scored: Vec<(usize, f32)> = ctx
            .tree
            .nodes_in_order()
            .filter(|n| n.id != f.chunk.node_id)
            .filter_map(|n| ctx.anchor(&n.id))
            .filter(|&t| !ctx.features[t].is_header())
            .map(|t| (t, ctx.overlap(i, t)))
            .filter(|(_, o)| *o >= ctx.config.min_summary_overlap)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(ctx.config.max_summary_targets);

        for (t, overlap) in scored {
            out.push(ctx.candidate(
                i,
                t,
                RelationshipType::Summarizes,
                DetectionMethod::SummaryMarker,
                f.text.split_whitespace().take(3).collect::<Vec<_>>().join(" "),
                0.3,
            ));
            out.push(ctx.candidate(
                i,
                t,
                RelationshipType::Summarizes,
                DetectionMethod::TermOverlap,
                format!("{overlap:.2}"),
                0.3,
            ));
        }
    }
    out
}

/// Chains chunks citing the same external document, in reading order.
pub fn detect_inter_document(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut citing: BTreeMap<String, (String, Vec<usize>)> = BTreeMap::new();
    for (i, f) in ctx.features.iter().enumerate() {
        for name in &f.chunk.external_references {
            citing
                .entry(name.to_lowercase())
                .or_insert_with(|| (name.clone(), Vec::new()))
                .1
                .push(i);
        }
    }

    let mut out = Vec::new();
    for (name, list) in citing.values() {
        for pair in list.windows(2) {
            out.push(ctx.candidate(
                pair[0],
                pair[1],
                RelationshipType::InterDocument,
                DetectionMethod::ExternalCitation,
                name.clone(),
                0.6,
            ));
        }
    }
    out
}

/// Matrix chunks to nearby guideline text that mentions a table or shares
/// its values.
pub fn detect_matrix_guidelines(ctx: &DetectionContext<'_>) -> Vec<RelationshipCandidate> {
    let mut out = Vec::new();
    for (m, fm) in ctx.features.iter().enumerate() {
        if fm.chunk.chunk_type != ChunkType::Matrix {
            continue;
        }
        let matrix_node = fm.chunk.node_id.as_str();
        let parent = ctx
            .tree
            .get(matrix_node)
            .and_then(|n| n.parent_id.as_deref());

        for (g, fg) in ctx.features.iter().enumerate() {
            if g == m || fg.is_header() || fg.chunk.chunk_type == ChunkType::Matrix {
                continue;
            }
            let guideline_node = fg.chunk.node_id.as_str();
            let same_node = guideline_node == matrix_node;
            let nearby = same_node
                || ctx.tree.is_ancestor(matrix_node, guideline_node)
                || ctx.tree.is_ancestor(guideline_node, matrix_node)
                || (parent.is_some()
                    && ctx.tree.get(guideline_node).and_then(|n| n.parent_id.as_deref())
                        == parent);
            if !nearby {
                continue;
            }

            let shared = fm.numbers.intersection(&fg.numbers).count();
            if fg.table.is_none() && shared == 0 {
                continue;
            }
            if let Some(ref mention) = fg.table {
                out.push(ctx.candidate(
                    m,
                    g,
                    RelationshipType::MatrixGuideline,
                    DetectionMethod::TableMention,
                    mention.clone(),
                    0.3,
                ));
            }
            if shared > 0 {
                out.push(ctx.candidate(
                    m,
                    g,
                    RelationshipType::MatrixGuideline,
                    DetectionMethod::SharedNumbers,
                    format!("{shared} shared values"),
                    (0.1 * shared as f32).min(0.4),
                ));
            }
            if same_node {
                out.push(ctx.candidate(
                    m,
                    g,
                    RelationshipType::MatrixGuideline,
                    DetectionMethod::Structural,
                    "same section",
                    0.2,
                ));
            }
        }
    }
    out
}

/// Fold candidates into relationships.
///
/// Evidence is keyed by (source, target, type), so one chunk pair can carry
/// several relationships and each type is held to `min_strength` on its own
/// evidence. Repeated evidence from the same method keeps only its strongest
/// weight. Self-loops never survive.
pub fn merge_candidates(
    document_id: &str,
    candidates: Vec<RelationshipCandidate>,
    min_strength: f32,
) -> Vec<ChunkRelationship> {
    type Key = (String, String, RelationshipType);
    let mut order: Vec<Key> = Vec::new();
    let mut evidence: HashMap<Key, Vec<RelationshipEvidence>> = HashMap::new();

    for candidate in candidates {
        if candidate.source_id == candidate.target_id {
            continue;
        }
        let key = (
            candidate.source_id,
            candidate.target_id,
            candidate.relationship_type,
        );
        if !evidence.contains_key(&key) {
            order.push(key.clone());
        }
        let list = evidence.entry(key).or_default();
        match list
            .iter_mut()
            .find(|e| e.method == candidate.evidence.method)
        {
            Some(existing) if existing.weight < candidate.evidence.weight => {
                *existing = candidate.evidence;
            }
            Some(_) => {}
            None => list.push(candidate.evidence),
        }
    }

    let mut dropped = 0usize;
    let mut merged = Vec::new();
    for key in order {
        let Some(list) = evidence.remove(&key) else {
            continue;
        };
        let strength = list.iter().map(|e| e.weight).sum::<f32>().min(1.0);
        if strength < min_strength {
            dropped += 1;
            continue;
        }
        let confidence = list
            .iter()
            .map(|e| e.method.confidence())
            .fold(0.0_f32, f32::max);
        let (source_id, target_id, relationship_type) = key;
        merged.push(ChunkRelationship {
            id: ids::derive_id(
                document_id,
                "relationship",
                &format!("{source_id}>{target_id}/{}", relationship_type.as_str()),
            ),
            source_id,
            target_id,
            relationship_type,
            strength,
            confidence,
            evidence: list,
        });
    }

    debug!(
        kept = merged.len(),
        dropped, min_strength, "Merged relationship candidates"
    );
    merged
}

/// Relationship counts by type name.
pub fn counts_by_type(relationships: &[ChunkRelationship]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for r in relationships {
        *counts
            .entry(r.relationship_type.as_str().to_string())
            .or_default() += 1;
    }
    counts
}

/// Runs every detector and the reducer.
#[derive(Debug, Clone, Default)]
pub struct ChunkRelationshipManager {
    config: RelationshipConfig,
}

impl ChunkRelationshipManager {
    pub fn new(config: RelationshipConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelationshipConfig {
        &self.config
    }

    /// All candidate edges, structural seeds first.
    pub fn detect(
        &self,
        chunks: &[HierarchicalChunk],
        tree: &NavigationTree,
    ) -> Vec<RelationshipCandidate> {
        let ctx = DetectionContext::new(chunks, tree, &self.config);
        let mut candidates = chunker::seed_relationships(chunks, tree);
        candidates.extend(detect_references(&ctx));
        candidates.extend(detect_decisions(&ctx));
        candidates.extend(detect_conditionals(&ctx));
        candidates.extend(detect_elaborations(&ctx));
        candidates.extend(detect_summaries(&ctx));
        candidates.extend(detect_inter_document(&ctx));
        candidates.extend(detect_matrix_guidelines(&ctx));
        candidates
    }

    /// Detect, merge and threshold relationships between `chunks`.
    pub fn build_relationships(
        &self,
        chunks: &[HierarchicalChunk],
        tree: &NavigationTree,
    ) -> Vec<ChunkRelationship> {
        let candidates = self.detect(chunks, tree);
        let candidate_count = candidates.len();
        let relationships =
            merge_candidates(&tree.document_id, candidates, self.config.min_strength);

        info!(
            chunks = chunks.len(),
            candidates = candidate_count,
            relationships = relationships.len(),
            "Built chunk relationships"
        );
        relationships
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::SemanticChunker;
    use crate::extractor::NavigationExtractor;
    use crate::patterns::DocumentFormat;
    use pretty_assertions::assert_eq;

    fn build(text: &str, target: usize) -> (NavigationTree, Vec<HierarchicalChunk>) {
        let tree = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&tree, text, target, 0.0);
        (tree, chunks)
    }

    fn chunk_containing<'a>(chunks: &'a [HierarchicalChunk], needle: &str) -> &'a HierarchicalChunk {
        chunks
            .iter()
            .find(|c| c.chunk_type != ChunkType::Header && c.own_text().contains(needle))
            .unwrap()
    }

    fn find(
        rels: &[ChunkRelationship],
        source: &str,
        target: &str,
        kind: RelationshipType,
    ) -> Option<ChunkRelationship> {
        rels.iter()
            .find(|r| r.source_id == source && r.target_id == target && r.relationship_type == kind)
            .cloned()
    }

    #[test]
    fn test_merge_sums_distinct_methods() {
        let candidates = vec![
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::References,
                DetectionMethod::BareReference,
                "Section 2",
                0.4,
            ),
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::References,
                DetectionMethod::BareReference,
                "section 2",
                0.4,
            ),
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::References,
                DetectionMethod::TitleMention,
                "Reserve Requirements",
                0.3,
            ),
            RelationshipCandidate::new(
                "a",
                "c",
                RelationshipType::References,
                DetectionMethod::TitleMention,
                "Reserve Requirements",
                0.3,
            ),
            RelationshipCandidate::new(
                "a",
                "a",
                RelationshipType::Sequential,
                DetectionMethod::Structural,
                "self",
                1.0,
            ),
        ];
        let merged = merge_candidates("doc", candidates, 0.5);
        assert_eq!(merged.len(), 1);
        let rel = &merged[0];
        assert_eq!(rel.target_id, "b");
        assert!((rel.strength - 0.7).abs() < 1e-6);
        assert_eq!(rel.confidence, 0.6);
        assert_eq!(rel.evidence.len(), 2);
        assert!(rel.is_corroborated());
    }

    #[test]
    fn test_each_type_is_thresholded_separately() {
        let candidates = vec![
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::Conditional,
                DetectionMethod::ConditionalLanguage,
                "if",
                0.3,
            ),
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::Elaborates,
                DetectionMethod::TermOverlap,
                "credit score",
                0.3,
            ),
            RelationshipCandidate::new(
                "a",
                "b",
                RelationshipType::DecisionBranch,
                DetectionMethod::NumericComparison,
                ">= 620",
                0.6,
            ),
        ];
        let merged = merge_candidates("doc", candidates, 0.5);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].relationship_type, RelationshipType::DecisionBranch);
        assert_eq!(merged[0].evidence.len(), 1);
    }

    #[test]
    fn test_explicit_reference_stands_alone_but_bare_needs_title() {
        let text = "Chapter 1: Credit\n\
1.1 Credit Score Requirements\n\
Scores are pulled from all three bureaus.\n\
1.2 Reserves\n\
See Section 1.1 before ordering statements.\n\
1.3 Assets\n\
The rules of Section 1.1 apply.\n\
1.4 Gifts\n\
The rules of Section 1.1 and the credit score requirements both apply.\n";
        let (tree, chunks) = build(text, 512);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        let target = chunk_containing(&chunks, "three bureaus");

        let explicit = chunk_containing(&chunks, "See Section 1.1");
        let rel = find(&rels, &explicit.id, &target.id, RelationshipType::References).unwrap();
        assert_eq!(rel.evidence[0].method, DetectionMethod::ExplicitReference);

        let bare = chunk_containing(&chunks, "Section 1.1 apply");
        assert!(find(&rels, &bare.id, &target.id, RelationshipType::References).is_none());

        let corroborated = chunk_containing(&chunks, "both apply");
        let rel =
            find(&rels, &corroborated.id, &target.id, RelationshipType::References).unwrap();
        assert!(rel.is_corroborated());
    }

    #[test]
    fn test_decision_branch_and_outcome() {
        let text = "2.1 Credit Score Requirements\n\
The borrower must have a credit score of at least 620.\n\
Applications with a credit score below 620 are declined.\n";
        let (tree, chunks) = build(text, 12);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);

        let header = chunks.iter().find(|c| c.chunk_type == ChunkType::Header).unwrap();
        let criterion = chunk_containing(&chunks, "at least 620");
        let outcome = chunk_containing(&chunks, "declined");

        let branch =
            find(&rels, &header.id, &criterion.id, RelationshipType::DecisionBranch).unwrap();
        assert!(branch.strength > 0.8);
        assert!(find(&rels, &criterion.id, &outcome.id, RelationshipType::DecisionOutcome).is_some());
    }

    #[test]
    fn test_inter_document_chain() {
        let text = "Chapter 1: Appraisal\n\
Appraisals are completed per the Seller Guide.\n\
Chapter 2: Condominiums\n\
Project reviews are performed per the Seller Guide.\n\
Chapter 3: Title\n\
Title insurance is required.\n";
        let (tree, chunks) = build(text, 512);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        let a = chunk_containing(&chunks, "Appraisals are");
        let b = chunk_containing(&chunks, "Project reviews");
        let rel = find(&rels, &a.id, &b.id, RelationshipType::InterDocument).unwrap();
        assert_eq!(rel.evidence[0].matched_text, "Seller Guide");
    }

    #[test]
    fn test_matrix_guideline() {
        let text = "Chapter 3: Property Eligibility\n\
Maximum LTV by property type is shown in the matrix below.\n\
\n\
Property   | Max LTV | Min Score\n\
Single     | 95%     | 620\n\
Condo      | 90%     | 660\n";
        let (tree, chunks) = build(text, 512);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        let matrix = chunks.iter().find(|c| c.chunk_type == ChunkType::Matrix).unwrap();
        let guideline = chunk_containing(&chunks, "shown in the matrix");
        let rel =
            find(&rels, &matrix.id, &guideline.id, RelationshipType::MatrixGuideline).unwrap();
        assert!(rel.strength >= 0.5);
    }

    #[test]
    fn test_elaboration_needs_overlap() {
        let text = "Chapter 4: Reserves\n\
Borrowers hold cash reserves covering monthly housing payments.\n\
For example, cash reserves covering six monthly housing payments satisfy this.\n\
For example, gift letters are signed.\n";
        let (tree, chunks) = build(text, 16);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        let statement = chunk_containing(&chunks, "Borrowers hold");
        let example = chunk_containing(&chunks, "six monthly");
        let unrelated = chunk_containing(&chunks, "gift letters");

        assert!(find(&rels, &example.id, &statement.id, RelationshipType::Elaborates).is_some());
        assert!(find(&rels, &unrelated.id, &example.id, RelationshipType::Elaborates).is_none());
    }

    #[test]
    fn test_summary_links_to_covered_sections() {
        let text = "Chapter 1: Overview\n\
In summary, borrowers need verified income, stable employment and sufficient reserves.\n\
Chapter 2: Income\n\
Verified income from stable employment is documented with paystubs.\n\
Chapter 3: Flood\n\
Flood zones are determined by certificate.\n";
        let (tree, chunks) = build(text, 512);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        let summary = chunk_containing(&chunks, "In summary");
        assert_eq!(summary.chunk_type, ChunkType::Summary);
        let income = chunk_containing(&chunks, "paystubs");
        let flood = chunk_containing(&chunks, "certificate");

        assert!(find(&rels, &summary.id, &income.id, RelationshipType::Summarizes).is_some());
        assert!(find(&rels, &summary.id, &flood.id, RelationshipType::Summarizes).is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let text = "Chapter 1: Eligibility\n1.1 Age\nThe borrower must be at least 18 years old.\n";
        let (tree, chunks) = build(text, 512);
        let manager = ChunkRelationshipManager::default();
        assert_eq!(
            manager.build_relationships(&chunks, &tree),
            manager.build_relationships(&chunks, &tree)
        );
        let counts = counts_by_type(&manager.build_relationships(&chunks, &tree));
        assert!(counts.contains_key("PARENT_CHILD"));
    }
}
