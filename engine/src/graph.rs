//! Navigation graph assembly.
//!
//! The builder reconciles nodes, chunks and relationships into one
//! persistable graph. Nothing inconsistent gets in: chunks must belong to a
//! reachable node, relationships must join existing chunks and respect the
//! direction their type implies. Every rejection is recorded as an issue.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chunker::HierarchicalChunk;
use crate::decision::DecisionTree;
use crate::error::Result;
use crate::issue::{Issue, IssueKind};
use crate::navigation::NavigationTree;
use crate::node::NavigationNode;
use crate::relationship::{ChunkRelationship, RelationshipType};

/// Nodes, chunks, relationships and decision trees of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigationGraph {
    pub document_id: String,

    /// Navigation nodes in document order.
    pub nodes: Vec<NavigationNode>,

    /// Chunks in document order.
    pub chunks: Vec<HierarchicalChunk>,

    pub relationships: Vec<ChunkRelationship>,

    #[serde(default)]
    pub decision_trees: Vec<DecisionTree>,
}

impl NavigationGraph {
    pub fn node(&self, id: &str) -> Option<&NavigationNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn chunk(&self, id: &str) -> Option<&HierarchicalChunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    /// Rebuild the navigation tree arena from the stored nodes.
    pub fn navigation_tree(&self) -> Result<NavigationTree> {
        NavigationTree::from_nodes(self.document_id.clone(), self.nodes.clone())
    }
}

/// Structural metrics of a built graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationGraphMetrics {
    pub node_count: usize,
    pub chunk_count: usize,
    pub relationship_count: usize,
    pub relationships_by_type: BTreeMap<String, usize>,
    pub max_depth: u32,
    /// Nodes with no valid parent chain to the root.
    pub orphaned_nodes: usize,
    /// Chunks rejected because their node is missing or orphaned.
    pub dropped_chunks: usize,
    pub dropped_relationships: usize,
    /// Share of text-bearing nodes that have at least one chunk.
    pub node_coverage: f32,
    /// Share of node-owned source bytes reproduced by chunk text.
    pub text_coverage: f32,
    pub decision_nodes: usize,
    pub decision_trees: usize,
}

impl NavigationGraphMetrics {
    /// A build succeeds when no node is orphaned.
    pub fn is_success(&self) -> bool {
        self.orphaned_nodes == 0
    }
}

impl std::fmt::Display for NavigationGraphMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Navigation Graph:")?;
        writeln!(f, "  Nodes: {} (max depth {})", self.node_count, self.max_depth)?;
        writeln!(f, "  Chunks: {}", self.chunk_count)?;
        writeln!(f, "  Relationships: {}", self.relationship_count)?;
        for (kind, count) in &self.relationships_by_type {
            writeln!(f, "    {kind}: {count}")?;
        }
        writeln!(
            f,
            "  Coverage: {:.0}% of nodes, {:.0}% of text",
            self.node_coverage * 100.0,
            self.text_coverage * 100.0
        )?;
        writeln!(
            f,
            "  Decision nodes: {}  Decision trees: {}",
            self.decision_nodes, self.decision_trees
        )?;
        write!(
            f,
            "  Orphaned nodes: {}  Dropped chunks: {}  Dropped relationships: {}",
            self.orphaned_nodes, self.dropped_chunks, self.dropped_relationships
        )
    }
}

/// Output of [`NavigationGraphBuilder::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphBuildResult {
    pub graph: NavigationGraph,
    pub metrics: NavigationGraphMetrics,
    /// Reconciliation problems; offending elements were left out.
    #[serde(default)]
    pub warnings: Vec<Issue>,
}

impl GraphBuildResult {
    /// Attach the decision trees built alongside the graph.
    pub fn attach_decision_trees(&mut self, trees: Vec<DecisionTree>) {
        self.metrics.decision_trees = trees.len();
        self.graph.decision_trees = trees;
    }
}

/// Assembles and reconciles the navigation graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct NavigationGraphBuilder;

impl NavigationGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        tree: &NavigationTree,
        chunks: &[HierarchicalChunk],
        relationships: &[ChunkRelationship],
    ) -> GraphBuildResult {
        let mut warnings = Vec::new();

        let orphans: HashSet<&str> = tree.orphans().iter().map(|n| n.id.as_str()).collect();
        for id in &orphans {
            warnings.push(
                Issue::error(
                    IssueKind::StructuralInvariantViolation,
                    "node has no valid parent chain to the root; left out of the graph",
                )
                .with_subject(*id),
            );
        }
        let nodes: Vec<NavigationNode> = tree
            .nodes_in_order()
            .filter(|n| !orphans.contains(n.id.as_str()))
            .cloned()
            .collect();

        // Chunks.
        let mut kept: Vec<HierarchicalChunk> = Vec::with_capacity(chunks.len());
        let mut seen: HashSet<&str> = HashSet::new();
        let mut dropped_chunks = 0;
        for chunk in chunks {
            let problem = if tree.get(&chunk.node_id).is_none() {
                Some(format!("chunk references unknown node {}", chunk.node_id))
            } else if orphans.contains(chunk.node_id.as_str()) {
                Some(format!("chunk belongs to orphaned node {}", chunk.node_id))
            } else if !seen.insert(chunk.id.as_str()) {
                Some("duplicate chunk id".to_string())
            } else {
                None
            };
            match problem {
                Some(message) => {
                    dropped_chunks += 1;
                    warnings.push(
                        Issue::warning(IssueKind::StructuralInvariantViolation, message)
                            .with_subject(&chunk.id),
                    );
                }
                None => kept.push(chunk.clone()),
            }
        }
        kept.sort_by_key(|c| c.sequence);

        // Relationships.
        let index: HashMap<&str, usize> = kept
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();
        let mut rel_ids: HashSet<&str> = HashSet::new();
        let mut accepted: Vec<ChunkRelationship> = Vec::new();
        let mut links: Vec<(usize, usize, String)> = Vec::new();
        for rel in relationships {
            let source = index.get(rel.source_id.as_str()).copied();
            let target = index.get(rel.target_id.as_str()).copied();
            let problem = match (source, target) {
                (None, _) => Some(format!("source chunk {} does not exist", rel.source_id)),
                (_, None) => Some(format!("target chunk {} does not exist", rel.target_id)),
                (Some(s), Some(t)) if s == t => Some("self-loop".to_string()),
                (Some(s), Some(t)) => direction_problem(tree, &kept[s], &kept[t], rel),
            };
            let problem = problem.or_else(|| {
                (!rel_ids.insert(rel.id.as_str())).then(|| "duplicate relationship id".to_string())
            });

            match (problem, source, target) {
                (None, Some(s), Some(t)) => {
                    links.push((s, t, rel.id.clone()));
                    accepted.push(rel.clone());
                }
                (problem, _, _) => {
                    let message = problem.unwrap_or_else(|| "unresolved endpoint".to_string());
                    warn!(
                        relationship = %rel.to_string_repr(),
                        reason = %message,
                        "Dropping relationship"
                    );
                    warnings.push(
                        Issue::warning(
                            IssueKind::DroppedRelationship,
                            format!("{} dropped: {message}", rel.relationship_type.as_str()),
                        )
                        .with_subject(&rel.id),
                    );
                }
            }
        }
        let dropped_relationships = relationships.len() - accepted.len();

        for chunk in &mut kept {
            chunk.relationship_ids.clear();
        }
        for (s, t, id) in links {
            kept[s].relationship_ids.push(id.clone());
            kept[t].relationship_ids.push(id);
        }

        let metrics = self.metrics(
            tree,
            &nodes,
            &kept,
            &accepted,
            orphans.len(),
            dropped_chunks,
            dropped_relationships,
        );

        info!(
            nodes = metrics.node_count,
            chunks = metrics.chunk_count,
            relationships = metrics.relationship_count,
            warnings = warnings.len(),
            success = metrics.is_success(),
            "Built navigation graph"
        );

        GraphBuildResult {
            graph: NavigationGraph {
                document_id: tree.document_id.clone(),
                nodes,
                chunks: kept,
                relationships: accepted,
                decision_trees: Vec::new(),
            },
            metrics,
            warnings,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn metrics(
        &self,
        tree: &NavigationTree,
        nodes: &[NavigationNode],
        chunks: &[HierarchicalChunk],
        relationships: &[ChunkRelationship],
        orphaned_nodes: usize,
        dropped_chunks: usize,
        dropped_relationships: usize,
    ) -> NavigationGraphMetrics {
        let chunked: HashSet<&str> = chunks.iter().map(|c| c.node_id.as_str()).collect();
        let text_nodes: Vec<&NavigationNode> = nodes
            .iter()
            .filter(|n| !n.provenance.own_range().is_empty())
            .collect();
        let covered = text_nodes
            .iter()
            .filter(|n| chunked.contains(n.id.as_str()))
            .count();
        let owned: usize = text_nodes.iter().map(|n| n.provenance.own_range().len()).sum();
        let reproduced: usize = chunks.iter().map(|c| c.own_text().len()).sum();

        NavigationGraphMetrics {
            node_count: nodes.len(),
            chunk_count: chunks.len(),
            relationship_count: relationships.len(),
            relationships_by_type: crate::relationship::counts_by_type(relationships),
            max_depth: tree.max_depth(),
            orphaned_nodes,
            dropped_chunks,
            dropped_relationships,
            node_coverage: ratio(covered, text_nodes.len()),
            text_coverage: ratio(reproduced, owned),
            decision_nodes: nodes.iter().filter(|n| n.requires_complete_tree).count(),
            decision_trees: 0,
        }
    }
}

fn ratio(part: usize, whole: usize) -> f32 {
    if whole == 0 {
        return 1.0;
    }
    (part as f32 / whole as f32).min(1.0)
}

/// Direction rules implied by relationship types.
fn direction_problem(
    tree: &NavigationTree,
    source: &HierarchicalChunk,
    target: &HierarchicalChunk,
    rel: &ChunkRelationship,
) -> Option<String> {
    match rel.relationship_type {
        RelationshipType::ParentChild if !tree.is_ancestor(&source.node_id, &target.node_id) => {
            Some("source node is not an ancestor of the target node".to_string())
        }
        RelationshipType::Sequential
        | RelationshipType::DecisionBranch
        | RelationshipType::DecisionOutcome
            if source.sequence >= target.sequence =>
        {
            Some("points backwards in document order".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::SemanticChunker;
    use crate::extractor::NavigationExtractor;
    use crate::node::NodeType;
    use crate::patterns::DocumentFormat;
    use crate::relationship::{ChunkRelationshipManager, RelationshipEvidence, DetectionMethod};
    use pretty_assertions::assert_eq;

    const POLICY: &str = "Chapter 1: Eligibility\n\
Applicants apply through a broker.\n\
1.1 Age Requirements\n\
The borrower must be at least 18 years old.\n\
1.2 Residency\n\
See Section 1.1 for age limits.\n";

    fn inputs() -> (NavigationTree, Vec<HierarchicalChunk>, Vec<ChunkRelationship>) {
        let tree = NavigationExtractor::default().extract(POLICY, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.1);
        let rels = ChunkRelationshipManager::default().build_relationships(&chunks, &tree);
        (tree, chunks, rels)
    }

    fn edge(id: &str, source: &str, target: &str, kind: RelationshipType) -> ChunkRelationship {
        ChunkRelationship {
            id: id.to_string(),
            source_id: source.to_string(),
            target_id: target.to_string(),
            relationship_type: kind,
            strength: 1.0,
            confidence: 1.0,
            evidence: vec![RelationshipEvidence {
                method: DetectionMethod::Structural,
                matched_text: "test".to_string(),
                weight: 1.0,
            }],
        }
    }

    #[test]
    fn test_clean_build_succeeds() {
        let (tree, chunks, rels) = inputs();
        let result = NavigationGraphBuilder::new().build(&tree, &chunks, &rels);
        assert!(result.warnings.is_empty());
        assert!(result.metrics.is_success());
        assert_eq!(result.metrics.node_count, tree.len());
        assert_eq!(result.metrics.chunk_count, chunks.len());
        assert_eq!(result.metrics.relationship_count, rels.len());
        assert!(result.metrics.decision_nodes >= 1);
        assert!(result.metrics.text_coverage > 0.99);

        for rel in &result.graph.relationships {
            let source = result.graph.chunk(&rel.source_id).unwrap();
            assert!(source.relationship_ids.contains(&rel.id));
        }
    }

    #[test]
    fn test_bad_edges_are_dropped_with_warnings() {
        let (tree, chunks, mut rels) = inputs();
        let first = &chunks[0];
        let last = chunks.last().unwrap();
        rels.push(edge("dangling", &first.id, "missing", RelationshipType::References));
        rels.push(edge("backwards", &last.id, &first.id, RelationshipType::Sequential));
        rels.push(edge("upside-down", &last.id, &first.id, RelationshipType::ParentChild));
        rels.push(edge("loop", &first.id, &first.id, RelationshipType::Elaborates));

        let result = NavigationGraphBuilder::new().build(&tree, &chunks, &rels);
        assert_eq!(result.metrics.dropped_relationships, 4);
        let dropped: Vec<&str> = result
            .warnings
            .iter()
            .filter(|w| w.kind == IssueKind::DroppedRelationship)
            .filter_map(|w| w.subject_id.as_deref())
            .collect();
        assert_eq!(dropped, vec!["dangling", "backwards", "upside-down", "loop"]);
        assert!(result.metrics.is_success());
        assert!(result.graph.relationships.iter().all(|r| r.id != "loop"));
    }

    #[test]
    fn test_chunk_for_unknown_node_is_dropped() {
        let (tree, mut chunks, rels) = inputs();
        let mut stray = chunks[0].clone();
        stray.id = "stray".to_string();
        stray.node_id = "nowhere".to_string();
        chunks.push(stray);

        let result = NavigationGraphBuilder::new().build(&tree, &chunks, &rels);
        assert_eq!(result.metrics.dropped_chunks, 1);
        assert!(result.graph.chunk("stray").is_none());
    }

    #[test]
    fn test_orphaned_node_fails_build() {
        let root = NavigationNode::root("root", "Policy");
        let mut orphan = NavigationNode::new("lost", NodeType::Section, "Lost");
        orphan.parent_id = Some("ghost".to_string());
        let tree = NavigationTree::from_nodes("doc", vec![root, orphan]).unwrap();

        let result = NavigationGraphBuilder::new().build(&tree, &[], &[]);
        assert_eq!(result.metrics.orphaned_nodes, 1);
        assert!(!result.metrics.is_success());
        assert!(result.warnings.iter().any(Issue::is_structural));
        assert!(result.graph.node("lost").is_none());
    }

    #[test]
    fn test_metrics_display() {
        let (tree, chunks, rels) = inputs();
        let result = NavigationGraphBuilder::new().build(&tree, &chunks, &rels);
        let text = result.metrics.to_string();
        assert!(text.contains("PARENT_CHILD"));
        assert!(text.contains("Orphaned nodes: 0"));
    }
}
