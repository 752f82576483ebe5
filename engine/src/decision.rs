//! Decision tree extraction.
//!
//! One tree per navigation node flagged `requires_complete_tree`. The node is
//! the root; every evaluative clause beneath it becomes a branch with a
//! parsed condition where one exists; the outcomes those clauses state become
//! leaves. A branch records where evaluation goes when its condition holds
//! and when it does not (`Continue` or an outcome), and the edges are wired
//! from that after leaves exist, so synthesized outcomes can be attached
//! without re-reading the text.
//!
//! Outcomes the text leaves implicit are still represented:
//! - a requirement with no stated consequence fails to `DECLINE` (implied);
//! - a tree of requirements falls through to `APPROVE` (implied);
//! - any of `APPROVE`/`DECLINE`/`REFER` still missing is synthesized as a
//!   `default_outcome` leaf attached to the root.

use std::collections::{BTreeSet, HashMap, HashSet};

use policy_nav_inference::{GuardedClassifier, TaskKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assist::AssistSession;
use crate::chunker::{ChunkType, HierarchicalChunk};
use crate::extractor::truncate_at_char;
use crate::ids;
use crate::issue::{Issue, IssueKind};
use crate::navigation::NavigationTree;
use crate::node::NavigationNode;
use crate::patterns::{self, Comparison, ComparisonOp, OutcomeKind, Precedence};
use crate::quality::TreeQuality;
use crate::validator::{self, ValidatorConfig};

const OUTCOME_LABELS: [&str; 4] = ["approve", "decline", "refer", "none"];

/// Completeness state of a decision tree.
///
/// `Complete` and `Invalid` are terminal. `Repairable` trees become
/// `Complete` through auto-completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreeCompleteness {
    #[default]
    Incomplete,
    Repairable,
    Complete,
    Invalid,
}

impl TreeCompleteness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "INCOMPLETE",
            Self::Repairable => "REPAIRABLE",
            Self::Complete => "COMPLETE",
            Self::Invalid => "INVALID",
        }
    }
}

/// A parsed numeric condition ("age >= 18").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub subject: String,
    pub operator: ComparisonOp,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Condition {
    pub fn label(&self) -> String {
        let unit = match self.unit.as_deref() {
            Some("%") => "%",
            _ => "",
        };
        format!(
            "{} {} {}{unit}",
            self.subject,
            self.operator.symbol(),
            format_value(self.value)
        )
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Where evaluation goes after a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchTarget {
    /// The next branch, or the fallthrough outcome after the last one.
    Continue,
    Outcome(OutcomeKind),
}

/// The flagged navigation node a tree is rooted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRoot {
    pub id: String,
    pub node_id: String,
    pub title: String,
    pub navigation_path: Vec<String>,
}

/// An evaluation criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBranch {
    pub id: String,
    pub label: String,
    /// The clause text the branch was read from.
    pub clause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precedence: Option<Precedence>,
    /// Evaluation order, starting at 0.
    pub order: usize,
    pub on_satisfied: BranchTarget,
    pub on_not_satisfied: BranchTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chunk_id: Option<String>,
    /// Added by auto-completion rather than read from text.
    #[serde(default)]
    pub synthesized: bool,
    /// Outcome chosen with inference assistance.
    #[serde(default)]
    pub inferred: bool,
}

/// A terminal outcome. One leaf per distinct outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLeaf {
    pub id: String,
    pub outcome: OutcomeKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
    /// Synthesized to fill the mandatory outcome set.
    #[serde(default)]
    pub default_outcome: bool,
    /// Implied by requirement semantics rather than stated in the text.
    #[serde(default)]
    pub implied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Root to the first branch.
    Evaluate,
    Satisfied,
    NotSatisfied,
    /// Root to a leaf no branch leads to.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// One root-to-leaf path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPath {
    /// Element ids from the root to the leaf.
    pub steps: Vec<String>,
    pub outcome: OutcomeKind,
    pub description: String,
}

/// A ROOT -> BRANCH* -> LEAF tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub id: String,
    pub document_id: String,
    pub root: DecisionRoot,
    pub branches: Vec<DecisionBranch>,
    pub leaves: Vec<DecisionLeaf>,
    pub edges: Vec<DecisionEdge>,
    pub paths: Vec<DecisionPath>,
    /// Outcome reached when the last branch continues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallthrough: Option<OutcomeKind>,
    pub is_complete: bool,
    pub status: TreeCompleteness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TreeQuality>,
}

impl DecisionTree {
    pub fn new(document_id: &str, node: &NavigationNode, navigation_path: Vec<String>) -> Self {
        Self {
            id: ids::derive_id(document_id, "decision-tree", &node.id),
            document_id: document_id.to_string(),
            root: DecisionRoot {
                id: ids::derive_id(document_id, "decision-root", &node.id),
                node_id: node.id.clone(),
                title: node.label(),
                navigation_path,
            },
            branches: Vec::new(),
            leaves: Vec::new(),
            edges: Vec::new(),
            paths: Vec::new(),
            fallthrough: None,
            is_complete: false,
            status: TreeCompleteness::Incomplete,
            metrics: None,
        }
    }

    pub fn leaf(&self, outcome: &OutcomeKind) -> Option<&DecisionLeaf> {
        self.leaves.iter().find(|l| &l.outcome == outcome)
    }

    pub fn outcomes(&self) -> BTreeSet<OutcomeKind> {
        self.leaves.iter().map(|l| l.outcome.clone()).collect()
    }

    /// Mandatory outcomes with no leaf.
    pub fn missing_outcomes(&self) -> Vec<OutcomeKind> {
        OutcomeKind::MANDATORY
            .into_iter()
            .filter(|o| self.leaf(o).is_none())
            .collect()
    }

    /// Branches read from text.
    pub fn natural_branch_count(&self) -> usize {
        self.branches.iter().filter(|b| !b.synthesized).count()
    }

    /// Root, branch and leaf ids.
    pub fn element_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.id.as_str())
            .chain(self.branches.iter().map(|b| b.id.as_str()))
            .chain(self.leaves.iter().map(|l| l.id.as_str()))
    }

    fn leaf_id(&self, outcome: &OutcomeKind) -> String {
        ids::derive_id(
            &self.document_id,
            "decision-leaf",
            &format!("{}/{}", self.root.node_id, outcome.label()),
        )
    }

    /// Add a leaf for `outcome` unless one exists. A stated source upgrades
    /// an existing implied leaf.
    pub(crate) fn ensure_leaf(
        &mut self,
        outcome: &OutcomeKind,
        source: Option<(&str, &str)>,
        default_outcome: bool,
        implied: bool,
    ) {
        if let Some(existing) = self.leaves.iter_mut().find(|l| &l.outcome == outcome) {
            if let Some((chunk_id, matched)) = source {
                if existing.source_chunk_id.is_none() {
                    existing.source_chunk_id = Some(chunk_id.to_string());
                    existing.matched_text = Some(matched.to_string());
                    existing.implied = implied;
                }
            }
            return;
        }
        let id = self.leaf_id(outcome);
        self.leaves.push(DecisionLeaf {
            id,
            outcome: outcome.clone(),
            label: outcome.label(),
            source_chunk_id: source.map(|(c, _)| c.to_string()),
            matched_text: source.map(|(_, m)| m.to_string()),
            default_outcome,
            implied,
        });
        self.leaves.sort_by(|a, b| a.outcome.cmp(&b.outcome));
    }

    /// Synthesize a default leaf for each missing mandatory outcome.
    pub(crate) fn synthesize_missing_outcomes(&mut self) -> usize {
        let missing = self.missing_outcomes();
        for outcome in &missing {
            self.ensure_leaf(outcome, None, true, false);
        }
        missing.len()
    }

    /// Recompute edges from branch targets, then enumerate paths.
    pub(crate) fn rewire(&mut self, max_paths: usize) {
        let leaf_ids: HashMap<OutcomeKind, String> = self
            .leaves
            .iter()
            .map(|l| (l.outcome.clone(), l.id.clone()))
            .collect();
        let fallthrough = self
            .fallthrough
            .as_ref()
            .and_then(|o| leaf_ids.get(o).cloned());

        let mut edges = Vec::new();
        if let Some(first) = self.branches.first() {
            edges.push(DecisionEdge {
                from: self.root.id.clone(),
                to: first.id.clone(),
                kind: EdgeKind::Evaluate,
            });
        }
        for (i, branch) in self.branches.iter().enumerate() {
            let next = self
                .branches
                .get(i + 1)
                .map(|b| b.id.clone())
                .or_else(|| fallthrough.clone());
            for (target, kind) in [
                (&branch.on_satisfied, EdgeKind::Satisfied),
                (&branch.on_not_satisfied, EdgeKind::NotSatisfied),
            ] {
                let to = match target {
                    BranchTarget::Continue => next.clone(),
                    BranchTarget::Outcome(outcome) => leaf_ids.get(outcome).cloned(),
                };
                if let Some(to) = to {
                    edges.push(DecisionEdge {
                        from: branch.id.clone(),
                        to,
                        kind,
                    });
                }
            }
        }

        let targeted: HashSet<&str> = edges.iter().map(|e| e.to.as_str()).collect();
        let defaults: Vec<DecisionEdge> = self
            .leaves
            .iter()
            .filter(|l| !targeted.contains(l.id.as_str()))
            .map(|l| DecisionEdge {
                from: self.root.id.clone(),
                to: l.id.clone(),
                kind: EdgeKind::Default,
            })
            .collect();
        edges.extend(defaults);

        self.edges = edges;
        self.paths = enumerate_paths(self, max_paths);
    }

    /// Indented text rendering for display.
    pub fn outline(&self) -> String {
        let mut out = format!("{} [{}]\n", self.root.title, self.status.as_str());
        for branch in &self.branches {
            let marker = if branch.synthesized { " (synthesized)" } else { "" };
            out.push_str(&format!(
                "  {}. {}{marker}\n     yes -> {}  no -> {}\n",
                branch.order + 1,
                branch.label,
                self.describe_target(&branch.on_satisfied),
                self.describe_target(&branch.on_not_satisfied),
            ));
        }
        for leaf in &self.leaves {
            let marker = match (leaf.default_outcome, leaf.implied) {
                (true, _) => " (default)",
                (false, true) => " (implied)",
                _ => "",
            };
            out.push_str(&format!("  => {}{marker}\n", leaf.label));
        }
        out
    }

    fn describe_target(&self, target: &BranchTarget) -> String {
        match target {
            BranchTarget::Outcome(outcome) => outcome.label(),
            BranchTarget::Continue => "continue".to_string(),
        }
    }
}

/// Depth-first enumeration of root-to-leaf paths, at most `max_paths`.
pub(crate) fn enumerate_paths(tree: &DecisionTree, max_paths: usize) -> Vec<DecisionPath> {
    let mut adjacency: HashMap<&str, Vec<&DecisionEdge>> = HashMap::new();
    for edge in &tree.edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge);
    }
    let leaves: HashMap<&str, &DecisionLeaf> =
        tree.leaves.iter().map(|l| (l.id.as_str(), l)).collect();
    let labels: HashMap<&str, &str> = tree
        .branches
        .iter()
        .map(|b| (b.id.as_str(), b.label.as_str()))
        .collect();

    let mut walker = PathWalker {
        adjacency,
        leaves,
        labels,
        max_paths,
        paths: Vec::new(),
        steps: vec![tree.root.id.clone()],
        notes: Vec::new(),
    };
    walker.walk(&tree.root.id);
    walker.paths
}

struct PathWalker<'a> {
    adjacency: HashMap<&'a str, Vec<&'a DecisionEdge>>,
    leaves: HashMap<&'a str, &'a DecisionLeaf>,
    labels: HashMap<&'a str, &'a str>,
    max_paths: usize,
    paths: Vec<DecisionPath>,
    steps: Vec<String>,
    notes: Vec<String>,
}

impl PathWalker<'_> {
    fn walk(&mut self, at: &str) {
        if let Some(leaf) = self.leaves.get(at) {
            let mut description = self.notes.join(" -> ");
            if !description.is_empty() {
                description.push_str(" -> ");
            }
            description.push_str(&leaf.label);
            self.paths.push(DecisionPath {
                steps: self.steps.clone(),
                outcome: leaf.outcome.clone(),
                description,
            });
            return;
        }
        let Some(edges) = self.adjacency.get(at).cloned() else {
            return;
        };
        for edge in edges {
            if self.paths.len() >= self.max_paths {
                return;
            }
            if self.steps.contains(&edge.to) {
                continue;
            }
            let note = match edge.kind {
                EdgeKind::Evaluate => None,
                EdgeKind::Default => Some("default".to_string()),
                EdgeKind::Satisfied => self.labels.get(at).map(|l| format!("{l}: yes")),
                EdgeKind::NotSatisfied => self.labels.get(at).map(|l| format!("{l}: no")),
            };
            let noted = note.is_some();
            if let Some(note) = note {
                self.notes.push(note);
            }
            self.steps.push(edge.to.clone());
            self.walk(&edge.to);
            self.steps.pop();
            if noted {
                self.notes.pop();
            }
        }
    }
}

/// Configuration for decision tree extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Upper bound on enumerated paths per tree.
    pub max_paths: usize,

    /// Longest label taken from clause text when no condition parses.
    pub max_label_chars: usize,

    /// Upper bound on inference calls per document.
    pub max_inference_calls: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_paths: 64,
            max_label_chars: 80,
            max_inference_calls: 16,
        }
    }
}

/// Output of decision tree extraction over one document.
#[derive(Debug, Clone, Default)]
pub struct DecisionExtraction {
    pub trees: Vec<DecisionTree>,
    pub issues: Vec<Issue>,
    pub cancelled: bool,
}

/// One evaluative sentence beneath a flagged node.
#[derive(Debug, Clone)]
struct Clause {
    chunk_id: String,
    position: (usize, usize),
    text: String,
    outcome: Option<(OutcomeKind, String)>,
    comparison: Option<Comparison>,
    requirement: bool,
    conditional: bool,
    precedence: Option<Precedence>,
}

#[derive(Debug, Clone, PartialEq)]
enum ClauseRole {
    /// A criterion. `outcome` is where it leads when satisfied.
    Branch {
        outcome: Option<OutcomeKind>,
        requirement: bool,
        inferred: bool,
    },
    /// "Otherwise, ..." or an unconditioned approval.
    Fallthrough(OutcomeKind),
    /// What failing a requirement leads to.
    Failure(OutcomeKind),
    /// A comparison or condition with no stated result.
    Ambiguous,
}

/// An outcome stated by a clause outside any branch.
struct StatedOutcome {
    outcome: OutcomeKind,
    chunk_id: String,
    matched: String,
}

impl StatedOutcome {
    fn source(&self) -> (&str, &str) {
        (&self.chunk_id, &self.matched)
    }
}

struct PendingBranch {
    branch: DecisionBranch,
    requirement: bool,
    position: (usize, usize),
    stated: Option<String>,
}

/// Extracts decision trees from flagged navigation nodes.
#[derive(Clone, Default)]
pub struct DecisionTreeExtractor {
    config: DecisionConfig,
    classifier: Option<GuardedClassifier>,
    min_inference_confidence: f32,
}

impl DecisionTreeExtractor {
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            classifier: None,
            min_inference_confidence: 0.6,
        }
    }

    /// Enable inference-assisted outcome naming for ambiguous clauses.
    pub fn with_classifier(mut self, classifier: GuardedClassifier, min_confidence: f32) -> Self {
        self.classifier = Some(classifier);
        self.min_inference_confidence = min_confidence;
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Pattern-only extraction.
    pub fn extract(&self, tree: &NavigationTree, chunks: &[HierarchicalChunk]) -> Vec<DecisionTree> {
        self.extract_detailed(tree, chunks).trees
    }

    /// Pattern-only extraction with issues.
    pub fn extract_detailed(
        &self,
        tree: &NavigationTree,
        chunks: &[HierarchicalChunk],
    ) -> DecisionExtraction {
        let mut output = DecisionExtraction::default();
        for node in tree.flagged_nodes() {
            let roles = clauses_for(tree, node, chunks)
                .into_iter()
                .filter_map(|clause| {
                    let role = match classify_clause(&clause)? {
                        ClauseRole::Ambiguous => fallback_role(&clause)?,
                        role => role,
                    };
                    Some((clause, role))
                })
                .collect();
            output.trees.push(self.build_tree(tree, node, roles));
        }
        info!(trees = output.trees.len(), "Extracted decision trees");
        output
    }

    /// Extraction with inference assistance and cooperative cancellation.
    /// Trees finished before cancellation are returned.
    pub async fn extract_assisted(
        &self,
        tree: &NavigationTree,
        chunks: &[HierarchicalChunk],
        cancel: &CancellationToken,
    ) -> DecisionExtraction {
        let mut output = DecisionExtraction::default();
        let mut session = AssistSession::new(
            self.classifier.as_ref(),
            self.min_inference_confidence,
            self.config.max_inference_calls,
        );

        for node in tree.flagged_nodes() {
            if cancel.is_cancelled() {
                output.cancelled = true;
                break;
            }
            let mut roles = Vec::new();
            for clause in clauses_for(tree, node, chunks) {
                let role = match classify_clause(&clause) {
                    Some(ClauseRole::Ambiguous) => {
                        resolve_with_inference(&mut session, &clause, &node.id).await
                    }
                    other => other,
                };
                if let Some(role) = role {
                    roles.push((clause, role));
                }
            }
            output.trees.push(self.build_tree(tree, node, roles));
        }

        output.issues.append(&mut session.issues);
        info!(
            trees = output.trees.len(),
            inference_calls = session.calls(),
            cancelled = output.cancelled,
            "Extracted decision trees"
        );
        output
    }

    fn build_tree(
        &self,
        nav: &NavigationTree,
        node: &NavigationNode,
        roles: Vec<(Clause, ClauseRole)>,
    ) -> DecisionTree {
        let document_id = nav.document_id.as_str();
        let mut tree = DecisionTree::new(document_id, node, nav.navigation_path(&node.id));

        let mut failure: Option<StatedOutcome> = None;
        let mut fallthrough: Option<StatedOutcome> = None;
        let mut pending: Vec<PendingBranch> = Vec::new();

        for (clause, role) in roles {
            let matched = clause
                .outcome
                .as_ref()
                .map(|(_, m)| m.clone())
                .unwrap_or_default();
            match role {
                ClauseRole::Fallthrough(outcome) => {
                    if fallthrough.is_none() {
                        fallthrough = Some(StatedOutcome {
                            outcome,
                            chunk_id: clause.chunk_id.clone(),
                            matched,
                        });
                    }
                }
                ClauseRole::Failure(outcome) => {
                    if failure.is_none() {
                        failure = Some(StatedOutcome {
                            outcome,
                            chunk_id: clause.chunk_id.clone(),
                            matched,
                        });
                    }
                }
                ClauseRole::Branch {
                    outcome,
                    requirement,
                    inferred,
                } => {
                    let branch = self.make_branch(document_id, node, &clause, outcome, inferred);
                    pending.push(PendingBranch {
                        branch,
                        requirement,
                        position: clause.position,
                        stated: (!inferred && clause.outcome.is_some()).then_some(matched),
                    });
                }
                ClauseRole::Ambiguous => {}
            }
        }

        pending.sort_by_key(|p| (bucket(p.branch.precedence), p.position));

        let failure_outcome = failure
            .as_ref()
            .map_or(OutcomeKind::Decline, |f| f.outcome.clone());
        let has_requirements = pending.iter().any(|p| p.requirement);

        for (order, pending) in pending.into_iter().enumerate() {
            let PendingBranch {
                mut branch,
                requirement,
                stated,
                ..
            } = pending;
            branch.order = order;
            if requirement {
                branch.on_not_satisfied = BranchTarget::Outcome(failure_outcome.clone());
            }
            if let BranchTarget::Outcome(outcome) = &branch.on_satisfied {
                let source = match (&branch.source_chunk_id, &stated) {
                    (Some(chunk), Some(matched)) => Some((chunk.as_str(), matched.as_str())),
                    _ => None,
                };
                tree.ensure_leaf(outcome, source, false, source.is_none());
            }
            tree.branches.push(branch);
        }

        match &failure {
            Some(stated) => {
                tree.ensure_leaf(&stated.outcome, Some(stated.source()), false, false);
            }
            None if has_requirements => {
                tree.ensure_leaf(&OutcomeKind::Decline, None, false, true);
            }
            None => {}
        }

        match fallthrough {
            Some(stated) => {
                tree.ensure_leaf(&stated.outcome, Some(stated.source()), false, false);
                tree.fallthrough = Some(stated.outcome);
            }
            None if has_requirements => {
                tree.ensure_leaf(&OutcomeKind::Approve, None, false, true);
                tree.fallthrough = Some(OutcomeKind::Approve);
            }
            None => {}
        }

        let synthesized = tree.synthesize_missing_outcomes();
        tree.rewire(self.config.max_paths);
        validator::stamp(&mut tree, &ValidatorConfig::default());

        debug!(
            node_id = %node.id,
            branches = tree.branches.len(),
            leaves = tree.leaves.len(),
            synthesized,
            status = tree.status.as_str(),
            "Built decision tree"
        );
        tree
    }

    fn make_branch(
        &self,
        document_id: &str,
        node: &NavigationNode,
        clause: &Clause,
        outcome: Option<OutcomeKind>,
        inferred: bool,
    ) -> DecisionBranch {
        let text = clause.text.trim();
        let condition = clause.comparison.as_ref().map(|c| Condition {
            subject: subject_for(&clause.text, c.start, &node.title),
            operator: c.operator,
            value: c.value,
            unit: c.unit.clone(),
        });
        let label = condition.as_ref().map_or_else(
            || truncate_at_char(text, self.config.max_label_chars).to_string(),
            Condition::label,
        );
        DecisionBranch {
            id: ids::derive_id(
                document_id,
                "decision-branch",
                &format!("{}/{}/{}", node.id, clause.chunk_id, clause.position.1),
            ),
            label,
            clause: text.to_string(),
            condition,
            precedence: clause.precedence,
            order: 0,
            on_satisfied: outcome.map_or(BranchTarget::Continue, BranchTarget::Outcome),
            on_not_satisfied: BranchTarget::Continue,
            source_chunk_id: Some(clause.chunk_id.clone()),
            synthesized: false,
            inferred,
        }
    }
}

fn bucket(precedence: Option<Precedence>) -> u8 {
    match precedence {
        Some(Precedence::First) => 0,
        None | Some(Precedence::Ordinal) => 1,
        Some(Precedence::Final) => 2,
        Some(Precedence::Otherwise) => 3,
    }
}

/// Sentences of the flagged node and of descendants not covered by a
/// flagged descendant of their own, in document order.
fn clauses_for(
    tree: &NavigationTree,
    node: &NavigationNode,
    chunks: &[HierarchicalChunk],
) -> Vec<Clause> {
    let mut owners: HashSet<&str> = HashSet::from([node.id.as_str()]);
    for descendant in tree.descendants(&node.id) {
        let ancestry = tree.ancestry(&descendant.id);
        let claimed = ancestry
            .iter()
            .skip_while(|a| a.id != node.id)
            .skip(1)
            .any(|a| a.requires_complete_tree);
        if !claimed {
            owners.insert(descendant.id.as_str());
        }
    }

    let mut clauses = Vec::new();
    for chunk in chunks {
        if !owners.contains(chunk.node_id.as_str())
            || matches!(chunk.chunk_type, ChunkType::Header | ChunkType::Matrix)
        {
            continue;
        }
        let own = chunk.own_text();
        for (start, end) in patterns::sentence_spans(own) {
            let text = &own[start..end];
            if text.trim().is_empty() {
                continue;
            }
            clauses.push(Clause {
                chunk_id: chunk.id.clone(),
                position: (chunk.sequence, chunk.own_start() + start),
                text: text.to_string(),
                outcome: patterns::find_outcome(text),
                comparison: patterns::comparisons(text).into_iter().next(),
                requirement: patterns::has_requirement(text),
                conditional: patterns::has_conditional(text),
                precedence: patterns::precedence_hint(text),
            });
        }
    }
    clauses
}

const FAILURE_PHRASES: [&str; 8] = [
    "not meet",
    "not satisfy",
    "fail",
    "does not",
    "do not",
    "unable",
    "cannot",
    "otherwise",
];

fn is_failure_statement(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAILURE_PHRASES.iter().any(|p| lower.contains(p))
}

fn classify_clause(clause: &Clause) -> Option<ClauseRole> {
    if let Some((outcome, _)) = &clause.outcome {
        if clause.precedence == Some(Precedence::Otherwise) {
            return Some(ClauseRole::Fallthrough(outcome.clone()));
        }
        if *outcome == OutcomeKind::Decline
            && clause.comparison.is_none()
            && is_failure_statement(&clause.text)
        {
            return Some(ClauseRole::Failure(OutcomeKind::Decline));
        }
        let conditioned = clause.comparison.is_some() || clause.conditional || clause.requirement;
        if !conditioned && *outcome == OutcomeKind::Approve {
            return Some(ClauseRole::Fallthrough(OutcomeKind::Approve));
        }
        return Some(ClauseRole::Branch {
            outcome: Some(outcome.clone()),
            requirement: false,
            inferred: false,
        });
    }
    if clause.requirement {
        return Some(ClauseRole::Branch {
            outcome: None,
            requirement: true,
            inferred: false,
        });
    }
    if clause.comparison.is_some() || clause.conditional {
        return Some(ClauseRole::Ambiguous);
    }
    None
}

/// Pattern-only reading of an ambiguous clause: a threshold is a requirement,
/// a bare condition is not a criterion.
fn fallback_role(clause: &Clause) -> Option<ClauseRole> {
    clause.comparison.is_some().then_some(ClauseRole::Branch {
        outcome: None,
        requirement: true,
        inferred: false,
    })
}

async fn resolve_with_inference(
    session: &mut AssistSession<'_>,
    clause: &Clause,
    node_id: &str,
) -> Option<ClauseRole> {
    let answer = session
        .ask(
            clause.text.trim(),
            TaskKind::DecisionOutcome,
            &OUTCOME_LABELS,
            node_id,
        )
        .await;
    let Some(answer) = answer else {
        return fallback_role(clause);
    };
    match OutcomeKind::from_label(&answer.label) {
        Some(outcome) => Some(ClauseRole::Branch {
            outcome: Some(outcome),
            requirement: false,
            inferred: true,
        }),
        None => {
            if answer.label.trim() != "none" {
                session.reject(
                    format!("unrecognised decision outcome '{}'", answer.label),
                    node_id,
                );
            }
            fallback_role(clause)
        }
    }
}

const TITLE_NOISE: [&str; 13] = [
    "requirement",
    "requirements",
    "criteria",
    "criterion",
    "eligibility",
    "eligible",
    "limit",
    "limits",
    "threshold",
    "thresholds",
    "and",
    "for",
    "of",
];

/// The subject a comparison constrains: the vocabulary term nearest the
/// comparison, else the node title without requirement words.
fn subject_for(text: &str, comparison_start: usize, title: &str) -> String {
    if let Some(subject) = patterns::domain_subject(text, comparison_start) {
        return subject.to_string();
    }

    let words: Vec<String> = title
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty() && !TITLE_NOISE.contains(&w.as_str()))
        .collect();
    if words.is_empty() {
        "criterion".to_string()
    } else {
        words.join(" ")
    }
}

/// Warnings for flagged nodes that yielded no evaluative clause.
pub fn empty_trees(trees: &[DecisionTree]) -> Vec<Issue> {
    trees
        .iter()
        .filter(|t| t.natural_branch_count() == 0)
        .map(|t| {
            Issue::warning(
                IssueKind::IncompleteDecisionTree,
                format!(
                    "no evaluative clause found beneath decision node '{}'",
                    t.root.title
                ),
            )
            .with_subject(&t.id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::fakes;
    use crate::chunker::SemanticChunker;
    use crate::extractor::NavigationExtractor;
    use crate::patterns::DocumentFormat;
    use pretty_assertions::assert_eq;

    fn trees_for(text: &str) -> Vec<DecisionTree> {
        let tree = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&tree, text, 512, 0.1);
        DecisionTreeExtractor::default().extract(&tree, &chunks)
    }

    #[test]
    fn test_age_requirement_tree() {
        let text = "Chapter 1: Eligibility\n\
1.1 Age Requirements\n\
The borrower must be at least 18 years old.\n";
        let trees = trees_for(text);
        assert_eq!(trees.len(), 1);
        let tree = &trees[0];
        assert_eq!(tree.root.title, "1.1 Age Requirements");

        let branch = &tree.branches[0];
        assert_eq!(branch.label, "age >= 18");
        let condition = branch.condition.as_ref().unwrap();
        assert_eq!(condition.subject, "age");
        assert_eq!(condition.operator, ComparisonOp::Gte);
        assert_eq!(condition.value, 18.0);
        assert_eq!(branch.on_satisfied, BranchTarget::Continue);
        assert_eq!(
            branch.on_not_satisfied,
            BranchTarget::Outcome(OutcomeKind::Decline)
        );

        assert!(tree.leaf(&OutcomeKind::Approve).unwrap().implied);
        assert!(tree.leaf(&OutcomeKind::Decline).unwrap().implied);
        let refer = tree.leaf(&OutcomeKind::Refer).unwrap();
        assert!(refer.default_outcome);
        assert!(tree.edges.iter().any(|e| e.to == refer.id && e.kind == EdgeKind::Default));
        assert_eq!(tree.fallthrough, Some(OutcomeKind::Approve));

        // One natural branch: fixable, not yet complete.
        assert_eq!(tree.status, TreeCompleteness::Repairable);
        assert!(!tree.is_complete);
        assert_eq!(tree.paths.len(), 3);
    }

    #[test]
    fn test_stated_outcomes_and_fallthrough() {
        let text = "Chapter 2: Credit\n\
2.1 Credit Eligibility\n\
The borrower must have a credit score of at least 620. \
If the LTV exceeds 95%, refer the file to an underwriter. \
Applicants who do not meet these requirements are declined. \
Otherwise, the loan is approved.\n";
        let trees = trees_for(text);
        assert_eq!(trees.len(), 1);
        let tree = &trees[0];

        let labels: Vec<&str> = tree.branches.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["credit score >= 620", "ltv > 95%"]);
        assert_eq!(
            tree.branches[1].on_satisfied,
            BranchTarget::Outcome(OutcomeKind::Refer)
        );
        assert_eq!(tree.fallthrough, Some(OutcomeKind::Approve));

        assert!(tree.leaves.iter().all(|l| !l.default_outcome && !l.implied));
        assert_eq!(tree.status, TreeCompleteness::Complete);
        assert!(tree.is_complete);
        assert!(
            tree.paths
                .iter()
                .any(|p| p.description == "credit score >= 620: no -> DECLINE")
        );
    }

    #[test]
    fn test_approval_only_leaves_dead_end() {
        let text = "Chapter 3: Approval\n\
3.1 Approval Criteria\n\
If the credit score is 700 or higher, the loan is approved.\n";
        let trees = trees_for(text);
        let tree = &trees[0];
        assert_eq!(tree.branches.len(), 1);
        assert_eq!(
            tree.branches[0].on_satisfied,
            BranchTarget::Outcome(OutcomeKind::Approve)
        );
        assert_eq!(tree.fallthrough, None);
        assert!(tree.leaf(&OutcomeKind::Decline).unwrap().default_outcome);
        assert!(tree.leaf(&OutcomeKind::Refer).unwrap().default_outcome);
        assert!(!tree.is_complete);
    }

    #[test]
    fn test_precedence_overrides_document_order() {
        let text = "Chapter 4: Underwriting\n\
4.1 Eligibility Requirements\n\
The credit score must be at least 620. \
Finally, the loan amount must not exceed 500,000. \
First, the borrower must be at least 18 years old.\n";
        let trees = trees_for(text);
        let labels: Vec<&str> = trees[0].branches.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["age >= 18", "credit score >= 620", "loan amount <= 500000"]
        );
        let orders: Vec<usize> = trees[0].branches.iter().map(|b| b.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_subject_falls_back_to_title() {
        assert_eq!(
            subject_for("must be at least 2 years", 8, "Employment History Requirements"),
            "employment history"
        );
        assert_eq!(subject_for("must be at least 2", 8, "Requirements"), "criterion");
        assert_eq!(subject_for("mortgage of at least 2", 12, "Limits"), "criterion");
    }

    #[tokio::test]
    async fn test_ambiguous_clause_uses_inference() {
        let text = "Chapter 5: Capacity\n\
5.1 Debt Eligibility\n\
The borrower must document all income. \
When the DTI exceeds 50%, the file goes to committee.\n";
        let nav = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&nav, text, 512, 0.1);

        let plain = DecisionTreeExtractor::default().extract(&nav, &chunks);
        let dti = plain[0].branches.iter().find(|b| b.label == "dti > 50%").unwrap();
        assert_eq!(dti.on_satisfied, BranchTarget::Continue);

        let (classifier, calls) = fakes::scripted(|_| ("refer".to_string(), 0.9));
        let assisted = DecisionTreeExtractor::default()
            .with_classifier(classifier, 0.6)
            .extract_assisted(&nav, &chunks, &CancellationToken::new())
            .await;
        let dti = assisted.trees[0]
            .branches
            .iter()
            .find(|b| b.label == "dti > 50%")
            .unwrap();
        assert!(dti.inferred);
        assert_eq!(dti.on_satisfied, BranchTarget::Outcome(OutcomeKind::Refer));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_tree() {
        let text = "Chapter 1: Eligibility\n1.1 Age Requirements\nThe borrower must be at least 18 years old.\n";
        let nav = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&nav, text, 512, 0.1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = DecisionTreeExtractor::default()
            .extract_assisted(&nav, &chunks, &cancel)
            .await;
        assert!(out.cancelled);
        assert!(out.trees.is_empty());
    }

    #[test]
    fn test_ids_are_deterministic() {
        let text = "Chapter 1: Eligibility\n1.1 Age Requirements\nThe borrower must be at least 18 years old.\n";
        let a = trees_for(text);
        let b = trees_for(text);
        assert_eq!(a, b);
        let ids: HashSet<&str> = a[0].element_ids().collect();
        assert_eq!(ids.len(), 1 + a[0].branches.len() + a[0].leaves.len());
    }

    #[test]
    fn test_condition_label_formatting() {
        let c = Condition {
            subject: "ltv".to_string(),
            operator: ComparisonOp::Lte,
            value: 80.0,
            unit: Some("%".to_string()),
        };
        assert_eq!(c.label(), "ltv <= 80%");
        let d = Condition {
            subject: "dti".to_string(),
            operator: ComparisonOp::Lt,
            value: 43.5,
            unit: None,
        };
        assert_eq!(d.label(), "dti < 43.5");
    }
}
