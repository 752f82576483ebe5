//! Decision tree validation and auto-completion.
//!
//! Completeness is a small state machine:
//!
//! ```text
//! INCOMPLETE --(gap can be synthesized)--> REPAIRABLE --auto_complete--> COMPLETE
//!      \
//!       `--(unreachable/orphaned elements, dangling edges, cycles)--> INVALID
//! ```
//!
//! `COMPLETE` and `INVALID` are terminal; validating never changes a tree and
//! auto-completion leaves every tree that is not `REPAIRABLE` untouched.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decision::{
    BranchTarget, DecisionBranch, DecisionTree, TreeCompleteness, enumerate_paths,
};
use crate::ids;
use crate::issue::{Issue, IssueKind};
use crate::patterns::OutcomeKind;
use crate::quality::{QualityReport, TreeQuality};

/// Label of the branch added when a tree has too few criteria.
pub const UNEVALUABLE_LABEL: &str = "criteria cannot be evaluated";

/// Configuration for decision tree validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_branches: usize,
    pub min_leaves: usize,

    /// Whether gaps may be repaired by synthesizing branches and outcomes.
    pub allow_synthesis: bool,

    pub max_paths: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_branches: 2,
            min_leaves: 3,
            allow_synthesis: true,
            max_paths: 64,
        }
    }
}

/// Outcome of validating one tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub tree_id: String,
    pub issues: Vec<Issue>,
    pub is_complete: bool,
    pub status: TreeCompleteness,
    pub metrics: TreeQuality,
}

impl ValidationResult {
    /// Structural errors found.
    pub fn structural_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_structural())
    }
}

/// Checks decision trees against the completeness contract.
#[derive(Debug, Clone, Default)]
pub struct DecisionTreeValidator {
    config: ValidatorConfig,
}

impl DecisionTreeValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, tree: &DecisionTree) -> ValidationResult {
        assess(tree, &self.config)
    }

    /// Repair a `REPAIRABLE` tree. Any other tree is returned unchanged.
    pub fn auto_complete(&self, tree: &DecisionTree) -> DecisionTree {
        let before = self.validate(tree);
        if before.status != TreeCompleteness::Repairable {
            return tree.clone();
        }

        let mut repaired = tree.clone();
        let mut added = 0;
        while repaired.branches.len() < self.config.min_branches {
            repaired
                .branches
                .insert(0, unevaluable_branch(&repaired, added));
            added += 1;
        }
        for (order, branch) in repaired.branches.iter_mut().enumerate() {
            branch.order = order;
        }
        if repaired.fallthrough.is_none() {
            repaired.fallthrough = Some(OutcomeKind::Decline);
        }
        let synthesized_leaves = repaired.synthesize_missing_outcomes();
        repaired.rewire(self.config.max_paths);
        stamp(&mut repaired, &self.config);

        info!(
            tree_id = %repaired.id,
            added_branches = added,
            synthesized_leaves,
            status = repaired.status.as_str(),
            "Auto-completed decision tree"
        );
        repaired
    }

    /// Aggregate quality over a set of trees.
    pub fn report(&self, trees: &[DecisionTree]) -> QualityReport {
        let mut report = QualityReport {
            tree_count: trees.len(),
            ..Default::default()
        };
        let mut paths = 0;
        for tree in trees {
            let result = self.validate(tree);
            match result.status {
                TreeCompleteness::Complete => report.complete += 1,
                TreeCompleteness::Repairable => report.repairable += 1,
                TreeCompleteness::Incomplete => report.incomplete += 1,
                TreeCompleteness::Invalid => report.invalid += 1,
            }
            report.total_branches += result.metrics.branch_count;
            report.total_leaves += result.metrics.leaf_count;
            report.synthesized_leaves += result.metrics.synthesized_leaves;
            paths += result.metrics.path_count;
            for issue in &result.issues {
                *report
                    .issues_by_kind
                    .entry(issue.kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        if !trees.is_empty() {
            report.mean_paths_per_tree = paths as f32 / trees.len() as f32;
        }
        report
    }
}

/// Write status, completeness and metrics onto a tree.
pub(crate) fn stamp(tree: &mut DecisionTree, config: &ValidatorConfig) {
    let result = assess(tree, config);
    tree.status = result.status;
    tree.is_complete = result.is_complete;
    tree.metrics = Some(result.metrics);
}

fn unevaluable_branch(tree: &DecisionTree, index: usize) -> DecisionBranch {
    DecisionBranch {
        id: ids::derive_id(
            &tree.document_id,
            "decision-branch",
            &format!("{}/synthesized/{index}", tree.root.node_id),
        ),
        label: UNEVALUABLE_LABEL.to_string(),
        clause: String::new(),
        condition: None,
        precedence: None,
        order: 0,
        on_satisfied: BranchTarget::Outcome(OutcomeKind::Refer),
        on_not_satisfied: BranchTarget::Continue,
        source_chunk_id: None,
        synthesized: true,
        inferred: false,
    }
}

fn assess(tree: &DecisionTree, config: &ValidatorConfig) -> ValidationResult {
    let mut issues = Vec::new();
    let mut structural = false;
    let mut gaps = false;

    let mut error = |issues: &mut Vec<Issue>, message: String, subject: &str| {
        structural = true;
        issues.push(
            Issue::error(IssueKind::StructuralInvariantViolation, message).with_subject(subject),
        );
    };

    let mut known: HashSet<&str> = HashSet::new();
    for id in tree.element_ids() {
        if !known.insert(id) {
            error(&mut issues, format!("duplicate element id {id}"), &tree.id);
        }
    }
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &tree.edges {
        if !known.contains(edge.from.as_str()) || !known.contains(edge.to.as_str()) {
            error(
                &mut issues,
                format!("edge {} -> {} has a missing endpoint", edge.from, edge.to),
                &tree.id,
            );
            continue;
        }
        if edge.to == tree.root.id {
            error(&mut issues, "edge leads back into the root".to_string(), &tree.id);
            continue;
        }
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }
    if has_cycle(&adjacency) {
        error(&mut issues, "edges form a cycle".to_string(), &tree.id);
    }

    let reachable = reachable_from(&adjacency, &tree.root.id);
    let leaf_ids: HashSet<&str> = tree.leaves.iter().map(|l| l.id.as_str()).collect();

    let mut unreachable_branches = 0;
    for branch in tree.branches.iter().filter(|b| !reachable.contains(b.id.as_str())) {
        unreachable_branches += 1;
        error(
            &mut issues,
            format!("branch '{}' is unreachable from the root", branch.label),
            &branch.id,
        );
    }

    let mut unreachable_leaves = 0;
    for leaf in tree.leaves.iter().filter(|l| !reachable.contains(l.id.as_str())) {
        unreachable_leaves += 1;
        if leaf.default_outcome {
            gaps = true;
            issues.push(
                Issue::warning(
                    IssueKind::IncompleteDecisionTree,
                    format!("synthesized {} leaf is not attached", leaf.label),
                )
                .with_subject(&leaf.id),
            );
        } else {
            error(
                &mut issues,
                format!("{} leaf is unreachable from the root", leaf.label),
                &leaf.id,
            );
        }
    }

    let mut dead_ends = 0;
    for branch in tree.branches.iter().filter(|b| reachable.contains(b.id.as_str())) {
        let routes = adjacency.get(branch.id.as_str()).map_or(0, Vec::len);
        let terminates = reachable_from(&adjacency, &branch.id)
            .iter()
            .any(|id| leaf_ids.contains(id));
        if routes < 2 || !terminates {
            dead_ends += 1;
            gaps = true;
            issues.push(
                Issue::warning(
                    IssueKind::IncompleteDecisionTree,
                    format!("branch '{}' has an evaluation route with no outcome", branch.label),
                )
                .with_subject(&branch.id),
            );
        }
    }

    let missing = tree.missing_outcomes();
    if !missing.is_empty() {
        gaps = true;
        let names: Vec<String> = missing.iter().map(OutcomeKind::label).collect();
        issues.push(
            Issue::warning(
                IssueKind::IncompleteDecisionTree,
                format!("missing mandatory outcomes: {}", names.join(", ")),
            )
            .with_subject(&tree.id),
        );
    }
    if tree.branches.len() < config.min_branches {
        gaps = true;
        issues.push(
            Issue::warning(
                IssueKind::IncompleteDecisionTree,
                format!(
                    "{} branch(es), at least {} required",
                    tree.branches.len(),
                    config.min_branches
                ),
            )
            .with_subject(&tree.id),
        );
    }
    if tree.leaves.len() < config.min_leaves {
        gaps = true;
        issues.push(
            Issue::warning(
                IssueKind::IncompleteDecisionTree,
                format!(
                    "{} leaf/leaves, at least {} required",
                    tree.leaves.len(),
                    config.min_leaves
                ),
            )
            .with_subject(&tree.id),
        );
    }

    let status = if structural {
        TreeCompleteness::Invalid
    } else if !gaps {
        TreeCompleteness::Complete
    } else if config.allow_synthesis && tree.natural_branch_count() > 0 {
        TreeCompleteness::Repairable
    } else {
        TreeCompleteness::Incomplete
    };

    let metrics = TreeQuality {
        branch_count: tree.branches.len(),
        leaf_count: tree.leaves.len(),
        path_count: enumerate_paths(tree, config.max_paths).len(),
        synthesized_leaves: tree.leaves.iter().filter(|l| l.default_outcome).count(),
        synthesized_branches: tree.branches.iter().filter(|b| b.synthesized).count(),
        unreachable_leaves,
        dead_end_branches: dead_ends,
        orphan_count: unreachable_branches + unreachable_leaves,
        parsed_conditions: tree.branches.iter().filter(|b| b.condition.is_some()).count(),
    };

    debug!(
        tree_id = %tree.id,
        status = status.as_str(),
        issues = issues.len(),
        "Validated decision tree"
    );

    ValidationResult {
        tree_id: tree.id.clone(),
        issues,
        is_complete: status == TreeCompleteness::Complete,
        status,
        metrics,
    }
}

fn reachable_from<'a>(
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    start: &'a str,
) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(at) = queue.pop_front() {
        for &next in adjacency.get(at).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn has_cycle(adjacency: &HashMap<&str, Vec<&str>>) -> bool {
    // 1 = on the current path, 2 = finished.
    let mut state: BTreeMap<&str, u8> = BTreeMap::new();
    for &start in adjacency.keys() {
        if state.contains_key(start) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        state.insert(start, 1);
        while let Some((node, next)) = stack.pop() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&child) = children.get(next) {
                stack.push((node, next + 1));
                match state.get(child) {
                    Some(1) => return true,
                    Some(_) => {}
                    None => {
                        state.insert(child, 1);
                        stack.push((child, 0));
                    }
                }
            } else {
                state.insert(node, 2);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::SemanticChunker;
    use crate::decision::{DecisionEdge, DecisionTreeExtractor, EdgeKind};
    use crate::extractor::NavigationExtractor;
    use crate::node::NavigationNode;
    use crate::patterns::DocumentFormat;
    use pretty_assertions::assert_eq;

    const APPROVAL_ONLY: &str = "Chapter 3: Approval\n\
3.1 Approval Criteria\n\
If the credit score is 700 or higher, the loan is approved.\n";

    const FULL: &str = "Chapter 2: Credit\n\
2.1 Credit Eligibility\n\
The borrower must have a credit score of at least 620. \
If the LTV exceeds 95%, refer the file to an underwriter. \
Applicants who do not meet these requirements are declined. \
Otherwise, the loan is approved.\n";

    fn first_tree(text: &str) -> DecisionTree {
        let nav = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&nav, text, 512, 0.1);
        DecisionTreeExtractor::default()
            .extract(&nav, &chunks)
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn test_approval_only_tree_is_auto_completed() {
        let validator = DecisionTreeValidator::default();
        let tree = first_tree(APPROVAL_ONLY);

        let before = validator.validate(&tree);
        assert_eq!(before.status, TreeCompleteness::Repairable);
        assert!(!before.is_complete);
        assert!(
            before
                .issues
                .iter()
                .all(|i| i.kind == IssueKind::IncompleteDecisionTree)
        );

        let repaired = validator.auto_complete(&tree);
        let after = validator.validate(&repaired);
        assert_eq!(after.status, TreeCompleteness::Complete);
        assert!(after.is_complete);
        assert!(repaired.is_complete);
        assert!(repaired.branches.len() >= 2);
        assert!(repaired.leaves.len() >= 3);
        assert!(repaired.leaf(&OutcomeKind::Decline).unwrap().default_outcome);
        assert!(repaired.leaf(&OutcomeKind::Refer).unwrap().default_outcome);
        assert!(!repaired.leaf(&OutcomeKind::Approve).unwrap().default_outcome);
        assert_eq!(repaired.branches[0].label, UNEVALUABLE_LABEL);
        assert!(repaired.branches[0].synthesized);
        assert_eq!(repaired.fallthrough, Some(OutcomeKind::Decline));
        assert_eq!(after.metrics.synthesized_branches, 1);
    }

    #[test]
    fn test_complete_tree_is_left_alone() {
        let validator = DecisionTreeValidator::default();
        let tree = first_tree(FULL);
        assert_eq!(validator.validate(&tree).status, TreeCompleteness::Complete);
        assert_eq!(validator.auto_complete(&tree), tree);
    }

    #[test]
    fn test_unreachable_stated_leaf_is_invalid() {
        let validator = DecisionTreeValidator::default();
        let mut tree = first_tree(FULL);
        let approve = tree.leaf(&OutcomeKind::Approve).unwrap().id.clone();
        tree.edges.retain(|e| e.to != approve);

        let result = validator.validate(&tree);
        assert_eq!(result.status, TreeCompleteness::Invalid);
        assert_eq!(result.metrics.unreachable_leaves, 1);
        assert!(result.structural_issues().count() >= 1);
        assert_eq!(validator.auto_complete(&tree), tree);
    }

    #[test]
    fn test_dangling_edge_and_cycle_are_invalid() {
        let validator = DecisionTreeValidator::default();
        let mut tree = first_tree(FULL);
        tree.edges.push(DecisionEdge {
            from: tree.branches[0].id.clone(),
            to: "nowhere".to_string(),
            kind: EdgeKind::Satisfied,
        });
        let result = validator.validate(&tree);
        assert_eq!(result.status, TreeCompleteness::Invalid);

        let mut cyclic = first_tree(FULL);
        cyclic.edges.push(DecisionEdge {
            from: cyclic.branches[1].id.clone(),
            to: cyclic.branches[0].id.clone(),
            kind: EdgeKind::NotSatisfied,
        });
        let result = validator.validate(&cyclic);
        assert_eq!(result.status, TreeCompleteness::Invalid);
        assert!(result.issues.iter().any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn test_tree_without_criteria_is_incomplete() {
        let node = NavigationNode::root("n1", "Underwriting Decision Flow");
        let mut tree = DecisionTree::new("doc", &node, vec!["Underwriting Decision Flow".into()]);
        tree.synthesize_missing_outcomes();
        tree.rewire(16);

        let validator = DecisionTreeValidator::default();
        let result = validator.validate(&tree);
        assert_eq!(result.status, TreeCompleteness::Incomplete);
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.message.contains("0 branch(es)"))
        );
        assert_eq!(validator.auto_complete(&tree), tree);
    }

    #[test]
    fn test_synthesis_can_be_disabled() {
        let validator = DecisionTreeValidator::new(ValidatorConfig {
            allow_synthesis: false,
            ..Default::default()
        });
        let tree = first_tree(APPROVAL_ONLY);
        assert_eq!(validator.validate(&tree).status, TreeCompleteness::Incomplete);
    }

    #[test]
    fn test_report_aggregates() {
        let validator = DecisionTreeValidator::default();
        let trees = vec![first_tree(FULL), first_tree(APPROVAL_ONLY)];
        let report = validator.report(&trees);
        assert_eq!(report.tree_count, 2);
        assert_eq!(report.complete, 1);
        assert_eq!(report.repairable, 1);
        assert_eq!(report.synthesized_leaves, 2);
        assert!(report.issues_by_kind.contains_key("IncompleteDecisionTree"));
        assert!(report.mean_paths_per_tree > 0.0);
    }

    #[test]
    fn test_cycle_detection() {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        adjacency.insert("a", vec!["b"]);
        adjacency.insert("b", vec!["c"]);
        assert!(!has_cycle(&adjacency));
        adjacency.insert("c", vec!["a"]);
        assert!(has_cycle(&adjacency));
    }
}
