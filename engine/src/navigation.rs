//! Navigation tree structure.
//!
//! The `NavigationTree` is a flat arena of [`NavigationNode`]s indexed by id,
//! plus the document order of those ids. Parent/child links are ids.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::issue::{Issue, IssueKind};
use crate::node::{HeadingOrigin, NavigationNode, NodeType};
use crate::quality::NavigationQuality;

/// Ordered, nested heading structure of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationTree {
    pub document_id: String,

    /// All nodes in the tree, indexed by ID.
    nodes: HashMap<String, NavigationNode>,

    /// Node IDs in document order (root first).
    order: Vec<String>,

    root_id: String,

    /// Set by the extractor after the tree is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<NavigationQuality>,
}

impl NavigationTree {
    /// Create a tree holding only `root`.
    pub fn new(document_id: impl Into<String>, root: NavigationNode) -> Self {
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            document_id: document_id.into(),
            nodes,
            order: vec![root_id.clone()],
            root_id,
            quality: None,
        }
    }

    /// Rebuild a tree from a node list in document order (e.g. a stored snapshot).
    pub fn from_nodes(document_id: impl Into<String>, nodes: Vec<NavigationNode>) -> Result<Self> {
        let roots: Vec<&NavigationNode> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
        let root_id = match roots.as_slice() {
            [root] => root.id.clone(),
            other => {
                return Err(EngineError::Structure(format!(
                    "expected exactly one root node, found {}",
                    other.len()
                )));
            }
        };
        let order = nodes.iter().map(|n| n.id.clone()).collect();
        Ok(Self {
            document_id: document_id.into(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            order,
            root_id,
            quality: None,
        })
    }

    /// Get the root node.
    pub fn root(&self) -> &NavigationNode {
        // The root is inserted at construction and never removed.
        &self.nodes[&self.root_id]
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Get a node by ID.
    pub fn get(&self, id: &str) -> Option<&NavigationNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut NavigationNode> {
        self.nodes.get_mut(id)
    }

    /// Get the total number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree always has its root, so it is "empty" when nothing else is in it.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Nodes in document order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &NavigationNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Position of a node in document order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Add a node as the last child of `parent_id`.
    pub fn add_child(&mut self, parent_id: &str, mut child: NavigationNode) -> Result<String> {
        let parent = self
            .nodes
            .get(parent_id)
            .ok_or_else(|| EngineError::Structure(format!("parent node not found: {parent_id}")))?;
        if self.nodes.contains_key(&child.id) {
            return Err(EngineError::Structure(format!(
                "duplicate node id: {}",
                child.id
            )));
        }

        child.parent_id = Some(parent_id.to_string());
        child.level = parent.level + 1;
        let child_id = child.id.clone();

        self.order.push(child_id.clone());
        self.nodes.insert(child_id.clone(), child);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.add_child(&child_id);
        }
        Ok(child_id)
    }

    /// Direct children of a node, in document order.
    pub fn children(&self, id: &str) -> Vec<&NavigationNode> {
        self.nodes
            .get(id)
            .map(|n| n.children.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Path from the root to `id`, inclusive.
    pub fn ancestry(&self, id: &str) -> Vec<&NavigationNode> {
        let mut ancestry = Vec::new();
        let mut current = Some(id.to_string());
        let mut seen = HashSet::new();

        while let Some(cid) = current {
            if !seen.insert(cid.clone()) {
                break;
            }
            match self.nodes.get(&cid) {
                Some(node) => {
                    ancestry.push(node);
                    current = node.parent_id.clone();
                }
                None => break,
            }
        }

        ancestry.reverse();
        ancestry
    }

    /// Ordered ancestor titles from the root down to and including `id`.
    pub fn navigation_path(&self, id: &str) -> Vec<String> {
        self.ancestry(id).into_iter().map(|n| n.label()).collect()
    }

    /// Whether `ancestor` is a strict ancestor of `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        ancestor != descendant && self.ancestry(descendant).iter().any(|n| n.id == ancestor)
    }

    /// All descendants of a node, in document order.
    pub fn descendants(&self, id: &str) -> Vec<&NavigationNode> {
        let mut found = Vec::new();
        let mut stack: Vec<&str> = self
            .nodes
            .get(id)
            .map(|n| n.children.iter().rev().map(String::as_str).collect())
            .unwrap_or_default();

        while let Some(cid) = stack.pop() {
            if let Some(node) = self.nodes.get(cid) {
                found.push(node);
                stack.extend(node.children.iter().rev().map(String::as_str));
            }
        }
        found
    }

    /// Depth-first, document-ordered node ids.
    pub fn depth_first(&self) -> Vec<&NavigationNode> {
        let mut out = vec![self.root()];
        out.extend(self.descendants(&self.root_id));
        out
    }

    /// Get the maximum depth in the tree.
    pub fn max_depth(&self) -> u32 {
        self.nodes.values().map(|n| n.level).max().unwrap_or(0)
    }

    /// Nodes flagged `requires_complete_tree`, in document order.
    pub fn flagged_nodes(&self) -> Vec<&NavigationNode> {
        self.nodes_in_order()
            .filter(|n| n.requires_complete_tree)
            .collect()
    }

    /// Find a heading by its numbering ("2.1", "3").
    pub fn find_by_numbering(&self, numbering: &str) -> Option<&NavigationNode> {
        self.nodes_in_order()
            .find(|n| !n.is_root() && n.numbering() == Some(numbering))
    }

    /// Find a heading whose title matches, ignoring case and punctuation.
    pub fn find_by_title(&self, title: &str) -> Option<&NavigationNode> {
        let wanted = normalize_title(title);
        if wanted.is_empty() {
            return None;
        }
        self.nodes_in_order()
            .find(|n| !n.is_root() && normalize_title(&n.title) == wanted)
    }

    /// Nodes with no valid parent chain to the root.
    pub fn orphans(&self) -> Vec<&NavigationNode> {
        self.nodes_in_order()
            .filter(|n| {
                let ancestry = self.ancestry(&n.id);
                ancestry.first().map(|a| a.id.as_str()) != Some(self.root_id.as_str())
            })
            .collect()
    }

    /// Check arena consistency. Returns one error issue per violation.
    pub fn validate_structure(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let violation = |msg: String, id: &str| {
            Issue::error(IssueKind::StructuralInvariantViolation, msg).with_subject(id)
        };

        let roots = self
            .nodes
            .values()
            .filter(|n| n.parent_id.is_none())
            .count();
        if roots != 1 {
            issues.push(violation(
                format!("tree has {roots} parentless nodes, expected 1"),
                &self.root_id,
            ));
        }

        for node in self.nodes_in_order() {
            if let Some(ref parent_id) = node.parent_id {
                match self.nodes.get(parent_id) {
                    None => issues.push(violation(
                        format!("node '{}' references missing parent {parent_id}", node.title),
                        &node.id,
                    )),
                    Some(parent) => {
                        if !parent.children.contains(&node.id) {
                            issues.push(violation(
                                format!("node '{}' is not listed by its parent", node.title),
                                &node.id,
                            ));
                        }
                    }
                }
            }

            for child_id in &node.children {
                match self.nodes.get(child_id) {
                    None => issues.push(violation(
                        format!("node '{}' lists missing child {child_id}", node.title),
                        &node.id,
                    )),
                    Some(child) if child.parent_id.as_deref() != Some(node.id.as_str()) => {
                        issues.push(violation(
                            format!("child '{}' points at another parent", child.title),
                            child_id,
                        ))
                    }
                    Some(_) => {}
                }
            }

            let positions: Vec<Option<usize>> =
                node.children.iter().map(|c| self.position(c)).collect();
            if positions.windows(2).any(|w| w[0] >= w[1]) {
                issues.push(violation(
                    format!("children of '{}' are out of document order", node.title),
                    &node.id,
                ));
            }
        }

        for orphan in self.orphans() {
            issues.push(violation(
                format!("node '{}' has no path to the root", orphan.title),
                &orphan.id,
            ));
        }

        if self.order.len() != self.nodes.len() {
            issues.push(violation(
                "document order does not list every node".to_string(),
                &self.root_id,
            ));
        }

        issues
    }

    /// Get statistics about the tree.
    pub fn stats(&self) -> NavigationStats {
        let mut stats = NavigationStats {
            total_nodes: self.nodes.len(),
            max_depth: self.max_depth(),
            ..Default::default()
        };

        for node in self.nodes.values() {
            match node.node_type {
                NodeType::RootDocument => {}
                NodeType::Chapter => stats.chapters += 1,
                NodeType::Section => stats.sections += 1,
                NodeType::Subsection => stats.subsections += 1,
                NodeType::DecisionFlowSection => stats.decision_flow_sections += 1,
            }
            if node.requires_complete_tree {
                stats.decision_flagged += 1;
            }
            if node.origin == HeadingOrigin::Synthetic && !node.is_root() {
                stats.synthetic += 1;
            }
        }

        stats
    }

    /// Indented outline of the tree, one heading per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for node in self.depth_first() {
            let indent = "  ".repeat(node.level as usize);
            let flag = if node.requires_complete_tree { " [decision]" } else { "" };
            out.push_str(&format!(
                "{indent}{} ({}){flag}\n",
                node.label(),
                node.node_type.as_str()
            ));
        }
        debug!(nodes = self.nodes.len(), "rendered outline");
        out
    }
}

/// Lowercase alphanumeric words joined by single spaces.
pub fn normalize_title(title: &str) -> String {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Statistics about a navigation tree.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationStats {
    pub total_nodes: usize,
    pub max_depth: u32,
    pub chapters: usize,
    pub sections: usize,
    pub subsections: usize,
    pub decision_flow_sections: usize,
    pub decision_flagged: usize,
    pub synthetic: usize,
}

impl std::fmt::Display for NavigationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Navigation Tree Statistics:")?;
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Max depth: {}", self.max_depth)?;
        writeln!(f, "  Chapters: {}", self.chapters)?;
        writeln!(f, "  Sections: {}", self.sections)?;
        writeln!(f, "  Subsections: {}", self.subsections)?;
        writeln!(f, "  Decision flow sections: {}", self.decision_flow_sections)?;
        writeln!(f, "  Decision-flagged: {}", self.decision_flagged)?;
        write!(f, "  Synthetic: {}", self.synthetic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_tree() -> NavigationTree {
        let mut tree = NavigationTree::new("doc", NavigationNode::root("root", "Policy"));
        tree.add_child(
            "root",
            NavigationNode::new("c1", NodeType::Chapter, "Eligibility")
                .with_numbering(Some("1".to_string()), None),
        )
        .unwrap();
        tree.add_child(
            "c1",
            NavigationNode::new("s11", NodeType::Section, "Age Requirements")
                .with_numbering(Some("1".to_string()), Some("1.1".to_string())),
        )
        .unwrap();
        tree.add_child(
            "c1",
            NavigationNode::new("s12", NodeType::Section, "Income")
                .with_numbering(Some("1".to_string()), Some("1.2".to_string())),
        )
        .unwrap();
        tree.add_child("root", NavigationNode::new("c2", NodeType::Chapter, "Assets"))
            .unwrap();
        tree
    }

    #[test]
    fn test_add_child_sets_level_and_parent() {
        let tree = sample_tree();
        let s11 = tree.get("s11").unwrap();
        assert_eq!(s11.level, 2);
        assert_eq!(s11.parent_id.as_deref(), Some("c1"));
        assert_eq!(tree.get("c1").unwrap().children, vec!["s11", "s12"]);
    }

    #[test]
    fn test_add_child_rejects_missing_parent() {
        let mut tree = sample_tree();
        let err = tree
            .add_child("nope", NavigationNode::new("x", NodeType::Section, "X"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Structure(_)));
    }

    #[test]
    fn test_navigation_path() {
        let tree = sample_tree();
        assert_eq!(
            tree.navigation_path("s11"),
            vec!["Policy", "1 Eligibility", "1.1 Age Requirements"]
        );
        assert!(tree.is_ancestor("c1", "s12"));
        assert!(!tree.is_ancestor("s12", "c1"));
    }

    #[test]
    fn test_descendants_in_document_order() {
        let tree = sample_tree();
        let ids: Vec<&str> = tree.descendants("root").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "s11", "s12", "c2"]);
        assert_eq!(tree.max_depth(), 2);
    }

    #[test]
    fn test_valid_tree_has_no_issues() {
        assert!(sample_tree().validate_structure().is_empty());
    }

    #[test]
    fn test_detects_orphans_and_cycles() {
        let mut tree = sample_tree();
        // Break the chain: s11 now claims a parent that lists it nowhere.
        tree.get_mut("s11").unwrap().parent_id = Some("ghost".to_string());
        let issues = tree.validate_structure();
        assert!(issues.iter().all(Issue::is_structural));
        assert!(issues.iter().any(|i| i.message.contains("missing parent")));
        assert!(issues.iter().any(|i| i.message.contains("no path to the root")));

        let mut cyclic = sample_tree();
        cyclic.get_mut("c1").unwrap().parent_id = Some("s11".to_string());
        assert_eq!(cyclic.orphans().len(), 3);
    }

    #[test]
    fn test_find_by_numbering_and_title() {
        let tree = sample_tree();
        assert_eq!(tree.find_by_numbering("1.2").unwrap().id, "s12");
        assert_eq!(tree.find_by_title("age  requirements").unwrap().id, "s11");
        assert!(tree.find_by_title("").is_none());
    }

    #[test]
    fn test_from_nodes_round_trip() {
        let tree = sample_tree();
        let nodes: Vec<NavigationNode> = tree.nodes_in_order().cloned().collect();
        let rebuilt = NavigationTree::from_nodes("doc", nodes).unwrap();
        assert_eq!(rebuilt.len(), 5);
        assert!(rebuilt.validate_structure().is_empty());
        assert_eq!(rebuilt.outline(), tree.outline());
    }

    #[test]
    fn test_stats() {
        let stats = sample_tree().stats();
        assert_eq!(stats.total_nodes, 5);
        assert_eq!(stats.chapters, 2);
        assert_eq!(stats.sections, 2);
        assert_eq!(stats.max_depth, 2);
    }
}
