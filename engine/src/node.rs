//! Core types for the navigation tree.
//!
//! A `NavigationNode` is one heading-level unit of document structure. Nodes
//! live in a flat arena owned by [`NavigationTree`]; parent and child links
//! are ids, never references.
//!
//! [`NavigationTree`]: crate::navigation::NavigationTree

use serde::{Deserialize, Serialize};

/// Type of a navigation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// The document itself (level 0).
    RootDocument,
    Chapter,
    Section,
    Subsection,
    /// A section whose title names an eligibility/approval flow.
    DecisionFlowSection,
}

impl NodeType {
    /// Node type for a heading level (1 = chapter, 2 = section, 3+ = subsection).
    pub fn for_level(level: u32) -> Self {
        match level {
            0 => Self::RootDocument,
            1 => Self::Chapter,
            2 => Self::Section,
            _ => Self::Subsection,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootDocument => "ROOT_DOCUMENT",
            Self::Chapter => "CHAPTER",
            Self::Section => "SECTION",
            Self::Subsection => "SUBSECTION",
            Self::DecisionFlowSection => "DECISION_FLOW_SECTION",
        }
    }
}

/// Where a heading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingOrigin {
    Pattern,
    /// A pattern match corroborated by a table-of-contents entry.
    TableOfContents,
    /// Level or acceptance decided with inference-service help.
    Inference,
    /// Created by the engine (root, unparsed regions).
    Synthetic,
}

/// Source provenance of a node.
///
/// Byte offsets index the raw document text. `start_offset` is the start of
/// the heading line and `content_start` the first byte after it. The node's
/// own text runs to `content_end` (the next heading of any level); the
/// subtree runs to `end_offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// 1-based first line.
    pub start_line: usize,
    /// 1-based last line (inclusive).
    pub end_line: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub start_offset: usize,
    pub content_start: usize,
    pub content_end: usize,
    pub end_offset: usize,
}

impl SourceSpan {
    /// Number of source bytes covered.
    pub fn len(&self) -> usize {
        self.end_offset.saturating_sub(self.start_offset)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte range of the heading line.
    pub fn heading_range(&self) -> std::ops::Range<usize> {
        self.start_offset..self.content_start
    }

    /// Byte range owned by the node itself: heading line plus body up to the
    /// next heading.
    pub fn own_range(&self) -> std::ops::Range<usize> {
        self.start_offset..self.content_end
    }

    /// Byte range of the body, without the heading line.
    pub fn body_range(&self) -> std::ops::Range<usize> {
        self.content_start..self.content_end
    }
}

/// A node in the navigation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationNode {
    /// Stable identifier.
    pub id: String,

    pub node_type: NodeType,

    pub title: String,

    /// Depth in the tree (0 = root).
    pub level: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_number: Option<String>,

    pub provenance: SourceSpan,

    /// Parent node ID (None for root).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Child node IDs in document order.
    #[serde(default)]
    pub children: Vec<String>,

    /// Content matches decision-indicator patterns.
    #[serde(default)]
    pub requires_complete_tree: bool,

    /// Decision-indicator score that drove the flag.
    #[serde(default)]
    pub decision_score: f32,

    /// Confidence that this is a real heading (0.0 to 1.0).
    pub heading_confidence: f32,

    pub origin: HeadingOrigin,
}

impl NavigationNode {
    /// Create a node with the given id, type and title.
    pub fn new(id: impl Into<String>, node_type: NodeType, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            title: title.into(),
            level: 0,
            chapter_number: None,
            section_number: None,
            provenance: SourceSpan::default(),
            parent_id: None,
            children: Vec::new(),
            requires_complete_tree: false,
            decision_score: 0.0,
            heading_confidence: 1.0,
            origin: HeadingOrigin::Pattern,
        }
    }

    /// Create the root document node.
    pub fn root(id: impl Into<String>, title: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeType::RootDocument, title);
        node.origin = HeadingOrigin::Synthetic;
        node
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_provenance(mut self, provenance: SourceSpan) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_numbering(
        mut self,
        chapter_number: Option<String>,
        section_number: Option<String>,
    ) -> Self {
        self.chapter_number = chapter_number;
        self.section_number = section_number;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.heading_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_origin(mut self, origin: HeadingOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Add a child ID to this node.
    pub fn add_child(&mut self, child_id: impl Into<String>) {
        self.children.push(child_id.into());
    }

    pub fn is_root(&self) -> bool {
        self.node_type == NodeType::RootDocument
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Most specific numbering available ("2.1" over "2").
    pub fn numbering(&self) -> Option<&str> {
        self.section_number
            .as_deref()
            .or(self.chapter_number.as_deref())
    }

    /// Heading line as a display label ("1.1 Age Requirements").
    pub fn label(&self) -> String {
        match self.numbering() {
            Some(n) if self.node_type != NodeType::RootDocument => format!("{n} {}", self.title),
            _ => self.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_type_for_level() {
        assert_eq!(NodeType::for_level(0), NodeType::RootDocument);
        assert_eq!(NodeType::for_level(1), NodeType::Chapter);
        assert_eq!(NodeType::for_level(2), NodeType::Section);
        assert_eq!(NodeType::for_level(5), NodeType::Subsection);
    }

    #[test]
    fn test_label_prefers_section_number() {
        let node = NavigationNode::new("n1", NodeType::Section, "Age Requirements")
            .with_numbering(Some("1".to_string()), Some("1.1".to_string()));
        assert_eq!(node.label(), "1.1 Age Requirements");
        assert_eq!(NavigationNode::root("r", "Policy").label(), "Policy");
    }

    #[test]
    fn test_serializes_screaming_node_type() {
        let node = NavigationNode::new("n1", NodeType::DecisionFlowSection, "Approval Criteria");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["node_type"], "DECISION_FLOW_SECTION");
        assert!(json.get("parent_id").is_none());
    }
}
