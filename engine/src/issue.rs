//! Itemized issues recorded on an extraction run.

use serde::{Deserialize, Serialize};

/// Category of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    /// No heading patterns matched; the document became a single node.
    PatternExtractionFailure,
    /// An inference call exceeded its timeout.
    InferenceServiceTimeout,
    /// The inference service could not be reached or is not configured.
    InferenceServiceUnavailable,
    /// An inference answer failed structural re-validation and was ignored.
    RejectedInference,
    /// Orphaned node, cyclic parent chain, dangling reference.
    StructuralInvariantViolation,
    /// A decision tree misses outcome categories, branches or reachability.
    IncompleteDecisionTree,
    /// Structure covers too little of the source text.
    LowCoverage,
    /// A relationship was dropped during graph reconciliation.
    DroppedRelationship,
    /// A table-of-contents entry had no matching body heading.
    UnmatchedTocEntry,
    /// The run was cancelled before all stages completed.
    Cancelled,
}

impl IssueKind {
    /// Stable string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternExtractionFailure => "PatternExtractionFailure",
            Self::InferenceServiceTimeout => "InferenceServiceTimeout",
            Self::InferenceServiceUnavailable => "InferenceServiceUnavailable",
            Self::RejectedInference => "RejectedInference",
            Self::StructuralInvariantViolation => "StructuralInvariantViolation",
            Self::IncompleteDecisionTree => "IncompleteDecisionTree",
            Self::LowCoverage => "LowCoverage",
            Self::DroppedRelationship => "DroppedRelationship",
            Self::UnmatchedTocEntry => "UnmatchedTocEntry",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One recorded issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,

    /// Node, chunk, relationship or tree the issue is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

impl Issue {
    /// Create a new issue.
    pub fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            subject_id: None,
        }
    }

    pub fn info(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Info, message)
    }

    pub fn warning(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warning, message)
    }

    pub fn error(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Error, message)
    }

    /// Attach the id of the element the issue concerns.
    pub fn with_subject(mut self, id: impl Into<String>) -> Self {
        self.subject_id = Some(id.into());
        self
    }

    /// Whether this issue fails a strict run.
    pub fn is_structural(&self) -> bool {
        self.kind == IssueKind::StructuralInvariantViolation && self.severity == Severity::Error
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if let Some(ref id) = self.subject_id {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display_includes_subject() {
        let issue = Issue::error(IssueKind::StructuralInvariantViolation, "orphaned node")
            .with_subject("node-7");
        assert_eq!(
            issue.to_string(),
            "[StructuralInvariantViolation] orphaned node (node-7)"
        );
        assert!(issue.is_structural());
    }

    #[test]
    fn test_warning_is_not_structural() {
        let issue = Issue::warning(IssueKind::StructuralInvariantViolation, "dangling edge");
        assert!(!issue.is_structural());
    }
}
