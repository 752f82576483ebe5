//! Quality metrics.
//!
//! Derived, read-only aggregates attached to a navigation tree or a decision
//! tree after validation. They are recomputed on every pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Quality of a navigation tree extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationQuality {
    /// Heading nodes (everything but the root).
    pub heading_count: usize,
    pub mean_heading_confidence: f32,
    pub toc_entries: usize,
    pub toc_matched: usize,
    pub inferred_headings: usize,
    pub rejected_inferences: usize,
    pub synthetic_sections: usize,
    pub decision_flagged: usize,
    /// Fraction of source bytes owned by non-root nodes.
    pub body_coverage: f32,
    pub orphan_count: usize,
}

impl NavigationQuality {
    /// Fraction of TOC entries corroborated by a body heading.
    pub fn toc_match_ratio(&self) -> f32 {
        if self.toc_entries == 0 {
            return 1.0;
        }
        self.toc_matched as f32 / self.toc_entries as f32
    }
}

/// Metrics for one decision tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeQuality {
    pub branch_count: usize,
    pub leaf_count: usize,
    pub path_count: usize,
    pub synthesized_leaves: usize,
    pub synthesized_branches: usize,
    pub unreachable_leaves: usize,
    pub dead_end_branches: usize,
    pub orphan_count: usize,
    /// Branches whose condition was parsed from a numeric comparison.
    pub parsed_conditions: usize,
}

impl TreeQuality {
    /// Share of leaves that were synthesized rather than extracted.
    pub fn synthesized_ratio(&self) -> f32 {
        if self.leaf_count == 0 {
            return 0.0;
        }
        self.synthesized_leaves as f32 / self.leaf_count as f32
    }
}

/// Aggregate over all decision trees of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub tree_count: usize,
    pub complete: usize,
    pub repairable: usize,
    pub incomplete: usize,
    pub invalid: usize,
    pub total_branches: usize,
    pub total_leaves: usize,
    pub synthesized_leaves: usize,
    pub mean_paths_per_tree: f32,
    /// Issue counts by kind name.
    pub issues_by_kind: BTreeMap<String, usize>,
}

impl QualityReport {
    pub fn synthesized_ratio(&self) -> f32 {
        if self.total_leaves == 0 {
            return 0.0;
        }
        self.synthesized_leaves as f32 / self.total_leaves as f32
    }

    pub fn all_complete(&self) -> bool {
        self.complete == self.tree_count
    }
}

impl std::fmt::Display for QualityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Decision Tree Quality:")?;
        writeln!(f, "  Trees: {}", self.tree_count)?;
        writeln!(
            f,
            "  Complete: {}  Repairable: {}  Incomplete: {}  Invalid: {}",
            self.complete, self.repairable, self.incomplete, self.invalid
        )?;
        writeln!(f, "  Branches: {}", self.total_branches)?;
        writeln!(
            f,
            "  Leaves: {} ({:.0}% synthesized)",
            self.total_leaves,
            self.synthesized_ratio() * 100.0
        )?;
        write!(f, "  Mean paths per tree: {:.1}", self.mean_paths_per_tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios_handle_empty() {
        assert_eq!(NavigationQuality::default().toc_match_ratio(), 1.0);
        assert_eq!(TreeQuality::default().synthesized_ratio(), 0.0);
        assert!(QualityReport::default().all_complete());
    }

    #[test]
    fn test_report_display() {
        let report = QualityReport {
            tree_count: 2,
            complete: 2,
            total_leaves: 6,
            synthesized_leaves: 3,
            mean_paths_per_tree: 4.0,
            ..Default::default()
        };
        let text = report.to_string();
        assert!(text.contains("Leaves: 6 (50% synthesized)"));
    }
}
