//! Navigation extraction.
//!
//! Converts raw document text into a [`NavigationTree`]:
//!
//! 1. scan for a table-of-contents block and parse its entries,
//! 2. scan every body line against the heading pattern families,
//! 3. merge TOC-derived and pattern-derived headings in document order,
//! 4. optionally ask the inference service about low-confidence headings and
//!    re-validate its answers against the numbering,
//! 5. attach headings with a level-tracking stack,
//! 6. flag decision-bearing nodes.
//!
//! No heading matches is not a failure: the result is a single-node tree plus
//! a `PatternExtractionFailure` warning.

use std::collections::HashMap;

use policy_nav_inference::{GuardedClassifier, TaskKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assist::AssistSession;
use crate::ids;
use crate::issue::{Issue, IssueKind};
use crate::navigation::{NavigationTree, normalize_title};
use crate::node::{HeadingOrigin, NavigationNode, NodeType, SourceSpan};
use crate::patterns::{self, DocumentFormat, HeadingMatch, HeadingRule, TocEntry};
use crate::quality::NavigationQuality;

const HEADING_LABELS: [&str; 4] = ["chapter", "section", "subsection", "not_heading"];

/// Configuration for navigation extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Headings below this confidence are discarded.
    pub min_heading_confidence: f32,

    /// Headings below this confidence are sent to the inference service.
    pub inference_threshold: f32,

    /// Decision-indicator score at which a node is flagged.
    pub decision_threshold: f32,

    /// How much of a node's body is scanned for decision indicators.
    pub decision_lookahead_chars: usize,

    /// Confidence added to a heading corroborated by the TOC.
    pub toc_confidence_boost: f32,

    /// Consecutive garbled lines needed to form an unparsed region.
    pub min_garbled_lines: usize,

    /// Body coverage below which a `LowCoverage` warning is raised.
    pub low_coverage_threshold: f32,

    /// Upper bound on inference calls per document.
    pub max_inference_calls: usize,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            min_heading_confidence: 0.5,
            inference_threshold: 0.7,
            decision_threshold: 0.5,
            decision_lookahead_chars: 2_000,
            toc_confidence_boost: 0.15,
            min_garbled_lines: 3,
            low_coverage_threshold: 0.5,
            max_inference_calls: 32,
        }
    }
}

/// Output of an extraction run over one document.
#[derive(Debug, Clone)]
pub struct NavigationExtraction {
    pub tree: NavigationTree,
    pub issues: Vec<Issue>,
    pub toc: Vec<TocEntry>,
    /// Set when cancellation stopped heading resolution early.
    pub cancelled: bool,
}

struct Line<'a> {
    number: usize,
    start: usize,
    end: usize,
    text: &'a str,
    page: u32,
    page_marker: bool,
}

impl Line<'_> {
    fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    line: usize,
    heading: HeadingMatch,
    confidence: f32,
    origin: HeadingOrigin,
    toc_page: Option<u32>,
    rejected: bool,
}

impl Candidate {
    fn new(line: usize, heading: HeadingMatch) -> Self {
        Self {
            line,
            confidence: heading.confidence,
            heading,
            origin: HeadingOrigin::Pattern,
            toc_page: None,
            rejected: false,
        }
    }

    fn is_unparsed(&self) -> bool {
        self.heading.rule == HeadingRule::Unparsed
    }
}

struct Scan<'a> {
    lines: Vec<Line<'a>>,
    has_page_breaks: bool,
    toc: Vec<TocEntry>,
    toc_matched: usize,
    candidates: Vec<Candidate>,
    issues: Vec<Issue>,
}

/// Builds navigation trees from document text.
#[derive(Clone, Default)]
pub struct NavigationExtractor {
    config: NavigationConfig,
    classifier: Option<GuardedClassifier>,
    min_inference_confidence: f32,
}

impl NavigationExtractor {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            config,
            classifier: None,
            min_inference_confidence: 0.6,
        }
    }

    /// Enable inference-assisted disambiguation of low-confidence headings.
    pub fn with_classifier(mut self, classifier: GuardedClassifier, min_confidence: f32) -> Self {
        self.classifier = Some(classifier);
        self.min_inference_confidence = min_confidence;
        self
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    /// Pattern-only extraction.
    pub fn extract(&self, text: &str, format: DocumentFormat) -> NavigationTree {
        self.extract_detailed(text, format, &ids::document_id(text))
            .tree
    }

    /// Pattern-only extraction with issues and TOC entries.
    pub fn extract_detailed(
        &self,
        text: &str,
        format: DocumentFormat,
        document_id: &str,
    ) -> NavigationExtraction {
        let scan = self.scan(text, format, document_id);
        self.finish(scan, text, format, document_id, &CancellationToken::new())
    }

    /// Extraction with inference assistance and cooperative cancellation.
    pub async fn extract_assisted(
        &self,
        text: &str,
        format: DocumentFormat,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> NavigationExtraction {
        let mut scan = self.scan(text, format, document_id);
        self.disambiguate(&mut scan, document_id, cancel).await;
        self.finish(scan, text, format, document_id, cancel)
    }

    fn scan<'a>(&self, text: &'a str, format: DocumentFormat, document_id: &str) -> Scan<'a> {
        let (lines, has_page_breaks) = split_lines(text, format);
        let (toc_hits, toc_lines) = scan_toc(&lines);
        let mut issues = Vec::new();

        let mut candidates: Vec<Candidate> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if line.is_blank()
                || line.page_marker
                || toc_lines.contains(&idx)
                || patterns::is_garbled(line.text)
            {
                continue;
            }
            if let Some(heading) = patterns::match_heading(line.text, format) {
                let mut candidate = Candidate::new(idx, heading);
                let after_blank = idx == 0 || lines[idx - 1].is_blank();
                if candidate.heading.rule == HeadingRule::AllCaps && after_blank {
                    candidate.confidence += 0.1;
                }
                candidates.push(candidate);
            }
        }

        // TOC corroboration.
        let toc: Vec<TocEntry> = toc_hits.into_iter().map(|(entry, _)| entry).collect();
        let mut toc_used = vec![false; toc.len()];
        for candidate in &mut candidates {
            let title = normalize_title(&candidate.heading.title);
            let found = toc.iter().enumerate().position(|(k, entry)| {
                !toc_used[k]
                    && (candidate.heading.numbering.as_deref() == Some(entry.numbering.as_str())
                        || normalize_title(&entry.title) == title)
            });
            if let Some(k) = found {
                toc_used[k] = true;
                let entry = &toc[k];
                candidate.confidence =
                    (candidate.confidence + self.config.toc_confidence_boost).min(1.0);
                candidate.origin = HeadingOrigin::TableOfContents;
                candidate.toc_page = Some(entry.page);
                if candidate.heading.numbering.is_none() {
                    candidate.heading.level = entry.level;
                }
            }
        }

        // TOC entries whose heading line carries no recognizable pattern.
        for (k, entry) in toc.iter().enumerate() {
            if toc_used[k] {
                continue;
            }
            let wanted = normalize_title(&entry.title);
            let numbered = normalize_title(&format!("{} {}", entry.numbering, entry.title));
            let hit = lines.iter().enumerate().position(|(idx, line)| {
                !toc_lines.contains(&idx)
                    && !candidates.iter().any(|c| c.line == idx)
                    && !line.is_blank()
                    && {
                        let text = normalize_title(line.text);
                        text == wanted || text == numbered
                    }
            });
            match hit {
                Some(idx) => {
                    toc_used[k] = true;
                    let mut candidate = Candidate::new(
                        idx,
                        HeadingMatch {
                            level: entry.level,
                            title: entry.title.clone(),
                            numbering: Some(entry.numbering.clone()),
                            specificity: entry.numbering.split('.').count(),
                            confidence: 0.8,
                            rule: HeadingRule::TableOfContents,
                        },
                    );
                    candidate.origin = HeadingOrigin::TableOfContents;
                    candidate.toc_page = Some(entry.page);
                    candidates.push(candidate);
                }
                None => issues.push(
                    Issue::info(
                        IssueKind::UnmatchedTocEntry,
                        format!(
                            "table of contents entry '{} {}' (page {}) has no matching heading",
                            entry.numbering, entry.title, entry.page
                        ),
                    )
                    .with_subject(ids::derive_id(document_id, "toc", &entry.numbering)),
                ),
            }
        }

        // "1. Title" is a chapter style only in documents without chapter keywords.
        let has_chapter_keywords = candidates
            .iter()
            .any(|c| c.heading.rule == HeadingRule::ChapterKeyword);
        if has_chapter_keywords {
            candidates.retain(|c| {
                c.heading.rule != HeadingRule::SingleNumber
                    || c.origin == HeadingOrigin::TableOfContents
            });
        }

        candidates.sort_by_key(|c| c.line);
        let toc_matched = toc_used.iter().filter(|used| **used).count();

        debug!(
            lines = lines.len(),
            candidates = candidates.len(),
            toc_entries = toc.len(),
            toc_matched,
            "Scanned document for headings"
        );

        Scan {
            lines,
            has_page_breaks,
            toc,
            toc_matched,
            candidates,
            issues,
        }
    }

    async fn disambiguate(&self, scan: &mut Scan<'_>, document_id: &str, cancel: &CancellationToken) {
        let mut session = AssistSession::new(
            self.classifier.as_ref(),
            self.min_inference_confidence,
            self.config.max_inference_calls,
        );
        if !session.is_active() {
            return;
        }

        let mut previous_level = 0;
        for i in 0..scan.candidates.len() {
            if cancel.is_cancelled() {
                debug!("Cancelled during heading disambiguation");
                break;
            }
            let candidate = &scan.candidates[i];
            if candidate.confidence >= self.config.inference_threshold || !session.is_active() {
                if !candidate.rejected && candidate.confidence >= self.config.min_heading_confidence {
                    previous_level = candidate.heading.level;
                }
                continue;
            }

            let line = &scan.lines[candidate.line];
            let subject = ids::derive_id(document_id, "node", &format!("line-{}", line.number));
            let context = heading_context(&scan.lines, candidate.line);
            let Some(answer) = session
                .ask(&context, TaskKind::HeadingDisambiguation, &HEADING_LABELS, &subject)
                .await
            else {
                if candidate.confidence >= self.config.min_heading_confidence {
                    previous_level = candidate.heading.level;
                }
                continue;
            };

            let floor = self.config.min_heading_confidence;
            let candidate = &mut scan.candidates[i];
            let numbered = candidate.heading.numbering.is_some();
            match level_for_label(&answer.label) {
                None if numbered => {
                    session.reject(
                        format!(
                            "numbered heading '{}' kept although inference answered not_heading",
                            candidate.heading.title
                        ),
                        &subject,
                    );
                    candidate.confidence = candidate.confidence.max(floor);
                }
                None => {
                    candidate.rejected = true;
                }
                Some(claimed) if numbered => {
                    if claimed != candidate.heading.level {
                        session.reject(
                            format!(
                                "numbering '{}' fixes level {}; inference claimed level {claimed}",
                                candidate.heading.numbering.as_deref().unwrap_or_default(),
                                candidate.heading.level
                            ),
                            &subject,
                        );
                    }
                    if candidate.confidence < floor {
                        candidate.origin = HeadingOrigin::Inference;
                    }
                    candidate.confidence = candidate.confidence.max(floor);
                }
                Some(claimed) => {
                    let clamped = claimed.min(previous_level + 1).max(1);
                    if clamped != claimed {
                        session.reject(
                            format!(
                                "level {claimed} for '{}' clamped to {clamped} under the open heading",
                                candidate.heading.title
                            ),
                            &subject,
                        );
                    }
                    candidate.heading.level = clamped;
                    candidate.confidence = candidate.confidence.max(answer.confidence).max(floor);
                    candidate.origin = HeadingOrigin::Inference;
                }
            }
            if !candidate.rejected && candidate.confidence >= floor {
                previous_level = candidate.heading.level;
            }
        }

        debug!(calls = session.calls(), "Heading disambiguation finished");
        scan.issues.append(&mut session.issues);
    }

    fn finish(
        &self,
        scan: Scan<'_>,
        text: &str,
        format: DocumentFormat,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> NavigationExtraction {
        let Scan {
            lines,
            has_page_breaks,
            toc,
            toc_matched,
            candidates,
            mut issues,
        } = scan;

        let rejected_inferences = issues
            .iter()
            .filter(|i| i.kind == IssueKind::RejectedInference)
            .count();

        // Acceptance, running-header suppression and cancellation.
        let mut accepted: Vec<Candidate> = Vec::new();
        let mut seen_on_page: HashMap<(u32, String), u32> = HashMap::new();
        let mut cancelled = false;
        for candidate in candidates {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if candidate.rejected || candidate.confidence < self.config.min_heading_confidence {
                continue;
            }
            let page = lines[candidate.line].page;
            if format == DocumentFormat::FlowedPdf {
                let key = (
                    candidate.heading.level,
                    normalize_title(&candidate.heading.label()),
                );
                if let Some(first_page) = seen_on_page.get(&key) {
                    if *first_page < page {
                        debug!(title = %candidate.heading.title, page, "Skipping running header");
                        continue;
                    }
                }
                seen_on_page.entry(key).or_insert(page);
            }
            accepted.push(candidate);
        }

        let mut accepted = insert_unparsed_regions(
            accepted,
            &lines,
            self.config.min_garbled_lines,
        );
        accepted.sort_by_key(|c| c.line);

        let mut tree =
            build_tree(document_id, text, &lines, has_page_breaks, &accepted, &mut issues);
        self.flag_decision_nodes(&mut tree, text);

        let quality = self.quality(&tree, text, &toc, toc_matched, rejected_inferences);
        if tree.is_empty() && !cancelled {
            issues.push(
                Issue::warning(
                    IssueKind::PatternExtractionFailure,
                    "no heading patterns matched; document kept as a single node",
                )
                .with_subject(tree.root_id()),
            );
        }
        if !cancelled
            && !text.trim().is_empty()
            && quality.body_coverage < self.config.low_coverage_threshold
        {
            issues.push(
                Issue::warning(
                    IssueKind::LowCoverage,
                    format!(
                        "headings cover {:.0}% of the document body",
                        quality.body_coverage * 100.0
                    ),
                )
                .with_subject(tree.root_id()),
            );
        }
        issues.extend(tree.validate_structure());

        info!(
            document_id,
            format = format.as_str(),
            nodes = tree.len(),
            flagged = quality.decision_flagged,
            coverage = quality.body_coverage,
            cancelled,
            "Navigation extraction complete"
        );

        tree.quality = Some(quality);
        NavigationExtraction {
            tree,
            issues,
            toc,
            cancelled,
        }
    }

    fn flag_decision_nodes(&self, tree: &mut NavigationTree, text: &str) {
        let ids: Vec<String> = tree
            .nodes_in_order()
            .filter(|n| !n.is_root() && n.origin != HeadingOrigin::Synthetic)
            .map(|n| n.id.clone())
            .collect();

        for id in ids {
            let Some(node) = tree.get_mut(&id) else { continue };
            let body = truncate_at_char(
                text.get(node.provenance.body_range()).unwrap_or_default(),
                self.config.decision_lookahead_chars,
            );
            let mut signals = patterns::title_signals(&node.title);
            signals.extend(patterns::body_signals(body));
            let score = patterns::decision_score(&signals);
            let flow_title = patterns::is_decision_flow_title(&node.title);

            node.decision_score = score;
            node.requires_complete_tree = score >= self.config.decision_threshold || flow_title;
            if flow_title && matches!(node.node_type, NodeType::Section | NodeType::Subsection) {
                node.node_type = NodeType::DecisionFlowSection;
            }
            if node.requires_complete_tree {
                debug!(title = %node.title, score, "Flagged decision-bearing node");
            }
        }
    }

    fn quality(
        &self,
        tree: &NavigationTree,
        text: &str,
        toc: &[TocEntry],
        toc_matched: usize,
        rejected_inferences: usize,
    ) -> NavigationQuality {
        let headings: Vec<&NavigationNode> =
            tree.nodes_in_order().filter(|n| !n.is_root()).collect();
        let mean_heading_confidence = if headings.is_empty() {
            0.0
        } else {
            headings.iter().map(|n| n.heading_confidence).sum::<f32>() / headings.len() as f32
        };

        let body_len = text.trim().len();
        let root_own = text
            .get(tree.root().provenance.own_range())
            .map_or(0, |s| s.trim().len());
        let body_coverage = if body_len == 0 {
            0.0
        } else {
            1.0 - root_own as f32 / body_len as f32
        };

        NavigationQuality {
            heading_count: headings.len(),
            mean_heading_confidence,
            toc_entries: toc.len(),
            toc_matched,
            inferred_headings: headings
                .iter()
                .filter(|n| n.origin == HeadingOrigin::Inference)
                .count(),
            rejected_inferences,
            synthetic_sections: headings
                .iter()
                .filter(|n| n.origin == HeadingOrigin::Synthetic)
                .count(),
            decision_flagged: headings.iter().filter(|n| n.requires_complete_tree).count(),
            body_coverage: body_coverage.clamp(0.0, 1.0),
            orphan_count: tree.orphans().len(),
        }
    }
}

fn split_lines(text: &str, format: DocumentFormat) -> (Vec<Line<'_>>, bool) {
    let mut lines = Vec::new();
    let mut offset = 0;
    let mut page = 1u32;
    let mut next_page: Option<u32> = None;
    let mut has_page_breaks = false;

    for (idx, raw) in text.split_inclusive('\n').enumerate() {
        let feeds = raw.matches('\x0c').count() as u32;
        if feeds > 0 {
            has_page_breaks = true;
            page = match next_page.take() {
                Some(p) => p + feeds - 1,
                None => page + feeds,
            };
        } else if let Some(p) = next_page.take() {
            page = p;
        }

        let body = raw.trim_end_matches(['\n', '\r']);
        let mut page_marker = false;
        if format == DocumentFormat::FlowedPdf {
            if let Some(n) = patterns::page_marker(body) {
                // Page markers are footers: the text after them is on the next page.
                page_marker = true;
                has_page_breaks = true;
                page = n;
                next_page = Some(n + 1);
            }
        }

        lines.push(Line {
            number: idx + 1,
            start: offset,
            end: offset + raw.len(),
            text: body,
            page,
            page_marker,
        });
        offset += raw.len();
    }

    (lines, has_page_breaks)
}

/// Table-of-contents entries with their line index, and the set of lines
/// belonging to the TOC block.
fn scan_toc(lines: &[Line<'_>]) -> (Vec<(TocEntry, usize)>, std::collections::HashSet<usize>) {
    let mut entries = Vec::new();
    let mut block = std::collections::HashSet::new();

    let Some(anchor) = lines.iter().position(|l| patterns::is_toc_anchor(l.text)) else {
        return (entries, block);
    };

    let mut pending: Vec<usize> = Vec::new();
    let mut misses = 0;
    for (idx, line) in lines.iter().enumerate().skip(anchor + 1) {
        if line.is_blank() || line.page_marker {
            pending.push(idx);
            continue;
        }
        match patterns::parse_toc_entry(line.text) {
            Some(entry) => {
                entries.push((entry, idx));
                block.extend(pending.drain(..));
                block.insert(idx);
                misses = 0;
            }
            None => {
                misses += 1;
                pending.push(idx);
                if misses >= 3 {
                    break;
                }
            }
        }
    }

    if !entries.is_empty() {
        block.insert(anchor);
    }
    (entries, block)
}

/// Runs of garbled lines become synthetic placeholder candidates.
fn insert_unparsed_regions(
    mut accepted: Vec<Candidate>,
    lines: &[Line<'_>],
    min_lines: usize,
) -> Vec<Candidate> {
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize, usize)> = None;

    for (idx, line) in lines.iter().enumerate() {
        if line.is_blank() {
            continue;
        }
        if patterns::is_garbled(line.text) {
            current = match current {
                Some((first, _, count)) => Some((first, idx, count + 1)),
                None => Some((idx, idx, 1)),
            };
        } else if let Some(run) = current.take() {
            runs.push(run);
        }
    }
    runs.extend(current);

    for (first, last, count) in runs {
        if count < min_lines {
            continue;
        }
        let previous_level = accepted
            .iter()
            .filter(|c| c.line < first)
            .max_by_key(|c| c.line)
            .map_or(0, |c| c.heading.level);
        let title = format!(
            "Unparsed region (lines {}–{})",
            lines[first].number, lines[last].number
        );
        let mut candidate = Candidate::new(
            first,
            HeadingMatch {
                level: previous_level + 1,
                title,
                numbering: None,
                specificity: 0,
                confidence: 1.0,
                rule: HeadingRule::Unparsed,
            },
        );
        candidate.origin = HeadingOrigin::Synthetic;
        accepted.push(candidate);
    }
    accepted
}

fn build_tree(
    document_id: &str,
    text: &str,
    lines: &[Line<'_>],
    has_page_breaks: bool,
    accepted: &[Candidate],
    issues: &mut Vec<Issue>,
) -> NavigationTree {
    let last_page = lines.last().map_or(1, |l| l.page);
    let first_heading_start = accepted
        .first()
        .map_or(text.len(), |c| lines[c.line].start);

    let root_title = lines
        .iter()
        .take_while(|l| l.start < first_heading_start)
        .find(|l| {
            !l.is_blank()
                && !l.page_marker
                && !patterns::is_toc_anchor(l.text)
                && patterns::parse_toc_entry(l.text).is_none()
        })
        .map(|l| truncate_at_char(l.text.trim(), 100).to_string())
        .unwrap_or_else(|| "Document".to_string());

    let root_id = ids::derive_id(document_id, "node", "root");
    let root = NavigationNode::root(&root_id, root_title).with_provenance(SourceSpan {
        start_line: 1,
        end_line: lines.len().max(1),
        page_start: 1,
        page_end: last_page,
        start_offset: 0,
        content_start: 0,
        content_end: first_heading_start,
        end_offset: text.len(),
    });
    let mut tree = NavigationTree::new(document_id, root);

    let mut stack: Vec<(u32, String)> = Vec::new();
    for (k, candidate) in accepted.iter().enumerate() {
        let level = candidate.heading.level;
        while stack.last().is_some_and(|(open, _)| *open >= level) {
            stack.pop();
        }
        let parent_id = stack
            .last()
            .map_or_else(|| root_id.clone(), |(_, id)| id.clone());

        let line = &lines[candidate.line];
        let next_start = accepted
            .get(k + 1)
            .map_or(text.len(), |c| lines[c.line].start);
        let subtree_end_line = accepted[k + 1..]
            .iter()
            .find(|c| c.heading.level <= level)
            .map(|c| c.line);
        let end_offset = subtree_end_line.map_or(text.len(), |l| lines[l].start);
        let end_line_idx = subtree_end_line.map_or(lines.len() - 1, |l| l.saturating_sub(1));

        let page_start = match candidate.toc_page {
            Some(p) if !has_page_breaks => p,
            _ => line.page,
        };
        let page_end = if has_page_breaks {
            lines[end_line_idx.max(candidate.line)].page
        } else {
            page_start
        };

        let content_start = if candidate.is_unparsed() {
            line.start
        } else {
            line.end
        };
        let (chapter_number, section_number) =
            numbering_fields(level, candidate.heading.numbering.as_deref());
        let node_type = if candidate.is_unparsed() {
            NodeType::Section
        } else {
            NodeType::for_level(level)
        };

        let id = ids::derive_id(document_id, "node", &format!("line-{}", line.number));
        let node = NavigationNode::new(&id, node_type, candidate.heading.title.clone())
            .with_numbering(chapter_number, section_number)
            .with_confidence(candidate.confidence)
            .with_origin(candidate.origin)
            .with_provenance(SourceSpan {
                start_line: line.number,
                end_line: lines[end_line_idx.max(candidate.line)].number,
                page_start,
                page_end,
                start_offset: line.start,
                content_start,
                content_end: next_start,
                end_offset,
            });

        match tree.add_child(&parent_id, node) {
            Ok(id) => stack.push((level, id)),
            Err(err) => issues.push(
                Issue::error(IssueKind::StructuralInvariantViolation, err.to_string())
                    .with_subject(id),
            ),
        }
    }

    tree
}

fn numbering_fields(level: u32, numbering: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(numbering) = numbering else {
        return (None, None);
    };
    let components = numbering.split('.').filter(|p| !p.is_empty()).count();
    if level <= 1 {
        (Some(numbering.to_string()), None)
    } else if components == 1 {
        (None, Some(numbering.to_string()))
    } else {
        patterns::split_numbering(numbering)
    }
}

fn level_for_label(label: &str) -> Option<u32> {
    match label {
        "chapter" => Some(1),
        "section" => Some(2),
        "subsection" => Some(3),
        _ => None,
    }
}

fn heading_context(lines: &[Line<'_>], idx: usize) -> String {
    let mut context = vec![lines[idx].text.trim()];
    context.extend(
        lines[idx + 1..]
            .iter()
            .filter(|l| !l.is_blank())
            .take(2)
            .map(|l| l.text.trim()),
    );
    truncate_at_char(&context.join("\n"), 400).to_string()
}

/// Longest prefix of `s` not exceeding `max` bytes that ends on a char boundary.
pub(crate) fn truncate_at_char(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::fakes;
    use pretty_assertions::assert_eq;

    const POLICY: &str = "Mortgage Underwriting Policy\n\
\n\
Chapter 1: Eligibility\n\
1.1 Age Requirements\n\
The borrower must be at least 18 years old.\n\
1.2 Residency\n\
Borrowers must be lawful residents.\n\
Chapter 2: Income\n\
Income is documented with two years of tax returns.\n\
2.1 Self-Employed Borrowers\n\
2.1.1 Tax Returns\n\
Provide signed returns.\n";

    fn extractor() -> NavigationExtractor {
        NavigationExtractor::new(NavigationConfig::default())
    }

    #[test]
    fn test_builds_nested_tree() {
        let tree = extractor().extract(POLICY, DocumentFormat::StructuredText);
        assert_eq!(tree.root().title, "Mortgage Underwriting Policy");

        let chapters = tree.children(tree.root_id());
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].node_type, NodeType::Chapter);
        assert_eq!(chapters[0].title, "Eligibility");

        let sections = tree.children(&chapters[0].id);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Age Requirements");
        assert_eq!(sections[0].section_number.as_deref(), Some("1.1"));
        assert_eq!(sections[0].chapter_number.as_deref(), Some("1"));

        let income = tree.children(&chapters[1].id);
        assert_eq!(income.len(), 1);
        let sub = tree.children(&income[0].id);
        assert_eq!(sub[0].node_type, NodeType::Subsection);
        assert_eq!(tree.max_depth(), 3);
        assert!(tree.validate_structure().is_empty());
    }

    #[test]
    fn test_flags_decision_section_only() {
        let tree = extractor().extract(POLICY, DocumentFormat::StructuredText);
        let flagged: Vec<&str> = tree.flagged_nodes().iter().map(|n| n.title.as_str()).collect();
        assert!(flagged.contains(&"Age Requirements"));
        assert!(!flagged.contains(&"Eligibility"));
        assert!(!flagged.contains(&"Tax Returns"));
    }

    #[test]
    fn test_spans_partition_the_text() {
        let tree = extractor().extract(POLICY, DocumentFormat::StructuredText);
        let mut rebuilt = String::new();
        for node in tree.nodes_in_order() {
            rebuilt.push_str(&POLICY[node.provenance.own_range()]);
        }
        assert_eq!(rebuilt, POLICY);

        let age = tree.find_by_numbering("1.1").unwrap();
        assert_eq!(
            &POLICY[age.provenance.body_range()],
            "The borrower must be at least 18 years old.\n"
        );
        assert_eq!(age.provenance.start_line, 4);
    }

    #[test]
    fn test_no_headings_degrades_to_single_node() {
        let text = "just some prose without any structure.\nanother line of prose.\n";
        let result = extractor().extract_detailed(text, DocumentFormat::StructuredText, "doc");
        assert_eq!(result.tree.len(), 1);
        let kinds: Vec<IssueKind> = result.issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::PatternExtractionFailure));
        assert!(kinds.contains(&IssueKind::LowCoverage));
        assert!(!result.issues.iter().any(Issue::is_structural));
    }

    #[test]
    fn test_toc_corroborates_and_reports_unmatched() {
        let text = "Table of Contents\n\
1.1 Age Requirements ........ 3\n\
1.2 Credit History .......... 4\n\
9.9 Appendix ................ 40\n\
\n\
Chapter 1: Eligibility\n\
1.1 Age Requirements\n\
Applicants must be 18.\n\
Credit History\n\
Twelve months of history.\n";
        let result = extractor().extract_detailed(text, DocumentFormat::StructuredText, "doc");
        let tree = &result.tree;

        let age = tree.find_by_numbering("1.1").unwrap();
        assert_eq!(age.origin, HeadingOrigin::TableOfContents);
        assert_eq!(age.provenance.page_start, 3);
        assert_eq!(age.provenance.start_line, 7);

        // Matched through the TOC even though the body line has no numbering.
        let credit = tree.find_by_title("Credit History").unwrap();
        assert_eq!(credit.section_number.as_deref(), Some("1.2"));

        let unmatched: Vec<&Issue> = result
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::UnmatchedTocEntry)
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert!(unmatched[0].message.contains("Appendix"));

        let quality = tree.quality.as_ref().unwrap();
        assert_eq!(quality.toc_entries, 3);
        assert_eq!(quality.toc_matched, 2);
    }

    #[test]
    fn test_pdf_pages_and_running_headers() {
        let text = "Chapter 1: Eligibility\n\
Borrowers must be 18.\n\
Page 1 of 2\n\
\x0cChapter 1: Eligibility\n\
1.1 Residency\n\
Residents only.\n";
        let tree = extractor().extract(text, DocumentFormat::FlowedPdf);
        let chapters = tree.children(tree.root_id());
        assert_eq!(chapters.len(), 1);
        let residency = tree.find_by_numbering("1.1").unwrap();
        assert_eq!(residency.provenance.page_start, 2);
        assert_eq!(residency.parent_id.as_deref(), Some(chapters[0].id.as_str()));
    }

    #[test]
    fn test_markup_headings() {
        let text = "# Lending Policy\n\nIntro.\n\n## Credit Score\nMinimum 620.\n### Exceptions\nNone.\n";
        let tree = extractor().extract(text, DocumentFormat::Markup);
        let top = tree.children(tree.root_id());
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].title, "Lending Policy");
        let credit = tree.children(&top[0].id);
        assert_eq!(credit[0].title, "Credit Score");
        assert_eq!(tree.children(&credit[0].id)[0].node_type, NodeType::Subsection);
    }

    #[test]
    fn test_garbled_region_becomes_synthetic_section() {
        let text = "Chapter 1: Assets\n\
Assets are verified.\n\
\u{FFFD}\u{FFFD}#@~^\u{FFFD}\u{FFFD}~~^^\n\
~~^^\u{FFFD}\u{FFFD}#@##@@\n\
@@##\u{FFFD}\u{FFFD}~~^^~\n\
Chapter 2: Income\n\
Income text.\n";
        let result = extractor().extract_detailed(text, DocumentFormat::FlowedPdf, "doc");
        let tree = &result.tree;
        let synthetic = tree
            .nodes_in_order()
            .find(|n| n.origin == HeadingOrigin::Synthetic && !n.is_root())
            .unwrap();
        assert_eq!(synthetic.node_type, NodeType::Section);
        assert_eq!(synthetic.title, "Unparsed region (lines 3–5)");
        assert_eq!(tree.get(synthetic.parent_id.as_deref().unwrap()).unwrap().title, "Assets");
        assert_eq!(tree.quality.as_ref().unwrap().synthetic_sections, 1);
    }

    #[tokio::test]
    async fn test_inference_resolves_unnumbered_heading() {
        let text = "Chapter 1: Eligibility\nIntro text.\nINCOME DOCUMENTATION\nPay stubs are required.\n";
        let (classifier, calls) = fakes::scripted(|req| {
            if req.text.starts_with("INCOME") {
                ("section".to_string(), 0.9)
            } else {
                ("not_heading".to_string(), 0.9)
            }
        });
        let extractor = extractor().with_classifier(classifier, 0.6);
        let result = extractor
            .extract_assisted(text, DocumentFormat::StructuredText, "doc", &CancellationToken::new())
            .await;

        let income = result.tree.find_by_title("INCOME DOCUMENTATION").unwrap();
        assert_eq!(income.origin, HeadingOrigin::Inference);
        assert_eq!(income.node_type, NodeType::Section);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inference_cannot_override_numbering() {
        let text = "Chapter 1: Eligibility\n\
Intro.\n\
SPECIAL CASES\n\
Text.\n\
1.1 Residency Requirements For Borrowers Who Reside In 2 Or More States\n\
More text.\n";
        let (classifier, _) = fakes::scripted(|req| {
            if req.text.starts_with("1.1") {
                ("chapter".to_string(), 0.95)
            } else if req.text.starts_with("SPECIAL") {
                ("subsection".to_string(), 0.95)
            } else {
                ("not_heading".to_string(), 0.9)
            }
        });
        let extractor = extractor().with_classifier(classifier, 0.6);
        let result = extractor
            .extract_assisted(text, DocumentFormat::StructuredText, "doc", &CancellationToken::new())
            .await;

        let residency = result.tree.find_by_numbering("1.1").unwrap();
        assert_eq!(residency.node_type, NodeType::Section);

        // Un-numbered headings may go at most one level below the open heading.
        let special = result.tree.find_by_title("SPECIAL CASES").unwrap();
        assert_eq!(special.node_type, NodeType::Section);

        let rejected: Vec<&str> = result
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::RejectedInference)
            .map(|i| i.message.as_str())
            .collect();
        assert!(rejected.iter().any(|m| m.contains("fixes level 2")));
        assert!(rejected.iter().any(|m| m.contains("clamped to 2")));
    }

    #[tokio::test]
    async fn test_inference_timeout_keeps_pattern_tree() {
        let text = "Chapter 1: Eligibility\nINCOME DOCUMENTATION\nPay stubs.\n";
        let extractor = extractor().with_classifier(fakes::stalled(), 0.6);
        let result = extractor
            .extract_assisted(text, DocumentFormat::StructuredText, "doc", &CancellationToken::new())
            .await;

        let pattern_only = extractor.extract_detailed(text, DocumentFormat::StructuredText, "doc");
        assert_eq!(result.tree.len(), pattern_only.tree.len());
        assert!(
            result
                .issues
                .iter()
                .any(|i| i.kind == IssueKind::InferenceServiceTimeout)
        );
    }

    #[test]
    fn test_cancelled_extraction_is_flagged() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let extractor = extractor();
        let scan = extractor.scan(POLICY, DocumentFormat::StructuredText, "doc");
        let result = extractor.finish(scan, POLICY, DocumentFormat::StructuredText, "doc", &cancel);
        assert!(result.cancelled);
        assert!(result.tree.validate_structure().is_empty());
    }

    #[test]
    fn test_ids_are_deterministic() {
        let a = extractor().extract(POLICY, DocumentFormat::StructuredText);
        let b = extractor().extract(POLICY, DocumentFormat::StructuredText);
        let ids_a: Vec<&str> = a.nodes_in_order().map(|n| n.id.as_str()).collect();
        let ids_b: Vec<&str> = b.nodes_in_order().map(|n| n.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }
}
