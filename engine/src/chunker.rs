//! Hierarchy-aware chunking.
//!
//! Walks a [`NavigationTree`] depth-first and cuts each node's own text into
//! chunks on paragraph, sentence and clause boundaries. Every chunk carries
//! the ancestor-title path of its node. Decision clauses and matrix blocks are
//! never split, so a chunk may exceed the target size.
//!
//! Each chunk records the byte span it was cut from plus `overlap_len`, the
//! prefix repeated from the previous chunk of the same node. Concatenating
//! [`HierarchicalChunk::own_text`] over a node's chunks reproduces the node's
//! own source text.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ids;
use crate::navigation::NavigationTree;
use crate::node::NavigationNode;
use crate::patterns;
use crate::relationship::{DetectionMethod, RelationshipCandidate, RelationshipType};

/// Type of chunk content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    /// The heading line of a node.
    Header,
    /// Ordinary prose.
    Content,
    /// Eligibility criteria, thresholds or outcomes.
    Decision,
    /// A grid or table of values.
    Matrix,
    /// A pointer to another section or document.
    Reference,
    /// An overview or summary passage.
    Summary,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "HEADER",
            Self::Content => "CONTENT",
            Self::Decision => "DECISION",
            Self::Matrix => "MATRIX",
            Self::Reference => "REFERENCE",
            Self::Summary => "SUMMARY",
        }
    }
}

/// A content unit bound to exactly one navigation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalChunk {
    /// Unique identifier.
    pub id: String,

    /// Owning navigation node.
    pub node_id: String,

    pub chunk_type: ChunkType,

    /// Chunk text, including any overlap prefix.
    pub content: String,

    /// Ancestor labels from the root down to the owning node.
    pub navigation_path: Vec<String>,

    /// Source byte offset of `content`.
    pub start_offset: usize,

    /// Source byte offset just past `content`.
    pub end_offset: usize,

    /// Leading bytes of `content` repeated from the previous chunk.
    #[serde(default)]
    pub overlap_len: usize,

    /// Position among all chunks of the document.
    pub sequence: usize,

    /// Position among the chunks of the owning node.
    pub ordinal: usize,

    /// Rough token count (~4 chars per token).
    pub token_estimate: usize,

    #[serde(default)]
    pub decision_relevant: bool,

    /// External documents cited in this chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_references: Vec<String>,

    /// Filled in by the graph builder.
    #[serde(default)]
    pub relationship_ids: Vec<String>,
}

impl HierarchicalChunk {
    /// Text contributed by this chunk alone, without the overlap prefix.
    pub fn own_text(&self) -> &str {
        self.content.get(self.overlap_len..).unwrap_or("")
    }

    /// Source offset where the chunk's own text starts.
    pub fn own_start(&self) -> usize {
        self.start_offset + self.overlap_len
    }
}

/// Configuration for the chunker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Target chunk size in tokens (soft).
    pub target_tokens: usize,

    /// Sentences longer than this, or than the target size when that is
    /// smaller, are split at clause boundaries unless they carry a decision
    /// clause.
    pub max_sentence_tokens: usize,

    /// Overlap between consecutive chunks of one node, as a fraction of the
    /// target size.
    pub overlap_ratio: f32,

    /// Characters per token used for size estimates.
    pub chars_per_token: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            max_sentence_tokens: 256,
            overlap_ratio: 0.15,
            chars_per_token: 4,
        }
    }
}

/// Chunks produced by one chunking pass.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutput {
    pub chunks: Vec<HierarchicalChunk>,
    /// Set when cancellation stopped chunking between nodes.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Plain,
    Clause,
    Matrix,
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    kind: UnitKind,
}

impl Unit {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Hierarchy-aware chunker.
#[derive(Debug, Clone, Default)]
pub struct SemanticChunker {
    config: ChunkerConfig,
}

impl SemanticChunker {
    /// Create a chunker with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunker with custom configuration.
    pub fn with_config(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk every node of `tree` over `source`.
    ///
    /// `target_size` is a soft token budget; `overlap_ratio` is the fraction
    /// of it repeated between consecutive chunks of an oversized node.
    pub fn chunk(
        &self,
        tree: &NavigationTree,
        source: &str,
        target_size: usize,
        overlap_ratio: f32,
    ) -> Vec<HierarchicalChunk> {
        self.chunk_until(
            tree,
            source,
            target_size,
            overlap_ratio,
            &CancellationToken::new(),
        )
        .chunks
    }

    /// Chunk node by node, stopping between nodes once `cancel` fires.
    pub fn chunk_until(
        &self,
        tree: &NavigationTree,
        source: &str,
        target_size: usize,
        overlap_ratio: f32,
        cancel: &CancellationToken,
    ) -> ChunkOutput {
        let mut output = ChunkOutput::default();
        let chars_per_token = self.config.chars_per_token.max(1);
        let target_chars = target_size.max(1) * chars_per_token;
        let overlap_chars = (target_chars as f32 * overlap_ratio.clamp(0.0, 0.9)) as usize;

        for node in tree.depth_first() {
            if cancel.is_cancelled() {
                output.cancelled = true;
                break;
            }
            let own = node.provenance.own_range();
            if own.is_empty() {
                continue;
            }
            if source.get(own.clone()).is_none() {
                warn!(
                    node_id = %node.id,
                    start = own.start,
                    end = own.end,
                    "Node span does not fit the source text; skipping"
                );
                continue;
            }
            let path = tree.navigation_path(&node.id);
            let mut chunks = self.chunk_node(
                &tree.document_id,
                node,
                source,
                target_chars,
                overlap_chars,
            );
            for chunk in &mut chunks {
                chunk.sequence = output.chunks.len();
                chunk.navigation_path = path.clone();
            }
            output.chunks.append(&mut chunks);
        }

        debug!(
            chunks = output.chunks.len(),
            target_size,
            overlap_ratio,
            cancelled = output.cancelled,
            "Chunked navigation tree"
        );
        output
    }

    fn chunk_node(
        &self,
        document_id: &str,
        node: &NavigationNode,
        source: &str,
        target_chars: usize,
        overlap_chars: usize,
    ) -> Vec<HierarchicalChunk> {
        let span = node.provenance;
        let heading = span.heading_range();
        let body = span.body_range();
        let body_text = source.get(body.clone()).unwrap_or("");
        let body_blank = body_text.trim().is_empty();

        let mut ranges: Vec<(Range<usize>, usize, Option<UnitKind>)> = Vec::new();
        if !heading.is_empty() {
            let end = if body_blank { body.end } else { heading.end };
            ranges.push((heading.start..end, 0, None));
        }

        if !body_blank {
            let max_sentence = (self.config.max_sentence_tokens.max(1)
                * self.config.chars_per_token.max(1))
            .min(target_chars);
            let units = segment(body_text, body.start, max_sentence);
            let groups = pack(&units, target_chars);
            let split = groups.len() > 1;
            let mut previous: Option<Range<usize>> = None;
            for (range, kind) in groups {
                let overlap = match (&previous, split) {
                    (Some(prev), true) => overlap_start(source, prev, overlap_chars)
                        .map_or(0, |cut| range.start - cut),
                    _ => 0,
                };
                previous = Some(range.clone());
                ranges.push((range, overlap, Some(kind)));
            }
        }

        ranges
            .into_iter()
            .enumerate()
            .map(|(ordinal, (range, overlap, kind))| {
                let start = range.start - overlap;
                let content = source[start..range.end].to_string();
                let own = &source[range.clone()];
                let chunk_type = match kind {
                    None => ChunkType::Header,
                    Some(UnitKind::Matrix) => ChunkType::Matrix,
                    Some(_) => classify(own, node),
                };
                let decision_relevant = chunk_type == ChunkType::Decision
                    || (node.requires_complete_tree && chunk_type == ChunkType::Matrix);
                HierarchicalChunk {
                    id: ids::derive_id(
                        document_id,
                        "chunk",
                        &format!("{}/{ordinal}", node.id),
                    ),
                    node_id: node.id.clone(),
                    chunk_type,
                    token_estimate: content.len().div_ceil(self.config.chars_per_token.max(1)),
                    content,
                    navigation_path: Vec::new(),
                    start_offset: start,
                    end_offset: range.end,
                    overlap_len: overlap,
                    sequence: 0,
                    ordinal,
                    decision_relevant,
                    external_references: patterns::external_documents(own),
                    relationship_ids: Vec::new(),
                }
            })
            .collect()
    }
}

/// Whether text states an evaluative clause: a requirement, a numeric
/// threshold, or a conditional with an outcome.
pub fn is_decision_clause(text: &str) -> bool {
    patterns::has_requirement(text)
        || !patterns::comparisons(text).is_empty()
        || (patterns::has_conditional(text) && patterns::find_outcome(text).is_some())
}

/// Classify a non-header chunk by keyword and structural cues.
pub fn classify(text: &str, node: &NavigationNode) -> ChunkType {
    if patterns::is_matrix_block(text) {
        return ChunkType::Matrix;
    }
    let clause = is_decision_clause(text);
    let criterion = patterns::has_requirement(text) || !patterns::comparisons(text).is_empty();
    if clause && (node.requires_complete_tree || (criterion && patterns::find_outcome(text).is_some()))
    {
        return ChunkType::Decision;
    }
    if patterns::is_summary_text(text) || (!clause && patterns::is_summary_title(&node.title)) {
        return ChunkType::Summary;
    }
    let pointer = patterns::cross_references(text).iter().any(|r| r.explicit)
        || !patterns::external_documents(text).is_empty();
    if pointer && text.trim().len() <= 320 {
        return ChunkType::Reference;
    }
    ChunkType::Content
}

/// Paragraph spans covering `text`; blank lines stay with the paragraph
/// they follow.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut seen_blank = false;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            seen_blank = true;
        } else {
            if seen_blank && offset > start {
                spans.push((start, offset));
                start = offset;
            }
            seen_blank = false;
        }
        offset += line.len();
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Cut a node body into indivisible units with absolute offsets.
fn segment(body: &str, base: usize, max_sentence_chars: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    for (ps, pe) in paragraph_spans(body) {
        let paragraph = &body[ps..pe];
        if patterns::is_matrix_block(paragraph) {
            units.push(Unit {
                start: base + ps,
                end: base + pe,
                kind: UnitKind::Matrix,
            });
            continue;
        }
        for (ss, se) in patterns::sentence_spans(paragraph) {
            let sentence = &paragraph[ss..se];
            let offset = base + ps + ss;
            if is_decision_clause(sentence) {
                units.push(Unit {
                    start: offset,
                    end: offset + sentence.len(),
                    kind: UnitKind::Clause,
                });
            } else {
                for (cs, ce) in patterns::clause_spans(sentence, max_sentence_chars) {
                    units.push(Unit {
                        start: offset + cs,
                        end: offset + ce,
                        kind: UnitKind::Plain,
                    });
                }
            }
        }
    }

    // Whitespace-only units join the unit that follows them.
    let mut merged: Vec<Unit> = Vec::with_capacity(units.len());
    let mut carry: Option<usize> = None;
    for mut unit in units {
        let blank = body[unit.start - base..unit.end - base].trim().is_empty();
        if blank && unit.kind != UnitKind::Matrix {
            carry.get_or_insert(unit.start);
            continue;
        }
        if let Some(start) = carry.take() {
            unit.start = start;
        }
        merged.push(unit);
    }
    if let Some(start) = carry {
        match merged.last_mut() {
            Some(last) => last.end = base + body.len(),
            None => merged.push(Unit {
                start,
                end: base + body.len(),
                kind: UnitKind::Plain,
            }),
        }
    }
    merged
}

/// Greedily pack units into chunk ranges of about `target_chars`.
fn pack(units: &[Unit], target_chars: usize) -> Vec<(Range<usize>, UnitKind)> {
    let mut groups: Vec<(Range<usize>, UnitKind)> = Vec::new();
    let mut current: Option<(Range<usize>, UnitKind)> = None;

    for unit in units {
        if unit.kind == UnitKind::Matrix {
            groups.extend(current.take());
            groups.push((unit.start..unit.end, UnitKind::Matrix));
            continue;
        }
        current = match current.take() {
            None => Some((unit.start..unit.end, unit.kind)),
            Some((range, kind)) if range.len() + unit.len() <= target_chars => {
                let kind = if unit.kind == UnitKind::Clause {
                    UnitKind::Clause
                } else {
                    kind
                };
                Some((range.start..unit.end, kind))
            }
            Some(done) => {
                groups.push(done);
                Some((unit.start..unit.end, unit.kind))
            }
        };
    }
    groups.extend(current);
    groups
}

/// Start of the overlap taken from the end of `previous`, snapped forward to
/// a word boundary. `None` when no overlap fits.
fn overlap_start(source: &str, previous: &Range<usize>, overlap_chars: usize) -> Option<usize> {
    if overlap_chars == 0 || previous.len() < 2 {
        return None;
    }
    let mut cut = previous.end - overlap_chars.min(previous.len() - 1);
    while cut < previous.end && !source.is_char_boundary(cut) {
        cut += 1;
    }
    let tail = source.get(cut..previous.end)?;
    // Skip the partial word at the cut, then the whitespace after it.
    let word_end = tail.find(char::is_whitespace)?;
    let rest = &tail[word_end..];
    let skipped = rest.len() - rest.trim_start().len();
    let cut = cut + word_end + skipped;
    (cut < previous.end).then_some(cut)
}

/// First relationship pass: `SEQUENTIAL` edges between consecutive chunks of
/// a node and `PARENT_CHILD` edges from the nearest chunked ancestor's
/// terminal chunk to each of the node's chunks.
pub fn seed_relationships(
    chunks: &[HierarchicalChunk],
    tree: &NavigationTree,
) -> Vec<RelationshipCandidate> {
    let mut by_node: HashMap<&str, Vec<&HierarchicalChunk>> = HashMap::new();
    for chunk in chunks {
        by_node.entry(chunk.node_id.as_str()).or_default().push(chunk);
    }
    for list in by_node.values_mut() {
        list.sort_by_key(|c| c.ordinal);
    }

    let mut candidates = Vec::new();
    for node in tree.depth_first() {
        let Some(own) = by_node.get(node.id.as_str()) else {
            continue;
        };
        for pair in own.windows(2) {
            candidates.push(RelationshipCandidate::new(
                &pair[0].id,
                &pair[1].id,
                RelationshipType::Sequential,
                DetectionMethod::Structural,
                format!("{} #{} -> #{}", node.label(), pair[0].ordinal, pair[1].ordinal),
                1.0,
            ));
        }

        let ancestry = tree.ancestry(&node.id);
        let parent_terminal = ancestry
            .iter()
            .rev()
            .skip(1)
            .find_map(|a| by_node.get(a.id.as_str()).and_then(|c| c.last()));
        if let Some(parent) = parent_terminal {
            for chunk in own {
                candidates.push(RelationshipCandidate::new(
                    &parent.id,
                    &chunk.id,
                    RelationshipType::ParentChild,
                    DetectionMethod::Structural,
                    node.label(),
                    1.0,
                ));
            }
        }
    }
    candidates
}

/// Summary statistics over a chunk list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub chunk_count: usize,
    pub by_type: BTreeMap<String, usize>,
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub overlap_bytes: usize,
    pub decision_relevant: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[HierarchicalChunk]) -> Self {
        let mut stats = Self {
            chunk_count: chunks.len(),
            ..Default::default()
        };
        for chunk in chunks {
            *stats
                .by_type
                .entry(chunk.chunk_type.as_str().to_string())
                .or_default() += 1;
            stats.total_tokens += chunk.token_estimate;
            stats.max_tokens = stats.max_tokens.max(chunk.token_estimate);
            stats.overlap_bytes += chunk.overlap_len;
            if chunk.decision_relevant {
                stats.decision_relevant += 1;
            }
        }
        stats
    }
}

impl std::fmt::Display for ChunkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Chunks: {}", self.chunk_count)?;
        for (kind, count) in &self.by_type {
            writeln!(f, "  {kind}: {count}")?;
        }
        writeln!(f, "  Decision-relevant: {}", self.decision_relevant)?;
        write!(
            f,
            "  Tokens: {} total, {} max",
            self.total_tokens, self.max_tokens
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::NavigationExtractor;
    use crate::patterns::DocumentFormat;
    use pretty_assertions::assert_eq;

    const POLICY: &str = "Lending Policy\n\
\n\
Chapter 1: Eligibility\n\
This chapter sets out who may apply.\n\
\n\
1.1 Age Requirements\n\
The borrower must be at least 18 years old. Applicants younger than 18 are declined.\n\
\n\
1.2 Documentation\n\
See Section 1.1 for age limits.\n\
\n\
Chapter 2: Collateral\n\
Acceptable property types are listed below.\n\
\n\
Property   | Max LTV | Min Score\n\
Single     | 95%     | 620\n\
Condo      | 90%     | 660\n";

    fn tree(text: &str) -> NavigationTree {
        NavigationExtractor::default().extract(text, DocumentFormat::StructuredText)
    }

    fn chunks_of<'a>(chunks: &'a [HierarchicalChunk], node_id: &str) -> Vec<&'a HierarchicalChunk> {
        chunks.iter().filter(|c| c.node_id == node_id).collect()
    }

    #[test]
    fn test_header_and_content_chunks_carry_path() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.15);
        let age = tree.find_by_numbering("1.1").unwrap();
        let own = chunks_of(&chunks, &age.id);

        assert_eq!(own[0].chunk_type, ChunkType::Header);
        assert_eq!(own[0].content, "1.1 Age Requirements\n");
        assert_eq!(own[1].chunk_type, ChunkType::Decision);
        assert!(own[1].decision_relevant);
        assert_eq!(
            own[1].navigation_path,
            vec![
                "Lending Policy".to_string(),
                "1 Eligibility".to_string(),
                "1.1 Age Requirements".to_string()
            ]
        );
    }

    #[test]
    fn test_reference_and_matrix_types() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.15);
        let docs = tree.find_by_numbering("1.2").unwrap();
        assert_eq!(chunks_of(&chunks, &docs.id)[1].chunk_type, ChunkType::Reference);
        assert!(chunks.iter().any(|c| c.chunk_type == ChunkType::Matrix));
    }

    #[test]
    fn test_own_text_round_trips_every_node() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 8, 0.5);
        for node in tree.nodes_in_order() {
            let own = chunks_of(&chunks, &node.id);
            if own.is_empty() {
                continue;
            }
            let rebuilt: String = own.iter().map(|c| c.own_text()).collect();
            assert_eq!(rebuilt, &POLICY[node.provenance.own_range()]);
        }
    }

    #[test]
    fn test_overlap_repeats_end_of_previous_chunk() {
        let body = "Income must be stable. ".repeat(3)
            + &"Employment is verified by phone with the employer of record. ".repeat(12);
        let text = format!("Chapter 1: Income\n{body}");
        let tree = tree(&text);
        let chunks = SemanticChunker::new().chunk(&tree, &text, 40, 0.25);
        let node = tree.find_by_numbering("1").unwrap();
        let own = chunks_of(&chunks, &node.id);
        assert!(own.len() > 3);

        let with_overlap: Vec<_> = own.iter().filter(|c| c.overlap_len > 0).collect();
        assert!(!with_overlap.is_empty());
        for chunk in with_overlap {
            let previous = own[chunk.ordinal - 1];
            let prefix = &chunk.content[..chunk.overlap_len];
            assert!(previous.own_text().ends_with(prefix));
            assert!(!prefix.starts_with(char::is_whitespace));
        }
    }

    #[test]
    fn test_short_node_has_no_overlap() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.5);
        assert!(chunks.iter().all(|c| c.overlap_len == 0));
    }

    #[test]
    fn test_decision_clause_is_never_split() {
        let clause = "If the borrower has a credit score of at least 620 and has been employed \
with the same employer for two years and has verified reserves covering six months of \
payments and has no bankruptcy in the last four years, the loan is approved.";
        let text = format!("2.1 Credit Approval\n{clause}\n");
        let tree = tree(&text);
        let chunks = SemanticChunker::new().chunk(&tree, &text, 10, 0.0);
        let node = tree.find_by_numbering("2.1").unwrap();
        let own = chunks_of(&chunks, &node.id);
        assert_eq!(own.len(), 2);
        assert!(own[1].content.contains("at least 620"));
        assert!(own[1].content.contains("approved"));
        assert!(own[1].token_estimate > 10);
    }

    #[test]
    fn test_long_plain_sentence_is_split_within_the_cap() {
        let sentence = format!(
            "The lender reviews the file {}then records the result, and closes it.",
            "carefully ".repeat(130)
        );
        let text = format!("1.1 Scope\n{sentence}\n");
        let tree = tree(&text);
        let node = tree.find_by_numbering("1.1").unwrap();
        let chunker = SemanticChunker::new();
        let cap = chunker.config().max_sentence_tokens * chunker.config().chars_per_token;

        let chunks = chunker.chunk(&tree, &text, chunker.config().max_sentence_tokens, 0.0);
        let own = chunks_of(&chunks, &node.id);
        assert!(own.len() > 2);
        let rebuilt: String = own.iter().map(|c| c.own_text()).collect();
        assert_eq!(rebuilt, &text[node.provenance.own_range()]);
        for chunk in &own[1..] {
            assert_eq!(chunk.chunk_type, ChunkType::Content);
            assert!(chunk.own_text().trim().len() <= cap);
        }
    }

    #[test]
    fn test_sentence_split_follows_small_target() {
        let sentence = format!("Reserves are verified {}for every borrower.", "monthly ".repeat(90));
        let text = format!("1.1 Reserves\n{sentence}\n");
        let tree = tree(&text);
        let node = tree.find_by_numbering("1.1").unwrap();
        let chunker = SemanticChunker::new();
        let target = 64;
        let target_chars = target * chunker.config().chars_per_token;

        let chunks = chunker.chunk(&tree, &text, target, 0.0);
        let own = chunks_of(&chunks, &node.id);
        assert!(own.len() > 3);
        assert!(
            own[1..]
                .iter()
                .all(|c| c.own_text().trim().len() <= target_chars)
        );
    }

    #[test]
    fn test_seed_relationships() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.15);
        let seeds = seed_relationships(&chunks, &tree);

        let age = tree.find_by_numbering("1.1").unwrap();
        let chapter = tree.find_by_numbering("1").unwrap();
        let docs = tree.find_by_numbering("1.2").unwrap();
        let age_chunks = chunks_of(&chunks, &age.id);
        let chapter_last = chunks_of(&chunks, &chapter.id).last().copied().unwrap();

        assert!(seeds.iter().any(|s| s.relationship_type == RelationshipType::Sequential
            && s.source_id == age_chunks[0].id
            && s.target_id == age_chunks[1].id));
        let parent_edges: Vec<_> = seeds
            .iter()
            .filter(|s| {
                s.relationship_type == RelationshipType::ParentChild
                    && s.source_id == chapter_last.id
            })
            .collect();
        assert_eq!(
            parent_edges.len(),
            age_chunks.len() + chunks_of(&chunks, &docs.id).len()
        );
    }

    #[test]
    fn test_ids_are_stable_and_sequence_is_dense() {
        let tree = tree(POLICY);
        let a = SemanticChunker::new().chunk(&tree, POLICY, 64, 0.1);
        let b = SemanticChunker::new().chunk(&tree, POLICY, 64, 0.1);
        assert_eq!(a, b);
        for (i, chunk) in a.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
        }
    }

    #[test]
    fn test_cancelled_chunking_stops_between_nodes() {
        let tree = tree(POLICY);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = SemanticChunker::new().chunk_until(&tree, POLICY, 64, 0.1, &cancel);
        assert!(output.cancelled);
        assert!(output.chunks.is_empty());
    }

    #[test]
    fn test_stats_display() {
        let tree = tree(POLICY);
        let chunks = SemanticChunker::new().chunk(&tree, POLICY, 512, 0.15);
        let stats = ChunkStats::from_chunks(&chunks);
        assert_eq!(stats.chunk_count, chunks.len());
        assert!(stats.to_string().contains("HEADER"));
    }
}
