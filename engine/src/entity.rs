//! Domain entity extraction.
//!
//! Entities are read from chunk text (without overlap) and tagged with the
//! chunk and navigation node they came from. Numeric entities are checked
//! against declared ranges; an out-of-range value is kept with low
//! confidence and a note instead of being dropped.

use std::ops::Range;

use once_cell::sync::Lazy;
use policy_nav_inference::{GuardedClassifier, TaskKind};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assist::AssistSession;
use crate::chunker::{ChunkType, HierarchicalChunk};
use crate::ids;
use crate::issue::Issue;
use crate::navigation::NavigationTree;
use crate::patterns::{self, ComparisonOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Threshold,
    Range,
    Percentage,
    MonetaryAmount,
    Duration,
    RequirementType,
    CategoricalValue,
    DocumentReference,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "THRESHOLD",
            Self::Range => "RANGE",
            Self::Percentage => "PERCENTAGE",
            Self::MonetaryAmount => "MONETARY_AMOUNT",
            Self::Duration => "DURATION",
            Self::RequirementType => "REQUIREMENT_TYPE",
            Self::CategoricalValue => "CATEGORICAL_VALUE",
            Self::DocumentReference => "DOCUMENT_REFERENCE",
        }
    }

    /// Overlap resolution order: ranges, then thresholds, then the rest.
    fn priority(self) -> u8 {
        match self {
            Self::Range => 0,
            Self::Threshold => 1,
            _ => 2,
        }
    }
}

/// A domain entity with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    /// Matched source text.
    pub text: String,
    /// Canonical form ("credit score >= 620", "occupancy=second home").
    pub normalized: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<ComparisonOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Upper bound of a range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub confidence: f32,
    pub low_confidence: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_note: Option<String>,
    pub chunk_id: String,
    pub node_id: String,
    pub navigation_path: Vec<String>,
    /// Byte offsets into the source document.
    pub start: usize,
    pub end: usize,
}

/// Configuration for entity extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityExtractorConfig {
    /// Check numeric values against declared ranges.
    pub validate_ranges: bool,

    /// Confidence assigned to values failing range validation.
    pub out_of_range_confidence: f32,

    /// Entities below this confidence are flagged low-confidence.
    pub low_confidence_threshold: f32,

    /// Upper bound on inference calls per document.
    pub max_inference_calls: usize,
}

impl Default for EntityExtractorConfig {
    fn default() -> Self {
        Self {
            validate_ranges: true,
            out_of_range_confidence: 0.3,
            low_confidence_threshold: 0.5,
            max_inference_calls: 16,
        }
    }
}

/// Output of entity extraction over one document.
#[derive(Debug, Clone, Default)]
pub struct EntityExtraction {
    pub entities: Vec<Entity>,
    pub issues: Vec<Issue>,
    pub cancelled: bool,
}

/// Declared value ranges per subject.
const DECLARED_RANGES: [(&str, f64, f64); 7] = [
    ("credit score", 300.0, 850.0),
    ("ltv", 0.0, 125.0),
    ("cltv", 0.0, 125.0),
    ("dti", 0.0, 100.0),
    ("age", 0.0, 120.0),
    ("reserves", 0.0, 120.0),
    ("units", 1.0, 4.0),
];

const REQUIREMENT_TYPES: [(&str, &str); 14] = [
    ("w-2", "w2"),
    ("w2", "w2"),
    ("tax returns", "tax returns"),
    ("pay stubs", "pay stubs"),
    ("paystubs", "pay stubs"),
    ("bank statements", "bank statements"),
    ("appraisal", "appraisal"),
    ("verification of employment", "verification of employment"),
    ("credit report", "credit report"),
    ("mortgage insurance", "mortgage insurance"),
    ("flood insurance", "flood insurance"),
    ("title insurance", "title insurance"),
    ("gift letter", "gift letter"),
    ("photo identification", "photo identification"),
];

const CATEGORIES: [(&str, &str, &str); 17] = [
    ("primary residence", "occupancy", "primary residence"),
    ("owner-occupied", "occupancy", "primary residence"),
    ("second home", "occupancy", "second home"),
    ("investment property", "occupancy", "investment property"),
    ("single-family", "property type", "single-family"),
    ("condominium", "property type", "condominium"),
    ("condo", "property type", "condominium"),
    ("manufactured home", "property type", "manufactured home"),
    ("purchase", "loan purpose", "purchase"),
    ("cash-out refinance", "loan purpose", "cash-out refinance"),
    ("rate/term refinance", "loan purpose", "rate/term refinance"),
    ("self-employed", "borrower type", "self-employed"),
    ("first-time homebuyer", "borrower type", "first-time homebuyer"),
    ("fha", "program", "fha"),
    ("va", "program", "va"),
    ("usda", "program", "usda"),
    ("jumbo", "program", "jumbo"),
];

const SUBJECT_LABELS: [&str; 9] = [
    "credit score",
    "ltv",
    "dti",
    "age",
    "reserves",
    "loan amount",
    "income",
    "down payment",
    "other",
];

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    patterns::compile(
        r"(?i)\b(?:between\s+\$?(\d[\d,]*(?:\.\d+)?)\s*(%|percent)?\s+and\s+\$?(\d[\d,]*(?:\.\d+)?)|\$?(\d[\d,]*(?:\.\d+)?)\s*(%)?\s*(?:-|–|to)\s*\$?(\d[\d,]*(?:\.\d+)?))\s*(%|percent\b|years?\b|months?\b|days?\b|points?\b)?",
    )
});

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| patterns::compile(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*(?:%|percent\b)"));

static MONEY_RE: Lazy<Regex> = Lazy::new(|| {
    patterns::compile(
        r"(?i)\$\s?(\d[\d,]*(?:\.\d+)?)(?:\s*(k|m|million|thousand)\b)?|\b(\d[\d,]*(?:\.\d+)?)\s+dollars\b",
    )
});

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| patterns::compile(r"(?i)\b(\d{1,3})\s*(years?|months?|days?)\b"));

/// A candidate before overlap resolution, offsets local to the chunk text.
#[derive(Debug, Clone)]
struct Found {
    entity_type: EntityType,
    span: Range<usize>,
    normalized: String,
    operator: Option<ComparisonOp>,
    value: Option<f64>,
    upper: Option<f64>,
    unit: Option<String>,
    subject: Option<String>,
    confidence: f32,
}

impl Found {
    fn new(entity_type: EntityType, span: Range<usize>, normalized: String, confidence: f32) -> Self {
        Self {
            entity_type,
            span,
            normalized,
            operator: None,
            value: None,
            upper: None,
            unit: None,
            subject: None,
            confidence,
        }
    }

    fn overlaps(&self, other: &Range<usize>) -> bool {
        self.span.start < other.end && other.start < self.span.end
    }
}

/// Extracts domain entities from chunks.
#[derive(Clone, Default)]
pub struct EntityExtractor {
    config: EntityExtractorConfig,
    classifier: Option<GuardedClassifier>,
    min_inference_confidence: f32,
}

impl EntityExtractor {
    pub fn new(config: EntityExtractorConfig) -> Self {
        Self {
            config,
            classifier: None,
            min_inference_confidence: 0.6,
        }
    }

    /// Enable inference-assisted typing of thresholds with no subject.
    pub fn with_classifier(mut self, classifier: GuardedClassifier, min_confidence: f32) -> Self {
        self.classifier = Some(classifier);
        self.min_inference_confidence = min_confidence;
        self
    }

    pub fn config(&self) -> &EntityExtractorConfig {
        &self.config
    }

    /// Pattern-only extraction.
    pub fn extract(&self, tree: &NavigationTree, chunks: &[HierarchicalChunk]) -> Vec<Entity> {
        let entities: Vec<Entity> = chunks
            .iter()
            .flat_map(|chunk| self.extract_chunk(tree, chunk))
            .collect();
        info!(entities = entities.len(), "Extracted entities");
        entities
    }

    /// Extraction with inference assistance and cooperative cancellation.
    pub async fn extract_assisted(
        &self,
        tree: &NavigationTree,
        chunks: &[HierarchicalChunk],
        cancel: &CancellationToken,
    ) -> EntityExtraction {
        let mut output = EntityExtraction::default();
        let mut session = AssistSession::new(
            self.classifier.as_ref(),
            self.min_inference_confidence,
            self.config.max_inference_calls,
        );

        for chunk in chunks {
            if cancel.is_cancelled() {
                output.cancelled = true;
                break;
            }
            let mut entities = self.extract_chunk(tree, chunk);
            for entity in entities
                .iter_mut()
                .filter(|e| e.entity_type == EntityType::Threshold && e.subject.is_none())
            {
                if !session.is_active() {
                    break;
                }
                let context = chunk.own_text();
                let answer = session
                    .ask(context, TaskKind::EntityTyping, &SUBJECT_LABELS, &entity.id)
                    .await;
                let Some(answer) = answer else { continue };
                let label = answer.label.trim().to_lowercase();
                if label == "other" {
                    continue;
                }
                if !SUBJECT_LABELS.contains(&label.as_str()) {
                    session.reject(format!("unknown entity subject '{label}'"), &entity.id);
                    continue;
                }
                entity.normalized = format!("{label} {}", entity.normalized);
                entity.subject = Some(label);
                entity.confidence = entity.confidence.min(answer.confidence);
                self.check_range(entity);
            }
            output.entities.append(&mut entities);
        }

        output.issues.append(&mut session.issues);
        info!(
            entities = output.entities.len(),
            inference_calls = session.calls(),
            cancelled = output.cancelled,
            "Extracted entities"
        );
        output
    }

    fn extract_chunk(&self, tree: &NavigationTree, chunk: &HierarchicalChunk) -> Vec<Entity> {
        if chunk.chunk_type == ChunkType::Header {
            return Vec::new();
        }
        let text = chunk.own_text();
        let mut found = Vec::new();
        found.extend(ranges(text));
        found.extend(thresholds(text));
        found.extend(percentages(text));
        found.extend(money(text));
        found.extend(durations(text));
        found.extend(vocabulary(text));
        found.extend(references(text));

        for f in &mut found {
            f.span = trim_span(text, f.span.clone());
        }

        // Higher-priority tiers claim their spans first.
        found.sort_by_key(|f| (f.entity_type.priority(), f.span.start));
        let mut kept: Vec<Found> = Vec::new();
        for candidate in found {
            if kept.iter().any(|k| k.overlaps(&candidate.span)) {
                continue;
            }
            kept.push(candidate);
        }
        kept.sort_by_key(|f| f.span.start);

        let base = chunk.own_start();
        let path = if chunk.navigation_path.is_empty() {
            tree.navigation_path(&chunk.node_id)
        } else {
            chunk.navigation_path.clone()
        };
        let entities: Vec<Entity> = kept
            .into_iter()
            .map(|f| {
                let mut entity = Entity {
                    id: ids::derive_id(
                        &tree.document_id,
                        "entity",
                        &format!("{}/{}/{}", chunk.id, f.span.start, f.entity_type.as_str()),
                    ),
                    entity_type: f.entity_type,
                    text: text[f.span.clone()].trim().to_string(),
                    normalized: f.normalized,
                    operator: f.operator,
                    value: f.value,
                    upper: f.upper,
                    unit: f.unit,
                    subject: f.subject,
                    confidence: f.confidence,
                    low_confidence: false,
                    validation_note: None,
                    chunk_id: chunk.id.clone(),
                    node_id: chunk.node_id.clone(),
                    navigation_path: path.clone(),
                    start: base + f.span.start,
                    end: base + f.span.end,
                };
                self.check_range(&mut entity);
                entity
            })
            .collect();

        if !entities.is_empty() {
            debug!(chunk_id = %chunk.id, entities = entities.len(), "Entities in chunk");
        }
        entities
    }

    /// Validate a numeric entity against its declared range and set the
    /// low-confidence flag.
    fn check_range(&self, entity: &mut Entity) {
        if self.config.validate_ranges {
            if let Some(note) = range_violation(entity) {
                entity.confidence = entity.confidence.min(self.config.out_of_range_confidence);
                entity.validation_note = Some(note);
            }
        }
        entity.low_confidence = entity.confidence < self.config.low_confidence_threshold;
    }
}

fn trim_span(text: &str, span: Range<usize>) -> Range<usize> {
    let slice = &text[span.clone()];
    let start = span.start + (slice.len() - slice.trim_start().len());
    let end = span.end - (slice.len() - slice.trim_end().len());
    start..end.max(start)
}

/// The sentence of `text` containing byte `pos`, with its start offset.
fn sentence_at(text: &str, pos: usize) -> (&str, usize) {
    patterns::sentence_spans(text)
        .into_iter()
        .find(|(start, end)| (*start..*end).contains(&pos))
        .map_or((text, 0), |(start, end)| (&text[start..end], start))
}

/// Vocabulary subject of the sentence containing `pos`.
fn subject_near(text: &str, pos: usize) -> Option<&'static str> {
    let (sentence, offset) = sentence_at(text, pos);
    patterns::domain_subject(sentence, pos - offset)
}

fn range_violation(entity: &Entity) -> Option<String> {
    let declared = match (&entity.subject, entity.entity_type) {
        (Some(subject), _) => DECLARED_RANGES
            .iter()
            .find(|(s, _, _)| *s == subject.as_str())
            .map(|(s, lo, hi)| (*s, *lo, *hi)),
        (None, EntityType::Percentage) => Some(("percentage", 0.0, 100.0)),
        _ => None,
    }?;
    let (name, lo, hi) = declared;
    let values = [entity.value, entity.upper];
    let bad = values.into_iter().flatten().find(|v| *v < lo || *v > hi)?;
    Some(format!(
        "value {bad} outside declared range {lo}-{hi} for {name}"
    ))
}

fn unit_suffix(unit: Option<&str>) -> String {
    match unit {
        Some("%") => "%".to_string(),
        Some(u) => format!(" {u}"),
        None => String::new(),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn normalize_unit(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "%" | "percent" => "%".to_string(),
        "year" | "years" => "years".to_string(),
        "month" | "months" => "months".to_string(),
        "day" | "days" => "days".to_string(),
        "point" | "points" => "points".to_string(),
        other => other.to_string(),
    }
}

fn ranges(text: &str) -> Vec<Found> {
    RANGE_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let (low, high, inner_unit) = match (cap.get(1), cap.get(3)) {
                (Some(low), Some(high)) => (low, high, cap.get(2)),
                _ => (cap.get(4)?, cap.get(6)?, cap.get(5)),
            };
            let low_value = patterns::parse_number(low.as_str())?;
            let high_value = patterns::parse_number(high.as_str())?;
            if high_value <= low_value {
                return None;
            }
            let unit = cap
                .get(7)
                .or(inner_unit)
                .map(|m| normalize_unit(m.as_str()));
            let subject = subject_near(text, whole.start());
            let suffix = unit_suffix(unit.as_deref());
            let normalized = match subject {
                Some(s) => format!(
                    "{s} in [{}, {}]{suffix}",
                    format_number(low_value),
                    format_number(high_value)
                ),
                None => format!(
                    "[{}, {}]{suffix}",
                    format_number(low_value),
                    format_number(high_value)
                ),
            };
            let mut found = Found::new(EntityType::Range, whole.range(), normalized, 0.85);
            found.value = Some(low_value);
            found.upper = Some(high_value);
            found.unit = unit;
            found.subject = subject.map(str::to_string);
            Some(found)
        })
        .collect()
}

fn thresholds(text: &str) -> Vec<Found> {
    patterns::comparisons(text)
        .into_iter()
        .map(|c| {
            let subject = subject_near(text, c.start);
            let value = format!(
                "{} {}{}",
                c.operator.symbol(),
                format_number(c.value),
                unit_suffix(c.unit.as_deref())
            );
            let normalized = match subject {
                Some(s) => format!("{s} {value}"),
                None => value,
            };
            let confidence = if subject.is_some() { 0.9 } else { 0.7 };
            let mut found = Found::new(EntityType::Threshold, c.start..c.end, normalized, confidence);
            found.operator = Some(c.operator);
            found.value = Some(c.value);
            found.unit = c.unit;
            found.subject = subject.map(str::to_string);
            found
        })
        .collect()
}

fn percentages(text: &str) -> Vec<Found> {
    PERCENT_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let value = patterns::parse_number(cap.get(1)?.as_str())?;
            let mut found = Found::new(
                EntityType::Percentage,
                whole.range(),
                format!("{}%", format_number(value)),
                0.8,
            );
            found.value = Some(value);
            found.unit = Some("%".to_string());
            Some(found)
        })
        .collect()
}

fn money(text: &str) -> Vec<Found> {
    MONEY_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let raw = cap.get(1).or(cap.get(3))?;
            let scale = match cap.get(2).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
                Some("k" | "thousand") => 1_000.0,
                Some("m" | "million") => 1_000_000.0,
                _ => 1.0,
            };
            let value = patterns::parse_number(raw.as_str())? * scale;
            let mut found = Found::new(
                EntityType::MonetaryAmount,
                whole.range(),
                format!("${}", format_number(value)),
                0.85,
            );
            found.value = Some(value);
            found.unit = Some("USD".to_string());
            Some(found)
        })
        .collect()
}

fn durations(text: &str) -> Vec<Found> {
    DURATION_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let value = patterns::parse_number(cap.get(1)?.as_str())?;
            let unit = normalize_unit(cap.get(2)?.as_str());
            let mut found = Found::new(
                EntityType::Duration,
                whole.range(),
                format!("{} {unit}", format_number(value)),
                0.75,
            );
            found.value = Some(value);
            found.unit = Some(unit);
            Some(found)
        })
        .collect()
}

fn vocabulary(text: &str) -> Vec<Found> {
    let lower = text.to_ascii_lowercase();
    let mut found = Vec::new();
    for (needle, canonical) in REQUIREMENT_TYPES {
        for (pos, _) in lower.match_indices(needle) {
            if patterns::word_bounded(&lower, pos, needle.len()) {
                found.push(Found::new(
                    EntityType::RequirementType,
                    pos..pos + needle.len(),
                    canonical.to_string(),
                    0.8,
                ));
            }
        }
    }
    for (needle, category, value) in CATEGORIES {
        for (pos, _) in lower.match_indices(needle) {
            if !patterns::word_bounded(&lower, pos, needle.len()) {
                continue;
            }
            // Short program codes only count when written in capitals.
            if needle.len() <= 4 && !text[pos..pos + needle.len()].chars().all(|c| c.is_ascii_uppercase()) {
                continue;
            }
            let mut entity = Found::new(
                EntityType::CategoricalValue,
                pos..pos + needle.len(),
                format!("{category}={value}"),
                0.75,
            );
            entity.subject = Some(category.to_string());
            found.push(entity);
        }
    }
    found
}

fn references(text: &str) -> Vec<Found> {
    let mut found: Vec<Found> = patterns::cross_references(text)
        .into_iter()
        .map(|r| {
            let confidence = if r.explicit { 0.9 } else { 0.6 };
            let matched = text[r.start..].find(&r.matched).map_or(r.start, |i| r.start + i);
            Found::new(
                EntityType::DocumentReference,
                matched..matched + r.matched.len(),
                format!("{} {}", r.target_kind, r.numbering),
                confidence,
            )
        })
        .collect();
    for name in patterns::external_documents(text) {
        if let Some(pos) = text.find(&name) {
            found.push(Found::new(
                EntityType::DocumentReference,
                pos..pos + name.len(),
                format!("external:{}", name.to_lowercase()),
                0.8,
            ));
        }
    }
    found
}

/// Entities whose value is a threshold on `subject` with operator `op`.
pub fn thresholds_on<'a>(
    entities: &'a [Entity],
    subject: &'a str,
    op: ComparisonOp,
) -> impl Iterator<Item = &'a Entity> {
    entities.iter().filter(move |e| {
        e.entity_type == EntityType::Threshold
            && e.subject.as_deref() == Some(subject)
            && e.operator == Some(op)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::fakes;
    use crate::chunker::SemanticChunker;
    use crate::extractor::NavigationExtractor;
    use crate::patterns::DocumentFormat;
    use pretty_assertions::assert_eq;

    const POLICY: &str = "Chapter 1: Eligibility\n\
1.1 Credit Requirements\n\
The credit score must be at least 620. A credit score between 620 and 850 is accepted. \
The DTI must not exceed 45%. The loan amount may be up to $750,000. \
Provide two years of tax returns and recent bank statements. \
Second home and investment property transactions follow Section 2.1.\n";

    fn entities(text: &str) -> Vec<Entity> {
        let tree = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&tree, text, 512, 0.1);
        EntityExtractor::default().extract(&tree, &chunks)
    }

    fn normalized(entities: &[Entity], kind: EntityType) -> Vec<String> {
        entities
            .iter()
            .filter(|e| e.entity_type == kind)
            .map(|e| e.normalized.clone())
            .collect()
    }

    #[test]
    fn test_numeric_entities() {
        let found = entities(POLICY);
        assert_eq!(
            normalized(&found, EntityType::Threshold),
            vec!["credit score >= 620", "dti <= 45%", "loan amount <= 750000"]
        );
        assert_eq!(
            normalized(&found, EntityType::Range),
            vec!["credit score in [620, 850]"]
        );
        assert!(normalized(&found, EntityType::Duration).is_empty());
        assert!(normalized(&found, EntityType::MonetaryAmount).is_empty());
        assert!(found.iter().all(|e| !e.low_confidence));
    }

    #[test]
    fn test_vocabulary_and_references() {
        let found = entities(POLICY);
        assert_eq!(
            normalized(&found, EntityType::RequirementType),
            vec!["tax returns", "bank statements"]
        );
        assert_eq!(
            normalized(&found, EntityType::CategoricalValue),
            vec!["occupancy=second home", "occupancy=investment property"]
        );
        assert_eq!(
            normalized(&found, EntityType::DocumentReference),
            vec!["section 2.1"]
        );
    }

    #[test]
    fn test_provenance() {
        let found = entities(POLICY);
        let dti = found
            .iter()
            .find(|e| e.subject.as_deref() == Some("dti"))
            .unwrap();
        assert_eq!(&POLICY[dti.start..dti.end], dti.text);
        assert_eq!(dti.navigation_path.last().unwrap(), "1.1 Credit Requirements");
        assert_eq!(thresholds_on(&found, "dti", ComparisonOp::Lte).count(), 1);
    }

    #[test]
    fn test_out_of_range_value_is_kept_low_confidence() {
        let text = "Chapter 1: Eligibility\n1.1 Credit Requirements\nThe credit score must be at least 900.\n";
        let found = entities(text);
        let score = found
            .iter()
            .find(|e| e.entity_type == EntityType::Threshold)
            .unwrap();
        assert!(score.low_confidence);
        assert_eq!(score.confidence, 0.3);
        assert!(score.validation_note.as_deref().unwrap().contains("300-850"));
    }

    #[tokio::test]
    async fn test_inference_types_subjectless_threshold() {
        let text = "Chapter 1: Eligibility\n1.1 Credit Requirements\nThe borrower needs at least 640 on the tri-merge.\n";
        let tree = NavigationExtractor::default().extract(text, DocumentFormat::StructuredText);
        let chunks = SemanticChunker::new().chunk(&tree, text, 512, 0.1);

        let plain = EntityExtractor::default().extract(&tree, &chunks);
        let threshold = plain.iter().find(|e| e.entity_type == EntityType::Threshold).unwrap();
        assert_eq!(threshold.subject, None);

        let (classifier, _) = fakes::scripted(|_| ("credit score".to_string(), 0.8));
        let out = EntityExtractor::default()
            .with_classifier(classifier, 0.6)
            .extract_assisted(&tree, &chunks, &CancellationToken::new())
            .await;
        let threshold = out
            .entities
            .iter()
            .find(|e| e.entity_type == EntityType::Threshold)
            .unwrap();
        assert_eq!(threshold.subject.as_deref(), Some("credit score"));
        assert_eq!(threshold.normalized, "credit score >= 640");
        assert!(out.issues.is_empty());
    }
}
