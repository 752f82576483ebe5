//! Pattern library.
//!
//! Regular-expression and lexical pattern sets shared by every stage:
//! heading families (chapter, section, subsection, markup), table-of-contents
//! anchors and entries, page markers, decision indicators (requirements,
//! numeric comparisons, outcomes, conditionals, precedence words), cross
//! references, external-document citations and chunk-type cues.
//!
//! All patterns are compiled once. Functions here are pure.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

pub(crate) fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("built-in pattern {pattern:?} failed to compile: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Headings
// ---------------------------------------------------------------------------

static CHAPTER_RE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)^\s*(chapter|part)\s+(\d{1,3}|[ivxlc]{1,6})\b\s*[:.\-]?\s*(.*?)\s*$")
});

static SECTION_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)^\s*(?:section|sec\.|§)\s*(\d{1,3}(?:\.\d{1,3}){0,4})\.?\s*[:\-]?\s*(.*?)\s*$")
});

static NUMBERED_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"^\s*(\d{1,3}(?:\.\d{1,3}){1,4})\.?\s+(\S.*?)\s*$"));

static SINGLE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"^\s*(\d{1,2})\.\s+([A-Z][A-Za-z&,'/\- ]{2,60}?)\s*$"));

static MARKDOWN_RE: Lazy<Regex> = Lazy::new(|| compile(r"^(#{1,6})\s+(.+?)\s*#*\s*$"));

static HTML_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)^\s*<h([1-6])[^>]*>(.*?)</h[1-6]>\s*$"));

static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| compile(r"<[^>]+>"));

static NUMBER_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"^\s*(\d{1,3}(?:\.\d{1,3}){0,4})\.?\s+(.+)$"));

/// Which rule produced a heading match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingRule {
    ChapterKeyword,
    SectionKeyword,
    Numbered,
    SingleNumber,
    Markdown,
    Html,
    AllCaps,
    /// A body line matched only through a table-of-contents entry.
    TableOfContents,
    /// Placeholder for a region that could not be parsed.
    Unparsed,
}

/// A line that looks like a heading.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadingMatch {
    /// 1 = chapter, 2 = section, 3 = subsection.
    pub level: u32,
    pub title: String,
    pub numbering: Option<String>,
    /// Number of numbering components; higher is more specific.
    pub specificity: usize,
    pub confidence: f32,
    pub rule: HeadingRule,
}

impl HeadingMatch {
    /// Numbering and title as one label.
    pub fn label(&self) -> String {
        match self.numbering {
            Some(ref n) => format!("{n} {}", self.title),
            None => self.title.clone(),
        }
    }
}

/// Hint about how the source text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// Plain text with explicit numbering.
    StructuredText,
    /// Text flowed out of a PDF: page markers, running headers.
    FlowedPdf,
    /// Markdown or HTML-ish markup.
    Markup,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StructuredText => "structured-text",
            Self::FlowedPdf => "flowed-text-from-pdf",
            Self::Markup => "markup",
        }
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "structured" | "structured-text" | "text" | "txt" => Ok(Self::StructuredText),
            "pdf" | "flowed" | "flowed-text-from-pdf" => Ok(Self::FlowedPdf),
            "markup" | "markdown" | "md" | "html" => Ok(Self::Markup),
            other => Err(format!("unknown document format '{other}'")),
        }
    }
}

fn numbering_components(numbering: &str) -> usize {
    numbering.split('.').filter(|p| !p.is_empty()).count()
}

fn level_for_components(components: usize) -> u32 {
    match components {
        0 | 1 => 1,
        2 => 2,
        _ => 3,
    }
}

/// Whether `title` reads like a heading title rather than a sentence.
pub fn plausible_title(title: &str) -> bool {
    let title = title.trim();
    if title.is_empty() || title.len() > 120 {
        return false;
    }
    let words = title.split_whitespace().count();
    if words > 15 {
        return false;
    }
    let first = title.chars().next();
    if !first.is_some_and(|c| c.is_uppercase() || c.is_ascii_digit() || c == '(') {
        return false;
    }
    // Long lines ending in sentence punctuation are prose.
    !(words > 6 && title.ends_with(['.', ',', ';']))
}

fn title_case(title: &str) -> bool {
    const MINOR: [&str; 10] = ["a", "an", "and", "for", "in", "of", "on", "or", "the", "to"];
    title
        .split_whitespace()
        .all(|w| MINOR.contains(&w) || w.chars().next().is_some_and(|c| !c.is_lowercase()))
}

fn title_confidence_penalty(title: &str) -> f32 {
    let words = title.split_whitespace().count();
    let mut penalty = 0.0;
    if words > 10 {
        penalty += 0.15;
    }
    if title.ends_with('.') {
        penalty += 0.1;
    }
    if title.chars().any(|c| c.is_ascii_digit()) {
        penalty += 0.05;
    }
    penalty
}

fn all_caps_heading(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.len() < 4 || trimmed.len() > 60 || trimmed.ends_with('.') {
        return None;
    }
    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 4 || letters.iter().any(|c| c.is_lowercase()) {
        return None;
    }
    let words = trimmed.split_whitespace().count();
    if words < 2 && letters.len() < 6 {
        return None;
    }
    if trimmed
        .chars()
        .any(|c| !(c.is_alphanumeric() || c.is_whitespace() || "&-/,'():".contains(c)))
    {
        return None;
    }
    Some(trimmed.to_string())
}

fn strip_tags(text: &str) -> String {
    HTML_TAG_RE.replace_all(text, "").trim().to_string()
}

/// Match a single line against the heading families for `format`.
///
/// When several families match, the one with the most numbering components
/// wins, then the one with the higher confidence.
pub fn match_heading(line: &str, format: DocumentFormat) -> Option<HeadingMatch> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > 160 {
        return None;
    }

    let mut candidates: Vec<HeadingMatch> = Vec::new();

    if format == DocumentFormat::Markup {
        if let Some(cap) = MARKDOWN_RE.captures(line) {
            let hashes = cap.get(1).map_or(1, |m| m.as_str().len());
            let raw_title = cap.get(2).map_or("", |m| m.as_str());
            candidates.push(markup_heading(hashes as u32, raw_title, HeadingRule::Markdown));
        }
        if let Some(cap) = HTML_HEADING_RE.captures(line) {
            let level = cap
                .get(1)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(1);
            let raw_title = strip_tags(cap.get(2).map_or("", |m| m.as_str()));
            candidates.push(markup_heading(level, &raw_title, HeadingRule::Html));
        }
    }

    if let Some(cap) = CHAPTER_RE.captures(line) {
        let number = cap.get(2).map_or("", |m| m.as_str()).to_string();
        let title = cap.get(3).map_or("", |m| m.as_str()).trim().to_string();
        if title.is_empty() || plausible_title(&title) {
            let keyword = cap.get(1).map_or("Chapter", |m| m.as_str());
            let title = if title.is_empty() {
                format!("{} {number}", capitalize(keyword))
            } else {
                title
            };
            candidates.push(HeadingMatch {
                level: 1,
                confidence: 0.95 - title_confidence_penalty(&title),
                title,
                numbering: Some(number),
                specificity: 1,
                rule: HeadingRule::ChapterKeyword,
            });
        }
    }

    if let Some(cap) = SECTION_KEYWORD_RE.captures(line) {
        let numbering = cap.get(1).map_or("", |m| m.as_str()).to_string();
        let title = cap.get(2).map_or("", |m| m.as_str()).trim().to_string();
        if title.is_empty() || plausible_title(&title) {
            let components = numbering_components(&numbering);
            let title = if title.is_empty() {
                format!("Section {numbering}")
            } else {
                title
            };
            candidates.push(HeadingMatch {
                level: level_for_components(components).max(2),
                confidence: 0.9 - title_confidence_penalty(&title),
                title,
                numbering: Some(numbering),
                specificity: components,
                rule: HeadingRule::SectionKeyword,
            });
        }
    }

    if let Some(cap) = NUMBERED_RE.captures(line) {
        let numbering = cap.get(1).map_or("", |m| m.as_str()).to_string();
        let title = cap.get(2).map_or("", |m| m.as_str()).trim().to_string();
        if plausible_title(&title) && title.chars().next().is_some_and(char::is_alphabetic) {
            let components = numbering_components(&numbering);
            candidates.push(HeadingMatch {
                level: level_for_components(components),
                confidence: 0.85 - title_confidence_penalty(&title),
                title,
                numbering: Some(numbering),
                specificity: components,
                rule: HeadingRule::Numbered,
            });
        }
    }

    if let Some(cap) = SINGLE_NUMBER_RE.captures(line) {
        let numbering = cap.get(1).map_or("", |m| m.as_str()).to_string();
        let title = cap.get(2).map_or("", |m| m.as_str()).trim().to_string();
        if title.split_whitespace().count() <= 6 && title_case(&title) {
            candidates.push(HeadingMatch {
                level: 1,
                confidence: 0.5,
                title,
                numbering: Some(numbering),
                specificity: 1,
                rule: HeadingRule::SingleNumber,
            });
        }
    }

    if candidates.is_empty() {
        if let Some(title) = all_caps_heading(line) {
            candidates.push(HeadingMatch {
                level: 2,
                confidence: 0.45,
                title,
                numbering: None,
                specificity: 0,
                rule: HeadingRule::AllCaps,
            });
        }
    }

    candidates.into_iter().max_by(|a, b| {
        a.specificity.cmp(&b.specificity).then(
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    })
}

fn markup_heading(level: u32, raw_title: &str, rule: HeadingRule) -> HeadingMatch {
    let (numbering, title) = match NUMBER_PREFIX_RE.captures(raw_title) {
        Some(cap) => (
            cap.get(1).map(|m| m.as_str().to_string()),
            cap.get(2).map_or(raw_title, |m| m.as_str()).trim().to_string(),
        ),
        None => (None, raw_title.trim().to_string()),
    };
    let specificity = numbering.as_deref().map_or(0, numbering_components);
    // Explicit numbering outranks the markup depth.
    let level = if specificity > 0 {
        level_for_components(specificity)
    } else {
        level.clamp(1, 3)
    };
    HeadingMatch {
        level,
        title,
        numbering,
        specificity,
        confidence: 0.95,
        rule,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Split a numbering string ("2.1.3") into its chapter and section parts.
pub fn split_numbering(numbering: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = numbering.split('.').filter(|p| !p.is_empty()).collect();
    match parts.len() {
        0 => (None, None),
        1 => (Some(parts[0].to_string()), None),
        _ => (Some(parts[0].to_string()), Some(parts.join("."))),
    }
}

// ---------------------------------------------------------------------------
// Table of contents and page markers
// ---------------------------------------------------------------------------

static TOC_ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)^\s*(?:table\s+of\s+contents|contents|index\s+of\s+sections)\s*:?\s*$")
});

static TOC_ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)^\s*(?:(chapter|section|part)\s+(\d{1,3}(?:\.\d{1,3}){0,4}|[ivxlc]{1,6})|(\d{1,3}(?:\.\d{1,3}){0,4}))\.?\s*[:\-]?\s*(.+?)\s*(?:\.{2,}|\s{2,}|\t|…+)\s*(\d{1,4})\s*$",
    )
});

static PAGE_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)^\s*(?:-\s*)?(?:page\s+)?(\d{1,4})(?:\s+of\s+\d{1,4})?(?:\s*-)?\s*$")
});

/// One table-of-contents entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub numbering: String,
    pub title: String,
    pub page: u32,
    pub level: u32,
}

/// Whether the line opens a table of contents.
pub fn is_toc_anchor(line: &str) -> bool {
    TOC_ANCHOR_RE.is_match(line)
}

/// Parse a table-of-contents entry line.
pub fn parse_toc_entry(line: &str) -> Option<TocEntry> {
    let cap = TOC_ENTRY_RE.captures(line)?;
    let keyword = cap.get(1).map(|m| m.as_str().to_ascii_lowercase());
    let numbering = cap
        .get(2)
        .or_else(|| cap.get(3))
        .map(|m| m.as_str().to_string())?;
    let title = cap.get(4)?.as_str().trim().trim_end_matches('.').trim().to_string();
    let page = cap.get(5)?.as_str().parse().ok()?;
    if title.is_empty() {
        return None;
    }
    let level = match keyword.as_deref() {
        Some("chapter") | Some("part") => 1,
        _ => level_for_components(numbering_components(&numbering)),
    };
    Some(TocEntry {
        numbering,
        title,
        page,
        level,
    })
}

/// Page number announced by a page-marker line ("Page 3 of 10", "- 4 -").
pub fn page_marker(line: &str) -> Option<u32> {
    PAGE_MARKER_RE
        .captures(line)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Whether a line is mostly replacement, control or stray symbol characters.
pub fn is_garbled(line: &str) -> bool {
    let trimmed = line.trim();
    let total = trimmed.chars().count();
    if total < 8 {
        return false;
    }
    let bad = trimmed
        .chars()
        .filter(|c| {
            *c == '\u{FFFD}'
                || (c.is_control() && *c != '\t')
                || !(c.is_alphanumeric() || c.is_whitespace() || ".,;:!?'\"()[]-/%$&".contains(*c))
        })
        .count();
    bad * 2 > total
}

// ---------------------------------------------------------------------------
// Decision indicators
// ---------------------------------------------------------------------------

static DECISION_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(eligib\w*|qualif\w*|requirements?|criteria|underwriting|approval|decision\w*|limits?|restrictions?|thresholds?)\b",
    )
});

static DECISION_FLOW_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(decision\s+(?:flow|tree|matrix|process|rules?)|approval\s+(?:criteria|process|authority)|underwriting\s+decision|eligibility\s+(?:determination|decision|criteria))\b",
    )
});

static REQUIREMENT_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(must(?:\s+not)?(?:\s+(?:be|have|meet|exceed|provide|demonstrate|show|document))?|shall(?:\s+not)?|(?:is|are)\s+required|required\s+to|may\s+not|not\s+(?:be\s+)?(?:permitted|allowed))\b",
    )
});

static COMPARISON_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)(\b(?:at\s+least|a\s+minimum\s+of|minimum\s+of|minimum|no\s+(?:less|fewer)\s+than|not\s+less\s+than|greater\s+than\s+or\s+equal\s+to|equal\s+to\s+or\s+greater\s+than|more\s+than|greater\s+than|in\s+excess\s+of|(?:may|must|shall|does|do|can|will)\s+not\s+exceed|not\s+to\s+exceed|exceeds|exceed|exceeding|over|above|at\s+most|a\s+maximum\s+of|maximum\s+of|maximum|no\s+more\s+than|not\s+more\s+than|less\s+than\s+or\s+equal\s+to|up\s+to|less\s+than|fewer\s+than|under|below|equal\s+to)\b|>=|<=|≥|≤|>|<)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(%|percent\b|years?\b|months?\b|days?\b|points?\b)?",
    )
});

static IF_THEN_RE: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\bif\b.+\bthen\b"));

static CONDITIONAL_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(if|unless|provided\s+that|in\s+the\s+event|when|whenever|subject\s+to|only\s+if|otherwise|except)\b",
    )
});

static OTHER_OUTCOME_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(suspend(?:ed)?|counter-?offer|approve\s+with\s+conditions|conditional(?:ly)?\s+approv\w*)\b",
    )
});

static DECLINE_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(declin(?:e|ed|es)|reject(?:ed|s)?|den(?:y|ied|ial)|refuse[ds]?|ineligible|not\s+eligible|(?:is|are)\s+not\s+(?:permitted|allowed|acceptable))\b",
    )
});

static REFER_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(refer(?:red)?\s+(?:the\s+(?:file|application|loan|case)\s+)?(?:to\s+(?:an?\s+|the\s+)?(?:underwriter|underwriting|credit\s+(?:committee|officer)|manager|supervisor|senior\s+underwriter)|for\s+(?:review|manual|underwriting|approval))|referral|manual(?:ly)?\s+(?:review|underwrit\w*)|underwriter\s+review|escalat\w+|exception\s+(?:review|request))\b",
    )
});

static APPROVE_RE: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\b(approv(?:e|ed|es|al)|accept(?:ed|able)?|(?:is|are)\s+eligible)\b")
});

static PRECEDENCE_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)^\W*(first(?:ly)?|initially|to\s+begin|second(?:ly)?|then|next|subsequently|third(?:ly)?|finally|lastly|otherwise|in\s+all\s+other\s+cases|else)\b",
    )
});

/// Comparison operator of a numeric threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl ComparisonOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gte => ">=",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }

    /// The operator that holds exactly when this one does not.
    pub fn negate(&self) -> Self {
        match self {
            Self::Gte => Self::Lt,
            Self::Gt => Self::Lte,
            Self::Lte => Self::Gt,
            Self::Lt => Self::Gte,
            Self::Eq => Self::Eq,
        }
    }

    fn from_phrase(phrase: &str) -> Self {
        let p = phrase.to_ascii_lowercase();
        let p = p.split_whitespace().collect::<Vec<_>>().join(" ");
        match p.as_str() {
            ">=" | "≥" => Self::Gte,
            "<=" | "≤" => Self::Lte,
            ">" => Self::Gt,
            "<" => Self::Lt,
            "equal to" => Self::Eq,
            _ if p.contains("not exceed") || p.contains("not to exceed") => Self::Lte,
            _ if p.contains("or equal to") && (p.contains("greater") || p.starts_with("equal")) => {
                Self::Gte
            }
            _ if p.contains("or equal to") => Self::Lte,
            _ if p.contains("least")
                || p.contains("minimum")
                || p.contains("no less")
                || p.contains("no fewer")
                || p.contains("not less") =>
            {
                Self::Gte
            }
            _ if p.contains("most")
                || p.contains("maximum")
                || p.contains("no more")
                || p.contains("not more")
                || p.contains("up to") =>
            {
                Self::Lte
            }
            _ if p.contains("more")
                || p.contains("greater")
                || p.contains("excess")
                || p.contains("exceed")
                || p == "over"
                || p == "above" =>
            {
                Self::Gt
            }
            _ => Self::Lt,
        }
    }
}

/// A numeric comparison found in text ("at least 18 years").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub operator: ComparisonOp,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub matched: String,
    pub start: usize,
    pub end: usize,
}

/// Parse a number with thousands separators.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

fn normalize_unit(unit: &str) -> String {
    let u = unit.trim().to_ascii_lowercase();
    match u.as_str() {
        "%" | "percent" => "%".to_string(),
        "year" | "years" => "years".to_string(),
        "month" | "months" => "months".to_string(),
        "day" | "days" => "days".to_string(),
        "point" | "points" => "points".to_string(),
        _ => u,
    }
}

/// All numeric comparisons in `text`, in order.
pub fn comparisons(text: &str) -> Vec<Comparison> {
    COMPARISON_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let phrase = cap.get(1)?.as_str();
            let value = parse_number(cap.get(2)?.as_str())?;
            Some(Comparison {
                operator: ComparisonOp::from_phrase(phrase),
                value,
                unit: cap.get(3).map(|m| normalize_unit(m.as_str())),
                matched: whole.as_str().trim().to_string(),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Kind of decision signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    EligibilityTitle,
    Requirement,
    NumericComparison,
    Outcome,
    Conditional,
}

impl SignalKind {
    pub fn weight(&self) -> f32 {
        match self {
            Self::EligibilityTitle => 0.3,
            Self::Requirement => 0.5,
            Self::NumericComparison => 0.4,
            Self::Outcome => 0.4,
            Self::Conditional => 0.2,
        }
    }
}

/// One matched decision indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionSignal {
    pub kind: SignalKind,
    pub matched: String,
}

/// Decision indicators in a heading title.
pub fn title_signals(title: &str) -> Vec<DecisionSignal> {
    DECISION_TITLE_RE
        .find_iter(title)
        .map(|m| DecisionSignal {
            kind: SignalKind::EligibilityTitle,
            matched: m.as_str().to_string(),
        })
        .collect()
}

/// Decision indicators in body text (at most one per kind is counted for scoring).
pub fn body_signals(text: &str) -> Vec<DecisionSignal> {
    let mut signals = Vec::new();
    if let Some(m) = REQUIREMENT_RE.find(text) {
        signals.push(DecisionSignal {
            kind: SignalKind::Requirement,
            matched: m.as_str().to_string(),
        });
    }
    if let Some(c) = comparisons(text).into_iter().next() {
        signals.push(DecisionSignal {
            kind: SignalKind::NumericComparison,
            matched: c.matched,
        });
    }
    if let Some((_, matched)) = find_outcome(text) {
        signals.push(DecisionSignal {
            kind: SignalKind::Outcome,
            matched,
        });
    }
    if let Some(m) = CONDITIONAL_RE.find(text) {
        signals.push(DecisionSignal {
            kind: SignalKind::Conditional,
            matched: m.as_str().to_string(),
        });
    }
    signals
}

/// Score decision signals: the sum of distinct signal-kind weights, capped at 1.
pub fn decision_score(signals: &[DecisionSignal]) -> f32 {
    let kinds: HashSet<SignalKind> = signals.iter().map(|s| s.kind).collect();
    kinds.iter().map(SignalKind::weight).sum::<f32>().min(1.0)
}

/// Whether a title names a decision flow section outright.
pub fn is_decision_flow_title(title: &str) -> bool {
    DECISION_FLOW_TITLE_RE.is_match(title)
}

/// Whether text contains requirement language ("must", "shall", "is required").
pub fn has_requirement(text: &str) -> bool {
    REQUIREMENT_RE.is_match(text)
}

/// Whether text contains conditional language.
pub fn has_conditional(text: &str) -> bool {
    IF_THEN_RE.is_match(text) || CONDITIONAL_RE.is_match(text)
}

/// First conditional keyword in text.
pub fn conditional_keyword(text: &str) -> Option<String> {
    CONDITIONAL_RE.find(text).map(|m| m.as_str().to_ascii_lowercase())
}

/// Decision outcome named by text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Approve,
    Decline,
    Refer,
    /// A domain-specific outcome ("SUSPEND", "COUNTEROFFER").
    Other(String),
}

impl OutcomeKind {
    /// The outcomes every complete tree must reach.
    pub const MANDATORY: [OutcomeKind; 3] = [Self::Approve, Self::Decline, Self::Refer];

    pub fn label(&self) -> String {
        match self {
            Self::Approve => "APPROVE".to_string(),
            Self::Decline => "DECLINE".to_string(),
            Self::Refer => "REFER".to_string(),
            Self::Other(name) => name.clone(),
        }
    }

    /// Parse a label as returned by the inference service.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "approval" => Some(Self::Approve),
            "decline" | "declined" | "deny" | "reject" => Some(Self::Decline),
            "refer" | "referral" | "manual_review" => Some(Self::Refer),
            _ => None,
        }
    }
}

/// First outcome named in text, with the matched phrase.
///
/// Decline is checked before approve so "not eligible" never reads as approval;
/// refer and domain-specific outcomes before both.
pub fn find_outcome(text: &str) -> Option<(OutcomeKind, String)> {
    if let Some(m) = OTHER_OUTCOME_RE.find(text) {
        let name = m
            .as_str()
            .to_ascii_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .replace('-', "");
        let name = if name.starts_with("CONDITIONAL") || name.starts_with("APPROVE_WITH") {
            "CONDITIONAL_APPROVE".to_string()
        } else if name.starts_with("SUSPEND") {
            "SUSPEND".to_string()
        } else {
            "COUNTEROFFER".to_string()
        };
        return Some((OutcomeKind::Other(name), m.as_str().to_string()));
    }
    if let Some(m) = REFER_RE.find(text) {
        return Some((OutcomeKind::Refer, m.as_str().to_string()));
    }
    if let Some(m) = DECLINE_RE.find(text) {
        return Some((OutcomeKind::Decline, m.as_str().to_string()));
    }
    APPROVE_RE
        .find(text)
        .map(|m| (OutcomeKind::Approve, m.as_str().to_string()))
}

/// Explicit ordering language at the start of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    First,
    Ordinal,
    Final,
    Otherwise,
}

/// Precedence bucket announced by a clause, if any.
pub fn precedence_hint(text: &str) -> Option<Precedence> {
    let cap = PRECEDENCE_RE.captures(text)?;
    let word = cap.get(1)?.as_str().to_ascii_lowercase();
    let word = word.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(match word.as_str() {
        "first" | "firstly" | "initially" | "to begin" => Precedence::First,
        "finally" | "lastly" => Precedence::Final,
        "otherwise" | "in all other cases" | "else" => Precedence::Otherwise,
        _ => Precedence::Ordinal,
    })
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

static CROSS_REF_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(see|refer\s+to|as\s+(?:described|defined|set\s+out|outlined|specified)\s+in|per|under|in\s+accordance\s+with|pursuant\s+to|according\s+to|subject\s+to)\s+(?:the\s+)?(?:requirements\s+(?:of|in)\s+)?(chapter|section|clause|part|§)\s*(\d{1,3}(?:\.\d{1,3}){0,4})",
    )
});

static BARE_REF_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(chapter|section|§)\s*(\d{1,3}(?:\.\d{1,3}){0,4})"));

static EXTERNAL_DOC_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"\b(?i:see|per|refer\s+to|in\s+accordance\s+with|as\s+required\s+by|under|according\s+to|consult|pursuant\s+to)\s+(?:the\s+)?((?:[A-Z][\w&'\-]*\s+){0,6}(?:Guide|Manual|Handbook|Guidelines|Policy|Standards?|Act|Regulation|Bulletin|Announcement))\b",
    )
});

/// A reference to another part of the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReference {
    /// "chapter", "section", "clause", "part".
    pub target_kind: String,
    pub numbering: String,
    /// Introduced by a reference verb ("see", "per", "subject to").
    pub explicit: bool,
    /// Introduced by "subject to" or within a conditional sentence.
    pub conditional: bool,
    pub matched: String,
    pub start: usize,
}

/// Cross references in text. Explicit matches shadow bare ones at the same spot.
pub fn cross_references(text: &str) -> Vec<CrossReference> {
    let mut refs: Vec<CrossReference> = CROSS_REF_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let verb = cap.get(1)?.as_str().to_ascii_lowercase();
            let sentence = sentence_around(text, whole.start());
            Some(CrossReference {
                target_kind: normalize_ref_kind(cap.get(2)?.as_str()),
                numbering: cap.get(3)?.as_str().to_string(),
                explicit: true,
                conditional: verb.starts_with("subject") || has_conditional(sentence),
                matched: whole.as_str().to_string(),
                start: whole.start(),
            })
        })
        .collect();

    for cap in BARE_REF_RE.captures_iter(text) {
        let Some(whole) = cap.get(0) else { continue };
        let covered = refs
            .iter()
            .any(|r| whole.start() >= r.start && whole.start() < r.start + r.matched.len());
        if covered {
            continue;
        }
        let (Some(kind), Some(numbering)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        let sentence = sentence_around(text, whole.start());
        refs.push(CrossReference {
            target_kind: normalize_ref_kind(kind.as_str()),
            numbering: numbering.as_str().to_string(),
            explicit: false,
            conditional: has_conditional(sentence),
            matched: whole.as_str().to_string(),
            start: whole.start(),
        });
    }

    refs.sort_by_key(|r| r.start);
    refs
}

fn normalize_ref_kind(kind: &str) -> String {
    match kind.to_ascii_lowercase().as_str() {
        "§" => "section".to_string(),
        other => other.to_string(),
    }
}

fn sentence_around(text: &str, pos: usize) -> &str {
    let start = text[..pos]
        .rfind(['.', '\n', '?', '!'])
        .map_or(0, |i| i + 1);
    let end = text[pos..]
        .find(['.', '\n', '?', '!'])
        .map_or(text.len(), |i| pos + i);
    &text[start..end]
}

/// Names of external documents cited in text ("Seller Guide").
pub fn external_documents(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    EXTERNAL_DOC_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

// ---------------------------------------------------------------------------
// Chunk-type cues
// ---------------------------------------------------------------------------

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)^\s*(in\s+summary|summary|to\s+summari[sz]e|overview|in\s+short|key\s+points|at\s+a\s+glance)\b",
    )
});

static SUMMARY_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(summary|overview|introduction|at\s+a\s+glance)\b"));

static ELABORATION_RE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)^\s*(for\s+example|for\s+instance|e\.g\.|specifically|in\s+particular|this\s+means|that\s+is|note\s*:|example\s*:|to\s+illustrate|additionally|in\s+addition)",
    )
});

static TABLE_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(matrix|grid|table|chart|schedule)\b"));

static NUMBER_TOKEN_RE: Lazy<Regex> = Lazy::new(|| compile(r"\d[\d,]*(?:\.\d+)?%?"));

/// Whether text opens with a summary marker.
pub fn is_summary_text(text: &str) -> bool {
    SUMMARY_RE.is_match(text)
}

/// Whether a title names a summary/overview section.
pub fn is_summary_title(title: &str) -> bool {
    SUMMARY_TITLE_RE.is_match(title)
}

/// Elaboration marker at the start of text ("For example", "Specifically").
pub fn elaboration_marker(text: &str) -> Option<String> {
    ELABORATION_RE.find(text).map(|m| m.as_str().trim().to_string())
}

/// Table/matrix mention in text.
pub fn table_mention(text: &str) -> Option<String> {
    TABLE_MENTION_RE.find(text).map(|m| m.as_str().to_ascii_lowercase())
}

/// Numeric tokens in text ("620", "80%"), normalized without separators.
pub fn numeric_tokens(text: &str) -> HashSet<String> {
    NUMBER_TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().replace(',', ""))
        .filter(|t| t.trim_end_matches('%').len() >= 2)
        .collect()
}

fn table_row_cells(line: &str) -> usize {
    let trimmed = line.trim();
    if trimmed.matches('|').count() >= 2 {
        return trimmed.split('|').filter(|c| !c.trim().is_empty()).count();
    }
    if trimmed.contains('\t') {
        return trimmed.split('\t').filter(|c| !c.trim().is_empty()).count();
    }
    trimmed
        .split("  ")
        .filter(|c| !c.trim().is_empty())
        .count()
}

/// Whether text is laid out as a matrix/grid: at least two rows of three or
/// more cells, at least one row containing a number.
pub fn is_matrix_block(text: &str) -> bool {
    let rows: Vec<&str> = text
        .lines()
        .filter(|l| table_row_cells(l) >= 3)
        .collect();
    rows.len() >= 2 && rows.iter().any(|r| r.chars().any(|c| c.is_ascii_digit()))
}

// ---------------------------------------------------------------------------
// Domain vocabulary
// ---------------------------------------------------------------------------

/// Subjects a numeric criterion can constrain, most specific phrasing first.
pub const SUBJECTS: [(&str, &str); 22] = [
    ("combined loan-to-value", "cltv"),
    ("cltv", "cltv"),
    ("loan-to-value", "ltv"),
    ("ltv", "ltv"),
    ("debt-to-income", "dti"),
    ("dti", "dti"),
    ("credit score", "credit score"),
    ("fico", "credit score"),
    ("years old", "age"),
    ("age", "age"),
    ("reserves", "reserves"),
    ("down payment", "down payment"),
    ("loan amount", "loan amount"),
    ("income", "income"),
    ("employment", "employment"),
    ("seasoning", "seasoning"),
    ("bankruptcy", "bankruptcy"),
    ("foreclosure", "foreclosure"),
    ("tradelines", "tradelines"),
    ("property value", "property value"),
    ("units", "units"),
    ("term", "term"),
];

/// The vocabulary subject mentioned nearest to byte `near` in `text`.
pub fn domain_subject(text: &str, near: usize) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    let mut best: Option<(usize, &'static str)> = None;
    for (needle, subject) in SUBJECTS {
        for (pos, _) in lower.match_indices(needle) {
            if !word_bounded(&lower, pos, needle.len()) {
                continue;
            }
            let distance = pos.abs_diff(near);
            if best.is_none_or(|(d, _)| distance < d) {
                best = Some((distance, subject));
            }
        }
    }
    best.map(|(_, subject)| subject)
}

/// Whether `text[pos..pos + len]` is a whole word or phrase.
pub fn word_bounded(text: &str, pos: usize, len: usize) -> bool {
    let before = text[..pos].chars().next_back();
    let after = text[pos + len..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

// ---------------------------------------------------------------------------
// Lexical helpers
// ---------------------------------------------------------------------------

const STOP_WORDS: [&str; 48] = [
    "about", "above", "after", "also", "been", "before", "being", "both", "but", "each", "from",
    "have", "into", "least", "less", "more", "most", "must", "only", "other", "over", "same",
    "shall", "should", "such", "than", "that", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "under", "upon", "were", "what", "when", "where", "which", "while",
    "will", "with", "within", "would",
];

/// Lowercase content words of four or more letters.
pub fn significant_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4 && w.chars().any(char::is_alphabetic))
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Jaccard overlap of two term sets.
pub fn term_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    inter / union
}

const ABBREVIATIONS: [&str; 12] = [
    "e.g", "i.e", "etc", "vs", "no", "sec", "fig", "approx", "u.s", "inc", "min", "max",
];

/// Split text into sentence spans `(start, end)` covering the whole input.
///
/// Boundaries are sentence punctuation followed by whitespace, blank lines,
/// and line breaks before list items. Decimal points and common
/// abbreviations never end a sentence. Trailing whitespace belongs to the
/// sentence it follows, so concatenating the spans reproduces `text`.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let mut boundary = None;

        if matches!(b, b'.' | b'?' | b'!') {
            let next = bytes.get(i + 1).copied();
            let followed_by_space = next.is_none_or(|n| n.is_ascii_whitespace());
            let decimal = b == b'.' && next.is_some_and(|n| n.is_ascii_digit());
            let abbreviation = b == b'.' && ends_with_abbreviation(&text[start..i]);
            if followed_by_space && !decimal && !abbreviation {
                boundary = Some(i + 1);
            }
        } else if b == b'\n' {
            let rest = &text[i + 1..];
            let blank_line = rest.starts_with('\n') || rest.starts_with("\r\n");
            let list_item = starts_list_item(rest);
            if blank_line || list_item {
                boundary = Some(i + 1);
            }
        }

        if let Some(mut end) = boundary {
            // Absorb trailing whitespace into the current sentence.
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            if end > start {
                spans.push((start, end));
            }
            start = end;
            i = end;
            continue;
        }
        i += 1;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

fn ends_with_abbreviation(prefix: &str) -> bool {
    let word = prefix
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    ABBREVIATIONS.contains(&word.as_str())
        || (word.len() == 1 && word.chars().all(|c| c.is_ascii_alphabetic()))
}

fn starts_list_item(rest: &str) -> bool {
    let trimmed = rest.trim_start_matches([' ', '\t']);
    trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with("• ")
        || trimmed
            .split_once(['.', ')'])
            .is_some_and(|(head, tail)| {
                !head.is_empty()
                    && head.len() <= 3
                    && (head.chars().all(|c| c.is_ascii_digit())
                        || head.chars().all(|c| c.is_ascii_lowercase()))
                    && tail.starts_with(' ')
            })
}

/// Split an over-long sentence into pieces of at most `max_len` bytes.
///
/// Pieces end after a clause separator ("; ", ", ") when one is available,
/// else after the last whitespace, else at the character where the limit is
/// reached. Separators stay with the preceding piece so spans are contiguous.
pub fn clause_spans(sentence: &str, max_len: usize) -> Vec<(usize, usize)> {
    if sentence.len() <= max_len {
        return vec![(0, sentence.len())];
    }
    let mut spans = Vec::new();
    let mut start = 0;
    let mut clause_break: Option<usize> = None;
    let mut word_break: Option<usize> = None;
    let mut before_prev: Option<char> = None;
    let mut prev: Option<char> = None;
    for (i, c) in sentence.char_indices() {
        if prev.is_some_and(char::is_whitespace) {
            word_break = Some(i);
            if matches!(before_prev, Some(';' | ',')) {
                clause_break = Some(i);
            }
        }
        before_prev = prev;
        prev = Some(c);

        // `start <= i` always holds: every cut is at or before `i`.
        let end = i + c.len_utf8();
        if end - start <= max_len {
            continue;
        }
        let cut = clause_break
            .or(word_break)
            .filter(|b| *b > start)
            .unwrap_or(i);
        if cut > start {
            spans.push((start, cut));
            start = cut;
        }
        if end - start > max_len && i > start {
            spans.push((start, i));
            start = i;
        }
        clause_break = None;
        word_break = None;
    }
    if start < sentence.len() {
        spans.push((start, sentence.len()));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_domain_subject_prefers_nearest_whole_word() {
        let text = "Mortgage age: the DTI must not exceed 45% and the LTV at most 80%";
        assert_eq!(domain_subject(text, text.find("45").unwrap()), Some("dti"));
        assert_eq!(domain_subject(text, text.find("80").unwrap()), Some("ltv"));
        assert_eq!(domain_subject("mortgage terms", 0), None);
    }

    #[test]
    fn test_chapter_heading() {
        let m = match_heading("Chapter 1: Eligibility", DocumentFormat::StructuredText).unwrap();
        assert_eq!(m.level, 1);
        assert_eq!(m.title, "Eligibility");
        assert_eq!(m.numbering.as_deref(), Some("1"));
        assert_eq!(m.rule, HeadingRule::ChapterKeyword);
    }

    #[test]
    fn test_numbered_section_and_subsection() {
        let s = match_heading("1.1 Age Requirements", DocumentFormat::StructuredText).unwrap();
        assert_eq!(s.level, 2);
        assert_eq!(s.title, "Age Requirements");
        assert_eq!(s.specificity, 2);

        let ss = match_heading("2.3.1 Self-Employed Borrowers", DocumentFormat::StructuredText)
            .unwrap();
        assert_eq!(ss.level, 3);
        assert_eq!(ss.numbering.as_deref(), Some("2.3.1"));
    }

    #[test]
    fn test_section_keyword_prefers_specific_numbering() {
        let m = match_heading("Section 4.2 Reserves", DocumentFormat::StructuredText).unwrap();
        assert_eq!(m.level, 2);
        assert_eq!(m.specificity, 2);
        assert_eq!(m.title, "Reserves");
    }

    #[test]
    fn test_prose_is_not_a_heading() {
        assert!(
            match_heading(
                "1.5 times the monthly payment must be verified through bank statements.",
                DocumentFormat::StructuredText
            )
            .is_none()
        );
        assert!(
            match_heading(
                "Part 2 of the form must be completed",
                DocumentFormat::StructuredText
            )
            .is_none()
        );
        assert!(
            match_heading("1. Verify the income", DocumentFormat::StructuredText).is_none()
        );
    }

    #[test]
    fn test_markup_headings() {
        let md = match_heading("## Credit Score", DocumentFormat::Markup).unwrap();
        assert_eq!(md.level, 2);
        assert_eq!(md.rule, HeadingRule::Markdown);

        let numbered = match_heading("# 3.1.2 Gift Funds", DocumentFormat::Markup).unwrap();
        assert_eq!(numbered.level, 3);
        assert_eq!(numbered.title, "Gift Funds");

        let html = match_heading("<h2 class=\"x\">Income <b>Rules</b></h2>", DocumentFormat::Markup)
            .unwrap();
        assert_eq!(html.level, 2);
        assert_eq!(html.title, "Income Rules");

        // Markdown syntax means nothing in structured text.
        assert!(match_heading("## Credit Score", DocumentFormat::StructuredText).is_none());
    }

    #[test]
    fn test_all_caps_heading_is_low_confidence() {
        let m = match_heading("INCOME DOCUMENTATION", DocumentFormat::FlowedPdf).unwrap();
        assert_eq!(m.rule, HeadingRule::AllCaps);
        assert!(m.confidence < 0.5);
    }

    #[test]
    fn test_toc_entries() {
        assert!(is_toc_anchor("Table of Contents"));
        assert!(is_toc_anchor("  CONTENTS  "));

        let e = parse_toc_entry("1.1 Age Requirements ........ 3").unwrap();
        assert_eq!(
            e,
            TocEntry {
                numbering: "1.1".to_string(),
                title: "Age Requirements".to_string(),
                page: 3,
                level: 2,
            }
        );

        let c = parse_toc_entry("Chapter 2: Income    7").unwrap();
        assert_eq!(c.level, 1);
        assert_eq!(c.numbering, "2");
        assert_eq!(c.title, "Income");

        assert!(parse_toc_entry("Civil Rights ..... 3").is_none());
    }

    #[test]
    fn test_page_markers() {
        assert_eq!(page_marker("Page 3 of 10"), Some(3));
        assert_eq!(page_marker("- 12 -"), Some(12));
        assert_eq!(page_marker("12 months of reserves"), None);
    }

    #[test]
    fn test_comparisons() {
        let found = comparisons("The borrower must be at least 18 years old.");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].operator, ComparisonOp::Gte);
        assert_eq!(found[0].value, 18.0);
        assert_eq!(found[0].unit.as_deref(), Some("years"));

        let dti = comparisons("The DTI ratio must not exceed 43%.");
        assert_eq!(dti[0].operator, ComparisonOp::Lte);
        assert_eq!(dti[0].unit.as_deref(), Some("%"));

        let ltv = comparisons("If the LTV exceeds 80%, mortgage insurance is required.");
        assert_eq!(ltv[0].operator, ComparisonOp::Gt);

        let amount = comparisons("Loan amounts greater than or equal to $1,500,000 need two appraisals.");
        assert_eq!(amount[0].operator, ComparisonOp::Gte);
        assert_eq!(amount[0].value, 1_500_000.0);

        let symbol = comparisons("Credit score >= 620");
        assert_eq!(symbol[0].operator, ComparisonOp::Gte);
        assert_eq!(symbol[0].value, 620.0);
    }

    #[test]
    fn test_outcomes() {
        assert_eq!(
            find_outcome("Such applications are declined.").map(|o| o.0),
            Some(OutcomeKind::Decline)
        );
        assert_eq!(
            find_outcome("The borrower is not eligible.").map(|o| o.0),
            Some(OutcomeKind::Decline)
        );
        assert_eq!(
            find_outcome("Refer the file to an underwriter for review.").map(|o| o.0),
            Some(OutcomeKind::Refer)
        );
        assert_eq!(
            find_outcome("The loan may be approved.").map(|o| o.0),
            Some(OutcomeKind::Approve)
        );
        assert_eq!(
            find_outcome("Approve with conditions when reserves are short.").map(|o| o.0),
            Some(OutcomeKind::Other("CONDITIONAL_APPROVE".to_string()))
        );
        // A cross reference is not a referral.
        assert_eq!(find_outcome("Refer to Section 2.1 for details."), None);
    }

    #[test]
    fn test_decision_score() {
        let body = body_signals("The applicant must be at least 18 years old.");
        let score = decision_score(&body);
        assert!(score > 0.85, "score {score}");

        let title_only = title_signals("Eligibility");
        assert!(decision_score(&title_only) < 0.5);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(precedence_hint("First, verify the credit score."), Some(Precedence::First));
        assert_eq!(precedence_hint("Otherwise, decline."), Some(Precedence::Otherwise));
        assert_eq!(precedence_hint("Finally check reserves"), Some(Precedence::Final));
        assert_eq!(precedence_hint("The borrower must..."), None);
    }

    #[test]
    fn test_cross_references() {
        let refs = cross_references(
            "See Section 2.1 for income. Subject to Section 4, gifts are allowed. Chapter 3 covers assets.",
        );
        assert_eq!(refs.len(), 3);
        assert!(refs[0].explicit);
        assert_eq!(refs[0].numbering, "2.1");
        assert!(refs[1].conditional);
        assert!(!refs[2].explicit);
        assert_eq!(refs[2].target_kind, "chapter");
    }

    #[test]
    fn test_external_documents() {
        let docs = external_documents("Gift letters must comply; see the Seller Guide and per FHA Handbook rules.");
        assert_eq!(docs, vec!["Seller Guide".to_string(), "FHA Handbook".to_string()]);
    }

    #[test]
    fn test_matrix_block() {
        let table = "LTV | 620-679 | 680+\n80% | Refer | Approve\n95% | Decline | Refer";
        assert!(is_matrix_block(table));
        assert!(!is_matrix_block("A normal paragraph of text."));
    }

    #[test]
    fn test_sentence_spans_cover_text() {
        let text = "Borrowers must be 18. The LTV is 80.5% max, e.g. for condos.\n\n- item one\n- item two";
        let spans = sentence_spans(text);
        let rebuilt: String = spans.iter().map(|(s, e)| &text[*s..*e]).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(&text[spans[0].0..spans[0].1], "Borrowers must be 18. ");
        assert!(text[spans[1].0..spans[1].1].contains("e.g. for condos."));
        assert_eq!(spans.len(), 4);
    }

    fn pieces(sentence: &str, max_len: usize) -> Vec<&str> {
        clause_spans(sentence, max_len)
            .into_iter()
            .map(|(s, e)| &sentence[s..e])
            .collect()
    }

    #[test]
    fn test_clause_spans() {
        let sentence = "alpha beta gamma, delta epsilon zeta; eta theta iota, kappa lambda";
        let spans = pieces(sentence, 20);
        assert_eq!(spans.concat(), sentence);
        assert!(spans.len() > 1);
        assert!(spans.iter().all(|p| p.len() <= 20));
        assert_eq!(spans[0], "alpha beta gamma, ");
    }

    #[test]
    fn test_clause_spans_separator_past_the_limit() {
        assert_eq!(pieces("aaaa, bbbbbbbb", 4), vec!["aaaa", ", ", "bbbb", "bbbb"]);

        let sentence = format!("{}then records the outcome, and closes it", "word ".repeat(260));
        let spans = pieces(&sentence, 1024);
        assert_eq!(spans.concat(), sentence);
        assert!(spans.iter().all(|p| p.len() <= 1024));
        assert!(spans[0].ends_with(' '));
    }

    #[test]
    fn test_clause_spans_multibyte_text() {
        let sentence = "né ".repeat(40);
        let spans = pieces(&sentence, 10);
        assert_eq!(spans.concat(), sentence);
        assert!(spans.iter().all(|p| p.len() <= 10));
    }

    #[test]
    fn test_garbled() {
        assert!(is_garbled("\u{FFFD}\u{FFFD}#@~^\u{FFFD}\u{FFFD}~~^^"));
        assert!(!is_garbled("The borrower must document income."));
    }

    #[test]
    fn test_significant_terms_overlap() {
        let a = significant_terms("Credit score requirements for borrowers");
        let b = significant_terms("Minimum credit score for all borrowers");
        assert!(term_overlap(&a, &b) > 0.3);
    }
}
