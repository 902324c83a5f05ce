use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Divisions live in an arena; an id is the node's index in that arena.
pub type DivisionId = usize;

/// The schema version stamped on every artifact.
/// Bump this when the output shape changes.
pub const SCHEMA_VERSION: &str = "0.1.0";

// ===== PAGE SOURCE =====
// Produced by the normalization stage. Read-only here.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags {
    /// Page was recognised upstream as part of a table of contents
    #[serde(default)]
    pub toc: bool,
    #[serde(default)]
    pub blank: bool,
    #[serde(default)]
    pub front_matter: bool,
}

fn default_volume() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Unique, strictly increasing document-order position
    pub seq_index: usize,
    #[serde(default = "default_volume")]
    pub volume: u32,
    /// Printed page number as it appears in the book (either digit script)
    #[serde(default)]
    pub page_number_raw: String,
    /// Parsed printed page number
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub flags: PageFlags,
}

impl PageRecord {
    pub fn new(seq_index: usize, volume: u32, page_number: u32, text: &str) -> Self {
        Self {
            seq_index,
            volume,
            page_number_raw: page_number.to_string(),
            page_number: Some(page_number),
            text: text.to_string(),
            flags: PageFlags::default(),
        }
    }

    /// Printed number, parsed from the raw label when the upstream stage left it empty
    pub fn printed_number(&self) -> Option<u32> {
        self.page_number
            .or_else(|| crate::text::parse_number(&self.page_number_raw))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub book_id: Option<String>,
}

// ===== DETECTION ENUMS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Tagged,
    Keyword,
    OracleDiscovered,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Tagged => "tagged",
            DetectionMethod::Keyword => "keyword",
            DetectionMethod::OracleDiscovered => "oracle_discovered",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Confirmed,
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Confirmed => "confirmed",
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a division's content is eligible for semantic extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Digestibility {
    True,
    False,
    Uncertain,
}

impl Digestibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Digestibility::True => "true",
            Digestibility::False => "false",
            Digestibility::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for Digestibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review-only markers. Never block completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    UncertainDigestibility,
    LowConfidence,
    Oversized,
    ParentResolvedByPosition,
    HumanRejected,
    HasSamePageSubheadings,
    LongPassage,
    OverlapDetected,
    Merged,
    Preamble,
    RangeClamped,
}

impl ReviewFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewFlag::UncertainDigestibility => "uncertain_digestibility",
            ReviewFlag::LowConfidence => "low_confidence",
            ReviewFlag::Oversized => "oversized",
            ReviewFlag::ParentResolvedByPosition => "parent_resolved_by_position",
            ReviewFlag::HumanRejected => "human_rejected",
            ReviewFlag::HasSamePageSubheadings => "has_same_page_subheadings",
            ReviewFlag::LongPassage => "long_passage",
            ReviewFlag::OverlapDetected => "overlap_detected",
            ReviewFlag::Merged => "merged",
            ReviewFlag::Preamble => "preamble",
            ReviewFlag::RangeClamped => "range_clamped",
        }
    }
}

// ===== CANDIDATES =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadingCandidate {
    pub title: String,
    /// None when the heading's page could not be resolved
    pub seq_index: Option<usize>,
    pub volume: u32,
    /// Printed page number the heading was found on
    pub page_hint: Option<u32>,
    pub detection_method: DetectionMethod,
    pub confidence: Confidence,
    pub keyword_type: Option<String>,
    /// Vocabulary tier of the matched keyword (1 = outermost)
    pub tier: Option<u8>,
    pub ordinal: Option<u32>,
    pub inline_heading: bool,
    /// Byte offset into the heading line where body text starts (inline headings only)
    pub body_offset: Option<usize>,
    /// Global discovery counter, independent of seq_index
    pub document_position: u64,
    pub page_mapped: bool,
    /// Heading text equals a canonical table-of-contents label
    #[serde(default)]
    pub toc_label: bool,
    /// Index in the combined Pass 1 + Pass 2 list, assigned before sorting
    #[serde(default)]
    pub original_index: Option<usize>,
}

impl HeadingCandidate {
    pub fn new(
        title: &str,
        seq_index: Option<usize>,
        detection_method: DetectionMethod,
        confidence: Confidence,
        document_position: u64,
    ) -> Self {
        Self {
            title: title.to_string(),
            seq_index,
            volume: 1,
            page_hint: None,
            detection_method,
            confidence,
            keyword_type: None,
            tier: None,
            ordinal: None,
            inline_heading: false,
            body_offset: None,
            document_position,
            page_mapped: seq_index.is_some(),
            toc_label: false,
            original_index: None,
        }
    }

    /// Sort key shared by every stage: (seq_index, document_position)
    pub fn order_key(&self) -> (usize, u64) {
        (self.seq_index.unwrap_or(usize::MAX), self.document_position)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    /// Printed page number the entry points at
    pub page_number: u32,
    pub indent_level: usize,
    pub line_index: usize,
    /// Page the entry itself was read from
    pub source_seq_index: usize,
    pub volume: u32,
}

// ===== DIVISION TREE =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivisionNode {
    pub id: DivisionId,
    #[serde(rename = "type")]
    pub division_type: String,
    pub title: String,
    pub level: u32,
    pub detection_method: DetectionMethod,
    pub confidence: Confidence,
    pub digestible: Digestibility,
    pub content_type: String,
    pub start_seq_index: usize,
    pub end_seq_index: usize,
    pub parent_id: Option<DivisionId>,
    pub child_ids: Vec<DivisionId>,
    pub page_count: usize,
    pub ordinal: Option<u32>,
    pub keyword_type: Option<String>,
    pub inline_heading: bool,
    pub document_position: u64,
    pub flags: BTreeSet<ReviewFlag>,
    #[serde(default)]
    pub human_override: Vec<OverrideRecord>,
}

impl DivisionNode {
    pub fn new(id: DivisionId, title: &str, start_seq_index: usize) -> Self {
        Self {
            id,
            division_type: "section".to_string(),
            title: title.to_string(),
            level: 1,
            detection_method: DetectionMethod::Tagged,
            confidence: Confidence::Confirmed,
            digestible: Digestibility::True,
            content_type: "text".to_string(),
            start_seq_index,
            end_seq_index: start_seq_index,
            parent_id: None,
            child_ids: Vec::new(),
            page_count: 1,
            ordinal: None,
            keyword_type: None,
            inline_heading: false,
            document_position: id as u64,
            flags: BTreeSet::new(),
            human_override: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }

    pub fn span_contains(&self, seq_index: usize) -> bool {
        seq_index >= self.start_seq_index && seq_index <= self.end_seq_index
    }
}

// ===== PASSAGES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingAction {
    Kept,
    Merged,
    FlaggedLong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageRecord {
    pub passage_id: String,
    pub division_ids: Vec<DivisionId>,
    pub title: String,
    pub heading_path: Vec<String>,
    pub start_seq_index: usize,
    pub end_seq_index: usize,
    pub page_count: usize,
    pub volume: u32,
    pub start_page_label: String,
    pub end_page_label: String,
    pub content_type: String,
    pub sizing_action: SizingAction,
    pub review_flags: BTreeSet<ReviewFlag>,
    pub predecessor: Option<String>,
    pub successor: Option<String>,
}

// ===== OVERRIDE AUDIT =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    Reject,
    Confirm,
    Modify,
    Split,
}

impl OverrideAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideAction::Reject => "reject",
            OverrideAction::Confirm => "confirm",
            OverrideAction::Modify => "modify",
            OverrideAction::Split => "split",
        }
    }
}

/// Audit record kept on every node an override touched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub override_id: Uuid,
    pub action: OverrideAction,
    pub applied_at: DateTime<Utc>,
    pub detail: String,
    #[serde(default)]
    pub note: Option<String>,
}

// ===== PASS 1 MAPPING STATISTICS =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingStats {
    pub total_blocks: usize,
    pub mapped_blocks: usize,
    pub positional_hits: usize,
    pub multimap_hits: usize,
    pub linear_scan_hits: usize,
    pub headings_found: usize,
    pub unresolved_headings: usize,
}

impl MappingStats {
    pub fn mapped_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            1.0
        } else {
            self.mapped_blocks as f64 / self.total_blocks as f64
        }
    }
}
