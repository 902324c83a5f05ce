//! Structure report: counts, passage size statistics and review summaries,
//! plus the markdown review document rendered from it.

use crate::cache::versions;
use crate::config::{SizeUnit, StructureConfig};
use crate::oracle::DiscoveryStats;
use crate::overrides::OverrideOutcome;
use crate::passages::PassageSet;
use crate::rules::{OrdinalWarning, RejectionCounts, TocCrossReference};
use crate::storage::calculate_config_hash;
use crate::tree::{BuildReport, DivisionTree};
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

const HISTOGRAM_BINS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub range_start: u32,
    /// Exclusive
    pub range_end: u32,
    pub count: usize,
    pub size_sum: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeHistogram {
    pub bins: Vec<HistogramBin>,
    pub total_count: usize,
    pub total_size: usize,
    pub min: u32,
    pub max: u32,
    pub mean: f32,
    pub median: f32,
    /// Start of the fullest bin
    pub mode: Option<u32>,
    pub variance: f32,
}

impl SizeHistogram {
    /// Equal-width bins over the observed range.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        if sizes.is_empty() {
            return Self::default();
        }

        let mut sorted = sizes.to_vec();
        sorted.sort_unstable();

        let min = sorted[0] as u32;
        let max = sorted[sorted.len() - 1] as u32;
        let total_size: usize = sorted.iter().sum();
        let total_count = sorted.len();

        let bins: Vec<HistogramBin> = Self::generate_adaptive_bins(min, max, HISTOGRAM_BINS)
            .into_iter()
            .map(|(range_start, range_end)| {
                let in_bin = sorted
                    .iter()
                    .filter(|&&size| (size as u32) >= range_start && (size as u32) < range_end);
                HistogramBin {
                    range_start,
                    range_end,
                    count: in_bin.clone().count(),
                    size_sum: in_bin.sum(),
                }
            })
            .collect();

        let mean = total_size as f32 / total_count as f32;
        let median = if total_count % 2 == 0 {
            let mid = total_count / 2;
            (sorted[mid - 1] + sorted[mid]) as f32 / 2.0
        } else {
            sorted[total_count / 2] as f32
        };
        let mode = bins
            .iter()
            .max_by(|a, b| a.count.cmp(&b.count).then(b.range_start.cmp(&a.range_start)))
            .map(|bin| bin.range_start);
        let variance = if total_count > 1 {
            sorted
                .iter()
                .map(|&size| (size as f32 - mean).powi(2))
                .sum::<f32>()
                / (total_count - 1) as f32
        } else {
            0.0
        };

        Self {
            bins,
            total_count,
            total_size,
            min,
            max,
            mean,
            median,
            mode,
            variance,
        }
    }

    fn generate_adaptive_bins(min_val: u32, max_val: u32, target_bins: usize) -> Vec<(u32, u32)> {
        if min_val >= max_val {
            return vec![(min_val, min_val + 1)];
        }

        let range = max_val - min_val;
        let bin_width = ((range as f32 / target_bins as f32).ceil() as u32).max(1);

        let mut bins = Vec::new();
        let mut current = min_val;
        while current <= max_val {
            let end = (current + bin_width).min(max_val + 1);
            bins.push((current, end));
            current = end;
        }
        bins
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TocSummary {
    pub entries: usize,
    pub matched: usize,
    pub missed: Vec<TocEntry>,
    pub unreferenced_divisions: Vec<DivisionId>,
    pub mean_match_score: f64,
}

impl TocSummary {
    fn new(entries: usize, crossref: &TocCrossReference) -> Self {
        let mean_match_score = if crossref.matches.is_empty() {
            0.0
        } else {
            crossref.matches.iter().map(|m| m.score).sum::<f64>() / crossref.matches.len() as f64
        };
        Self {
            entries,
            matched: crossref.matches.len(),
            missed: crossref.missed.clone(),
            unreferenced_divisions: crossref.false_positives.clone(),
            mean_match_score,
        }
    }
}

/// Everything one run produced that the report summarizes.
pub struct RunSummary<'a> {
    pub book: &'a BookMetadata,
    pub config: &'a StructureConfig,
    pub pages: &'a [PageRecord],
    pub tree: &'a DivisionTree,
    pub passages: &'a PassageSet,
    pub passage_sizes: &'a [usize],
    pub toc_entries: &'a [TocEntry],
    pub toc: &'a TocCrossReference,
    pub ordinal_warnings: &'a [OrdinalWarning],
    pub mapping: &'a MappingStats,
    pub keyword_rejections: &'a RejectionCounts,
    pub discovery: &'a DiscoveryStats,
    pub build: &'a BuildReport,
    pub overrides: Option<&'a OverrideOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub bookmap_version: String,
    pub config_hash: String,
    pub book: BookMetadata,
    pub page_count: usize,

    pub division_count: usize,
    pub max_depth: u32,
    pub by_detection_method: BTreeMap<String, usize>,
    pub by_confidence: BTreeMap<String, usize>,
    pub by_division_type: BTreeMap<String, usize>,
    pub digestibility: BTreeMap<String, usize>,
    pub division_flags: BTreeMap<String, usize>,

    pub passage_count: usize,
    pub excluded_divisions: usize,
    pub passage_overlaps: usize,
    pub size_unit: SizeUnit,
    pub passage_sizes: SizeHistogram,
    pub passage_flags: BTreeMap<String, usize>,

    pub toc: TocSummary,
    pub ordinal_warnings: Vec<OrdinalWarning>,
    pub mapping: MappingStats,
    pub keyword_rejections: RejectionCounts,
    pub discovery: DiscoveryStats,
    pub fallback_taken: bool,
    pub fallback_reason: Option<String>,
    pub tree_build: BuildReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverrideOutcome>,
}

fn tally<'a>(keys: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for key in keys {
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
    counts
}

impl StructureReport {
    pub fn compose(run: &RunSummary) -> Result<Self> {
        let nodes = &run.tree.nodes;
        let passages = &run.passages.passages;
        Ok(Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            bookmap_version: versions::BOOKMAP_VERSION.to_string(),
            config_hash: calculate_config_hash(run.config)?,
            book: run.book.clone(),
            page_count: run.pages.len(),

            division_count: nodes.len(),
            max_depth: run.tree.max_depth(),
            by_detection_method: tally(nodes.iter().map(|n| n.detection_method.as_str())),
            by_confidence: tally(nodes.iter().map(|n| n.confidence.as_str())),
            by_division_type: tally(nodes.iter().map(|n| n.division_type.as_str())),
            digestibility: tally(nodes.iter().map(|n| n.digestible.as_str())),
            division_flags: tally(nodes.iter().flat_map(|n| n.flags.iter().map(|f| f.as_str()))),

            passage_count: passages.len(),
            excluded_divisions: run.passages.excluded_divisions,
            passage_overlaps: run.passages.overlaps,
            size_unit: run.config.passages.size_unit,
            passage_sizes: SizeHistogram::from_sizes(run.passage_sizes),
            passage_flags: tally(passages.iter().flat_map(|p| p.review_flags.iter().map(|f| f.as_str()))),

            toc: TocSummary::new(run.toc_entries.len(), run.toc),
            ordinal_warnings: run.ordinal_warnings.to_vec(),
            mapping: run.mapping.clone(),
            keyword_rejections: run.keyword_rejections.clone(),
            discovery: run.discovery.clone(),
            fallback_taken: run.discovery.fallback_reason.is_some(),
            fallback_reason: run.discovery.fallback_reason.clone(),
            tree_build: run.build.clone(),
            overrides: run.overrides.cloned(),
        })
    }

    pub fn save_to_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write structure report {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read structure report {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Table cells cannot hold raw pipes or newlines.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn flag_list(flags: &std::collections::BTreeSet<ReviewFlag>) -> String {
    flags.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
}

fn counts_line(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Markdown for the human review round.
pub fn render_review(report: &StructureReport, tree: &DivisionTree, passages: &[PassageRecord]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Structure review: {}\n\n", report.book.title));
    if let Some(author) = &report.book.author {
        out.push_str(&format!("Author: {author}  \n"));
    }
    out.push_str(&format!(
        "Run `{}` at {} (bookmap {})\n\n",
        report.run_id,
        report.generated_at.to_rfc3339(),
        report.bookmap_version
    ));

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- Pages: {}\n", report.page_count));
    out.push_str(&format!(
        "- Divisions: {} (max depth {})\n",
        report.division_count, report.max_depth
    ));
    out.push_str(&format!("- Detection: {}\n", counts_line(&report.by_detection_method)));
    out.push_str(&format!("- Confidence: {}\n", counts_line(&report.by_confidence)));
    out.push_str(&format!("- Digestible: {}\n", counts_line(&report.digestibility)));
    out.push_str(&format!(
        "- Passages: {} ({} divisions excluded, {} overlaps)\n",
        report.passage_count, report.excluded_divisions, report.passage_overlaps
    ));
    let unit = match report.size_unit {
        SizeUnit::Pages => "pages",
        SizeUnit::Words => "words",
    };
    let sizes = &report.passage_sizes;
    out.push_str(&format!(
        "- Passage size ({unit}): min {}, max {}, mean {:.1}, median {:.1}\n",
        sizes.min, sizes.max, sizes.mean, sizes.median
    ));
    out.push_str(&format!(
        "- Source mapping: {}/{} blocks ({:.1}%)\n",
        report.mapping.mapped_blocks,
        report.mapping.total_blocks,
        report.mapping.mapped_ratio() * 100.0
    ));
    match &report.fallback_reason {
        Some(reason) => {
            out.push_str(&format!("- Oracle: not used, deterministic tree ({reason})\n"));
        }
        None => {
            out.push_str(&format!(
                "- Oracle: {} ({} calls, {} new divisions)\n",
                report.discovery.oracle.as_deref().unwrap_or("unknown"),
                report.discovery.calls,
                report.discovery.new_divisions
            ));
        }
    }
    out.push('\n');

    let flagged: Vec<&DivisionNode> = tree
        .depth_first()
        .into_iter()
        .map(|id| &tree.nodes[id])
        .filter(|n| !n.flags.is_empty())
        .collect();
    out.push_str("## Divisions to review\n\n");
    if flagged.is_empty() {
        out.push_str("Nothing flagged.\n\n");
    } else {
        out.push_str("| id | title | seq | method | flags |\n|---|---|---|---|---|\n");
        for node in flagged {
            out.push_str(&format!(
                "| {} | {} | {}..{} | {} | {} |\n",
                node.id,
                cell(&node.title),
                node.start_seq_index,
                node.end_seq_index,
                node.detection_method,
                flag_list(&node.flags)
            ));
        }
        out.push('\n');
    }

    let long: Vec<&PassageRecord> = passages
        .iter()
        .filter(|p| {
            p.review_flags.contains(&ReviewFlag::LongPassage)
                || p.review_flags.contains(&ReviewFlag::OverlapDetected)
        })
        .collect();
    if !long.is_empty() {
        out.push_str("## Passages to review\n\n");
        out.push_str("| passage | title | pages | flags |\n|---|---|---|---|\n");
        for passage in long {
            out.push_str(&format!(
                "| {} | {} | {}-{} ({}) | {} |\n",
                passage.passage_id,
                cell(&passage.title),
                passage.start_page_label,
                passage.end_page_label,
                passage.page_count,
                flag_list(&passage.review_flags)
            ));
        }
        out.push('\n');
    }

    if report.toc.entries > 0 {
        out.push_str(&format!(
            "## Table of contents\n\n{} of {} entries matched a division (mean score {:.2}).\n\n",
            report.toc.matched, report.toc.entries, report.toc.mean_match_score
        ));
        if !report.toc.missed.is_empty() {
            out.push_str("Entries with no division (possible missed headings):\n\n");
            for entry in &report.toc.missed {
                out.push_str(&format!("- {} (p. {})\n", entry.title, entry.page_number));
            }
            out.push('\n');
        }
    }

    if !report.ordinal_warnings.is_empty() {
        out.push_str("## Ordinal gaps\n\n");
        for warning in &report.ordinal_warnings {
            out.push_str(&format!(
                "- division {} \"{}\": {} {} where {} was expected\n",
                warning.division_id, warning.title, warning.keyword_type, warning.actual, warning.expected
            ));
        }
        out.push('\n');
    }

    if let Some(overrides) = &report.overrides {
        out.push_str(&format!(
            "## Overrides\n\n{} applied, {} skipped.\n\n",
            overrides.applied.len(),
            overrides.skipped.len()
        ));
        for skipped in &overrides.skipped {
            out.push_str(&format!(
                "- #{} {} {}: {}\n",
                skipped.entry_index,
                skipped.action.as_str(),
                skipped.id,
                skipped.reason
            ));
        }
        if !overrides.skipped.is_empty() {
            out.push('\n');
        }
    }

    out.push_str("## Outline\n\n");
    for id in tree.depth_first() {
        let node = &tree.nodes[id];
        let indent = "  ".repeat(node.level.saturating_sub(1) as usize);
        let marker = if node.digestible == Digestibility::False { " ~~skipped~~" } else { "" };
        out.push_str(&format!(
            "{}- [{}] {} ({}..{}){}\n",
            indent, node.id, node.title, node.start_seq_index, node.end_seq_index, marker
        ));
    }
    out
}
