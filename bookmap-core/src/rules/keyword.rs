//! Pass 2: structural-keyword heuristics over page text.

use crate::config::KeywordScanConfig;
use crate::text::{collapse_whitespace, title_prefix, FoldedLine};
use crate::types::*;
use crate::vocabulary::{first_letter, CompiledVocabulary, FormKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;
use tracing::{debug, info};

/// Leader dots or an ellipsis followed by a page number at end of line
static TOC_TRAILER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:[.·•]\s*){3,}|…+\s*)[0-9٠-٩۰-۹]+\s*$").unwrap()
});

const SEPARATORS: &[char] = &[':', '-', '–', '—', '.', '،', '؛'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TocTrailer,
    Citation,
    GenericLongLine,
    LongLine,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub toc_trailer: usize,
    pub citation: usize,
    pub generic_long_line: usize,
    pub long_line: usize,
    pub duplicate: usize,
}

impl RejectionCounts {
    fn record(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::TocTrailer => self.toc_trailer += 1,
            RejectReason::Citation => self.citation += 1,
            RejectReason::GenericLongLine => self.generic_long_line += 1,
            RejectReason::LongLine => self.long_line += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineMatch {
    pub title: String,
    pub keyword_type: String,
    pub tier: u8,
    pub ordinal: Option<u32>,
    pub confidence: Confidence,
    pub inline_heading: bool,
    pub body_offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineVerdict {
    NotHeading,
    Rejected(RejectReason),
    Heading(LineMatch),
}

#[derive(Debug, Clone, Default)]
pub struct KeywordPassOutput {
    pub candidates: Vec<HeadingCandidate>,
    pub rejections: RejectionCounts,
    pub next_position: u64,
}

pub struct KeywordHeadingRule<'a> {
    config: &'a KeywordScanConfig,
    vocabulary: &'a CompiledVocabulary,
}

impl<'a> KeywordHeadingRule<'a> {
    pub fn new(config: &'a KeywordScanConfig, vocabulary: &'a CompiledVocabulary) -> Self {
        Self { config, vocabulary }
    }

    pub fn name(&self) -> &str {
        "KeywordHeadings"
    }

    /// Classifies one trimmed line. `previous` is the preceding non-empty line on the page.
    pub fn scan_line(&self, line: &str, previous: Option<&str>) -> LineVerdict {
        let folded = FoldedLine::new(line);
        let Some(start) = first_letter(&folded) else {
            return LineVerdict::NotHeading;
        };
        let Some(hit) = self.vocabulary.match_keyword(&folded, start) else {
            return LineVerdict::NotHeading;
        };

        if TOC_TRAILER.is_match(line) {
            return LineVerdict::Rejected(RejectReason::TocTrailer);
        }
        if previous.is_some_and(|p| self.vocabulary.ends_with_citation(p)) {
            return LineVerdict::Rejected(RejectReason::Citation);
        }

        let entry = self.vocabulary.entry(hit.entry);
        let mut at = folded.skip_spaces(hit.end);

        let ordinal = self.vocabulary.match_ordinal(&folded, at);
        if let Some(o) = ordinal {
            at = folded.skip_spaces(o.end);
        }

        let separator_at = folded
            .chars
            .get(at)
            .filter(|c| SEPARATORS.contains(c))
            .map(|_| at);
        if let Some(sep) = separator_at {
            at = folded.skip_spaces(sep + 1);
        }

        let trailing = folded.len().saturating_sub(at);
        let bare = folded
            .chars
            .get(at..)
            .map_or(true, |rest| rest.iter().all(|c| !c.is_alphanumeric()));
        let short_line = folded.len() <= self.config.short_line_max_chars;
        let title_fits = trailing <= self.config.max_title_chars;
        let generic_like = entry.generic || hit.kind != FormKind::Definite;

        if ordinal.is_none() && generic_like && !short_line {
            return LineVerdict::Rejected(RejectReason::GenericLongLine);
        }

        let preposition =
            separator_at.is_none() && self.vocabulary.match_preposition(&folded, at).is_some();
        let whole_line = || collapse_whitespace(line);
        let inline = |sep: usize| {
            let split = folded.original_offset(sep);
            (
                collapse_whitespace(&line[..split]),
                Some(folded.original_offset(at)),
            )
        };

        let (title, confidence, body_offset) = match (ordinal, separator_at) {
            (Some(_), _) if title_fits => (whole_line(), Confidence::High, None),
            (Some(_), Some(sep)) => {
                let (title, body) = inline(sep);
                (title, Confidence::Medium, body)
            }
            (Some(_), None) => (whole_line(), Confidence::Low, None),
            (None, _) if bare && short_line => (whole_line(), Confidence::Medium, None),
            (None, Some(_)) if title_fits => (whole_line(), Confidence::Medium, None),
            (None, None) if preposition && title_fits => (whole_line(), Confidence::Medium, None),
            (None, Some(sep)) => {
                let (title, body) = inline(sep);
                (title, Confidence::Medium, body)
            }
            (None, None) if short_line => (whole_line(), Confidence::Low, None),
            _ => return LineVerdict::Rejected(RejectReason::LongLine),
        };

        LineVerdict::Heading(LineMatch {
            title,
            keyword_type: entry.keyword_type.clone(),
            tier: entry.tier,
            ordinal: ordinal.map(|o| o.value),
            confidence,
            inline_heading: body_offset.is_some(),
            body_offset,
        })
    }

    /// Scans every non-TOC page. `existing` candidates (Pass 1) seed the dedup set.
    pub fn apply(
        &self,
        pages: &[PageRecord],
        existing: &[HeadingCandidate],
        skip_pages: &BTreeSet<usize>,
        start_position: u64,
    ) -> KeywordPassOutput {
        let mut output = KeywordPassOutput {
            next_position: start_position,
            ..Default::default()
        };
        if !self.config.enabled {
            return output;
        }

        let prefix_len = self.config.dedup_prefix_chars;
        let mut seen: HashSet<(usize, String)> = existing
            .iter()
            .filter_map(|c| Some((c.seq_index?, title_prefix(&c.title, prefix_len))))
            .collect();

        for page in pages {
            if page.flags.blank || skip_pages.contains(&page.seq_index) {
                continue;
            }
            let mut previous: Option<&str> = None;
            for line in page.text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match self.scan_line(line, previous) {
                    LineVerdict::Heading(found) => {
                        let key = (page.seq_index, title_prefix(&found.title, prefix_len));
                        if !seen.insert(key) {
                            output.rejections.duplicate += 1;
                        } else {
                            let mut candidate = HeadingCandidate::new(
                                &found.title,
                                Some(page.seq_index),
                                DetectionMethod::Keyword,
                                found.confidence,
                                output.next_position,
                            );
                            output.next_position += 1;
                            candidate.volume = page.volume;
                            candidate.page_hint = page.printed_number();
                            candidate.keyword_type = Some(found.keyword_type);
                            candidate.tier = Some(found.tier);
                            candidate.ordinal = found.ordinal;
                            candidate.inline_heading = found.inline_heading;
                            candidate.body_offset = found.body_offset;
                            output.candidates.push(candidate);
                        }
                    }
                    LineVerdict::Rejected(reason) => {
                        debug!("Rejected keyword line on seq {}: {:?}", page.seq_index, reason);
                        output.rejections.record(reason);
                    }
                    LineVerdict::NotHeading => {}
                }
                previous = Some(line);
            }
        }

        info!(
            "{}: {} candidates ({} duplicates skipped)",
            self.name(),
            output.candidates.len(),
            output.rejections.duplicate
        );
        output
    }
}
