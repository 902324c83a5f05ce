//! Pass 1: tagged headings from the source markup, aligned to the page sequence.

use crate::config::StructureConfig;
use crate::error::PreflightError;
use crate::sources::MarkupBlock;
use crate::text::normalize_title;
use crate::types::*;
use crate::vocabulary::CompiledVocabulary;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Positional(usize),
    Multimap(usize),
    LinearScan(usize),
    Unresolved,
}

impl Resolution {
    fn position(self) -> Option<usize> {
        match self {
            Resolution::Positional(i) | Resolution::Multimap(i) | Resolution::LinearScan(i) => {
                Some(i)
            }
            Resolution::Unresolved => None,
        }
    }
}

/// Walks blocks in order and keeps a cursor into the page sequence so that
/// repeated printed numbers resolve to the occurrence that follows the
/// previous block rather than the first one in the book.
struct PageResolver<'a> {
    pages: &'a [PageRecord],
    by_key: HashMap<(u32, u32), Vec<usize>>,
    cursor: Option<usize>,
    window: usize,
}

impl<'a> PageResolver<'a> {
    fn new(pages: &'a [PageRecord], window: usize) -> Self {
        let mut by_key: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (i, page) in pages.iter().enumerate() {
            if let Some(number) = page.printed_number() {
                by_key.entry((page.volume, number)).or_default().push(i);
            }
        }
        Self {
            pages,
            by_key,
            cursor: None,
            window: window.max(1),
        }
    }

    fn matches(&self, i: usize, volume: Option<u32>, number: u32) -> bool {
        let page = &self.pages[i];
        page.printed_number() == Some(number) && volume.map_or(true, |v| page.volume == v)
    }

    /// `advance` is true when the block carries its own marker, i.e. starts a new page.
    fn resolve(&mut self, volume: Option<u32>, number: u32, advance: bool) -> Resolution {
        if let Some(c) = self.cursor {
            if !advance && self.matches(c, volume, number) {
                return Resolution::Positional(c);
            }
        }

        let start = self.cursor.map_or(0, |c| c + 1);
        let end = (start + self.window).min(self.pages.len());
        if let Some(i) = (start..end).find(|&i| self.matches(i, volume, number)) {
            self.cursor = Some(i);
            return Resolution::Positional(i);
        }
        if let Some(c) = self.cursor {
            if self.matches(c, volume, number) {
                return Resolution::Positional(c);
            }
        }

        if let Some(v) = volume {
            if let Some(&first) = self.by_key.get(&(v, number)).and_then(|hits| hits.first()) {
                self.cursor = Some(first);
                return Resolution::Multimap(first);
            }
        }

        if let Some(i) = self
            .pages
            .iter()
            .position(|p| p.printed_number() == Some(number))
        {
            self.cursor = Some(i);
            return Resolution::LinearScan(i);
        }

        Resolution::Unresolved
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaggedPassOutput {
    pub candidates: Vec<HeadingCandidate>,
    /// seq_index of pages headed by a table-of-contents label
    pub toc_pages: BTreeSet<usize>,
    pub stats: MappingStats,
    /// document_position to hand to the next pass
    pub next_position: u64,
}

pub struct TaggedHeadingRule<'a> {
    config: &'a StructureConfig,
    vocabulary: &'a CompiledVocabulary,
    toc_labels: HashSet<String>,
}

impl<'a> TaggedHeadingRule<'a> {
    pub fn new(config: &'a StructureConfig, vocabulary: &'a CompiledVocabulary) -> Self {
        let toc_labels = config.toc.labels.iter().map(|l| normalize_title(l)).collect();
        Self {
            config,
            vocabulary,
            toc_labels,
        }
    }

    pub fn name(&self) -> &str {
        "TaggedHeadings"
    }

    pub fn apply(
        &self,
        blocks: &[MarkupBlock],
        pages: &[PageRecord],
        start_position: u64,
    ) -> Result<TaggedPassOutput, PreflightError> {
        let mut resolver = PageResolver::new(pages, self.config.tagged.alignment_window);
        let mut stats = MappingStats {
            total_blocks: blocks.len(),
            ..Default::default()
        };

        let resolutions: Vec<Resolution> = blocks
            .iter()
            .map(|block| {
                let resolution = match block.page_number {
                    Some(number) => resolver.resolve(block.volume, number, block.has_marker),
                    None => Resolution::Unresolved,
                };
                match resolution {
                    Resolution::Positional(_) => stats.positional_hits += 1,
                    Resolution::Multimap(_) => stats.multimap_hits += 1,
                    Resolution::LinearScan(_) => stats.linear_scan_hits += 1,
                    Resolution::Unresolved => {}
                }
                resolution
            })
            .collect();

        stats.mapped_blocks = resolutions.iter().filter(|r| r.position().is_some()).count();
        self.preflight(&stats)?;

        let mut output = TaggedPassOutput {
            stats,
            next_position: start_position,
            ..Default::default()
        };

        for (block, resolution) in blocks.iter().zip(&resolutions) {
            for heading in &block.headings {
                let position = output.next_position;
                output.next_position += 1;
                output.stats.headings_found += 1;

                let Some(page) = resolution.position().map(|i| &pages[i]) else {
                    output.stats.unresolved_headings += 1;
                    debug!(
                        "Dropping tagged heading {:?} from block {}: page not resolved",
                        heading, block.index
                    );
                    continue;
                };

                let mut candidate = HeadingCandidate::new(
                    heading,
                    Some(page.seq_index),
                    DetectionMethod::Tagged,
                    Confidence::Confirmed,
                    position,
                );
                candidate.volume = page.volume;
                candidate.page_hint = page.printed_number();
                if let Some(class) = self.vocabulary.classify_title(heading) {
                    candidate.keyword_type = Some(class.keyword_type);
                    candidate.tier = Some(class.tier);
                    candidate.ordinal = class.ordinal;
                }
                if self.toc_labels.contains(&normalize_title(heading)) {
                    candidate.toc_label = true;
                    output.toc_pages.insert(page.seq_index);
                }
                output.candidates.push(candidate);
            }
        }

        output
            .toc_pages
            .extend(pages.iter().filter(|p| p.flags.toc).map(|p| p.seq_index));

        info!(
            "{}: {} headings kept, {} unresolved, {}/{} blocks mapped",
            self.name(),
            output.candidates.len(),
            output.stats.unresolved_headings,
            output.stats.mapped_blocks,
            output.stats.total_blocks
        );
        Ok(output)
    }

    fn preflight(&self, stats: &MappingStats) -> Result<(), PreflightError> {
        if stats.total_blocks == 0 {
            return Ok(());
        }
        let ratio = stats.mapped_ratio();
        if ratio < self.config.preflight.min_mapped_ratio {
            return Err(PreflightError::MappingRatioTooLow {
                mapped: stats.mapped_blocks,
                total: stats.total_blocks,
                percent: ratio * 100.0,
                minimum_percent: self.config.preflight.min_mapped_ratio * 100.0,
            });
        }
        if ratio < self.config.preflight.warn_mapped_ratio {
            warn!(
                "Only {:.1}% of source blocks map to known pages; tagged headings may be incomplete",
                ratio * 100.0
            );
        }
        Ok(())
    }
}
