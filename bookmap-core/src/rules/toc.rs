//! Pass 1.5: parse dot-leader table-of-contents lines.

use crate::config::TocConfig;
use crate::sources::pages::page_position;
use crate::text::{collapse_whitespace, normalize_title, parse_number};
use crate::types::{PageRecord, TocEntry};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;
use tracing::{debug, info};

static TOC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<indent>[ \t\u{00A0}]*)(?P<title>\S.*?)\s*(?:[.·…]\s*){3,}(?P<page>[0-9٠-٩۰-۹]+)\s*$",
    )
    .unwrap()
});

#[derive(Debug, Clone, Default)]
pub struct TocPassOutput {
    pub entries: Vec<TocEntry>,
    pub pages_scanned: usize,
}

pub struct TocParser<'a> {
    config: &'a TocConfig,
    labels: HashSet<String>,
}

fn indent_width(indent: &str) -> usize {
    indent.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum()
}

impl<'a> TocParser<'a> {
    pub fn new(config: &'a TocConfig) -> Self {
        Self {
            config,
            labels: config.labels.iter().map(|l| normalize_title(l)).collect(),
        }
    }

    /// Pages whose first non-empty line is a TOC label; consulted only with
    /// `detect_label_pages` when no TOC page is known.
    pub fn label_pages(&self, pages: &[PageRecord]) -> BTreeSet<usize> {
        pages
            .iter()
            .filter(|p| {
                p.text
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .is_some_and(|l| self.labels.contains(&normalize_title(l)))
            })
            .map(|p| p.seq_index)
            .collect()
    }

    pub fn parse_page(&self, page: &PageRecord) -> Vec<(usize, TocEntry)> {
        page.text
            .lines()
            .enumerate()
            .filter_map(|(line_index, line)| {
                let caps = TOC_LINE.captures(line)?;
                let title = collapse_whitespace(caps.name("title")?.as_str());
                if title.is_empty() {
                    return None;
                }
                let page_number = parse_number(caps.name("page")?.as_str())?;
                let width = caps.name("indent").map_or(0, |m| indent_width(m.as_str()));
                Some((
                    width,
                    TocEntry {
                        title,
                        page_number,
                        indent_level: 0,
                        line_index,
                        source_seq_index: page.seq_index,
                        volume: page.volume,
                    },
                ))
            })
            .collect()
    }

    pub fn apply(&self, pages: &[PageRecord], toc_pages: &BTreeSet<usize>) -> TocPassOutput {
        if !self.config.enabled {
            return TocPassOutput::default();
        }

        let toc_pages = if toc_pages.is_empty() && self.config.detect_label_pages {
            self.label_pages(pages)
        } else {
            toc_pages.clone()
        };
        let (Some(first), Some(last)) = (toc_pages.first(), toc_pages.last()) else {
            debug!("No table-of-contents pages; skipping TOC pass");
            return TocPassOutput::default();
        };
        let (Some(start), Some(last_pos)) = (page_position(pages, *first), page_position(pages, *last))
        else {
            return TocPassOutput::default();
        };
        let end = (last_pos + self.config.lookahead_pages).min(pages.len().saturating_sub(1));

        let mut raw: Vec<(usize, TocEntry)> = Vec::new();
        let mut consecutive_empty = 0;
        let mut pages_scanned = 0;
        for page in &pages[start..=end] {
            pages_scanned += 1;
            let found = self.parse_page(page);
            if found.is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= self.config.zero_match_cutoff {
                    debug!(
                        "TOC scan stopped at seq {} after {} empty pages",
                        page.seq_index, consecutive_empty
                    );
                    break;
                }
            } else {
                consecutive_empty = 0;
                raw.extend(found);
            }
        }

        // Indent widths become levels by rank: the shallowest indent is level 0
        let widths: BTreeSet<usize> = raw.iter().map(|(w, _)| *w).collect();
        let entries: Vec<TocEntry> = raw
            .into_iter()
            .map(|(width, mut entry)| {
                entry.indent_level = widths.range(..width).count();
                entry
            })
            .collect();

        info!(
            "TOC pass: {} entries from {} pages",
            entries.len(),
            pages_scanned
        );
        TocPassOutput {
            entries,
            pages_scanned,
        }
    }
}
