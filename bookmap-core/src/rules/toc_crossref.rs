//! Cross-reference of parsed TOC entries against the built division tree.

use crate::config::TocConfig;
use crate::sources::page_at;
use crate::text::{char_len, common_prefix_len, normalize_title};
use crate::tree::DivisionTree;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Containment never outranks a solid prefix match.
const CONTAINMENT_CEILING: f64 = 0.55;
const OFF_BY_ONE_FACTOR: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocMatch {
    pub toc_index: usize,
    pub toc_title: String,
    pub page_number: u32,
    pub division_id: DivisionId,
    pub division_title: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TocCrossReference {
    pub matches: Vec<TocMatch>,
    /// TOC entries with no division: likely missed headings
    pub missed: Vec<TocEntry>,
    /// Digestible, non-oracle divisions no TOC entry points at
    pub false_positives: Vec<DivisionId>,
}

pub struct TocCrossReferenceRule<'a> {
    config: &'a TocConfig,
}

impl<'a> TocCrossReferenceRule<'a> {
    pub fn new(config: &'a TocConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        "TocCrossReference"
    }

    /// Title similarity in `[0, 1]`, before the page-distance factor.
    pub fn title_score(&self, toc_title: &str, division_title: &str) -> f64 {
        let a = normalize_title(toc_title);
        let b = normalize_title(division_title);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }

        let (len_a, len_b) = (char_len(&a), char_len(&b));
        let (shorter, longer) = (len_a.min(len_b), len_a.max(len_b));
        let shared = common_prefix_len(&a, &b);

        let prefix_score = if shared >= self.config.min_shared_prefix
            || (shorter < self.config.short_title_chars && shared * 2 > shorter)
        {
            0.5 + 0.5 * shared as f64 / longer as f64
        } else {
            0.0
        };
        let containment_score = if a.contains(&b) || b.contains(&a) {
            (0.3 + 0.25 * shorter as f64 / longer as f64).min(CONTAINMENT_CEILING)
        } else {
            0.0
        };
        prefix_score.max(containment_score)
    }

    pub fn apply(&self, tree: &DivisionTree, pages: &[PageRecord], entries: &[TocEntry]) -> TocCrossReference {
        let mut report = TocCrossReference::default();
        if entries.is_empty() {
            return report;
        }

        // (division, printed page, volume) for divisions whose start page is known
        let placed: Vec<(&DivisionNode, u32, u32)> = tree
            .nodes
            .iter()
            .filter_map(|node| {
                let page = page_at(pages, node.start_seq_index)?;
                Some((node, page.printed_number()?, page.volume))
            })
            .collect();

        let mut matched: BTreeSet<DivisionId> = BTreeSet::new();
        for (toc_index, entry) in entries.iter().enumerate() {
            let best = placed
                .iter()
                .filter_map(|(node, printed, volume)| {
                    let distance = printed.abs_diff(entry.page_number);
                    if distance > self.config.page_tolerance {
                        return None;
                    }
                    let mut score = self.title_score(&entry.title, &node.title);
                    if distance > 0 {
                        score *= OFF_BY_ONE_FACTOR;
                    }
                    Some((*node, score, *volume == entry.volume))
                })
                .filter(|(_, score, _)| *score >= self.config.min_match_score)
                .max_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then(a.2.cmp(&b.2))
                        .then(b.0.id.cmp(&a.0.id))
                });

            match best {
                Some((node, score, _)) => {
                    matched.insert(node.id);
                    report.matches.push(TocMatch {
                        toc_index,
                        toc_title: entry.title.clone(),
                        page_number: entry.page_number,
                        division_id: node.id,
                        division_title: node.title.clone(),
                        score,
                    });
                }
                None => {
                    debug!("TOC entry {:?} (p. {}) has no division", entry.title, entry.page_number);
                    report.missed.push(entry.clone());
                }
            }
        }

        report.false_positives = tree
            .nodes
            .iter()
            .filter(|n| !matched.contains(&n.id))
            .filter(|n| n.digestible == Digestibility::True)
            .filter(|n| n.detection_method != DetectionMethod::OracleDiscovered)
            .map(|n| n.id)
            .collect();

        info!(
            "{}: {} matched, {} missed, {} unreferenced divisions",
            self.name(),
            report.matches.len(),
            report.missed.len(),
            report.false_positives.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, page: u32) -> TocEntry {
        TocEntry {
            title: title.to_string(),
            page_number: page,
            indent_level: 0,
            line_index: 0,
            source_seq_index: 0,
            volume: 1,
        }
    }

    fn book() -> (DivisionTree, Vec<PageRecord>) {
        // printed page = seq + 1
        let pages: Vec<PageRecord> = (0..40).map(|i| PageRecord::new(i, 1, i as u32 + 1, "")).collect();
        let mut nodes = vec![
            DivisionNode::new(0, "كتاب الطهارة", 4),
            DivisionNode::new(1, "باب المياه", 9),
            DivisionNode::new(2, "فصل في الآبار", 14),
            DivisionNode::new(3, "فائدة", 20),
        ];
        nodes[3].detection_method = DetectionMethod::OracleDiscovered;
        let mut tree = DivisionTree::new(nodes, (0, 39));
        tree.stabilize(4);
        (tree, pages)
    }

    #[test]
    fn exact_title_on_expected_page_scores_one() {
        let config = TocConfig::default();
        let rule = TocCrossReferenceRule::new(&config);
        let (tree, pages) = book();
        let report = rule.apply(&tree, &pages, &[entry("كتاب الطهارة", 5)]);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].division_id, 0);
        assert_eq!(report.matches[0].score, 1.0);
    }

    #[test]
    fn off_by_one_page_is_tolerated_at_a_discount() {
        let config = TocConfig::default();
        let rule = TocCrossReferenceRule::new(&config);
        let (tree, pages) = book();
        let report = rule.apply(&tree, &pages, &[entry("باب المياه", 11), entry("باب المياه", 13)]);
        assert_eq!(report.matches.len(), 1);
        assert!((report.matches[0].score - 0.95).abs() < 1e-9);
        assert_eq!(report.missed.len(), 1);
        assert_eq!(report.missed[0].page_number, 13);
    }

    #[test]
    fn diacritics_and_prefixes_still_match() {
        let config = TocConfig::default();
        let rule = TocCrossReferenceRule::new(&config);
        assert_eq!(rule.title_score("بَابُ المِيَاهِ", "باب المياه"), 1.0);

        let prefix = rule.title_score("فصل في الآبار", "فصل في الآبار والعيون");
        assert!(prefix > 0.5 && prefix < 1.0);

        let contained = rule.title_score("الآبار", "فصل في الآبار");
        assert!(contained > 0.0 && contained <= CONTAINMENT_CEILING);
        assert_eq!(rule.title_score("الصلاة", "الزكاة"), 0.0);
    }

    #[test]
    fn unreferenced_divisions_are_false_positives_unless_oracle_found() {
        let config = TocConfig::default();
        let rule = TocCrossReferenceRule::new(&config);
        let (mut tree, pages) = book();
        tree.nodes[1].digestible = Digestibility::False;
        let report = rule.apply(&tree, &pages, &[entry("كتاب الطهارة", 5)]);
        // 1 is not digestible, 3 was found by the oracle
        assert_eq!(report.false_positives, vec![2]);
    }

    #[test]
    fn no_toc_means_no_findings() {
        let config = TocConfig::default();
        let rule = TocCrossReferenceRule::new(&config);
        let (tree, pages) = book();
        assert_eq!(rule.apply(&tree, &pages, &[]), TocCrossReference::default());
    }
}
