//! Passage construction: the leaf-level page ranges handed to extraction.
//!
//! Leaves become passages, parents that open before their first child get a
//! preamble, and non-digestible subtrees are left out. Seeds that start on
//! the same page collapse into one passage; small seeds merge forward with
//! their siblings; long ones are flagged but never split.

use crate::config::{PassageConfig, SizeUnit};
use crate::sources::{page_at, pages_in_range};
use crate::text::word_count;
use crate::tree::DivisionTree;
use crate::types::*;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassageSet {
    pub passages: Vec<PassageRecord>,
    pub excluded_divisions: usize,
    pub overlaps: usize,
}

#[derive(Debug, Clone)]
struct Seed {
    anchor: DivisionId,
    division_ids: Vec<DivisionId>,
    start: usize,
    end: usize,
    /// Merges only happen between seeds sharing this
    group: Option<DivisionId>,
    content_type: String,
    flags: BTreeSet<ReviewFlag>,
    merged: bool,
}

pub struct PassageBuilder<'a> {
    config: &'a PassageConfig,
}

impl<'a> PassageBuilder<'a> {
    pub fn new(config: &'a PassageConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        "PassageBuilder"
    }

    pub fn calculate_size(&self, pages: &[PageRecord], start: usize, end: usize) -> usize {
        match self.config.size_unit {
            SizeUnit::Pages => end + 1 - start,
            SizeUnit::Words => pages_in_range(pages, start, end)
                .iter()
                .map(|p| word_count(&p.text))
                .sum(),
        }
    }

    fn excluded(tree: &DivisionTree, id: DivisionId) -> bool {
        std::iter::once(id)
            .chain(tree.ancestors(id))
            .any(|i| tree.nodes[i].digestible == Digestibility::False)
    }

    fn seeds(&self, tree: &DivisionTree) -> (Vec<Seed>, usize) {
        let mut seeds = Vec::new();
        let mut excluded = 0;
        for id in tree.depth_first() {
            if Self::excluded(tree, id) {
                excluded += 1;
                continue;
            }
            let node = &tree.nodes[id];
            let inherited: BTreeSet<ReviewFlag> = node
                .flags
                .iter()
                .copied()
                .filter(|f| *f != ReviewFlag::Oversized)
                .collect();

            match node.child_ids.first().map(|c| &tree.nodes[*c]) {
                None => seeds.push(Seed {
                    anchor: id,
                    division_ids: vec![id],
                    start: node.start_seq_index,
                    end: node.end_seq_index,
                    group: node.parent_id,
                    content_type: node.content_type.clone(),
                    flags: inherited,
                    merged: false,
                }),
                Some(first) if node.start_seq_index < first.start_seq_index => {
                    let mut flags = inherited;
                    flags.insert(ReviewFlag::Preamble);
                    seeds.push(Seed {
                        anchor: id,
                        division_ids: vec![id],
                        start: node.start_seq_index,
                        end: first.start_seq_index - 1,
                        group: Some(id),
                        content_type: node.content_type.clone(),
                        flags,
                        merged: false,
                    });
                }
                Some(_) => {}
            }
        }
        seeds.sort_by_key(|s| s.start);
        (seeds, excluded)
    }

    /// The first seed on a page absorbs every other seed starting there.
    fn cluster_same_page(seeds: Vec<Seed>) -> Vec<Seed> {
        let mut clustered: Vec<Seed> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            match clustered.last_mut() {
                Some(anchor) if anchor.start == seed.start => {
                    debug!(
                        "Folding division {} into passage anchored at {} (same page {})",
                        seed.anchor, anchor.anchor, seed.start
                    );
                    anchor.division_ids.extend(seed.division_ids);
                    anchor.end = anchor.end.max(seed.end);
                    anchor.flags.extend(seed.flags);
                    anchor.flags.insert(ReviewFlag::HasSamePageSubheadings);
                }
                _ => clustered.push(seed),
            }
        }
        clustered
    }

    fn merge_small(&self, pages: &[PageRecord], seeds: Vec<Seed>) -> Vec<Seed> {
        let mut merged: Vec<Seed> = Vec::with_capacity(seeds.len());
        let mut iter = seeds.into_iter().peekable();
        while let Some(mut current) = iter.next() {
            while self.calculate_size(pages, current.start, current.end) < self.config.merge_below {
                let Some(next) = iter.peek() else { break };
                if next.group != current.group || next.content_type != current.content_type {
                    break;
                }
                // an excluded sibling sits in between
                if next.start > current.end + 1 {
                    break;
                }
                let combined_end = current.end.max(next.end);
                if self.calculate_size(pages, current.start, combined_end) > self.config.merge_max {
                    break;
                }
                let Some(next) = iter.next() else { break };
                current.division_ids.extend(next.division_ids);
                current.end = combined_end;
                current.flags.extend(next.flags);
                current.flags.insert(ReviewFlag::Merged);
                current.merged = true;
            }
            merged.push(current);
        }
        merged
    }

    pub fn build(&self, tree: &DivisionTree, pages: &[PageRecord]) -> PassageSet {
        let (seeds, excluded_divisions) = self.seeds(tree);
        let seeds = Self::cluster_same_page(seeds);
        let seeds = self.merge_small(pages, seeds);

        let mut passages: Vec<PassageRecord> = seeds
            .into_iter()
            .enumerate()
            .map(|(i, seed)| self.to_record(i, seed, tree, pages))
            .collect();

        let ids: Vec<String> = passages.iter().map(|p| p.passage_id.clone()).collect();
        for (i, passage) in passages.iter_mut().enumerate() {
            passage.predecessor = i.checked_sub(1).map(|p| ids[p].clone());
            passage.successor = ids.get(i + 1).cloned();
        }

        let overlaps = Self::check_overlaps(&mut passages);
        info!(
            "{}: {} passages ({} divisions excluded, {} overlaps)",
            self.name(),
            passages.len(),
            excluded_divisions,
            overlaps
        );
        PassageSet {
            passages,
            excluded_divisions,
            overlaps,
        }
    }

    fn to_record(&self, index: usize, mut seed: Seed, tree: &DivisionTree, pages: &[PageRecord]) -> PassageRecord {
        let size = self.calculate_size(pages, seed.start, seed.end);
        let sizing_action = if size > self.config.long_above {
            seed.flags.insert(ReviewFlag::LongPassage);
            SizingAction::FlaggedLong
        } else if seed.merged {
            SizingAction::Merged
        } else {
            SizingAction::Kept
        };

        let label = |seq: usize| {
            page_at(pages, seq)
                .map(|p| p.page_number_raw.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| seq.to_string())
        };
        let anchor = &tree.nodes[seed.anchor];
        PassageRecord {
            passage_id: format!("P{:04}", index + 1),
            division_ids: seed.division_ids,
            title: anchor.title.clone(),
            heading_path: tree.heading_path(seed.anchor),
            start_seq_index: seed.start,
            end_seq_index: seed.end,
            page_count: seed.end + 1 - seed.start,
            volume: page_at(pages, seed.start).map_or(1, |p| p.volume),
            start_page_label: label(seed.start),
            end_page_label: label(seed.end),
            content_type: seed.content_type,
            sizing_action,
            review_flags: seed.flags,
            predecessor: None,
            successor: None,
        }
    }

    /// Neighbours may share their boundary page; anything more is flagged.
    fn check_overlaps(passages: &mut [PassageRecord]) -> usize {
        let mut overlaps = 0;
        for i in 1..passages.len() {
            let (prev_end, start) = (passages[i - 1].end_seq_index, passages[i].start_seq_index);
            if start < prev_end {
                warn!(
                    "Passages {} and {} overlap (..={} / {}..)",
                    passages[i - 1].passage_id, passages[i].passage_id, prev_end, start
                );
                passages[i - 1].review_flags.insert(ReviewFlag::OverlapDetected);
                passages[i].review_flags.insert(ReviewFlag::OverlapDetected);
                overlaps += 1;
            }
        }
        overlaps
    }
}

pub fn write_jsonl(passages: &[PassageRecord], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for passage in passages {
        serde_json::to_writer(&mut writer, passage)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_jsonl(path: &Path) -> Result<Vec<PassageRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut passages = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let passage: PassageRecord = serde_json::from_str(&line)
            .with_context(|| format!("Bad passage on line {} of {}", line_no + 1, path.display()))?;
        passages.push(passage);
    }
    Ok(passages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::tree::{ParentRef, PlannedDivision, TreeBuilder};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn pages(n: usize) -> Vec<PageRecord> {
        (0..n).map(|i| PageRecord::new(i, 1, i as u32 + 1, "نص")).collect()
    }

    fn node(id: usize, start: usize, end: usize, parent: Option<usize>) -> DivisionNode {
        let mut n = DivisionNode::new(id, &format!("d{id}"), start);
        n.end_seq_index = end;
        n.parent_id = parent;
        n
    }

    fn tiled(starts: &[(usize, Option<usize>)], last_seq: usize) -> DivisionTree {
        let nodes = starts
            .iter()
            .enumerate()
            .map(|(id, (start, parent))| node(id, *start, *start, *parent))
            .collect();
        let mut tree = DivisionTree::new(nodes, (0, last_seq));
        tree.stabilize(8);
        tree
    }

    fn build(tree: &DivisionTree, pages: &[PageRecord]) -> PassageSet {
        let config = PassageConfig::default();
        PassageBuilder::new(&config).build(tree, pages)
    }

    fn spans(set: &PassageSet) -> Vec<(usize, usize)> {
        set.passages
            .iter()
            .map(|p| (p.start_seq_index, p.end_seq_index))
            .collect()
    }

    #[test]
    fn parent_opening_before_its_children_gets_a_preamble() {
        // printed pages 1..=45; notes at 11 and an index at 41 close the two children
        let mut tree = tiled(&[(1, None), (3, Some(0)), (11, Some(0)), (15, Some(0)), (41, Some(0))], 45);
        tree.nodes[2].digestible = Digestibility::False;
        tree.nodes[4].digestible = Digestibility::False;
        assert!(tree.invariant_violations().is_empty());
        assert_eq!(
            (tree.nodes[1].end_seq_index, tree.nodes[3].end_seq_index),
            (10, 40)
        );

        let set = build(&tree, &pages(46));
        assert_eq!(spans(&set), vec![(1, 2), (3, 10), (15, 40)]);
        let preamble = &set.passages[0];
        assert!(preamble.review_flags.contains(&ReviewFlag::Preamble));
        assert_eq!(preamble.division_ids, vec![0]);
        assert_eq!(preamble.heading_path, vec!["d0"]);

        let long = &set.passages[2];
        assert_eq!(long.page_count, 26);
        assert_eq!(long.sizing_action, SizingAction::FlaggedLong);
        assert!(long.review_flags.contains(&ReviewFlag::LongPassage));
        assert_eq!(set.passages[1].sizing_action, SizingAction::Kept);
    }

    #[test]
    fn non_digestible_subtrees_are_left_out() {
        let mut tree = tiled(&[(0, None), (2, Some(0)), (5, None)], 9);
        tree.nodes[0].digestible = Digestibility::False;
        let set = build(&tree, &pages(10));
        assert_eq!(set.excluded_divisions, 2);
        assert_eq!(set.passages.len(), 1);
        assert_eq!(set.passages[0].division_ids, vec![2]);
    }

    #[test]
    fn headings_on_one_page_share_a_passage() {
        let tree = tiled(&[(3, None), (3, None), (3, None)], 10);
        let set = build(&tree, &pages(11));
        assert_eq!(set.passages.len(), 1);
        let passage = &set.passages[0];
        assert_eq!(passage.division_ids, vec![0, 1, 2]);
        assert_eq!((passage.start_seq_index, passage.end_seq_index), (3, 10));
        assert_eq!(passage.title, "d0");
        assert!(passage.review_flags.contains(&ReviewFlag::HasSamePageSubheadings));
    }

    #[test]
    fn small_passages_merge_forward_within_parent_and_content_type() {
        let mut tree = tiled(&[(0, None), (1, Some(0)), (2, Some(0)), (3, Some(0)), (8, Some(0))], 20);
        tree.nodes[3].content_type = "verse".to_string();
        let set = build(&tree, &pages(21));

        let groups: Vec<_> = set.passages.iter().map(|p| p.division_ids.clone()).collect();
        // preamble of 0 absorbs division 1; division 2 stops at the verse boundary
        assert_eq!(groups, vec![vec![0, 1], vec![2], vec![3], vec![4]]);
        assert_eq!(set.passages[0].sizing_action, SizingAction::Merged);
        assert!(set.passages[0].review_flags.contains(&ReviewFlag::Merged));
        assert_eq!(set.passages[1].sizing_action, SizingAction::Kept);
    }

    #[test]
    fn small_passages_do_not_merge_across_an_excluded_sibling() {
        let mut tree = tiled(&[(0, None), (0, Some(0)), (1, Some(0)), (2, Some(0))], 3);
        tree.nodes[2].digestible = Digestibility::False;
        let set = build(&tree, &pages(4));

        assert_eq!(spans(&set), vec![(0, 0), (2, 3)]);
        let groups: Vec<_> = set.passages.iter().map(|p| p.division_ids.clone()).collect();
        assert_eq!(groups, vec![vec![1], vec![3]]);
        assert!(set.passages.iter().all(|p| p.sizing_action != SizingAction::Merged));
    }

    #[test]
    fn merging_stops_at_the_ceiling_and_at_parent_boundaries() {
        let tree = tiled(&[(0, None), (1, None), (9, None)], 12);
        let set = build(&tree, &pages(13));
        assert_eq!(spans(&set), vec![(0, 0), (1, 8), (9, 12)]);

        let tree = tiled(&[(0, None), (1, Some(0)), (4, None)], 12);
        // preamble 0..0 merges with its own child, never with the next root
        let set = build(&tree, &pages(13));
        assert_eq!(spans(&set), vec![(0, 3), (4, 12)]);
    }

    #[test]
    fn ids_are_sequential_and_links_thread_through() {
        let tree = tiled(&[(0, None), (4, None), (9, None)], 12);
        let set = build(&tree, &pages(13));
        let ids: Vec<_> = set.passages.iter().map(|p| p.passage_id.as_str()).collect();
        assert_eq!(ids, vec!["P0001", "P0002", "P0003"]);
        assert_eq!(set.passages[0].predecessor, None);
        assert_eq!(set.passages[0].successor.as_deref(), Some("P0002"));
        assert_eq!(set.passages[2].predecessor.as_deref(), Some("P0002"));
        assert_eq!(set.passages[2].successor, None);
        assert_eq!(set.passages[1].start_page_label, "5");
    }

    #[test]
    fn word_sizing_reads_page_text() {
        let mut pages = pages(5);
        pages[4].text = vec!["كلمة"; 30].join(" ");
        let tree = tiled(&[(0, None), (4, None)], 4);
        let config = PassageConfig {
            size_unit: SizeUnit::Words,
            ..PassageConfig::default()
        };
        let set = PassageBuilder::new(&config).build(&tree, &pages);
        assert_eq!(set.passages[0].sizing_action, SizingAction::Kept);
        assert_eq!(set.passages[1].sizing_action, SizingAction::FlaggedLong);
    }

    #[test]
    fn overlapping_ranges_are_flagged_but_shared_boundaries_are_not() {
        let tree = DivisionTree::new(vec![node(0, 0, 5, None), node(1, 3, 8, None)], (0, 8));
        let set = build(&tree, &pages(9));
        assert_eq!(set.overlaps, 1);
        assert!(set.passages[1].review_flags.contains(&ReviewFlag::OverlapDetected));

        let tree = DivisionTree::new(vec![node(0, 0, 5, None), node(1, 5, 8, None)], (0, 8));
        assert_eq!(build(&tree, &pages(9)).overlaps, 0);
    }

    #[test]
    fn jsonl_round_trip_keeps_order() {
        let tree = tiled(&[(0, None), (4, None)], 9);
        let set = build(&tree, &pages(10));
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("passages.jsonl");
        write_jsonl(&set.passages, &path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let back = read_jsonl(&path).unwrap();
        assert_eq!(back[1].passage_id, "P0002");
        assert_eq!(back[1].division_ids, vec![1]);
    }

    proptest! {
        #[test]
        fn passages_partition_digestible_leaves(
            specs in prop::collection::vec((0usize..60, 1u32..4), 1..25)
        ) {
            let plan: Vec<PlannedDivision> = specs
                .iter()
                .enumerate()
                .map(|(i, (seq, level))| PlannedDivision {
                    plan_id: i,
                    candidate: HeadingCandidate::new(
                        &format!("h{i}"),
                        Some(*seq),
                        DetectionMethod::Tagged,
                        Confidence::Confirmed,
                        i as u64,
                    ),
                    level: *level,
                    parent: ParentRef::Infer,
                    division_type: None,
                    digestible: Digestibility::True,
                    content_type: "text".to_string(),
                })
                .collect();
            let tree_config = TreeConfig { max_rounds: specs.len() + 2, ..TreeConfig::default() };
            let (tree, _) = TreeBuilder::new(&tree_config).build(plan, (0, 59));
            let set = build(&tree, &pages(60));

            prop_assert_eq!(set.overlaps, 0);
            for pair in set.passages.windows(2) {
                prop_assert!(pair[1].start_seq_index > pair[0].start_seq_index);
                prop_assert!(pair[1].start_seq_index >= pair[0].end_seq_index);
                prop_assert_eq!(pair[0].successor.as_deref(), Some(pair[1].passage_id.as_str()));
                prop_assert_eq!(pair[1].predecessor.as_deref(), Some(pair[0].passage_id.as_str()));
            }

            let covered: Vec<DivisionId> = set.passages.iter().flat_map(|p| p.division_ids.clone()).collect();
            for leaf in tree.nodes.iter().filter(|n| n.is_leaf()) {
                prop_assert_eq!(covered.iter().filter(|id| **id == leaf.id).count(), 1);
            }
        }
    }
}
