use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Arena of divisions; `nodes[i].id == i` always holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivisionTree {
    pub nodes: Vec<DivisionNode>,
    /// First seq_index of the book
    pub first_seq: usize,
    /// Last seq_index of the book; the last root ends here
    pub last_seq: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilizationReport {
    pub rounds: usize,
    pub detached: usize,
    pub converged: bool,
    /// Children pulled into their parent's span after the round cap
    #[serde(default)]
    pub clamped: usize,
}

/// What a range pass does with a child starting outside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    Detach,
    Clamp,
}

impl DivisionTree {
    pub fn new(nodes: Vec<DivisionNode>, bounds: (usize, usize)) -> Self {
        Self {
            nodes,
            first_seq: bounds.0,
            last_seq: bounds.1,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: DivisionId) -> Option<&DivisionNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: DivisionId) -> Option<&mut DivisionNode> {
        self.nodes.get_mut(id)
    }

    fn order_key(&self, id: DivisionId) -> (usize, u64, DivisionId) {
        let node = &self.nodes[id];
        (node.start_seq_index, node.document_position, id)
    }

    fn sort_ids(&self, ids: &mut [DivisionId]) {
        ids.sort_by_key(|id| self.order_key(*id));
    }

    pub fn roots(&self) -> Vec<DivisionId> {
        let mut roots: Vec<DivisionId> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.is_none())
            .map(|n| n.id)
            .collect();
        self.sort_ids(&mut roots);
        roots
    }

    /// Derives every child list from `parent_id`, in document order.
    pub fn rebuild_child_lists(&mut self) {
        for node in &mut self.nodes {
            node.child_ids.clear();
        }
        let mut order: Vec<DivisionId> = (0..self.nodes.len()).collect();
        self.sort_ids(&mut order);
        for id in order {
            if let Some(parent) = self.nodes[id].parent_id {
                self.nodes[parent].child_ids.push(id);
            }
        }
    }

    /// Clears dangling and cyclic parent links. Returns how many were cut.
    pub fn break_cycles(&mut self) -> usize {
        let n = self.nodes.len();
        let mut cut = 0;
        for id in 0..n {
            let mut current = self.nodes[id].parent_id;
            let mut steps = 0;
            while let Some(parent) = current {
                if parent >= n || parent == id {
                    self.nodes[id].parent_id = None;
                    cut += 1;
                    break;
                }
                steps += 1;
                if steps > n {
                    break;
                }
                current = self.nodes[parent].parent_id;
            }
        }
        if cut > 0 {
            warn!("Cut {} cyclic or dangling parent links", cut);
        }
        cut
    }

    /// One top-down pass. Roots tile the book; each child ends where its next
    /// sibling begins and the last child ends with its parent. Children
    /// starting outside their parent's span are promoted to roots
    /// (`Escape::Detach`) or moved to the nearest page inside it
    /// (`Escape::Clamp`). Returns how many children escaped.
    fn assign_ranges(&mut self, escape: Escape) -> usize {
        let mut escaped = 0;
        let roots = self.roots();
        for (i, &id) in roots.iter().enumerate() {
            let start = self.nodes[id].start_seq_index;
            let end = match roots.get(i + 1) {
                Some(&next) => self.nodes[next].start_seq_index.saturating_sub(1),
                None => self.last_seq,
            };
            self.nodes[id].end_seq_index = end.max(start);
        }

        let mut queue: VecDeque<DivisionId> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            let (parent_start, parent_end) = {
                let node = &self.nodes[id];
                (node.start_seq_index, node.end_seq_index)
            };
            let children = std::mem::take(&mut self.nodes[id].child_ids);

            let mut kept = Vec::with_capacity(children.len());
            for child in children {
                let start = self.nodes[child].start_seq_index;
                if start >= parent_start && start <= parent_end {
                    kept.push(child);
                    continue;
                }
                escaped += 1;
                match escape {
                    Escape::Detach => {
                        debug!(
                            "Detaching division {} (start {}) from parent {} ({}..={})",
                            child, start, id, parent_start, parent_end
                        );
                        self.nodes[child].parent_id = None;
                    }
                    Escape::Clamp => {
                        let clamped = start.clamp(parent_start, parent_end);
                        warn!(
                            "Division {} moved from {} to {} to stay inside parent {} ({}..={})",
                            child, start, clamped, id, parent_start, parent_end
                        );
                        let node = &mut self.nodes[child];
                        node.start_seq_index = clamped;
                        node.flags.insert(ReviewFlag::RangeClamped);
                        kept.push(child);
                    }
                }
            }
            self.sort_ids(&mut kept);

            for (i, &child) in kept.iter().enumerate() {
                let start = self.nodes[child].start_seq_index;
                let end = match kept.get(i + 1) {
                    Some(&next) => self.nodes[next].start_seq_index.saturating_sub(1),
                    None => parent_end,
                };
                self.nodes[child].end_seq_index = end.max(start);
            }
            queue.extend(kept.iter().copied());
            self.nodes[id].child_ids = kept;
        }
        escaped
    }

    /// Iterates range assignment until no child needs detaching or the round
    /// cap is hit. Past the cap, children still escaping their parent are
    /// clamped into its span so the tree stays well-formed.
    pub fn stabilize(&mut self, max_rounds: usize) -> StabilizationReport {
        self.rebuild_child_lists();
        let mut report = StabilizationReport::default();

        for round in 1..=max_rounds.max(1) {
            report.rounds = round;
            let detached = self.assign_ranges(Escape::Detach);
            report.detached += detached;
            if detached == 0 {
                report.converged = true;
                break;
            }
        }

        if !report.converged {
            report.clamped = self.assign_ranges(Escape::Clamp);
            warn!(
                "Range stabilization stopped at the {}-round cap with {} detachments, {} clamped",
                report.rounds, report.detached, report.clamped
            );
        }

        for node in &mut self.nodes {
            if node.end_seq_index < node.start_seq_index {
                node.end_seq_index = node.start_seq_index;
            }
        }
        report
    }

    /// Recomputes levels from depth, page counts and the derived review flags.
    pub fn refresh_derived(&mut self, oversized_pages: usize) {
        let mut queue: VecDeque<(DivisionId, u32)> =
            self.roots().into_iter().map(|id| (id, 1)).collect();
        while let Some((id, level)) = queue.pop_front() {
            self.nodes[id].level = level;
            for &child in &self.nodes[id].child_ids {
                queue.push_back((child, level + 1));
            }
        }

        for node in &mut self.nodes {
            node.page_count = node.end_seq_index - node.start_seq_index + 1;
            node.flags.remove(&ReviewFlag::UncertainDigestibility);
            node.flags.remove(&ReviewFlag::LowConfidence);
            node.flags.remove(&ReviewFlag::Oversized);
            if node.digestible == Digestibility::Uncertain {
                node.flags.insert(ReviewFlag::UncertainDigestibility);
            }
            if node.confidence == Confidence::Low {
                node.flags.insert(ReviewFlag::LowConfidence);
            }
            if node.is_leaf() && node.page_count > oversized_pages {
                node.flags.insert(ReviewFlag::Oversized);
            }
        }
    }

    /// Pre-order walk in document order.
    pub fn depth_first(&self) -> Vec<DivisionId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<DivisionId> = self.roots().into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id].child_ids.iter().rev().copied());
        }
        out
    }

    /// Ancestors of `id`, outermost first, excluding `id` itself.
    pub fn ancestors(&self, id: DivisionId) -> Vec<DivisionId> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent_id);
        while let Some(parent) = current {
            if chain.len() > self.nodes.len() {
                break;
            }
            chain.push(parent);
            current = self.nodes[parent].parent_id;
        }
        chain.reverse();
        chain
    }

    /// Titles from the outermost ancestor down to `id`.
    pub fn heading_path(&self, id: DivisionId) -> Vec<String> {
        self.ancestors(id)
            .into_iter()
            .chain(std::iter::once(id))
            .filter_map(|i| self.nodes.get(i).map(|n| n.title.clone()))
            .collect()
    }

    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }

    /// Structural problems, one message each; empty for a well-formed tree.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let check_tiling = |ids: &[DivisionId], problems: &mut Vec<String>| {
            for pair in ids.windows(2) {
                let (a, b) = (&self.nodes[pair[0]], &self.nodes[pair[1]]);
                let adjacent = b.start_seq_index == a.end_seq_index + 1;
                let same_page =
                    a.start_seq_index == a.end_seq_index && a.end_seq_index == b.start_seq_index;
                if !adjacent && !same_page {
                    problems.push(format!(
                        "siblings {} ({}..={}) and {} ({}..={}) do not tile",
                        a.id, a.start_seq_index, a.end_seq_index, b.id, b.start_seq_index, b.end_seq_index
                    ));
                }
            }
        };

        for node in &self.nodes {
            if node.end_seq_index < node.start_seq_index {
                problems.push(format!("division {} ends before it starts", node.id));
            }
            if let Some(parent) = node.parent_id.and_then(|p| self.nodes.get(p)) {
                if !parent.child_ids.contains(&node.id) {
                    problems.push(format!("division {} missing from parent {}", node.id, parent.id));
                }
                if node.start_seq_index < parent.start_seq_index
                    || node.end_seq_index > parent.end_seq_index
                {
                    problems.push(format!("division {} escapes parent {}", node.id, parent.id));
                }
            }
            check_tiling(&node.child_ids, &mut problems);
            if let Some(last) = node.child_ids.last().and_then(|c| self.nodes.get(*c)) {
                if last.end_seq_index != node.end_seq_index {
                    problems.push(format!(
                        "last child {} of {} ends at {} instead of {}",
                        last.id, node.id, last.end_seq_index, node.end_seq_index
                    ));
                }
            }
        }

        let roots = self.roots();
        check_tiling(&roots, &mut problems);
        problems
    }
}
