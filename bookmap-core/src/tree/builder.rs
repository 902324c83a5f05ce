use super::division_tree::{DivisionTree, StabilizationReport};
use crate::config::TreeConfig;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// How a planned division names its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    Root,
    /// Nearest preceding division with a smaller level
    Infer,
    /// Index given by the oracle: a candidate's original_index, or failing
    /// that a position in the sorted, deduplicated plan
    OracleIndex(usize),
    /// Another planned division, by plan_id
    Plan(usize),
}

/// A division decided on by discovery, before ranges are known.
#[derive(Debug, Clone)]
pub struct PlannedDivision {
    pub plan_id: usize,
    pub candidate: HeadingCandidate,
    pub level: u32,
    pub parent: ParentRef,
    pub division_type: Option<String>,
    pub digestible: Digestibility,
    pub content_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub stabilization: StabilizationReport,
    pub parents_resolved_by_position: usize,
    pub parents_unresolved: usize,
    pub links_cut: usize,
}

pub struct TreeBuilder<'a> {
    config: &'a TreeConfig,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(config: &'a TreeConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        mut plan: Vec<PlannedDivision>,
        bounds: (usize, usize),
    ) -> (DivisionTree, BuildReport) {
        let mut report = BuildReport::default();
        plan.retain(|p| p.candidate.seq_index.is_some());
        plan.sort_by_key(|p| (p.candidate.order_key(), p.plan_id));

        let by_original: HashMap<usize, DivisionId> = plan
            .iter()
            .enumerate()
            .filter_map(|(id, p)| Some((p.candidate.original_index?, id)))
            .collect();
        let by_plan: HashMap<usize, DivisionId> =
            plan.iter().enumerate().map(|(id, p)| (p.plan_id, id)).collect();

        let mut nodes: Vec<DivisionNode> = plan
            .iter()
            .enumerate()
            .map(|(id, p)| to_node(id, p, bounds))
            .collect();

        // (level, id) of the open divisions above the current one
        let mut level_stack: Vec<(u32, DivisionId)> = Vec::new();
        for (id, planned) in plan.iter().enumerate() {
            let parent = match planned.parent {
                ParentRef::Root => None,
                ParentRef::Plan(plan_id) => by_plan.get(&plan_id).copied(),
                ParentRef::Infer => {
                    while level_stack
                        .last()
                        .is_some_and(|(level, _)| *level >= planned.level)
                    {
                        level_stack.pop();
                    }
                    level_stack.last().map(|(_, parent)| *parent)
                }
                ParentRef::OracleIndex(index) => match by_original.get(&index) {
                    Some(&parent) => Some(parent),
                    None if index < plan.len() => {
                        warn!(
                            "Parent index {} of {:?} is not a candidate index; reading it as a position",
                            index, planned.candidate.title
                        );
                        report.parents_resolved_by_position += 1;
                        nodes[id].flags.insert(ReviewFlag::ParentResolvedByPosition);
                        Some(index)
                    }
                    None => {
                        warn!(
                            "Parent index {} of {:?} resolves to nothing; attaching at top level",
                            index, planned.candidate.title
                        );
                        report.parents_unresolved += 1;
                        None
                    }
                },
            };
            nodes[id].parent_id = parent.filter(|p| *p != id);
            level_stack.push((planned.level, id));
        }

        let mut tree = DivisionTree::new(nodes, bounds);
        report.links_cut = tree.break_cycles();
        report.stabilization = tree.stabilize(self.config.max_rounds);
        tree.refresh_derived(self.config.oversized_pages);

        info!(
            "Built {} divisions ({} roots, depth {}) in {} stabilization rounds",
            tree.len(),
            tree.roots().len(),
            tree.max_depth(),
            report.stabilization.rounds
        );
        (tree, report)
    }
}

fn to_node(id: DivisionId, planned: &PlannedDivision, bounds: (usize, usize)) -> DivisionNode {
    let c = &planned.candidate;
    let start = c.seq_index.unwrap_or(bounds.0).clamp(bounds.0, bounds.1);
    let mut node = DivisionNode::new(id, &c.title, start);
    node.division_type = planned
        .division_type
        .clone()
        .or_else(|| c.keyword_type.clone())
        .unwrap_or_else(|| "section".to_string());
    node.level = planned.level.max(1);
    node.detection_method = c.detection_method;
    node.confidence = c.confidence;
    node.digestible = planned.digestible;
    node.content_type = planned.content_type.clone();
    node.ordinal = c.ordinal;
    node.keyword_type = c.keyword_type.clone();
    node.inline_heading = c.inline_heading;
    node.document_position = c.document_position;
    node
}
