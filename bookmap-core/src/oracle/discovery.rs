//! Pass 3: oracle review of the combined candidate list, deep scans of long
//! divisions, and the deterministic plan used whenever the oracle is absent
//! or gives up.

use super::client::StructureOracle;
use super::prompt::{self, PresentedCandidate};
use super::response::{self, Decision, DecisionAction, NewDivision};
use super::retry::ask_structured;
use crate::config::StructureConfig;
use crate::sources::{page_at, pages_in_range};
use crate::text::{title_prefix, truncate_chars};
use crate::tree::{ParentRef, PlannedDivision};
use crate::types::*;
use crate::vocabulary::CompiledVocabulary;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub oracle: Option<String>,
    pub calls: usize,
    pub retries: usize,
    /// Set whenever the deterministic plan replaced the oracle's
    pub fallback_reason: Option<String>,
    pub confirmed: usize,
    pub rejected: usize,
    pub modified: usize,
    pub undecided: usize,
    pub dropped_decisions: usize,
    pub decision_count_mismatch: bool,
    pub new_divisions: usize,
    pub duplicate_new_divisions: usize,
    pub clamped_anchors: usize,
    #[serde(default)]
    pub unanchored_new_divisions: usize,
    #[serde(default)]
    pub aliased_actions: usize,
    pub deep_scans: usize,
    pub deep_scan_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryPlan {
    pub divisions: Vec<PlannedDivision>,
    pub stats: DiscoveryStats,
    pub next_position: u64,
    /// Plan ids below this belong to candidates, kept or rejected
    first_free_plan_id: usize,
}

/// Gives every candidate its index in the combined Pass 1 + Pass 2 list.
/// Must run before the list is sorted; the oracle refers to candidates by it.
pub fn assign_original_indices(candidates: &mut [HeadingCandidate]) {
    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.original_index = Some(index);
    }
}

pub struct OracleDiscovery<'a> {
    config: &'a StructureConfig,
    vocabulary: &'a CompiledVocabulary,
    oracle: Option<&'a dyn StructureOracle>,
}

impl<'a> OracleDiscovery<'a> {
    pub fn new(
        config: &'a StructureConfig,
        vocabulary: &'a CompiledVocabulary,
        oracle: Option<&'a dyn StructureOracle>,
    ) -> Self {
        Self {
            config,
            vocabulary,
            oracle,
        }
    }

    pub fn name(&self) -> &str {
        "OracleDiscovery"
    }

    /// `candidates` must already carry their original indices.
    pub fn discover(
        &self,
        book: &BookMetadata,
        pages: &[PageRecord],
        mut candidates: Vec<HeadingCandidate>,
        toc_entries: &[TocEntry],
        next_position: u64,
    ) -> DiscoveryPlan {
        candidates.retain(|c| c.page_mapped && c.seq_index.is_some());
        candidates.sort_by_key(|c| c.order_key());

        let mut stats = DiscoveryStats::default();
        let Some(oracle) = self.oracle.filter(|_| self.config.oracle.enabled) else {
            info!("{}: oracle disabled, using the deterministic plan", self.name());
            stats.fallback_reason = Some("oracle disabled".to_string());
            return DiscoveryPlan {
                divisions: self.deterministic_plan(&candidates),
                stats,
                next_position,
                first_free_plan_id: candidates.len(),
            };
        };
        stats.oracle = Some(oracle.name().to_string());

        let bounds = match (pages.first(), pages.last()) {
            (Some(first), Some(last)) => (first.seq_index, last.seq_index),
            _ => (0, 0),
        };

        let presented: Vec<PresentedCandidate> = candidates
            .iter()
            .map(|c| PresentedCandidate {
                candidate: c,
                sample: c
                    .seq_index
                    .and_then(|seq| page_at(pages, seq))
                    .map(|page| {
                        prompt::sample_after_heading(&page.text, &c.title, self.config.oracle.sample_chars)
                    })
                    .unwrap_or_default(),
            })
            .collect();
        let exchange = prompt::macro_exchange(book, pages.len(), &presented, toc_entries);
        let outcome = ask_structured(oracle, &exchange, self.config.oracle.max_retries, |raw| {
            response::parse_macro_response(raw, bounds)
        });
        stats.calls += outcome.attempts;
        stats.retries += outcome.retries();

        let reply = match outcome.result {
            Ok(reply) => reply,
            Err(reason) => {
                warn!("{}: falling back to the deterministic plan: {}", self.name(), reason);
                stats.fallback_reason = Some(reason);
                return DiscoveryPlan {
                    divisions: self.deterministic_plan(&candidates),
                    stats,
                    next_position,
                    first_free_plan_id: candidates.len(),
                };
            }
        };

        stats.dropped_decisions = reply.dropped_decisions;
        stats.clamped_anchors = reply.clamped_anchors;
        stats.unanchored_new_divisions = reply.unanchored;
        stats.aliased_actions = reply.aliased_actions;
        if reply.decisions.len() + reply.dropped_decisions != candidates.len() {
            warn!(
                "{}: {} decisions for {} candidates",
                self.name(),
                reply.decisions.len() + reply.dropped_decisions,
                candidates.len()
            );
            stats.decision_count_mismatch = true;
        }

        let mut plan = DiscoveryPlan {
            divisions: Vec::new(),
            stats,
            next_position,
            first_free_plan_id: candidates.len(),
        };
        let reviewed = self.apply_decisions(&candidates, &reply.decisions, &mut plan);

        // rejected candidates stay in the set so the oracle cannot re-add them
        let mut seen: HashSet<(usize, String)> = candidates
            .iter()
            .chain(plan.divisions.iter().map(|p| &p.candidate))
            .filter_map(|c| Some(self.dedup_key(c.seq_index?, &c.title)))
            .collect();
        for new in &reply.new_divisions {
            let level = new.level.unwrap_or(1);
            let parent = match new.parent_index {
                Some(index) => ParentRef::OracleIndex(index),
                None if level > 1 => ParentRef::Infer,
                None => ParentRef::Root,
            };
            self.push_new_division(pages, new, level, parent, &mut seen, &mut plan);
        }

        if self.config.oracle.deep_scan.enabled {
            self.deep_scan(book, pages, bounds, &reviewed, &mut seen, &mut plan);
        }

        info!(
            "{}: {} planned divisions after {} oracle calls ({} retries)",
            self.name(),
            plan.divisions.len(),
            plan.stats.calls,
            plan.stats.retries
        );
        plan
    }

    /// Returns the plan ids of the divisions the oracle explicitly kept.
    fn apply_decisions(
        &self,
        candidates: &[HeadingCandidate],
        decisions: &[Decision],
        plan: &mut DiscoveryPlan,
    ) -> Vec<usize> {
        let by_original: HashMap<usize, usize> = candidates
            .iter()
            .enumerate()
            .filter_map(|(pos, c)| Some((c.original_index?, pos)))
            .collect();

        let mut decided: Vec<Option<&Decision>> = vec![None; candidates.len()];
        for decision in decisions {
            let target = match decision.index {
                Some(index) => by_original.get(&index).copied(),
                None => (decision.position < candidates.len()).then_some(decision.position),
            };
            match target {
                Some(pos) if decided[pos].is_none() => decided[pos] = Some(decision),
                Some(pos) => debug!("Ignoring repeated decision for candidate {}", pos),
                None => {
                    warn!("Decision {:?} names no known candidate; dropped", decision.index);
                    plan.stats.dropped_decisions += 1;
                }
            }
        }

        let mut reviewed = Vec::new();
        for (pos, candidate) in candidates.iter().enumerate() {
            let mut planned = self.default_planned(pos, candidate, false);
            match decided[pos] {
                None => {
                    plan.stats.undecided += 1;
                }
                Some(decision) if decision.action == DecisionAction::Reject => {
                    debug!("Oracle rejected {:?}", candidate.title);
                    plan.stats.rejected += 1;
                    continue;
                }
                Some(decision) => {
                    if decision.action == DecisionAction::Modify {
                        plan.stats.modified += 1;
                        if let Some(title) = &decision.title {
                            planned.candidate.title = title.clone();
                        }
                    } else {
                        plan.stats.confirmed += 1;
                    }
                    if let Some(level) = decision.level {
                        planned.level = level;
                    }
                    planned.parent = match decision.parent_index {
                        Some(index) => ParentRef::OracleIndex(index),
                        None if planned.level > 1 => ParentRef::Infer,
                        None => ParentRef::Root,
                    };
                    if let Some(digestible) = decision.digestible {
                        planned.digestible = digestible;
                    }
                    if let Some(content_type) = &decision.content_type {
                        planned.content_type = content_type.clone();
                    }
                    planned.division_type = decision.division_type.clone();
                    reviewed.push(planned.plan_id);
                }
            }
            plan.divisions.push(planned);
        }
        reviewed
    }

    fn default_planned(&self, plan_id: usize, candidate: &HeadingCandidate, by_tier: bool) -> PlannedDivision {
        let level = candidate.tier.map(u32::from).unwrap_or(1);
        let parent = if by_tier || level > 1 {
            ParentRef::Infer
        } else {
            ParentRef::Root
        };
        let (digestible, content_type) = if candidate.toc_label {
            (Digestibility::False, "toc".to_string())
        } else {
            (Digestibility::True, self.config.fallback.default_content_type.clone())
        };
        PlannedDivision {
            plan_id,
            candidate: candidate.clone(),
            level,
            parent,
            division_type: None,
            digestible,
            content_type,
        }
    }

    /// Flat plan: every candidate is a root. With tier inference enabled,
    /// keyword tiers nest candidates instead.
    pub fn deterministic_plan(&self, candidates: &[HeadingCandidate]) -> Vec<PlannedDivision> {
        let by_tier = self.config.fallback.infer_hierarchy_from_tiers;
        candidates
            .iter()
            .enumerate()
            .map(|(plan_id, candidate)| {
                let mut planned = self.default_planned(plan_id, candidate, by_tier);
                if !by_tier {
                    planned.level = 1;
                    planned.parent = ParentRef::Root;
                }
                planned
            })
            .collect()
    }

    fn dedup_key(&self, seq_index: usize, title: &str) -> (usize, String) {
        (seq_index, title_prefix(title, self.config.keyword.dedup_prefix_chars))
    }

    fn push_new_division(
        &self,
        pages: &[PageRecord],
        new: &NewDivision,
        level: u32,
        parent: ParentRef,
        seen: &mut HashSet<(usize, String)>,
        plan: &mut DiscoveryPlan,
    ) -> bool {
        if !seen.insert(self.dedup_key(new.seq_index, &new.title)) {
            debug!("Skipping duplicate oracle division {:?} on seq {}", new.title, new.seq_index);
            plan.stats.duplicate_new_divisions += 1;
            return false;
        }

        let mut candidate = HeadingCandidate::new(
            &new.title,
            Some(new.seq_index),
            DetectionMethod::OracleDiscovered,
            Confidence::Medium,
            plan.next_position,
        );
        plan.next_position += 1;
        if let Some(page) = page_at(pages, new.seq_index) {
            candidate.volume = page.volume;
            candidate.page_hint = page.printed_number();
        }
        if let Some(class) = self.vocabulary.classify_title(&new.title) {
            candidate.keyword_type = Some(class.keyword_type);
            candidate.tier = Some(class.tier);
            candidate.ordinal = class.ordinal;
        }

        let plan_id = plan
            .divisions
            .iter()
            .map(|p| p.plan_id + 1)
            .max()
            .unwrap_or_default()
            .max(plan.first_free_plan_id);
        plan.first_free_plan_id = plan_id + 1;
        plan.divisions.push(PlannedDivision {
            plan_id,
            candidate,
            level,
            parent,
            division_type: new.division_type.clone(),
            digestible: new.digestible.unwrap_or(Digestibility::True),
            content_type: new
                .content_type
                .clone()
                .unwrap_or_else(|| self.config.fallback.default_content_type.clone()),
        });
        plan.stats.new_divisions += 1;
        true
    }

    /// Estimated end of a planned division: just before the next division at
    /// the same or an outer level, else the end of the book.
    fn estimated_end(divisions: &[PlannedDivision], target: &PlannedDivision, last_seq: usize) -> usize {
        let start = target.candidate.seq_index.unwrap_or_default();
        divisions
            .iter()
            .filter(|p| p.plan_id != target.plan_id && p.level <= target.level)
            .filter_map(|p| p.candidate.seq_index)
            .filter(|seq| *seq > start)
            .min()
            .map(|next| next - 1)
            .unwrap_or(last_seq)
    }

    fn deep_scan(
        &self,
        book: &BookMetadata,
        pages: &[PageRecord],
        bounds: (usize, usize),
        reviewed: &[usize],
        seen: &mut HashSet<(usize, String)>,
        plan: &mut DiscoveryPlan,
    ) {
        let Some(oracle) = self.oracle else {
            return;
        };
        let deep = &self.config.oracle.deep_scan;
        if pages.len() < deep.min_book_pages {
            debug!("Book has {} pages; skipping deep scan", pages.len());
            return;
        }

        let targets: Vec<PlannedDivision> = plan
            .divisions
            .iter()
            .filter(|p| reviewed.contains(&p.plan_id))
            .filter(|p| p.level <= deep.max_level && p.digestible != Digestibility::False)
            .cloned()
            .collect();

        for target in targets {
            let Some(start) = target.candidate.seq_index else {
                continue;
            };
            let end = Self::estimated_end(&plan.divisions, &target, bounds.1);
            if end + 1 - start < deep.min_span_pages {
                continue;
            }

            let mut text = String::new();
            for page in pages_in_range(pages, start, end) {
                text.push_str(&format!("[seq {}]\n", page.seq_index));
                text.push_str(&page.text);
                text.push('\n');
                if text.len() >= deep.char_budget * 4 {
                    break;
                }
            }
            let text = truncate_chars(&text, deep.char_budget);

            let known: Vec<(usize, String)> = plan
                .divisions
                .iter()
                .filter(|p| p.plan_id != target.plan_id)
                .filter_map(|p| Some((p.candidate.seq_index?, p.candidate.title.clone())))
                .filter(|(seq, _)| *seq >= start && *seq <= end)
                .collect();

            let exchange =
                prompt::deep_scan_exchange(book, &target.candidate.title, (start, end), text, &known);
            let outcome = ask_structured(oracle, &exchange, self.config.oracle.max_retries, |raw| {
                response::parse_deep_scan_response(raw, (start, end))
            });
            plan.stats.calls += outcome.attempts;
            plan.stats.retries += outcome.retries();
            plan.stats.deep_scans += 1;

            let found = match outcome.result {
                Ok(reply) => {
                    plan.stats.clamped_anchors += reply.clamped_anchors;
                    plan.stats.unanchored_new_divisions += reply.unanchored;
                    reply.new_divisions
                }
                Err(reason) => {
                    warn!(
                        "Deep scan of {:?} failed, keeping its macro-pass structure: {}",
                        target.candidate.title, reason
                    );
                    plan.stats.deep_scan_failures += 1;
                    continue;
                }
            };

            let mut added = 0;
            for new in &found {
                let level = new.level.unwrap_or(target.level + 1).max(target.level + 1);
                let parent = if level == target.level + 1 {
                    ParentRef::Plan(target.plan_id)
                } else {
                    ParentRef::Infer
                };
                if self.push_new_division(pages, new, level, parent, seen, plan) {
                    added += 1;
                }
            }
            info!(
                "Deep scan of {:?} (seq {}..={}) added {} sub-divisions",
                target.candidate.title, start, end, added
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::client::ScriptedOracle;
    use crate::vocabulary::Vocabulary;

    fn pages(n: usize) -> Vec<PageRecord> {
        (0..n)
            .map(|i| PageRecord::new(i, 1, i as u32 + 1, &format!("نص الصفحة {i}")))
            .collect()
    }

    fn candidate(title: &str, seq: usize, tier: Option<u8>, position: u64) -> HeadingCandidate {
        let mut c = HeadingCandidate::new(title, Some(seq), DetectionMethod::Tagged, Confidence::Confirmed, position);
        c.tier = tier;
        c
    }

    fn candidates() -> Vec<HeadingCandidate> {
        let mut list = vec![
            candidate("كتاب الطهارة", 2, Some(1), 0),
            candidate("باب المياه", 4, Some(2), 1),
            candidate("الفهرس", 0, None, 2),
        ];
        list[2].toc_label = true;
        assign_original_indices(&mut list);
        list
    }

    fn run(
        config: &StructureConfig,
        oracle: Option<&dyn StructureOracle>,
        pages: &[PageRecord],
        list: Vec<HeadingCandidate>,
    ) -> DiscoveryPlan {
        let vocabulary = CompiledVocabulary::new(&Vocabulary::default());
        OracleDiscovery::new(config, &vocabulary, oracle).discover(
            &BookMetadata::default(),
            pages,
            list,
            &[],
            10,
        )
    }

    #[test]
    fn without_oracle_the_plan_is_flat() {
        let config = StructureConfig::default();
        let plan = run(&config, None, &pages(10), candidates());

        assert_eq!(plan.stats.fallback_reason.as_deref(), Some("oracle disabled"));
        assert_eq!(plan.divisions.len(), 3);
        assert!(plan
            .divisions
            .iter()
            .all(|p| p.level == 1 && p.parent == ParentRef::Root));
        // sorted by seq: the TOC label comes first
        assert_eq!(plan.divisions[0].candidate.title, "الفهرس");
        assert_eq!(plan.divisions[0].digestible, Digestibility::False);
        assert_eq!(plan.divisions[0].content_type, "toc");
        assert_eq!(plan.divisions[1].digestible, Digestibility::True);
    }

    #[test]
    fn tier_inference_nests_the_fallback_plan() {
        let mut config = StructureConfig::default();
        config.fallback.infer_hierarchy_from_tiers = true;
        let plan = run(&config, None, &pages(10), candidates());
        let levels: Vec<_> = plan.divisions.iter().map(|p| (p.level, p.parent)).collect();
        assert_eq!(
            levels,
            vec![(1, ParentRef::Infer), (1, ParentRef::Infer), (2, ParentRef::Infer)]
        );
    }

    #[test]
    fn decisions_apply_by_original_index() {
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        let oracle = ScriptedOracle::new([r#"{
            "decisions": [
                {"index": 2, "action": "reject"},
                {"index": 0, "action": "confirm", "level": 1, "type": "kitab"},
                {"index": 1, "action": "modify", "title": "باب المياه والآبار", "level": 2, "parent_index": 0, "digestible": "uncertain"}
            ],
            "new_divisions": [
                {"title": "فصل في البئر", "seq_index": 6, "level": 3, "parent_index": 1},
                {"title": "باب المياه", "seq_index": 4}
            ]
        }"#]);
        let plan = run(&config, Some(&oracle), &pages(10), candidates());

        assert_eq!(plan.stats.fallback_reason, None);
        assert_eq!(plan.stats.calls, 1);
        assert_eq!(plan.stats.rejected, 1);
        assert_eq!(plan.stats.modified, 1);
        assert_eq!(plan.stats.duplicate_new_divisions, 1);

        let titles: Vec<_> = plan.divisions.iter().map(|p| p.candidate.title.as_str()).collect();
        assert_eq!(titles, vec!["كتاب الطهارة", "باب المياه والآبار", "فصل في البئر"]);
        assert_eq!(plan.divisions[0].division_type.as_deref(), Some("kitab"));
        assert_eq!(plan.divisions[1].parent, ParentRef::OracleIndex(0));
        assert_eq!(plan.divisions[1].digestible, Digestibility::Uncertain);

        let new = &plan.divisions[2];
        assert_eq!(new.candidate.detection_method, DetectionMethod::OracleDiscovered);
        assert_eq!(new.candidate.confidence, Confidence::Medium);
        assert_eq!(new.candidate.document_position, 10);
        assert_eq!(new.candidate.keyword_type.as_deref(), Some("fasl"));
        assert_eq!(plan.next_position, 11);
    }

    #[test]
    fn malformed_replies_exhaust_retries_and_fall_back() {
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        config.oracle.max_retries = 2;
        let oracle = ScriptedOracle::new(["no json here", "{\"decisions\": 5}", "still nothing"]);
        let plan = run(&config, Some(&oracle), &pages(10), candidates());

        assert_eq!(plan.stats.calls, 3);
        assert_eq!(plan.stats.retries, 2);
        assert!(plan
            .stats
            .fallback_reason
            .as_deref()
            .is_some_and(|r| r.contains("retries exhausted")));
        assert_eq!(plan.divisions.len(), 3);
        assert!(plan.divisions.iter().all(|p| p.parent == ParentRef::Root));
    }

    #[test]
    fn deep_scan_attaches_sub_divisions_to_the_scanned_division() {
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        let mut list = vec![
            candidate("كتاب الطهارة", 0, Some(1), 0),
            candidate("كتاب الصلاة", 60, Some(1), 1),
        ];
        assign_original_indices(&mut list);
        let oracle = ScriptedOracle::new([
            r#"{"decisions": [
                {"index": 0, "action": "confirm", "level": 1},
                {"index": 1, "action": "confirm", "level": 1}
            ]}"#,
            r#"{"new_divisions": [{"title": "باب التيمم", "seq_index": 30, "level": 2}]}"#,
            r#"{"new_divisions": []}"#,
        ]);
        let plan = run(&config, Some(&oracle), &pages(120), list);

        assert_eq!(plan.stats.deep_scans, 2);
        assert_eq!(plan.stats.calls, 3);
        let sub = plan
            .divisions
            .iter()
            .find(|p| p.candidate.title == "باب التيمم")
            .unwrap();
        assert_eq!(sub.parent, ParentRef::Plan(0));
        assert_eq!(sub.level, 2);

        let first_scan = &oracle.exchanges()[1].messages[1].content;
        assert!(first_scan.contains("(seq 0 to 59)"));
        assert!(first_scan.contains("[seq 59]"));
        assert!(!first_scan.contains("[seq 60]"));
    }

    #[test]
    fn small_books_skip_the_deep_scan() {
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        let mut list = vec![candidate("كتاب الطهارة", 0, Some(1), 0)];
        assign_original_indices(&mut list);
        let oracle = ScriptedOracle::new([r#"{"decisions": [{"index": 0, "action": "confirm"}]}"#]);
        let plan = run(&config, Some(&oracle), &pages(50), list);
        assert_eq!(plan.stats.deep_scans, 0);
        assert_eq!(oracle.exchanges().len(), 1);
    }
}
