//! Human review round: edits to divisions keyed by division or passage id.

use crate::config::TreeConfig;
use crate::tree::DivisionTree;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTarget {
    Division,
    Passage,
}

/// Division ids are numbers, passage ids are strings; both are accepted either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverrideId {
    Number(usize),
    Text(String),
}

impl std::fmt::Display for OverrideId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideId::Number(n) => write!(f, "{n}"),
            OverrideId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub item_type: OverrideTarget,
    pub id: OverrideId,
    pub action: OverrideAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub division_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_digestibility",
        skip_serializing_if = "Option::is_none"
    )]
    pub digestible: Option<Digestibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_seq_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideFile {
    #[serde(default)]
    pub overrides: Vec<OverrideEntry>,
}

impl OverrideFile {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read override file {}", path.display()))?;
        let file: OverrideFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse override file {}", path.display()))?;
        Ok(file)
    }
}

fn deserialize_digestibility<'de, D>(deserializer: D) -> Result<Option<Digestibility>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Label(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Flag(true)) => Ok(Some(Digestibility::True)),
        Some(Raw::Flag(false)) => Ok(Some(Digestibility::False)),
        Some(Raw::Label(label)) => match label.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(Some(Digestibility::True)),
            "false" | "no" => Ok(Some(Digestibility::False)),
            "uncertain" => Ok(Some(Digestibility::Uncertain)),
            other => Err(serde::de::Error::custom(format!("unknown digestibility {other:?}"))),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOverride {
    pub entry_index: usize,
    pub action: OverrideAction,
    pub division_ids: Vec<DivisionId>,
    pub override_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedOverride {
    pub entry_index: usize,
    pub id: String,
    pub action: OverrideAction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideOutcome {
    pub applied: Vec<AppliedOverride>,
    pub skipped: Vec<SkippedOverride>,
}

pub struct OverrideApplier<'a> {
    config: &'a TreeConfig,
}

impl<'a> OverrideApplier<'a> {
    pub fn new(config: &'a TreeConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        "OverrideApplier"
    }

    /// Applies every entry it can, then restabilizes the tree. Passages must
    /// be rebuilt by the caller afterwards.
    pub fn apply(
        &self,
        tree: &mut DivisionTree,
        passages: &[PassageRecord],
        file: &OverrideFile,
    ) -> OverrideOutcome {
        let mut outcome = OverrideOutcome::default();
        for (entry_index, entry) in file.overrides.iter().enumerate() {
            let result = self
                .resolve(tree, passages, entry)
                .and_then(|targets| self.apply_one(tree, entry, &targets));
            match result {
                Ok((division_ids, override_id)) => outcome.applied.push(AppliedOverride {
                    entry_index,
                    action: entry.action,
                    division_ids,
                    override_id,
                }),
                Err(reason) => {
                    warn!(
                        "Skipping override #{} ({} {}): {}",
                        entry_index,
                        entry.action.as_str(),
                        entry.id,
                        reason
                    );
                    outcome.skipped.push(SkippedOverride {
                        entry_index,
                        id: entry.id.to_string(),
                        action: entry.action,
                        reason,
                    });
                }
            }
        }

        tree.rebuild_child_lists();
        tree.stabilize(self.config.max_rounds);
        tree.refresh_derived(self.config.oversized_pages);
        info!(
            "{}: {} applied, {} skipped",
            self.name(),
            outcome.applied.len(),
            outcome.skipped.len()
        );
        outcome
    }

    fn resolve(
        &self,
        tree: &DivisionTree,
        passages: &[PassageRecord],
        entry: &OverrideEntry,
    ) -> Result<Vec<DivisionId>, String> {
        match entry.item_type {
            OverrideTarget::Division => {
                let id = match &entry.id {
                    OverrideId::Number(n) => *n,
                    OverrideId::Text(s) => s
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| format!("{s:?} is not a division id"))?,
                };
                if id < tree.len() {
                    Ok(vec![id])
                } else {
                    Err(format!("no division {id}"))
                }
            }
            OverrideTarget::Passage => {
                let wanted = entry.id.to_string();
                let passage = passages
                    .iter()
                    .find(|p| p.passage_id == wanted)
                    .ok_or_else(|| format!("no passage {wanted}"))?;
                let ids: Vec<DivisionId> = passage
                    .division_ids
                    .iter()
                    .copied()
                    .filter(|id| *id < tree.len())
                    .collect();
                match (entry.action, entry.at_seq_index) {
                    (OverrideAction::Split, Some(at)) => ids
                        .iter()
                        .rev()
                        .find(|id| tree.nodes[**id].span_contains(at))
                        .map(|id| vec![*id])
                        .ok_or_else(|| format!("passage {wanted} has no division containing seq {at}")),
                    (OverrideAction::Modify, _) => Ok(ids.into_iter().take(1).collect()),
                    _ => Ok(ids),
                }
            }
        }
    }

    fn audit(entry: &OverrideEntry, detail: String) -> OverrideRecord {
        OverrideRecord {
            override_id: Uuid::new_v4(),
            action: entry.action,
            applied_at: Utc::now(),
            detail,
            note: entry.note.clone(),
        }
    }

    fn apply_one(
        &self,
        tree: &mut DivisionTree,
        entry: &OverrideEntry,
        targets: &[DivisionId],
    ) -> Result<(Vec<DivisionId>, Uuid), String> {
        if targets.is_empty() {
            return Err("target resolves to no division".to_string());
        }
        match entry.action {
            OverrideAction::Reject => {
                let record = Self::audit(entry, "marked non-digestible".to_string());
                for &id in targets {
                    let node = &mut tree.nodes[id];
                    node.digestible = Digestibility::False;
                    node.flags.insert(ReviewFlag::HumanRejected);
                    node.human_override.push(record.clone());
                }
                Ok((targets.to_vec(), record.override_id))
            }
            OverrideAction::Confirm => {
                let record = Self::audit(entry, "confirmed".to_string());
                for &id in targets {
                    let node = &mut tree.nodes[id];
                    if node.digestible == Digestibility::Uncertain {
                        node.digestible = Digestibility::True;
                    }
                    node.confidence = Confidence::Confirmed;
                    node.flags.remove(&ReviewFlag::UncertainDigestibility);
                    node.flags.remove(&ReviewFlag::LowConfidence);
                    node.human_override.push(record.clone());
                }
                Ok((targets.to_vec(), record.override_id))
            }
            OverrideAction::Modify => self.modify(tree, entry, targets),
            OverrideAction::Split => self.split(tree, entry, targets[0]),
        }
    }

    fn modify(
        &self,
        tree: &mut DivisionTree,
        entry: &OverrideEntry,
        targets: &[DivisionId],
    ) -> Result<(Vec<DivisionId>, Uuid), String> {
        let mut changes = Vec::new();
        if let Some(title) = &entry.title {
            changes.push(format!("title={title}"));
        }
        if let Some(division_type) = &entry.division_type {
            changes.push(format!("type={division_type}"));
        }
        if let Some(content_type) = &entry.content_type {
            changes.push(format!("content_type={content_type}"));
        }
        if let Some(digestible) = entry.digestible {
            changes.push(format!("digestible={digestible}"));
        }
        if changes.is_empty() {
            return Err("modify names nothing to change".to_string());
        }

        let record = Self::audit(entry, changes.join(", "));
        for &id in targets {
            let node = &mut tree.nodes[id];
            if let Some(title) = &entry.title {
                node.title = title.clone();
            }
            if let Some(division_type) = &entry.division_type {
                node.division_type = division_type.clone();
            }
            if let Some(content_type) = &entry.content_type {
                node.content_type = content_type.clone();
            }
            if let Some(digestible) = entry.digestible {
                node.digestible = digestible;
            }
            node.human_override.push(record.clone());
        }
        Ok((targets.to_vec(), record.override_id))
    }

    /// Cuts a leaf at `at_seq_index`; the tail becomes a new sibling.
    fn split(
        &self,
        tree: &mut DivisionTree,
        entry: &OverrideEntry,
        target: DivisionId,
    ) -> Result<(Vec<DivisionId>, Uuid), String> {
        let at = entry
            .at_seq_index
            .ok_or_else(|| "split needs at_seq_index".to_string())?;
        let original = &tree.nodes[target];
        if !original.is_leaf() {
            return Err(format!("division {target} has children; only leaves can be split"));
        }
        if at <= original.start_seq_index || at > original.end_seq_index {
            return Err(format!(
                "seq {} is not inside division {} ({}..={})",
                at, target, original.start_seq_index, original.end_seq_index
            ));
        }

        let new_id = tree.len();
        let title = entry
            .split_title
            .clone()
            .or_else(|| entry.title.clone())
            .unwrap_or_else(|| format!("{} (تابع)", original.title));
        let record = Self::audit(entry, format!("split at seq {at} into division {new_id}"));

        let mut tail = DivisionNode::new(new_id, &title, at);
        tail.end_seq_index = original.end_seq_index;
        tail.division_type = original.division_type.clone();
        tail.content_type = original.content_type.clone();
        tail.digestible = original.digestible;
        tail.detection_method = original.detection_method;
        tail.confidence = Confidence::Confirmed;
        tail.level = original.level;
        tail.parent_id = original.parent_id;
        tail.document_position = original.document_position;
        tail.human_override.push(record.clone());

        let head = &mut tree.nodes[target];
        head.end_seq_index = at - 1;
        head.human_override.push(record.clone());
        tree.nodes.push(tail);
        Ok((vec![target, new_id], record.override_id))
    }
}

/// Empty override file for the next review round, with the flagged items
/// listed as commented-out suggestions.
pub fn override_template(tree: &DivisionTree, passages: &[PassageRecord]) -> Result<String> {
    let mut out = String::new();
    out.push_str("# Structure overrides. Uncomment or add entries, then run apply-overrides.\n");
    out.push_str("# item_type: division | passage\n");
    out.push_str("# action: reject | confirm | modify | split\n");
    out.push_str("# modify takes title, type, content_type, digestible (true | false | uncertain)\n");
    out.push_str("# split takes at_seq_index (inside the target, after its first page) and split_title\n");
    out.push_str("# note is kept in the audit record\n#\n");

    for id in tree.depth_first() {
        let node = &tree.nodes[id];
        let suggestion = if node.flags.contains(&ReviewFlag::UncertainDigestibility)
            || node.flags.contains(&ReviewFlag::LowConfidence)
        {
            Some("confirm")
        } else if node.flags.contains(&ReviewFlag::ParentResolvedByPosition) {
            Some("modify")
        } else {
            None
        };
        if let Some(action) = suggestion {
            let flags: Vec<&str> = node.flags.iter().map(|f| f.as_str()).collect();
            out.push_str(&format!(
                "# - {{item_type: division, id: {}, action: {}}}  # {} [{}]\n",
                id,
                action,
                node.title,
                flags.join(", ")
            ));
        }
    }
    for passage in passages
        .iter()
        .filter(|p| p.review_flags.contains(&ReviewFlag::LongPassage))
    {
        out.push_str(&format!(
            "# - {{item_type: passage, id: {}, action: split, at_seq_index: {}}}  # {} ({} pages)\n",
            passage.passage_id,
            passage.start_seq_index + passage.page_count / 2,
            passage.title,
            passage.page_count
        ));
    }

    out.push_str(&serde_yaml::to_string(&OverrideFile::default())?);
    Ok(out)
}
