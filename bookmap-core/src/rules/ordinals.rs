use crate::tree::DivisionTree;
use crate::types::DivisionId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdinalWarning {
    pub parent_id: Option<DivisionId>,
    pub keyword_type: String,
    pub division_id: DivisionId,
    pub title: String,
    pub expected: u32,
    pub actual: u32,
}

/// Checks that numbered siblings of one keyword type count up by one.
pub struct OrdinalSequenceRule;

impl Default for OrdinalSequenceRule {
    fn default() -> Self {
        Self::new()
    }
}

impl OrdinalSequenceRule {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "OrdinalSequence"
    }

    pub fn apply(&self, tree: &DivisionTree) -> Vec<OrdinalWarning> {
        let mut warnings = Vec::new();
        let roots = tree.roots();
        let sibling_sets = std::iter::once((None, roots.as_slice())).chain(
            tree.nodes
                .iter()
                .map(|n| (Some(n.id), n.child_ids.as_slice())),
        );

        for (parent_id, siblings) in sibling_sets {
            // last ordinal seen per keyword type, in sibling order
            let mut last: Vec<(&str, u32)> = Vec::new();
            for &id in siblings {
                let node = &tree.nodes[id];
                let (Some(keyword_type), Some(ordinal)) = (node.keyword_type.as_deref(), node.ordinal) else {
                    continue;
                };
                match last.iter_mut().find(|(k, _)| *k == keyword_type) {
                    Some(slot) => {
                        let expected = slot.1 + 1;
                        if ordinal != expected {
                            warn!(
                                "Ordinal gap under {:?}: {:?} is {} {}, expected {}",
                                parent_id, node.title, keyword_type, ordinal, expected
                            );
                            warnings.push(OrdinalWarning {
                                parent_id,
                                keyword_type: keyword_type.to_string(),
                                division_id: id,
                                title: node.title.clone(),
                                expected,
                                actual: ordinal,
                            });
                        }
                        slot.1 = ordinal;
                    }
                    None => last.push((keyword_type, ordinal)),
                }
            }
        }

        info!("{}: {} warnings", self.name(), warnings.len());
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DivisionNode;

    fn numbered(id: usize, start: usize, parent: Option<usize>, kind: &str, ordinal: u32) -> DivisionNode {
        let mut node = DivisionNode::new(id, &format!("{kind} {ordinal}"), start);
        node.parent_id = parent;
        node.keyword_type = Some(kind.to_string());
        node.ordinal = Some(ordinal);
        node
    }

    #[test]
    fn gap_in_sibling_ordinals_is_reported_once() {
        let mut tree = DivisionTree::new(
            vec![
                DivisionNode::new(0, "باب", 0),
                numbered(1, 1, Some(0), "fasl", 1),
                numbered(2, 3, Some(0), "fasl", 2),
                numbered(3, 5, Some(0), "fasl", 4),
            ],
            (0, 9),
        );
        tree.stabilize(4);
        let warnings = OrdinalSequenceRule::new().apply(&tree);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].expected, 3);
        assert_eq!(warnings[0].actual, 4);
        assert_eq!(warnings[0].division_id, 3);
        assert_eq!(warnings[0].parent_id, Some(0));
    }

    #[test]
    fn keyword_types_and_parents_are_counted_separately() {
        let mut tree = DivisionTree::new(
            vec![
                numbered(0, 0, None, "bab", 1),
                numbered(1, 1, Some(0), "fasl", 1),
                numbered(2, 2, Some(0), "mabhath", 1),
                numbered(3, 3, Some(0), "fasl", 2),
                numbered(4, 5, None, "bab", 2),
                numbered(5, 6, Some(4), "fasl", 1),
                DivisionNode::new(6, "تنبيه", 7),
            ],
            (0, 9),
        );
        tree.nodes[6].parent_id = Some(4);
        tree.stabilize(4);
        assert!(OrdinalSequenceRule::new().apply(&tree).is_empty());
    }
}
