//! End-to-end runs of the structure pipeline over a small synthetic book.
//!
//! The book has 40 pages (printed number = seq_index + 1), tagged headings in
//! its markup export and a dot-leader table of contents on its last pages.
//! The oracle is either absent or scripted; nothing here touches the network.

use bookmap_core::cache::CachedOracle;
use bookmap_core::overrides::{OverrideEntry, OverrideId, OverrideTarget};
use bookmap_core::passages::read_jsonl;
use bookmap_core::processor::{OutputPaths, DIVISIONS_FILE, PASSAGES_FILE};
use bookmap_core::storage::FileStorage;
use bookmap_core::tree::DivisionsArtifact;
use bookmap_core::*;
use tempfile::TempDir;

// ============================================================================
// Fixture helpers
// ============================================================================

const BODY: &str = "وهذا نص عادي من متن الكتاب لا عنوان فيه";

/// (seq_index, tagged heading)
const HEADINGS: &[(usize, &str)] = &[
    (0, "المقدمة"),
    (4, "كتاب الطهارة"),
    (5, "باب المياه"),
    (15, "باب الآنية"),
    (30, "كتاب الصلاة"),
    (38, "الفهرس"),
];

const TOC_TEXT: &str = "الفهرس\n\
كتاب الطهارة ........ 5\n\
باب المياه ........ 6\n\
باب الآنية ........ 16\n\
كتاب الصلاة ........ 31\n\
باب الأذان ........ 35";

fn pages() -> Vec<PageRecord> {
    (0..40)
        .map(|seq| {
            let text = if seq == 38 { TOC_TEXT } else { BODY };
            PageRecord::new(seq, 1, seq as u32 + 1, text)
        })
        .collect()
}

fn markup() -> String {
    let mut html = String::from("<html><body>\n");
    for seq in 0..40usize {
        html.push_str(&format!("<div class=\"PageText\">(ج: 1 ص: {}) ", seq + 1));
        for (_, title) in HEADINGS.iter().filter(|(s, _)| *s == seq) {
            html.push_str(&format!("<span class=\"title\">{title}</span>"));
        }
        html.push_str(&format!("<p>{BODY}</p></div>\n"));
    }
    html.push_str("</body></html>");
    html
}

fn book_input() -> BookInput {
    BookInput {
        metadata: BookMetadata {
            title: "مختصر في الفقه".to_string(),
            author: Some("مؤلف مجهول".to_string()),
            ..Default::default()
        },
        pages: pages(),
        markup: Some(markup()),
    }
}

fn division<'a>(tree: &'a DivisionTree, title: &str) -> &'a DivisionNode {
    tree.nodes
        .iter()
        .find(|n| n.title == title)
        .unwrap_or_else(|| panic!("no division titled {title}"))
}

const ORACLE_REPLY: &str = r#"```json
{
  "decisions": [
    {"index": 0, "action": "confirm", "level": 1},
    {"index": 1, "action": "confirm", "level": 1, "type": "kitab"},
    {"index": 2, "action": "confirm", "level": 2, "parent_index": 1},
    {"index": 3, "action": "confirm", "level": 2, "parent_index": 1},
    {"index": 4, "action": "confirm", "level": 1, "type": "kitab"},
    {"index": 5, "action": "confirm", "level": 1, "digestible": false, "content_type": "toc"}
  ],
  "new_divisions": [
    {"title": "باب الأذان", "seq_index": 34, "level": 2}
  ]
}
```"#;

fn assert_passages_well_formed(passages: &[PassageRecord]) {
    for (i, passage) in passages.iter().enumerate() {
        assert_eq!(passage.passage_id, format!("P{:04}", i + 1));
        assert!(passage.end_seq_index >= passage.start_seq_index);
    }
    for pair in passages.windows(2) {
        assert!(pair[1].start_seq_index > pair[0].end_seq_index);
        assert_eq!(pair[0].successor.as_deref(), Some(pair[1].passage_id.as_str()));
        assert_eq!(pair[1].predecessor.as_deref(), Some(pair[0].passage_id.as_str()));
    }
}

// ============================================================================
// Deterministic path
// ============================================================================

mod deterministic {
    use super::*;

    #[test]
    fn flat_tree_from_tagged_headings() {
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let output = processor.process_book(&book_input(), true).unwrap();
        let tree = &output.tree;

        assert_eq!(tree.len(), 6);
        assert!(tree.invariant_violations().is_empty());
        assert_eq!(tree.max_depth(), 1);
        for node in &tree.nodes {
            assert_eq!(node.detection_method, DetectionMethod::Tagged);
            assert_eq!(node.confidence, Confidence::Confirmed);
            assert_eq!(node.parent_id, None);
        }

        let water = division(tree, "باب المياه");
        assert_eq!((water.start_seq_index, water.end_seq_index), (5, 14));
        let toc = division(tree, "الفهرس");
        assert_eq!(toc.digestible, Digestibility::False);
        assert_eq!(toc.content_type, "toc");

        let report = &output.report;
        assert!(report.fallback_taken);
        assert_eq!(report.fallback_reason.as_deref(), Some("oracle disabled"));
        assert_eq!(report.mapping.total_blocks, 40);
        assert_eq!(report.mapping.mapped_blocks, 40);
        assert_eq!(report.toc.entries, 5);
        assert_eq!(report.toc.matched, 4);
        assert_eq!(report.toc.missed[0].title, "باب الأذان");
    }

    #[test]
    fn passages_skip_the_index_and_keep_order() {
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let output = processor.process_book(&book_input(), false).unwrap();
        let passages = &output.passages.passages;

        let spans: Vec<(usize, usize)> = passages
            .iter()
            .map(|p| (p.start_seq_index, p.end_seq_index))
            .collect();
        assert_eq!(spans, vec![(0, 3), (4, 4), (5, 14), (15, 29), (30, 37)]);
        assert_eq!(output.passages.excluded_divisions, 1);
        assert_eq!(passages[2].start_page_label, "6");
        assert_eq!(passages[2].end_page_label, "15");
        assert_passages_well_formed(passages);
    }

    #[test]
    fn keyword_headings_stand_in_when_there_is_no_markup() {
        let mut pages = pages();
        pages[38].text = BODY.to_string();
        pages[10].text = format!("وهذا نص عادي\nفصل ثالث: في الأسماء\n{BODY}");
        let input = BookInput {
            metadata: BookMetadata {
                title: "رسالة".to_string(),
                ..Default::default()
            },
            pages,
            markup: None,
        };
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let output = processor.process_book(&input, false).unwrap();

        assert_eq!(output.tree.len(), 1);
        let fasl = &output.tree.nodes[0];
        assert_eq!(fasl.detection_method, DetectionMethod::Keyword);
        assert_eq!(fasl.confidence, Confidence::High);
        assert_eq!(fasl.ordinal, Some(3));
        assert_eq!(fasl.division_type, "fasl");
        assert_eq!((fasl.start_seq_index, fasl.end_seq_index), (10, 39));

        let passage = &output.passages.passages[0];
        assert_eq!(passage.sizing_action, SizingAction::FlaggedLong);
        assert!(passage.review_flags.contains(&ReviewFlag::LongPassage));
        assert_eq!(output.report.by_detection_method.get("keyword"), Some(&1));
    }

    #[test]
    fn unmappable_markup_aborts_before_any_oracle_call() {
        let html = "<body>\
            <div class=\"PageText\">(ص: 500) <span class=\"title\">باب</span></div>\
            <div class=\"PageText\">(ص: 501) نص</div>\
            <div class=\"PageText\">(ص: 502) نص</div>\
            </body>";
        let mut input = book_input();
        input.markup = Some(html.to_string());

        let oracle = ScriptedOracle::new(Vec::<String>::new());
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        let processor = StructureProcessor::new_with_dependencies(config, Some(Box::new(oracle)));
        let err = processor.process_book(&input, false).unwrap_err();

        let preflight = err.downcast_ref::<PreflightError>().expect("preflight error");
        let PreflightError::MappingRatioTooLow { mapped, total, .. } = preflight;
        assert_eq!((*mapped, *total), (0, 3));
    }

    #[test]
    fn out_of_order_pages_are_rejected() {
        let mut input = book_input();
        input.pages.swap(3, 4);
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let err = processor.process_book(&input, false).unwrap_err();
        assert!(err.downcast_ref::<SourceError>().is_some());
    }
}

// ============================================================================
// Oracle path
// ============================================================================

mod oracle {
    use super::*;

    fn oracle_config() -> StructureConfig {
        let mut config = StructureConfig::default();
        config.oracle.enabled = true;
        config
    }

    #[test]
    fn decisions_nest_the_tree_and_add_missed_divisions() {
        let oracle = ScriptedOracle::new([ORACLE_REPLY]);
        let processor = StructureProcessor::new_with_dependencies(oracle_config(), Some(Box::new(oracle)));
        let output = processor.process_book(&book_input(), false).unwrap();
        let tree = &output.tree;

        assert!(tree.invariant_violations().is_empty());
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.max_depth(), 2);

        let purity = division(tree, "كتاب الطهارة");
        assert_eq!(purity.division_type, "kitab");
        assert_eq!((purity.start_seq_index, purity.end_seq_index), (4, 29));
        assert_eq!(division(tree, "باب المياه").parent_id, Some(purity.id));
        assert_eq!(division(tree, "باب الآنية").parent_id, Some(purity.id));

        let prayer = division(tree, "كتاب الصلاة");
        let adhan = division(tree, "باب الأذان");
        assert_eq!(adhan.detection_method, DetectionMethod::OracleDiscovered);
        assert_eq!(adhan.parent_id, Some(prayer.id));
        assert_eq!(adhan.level, 2);
        assert_eq!((adhan.start_seq_index, adhan.end_seq_index), (34, 37));

        let report = &output.report;
        assert!(!report.fallback_taken);
        assert_eq!(report.discovery.calls, 1);
        assert_eq!(report.discovery.confirmed, 6);
        assert_eq!(report.discovery.new_divisions, 1);
        assert!(!report.discovery.decision_count_mismatch);
        assert_eq!(report.toc.matched, 5);
        assert!(report.toc.missed.is_empty());

        let spans: Vec<(usize, usize)> = output
            .passages
            .passages
            .iter()
            .map(|p| (p.start_seq_index, p.end_seq_index))
            .collect();
        assert_eq!(spans, vec![(0, 3), (4, 4), (5, 14), (15, 29), (30, 33), (34, 37)]);
        let preamble = &output.passages.passages[1];
        assert!(preamble.review_flags.contains(&ReviewFlag::Preamble));
        assert_eq!(preamble.heading_path, vec!["كتاب الطهارة".to_string()]);
        assert_passages_well_formed(&output.passages.passages);
    }

    #[test]
    fn unusable_replies_fall_back_after_bounded_retries() {
        let oracle = ScriptedOracle::new(["لا أستطيع", "still no json", "{\"decisions\": 7}"]);
        let processor = StructureProcessor::new_with_dependencies(oracle_config(), Some(Box::new(oracle)));
        let output = processor.process_book(&book_input(), false).unwrap();

        let report = &output.report;
        assert!(report.fallback_taken);
        assert_eq!(report.discovery.calls, 3);
        assert_eq!(report.discovery.retries, 2);
        assert_eq!(output.tree.max_depth(), 1);
        assert_eq!(output.tree.len(), 6);
    }

    #[test]
    fn cached_replies_serve_the_second_run() {
        let cache = TempDir::new().unwrap();
        let storage = FileStorage::new(cache.path().to_str().unwrap()).unwrap();
        let oracle = CachedOracle::new(Box::new(ScriptedOracle::new([ORACLE_REPLY])), Box::new(storage));
        let processor = StructureProcessor::new_with_dependencies(oracle_config(), Some(Box::new(oracle)));

        let first = processor.process_book(&book_input(), false).unwrap();
        // the script is now exhausted; only the cache can answer
        let second = processor.process_book(&book_input(), false).unwrap();

        assert!(!first.report.fallback_taken);
        assert!(!second.report.fallback_taken);
        assert_eq!(first.tree.len(), second.tree.len());
        assert_ne!(first.report.run_id, second.report.run_id);
        let cached = std::fs::read_dir(cache.path().join("oracle")).unwrap().count();
        assert_eq!(cached, 1);
    }
}

// ============================================================================
// Outputs and the review round
// ============================================================================

mod review_round {
    use super::*;

    #[test]
    fn outputs_are_written_and_readable() {
        let dir = TempDir::new().unwrap();
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let output = processor.process_book(&book_input(), false).unwrap();
        let paths = output.write_outputs(dir.path()).unwrap();

        let artifact = DivisionsArtifact::load_from_json(&paths.divisions).unwrap();
        assert_eq!(artifact.divisions.len(), 6);
        assert_eq!(artifact.toc_entries.len(), 5);
        assert_eq!(artifact.book.title, "مختصر في الفقه");

        let passages = read_jsonl(&paths.passages).unwrap();
        assert_eq!(passages.len(), output.passages.passages.len());

        let review = std::fs::read_to_string(&paths.review).unwrap();
        assert!(review.starts_with("# Structure review: مختصر في الفقه"));
        assert!(review.contains("باب الأذان (p. 35)"));

        let template = std::fs::read_to_string(&paths.override_template).unwrap();
        let parsed: OverrideFile = serde_yaml::from_str(&template).unwrap();
        assert!(parsed.overrides.is_empty());
        assert!(paths.report.exists());
    }

    fn entry(item_type: OverrideTarget, id: OverrideId, action: OverrideAction) -> OverrideEntry {
        OverrideEntry {
            item_type,
            id,
            action,
            title: None,
            division_type: None,
            content_type: None,
            digestible: None,
            at_seq_index: None,
            split_title: None,
            note: None,
        }
    }

    #[test]
    fn overrides_rebuild_passages_and_keep_an_audit_trail() {
        let dir = TempDir::new().unwrap();
        let processor = StructureProcessor::new_with_dependencies(StructureConfig::default(), None);
        let first = processor.process_book(&book_input(), false).unwrap();
        first.write_outputs(dir.path()).unwrap();

        let vessels = division(&first.tree, "باب الآنية").id;
        let water = division(&first.tree, "باب المياه").id;
        let mut split = entry(OverrideTarget::Division, OverrideId::Number(water), OverrideAction::Split);
        split.at_seq_index = Some(10);
        split.split_title = Some("فصل في الماء المستعمل".to_string());
        split.note = Some("two topics on one heading".to_string());
        let overrides = OverrideFile {
            overrides: vec![
                entry(OverrideTarget::Division, OverrideId::Number(vessels), OverrideAction::Reject),
                split,
                entry(OverrideTarget::Passage, OverrideId::Text("P0001".to_string()), OverrideAction::Reject),
                entry(OverrideTarget::Division, OverrideId::Number(99), OverrideAction::Confirm),
            ],
        };

        let second = processor
            .apply_overrides(dir.path(), &pages(), &overrides, false)
            .unwrap();
        let outcome = second.report.overrides.as_ref().unwrap();
        assert_eq!(outcome.applied.len(), 3);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(second.tree.invariant_violations().is_empty());

        let spans: Vec<(usize, usize)> = second
            .passages
            .passages
            .iter()
            .map(|p| (p.start_seq_index, p.end_seq_index))
            .collect();
        // the 1-page book heading merges into the first half of the split
        assert_eq!(spans, vec![(4, 9), (10, 14), (30, 37)]);
        assert_eq!(second.passages.passages[0].sizing_action, SizingAction::Merged);
        assert!(second
            .passages
            .passages
            .iter()
            .all(|p| !p.division_ids.contains(&vessels)));

        second.write_outputs(dir.path()).unwrap();
        let paths = OutputPaths::in_dir(dir.path());
        assert_eq!(paths.divisions, dir.path().join(DIVISIONS_FILE));
        let (tree, _, _) = DivisionsArtifact::load_from_json(&paths.divisions)
            .unwrap()
            .into_tree();
        let tail = division(&tree, "فصل في الماء المستعمل");
        assert_eq!(tail.human_override[0].action, OverrideAction::Split);
        assert_eq!(
            tail.human_override[0].note.as_deref(),
            Some("two topics on one heading")
        );
        assert!(tree.nodes[vessels].flags.contains(&ReviewFlag::HumanRejected));
        assert_eq!(read_jsonl(&dir.path().join(PASSAGES_FILE)).unwrap().len(), 3);
    }
}
