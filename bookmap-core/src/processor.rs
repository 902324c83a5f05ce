use crate::cache::CachedOracle;
use crate::config::StructureConfig;
use crate::error::SourceError;
use crate::oracle::{assign_original_indices, DiscoveryStats, HttpOracle, OracleDiscovery, StructureOracle};
use crate::overrides::{override_template, OverrideApplier, OverrideFile, OverrideOutcome};
use crate::passages::{read_jsonl, write_jsonl, PassageBuilder, PassageSet};
use crate::report::{render_review, RunSummary, StructureReport};
use crate::rules::{
    KeywordHeadingRule, OrdinalSequenceRule, RejectionCounts, TaggedHeadingRule, TaggedPassOutput,
    TocCrossReferenceRule, TocParser,
};
use crate::sources::{read_blocks, seq_bounds, validate_pages};
use crate::storage::{FileStorage, NoOpStorage, ResponseStorage};
use crate::tree::{BuildReport, DivisionTree, DivisionsArtifact, TreeBuilder};
use crate::types::*;
use crate::vocabulary::CompiledVocabulary;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DIVISIONS_FILE: &str = "divisions.json";
pub const PASSAGES_FILE: &str = "passages.jsonl";
pub const REPORT_FILE: &str = "structure_report.json";
pub const REVIEW_FILE: &str = "review.md";
pub const OVERRIDE_TEMPLATE_FILE: &str = "overrides.template.yaml";

/// Simple profiler that collects timings for pipeline steps
pub struct StepProfiler {
    enabled: bool,
    timings: Vec<(String, Duration)>,
}

impl StepProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timings: Vec::new(),
        }
    }

    pub fn time_step<F, R>(&mut self, step_name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if !self.enabled {
            return f();
        }

        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        self.timings.push((step_name.to_string(), elapsed));
        info!("{}: {}ms", step_name, elapsed.as_millis());

        result
    }

    pub fn print_summary(&self) {
        if !self.enabled || self.timings.is_empty() {
            return;
        }

        let total: Duration = self.timings.iter().map(|(_, d)| *d).sum();
        for (step, duration) in &self.timings {
            let percentage = if total.is_zero() {
                0.0
            } else {
                duration.as_secs_f64() / total.as_secs_f64() * 100.0
            };
            info!("{:.<35} {}ms ({:.1}%)", step, duration.as_millis(), percentage);
        }
        info!("{:.<35} {}ms", "Total", total.as_millis());
    }
}

/// One book as handed over by the normalization stage.
#[derive(Debug, Clone)]
pub struct BookInput {
    pub metadata: BookMetadata,
    pub pages: Vec<PageRecord>,
    /// Source markup export; without it Pass 1 finds nothing
    pub markup: Option<String>,
}

/// Everything one run writes to its output directory.
#[derive(Debug, Clone)]
pub struct StructureOutput {
    pub book: BookMetadata,
    pub tree: DivisionTree,
    pub toc_entries: Vec<TocEntry>,
    pub passages: PassageSet,
    pub report: StructureReport,
}

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub divisions: PathBuf,
    pub passages: PathBuf,
    pub report: PathBuf,
    pub review: PathBuf,
    pub override_template: PathBuf,
}

impl OutputPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            divisions: dir.join(DIVISIONS_FILE),
            passages: dir.join(PASSAGES_FILE),
            report: dir.join(REPORT_FILE),
            review: dir.join(REVIEW_FILE),
            override_template: dir.join(OVERRIDE_TEMPLATE_FILE),
        }
    }
}

impl StructureOutput {
    pub fn write_outputs(&self, dir: &Path) -> Result<OutputPaths> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        let paths = OutputPaths::in_dir(dir);

        self.tree.save_to_json(&paths.divisions, &self.book, &self.toc_entries)?;
        write_jsonl(&self.passages.passages, &paths.passages)?;
        self.report.save_to_json(&paths.report)?;
        std::fs::write(&paths.review, render_review(&self.report, &self.tree, &self.passages.passages))
            .with_context(|| format!("Failed to write {}", paths.review.display()))?;
        std::fs::write(
            &paths.override_template,
            override_template(&self.tree, &self.passages.passages)?,
        )
        .with_context(|| format!("Failed to write {}", paths.override_template.display()))?;

        info!("Wrote structure outputs to {}", dir.display());
        Ok(paths)
    }
}

/// Carried from the detection passes into the report.
struct DetectionStats {
    mapping: MappingStats,
    keyword_rejections: RejectionCounts,
    discovery: DiscoveryStats,
    build: BuildReport,
}

pub struct StructureProcessor {
    config: StructureConfig,
    vocabulary: CompiledVocabulary,
    oracle: Option<Box<dyn StructureOracle>>,
}

impl StructureProcessor {
    /// Create StructureProcessor with an explicit oracle (or none)
    pub fn new_with_dependencies(config: StructureConfig, oracle: Option<Box<dyn StructureOracle>>) -> Self {
        let vocabulary = CompiledVocabulary::new(&config.vocabulary);
        Self {
            config,
            vocabulary,
            oracle,
        }
    }

    /// CLI constructor: the HTTP oracle from config behind the response cache.
    /// A missing API key disables the oracle rather than failing the run.
    pub fn new_cli(config: StructureConfig, cache_dir: Option<&str>) -> Result<Self> {
        let oracle: Option<Box<dyn StructureOracle>> = if config.oracle.enabled {
            match HttpOracle::from_config(&config.oracle) {
                Ok(http) => {
                    let storage: Box<dyn ResponseStorage> =
                        match cache_dir.or(config.oracle.cache_dir.as_deref()) {
                            Some(dir) => Box::new(FileStorage::new(dir)?),
                            None => Box::new(NoOpStorage::new()),
                        };
                    Some(Box::new(CachedOracle::new(Box::new(http), storage)))
                }
                Err(e) => {
                    warn!("Oracle unavailable, using the deterministic path: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Ok(Self::new_with_dependencies(config, oracle))
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    fn oracle(&self) -> Option<&dyn StructureOracle> {
        self.oracle.as_ref().map(|o| o.as_ref() as &dyn StructureOracle)
    }

    /// Runs every pass over one book.
    pub fn process_book(&self, input: &BookInput, enable_profiling: bool) -> Result<StructureOutput> {
        let start_time = Instant::now();
        let mut profiler = StepProfiler::new(enable_profiling);
        let config = &self.config;
        let pages = &input.pages;

        validate_pages(pages)?;
        let bounds = seq_bounds(pages).ok_or(SourceError::NoPages)?;
        info!(
            "Discovering structure of {:?} ({} pages)",
            input.metadata.title,
            pages.len()
        );

        let tagged = match &input.markup {
            Some(markup) => {
                let blocks = profiler.time_step("1a. Markup → Blocks", || read_blocks(markup))?;
                profiler.time_step("1b. Tagged Headings", || {
                    TaggedHeadingRule::new(config, &self.vocabulary).apply(&blocks, pages, 0)
                })?
            }
            None => {
                info!("No source markup; skipping tagged headings");
                TaggedPassOutput::default()
            }
        };

        let mut toc_pages = tagged.toc_pages.clone();
        toc_pages.extend(pages.iter().filter(|p| p.flags.toc).map(|p| p.seq_index));
        let toc = profiler.time_step("2. Table of Contents", || {
            TocParser::new(&config.toc).apply(pages, &toc_pages)
        });
        let mut skip_pages: BTreeSet<usize> = toc_pages;
        skip_pages.extend(toc.entries.iter().map(|e| e.source_seq_index));

        let keyword = profiler.time_step("3. Keyword Headings", || {
            KeywordHeadingRule::new(&config.keyword, &self.vocabulary).apply(
                pages,
                &tagged.candidates,
                &skip_pages,
                tagged.next_position,
            )
        });

        let mut candidates: Vec<HeadingCandidate> = tagged.candidates;
        candidates.extend(keyword.candidates);
        assign_original_indices(&mut candidates);

        let plan = profiler.time_step("4. Oracle Discovery", || {
            OracleDiscovery::new(config, &self.vocabulary, self.oracle()).discover(
                &input.metadata,
                pages,
                candidates,
                &toc.entries,
                keyword.next_position,
            )
        });

        let (tree, build) = profiler.time_step("5. Tree Construction", || {
            TreeBuilder::new(&config.tree).build(plan.divisions, bounds)
        });

        let stats = DetectionStats {
            mapping: tagged.stats,
            keyword_rejections: keyword.rejections,
            discovery: plan.stats,
            build,
        };
        let output = self.finish(
            &input.metadata,
            pages,
            tree,
            toc.entries,
            &stats,
            None,
            &mut profiler,
        )?;

        profiler.print_summary();
        info!("Total processing time: {}ms", start_time.elapsed().as_millis());
        Ok(output)
    }

    /// Re-applies a review round to the artifacts of a previous run.
    pub fn apply_overrides(
        &self,
        output_dir: &Path,
        pages: &[PageRecord],
        overrides: &OverrideFile,
        enable_profiling: bool,
    ) -> Result<StructureOutput> {
        let mut profiler = StepProfiler::new(enable_profiling);
        let paths = OutputPaths::in_dir(output_dir);
        validate_pages(pages)?;

        let (mut tree, book, toc_entries) = DivisionsArtifact::load_from_json(&paths.divisions)?.into_tree();
        let previous = StructureReport::load_from_json(&paths.report)?;
        let passages = if paths.passages.exists() {
            read_jsonl(&paths.passages)?
        } else {
            PassageBuilder::new(&self.config.passages).build(&tree, pages).passages
        };

        let mut outcome: OverrideOutcome = profiler.time_step("1. Apply Overrides", || {
            OverrideApplier::new(&self.config.tree).apply(&mut tree, &passages, overrides)
        });
        // earlier rounds stay on record
        if let Some(earlier) = previous.overrides {
            let mut applied = earlier.applied;
            applied.append(&mut outcome.applied);
            outcome.applied = applied;
        }

        let stats = DetectionStats {
            mapping: previous.mapping,
            keyword_rejections: previous.keyword_rejections,
            discovery: previous.discovery,
            build: previous.tree_build,
        };
        let output = self.finish(&book, pages, tree, toc_entries, &stats, Some(outcome), &mut profiler)?;
        profiler.print_summary();
        Ok(output)
    }

    /// Validation, passages and the report: shared by both entry points.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        book: &BookMetadata,
        pages: &[PageRecord],
        tree: DivisionTree,
        toc_entries: Vec<TocEntry>,
        stats: &DetectionStats,
        overrides: Option<OverrideOutcome>,
        profiler: &mut StepProfiler,
    ) -> Result<StructureOutput> {
        let config = &self.config;

        let violations = tree.invariant_violations();
        if !violations.is_empty() {
            warn!("Division tree has {} invariant violations", violations.len());
            for violation in violations.iter().take(10) {
                warn!("  {}", violation);
            }
        }

        let crossref = profiler.time_step("6a. TOC Cross-Reference", || {
            TocCrossReferenceRule::new(&config.toc).apply(&tree, pages, &toc_entries)
        });
        let ordinal_warnings = profiler.time_step("6b. Ordinal Sequences", || OrdinalSequenceRule::new().apply(&tree));

        let builder = PassageBuilder::new(&config.passages);
        let passages = profiler.time_step("7. Passages", || builder.build(&tree, pages));
        let passage_sizes: Vec<usize> = passages
            .passages
            .iter()
            .map(|p| builder.calculate_size(pages, p.start_seq_index, p.end_seq_index))
            .collect();

        let report = StructureReport::compose(&RunSummary {
            book,
            config,
            pages,
            tree: &tree,
            passages: &passages,
            passage_sizes: &passage_sizes,
            toc_entries: &toc_entries,
            toc: &crossref,
            ordinal_warnings: &ordinal_warnings,
            mapping: &stats.mapping,
            keyword_rejections: &stats.keyword_rejections,
            discovery: &stats.discovery,
            build: &stats.build,
            overrides: overrides.as_ref(),
        })?;

        info!(
            "{} divisions, {} passages, {} flagged divisions",
            tree.len(),
            passages.passages.len(),
            tree.nodes.iter().filter(|n| !n.flags.is_empty()).count()
        );
        Ok(StructureOutput {
            book: book.clone(),
            tree,
            toc_entries,
            passages,
            report,
        })
    }
}
