use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;

use bookmap_core::sources::{load_metadata, load_pages};
use bookmap_core::{BookInput, BookMetadata, OverrideFile, StructureConfig, StructureOutput, StructureProcessor};

#[derive(Parser)]
#[command(name = "bookmap")]
#[command(about = "Discover the division structure of a book and cut it into passages")]
struct Cli {
    /// Path to custom config file (YAML format)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable detailed profiling of all pipeline steps
    #[arg(long, global = true)]
    profile: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every detection pass over one book and write its outputs
    Build {
        /// Normalized pages (JSON Lines, one page record per line)
        #[arg(short, long)]
        pages: PathBuf,

        /// Source markup export (HTML/XHTML) for tagged headings
        #[arg(short, long)]
        markup: Option<PathBuf>,

        /// Book metadata file (YAML or JSON)
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Book title, when no metadata file is given
        #[arg(long)]
        title: Option<String>,

        /// Book author, when no metadata file is given
        #[arg(long)]
        author: Option<String>,

        /// Output directory (default: <pages stem>_structure)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Skip the oracle and build the deterministic tree
        #[arg(long)]
        no_oracle: bool,

        /// Directory for cached oracle responses
        #[arg(long)]
        cache_dir: Option<String>,
    },
    /// Apply a reviewed override file to a previous build
    ApplyOverrides {
        /// Normalized pages the build was made from
        #[arg(short, long)]
        pages: PathBuf,

        /// Output directory of the previous build; rewritten in place
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Override file (YAML)
        #[arg(long)]
        overrides: PathBuf,
    },
    /// Print the effective configuration as YAML and exit
    ShowConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = StructureConfig::load_with_fallback(cli.config.as_deref());
    debug!(
        oracle_enabled = config.oracle.enabled,
        size_unit = ?config.passages.size_unit,
        "configuration loaded"
    );

    match cli.command {
        Commands::ShowConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::Build {
            pages,
            markup,
            metadata,
            title,
            author,
            output_dir,
            no_oracle,
            cache_dir,
        } => {
            println!("📚 Bookmap structure discovery");
            report_config_source(cli.config.as_deref());
            let mut config = config;
            if no_oracle {
                config.oracle.enabled = false;
            }

            let metadata = match metadata {
                Some(path) => load_metadata(&path)?,
                None => BookMetadata {
                    title: title.unwrap_or_else(|| file_stem(&pages)),
                    author,
                    ..Default::default()
                },
            };
            let page_records = load_pages(&pages)?;
            println!("📄 Loaded {} pages from {}", page_records.len(), pages.display());
            let markup = match markup {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading markup {}", path.display()))?,
                ),
                None => {
                    println!("⚠️  No markup given; tagged headings will be skipped");
                    None
                }
            };

            let output_dir = output_dir
                .unwrap_or_else(|| PathBuf::from(format!("{}_structure", file_stem(&pages))));
            let processor = StructureProcessor::new_cli(config, cache_dir.as_deref())?;
            let input = BookInput {
                metadata,
                pages: page_records,
                markup,
            };

            match processor.process_book(&input, cli.profile) {
                Ok(output) => finish(&output, &output_dir),
                Err(e) => {
                    eprintln!("❌ Structure discovery failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::ApplyOverrides {
            pages,
            output_dir,
            overrides,
        } => {
            println!("📝 Applying overrides from {}", overrides.display());
            report_config_source(cli.config.as_deref());
            let page_records = load_pages(&pages)?;
            let override_file = OverrideFile::load_from_file(&overrides)?;
            // overrides never call the oracle
            let processor = StructureProcessor::new_with_dependencies(config, None);

            match processor.apply_overrides(&output_dir, &page_records, &override_file, cli.profile) {
                Ok(output) => {
                    if let Some(outcome) = &output.report.overrides {
                        println!(
                            "   - Applied: {}, skipped: {}",
                            outcome.applied.len(),
                            outcome.skipped.len()
                        );
                        for skipped in &outcome.skipped {
                            println!("   ⚠️  #{} {}: {}", skipped.entry_index, skipped.id, skipped.reason);
                        }
                    }
                    finish(&output, &output_dir)
                }
                Err(e) => {
                    eprintln!("❌ Applying overrides failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn report_config_source(path: Option<&str>) {
    match path {
        Some(path) => println!("📋 Loaded config from: {}", path),
        None => println!("📋 Using default config"),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book")
        .to_string()
}

fn finish(output: &StructureOutput, output_dir: &Path) -> Result<()> {
    let report = &output.report;
    println!("✅ Structure discovered for: {}", output.book.title);
    println!("📊 Structure metrics:");
    println!("   - Divisions: {} (max depth {})", report.division_count, report.max_depth);
    println!("   - Passages: {}", report.passage_count);
    println!(
        "   - TOC entries matched: {}/{}",
        report.toc.matched, report.toc.entries
    );
    println!("   - Ordinal gaps: {}", report.ordinal_warnings.len());
    if let Some(reason) = &report.fallback_reason {
        println!("⚠️  Oracle fallback: {}", reason);
    }

    let paths = output.write_outputs(output_dir)?;
    println!("💾 Divisions saved to: {}", paths.divisions.display());
    println!("💾 Passages saved to: {}", paths.passages.display());
    println!("💾 Report saved to: {}", paths.report.display());
    println!("💾 Review document: {}", paths.review.display());
    println!("💾 Override template: {}", paths.override_template.display());
    Ok(())
}
