use crate::vocabulary::Vocabulary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_min_mapped_ratio() -> f64 {
    0.5
}

fn default_warn_mapped_ratio() -> f64 {
    0.9
}

fn default_alignment_window() -> usize {
    50
}

fn default_toc_labels() -> Vec<String> {
    vec![
        "فهرس".to_string(),
        "الفهرس".to_string(),
        "فهرس المحتويات".to_string(),
        "فهرس الموضوعات".to_string(),
        "المحتويات".to_string(),
        "الفهارس".to_string(),
    ]
}

fn default_toc_lookahead() -> usize {
    10
}

fn default_zero_match_cutoff() -> usize {
    3
}

fn default_min_match_score() -> f64 {
    0.4
}

fn default_page_tolerance() -> u32 {
    1
}

fn default_min_shared_prefix() -> usize {
    12
}

fn default_short_title_chars() -> usize {
    24
}

fn default_short_line_max_chars() -> usize {
    50
}

fn default_max_title_chars() -> usize {
    80
}

fn default_dedup_prefix_chars() -> usize {
    20
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "BOOKMAP_ORACLE_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_retries() -> usize {
    2
}

fn default_sample_chars() -> usize {
    240
}

fn default_deep_scan_max_level() -> u32 {
    2
}

fn default_deep_scan_min_span() -> usize {
    20
}

fn default_deep_scan_min_book_pages() -> usize {
    100
}

fn default_deep_scan_char_budget() -> usize {
    60_000
}

fn default_content_type() -> String {
    "text".to_string()
}

fn default_max_rounds() -> usize {
    8
}

fn default_oversized_pages() -> usize {
    40
}

fn default_merge_below() -> usize {
    2
}

fn default_merge_max() -> usize {
    6
}

fn default_long_above() -> usize {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureConfig {
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub tagged: TaggedConfig,
    #[serde(default)]
    pub toc: TocConfig,
    #[serde(default)]
    pub keyword: KeywordScanConfig,
    /// Structural vocabulary; replace wholesale for a different book family
    #[serde(default)]
    pub vocabulary: Vocabulary,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub passages: PassageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Below this share of mapped blocks the book is aborted
    #[serde(default = "default_min_mapped_ratio")]
    pub min_mapped_ratio: f64,
    /// Below this share a warning is logged and the run continues
    #[serde(default = "default_warn_mapped_ratio")]
    pub warn_mapped_ratio: f64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_mapped_ratio: default_min_mapped_ratio(),
            warn_mapped_ratio: default_warn_mapped_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedConfig {
    /// How far ahead of the cursor the positional search looks (pages)
    #[serde(default = "default_alignment_window")]
    pub alignment_window: usize,
}

impl Default for TaggedConfig {
    fn default() -> Self {
        Self {
            alignment_window: default_alignment_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Heading texts that mark a table-of-contents page
    #[serde(default = "default_toc_labels")]
    pub labels: Vec<String>,
    /// Extra pages scanned past the last known TOC page
    #[serde(default = "default_toc_lookahead")]
    pub lookahead_pages: usize,
    /// Scanning stops after this many consecutive pages without entries
    #[serde(default = "default_zero_match_cutoff")]
    pub zero_match_cutoff: usize,
    #[serde(default = "default_min_match_score")]
    pub min_match_score: f64,
    #[serde(default = "default_page_tolerance")]
    pub page_tolerance: u32,
    #[serde(default = "default_min_shared_prefix")]
    pub min_shared_prefix: usize,
    #[serde(default = "default_short_title_chars")]
    pub short_title_chars: usize,
    /// Look for label-headed pages when neither markup nor page flags name a TOC page
    #[serde(default)]
    pub detect_label_pages: bool,
}

impl Default for TocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: default_toc_labels(),
            lookahead_pages: default_toc_lookahead(),
            zero_match_cutoff: default_zero_match_cutoff(),
            min_match_score: default_min_match_score(),
            page_tolerance: default_page_tolerance(),
            min_shared_prefix: default_min_shared_prefix(),
            short_title_chars: default_short_title_chars(),
            detect_label_pages: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordScanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lines up to this many chars count as "short"
    #[serde(default = "default_short_line_max_chars")]
    pub short_line_max_chars: usize,
    /// Trailing text longer than this is treated as body, not title
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
    #[serde(default = "default_dedup_prefix_chars")]
    pub dedup_prefix_chars: usize,
}

impl Default for KeywordScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            short_line_max_chars: default_short_line_max_chars(),
            max_title_chars: default_max_title_chars(),
            dedup_prefix_chars: default_dedup_prefix_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Corrective retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Chars of page text shown after each candidate heading
    #[serde(default = "default_sample_chars")]
    pub sample_chars: usize,
    /// Response cache directory; None disables caching
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub deep_scan: DeepScanConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            sample_chars: default_sample_chars(),
            cache_dir: None,
            deep_scan: DeepScanConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepScanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only divisions at or above this level are deep-scanned
    #[serde(default = "default_deep_scan_max_level")]
    pub max_level: u32,
    #[serde(default = "default_deep_scan_min_span")]
    pub min_span_pages: usize,
    #[serde(default = "default_deep_scan_min_book_pages")]
    pub min_book_pages: usize,
    /// Page text sent per deep-scan call is capped at this many chars
    #[serde(default = "default_deep_scan_char_budget")]
    pub char_budget: usize,
}

impl Default for DeepScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_level: default_deep_scan_max_level(),
            min_span_pages: default_deep_scan_min_span(),
            min_book_pages: default_deep_scan_min_book_pages(),
            char_budget: default_deep_scan_char_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Nest fallback divisions by keyword tier instead of emitting a flat list
    #[serde(default)]
    pub infer_hierarchy_from_tiers: bool,
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            infer_hierarchy_from_tiers: false,
            default_content_type: default_content_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Cap on range-stabilization rounds
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Leaves spanning more pages than this are flagged oversized
    #[serde(default = "default_oversized_pages")]
    pub oversized_pages: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            oversized_pages: default_oversized_pages(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    #[default]
    Pages,
    Words,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageConfig {
    #[serde(default)]
    pub size_unit: SizeUnit,
    /// Passages smaller than this absorb following siblings
    #[serde(default = "default_merge_below")]
    pub merge_below: usize,
    /// A merge never grows a passage past this size
    #[serde(default = "default_merge_max")]
    pub merge_max: usize,
    /// Passages above this size get the long_passage flag
    #[serde(default = "default_long_above")]
    pub long_above: usize,
}

impl Default for PassageConfig {
    fn default() -> Self {
        Self {
            size_unit: SizeUnit::Pages,
            merge_below: default_merge_below(),
            merge_max: default_merge_max(),
            long_above: default_long_above(),
        }
    }
}

impl StructureConfig {
    /// Load config from file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {path}"))?;
        let config: StructureConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }

    /// Load config with fallback to default
    pub fn load_with_fallback(path: Option<&str>) -> Self {
        match path {
            Some(p) => Self::load_from_file(p).unwrap_or_else(|e| {
                warn!("Failed to load config from {}: {:#}; using defaults", p, e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
