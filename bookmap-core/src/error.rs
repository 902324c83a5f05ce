use thiserror::Error;

/// Pass 1 aborts the whole book when too few source blocks land on known pages.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(
        "only {mapped} of {total} source blocks map to known pages ({percent:.1}%, minimum {minimum_percent:.0}%); \
         re-run page normalization for this book before structure discovery"
    )]
    MappingRatioTooLow {
        mapped: usize,
        total: usize,
        percent: f64,
        minimum_percent: f64,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("page sequence is empty")]
    NoPages,
    #[error("page seq_index values must be strictly increasing (found {previous} then {current})")]
    UnorderedPages { previous: usize, current: usize },
    #[error("markup could not be read: {0}")]
    Markup(String),
}
