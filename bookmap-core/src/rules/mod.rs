// Detection and validation rules. Each rule is a struct built from its slice
// of the configuration with an `apply` entry point:
// - tagged.rs: Pass 1, tagged headings aligned to pages
// - toc.rs: Pass 1.5, dot-leader table of contents
// - keyword.rs: Pass 2, structural keyword heuristics
// - toc_crossref.rs: TOC entries against the built tree
// - ordinals.rs: ordinal sequence checks among siblings

pub mod keyword;
pub mod ordinals;
pub mod tagged;
pub mod toc;
pub mod toc_crossref;

pub use keyword::{KeywordHeadingRule, KeywordPassOutput, RejectionCounts};
pub use ordinals::{OrdinalSequenceRule, OrdinalWarning};
pub use tagged::{TaggedHeadingRule, TaggedPassOutput};
pub use toc::{TocParser, TocPassOutput};
pub use toc_crossref::{TocCrossReference, TocCrossReferenceRule, TocMatch};
