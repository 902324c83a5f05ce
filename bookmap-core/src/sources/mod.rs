pub mod markup;
pub mod pages;

pub use markup::{read_blocks, MarkupBlock};
pub use pages::{load_metadata, load_pages, page_at, pages_in_range, seq_bounds, validate_pages};
