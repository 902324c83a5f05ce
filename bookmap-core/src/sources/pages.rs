use crate::error::SourceError;
use crate::types::{BookMetadata, PageRecord};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Reads a page sequence from a `.jsonl` file (one record per line) or a JSON array.
pub fn load_pages(path: &Path) -> Result<Vec<PageRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pages from {}", path.display()))?;

    let pages: Vec<PageRecord> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .with_context(|| format!("parsing page array in {}", path.display()))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<PageRecord>(line)
                    .with_context(|| format!("parsing page record at {}:{}", path.display(), n + 1))
            })
            .collect::<Result<_>>()?
    };

    validate_pages(&pages)?;
    Ok(pages)
}

/// Book metadata from YAML or JSON (JSON is valid YAML).
pub fn load_metadata(path: &Path) -> Result<BookMetadata> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading metadata from {}", path.display()))?;
    let metadata = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing metadata in {}", path.display()))?;
    Ok(metadata)
}

pub fn validate_pages(pages: &[PageRecord]) -> Result<(), SourceError> {
    if pages.is_empty() {
        return Err(SourceError::NoPages);
    }
    for pair in pages.windows(2) {
        if pair[1].seq_index <= pair[0].seq_index {
            return Err(SourceError::UnorderedPages {
                previous: pair[0].seq_index,
                current: pair[1].seq_index,
            });
        }
    }
    Ok(())
}

/// Position of `seq_index` in a validated page slice.
pub fn page_position(pages: &[PageRecord], seq_index: usize) -> Option<usize> {
    pages.binary_search_by_key(&seq_index, |p| p.seq_index).ok()
}

pub fn page_at(pages: &[PageRecord], seq_index: usize) -> Option<&PageRecord> {
    page_position(pages, seq_index).map(|i| &pages[i])
}

/// Pages whose seq_index lies in `start..=end`.
pub fn pages_in_range(pages: &[PageRecord], start: usize, end: usize) -> &[PageRecord] {
    let lo = pages.partition_point(|p| p.seq_index < start);
    let hi = pages.partition_point(|p| p.seq_index <= end);
    &pages[lo..hi.max(lo)]
}

/// First and last seq_index of the book.
pub fn seq_bounds(pages: &[PageRecord]) -> Option<(usize, usize)> {
    Some((pages.first()?.seq_index, pages.last()?.seq_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_jsonl_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"seq_index": 0, "page_number_raw": "١", "text": "بسم الله"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"seq_index": 1, "volume": 2, "page_number": 2, "text": "", "flags": {{"toc": true}}}}"#
        )
        .unwrap();

        let pages = load_pages(file.path()).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].volume, 1);
        assert_eq!(pages[0].printed_number(), Some(1));
        assert!(pages[1].flags.toc);
        assert_eq!(pages[1].volume, 2);
    }

    #[test]
    fn rejects_out_of_order_pages() {
        let pages = vec![PageRecord::new(3, 1, 1, ""), PageRecord::new(2, 1, 2, "")];
        assert!(matches!(
            validate_pages(&pages),
            Err(SourceError::UnorderedPages { previous: 3, current: 2 })
        ));
        assert!(matches!(validate_pages(&[]), Err(SourceError::NoPages)));
    }

    #[test]
    fn range_lookup_uses_seq_values() {
        let pages: Vec<PageRecord> = (0..10).map(|i| PageRecord::new(i, 1, i as u32 + 1, "")).collect();
        let slice = pages_in_range(&pages, 3, 5);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].seq_index, 3);
        assert!(pages_in_range(&pages, 20, 30).is_empty());
        assert_eq!(page_at(&pages, 7).map(|p| p.page_number), Some(Some(8)));
        assert_eq!(seq_bounds(&pages), Some((0, 9)));
    }
}
