use super::client::OracleExchange;
use crate::text::{collapse_whitespace, truncate_chars};
use crate::types::{BookMetadata, HeadingCandidate, TocEntry};

/// Bump when the instructions or the expected reply shape change; part of the cache key.
pub const PROMPT_VERSION: &str = "2";

const MACRO_SYSTEM: &str = r#"You review the structure of a printed Arabic book.
You receive candidate headings found by markup tags and keyword heuristics, each with a numeric index,
its page position (seq), detection method, confidence and a short sample of the text that follows it.
Decide for every candidate whether it is a real structural division.

Reply with one JSON object and nothing else:
{
  "decisions": [
    {"index": <candidate index>, "action": "confirm" | "reject" | "modify",
     "title": <corrected title, only for modify>,
     "level": <1 for outermost divisions, 2 for their children, ...>,
     "parent_index": <index of the enclosing candidate, omit for top level>,
     "type": <e.g. kitab, bab, fasl, muqaddima, section>,
     "digestible": true | false | "uncertain",
     "content_type": <text, toc, index, introduction, verse, appendix, ...>}
  ],
  "new_divisions": [
    {"title": <heading text>, "seq_index": <page seq>, "level": <n>, "parent_index": <candidate index or omit>,
     "type": <...>, "digestible": true | false | "uncertain", "content_type": <...>}
  ]
}
Mark tables of contents, indexes and publisher matter as digestible false.
Only add new_divisions for headings that are clearly missing from the candidates."#;

const DEEP_SCAN_SYSTEM: &str = r#"You look for sub-divisions inside one division of a printed Arabic book.
You receive the division's title and its page text, each page introduced by a [seq N] line,
plus the sub-headings already known inside it.
Find headings of sub-divisions that are missing from the known list.

Reply with one JSON object and nothing else:
{"new_divisions": [{"title": <heading text>, "seq_index": <page seq where it starts>, "level": <n>,
 "type": <...>, "digestible": true | false | "uncertain", "content_type": <...>}]}
Return {"new_divisions": []} when nothing is missing."#;

/// A candidate as shown to the oracle, with the text that follows it.
pub struct PresentedCandidate<'a> {
    pub candidate: &'a HeadingCandidate,
    pub sample: String,
}

fn book_header(book: &BookMetadata, total_pages: usize) -> String {
    let mut header = format!("Book: {}\n", book.title);
    if let Some(author) = &book.author {
        header.push_str(&format!("Author: {author}\n"));
    }
    if let Some(subject) = &book.subject {
        header.push_str(&format!("Subject: {subject}\n"));
    }
    header.push_str(&format!("Pages: {total_pages}\n"));
    header
}

pub fn macro_exchange(
    book: &BookMetadata,
    total_pages: usize,
    candidates: &[PresentedCandidate<'_>],
    toc: &[TocEntry],
) -> OracleExchange {
    let mut user = book_header(book, total_pages);

    if !toc.is_empty() {
        user.push_str("\nTable of contents (title / printed page):\n");
        for entry in toc {
            user.push_str(&format!(
                "{}{} / {}\n",
                "  ".repeat(entry.indent_level),
                entry.title,
                entry.page_number
            ));
        }
    }

    user.push_str("\nCandidates:\n");
    for presented in candidates {
        let c = presented.candidate;
        user.push_str(&format!(
            "[{}] seq={} page={} method={} confidence={}{}{} | {}\n    sample: {}\n",
            c.original_index.unwrap_or_default(),
            c.seq_index.unwrap_or_default(),
            c.page_hint.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
            c.detection_method,
            c.confidence,
            c.keyword_type
                .as_deref()
                .map(|k| format!(" keyword={k}"))
                .unwrap_or_default(),
            c.ordinal.map(|o| format!(" ordinal={o}")).unwrap_or_default(),
            c.title,
            presented.sample
        ));
    }

    OracleExchange::new(MACRO_SYSTEM, &user)
}

pub fn deep_scan_exchange(
    book: &BookMetadata,
    division_title: &str,
    span: (usize, usize),
    page_text: &str,
    known_subheadings: &[(usize, String)],
) -> OracleExchange {
    let mut user = book_header(book, 0);
    user.push_str(&format!(
        "\nDivision: {} (seq {} to {})\n",
        division_title, span.0, span.1
    ));
    user.push_str("Known sub-headings:\n");
    if known_subheadings.is_empty() {
        user.push_str("  (none)\n");
    }
    for (seq, title) in known_subheadings {
        user.push_str(&format!("  seq={seq} | {title}\n"));
    }
    user.push_str("\nText:\n");
    user.push_str(page_text);
    OracleExchange::new(DEEP_SCAN_SYSTEM, &user)
}

/// Text right after the heading line on its page, whitespace-collapsed.
pub fn sample_after_heading(page_text: &str, title: &str, max_chars: usize) -> String {
    let first_line = title.lines().next().unwrap_or(title).trim();
    let after = page_text
        .find(first_line)
        .filter(|_| !first_line.is_empty())
        .map(|at| &page_text[at + first_line.len()..])
        .unwrap_or(page_text);
    collapse_whitespace(truncate_chars(after, max_chars * 2))
        .chars()
        .take(max_chars)
        .collect()
}
