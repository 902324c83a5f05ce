//! Reads page blocks and tagged headings out of the source HTML export.
//!
//! Each `PageText` element is one printed page. Its printed number comes from
//! a marker such as `(ج: 2 ص: 15)` or `(ص: 15)`; blocks without a marker
//! inherit the last one seen. Headings are `<span class="title">` (or h1-h6).

use crate::error::SourceError;
use crate::text::{collapse_whitespace, parse_number};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::sync::LazyLock;

static PAGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\(\s*(?:ج\s*:?\s*(?P<vol>[0-9٠-٩۰-۹]+)\s*[،,]?\s*)?ص\s*:?\s*(?P<page>[0-9٠-٩۰-۹]+)\s*\)",
    )
    .unwrap()
});

static VOID_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(br|hr|img|meta|link|input|wbr)\b([^>]*?)/?>").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupBlock {
    pub index: usize,
    pub volume: Option<u32>,
    pub page_number: Option<u32>,
    /// The block carried its own page marker (as opposed to inheriting one)
    pub has_marker: bool,
    pub headings: Vec<String>,
}

/// HTML void elements and `&nbsp;` break a strict XML reader.
fn sanitize(markup: &str) -> String {
    VOID_ELEMENT
        .replace_all(markup, "<$1$2/>")
        .replace("&nbsp;", " ")
}

fn has_class(e: &BytesStart<'_>, wanted: &str) -> bool {
    e.attributes().flatten().any(|attr| {
        attr.key.as_ref() == b"class"
            && attr
                .unescape_value()
                .map(|v| v.split_whitespace().any(|c| c == wanted))
                .unwrap_or(false)
    })
}

fn is_heading_element(e: &BytesStart<'_>) -> bool {
    matches!(e.name().as_ref(), b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6") || has_class(e, "title")
}

struct OpenBlock {
    depth: usize,
    text: String,
    headings: Vec<String>,
    heading: Option<(usize, String)>,
}

fn parse_marker(text: &str) -> Option<(Option<u32>, u32)> {
    let caps = PAGE_MARKER.captures(text)?;
    let page = parse_number(caps.name("page")?.as_str())?;
    let volume = caps.name("vol").and_then(|v| parse_number(v.as_str()));
    Some((volume, page))
}

pub fn read_blocks(markup: &str) -> Result<Vec<MarkupBlock>, SourceError> {
    let sanitized = sanitize(markup);
    let mut reader = Reader::from_str(&sanitized);
    reader.trim_text(false);
    reader.check_end_names(false);

    let mut blocks: Vec<MarkupBlock> = Vec::new();
    let mut open: Option<OpenBlock> = None;
    let mut depth = 0usize;
    let mut last_volume: Option<u32> = None;
    let mut last_page: Option<u32> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                match open.as_mut() {
                    None if has_class(&e, "PageText") => {
                        open = Some(OpenBlock {
                            depth,
                            text: String::new(),
                            headings: Vec::new(),
                            heading: None,
                        });
                    }
                    Some(block) if block.heading.is_none() && is_heading_element(&e) => {
                        block.heading = Some((depth, String::new()));
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(block) = open.as_mut() {
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    if let Some((_, heading)) = block.heading.as_mut() {
                        heading.push_str(&text);
                    }
                    block.text.push_str(&text);
                }
            }
            Ok(Event::Empty(e)) => {
                // <br/> inside a heading still separates words
                if let Some((_, heading)) = open.as_mut().and_then(|b| b.heading.as_mut()) {
                    if e.name().as_ref() == b"br" {
                        heading.push(' ');
                    }
                }
            }
            Ok(Event::End(_)) => {
                let mut closes_block = false;
                if let Some(block) = open.as_mut() {
                    let closes_heading = block
                        .heading
                        .as_ref()
                        .is_some_and(|(heading_depth, _)| depth <= *heading_depth);
                    if closes_heading {
                        if let Some((_, text)) = block.heading.take() {
                            let cleaned = collapse_whitespace(&text);
                            if !cleaned.is_empty() {
                                block.headings.push(cleaned);
                            }
                        }
                    }
                    closes_block = depth <= block.depth;
                }
                if closes_block {
                    if let Some(finished) = open.take() {
                        let marker = parse_marker(&finished.text);
                        if let Some((volume, page)) = marker {
                            if volume.is_some() {
                                last_volume = volume;
                            }
                            last_page = Some(page);
                        }
                        blocks.push(MarkupBlock {
                            index: blocks.len(),
                            volume: last_volume,
                            page_number: last_page,
                            has_marker: marker.is_some(),
                            headings: finished.headings,
                        });
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceError::Markup(format!(
                    "{} at byte {}",
                    e,
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_blocks_markers_and_headings() {
        let html = r#"<html><body>
<div class="PageText"><div class="PageHead"><span class="PageNumber">(ج: 1 ص: 5)</span></div>
<span class="title">كتاب <b>الطهارة</b></span><br>
<p>نص الصفحة&nbsp;الأولى</p></div>
<div class="PageText">بلا رقم <span class="title">باب المياه</span></div>
<div class="PageText">(ص: ٧) <h3>فصل</h3> <span class="title">  </span></div>
</body></html>"#;

        let blocks = read_blocks(html).unwrap();
        assert_eq!(blocks.len(), 3);

        assert_eq!(blocks[0].volume, Some(1));
        assert_eq!(blocks[0].page_number, Some(5));
        assert!(blocks[0].has_marker);
        assert_eq!(blocks[0].headings, vec!["كتاب الطهارة".to_string()]);

        // inherits the previous marker
        assert_eq!(blocks[1].page_number, Some(5));
        assert!(!blocks[1].has_marker);
        assert_eq!(blocks[1].headings, vec!["باب المياه".to_string()]);

        assert_eq!(blocks[2].page_number, Some(7));
        assert_eq!(blocks[2].volume, Some(1));
        assert_eq!(blocks[2].headings, vec!["فصل".to_string()]);
    }

    #[test]
    fn blocks_before_any_marker_have_no_page() {
        let html = r#"<div><div class="PageText"><span class="title">مقدمة</span></div></div>"#;
        let blocks = read_blocks(html).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].page_number, None);
    }
}
