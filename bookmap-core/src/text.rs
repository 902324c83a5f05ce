//! Arabic-aware text helpers shared by every pass.

/// Harakat, superscript alef and tatweel carry no structural meaning.
pub fn is_ignorable(c: char) -> bool {
    matches!(c, '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}')
}

/// Letter-shape folding for comparison only; original text is never rewritten.
pub fn fold_char(c: char) -> char {
    match c {
        'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
        'ى' => 'ي',
        'ة' => 'ه',
        _ => c,
    }
}

/// Value of a single Western, Arabic-Indic or Eastern Arabic-Indic digit.
pub fn digit_value(c: char) -> Option<u32> {
    match c {
        '0'..='9' => Some(c as u32 - '0' as u32),
        '\u{0660}'..='\u{0669}' => Some(c as u32 - 0x0660),
        '\u{06F0}'..='\u{06F9}' => Some(c as u32 - 0x06F0),
        _ => None,
    }
}

pub fn is_digit(c: char) -> bool {
    digit_value(c).is_some()
}

/// Parses a number written entirely in one or more digit scripts.
pub fn parse_number(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.chars().try_fold(0u32, |acc, c| {
        let d = digit_value(c)?;
        acc.checked_mul(10)?.checked_add(d)
    })
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Comparison form of a line, with a map back into the original string.
#[derive(Debug, Clone)]
pub struct FoldedLine {
    pub chars: Vec<char>,
    /// Byte offset in the original line for each folded char
    offsets: Vec<usize>,
    original_len: usize,
}

impl FoldedLine {
    pub fn new(line: &str) -> Self {
        let mut chars = Vec::new();
        let mut offsets = Vec::new();
        let mut pending_space: Option<usize> = None;

        for (offset, c) in line.char_indices() {
            if is_ignorable(c) {
                continue;
            }
            if c.is_whitespace() {
                if !chars.is_empty() && pending_space.is_none() {
                    pending_space = Some(offset);
                }
                continue;
            }
            if let Some(space_at) = pending_space.take() {
                chars.push(' ');
                offsets.push(space_at);
            }
            chars.push(fold_char(c).to_lowercase().next().unwrap_or(c));
            offsets.push(offset);
        }

        Self {
            chars,
            offsets,
            original_len: line.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn as_string(&self) -> String {
        self.chars.iter().collect()
    }

    /// Byte offset in the original line of the folded char at `index`.
    pub fn original_offset(&self, index: usize) -> usize {
        self.offsets
            .get(index)
            .copied()
            .unwrap_or(self.original_len)
    }

    pub fn starts_with_at(&self, at: usize, needle: &[char]) -> bool {
        self.chars
            .get(at..at + needle.len())
            .is_some_and(|slice| slice == needle)
    }

    /// True when `at` is the end of the line or sits on a non-letter.
    pub fn is_boundary(&self, at: usize) -> bool {
        self.chars
            .get(at)
            .map_or(true, |c| !c.is_alphanumeric())
    }

    pub fn skip_spaces(&self, mut at: usize) -> usize {
        while self.chars.get(at).is_some_and(|c| *c == ' ') {
            at += 1;
        }
        at
    }
}

/// Normalized key used for title comparison and dedup.
pub fn normalize_title(s: &str) -> String {
    let folded = FoldedLine::new(s);
    let kept: String = folded
        .chars
        .iter()
        .map(|c| if c.is_alphanumeric() { *c } else { ' ' })
        .collect();
    collapse_whitespace(&kept)
}

/// First `n` chars of the normalized title.
pub fn title_prefix(s: &str, n: usize) -> String {
    normalize_title(s).chars().take(n).collect()
}

/// Number of leading chars two strings share.
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Truncates to at most `max_chars` chars without splitting a char.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_digit_scripts() {
        assert_eq!(parse_number("123"), Some(123));
        assert_eq!(parse_number("١٢٣"), Some(123));
        assert_eq!(parse_number("۱۲۳"), Some(123));
        assert_eq!(parse_number(" ٤5 "), Some(45));
        assert_eq!(parse_number("12a"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn folding_strips_diacritics_and_unifies_letters() {
        assert_eq!(normalize_title("الفَصْلُ الأوَّل"), normalize_title("الفصل الاول"));
        assert_eq!(normalize_title("خاتمة"), "خاتمه");
        assert_eq!(normalize_title("فــصــل"), "فصل");
        assert_eq!(normalize_title("  باب:   الطهارة  "), "باب الطهاره");
    }

    #[test]
    fn folded_line_maps_back_to_original_offsets() {
        let line = "البَابُ  الأول: في المياه";
        let folded = FoldedLine::new(line);
        assert_eq!(folded.as_string(), "الباب الاول: في المياه");

        let colon = folded.chars.iter().position(|c| *c == ':').unwrap();
        let offset = folded.original_offset(colon);
        assert_eq!(&line[offset..offset + 1], ":");
        assert_eq!(folded.original_offset(folded.len()), line.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("كتاب الطهارة", 4), "كتاب");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
