//! Structural keyword and ordinal vocabulary.
//!
//! The raw [`Vocabulary`] is plain data so a book family can swap it out in
//! YAML. [`CompiledVocabulary`] folds every form once and orders them
//! longest-first for matching.

use crate::text::{digit_value, FoldedLine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordEntry {
    /// Stable name reported as `keyword_type` (e.g. "bab")
    pub keyword_type: String,
    /// 1 is the outermost division tier
    pub tier: u8,
    pub forms: Vec<String>,
    #[serde(default)]
    pub definite_forms: Vec<String>,
    #[serde(default)]
    pub plural_forms: Vec<String>,
    /// Words like "mas'ala" that head prose as often as divisions
    #[serde(default)]
    pub generic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdinalEntry {
    pub value: u32,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    pub keywords: Vec<KeywordEntry>,
    pub ordinals: Vec<OrdinalEntry>,
    pub citation_lead_ins: Vec<String>,
    pub prepositions: Vec<String>,
}

fn keyword(
    keyword_type: &str,
    tier: u8,
    form: &str,
    definite: &str,
    plural: Option<&str>,
    generic: bool,
) -> KeywordEntry {
    KeywordEntry {
        keyword_type: keyword_type.to_string(),
        tier,
        forms: vec![form.to_string()],
        definite_forms: vec![definite.to_string()],
        plural_forms: plural.map(|p| vec![p.to_string()]).unwrap_or_default(),
        generic,
    }
}

fn default_keywords() -> Vec<KeywordEntry> {
    vec![
        keyword("kitab", 1, "كتاب", "الكتاب", None, false),
        keyword("juz", 1, "جزء", "الجزء", Some("أجزاء"), false),
        keyword("bab", 2, "باب", "الباب", Some("أبواب"), false),
        keyword("muqaddima", 2, "مقدمة", "المقدمة", None, false),
        keyword("khatima", 2, "خاتمة", "الخاتمة", None, false),
        keyword("fasl", 3, "فصل", "الفصل", Some("فصول"), false),
        keyword("mabhath", 3, "مبحث", "المبحث", Some("مباحث"), false),
        keyword("matlab", 4, "مطلب", "المطلب", Some("مطالب"), false),
        keyword("far", 4, "فرع", "الفرع", Some("فروع"), false),
        keyword("masala", 4, "مسألة", "المسألة", Some("مسائل"), true),
        keyword("tanbih", 4, "تنبيه", "التنبيه", None, true),
        keyword("faida", 4, "فائدة", "الفائدة", Some("فوائد"), true),
    ]
}

/// Masculine stem, feminine stem for 2..=10
const ORDINAL_STEMS: [(u32, &str, &str); 9] = [
    (2, "ثاني", "ثانية"),
    (3, "ثالث", "ثالثة"),
    (4, "رابع", "رابعة"),
    (5, "خامس", "خامسة"),
    (6, "سادس", "سادسة"),
    (7, "سابع", "سابعة"),
    (8, "ثامن", "ثامنة"),
    (9, "تاسع", "تاسعة"),
    (10, "عاشر", "عاشرة"),
];

fn with_article(words: &[&str]) -> Vec<String> {
    words
        .iter()
        .flat_map(|w| [w.to_string(), format!("ال{w}")])
        .collect()
}

fn default_ordinals() -> Vec<OrdinalEntry> {
    let mut ordinals = vec![OrdinalEntry {
        value: 1,
        words: with_article(&["أول", "أولى"]),
    }];

    for (value, masculine, feminine) in ORDINAL_STEMS {
        let mut words = with_article(&[masculine, feminine]);
        if value == 2 {
            words.push("ثان".to_string());
        }
        ordinals.push(OrdinalEntry { value, words });
    }

    // 11..=19: "al-hadi 'ashar", "al-thalitha 'ashrata", ...
    let teens = std::iter::once((11, "حادي", "حادية"))
        .chain(ORDINAL_STEMS.iter().copied().filter(|(v, _, _)| *v < 10));
    for (unit, masculine, feminine) in teens {
        let value = if unit == 11 { 11 } else { unit + 10 };
        let words = [
            format!("{masculine} عشر"),
            format!("ال{masculine} عشر"),
            format!("{feminine} عشرة"),
            format!("ال{feminine} عشرة"),
        ];
        ordinals.push(OrdinalEntry {
            value,
            words: words.to_vec(),
        });
    }

    ordinals.push(OrdinalEntry {
        value: 20,
        words: with_article(&["عشرون", "عشرين"]),
    });
    ordinals
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            ordinals: default_ordinals(),
            citation_lead_ins: ["انظر", "راجع", "ينظر", "كما في", "قال في", "ذكره في"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            prepositions: ["في", "فى", "عن"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Indefinite,
    Definite,
    Plural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordHit {
    pub entry: usize,
    pub kind: FormKind,
    /// Folded-char index just past the keyword
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrdinalHit {
    pub value: u32,
    pub end: usize,
}

/// Keyword type, tier and ordinal read off a heading title
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleClass {
    pub keyword_type: String,
    pub tier: u8,
    pub ordinal: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompiledVocabulary {
    entries: Vec<KeywordEntry>,
    forms: Vec<(Vec<char>, FormKind, usize)>,
    ordinals: Vec<(Vec<char>, u32)>,
    citation_lead_ins: Vec<String>,
    prepositions: Vec<Vec<char>>,
}

fn fold(s: &str) -> Vec<char> {
    FoldedLine::new(s).chars
}

impl CompiledVocabulary {
    pub fn new(vocabulary: &Vocabulary) -> Self {
        let mut forms = Vec::new();
        for (idx, entry) in vocabulary.keywords.iter().enumerate() {
            let groups = [
                (&entry.forms, FormKind::Indefinite),
                (&entry.definite_forms, FormKind::Definite),
                (&entry.plural_forms, FormKind::Plural),
            ];
            for (words, kind) in groups {
                forms.extend(
                    words
                        .iter()
                        .map(|w| fold(w))
                        .filter(|w| !w.is_empty())
                        .map(|w| (w, kind, idx)),
                );
            }
        }
        forms.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut ordinals: Vec<(Vec<char>, u32)> = vocabulary
            .ordinals
            .iter()
            .flat_map(|o| o.words.iter().map(move |w| (fold(w), o.value)))
            .filter(|(w, _)| !w.is_empty())
            .collect();
        ordinals.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut prepositions: Vec<Vec<char>> =
            vocabulary.prepositions.iter().map(|p| fold(p)).collect();
        prepositions.sort_by(|a, b| b.len().cmp(&a.len()));

        Self {
            entries: vocabulary.keywords.clone(),
            forms,
            ordinals,
            citation_lead_ins: vocabulary
                .citation_lead_ins
                .iter()
                .map(|c| FoldedLine::new(c).as_string())
                .collect(),
            prepositions,
        }
    }

    pub fn entry(&self, idx: usize) -> &KeywordEntry {
        &self.entries[idx]
    }

    /// Longest keyword form starting at `at` and ending on a word boundary.
    pub fn match_keyword(&self, line: &FoldedLine, at: usize) -> Option<KeywordHit> {
        self.forms.iter().find_map(|(form, kind, entry)| {
            let end = at + form.len();
            (line.starts_with_at(at, form) && line.is_boundary(end)).then_some(KeywordHit {
                entry: *entry,
                kind: *kind,
                end,
            })
        })
    }

    /// Ordinal word phrase or digit run starting at `at`.
    pub fn match_ordinal(&self, line: &FoldedLine, at: usize) -> Option<OrdinalHit> {
        let digits: Vec<u32> = line.chars[at.min(line.len())..]
            .iter()
            .map_while(|c| digit_value(*c))
            .collect();
        if !digits.is_empty() {
            let value = digits
                .iter()
                .try_fold(0u32, |acc, d| acc.checked_mul(10)?.checked_add(*d))?;
            return Some(OrdinalHit {
                value,
                end: at + digits.len(),
            });
        }

        self.ordinals.iter().find_map(|(phrase, value)| {
            let end = at + phrase.len();
            (line.starts_with_at(at, phrase) && line.is_boundary(end))
                .then_some(OrdinalHit { value: *value, end })
        })
    }

    pub fn match_preposition(&self, line: &FoldedLine, at: usize) -> Option<usize> {
        self.prepositions.iter().find_map(|p| {
            let end = at + p.len();
            (line.starts_with_at(at, p) && line.is_boundary(end)).then_some(end)
        })
    }

    /// True when a line ends with a citation lead-in such as "see".
    pub fn ends_with_citation(&self, line: &str) -> bool {
        let folded = FoldedLine::new(line).as_string();
        let trimmed = folded.trim_end_matches(|c: char| !c.is_alphanumeric());
        self.citation_lead_ins.iter().any(|lead| {
            trimmed.ends_with(lead.as_str())
                && trimmed[..trimmed.len() - lead.len()]
                    .chars()
                    .next_back()
                    .map_or(true, |c| !c.is_alphanumeric())
        })
    }

    /// Reads keyword type and ordinal off a heading that is already known to be one.
    pub fn classify_title(&self, title: &str) -> Option<TitleClass> {
        let line = FoldedLine::new(title);
        let start = first_letter(&line)?;
        let hit = self.match_keyword(&line, start)?;
        let entry = self.entry(hit.entry);
        let ordinal = self
            .match_ordinal(&line, line.skip_spaces(hit.end))
            .map(|o| o.value);
        Some(TitleClass {
            keyword_type: entry.keyword_type.clone(),
            tier: entry.tier,
            ordinal,
        })
    }
}

/// Index of the first letter, skipping brackets, dashes and numbering.
pub fn first_letter(line: &FoldedLine) -> Option<usize> {
    line.chars.iter().position(|c| c.is_alphabetic())
}
