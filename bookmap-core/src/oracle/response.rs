//! Parsing and validation of oracle replies.

use crate::types::Digestibility;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Confirm,
    Reject,
    Modify,
}

impl DecisionAction {
    /// The action and whether it was written as a synonym.
    fn parse(raw: &str) -> Option<(Self, bool)> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "confirm" => Some((DecisionAction::Confirm, false)),
            "reject" => Some((DecisionAction::Reject, false)),
            "modify" => Some((DecisionAction::Modify, false)),
            "keep" | "accept" => Some((DecisionAction::Confirm, true)),
            "drop" | "remove" => Some((DecisionAction::Reject, true)),
            "rename" | "edit" => Some((DecisionAction::Modify, true)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Candidate original_index; None when the oracle omitted it
    pub index: Option<usize>,
    /// Position of the decision in the reply, for the positional fallback
    pub position: usize,
    pub action: DecisionAction,
    pub title: Option<String>,
    pub level: Option<u32>,
    pub parent_index: Option<usize>,
    pub digestible: Option<Digestibility>,
    pub content_type: Option<String>,
    pub division_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDivision {
    pub title: String,
    pub seq_index: usize,
    pub level: Option<u32>,
    pub parent_index: Option<usize>,
    pub digestible: Option<Digestibility>,
    pub content_type: Option<String>,
    pub division_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroResponse {
    pub decisions: Vec<Decision>,
    pub new_divisions: Vec<NewDivision>,
    pub dropped_decisions: usize,
    pub clamped_anchors: usize,
    /// Decisions whose action was a synonym such as "keep" or "drop"
    pub aliased_actions: usize,
    /// New divisions dropped for lacking a seq_index
    pub unanchored: usize,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    index: Option<usize>,
    action: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    level: Option<u32>,
    #[serde(default)]
    parent_index: Option<usize>,
    #[serde(default)]
    digestible: Option<Value>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default, alias = "type")]
    division_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNewDivision {
    title: String,
    #[serde(default)]
    seq_index: Option<i64>,
    #[serde(default)]
    level: Option<u32>,
    #[serde(default)]
    parent_index: Option<usize>,
    #[serde(default)]
    digestible: Option<Value>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default, alias = "type")]
    division_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMacroResponse {
    #[serde(default)]
    decisions: Vec<RawDecision>,
    #[serde(default, alias = "sub_divisions")]
    new_divisions: Vec<RawNewDivision>,
}

/// The JSON object between the first `{` and the last `}`; tolerates code fences and chatter.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

pub fn parse_digestibility(value: &Value) -> Option<Digestibility> {
    match value {
        Value::Bool(true) => Some(Digestibility::True),
        Value::Bool(false) => Some(Digestibility::False),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(Digestibility::True),
            "false" | "no" => Some(Digestibility::False),
            "uncertain" | "unknown" | "partial" | "maybe" => Some(Digestibility::Uncertain),
            _ => None,
        },
        _ => None,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

/// Why a proposed division did not survive conversion.
enum NewDivisionDrop {
    EmptyTitle,
    NoAnchor,
}

fn convert_new(
    raw: RawNewDivision,
    bounds: (usize, usize),
    clamped: &mut usize,
) -> Result<NewDivision, NewDivisionDrop> {
    let title = raw.title.trim().to_string();
    if title.is_empty() {
        return Err(NewDivisionDrop::EmptyTitle);
    }
    let Some(requested) = raw.seq_index else {
        warn!("Dropping new division {:?} without a seq_index", title);
        return Err(NewDivisionDrop::NoAnchor);
    };
    let (lo, hi) = bounds;
    let seq_index = requested.clamp(lo as i64, hi as i64) as usize;
    if seq_index as i64 != requested {
        *clamped += 1;
        warn!(
            "Clamped anchor for {:?} from {} to {}",
            title, requested, seq_index
        );
    }
    Ok(NewDivision {
        title,
        seq_index,
        level: raw.level.filter(|l| *l > 0),
        parent_index: raw.parent_index,
        digestible: raw.digestible.as_ref().and_then(parse_digestibility),
        content_type: non_empty(raw.content_type),
        division_type: non_empty(raw.division_type),
    })
}

/// Parses a macro-pass reply. `Err` carries the reason fed back to the oracle.
pub fn parse_macro_response(raw: &str, bounds: (usize, usize)) -> Result<MacroResponse, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON object found in the reply".to_string())?;
    let parsed: RawMacroResponse =
        serde_json::from_str(json).map_err(|e| format!("JSON did not match the schema: {e}"))?;

    let mut response = MacroResponse::default();
    for (position, decision) in parsed.decisions.into_iter().enumerate() {
        let Some((action, aliased)) = DecisionAction::parse(&decision.action) else {
            warn!("Dropping decision with unknown action {:?}", decision.action);
            response.dropped_decisions += 1;
            continue;
        };
        if aliased {
            debug!("Reading oracle action {:?} as {:?}", decision.action, action);
            response.aliased_actions += 1;
        }
        response.decisions.push(Decision {
            index: decision.index,
            position,
            action,
            title: non_empty(decision.title),
            level: decision.level.filter(|l| *l > 0),
            parent_index: decision.parent_index,
            digestible: decision.digestible.as_ref().and_then(parse_digestibility),
            content_type: non_empty(decision.content_type),
            division_type: non_empty(decision.division_type),
        });
    }

    let mut clamped = 0;
    for raw_new in parsed.new_divisions {
        match convert_new(raw_new, bounds, &mut clamped) {
            Ok(new) => response.new_divisions.push(new),
            Err(NewDivisionDrop::NoAnchor) => response.unanchored += 1,
            Err(NewDivisionDrop::EmptyTitle) => {}
        }
    }
    response.clamped_anchors = clamped;
    Ok(response)
}

/// Parses a deep-scan reply; anchors are clamped into the scanned span and
/// any decisions are ignored.
pub fn parse_deep_scan_response(raw: &str, span: (usize, usize)) -> Result<MacroResponse, String> {
    parse_macro_response(raw, span).map(|mut r| {
        r.decisions.clear();
        r.dropped_decisions = 0;
        r
    })
}
