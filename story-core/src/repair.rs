//! The repair cascade: turning unreliable model text into a typed
//! extraction.
//!
//! The upstream generator is asked for a strict JSON contract but honors
//! it only probabilistically, so "parseable" is treated as an outcome to
//! recover toward, not a precondition. Stages are tried in order and the
//! first success wins:
//!
//! 1. direct structural parse of the sliced JSON object
//! 2. syntactic repair of common malformations, then re-parse
//! 3. a second inference round-trip asking the model to correct its own
//!    output, feeding the parser error back in, up to a fixed budget
//! 4. field-level pattern extraction from the broken structure
//! 5. free-text mining of name-like tokens
//!
//! [`repair`] is total: if every stage fails it returns a truncated-raw
//! summary with an empty character map so the turn can proceed.

use crate::extract;
use crate::narrator::{NarrateOptions, Narrator};
use crate::story::Extraction;
use lazy_static::lazy_static;
use ollama::Message;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry budget for the second-opinion round-trip.
const SECOND_OPINION_ATTEMPTS: usize = 3;

/// Character budget for the last-resort truncated summary.
const FALLBACK_SUMMARY_CHARS: usize = 100;

/// Why an individual repair stage rejected the text.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object found")]
    NoJson,

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("nothing recognizable in the text")]
    Unrecognizable,
}

type Stage = fn(&str) -> Result<Extraction, ParseError>;

/// The pure stages, in escalation order. The async second-opinion stage
/// runs between the two groups.
const SYNTACTIC_STAGES: &[(&str, Stage)] = &[
    ("direct-parse", direct_parse),
    ("syntactic-repair", repaired_parse),
];

const SALVAGE_STAGES: &[(&str, Stage)] = &[
    ("field-extraction", field_extraction),
    ("free-text-mining", free_text_mining),
];

/// Recover a typed extraction from arbitrary model output. Never fails.
pub async fn repair<N>(narrator: &N, options: &NarrateOptions, raw: &str) -> Extraction
where
    N: Narrator + ?Sized,
{
    let mut last_error = ParseError::NoJson;

    for (name, stage) in SYNTACTIC_STAGES.iter().copied() {
        match stage(raw) {
            Ok(extraction) => return extraction,
            Err(e) => {
                debug!(stage = name, error = %e, "repair stage rejected text");
                last_error = e;
            }
        }
    }

    if let Some(extraction) = second_opinion(narrator, options, raw, &last_error).await {
        return extraction;
    }

    for (name, stage) in SALVAGE_STAGES.iter().copied() {
        match stage(raw) {
            Ok(extraction) => return extraction,
            Err(e) => debug!(stage = name, error = %e, "repair stage rejected text"),
        }
    }

    Extraction {
        summary: extract::truncate_chars(raw, FALLBACK_SUMMARY_CHARS),
        characters: Default::default(),
    }
}

fn direct_parse(text: &str) -> Result<Extraction, ParseError> {
    let candidate = extract::slice_json_object(text).ok_or(ParseError::NoJson)?;
    serde_json::from_str(candidate).map_err(|e| ParseError::Json(e.to_string()))
}

fn repaired_parse(text: &str) -> Result<Extraction, ParseError> {
    let candidate = extract::slice_json_object(text).ok_or(ParseError::NoJson)?;
    let fixed = repair_text(candidate);
    serde_json::from_str(&fixed).map_err(|e| ParseError::Json(e.to_string()))
}

fn field_extraction(text: &str) -> Result<Extraction, ParseError> {
    let summary = extract::extract_summary_field(text);
    let characters = extract::extract_character_blocks(text);
    if summary.is_none() && characters.is_empty() {
        return Err(ParseError::Unrecognizable);
    }
    Ok(Extraction {
        summary: summary.unwrap_or_default(),
        characters,
    })
}

fn free_text_mining(text: &str) -> Result<Extraction, ParseError> {
    let mined = extract::mine_free_text(text);
    if mined.summary.is_empty() && mined.characters.is_empty() {
        return Err(ParseError::Unrecognizable);
    }
    Ok(mined)
}

/// Ask the model to correct its own malformed output, feeding the parser
/// error back in on each retry. Returns the first attempt that parses.
async fn second_opinion<N>(
    narrator: &N,
    options: &NarrateOptions,
    raw: &str,
    first_error: &ParseError,
) -> Option<Extraction>
where
    N: Narrator + ?Sized,
{
    let mut error_text = first_error.to_string();
    let mut broken_text = raw.to_string();

    for attempt in 1..=SECOND_OPINION_ATTEMPTS {
        let messages = vec![
            Message::system(include_str!("prompts/repair.txt")),
            Message::user(format!(
                "The parser rejected the text below with this error:\n{error_text}\n\n\
                 Text to correct:\n{broken_text}"
            )),
        ];

        let corrected = match narrator.complete(messages, options.clone()).await {
            Ok(corrected) => corrected,
            Err(e) => {
                warn!(error = %e, "second-opinion repair unavailable");
                return None;
            }
        };

        match direct_parse(&corrected).or_else(|_| repaired_parse(&corrected)) {
            Ok(extraction) => return Some(extraction),
            Err(e) => {
                debug!(attempt, error = %e, "second-opinion attempt did not parse");
                error_text = e.to_string();
                broken_text = corrected;
            }
        }
    }

    None
}

lazy_static! {
    static ref CURLY_QUOTES: Regex = Regex::new("[\u{201c}\u{201d}]").expect("quote pattern");
    static ref ESCAPED_QUOTES: Regex = Regex::new(r#"\\+""#).expect("escaped quote pattern");
    static ref BARE_KEYS: Regex =
        Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("bare key pattern");
    static ref TRAILING_SEPARATORS: Regex =
        Regex::new(r",\s*([}\]])").expect("trailing separator pattern");
    static ref ADJACENT_OBJECTS: Regex = Regex::new(r"\}\s*([{\x22])").expect("adjacency pattern");
}

/// Apply the fixed sequence of textual corrections: normalize quote
/// characters, quote unquoted keys, drop trailing separators, and insert
/// the separator missing between adjacent objects.
fn repair_text(text: &str) -> String {
    let text = CURLY_QUOTES.replace_all(text, "\"");
    let text = ESCAPED_QUOTES.replace_all(&text, "\"");
    let text = BARE_KEYS.replace_all(&text, "${1}\"${2}\":");
    let text = TRAILING_SEPARATORS.replace_all(&text, "${1}");
    let text = ADJACENT_OBJECTS.replace_all(&text, "},${1}");
    text.into_owned()
}
