//! Stateless pattern extraction from unreliable model output.
//!
//! These functions pull a candidate JSON object, and failing that,
//! individual fields, out of arbitrary text. They make no attempt to
//! validate the result as a whole; that is the repair cascade's job.

use crate::story::{CharacterDelta, Extraction};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    static ref SUMMARY_FIELD: Regex =
        Regex::new(r#""summary"\s*:\s*"([^"]+)""#).expect("summary pattern");
    static ref CHAR_SECTION: Regex =
        Regex::new(r#"(?s)"character_creation"\s*:\s*\{(.*)\}"#).expect("section pattern");
    static ref CHAR_BLOCK: Regex =
        Regex::new(r#""([^"]+)"\s*:\s*\{([^{}]*(?:\{[^{}]*\}[^{}]*)*?)\}"#)
            .expect("block pattern");
    static ref CHAR_PROP: Regex =
        Regex::new(r#""([^"]+)"\s*:\s*"?([^",}]*)"?"#).expect("prop pattern");
    static ref NAME_ANCHOR: Regex =
        Regex::new(r"(?:[Nn]amed?|[Cc]haracter)[^A-Z]{0,15}([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)")
            .expect("name anchor pattern");
    static ref RACE_ANCHOR: Regex =
        Regex::new(r"(?:[Rr]ace)[^A-Za-z0-9]{0,10}([A-Z][a-z]+(?:-[A-Z][a-z]+)?)")
            .expect("race anchor pattern");
    static ref CLASS_ANCHOR: Regex =
        Regex::new(r"(?:[Cc]lass)[^A-Za-z0-9]{0,10}([A-Z][a-z]+)").expect("class anchor pattern");
    static ref QUOTED_SPAN: Regex =
        Regex::new(r#""([^"\n]{15,300})""#).expect("quoted span pattern");
}

/// Slice the candidate JSON object out of a response: strip known
/// preambles and markdown fences, then take first `{` to last `}`.
pub fn slice_json_object(text: &str) -> Option<&str> {
    let mut text = text.trim();

    if let Some(rest) = text.strip_prefix("SUMMARY:") {
        text = rest.trim_start();
    }

    // Handle ```json ... ``` blocks (with or without the specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        let content_start = match text[content_start..].find('\n') {
            Some(nl) if text[content_start..content_start + nl].len() <= 8 => {
                content_start + nl + 1
            }
            _ => content_start,
        };
        if let Some(end) = text[content_start..].find("```") {
            text = text[content_start..content_start + end].trim();
        }
    }

    let open = text.find('{')?;
    let close = text.rfind('}')?;
    if close < open {
        return None;
    }
    Some(&text[open..=close])
}

/// Locate the summary string by anchored pattern, ignoring the
/// surrounding structure entirely.
pub fn extract_summary_field(text: &str) -> Option<String> {
    SUMMARY_FIELD
        .captures(text)
        .map(|c| clean_scalar(&c[1]))
        .filter(|s| !s.is_empty())
}

/// Locate per-character sub-objects even when the enclosing JSON is
/// broken, reconstructing a best-effort delta per block. Sub-fields the
/// block does not contain default to `"Unknown"` (race, class) or the
/// empty string (backstory, status).
pub fn extract_character_blocks(text: &str) -> BTreeMap<String, CharacterDelta> {
    let mut characters = BTreeMap::new();

    let Some(section) = CHAR_SECTION.captures(text) else {
        return characters;
    };

    for block in CHAR_BLOCK.captures_iter(&section[1]) {
        let name = block[1].replace(['"', '\\'], "").trim().to_string();
        if name.is_empty() || name == "character_creation" {
            continue;
        }

        let mut delta = CharacterDelta {
            name: Some(name.clone()),
            race: Some("Unknown".to_string()),
            class: Some("Unknown".to_string()),
            backstory: Some(String::new()),
            status: Some(String::new()),
            extra: BTreeMap::new(),
        };

        for prop in CHAR_PROP.captures_iter(&block[2]) {
            let value = clean_scalar(&prop[2]);
            match prop[1].trim() {
                "name" => delta.name = Some(value),
                "race" => delta.race = Some(value),
                "class" => delta.class = Some(value),
                "backstory" => delta.backstory = Some(value),
                "status" => delta.status = Some(value),
                _ => {}
            }
        }

        characters.insert(name, delta);
    }

    characters
}

/// Last-resort mining of plain prose: capitalized name-like tokens near
/// "name"/"character" anchors become minimal character stubs, and the
/// summary falls back to the first sentence-like quoted span.
pub fn mine_free_text(text: &str) -> Extraction {
    let mut characters = BTreeMap::new();

    for anchor in NAME_ANCHOR.captures_iter(text) {
        let name = anchor[1].trim().to_string();
        if name.is_empty() || characters.contains_key(&name) {
            continue;
        }

        // Look for race/class hints in the prose trailing the mention
        let tail_start = anchor.get(0).map(|m| m.end()).unwrap_or(0);
        let tail_end = (tail_start + 160).min(text.len());
        let tail = slice_at_char_boundaries(text, tail_start, tail_end);

        let delta = CharacterDelta {
            name: Some(name.clone()),
            race: RACE_ANCHOR.captures(tail).map(|c| c[1].to_string()),
            class: CLASS_ANCHOR.captures(tail).map(|c| c[1].to_string()),
            ..CharacterDelta::default()
        };
        characters.insert(name, delta);
    }

    let summary = QUOTED_SPAN
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|span| span.contains(' '))
        .unwrap_or_default();

    Extraction {
        summary,
        characters,
    }
}

/// Truncate to at most `max` characters, appending an ellipsis when
/// anything was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let truncated: String = text.chars().take(max).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

fn clean_scalar(raw: &str) -> String {
    let collapsed: String = raw
        .replace(['\n', '\r', '\t'], " ")
        .replace('\\', "")
        .trim()
        .to_string();
    collapsed
}

fn slice_at_char_boundaries(text: &str, start: usize, end: usize) -> &str {
    let mut end = end;
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_plain_object() {
        let text = r#"{"summary": "x", "character_creation": {}}"#;
        assert_eq!(slice_json_object(text), Some(text));
    }

    #[test]
    fn test_slice_with_preamble_and_trailer() {
        let text = "SUMMARY: Here is the result:\n{\"summary\": \"x\"}\nHope that helps!";
        assert_eq!(slice_json_object(text), Some("{\"summary\": \"x\"}"));
    }

    #[test]
    fn test_slice_markdown_fence() {
        let text = "```json\n{\"summary\": \"x\"}\n```";
        assert_eq!(slice_json_object(text), Some("{\"summary\": \"x\"}"));
    }

    #[test]
    fn test_slice_rejects_braceless_text() {
        assert_eq!(slice_json_object("no json here"), None);
    }

    #[test]
    fn test_extract_summary_field_from_broken_json() {
        let text = r#"{"summary": "The party fled the keep", "character_creation": {broken"#;
        assert_eq!(
            extract_summary_field(text).as_deref(),
            Some("The party fled the keep")
        );
    }

    #[test]
    fn test_extract_character_blocks_defaults() {
        let text = r#"
            "character_creation": {
                "Mira": {"name": "Mira", "race": "Elf"},
                "Grog": {"name": "Grog", "class": "Barbarian", "status": "wounded"}
            }
        "#;
        let characters = extract_character_blocks(text);
        assert_eq!(characters.len(), 2);

        let mira = &characters["Mira"];
        assert_eq!(mira.race.as_deref(), Some("Elf"));
        assert_eq!(mira.class.as_deref(), Some("Unknown"));
        assert_eq!(mira.backstory.as_deref(), Some(""));

        let grog = &characters["Grog"];
        assert_eq!(grog.class.as_deref(), Some("Barbarian"));
        assert_eq!(grog.status.as_deref(), Some("wounded"));
    }

    #[test]
    fn test_extract_character_blocks_ignores_missing_section() {
        assert!(extract_character_blocks("just some prose").is_empty());
    }

    #[test]
    fn test_mine_free_text_names_and_hints() {
        let text = "A new character named Elira Vex appears. Her race: Elf, class: Ranger. \
                    \"She came to settle an old debt in the burning city.\"";
        let mined = mine_free_text(text);
        let elira = &mined.characters["Elira Vex"];
        assert_eq!(elira.race.as_deref(), Some("Elf"));
        assert_eq!(elira.class.as_deref(), Some("Ranger"));
        assert!(mined.summary.contains("old debt"));
    }

    #[test]
    fn test_mine_free_text_empty_input() {
        let mined = mine_free_text("");
        assert!(mined.summary.is_empty());
        assert!(mined.characters.is_empty());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 100), "short");
        let long = "x".repeat(150);
        let truncated = truncate_chars(&long, 100);
        assert_eq!(truncated.chars().count(), 103);
        assert!(truncated.ends_with("..."));
    }
}
