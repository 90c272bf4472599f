//! Story data model: persisted records, character sheets, and the
//! system-message head of the inference context.
//!
//! A story keeps two parallel conversation logs. The *display log* holds
//! everything ever said and is only replayed to the user; the *context log*
//! is the bounded working set actually sent to inference. The first three
//! entries of the context log are always system messages (persona, story
//! details, cast details) and are rewritten in place on every turn.

use crate::context::SYSTEM_HEAD_LEN;
use ollama::{Message, Role};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// The storytelling persona driving a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryMode {
    /// Rules-aware tabletop game master.
    Dnd,
    /// Freeform prose storyteller.
    Novel,
}

impl StoryMode {
    /// The persona system prompt for this mode.
    pub fn persona(&self) -> &'static str {
        match self {
            StoryMode::Dnd => include_str!("prompts/dnd_mode.txt"),
            StoryMode::Novel => include_str!("prompts/novel_mode.txt"),
        }
    }
}

/// A character known to a story.
///
/// The name doubles as the registry key. Records created from an authored
/// template carry `template_origin` and are exempt from inactivity pruning.
/// `extra` holds any additional attributes (ability scores, equipment, ...)
/// flattened into the serialized object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    #[serde(default)]
    pub race: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_origin: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CharacterRecord {
    /// Create an empty record with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether this record was copied from an authored template.
    pub fn is_template_derived(&self) -> bool {
        self.template_origin.is_some()
    }

    /// One cast-sheet paragraph for the system head.
    pub fn describe(&self) -> String {
        let race = non_empty_or(&self.race, "Unknown");
        let class = non_empty_or(&self.class, "Unknown");
        let backstory = non_empty_or(&self.backstory, "No backstory");
        let mut details = format!(
            "{} (Race: {race}, Class: {class})\nBackstory: {backstory}\n",
            self.name
        );
        if !self.extra.is_empty() {
            let advanced: Vec<String> = self
                .extra
                .iter()
                .map(|(key, value)| format!("{key}: {}", render_value(value)))
                .collect();
            details.push_str(&format!("Advanced: {}\n", advanced.join(", ")));
        }
        details
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Partial character data pulled out of one extraction round.
///
/// Only fields the upstream text actually contained are set; the merge
/// rules in [`crate::registry`] decide what an absent field means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backstory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Summary and cast-of-characters extraction produced by the repair
/// cascade and cached on the story record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub summary: String,
    #[serde(rename = "character_creation")]
    pub characters: BTreeMap<String, CharacterDelta>,
}

/// The persisted document for one story, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRecord {
    pub name: String,
    pub mode: StoryMode,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub genre: String,
    /// Canonical name-keyed registry. Older documents stored a bare list;
    /// that shape is normalized here so nothing downstream branches on it.
    #[serde(default, deserialize_with = "characters_map_or_list")]
    pub characters: BTreeMap<String, CharacterRecord>,
    #[serde(default)]
    pub display_log: Vec<Message>,
    #[serde(default)]
    pub context_log: Vec<Message>,
    #[serde(default)]
    pub current_summary: Option<Extraction>,
}

impl StoryRecord {
    /// Create a fresh story with empty logs.
    pub fn new(
        name: impl Into<String>,
        mode: StoryMode,
        description: impl Into<String>,
        genre: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            description: description.into(),
            genre: genre.into(),
            characters: BTreeMap::new(),
            display_log: Vec::new(),
            context_log: Vec::new(),
            current_summary: None,
        }
    }

    /// The narrative summary text, if a compression has run.
    pub fn summary_text(&self) -> &str {
        self.current_summary
            .as_ref()
            .map(|s| s.summary.as_str())
            .unwrap_or("")
    }

    /// Rewrite the three leading system messages of the context log to
    /// reflect the current story and cast state, seeding both logs when
    /// the story has no conversation yet.
    pub fn refresh_system_head(&mut self) {
        let head = [
            Message::system(self.mode.persona()),
            self.story_details_message(),
            self.cast_details_message(),
        ];

        if self.context_log.len() >= SYSTEM_HEAD_LEN {
            for (slot, message) in self.context_log[..SYSTEM_HEAD_LEN]
                .iter_mut()
                .zip(head.iter())
            {
                *slot = message.clone();
            }
        } else {
            let tail: Vec<Message> = self
                .context_log
                .drain(..)
                .filter(|m| m.role != Role::System)
                .collect();
            self.context_log = head.to_vec();
            self.context_log.extend(tail);
        }

        if self.display_log.is_empty() {
            self.display_log = head.to_vec();
        }
    }

    fn story_details_message(&self) -> Message {
        Message::system(format!(
            "Story Details:\nName: {}\nDescription: {}\nGenre: {}\n",
            non_empty_or(&self.name, "Unknown"),
            non_empty_or(&self.description, "No description"),
            non_empty_or(&self.genre, "N/A"),
        ))
    }

    fn cast_details_message(&self) -> Message {
        let mut details = String::from("Story Characters:\n");
        for record in self.characters.values() {
            details.push_str(&record.describe());
        }
        Message::system(details)
    }
}

fn characters_map_or_list<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, CharacterRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Map(BTreeMap<String, CharacterRecord>),
        List(Vec<CharacterRecord>),
    }

    Ok(match Shape::deserialize(deserializer)? {
        Shape::Map(map) => map,
        Shape::List(list) => list
            .into_iter()
            .filter(|record| !record.name.is_empty())
            .map(|record| (record.name.clone(), record))
            .collect(),
    })
}
