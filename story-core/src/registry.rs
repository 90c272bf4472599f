//! Character registry merging and inactivity pruning.
//!
//! The merger folds one extraction round into the persistent registry.
//! It only ever adds or updates; removal is the pruner's exclusive job.

use crate::reconcile;
use crate::story::{CharacterDelta, CharacterRecord, Extraction};
use ollama::{Message, Role};
use std::collections::BTreeMap;

/// Merge extracted character deltas into the registry.
///
/// Each delta label is reconciled against existing keys (first match
/// wins); matched records get field-level updates, unmatched labels
/// insert new records. Field rules: backstory is replaced only by a
/// non-empty, different value; status only by a non-empty value; all
/// other fields present in the delta replace unconditionally. Applying
/// the same delta twice is a no-op the second time.
pub fn merge_characters(
    registry: &mut BTreeMap<String, CharacterRecord>,
    deltas: &BTreeMap<String, CharacterDelta>,
) {
    for (label, delta) in deltas {
        let matched = reconcile::find_matching_key(
            registry.keys().map(String::as_str),
            label,
        )
        .map(str::to_string);

        match matched {
            Some(key) => {
                if let Some(record) = registry.get_mut(&key) {
                    apply_delta(record, delta);
                }
            }
            None => {
                registry.insert(label.clone(), record_from_delta(label, delta));
            }
        }
    }
}

fn apply_delta(record: &mut CharacterRecord, delta: &CharacterDelta) {
    // The registry key stays authoritative for identity, so the name
    // field is left alone on a fuzzy match.
    if let Some(race) = &delta.race {
        record.race = race.clone();
    }
    if let Some(class) = &delta.class {
        record.class = class.clone();
    }
    if let Some(backstory) = &delta.backstory {
        if !backstory.is_empty() && *backstory != record.backstory {
            record.backstory = backstory.clone();
        }
    }
    if let Some(status) = &delta.status {
        if !status.is_empty() {
            record.status = status.clone();
        }
    }
    for (key, value) in &delta.extra {
        record.extra.insert(key.clone(), value.clone());
    }
}

fn record_from_delta(label: &str, delta: &CharacterDelta) -> CharacterRecord {
    CharacterRecord {
        name: delta
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| label.to_string()),
        race: delta.race.clone().unwrap_or_default(),
        class: delta.class.clone().unwrap_or_default(),
        backstory: delta.backstory.clone().unwrap_or_default(),
        status: delta.status.clone().unwrap_or_default(),
        template_origin: None,
        extra: delta.extra.clone(),
    }
}

/// Concatenate the text of the last `lookback` user turns of a log.
pub fn recent_user_text(log: &[Message], lookback: usize) -> String {
    let mut recent: Vec<&str> = log
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .take(lookback)
        .map(|m| m.content.as_str())
        .collect();
    recent.reverse();
    recent.join("\n")
}

/// Remove registry entries whose names no longer appear in recent player
/// input, keeping the cached structured summary consistent.
///
/// The test is a case-folded substring check, so a character mentioned
/// only by nickname or pronoun in the window is pruned too; that
/// approximation is accepted. Template-derived records are always kept.
/// Returns the removed names.
pub fn prune_inactive(
    registry: &mut BTreeMap<String, CharacterRecord>,
    summary: Option<&mut Extraction>,
    recent_text: &str,
) -> Vec<String> {
    let haystack = recent_text.to_lowercase();

    let removed: Vec<String> = registry
        .iter()
        .filter(|(name, record)| {
            !record.is_template_derived() && !haystack.contains(&name.to_lowercase())
        })
        .map(|(name, _)| name.clone())
        .collect();

    for name in &removed {
        registry.remove(name);
    }

    if let Some(summary) = summary {
        summary.characters.retain(|label, _| {
            !removed
                .iter()
                .any(|name| reconcile::is_same_entity(name, label))
        });
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(
        name: &str,
        race: Option<&str>,
        backstory: Option<&str>,
        status: Option<&str>,
    ) -> CharacterDelta {
        CharacterDelta {
            name: Some(name.to_string()),
            race: race.map(str::to_string),
            class: None,
            backstory: backstory.map(str::to_string),
            status: status.map(str::to_string),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_merge_inserts_new_entry() {
        let mut registry = BTreeMap::new();
        let mut deltas = BTreeMap::new();
        deltas.insert("Mira".to_string(), delta("Mira", Some("Elf"), None, None));

        merge_characters(&mut registry, &deltas);

        assert_eq!(registry["Mira"].race, "Elf");
        assert_eq!(registry["Mira"].class, "");
    }

    #[test]
    fn test_merge_reconciles_drifted_label() {
        let mut registry = BTreeMap::new();
        let mut sam = CharacterRecord::new("Sam Johnson");
        sam.race = "Human".to_string();
        registry.insert("Sam Johnson".to_string(), sam);

        let mut deltas = BTreeMap::new();
        deltas.insert(
            "samjohnson".to_string(),
            delta("samjohnson", None, None, Some("resting at camp")),
        );

        merge_characters(&mut registry, &deltas);

        // No duplicate entry, and the existing key and name survive
        assert_eq!(registry.len(), 1);
        let sam = &registry["Sam Johnson"];
        assert_eq!(sam.name, "Sam Johnson");
        assert_eq!(sam.status, "resting at camp");
    }

    #[test]
    fn test_merge_never_blanks_backstory() {
        let mut registry = BTreeMap::new();
        let mut mira = CharacterRecord::new("Mira");
        mira.backstory = "Fled the burning library.".to_string();
        registry.insert("Mira".to_string(), mira);

        let mut deltas = BTreeMap::new();
        deltas.insert("Mira".to_string(), delta("Mira", None, Some(""), Some("")));

        merge_characters(&mut registry, &deltas);

        assert_eq!(registry["Mira"].backstory, "Fled the burning library.");
    }

    #[test]
    fn test_merge_keeps_fields_absent_from_delta() {
        let mut registry = BTreeMap::new();
        let mut mira = CharacterRecord::new("Mira");
        mira.class = "Wizard".to_string();
        mira.status = "studying".to_string();
        registry.insert("Mira".to_string(), mira);

        let mut deltas = BTreeMap::new();
        deltas.insert("Mira".to_string(), delta("Mira", Some("Elf"), None, None));

        merge_characters(&mut registry, &deltas);

        let mira = &registry["Mira"];
        assert_eq!(mira.race, "Elf");
        assert_eq!(mira.class, "Wizard");
        assert_eq!(mira.status, "studying");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut registry = BTreeMap::new();
        let mut deltas = BTreeMap::new();
        deltas.insert(
            "Mira".to_string(),
            delta("Mira", Some("Elf"), Some("A long tale."), Some("alert")),
        );

        merge_characters(&mut registry, &deltas);
        let once = registry.clone();
        merge_characters(&mut registry, &deltas);

        assert_eq!(registry, once);
    }

    #[test]
    fn test_merge_never_removes_entries() {
        let mut registry = BTreeMap::new();
        registry.insert("Grog".to_string(), CharacterRecord::new("Grog"));

        merge_characters(&mut registry, &BTreeMap::new());

        assert!(registry.contains_key("Grog"));
    }

    #[test]
    fn test_recent_user_text_takes_trailing_window() {
        let log = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::user("third"),
        ];
        assert_eq!(recent_user_text(&log, 2), "second\nthird");
        assert_eq!(recent_user_text(&log, 10), "first\nsecond\nthird");
    }

    #[test]
    fn test_prune_removes_unmentioned_non_template() {
        let mut registry = BTreeMap::new();
        registry.insert("Wisp".to_string(), CharacterRecord::new("Wisp"));
        let mut grog = CharacterRecord::new("Grog");
        grog.template_origin = Some("Grog".to_string());
        registry.insert("Grog".to_string(), grog);

        let mut summary = Extraction::default();
        summary
            .characters
            .insert("Wisp".to_string(), CharacterDelta::default());

        let removed = prune_inactive(
            &mut registry,
            Some(&mut summary),
            "I walk toward the river and make camp",
        );

        assert_eq!(removed, vec!["Wisp".to_string()]);
        assert!(!registry.contains_key("Wisp"));
        assert!(registry.contains_key("Grog"));
        assert!(!summary.characters.contains_key("Wisp"));
    }

    #[test]
    fn test_prune_keeps_mentioned_case_insensitive() {
        let mut registry = BTreeMap::new();
        registry.insert("Mira".to_string(), CharacterRecord::new("Mira"));

        let removed = prune_inactive(&mut registry, None, "i ask MIRA about the key");

        assert!(removed.is_empty());
        assert!(registry.contains_key("Mira"));
    }
}
