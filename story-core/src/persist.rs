//! Named-document persistence for stories and character templates.
//!
//! Each story and each authored character template is one JSON document
//! keyed by its display name. The engine reads and fully rewrites a
//! story's document per turn and per compression, so character-registry
//! and summary updates always land together.

use crate::story::{CharacterRecord, StoryMode, StoryRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no document named '{0}'")]
    NotFound(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current document format version.
const STORE_VERSION: u32 = 1;

/// A persisted story document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedStory {
    /// Document format version for compatibility checking.
    version: u32,

    /// When the document was written.
    saved_at: String,

    /// The complete story state.
    story: StoryRecord,
}

/// A persisted character template.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedCharacter {
    version: u32,
    saved_at: String,
    character: CharacterRecord,
}

/// Summary of a stored story for listings.
#[derive(Debug, Clone)]
pub struct StoryInfo {
    pub name: String,
    pub mode: StoryMode,
    pub description: String,
    pub genre: String,
}

/// Directory-backed document store.
#[derive(Debug, Clone)]
pub struct StoryStore {
    root: PathBuf,
}

impl StoryStore {
    /// Open a store rooted at the given directory. Subdirectories are
    /// created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stories_dir(&self) -> PathBuf {
        self.root.join("stories")
    }

    fn characters_dir(&self) -> PathBuf {
        self.root.join("characters")
    }

    fn story_path(&self, name: &str) -> PathBuf {
        self.stories_dir().join(format!("{}.json", sanitize(name)))
    }

    fn character_path(&self, name: &str) -> PathBuf {
        self.characters_dir()
            .join(format!("{}.json", sanitize(name)))
    }

    // =========================================================================
    // Stories
    // =========================================================================

    /// Write a story document, replacing any previous version.
    pub async fn save_story(&self, story: &StoryRecord) -> Result<(), PersistError> {
        fs::create_dir_all(self.stories_dir()).await?;
        let saved = SavedStory {
            version: STORE_VERSION,
            saved_at: timestamp_now(),
            story: story.clone(),
        };
        let content = serde_json::to_string_pretty(&saved)?;
        fs::write(self.story_path(&story.name), content).await?;
        Ok(())
    }

    /// Load a story document by name.
    pub async fn load_story(&self, name: &str) -> Result<StoryRecord, PersistError> {
        let path = self.story_path(name);
        let content = read_named(&path, name).await?;
        let saved: SavedStory = serde_json::from_str(&content)?;
        check_version(saved.version)?;
        Ok(saved.story)
    }

    /// Whether a story document exists.
    pub async fn story_exists(&self, name: &str) -> bool {
        fs::metadata(self.story_path(name)).await.is_ok()
    }

    /// List all stored stories.
    pub async fn list_stories(&self) -> Result<Vec<StoryInfo>, PersistError> {
        #[derive(Deserialize)]
        struct PartialStory {
            name: String,
            mode: StoryMode,
            #[serde(default)]
            description: String,
            #[serde(default)]
            genre: String,
        }
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            story: PartialStory,
        }

        let mut stories = Vec::new();
        let dir = self.stories_dir();
        if fs::metadata(&dir).await.is_err() {
            return Ok(stories);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(content) = fs::read_to_string(&path).await {
                    if let Ok(partial) = serde_json::from_str::<Partial>(&content) {
                        if partial.version == STORE_VERSION {
                            stories.push(StoryInfo {
                                name: partial.story.name,
                                mode: partial.story.mode,
                                description: partial.story.description,
                                genre: partial.story.genre,
                            });
                        }
                    }
                }
            }
        }

        stories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stories)
    }

    /// Delete a story document.
    pub async fn delete_story(&self, name: &str) -> Result<(), PersistError> {
        let path = self.story_path(name);
        if fs::metadata(&path).await.is_err() {
            return Err(PersistError::NotFound(name.to_string()));
        }
        fs::remove_file(path).await?;
        Ok(())
    }

    // =========================================================================
    // Character templates
    // =========================================================================

    /// Write a character template, replacing any previous version.
    pub async fn save_character(&self, character: &CharacterRecord) -> Result<(), PersistError> {
        fs::create_dir_all(self.characters_dir()).await?;
        let saved = SavedCharacter {
            version: STORE_VERSION,
            saved_at: timestamp_now(),
            character: character.clone(),
        };
        let content = serde_json::to_string_pretty(&saved)?;
        fs::write(self.character_path(&character.name), content).await?;
        Ok(())
    }

    /// Load a character template by name.
    pub async fn load_character(&self, name: &str) -> Result<CharacterRecord, PersistError> {
        let path = self.character_path(name);
        let content = read_named(&path, name).await?;
        let saved: SavedCharacter = serde_json::from_str(&content)?;
        check_version(saved.version)?;
        Ok(saved.character)
    }

    /// Whether a character template exists.
    pub async fn character_exists(&self, name: &str) -> bool {
        fs::metadata(self.character_path(name)).await.is_ok()
    }

    /// List all stored character templates, sorted by name.
    pub async fn list_characters(&self) -> Result<Vec<CharacterRecord>, PersistError> {
        let mut characters = Vec::new();
        let dir = self.characters_dir();
        if fs::metadata(&dir).await.is_err() {
            return Ok(characters);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(content) = fs::read_to_string(&path).await {
                    if let Ok(saved) = serde_json::from_str::<SavedCharacter>(&content) {
                        if saved.version == STORE_VERSION {
                            characters.push(saved.character);
                        }
                    }
                }
            }
        }

        characters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(characters)
    }

    /// Delete a character template.
    pub async fn delete_character(&self, name: &str) -> Result<(), PersistError> {
        let path = self.character_path(name);
        if fs::metadata(&path).await.is_err() {
            return Err(PersistError::NotFound(name.to_string()));
        }
        fs::remove_file(path).await?;
        Ok(())
    }
}

async fn read_named(path: &Path, name: &str) -> Result<String, PersistError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PersistError::NotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn check_version(found: u32) -> Result<(), PersistError> {
    if found != STORE_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: STORE_VERSION,
            found,
        });
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Get current timestamp in seconds since the epoch.
fn timestamp_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_story(name: &str) -> StoryRecord {
        StoryRecord::new(name, StoryMode::Dnd, "A test story", "fantasy")
    }

    #[tokio::test]
    async fn test_story_save_and_load() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        let mut story = sample_story("Emberfall");
        story
            .characters
            .insert("Mira".to_string(), CharacterRecord::new("Mira"));
        store.save_story(&story).await.expect("save");

        let loaded = store.load_story("Emberfall").await.expect("load");
        assert_eq!(loaded.name, "Emberfall");
        assert_eq!(loaded.mode, StoryMode::Dnd);
        assert!(loaded.characters.contains_key("Mira"));
    }

    #[tokio::test]
    async fn test_load_missing_story() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        let result = store.load_story("Nowhere").await;
        assert!(matches!(result, Err(PersistError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_stories_sorted() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        for name in ["Charlie", "Alpha", "Beta"] {
            store.save_story(&sample_story(name)).await.expect("save");
        }

        let listed = store.list_stories().await.expect("list");
        let names: Vec<_> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Charlie"]);
    }

    #[tokio::test]
    async fn test_list_stories_empty_root() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path().join("missing"));
        assert!(store.list_stories().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_delete_story() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        store.save_story(&sample_story("Gone")).await.expect("save");
        assert!(store.story_exists("Gone").await);

        store.delete_story("Gone").await.expect("delete");
        assert!(!store.story_exists("Gone").await);

        let result = store.delete_story("Gone").await;
        assert!(matches!(result, Err(PersistError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_character_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        let mut grog = CharacterRecord::new("Grog");
        grog.race = "Half-Orc".to_string();
        grog.class = "Barbarian".to_string();
        store.save_character(&grog).await.expect("save");

        let loaded = store.load_character("Grog").await.expect("load");
        assert_eq!(loaded.race, "Half-Orc");

        let listed = store.list_characters().await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_sanitized_file_names() {
        let dir = TempDir::new().expect("temp dir");
        let store = StoryStore::new(dir.path());

        store
            .save_story(&sample_story("Bob's Tale!"))
            .await
            .expect("save");

        assert!(store.story_exists("Bob's Tale!").await);
        let path = store.story_path("Bob's Tale!");
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(file_name, "Bob_s_Tale_.json");
    }
}
