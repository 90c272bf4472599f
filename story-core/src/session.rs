//! Story sessions: the per-story state directory, streaming chat turns,
//! and the background compression task.
//!
//! Every story lives behind its own async mutex inside an explicit
//! directory keyed by story name; cross-story operations never contend.
//! A chat turn streams the reply to the caller and finalizes through a
//! drop-scoped guard, so whatever was accumulated gets persisted even
//! when the consumer stops reading early. Compression runs afterwards in
//! a supervised background task, serialized per story, and never holds
//! the story lock across an inference call.

use crate::context;
use crate::narrator::{NarrateOptions, Narrator, NarratorError};
use crate::persist::{PersistError, StoryInfo, StoryStore};
use crate::registry;
use crate::repair;
use crate::story::{CharacterRecord, StoryMode, StoryRecord};
use crate::stream::{Segment, ThoughtSegmenter};
use futures::{Stream, StreamExt};
use ollama::Message;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Compressing more aggressively than this starves the summarizer of
/// material and loops it on its own output.
const MIN_COMPRESSION_THRESHOLD: usize = 3;

/// Errors from story session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("story '{0}' not found")]
    StoryNotFound(String),

    #[error("character '{0}' not found")]
    CharacterNotFound(String),

    #[error("character '{0}' already exists")]
    CharacterExists(String),

    #[error("no message provided")]
    EmptyMessage,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("inference error: {0}")]
    Narrator(#[from] NarratorError),
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model override forwarded to the inference backend.
    pub model: Option<String>,

    /// Context window size (`num_ctx`) forwarded per call.
    pub context_size: u64,

    /// User messages past the summary marker that trigger compression.
    /// Doubles as the number of trailing messages retained afterwards.
    pub compression_threshold: usize,

    /// User turns scanned by the inactivity pruner.
    pub prune_lookback: usize,

    /// Whether the pruner runs after each compression.
    pub prune_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            context_size: 4096,
            compression_threshold: MIN_COMPRESSION_THRESHOLD,
            prune_lookback: 10,
            prune_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_context_size(mut self, context_size: u64) -> Self {
        self.context_size = context_size;
        self
    }

    /// Set the compression threshold, clamped to the supported minimum.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold.max(MIN_COMPRESSION_THRESHOLD);
        self
    }

    pub fn with_prune_lookback(mut self, lookback: usize) -> Self {
        self.prune_lookback = lookback;
        self
    }

    pub fn with_pruning(mut self, enabled: bool) -> Self {
        self.prune_enabled = enabled;
        self
    }

    fn narrate_options(&self) -> NarrateOptions {
        NarrateOptions {
            model: self.model.clone(),
            num_ctx: Some(self.context_size),
        }
    }
}

/// Parameters for creating (or re-configuring) a story.
#[derive(Debug, Clone)]
pub struct NewStory {
    pub name: String,
    pub mode: StoryMode,
    pub description: String,
    pub genre: String,
    /// Names of authored character templates to copy into the cast.
    pub characters: Vec<String>,
}

impl NewStory {
    pub fn new(name: impl Into<String>, mode: StoryMode) -> Self {
        Self {
            name: name.into(),
            mode,
            description: String::new(),
            genre: String::new(),
            characters: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    pub fn with_characters(mut self, characters: Vec<String>) -> Self {
        self.characters = characters;
        self
    }
}

/// The caller-facing stream of one chat turn.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<Segment, NarratorError>> + Send>>;

/// Per-story live state.
struct StoryCell {
    /// Single-writer guard over the story's logs and registry.
    state: Mutex<StoryRecord>,
    /// Serializes compression runs for this story.
    compression: Mutex<()>,
    /// The story's current background task, for await/cancel.
    background: StdMutex<Option<JoinHandle<()>>>,
}

impl StoryCell {
    fn new(record: StoryRecord) -> Self {
        Self {
            state: Mutex::new(record),
            compression: Mutex::new(()),
            background: StdMutex::new(None),
        }
    }
}

/// Story-keyed state directory and the primary public API.
pub struct StoryDirectory<N> {
    narrator: Arc<N>,
    store: StoryStore,
    config: EngineConfig,
    stories: Mutex<HashMap<String, Arc<StoryCell>>>,
}

impl<N: Narrator + 'static> StoryDirectory<N> {
    /// Create a directory over the given backend and document store.
    pub fn new(narrator: N, store: StoryStore, config: EngineConfig) -> Self {
        Self {
            narrator: Arc::new(narrator),
            store,
            config,
            stories: Mutex::new(HashMap::new()),
        }
    }

    /// Create a story, or re-configure an existing one in place. The
    /// conversation logs of an existing story are kept; its cast is
    /// replaced by fresh copies of the named templates.
    pub async fn create_story(&self, new: NewStory) -> Result<StoryRecord, SessionError> {
        if new.name.trim().is_empty() {
            return Err(SessionError::Config("story name is required".to_string()));
        }

        let mut cast = BTreeMap::new();
        for template_name in &new.characters {
            match self.store.load_character(template_name).await {
                Ok(mut character) => {
                    character.template_origin = Some(template_name.clone());
                    cast.insert(character.name.clone(), character);
                }
                Err(PersistError::NotFound(_)) => {
                    return Err(SessionError::CharacterNotFound(template_name.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut stories = self.stories.lock().await;

        let record = if let Some(cell) = stories.get(&new.name) {
            let mut state = cell.state.lock().await;
            state.mode = new.mode;
            state.description = new.description;
            state.genre = new.genre;
            state.characters = cast;
            state.clone()
        } else {
            let mut record = match self.store.load_story(&new.name).await {
                Ok(existing) => existing,
                Err(PersistError::NotFound(_)) => {
                    StoryRecord::new(&new.name, new.mode, "", "")
                }
                Err(e) => return Err(e.into()),
            };
            record.mode = new.mode;
            record.description = new.description;
            record.genre = new.genre;
            record.characters = cast;
            stories.insert(new.name.clone(), Arc::new(StoryCell::new(record.clone())));
            record
        };

        self.store.save_story(&record).await?;
        Ok(record)
    }

    /// Load a story into the directory and return a snapshot of it.
    pub async fn load_story(&self, name: &str) -> Result<StoryRecord, SessionError> {
        let cell = self.cell(name).await?;
        let state = cell.state.lock().await;
        Ok(state.clone())
    }

    /// A snapshot of the story's current in-memory state.
    pub async fn story(&self, name: &str) -> Result<StoryRecord, SessionError> {
        self.load_story(name).await
    }

    /// List all stored stories.
    pub async fn list_stories(&self) -> Result<Vec<StoryInfo>, SessionError> {
        Ok(self.store.list_stories().await?)
    }

    /// Delete a story, cancelling its background task.
    pub async fn delete_story(&self, name: &str) -> Result<(), SessionError> {
        let cell = self.stories.lock().await.remove(name);
        if let Some(cell) = cell {
            if let Ok(mut slot) = cell.background.lock() {
                if let Some(handle) = slot.take() {
                    handle.abort();
                }
            }
        }
        match self.store.delete_story(name).await {
            Ok(()) => Ok(()),
            Err(PersistError::NotFound(_)) => Err(SessionError::StoryNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Author a reusable character template.
    pub async fn create_character(
        &self,
        character: CharacterRecord,
    ) -> Result<(), SessionError> {
        if character.name.trim().is_empty() {
            return Err(SessionError::Config(
                "character name is required".to_string(),
            ));
        }
        if self.store.character_exists(&character.name).await {
            return Err(SessionError::CharacterExists(character.name));
        }
        Ok(self.store.save_character(&character).await?)
    }

    /// Overwrite an existing character template.
    pub async fn update_character(
        &self,
        character: CharacterRecord,
    ) -> Result<(), SessionError> {
        if !self.store.character_exists(&character.name).await {
            return Err(SessionError::CharacterNotFound(character.name));
        }
        Ok(self.store.save_character(&character).await?)
    }

    /// List all authored character templates.
    pub async fn list_characters(&self) -> Result<Vec<CharacterRecord>, SessionError> {
        Ok(self.store.list_characters().await?)
    }

    /// Delete a character template.
    pub async fn delete_character(&self, name: &str) -> Result<(), SessionError> {
        match self.store.delete_character(name).await {
            Ok(()) => Ok(()),
            Err(PersistError::NotFound(_)) => {
                Err(SessionError::CharacterNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one chat turn, streaming the reply as display segments.
    ///
    /// The returned stream must be consumed inside a Tokio runtime: when
    /// it is dropped, whether fully read or abandoned mid-reply, a
    /// finalizer persists whatever was accumulated and, when the
    /// compression condition holds, kicks off the background
    /// summarization task.
    pub async fn chat_turn(
        &self,
        story_name: &str,
        user_input: &str,
    ) -> Result<TurnStream, SessionError> {
        if user_input.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let cell = self.cell(story_name).await?;

        let request_log = {
            let mut state = cell.state.lock().await;
            state.refresh_system_head();
            let message = Message::user(user_input);
            state.display_log.push(message.clone());
            state.context_log.push(message);
            state.context_log.clone()
        };

        // Inference happens outside the story lock
        let fragments = self
            .narrator
            .stream(request_log, self.config.narrate_options())
            .await?;

        let accumulated = Arc::new(StdMutex::new(String::new()));
        let segmenter = Arc::new(StdMutex::new(ThoughtSegmenter::new()));

        let acc = accumulated.clone();
        let seg = segmenter.clone();
        let segments = fragments
            .map(move |item| -> Vec<Result<Segment, NarratorError>> {
                match item {
                    Ok(text) => {
                        if let Ok(mut buffer) = acc.lock() {
                            buffer.push_str(&text);
                        }
                        match seg.lock() {
                            Ok(mut segmenter) => {
                                segmenter.push(&text).into_iter().map(Ok).collect()
                            }
                            Err(_) => Vec::new(),
                        }
                    }
                    Err(e) => vec![Err(e)],
                }
            })
            .flat_map(futures::stream::iter);

        // Release any text held back as a potential partial tag once the
        // upstream stream ends
        let flush = futures::stream::once(futures::future::lazy(move |_| {
            let tail = match segmenter.lock() {
                Ok(mut segmenter) => std::mem::take(&mut *segmenter).finish(),
                Err(_) => Vec::new(),
            };
            futures::stream::iter(tail.into_iter().map(Ok))
        }))
        .flatten();

        let finalizer = TurnFinalizer {
            cell,
            narrator: self.narrator.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            accumulated,
        };

        let guarded = segments.chain(flush).map(move |item| {
            let _keep_alive = &finalizer;
            item
        });

        Ok(Box::pin(guarded))
    }

    /// Wait until the story's background work (persist + compression)
    /// has drained. Used by tests and orderly shutdown.
    pub async fn wait_idle(&self, story_name: &str) {
        let cell = self.stories.lock().await.get(story_name).cloned();
        let Some(cell) = cell else {
            return;
        };
        loop {
            let handle = match cell.background.lock() {
                Ok(mut slot) => slot.take(),
                Err(_) => None,
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    async fn cell(&self, name: &str) -> Result<Arc<StoryCell>, SessionError> {
        let mut stories = self.stories.lock().await;
        if let Some(cell) = stories.get(name) {
            return Ok(cell.clone());
        }
        let record = match self.store.load_story(name).await {
            Ok(record) => record,
            Err(PersistError::NotFound(_)) => {
                return Err(SessionError::StoryNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let cell = Arc::new(StoryCell::new(record));
        stories.insert(name.to_string(), cell.clone());
        Ok(cell)
    }
}

/// Drop guard carrying the turn's accumulated reply into persistence.
struct TurnFinalizer<N: Narrator + 'static> {
    cell: Arc<StoryCell>,
    narrator: Arc<N>,
    store: StoryStore,
    config: EngineConfig,
    accumulated: Arc<StdMutex<String>>,
}

impl<N: Narrator + 'static> Drop for TurnFinalizer<N> {
    fn drop(&mut self) {
        let cell = self.cell.clone();
        let narrator = self.narrator.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let accumulated = self.accumulated.clone();

        let handle = tokio::spawn(async move {
            finalize_turn(cell, narrator, store, config, accumulated).await;
        });

        if let Ok(mut slot) = self.cell.background.lock() {
            *slot = Some(handle);
        }
    }
}

/// Persist the accumulated reply (complete or truncated by a disconnect)
/// and run compression if the context log qualifies.
async fn finalize_turn<N: Narrator + ?Sized>(
    cell: Arc<StoryCell>,
    narrator: Arc<N>,
    store: StoryStore,
    config: EngineConfig,
    accumulated: Arc<StdMutex<String>>,
) {
    let reply = match accumulated.lock() {
        Ok(mut buffer) => std::mem::take(&mut *buffer),
        Err(_) => String::new(),
    };
    if reply.is_empty() {
        return;
    }

    {
        let mut state = cell.state.lock().await;
        let message = Message::assistant(reply);
        state.display_log.push(message.clone());
        state.context_log.push(message);
        if let Err(e) = store.save_story(&state).await {
            warn!(story = %state.name, error = %e, "failed to persist turn");
        }
    }

    compress_if_needed(&cell, narrator.as_ref(), &store, &config).await;
}

/// Compress the story's context log if the trigger condition holds.
///
/// Runs under the story's compression mutex so overlapping turns
/// serialize rather than race; the story lock itself is held only to
/// snapshot input and to apply results, never across inference. An
/// upstream failure logs and leaves the context log unmodified, so the
/// next qualifying turn simply retries.
async fn compress_if_needed<N: Narrator + ?Sized>(
    cell: &StoryCell,
    narrator: &N,
    store: &StoryStore,
    config: &EngineConfig,
) {
    let _serialized = cell.compression.lock().await;

    let (story_name, transcript, snapshot) = {
        let state = cell.state.lock().await;
        if !context::should_compress(&state.context_log, config.compression_threshold) {
            return;
        }
        (
            state.name.clone(),
            context::compression_input(&state.context_log),
            state.context_log.clone(),
        )
    };

    debug!(story = %story_name, "compressing context log");

    let raw = match narrator
        .complete(
            context::summarizer_messages(transcript),
            config.narrate_options(),
        )
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            warn!(story = %story_name, error = %e, "compression skipped: summarizer unavailable");
            return;
        }
    };
    debug!(story = %story_name, raw = %raw, "summarizer response");

    let extraction = repair::repair(narrator, &config.narrate_options(), &raw).await;

    let mut state = cell.state.lock().await;

    let mut rebuilt = context::rebuild_log(
        &snapshot,
        &extraction.summary,
        config.compression_threshold,
    );
    // Turns that landed while the summarizer ran are carried over intact
    if state.context_log.len() > snapshot.len() {
        rebuilt.extend_from_slice(&state.context_log[snapshot.len()..]);
    }
    state.context_log = rebuilt;

    registry::merge_characters(&mut state.characters, &extraction.characters);
    state.current_summary = Some(extraction);

    if config.prune_enabled {
        let recent = registry::recent_user_text(&state.display_log, config.prune_lookback);
        let StoryRecord {
            characters,
            current_summary,
            ..
        } = &mut *state;
        let removed = registry::prune_inactive(characters, current_summary.as_mut(), &recent);
        if !removed.is_empty() {
            debug!(story = %story_name, removed = ?removed, "pruned inactive characters");
        }
    }

    if let Err(e) = store.save_story(&state).await {
        warn!(story = %story_name, error = %e, "failed to persist compression");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.compression_threshold, 3);
        assert_eq!(config.context_size, 4096);
        assert!(config.prune_enabled);
    }

    #[test]
    fn test_config_threshold_clamped() {
        let config = EngineConfig::new().with_compression_threshold(1);
        assert_eq!(config.compression_threshold, MIN_COMPRESSION_THRESHOLD);

        let config = EngineConfig::new().with_compression_threshold(7);
        assert_eq!(config.compression_threshold, 7);
    }

    #[test]
    fn test_new_story_builder() {
        let new = NewStory::new("Emberfall", StoryMode::Novel)
            .with_description("A siege")
            .with_genre("fantasy")
            .with_characters(vec!["Grog".to_string()]);

        assert_eq!(new.name, "Emberfall");
        assert_eq!(new.mode, StoryMode::Novel);
        assert_eq!(new.characters, vec!["Grog".to_string()]);
    }
}
