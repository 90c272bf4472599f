//! Conversational story engine with bounded-memory summarization.
//!
//! This crate keeps a long-running narrative coherent across an unbounded
//! number of turns despite a bounded inference context window:
//! - Streaming chat turns with `<think>` reasoning segmented out
//! - Context-log compression through an LLM summarizer
//! - A repair cascade that recovers typed data from unreliable model text
//! - A persistent character registry with fuzzy identity reconciliation
//!   and inactivity pruning
//!
//! # Quick Start
//!
//! ```ignore
//! use futures::StreamExt;
//! use story_core::{EngineConfig, NewStory, StoryDirectory, StoryMode, StoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directory = StoryDirectory::new(
//!         ollama::Ollama::from_env(),
//!         StoryStore::new("./data"),
//!         EngineConfig::default(),
//!     );
//!
//!     directory
//!         .create_story(NewStory::new("Emberfall", StoryMode::Dnd))
//!         .await?;
//!
//!     let mut reply = directory.chat_turn("Emberfall", "I enter the tavern").await?;
//!     while let Some(segment) = reply.next().await {
//!         println!("{:?}", segment?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod extract;
pub mod narrator;
pub mod persist;
pub mod reconcile;
pub mod registry;
pub mod repair;
pub mod session;
pub mod story;
pub mod stream;
pub mod testing;

// Re-export the wire types shared with the client crate
pub use ollama::{Message, Role};

// Primary public API
pub use narrator::{NarrateOptions, Narrator, NarratorError};
pub use persist::{PersistError, StoryInfo, StoryStore};
pub use session::{EngineConfig, NewStory, SessionError, StoryDirectory, TurnStream};
pub use story::{CharacterDelta, CharacterRecord, Extraction, StoryMode, StoryRecord};
pub use stream::Segment;
pub use testing::MockNarrator;
