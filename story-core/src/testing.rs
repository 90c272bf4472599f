//! Testing utilities for the story engine.
//!
//! `MockNarrator` stands in for the inference backend so the whole
//! pipeline (streaming, compression, repair) runs deterministically
//! without a model. Replies are scripted in order; streamed replies are
//! chopped into small fragments to exercise boundary handling.

use crate::narrator::{FragmentStream, NarrateOptions, Narrator, NarratorError};
use async_trait::async_trait;
use ollama::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fragment size used when streaming scripted replies.
const STREAM_FRAGMENT_CHARS: usize = 5;

/// A narrator that returns scripted replies.
pub struct MockNarrator {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
    completions: AtomicUsize,
    fail_when_empty: bool,
}

impl MockNarrator {
    /// Create a mock with scripted replies, returned in order. Once the
    /// script runs out, a fixed placeholder reply is returned.
    pub fn scripted(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            fail_when_empty: false,
        }
    }

    /// Create a mock whose calls fail once the script is exhausted,
    /// simulating an unavailable backend.
    pub fn unavailable() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            fail_when_empty: true,
        }
    }

    /// Append a reply to the script.
    pub fn queue_reply(&self, reply: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply.into());
        }
    }

    /// Number of non-streaming completion calls made so far.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// The message lists of every request received, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Result<String, NarratorError> {
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front());
        match reply {
            Some(reply) => Ok(reply),
            None if self.fail_when_empty => Err(NarratorError::Backend(
                "no scripted reply available".to_string(),
            )),
            None => Ok("The narrator has no further scripted replies.".to_string()),
        }
    }

    fn record(&self, messages: &[Message]) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
    }
}

#[async_trait]
impl Narrator for MockNarrator {
    async fn complete(
        &self,
        messages: Vec<Message>,
        _options: NarrateOptions,
    ) -> Result<String, NarratorError> {
        self.record(&messages);
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.next_reply()
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        _options: NarrateOptions,
    ) -> Result<FragmentStream, NarratorError> {
        self.record(&messages);
        let reply = self.next_reply()?;
        let fragments: Vec<Result<String, NarratorError>> = chunk_chars(&reply)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}

fn chunk_chars(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(STREAM_FRAGMENT_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let narrator = MockNarrator::scripted(vec!["one".to_string(), "two".to_string()]);

        let first = narrator
            .complete(vec![Message::user("a")], NarrateOptions::default())
            .await
            .unwrap();
        let second = narrator
            .complete(vec![Message::user("b")], NarrateOptions::default())
            .await
            .unwrap();

        assert_eq!(first, "one");
        assert_eq!(second, "two");
        assert_eq!(narrator.completions(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_placeholder() {
        let narrator = MockNarrator::scripted(Vec::new());
        let reply = narrator
            .complete(vec![Message::user("a")], NarrateOptions::default())
            .await
            .unwrap();
        assert!(reply.contains("no further scripted"));
    }

    #[tokio::test]
    async fn test_unavailable_fails() {
        let narrator = MockNarrator::unavailable();
        let result = narrator
            .complete(vec![Message::user("a")], NarrateOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stream_fragments_reassemble() {
        let narrator = MockNarrator::scripted(vec!["The dragon wakes.".to_string()]);
        let mut stream = narrator
            .stream(vec![Message::user("a")], NarrateOptions::default())
            .await
            .unwrap();

        let mut collected = String::new();
        let mut fragment_count = 0;
        while let Some(fragment) = stream.next().await {
            collected.push_str(&fragment.unwrap());
            fragment_count += 1;
        }

        assert_eq!(collected, "The dragon wakes.");
        assert!(fragment_count > 1);
    }

    #[tokio::test]
    async fn test_requests_recorded() {
        let narrator = MockNarrator::scripted(vec!["ok".to_string()]);
        narrator
            .complete(
                vec![Message::system("persona"), Message::user("hi")],
                NarrateOptions::default(),
            )
            .await
            .unwrap();

        let requests = narrator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 2);
    }
}
