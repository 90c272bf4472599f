//! Incremental segmentation of streamed reply fragments.
//!
//! Some models interleave `<think>...</think>` reasoning into their
//! output. The tags arrive split across arbitrary fragment boundaries, so
//! the segmenter carries partial-tag state between pushes: narrative text
//! is passed through as it arrives, while thought text is buffered until
//! the closing tag and then re-emitted in fixed-size slices as a distinct
//! segment kind.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Size of the re-emitted thought slices, in characters.
const THOUGHT_SLICE_CHARS: usize = 50;

/// One caller-facing piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Ordinary narrative text.
    Narrative(String),
    /// A slice of buffered model reasoning.
    Thought(String),
}

/// Stateful splitter for one streamed reply.
#[derive(Debug, Default)]
pub struct ThoughtSegmenter {
    held: String,
    thought: String,
    inside_thought: bool,
}

impl ThoughtSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one raw fragment and return the segments it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.held.push_str(fragment);
        let mut out = Vec::new();

        loop {
            if self.inside_thought {
                if let Some(pos) = self.held.find(THINK_CLOSE) {
                    self.thought.push_str(&self.held[..pos]);
                    self.held.drain(..pos + THINK_CLOSE.len());
                    self.inside_thought = false;
                    out.extend(
                        slice_chars(&self.thought, THOUGHT_SLICE_CHARS)
                            .into_iter()
                            .map(Segment::Thought),
                    );
                    self.thought.clear();
                } else {
                    let cut = self.held.len() - partial_tag_suffix(&self.held, THINK_CLOSE);
                    self.thought.push_str(&self.held[..cut]);
                    self.held.drain(..cut);
                    break;
                }
            } else if let Some(pos) = self.held.find(THINK_OPEN) {
                if pos > 0 {
                    out.push(Segment::Narrative(self.held[..pos].to_string()));
                }
                self.held.drain(..pos + THINK_OPEN.len());
                self.inside_thought = true;
            } else {
                let cut = self.held.len() - partial_tag_suffix(&self.held, THINK_OPEN);
                if cut > 0 {
                    out.push(Segment::Narrative(self.held[..cut].to_string()));
                    self.held.drain(..cut);
                }
                break;
            }
        }

        out
    }

    /// Flush at end of stream. Narrative held back as a potential partial
    /// tag is released; an unterminated thought block is dropped (the raw
    /// accumulated reply still contains it).
    pub fn finish(mut self) -> Vec<Segment> {
        if self.inside_thought || self.held.is_empty() {
            return Vec::new();
        }
        vec![Segment::Narrative(std::mem::take(&mut self.held))]
    }
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
/// Tags are ASCII, so the returned cut point is always a char boundary.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    for len in (1..tag.len()).rev() {
        if text.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

fn slice_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(fragments: &[&str]) -> Vec<Segment> {
        let mut segmenter = ThoughtSegmenter::new();
        let mut out = Vec::new();
        for fragment in fragments {
            out.extend(segmenter.push(fragment));
        }
        out.extend(segmenter.finish());
        out
    }

    #[test]
    fn test_plain_narrative_passes_through() {
        let segments = drive(&["The door ", "creaks open."]);
        assert_eq!(
            segments,
            vec![
                Segment::Narrative("The door ".to_string()),
                Segment::Narrative("creaks open.".to_string()),
            ]
        );
    }

    #[test]
    fn test_thought_in_one_fragment() {
        let segments = drive(&["<think>short plan</think>Hello"]);
        assert_eq!(
            segments,
            vec![
                Segment::Thought("short plan".to_string()),
                Segment::Narrative("Hello".to_string()),
            ]
        );
    }

    #[test]
    fn test_tags_split_across_fragments() {
        let segments = drive(&["before <th", "ink>reason", "ing</thi", "nk> after"]);
        assert_eq!(
            segments,
            vec![
                Segment::Narrative("before ".to_string()),
                Segment::Thought("reasoning".to_string()),
                Segment::Narrative(" after".to_string()),
            ]
        );
    }

    #[test]
    fn test_long_thought_reemitted_in_slices() {
        let reasoning = "r".repeat(120);
        let input = format!("<think>{reasoning}</think>done");
        let segments = drive(&[&input]);

        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], Segment::Thought("r".repeat(50)));
        assert_eq!(segments[1], Segment::Thought("r".repeat(50)));
        assert_eq!(segments[2], Segment::Thought("r".repeat(20)));
        assert_eq!(segments[3], Segment::Narrative("done".to_string()));
    }

    #[test]
    fn test_unterminated_thought_dropped() {
        let segments = drive(&["hello <think>never closed"]);
        assert_eq!(segments, vec![Segment::Narrative("hello ".to_string())]);
    }

    #[test]
    fn test_false_alarm_angle_bracket_released() {
        // "<th" could open a tag; once it provably does not, it flows on
        let segments = drive(&["a <th", "ree-headed dog"]);
        assert_eq!(
            segments,
            vec![
                Segment::Narrative("a ".to_string()),
                Segment::Narrative("<three-headed dog".to_string()),
            ]
        );
    }

    #[test]
    fn test_multiple_thought_blocks() {
        let segments = drive(&["<think>one</think>mid<think>two</think>end"]);
        assert_eq!(
            segments,
            vec![
                Segment::Thought("one".to_string()),
                Segment::Narrative("mid".to_string()),
                Segment::Thought("two".to_string()),
                Segment::Narrative("end".to_string()),
            ]
        );
    }
}
