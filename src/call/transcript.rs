//! # Transcript Accumulator
//!
//! Append-only list of speaker-tagged lines for one call, plus the cleaning pass that
//! turns the raw rendering into the artifact handed to post-call extraction.

use serde::Serialize;
use std::fmt;

/// Placeholder the voice service emits when it has no assistant text for a turn.
/// Any line containing it is dropped by [`clean`].
pub const PLACEHOLDER_SENTINEL: &str = "Agent message not found";

/// Separator between surviving lines of a cleaned transcript.
const LINE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "User",
            Speaker::Agent => "Agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.speaker.label(), self.text)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Surrounding whitespace is trimmed; nothing else is filtered
    /// here, empty and placeholder lines are dealt with by [`clean`].
    pub fn push(&mut self, speaker: Speaker, text: &str) {
        self.lines.push(TranscriptLine {
            speaker,
            text: text.trim().to_string(),
        });
    }

    #[cfg(test)]
    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Raw rendering, one `"{Speaker}: {text}"` line per fragment. A fragment with no
    /// text renders as a blank line so cleaning drops it.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| if line.text.is_empty() { String::new() } else { line.to_string() })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rendered and cleaned transcript.
    pub fn cleaned(&self) -> String {
        clean(&self.render())
    }
}

/// Clean a rendered transcript.
///
/// Drops every line containing [`PLACEHOLDER_SENTINEL`], drops every line that is empty
/// after trimming, and joins what is left with a blank line. Surviving lines are kept
/// verbatim and in order. `clean(clean(t)) == clean(t)`.
pub fn clean(transcript: &str) -> String {
    transcript
        .lines()
        .filter(|line| !line.contains(PLACEHOLDER_SENTINEL))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join(LINE_SEPARATOR)
}
