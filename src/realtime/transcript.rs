//! Transcript entries and aggregation for the conversation log
//!
//! The connection only emits [`TranscriptEntry`] values; keeping history is
//! the caller's job. [`TranscriptLog`] is the append-only log a UI keeps,
//! built on [`TranscriptAggregator`].
//!
//! # Aggregation Strategy
//!
//! - **Deltas**: Appended to the open entry of the same speaker
//! - **Completed**: Replaces accumulated text (authoritative from API)

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who produced a piece of transcript text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

impl Speaker {
    pub fn is_user(&self) -> bool {
        matches!(self, Speaker::User)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Ai => "Tutor",
        }
    }
}

/// One piece of transcript text surfaced by the connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// `false` for streaming deltas, `true` for completed text
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            speaker,
            text: text.into(),
            is_final,
            received_at: Utc::now(),
        }
    }
}

/// Aggregates transcript deltas into coherent text
///
/// Tracks both partial (accumulated) and final (authoritative) text.
/// Use `current_text()` to get the best available text at any moment.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    /// Accumulated partial text from delta events
    partial_text: String,
    /// Final authoritative text from completed event
    final_text: Option<String>,
    /// Count of delta events processed
    delta_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta to the accumulated partial text
    pub fn process_delta(&mut self, delta: &str) -> &str {
        if !delta.is_empty() {
            self.partial_text.push_str(delta);
            self.delta_count += 1;

            if self.delta_count % 10 == 0 {
                log::debug!(
                    "TranscriptAggregator: {} deltas, {} chars accumulated",
                    self.delta_count,
                    self.partial_text.len()
                );
            }
        }
        &self.partial_text
    }

    /// Set the final authoritative text, overriding accumulated deltas
    pub fn process_completed<'a>(&mut self, transcript: &'a str) -> &'a str {
        log::debug!(
            "TranscriptAggregator: completed with {} chars (had {} deltas, {} partial chars)",
            transcript.len(),
            self.delta_count,
            self.partial_text.len()
        );
        self.final_text = Some(transcript.to_string());
        transcript
    }

    /// Final text if available, otherwise accumulated partial text
    pub fn current_text(&self) -> &str {
        self.final_text.as_deref().unwrap_or(&self.partial_text)
    }

    pub fn has_text(&self) -> bool {
        self.final_text.is_some() || !self.partial_text.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.final_text.is_some()
    }

    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }

    pub fn reset(&mut self) {
        self.partial_text.clear();
        self.final_text = None;
        self.delta_count = 0;
    }
}

/// A finished or in-progress line of the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
    pub complete: bool,
    pub received_at: DateTime<Utc>,
}

/// Append-only conversation log fed from [`TranscriptEntry`] values
///
/// Partial entries grow the open line of their speaker; a final entry
/// closes it. Closed lines are never edited again.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    lines: Vec<TranscriptLine>,
    open_user: Option<(usize, TranscriptAggregator)>,
    open_ai: Option<(usize, TranscriptAggregator)>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one entry; returns the line it touched
    pub fn push(&mut self, entry: TranscriptEntry) -> &TranscriptLine {
        let slot = match entry.speaker {
            Speaker::User => &mut self.open_user,
            Speaker::Ai => &mut self.open_ai,
        };

        let (index, aggregator) = slot.get_or_insert_with(|| {
            self.lines.push(TranscriptLine {
                speaker: entry.speaker,
                text: String::new(),
                complete: false,
                received_at: entry.received_at,
            });
            (self.lines.len() - 1, TranscriptAggregator::new())
        });
        let index = *index;

        let text = if entry.is_final {
            aggregator.process_completed(&entry.text).to_string()
        } else {
            aggregator.process_delta(&entry.text).to_string()
        };

        let line = &mut self.lines[index];
        line.text = text;
        line.complete = entry.is_final;

        if entry.is_final {
            *slot = None;
        }

        &self.lines[index]
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
