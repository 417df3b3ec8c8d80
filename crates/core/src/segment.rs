//! Speaker segmenter: re-assembles cleaned transcript lines into discrete
//! speaker-attributed turns.
//!
//! A small state machine with two states — no open message, or exactly one
//! open [`CandidateMessage`]. Classification is driven by an explicit,
//! ordered marker table (`user` rules before `assistant` before `system`),
//! so precedence is a data structure rather than implicit code order and can
//! be asserted in isolation.
//!
//! Turn-taking rules, evaluated per non-noise line:
//!
//! 1. A marker line closes the open message (if any) and opens a new one of
//!    the marker's kind, seeded with the marker's inline content.
//! 2. A content line while an `assistant`/`system` message is open appends
//!    to it, unless it matches an exclusion pattern (separator runs,
//!    standalone spinner sentinels, bare date/time lines), which is dropped
//!    without closing anything.
//! 3. A content line while a `user` message is open closes the user turn and
//!    opens an `assistant` turn seeded with that line: the prompt echo is a
//!    single line, and terminal output following it is the agent speaking.
//!
//! End of a chunk never closes the open message — it may continue in the
//! next poll. Only [`SpeakerSegmenter::flush`] (stream end-of-life) forces
//! closure.

use chrono::{DateTime, NaiveTime, Utc};
use regex_lite::Regex;

use crate::filter::collapse_blank_runs;
use crate::types::{CandidateMessage, CleanedLine, SpeakerKind};

/// Finalized messages with trimmed content shorter than this are discarded.
const MIN_CONTENT_CHARS: usize = 3;

/// Finalized messages whose entire trimmed content equals one of these are
/// discarded as sentinel noise. Exact match only — a real reply that merely
/// contains "hi" must survive.
const SENTINEL_CONTENT: &[&str] = &["...", "hi", "Thinking...", "Loading...", "Please wait..."];

/// One entry of the ordered speaker-marker table.
pub struct MarkerRule {
    pub kind: SpeakerKind,
    pub name: &'static str,
    pattern: Regex,
}

/// Build the marker table. First match wins; `user` forms outrank
/// `assistant` forms, which outrank `system` forms.
fn marker_rules() -> Vec<MarkerRule> {
    let rule = |kind, name: &'static str, pattern: &str| MarkerRule {
        kind,
        name,
        pattern: Regex::new(pattern).expect("marker pattern is valid"),
    };

    vec![
        rule(SpeakerKind::User, "user_prompt_echo", r"^!>\s*(.*)$"),
        rule(SpeakerKind::User, "user_labeled", r"(?i)^User:\s*(.+)$"),
        rule(SpeakerKind::User, "user_question", r"(?i)^Question:\s*(.+)$"),
        rule(SpeakerKind::Assistant, "assistant_prompt", r"^>\s*(.*)$"),
        rule(SpeakerKind::Assistant, "assistant_labeled", r"(?i)^Assistant:\s*(.+)$"),
        rule(SpeakerKind::Assistant, "assistant_ai", r"(?i)^AI:\s*(.+)$"),
        rule(SpeakerKind::Assistant, "assistant_answer", r"(?i)^Answer:\s*(.+)$"),
        rule(SpeakerKind::System, "system_labeled", r"(?i)^System:\s*(.+)$"),
        rule(SpeakerKind::System, "system_info", r"(?i)^\[INFO\]\s*(.+)$"),
        rule(SpeakerKind::System, "system_error", r"(?i)^\[ERROR\]\s*(.+)$"),
    ]
}

/// Lines that never continue an open message and never close one either.
fn exclusion_rules() -> Vec<Regex> {
    [
        r"^=+$",
        r"^-+$",
        r"^\[.*\]$",
        r"(?i)^(Thinking|Loading|Processing|Analyzing|Please wait)\.+$",
        r"^\d{4}-\d{2}-\d{2}",
        r"^\d{2}:\d{2}:\d{2}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("exclusion pattern is valid"))
    .collect()
}

/// Close a candidate and apply the post-processing filter. Returns `None`
/// when the content is too short or is pure sentinel noise.
fn finalize(mut message: CandidateMessage) -> Option<CandidateMessage> {
    let content = collapse_blank_runs(message.content.trim());
    if content.chars().count() < MIN_CONTENT_CHARS {
        return None;
    }
    if SENTINEL_CONTENT.contains(&content.as_str()) {
        return None;
    }
    message.content = content;
    message.complete = true;
    Some(message)
}

/// The segmenter state machine. One per monitored source.
pub struct SpeakerSegmenter {
    markers: Vec<MarkerRule>,
    exclusions: Vec<Regex>,
    timestamp_token: Regex,
    open: Option<CandidateMessage>,
}

impl SpeakerSegmenter {
    pub fn new() -> Self {
        Self {
            markers: marker_rules(),
            exclusions: exclusion_rules(),
            timestamp_token: Regex::new(r"\b(\d{2}:\d{2}:\d{2})\b")
                .expect("valid timestamp pattern"),
            open: None,
        }
    }

    /// The currently open (incomplete) message, if any. There is never more
    /// than one.
    pub fn open_message(&self) -> Option<&CandidateMessage> {
        self.open.as_ref()
    }

    /// Match a line against the marker table in order. Returns the speaker
    /// kind, the inline content after the marker, and the rule name.
    pub fn classify_marker(&self, line: &str) -> Option<(SpeakerKind, String, &'static str)> {
        for rule in &self.markers {
            if let Some(caps) = rule.pattern.captures(line) {
                let inline = caps
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                return Some((rule.kind, inline, rule.name));
            }
        }
        None
    }

    /// The ordered marker table, for precedence assertions.
    pub fn marker_table(&self) -> &[MarkerRule] {
        &self.markers
    }

    fn is_exclusion(&self, line: &str) -> bool {
        self.exclusions.iter().any(|p| p.is_match(line))
    }

    /// Best-effort timestamp for a new turn: an `HH:MM:SS` token on the
    /// marker line wins (combined with today's UTC date), otherwise the
    /// processing time. A delayed replay therefore gets "now" — a known
    /// approximation, not a monotonic clock.
    fn extract_timestamp(&self, line: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp_token
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| NaiveTime::parse_from_str(m.as_str(), "%H:%M:%S").ok())
            .map(|t| now.date_naive().and_time(t).and_utc())
            .unwrap_or(now)
    }

    /// Feed one cleaned, non-noise line. Returns a finalized message when
    /// this line closed one.
    pub fn feed_line(&mut self, line: &str, now: DateTime<Utc>) -> Option<CandidateMessage> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some((kind, inline, _)) = self.classify_marker(trimmed) {
            let finalized = self.open.take().and_then(finalize);
            let timestamp = self.extract_timestamp(trimmed, now);
            self.open = Some(CandidateMessage::open(kind, &inline, timestamp));
            return finalized;
        }

        if self.is_exclusion(trimmed) {
            // Dropped; an open message survives interleaved exclusions.
            return None;
        }

        match self.open.as_ref().map(|open| open.speaker_kind) {
            Some(SpeakerKind::User) => {
                // Prompt echo is a single-line turn; the output that follows
                // is the agent's reply.
                let finalized = self.open.take().and_then(finalize);
                self.open = Some(CandidateMessage::open(SpeakerKind::Assistant, trimmed, now));
                finalized
            }
            Some(_) => {
                if let Some(open) = self.open.as_mut() {
                    open.push_line(trimmed);
                }
                None
            }
            None => None,
        }
    }

    /// Feed a batch of cleaned lines, skipping noise. Returns all messages
    /// finalized by this batch, in order.
    pub fn feed(&mut self, lines: &[CleanedLine], now: DateTime<Utc>) -> Vec<CandidateMessage> {
        let mut finalized = Vec::new();
        for line in lines {
            if line.is_noise {
                continue;
            }
            if let Some(message) = self.feed_line(&line.text, now) {
                finalized.push(message);
            }
        }
        finalized
    }

    /// Force-close the open message. Called only when the monitored stream
    /// reaches end-of-life (instance stopped).
    pub fn flush(&mut self) -> Option<CandidateMessage> {
        self.open.take().and_then(finalize)
    }
}

impl Default for SpeakerSegmenter {
    fn default() -> Self {
        Self::new()
    }
}
