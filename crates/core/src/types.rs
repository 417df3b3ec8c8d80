//! Shared data model for the conversation ingestion pipeline.
//!
//! A monitored instance's terminal transcript flows through the pipeline as
//! `CleanedLine`s, accumulates into `CandidateMessage`s inside the segmenter,
//! and is finalized into immutable `ConversationRecord`s. Live subscribers
//! receive `MonitorEvent`s keyed by instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message in the reconstructed conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerKind {
    /// The human operator (prompt echo in the transcript).
    User,
    /// The CLI agent's reply.
    Assistant,
    /// Interface/system notices (`System:`, `[INFO]`, `[ERROR]`).
    System,
}

impl SpeakerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerKind::User => "user",
            SpeakerKind::Assistant => "assistant",
            SpeakerKind::System => "system",
        }
    }
}

impl std::fmt::Display for SpeakerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transcript line with escape sequences removed and a noise verdict.
///
/// Noise lines are dropped before segmentation but never act as turn
/// boundaries — an open message survives any amount of interleaved noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedLine {
    pub text: String,
    pub is_noise: bool,
}

/// An in-progress or finished speaker turn.
///
/// The segmenter guarantees at most one incomplete candidate exists per
/// monitored source at any time.
#[derive(Debug, Clone)]
pub struct CandidateMessage {
    pub speaker_kind: SpeakerKind,
    /// Accumulated content, newline-joined in arrival order.
    pub content: String,
    /// Best-effort timestamp: extracted from the marker line when present,
    /// otherwise the processing time at open.
    pub timestamp: DateTime<Utc>,
    pub complete: bool,
    /// The original (cleaned) lines that fed this turn, for diagnostics.
    pub raw_lines: Vec<String>,
}

impl CandidateMessage {
    pub fn open(speaker_kind: SpeakerKind, seed: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            speaker_kind,
            content: seed.trim().to_string(),
            timestamp,
            complete: false,
            raw_lines: vec![seed.to_string()],
        }
    }

    /// Append a continuation line with a newline join.
    pub fn push_line(&mut self, line: &str) {
        if self.content.is_empty() {
            self.content = line.trim_end().to_string();
        } else {
            self.content.push('\n');
            self.content.push_str(line.trim_end());
        }
        self.raw_lines.push(line.to_string());
    }
}

/// A finalized, persisted conversation message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub instance_id: String,
    pub namespace: String,
    pub sender: SpeakerKind,
    pub message: String,
    /// Normalized to UTC.
    pub timestamp: DateTime<Utc>,
}

impl ConversationRecord {
    /// Build a record from a finalized candidate.
    pub fn from_candidate(
        instance_id: &str,
        namespace: &str,
        candidate: &CandidateMessage,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            namespace: namespace.to_string(),
            sender: candidate.speaker_kind,
            message: candidate.content.clone(),
            timestamp: candidate.timestamp,
        }
    }
}

/// Events delivered to live subscribers, keyed by instance.
///
/// `Fragment` carries cleaned but not yet speaker-attributed text for
/// "typing" feedback; `Complete` carries a finalized, persisted message.
/// Fragments are never replayed to late joiners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Fragment {
        instance_id: String,
        content: String,
        timestamp: DateTime<Utc>,
        is_streaming: bool,
    },
    Complete {
        instance_id: String,
        sender_kind: SpeakerKind,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn fragment(instance_id: &str, content: String, timestamp: DateTime<Utc>) -> Self {
        Self::Fragment {
            instance_id: instance_id.to_string(),
            content,
            timestamp,
            is_streaming: true,
        }
    }

    pub fn complete(record: &ConversationRecord) -> Self {
        Self::Complete {
            instance_id: record.instance_id.clone(),
            sender_kind: record.sender,
            content: record.message.clone(),
            timestamp: record.timestamp,
        }
    }

    /// The instance this event belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Fragment { instance_id, .. } | Self::Complete { instance_id, .. } => instance_id,
        }
    }
}
