//! Cursor-tracked transcript reader.
//!
//! Each monitored instance owns one long-lived [`MonitoredSource`] holding
//! its byte offset into the growing transcript, so successive polls return
//! only newly appended content instead of re-diffing the whole file.
//!
//! Guarantees:
//! - A source that does not exist yet yields an empty chunk, not an error —
//!   the lifecycle manager may not have created the transcript yet.
//! - Truncation/rotation (file now shorter than the cursor) resets the
//!   cursor to zero and re-reads from the start; the downstream store's
//!   dedup absorbs the resulting re-delivery.
//! - Only complete (newline-terminated) lines are returned; an incomplete
//!   trailing line is picked up once finished.
//! - The cursor advances via [`MonitoredSource::commit`] only after the
//!   caller has handed the chunk to the filter, keeping delivery
//!   at-least-once across a mid-pipeline crash.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use memchr::memrchr;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use agent_console_core::SourceError;

/// The lines read since the previous cursor position, plus the cursor value
/// to commit once the chunk has been handed downstream.
#[derive(Debug)]
pub struct RawChunk {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

impl RawChunk {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One instance's transcript stream and read position.
#[derive(Debug)]
pub struct MonitoredSource {
    instance_id: String,
    namespace: String,
    path: PathBuf,
    /// Byte offset consumed so far. Monotonically non-decreasing except on
    /// a detected truncation, where it resets to zero.
    cursor: u64,
    active: bool,
}

impl MonitoredSource {
    pub fn new(instance_id: &str, namespace: &str, path: PathBuf) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            namespace: namespace.to_string(),
            path,
            cursor: 0,
            active: true,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the source as no longer monitored.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Read everything appended since the cursor.
    ///
    /// Does not advance the cursor — call [`MonitoredSource::commit`] with
    /// the returned `next_cursor` after the chunk has been handed off.
    pub async fn read_new(&mut self) -> Result<RawChunk, SourceError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Not created yet — try again next poll.
                return Ok(self.empty_chunk());
            }
            Err(e) => return Err(SourceError::io(&self.path, e)),
        };

        let file_len = file
            .metadata()
            .await
            .map_err(|e| SourceError::io(&self.path, e))?
            .len();

        if file_len < self.cursor {
            warn!(
                instance_id = %self.instance_id,
                cursor = self.cursor,
                file_len,
                "transcript truncated or rotated; re-reading from start"
            );
            self.cursor = 0;
        }

        if file_len == self.cursor {
            return Ok(self.empty_chunk());
        }

        file.seek(SeekFrom::Start(self.cursor))
            .await
            .map_err(|e| SourceError::io(&self.path, e))?;

        let mut buf = Vec::with_capacity((file_len - self.cursor) as usize);
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| SourceError::io(&self.path, e))?;

        // Hand back complete lines only; an unterminated tail stays pending.
        let Some(last_newline) = memrchr(b'\n', &buf) else {
            return Ok(self.empty_chunk());
        };
        let complete = &buf[..=last_newline];

        let lines = complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();

        Ok(RawChunk {
            lines,
            next_cursor: self.cursor + complete.len() as u64,
        })
    }

    /// Advance the cursor after the chunk has been fully handed downstream.
    pub fn commit(&mut self, next_cursor: u64) {
        self.cursor = next_cursor;
    }

    fn empty_chunk(&self) -> RawChunk {
        RawChunk {
            lines: Vec::new(),
            next_cursor: self.cursor,
        }
    }
}
