//! Append-only per-session output log.
//!
//! Owned exclusively by the session registry; everything else reads
//! snapshots. The buffer is mutated two ways: appending output chunks,
//! and truncation when a chunk carries a clear-scrollback sequence.
//! Truncate-then-append happens inside one `push` call while the owner
//! holds its lock, so no reader observes a half-truncated state.

use crate::escape::{contains_clear_scrollback, content_after_clear};

/// Default retention cap per session.
pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Retained terminal output for one session.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    data: String,
    max_bytes: usize,
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

impl ScrollbackBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: String::new(),
            max_bytes,
        }
    }

    /// Append a chunk, honoring any clear-scrollback trigger it carries.
    ///
    /// Returns true when the chunk truncated the buffer.
    pub fn push(&mut self, chunk: &str) -> bool {
        let cleared = contains_clear_scrollback(chunk);
        if cleared {
            self.data.clear();
            self.data.push_str(content_after_clear(chunk));
        } else {
            self.data.push_str(chunk);
        }
        self.enforce_cap();
        cleared
    }

    /// Drop the oldest content once past the cap, at a char boundary.
    fn enforce_cap(&mut self) {
        if self.data.len() <= self.max_bytes {
            return;
        }
        let mut cut = self.data.len() - self.max_bytes;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
    }

    /// Current contents as an owned string.
    pub fn snapshot(&self) -> String {
        self.data.clone()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
