//! services/api/src/scenario/transcript.rs
//!
//! Per-interview buffers of candidate speech that has not yet been committed
//! to the transcript history.

use interview_core::domain::InterviewId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A buffer longer than this is worth replying to.
const SUFFICIENT_CHARS: usize = 30;

/// Registry of candidate speech buffers keyed by interview.
///
/// Entries are created on first write and removed when the session ends.
#[derive(Debug, Default)]
pub struct TranscriptBuffers {
    buffers: Mutex<HashMap<InterviewId, String>>,
}

impl TranscriptBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InterviewId, String>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self, interview_id: InterviewId, chunk: &str) {
        self.lock().entry(interview_id).or_default().push_str(chunk);
    }

    /// True once the buffer holds a long enough, finished sentence.
    pub fn is_ready_for_reply(&self, interview_id: InterviewId) -> bool {
        self.lock().get(&interview_id).is_some_and(|buffer| {
            let sentence = buffer.trim_end();
            sentence.chars().count() > SUFFICIENT_CHARS && sentence.ends_with(['.', '?', '!'])
        })
    }

    /// The buffered sentence, trimmed, without emptying the buffer.
    pub fn peek(&self, interview_id: InterviewId) -> Option<String> {
        self.lock().get(&interview_id).cloned().and_then(non_empty)
    }

    /// Empties the buffer, returning its trimmed content if there was any.
    pub fn take(&self, interview_id: InterviewId) -> Option<String> {
        let mut buffers = self.lock();
        let buffer = buffers.get_mut(&interview_id)?;
        let content = std::mem::take(buffer);
        non_empty(content)
    }

    /// Drops the buffer, returning whatever had not been taken yet.
    pub fn remove(&self, interview_id: InterviewId) -> Option<String> {
        self.lock().remove(&interview_id).and_then(non_empty)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn non_empty(content: String) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
