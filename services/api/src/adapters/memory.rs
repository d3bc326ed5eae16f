//! services/api/src/adapters/memory.rs
//!
//! This module contains the in-process store, the concrete implementation of the
//! `InterviewRepository` and `AudioStorage` ports used for local runs and tests.
//! Nothing is persisted across restarts.

use async_trait::async_trait;
use bytes::Bytes;
use interview_core::domain::{Interview, InterviewId, Review, Transcript, UserId};
use interview_core::ports::{AudioStorage, InterviewRepository, PortError, PortResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An in-memory adapter that implements the persistence and audio storage ports.
pub struct MemoryStore {
    audio_base_url: String,
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    next_id: InterviewId,
    interviews: HashMap<InterviewId, Interview>,
    transcripts: HashMap<InterviewId, Vec<Transcript>>,
    reviews: HashMap<InterviewId, Review>,
    audio: HashMap<String, Bytes>,
}

impl MemoryStore {
    /// Creates a new `MemoryStore`. Uploaded audio is served under `audio_base_url`.
    pub fn new(audio_base_url: impl Into<String>) -> Self {
        Self {
            audio_base_url: audio_base_url.into().trim_end_matches('/').to_string(),
            inner: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored review for an interview, if it has been scored.
    pub fn review(&self, interview_id: InterviewId) -> Option<Review> {
        self.tables().reviews.get(&interview_id).cloned()
    }
}

//=========================================================================================
// `InterviewRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl InterviewRepository for MemoryStore {
    async fn create_interview(
        &self,
        user_id: UserId,
        question: &str,
        duration_secs: u64,
    ) -> PortResult<Interview> {
        let mut tables = self.tables();
        tables.next_id += 1;
        let interview = Interview::new(tables.next_id, user_id, question.to_string(), duration_secs);
        tables.interviews.insert(interview.id, interview.clone());
        Ok(interview)
    }

    async fn get_by_id(&self, interview_id: InterviewId) -> PortResult<Option<Interview>> {
        Ok(self.tables().interviews.get(&interview_id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> PortResult<Option<Interview>> {
        Ok(self
            .tables()
            .interviews
            .values()
            .find(|interview| interview.token.as_deref() == Some(token))
            .cloned())
    }

    async fn get_unfinished_by_user(&self, user_id: UserId) -> PortResult<Option<Interview>> {
        Ok(self
            .tables()
            .interviews
            .values()
            .filter(|interview| interview.user_id == user_id && interview.is_unfinished())
            .max_by_key(|interview| interview.id)
            .cloned())
    }

    async fn get_unstarted_by_user(&self, user_id: UserId) -> PortResult<Option<Interview>> {
        Ok(self
            .tables()
            .interviews
            .values()
            .filter(|interview| interview.user_id == user_id && interview.is_unstarted())
            .max_by_key(|interview| interview.id)
            .cloned())
    }

    async fn update(&self, interview: &Interview) -> PortResult<()> {
        let mut tables = self.tables();
        let stored = tables
            .interviews
            .get_mut(&interview.id)
            .ok_or_else(|| PortError::NotFound(format!("interview {}", interview.id)))?;
        *stored = interview.clone();
        Ok(())
    }

    async fn append_transcript(
        &self,
        interview_id: InterviewId,
        transcript: Transcript,
    ) -> PortResult<()> {
        let mut tables = self.tables();
        if !tables.interviews.contains_key(&interview_id) {
            return Err(PortError::NotFound(format!("interview {}", interview_id)));
        }
        tables.transcripts.entry(interview_id).or_default().push(transcript);
        Ok(())
    }

    async fn list_transcripts(&self, interview_id: InterviewId) -> PortResult<Vec<Transcript>> {
        Ok(self.tables().transcripts.get(&interview_id).cloned().unwrap_or_default())
    }

    async fn save_review(&self, review: Review) -> PortResult<()> {
        self.tables().reviews.insert(review.interview_id, review);
        Ok(())
    }
}

//=========================================================================================
// `AudioStorage` Trait Implementation
//=========================================================================================

#[async_trait]
impl AudioStorage for MemoryStore {
    async fn upload(&self, key: &str, audio: Bytes) -> PortResult<String> {
        if key.is_empty() || key.contains('/') {
            return Err(PortError::BadRequest(format!("invalid audio key '{}'", key)));
        }
        self.tables().audio.insert(key.to_string(), audio);
        Ok(format!("{}/{}", self.audio_base_url, key))
    }

    async fn fetch(&self, key: &str) -> PortResult<Option<Bytes>> {
        Ok(self.tables().audio.get(key).cloned())
    }
}
