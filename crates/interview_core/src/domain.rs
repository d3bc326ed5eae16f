//! crates/interview_core/src/domain.rs
//!
//! Defines the pure, core data structures for the interview backend.
//! These structs are independent of any database, broker or wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type InterviewId = u64;
pub type UserId = u64;

/// A mock technical interview and its timing state.
///
/// Time is tracked in stints: every join starts a stint at `resumed_at`, every
/// pause folds the stint into `elapsed_secs`. The remaining budget therefore
/// never grows while the interview is ongoing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interview {
    pub id: InterviewId,
    pub user_id: UserId,
    pub question: String,
    pub code: String,
    /// Single-use join token. `None` once consumed.
    pub token: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub duration_secs: u64,
    pub ongoing: bool,
    /// Join tokens issued since the candidate last joined.
    pub setup_count: u32,
}

impl Interview {
    pub fn new(id: InterviewId, user_id: UserId, question: String, duration_secs: u64) -> Self {
        Self {
            id,
            user_id,
            question,
            code: String::new(),
            token: None,
            started_at: None,
            ended_at: None,
            abandoned_at: None,
            resumed_at: None,
            elapsed_secs: 0,
            duration_secs,
            ongoing: false,
            setup_count: 1,
        }
    }

    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some() || self.abandoned_at.is_some()
    }

    /// Set up but never joined.
    pub fn is_unstarted(&self) -> bool {
        !self.has_started() && !self.has_ended()
    }

    /// Started but neither ended nor abandoned.
    pub fn is_unfinished(&self) -> bool {
        self.has_started() && !self.has_ended()
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Takes the join token, leaving the interview without one.
    pub fn consume_token(&mut self) -> Option<String> {
        self.token.take()
    }

    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.ongoing = true;
        self.resumed_at = Some(now);
        self.setup_count = 0;
    }

    /// True once `max_setups` tokens were issued without a join in between.
    pub fn exceeds_setup_count(&self, max_setups: u32) -> bool {
        self.setup_count >= max_setups
    }

    /// Stores a fresh join token and counts the set-up.
    pub fn reissue_token(&mut self, token: String) {
        self.token = Some(token);
        self.setup_count = self.setup_count.saturating_add(1);
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.elapsed_secs = self.elapsed_secs.saturating_add(self.current_stint_secs(now));
        self.resumed_at = None;
        self.ongoing = false;
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        self.pause(now);
        self.ended_at = Some(now);
    }

    pub fn abandon(&mut self, now: DateTime<Utc>) {
        self.pause(now);
        self.abandoned_at = Some(now);
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        let spent = self.elapsed_secs.saturating_add(self.current_stint_secs(now));
        Duration::from_secs(self.duration_secs.saturating_sub(spent))
    }

    fn current_stint_secs(&self, now: DateTime<Utc>) -> u64 {
        match self.resumed_at {
            Some(resumed_at) => u64::try_from((now - resumed_at).num_seconds()).unwrap_or(0),
            None => 0,
        }
    }
}

/// A snapshot of one live connection, created when a join token is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub interview_id: InterviewId,
    pub user_id: UserId,
    pub time_remaining: Duration,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    Candidate,
    Interviewer,
}

/// What the candidate is doing with their latest sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Thinking aloud or explaining an approach. The interviewer keeps listening.
    Explanation,
    /// Asking for a hint, a clarification or anything else that needs an answer.
    Others,
}

/// Classifier confidence per intent, each in `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentScores {
    scores: Vec<(Intent, f64)>,
}

impl IntentScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, intent: Intent, confidence: f64) -> Self {
        self.scores.retain(|(known, _)| *known != intent);
        self.scores.push((intent, confidence.clamp(0.0, 1.0)));
        self
    }

    /// The most likely intent and its confidence out of 100.
    pub fn strongest(&self) -> Option<(Intent, f64)> {
        self.scores
            .iter()
            .copied()
            .filter(|(_, confidence)| *confidence > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(intent, confidence)| (intent, confidence * 100.0))
    }
}

/// One persisted turn of the interview conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub role: Role,
    pub content: String,
    pub url: Option<String>,
}

impl Transcript {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), url: None }
    }

    pub fn candidate(content: impl Into<String>) -> Self {
        Self { role: Role::Candidate, content: content.into(), url: None }
    }

    pub fn interviewer(content: impl Into<String>, url: impl Into<String>) -> Self {
        Self { role: Role::Interviewer, content: content.into(), url: Some(url.into()) }
    }
}

/// The scored outcome of a finished interview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub interview_id: InterviewId,
    pub score: u8,
    pub feedback: String,
    pub passed: bool,
}

/// Payload of the review queue: "score this completed interview".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewJob {
    pub interview_id: InterviewId,
}

/// A validated message from the candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateMessage {
    pub chunk: Option<String>,
    pub code: Option<String>,
}

/// A message from the interviewer to the candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterviewerMessage {
    pub url: Option<String>,
    /// Not sent over the wire; tells the writer to end the session after this message.
    pub close_connection: bool,
}

impl InterviewerMessage {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: Some(url.into()), close_connection: false }
    }

    pub fn closing(mut self) -> Self {
        self.close_connection = true;
        self
    }
}
