//! crates/interview_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases,
//! message brokers or model providers.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{Interview, InterviewId, IntentScores, Review, Role, Transcript, UserId};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Shutting down")]
    Shutdown,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Persistence and Identity Ports
//=========================================================================================

#[async_trait]
pub trait InterviewRepository: Send + Sync {
    async fn create_interview(
        &self,
        user_id: UserId,
        question: &str,
        duration_secs: u64,
    ) -> PortResult<Interview>;

    async fn get_by_id(&self, interview_id: InterviewId) -> PortResult<Option<Interview>>;

    async fn get_by_token(&self, token: &str) -> PortResult<Option<Interview>>;

    async fn get_unfinished_by_user(&self, user_id: UserId) -> PortResult<Option<Interview>>;

    /// The candidate's latest interview that was set up but never joined.
    async fn get_unstarted_by_user(&self, user_id: UserId) -> PortResult<Option<Interview>>;

    async fn update(&self, interview: &Interview) -> PortResult<()>;

    // --- Transcript and Review Management ---
    async fn append_transcript(
        &self,
        interview_id: InterviewId,
        transcript: Transcript,
    ) -> PortResult<()>;

    async fn list_transcripts(&self, interview_id: InterviewId) -> PortResult<Vec<Transcript>>;

    async fn save_review(&self, review: Review) -> PortResult<()>;
}

#[async_trait]
pub trait AuthSessionValidator: Send + Sync {
    /// Resolves a browser session token to the user it belongs to.
    async fn validate_auth_session(&self, session_token: &str) -> PortResult<UserId>;
}

//=========================================================================================
// Model Provider Ports
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Transcript> for ChatMessage {
    fn from(transcript: &Transcript) -> Self {
        Self { role: transcript.role, content: transcript.content.clone() }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produces the next interviewer turn for a conversation.
    async fn complete(&self, messages: &[ChatMessage]) -> PortResult<String>;
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Scores what the candidate wants from one finished sentence.
    async fn classify(&self, sentence: &str) -> PortResult<IntentScores>;
}

#[async_trait]
pub trait TextToSpeechService: Send + Sync {
    /// Generates audio data from a string of text.
    async fn generate_audio(&self, text: &str) -> PortResult<Vec<u8>>;
}

#[async_trait]
pub trait AudioStorage: Send + Sync {
    /// Stores an audio clip and returns the URL the candidate can fetch it from.
    async fn upload(&self, key: &str, audio: Bytes) -> PortResult<String>;

    async fn fetch(&self, key: &str) -> PortResult<Option<Bytes>>;
}

//=========================================================================================
// Job Queue Port
//=========================================================================================

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> PortResult<()>;
    async fn nack(&self, requeue: bool) -> PortResult<()>;
    async fn reject(&self, requeue: bool) -> PortResult<()>;
}

/// One unit of queued work.
///
/// Every settling method consumes the delivery, so it can be acknowledged at most once.
pub struct Delivery {
    pub body: Bytes,
    acknowledger: Box<dyn Acknowledger>,
    settled: bool,
}

impl Delivery {
    pub fn new(body: Bytes, acknowledger: Box<dyn Acknowledger>) -> Self {
        Self { body, acknowledger, settled: false }
    }

    pub async fn ack(mut self) -> PortResult<()> {
        self.settled = true;
        self.acknowledger.ack().await
    }

    pub async fn nack(mut self, requeue: bool) -> PortResult<()> {
        self.settled = true;
        self.acknowledger.nack(requeue).await
    }

    pub async fn reject(mut self, requeue: bool) -> PortResult<()> {
        self.settled = true;
        self.acknowledger.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            warn!(body_len = self.body.len(), "delivery dropped without acknowledgement");
        }
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publishes `data` to `queue`, returning only after the broker confirmed it.
    async fn push(&self, data: &[u8], queue: &str) -> PortResult<()>;

    /// Starts a lazy stream of deliveries from `queue` that ends when `cancel` fires.
    async fn start_consuming(
        &self,
        cancel: CancellationToken,
        queue: &str,
    ) -> PortResult<DeliveryStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Acknowledger for Recorder {
        async fn ack(&self) -> PortResult<()> {
            self.0.lock().unwrap().push("ack");
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> PortResult<()> {
            self.0.lock().unwrap().push("nack");
            Ok(())
        }
        async fn reject(&self, _requeue: bool) -> PortResult<()> {
            self.0.lock().unwrap().push("reject");
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_settles_through_its_acknowledger() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(Bytes::from_static(b"{}"), Box::new(Recorder(log.clone())));
        delivery.nack(true).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["nack"]);
    }

    #[test]
    fn transcript_converts_to_chat_message() {
        let message = ChatMessage::from(&Transcript::candidate("hello"));
        assert_eq!(message.role, Role::Candidate);
        assert_eq!(message.content, "hello");
    }
}
