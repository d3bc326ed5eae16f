//! services/api/src/scenario/mod.rs
//!
//! The business operations the session gateway and the review workers call.

pub mod interview;
pub mod locks;
pub mod review;
pub mod transcript;

use async_trait::async_trait;
use interview_core::domain::{
    CandidateMessage, InterviewId, InterviewerMessage, Session, UserId,
};
use interview_core::ports::PortResult;

pub use interview::{InterviewScenario, InterviewSettings};
pub use locks::InterviewLocks;
pub use review::ReviewScenario;
pub use transcript::TranscriptBuffers;

#[async_trait]
pub trait InterviewService: Send + Sync {
    /// Issues a join token for a new interview, or a fresh one for the
    /// candidate's paused interview.
    async fn set_up(&self, user_id: UserId, question: &str) -> PortResult<String>;

    /// Consumes a join token and starts or resumes its interview.
    async fn join(&self, token: &str) -> PortResult<Session>;

    /// Handles one validated candidate message, returning the interviewer's
    /// reply if one is due.
    async fn process_incoming_message(
        &self,
        session: &Session,
        message: CandidateMessage,
    ) -> PortResult<Option<InterviewerMessage>>;

    /// Ends the interview once its time budget is spent. The returned message
    /// carries the close flag.
    async fn handle_times_up(&self, session: &Session) -> PortResult<InterviewerMessage>;

    async fn pause_ongoing_session(&self, session: &Session) -> PortResult<()>;

    async fn abandon_unfinished(&self, user_id: UserId) -> PortResult<()>;

    /// Drops any per-session state held in memory.
    fn release(&self, interview_id: InterviewId);
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn review_performance(&self, interview_id: InterviewId) -> PortResult<()>;
}
