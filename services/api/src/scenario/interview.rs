//! services/api/src/scenario/interview.rs
//!
//! The live-interview operations: joining, listening to the candidate,
//! replying with synthesised speech, pausing and ending.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use interview_core::domain::{
    CandidateMessage, Intent, Interview, InterviewId, InterviewerMessage, ReviewJob, Role,
    Session, Transcript, UserId,
};
use interview_core::ports::{
    AudioStorage, ChatMessage, IntentClassifier, InterviewRepository, JobQueue, LanguageModel,
    PortError, PortResult, TextToSpeechService,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::locks::{InterviewGuard, InterviewLocks};
use super::transcript::TranscriptBuffers;
use super::InterviewService;
use crate::queue::REVIEW_QUEUE;

const CLOSING_PROMPT: &str = "The allotted time for this interview is over. Thank the candidate \
    in one or two sentences and tell them the interview has ended. Do not give feedback.";

fn interviewer_prompt(question: &str) -> String {
    format!(
        "You are a senior software engineer conducting a LeetCode-style technical interview. \
         The question for the candidate is:\n{}\n\
         Reply the way you would in a real interview: short, clear and professional. \
         Answer clarifying questions truthfully, give hints only when the candidate is stuck, \
         and never reveal the full solution.",
        question
    )
}

/// Candidate intent confidence, out of 100, above which the interviewer answers.
pub const REPLY_CONFIDENCE: f64 = 70.0;

/// Interview rules the scenario enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterviewSettings {
    pub duration: Duration,
    /// Join tokens that may be issued for one interview between two joins.
    pub max_setup_count: u32,
}

pub struct InterviewScenario {
    interviews: Arc<dyn InterviewRepository>,
    llm: Arc<dyn LanguageModel>,
    classifier: Arc<dyn IntentClassifier>,
    tts: Arc<dyn TextToSpeechService>,
    audio: Arc<dyn AudioStorage>,
    queue: Arc<dyn JobQueue>,
    buffers: TranscriptBuffers,
    locks: InterviewLocks,
    settings: InterviewSettings,
}

impl InterviewScenario {
    pub fn new(
        interviews: Arc<dyn InterviewRepository>,
        llm: Arc<dyn LanguageModel>,
        classifier: Arc<dyn IntentClassifier>,
        tts: Arc<dyn TextToSpeechService>,
        audio: Arc<dyn AudioStorage>,
        queue: Arc<dyn JobQueue>,
        settings: InterviewSettings,
    ) -> Self {
        Self {
            interviews,
            llm,
            classifier,
            tts,
            audio,
            queue,
            buffers: TranscriptBuffers::new(),
            locks: InterviewLocks::new(),
            settings,
        }
    }

    pub fn buffers(&self) -> &TranscriptBuffers {
        &self.buffers
    }

    async fn load(&self, interview_id: InterviewId) -> PortResult<Interview> {
        self.interviews
            .get_by_id(interview_id)
            .await?
            .ok_or_else(|| PortError::NotFound(format!("interview {}", interview_id)))
    }

    /// Commits buffered candidate speech to the transcript history.
    async fn flush(&self, interview_id: InterviewId) -> PortResult<()> {
        match self.buffers.take(interview_id) {
            Some(content) => {
                self.interviews
                    .append_transcript(interview_id, Transcript::candidate(content))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn flush_and_remove(&self, interview_id: InterviewId) -> PortResult<()> {
        match self.buffers.remove(interview_id) {
            Some(content) => {
                self.interviews
                    .append_transcript(interview_id, Transcript::candidate(content))
                    .await
            }
            None => Ok(()),
        }
    }

    /// Speaks `text` and records it as the interviewer's turn. Returns the audio URL.
    async fn speak(&self, interview_id: InterviewId, text: String) -> PortResult<String> {
        let audio = self.tts.generate_audio(&text).await?;
        let key = format!("{}-{}.mp3", interview_id, Uuid::new_v4().simple());
        let url = self.audio.upload(&key, Bytes::from(audio)).await?;
        self.interviews
            .append_transcript(interview_id, Transcript::interviewer(text, url.clone()))
            .await?;
        Ok(url)
    }

    async fn conversation(&self, interview: &Interview) -> PortResult<Vec<ChatMessage>> {
        let history = self.interviews.list_transcripts(interview.id).await?;
        let mut messages: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        if !interview.code.trim().is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: format!("The candidate's current code:\n{}", interview.code),
            });
        }
        Ok(messages)
    }

    /// True when the classifier is confident the candidate expects an answer.
    async fn wants_an_answer(&self, interview_id: InterviewId, sentence: &str) -> PortResult<bool> {
        let scores = self.classifier.classify(sentence).await?;
        let strongest = scores.strongest();
        debug!(interview_id, intent = ?strongest, "classified candidate intent");
        Ok(matches!(strongest, Some((Intent::Others, score)) if score > REPLY_CONFIDENCE))
    }

    /// Saves `ended` and enqueues its review as one step.
    ///
    /// The step runs on its own task, so dropping the caller cannot split it,
    /// and it keeps `guard` until both writes are done. If the job cannot be
    /// queued, `before` is restored so the interview stays unfinished and can
    /// be ended again.
    async fn conclude(
        &self,
        guard: InterviewGuard,
        before: Interview,
        ended: Interview,
    ) -> PortResult<()> {
        let interviews = self.interviews.clone();
        let queue = self.queue.clone();
        let concluding = tokio::spawn(async move {
            let _guard = guard;
            interviews.update(&ended).await?;
            if let Err(err) = enqueue_review(queue.as_ref(), ended.id).await {
                warn!(interview_id = ended.id, error = %err, "review job not queued, reverting the end");
                if let Err(revert) = interviews.update(&before).await {
                    error!(interview_id = ended.id, error = %revert, "failed to revert the end");
                }
                return Err(err);
            }
            Ok(())
        });
        concluding
            .await
            .map_err(|e| PortError::Unexpected(format!("concluding interview: {}", e)))?
    }

    /// Issues a fresh token for an interview the candidate already has.
    async fn reissue_token(&self, mut interview: Interview) -> PortResult<String> {
        if interview.exceeds_setup_count(self.settings.max_setup_count) {
            if interview.consume_token().is_some() {
                self.interviews.update(&interview).await?;
            }
            return Err(PortError::BadRequest(
                "set up interview attempts exceeded".to_string(),
            ));
        }
        let token = new_token();
        interview.reissue_token(token.clone());
        self.interviews.update(&interview).await?;
        info!(
            interview_id = interview.id,
            user_id = interview.user_id,
            setup_count = interview.setup_count,
            "issued a fresh join token"
        );
        Ok(token)
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

async fn enqueue_review(queue: &dyn JobQueue, interview_id: InterviewId) -> PortResult<()> {
    let body = serde_json::to_vec(&ReviewJob { interview_id })
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
    queue.push(&body, REVIEW_QUEUE).await?;
    info!(interview_id, "review job enqueued");
    Ok(())
}

#[async_trait]
impl InterviewService for InterviewScenario {
    async fn set_up(&self, user_id: UserId, question: &str) -> PortResult<String> {
        if let Some(unfinished) = self.interviews.get_unfinished_by_user(user_id).await? {
            if unfinished.ongoing {
                return Err(PortError::BadRequest("an interview is already in progress".to_string()));
            }
            return self.reissue_token(unfinished).await;
        }
        if let Some(unstarted) = self.interviews.get_unstarted_by_user(user_id).await? {
            return self.reissue_token(unstarted).await;
        }

        let question = question.trim();
        if question.is_empty() {
            return Err(PortError::BadRequest("question must not be empty".to_string()));
        }
        let mut interview = self
            .interviews
            .create_interview(user_id, question, self.settings.duration.as_secs())
            .await?;
        let token = new_token();
        interview.token = Some(token.clone());
        self.interviews.update(&interview).await?;
        self.interviews
            .append_transcript(interview.id, Transcript::system(interviewer_prompt(question)))
            .await?;
        info!(interview_id = interview.id, user_id, "interview set up");
        Ok(token)
    }

    async fn join(&self, token: &str) -> PortResult<Session> {
        let mut interview = self
            .interviews
            .get_by_token(token)
            .await?
            .ok_or(PortError::Unauthorized)?;
        if interview.has_ended() {
            return Err(PortError::BadRequest("the interview has already ended".to_string()));
        }

        let now = Utc::now();
        interview.start(now);
        interview.consume_token();
        interview.resume(now);
        self.interviews.update(&interview).await?;

        let session = Session {
            interview_id: interview.id,
            user_id: interview.user_id,
            time_remaining: interview.time_remaining(now),
            joined_at: now,
        };
        info!(
            interview_id = session.interview_id,
            remaining_secs = session.time_remaining.as_secs(),
            "candidate joined"
        );
        Ok(session)
    }

    async fn process_incoming_message(
        &self,
        session: &Session,
        message: CandidateMessage,
    ) -> PortResult<Option<InterviewerMessage>> {
        let interview_id = session.interview_id;
        if let Some(code) = message.code {
            let mut interview = self.load(interview_id).await?;
            if interview.code != code {
                interview.code = code;
                self.interviews.update(&interview).await?;
            }
        }
        if let Some(chunk) = message.chunk {
            self.buffers.write(interview_id, &chunk);
        }
        if !self.buffers.is_ready_for_reply(interview_id) {
            return Ok(None);
        }

        let sentence = self.buffers.peek(interview_id).unwrap_or_default();
        let answer = self.wants_an_answer(interview_id, &sentence).await?;
        self.flush(interview_id).await?;
        if !answer {
            return Ok(None);
        }

        let interview = self.load(interview_id).await?;
        let messages = self.conversation(&interview).await?;
        let reply = self.llm.complete(&messages).await?;
        debug!(interview_id, reply_len = reply.len(), "interviewer replied");

        let url = self.speak(interview_id, reply).await?;
        Ok(Some(InterviewerMessage::with_url(url)))
    }

    async fn handle_times_up(&self, session: &Session) -> PortResult<InterviewerMessage> {
        let interview_id = session.interview_id;
        self.flush_and_remove(interview_id).await?;

        let guard = self.locks.acquire(interview_id).await;
        let interview = self.load(interview_id).await?;
        if interview.has_ended() {
            return Err(PortError::BadRequest("there is no ongoing interview".to_string()));
        }
        let mut ended = interview.clone();
        ended.end(Utc::now());
        self.conclude(guard, interview, ended.clone()).await?;
        info!(interview_id, "interview ended, time is up");

        let mut messages = self.conversation(&ended).await?;
        messages.push(ChatMessage { role: Role::System, content: CLOSING_PROMPT.to_string() });
        let closing = self.llm.complete(&messages).await?;
        let url = self.speak(interview_id, closing).await?;
        Ok(InterviewerMessage::with_url(url).closing())
    }

    async fn pause_ongoing_session(&self, session: &Session) -> PortResult<()> {
        let interview_id = session.interview_id;
        self.flush_and_remove(interview_id).await?;

        let _guard = self.locks.acquire(interview_id).await;
        let mut interview = self.load(interview_id).await?;
        if !interview.ongoing {
            return Ok(());
        }
        interview.pause(Utc::now());
        self.interviews.update(&interview).await?;
        info!(interview_id, elapsed_secs = interview.elapsed_secs, "interview paused");
        Ok(())
    }

    async fn abandon_unfinished(&self, user_id: UserId) -> PortResult<()> {
        let no_interview = || PortError::BadRequest("there is no unfinished interview".to_string());
        let unfinished = self
            .interviews
            .get_unfinished_by_user(user_id)
            .await?
            .ok_or_else(no_interview)?;

        let guard = self.locks.acquire(unfinished.id).await;
        let interview = self.load(unfinished.id).await?;
        if !interview.is_unfinished() {
            return Err(no_interview());
        }
        self.flush_and_remove(interview.id).await?;

        let mut abandoned = interview.clone();
        abandoned.abandon(Utc::now());
        abandoned.token = None;
        self.conclude(guard, interview, abandoned).await?;
        info!(interview_id = unfinished.id, user_id, "interview abandoned");
        Ok(())
    }

    fn release(&self, interview_id: InterviewId) {
        if self.buffers.remove(interview_id).is_some() {
            debug!(interview_id, "discarded unflushed candidate speech");
        }
    }
}
