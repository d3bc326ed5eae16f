//! services/api/src/scenario/review.rs
//!
//! Scores a finished interview from its transcript history.

use async_trait::async_trait;
use interview_core::domain::{InterviewId, Review, Role};
use interview_core::ports::{
    ChatMessage, InterviewRepository, LanguageModel, PortError, PortResult,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::ReviewService;

const REVIEW_PROMPT: &str = "You have finished conducting the technical interview above. \
    Evaluate the candidate's problem solving, communication, handling of edge cases, code \
    correctness and response to hints. Write the feedback as a concise, formal summary the \
    candidate reads after the interview. You MUST return only a JSON object with the keys \
    'score' (an integer from 0 to 100), 'feedback' (a string) and 'passed' (a boolean).";

#[derive(Debug, Deserialize)]
struct ReviewReply {
    score: u8,
    feedback: String,
    passed: bool,
}

pub struct ReviewScenario {
    interviews: Arc<dyn InterviewRepository>,
    llm: Arc<dyn LanguageModel>,
}

impl ReviewScenario {
    pub fn new(interviews: Arc<dyn InterviewRepository>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { interviews, llm }
    }
}

/// Reads the reviewer's JSON verdict, tolerating a markdown code fence around it.
pub fn parse_review(interview_id: InterviewId, reply: &str) -> PortResult<Review> {
    let body = reply.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(body)
        .trim();

    let parsed: ReviewReply = serde_json::from_str(body)
        .map_err(|e| PortError::Unexpected(format!("reviewer returned malformed JSON: {}", e)))?;
    if parsed.score > 100 {
        return Err(PortError::Unexpected(format!("review score {} is out of range", parsed.score)));
    }
    Ok(Review {
        interview_id,
        score: parsed.score,
        feedback: parsed.feedback,
        passed: parsed.passed,
    })
}

#[async_trait]
impl ReviewService for ReviewScenario {
    async fn review_performance(&self, interview_id: InterviewId) -> PortResult<()> {
        let interview = self
            .interviews
            .get_by_id(interview_id)
            .await?
            .ok_or_else(|| PortError::NotFound(format!("interview {}", interview_id)))?;
        if !interview.has_ended() {
            return Err(PortError::BadRequest(format!(
                "interview {} has not ended yet",
                interview_id
            )));
        }

        let history = self.interviews.list_transcripts(interview_id).await?;
        let mut messages: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage { role: Role::System, content: REVIEW_PROMPT.to_string() });

        let reply = self.llm.complete(&messages).await?;
        let review = parse_review(interview_id, &reply)?;
        info!(interview_id, score = review.score, passed = review.passed, "interview reviewed");
        // Redelivered jobs overwrite the earlier review.
        self.interviews.save_review(review).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_json() {
        let plain = parse_review(3, r#"{"score": 72, "feedback": "Solid.", "passed": true}"#).unwrap();
        assert_eq!(plain.score, 72);
        assert!(plain.passed);

        let fenced = "```json\n{\"score\": 40, \"feedback\": \"Rushed.\", \"passed\": false}\n```";
        let fenced = parse_review(3, fenced).unwrap();
        assert_eq!(fenced.feedback, "Rushed.");
        assert_eq!(fenced.interview_id, 3);
    }

    #[test]
    fn rejects_malformed_or_out_of_range_verdicts() {
        assert!(parse_review(1, "You did great!").is_err());
        assert!(parse_review(1, r#"{"score": 140, "feedback": "", "passed": true}"#).is_err());
        assert!(parse_review(1, r#"{"score": -1, "feedback": "", "passed": true}"#).is_err());
    }
}
