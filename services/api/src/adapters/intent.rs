//! services/api/src/adapters/intent.rs
//!
//! This module contains a keyword-based intent classifier, the concrete
//! implementation of the `IntentClassifier` port. It decides whether the
//! candidate is explaining their approach or asking the interviewer something.

use async_trait::async_trait;
use interview_core::domain::{Intent, IntentScores};
use interview_core::ports::{IntentClassifier, PortResult};

const HINT_WORDS: &[&str] = &[
    "hint", "hints", "clue", "clues", "tip", "tips", "help", "stuck", "guidance",
];

const CLARIFICATION_WORDS: &[&str] = &[
    "ask", "clarify", "clarifying", "clarification", "confirm", "assume", "constraints",
];

/// Confidence for a sentence that names what it wants.
const KEYWORD_CONFIDENCE: f64 = 0.9;
/// Confidence for a bare question.
const QUESTION_CONFIDENCE: f64 = 0.75;
/// Confidence that anything else is the candidate thinking aloud.
const EXPLANATION_CONFIDENCE: f64 = 0.8;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        Self
    }

    fn score(sentence: &str) -> IntentScores {
        let lowered = sentence.to_lowercase();
        let asks_for_help = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .any(|word| HINT_WORDS.contains(&word) || CLARIFICATION_WORDS.contains(&word));

        let others = if asks_for_help {
            KEYWORD_CONFIDENCE
        } else if lowered.trim_end().ends_with('?') {
            QUESTION_CONFIDENCE
        } else {
            1.0 - EXPLANATION_CONFIDENCE
        };
        IntentScores::new()
            .with(Intent::Others, others)
            .with(Intent::Explanation, 1.0 - others)
    }
}

//=========================================================================================
// `IntentClassifier` Trait Implementation
//=========================================================================================

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, sentence: &str) -> PortResult<IntentScores> {
        Ok(Self::score(sentence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_for_help_need_an_answer() {
        let classifier = KeywordIntentClassifier::new();
        let scores = classifier.classify("I'm stuck, could I get a Hint please.").await.unwrap();
        let (intent, score) = scores.strongest().unwrap();
        assert_eq!(intent, Intent::Others);
        assert!(score > 70.0);
    }

    #[tokio::test]
    async fn thinking_aloud_keeps_the_interviewer_listening() {
        let classifier = KeywordIntentClassifier::new();
        let scores = classifier
            .classify("I would first sort the array and then walk two pointers inward.")
            .await
            .unwrap();
        assert_eq!(scores.strongest().map(|(intent, _)| intent), Some(Intent::Explanation));
    }

    #[tokio::test]
    async fn bare_questions_clear_the_reply_threshold() {
        let classifier = KeywordIntentClassifier::new();
        let (intent, score) = classifier
            .classify("Can the input array contain negative numbers?")
            .await
            .unwrap()
            .strongest()
            .unwrap();
        assert_eq!(intent, Intent::Others);
        assert!(score > 70.0);
    }
}
