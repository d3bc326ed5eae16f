//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the candidate's browser and the
//! API server for a live interview.
//!
//! Every frame is a JSON text message tagged with its origin. The candidate may send
//! a speech chunk and/or a code snapshot; the server sends the URL of the
//! interviewer's next audio clip.

use interview_core::domain::{CandidateMessage, InterviewerMessage};
use serde::{Deserialize, Serialize};

/// Frames above this size are rejected before decoding.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Client,
    Server,
}

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// The wire shape of an inbound frame. Unknown fields are rejected.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct InboundFrame {
    from: Origin,
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame must come from the client")]
    WrongOrigin,
    #[error("the url field is reserved for the server")]
    ServerOnlyField,
}

/// Decodes and validates a candidate's text frame.
pub fn decode_client_frame(text: &str) -> Result<CandidateMessage, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(text.len()));
    }
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if frame.from != Origin::Client {
        return Err(FrameError::WrongOrigin);
    }
    if frame.url.is_some() {
        return Err(FrameError::ServerOnlyField);
    }
    Ok(CandidateMessage { chunk: frame.chunk, code: frame.code })
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// An interviewer message as it goes over the wire. The close flag stays server-side.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub from: Origin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&InterviewerMessage> for OutboundFrame {
    fn from(message: &InterviewerMessage) -> Self {
        Self { from: Origin::Server, url: message.url.clone() }
    }
}

/// The best-effort last frame of a session that ended in error.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_chunk_and_code() {
        let message = decode_client_frame(r#"{"from":"client","chunk":"hi","code":"x = 1"}"#).unwrap();
        assert_eq!(message.chunk.as_deref(), Some("hi"));
        assert_eq!(message.code.as_deref(), Some("x = 1"));
        assert_eq!(decode_client_frame(r#"{"from":"client"}"#).unwrap(), CandidateMessage::default());
    }

    #[test]
    fn rejects_server_fields_and_strangers() {
        assert_eq!(
            decode_client_frame(r#"{"from":"client","url":"x"}"#),
            Err(FrameError::ServerOnlyField)
        );
        assert_eq!(decode_client_frame(r#"{"from":"server"}"#), Err(FrameError::WrongOrigin));
        assert!(matches!(
            decode_client_frame(r#"{"from":"client","volume":3}"#),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(decode_client_frame("hello"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn oversized_frames_are_not_parsed() {
        let huge = format!(r#"{{"from":"client","chunk":"{}"}}"#, "a".repeat(MAX_FRAME_BYTES));
        assert!(matches!(decode_client_frame(&huge), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn outbound_frames_hide_the_close_flag() {
        let message = InterviewerMessage::with_url("http://audio/1.mp3").closing();
        let json = serde_json::to_string(&OutboundFrame::from(&message)).unwrap();
        assert_eq!(json, r#"{"from":"server","url":"http://audio/1.mp3"}"#);
    }
}
