//! services/api/src/web/gateway.rs
//!
//! Owns one accepted interview connection end to end.
//!
//! Three tasks share one cancellation scope:
//! - the reader decodes candidate frames into a bounded buffer drained by the
//!   business layer, whose replies go to the writer;
//! - the writer sends interviewer messages and reports a close once it has sent
//!   a message carrying the close flag;
//! - the countdown waits out the remaining time budget and hands the closing
//!   message to the writer.
//!
//! Whichever of external cancellation, the close signal or the error signal fires
//! first terminates the session. Everything after that is a no-op.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use interview_core::domain::{CandidateMessage, InterviewerMessage, Session};
use interview_core::ports::PortError;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::recover::{catch_panic, Panicked};
use crate::scenario::InterviewService;
use crate::web::protocol::{decode_client_frame, ErrorFrame, OutboundFrame};

/// Reader, writer and countdown.
const SESSION_TASKS: usize = 3;

const INTERNAL_ERROR: &str = "internal server error";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the client closed the connection")]
    NormalClosure,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("session task {0}")]
    Panicked(#[from] Panicked),
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The interviewer sent its closing message.
    Completed,
    ClientClosed,
    Aborted(SessionError),
    /// The server is shutting down.
    Cancelled,
}

enum Signal {
    Close,
    Error(SessionError),
}

type SharedSink<S> = Arc<Mutex<S>>;

pub struct SessionGateway {
    interviews: Arc<dyn InterviewService>,
    buffer_capacity: usize,
}

impl SessionGateway {
    pub fn new(interviews: Arc<dyn InterviewService>, buffer_capacity: usize) -> Self {
        Self { interviews, buffer_capacity: buffer_capacity.max(1) }
    }

    /// Runs the session until it terminates. `cancel` is the server's shutdown token.
    pub async fn run<S, R>(
        &self,
        session: Session,
        sink: S,
        stream: R,
        cancel: CancellationToken,
    ) -> SessionOutcome
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
    {
        let interview_id = session.interview_id;
        let scope = cancel.child_token();
        let sink: SharedSink<S> = Arc::new(Mutex::new(sink));
        let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(SESSION_TASKS);
        let (inbound_tx, inbound_rx) = mpsc::channel::<CandidateMessage>(self.buffer_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel::<InterviewerMessage>(self.buffer_capacity);

        let mut tasks = JoinSet::new();
        tasks.spawn(guarded(
            signal_tx.clone(),
            read_frames(
                stream,
                inbound_tx,
                inbound_rx,
                outbound_tx.clone(),
                self.interviews.clone(),
                session.clone(),
                scope.clone(),
            ),
        ));
        tasks.spawn(guarded(
            signal_tx.clone(),
            write_messages(sink.clone(), outbound_rx, scope.clone()),
        ));
        tasks.spawn(guarded(
            signal_tx,
            count_down(self.interviews.clone(), session.clone(), outbound_tx, scope.clone()),
        ));
        info!(
            interview_id,
            remaining_secs = session.time_remaining.as_secs(),
            "session started"
        );

        let outcome = tokio::select! {
            biased;
            signal = signal_rx.recv() => match signal {
                Some(Signal::Close) => SessionOutcome::Completed,
                Some(Signal::Error(SessionError::NormalClosure)) => SessionOutcome::ClientClosed,
                Some(Signal::Error(err)) => SessionOutcome::Aborted(err),
                None => SessionOutcome::Aborted(SessionError::Transport(
                    "session tasks stopped without a signal".to_string(),
                )),
            },
            _ = scope.cancelled() => SessionOutcome::Cancelled,
        };

        // Terminate: nothing below races with the tasks.
        scope.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(interview_id, error = %err, "session task failed");
            }
        }

        if !matches!(outcome, SessionOutcome::Completed) {
            if let Err(err) = self.interviews.pause_ongoing_session(&session).await {
                error!(interview_id, error = %err, "failed to pause the interview");
            }
        }
        finish(&sink, &outcome, interview_id).await;
        self.interviews.release(interview_id);

        match &outcome {
            SessionOutcome::Aborted(err) => warn!(interview_id, error = %err, "session aborted"),
            other => info!(interview_id, outcome = ?other, "session ended"),
        }
        outcome
    }
}

/// Runs a task body behind a panic boundary, reporting its failure on the error signal.
async fn guarded<F>(signals: mpsc::Sender<Signal>, body: F)
where
    F: Future<Output = Result<Option<Signal>, SessionError>>,
{
    let signal = match catch_panic(body).await {
        Ok(Ok(signal)) => signal,
        Ok(Err(err)) => Some(Signal::Error(err)),
        Err(panicked) => Some(Signal::Error(panicked.into())),
    };
    if let Some(signal) = signal {
        // Only the first signal matters; the rest may be dropped.
        let _ = signals.try_send(signal);
    }
}

//=========================================================================================
// Reader
//=========================================================================================

async fn read_frames<R>(
    stream: R,
    inbound_tx: mpsc::Sender<CandidateMessage>,
    inbound_rx: mpsc::Receiver<CandidateMessage>,
    outbound_tx: mpsc::Sender<InterviewerMessage>,
    interviews: Arc<dyn InterviewService>,
    session: Session,
    cancel: CancellationToken,
) -> Result<Option<Signal>, SessionError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let receiving = receive_frames(stream, inbound_tx, cancel.clone());
    let processing = process_messages(inbound_rx, outbound_tx, interviews, session, cancel);
    tokio::try_join!(receiving, processing)?;
    Ok(None)
}

async fn receive_frames<R>(
    mut stream: R,
    inbound_tx: mpsc::Sender<CandidateMessage>,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = stream.next() => frame,
        };
        let message = match frame {
            None => return Err(SessionError::NormalClosure),
            Some(Err(err)) => return Err(SessionError::Transport(err.to_string())),
            Some(Ok(Message::Close(frame))) => return Err(close_reason(frame.as_ref())),
            Some(Ok(Message::Text(text))) => decode_frame(text.as_str())?,
            Some(Ok(Message::Binary(bytes))) => {
                let text = std::str::from_utf8(&bytes).map_err(|_| {
                    SessionError::BadRequest("binary frame is not UTF-8 JSON".to_string())
                })?;
                decode_frame(text)?
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = inbound_tx.send(message) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn process_messages(
    mut inbound_rx: mpsc::Receiver<CandidateMessage>,
    outbound_tx: mpsc::Sender<InterviewerMessage>,
    interviews: Arc<dyn InterviewService>,
    session: Session,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            message = inbound_rx.recv() => message,
        };
        let Some(message) = message else {
            return Ok(());
        };
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            reply = interviews.process_incoming_message(&session, message) => reply?,
        };
        if let Some(reply) = reply {
            if !forward(&outbound_tx, reply, &cancel).await {
                return Ok(());
            }
        }
    }
}

fn decode_frame(text: &str) -> Result<CandidateMessage, SessionError> {
    decode_client_frame(text).map_err(|err| SessionError::BadRequest(err.to_string()))
}

/// A close frame with 1000 or 1001, or none at all, is a normal closure.
fn close_reason(frame: Option<&CloseFrame>) -> SessionError {
    match frame {
        None => SessionError::NormalClosure,
        Some(frame) if frame.code == close_code::NORMAL || frame.code == close_code::AWAY => {
            SessionError::NormalClosure
        }
        Some(frame) => SessionError::Transport(format!(
            "client closed with code {}: {}",
            frame.code,
            frame.reason.as_str()
        )),
    }
}

//=========================================================================================
// Writer and Countdown
//=========================================================================================

async fn write_messages<S>(
    sink: SharedSink<S>,
    mut outbound_rx: mpsc::Receiver<InterviewerMessage>,
    cancel: CancellationToken,
) -> Result<Option<Signal>, SessionError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            message = outbound_rx.recv() => message,
        };
        let Some(message) = message else {
            return Ok(None);
        };
        let text = serde_json::to_string(&OutboundFrame::from(&message))
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        let mut sink = sink.lock().await;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            sent = sink.send(Message::Text(text.into())) => {
                sent.map_err(|err| SessionError::Transport(err.to_string()))?;
            }
        }
        drop(sink);

        if message.close_connection {
            return Ok(Some(Signal::Close));
        }
    }
}

async fn count_down(
    interviews: Arc<dyn InterviewService>,
    session: Session,
    outbound_tx: mpsc::Sender<InterviewerMessage>,
    cancel: CancellationToken,
) -> Result<Option<Signal>, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        _ = sleep(session.time_remaining) => {}
    }
    info!(interview_id = session.interview_id, "time is up");

    let closing = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        closing = interviews.handle_times_up(&session) => closing?,
    };
    forward(&outbound_tx, closing.closing(), &cancel).await;
    Ok(None)
}

/// Hands a message to the writer. False once the session is over.
async fn forward(
    outbound_tx: &mpsc::Sender<InterviewerMessage>,
    message: InterviewerMessage,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = outbound_tx.send(message) => sent.is_ok(),
    }
}

//=========================================================================================
// Termination
//=========================================================================================

/// Sends the terminal frames for `outcome`. Failures are logged and ignored.
async fn finish<S>(sink: &SharedSink<S>, outcome: &SessionOutcome, interview_id: u64)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let (error, code, reason) = match outcome {
        SessionOutcome::ClientClosed => return,
        SessionOutcome::Completed => (None, close_code::NORMAL, "interview over"),
        SessionOutcome::Cancelled => (None, close_code::AWAY, "server shutting down"),
        SessionOutcome::Aborted(SessionError::BadRequest(message)) => {
            (Some(message.clone()), close_code::POLICY, "bad request")
        }
        SessionOutcome::Aborted(_) => (Some(INTERNAL_ERROR.to_string()), close_code::ERROR, INTERNAL_ERROR),
    };

    let mut sink = sink.lock().await;
    if let Some(error) = error {
        match serde_json::to_string(&ErrorFrame { error }) {
            Ok(text) => {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(interview_id, error = %err, "could not send the error frame");
                }
            }
            Err(err) => error!(interview_id, error = %err, "failed to encode the error frame"),
        }
    }
    let close = Message::Close(Some(CloseFrame { code, reason: Utf8Bytes::from_static(reason) }));
    if let Err(err) = sink.send(close).await {
        debug!(interview_id, error = %err, "could not send the close frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_and_going_away_codes_are_clean() {
        assert!(matches!(close_reason(None), SessionError::NormalClosure));
        let away = CloseFrame { code: close_code::AWAY, reason: Utf8Bytes::from_static("") };
        assert!(matches!(close_reason(Some(&away)), SessionError::NormalClosure));
        let abnormal = CloseFrame { code: 4000, reason: Utf8Bytes::from_static("tab crashed") };
        assert!(matches!(close_reason(Some(&abnormal)), SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn a_panicking_task_raises_the_error_signal() {
        let (tx, mut rx) = mpsc::channel(1);
        guarded(tx, async {
            if true {
                panic!("writer exploded");
            }
            Ok(None)
        })
        .await;
        assert!(matches!(rx.recv().await, Some(Signal::Error(SessionError::Panicked(_)))));
    }
}
