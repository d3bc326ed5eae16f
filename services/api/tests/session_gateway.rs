//! The session gateway driven over an in-memory WebSocket pair.

use api_lib::scenario::InterviewService;
use api_lib::web::{SessionError, SessionGateway, SessionOutcome};
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use bytes::Bytes;
use chrono::Utc;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use interview_core::domain::{
    CandidateMessage, InterviewId, InterviewerMessage, Session, UserId,
};
use interview_core::ports::{PortError, PortResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Default)]
enum Mode {
    #[default]
    Normal,
    Failing,
    Panicking,
}

/// Replies to every finished sentence and records what the gateway asked of it.
#[derive(Default)]
struct ScriptedInterviews {
    mode: Mode,
    processed: AtomicUsize,
    times_up: AtomicUsize,
    paused: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedInterviews {
    fn with_mode(mode: Mode) -> Arc<Self> {
        Arc::new(Self { mode, ..Self::default() })
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterviewService for ScriptedInterviews {
    async fn set_up(&self, _user_id: UserId, _question: &str) -> PortResult<String> {
        Ok("token".to_string())
    }

    async fn join(&self, _token: &str) -> PortResult<Session> {
        Err(PortError::Unauthorized)
    }

    async fn process_incoming_message(
        &self,
        _session: &Session,
        message: CandidateMessage,
    ) -> PortResult<Option<InterviewerMessage>> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Failing => return Err(PortError::Unavailable("model down".to_string())),
            Mode::Panicking => panic!("interviewer lost its train of thought"),
            Mode::Normal => {}
        }
        let finished = message.chunk.is_some_and(|chunk| chunk.ends_with('.'));
        Ok(finished.then(|| InterviewerMessage::with_url("http://localhost/v1/audio/reply.mp3")))
    }

    async fn handle_times_up(&self, _session: &Session) -> PortResult<InterviewerMessage> {
        self.times_up.fetch_add(1, Ordering::SeqCst);
        Ok(InterviewerMessage::with_url("http://localhost/v1/audio/goodbye.mp3"))
    }

    async fn pause_ongoing_session(&self, _session: &Session) -> PortResult<()> {
        self.paused.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abandon_unfinished(&self, _user_id: UserId) -> PortResult<()> {
        Ok(())
    }

    fn release(&self, _interview_id: InterviewId) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct Client {
    to_server: UnboundedSender<Result<Message, axum::Error>>,
    from_server: UnboundedReceiver<Message>,
}

impl Client {
    fn send_text(&self, text: &str) {
        self.to_server
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    fn send_binary(&self, payload: &'static [u8]) {
        self.to_server
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(payload))))
            .unwrap();
    }

    fn send_close(&self, code: u16) {
        let frame = CloseFrame { code, reason: Utf8Bytes::from_static("") };
        self.to_server.unbounded_send(Ok(Message::Close(Some(frame)))).unwrap();
    }
}

fn session(time_remaining: Duration) -> Session {
    Session { interview_id: 1, user_id: 1, time_remaining, joined_at: Utc::now() }
}

fn connect(
    interviews: Arc<ScriptedInterviews>,
    time_remaining: Duration,
    cancel: CancellationToken,
) -> (Client, JoinHandle<SessionOutcome>) {
    let (to_server, server_stream) = unbounded();
    let (server_sink, from_server) = unbounded();
    let gateway = SessionGateway::new(interviews, 20);
    let handle = tokio::spawn(async move {
        gateway.run(session(time_remaining), server_sink, server_stream, cancel).await
    });
    (Client { to_server, from_server }, handle)
}

fn close_code_of(message: &Message) -> Option<u16> {
    match message {
        Message::Close(Some(frame)) => Some(frame.code),
        _ => None,
    }
}

fn text_of(message: &Message) -> serde_json::Value {
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

const LONG: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn frames_with_a_url_are_rejected_as_bad_requests() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_text(r#"{"from":"client","url":"x"}"#);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::BadRequest(_))));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(frames.len(), 2);
    assert!(text_of(&frames[0])["error"].as_str().unwrap().contains("url"));
    assert_eq!(close_code_of(&frames[1]), Some(close_code::POLICY));

    assert_eq!(ScriptedInterviews::count(&interviews.processed), 0);
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
    assert_eq!(ScriptedInterviews::count(&interviews.released), 1);
}

#[tokio::test(start_paused = true)]
async fn binary_frames_are_validated_like_text_frames() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_binary(br#"{"from":"client","url":"x"}"#);
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::BadRequest(_))));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(frames.len(), 2);
    assert!(text_of(&frames[0])["error"].as_str().unwrap().contains("url"));
    assert_eq!(close_code_of(&frames[1]), Some(close_code::POLICY));
    assert_eq!(ScriptedInterviews::count(&interviews.processed), 0);
}

#[tokio::test(start_paused = true)]
async fn binary_frames_that_are_not_utf8_are_bad_requests() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_binary(&[0xFF, 0xFE, 0x00]);
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::BadRequest(_))));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(close_code_of(frames.last().unwrap()), Some(close_code::POLICY));
}

#[tokio::test(start_paused = true)]
async fn well_formed_binary_frames_reach_the_interviewer() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (mut client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_binary(br#"{"from":"client","chunk":"Could I get a hint."}"#);
    let reply = client.from_server.next().await.unwrap();
    assert_eq!(text_of(&reply)["url"], "http://localhost/v1/audio/reply.mp3");

    client.send_close(close_code::NORMAL);
    assert!(matches!(handle.await.unwrap(), SessionOutcome::ClientClosed));
    assert_eq!(ScriptedInterviews::count(&interviews.processed), 1);
}

#[tokio::test(start_paused = true)]
async fn countdown_ends_the_session_exactly_once() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let started = Instant::now();
    let (client, handle) = connect(interviews.clone(), Duration::from_secs(90), CancellationToken::new());

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Completed));
    assert!(started.elapsed() >= Duration::from_secs(90));

    let Client { to_server, from_server } = client;
    drop(to_server);
    let frames: Vec<Message> = from_server.collect().await;
    assert_eq!(frames.len(), 2);
    assert_eq!(
        text_of(&frames[0]),
        serde_json::json!({"from": "server", "url": "http://localhost/v1/audio/goodbye.mp3"})
    );
    assert_eq!(close_code_of(&frames[1]), Some(close_code::NORMAL));

    assert_eq!(ScriptedInterviews::count(&interviews.times_up), 1);
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 0);
    assert_eq!(ScriptedInterviews::count(&interviews.released), 1);
}

#[tokio::test(start_paused = true)]
async fn replies_flow_until_the_client_closes() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (mut client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_text(r#"{"from":"client","chunk":"I would sort the array","code":"def f(): pass"}"#);
    client.to_server.unbounded_send(Ok(Message::Ping(Default::default()))).unwrap();
    client.send_text(r#"{"from":"client","chunk":" and then use two pointers."}"#);

    let reply = client.from_server.next().await.unwrap();
    assert_eq!(text_of(&reply)["url"], "http://localhost/v1/audio/reply.mp3");
    assert!(text_of(&reply).get("close_connection").is_none());

    client.send_close(close_code::NORMAL);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::ClientClosed));

    // Nothing follows a client-initiated close.
    let rest: Vec<Message> = client.from_server.collect().await;
    assert!(rest.is_empty());
    assert_eq!(ScriptedInterviews::count(&interviews.processed), 2);
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
    assert_eq!(ScriptedInterviews::count(&interviews.times_up), 0);
}

#[tokio::test(start_paused = true)]
async fn business_errors_pause_and_report_an_internal_error() {
    let interviews = ScriptedInterviews::with_mode(Mode::Failing);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_text(r#"{"from":"client","chunk":"hello."}"#);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::Port(PortError::Unavailable(_)))));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(frames.len(), 2);
    assert_eq!(text_of(&frames[0]), serde_json::json!({"error": "internal server error"}));
    assert_eq!(close_code_of(&frames[1]), Some(close_code::ERROR));
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
}

#[tokio::test(start_paused = true)]
async fn a_panicking_handler_aborts_only_its_session() {
    let interviews = ScriptedInterviews::with_mode(Mode::Panicking);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_text(r#"{"from":"client","chunk":"hello."}"#);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::Panicked(_))));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(close_code_of(frames.last().unwrap()), Some(close_code::ERROR));
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
    assert_eq!(ScriptedInterviews::count(&interviews.released), 1);
}

#[tokio::test(start_paused = true)]
async fn server_shutdown_cancels_the_session() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let cancel = CancellationToken::new();
    let (client, handle) = connect(interviews.clone(), LONG, cancel.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Cancelled));

    let frames: Vec<Message> = client.from_server.collect().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(close_code_of(&frames[0]), Some(close_code::AWAY));
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
    assert_eq!(ScriptedInterviews::count(&interviews.times_up), 0);
}

#[tokio::test(start_paused = true)]
async fn an_abnormal_close_code_is_a_transport_error() {
    let interviews = ScriptedInterviews::with_mode(Mode::Normal);
    let (client, handle) = connect(interviews.clone(), LONG, CancellationToken::new());

    client.send_close(4001);
    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Aborted(SessionError::Transport(_))));
    assert_eq!(ScriptedInterviews::count(&interviews.paused), 1);
}
