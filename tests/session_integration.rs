//! Integration tests for the session connection against a local Realtime stand-in
//!
//! Each test starts a plain `ws://` server on an ephemeral port that speaks
//! just enough of the Realtime protocol: it answers the handshake with the
//! beta subprotocol, greets with `session.created`, forwards every client
//! frame to the test and sends whatever the test scripts.
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use practice_realtime::audio::codec::{base64_to_bytes, bytes_to_base64};
use practice_realtime::audio::{
    AudioError, CaptureBackend, DeviceHandle, FrameConfig, OutputBackend, SampleQueue,
    SampleSender,
};
use practice_realtime::realtime::protocol::BETA_SUBPROTOCOL;
use practice_realtime::realtime::{
    CloseClassification, ConnectionSettings, Credential, CredentialError, CredentialSource,
    RetryPolicy, SessionConnection, SessionEventReceiver, Speaker,
};
use practice_realtime::{ClientError, ConnectionState, Conversation, SessionConfig, SessionEvent};

const TOKEN: &str = "ek_integration_token_0123456789";
const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Realtime stand-in
// ============================================================================

enum Action {
    Send(Value),
    Raw(&'static str),
    Close(u16, &'static str),
    Drop,
}

#[derive(Debug, Clone)]
struct Handshake {
    uri: String,
    protocols: Option<String>,
}

struct RealtimeServer {
    url: String,
    handshake: Arc<Mutex<Option<Handshake>>>,
    frames: mpsc::UnboundedReceiver<Value>,
    actions: mpsc::UnboundedSender<Action>,
}

impl RealtimeServer {
    /// Server that greets with `session.created`
    async fn start() -> Self {
        Self::spawn(true).await
    }

    /// Server that completes the handshake and then says nothing
    async fn silent() -> Self {
        Self::spawn(false).await
    }

    async fn spawn(greet: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());

        let handshake = Arc::new(Mutex::new(None));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (actions, actions_rx) = mpsc::unbounded_channel();

        let seen = handshake.clone();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve(stream, seen, greet, frames_tx, actions_rx).await;
            }
        });

        Self {
            url,
            handshake,
            frames,
            actions,
        }
    }

    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            realtime_url: self.url.clone(),
            model: "test-model".to_string(),
            connect_timeout: WAIT,
        }
    }

    fn handshake(&self) -> Option<Handshake> {
        self.handshake.lock().unwrap().clone()
    }

    fn send(&self, message: Value) {
        self.actions.send(Action::Send(message)).unwrap();
    }

    /// Send a text frame verbatim, valid JSON or not
    fn send_raw(&self, text: &'static str) {
        self.actions.send(Action::Raw(text)).unwrap();
    }

    fn close(&self, code: u16, reason: &'static str) {
        self.actions.send(Action::Close(code, reason)).unwrap();
    }

    fn drop_connection(&self) {
        self.actions.send(Action::Drop).unwrap();
    }

    /// Next frame the client sent (close frames arrive as `{"type": "close"}`)
    async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server task ended")
    }
}

async fn serve(
    stream: TcpStream,
    seen: Arc<Mutex<Option<Handshake>>>,
    greet: bool,
    frames: mpsc::UnboundedSender<Value>,
    mut actions: mpsc::UnboundedReceiver<Action>,
) {
    let callback = move |request: &Request, mut response: Response| {
        let protocols = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *seen.lock().unwrap() = Some(Handshake {
            uri: request.uri().to_string(),
            protocols,
        });

        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(BETA_SUBPROTOCOL),
        );
        Ok::<_, ErrorResponse>(response)
    };

    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    if greet {
        let created = json!({ "type": "session.created", "session": { "id": "sess_test" } });
        if ws.send(Message::Text(created.to_string())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames.send(serde_json::from_str(&text).unwrap());
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = frames.send(json!({ "type": "close", "code": code }));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
            action = actions.recv() => match action {
                Some(Action::Send(message)) => {
                    let _ = ws.send(Message::Text(message.to_string())).await;
                }
                Some(Action::Raw(text)) => {
                    let _ = ws.send(Message::Text(text.to_string())).await;
                }
                Some(Action::Close(code, reason)) => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                        .await;
                }
                Some(Action::Drop) | None => return,
            },
        }
    }
}

// ============================================================================
// Fakes
// ============================================================================

struct StaticCredentials;

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn fetch(&self, _config: &SessionConfig) -> Result<Credential, CredentialError> {
        Ok(Credential::new(TOKEN, None))
    }
}

struct RefusingCredentials;

#[async_trait]
impl CredentialSource for RefusingCredentials {
    async fn fetch(&self, _config: &SessionConfig) -> Result<Credential, CredentialError> {
        Err(CredentialError::Status {
            status: 500,
            message: "token service down".to_string(),
        })
    }
}

/// Microphone that delivers one buffer as soon as it opens
struct OneShotCapture {
    samples: Vec<f32>,
}

impl CaptureBackend for OneShotCapture {
    fn start(&self, samples: SampleSender) -> Result<DeviceHandle, AudioError> {
        let _ = samples.send(self.samples.clone());
        Ok(DeviceHandle::new(24_000, || {}))
    }
}

/// Microphone that stays open until released, recording the release
#[derive(Default)]
struct HeldCapture {
    /// Keeps the sample channel open like a live device
    _stream: Mutex<Option<SampleSender>>,
    released: Arc<AtomicBool>,
}

impl CaptureBackend for HeldCapture {
    fn start(&self, samples: SampleSender) -> Result<DeviceHandle, AudioError> {
        let _ = samples.send(vec![0.1; 480]);
        *self._stream.lock().unwrap() = Some(samples);
        let released = self.released.clone();
        Ok(DeviceHandle::new(24_000, move || {
            released.store(true, Ordering::SeqCst);
        }))
    }
}

/// Speaker that keeps its queue around for inspection
#[derive(Default)]
struct RecordingOutput {
    queue: Mutex<Option<SampleQueue>>,
}

impl RecordingOutput {
    fn queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap()
            .as_ref()
            .map(|q| q.lock().unwrap().len())
            .unwrap_or(0)
    }
}

impl OutputBackend for RecordingOutput {
    fn start(&self, queue: SampleQueue) -> Result<DeviceHandle, AudioError> {
        *self.queue.lock().unwrap() = Some(queue);
        Ok(DeviceHandle::new(24_000, || {}))
    }
}

fn session(server: &RealtimeServer) -> (SessionConnection, SessionEventReceiver) {
    SessionConnection::new(server.settings(), Arc::new(StaticCredentials))
}

async fn next_event(events: &mut SessionEventReceiver) -> SessionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

/// Poll until `condition` holds or WAIT runs out
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn config() -> SessionConfig {
    SessionConfig::new("Habla solo en español").with_voice("alloy")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_sends_session_update_first() {
    let mut server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);

    connection.connect(config()).await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    let first = server.next_frame().await;
    assert_eq!(first["type"], "session.update");
    assert_eq!(first["session"]["instructions"], "Habla solo en español");
    assert_eq!(first["session"]["voice"], "alloy");
    assert_eq!(first["session"]["input_audio_format"], "pcm16");
    assert_eq!(first["session"]["modalities"], json!(["text", "audio"]));

    let handshake = server.handshake().unwrap();
    assert_eq!(handshake.uri, "/v1/realtime?model=test-model");
    let protocols = handshake.protocols.unwrap();
    assert!(protocols.contains(BETA_SUBPROTOCOL));
    assert!(protocols.contains(&format!("openai-insecure-api-key.{}", TOKEN)));

    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);

    let close = server.next_frame().await;
    assert_eq!(close["type"], "close");
    assert_eq!(close["code"], 1000);
}

#[tokio::test]
async fn test_server_events_become_session_events() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    let pcm = vec![1u8, 0, 2, 0, 3, 0];
    server.send(json!({ "type": "session.updated", "session": {} }));
    server.send(json!({ "type": "response.audio.delta", "delta": bytes_to_base64(&pcm) }));
    server.send(json!({ "type": "response.audio_transcript.delta", "delta": "Hola" }));
    server.send(json!({ "type": "response.audio_transcript.done", "transcript": "Hola, ¿qué tal?" }));
    server.send(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "transcript": "Muy bien"
    }));
    server.send(json!({ "type": "rate_limits.updated", "rate_limits": [] }));
    server.send(json!({ "type": "response.done", "response": {} }));

    assert_eq!(next_event(&mut events).await, SessionEvent::AudioReceived(pcm));

    let SessionEvent::Transcript(delta) = next_event(&mut events).await else {
        panic!("expected a transcript delta");
    };
    assert_eq!(delta.speaker, Speaker::Ai);
    assert_eq!(delta.text, "Hola");
    assert!(!delta.is_final);

    let SessionEvent::Transcript(done) = next_event(&mut events).await else {
        panic!("expected a completed transcript");
    };
    assert_eq!(done.text, "Hola, ¿qué tal?");
    assert!(done.is_final);

    let SessionEvent::Transcript(user) = next_event(&mut events).await else {
        panic!("expected the user transcript");
    };
    assert_eq!(user.speaker, Speaker::User);
    assert_eq!(user.text, "Muy bien");
    assert!(user.is_final);

    assert_eq!(connection.state(), ConnectionState::Open);
    connection.disconnect().await;
}

#[tokio::test]
async fn test_send_text_creates_item_then_response() {
    let mut server = RealtimeServer::start().await;
    let (mut connection, _events) = session(&server);
    connection.connect(config()).await.unwrap();

    connection.send_text("¿Cómo estás?").unwrap();

    assert_eq!(server.next_frame().await["type"], "session.update");

    let item = server.next_frame().await;
    assert_eq!(item["type"], "conversation.item.create");
    assert_eq!(item["item"]["role"], "user");
    assert_eq!(item["item"]["content"][0]["type"], "input_text");
    assert_eq!(item["item"]["content"][0]["text"], "¿Cómo estás?");

    assert_eq!(server.next_frame().await["type"], "response.create");

    connection.disconnect().await;
}

#[tokio::test]
async fn test_invalid_api_key_ends_session() {
    let mut server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(server.next_frame().await["type"], "session.update");

    server.send(json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "code": "invalid_api_key",
            "message": "Incorrect API key provided"
        }
    }));

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Error(ClientError::InvalidApiKey)
    );
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.outbound().unwrap_err(), ClientError::NotConnected);

    let close = server.next_frame().await;
    assert_eq!(close["type"], "close");
    assert_eq!(close["code"], 1008);

    // Already closed: nothing more to announce
    connection.disconnect().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_other_api_errors_keep_session_open() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    server.send(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": "Unknown parameter" }
    }));

    let SessionEvent::Error(error) = next_event(&mut events).await else {
        panic!("expected an error event");
    };
    assert_eq!(error.to_string(), "Realtime API error: Unknown parameter");
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.disconnect().await;
}

#[tokio::test]
async fn test_server_drop_reports_abnormal_close() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    server.drop_connection();

    let SessionEvent::Error(error) = next_event(&mut events).await else {
        panic!("expected a transport error");
    };
    assert!(
        matches!(error, ClientError::Transport { code: 1006, .. }),
        "got {:?}",
        error
    );
    assert_eq!(
        error.classification(),
        Some(CloseClassification::NetworkOrHandshake)
    );
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.config().is_none());
}

#[tokio::test]
async fn test_normal_server_close_is_not_an_error() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    server.close(1000, "session finished");

    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_policy_close_is_classified() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    server.close(1008, "token expired");

    let SessionEvent::Error(error) = next_event(&mut events).await else {
        panic!("expected a transport error");
    };
    assert_eq!(error.classification(), Some(CloseClassification::AuthOrPolicy));
    assert!(error.to_string().contains("token expired"));
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
}

#[tokio::test]
async fn test_disconnect_twice_announces_once() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();

    connection.disconnect().await;
    connection.disconnect().await;

    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(events.try_recv().is_err());
    assert_eq!(connection.send_text("hola"), Err(ClientError::NotConnected));
}

#[tokio::test]
async fn test_connect_times_out_without_session_created() {
    let server = RealtimeServer::silent().await;
    let settings = ConnectionSettings {
        connect_timeout: Duration::from_millis(300),
        ..server.settings()
    };
    let (mut connection, mut events) =
        SessionConnection::new(settings, Arc::new(StaticCredentials));

    let result = connection.connect(config()).await;

    assert_eq!(
        result,
        Err(ClientError::ConnectionTimeout(Duration::from_millis(300)))
    );
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(matches!(
        events.try_recv(),
        Ok(SessionEvent::Error(ClientError::ConnectionTimeout(_)))
    ));
    assert!(events.try_recv().is_err());
    assert!(server.handshake().is_some());
}

#[tokio::test]
async fn test_credential_failure_never_opens_socket() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) =
        SessionConnection::new(server.settings(), Arc::new(RefusingCredentials));

    let result = connection
        .connect_with_retry(config(), &RetryPolicy::no_retry())
        .await;

    assert!(matches!(
        result,
        Err(ClientError::Credential(CredentialError::Status { status: 500, .. }))
    ));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Error(_))));
    assert!(events.try_recv().is_err());
    assert!(server.handshake().is_none());
}

#[tokio::test]
async fn test_conversation_streams_microphone_and_plays_reply() {
    let mut server = RealtimeServer::start().await;
    let output = Arc::new(RecordingOutput::default());
    let frames = FrameConfig::default();
    let frame_len = frames.samples_per_frame();

    let (mut conversation, mut events) = Conversation::with_parts(
        server.settings(),
        Arc::new(StaticCredentials),
        Arc::new(OneShotCapture {
            samples: vec![0.25; frame_len],
        }),
        output.clone(),
        frames,
        RetryPolicy::no_retry(),
    );

    conversation.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    conversation.start_capture().unwrap();
    assert!(conversation.is_capturing());
    conversation.stop_capture().await;
    assert!(!conversation.is_capturing());

    assert_eq!(server.next_frame().await["type"], "session.update");

    let append = server.next_frame().await;
    assert_eq!(append["type"], "input_audio_buffer.append");
    let audio = base64_to_bytes(append["audio"].as_str().unwrap()).unwrap();
    assert_eq!(audio.len(), frame_len * 2);

    assert_eq!(server.next_frame().await["type"], "input_audio_buffer.commit");
    assert_eq!(server.next_frame().await["type"], "response.create");

    let pcm = vec![0u8, 16, 0, 240];
    server.send(json!({ "type": "response.audio.delta", "delta": bytes_to_base64(&pcm) }));
    assert_eq!(next_event(&mut events).await, SessionEvent::AudioReceived(pcm));
    assert!(eventually(|| output.queued() == 2).await);

    conversation.disconnect().await;
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert_eq!(conversation.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_bad_frames_are_dropped_and_session_stays_open() {
    let server = RealtimeServer::start().await;
    let (mut connection, mut events) = session(&server);
    connection.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    server.send_raw("not json");
    server.send_raw(r#"{"no_type": true}"#);
    server.send(json!({ "type": "response.audio.delta", "delta": "%%% not base64 %%%" }));
    server.send(json!({ "type": "response.audio_transcript.done", "transcript": "Sigo aquí" }));

    let SessionEvent::Transcript(entry) = next_event(&mut events).await else {
        panic!("expected the transcript after the bad frames");
    };
    assert_eq!(entry.text, "Sigo aquí");
    assert!(entry.is_final);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert!(events.try_recv().is_err());

    connection.send_text("hola").unwrap();
    connection.disconnect().await;
}

#[tokio::test]
async fn test_error_before_session_created_fails_connect_immediately() {
    let server = RealtimeServer::silent().await;
    server.send(json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "code": "invalid_api_key",
            "message": "Incorrect API key provided"
        }
    }));
    let (mut connection, mut events) = session(&server);

    let started = Instant::now();
    let result = connection.connect(config()).await;

    assert_eq!(result, Err(ClientError::InvalidApiKey));
    assert!(started.elapsed() < WAIT / 2, "took {:?}", started.elapsed());
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Error(ClientError::InvalidApiKey)
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_close_before_session_created_fails_connect_immediately() {
    let server = RealtimeServer::silent().await;
    server.close(1008, "bad token");
    let (mut connection, mut events) = session(&server);

    let started = Instant::now();
    let result = connection.connect(config()).await;

    let Err(error) = result else {
        panic!("connect should fail on an early close");
    };
    assert!(
        matches!(error, ClientError::Transport { code: 1008, .. }),
        "got {:?}",
        error
    );
    assert_eq!(error.classification(), Some(CloseClassification::AuthOrPolicy));
    assert!(started.elapsed() < WAIT / 2, "took {:?}", started.elapsed());
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_server_drop_releases_microphone() {
    let server = RealtimeServer::start().await;
    let capture = Arc::new(HeldCapture::default());
    let (mut conversation, mut events) = Conversation::with_parts(
        server.settings(),
        Arc::new(StaticCredentials),
        capture.clone(),
        Arc::new(RecordingOutput::default()),
        FrameConfig::default(),
        RetryPolicy::no_retry(),
    );

    conversation.connect(config()).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    conversation.start_capture().unwrap();
    assert!(conversation.is_capturing());

    server.drop_connection();

    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(eventually(|| !conversation.is_capturing()).await);
    assert!(capture.released.load(Ordering::SeqCst));

    // Stopping now has no open turn to close
    conversation.stop_capture().await;
    assert_eq!(conversation.state(), ConnectionState::Closed);
}
