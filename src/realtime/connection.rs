//! Session connection state machine
//!
//! One `SessionConnection` holds at most one live WebSocket. Establishing a
//! session fetches a fresh credential, opens the socket with the realtime
//! subprotocols and waits for `session.created`. Once open, a reader task
//! dispatches inbound frames to the event channel and a writer task drains
//! outbound events in order.
//!
//! # Event guarantees
//!
//! - Events from a previous connection never leak into a newer one; every
//!   task carries the generation it was started for.
//! - `Disconnected` is emitted at most once per established connection.
//! - Nothing is emitted for a connection after `disconnect()` returns.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::close_code::{
    code_for_transport_error, is_closed_for_cause, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use super::credential::{Credential, CredentialError, CredentialSource};
use super::protocol::{
    self, InboundEvent, OutboundEvent, SessionConfig, BETA_SUBPROTOCOL, DEFAULT_MODEL,
    REALTIME_API_URL,
};
use super::retry::{self, Connector, RetryPolicy};
use super::transcript::{Speaker, TranscriptEntry};
use super::{ClientError, ConnectionState};
use crate::audio::AudioSink;

/// Default bound on opening the socket and receiving `session.created`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long `disconnect()` waits for the close frame to go out
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Where and how to open the realtime socket
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub realtime_url: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            realtime_url: REALTIME_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectionSettings {
    /// Socket URL with the model query parameter
    pub fn endpoint_url(&self) -> String {
        let separator = if self.realtime_url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.realtime_url, separator, self.model)
    }
}

/// Notifications delivered to the session owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error(ClientError),
    /// PCM16 bytes of synthesized speech (also handed to the audio sink)
    AudioReceived(Vec<u8>),
    Transcript(TranscriptEntry),
}

pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Instructions for the writer task
#[derive(Debug)]
pub(crate) enum WriterCommand {
    Send(OutboundEvent),
    Close(CloseFrame<'static>),
}

/// Cloneable handle for queueing outbound events on an open connection
///
/// Goes dead as soon as the connection leaves `Open`.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<WriterCommand>,
    open: Arc<watch::Sender<bool>>,
}

impl OutboundSender {
    /// Queue an event for the writer task
    pub fn send(&self, event: OutboundEvent) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        self.tx
            .send(WriterCommand::Send(event))
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow() && !self.tx.is_closed()
    }

    /// Resolves once the connection this sender belongs to has left `Open`
    pub async fn closed(&self) {
        let mut open = self.open.subscribe();
        tokio::select! {
            _ = open.wait_for(|open| !*open) => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Sender wired to a bare channel, for exercising producers
    #[cfg(test)]
    pub(crate) fn detached(open: bool) -> (Self, mpsc::UnboundedReceiver<WriterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (open, _) = watch::channel(open);
        let sender = Self {
            tx,
            open: Arc::new(open),
        };
        (sender, rx)
    }

    #[cfg(test)]
    pub(crate) fn close(&self) {
        self.open.send_replace(false);
    }
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every connect and disconnect; tasks of older generations go quiet
    generation: u64,
    /// `Connected` was emitted and `Disconnected` is still owed
    announced: bool,
    config: Option<Arc<SessionConfig>>,
    outbound_open: Arc<watch::Sender<bool>>,
}

/// State shared between the connection handle and its tasks
struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SessionEvent>,
    audio_sink: Option<Arc<dyn AudioSink>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening; that's fine
        let _ = self.events.send(event);
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state != next {
            log::info!("Connection: {} -> {}", inner.state, next);
            inner.state = next;
        }
    }

    /// Tear down the current generation's bookkeeping and land in `Closed`
    fn finish(&self, inner: &mut Inner) {
        inner.outbound_open.send_replace(false);
        inner.config = None;
        if inner.announced {
            inner.announced = false;
            self.emit(SessionEvent::Disconnected);
        }
        self.transition(inner, ConnectionState::Closed);
    }

    /// Handle one decoded frame; returns false once the reader should stop
    fn dispatch(
        &self,
        generation: u64,
        event: InboundEvent,
        control: &mpsc::UnboundedSender<WriterCommand>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.state.is_open() {
            return false;
        }

        match event {
            InboundEvent::Error(info) => {
                let invalid_key = info.is_invalid_api_key();
                let error = ClientError::from_api(info);
                log::error!("Connection: server error: {}", error);
                self.emit(SessionEvent::Error(error));

                if invalid_key {
                    self.transition(&mut inner, ConnectionState::Failed);
                    let _ = control.send(WriterCommand::Close(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "invalid api key".into(),
                    }));
                    self.finish(&mut inner);
                    return false;
                }
            }
            InboundEvent::AudioDelta(bytes) => {
                if bytes.is_empty() {
                    return true;
                }
                self.emit(SessionEvent::AudioReceived(bytes.clone()));
                drop(inner);

                if let Some(sink) = &self.audio_sink {
                    sink.play(&bytes);
                }
            }
            InboundEvent::TranscriptDelta { speaker, text } => {
                self.emit_transcript(speaker, text, false)
            }
            InboundEvent::TranscriptDone { speaker, text } => {
                self.emit_transcript(speaker, text, true)
            }
            InboundEvent::ContentItemAdded(Some(text)) => {
                self.emit_transcript(Speaker::Ai, text, true)
            }
            InboundEvent::ContentItemAdded(None) => {
                log::debug!("Connection: output item without text content")
            }
            InboundEvent::SessionCreated => log::info!("Connection: session created"),
            InboundEvent::SessionUpdated => log::info!("Connection: session configured"),
            InboundEvent::ResponseDone => log::debug!("Connection: response done"),
            InboundEvent::Unhandled(tag) => {
                log::debug!("Connection: unhandled message type: {}", tag)
            }
        }

        true
    }

    fn emit_transcript(&self, speaker: Speaker, text: String, is_final: bool) {
        if text.is_empty() {
            return;
        }
        self.emit(SessionEvent::Transcript(TranscriptEntry::new(
            speaker, text, is_final,
        )));
    }

    /// The socket went away underneath an open session
    fn transport_closed(&self, generation: u64, code: u16, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.state.is_open() {
            return;
        }

        if is_closed_for_cause(code) {
            let error = ClientError::transport(code, reason);
            log::error!("Connection: {}", error);
            self.emit(SessionEvent::Error(error));
            self.transition(&mut inner, ConnectionState::Failed);
        } else {
            self.transition(&mut inner, ConnectionState::Closing);
        }
        self.finish(&mut inner);
    }
}

/// Tasks and control channel of one open socket
struct Link {
    control: mpsc::UnboundedSender<WriterCommand>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    async fn shutdown(mut self) {
        let _ = self.control.send(WriterCommand::Close(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        }));

        if timeout(CLOSE_GRACE, &mut self.writer).await.is_err() {
            log::warn!("Connection: close frame not flushed within {:?}", CLOSE_GRACE);
        }
        self.reader.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Handle to one realtime conversation session
pub struct SessionConnection {
    settings: ConnectionSettings,
    credentials: Arc<dyn CredentialSource>,
    shared: Arc<Shared>,
    link: Option<Link>,
}

impl SessionConnection {
    pub fn new(
        settings: ConnectionSettings,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, SessionEventReceiver) {
        Self::build(settings, credentials, None)
    }

    /// Like [`SessionConnection::new`], routing synthesized speech to `sink`
    pub fn with_audio_sink(
        settings: ConnectionSettings,
        credentials: Arc<dyn CredentialSource>,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, SessionEventReceiver) {
        Self::build(settings, credentials, Some(sink))
    }

    fn build(
        settings: ConnectionSettings,
        credentials: Arc<dyn CredentialSource>,
        audio_sink: Option<Arc<dyn AudioSink>>,
    ) -> (Self, SessionEventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                generation: 0,
                announced: false,
                config: None,
                outbound_open: Arc::new(watch::channel(false).0),
            }),
            events,
            audio_sink,
        });

        let connection = Self {
            settings,
            credentials,
            shared,
            link: None,
        };
        (connection, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Config of the current connection; cleared on disconnect
    pub fn config(&self) -> Option<Arc<SessionConfig>> {
        self.shared.lock().config.clone()
    }

    /// Establish a session; on failure one `Error` event is emitted
    pub async fn connect(&mut self, config: SessionConfig) -> Result<(), ClientError> {
        let result = self.establish(config).await;
        if let Err(e) = &result {
            self.report_error(e.clone());
        }
        result
    }

    /// Establish a session, retrying per `policy`
    ///
    /// Only the final failure is reported as an `Error` event.
    pub async fn connect_with_retry(
        &mut self,
        config: SessionConfig,
        policy: &RetryPolicy,
    ) -> Result<(), ClientError> {
        let result = retry::connect_with_retry(self, &config, policy).await;
        if let Err(e) = &result {
            self.report_error(e.clone());
        }
        result
    }

    /// Emit an error that belongs to this session but didn't come off the wire
    pub fn report_error(&self, error: ClientError) {
        self.shared.emit(SessionEvent::Error(error));
    }

    /// Handle for queueing audio frames; fails unless the session is open
    pub fn outbound(&self) -> Result<OutboundSender, ClientError> {
        let inner = self.shared.lock();
        if !inner.state.is_open() {
            return Err(ClientError::NotConnected);
        }
        let link = self.link.as_ref().ok_or(ClientError::NotConnected)?;

        Ok(OutboundSender {
            tx: link.control.clone(),
            open: inner.outbound_open.clone(),
        })
    }

    /// Add a user text message and ask the model to respond
    pub fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let sender = self.outbound()?;
        sender.send(OutboundEvent::ConversationItemCreate(text.to_string()))?;
        sender.send(OutboundEvent::ResponseCreate)
    }

    /// Close the session; a no-op when nothing is open
    pub async fn disconnect(&mut self) {
        let link = self.link.take();
        {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    log::info!("Connection: disconnecting");
                    inner.generation += 1;
                    self.shared.transition(&mut inner, ConnectionState::Closing);
                    self.shared.finish(&mut inner);
                }
                _ => inner.config = None,
            }
        }

        if let Some(link) = link {
            link.shutdown().await;
        }
    }

    async fn establish(&mut self, config: SessionConfig) -> Result<(), ClientError> {
        // Exactly one socket per session
        self.disconnect().await;

        let config = Arc::new(config);
        let generation = self.begin_connecting(config.clone());

        match self.open_session(generation, config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Connection: failed to connect: {}", e);
                self.fail_connecting(generation);
                Err(e)
            }
        }
    }

    fn begin_connecting(&self, config: Arc<SessionConfig>) -> u64 {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.announced = false;
        inner.config = Some(config);
        inner.outbound_open = Arc::new(watch::channel(false).0);
        self.shared.transition(&mut inner, ConnectionState::Connecting);
        inner.generation
    }

    fn fail_connecting(&self, generation: u64) {
        let mut inner = self.shared.lock();
        if inner.generation == generation && inner.state == ConnectionState::Connecting {
            inner.config = None;
            self.shared.transition(&mut inner, ConnectionState::Failed);
        }
    }

    async fn open_session(
        &mut self,
        generation: u64,
        config: Arc<SessionConfig>,
    ) -> Result<(), ClientError> {
        let credential = self.credentials.fetch(&config).await?;
        if credential.is_expired() {
            log::warn!("Connection: credential is already past its expiry");
        }

        let connect_timeout = self.settings.connect_timeout;
        let (write, read) = timeout(connect_timeout, open_transport(&self.settings, credential))
            .await
            .map_err(|_| ClientError::ConnectionTimeout(connect_timeout))??;

        self.start_link(generation, config, write, read);
        Ok(())
    }

    fn start_link(
        &mut self,
        generation: u64,
        config: Arc<SessionConfig>,
        write: WsWrite,
        read: WsRead,
    ) {
        let (control, commands) = mpsc::unbounded_channel();

        // Session config goes out before any audio
        let _ = control.send(WriterCommand::Send(OutboundEvent::SessionUpdate(config)));
        let writer = tokio::spawn(run_writer(write, commands));

        {
            let mut inner = self.shared.lock();
            self.shared.transition(&mut inner, ConnectionState::Open);
            inner.outbound_open.send_replace(true);
            inner.announced = true;
            self.shared.emit(SessionEvent::Connected);
        }

        let reader = tokio::spawn(run_reader(
            read,
            self.shared.clone(),
            generation,
            control.clone(),
        ));

        self.link = Some(Link {
            control,
            reader,
            writer,
        });
    }
}

#[async_trait]
impl Connector for SessionConnection {
    async fn attempt(&mut self, config: &SessionConfig) -> Result<(), ClientError> {
        self.establish(config.clone()).await
    }
}

/// Pick the ring provider once; both rustls backends may be compiled in
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

async fn open_transport(
    settings: &ConnectionSettings,
    credential: Credential,
) -> Result<(WsWrite, WsRead), ClientError> {
    install_crypto_provider();

    let url = settings.endpoint_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidEndpoint(format!("{}: {}", url, e)))?;

    let protocols = format!(
        "{}, {}",
        BETA_SUBPROTOCOL,
        credential.into_subprotocol().expose_secret()
    );
    let mut header = HeaderValue::from_str(&protocols).map_err(|_| {
        CredentialError::Parse("token contains characters not allowed in a subprotocol".into())
    })?;
    header.set_sensitive(true);
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, header);

    log::info!("Connection: opening {}", url);

    let (ws_stream, _response) = connect_async_with_config(request, None, true)
        .await
        .map_err(|e| ClientError::transport(code_for_transport_error(&e), e.to_string()))?;

    log::info!("Connection: WebSocket open, waiting for session.created");

    let (write, mut read) = ws_stream.split();
    wait_for_session_created(&mut read).await?;

    Ok((write, read))
}

async fn wait_for_session_created(read: &mut WsRead) -> Result<(), ClientError> {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match protocol::decode(&text) {
                Ok(InboundEvent::SessionCreated) => {
                    log::info!("Connection: session created");
                    return Ok(());
                }
                Ok(InboundEvent::Error(info)) => return Err(ClientError::from_api(info)),
                Ok(_) => {
                    log::debug!("Connection: ignoring message while waiting for session.created")
                }
                Err(e) => log::warn!("Connection: dropping frame: {}", e),
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = close_frame_parts(frame);
                return Err(ClientError::transport(code, reason));
            }
            Err(e) => {
                return Err(ClientError::transport(
                    code_for_transport_error(&e),
                    e.to_string(),
                ))
            }
            _ => {} // ping/pong/binary
        }
    }

    Err(ClientError::transport(
        ABNORMAL_CLOSURE,
        "stream ended before session.created",
    ))
}

fn close_frame_parts(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
        None => (NORMAL_CLOSURE, String::new()),
    }
}

async fn run_writer(mut write: WsWrite, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
    let mut frames_sent: u64 = 0;

    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(event) => {
                let frame = match protocol::encode(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Connection: dropping outbound event: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(frame)).await {
                    log::warn!("Connection: send of {} failed: {}", event.tag(), e);
                    break;
                }

                frames_sent += 1;
                if frames_sent % 50 == 0 {
                    log::debug!("Connection: {} frames sent", frames_sent);
                }
            }
            WriterCommand::Close(frame) => {
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    log::debug!("Connection: close frame not sent: {}", e);
                }
                break;
            }
        }
    }

    log::debug!("Connection: writer task exiting after {} frames", frames_sent);
}

async fn run_reader(
    mut read: WsRead,
    shared: Arc<Shared>,
    generation: u64,
    control: mpsc::UnboundedSender<WriterCommand>,
) {
    let (code, reason) = loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => break close_frame_parts(frame),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (code_for_transport_error(&e), e.to_string()),
            None => {
                break (
                    ABNORMAL_CLOSURE,
                    "connection dropped without a close frame".to_string(),
                )
            }
        };

        match protocol::decode(&text) {
            Ok(event) => {
                if !shared.dispatch(generation, event, &control) {
                    log::debug!("Connection: reader task stopping");
                    return;
                }
            }
            Err(e) => log::warn!("Connection: dropping frame: {}", e),
        }
    };

    log::info!("Connection: transport closed ({}) {}", code, reason);
    shared.transport_closed(generation, code, &reason);

    // Nothing can be sent on a closed socket; let the writer go
    let _ = control.send(WriterCommand::Close(CloseFrame {
        code: CloseCode::Normal,
        reason: "session ended".into(),
    }));
}
