//! One practice conversation: a session connection plus its audio bridge
//!
//! The audio bridge belongs to the conversation, not the process, so two
//! conversations never share devices or queues.

use std::sync::Arc;

use crate::audio::{
    AudioBridge, AudioError, CaptureBackend, CpalCapture, CpalOutput, FrameConfig, OutputBackend,
    Playback,
};
use crate::realtime::{
    ClientError, ConnectionSettings, ConnectionState, CredentialSource, HttpCredentialFetcher,
    RetryPolicy, SessionConfig, SessionConnection, SessionEventReceiver,
};
use crate::settings::ClientSettings;

pub struct Conversation {
    session: SessionConnection,
    audio: AudioBridge,
    retry: RetryPolicy,
}

impl Conversation {
    /// Conversation on the default devices and the configured token endpoint
    pub fn new(settings: &ClientSettings) -> Result<(Self, SessionEventReceiver), ClientError> {
        let credentials = HttpCredentialFetcher::new(
            settings.token_endpoint.clone(),
            settings.credential_timeout(),
        )?
        .with_model(settings.model.clone());

        Ok(Self::with_parts(
            settings.connection_settings(),
            Arc::new(credentials),
            Arc::new(CpalCapture::new()),
            Arc::new(CpalOutput::new()),
            settings.frame_config(),
            settings.retry_policy(),
        ))
    }

    pub fn with_parts(
        connection: ConnectionSettings,
        credentials: Arc<dyn CredentialSource>,
        capture: Arc<dyn CaptureBackend>,
        output: Arc<dyn OutputBackend>,
        frames: FrameConfig,
        retry: RetryPolicy,
    ) -> (Self, SessionEventReceiver) {
        let playback = Arc::new(Playback::new(output));
        let audio = AudioBridge::new(capture, playback, frames);
        let (session, events) =
            SessionConnection::with_audio_sink(connection, credentials, audio.sink());

        let conversation = Self {
            session,
            audio,
            retry,
        };
        (conversation, events)
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_capturing(&self) -> bool {
        self.audio.is_capturing()
    }

    /// Connect once, without retrying
    pub async fn connect(&mut self, config: SessionConfig) -> Result<(), ClientError> {
        self.audio.release();
        self.session.connect(config).await
    }

    /// Connect using the conversation's retry policy
    pub async fn connect_with_retry(&mut self, config: SessionConfig) -> Result<(), ClientError> {
        self.audio.release();
        self.session.connect_with_retry(config, &self.retry).await
    }

    /// Start streaming the microphone; the session must be open
    pub fn start_capture(&mut self) -> Result<(), ClientError> {
        let sender = self.session.outbound()?;

        if let Err(e) = self.audio.start_capture(sender) {
            let error = ClientError::from(e);
            // Device problems don't end the session, but the user has to know
            if !matches!(error, ClientError::Audio(AudioError::AlreadyCapturing)) {
                self.session.report_error(error.clone());
            }
            return Err(error);
        }
        Ok(())
    }

    /// Stop the microphone and ask the tutor to respond
    pub async fn stop_capture(&mut self) {
        self.audio.stop_capture().await;
    }

    pub fn send_text(&self, text: &str) -> Result<(), ClientError> {
        self.session.send_text(text)
    }

    /// End the conversation; safe to call repeatedly
    pub async fn disconnect(&mut self) {
        self.audio.abort_capture();
        self.session.disconnect().await;
        self.audio.release();
    }
}
