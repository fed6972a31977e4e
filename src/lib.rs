//! Realtime spoken-conversation client for language practice
//!
//! A learner talks to an AI tutor over the OpenAI Realtime API: microphone
//! audio streams up as PCM16 frames, synthesized speech and transcripts
//! stream back.
//!
//! - [`realtime`]: credentials, wire protocol, connection state machine, retry
//! - [`audio`]: devices, sample codec, capture/playback bridge
//! - [`conversation`]: one session plus its audio, the unit a UI drives
//! - [`settings`]: persisted endpoints and timeouts

pub mod audio;
pub mod conversation;
pub mod realtime;
pub mod settings;

pub use conversation::Conversation;
pub use realtime::{
    ClientError, ConnectionState, PracticeSetup, SessionConfig, SessionEvent, TranscriptLog,
};
pub use settings::ClientSettings;
