//! Audio capture, playback and sample conversion
//!
//! Devices are reached through cpal on dedicated threads (cpal streams are
//! not `Send`). Each device sits behind a small backend trait so the bridge
//! can be driven without hardware:
//!
//! - [`CaptureBackend`]: opens the microphone and streams mono `f32` samples
//! - [`OutputBackend`]: renders queued mono `f32` samples to the speakers

pub mod bridge;
pub mod capture;
pub mod codec;
pub mod playback;

use tokio::sync::mpsc;

pub use bridge::{AudioBridge, FrameConfig};
pub use capture::CpalCapture;
pub use playback::{AudioSink, CpalOutput, OutputBackend, Playback, SampleQueue};

/// Sample rate the Realtime API expects for PCM16 in both directions
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Errors from audio devices and sample conversion
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    #[error("Microphone access denied. Please allow microphone access and try again. ({0})")]
    DeviceDenied(String),

    #[error("No microphone found. Please connect a microphone and try again.")]
    DeviceNotFound,

    #[error("No audio output device available: {0}")]
    OutputUnavailable(String),

    #[error("No supported audio configuration")]
    NoSupportedConfig,

    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),

    #[error("Cannot capture audio: not connected to a conversation")]
    NotConnected,

    #[error("Audio capture is already running")]
    AlreadyCapturing,

    #[error("Invalid audio data: {0}")]
    Decode(String),

    #[error("Sample rate conversion failed: {0}")]
    Resample(String),
}

/// Channel the device callback pushes mono samples into; never blocks
pub type SampleSender = mpsc::UnboundedSender<Vec<f32>>;

/// An open audio device; releasing it (or dropping the handle) closes it
pub struct DeviceHandle {
    sample_rate: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceHandle {
    pub fn new(sample_rate: u32, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            sample_rate,
            release: Some(Box::new(release)),
        }
    }

    /// Rate the device actually runs at
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Microphone access
pub trait CaptureBackend: Send + Sync {
    /// Open the input device and start pushing mono samples into `samples`
    fn start(&self, samples: SampleSender) -> Result<DeviceHandle, AudioError>;
}

/// Classify a backend error string from the OS audio layer
pub(crate) fn classify_backend_error(description: &str) -> AudioError {
    let lower = description.to_ascii_lowercase();
    let denied = ["permission", "denied", "not allowed", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle));

    if denied {
        AudioError::DeviceDenied(description.to_string())
    } else {
        AudioError::StreamCreationFailed(description.to_string())
    }
}
