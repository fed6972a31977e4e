//! Audio bridge between devices and the session
//!
//! Capture samples are converted to the session rate, cut into
//! fixed-duration frames and sent as `input_audio_buffer.append` events.
//! Stopping flushes the partial frame and closes the user turn. When the
//! session ends underneath a capture, the microphone is released right away.
//!
//! # Architecture
//!
//! ```text
//! Audio Thread (sync)              Tokio Runtime (async)
//! ┌──────────────────┐             ┌──────────────────────┐
//! │ cpal callback    │──channel──▶ │ FramePump::run()     │
//! │ send(mono f32)   │             │   ├─ RateConverter   │
//! └──────────────────┘             │   ├─ frame (100ms)   │
//!                                  │   └─ OutboundSender  │
//!                                  └──────────────────────┘
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::codec::{float_to_pcm16, RateConverter};
use super::playback::{AudioSink, Playback};
use super::{AudioError, CaptureBackend, DeviceHandle, REALTIME_SAMPLE_RATE};
use crate::realtime::{OutboundEvent, OutboundSender};

/// Shape of the frames sent upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Rate frames are sent at (the API expects 24000)
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            sample_rate: REALTIME_SAMPLE_RATE,
            frame_duration_ms: 100,
        }
    }
}

impl FrameConfig {
    /// Samples per frame at the target rate
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000).max(1) as usize
    }
}

/// Open microphone shared by the bridge and its pump; whoever releases first wins
#[derive(Clone)]
struct Microphone(Arc<Mutex<Option<DeviceHandle>>>);

impl Microphone {
    fn new(device: DeviceHandle) -> Self {
        Self(Arc::new(Mutex::new(Some(device))))
    }

    fn release(&self) {
        let device = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(device) = device {
            device.release();
        }
    }
}

struct ActiveCapture {
    microphone: Microphone,
    stop: oneshot::Sender<()>,
    pump: JoinHandle<u64>,
    sender: OutboundSender,
}

/// Owns the microphone capture and the playback queue of one conversation
pub struct AudioBridge {
    capture: Arc<dyn CaptureBackend>,
    playback: Arc<Playback>,
    frames: FrameConfig,
    active: Option<ActiveCapture>,
}

impl AudioBridge {
    pub fn new(capture: Arc<dyn CaptureBackend>, playback: Arc<Playback>, frames: FrameConfig) -> Self {
        Self {
            capture,
            playback,
            frames,
            active: None,
        }
    }

    /// Sink to hand the session for synthesized speech
    pub fn sink(&self) -> Arc<dyn AudioSink> {
        self.playback.clone()
    }

    /// False again once the session that capture started on has ended
    pub fn is_capturing(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.pump.is_finished())
    }

    /// Open the microphone and start streaming frames through `sender`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_capture(&mut self, sender: OutboundSender) -> Result<(), AudioError> {
        if self.active.is_some() && !self.is_capturing() {
            // Left over from a session that ended mid-capture
            self.active = None;
        }
        if !sender.is_open() {
            return Err(AudioError::NotConnected);
        }
        if self.active.is_some() {
            return Err(AudioError::AlreadyCapturing);
        }

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let device = self.capture.start(samples_tx)?;
        let device_rate = device.sample_rate();
        // Dropping the handle on error closes the device again
        let converter = RateConverter::new(device_rate, self.frames.sample_rate)?;

        let microphone = Microphone::new(device);
        let (stop_tx, stop_rx) = oneshot::channel();

        let pump = FramePump::new(
            sender.clone(),
            samples_rx,
            stop_rx,
            microphone.clone(),
            &self.frames,
            converter,
        );

        log::info!(
            "AudioBridge: capture started ({}Hz → {}Hz, {}ms frames = {} samples)",
            device_rate,
            self.frames.sample_rate,
            self.frames.frame_duration_ms,
            self.frames.samples_per_frame()
        );

        self.active = Some(ActiveCapture {
            microphone,
            stop: stop_tx,
            pump: tokio::spawn(pump.run()),
            sender,
        });
        Ok(())
    }

    /// Release the microphone, flush the last frame and close the user turn
    ///
    /// Emits `input_audio_buffer.commit` then `response.create`, even when no
    /// frames were captured. A no-op when not capturing.
    pub async fn stop_capture(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.microphone.release();
        let _ = active.stop.send(());

        let frames = match active.pump.await {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("AudioBridge: frame pump ended abnormally: {}", e);
                0
            }
        };

        if !active.sender.is_open() {
            log::info!("AudioBridge: capture stopped after the session ended, {} frames sent", frames);
            return;
        }

        for event in [OutboundEvent::AudioCommit, OutboundEvent::ResponseCreate] {
            if let Err(e) = active.sender.send(event) {
                log::warn!("AudioBridge: could not close the user turn: {}", e);
                break;
            }
        }

        log::info!("AudioBridge: capture stopped, {} frames sent", frames);
    }

    /// Release the microphone without committing (session is going away)
    pub fn abort_capture(&mut self) {
        if let Some(active) = self.active.take() {
            active.pump.abort();
            active.microphone.release();
            log::info!("AudioBridge: capture aborted");
        }
    }

    /// Hand a chunk of synthesized speech to the output; never fails
    pub fn playback(&self, pcm16: &[u8]) {
        self.playback.play_chunk(pcm16);
    }

    /// Stop capture and playback
    pub fn release(&mut self) {
        self.abort_capture();
        self.playback.stop();
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.abort_capture();
    }
}

/// Turns the device sample stream into fixed-size frames
struct FramePump {
    sender: OutboundSender,
    samples: mpsc::UnboundedReceiver<Vec<f32>>,
    stop: oneshot::Receiver<()>,
    microphone: Microphone,
    converter: RateConverter,
    /// Accumulator for building frames
    buffer: Vec<f32>,
    samples_per_frame: usize,
    frames_sent: u64,
    /// The session went away; keep draining but stop sending
    closed: bool,
}

impl FramePump {
    fn new(
        sender: OutboundSender,
        samples: mpsc::UnboundedReceiver<Vec<f32>>,
        stop: oneshot::Receiver<()>,
        microphone: Microphone,
        frames: &FrameConfig,
        converter: RateConverter,
    ) -> Self {
        let samples_per_frame = frames.samples_per_frame();
        Self {
            sender,
            samples,
            stop,
            microphone,
            converter,
            buffer: Vec::with_capacity(samples_per_frame * 2),
            samples_per_frame,
            frames_sent: 0,
            closed: false,
        }
    }

    /// Forward frames until stopped or the session ends; returns the number of frames sent
    async fn run(mut self) -> u64 {
        let session = self.sender.clone();
        let session_ended = session.closed();
        tokio::pin!(session_ended);

        loop {
            tokio::select! {
                biased;
                _ = &mut self.stop => break,
                _ = &mut session_ended => {
                    log::info!("AudioBridge: session ended during capture, releasing microphone");
                    self.microphone.release();
                    self.closed = true;
                    break;
                }
                batch = self.samples.recv() => match batch {
                    Some(samples) => self.process(samples),
                    None => break,
                },
            }
        }

        // Whatever the device delivered before release still goes out, in order
        while let Ok(samples) = self.samples.try_recv() {
            self.process(samples);
        }
        match self.converter.flush() {
            Ok(tail) => self.buffer.extend(tail),
            Err(e) => log::warn!("AudioBridge: dropping resampler tail: {}", e),
        }
        if !self.buffer.is_empty() {
            log::debug!(
                "AudioBridge: sending final partial frame ({} samples)",
                self.buffer.len()
            );
            self.send_frame();
        }

        self.frames_sent
    }

    fn process(&mut self, samples: Vec<f32>) {
        match self.converter.process(&samples) {
            Ok(converted) => self.buffer.extend(converted),
            Err(e) => log::warn!("AudioBridge: dropping captured batch: {}", e),
        }

        while self.buffer.len() >= self.samples_per_frame {
            self.send_frame();
        }
    }

    fn send_frame(&mut self) {
        let frame_size = self.buffer.len().min(self.samples_per_frame);
        let frame: Vec<f32> = self.buffer.drain(..frame_size).collect();

        if self.closed {
            return;
        }

        if let Err(e) = self.sender.send(OutboundEvent::AudioAppend(float_to_pcm16(&frame))) {
            log::warn!("AudioBridge: dropping captured audio: {}", e);
            self.closed = true;
            return;
        }

        self.frames_sent += 1;
        if self.frames_sent % 50 == 0 {
            log::debug!("AudioBridge: sent {} frames", self.frames_sent);
        }
    }
}
