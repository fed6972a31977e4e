//! Playback of synthesized speech
//!
//! PCM16 chunks from the session are handed to a feed thread that decodes
//! them, converts them to the device rate and appends them to a shared
//! sample queue the output device drains. The feed thread opens the device
//! on the first chunk, so the caller never waits on the audio layer.
//! Playback problems never reach the session: they are logged and the chunk
//! is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::codec::{pcm16_to_float, RateConverter};
use super::{AudioError, DeviceHandle, REALTIME_SAMPLE_RATE};

/// Mono samples waiting to be rendered, at the device rate
pub type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Where the session hands synthesized speech
pub trait AudioSink: Send + Sync {
    /// Queue PCM16 mono bytes for playback; must not block or fail
    fn play(&self, pcm16: &[u8]);
}

/// Speaker access
pub trait OutputBackend: Send + Sync {
    /// Open the output device and start rendering from `queue`
    ///
    /// Called from the playback feed thread; may block while the device opens.
    fn start(&self, queue: SampleQueue) -> Result<DeviceHandle, AudioError>;
}

fn lock_queue(queue: &SampleQueue) -> MutexGuard<'_, VecDeque<f32>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Feed {
    chunks: std_mpsc::Sender<Vec<u8>>,
    thread: thread::JoinHandle<()>,
}

/// Lazily opened playback queue
pub struct Playback {
    backend: Arc<dyn OutputBackend>,
    queue: SampleQueue,
    feed: Mutex<Option<Feed>>,
    chunks_played: Arc<AtomicU64>,
}

impl Playback {
    pub fn new(backend: Arc<dyn OutputBackend>) -> Self {
        Self {
            backend,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            feed: Mutex::new(None),
            chunks_played: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock_feed(&self) -> MutexGuard<'_, Option<Feed>> {
        self.feed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue one chunk for the feed thread, logging instead of failing
    pub fn play_chunk(&self, pcm16: &[u8]) {
        let mut feed = self.lock_feed();

        let mut chunk = pcm16.to_vec();
        if let Some(current) = feed.as_ref() {
            match current.chunks.send(chunk) {
                Ok(()) => return,
                Err(std_mpsc::SendError(returned)) => chunk = returned,
            }
        }

        let started = match self.spawn_feed() {
            Ok(started) => started,
            Err(e) => {
                log::warn!("Playback: dropping audio chunk: {}", e);
                return;
            }
        };
        // A fresh receiver cannot be gone yet
        let _ = started.chunks.send(chunk);
        *feed = Some(started);
    }

    fn spawn_feed(&self) -> Result<Feed, AudioError> {
        let (chunks, received) = std_mpsc::channel();
        let worker = FeedWorker {
            backend: self.backend.clone(),
            queue: self.queue.clone(),
            chunks_played: self.chunks_played.clone(),
            output: None,
        };

        let thread = thread::Builder::new()
            .name("playback-feed".to_string())
            .spawn(move || worker.run(received))
            .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;

        Ok(Feed { chunks, thread })
    }

    /// Samples still waiting to be rendered
    pub fn queued_samples(&self) -> usize {
        lock_queue(&self.queue).len()
    }

    /// Close the output device and drop anything not yet played
    ///
    /// Waits for the feed thread to finish the chunks it already holds.
    pub fn stop(&self) {
        let feed = self.lock_feed().take();
        if let Some(Feed { chunks, thread }) = feed {
            drop(chunks);
            if thread.join().is_err() {
                log::warn!("Playback: feed thread panicked");
            }
        }
        lock_queue(&self.queue).clear();
    }
}

impl AudioSink for Playback {
    fn play(&self, pcm16: &[u8]) {
        self.play_chunk(pcm16);
    }
}

struct OpenOutput {
    device: DeviceHandle,
    converter: RateConverter,
}

/// Runs on the feed thread until the chunk channel closes
struct FeedWorker {
    backend: Arc<dyn OutputBackend>,
    queue: SampleQueue,
    chunks_played: Arc<AtomicU64>,
    output: Option<OpenOutput>,
}

impl FeedWorker {
    fn run(mut self, chunks: std_mpsc::Receiver<Vec<u8>>) {
        for chunk in chunks {
            if let Err(e) = self.feed(&chunk) {
                log::warn!("Playback: dropping audio chunk: {}", e);
            }
        }

        if let Some(output) = self.output.take() {
            output.device.release();
            log::info!("Playback: output closed");
        }
    }

    fn feed(&mut self, pcm16: &[u8]) -> Result<(), AudioError> {
        let samples = pcm16_to_float(pcm16)?;

        if self.output.is_none() {
            let device = self.backend.start(self.queue.clone())?;
            let converter = RateConverter::new(REALTIME_SAMPLE_RATE, device.sample_rate())?;
            log::info!("Playback: output opened at {} Hz", device.sample_rate());
            self.output = Some(OpenOutput { device, converter });
        }
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        let samples = output.converter.process(&samples)?;
        lock_queue(&self.queue).extend(samples);

        let played = self.chunks_played.fetch_add(1, Ordering::Relaxed) + 1;
        if played % 50 == 0 {
            log::debug!("Playback: {} chunks queued", played);
        }
        Ok(())
    }
}

/// Render to the system default output device
#[derive(Debug, Clone, Default)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CpalOutput {
    fn start(&self, queue: SampleQueue) -> Result<DeviceHandle, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let (stream, sample_rate) = match open_output_stream(queue) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sample_rate));

                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;

        let sample_rate = ready_rx.recv().map_err(|_| {
            AudioError::OutputUnavailable("playback thread exited before opening".to_string())
        })??;

        Ok(DeviceHandle::new(sample_rate, move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                log::warn!("Playback: playback thread panicked");
            }
        }))
    }
}

fn open_output_stream(queue: SampleQueue) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::OutputUnavailable("no default output device".to_string()))?;

    log::info!("Playback: using output device {:?}", device.name());

    let (config, sample_format) = choose_config(&device)?;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, queue),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, queue),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, queue),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;

    Ok((stream, config.sample_rate.0))
}

fn choose_config(device: &Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let preferred = device.supported_output_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            range.min_sample_rate().0 <= REALTIME_SAMPLE_RATE
                && range.max_sample_rate().0 >= REALTIME_SAMPLE_RATE
        })
    });

    if let Some(range) = preferred {
        let supported = range.with_sample_rate(cpal::SampleRate(REALTIME_SAMPLE_RATE));
        return Ok((supported.config(), supported.sample_format()));
    }

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;
    Ok((supported.config(), supported.sample_format()))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    queue: SampleQueue,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err: cpal::StreamError| log::error!("Playback: audio stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = lock_queue(&queue);
                for frame in data.chunks_mut(channels) {
                    // Underrun plays silence
                    let value = <T as Sample>::from_sample(queue.pop_front().unwrap_or(0.0));
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::OutputUnavailable(e.to_string()))
}
