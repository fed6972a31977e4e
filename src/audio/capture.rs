//! Microphone capture using cpal
//!
//! The input stream lives on its own thread for as long as the
//! [`DeviceHandle`] is held. Samples are converted to `f32`, mixed to mono
//! and pushed into an unbounded channel so the callback never blocks.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, Device, FromSample, PlayStreamError, Sample,
    SampleFormat, SizedSample, Stream, StreamConfig,
};

use super::codec::mix_to_mono;
use super::{
    classify_backend_error, AudioError, CaptureBackend, DeviceHandle, SampleSender,
    REALTIME_SAMPLE_RATE,
};

/// Capture from the system default input device
#[derive(Debug, Clone)]
pub struct CpalCapture {
    preferred_sample_rate: u32,
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self {
            preferred_sample_rate: REALTIME_SAMPLE_RATE,
        }
    }
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for CpalCapture {
    fn start(&self, samples: SampleSender) -> Result<DeviceHandle, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let preferred = self.preferred_sample_rate;

        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let (stream, sample_rate) = match open_input_stream(preferred, samples) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sample_rate));

                // Hold the stream until released (or the handle is gone)
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Capture: input device released");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let sample_rate = ready_rx.recv().map_err(|_| {
            AudioError::StreamCreationFailed("capture thread exited before opening".to_string())
        })??;

        Ok(DeviceHandle::new(sample_rate, move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                log::warn!("Capture: capture thread panicked");
            }
        }))
    }
}

fn open_input_stream(
    preferred_rate: u32,
    samples: SampleSender,
) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::DeviceNotFound)?;

    log::info!("Capture: using input device {:?}", device.name());

    let (config, sample_format) = choose_config(&device, preferred_rate)?;

    log::info!(
        "Capture: {} Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, samples),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, samples),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, samples),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(map_play_error)?;

    Ok((stream, config.sample_rate.0))
}

/// Mono at the preferred rate when offered, otherwise the device default
fn choose_config(
    device: &Device,
    preferred_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let preferred = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            range.channels() == 1
                && range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
        })
    });

    if let Some(range) = preferred {
        let supported = range.with_sample_rate(cpal::SampleRate(preferred_rate));
        return Ok((supported.config(), supported.sample_format()));
    }

    let supported = device
        .default_input_config()
        .map_err(map_default_config_error)?;
    Ok((supported.config(), supported.sample_format()))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    samples: SampleSender,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let err_fn = |err: cpal::StreamError| log::error!("Capture: audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data
                    .iter()
                    .map(|&sample| <f32 as Sample>::from_sample(sample))
                    .collect();
                // A closed channel means capture is being torn down
                let _ = samples.send(mix_to_mono(&floats, channels));
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn map_default_config_error(err: DefaultStreamConfigError) -> AudioError {
    match err {
        DefaultStreamConfigError::DeviceNotAvailable => AudioError::DeviceNotFound,
        DefaultStreamConfigError::StreamTypeNotSupported => AudioError::NoSupportedConfig,
        DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_error(&err.description)
        }
    }
}

fn map_build_error(err: BuildStreamError) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable => AudioError::DeviceNotFound,
        BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
        BuildStreamError::BackendSpecific { err } => classify_backend_error(&err.description),
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

fn map_play_error(err: PlayStreamError) -> AudioError {
    match err {
        PlayStreamError::DeviceNotAvailable => AudioError::DeviceNotFound,
        PlayStreamError::BackendSpecific { err } => classify_backend_error(&err.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::BackendSpecificError;

    #[test]
    fn test_missing_device_maps_to_not_found() {
        assert_eq!(
            map_build_error(BuildStreamError::DeviceNotAvailable),
            AudioError::DeviceNotFound
        );
        assert_eq!(
            map_play_error(PlayStreamError::DeviceNotAvailable),
            AudioError::DeviceNotFound
        );
    }

    #[test]
    fn test_backend_permission_error_maps_to_denied() {
        let err = BuildStreamError::BackendSpecific {
            err: BackendSpecificError {
                description: "Access denied: microphone permission not granted".to_string(),
            },
        };
        assert!(matches!(map_build_error(err), AudioError::DeviceDenied(_)));
    }

    #[test]
    fn test_unsupported_config() {
        assert_eq!(
            map_default_config_error(DefaultStreamConfigError::StreamTypeNotSupported),
            AudioError::NoSupportedConfig
        );
    }
}
