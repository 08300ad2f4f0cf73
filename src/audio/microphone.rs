/// Default-microphone capture through cpal
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, SizedSample, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

use crate::audio::capture::{AudioError, SampleSource, SampleStream};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

const DEFAULT_WINDOW: usize = 1024;
const MIN_WINDOW: usize = 256;
const MAX_WINDOW: usize = 4096;
const CHUNK_QUEUE: usize = 64;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// The host's default input device
#[derive(Debug, Clone)]
pub struct Microphone {
    sample_rate: u32,
}

impl Microphone {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for Microphone {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl SampleSource for Microphone {
    fn open(&self) -> Result<Box<dyn SampleStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        let sample_format = supported.sample_format();
        let window = match supported.buffer_size() {
            SupportedBufferSize::Range { min, .. } => {
                (*min as usize * supported.channels() as usize).clamp(MIN_WINDOW, MAX_WINDOW)
            }
            SupportedBufferSize::Unknown => DEFAULT_WINDOW,
        };

        let mut config: StreamConfig = supported.config();
        let default_rate = config.sample_rate;
        config.sample_rate = SampleRate(self.sample_rate);

        let (tx, rx) = crossbeam_channel::bounded(CHUNK_QUEUE);
        let stream = match build_stream(&device, &config, sample_format, tx.clone()) {
            Ok(stream) => stream,
            Err(e) if default_rate.0 != self.sample_rate => {
                warn!(
                    "Sample rate {} Hz failed ({}), using device default {} Hz",
                    self.sample_rate, e, default_rate.0
                );
                config.sample_rate = default_rate;
                build_stream(&device, &config, sample_format, tx)?
            }
            Err(e) => return Err(e),
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        info!(
            "Microphone open: {} @ {} Hz, {:?}",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.sample_rate.0,
            sample_format
        );

        Ok(Box::new(MicrophoneStream {
            _stream: stream,
            chunks: rx,
            pending: VecDeque::with_capacity(window * 2),
            window,
        }))
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    tx: Sender<Vec<i16>>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        SampleFormat::I16 => build_typed::<i16, _>(device, config, tx, |s| s),
        SampleFormat::F32 => build_typed::<f32, _>(device, config, tx, |s| {
            (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        }),
        SampleFormat::U16 => {
            build_typed::<u16, _>(device, config, tx, |s| (s as i32 - 32_768) as i16)
        }
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_typed<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: Sender<Vec<i16>>,
    convert: F,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    F: Fn(T) -> i16 + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let chunk: Vec<i16> = data.iter().map(|&s| convert(s)).collect();
                // A full queue means the sampling loop is behind; drop the chunk.
                let _ = tx.try_send(chunk);
            },
            move |err| {
                error!("Input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

struct MicrophoneStream {
    _stream: cpal::Stream,
    chunks: Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    window: usize,
}

impl SampleStream for MicrophoneStream {
    fn window_size(&self) -> usize {
        self.window
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        while self.pending.len() < buf.len() {
            match self.chunks.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Err(AudioError::Closed),
            }
        }

        let n = self.pending.len().min(buf.len());
        for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = sample;
        }
        Ok(n)
    }
}
