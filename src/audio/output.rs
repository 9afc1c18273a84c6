//! Playback output graph: software mixer → CPAL output stream
//!
//! The output clock is the number of frames the device has pulled, divided
//! by the device rate. It starts at 0 when the stream opens and only moves
//! forward. Sources are placed on that clock by absolute frame index, so
//! back-to-back sources render without gaps or overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};

use super::codec::{resample_to_len, InboundChunk};

/// Errors that can occur while opening the output device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("no audio output device found")]
    NoOutputDevice,
    #[error("no supported audio output configuration")]
    NoSupportedConfig,
    #[error("failed to start audio output stream: {0}")]
    StreamFailed(String),
}

/// Identifies one scheduled playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Called from the audio thread when a source plays to its end.
pub type EndedHandler = Box<dyn FnMut(SourceId) + Send + 'static>;

/// The mixer → destination end of the playback graph.
pub trait OutputGraph {
    /// Device sample rate
    fn sample_rate(&self) -> u32;

    /// Current output clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to begin at output time `at` (seconds).
    fn start_source(&mut self, chunk: &InboundChunk, at: f64) -> SourceId;

    /// Stop a source immediately. Unknown or finished sources are ignored.
    fn stop_source(&mut self, source: SourceId);
}

struct MixerSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
    /// Absolute frame of the first sample, fixed once the source is reached
    anchor: Option<u64>,
}

/// Sums scheduled mono sources into output blocks.
pub struct Mixer {
    sources: Vec<MixerSource>,
    gain: f32,
}

impl Mixer {
    pub fn new(gain: f32) -> Self {
        Self {
            sources: Vec::new(),
            gain,
        }
    }

    pub fn add(&mut self, id: SourceId, start_frame: u64, samples: Vec<f32>) {
        self.sources.push(MixerSource {
            id,
            start_frame,
            samples,
            anchor: None,
        });
    }

    /// Returns true if the source was still scheduled.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    pub fn active_count(&self) -> usize {
        self.sources.len()
    }

    /// Render `out.len()` frames starting at absolute frame `block_start`.
    ///
    /// Sources whose start frame has already passed begin at the top of the
    /// block. Once started, a source stays on the absolute timeline: if
    /// `block_start` jumps past frames that were never rendered, the source
    /// skips the matching samples instead of drifting into the next one.
    /// Sources that run out are dropped and reported in `finished`.
    pub fn render(&mut self, block_start: u64, out: &mut [f32], finished: &mut Vec<SourceId>) {
        out.fill(0.0);
        let block_end = block_start + out.len() as u64;

        for source in &mut self.sources {
            let anchor = *source
                .anchor
                .get_or_insert(source.start_frame.max(block_start));
            if anchor >= block_end {
                continue;
            }

            let offset = anchor.saturating_sub(block_start) as usize;
            let first = block_start.saturating_sub(anchor) as usize;
            if first < source.samples.len() {
                let n = (source.samples.len() - first).min(out.len() - offset);
                let src = &source.samples[first..first + n];
                for (dst, &s) in out[offset..offset + n].iter_mut().zip(src) {
                    *dst += s;
                }
            }

            if anchor + source.samples.len() as u64 <= block_end {
                finished.push(source.id);
            }
        }

        self.sources.retain(|s| match s.anchor {
            Some(anchor) => anchor + s.samples.len() as u64 > block_end,
            None => true,
        });

        let gain = self.gain;
        for s in out.iter_mut() {
            *s = (*s * gain).clamp(-1.0, 1.0);
        }
    }
}

/// Output configuration taken from settings
#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Preferred device name; falls back to the default output
    pub device_name: Option<String>,
    /// Master gain applied after mixing
    pub gain: f32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            device_name: None,
            gain: 1.0,
        }
    }
}

/// Output graph backed by a CPAL output stream.
///
/// Not `Send` on every platform (the stream is tied to its thread), so it
/// lives on the session task for its whole life.
pub struct CpalOutput {
    _stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    next_id: u64,
}

impl CpalOutput {
    /// Open the preferred (or default) output device and start rendering.
    pub fn open(settings: &OutputSettings, on_ended: EndedHandler) -> Result<Self, PlaybackError> {
        let device = select_output_device(settings.device_name.as_deref())?;
        log::info!("Using audio output device: {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|_| PlaybackError::NoSupportedConfig)?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        log::info!(
            "Output config: {} Hz, {} channels, {:?}",
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(settings.gain)));
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let stream = match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(
                &device,
                &config,
                mixer.clone(),
                frames_rendered.clone(),
                on_ended,
            ),
            SampleFormat::I16 => build_output_stream::<i16>(
                &device,
                &config,
                mixer.clone(),
                frames_rendered.clone(),
                on_ended,
            ),
            SampleFormat::U16 => build_output_stream::<u16>(
                &device,
                &config,
                mixer.clone(),
                frames_rendered.clone(),
                on_ended,
            ),
            _ => Err(PlaybackError::NoSupportedConfig),
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::StreamFailed(format!("Failed to start stream: {}", e)))?;

        Ok(Self {
            _stream: stream,
            mixer,
            frames_rendered,
            sample_rate: config.sample_rate.0,
            next_id: 0,
        })
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OutputGraph for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn start_source(&mut self, chunk: &InboundChunk, at: f64) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;

        let rate = self.sample_rate as f64;
        let start_frame = (at.max(0.0) * rate).round() as u64;
        let end_frame = ((at.max(0.0) + chunk.duration()) * rate).round() as u64;
        let len = end_frame.saturating_sub(start_frame) as usize;
        let samples = resample_to_len(&chunk.to_mono(), len);

        lock_mixer(&self.mixer).add(id, start_frame, samples);
        log::trace!("Scheduled {} at frame {} ({} frames)", id, start_frame, len);
        id
    }

    fn stop_source(&mut self, source: SourceId) {
        if lock_mixer(&self.mixer).remove(source) {
            log::trace!("Stopped {}", source);
        }
    }
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
    mut on_ended: EndedHandler,
) -> Result<Stream, PlaybackError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    let mut finished: Vec<SourceId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                finished.clear();

                let block_start = frames_rendered.load(Ordering::SeqCst);
                // The session side only holds this for a push or a retain
                lock_mixer(&mixer).render(block_start, &mut mono, &mut finished);
                frames_rendered.fetch_add(frames as u64, Ordering::SeqCst);

                for (frame, &s) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(s);
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }

                for id in finished.drain(..) {
                    on_ended(id);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))
}

fn select_output_device(preferred: Option<&str>) -> Result<Device, PlaybackError> {
    let host = cpal::default_host();

    if let Some(name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                log::warn!("Preferred output device '{}' not found, falling back", name);
            }
            Err(e) => log::warn!("Failed to list output devices: {}", e),
        }
    }

    host.default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)
}

/// Names of the available output devices
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            log::warn!("Failed to list output devices: {}", e);
            Vec::new()
        }
    }
}
