//! Microphone capture using CPAL
//!
//! The capture graph is device → gain → downmix/resample → frame splitter.
//! Every completed 256-sample frame at 16kHz mono is handed to the registered
//! frame consumer straight from the audio callback, in capture order.
//!
//! # Threading
//!
//! ```text
//! Audio Thread (sync)                      Session task (async)
//! ┌───────────────────────────┐            ┌────────────────────┐
//! │ CPAL callback             │            │ reduce(CaptureFrame)│
//! │  ├─ liveness check        │──consumer─▶│  └─ SendFrame       │
//! │  └─ FrameSplitter::push   │ (try_send) └────────────────────┘
//! └───────────────────────────┘
//! ```
//!
//! The consumer must not block; the session wires it to `try_send`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, Sample, SampleFormat, SampleRate, Stream, StreamConfig};

use super::codec::{AudioFrame, CAPTURE_SAMPLE_RATE, FRAME_SIZE};

/// Errors that can occur while capturing audio.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no supported audio input configuration")]
    NoSupportedConfig,
    #[error("failed to start audio input stream: {0}")]
    StreamFailed(String),
    #[error("audio input device lost: {0}")]
    DeviceLost(String),
}

/// Receives each completed frame. Called on the audio thread.
pub type FrameConsumer = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Receives stream faults (device unplugged, backend errors). Called on the audio thread.
pub type FaultHandler = Box<dyn FnMut(CaptureError) + Send + 'static>;

/// Anything that can produce capture frames for a session.
pub trait FrameSource {
    /// Begin producing frames. No-op if already running.
    fn start(&mut self, consumer: FrameConsumer, on_fault: FaultHandler)
        -> Result<(), CaptureError>;

    /// Stop producing frames and release the device. Safe to call repeatedly.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Streaming linear resampler that keeps its phase across blocks.
#[derive(Debug, Clone)]
struct LinearResampler {
    /// Input samples advanced per output sample
    step: f64,
    /// Next output position, relative to the start of the next input block
    pos: f64,
    /// Last input sample of the previous block (index -1)
    prev: Option<f32>,
}

impl LinearResampler {
    fn new(source_rate: u32, target_rate: u32) -> Self {
        let step = if source_rate == 0 || target_rate == 0 {
            1.0
        } else {
            source_rate as f64 / target_rate as f64
        };
        Self {
            step,
            pos: 0.0,
            prev: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    fn process(&mut self, input: &[f32], mut out: impl FnMut(f32)) {
        if input.is_empty() {
            return;
        }
        if self.is_passthrough() {
            input.iter().copied().for_each(out);
            return;
        }

        let prev = self.prev.unwrap_or(input[0]);
        let at = |i: isize| if i < 0 { prev } else { input[i as usize] };
        let last = (input.len() - 1) as f64;

        while self.pos <= last {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            let i = base as isize;
            let a = at(i);
            if frac == 0.0 {
                out(a);
            } else {
                out(a + (at(i + 1) - a) * frac);
            }
            self.pos += self.step;
        }

        self.pos -= input.len() as f64;
        self.prev = input.last().copied();
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// Turns arbitrary device callbacks into fixed-size mono frames.
///
/// Device independent, so the whole capture path short of CPAL is testable.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    gain: f32,
    resampler: LinearResampler,
    target_rate: u32,
    frame_size: usize,
    pending: Vec<f32>,
    mono: Vec<f32>,
    sequence: u64,
}

impl FrameSplitter {
    pub fn new(source_rate: u32, target_rate: u32, frame_size: usize, gain: f32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            gain,
            resampler: LinearResampler::new(source_rate, target_rate),
            target_rate,
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
            mono: Vec::new(),
            sequence: 0,
        }
    }

    /// Splitter for the session format (16kHz mono, 256-sample frames)
    pub fn for_capture(source_rate: u32, gain: f32) -> Self {
        Self::new(source_rate, CAPTURE_SAMPLE_RATE, FRAME_SIZE, gain)
    }

    /// Push interleaved samples with `channels` channels.
    pub fn push_interleaved(
        &mut self,
        data: &[f32],
        channels: u16,
        emit: &mut impl FnMut(AudioFrame),
    ) {
        let ch = channels.max(1) as usize;
        if ch == 1 {
            self.push_mono_inner(data, emit);
            return;
        }

        let mut mono = std::mem::take(&mut self.mono);
        mono.clear();
        mono.extend(
            data.chunks_exact(ch)
                .map(|frame| frame.iter().sum::<f32>() / ch as f32),
        );
        self.push_mono_inner(&mono, emit);
        self.mono = mono;
    }

    pub fn push_mono(&mut self, data: &[f32], emit: &mut impl FnMut(AudioFrame)) {
        self.push_mono_inner(data, emit);
    }

    fn push_mono_inner(&mut self, data: &[f32], emit: &mut impl FnMut(AudioFrame)) {
        let gain = self.gain;
        let pending = &mut self.pending;
        self.resampler
            .process(data, |s| pending.push((s * gain).clamp(-1.0, 1.0)));

        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let frame = AudioFrame::new(samples, self.target_rate, self.sequence);
            self.sequence += 1;
            emit(frame);
        }
    }

    /// Discard any buffered partial frame and restart sequence numbering.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
        self.sequence = 0;
    }

    /// Samples waiting for the next frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number the next frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }
}

/// Capture configuration taken from settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Preferred device name; falls back to the default input
    pub device_name: Option<String>,
    /// Linear gain applied before framing
    pub gain: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device_name: None,
            gain: 1.0,
        }
    }
}

/// Microphone capture pipeline backed by a CPAL input stream.
///
/// Constructing it touches no hardware; the device is opened on `start()`.
pub struct CapturePipeline {
    settings: CaptureSettings,
    stream: Option<Stream>,
    running: Arc<AtomicBool>,
}

impl CapturePipeline {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_stream(
        &self,
        device: &Device,
        sample_format: SampleFormat,
        config: &StreamConfig,
        running: Arc<AtomicBool>,
        consumer: FrameConsumer,
        on_fault: FaultHandler,
    ) -> Result<Stream, CaptureError> {
        match sample_format {
            SampleFormat::F32 => {
                self.build_stream_typed::<f32>(device, config, running, consumer, on_fault)
            }
            SampleFormat::I16 => {
                self.build_stream_typed::<i16>(device, config, running, consumer, on_fault)
            }
            SampleFormat::U16 => {
                self.build_stream_typed::<u16>(device, config, running, consumer, on_fault)
            }
            _ => Err(CaptureError::NoSupportedConfig),
        }
    }

    fn build_stream_typed<T>(
        &self,
        device: &Device,
        config: &StreamConfig,
        running: Arc<AtomicBool>,
        mut consumer: FrameConsumer,
        mut on_fault: FaultHandler,
    ) -> Result<Stream, CaptureError>
    where
        T: cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        let channels = config.channels;
        let mut splitter = FrameSplitter::for_capture(config.sample_rate.0, self.settings.gain);
        let mut scratch: Vec<f32> = Vec::new();
        let mut fault_reported = false;

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }

                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));

                    splitter.push_interleaved(&scratch, channels, &mut |frame| {
                        // Re-check so a stop() racing this callback forwards nothing more
                        if running.load(Ordering::SeqCst) {
                            consumer(frame);
                        }
                    });
                },
                move |err| {
                    log::error!("Audio input stream error: {}", err);
                    if fault_reported {
                        return;
                    }
                    fault_reported = true;
                    let fault = match err {
                        cpal::StreamError::DeviceNotAvailable => {
                            CaptureError::DeviceLost("device not available".to_string())
                        }
                        other => CaptureError::DeviceLost(other.to_string()),
                    };
                    on_fault(fault);
                },
                None,
            )
            .map_err(|e| match e {
                BuildStreamError::DeviceNotAvailable => {
                    CaptureError::DeviceUnavailable("device not available".to_string())
                }
                other => CaptureError::StreamFailed(other.to_string()),
            })
    }
}

impl FrameSource for CapturePipeline {
    fn start(
        &mut self,
        consumer: FrameConsumer,
        on_fault: FaultHandler,
    ) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            log::debug!("Capture already running, ignoring start");
            return Ok(());
        }

        let device = select_input_device(self.settings.device_name.as_deref())?;
        log::info!("Using audio input device: {:?}", device.name());

        let supported = choose_input_config(&device)?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        log::info!(
            "Capture config: {} Hz, {} channels, {:?} (frames: {} Hz mono x {})",
            config.sample_rate.0,
            config.channels,
            sample_format,
            CAPTURE_SAMPLE_RATE,
            FRAME_SIZE
        );

        let running = Arc::new(AtomicBool::new(true));
        let stream = self.build_stream(
            &device,
            sample_format,
            &config,
            running.clone(),
            consumer,
            on_fault,
        )?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamFailed(format!("Failed to start stream: {}", e)))?;

        self.running = running;
        self.stream = Some(stream);
        log::info!("Capture started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        let Some(stream) = self.stream.take() else {
            return;
        };
        if let Err(e) = stream.pause() {
            log::debug!("Pausing input stream failed (device may be gone): {}", e);
        }
        // Dropping the stream releases the device and the splitter's partial frame
        drop(stream);
        log::info!("Capture stopped");
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn select_input_device(preferred: Option<&str>) -> Result<Device, CaptureError> {
    let host = cpal::default_host();

    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                log::warn!("Preferred input device '{}' not found, falling back", name);
            }
            Err(e) => log::warn!("Failed to list input devices: {}", e),
        }
    }

    host.default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device found".to_string()))
}

/// Prefer a native 16kHz configuration so no resampling is needed.
fn choose_input_config(device: &Device) -> Result<cpal::SupportedStreamConfig, CaptureError> {
    let target = SampleRate(CAPTURE_SAMPLE_RATE);
    let usable =
        |f: SampleFormat| matches!(f, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16);

    if let Ok(ranges) = device.supported_input_configs() {
        let native = ranges
            .filter(|r| {
                usable(r.sample_format())
                    && r.min_sample_rate() <= target
                    && r.max_sample_rate() >= target
            })
            .min_by_key(|r| r.channels());
        if let Some(range) = native {
            return Ok(range.with_sample_rate(target));
        }
    }

    let default = device
        .default_input_config()
        .map_err(|_| CaptureError::NoSupportedConfig)?;
    if !usable(default.sample_format()) {
        return Err(CaptureError::NoSupportedConfig);
    }
    Ok(default)
}

/// Names of the available input devices
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            log::warn!("Failed to list input devices: {}", e);
            Vec::new()
        }
    }
}
