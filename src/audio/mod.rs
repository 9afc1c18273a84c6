//! Audio I/O for the live session
//!
//! Capture and playback run on separate CPAL streams with independent clocks.
//!
//! ```text
//! mic ──▶ CapturePipeline ──▶ AudioFrame (16kHz, 256) ──▶ codec::encode ──▶ channel
//!
//! channel ──▶ codec::decode ──▶ InboundChunk (24kHz) ──▶ PlaybackScheduler
//!                                                             │
//!                                                             ▼
//!                                                 OutputGraph (mixer → device)
//! ```

pub mod capture;
pub mod codec;
pub mod output;
pub mod playback;

pub use capture::{
    list_input_devices, CaptureError, CapturePipeline, CaptureSettings, FaultHandler,
    FrameConsumer, FrameSource, FrameSplitter,
};
pub use codec::{
    decode, decode_audio_data, encode, AudioFrame, CodecError, EncodedBlob, InboundChunk,
    CAPTURE_SAMPLE_RATE, FRAME_SIZE, PLAYBACK_SAMPLE_RATE,
};
pub use output::{
    list_output_devices, CpalOutput, EndedHandler, Mixer, OutputGraph, OutputSettings,
    PlaybackError, SourceId,
};
pub use playback::{ActiveSources, PlaybackScheduler, PlaybackTimeline, ScheduledChunk};
