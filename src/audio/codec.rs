//! PCM codec for the session channel
//!
//! Pure conversions between normalized `f32` samples and the base64 PCM16
//! representation carried in channel messages, plus the small amount of
//! format adaptation playback needs (deinterleave, downmix, resample).
//!
//! Nothing in here holds state.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Capture rate expected by the remote model
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the audio the remote model streams back
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured frame
pub const FRAME_SIZE: usize = 256;

/// Errors produced while decoding inbound audio
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(String),
}

/// One fixed-size slice of captured mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Normalized samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Position in capture order, starting at 0 for each capture run
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            sequence,
        }
    }

    /// Duration of this frame in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

/// Transport representation of an audio frame.
///
/// Serializes as `{"mimeType": "...", "data": "..."}`, the shape used both
/// for outbound media chunks and inbound `inlineData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedBlob {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

/// Decoded playback audio: one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChunk {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl InboundChunk {
    /// Frames per channel
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Playback duration in seconds at the declared sample rate
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.len())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// MIME type declared for PCM16 audio at `sample_rate`
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM MIME type, if present.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.trim().parse().ok())
        .filter(|&rate| rate > 0)
}

/// Convert a normalized sample to PCM16, clamping out-of-range input.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * i16::MAX as f32).round() as i16
}

/// Encode a frame as base64 little-endian PCM16.
pub fn encode(frame: &AudioFrame) -> EncodedBlob {
    let bytes: Vec<u8> = frame
        .samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect();

    EncodedBlob {
        mime_type: pcm_mime_type(frame.sample_rate),
        data: STANDARD.encode(&bytes),
    }
}

/// Decode a base64 payload into raw bytes.
pub fn decode(data: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Interpret `bytes` as interleaved PCM16 LE and split it into channels.
///
/// A trailing partial sample (odd byte count) or partial frame is dropped.
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, channels: u16) -> InboundChunk {
    let channel_count = channels as usize;
    if channel_count == 0 {
        return InboundChunk {
            sample_rate,
            channels: Vec::new(),
        };
    }

    let frame_bytes = 2 * channel_count;
    let frames = bytes.len() / frame_bytes;
    if bytes.len() % frame_bytes != 0 {
        log::debug!(
            "decode_audio_data: dropping {} trailing bytes",
            bytes.len() % frame_bytes
        );
    }

    let mut out = vec![Vec::with_capacity(frames); channel_count];
    for frame in bytes[..frames * frame_bytes].chunks_exact(frame_bytes) {
        for (ch, sample) in frame.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            out[ch].push(value as f32 / 32768.0);
        }
    }

    InboundChunk {
        sample_rate,
        channels: out,
    }
}

/// Resample mono audio from `from_rate` to `to_rate` by linear interpolation.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            from_rate,
            to_rate
        );
        return samples.to_vec();
    }
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    resample_to_len(samples, out_len)
}

/// Stretch or squeeze mono audio to exactly `out_len` samples.
pub fn resample_to_len(samples: &[f32], out_len: usize) -> Vec<f32> {
    if samples.is_empty() || out_len == 0 {
        return vec![0.0; out_len];
    }
    if samples.len() == out_len {
        return samples.to_vec();
    }

    let step = samples.len() as f64 / out_len as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16_clamps() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-7.5), -i16::MAX);
        assert_eq!(sample_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_encode_little_endian_and_mime() {
        let frame = AudioFrame::new(vec![1.0, -1.0, 0.0], CAPTURE_SAMPLE_RATE, 0);
        let blob = encode(&frame);

        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        let bytes = STANDARD.decode(&blob.data).unwrap();
        // 32767 -> [0xff, 0x7f], -32767 -> [0x01, 0x80]
        assert_eq!(bytes, vec![0xff, 0x7f, 0x01, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_blob_json_field_names() {
        let blob = EncodedBlob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAA=".to_string(),
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"mimeType":"audio/pcm;rate=16000","data":"AAA="}"#);
    }

    #[test]
    fn test_decode_rejects_malformed_base64() {
        let err = decode("not*base64!").unwrap_err();
        assert!(matches!(err, CodecError::InvalidBase64(_)));
    }

    #[test]
    fn test_decode_audio_data_truncates_odd_length() {
        // 0x4000 = 16384 -> 0.5, plus one dangling byte
        let chunk = decode_audio_data(&[0x00, 0x40, 0x12], PLAYBACK_SAMPLE_RATE, 1);
        assert_eq!(chunk.channels.len(), 1);
        assert_eq!(chunk.channels[0], vec![0.5]);
    }

    #[test]
    fn test_decode_audio_data_deinterleaves() {
        let bytes: Vec<u8> = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let chunk = decode_audio_data(&bytes, 48_000, 2);

        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.channels[0], vec![100.0 / 32768.0, 200.0 / 32768.0]);
        assert_eq!(chunk.channels[1], vec![-100.0 / 32768.0, -200.0 / 32768.0]);
        assert!(chunk.to_mono().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_decode_audio_data_zero_channels() {
        let chunk = decode_audio_data(&[1, 2, 3, 4], PLAYBACK_SAMPLE_RATE, 0);
        assert!(chunk.is_empty());
        assert_eq!(chunk.duration(), 0.0);
    }

    #[test]
    fn test_chunk_duration() {
        let bytes = vec![0u8; 2 * 12_000];
        let chunk = decode_audio_data(&bytes, PLAYBACK_SAMPLE_RATE, 1);
        assert!((chunk.duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let original: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| ((i as f32) * 0.37).sin() * 0.4)
            .collect();
        let frame = AudioFrame::new(original.clone(), CAPTURE_SAMPLE_RATE, 7);

        let bytes = decode(&encode(&frame).data).unwrap();
        let chunk = decode_audio_data(&bytes, CAPTURE_SAMPLE_RATE, 1);

        assert_eq!(chunk.len(), original.len());
        for (a, b) in original.iter().zip(&chunk.channels[0]) {
            assert!((a - b).abs() <= 1.0 / 32767.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_round_trip_full_scale_bound() {
        // Scaling is 32767 up and 32768 down, so the bound grows with |s|.
        let original = vec![1.0f32, -1.0, 0.999, -0.75, 0.25];
        let frame = AudioFrame::new(original.clone(), CAPTURE_SAMPLE_RATE, 0);
        let bytes = decode(&encode(&frame).data).unwrap();
        let chunk = decode_audio_data(&bytes, CAPTURE_SAMPLE_RATE, 1);

        for (a, b) in original.iter().zip(&chunk.channels[0]) {
            let bound = (a.abs() + 0.5) / 32768.0 + f32::EPSILON;
            assert!((a - b).abs() <= bound, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=0"), None);
    }

    #[test]
    fn test_resample_lengths() {
        let input = vec![0.25f32; 240];
        assert_eq!(resample(&input, 24_000, 48_000).len(), 480);
        assert_eq!(resample(&input, 24_000, 16_000).len(), 160);
        assert_eq!(resample(&input, 24_000, 24_000), input);
        assert_eq!(resample(&input, 0, 48_000), input);
    }

    #[test]
    fn test_resample_to_len_interpolates() {
        let out = resample_to_len(&[0.0, 1.0], 4);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);

        assert_eq!(resample_to_len(&[], 3), vec![0.0; 3]);
        assert!(resample_to_len(&[0.5], 0).is_empty());
    }
}
