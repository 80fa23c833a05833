//! PCM16 wire codec.
//!
//! Both directions carry signed 16-bit little-endian mono PCM. Captured audio
//! is sent at 16 kHz; agent speech arrives at 24 kHz. Floats are scaled by
//! 32768 and rounded, so a round trip is exact for any sample already on the
//! 16-bit grid and within one quantization step otherwise.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::error::VoiceError;

/// Sample rate of outbound (microphone) frames.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound (agent speech) audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// MIME type advertised for outbound frames.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

const SCALE: f32 = 32_768.0;

/// One encoded chunk of PCM16 LE samples. Cheap to clone, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    sample_rate: u32,
}

impl AudioFrame {
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of 16-bit samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base64 form used on the wire.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

/// Decoded float samples ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    /// Interleaved samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedBuffer {
    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playback length of the buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Encode float samples as PCM16 LE. Out-of-range input is clipped.
pub fn encode(samples: &[f32], sample_rate: u32) -> AudioFrame {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        #[allow(clippy::cast_possible_truncation)]
        let pcm = (clamped * SCALE)
            .round()
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        data.extend_from_slice(&pcm.to_le_bytes());
    }
    AudioFrame {
        data: Bytes::from(data),
        sample_rate,
    }
}

/// Decode PCM16 LE bytes into float samples.
///
/// Empty input yields an empty buffer. A trailing odd byte, a zero channel
/// count, or a sample count that does not divide evenly into channels is a
/// [`VoiceError::MalformedFrame`].
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedBuffer, VoiceError> {
    if channels == 0 {
        return Err(VoiceError::MalformedFrame(
            "channel count must be at least 1".to_string(),
        ));
    }
    if bytes.is_empty() {
        return Ok(DecodedBuffer::empty(sample_rate, channels));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let sample_count = bytes.len() / 2;
    if sample_count % usize::from(channels) != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{sample_count} samples do not divide into {channels} channels"
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / SCALE)
        .collect();

    Ok(DecodedBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode a base64 PCM16 payload as received from the channel.
pub fn decode_payload(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedBuffer, VoiceError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::MalformedPayload(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}
