//! Capture pipeline: microphone blocks → 16 kHz fixed-size PCM16 frames.
//!
//! Microphones deliver mono f32 blocks of arbitrary length at their native
//! rate. The pipeline resamples to the capture rate when needed, slices the
//! stream into fixed chunks, and encodes each chunk as one [`AudioFrame`].
//! There is no flow control: frames are produced as fast as audio arrives.

use rubato::{FftFixedIn, Resampler as _};

use crate::codec::{self, AudioFrame, CAPTURE_SAMPLE_RATE};
use crate::error::VoiceError;

/// Samples per outbound frame (≈128 ms at 16 kHz).
pub const DEFAULT_CHUNK_SAMPLES: usize = 2048;

/// Input block size for the FFT resampler.
const RESAMPLER_CHUNK: usize = 1024;

/// Log the first frame and then every Nth frame.
const LOG_EVERY_FRAMES: u64 = 50;

/// Incremental FFT resampler for a mono stream.
///
/// Input is buffered until a full resampler block is available, so output
/// lags input by at most one block.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, VoiceError> {
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLER_CHUNK,
            2, // sub-chunks for quality
            1, // mono
        )
        .map_err(|e| VoiceError::ResampleError(e.to_string()))?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLER_CHUNK * 2),
        })
    }

    /// Feed samples and return whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, VoiceError> {
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let result = self
                .resampler
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| VoiceError::ResampleError(e.to_string()))?;
            if let Some(channel) = result.first() {
                output.extend_from_slice(channel);
            }
            self.pending.drain(..needed);
        }
        Ok(output)
    }
}

/// Turns microphone blocks into outbound frames.
pub struct CapturePipeline {
    chunk_samples: usize,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
    frames_sent: u64,
}

impl CapturePipeline {
    /// Build a pipeline for a microphone running at `input_rate`.
    pub fn new(input_rate: u32, chunk_samples: usize) -> Result<Self, VoiceError> {
        let resampler = if input_rate == CAPTURE_SAMPLE_RATE {
            None
        } else {
            tracing::debug!(
                from = input_rate,
                to = CAPTURE_SAMPLE_RATE,
                "Resampling microphone input"
            );
            Some(StreamResampler::new(input_rate, CAPTURE_SAMPLE_RATE)?)
        };

        Ok(Self {
            chunk_samples: chunk_samples.max(1),
            resampler,
            pending: Vec::with_capacity(chunk_samples * 2),
            frames_sent: 0,
        })
    }

    pub const fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    pub const fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Samples waiting for the next full chunk.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Consume one microphone block and return the complete frames it yields.
    pub fn process(&mut self, block: &[f32]) -> Result<Vec<AudioFrame>, VoiceError> {
        match self.resampler.as_mut() {
            Some(resampler) => {
                let resampled = resampler.process(block)?;
                self.pending.extend_from_slice(&resampled);
            }
            None => self.pending.extend_from_slice(block),
        }

        let mut frames = Vec::with_capacity(self.pending.len() / self.chunk_samples);
        while self.pending.len() >= self.chunk_samples {
            let frame = codec::encode(&self.pending[..self.chunk_samples], CAPTURE_SAMPLE_RATE);
            self.pending.drain(..self.chunk_samples);
            self.frames_sent += 1;
            if self.frames_sent == 1 || self.frames_sent % LOG_EVERY_FRAMES == 0 {
                tracing::debug!(
                    frames_sent = self.frames_sent,
                    bytes = frame.as_bytes().len(),
                    "Capture frame encoded"
                );
            }
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Drop partially filled audio (used when capture stops).
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
