//! # Audio Frame Assembly
//!
//! Slices a stream of PCM chunks into fixed-duration analysis frames.
//! Chunks arrive in arbitrary sizes with no alignment to frame boundaries,
//! so the assembler decides what happens to the trailing partial frame.
//!
//! ## Key Features:
//! - **PCM decoding**: 16-bit signed little-endian, mono, via `byteorder`
//! - **Normalization**: samples scaled from [-32768, 32767] to [-1.0, 1.0)
//! - **Boundary policy**: carry the partial frame into the next chunk, or discard it
//! - **Odd byte handling**: a chunk ending mid-sample keeps its last byte under `Carry`

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

/// Full-scale value of a signed 16-bit sample.
const PCM16_FULL_SCALE: f32 = 32768.0;

/// What to do with samples left over after the last complete frame of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// Keep the partial frame and complete it with the next chunk
    #[default]
    Carry,
    /// Drop the partial frame; every chunk is analyzed on its own
    Discard,
}

/// One fixed-length analysis window.
///
/// `offset` is the frame start relative to the first sample of the chunk that
/// completed it. A frame that began in carried samples reports zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub offset: Duration,
}

/// Decode little-endian signed 16-bit PCM. A trailing odd byte is ignored.
///
/// ## Rust Concepts:
/// - **Cursor**: reads a byte slice as if it were a file
/// - **while let Ok(...)**: keeps reading until fewer than two bytes remain
pub fn decode_pcm16(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    samples
}

/// Scale a PCM16 sample into [-1.0, 1.0).
pub fn normalize_sample(sample: i16) -> f32 {
    sample as f32 / PCM16_FULL_SCALE
}

/// Number of samples in `duration` at `sample_rate`, rounded down.
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_micros() * sample_rate as u128 / 1_000_000) as usize
}

/// Playback duration of `samples` samples at `sample_rate`.
pub fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

/// Turns arbitrarily sized PCM chunks into complete `AudioFrame`s.
#[derive(Debug)]
pub struct FrameAssembler {
    sample_rate: u32,
    frame_len: usize,
    policy: BoundaryPolicy,
    /// Normalized samples waiting for the rest of their frame
    carry: Vec<f32>,
    /// First byte of a sample split across two byte chunks
    odd_byte: Option<u8>,
    discarded: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_duration`.
    ///
    /// ## Example:
    /// 30ms at 24kHz: 30 * 24000 / 1000 = 720 samples per frame
    pub fn new(sample_rate: u32, frame_duration: Duration, policy: BoundaryPolicy) -> Self {
        let frame_len = samples_for(frame_duration, sample_rate).max(1);

        Self {
            sample_rate,
            frame_len,
            policy,
            carry: Vec::with_capacity(frame_len),
            odd_byte: None,
            discarded: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples currently carried toward the next frame.
    pub fn pending_samples(&self) -> usize {
        self.carry.len()
    }

    /// Samples dropped at chunk boundaries so far.
    pub fn discarded_samples(&self) -> u64 {
        self.discarded
    }

    /// Feed raw little-endian PCM16 bytes.
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<AudioFrame> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(byte) = self.odd_byte.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(data);

        if bytes.len() % 2 != 0 {
            let last = bytes.pop();
            match self.policy {
                BoundaryPolicy::Carry => self.odd_byte = last,
                BoundaryPolicy::Discard => {}
            }
        }

        self.push_samples(&decode_pcm16(&bytes))
    }

    /// Feed decoded PCM16 samples and collect every frame they complete.
    pub fn push_samples(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        let carried = self.carry.len();
        let mut window = std::mem::take(&mut self.carry);
        window.extend(samples.iter().copied().map(normalize_sample));

        let mut frames = Vec::with_capacity(window.len() / self.frame_len);
        let mut chunks = window.chunks_exact(self.frame_len);

        for (index, chunk) in chunks.by_ref().enumerate() {
            let start = (index * self.frame_len).saturating_sub(carried);
            frames.push(AudioFrame {
                samples: chunk.to_vec(),
                sample_rate: self.sample_rate,
                offset: duration_of(start, self.sample_rate),
            });
        }

        let remainder = chunks.remainder();
        match self.policy {
            BoundaryPolicy::Carry => self.carry = remainder.to_vec(),
            BoundaryPolicy::Discard => {
                self.discarded += remainder.len() as u64;
                self.carry.clear();
            }
        }

        frames
    }

    /// Forget carried samples, e.g. when playback is interrupted.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.odd_byte = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(policy: BoundaryPolicy) -> FrameAssembler {
        // 10 samples per frame
        FrameAssembler::new(1000, Duration::from_millis(10), policy)
    }

    #[test]
    fn test_decode_little_endian() {
        let samples = decode_pcm16(&[0x01, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x05]);
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_normalization_range() {
        assert_eq!(normalize_sample(i16::MIN), -1.0);
        assert!(normalize_sample(i16::MAX) < 1.0);
        assert_eq!(normalize_sample(0), 0.0);
    }

    #[test]
    fn test_frame_length_from_duration() {
        let assembler = FrameAssembler::new(24_000, Duration::from_millis(30), BoundaryPolicy::Carry);
        assert_eq!(assembler.frame_len(), 720);
    }

    #[test]
    fn test_short_chunk_yields_no_frames() {
        let mut assembler = assembler(BoundaryPolicy::Discard);
        assert!(assembler.push_samples(&[100; 9]).is_empty());
        assert_eq!(assembler.discarded_samples(), 9);
    }

    #[test]
    fn test_carry_completes_frame_across_chunks() {
        let mut assembler = assembler(BoundaryPolicy::Carry);

        assert!(assembler.push_samples(&[1; 6]).is_empty());
        assert_eq!(assembler.pending_samples(), 6);

        let frames = assembler.push_samples(&[2; 6]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 10);
        assert_eq!(frames[0].offset, Duration::ZERO);
        assert_eq!(assembler.pending_samples(), 2);
        assert_eq!(assembler.discarded_samples(), 0);
    }

    #[test]
    fn test_discard_drops_trailing_partial_frame() {
        let mut assembler = assembler(BoundaryPolicy::Discard);

        let frames = assembler.push_samples(&[1; 25]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].offset, Duration::from_millis(10));
        assert_eq!(assembler.pending_samples(), 0);
        assert_eq!(assembler.discarded_samples(), 5);

        // The next chunk starts a fresh frame
        assert!(assembler.push_samples(&[1; 5]).is_empty());
    }

    #[test]
    fn test_odd_byte_carried_between_byte_chunks() {
        let mut assembler = assembler(BoundaryPolicy::Carry);
        let bytes: Vec<u8> = (0..10i16).flat_map(|s| s.to_le_bytes()).collect();

        assert!(assembler.push_bytes(&bytes[..7]).is_empty());
        let frames = assembler.push_bytes(&bytes[7..]);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples[3], normalize_sample(3));
        assert_eq!(frames[0].samples[9], normalize_sample(9));
    }
}
