//! # Audio Frame Analyzer
//!
//! Converts PCM chunks into time-offset viseme weight vectors by frequency
//! analysis.
//!
//! ## Processing Steps:
//! 1. Decode and normalize PCM16 samples (see [`crate::audio::buffer`])
//! 2. Slice into fixed-duration frames; the trailing partial frame follows the
//!    configured [`BoundaryPolicy`]
//! 3. Forward FFT per frame (`rustfft`), magnitudes of the bins below Nyquist
//! 4. Each [`FrequencyBand`] takes the highest peak-normalized magnitude among
//!    the bins inside its inclusive `[min_hz, max_hz]` range
//! 5. The band vector is normalized to sum 1; a frame with zero peak stays all zero

use crate::animation::viseme::{Viseme, VisemeWeightSet};
use crate::audio::buffer::{duration_of, AudioFrame, BoundaryPolicy, FrameAssembler};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A frequency range pre-mapped to one viseme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub name: String,
    pub viseme: Viseme,
    pub min_hz: f32,
    pub max_hz: f32,
}

impl FrequencyBand {
    pub fn new(name: &str, viseme: Viseme, min_hz: f32, max_hz: f32) -> Self {
        Self {
            name: name.to_string(),
            viseme,
            min_hz,
            max_hz,
        }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, hz: f32) -> bool {
        hz >= self.min_hz && hz <= self.max_hz
    }
}

/// Band table used when the configuration does not override it.
///
/// Everything below 500Hz maps to a vowel; voiced low-frequency energy is
/// the open or rounded mouth, never a closed bilabial.
pub fn default_bands() -> Vec<FrequencyBand> {
    vec![
        FrequencyBand::new("rounded_vowel", Viseme::O, 60.0, 500.0),
        FrequencyBand::new("open_vowel", Viseme::Aa, 500.0, 1200.0),
        FrequencyBand::new("labiodental", Viseme::FF, 1000.0, 2000.0),
        FrequencyBand::new("dental", Viseme::TH, 1500.0, 2500.0),
        FrequencyBand::new("alveolar", Viseme::DD, 1800.0, 2500.0),
        FrequencyBand::new("lateral", Viseme::Nn, 1500.0, 2500.0),
        FrequencyBand::new("front_vowel", Viseme::E, 2000.0, 2500.0),
    ]
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub sample_rate: u32,
    pub frame_duration: Duration,
    pub boundary: BoundaryPolicy,
    pub bands: Vec<FrequencyBand>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_duration: Duration::from_millis(30),
            boundary: BoundaryPolicy::Carry,
            bands: default_bands(),
        }
    }
}

/// Per-analyzer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalyzerStats {
    pub chunks: u64,
    pub frames_analyzed: u64,
    pub silent_frames: u64,
    pub samples_discarded: u64,
}

/// Analysis result for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VisemeFrame {
    /// Frame start relative to the chunk
    pub time_offset: Duration,
    pub weights: VisemeWeightSet,
}

/// Streaming spectrum analyzer. One instance per audio stream, since it
/// carries partial frames between chunks.
pub struct AudioFrameAnalyzer {
    config: AnalyzerConfig,
    assembler: FrameAssembler,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    stats: AnalyzerStats,
}

impl AudioFrameAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let assembler = FrameAssembler::new(config.sample_rate, config.frame_duration, config.boundary);
        let frame_len = assembler.frame_len();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_len);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            config,
            assembler,
            fft,
            buffer: Vec::with_capacity(frame_len),
            scratch,
            magnitudes: Vec::with_capacity(frame_len / 2),
            stats: AnalyzerStats::default(),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.assembler.frame_len()
    }

    pub fn stats(&self) -> AnalyzerStats {
        AnalyzerStats {
            samples_discarded: self.assembler.discarded_samples(),
            ..self.stats
        }
    }

    /// Playback duration of `samples` at the configured rate.
    pub fn duration_of(&self, samples: usize) -> Duration {
        duration_of(samples, self.config.sample_rate)
    }

    /// Analyze a chunk of decoded PCM16 samples.
    pub fn process_chunk(&mut self, samples: &[i16]) -> Vec<VisemeFrame> {
        self.stats.chunks += 1;
        let frames = self.assembler.push_samples(samples);
        self.analyze_all(frames)
    }

    /// Analyze a chunk of raw little-endian PCM16 bytes.
    pub fn process_bytes(&mut self, data: &[u8]) -> Vec<VisemeFrame> {
        self.stats.chunks += 1;
        let frames = self.assembler.push_bytes(data);
        self.analyze_all(frames)
    }

    /// Drop any carried partial frame.
    pub fn reset(&mut self) {
        self.assembler.reset();
    }

    fn analyze_all(&mut self, frames: Vec<AudioFrame>) -> Vec<VisemeFrame> {
        frames
            .into_iter()
            .map(|frame| VisemeFrame {
                time_offset: frame.offset,
                weights: self.analyze_frame(&frame),
            })
            .collect()
    }

    /// Band weights for one complete frame.
    pub fn analyze_frame(&mut self, frame: &AudioFrame) -> VisemeWeightSet {
        self.stats.frames_analyzed += 1;
        let frame_len = self.frame_len();

        self.buffer.clear();
        self.buffer
            .extend(frame.samples.iter().take(frame_len).map(|&s| Complex::new(s, 0.0)));
        self.buffer.resize(frame_len, Complex::new(0.0, 0.0));
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        // Bins at or above Nyquist mirror the lower half
        self.magnitudes.clear();
        self.magnitudes
            .extend(self.buffer.iter().take(frame_len / 2).map(|c| c.norm()));

        let peak = self.magnitudes.iter().copied().fold(0.0f32, f32::max);
        let mut weights = VisemeWeightSet::new();
        for band in &self.config.bands {
            weights.insert(band.viseme, 0.0);
        }

        if peak <= 0.0 || !peak.is_finite() {
            self.stats.silent_frames += 1;
            return weights;
        }

        let bin_hz = frame.sample_rate as f32 / frame_len as f32;
        for band in &self.config.bands {
            let band_max = self
                .magnitudes
                .iter()
                .enumerate()
                .filter(|(bin, _)| band.contains(*bin as f32 * bin_hz))
                .map(|(_, magnitude)| magnitude / peak)
                .fold(0.0f32, f32::max);

            if band_max > weights.get(band.viseme) {
                weights.insert(band.viseme, band_max);
            }
        }

        if weights.is_silent() {
            // Energy sits entirely outside every band
            self.stats.silent_frames += 1;
            return weights;
        }

        weights.normalized()
    }
}

impl std::fmt::Debug for AudioFrameAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrameAnalyzer")
            .field("config", &self.config)
            .field("frame_len", &self.frame_len())
            .field("pending_samples", &self.assembler.pending_samples())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f32 / sample_rate as f32;
                ((2.0 * PI * freq * t).sin() * amplitude * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_low_frequency_frame_lands_on_vowel_viseme() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());
        assert_eq!(analyzer.frame_len(), 720);

        // 300Hz is exactly bin 9 of a 720-point transform at 24kHz
        let frames = analyzer.process_chunk(&tone(300.0, 24_000, 720, 0.8));
        assert_eq!(frames.len(), 1);

        let (viseme, _) = frames[0].weights.dominant().expect("non-silent frame");
        assert_eq!(viseme, Viseme::O);
        assert!(viseme.is_vowel());
        assert!((frames[0].weights.sum() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_energy_below_500hz_always_lands_on_a_vowel() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());

        for freq in [100.0, 150.0, 200.0, 250.0, 300.0, 350.0, 400.0, 450.0] {
            let frames = analyzer.process_chunk(&tone(freq, 24_000, 720, 0.8));
            assert_eq!(frames.len(), 1);

            let (viseme, _) = frames[0].weights.dominant().expect("non-silent frame");
            assert!(viseme.is_vowel(), "{}Hz landed on {:?}", freq, viseme);
        }
    }

    #[test]
    fn test_default_bands_below_500hz_are_vowels() {
        for band in default_bands().iter().filter(|band| band.min_hz < 500.0) {
            assert!(band.viseme.is_vowel(), "band {} maps to {:?}", band.name, band.viseme);
        }
    }

    #[test]
    fn test_reset_drops_carried_samples() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());

        assert!(analyzer.process_chunk(&tone(300.0, 24_000, 500, 0.5)).is_empty());
        analyzer.reset();
        assert!(analyzer.process_chunk(&tone(300.0, 24_000, 220, 0.5)).is_empty());
    }

    #[test]
    fn test_weights_are_normalized_or_silent() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());

        let mut chunk = tone(150.0, 24_000, 1440, 0.3);
        for (sample, high) in chunk.iter_mut().zip(tone(1_700.0, 24_000, 1440, 0.3)) {
            *sample = sample.saturating_add(high);
        }
        chunk.extend(vec![0i16; 720]);

        let frames = analyzer.process_chunk(&chunk);
        assert_eq!(frames.len(), 3);

        for frame in &frames {
            for (_, weight) in frame.weights.iter() {
                assert!((0.0..=1.0).contains(&weight));
            }
            let sum = frame.weights.sum();
            assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-4, "sum was {}", sum);
        }
        assert!(frames[2].weights.is_silent());
        assert_eq!(analyzer.stats().silent_frames, 1);
    }

    #[test]
    fn test_frames_carry_offsets_within_chunk() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());
        let frames = analyzer.process_chunk(&tone(400.0, 24_000, 2160, 0.5));

        let offsets: Vec<Duration> = frames.iter().map(|f| f.time_offset).collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_millis(30), Duration::from_millis(60)]
        );
    }

    #[test]
    fn test_short_chunk_is_not_an_error() {
        let config = AnalyzerConfig {
            boundary: BoundaryPolicy::Discard,
            ..AnalyzerConfig::default()
        };
        let mut analyzer = AudioFrameAnalyzer::new(config);

        assert!(analyzer.process_chunk(&tone(300.0, 24_000, 500, 0.5)).is_empty());
        assert!(analyzer.process_chunk(&tone(300.0, 24_000, 500, 0.5)).is_empty());
        assert_eq!(analyzer.stats().samples_discarded, 1000);
        assert_eq!(analyzer.stats().frames_analyzed, 0);
    }

    #[test]
    fn test_carry_policy_joins_short_chunks() {
        let mut analyzer = AudioFrameAnalyzer::new(AnalyzerConfig::default());

        assert!(analyzer.process_chunk(&tone(300.0, 24_000, 500, 0.5)).is_empty());
        let frames = analyzer.process_chunk(&tone(300.0, 24_000, 500, 0.5));
        assert_eq!(frames.len(), 1);
        assert_eq!(analyzer.stats().samples_discarded, 0);
    }

    #[test]
    fn test_process_bytes_matches_samples() {
        let samples = tone(300.0, 24_000, 720, 0.5);
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut by_samples = AudioFrameAnalyzer::new(AnalyzerConfig::default());
        let mut by_bytes = AudioFrameAnalyzer::new(AnalyzerConfig::default());

        assert_eq!(by_samples.process_chunk(&samples), by_bytes.process_bytes(&bytes));
    }
}
