//! # Audio Analysis Module
//!
//! Turns streamed playback audio into viseme weight vectors for the
//! continuous animation mode.
//!
//! ## Key Components:
//! - **Frame Assembler**: PCM16 decoding and fixed-size framing across chunk boundaries
//! - **Frame Analyzer**: FFT band energies mapped onto visemes
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: configurable, 24kHz for realtime playback audio
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod analyzer; // FFT band analysis
pub mod buffer;   // Framing and PCM decoding
