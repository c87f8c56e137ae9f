//! # Audio Capture Pipeline
//!
//! Turns microphone audio into the frames the voice relay forwards upstream.
//!
//! ## Audio Format (outgoing):
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit signed PCM, little-endian on the wire
//! - **Channels**: Mono
//! - **Frame size**: 1024 samples (64ms)
//!
//! ## Components:
//! - **pcm**: sample conversion, byte encoding, level metering
//! - **capture**: the real-time processor that downsamples and frames audio

pub mod capture;
pub mod pcm;

pub use capture::{frame_channel, MicProcessor, PcmFrame, PortCommand};
