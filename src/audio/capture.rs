//! # Microphone Capture Processor
//!
//! The real-time half of the capture pipeline. A [`MicProcessor`] lives on the
//! audio thread, receives one render quantum of float samples per callback and
//! turns them into mono PCM16 frames at a [`CaptureFormat`] (16 kHz frames of
//! [`FRAME_SAMPLES`] samples unless the `audio` config section says otherwise).
//!
//! ## Pipeline:
//! 1. **Downsample**: keep every Nth sample, `N = floor(native_rate / target_rate)`.
//!    This is plain decimation with no low-pass filter, so content above half
//!    the target rate aliases. Rates at or below the target pass through.
//! 2. **Convert**: clamp to [-1, 1], scale to PCM16 (see [`crate::audio::pcm`])
//! 3. **Frame**: accumulate; every time a full frame is available, move
//!    exactly that many samples into a [`PcmFrame`] and send it through the port
//! 4. **Flush**: [`PortCommand::Flush`] drains a partial remainder on shutdown
//!
//! ## Threading:
//! The port is an unbounded channel, so `process` never blocks the audio
//! thread. Frames are moved, not copied: once sent, the consumer owns them.

use crate::audio::pcm::{encode_le, float_to_pcm16};
use crate::config::AudioConfig;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::trace;

/// Sample rate of emitted frames (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// Samples per full frame.
pub const FRAME_SAMPLES: usize = 1024;
/// Typical number of samples delivered per audio callback.
pub const RENDER_QUANTUM: usize = 128;
/// Name under which the browser worklet is registered.
pub const PROCESSOR_NAME: &str = "mic-processor";
/// Path the browser loads the worklet module from.
pub const MODULE_PATH: &str = "/audio-worklet/mic-processor.js";

/// Output format of a [`MicProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Rate of emitted samples (Hz)
    pub sample_rate: u32,
    /// Samples per full frame
    pub frame_samples: usize,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

impl From<&AudioConfig> for CaptureFormat {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples,
        }
    }
}

/// A block of 16 kHz mono PCM16 samples.
///
/// Deliberately not `Clone`: a frame has exactly one owner at a time, like a
/// transferred `ArrayBuffer`.
#[derive(Debug, PartialEq, Eq)]
pub struct PcmFrame {
    samples: Vec<i16>,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wire form: little-endian PCM16 bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        encode_le(&self.samples)
    }
}

/// Control messages accepted on the processor's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    /// Emit whatever partial frame is buffered
    Flush,
}

impl FromStr for PortCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flush" => Ok(PortCommand::Flush),
            other => Err(format!("Unknown port command: {}", other)),
        }
    }
}

pub type FrameSender = mpsc::UnboundedSender<PcmFrame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<PcmFrame>;

/// Create the port connecting a processor to its consumer.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

/// Converts native-rate float audio into fixed-size PCM16 frames.
pub struct MicProcessor {
    /// Decimation step (1 = keep every sample)
    step: usize,
    frame_samples: usize,
    /// Converted samples not yet emitted
    pending: Vec<i16>,
    port: FrameSender,
    frames_emitted: u64,
}

impl MicProcessor {
    /// Create a processor for audio arriving at `native_sample_rate`,
    /// emitting the default 16 kHz / 1024-sample format.
    pub fn new(native_sample_rate: u32, port: FrameSender) -> Self {
        Self::with_format(native_sample_rate, CaptureFormat::default(), port)
    }

    /// The decimation step is fixed here for the processor's lifetime.
    pub fn with_format(native_sample_rate: u32, format: CaptureFormat, port: FrameSender) -> Self {
        let frame_samples = format.frame_samples.max(1);
        let ratio = native_sample_rate as f64 / format.sample_rate.max(1) as f64;
        let step = if ratio < 1.0 { 1 } else { ratio.floor() as usize };

        Self {
            step,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            port,
            frames_emitted: 0,
        }
    }

    /// Decimation step chosen at construction.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Samples buffered but not yet emitted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Handle one audio callback.
    ///
    /// `input` is the first input channel, or `None` when the platform
    /// delivered no channel data. Missing or empty input is dropped without
    /// flushing. Always returns `true` so the host keeps the processor alive.
    pub fn process(&mut self, input: Option<&[f32]>) -> bool {
        let Some(channel) = input.filter(|c| !c.is_empty()) else {
            return true;
        };

        self.pending
            .extend(channel.iter().step_by(self.step).map(|&s| float_to_pcm16(s)));

        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let frame = std::mem::replace(&mut self.pending, rest);
            self.emit(frame);
        }

        true
    }

    /// Handle a control message from the port.
    pub fn handle_control(&mut self, command: PortCommand) {
        match command {
            PortCommand::Flush => {
                if self.pending.is_empty() {
                    return;
                }
                let frame = std::mem::take(&mut self.pending);
                self.emit(frame);
            }
        }
    }

    fn emit(&mut self, samples: Vec<i16>) {
        self.frames_emitted += 1;
        // A closed port means the consumer stopped listening; frames are dropped.
        if self.port.send(PcmFrame::new(samples)).is_err() {
            trace!("capture port closed, dropping frame");
        }
    }
}
