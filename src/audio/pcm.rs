//! # PCM16 Conversion
//!
//! Sample-level helpers shared by the capture pipeline and the voice client.
//!
//! ## Conversion rules:
//! - Float samples are clamped to [-1.0, 1.0] *before* integer conversion
//! - Negative samples scale by 32768, non-negative by 32767 (the signed 16-bit
//!   range is asymmetric, so -1.0 maps to -32768 and 1.0 maps to 32767)
//! - Wire format is little-endian signed 16-bit

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale applied to negative samples.
pub const NEGATIVE_SCALE: f32 = 32768.0;
/// Scale applied to zero and positive samples.
pub const POSITIVE_SCALE: f32 = 32767.0;

/// Convert one floating-point sample to PCM16.
///
/// ## Example:
/// - `2.5` clamps to `1.0` and becomes `32767`
/// - `-1.0` becomes `-32768`
/// - `NaN` becomes `0` (float-to-int casts saturate and map NaN to zero)
pub fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * NEGATIVE_SCALE) as i16
    } else {
        (clamped * POSITIVE_SCALE) as i16
    }
}

/// Convert a PCM16 sample back to a float in [-1.0, 1.0].
pub fn pcm16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEGATIVE_SCALE
    } else {
        sample as f32 / POSITIVE_SCALE
    }
}

/// Encode samples as little-endian bytes (two bytes per sample).
pub fn encode_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Decode little-endian PCM16 bytes.
///
/// ## Errors:
/// Returns an error if the byte count is odd, since that cannot be a whole
/// number of 16-bit samples.
pub fn decode_le(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err("Audio data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Root-mean-square level of a block of samples, normalized to [0.0, 1.0].
///
/// Used for the voice client's microphone meter. An empty block is silence.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / NEGATIVE_SCALE as f64;
            v * v
        })
        .sum();

    ((sum_squares / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}
