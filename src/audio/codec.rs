//! # Frame Encoder/Decoder
//!
//! Converts between the float samples audio devices work with and the compact
//! wire format of the live transport:
//!
//! ```text
//! [f32 in -1..1] --encode_pcm16--> [i16 LE bytes] --encode_base64--> "text-safe payload"
//! [f32]          <--decode_pcm16-- [i16 LE bytes] <--decode_base64-- "text-safe payload"
//! ```
//!
//! ## Conversion:
//! - **Encode**: clamp to [-1, 1], scale by 32768, clamp to the i16 range, truncate
//! - **Decode**: divide by 32768 (exact inverse, so a round trip loses at most one
//!   quantization step of 1/32768)

use crate::error::LiveError;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale between the float and 16-bit integer representations.
pub const PCM16_SCALE: f32 = 32768.0;

/// Bytes per 16-bit mono sample.
pub const PCM16_BYTES_PER_SAMPLE: usize = 2;

/// Convert one float sample to a 16-bit integer sample.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    let scaled = sample.clamp(-1.0, 1.0) * PCM16_SCALE;
    scaled.clamp(-32768.0, 32767.0) as i16
}

/// Convert one 16-bit integer sample back to float.
#[inline]
pub fn i16_to_sample(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Encode float samples as 16-bit signed little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * PCM16_BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample_to_i16(sample));
    }
    bytes
}

/// Decode 16-bit signed little-endian PCM into float samples.
///
/// ## Errors:
/// Odd-length buffers cannot hold whole 16-bit samples and are rejected with
/// `LiveError::Decode`. An empty buffer decodes to no samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, LiveError> {
    if bytes.len() % PCM16_BYTES_PER_SAMPLE != 0 {
        return Err(LiveError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / PCM16_BYTES_PER_SAMPLE);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(i16_to_sample(sample));
    }
    Ok(samples)
}

/// Wrap binary audio in the transport's text-safe representation.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Unwrap a text-safe payload back into bytes.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, LiveError> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| LiveError::Decode(format!("invalid base64 audio payload: {}", e)))
}

/// Decode a base64 PCM16 payload straight into float samples.
pub fn decode_payload(text: &str) -> Result<Vec<f32>, LiveError> {
    decode_pcm16(&decode_base64(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_little_endian_i16() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..2], &0i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &16384i16.to_le_bytes());
        assert_eq!(&bytes[4..6], &(-16384i16).to_le_bytes());
        assert_eq!(&bytes[6..8], &i16::MIN.to_le_bytes());
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode_pcm16(&[1.0, 1.7, -3.0]);
        assert_eq!(&bytes[0..2], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[2..4], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[4..6], &i16::MIN.to_le_bytes());
    }

    #[test]
    fn test_round_trip_within_quantization_error() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.999)
            .chain([1.0, -1.0, 0.0, 1e-6, -1e-6])
            .collect();
        let decoded = decode_pcm16(&encode_pcm16(&samples)).unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (original, restored) in samples.iter().zip(decoded.iter()) {
            let err = (original - restored).abs();
            assert!(
                err <= 1.0 / PCM16_SCALE,
                "quantization error too large: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let err = decode_pcm16(&[0u8; 15]).unwrap_err();
        assert_eq!(err.kind(), "decode_error");
        assert!(decode_pcm16(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_base64_payload() {
        let pcm = encode_pcm16(&[0.25, -0.25]);
        let text = encode_base64(&pcm);
        assert_eq!(decode_base64(&text).unwrap(), pcm);
        assert_eq!(decode_payload(&text).unwrap(), vec![0.25, -0.25]);

        assert!(decode_base64("not base64!!").is_err());
        // valid base64, but three bytes is not whole 16-bit samples
        assert!(decode_payload(&encode_base64(&[1, 2, 3])).is_err());
    }
}
