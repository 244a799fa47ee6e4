//! # μ-law Codec
//!
//! G.711 μ-law conversion between the 8-bit logarithmic telephony encoding
//! used on the media stream and the 16-bit linear PCM used internally.
//!
//! ## Encoding Layout (one byte, stored bit-inverted):
//! - **bit 7**: sign (set = negative)
//! - **bits 6-4**: exponent (segment 0-7)
//! - **bits 3-0**: mantissa (position inside the segment)
//!
//! The codec is lossy by nature: `encode(decode(x))` lands on the same
//! quantization level as `x`, which is all G.711 promises. The only code
//! that does not come back bit-identical is `0x7F` ("negative zero"), which
//! re-encodes as `0xFF`.

use byteorder::{ByteOrder, LittleEndian};

/// Bias added to the magnitude before segment lookup.
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude that still fits the top segment once biased.
const MULAW_CLIP: i32 = 32635;

/// Decode a single μ-law code into a linear PCM sample.
///
/// Defined for all 256 inputs; there is no error case.
pub fn decode_sample(code: u8) -> i16 {
    let inverted = !code;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;

    // Rebuild the biased magnitude, then strip the bias back off
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if inverted & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode a single linear PCM sample as a μ-law code.
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // Segment = position of the highest set bit above bit 7
    let segment_bits = ((magnitude >> 7) & 0xFF) as u8;
    let exponent = if segment_bits == 0 {
        0
    } else {
        7 - segment_bits.leading_zeros() as u8
    };
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode a μ-law frame into little-endian PCM16 bytes.
///
/// ## Output:
/// Exactly `2 × frame.len()` bytes, one sample per input byte.
pub fn decode(frame: &[u8]) -> Vec<u8> {
    let mut pcm = vec![0u8; frame.len() * 2];
    for (code, out) in frame.iter().zip(pcm.chunks_exact_mut(2)) {
        LittleEndian::write_i16(out, decode_sample(*code));
    }
    pcm
}

/// Encode little-endian PCM16 bytes into a μ-law frame.
///
/// ## Output:
/// One byte per complete input sample. A trailing odd byte (half a sample)
/// is ignored.
pub fn encode(pcm16: &[u8]) -> Vec<u8> {
    pcm16
        .chunks_exact(2)
        .map(|sample| encode_sample(LittleEndian::read_i16(sample)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_codes_decode_to_zero() {
        assert_eq!(decode_sample(0xFF), 0);
        assert_eq!(decode_sample(0x7F), 0);
    }

    #[test]
    fn test_extremes() {
        assert_eq!(decode_sample(0x00), -32124);
        assert_eq!(decode_sample(0x80), 32124);
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(encode_sample(i16::MIN), 0x00);
    }

    #[test]
    fn test_round_trip_all_codes() {
        for code in 0..=255u8 {
            let decoded = decode(&[code]);
            assert_eq!(decoded.len(), 2);

            let reencoded = encode(&decoded);
            assert_eq!(reencoded.len(), 1);

            // Same quantization level, even when the code itself differs (0x7F)
            assert_eq!(
                decode_sample(reencoded[0]),
                decode_sample(code),
                "code {:#04x} re-encoded as {:#04x}",
                code,
                reencoded[0]
            );
            if code != 0x7F {
                assert_eq!(reencoded[0], code);
            }
        }
    }

    #[test]
    fn test_encode_is_monotonic_in_magnitude() {
        // Larger positive samples never map to a smaller decoded level
        let mut previous = decode_sample(encode_sample(0));
        for sample in (0..=i16::MAX).step_by(97) {
            let level = decode_sample(encode_sample(sample));
            assert!(level >= previous, "sample {} went backwards", sample);
            previous = level;
        }
    }

    #[test]
    fn test_frame_lengths() {
        let frame = vec![0xFFu8; 160];
        let pcm = decode(&frame);
        assert_eq!(pcm.len(), 320);
        assert!(pcm.iter().all(|&b| b == 0));

        // Odd trailing byte is dropped
        assert_eq!(encode(&[0, 0, 0]).len(), 1);
    }
}
