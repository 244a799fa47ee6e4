//! # WAV Container Framing
//!
//! Wraps raw little-endian PCM16 in the canonical 44-byte RIFF/WAVE header
//! so the speech-to-text service can read the sample format without any
//! side-channel metadata. No compression, no validation beyond the types.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the canonical PCM WAV header in bytes.
pub const WAV_HEADER_LEN: usize = 44;

/// Bits per sample for all PCM produced by this service.
const BITS_PER_SAMPLE: u16 = 16;

/// Frame PCM16 bytes as a WAV file.
///
/// ## Header Fields:
/// - **format tag**: 1 (uncompressed PCM)
/// - **byte rate**: `sample_rate × channels × 2`
/// - **block align**: `channels × 2`
/// - **RIFF size**: `36 + pcm.len()`, **data size**: `pcm.len()`
///
/// The result is always exactly `44 + pcm.len()` bytes.
pub fn frame_container(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let block_align = channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_LEN];

    // RIFF chunk descriptor
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], 36 + data_len);
    header[8..12].copy_from_slice(b"WAVE");

    // fmt sub-chunk
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1);
    LittleEndian::write_u16(&mut header[22..24], channels);
    LittleEndian::write_u32(&mut header[24..28], sample_rate);
    LittleEndian::write_u32(&mut header[28..32], byte_rate);
    LittleEndian::write_u16(&mut header[32..34], block_align);
    LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);

    // data sub-chunk
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], data_len);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(&header);
    wav.extend_from_slice(pcm);
    wav
}
