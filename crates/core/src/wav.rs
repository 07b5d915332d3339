//! WAV (RIFF) header construction for streamed and collected responses

use crate::audio::AudioFormat;

/// Size of the canonical 44-byte PCM WAV header
pub const HEADER_LEN: usize = 44;

/// Placeholder data length used for chunked streaming, where the final size
/// is unknown when the header leaves the server. Players treat it as
/// "read until EOF".
const STREAMING_DATA_LEN: u32 = u32::MAX - 100;

/// Build a WAV header with placeholder sizes for a chunked stream
pub fn streaming_header(format: AudioFormat) -> Vec<u8> {
    header_with_len(format, STREAMING_DATA_LEN)
}

/// Build a well-formed WAV header for a payload of known length
pub fn finalized_header(format: AudioFormat, data_len: u32) -> Vec<u8> {
    header_with_len(format, data_len)
}

fn header_with_len(format: AudioFormat, data_len: u32) -> Vec<u8> {
    let channels = format.channels.count() as u16;
    let sample_rate = format.sample_rate.as_u32();
    let bits = format.bit_depth.bits();
    let block_align = channels * (bits / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut h = Vec::with_capacity(HEADER_LEN);
    h.extend_from_slice(b"RIFF");
    h.extend_from_slice(&data_len.wrapping_add(36).to_le_bytes());
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.extend_from_slice(&16u32.to_le_bytes()); // PCM fmt chunk size
    h.extend_from_slice(&1u16.to_le_bytes()); // PCM
    h.extend_from_slice(&channels.to_le_bytes());
    h.extend_from_slice(&sample_rate.to_le_bytes());
    h.extend_from_slice(&byte_rate.to_le_bytes());
    h.extend_from_slice(&block_align.to_le_bytes());
    h.extend_from_slice(&bits.to_le_bytes());
    h.extend_from_slice(b"data");
    h.extend_from_slice(&data_len.to_le_bytes());
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BitDepth, Channels, SampleRate};

    #[test]
    fn test_header_len() {
        assert_eq!(streaming_header(AudioFormat::default()).len(), HEADER_LEN);
    }

    #[test]
    fn test_finalized_header_parses_with_hound() {
        let format = AudioFormat::default();
        let data: Vec<u8> = (0..4800u32).flat_map(|_| 0i16.to_le_bytes()).collect();

        let mut file = finalized_header(format, data.len() as u32);
        file.extend_from_slice(&data);

        let reader = hound::WavReader::new(std::io::Cursor::new(file)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 24000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 4800);
    }

    #[test]
    fn test_streaming_header_fields() {
        let format = AudioFormat {
            sample_rate: SampleRate::Hz48000,
            channels: Channels::Stereo,
            bit_depth: BitDepth::B16,
        };
        let h = streaming_header(format);

        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[8..12], b"WAVE");
        // byte rate = 48000 * 2ch * 2B
        let byte_rate = u32::from_le_bytes([h[28], h[29], h[30], h[31]]);
        assert_eq!(byte_rate, 192_000);
    }
}
