//! WAV encoding for one-shot recognition
//!
//! Batch mode uploads the whole utterance as a mono 16-bit PCM WAV,
//! base64-encoded inside the request JSON.

use anyhow::{Context, Result};
use std::io::Cursor;

/// Encode mono float samples as a 16-bit little-endian PCM WAV.
pub fn encode_wav_pcm16(samples: &[f32], rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
    for &s in samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .context("Failed to write WAV sample")?;
    }
    writer.finalize().context("Failed to finalize WAV")?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_fields() {
        let samples = vec![0.0f32; 1600]; // 100 ms at 16 kHz
        let wav = encode_wav_pcm16(&samples, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // Sample rate at offset 24, little-endian
        let rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(rate, 16_000);
        // 16 bits per sample at offset 34
        let bits = u16::from_le_bytes([wav[34], wav[35]]);
        assert_eq!(bits, 16);
        // Data: 2 bytes per sample
        assert_eq!(wav.len(), 44 + samples.len() * 2);
    }

    #[test]
    fn test_wav_roundtrip_through_reader() {
        let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.02).sin() * 0.5).collect();
        let wav = encode_wav_pcm16(&samples, 16_000).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let back: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(back.len(), samples.len());
    }
}
