//! Audio sample plumbing shared by the ASR and TTS controllers
//!
//! Device acquisition and playback widgets are external collaborators;
//! this module owns only the sample-level pieces: the sink seam the
//! embedding UI implements, PCM16 encode/decode with chunk-boundary
//! carry, and linear resampling between service and device rates.

use async_trait::async_trait;

/// Sample rate of raw TTS service output
pub const TTS_STREAM_RATE: u32 = 22_050;

/// Queue-based audio output attached to one node.
///
/// Implemented by the embedding UI; one sink per TTS node, released when
/// the node is destroyed.
pub trait AudioSink: Send + Sync {
    /// Output sample rate in Hz.
    fn rate(&self) -> u32;
    /// Wake the device if suspended.
    fn resume(&self);
    /// Append mono float samples in `[-1, 1]` to the playback queue.
    fn enqueue(&self, samples: &[f32]);
    /// Count of playback underruns observed so far.
    fn underruns(&self) -> u64 {
        0
    }
}

/// A fetched binary body.
#[derive(Debug, Clone)]
pub struct Blob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// File-mode playback seam: plays an encoded blob through the audio
/// element attached to a node, resolving when playback ends.
#[async_trait]
pub trait BlobPlayer: Send + Sync {
    async fn play(&self, blob: Blob) -> anyhow::Result<()>;
}

/// Incremental PCM16LE → f32 decoder.
///
/// Network chunks may split a 16-bit sample; the odd trailing byte is
/// carried into the next chunk.
#[derive(Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Vec<f32> {
        let mut bytes: Vec<u8> = Vec::with_capacity(chunk.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(chunk);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect()
    }

    /// True when half a sample is still buffered.
    pub fn has_carry(&self) -> bool {
        self.carry.is_some()
    }
}

/// Encode float samples as PCM16LE bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Resample mono samples with linear interpolation.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;
        out.push(samples[idx_floor] * (1.0 - frac) + samples[idx_ceil] * frac);
    }
    out
}

/// Root-mean-square level of a sample buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
