//! Voice activity detection
//!
//! An exponential moving average of per-buffer RMS with asymmetric
//! thresholds: speech starts the first tick the EMA reaches the on
//! threshold, and ends only after the EMA stays under the (lower) off
//! threshold for a sustained hold period.

use std::time::{Duration, Instant};

/// Default EMA window in milliseconds
pub const DEFAULT_EMA_MS: f64 = 120.0;

/// Default RMS on-threshold
pub const DEFAULT_RMS_THRESHOLD: f32 = 0.012;

/// Default release hold before speech is considered ended
pub const DEFAULT_HOLD_MS: u64 = 250;

/// Off threshold as a fraction of the on threshold
const OFF_RATIO: f32 = 0.7;

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS level at which speech starts
    pub rms_threshold: f32,
    /// EMA time constant in milliseconds
    pub ema_ms: f64,
    /// Sustained-quiet period required to end speech
    pub hold_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            rms_threshold: DEFAULT_RMS_THRESHOLD,
            ema_ms: DEFAULT_EMA_MS,
            hold_ms: DEFAULT_HOLD_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Voice,
}

/// Result of one VAD tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    None,
    SpeechStart,
    SpeechEnd,
}

pub struct Vad {
    cfg: VadConfig,
    state: VadState,
    ema: f32,
    /// When the EMA first dipped under the off threshold during voice
    below_since: Option<Instant>,
    last_voice_at: Option<Instant>,
    last_silence_at: Option<Instant>,
}

impl Vad {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            cfg,
            state: VadState::Silence,
            ema: 0.0,
            below_since: None,
            last_voice_at: None,
            last_silence_at: None,
        }
    }

    /// Feed one buffer's RMS. `dt` is the buffer duration; `now` is a
    /// monotonic timestamp supplied by the caller.
    pub fn tick(&mut self, rms: f32, dt: Duration, now: Instant) -> VadTransition {
        // alpha = 1 - e^(-dt/ema_ms)
        let alpha = 1.0 - (-(dt.as_secs_f64() * 1000.0) / self.cfg.ema_ms).exp();
        self.ema = (1.0 - alpha as f32) * self.ema + alpha as f32 * rms;

        let on_th = self.cfg.rms_threshold;
        let off_th = on_th * OFF_RATIO;

        match self.state {
            VadState::Silence => {
                self.last_silence_at = Some(now);
                if self.ema >= on_th {
                    self.state = VadState::Voice;
                    self.below_since = None;
                    self.last_voice_at = Some(now);
                    return VadTransition::SpeechStart;
                }
                VadTransition::None
            }
            VadState::Voice => {
                self.last_voice_at = Some(now);
                if self.ema < off_th {
                    let since = *self.below_since.get_or_insert(now);
                    if now.duration_since(since) >= Duration::from_millis(self.cfg.hold_ms) {
                        self.state = VadState::Silence;
                        self.below_since = None;
                        self.last_silence_at = Some(now);
                        return VadTransition::SpeechEnd;
                    }
                } else {
                    self.below_since = None;
                }
                VadTransition::None
            }
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn is_silent(&self) -> bool {
        self.state == VadState::Silence
    }

    pub fn ema(&self) -> f32 {
        self.ema
    }

    /// True while the EMA still clears the off threshold (tail extension).
    pub fn above_off(&self) -> bool {
        self.ema >= self.cfg.rms_threshold * OFF_RATIO
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.ema = 0.0;
        self.below_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(vad: &mut Vad, rms: f32, ticks: usize, start: Instant, step: Duration) -> Vec<VadTransition> {
        (0..ticks)
            .map(|i| vad.tick(rms, step, start + step * (i as u32 + 1)))
            .collect()
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut vad = Vad::new(VadConfig::default());
        let t0 = Instant::now();
        let out = run(&mut vad, 0.001, 20, t0, Duration::from_millis(20));
        assert!(out.iter().all(|t| *t == VadTransition::None));
        assert!(vad.is_silent());
    }

    #[test]
    fn test_speech_start_on_loud_input() {
        let mut vad = Vad::new(VadConfig::default());
        let t0 = Instant::now();
        let out = run(&mut vad, 0.2, 20, t0, Duration::from_millis(20));
        assert!(out.contains(&VadTransition::SpeechStart));
        assert_eq!(vad.state(), VadState::Voice);
    }

    #[test]
    fn test_speech_end_requires_hold() {
        let mut vad = Vad::new(VadConfig::default());
        let t0 = Instant::now();
        let step = Duration::from_millis(20);
        run(&mut vad, 0.2, 20, t0, step);
        assert_eq!(vad.state(), VadState::Voice);
        // Quiet, but shorter than the hold: still voice.
        let t1 = t0 + step * 20;
        let out = run(&mut vad, 0.0, 5, t1, step);
        assert!(!out.contains(&VadTransition::SpeechEnd));
        // Sustained quiet past the hold ends speech.
        let t2 = t1 + step * 5;
        let out = run(&mut vad, 0.0, 30, t2, step);
        assert!(out.contains(&VadTransition::SpeechEnd));
        assert!(vad.is_silent());
    }

    #[test]
    fn test_brief_dip_does_not_end_speech() {
        let mut vad = Vad::new(VadConfig::default());
        let t0 = Instant::now();
        let step = Duration::from_millis(20);
        run(&mut vad, 0.2, 20, t0, step);
        let t1 = t0 + step * 20;
        run(&mut vad, 0.0, 3, t1, step); // 60 ms dip < 250 ms hold
        let t2 = t1 + step * 3;
        run(&mut vad, 0.2, 10, t2, step);
        assert_eq!(vad.state(), VadState::Voice);
    }
}
