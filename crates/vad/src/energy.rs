//! Energy/zero-crossing gate (detector A)
//!
//! RMS threshold plus a zero-crossing-rate cap, with a hangover counter so
//! syllable endings are not clipped. High ZCR at moderate energy is
//! noise-like and rejected; a sufficiently hot frame passes regardless.

use crate::SpeechGate;

/// Per-aggressiveness tuning
#[derive(Debug, Clone, Copy)]
struct Tuning {
    /// RMS amplitude above which a frame may be speech
    rms_threshold: f32,
    /// RMS above which the frame is speech regardless of ZCR
    rms_override: f32,
    /// Zero-crossing-rate cap (fraction of sample pairs that cross zero)
    zcr_max: f32,
    /// Below-threshold frames still reported as speech after real speech
    hangover_frames: u32,
}

const TUNINGS: [Tuning; 4] = [
    // 0: lenient, for quiet microphones and far-field
    Tuning {
        rms_threshold: 0.010,
        rms_override: 0.060,
        zcr_max: 0.35,
        hangover_frames: 10,
    },
    // 1
    Tuning {
        rms_threshold: 0.015,
        rms_override: 0.080,
        zcr_max: 0.30,
        hangover_frames: 8,
    },
    // 2: default
    Tuning {
        rms_threshold: 0.020,
        rms_override: 0.100,
        zcr_max: 0.25,
        hangover_frames: 6,
    },
    // 3: strict, for noisy environments
    Tuning {
        rms_threshold: 0.030,
        rms_override: 0.120,
        zcr_max: 0.20,
        hangover_frames: 4,
    },
];

/// Energy-based voice activity gate
#[derive(Debug, Clone)]
pub struct EnergyVad {
    tuning: Tuning,
    hangover_counter: u32,
}

impl EnergyVad {
    /// Create a gate with the given aggressiveness (0 lenient .. 3 strict).
    /// Values above 3 clamp to 3.
    pub fn new(aggressiveness: u8) -> Self {
        let tuning = TUNINGS[aggressiveness.min(3) as usize];
        Self {
            tuning,
            hangover_counter: 0,
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    fn zcr(samples: &[f32]) -> f32 {
        if samples.len() < 2 {
            return 0.0;
        }
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        crossings as f32 / (samples.len() - 1) as f32
    }

    fn classify(&self, samples: &[f32]) -> bool {
        let rms = Self::rms(samples);
        if rms < self.tuning.rms_threshold {
            return false;
        }
        if rms >= self.tuning.rms_override {
            return true;
        }
        Self::zcr(samples) <= self.tuning.zcr_max
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(2)
    }
}

impl SpeechGate for EnergyVad {
    fn is_speech(&mut self, frame: &[f32]) -> bool {
        if self.classify(frame) {
            self.hangover_counter = self.tuning.hangover_frames;
            true
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
