//! Detector fusion

use crate::{SpeechGate, SpeechScorer, VadError};

/// Fused voice activity engine.
///
/// A frame is speech iff the gate (detector A) fires AND the scorer's
/// (detector B) probability clears the threshold. The gate runs first and
/// short-circuits, so the model is never invoked on frames the cheap
/// detector already rejected.
pub struct VadEngine {
    gate: Box<dyn SpeechGate>,
    scorer: Box<dyn SpeechScorer>,
    threshold: f32,
}

impl VadEngine {
    pub fn new(gate: Box<dyn SpeechGate>, scorer: Box<dyn SpeechScorer>, threshold: f32) -> Self {
        Self {
            gate,
            scorer,
            threshold,
        }
    }

    /// Classify one 10 ms frame of 16 kHz mono samples
    pub fn classify(&mut self, frame: &[f32]) -> Result<bool, VadError> {
        if !self.gate.is_speech(frame) {
            return Ok(false);
        }
        let prob = self.scorer.speech_probability(frame)?;
        Ok(prob >= self.threshold)
    }

    /// Clear both detectors
    pub fn reset(&mut self) {
        self.gate.reset();
        self.scorer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGate(bool);
    impl SpeechGate for FixedGate {
        fn is_speech(&mut self, _frame: &[f32]) -> bool {
            self.0
        }
        fn reset(&mut self) {}
    }

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedScorer {
        prob: f32,
        calls: Arc<AtomicUsize>,
    }
    impl SpeechScorer for FixedScorer {
        fn speech_probability(&mut self, _frame: &[f32]) -> Result<f32, VadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.prob)
        }
        fn reset(&mut self) {}
    }

    fn engine(gate: bool, prob: f32) -> (VadEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let eng = VadEngine::new(
            Box::new(FixedGate(gate)),
            Box::new(FixedScorer {
                prob,
                calls: calls.clone(),
            }),
            0.5,
        );
        (eng, calls)
    }

    #[test]
    fn test_and_fusion() {
        let frame = vec![0.0f32; 160];

        let (mut both, _) = engine(true, 0.9);
        assert!(both.classify(&frame).unwrap());

        let (mut gate_only, _) = engine(true, 0.1);
        assert!(!gate_only.classify(&frame).unwrap());

        let (mut scorer_only, _) = engine(false, 0.9);
        assert!(!scorer_only.classify(&frame).unwrap());
    }

    #[test]
    fn test_gate_short_circuits_scorer() {
        let frame = vec![0.0f32; 160];
        let (mut eng, calls) = engine(false, 0.9);
        eng.classify(&frame).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_threshold_boundary() {
        let frame = vec![0.0f32; 160];
        let (mut at, _) = engine(true, 0.5);
        assert!(at.classify(&frame).unwrap());
    }
}
