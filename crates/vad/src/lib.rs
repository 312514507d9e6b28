//! Voice activity detection
//!
//! Two independent detectors vote on 10 ms frames:
//! - `EnergyVad` (detector A): fast, deterministic RMS + zero-crossing gate
//!   with configurable aggressiveness 0-3
//! - `NeuralVad` (detector B): a small ONNX model scoring speech
//!   probability, thresholded
//!
//! `VadEngine` fuses them: a frame is speech iff A says speech AND B's
//! probability clears the threshold. A's false positives dominate in noise,
//! B's false negatives dominate on short plosives; AND reduces both.

mod energy;
mod engine;
mod neural;

pub use energy::EnergyVad;
pub use engine::VadEngine;
pub use neural::{NeuralVad, NeuralVadConfig};

use thiserror::Error;

/// VAD errors
#[derive(Error, Debug)]
pub enum VadError {
    #[error("model error: {0}")]
    Model(String),

    #[error("invalid frame: expected {expected} samples, got {got}")]
    FrameSize { expected: usize, got: usize },
}

/// Binary speech gate (detector A shape)
pub trait SpeechGate: Send {
    /// Classify one 10 ms frame of 16 kHz mono samples
    fn is_speech(&mut self, frame: &[f32]) -> bool;

    /// Clear detector state
    fn reset(&mut self);
}

/// Probability scorer (detector B shape)
pub trait SpeechScorer: Send {
    /// Speech probability for one 10 ms frame, 0.0 to 1.0.
    ///
    /// Stateful: scorers may buffer frames internally to the model's chunk
    /// size and carry recurrent state across calls.
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, VadError>;

    /// Clear detector state
    fn reset(&mut self);
}
