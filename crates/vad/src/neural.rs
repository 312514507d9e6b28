//! Neural speech scorer (detector B)
//!
//! Silero-style LSTM VAD over ONNX Runtime: raw 16 kHz input, 512-sample
//! chunks, recurrent state carried across calls. Incoming 10 ms frames are
//! buffered up to the model's chunk size; between inferences the last
//! probability is held.
//!
//! Without the `onnx` feature the scorer degrades to a deterministic
//! energy-derived probability so the fusion path stays exercisable.

use voxstream_core::energy_db;

use crate::{SpeechScorer, VadError};

#[cfg(feature = "onnx")]
use ndarray::Array2;
#[cfg(feature = "onnx")]
use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};

/// Neural scorer configuration
#[derive(Debug, Clone)]
pub struct NeuralVadConfig {
    /// Path to the ONNX model file
    pub model_path: String,
    /// Chunk size in samples (512 for 16 kHz = 32 ms)
    pub chunk_size: usize,
    /// Sample rate the model expects
    pub sample_rate: u32,
    /// Energy floor in dB; frames below are quick-scored 0.0
    pub energy_floor_db: f32,
}

impl Default for NeuralVadConfig {
    fn default() -> Self {
        Self {
            model_path: "models/vad.onnx".to_string(),
            chunk_size: 512,
            sample_rate: 16000,
            energy_floor_db: -50.0,
        }
    }
}

/// Neural VAD scorer
pub struct NeuralVad {
    config: NeuralVadConfig,
    #[cfg(feature = "onnx")]
    session: Session,
    #[cfg(feature = "onnx")]
    h_state: Array2<f32>,
    #[cfg(feature = "onnx")]
    c_state: Array2<f32>,
    audio_buffer: Vec<f32>,
    last_prob: f32,
}

impl NeuralVad {
    /// Load the model and initialize recurrent state
    #[cfg(feature = "onnx")]
    pub fn new(config: NeuralVadConfig) -> Result<Self, VadError> {
        let session = Session::builder()
            .map_err(|e| VadError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VadError::Model(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| VadError::Model(e.to_string()))?
            .commit_from_file(&config.model_path)
            .map_err(|e| VadError::Model(e.to_string()))?;

        let chunk_size = config.chunk_size;
        Ok(Self {
            config,
            session,
            // 2 layers x 64 hidden
            h_state: Array2::zeros((2, 64)),
            c_state: Array2::zeros((2, 64)),
            audio_buffer: Vec::with_capacity(chunk_size),
            last_prob: 0.0,
        })
    }

    /// Deterministic fallback scorer (no model file required)
    #[cfg(not(feature = "onnx"))]
    pub fn new(config: NeuralVadConfig) -> Result<Self, VadError> {
        let chunk_size = config.chunk_size;
        Ok(Self {
            config,
            audio_buffer: Vec::with_capacity(chunk_size),
            last_prob: 0.0,
        })
    }

    #[cfg(feature = "onnx")]
    fn score_chunk(&mut self, chunk: &[f32]) -> Result<f32, VadError> {
        let input = Array2::from_shape_vec((1, chunk.len()), chunk.to_vec())
            .map_err(|e| VadError::Model(e.to_string()))?;
        let sr = ndarray::arr1(&[self.config.sample_rate as i64]);

        let input_tensor = Tensor::from_array(input).map_err(|e| VadError::Model(e.to_string()))?;
        let sr_tensor = Tensor::from_array(sr).map_err(|e| VadError::Model(e.to_string()))?;
        let h_tensor =
            Tensor::from_array(self.h_state.clone()).map_err(|e| VadError::Model(e.to_string()))?;
        let c_tensor =
            Tensor::from_array(self.c_state.clone()).map_err(|e| VadError::Model(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "h" => h_tensor,
                "c" => c_tensor,
            ])
            .map_err(|e| VadError::Model(e.to_string()))?;

        let (_, speech_data) = outputs
            .get("output")
            .ok_or_else(|| VadError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| VadError::Model(e.to_string()))?;
        let speech_prob = speech_data.first().copied().unwrap_or(0.0);

        for (name, target) in [("hn", &mut self.h_state), ("cn", &mut self.c_state)] {
            if let Some(tensor) = outputs.get(name) {
                let (shape, data) = tensor
                    .try_extract_tensor::<f32>()
                    .map_err(|e| VadError::Model(e.to_string()))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                if dims.len() == 2 && data.len() == dims[0] * dims[1] {
                    let view = ndarray::ArrayView2::from_shape((dims[0], dims[1]), data)
                        .map_err(|e| VadError::Model(e.to_string()))?;
                    target.assign(&view);
                }
            }
        }

        Ok(speech_prob)
    }

    #[cfg(not(feature = "onnx"))]
    fn score_chunk(&mut self, chunk: &[f32]) -> Result<f32, VadError> {
        // Energy mapped over a 30 dB range above the floor
        let db = energy_db(chunk);
        let threshold_db = self.config.energy_floor_db + 10.0;
        let prob = if db > threshold_db {
            ((db - threshold_db) / 30.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Ok(prob)
    }
}

impl SpeechScorer for NeuralVad {
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, VadError> {
        // Obvious silence short-circuits without touching the model
        if energy_db(frame) < self.config.energy_floor_db {
            self.last_prob = 0.0;
            return Ok(0.0);
        }

        self.audio_buffer.extend_from_slice(frame);
        while self.audio_buffer.len() >= self.config.chunk_size {
            let chunk: Vec<f32> = self.audio_buffer.drain(..self.config.chunk_size).collect();
            self.last_prob = self.score_chunk(&chunk)?;
        }

        Ok(self.last_prob)
    }

    fn reset(&mut self) {
        self.audio_buffer.clear();
        self.last_prob = 0.0;
        #[cfg(feature = "onnx")]
        {
            self.h_state.fill(0.0);
            self.c_state.fill(0.0);
        }
    }
}
