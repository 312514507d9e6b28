//! Core traits and types for the voxstream pipeline
//!
//! This crate provides the foundational pieces used across all services:
//! - Audio sample handling and resampling
//! - Wire/data-model types for broker streams and channels
//! - Language codes
//! - `Transcriber` / `Translator` capability traits
//! - Shared error type

pub mod audio;
pub mod error;
pub mod language;
pub mod message;
pub mod traits;

pub use audio::{
    energy_db, f32_to_pcm16, pcm16_duration_ms, pcm16_to_f32, SampleRate, StreamResampler,
    FRAME_BYTES, FRAME_MS, FRAME_SAMPLES, TARGET_SAMPLE_RATE,
};
pub use error::{CoreError, Result};
pub use language::LangCode;
pub use message::{
    now_ms, results_channel, session_key, ResultMessage, SegmentJob, SessionRecord,
    TranslationJob, AUDIO_JOBS_STREAM, FINAL_TRANSCRIPTS_STREAM,
};
pub use traits::{Transcriber, Transcription, Translator};
