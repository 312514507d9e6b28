//! Wire and data-model types
//!
//! Three shapes move through the broker:
//! - `SegmentJob` on the `audio_jobs` stream (gateway -> STT workers)
//! - `TranslationJob` on the `final_transcripts` stream (STT -> translation
//!   workers)
//! - `ResultMessage` on the per-session `results:{session_id}` channel
//!   (workers -> gateway)
//!
//! Stream entries are flat string maps (hashes-of-strings broker APIs), so
//! audio rides base64-encoded. Channel messages are JSON.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audio::TARGET_SAMPLE_RATE;
use crate::error::{CoreError, Result};
use crate::language::LangCode;

/// Stream name for segment jobs
pub const AUDIO_JOBS_STREAM: &str = "audio_jobs";

/// Stream name for translation jobs
pub const FINAL_TRANSCRIPTS_STREAM: &str = "final_transcripts";

/// Pub/sub channel for one session's results
pub fn results_channel(session_id: &str) -> String {
    format!("results:{session_id}")
}

/// Session hash key
pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CoreError::Codec(format!("missing field {name}")))
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
    field(fields, name)?
        .parse()
        .map_err(|_| CoreError::Codec(format!("invalid field {name}")))
}

fn flag(value: bool) -> String {
    (if value { "1" } else { "0" }).to_string()
}

// Source languages may carry the auto-detect sentinel (empty string);
// target languages are always concrete codes.
fn source_lang_field(fields: &HashMap<String, String>, name: &str) -> Result<LangCode> {
    let raw = field(fields, name)?;
    if raw.is_empty() {
        Ok(LangCode::auto())
    } else {
        LangCode::parse(raw)
    }
}

/// One audio segment handed to the STT worker pool.
///
/// Emitted by the gateway, consumed and acknowledged by exactly one worker.
/// `(session_id, segment_seq)` is the idempotency key end to end.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentJob {
    pub session_id: String,
    pub segment_seq: u64,
    /// Conversation epoch; bumped by start_over so stale results are
    /// distinguishable from the next utterance's.
    pub epoch: u64,
    /// Raw PCM s16le, 16 kHz mono
    pub audio: Vec<u8>,
    pub source_lang: LangCode,
    pub target_lang: LangCode,
    pub translation_enabled: bool,
    pub is_final: bool,
    pub ts: i64,
}

impl SegmentJob {
    /// `session_id || ":" || segment_seq`
    pub fn job_id(&self) -> String {
        format!("{}:{}", self.session_id, self.segment_seq)
    }

    /// Encode for a stream append
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("job_id".into(), self.job_id()),
            ("session_id".into(), self.session_id.clone()),
            ("segment_seq".into(), self.segment_seq.to_string()),
            ("epoch".into(), self.epoch.to_string()),
            ("audio_b64".into(), BASE64.encode(&self.audio)),
            (
                "sample_rate".into(),
                TARGET_SAMPLE_RATE.as_u32().to_string(),
            ),
            ("source_lang".into(), self.source_lang.to_string()),
            ("target_lang".into(), self.target_lang.to_string()),
            ("translation_enabled".into(), flag(self.translation_enabled)),
            ("is_final".into(), flag(self.is_final)),
            ("ts".into(), self.ts.to_string()),
        ]
    }

    /// Decode a consumed stream entry
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let audio = BASE64
            .decode(field(fields, "audio_b64")?)
            .map_err(|e| CoreError::Codec(format!("audio_b64: {e}")))?;

        Ok(Self {
            session_id: field(fields, "session_id")?.to_string(),
            segment_seq: parse_field(fields, "segment_seq")?,
            epoch: parse_field(fields, "epoch")?,
            audio,
            source_lang: source_lang_field(fields, "source_lang")?,
            target_lang: LangCode::parse(field(fields, "target_lang")?)?,
            translation_enabled: field(fields, "translation_enabled")? == "1",
            is_final: field(fields, "is_final")? == "1",
            ts: parse_field(fields, "ts")?,
        })
    }
}

/// A final transcript queued for translation
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationJob {
    pub session_id: String,
    pub segment_seq: u64,
    pub epoch: u64,
    pub text: String,
    pub source_lang: LangCode,
    pub target_lang: LangCode,
    pub ts: i64,
}

impl TranslationJob {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("session_id".into(), self.session_id.clone()),
            ("segment_seq".into(), self.segment_seq.to_string()),
            ("epoch".into(), self.epoch.to_string()),
            ("text".into(), self.text.clone()),
            ("source_lang".into(), self.source_lang.to_string()),
            ("target_lang".into(), self.target_lang.to_string()),
            ("ts".into(), self.ts.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            session_id: field(fields, "session_id")?.to_string(),
            segment_seq: parse_field(fields, "segment_seq")?,
            epoch: parse_field(fields, "epoch")?,
            text: field(fields, "text")?.to_string(),
            source_lang: LangCode::parse(field(fields, "source_lang")?)?,
            target_lang: LangCode::parse(field(fields, "target_lang")?)?,
            ts: parse_field(fields, "ts")?,
        })
    }
}

/// A transcription or translation result published on the session channel.
///
/// Partials may be superseded; a final seals its `segment_seq`. A later
/// translation result replaces the transcription-only final for the same
/// seq in the client's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub session_id: String,
    pub segment_seq: u64,
    pub epoch: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    pub is_final: bool,
    /// When the worker published
    pub ts: i64,
}

impl ResultMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Codec(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CoreError::Codec(e.to_string()))
    }
}

/// Coarse session state persisted to the broker hash.
///
/// This is the shared truth a replacement gateway reads on reattach. Audio
/// buffers are deliberately not here; pre-roll and the active utterance are
/// transient.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub source_lang: LangCode,
    pub target_lang: LangCode,
    pub segment_seq: u64,
    pub epoch: u64,
    /// Speech state name, for observability
    pub speech_state: String,
    pub updated_ts: i64,
}

impl SessionRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("session_id".into(), self.session_id.clone()),
            ("source_lang".into(), self.source_lang.to_string()),
            ("target_lang".into(), self.target_lang.to_string()),
            ("segment_seq".into(), self.segment_seq.to_string()),
            ("epoch".into(), self.epoch.to_string()),
            ("speech_state".into(), self.speech_state.clone()),
            ("updated_ts".into(), self.updated_ts.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            session_id: field(fields, "session_id")?.to_string(),
            source_lang: source_lang_field(fields, "source_lang")?,
            target_lang: LangCode::parse(field(fields, "target_lang")?)?,
            segment_seq: parse_field(fields, "segment_seq")?,
            epoch: parse_field(fields, "epoch")?,
            speech_state: field(fields, "speech_state")?.to_string(),
            updated_ts: parse_field(fields, "updated_ts")?,
        })
    }
}
