//! Model capability traits
//!
//! Transcription and translation are black-box callables behind narrow
//! interfaces, so workers can run a stub in tests, an HTTP sidecar in
//! production, or an in-process model without touching the job loops.

use async_trait::async_trait;

use crate::error::Result;
use crate::language::LangCode;

/// Output of one transcription call
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    /// Language the model auto-detected, if it reports one
    pub detected_lang: Option<LangCode>,
}

/// Speech-to-text interface
///
/// Contract: returns within the configured model deadline or errors; pure
/// function of its inputs modulo model state.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe a span of 16 kHz mono PCM16 audio.
    ///
    /// `source_lang` is a hint; `None` asks the model to detect.
    async fn transcribe(
        &self,
        audio_pcm: &[u8],
        source_lang: Option<&LangCode>,
    ) -> Result<Transcription>;

    /// Model name for logging
    fn model_name(&self) -> &str;
}

/// Text translation interface
///
/// Same deadline/purity contract as [`Transcriber`].
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    async fn translate(
        &self,
        text: &str,
        source_lang: &LangCode,
        target_lang: &LangCode,
    ) -> Result<String>;

    /// Model name for logging
    fn model_name(&self) -> &str;
}
