//! Model backends
//!
//! The job loops only see the `Transcriber`/`Translator` traits. Two
//! backends ship: a stub for tests and local bring-up, and an HTTP client
//! for a model sidecar service (inference runs out of process, typically
//! next to the accelerator).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use voxstream_core::{
    pcm16_duration_ms, CoreError, LangCode, Result, SampleRate, Transcriber, Transcription,
    Translator,
};

use crate::WorkerError;

/// Deterministic transcriber for tests and bring-up
pub struct StubTranscriber {
    text: String,
}

impl StubTranscriber {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for StubTranscriber {
    fn default() -> Self {
        Self::new("stub transcript")
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        audio_pcm: &[u8],
        source_lang: Option<&LangCode>,
    ) -> Result<Transcription> {
        let ms = pcm16_duration_ms(audio_pcm.len(), SampleRate::Hz16000);
        // With no hint, "detect" a fixed language so auto-detect callers
        // are exercisable
        let detected = match source_lang {
            Some(lang) => lang.clone(),
            None => LangCode::parse("en")?,
        };
        Ok(Transcription {
            text: format!("{} ({ms}ms)", self.text),
            detected_lang: Some(detected),
        })
    }

    fn model_name(&self) -> &str {
        "stub-stt"
    }
}

/// Deterministic translator for tests and bring-up
#[derive(Default)]
pub struct StubTranslator;

#[async_trait]
impl Translator for StubTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &LangCode,
        target_lang: &LangCode,
    ) -> Result<String> {
        Ok(format!("[{target_lang}] {text}"))
    }

    fn model_name(&self) -> &str {
        "stub-mt"
    }
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    audio_b64: String,
    source_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    detected_lang: Option<String>,
}

/// Transcriber backed by an HTTP model sidecar
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranscriber {
    /// Build the client and probe the sidecar's health endpoint.
    ///
    /// An unreachable sidecar is not fatal here; the first transcribe call
    /// will surface it and the poison-pill rule keeps the loop alive.
    pub async fn connect(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Model(format!("http client: {e}")))?;

        match client.get(format!("{base_url}/health")).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(url = %base_url, "stt sidecar connected");
            }
            Ok(resp) => {
                tracing::warn!(url = %base_url, status = %resp.status(), "stt sidecar unhealthy, proceeding anyway");
            }
            Err(err) => {
                tracing::warn!(url = %base_url, error = %err, "stt sidecar unreachable, will retry per request");
            }
        }

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        audio_pcm: &[u8],
        source_lang: Option<&LangCode>,
    ) -> Result<Transcription> {
        let request = TranscribeRequest {
            audio_b64: BASE64.encode(audio_pcm),
            // Empty string is the sidecar's auto-detect sentinel
            source_lang: source_lang.map(LangCode::as_str).unwrap_or(""),
        };

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Model(format!("stt sidecar: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Model(format!("stt sidecar: {e}")))?
            .json::<TranscribeResponse>()
            .await
            .map_err(|e| CoreError::Model(format!("stt sidecar response: {e}")))?;

        Ok(Transcription {
            text: response.text,
            detected_lang: response
                .detected_lang
                .as_deref()
                .and_then(|l| LangCode::parse(l).ok()),
        })
    }

    fn model_name(&self) -> &str {
        "http-stt"
    }
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    source_lang: &'a str,
    target_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translation: String,
}

/// Translator backed by an HTTP model sidecar
pub struct HttpTranslator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranslator {
    pub async fn connect(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Model(format!("http client: {e}")))?;

        match client.get(format!("{base_url}/health")).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(url = %base_url, "translation sidecar connected");
            }
            Ok(resp) => {
                tracing::warn!(url = %base_url, status = %resp.status(), "translation sidecar unhealthy, proceeding anyway");
            }
            Err(err) => {
                tracing::warn!(url = %base_url, error = %err, "translation sidecar unreachable, will retry per request");
            }
        }

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source_lang: &LangCode,
        target_lang: &LangCode,
    ) -> Result<String> {
        let request = TranslateRequest {
            text,
            source_lang: source_lang.as_str(),
            target_lang: target_lang.as_str(),
        };

        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Model(format!("translation sidecar: {e}")))?
            .error_for_status()
            .map_err(|e| CoreError::Model(format!("translation sidecar: {e}")))?
            .json::<TranslateResponse>()
            .await
            .map_err(|e| CoreError::Model(format!("translation sidecar response: {e}")))?;

        Ok(response.translation)
    }

    fn model_name(&self) -> &str {
        "http-mt"
    }
}

/// Build the transcriber named by `worker.stt_model`
pub async fn create_transcriber(
    cfg: &voxstream_config::WorkerConfig,
    deadline: Duration,
) -> std::result::Result<Arc<dyn Transcriber>, WorkerError> {
    match cfg.stt_model.as_str() {
        "stub" => Ok(Arc::new(StubTranscriber::default())),
        url if url.starts_with("http") => Ok(Arc::new(
            HttpTranscriber::connect(url, deadline)
                .await
                .map_err(|e| WorkerError::Model(e.to_string()))?,
        )),
        other => Err(WorkerError::Model(format!(
            "unknown transcriber backend: {other}"
        ))),
    }
}

/// Build the translator named by `worker.translate_model`
pub async fn create_translator(
    cfg: &voxstream_config::WorkerConfig,
    deadline: Duration,
) -> std::result::Result<Arc<dyn Translator>, WorkerError> {
    match cfg.translate_model.as_str() {
        "stub" => Ok(Arc::new(StubTranslator)),
        url if url.starts_with("http") => Ok(Arc::new(
            HttpTranslator::connect(url, deadline)
                .await
                .map_err(|e| WorkerError::Model(e.to_string()))?,
        )),
        other => Err(WorkerError::Model(format!(
            "unknown translator backend: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_transcriber_reports_duration() {
        let stt = StubTranscriber::new("hello");
        let lang = LangCode::parse("vi").unwrap();
        // 32000 bytes = 1s at 16kHz PCM16
        let result = stt
            .transcribe(&vec![0u8; 32000], Some(&lang))
            .await
            .unwrap();
        assert_eq!(result.text, "hello (1000ms)");
        assert_eq!(result.detected_lang.unwrap().as_str(), "vi");
    }

    #[tokio::test]
    async fn test_stub_transcriber_detects_without_hint() {
        let stt = StubTranscriber::new("hello");
        let result = stt.transcribe(&vec![0u8; 3200], None).await.unwrap();
        assert_eq!(result.detected_lang.unwrap().as_str(), "en");
    }

    #[tokio::test]
    async fn test_stub_translator_tags_target() {
        let mt = StubTranslator;
        let en = LangCode::parse("en").unwrap();
        let vi = LangCode::parse("vi").unwrap();
        let out = mt.translate("hello", &en, &vi).await.unwrap();
        assert_eq!(out, "[vi] hello");
    }
}
