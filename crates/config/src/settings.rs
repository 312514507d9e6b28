//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Runtime environment enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - relaxed validation, warnings only
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings, shared by gateway and workers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Gateway listener and session limits
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Broker endpoint and consume tuning
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Detector tuning
    #[serde(default)]
    pub vad: VadConfig,

    /// Speech segmentation thresholds
    #[serde(default)]
    pub segmenter: SegmenterConfig,

    /// Flow control and deadlines
    #[serde(default)]
    pub flow: FlowConfig,

    /// Worker-only options
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// WebSocket listener port
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Health/metrics listener port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Accepted language codes
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,

    /// Default source language for new sessions; empty means auto-detect
    #[serde(default = "default_source_lang")]
    pub default_source_lang: String,

    /// Default target language for new sessions; empty means same as source
    #[serde(default = "default_target_lang")]
    pub default_target_lang: String,

    /// Socket idle timeout before the session is garbage-collected
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Session hash TTL; must exceed the idle timeout so reattachment is
    /// always possible
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Optional shared-secret token checked as a `?token=` query parameter.
    /// Empty disables the check.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
}

fn default_gateway_port() -> u16 {
    env_parse("GATEWAY_PORT", 8080)
}

fn default_health_port() -> u16 {
    env_parse("HEALTH_PORT", 8081)
}

fn default_languages() -> Vec<String> {
    std::env::var("LANGUAGES")
        .map(|s| s.split(',').map(|l| l.trim().to_lowercase()).collect())
        .unwrap_or_else(|_| {
            ["en", "vi", "hi", "es", "fr", "de", "ja", "ko", "zh"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
}

fn default_source_lang() -> String {
    std::env::var("DEFAULT_SOURCE_LANG").unwrap_or_else(|_| "en".to_string())
}

fn default_target_lang() -> String {
    std::env::var("DEFAULT_TARGET_LANG").unwrap_or_else(|_| default_source_lang())
}

fn default_idle_timeout_ms() -> u64 {
    env_parse("IDLE_TIMEOUT_MS", 300_000)
}

fn default_session_ttl_ms() -> u64 {
    env_parse("SESSION_TTL_MS", 900_000)
}

fn default_max_sessions() -> usize {
    env_parse("MAX_SESSIONS", 512)
}

fn default_auth_token() -> String {
    std::env::var("AUTH_TOKEN").unwrap_or_default()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            health_port: default_health_port(),
            languages: default_languages(),
            default_source_lang: default_source_lang(),
            default_target_lang: default_target_lang(),
            idle_timeout_ms: default_idle_timeout_ms(),
            session_ttl_ms: default_session_ttl_ms(),
            max_sessions: default_max_sessions(),
            auth_token: default_auth_token(),
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker endpoint, e.g. `redis://127.0.0.1:6379`
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Blocking consume window for worker loops
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
}

fn default_broker_url() -> String {
    std::env::var("BROKER_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_block_ms() -> u64 {
    env_parse("BLOCK_MS", 1000)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            block_ms: default_block_ms(),
        }
    }
}

/// Detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Detector A aggressiveness, 0 (lenient) to 3 (strict)
    #[serde(default = "default_vad_a_aggr")]
    pub aggressiveness: u8,

    /// Detector B speech-probability threshold
    #[serde(default = "default_vad_b_threshold")]
    pub threshold: f32,

    /// Path to the neural detector's ONNX model, when the feature is on
    #[serde(default = "default_vad_model_path")]
    pub model_path: String,
}

fn default_vad_a_aggr() -> u8 {
    env_parse("VAD_A_AGGR", 2)
}

fn default_vad_b_threshold() -> f32 {
    env_parse("VAD_B_THRESHOLD", 0.5)
}

fn default_vad_model_path() -> String {
    std::env::var("VAD_MODEL_PATH").unwrap_or_else(|_| "models/vad.onnx".to_string())
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: default_vad_a_aggr(),
            threshold: default_vad_b_threshold(),
            model_path: default_vad_model_path(),
        }
    }
}

/// Speech segmentation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Trailing silence before a final is emitted
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,

    /// Pre-speech buffer length
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u64,

    /// Forced-flush threshold for a single utterance
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,

    /// Minimum span of new audio between partial emissions
    #[serde(default = "default_stream_chunk_ms")]
    pub stream_chunk_ms: u64,
}

fn default_silence_threshold_ms() -> u64 {
    env_parse("SILENCE_THRESHOLD_MS", 2000)
}

fn default_pre_roll_ms() -> u64 {
    env_parse("PRE_ROLL_MS", 1000)
}

fn default_max_buffer_ms() -> u64 {
    env_parse("MAX_BUFFER_MS", 30_000)
}

fn default_stream_chunk_ms() -> u64 {
    env_parse("STREAM_CHUNK_MS", 800)
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            pre_roll_ms: default_pre_roll_ms(),
            max_buffer_ms: default_max_buffer_ms(),
            stream_chunk_ms: default_stream_chunk_ms(),
        }
    }
}

/// Flow control and deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How long a final waits for in-flight partials before forcing through
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,

    /// Hard timeout on one transcribe/translate call
    #[serde(default = "default_model_deadline_ms")]
    pub model_deadline_ms: u64,

    /// Retry budget for publishing one result/job
    #[serde(default = "default_publish_deadline_ms")]
    pub publish_deadline_ms: u64,

    /// Backpressure threshold on the audio_jobs stream
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u64,
}

fn default_ack_wait_ms() -> u64 {
    env_parse("ACK_WAIT_MS", 4000)
}

fn default_model_deadline_ms() -> u64 {
    env_parse("MODEL_DEADLINE_MS", 10_000)
}

fn default_publish_deadline_ms() -> u64 {
    env_parse("PUBLISH_DEADLINE_MS", 5000)
}

fn default_max_queue_depth() -> u64 {
    env_parse("MAX_QUEUE_DEPTH", 64)
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ack_wait_ms: default_ack_wait_ms(),
            model_deadline_ms: default_model_deadline_ms(),
            publish_deadline_ms: default_publish_deadline_ms(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Worker-only options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Entries accumulated before one model invocation
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// How long to wait for a batch to fill
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,

    /// Consumer group for STT workers
    #[serde(default = "default_stt_group")]
    pub stt_group: String,

    /// Consumer group for translation workers
    #[serde(default = "default_translate_group")]
    pub translate_group: String,

    /// Transcriber model identifier (or sidecar URL for the HTTP backend)
    #[serde(default = "default_stt_model")]
    pub stt_model: String,

    /// Translator model identifier (or sidecar URL for the HTTP backend)
    #[serde(default = "default_translate_model")]
    pub translate_model: String,

    /// Device hint passed to model backends ("cpu", "cuda:0", ...)
    #[serde(default = "default_device")]
    pub device: String,

    /// Translation LRU cache capacity
    #[serde(default = "default_translation_cache")]
    pub translation_cache: usize,
}

fn default_batch_max() -> usize {
    env_parse("BATCH_MAX", 4)
}

fn default_batch_wait_ms() -> u64 {
    env_parse("BATCH_WAIT_MS", 50)
}

fn default_stt_group() -> String {
    "stt-workers".to_string()
}

fn default_translate_group() -> String {
    "translate-workers".to_string()
}

fn default_stt_model() -> String {
    std::env::var("STT_MODEL").unwrap_or_else(|_| "stub".to_string())
}

fn default_translate_model() -> String {
    std::env::var("TRANSLATE_MODEL").unwrap_or_else(|_| "stub".to_string())
}

fn default_device() -> String {
    std::env::var("DEVICE").unwrap_or_else(|_| "cpu".to_string())
}

fn default_translation_cache() -> usize {
    env_parse("TRANSLATION_CACHE", 1024)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_max: default_batch_max(),
            batch_wait_ms: default_batch_wait_ms(),
            stt_group: default_stt_group(),
            translate_group: default_translate_group(),
            stt_model: default_stt_model(),
            translate_model: default_translate_model(),
            device: default_device(),
            translation_cache: default_translation_cache(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vad.aggressiveness > 3 {
            return Err(ConfigError::InvalidValue {
                field: "vad.aggressiveness".to_string(),
                message: format!("must be 0-3, got {}", self.vad.aggressiveness),
            });
        }

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.threshold".to_string(),
                message: format!("must be between 0.0 and 1.0, got {}", self.vad.threshold),
            });
        }

        if self.segmenter.stream_chunk_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.stream_chunk_ms".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        if self.segmenter.max_buffer_ms <= self.segmenter.stream_chunk_ms {
            return Err(ConfigError::InvalidValue {
                field: "segmenter.max_buffer_ms".to_string(),
                message: "must exceed stream_chunk_ms".to_string(),
            });
        }

        // Reattachment depends on the hash outliving the socket
        if self.gateway.session_ttl_ms <= self.gateway.idle_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "gateway.session_ttl_ms".to_string(),
                message: "must exceed gateway.idle_timeout_ms".to_string(),
            });
        }

        if self.worker.batch_max == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.batch_max".to_string(),
                message: "must be >= 1".to_string(),
            });
        }

        if self.languages().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "gateway.languages".to_string(),
                message: "whitelist cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Accepted language codes
    pub fn languages(&self) -> &[String] {
        &self.gateway.languages
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. `VOXSTREAM__`-prefixed environment variables
/// 2. config/{env} (if env specified)
/// 3. config/default
/// 4. Flat environment variables / built-in defaults
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOXSTREAM")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
