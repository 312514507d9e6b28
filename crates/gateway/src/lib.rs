//! Audio gateway
//!
//! Terminates client WebSockets, segments speech with pre-roll and silence
//! semantics, publishes segment jobs to the broker, and fans results back
//! out to the right socket in order.

pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod segmenter;
pub mod session;
pub mod state;
pub mod websocket;

pub use http::{create_health_router, create_router};
pub use pipeline::{ResumeState, SessionEvent, SessionTask};
pub use router::{spawn_result_forwarder, DropReason, ResultRouter, Verdict};
pub use segmenter::{FinalReason, PreRollRing, SegmentEvent, Segmenter, SegmenterSettings, SpeechState};
pub use session::{SessionHandle, SessionManager};
pub use state::AppState;
pub use websocket::{parse_binary_frame, ClientMessage, ServerMessage, WebSocketHandler};

use thiserror::Error;

use voxstream_broker::BrokerError;
use voxstream_config::Settings;
use voxstream_core::CoreError;
use voxstream_vad::{EnergyVad, NeuralVad, NeuralVadConfig, VadEngine};

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session error: {0}")]
    Session(String),

    #[error("max sessions reached")]
    Capacity,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("vad error: {0}")]
    Vad(#[from] voxstream_vad::VadError),
}

/// Build the fused detector pair from settings
pub fn build_vad(settings: &Settings) -> Result<VadEngine, voxstream_vad::VadError> {
    let gate = EnergyVad::new(settings.vad.aggressiveness);
    let scorer = NeuralVad::new(NeuralVadConfig {
        model_path: settings.vad.model_path.clone(),
        ..NeuralVadConfig::default()
    })?;
    Ok(VadEngine::new(
        Box::new(gate),
        Box::new(scorer),
        settings.vad.threshold,
    ))
}
