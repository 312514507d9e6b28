//! WebSocket termination
//!
//! One socket, one session. Binary frames (client -> server) carry audio:
//! ```text
//! [ 4 bytes LE u32: metadata length M ]
//! [ M bytes UTF-8 JSON: { "sampleRate": <int Hz> } ]
//! [ remaining bytes: raw PCM s16le mono ]
//! ```
//!
//! Text frames are JSON objects distinguished by `type` in both directions.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use voxstream_core::{session_key, CoreError, SampleRate, SessionRecord};

use crate::pipeline::{ResumeState, SessionEvent, SessionTask};
use crate::router::spawn_result_forwarder;
use crate::state::AppState;
use crate::{build_vad, metrics};

/// Client -> server text frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Update session languages; applies to subsequent segments only
    SetLangs {
        source_language: String,
        target_language: String,
    },
    /// Discard buffers and in-flight work, bump the epoch
    StartOver,
    /// Ask for a session snapshot
    GetStatus,
}

/// Server -> client text frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session snapshot; sent on connect and after set_langs
    Status {
        client_id: String,
        source_language: String,
        target_language: String,
        translation_enabled: bool,
    },
    /// Partial or final transcription; `translation` rides on finals when
    /// translation is enabled
    Realtime {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        translation: Option<String>,
        is_final: bool,
        client_id: String,
        timestamp: i64,
        segment_id: u64,
    },
    /// The last final of an utterance has been forwarded
    UtteranceEnd { client_id: String, timestamp: i64 },
    /// Soft failure; the socket stays open
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct AudioMeta {
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
}

/// Decode one binary audio frame into (declared rate, PCM bytes)
pub fn parse_binary_frame(data: &[u8]) -> Result<(SampleRate, Vec<u8>), CoreError> {
    if data.len() < 4 {
        return Err(CoreError::MalformedFrame("frame shorter than header".into()));
    }
    let meta_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let pcm_start = 4 + meta_len;
    if data.len() < pcm_start {
        return Err(CoreError::MalformedFrame(format!(
            "metadata length {meta_len} exceeds frame"
        )));
    }

    let meta: AudioMeta = serde_json::from_slice(&data[4..pcm_start])
        .map_err(|e| CoreError::MalformedFrame(format!("metadata: {e}")))?;
    let rate = SampleRate::from_hz(meta.sample_rate)?;

    Ok((rate, data[pcm_start..].to_vec()))
}

/// Connection query parameters
#[derive(Debug, Deserialize, Default)]
pub struct ConnectParams {
    /// Optional shared-secret token
    pub token: Option<String>,
    /// Reattach to a persisted session after gateway failover
    pub session_id: Option<String>,
}

/// WebSocket handler
pub struct WebSocketHandler;

impl WebSocketHandler {
    /// Handle the WebSocket upgrade
    pub async fn handle(
        ws: WebSocketUpgrade,
        Query(params): Query<ConnectParams>,
        State(state): State<AppState>,
    ) -> Result<Response, StatusCode> {
        let expected = &state.settings.gateway.auth_token;
        if !expected.is_empty() && params.token.as_deref() != Some(expected.as_str()) {
            return Err(StatusCode::UNAUTHORIZED);
        }

        Ok(ws.on_upgrade(move |socket| Self::handle_socket(socket, state, params)))
    }

    async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
        let (mut sender, mut receiver) = socket.split();

        // Reattach by id when a hash survives from a previous gateway;
        // otherwise mint a fresh session
        let (session_id, resume) = match params.session_id {
            Some(id) => match state.broker.session_get(&session_key(&id)).await {
                Ok(Some(fields)) => match SessionRecord::from_fields(&fields) {
                    Ok(record) => {
                        tracing::info!(session_id = %id, "session reattached from hash");
                        (id, ResumeState::from(record))
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %id, error = %err, "unreadable session hash, starting fresh");
                        (id, ResumeState::default())
                    }
                },
                _ => (id, ResumeState::default()),
            },
            None => (uuid::Uuid::new_v4().to_string(), ResumeState::default()),
        };

        let vad = match build_vad(&state.settings) {
            Ok(vad) => vad,
            Err(err) => {
                tracing::error!(error = %err, "vad init failed, refusing session");
                let _ = Self::send_json(
                    &mut sender,
                    &ServerMessage::Error {
                        message: "detector initialization failed".to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let (inbox_tx, inbox_rx) = mpsc::channel::<SessionEvent>(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(64);

        let handle = match state.sessions.register(&session_id, inbox_tx.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "session refused");
                let _ = Self::send_json(
                    &mut sender,
                    &ServerMessage::Error {
                        message: "gateway at capacity".to_string(),
                    },
                )
                .await;
                return;
            }
        };
        metrics::record_sessions(state.sessions.count());

        // Result fan-in from the broker (unsubscribes when the session ends)
        let forwarder = spawn_result_forwarder(
            state.broker.clone(),
            session_id.clone(),
            inbox_tx.clone(),
            Duration::from_millis(state.settings.gateway.session_ttl_ms),
        );

        // Read loop keeps its own handle for protocol-violation replies
        let outbound_err = outbound_tx.clone();

        let task = SessionTask::new(
            session_id.clone(),
            state.settings.clone(),
            state.broker.clone(),
            inbox_rx,
            outbound_tx,
            vad,
            resume,
        );
        let session = tokio::spawn(task.run());

        // Write loop: session outbound -> socket
        let writer_session_id = session_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if Self::send_json(&mut sender, &msg).await.is_err() {
                    tracing::debug!(session_id = %writer_session_id, "socket write failed");
                    break;
                }
            }
        });

        // Read loop: socket -> session inbox
        while let Some(frame) = receiver.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(session_id = %session_id, error = %err, "socket read failed");
                    break;
                }
            };

            match frame {
                Message::Binary(data) => {
                    handle.touch();
                    match parse_binary_frame(&data) {
                        Ok((rate, pcm)) => {
                            if inbox_tx
                                .send(SessionEvent::Audio { rate, pcm })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        // Malformed header: the frame is dropped, not the session
                        Err(err) => {
                            tracing::debug!(session_id = %session_id, error = %err, "audio frame dropped")
                        }
                    }
                }
                Message::Text(text) => {
                    handle.touch();
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => {
                            if inbox_tx.send(SessionEvent::Control(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(session_id = %session_id, error = %err, "malformed control frame");
                            let _ = outbound_err
                                .send(ServerMessage::Error {
                                    message: "malformed message".to_string(),
                                })
                                .await;
                        }
                    }
                }
                Message::Close(_) => break,
                // Pings are answered by the websocket layer
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }

        let _ = inbox_tx.send(SessionEvent::Shutdown).await;
        drop(inbox_tx);
        drop(outbound_err);

        let _ = session.await;
        forwarder.abort();
        let _ = writer.await;

        state.sessions.remove(&session_id);
        metrics::record_sessions(state.sessions.count());
    }

    async fn send_json(
        sender: &mut (impl SinkExt<Message> + Unpin),
        msg: &ServerMessage,
    ) -> Result<(), ()> {
        let text = serde_json::to_string(msg).map_err(|_| ())?;
        sender.send(Message::Text(text)).await.map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(meta: &str, pcm: &[u8]) -> Vec<u8> {
        let mut data = (meta.len() as u32).to_le_bytes().to_vec();
        data.extend_from_slice(meta.as_bytes());
        data.extend_from_slice(pcm);
        data
    }

    #[test]
    fn test_parse_binary_frame() {
        let data = frame_with(r#"{"sampleRate":16000}"#, &[1, 2, 3, 4]);
        let (rate, pcm) = parse_binary_frame(&data).unwrap();
        assert_eq!(rate, SampleRate::Hz16000);
        assert_eq!(pcm, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        assert!(parse_binary_frame(&[0, 0]).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_meta_len() {
        let mut data = 1000u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"{}");
        assert!(parse_binary_frame(&data).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_rate() {
        let data = frame_with(r#"{"sampleRate":12345}"#, &[]);
        assert!(parse_binary_frame(&data).is_err());
    }

    #[test]
    fn test_client_message_decoding() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_langs","source_language":"en","target_language":"vi"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetLangs {
                source_language: "en".into(),
                target_language: "vi".into()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"start_over"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartOver);
    }

    #[test]
    fn test_server_message_encoding() {
        let json = serde_json::to_string(&ServerMessage::Realtime {
            text: "hello".into(),
            translation: None,
            is_final: false,
            client_id: "c1".into(),
            timestamp: 42,
            segment_id: 3,
        })
        .unwrap();
        assert!(json.contains(r#""type":"realtime""#));
        assert!(!json.contains("translation"));

        let json = serde_json::to_string(&ServerMessage::UtteranceEnd {
            client_id: "c1".into(),
            timestamp: 42,
        })
        .unwrap();
        assert!(json.contains(r#""type":"utterance_end""#));
    }
}
