//! Per-session dispatch pipeline
//!
//! Each live socket runs one `SessionTask` consuming a single merged inbox:
//! decoded audio from the read loop, control frames, broker results from the
//! subscriber, and shutdown. All session state lives inside the task, so
//! nothing here is shared or locked.
//!
//! Flow control: at most one partial job in flight per session. A due
//! partial is skipped while the counter is up and retried when a result
//! settles it. A due final waits up to ACK_WAIT for the counter to drop,
//! then abandons the stragglers and forces through.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use voxstream_broker::{with_backoff, Broker};
use voxstream_config::Settings;
use voxstream_core::{
    f32_to_pcm16, now_ms, pcm16_to_f32, session_key, LangCode, ResultMessage, SampleRate,
    SegmentJob, SessionRecord, StreamResampler, AUDIO_JOBS_STREAM, FRAME_SAMPLES,
};
use voxstream_vad::VadEngine;

use crate::metrics;
use crate::router::{ResultRouter, Verdict};
use crate::segmenter::{FinalReason, SegmentEvent, Segmenter, SegmenterSettings};
use crate::websocket::{ClientMessage, ServerMessage};

/// Grace period for draining results after the socket closes
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

/// Everything a session task can receive
#[derive(Debug)]
pub enum SessionEvent {
    /// One decoded binary frame from the socket
    Audio { rate: SampleRate, pcm: Vec<u8> },
    /// A parsed client text frame
    Control(ClientMessage),
    /// A result from the session's broker subscription
    Result(ResultMessage),
    /// Socket closed or the session was garbage-collected
    Shutdown,
}

/// State carried across a gateway handover, read from the session hash
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub source_lang: Option<LangCode>,
    pub target_lang: Option<LangCode>,
    pub segment_seq: u64,
    pub epoch: u64,
}

impl From<SessionRecord> for ResumeState {
    fn from(record: SessionRecord) -> Self {
        Self {
            source_lang: Some(record.source_lang),
            target_lang: Some(record.target_lang),
            segment_seq: record.segment_seq,
            epoch: record.epoch,
        }
    }
}

struct PendingFinal {
    audio: Vec<u8>,
    deadline: Instant,
}

/// Resolve a configured default language; empty means auto-detect
fn configured_lang(code: &str) -> LangCode {
    let code = code.trim();
    if code.is_empty() {
        return LangCode::auto();
    }
    LangCode::parse(code).unwrap_or_else(|_| {
        tracing::warn!(code, "invalid configured language, falling back to auto-detect");
        LangCode::auto()
    })
}

/// One session's pipeline task
pub struct SessionTask {
    id: String,
    settings: Arc<Settings>,
    broker: Arc<dyn Broker>,
    inbox: mpsc::Receiver<SessionEvent>,
    outbound: mpsc::Sender<ServerMessage>,
    vad: VadEngine,
    segmenter: Segmenter,
    router: ResultRouter,
    resampler: Option<StreamResampler>,
    sample_carry: Vec<f32>,
    source_lang: LangCode,
    target_lang: LangCode,
    segment_seq: u64,
    epoch: u64,
    partial_pending: bool,
    backpressure_notified: bool,
    pending_final: Option<PendingFinal>,
    closing: bool,
}

impl SessionTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        settings: Arc<Settings>,
        broker: Arc<dyn Broker>,
        inbox: mpsc::Receiver<SessionEvent>,
        outbound: mpsc::Sender<ServerMessage>,
        vad: VadEngine,
        resume: ResumeState,
    ) -> Self {
        let default_source = configured_lang(&settings.gateway.default_source_lang);
        let default_target = match settings.gateway.default_target_lang.trim() {
            // Unset target means transcription-only
            "" => default_source.clone(),
            code => LangCode::parse(code).unwrap_or_else(|_| default_source.clone()),
        };

        let segmenter = Segmenter::new(SegmenterSettings::from_config(&settings.segmenter));

        Self {
            segmenter,
            router: ResultRouter::new(resume.epoch),
            source_lang: resume.source_lang.unwrap_or(default_source),
            target_lang: resume.target_lang.unwrap_or(default_target),
            segment_seq: resume.segment_seq,
            epoch: resume.epoch,
            id,
            settings,
            broker,
            inbox,
            outbound,
            vad,
            resampler: None,
            sample_carry: Vec::new(),
            partial_pending: false,
            backpressure_notified: false,
            pending_final: None,
            closing: false,
        }
    }

    pub fn translation_enabled(&self) -> bool {
        self.source_lang != self.target_lang
    }

    /// Run until the socket closes; consumes the task
    pub async fn run(mut self) {
        self.send_status().await;
        self.persist_session().await;

        loop {
            let event = match self.pending_final.as_ref().map(|p| p.deadline) {
                Some(deadline) => tokio::select! {
                    event = self.inbox.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        // ACK_WAIT expired: the in-flight partials are
                        // written off and the final goes out anyway
                        if let Some(pending) = self.pending_final.take() {
                            self.publish_final(pending.audio).await;
                        }
                        continue;
                    }
                },
                None => self.inbox.recv().await,
            };

            let Some(event) = event else { break };
            self.handle_event(event).await;

            if self.closing {
                break;
            }
        }

        self.teardown().await;
        tracing::info!(session_id = %self.id, "session task finished");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio { rate, pcm } => self.on_audio(rate, pcm).await,
            SessionEvent::Control(msg) => self.on_control(msg).await,
            SessionEvent::Result(msg) => self.on_result(msg).await,
            SessionEvent::Shutdown => self.on_shutdown().await,
        }
    }

    async fn on_audio(&mut self, rate: SampleRate, pcm: Vec<u8>) {
        if self.closing {
            return;
        }

        let rebuild = match &self.resampler {
            Some(rs) => rs.source_rate() != rate,
            None => true,
        };
        if rebuild {
            match StreamResampler::new(rate) {
                Ok(rs) => self.resampler = Some(rs),
                Err(err) => {
                    tracing::warn!(session_id = %self.id, error = %err, "resampler init failed, frame dropped");
                    return;
                }
            }
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        let samples = match resampler.process(&pcm16_to_f32(&pcm)) {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "resample failed, frame dropped");
                return;
            }
        };

        self.feed_samples(&samples).await;
    }

    /// Chunk 16 kHz samples into VAD frames and drive the segmenter
    async fn feed_samples(&mut self, samples: &[f32]) {
        self.sample_carry.extend_from_slice(samples);

        let mut offset = 0;
        while self.sample_carry.len() - offset >= FRAME_SAMPLES {
            let frame: Vec<f32> = self.sample_carry[offset..offset + FRAME_SAMPLES].to_vec();
            offset += FRAME_SAMPLES;

            let is_speech = match self.vad.classify(&frame) {
                Ok(is_speech) => is_speech,
                Err(err) => {
                    tracing::warn!(session_id = %self.id, error = %err, "vad failed, frame treated as silence");
                    false
                }
            };

            let bytes = f32_to_pcm16(&frame);
            if let Some(event) = self.segmenter.push_frame(&bytes, is_speech) {
                self.on_segment_event(event).await;
            }
        }
        self.sample_carry.drain(..offset);
    }

    async fn on_segment_event(&mut self, event: SegmentEvent) {
        match event {
            SegmentEvent::PartialDue => self.try_emit_partial().await,
            SegmentEvent::FinalDue(reason) => self.emit_final(reason).await,
        }
    }

    /// Partials are best-effort: skipped while a job is in flight or the
    /// queue is deep, retried when the situation clears.
    async fn try_emit_partial(&mut self) {
        if self.router.jobs_in_flight() > 0 {
            self.partial_pending = true;
            return;
        }

        match self.broker.stream_len(AUDIO_JOBS_STREAM).await {
            Ok(depth) if depth > self.settings.flow.max_queue_depth => {
                metrics::record_backpressure();
                if !self.backpressure_notified {
                    self.backpressure_notified = true;
                    self.send(ServerMessage::Error {
                        message: "transcription backlog, partial results paused".to_string(),
                    })
                    .await;
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "queue depth check failed, partial skipped");
                return;
            }
        }

        let audio = self.segmenter.take_partial();
        self.partial_pending = false;
        self.backpressure_notified = false;
        if audio.is_empty() {
            // Stale pending marker from an utterance that already finalized
            return;
        }
        self.publish_job(audio, false).await;
    }

    async fn emit_final(&mut self, reason: FinalReason) {
        // A second utterance finished inside ACK_WAIT: force the first
        // final out before handling this one
        if let Some(pending) = self.pending_final.take() {
            self.publish_final(pending.audio).await;
        }

        let audio = self.segmenter.take_final();
        self.partial_pending = false;
        if audio.is_empty() {
            return;
        }

        tracing::debug!(
            session_id = %self.id,
            bytes = audio.len(),
            reason = ?reason,
            "utterance complete"
        );

        if self.router.jobs_in_flight() == 0 {
            self.publish_final(audio).await;
        } else {
            // Finals are never skipped; wait for the counter, bounded
            self.pending_final = Some(PendingFinal {
                audio,
                deadline: Instant::now()
                    + Duration::from_millis(self.settings.flow.ack_wait_ms),
            });
        }
    }

    async fn publish_final(&mut self, audio: Vec<u8>) {
        self.router.abandon_below(self.segment_seq + 1);
        self.publish_job(audio, true).await;
    }

    async fn publish_job(&mut self, audio: Vec<u8>, is_final: bool) {
        self.segment_seq += 1;
        let job = SegmentJob {
            session_id: self.id.clone(),
            segment_seq: self.segment_seq,
            epoch: self.epoch,
            audio,
            source_lang: self.source_lang.clone(),
            target_lang: self.target_lang.clone(),
            translation_enabled: self.translation_enabled(),
            is_final,
            ts: now_ms(),
        };

        let fields = job.to_fields();
        let broker = self.broker.clone();
        let deadline = Duration::from_millis(self.settings.flow.publish_deadline_ms);
        let result = with_backoff(deadline, "append segment job", || {
            let broker = broker.clone();
            let fields = fields.clone();
            async move { broker.append(AUDIO_JOBS_STREAM, &fields).await }
        })
        .await;

        match result {
            Ok(_) => {
                self.router.note_job(job.segment_seq, is_final);
                metrics::record_segment(is_final);
                tracing::debug!(
                    session_id = %self.id,
                    segment_seq = job.segment_seq,
                    is_final,
                    "segment job published"
                );
                if is_final {
                    self.persist_session().await;
                }
            }
            Err(err) => {
                // Retries are exhausted: the segment is dropped. Finals are
                // reported to the client; the session stays up.
                tracing::error!(session_id = %self.id, error = %err, is_final, "segment publish failed");
                self.segment_seq -= 1;
                if is_final {
                    self.send(ServerMessage::Error {
                        message: "failed to submit segment for transcription".to_string(),
                    })
                    .await;
                }
            }
        }
    }

    async fn on_result(&mut self, msg: ResultMessage) {
        match self.router.on_result(&msg) {
            Verdict::Drop(reason) => {
                metrics::record_result_dropped(reason);
                tracing::debug!(
                    session_id = %self.id,
                    segment_seq = msg.segment_seq,
                    reason = ?reason,
                    "result dropped"
                );
            }
            Verdict::Forward { utterance_end } => {
                metrics::record_result_forwarded();
                let timestamp = now_ms();
                self.send(ServerMessage::Realtime {
                    text: msg.text,
                    translation: msg.translation,
                    is_final: msg.is_final,
                    client_id: self.id.clone(),
                    timestamp,
                    segment_id: msg.segment_seq,
                })
                .await;
                if utterance_end {
                    self.send(ServerMessage::UtteranceEnd {
                        client_id: self.id.clone(),
                        timestamp,
                    })
                    .await;
                }
            }
        }

        if self.router.jobs_in_flight() == 0 {
            if let Some(pending) = self.pending_final.take() {
                self.publish_final(pending.audio).await;
            } else if self.partial_pending {
                self.partial_pending = false;
                self.try_emit_partial().await;
            }
        }
    }

    async fn on_control(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::SetLangs {
                source_language,
                target_language,
            } => {
                let parsed = LangCode::parse(&source_language)
                    .and_then(|s| LangCode::parse(&target_language).map(|t| (s, t)));
                let (source, target) = match parsed {
                    Ok(pair) => pair,
                    Err(_) => {
                        self.send(ServerMessage::Error {
                            message: format!(
                                "unknown language: {source_language}/{target_language}"
                            ),
                        })
                        .await;
                        return;
                    }
                };

                let whitelist = self.settings.languages();
                if !whitelist.iter().any(|l| l == source.as_str())
                    || !whitelist.iter().any(|l| l == target.as_str())
                {
                    self.send(ServerMessage::Error {
                        message: format!("unknown language: {source}/{target}"),
                    })
                    .await;
                    return;
                }

                // In-flight jobs keep the languages they were tagged with
                self.source_lang = source;
                self.target_lang = target;
                tracing::info!(
                    session_id = %self.id,
                    source = %self.source_lang,
                    target = %self.target_lang,
                    "languages updated"
                );
                self.persist_session().await;
                self.send_status().await;
            }

            ClientMessage::StartOver => {
                self.epoch += 1;
                self.segment_seq = 0;
                self.router.start_epoch(self.epoch);
                self.segmenter.start_over();
                self.vad.reset();
                self.sample_carry.clear();
                self.partial_pending = false;
                self.backpressure_notified = false;
                self.pending_final = None;
                tracing::info!(session_id = %self.id, epoch = self.epoch, "session reset");
                self.persist_session().await;
            }

            ClientMessage::GetStatus => self.send_status().await,
        }
    }

    async fn on_shutdown(&mut self) {
        self.closing = true;

        // Push the resampler tail through so the utterance end is not lost
        if let Some(resampler) = self.resampler.as_mut() {
            if let Ok(tail) = resampler.flush() {
                if !tail.is_empty() {
                    self.feed_samples(&tail).await;
                }
            }
        }

        if let Some(pending) = self.pending_final.take() {
            self.publish_final(pending.audio).await;
        }
        if let Some(audio) = self.segmenter.flush_on_close() {
            self.publish_final(audio).await;
        }

        // Bounded drain: forward whatever results land inside the grace
        // period, then let the hash TTL take over
        let deadline = Instant::now() + CLOSE_DRAIN;
        while self.router.jobs_in_flight() > 0 {
            let event = tokio::select! {
                event = self.inbox.recv() => event,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match event {
                Some(SessionEvent::Result(msg)) => self.on_result(msg).await,
                Some(_) => continue,
                None => break,
            }
        }
    }

    async fn teardown(&mut self) {
        self.persist_session().await;
    }

    async fn send_status(&mut self) {
        let status = ServerMessage::Status {
            client_id: self.id.clone(),
            source_language: self.source_lang.to_string(),
            target_language: self.target_lang.to_string(),
            translation_enabled: self.translation_enabled(),
        };
        self.send(status).await;
    }

    async fn send(&mut self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            // Write loop is gone; the read loop will deliver Shutdown
            tracing::debug!(session_id = %self.id, "outbound channel closed");
        }
    }

    /// Coarse state flush to the session hash; the TTL outlives the socket
    async fn persist_session(&mut self) {
        let record = SessionRecord {
            session_id: self.id.clone(),
            source_lang: self.source_lang.clone(),
            target_lang: self.target_lang.clone(),
            segment_seq: self.segment_seq,
            epoch: self.epoch,
            speech_state: self.segmenter.state().as_str().to_string(),
            updated_ts: now_ms(),
        };

        let key = session_key(&self.id);
        let fields = record.to_fields();
        let ttl = self.settings.gateway.session_ttl_ms;
        if let Err(err) = self.broker.session_set(&key, &fields, ttl).await {
            tracing::warn!(session_id = %self.id, error = %err, "session hash write failed");
        }
    }
}
