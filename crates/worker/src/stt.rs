//! STT worker loop
//!
//! Drains `audio_jobs` through a named consumer group. Per entry: decode,
//! transcribe under the model deadline, publish the result on the session
//! channel, enqueue a translation job when a final wants one, then ack.
//!
//! A model failure publishes an empty final and acks anyway so one bad
//! segment cannot wedge the group (poison-pill rule). Work stranded on a
//! crashed peer is reclaimed on startup and then periodically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use voxstream_broker::{with_backoff, Broker, StreamEntry};
use voxstream_config::Settings;
use voxstream_core::{
    now_ms, results_channel, LangCode, ResultMessage, SegmentJob, Transcriber, TranslationJob,
    AUDIO_JOBS_STREAM, FINAL_TRANSCRIPTS_STREAM,
};

use crate::{metrics, WorkerError};

/// One STT worker process
pub struct SttWorker {
    settings: Arc<Settings>,
    broker: Arc<dyn Broker>,
    transcriber: Arc<dyn Transcriber>,
    consumer: String,
}

impl SttWorker {
    pub fn new(
        settings: Arc<Settings>,
        broker: Arc<dyn Broker>,
        transcriber: Arc<dyn Transcriber>,
        consumer: String,
    ) -> Self {
        Self {
            settings,
            broker,
            transcriber,
            consumer,
        }
    }

    /// Run until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let group = self.settings.worker.stt_group.clone();
        self.broker.ensure_group(AUDIO_JOBS_STREAM, &group).await?;

        tracing::info!(
            consumer = %self.consumer,
            group = %group,
            model = self.transcriber.model_name(),
            "stt worker started"
        );

        // Rescue work stranded by crashed peers before taking new entries
        self.reclaim(&group).await;
        let claim_interval = Duration::from_millis(self.settings.flow.ack_wait_ms);
        let mut next_claim = Instant::now() + claim_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                batch = self.collect_batch(&group) => batch,
                _ = shutdown.changed() => continue,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = %err, "consume failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            if !batch.is_empty() {
                self.process_batch(&group, batch).await;
            }

            if Instant::now() >= next_claim {
                self.reclaim(&group).await;
                next_claim = Instant::now() + claim_interval;
            }
        }

        tracing::info!(consumer = %self.consumer, "stt worker stopped");
        Ok(())
    }

    /// Blocking consume, then top the batch up until `BATCH_MAX` entries or
    /// `BATCH_WAIT_MS` elapse, amortizing model cost on accelerators.
    async fn collect_batch(&self, group: &str) -> Result<Vec<StreamEntry>, WorkerError> {
        let batch_max = self.settings.worker.batch_max;
        let block_ms = self.settings.broker.block_ms;

        let mut batch = self
            .broker
            .consume(AUDIO_JOBS_STREAM, group, &self.consumer, batch_max, block_ms)
            .await?;

        if batch.is_empty() || batch.len() >= batch_max {
            return Ok(batch);
        }

        let deadline = Instant::now() + Duration::from_millis(self.settings.worker.batch_wait_ms);
        while batch.len() < batch_max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let more = self
                .broker
                .consume(
                    AUDIO_JOBS_STREAM,
                    group,
                    &self.consumer,
                    batch_max - batch.len(),
                    remaining.as_millis() as u64,
                )
                .await?;
            if more.is_empty() {
                break;
            }
            batch.extend(more);
        }

        Ok(batch)
    }

    /// Process a batch, publishing per-session results in segment_seq order
    async fn process_batch(&self, group: &str, batch: Vec<StreamEntry>) {
        // (session_id, epoch, segment_seq) -> entry; BTreeMap iteration
        // gives the per-session in-order publish the gateway relies on.
        // Seqs restart per epoch, so the epoch is part of the key.
        let mut ordered: BTreeMap<(String, u64, u64), Vec<(String, SegmentJob)>> = BTreeMap::new();

        for entry in batch {
            match SegmentJob::from_fields(&entry.fields) {
                Ok(job) => {
                    ordered
                        .entry((job.session_id.clone(), job.epoch, job.segment_seq))
                        .or_default()
                        .push((entry.id, job));
                }
                Err(err) => {
                    tracing::error!(entry_id = %entry.id, error = %err, "undecodable segment job, acking to drop");
                    self.ack_entry(group, &entry.id).await;
                }
            }
        }

        for (_, duplicates) in ordered {
            for (entry_id, job) in duplicates {
                self.process_job(group, &entry_id, job).await;
            }
        }
    }

    async fn process_job(&self, group: &str, entry_id: &str, job: SegmentJob) {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.settings.flow.model_deadline_ms);

        // An auto source leaves detection to the model
        let hint = (!job.source_lang.is_auto()).then_some(&job.source_lang);
        let outcome =
            tokio::time::timeout(deadline, self.transcriber.transcribe(&job.audio, hint)).await;

        let (text, detected, failed) = match outcome {
            Ok(Ok(transcription)) => {
                if let (Some(hinted), Some(detected)) = (hint, &transcription.detected_lang) {
                    if detected != hinted {
                        tracing::debug!(
                            job_id = %job.job_id(),
                            hinted = %hinted,
                            detected = %detected,
                            "model detected a different language"
                        );
                    }
                }
                (transcription.text, transcription.detected_lang, false)
            }
            Ok(Err(err)) => {
                tracing::error!(
                    job_id = %job.job_id(),
                    error = %err,
                    "transcriber failed, emitting empty final"
                );
                (String::new(), None, true)
            }
            Err(_) => {
                tracing::error!(
                    job_id = %job.job_id(),
                    deadline_ms = deadline.as_millis() as u64,
                    "transcriber deadline exceeded, emitting empty final"
                );
                (String::new(), None, true)
            }
        };
        metrics::record_transcribe(started.elapsed(), failed);

        let message = ResultMessage {
            session_id: job.session_id.clone(),
            segment_seq: job.segment_seq,
            epoch: job.epoch,
            text: text.clone(),
            translation: None,
            // A failed segment still unblocks the session
            is_final: job.is_final || failed,
            ts: now_ms(),
        };

        if !self.publish_result(&message).await {
            if failed {
                // Poison-pill rule: never leave a broken entry in pending
                self.ack_entry(group, entry_id).await;
            }
            // Otherwise leave the entry unacked for redelivery
            return;
        }

        if job.is_final && !failed && job.translation_enabled && job.source_lang != job.target_lang
        {
            // Auto-source jobs translate from whatever the model detected
            let source = if job.source_lang.is_auto() {
                detected
            } else {
                Some(job.source_lang.clone())
            };
            match source {
                Some(source) if source != job.target_lang => {
                    self.enqueue_translation(&job, &text, source).await;
                }
                Some(_) => {
                    // Detected the target language; nothing to translate
                }
                None => {
                    tracing::warn!(
                        job_id = %job.job_id(),
                        "no detected language for auto-source final, translation skipped"
                    );
                }
            }
        }

        self.ack_entry(group, entry_id).await;
    }

    async fn publish_result(&self, message: &ResultMessage) -> bool {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "result encode failed");
                return false;
            }
        };

        let channel = results_channel(&message.session_id);
        let broker = self.broker.clone();
        let deadline = Duration::from_millis(self.settings.flow.publish_deadline_ms);
        let result = with_backoff(deadline, "publish result", || {
            let broker = broker.clone();
            let channel = channel.clone();
            let payload = payload.clone();
            async move { broker.publish(&channel, &payload).await }
        })
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    session_id = %message.session_id,
                    segment_seq = message.segment_seq,
                    error = %err,
                    "result publish failed"
                );
                false
            }
        }
    }

    async fn enqueue_translation(&self, job: &SegmentJob, text: &str, source_lang: LangCode) {
        if text.is_empty() {
            return;
        }

        let translation_job = TranslationJob {
            session_id: job.session_id.clone(),
            segment_seq: job.segment_seq,
            epoch: job.epoch,
            text: text.to_string(),
            source_lang,
            target_lang: job.target_lang.clone(),
            ts: now_ms(),
        };

        let fields = translation_job.to_fields();
        let broker = self.broker.clone();
        let deadline = Duration::from_millis(self.settings.flow.publish_deadline_ms);
        let result = with_backoff(deadline, "append translation job", || {
            let broker = broker.clone();
            let fields = fields.clone();
            async move { broker.append(FINAL_TRANSCRIPTS_STREAM, &fields).await }
        })
        .await;

        if let Err(err) = result {
            // The client keeps the untranslated final; nothing to retry
            tracing::error!(
                session_id = %job.session_id,
                segment_seq = job.segment_seq,
                error = %err,
                "translation enqueue failed"
            );
        }
    }

    async fn ack_entry(&self, group: &str, entry_id: &str) {
        let broker = self.broker.clone();
        let deadline = Duration::from_millis(self.settings.flow.publish_deadline_ms);
        let entry_id = entry_id.to_string();
        let group = group.to_string();
        let result = with_backoff(deadline, "ack entry", || {
            let broker = broker.clone();
            let entry_id = entry_id.clone();
            let group = group.clone();
            async move { broker.ack(AUDIO_JOBS_STREAM, &group, &entry_id).await }
        })
        .await;

        if let Err(err) = result {
            // At-least-once: the entry will be redelivered and deduplicated
            // downstream by (session_id, segment_seq)
            tracing::warn!(entry_id = %entry_id, error = %err, "ack failed");
        }
    }

    /// Take over entries idle past ACK_WAIT (crashed or wedged peers)
    async fn reclaim(&self, group: &str) {
        let min_idle = self.settings.flow.ack_wait_ms;
        match self
            .broker
            .claim(AUDIO_JOBS_STREAM, group, &self.consumer, min_idle)
            .await
        {
            Ok(claimed) if !claimed.is_empty() => {
                tracing::info!(count = claimed.len(), "reclaimed stranded segment jobs");
                metrics::record_reclaimed(claimed.len());
                self.process_batch(group, claimed).await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "claim failed");
            }
        }
    }
}
