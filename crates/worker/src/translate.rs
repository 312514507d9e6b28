//! Translation worker loop
//!
//! Same shape as the STT loop, over `final_transcripts`. Each entry is
//! translated and published on the session channel as a final that carries
//! both the transcript and its translation; the client renders it on top
//! of the transcription-only final it already has.
//!
//! Identical `(source, target, text)` inputs are served from a bounded LRU
//! cache.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use voxstream_broker::{with_backoff, Broker, StreamEntry};
use voxstream_config::Settings;
use voxstream_core::{
    now_ms, results_channel, ResultMessage, TranslationJob, Translator, FINAL_TRANSCRIPTS_STREAM,
};

use crate::{metrics, WorkerError};

type CacheKey = (String, String, String);

/// One translation worker process
pub struct TranslationWorker {
    settings: Arc<Settings>,
    broker: Arc<dyn Broker>,
    translator: Arc<dyn Translator>,
    consumer: String,
    cache: Mutex<LruCache<CacheKey, String>>,
}

impl TranslationWorker {
    pub fn new(
        settings: Arc<Settings>,
        broker: Arc<dyn Broker>,
        translator: Arc<dyn Translator>,
        consumer: String,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(settings.worker.translation_cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            broker,
            translator,
            consumer,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Run until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let group = self.settings.worker.translate_group.clone();
        self.broker
            .ensure_group(FINAL_TRANSCRIPTS_STREAM, &group)
            .await?;

        tracing::info!(
            consumer = %self.consumer,
            group = %group,
            model = self.translator.model_name(),
            "translation worker started"
        );

        self.reclaim(&group).await;
        let claim_interval = Duration::from_millis(self.settings.flow.ack_wait_ms);
        let mut next_claim = Instant::now() + claim_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                batch = self.broker.consume(
                    FINAL_TRANSCRIPTS_STREAM,
                    &group,
                    &self.consumer,
                    self.settings.worker.batch_max,
                    self.settings.broker.block_ms,
                ) => batch,
                _ = shutdown.changed() => continue,
            };

            match batch {
                Ok(batch) => {
                    for entry in batch {
                        self.process_entry(&group, entry).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "consume failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }

            if Instant::now() >= next_claim {
                self.reclaim(&group).await;
                next_claim = Instant::now() + claim_interval;
            }
        }

        tracing::info!(consumer = %self.consumer, "translation worker stopped");
        Ok(())
    }

    async fn process_entry(&self, group: &str, entry: StreamEntry) {
        let job = match TranslationJob::from_fields(&entry.fields) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(entry_id = %entry.id, error = %err, "undecodable translation job, acking to drop");
                self.ack_entry(group, &entry.id).await;
                return;
            }
        };

        let translation = self.translate_cached(&job).await;

        let message = ResultMessage {
            session_id: job.session_id.clone(),
            segment_seq: job.segment_seq,
            epoch: job.epoch,
            text: job.text.clone(),
            translation: Some(translation),
            is_final: true,
            ts: now_ms(),
        };

        if self.publish_result(&message).await {
            self.ack_entry(group, &entry.id).await;
        }
        // Publish failure leaves the entry unacked for redelivery
    }

    /// Translate through the LRU cache; failures come back as an empty
    /// translation so the segment still settles (poison-pill rule).
    async fn translate_cached(&self, job: &TranslationJob) -> String {
        let key: CacheKey = (
            job.source_lang.to_string(),
            job.target_lang.to_string(),
            job.text.clone(),
        );

        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            metrics::record_translation_cache_hit();
            return hit;
        }

        let started = Instant::now();
        let deadline = Duration::from_millis(self.settings.flow.model_deadline_ms);
        let outcome = tokio::time::timeout(
            deadline,
            self.translator
                .translate(&job.text, &job.source_lang, &job.target_lang),
        )
        .await;

        let (translation, failed) = match outcome {
            Ok(Ok(translation)) => (translation, false),
            Ok(Err(err)) => {
                tracing::error!(
                    session_id = %job.session_id,
                    segment_seq = job.segment_seq,
                    error = %err,
                    "translator failed, emitting empty translation"
                );
                (String::new(), true)
            }
            Err(_) => {
                tracing::error!(
                    session_id = %job.session_id,
                    segment_seq = job.segment_seq,
                    deadline_ms = deadline.as_millis() as u64,
                    "translator deadline exceeded, emitting empty translation"
                );
                (String::new(), true)
            }
        };
        metrics::record_translate(started.elapsed(), failed);

        if !failed {
            self.cache.lock().put(key, translation.clone());
        }
        translation
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
        let result = with_backoff(deadline, "publish translation", || {
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
                    "translation publish failed"
                );
                false
            }
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
            async move {
                broker
                    .ack(FINAL_TRANSCRIPTS_STREAM, &group, &entry_id)
                    .await
            }
        })
        .await;

        if let Err(err) = result {
            tracing::warn!(entry_id = %entry_id, error = %err, "ack failed");
        }
    }

    async fn reclaim(&self, group: &str) {
        let min_idle = self.settings.flow.ack_wait_ms;
        match self
            .broker
            .claim(FINAL_TRANSCRIPTS_STREAM, group, &self.consumer, min_idle)
            .await
        {
            Ok(claimed) if !claimed.is_empty() => {
                tracing::info!(count = claimed.len(), "reclaimed stranded translation jobs");
                metrics::record_reclaimed(claimed.len());
                for entry in claimed {
                    self.process_entry(group, entry).await;
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "claim failed");
            }
        }
    }
}
