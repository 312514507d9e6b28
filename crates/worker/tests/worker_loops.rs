//! Worker loop behavior over the in-memory broker

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use voxstream_broker::{Broker, MemoryBroker};
use voxstream_config::Settings;
use voxstream_core::{
    now_ms, results_channel, CoreError, LangCode, ResultMessage, SegmentJob, Transcriber,
    Transcription, TranslationJob, Translator, AUDIO_JOBS_STREAM, FINAL_TRANSCRIPTS_STREAM,
};
use voxstream_worker::{consumer_name, SttWorker, StubTranscriber, StubTranslator, TranslationWorker};

fn test_settings() -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.broker.block_ms = 50;
    settings.worker.batch_max = 4;
    settings.worker.batch_wait_ms = 10;
    settings.flow.ack_wait_ms = 200;
    settings.flow.model_deadline_ms = 1000;
    settings.flow.publish_deadline_ms = 500;
    Arc::new(settings)
}

fn lang(code: &str) -> LangCode {
    LangCode::parse(code).unwrap()
}

fn segment_job(session: &str, seq: u64, is_final: bool, translate: bool) -> SegmentJob {
    SegmentJob {
        session_id: session.to_string(),
        segment_seq: seq,
        epoch: 0,
        // 100ms of silence at 16kHz
        audio: vec![0u8; 3200],
        source_lang: lang("en"),
        target_lang: if translate { lang("vi") } else { lang("en") },
        translation_enabled: translate,
        is_final,
        ts: now_ms(),
    }
}

async fn recv_result(
    sub: &mut voxstream_broker::Subscription,
    timeout: Duration,
) -> Option<ResultMessage> {
    let raw = tokio::time::timeout(timeout, sub.next()).await.ok()??;
    ResultMessage::from_json(&raw).ok()
}

fn spawn_stt(
    settings: Arc<Settings>,
    broker: Arc<MemoryBroker>,
    transcriber: Arc<dyn Transcriber>,
) -> watch::Sender<bool> {
    let (tx, rx) = watch::channel(false);
    let worker = SttWorker::new(settings, broker, transcriber, consumer_name());
    tokio::spawn(worker.run(rx));
    tx
}

struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
    async fn transcribe(
        &self,
        _audio_pcm: &[u8],
        _source_lang: Option<&LangCode>,
    ) -> voxstream_core::Result<Transcription> {
        Err(CoreError::Model("synthetic failure".into()))
    }

    fn model_name(&self) -> &str {
        "failing-stt"
    }
}

/// Reports a fixed detected language, like a model running without a hint
struct DetectingTranscriber {
    detected: &'static str,
}

#[async_trait]
impl Transcriber for DetectingTranscriber {
    async fn transcribe(
        &self,
        _audio_pcm: &[u8],
        source_lang: Option<&LangCode>,
    ) -> voxstream_core::Result<Transcription> {
        assert!(source_lang.is_none(), "auto job must not carry a hint");
        Ok(Transcription {
            text: "detected speech".into(),
            detected_lang: Some(lang(self.detected)),
        })
    }

    fn model_name(&self) -> &str {
        "detecting-stt"
    }
}

struct CountingTranslator {
    calls: AtomicUsize,
}

#[async_trait]
impl Translator for CountingTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &LangCode,
        target_lang: &LangCode,
    ) -> voxstream_core::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("[{target_lang}] {text}"))
    }

    fn model_name(&self) -> &str {
        "counting-mt"
    }
}

#[tokio::test]
async fn test_final_job_produces_result_and_ack() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let job = segment_job("s1", 1, true, false);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranscriber::new("hello")),
    );

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.session_id, "s1");
    assert_eq!(result.segment_seq, 1);
    assert!(result.is_final);
    assert!(result.text.starts_with("hello"));
    assert!(result.translation.is_none());

    // Acked entries are trimmed from the stream
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(AUDIO_JOBS_STREAM).await.unwrap(), 0);
    // Translation disabled: nothing enqueued downstream
    assert_eq!(broker.stream_len(FINAL_TRANSCRIPTS_STREAM).await.unwrap(), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_final_with_translation_enqueues_downstream_job() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let job = segment_job("s1", 1, true, true);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranscriber::new("hello")),
    );

    recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(FINAL_TRANSCRIPTS_STREAM).await.unwrap(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_partial_job_never_enqueues_translation() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let job = segment_job("s1", 1, false, true);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranscriber::new("partial")),
    );

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert!(!result.is_final);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(FINAL_TRANSCRIPTS_STREAM).await.unwrap(), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_model_failure_emits_empty_final_and_acks() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    // A partial job; the failure path still seals it with an empty final
    let job = segment_job("s1", 1, false, false);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(test_settings(), broker.clone(), Arc::new(FailingTranscriber));

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert!(result.is_final);
    assert!(result.text.is_empty());

    // No poison-pill loop: the entry is gone
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(AUDIO_JOBS_STREAM).await.unwrap(), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_results_published_in_seq_order_per_session() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    for seq in 1..=3 {
        let job = segment_job("s1", seq, seq == 3, false);
        broker
            .append(AUDIO_JOBS_STREAM, &job.to_fields())
            .await
            .unwrap();
    }

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranscriber::new("ordered")),
    );

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
        seqs.push(result.segment_seq);
    }
    assert_eq!(seqs, vec![1, 2, 3]);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_stranded_job_reclaimed_from_dead_consumer() {
    let broker = Arc::new(MemoryBroker::new());
    let settings = test_settings();
    let group = settings.worker.stt_group.clone();
    broker.ensure_group(AUDIO_JOBS_STREAM, &group).await.unwrap();

    let job = segment_job("s1", 1, true, false);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    // A "worker" takes the entry and dies without acking
    let taken = broker
        .consume(AUDIO_JOBS_STREAM, &group, "dead-worker", 1, 0)
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    // Let the entry sit past ACK_WAIT, then start a replacement
    tokio::time::sleep(Duration::from_millis(300)).await;
    let shutdown = spawn_stt(
        settings,
        broker.clone(),
        Arc::new(StubTranscriber::new("rescued")),
    );

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert!(result.text.starts_with("rescued"));
    assert!(result.is_final);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_auto_source_final_translates_from_detected_language() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    // Session never set a source language: the job carries the auto
    // sentinel and the model's detection drives the translation job
    let mut job = segment_job("s1", 1, true, true);
    job.source_lang = LangCode::auto();
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(DetectingTranscriber { detected: "en" }),
    );

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.text, "detected speech");

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
        .ensure_group(FINAL_TRANSCRIPTS_STREAM, "peek")
        .await
        .unwrap();
    let entries = broker
        .consume(FINAL_TRANSCRIPTS_STREAM, "peek", "p", 16, 0)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let translation_job = TranslationJob::from_fields(&entries[0].fields).unwrap();
    assert_eq!(translation_job.source_lang.as_str(), "en");
    assert_eq!(translation_job.target_lang.as_str(), "vi");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_auto_source_matching_target_skips_translation() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let mut job = segment_job("s1", 1, true, true);
    job.source_lang = LangCode::auto();
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    // Detection lands on the target language: nothing to translate
    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(DetectingTranscriber { detected: "vi" }),
    );

    recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(FINAL_TRANSCRIPTS_STREAM).await.unwrap(), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_translation_worker_publishes_combined_result() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let job = TranslationJob {
        session_id: "s1".into(),
        segment_seq: 4,
        epoch: 0,
        text: "hello world".into(),
        source_lang: lang("en"),
        target_lang: lang("vi"),
        ts: now_ms(),
    };
    broker
        .append(FINAL_TRANSCRIPTS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let (shutdown, rx) = watch::channel(false);
    let worker = TranslationWorker::new(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranslator),
        consumer_name(),
    );
    tokio::spawn(worker.run(rx));

    let result = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.segment_seq, 4);
    assert!(result.is_final);
    assert_eq!(result.text, "hello world");
    assert_eq!(result.translation.as_deref(), Some("[vi] hello world"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.stream_len(FINAL_TRANSCRIPTS_STREAM).await.unwrap(), 0);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_translation_cache_serves_repeats() {
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let translator = Arc::new(CountingTranslator {
        calls: AtomicUsize::new(0),
    });

    for seq in [1u64, 2] {
        let job = TranslationJob {
            session_id: "s1".into(),
            segment_seq: seq,
            epoch: 0,
            text: "same text".into(),
            source_lang: lang("en"),
            target_lang: lang("vi"),
            ts: now_ms(),
        };
        broker
            .append(FINAL_TRANSCRIPTS_STREAM, &job.to_fields())
            .await
            .unwrap();
    }

    let (shutdown, rx) = watch::channel(false);
    let worker = TranslationWorker::new(
        test_settings(),
        broker.clone(),
        translator.clone(),
        consumer_name(),
    );
    tokio::spawn(worker.run(rx));

    let first = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    let second = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.translation, second.translation);

    // Identical (source, target, text) served from cache
    assert_eq!(translator.calls.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_redelivered_job_is_idempotent_downstream() {
    // Replaying the same entry produces a result the gateway router
    // deduplicates by (session_id, segment_seq); the worker side just has
    // to keep seq/epoch stable across redeliveries.
    let broker = Arc::new(MemoryBroker::new());
    let mut sub = broker.subscribe(&results_channel("s1")).await.unwrap();

    let job = segment_job("s1", 7, true, false);
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();
    broker
        .append(AUDIO_JOBS_STREAM, &job.to_fields())
        .await
        .unwrap();

    let shutdown = spawn_stt(
        test_settings(),
        broker.clone(),
        Arc::new(StubTranscriber::new("dup")),
    );

    let first = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    let second = recv_result(&mut sub, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.segment_seq, second.segment_seq);
    assert_eq!(first.epoch, second.epoch);
    assert_eq!(first.text, second.text);

    let _ = shutdown.send(true);
}
