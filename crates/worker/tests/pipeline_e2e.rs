//! End-to-end dispatch: session task -> broker -> workers -> router -> client
//!
//! The full path over the in-memory broker with stub models, driven through
//! the session inbox exactly as the socket read loop would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use voxstream_broker::MemoryBroker;
use voxstream_config::Settings;
use voxstream_core::{f32_to_pcm16, SampleRate};
use voxstream_gateway::{
    build_vad, spawn_result_forwarder, ClientMessage, ResumeState, ServerMessage, SessionEvent,
    SessionTask,
};
use voxstream_worker::{consumer_name, SttWorker, StubTranscriber, StubTranslator, TranslationWorker};

fn test_settings() -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.broker.block_ms = 50;
    settings.segmenter.silence_threshold_ms = 150;
    settings.segmenter.pre_roll_ms = 100;
    settings.segmenter.max_buffer_ms = 5000;
    settings.segmenter.stream_chunk_ms = 200;
    settings.flow.ack_wait_ms = 300;
    settings.flow.model_deadline_ms = 1000;
    settings.flow.publish_deadline_ms = 500;
    settings.flow.max_queue_depth = 64;
    settings.worker.batch_max = 4;
    settings.worker.batch_wait_ms = 10;
    settings.gateway.session_ttl_ms = 60_000;
    Arc::new(settings)
}

fn speech_chunk() -> Vec<u8> {
    let samples: Vec<f32> = (0..1600)
        .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 200.0 / 16000.0).sin() * 0.5)
        .collect();
    f32_to_pcm16(&samples)
}

fn silence_chunk() -> Vec<u8> {
    vec![0u8; 3200]
}

struct Stack {
    inbox: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Receiver<ServerMessage>,
    shutdowns: Vec<watch::Sender<bool>>,
}

/// Wire a session task, result forwarder and an STT worker (optionally a
/// translation worker) over one in-memory broker.
fn spawn_stack(settings: Arc<Settings>, with_translation: bool) -> Stack {
    let broker = Arc::new(MemoryBroker::new());
    let (inbox_tx, inbox_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    spawn_result_forwarder(
        broker.clone(),
        "s1".to_string(),
        inbox_tx.clone(),
        Duration::from_secs(10),
    );

    let vad = build_vad(&settings).unwrap();
    let task = SessionTask::new(
        "s1".to_string(),
        settings.clone(),
        broker.clone(),
        inbox_rx,
        outbound_tx,
        vad,
        ResumeState::default(),
    );
    tokio::spawn(task.run());

    let mut shutdowns = Vec::new();

    let (stt_tx, stt_rx) = watch::channel(false);
    let stt = SttWorker::new(
        settings.clone(),
        broker.clone(),
        Arc::new(StubTranscriber::new("transcript")),
        consumer_name(),
    );
    tokio::spawn(stt.run(stt_rx));
    shutdowns.push(stt_tx);

    if with_translation {
        let (mt_tx, mt_rx) = watch::channel(false);
        let mt = TranslationWorker::new(
            settings,
            broker,
            Arc::new(StubTranslator),
            consumer_name(),
        );
        tokio::spawn(mt.run(mt_rx));
        shutdowns.push(mt_tx);
    }

    Stack {
        inbox: inbox_tx,
        outbound: outbound_rx,
        shutdowns,
    }
}

impl Stack {
    async fn send_audio(&self, chunks: usize, speech: bool) {
        for _ in 0..chunks {
            let pcm = if speech {
                speech_chunk()
            } else {
                silence_chunk()
            };
            self.inbox
                .send(SessionEvent::Audio {
                    rate: SampleRate::Hz16000,
                    pcm,
                })
                .await
                .unwrap();
        }
    }

    /// Collect messages until `utterance_end` or the deadline
    async fn collect_until_utterance_end(&mut self, deadline: Duration) -> Vec<ServerMessage> {
        let mut collected = Vec::new();
        let cutoff = tokio::time::Instant::now() + deadline;
        loop {
            let remaining = cutoff.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.outbound.recv()).await {
                Ok(Some(msg)) => {
                    let done = matches!(msg, ServerMessage::UtteranceEnd { .. });
                    collected.push(msg);
                    if done {
                        break;
                    }
                }
                _ => break,
            }
        }
        collected
    }

    fn drain(&mut self) {
        while self.outbound.try_recv().is_ok() {}
    }

    fn stop(self) {
        for tx in self.shutdowns {
            let _ = tx.send(true);
        }
    }
}

fn finals(messages: &[ServerMessage]) -> Vec<(&str, Option<&str>)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Realtime {
                text,
                translation,
                is_final: true,
                ..
            } => Some((text.as_str(), translation.as_deref())),
            _ => None,
        })
        .collect()
}

fn partials(messages: &[ServerMessage]) -> Vec<(&str, Option<&str>)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Realtime {
                text,
                translation,
                is_final: false,
                ..
            } => Some((text.as_str(), translation.as_deref())),
            _ => None,
        })
        .collect()
}

/// Stub transcripts embed the audio span: "transcript (NNNms)"
fn transcript_ms(text: &str) -> u64 {
    text.rsplit('(')
        .next()
        .and_then(|tail| tail.strip_suffix("ms)"))
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_happy_path_without_translation() {
    let mut stack = spawn_stack(test_settings(), false);

    // 700ms speech, then enough silence to finalize
    stack.send_audio(7, true).await;
    stack.send_audio(4, false).await;

    let messages = stack.collect_until_utterance_end(Duration::from_secs(5)).await;

    let partial_list = partials(&messages);
    assert!(!partial_list.is_empty(), "expected at least one partial");
    assert!(partial_list.iter().all(|(_, tr)| tr.is_none()));

    let final_list = finals(&messages);
    assert_eq!(final_list.len(), 1, "expected exactly one final");
    let (text, translation) = final_list[0];
    assert!(!text.is_empty());
    assert!(translation.is_none());

    // utterance_end arrives after the final
    assert!(matches!(
        messages.last().unwrap(),
        ServerMessage::UtteranceEnd { .. }
    ));

    stack.stop();
}

#[tokio::test]
async fn test_happy_path_with_translation() {
    let mut stack = spawn_stack(test_settings(), true);

    stack
        .inbox
        .send(SessionEvent::Control(ClientMessage::SetLangs {
            source_language: "en".into(),
            target_language: "vi".into(),
        }))
        .await
        .unwrap();

    stack.send_audio(7, true).await;
    stack.send_audio(4, false).await;

    let messages = stack.collect_until_utterance_end(Duration::from_secs(5)).await;

    // Partials stay transcription-only
    assert!(partials(&messages).iter().all(|(_, tr)| tr.is_none()));

    // The transcription-only final precedes utterance_end; the translated
    // replacement for the same segment follows on its own
    let final_list = finals(&messages);
    assert!(!final_list.is_empty());

    let translated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ServerMessage::Realtime {
                is_final: true,
                translation: Some(translation),
                ..
            }) = stack.outbound.recv().await
            {
                break translation;
            }
        }
    })
    .await
    .expect("translated final never arrived");
    assert!(translated.starts_with("[vi]"));

    stack.stop();
}

#[tokio::test]
async fn test_start_over_abandons_first_utterance() {
    let mut stack = spawn_stack(test_settings(), false);

    // 400ms of speech, then reset mid-utterance
    stack.send_audio(4, true).await;
    stack
        .inbox
        .send(SessionEvent::Control(ClientMessage::StartOver))
        .await
        .unwrap();

    // Give any in-flight epoch-0 results time to land (and be dropped)
    tokio::time::sleep(Duration::from_millis(300)).await;
    stack.drain();

    // Second utterance: 800ms speech plus trailing silence
    stack.send_audio(8, true).await;
    stack.send_audio(4, false).await;

    let messages = stack.collect_until_utterance_end(Duration::from_secs(5)).await;

    let final_list = finals(&messages);
    assert_eq!(final_list.len(), 1, "expected exactly one final");
    // The final covers the second utterance, not the abandoned 400ms one
    assert!(
        transcript_ms(final_list[0].0) >= 700,
        "final covered the wrong utterance: {}",
        final_list[0].0
    );
    assert!(matches!(
        messages.last().unwrap(),
        ServerMessage::UtteranceEnd { .. }
    ));

    stack.stop();
}

#[tokio::test]
async fn test_forced_flush_on_long_utterance() {
    let settings = {
        let mut s = Settings::default();
        s.broker.block_ms = 50;
        s.segmenter.silence_threshold_ms = 150;
        s.segmenter.pre_roll_ms = 100;
        s.segmenter.max_buffer_ms = 500;
        s.segmenter.stream_chunk_ms = 200;
        s.flow.ack_wait_ms = 300;
        s.flow.model_deadline_ms = 1000;
        s.flow.publish_deadline_ms = 500;
        s.flow.max_queue_depth = 64;
        s.worker.batch_max = 4;
        s.worker.batch_wait_ms = 10;
        s.gateway.session_ttl_ms = 60_000;
        Arc::new(s)
    };
    let mut stack = spawn_stack(settings, false);

    // Continuous speech well past the 500ms cap; no silence gap at all
    stack.send_audio(12, true).await;

    let messages = stack.collect_until_utterance_end(Duration::from_secs(5)).await;
    let final_list = finals(&messages);
    assert_eq!(final_list.len(), 1, "forced flush must emit exactly one final");
    assert!(matches!(
        messages.last().unwrap(),
        ServerMessage::UtteranceEnd { .. }
    ));

    // State returned to INACTIVE: the remainder finishes as a new utterance
    stack.send_audio(4, false).await;
    let tail = stack.collect_until_utterance_end(Duration::from_secs(5)).await;
    assert_eq!(finals(&tail).len(), 1, "second utterance must finalize");

    stack.stop();
}

#[tokio::test]
async fn test_worker_replacement_finishes_segment() {
    // Scenario: the only worker dies after a segment is enqueued; a
    // replacement claims and finishes it.
    let settings = test_settings();
    let broker = Arc::new(MemoryBroker::new());
    let (inbox_tx, inbox_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    spawn_result_forwarder(
        broker.clone(),
        "s1".to_string(),
        inbox_tx.clone(),
        Duration::from_secs(10),
    );

    let vad = build_vad(&settings).unwrap();
    let task = SessionTask::new(
        "s1".to_string(),
        settings.clone(),
        broker.clone(),
        inbox_rx,
        outbound_tx,
        vad,
        ResumeState::default(),
    );
    tokio::spawn(task.run());

    let mut stack = Stack {
        inbox: inbox_tx,
        outbound: outbound_rx,
        shutdowns: Vec::new(),
    };

    // Dead worker: claims the entry by consuming, never acks
    broker
        .ensure_group(
            voxstream_core::AUDIO_JOBS_STREAM,
            &settings.worker.stt_group,
        )
        .await
        .unwrap();

    stack.send_audio(5, true).await;
    stack.send_audio(4, false).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    use voxstream_broker::Broker as _;
    let stolen = broker
        .consume(
            voxstream_core::AUDIO_JOBS_STREAM,
            &settings.worker.stt_group,
            "crashed-worker",
            16,
            0,
        )
        .await
        .unwrap();
    assert!(!stolen.is_empty(), "no segment was enqueued");

    // Replacement comes up after the entries have idled past ACK_WAIT
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (stt_tx, stt_rx) = watch::channel(false);
    let replacement = SttWorker::new(
        settings.clone(),
        broker.clone(),
        Arc::new(StubTranscriber::new("recovered")),
        consumer_name(),
    );
    tokio::spawn(replacement.run(stt_rx));
    stack.shutdowns.push(stt_tx);

    let messages = stack.collect_until_utterance_end(Duration::from_secs(5)).await;
    let final_list = finals(&messages);
    assert_eq!(final_list.len(), 1);
    assert!(final_list[0].0.starts_with("recovered"));

    stack.stop();
}
