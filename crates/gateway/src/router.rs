//! Result routing
//!
//! Decides, per inbound broker result, whether it reaches the client.
//! `(session_id, segment_seq)` is the idempotency key: anything older than
//! what was already delivered is dropped, as is anything from a previous
//! epoch. Kept free of I/O so the rules are testable in isolation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voxstream_broker::{with_backoff, Broker};
use voxstream_core::{results_channel, ResultMessage};

use crate::pipeline::SessionEvent;

/// Why a result was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Result predates the session's current epoch (start_over)
    StaleEpoch,
    /// A newer segment was already delivered
    OutOfOrder,
    /// Redelivery of an already-delivered result
    Duplicate,
}

/// Routing verdict for one result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop(DropReason),
    /// Forward as a realtime frame; `utterance_end` says whether the
    /// utterance-end marker follows it
    Forward { utterance_end: bool },
}

/// Per-session result-ordering state
pub struct ResultRouter {
    epoch: u64,
    /// Highest segment_seq delivered to the client
    last_delivered_seq: Option<u64>,
    /// Seq of the most recent final job this session emitted
    last_final_seq: Option<u64>,
    /// Seq whose utterance_end already went out
    utterance_end_sent: Option<u64>,
    /// Segment seqs with a job in flight
    outstanding: HashSet<u64>,
}

impl ResultRouter {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            last_delivered_seq: None,
            last_final_seq: None,
            utterance_end_sent: None,
            outstanding: HashSet::new(),
        }
    }

    /// Record an emitted job
    pub fn note_job(&mut self, seq: u64, is_final: bool) {
        self.outstanding.insert(seq);
        if is_final {
            self.last_final_seq = Some(seq);
        }
    }

    /// Jobs currently in flight
    pub fn jobs_in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Write off in-flight partials below `seq`; their results will be
    /// dropped by ordering once the final lands.
    pub fn abandon_below(&mut self, seq: u64) {
        self.outstanding.retain(|s| *s >= seq);
    }

    /// Reset for a new epoch; in-flight jobs from the old one are abandoned
    pub fn start_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.outstanding.clear();
        self.last_delivered_seq = None;
        self.last_final_seq = None;
        self.utterance_end_sent = None;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply the ordering rules to one inbound result
    pub fn on_result(&mut self, msg: &ResultMessage) -> Verdict {
        if msg.epoch != self.epoch {
            return Verdict::Drop(DropReason::StaleEpoch);
        }

        // The job settles whether or not the message is forwarded
        self.outstanding.remove(&msg.segment_seq);

        match self.last_delivered_seq {
            Some(last) if msg.segment_seq < last => return Verdict::Drop(DropReason::OutOfOrder),
            Some(last) if msg.segment_seq == last => {
                // Same seq again: only the translation upgrade of an
                // already-delivered final passes; redeliveries do not
                if !(msg.is_final && msg.translation.is_some()) {
                    return Verdict::Drop(DropReason::Duplicate);
                }
            }
            _ => {}
        }

        self.last_delivered_seq = Some(msg.segment_seq);

        let utterance_end = msg.is_final
            && self.last_final_seq == Some(msg.segment_seq)
            && self.utterance_end_sent != Some(msg.segment_seq);
        if utterance_end {
            self.utterance_end_sent = Some(msg.segment_seq);
        }

        Verdict::Forward { utterance_end }
    }
}

/// Subscribe to the session's result channel and feed the session inbox.
///
/// Runs until the session ends (inbox closed) or the subscription cannot be
/// re-established within `retry_deadline`, in which case a `Shutdown` is
/// delivered so the socket closes and the client can reconnect.
pub fn spawn_result_forwarder(
    broker: Arc<dyn Broker>,
    session_id: String,
    inbox: mpsc::Sender<SessionEvent>,
    retry_deadline: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let channel = results_channel(&session_id);

        loop {
            let subscribed = with_backoff(retry_deadline, "subscribe results", || {
                let broker = broker.clone();
                let channel = channel.clone();
                async move { broker.subscribe(&channel).await }
            })
            .await;

            let mut subscription = match subscribed {
                Ok(sub) => sub,
                Err(err) => {
                    tracing::error!(session_id = %session_id, error = %err, "result subscription lost for good");
                    let _ = inbox.send(SessionEvent::Shutdown).await;
                    return;
                }
            };

            while let Some(raw) = subscription.next().await {
                let msg = match ResultMessage::from_json(&raw) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, error = %err, "undecodable result message");
                        continue;
                    }
                };
                if inbox.send(SessionEvent::Result(msg)).await.is_err() {
                    // Session task is gone; unsubscribe by dropping
                    return;
                }
            }

            if inbox.is_closed() {
                return;
            }
            tracing::warn!(session_id = %session_id, "result subscription dropped, resubscribing");
        }
    })
}
