//! Speech segmentation state machine
//!
//! Tracks one session's utterance lifecycle over classified 10 ms frames:
//!
//! ```text
//!        frame=speech                                silence >= threshold
//! INACTIVE ----------> ACTIVE --frame=silence--> COOLDOWN --------------> INACTIVE
//!    ^                  | active_buffer >= max                               |
//!    |                  +------------------------------------->--------------+
//!    |                                                  (force-final)
//!    +--- socket close from any state: flush if ACTIVE/COOLDOWN
//! ```
//!
//! While INACTIVE, audio lands only in the pre-roll ring; the ring keeps
//! rolling through every state so the next utterance always starts with the
//! last second of context stitched in front.

use std::collections::VecDeque;

use voxstream_core::FRAME_MS;

/// PCM16 bytes per millisecond at 16 kHz mono
pub const BYTES_PER_MS: usize = 32;

/// Speech state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeechState {
    #[default]
    Inactive,
    Active,
    Cooldown,
}

impl SpeechState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechState::Inactive => "inactive",
            SpeechState::Active => "active",
            SpeechState::Cooldown => "cooldown",
        }
    }
}

/// Why a final segment was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalReason {
    /// Trailing silence crossed the threshold
    Silence,
    /// The utterance buffer hit its cap
    ForcedFlush,
    /// The socket is closing mid-utterance
    SocketClose,
}

/// What the segmenter wants emitted after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Enough new audio has accumulated for a partial
    PartialDue,
    /// The utterance is complete
    FinalDue(FinalReason),
}

/// Segmentation thresholds, in buffer bytes
#[derive(Debug, Clone)]
pub struct SegmenterSettings {
    pub silence_threshold_ms: u64,
    pub pre_roll_bytes: usize,
    pub max_buffer_bytes: usize,
    pub stream_chunk_bytes: usize,
}

impl SegmenterSettings {
    pub fn from_config(cfg: &voxstream_config::SegmenterConfig) -> Self {
        Self {
            silence_threshold_ms: cfg.silence_threshold_ms,
            pre_roll_bytes: cfg.pre_roll_ms as usize * BYTES_PER_MS,
            max_buffer_bytes: cfg.max_buffer_ms as usize * BYTES_PER_MS,
            stream_chunk_bytes: cfg.stream_chunk_ms as usize * BYTES_PER_MS,
        }
    }
}

/// Fixed-capacity byte ring holding the last `capacity` bytes pushed
pub struct PreRollRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl PreRollRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
        let excess = self.buf.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.buf.drain(..excess);
        }
    }

    /// Copy the ring contents out, oldest first
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Per-session segmentation engine
pub struct Segmenter {
    settings: SegmenterSettings,
    state: SpeechState,
    pre_roll: PreRollRing,
    active: Vec<u8>,
    /// Buffer length at the last partial emission
    emitted_len: usize,
    /// Accumulated trailing silence while in COOLDOWN
    silence_ms: u64,
}

impl Segmenter {
    pub fn new(settings: SegmenterSettings) -> Self {
        let pre_roll = PreRollRing::new(settings.pre_roll_bytes);
        Self {
            settings,
            state: SpeechState::Inactive,
            pre_roll,
            active: Vec::new(),
            emitted_len: 0,
            silence_ms: 0,
        }
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Feed one classified 10 ms frame of PCM16 bytes
    pub fn push_frame(&mut self, frame: &[u8], is_speech: bool) -> Option<SegmentEvent> {
        let event = match (self.state, is_speech) {
            (SpeechState::Inactive, false) => None,

            (SpeechState::Inactive, true) => {
                // Stitch the pre-roll in front so the utterance onset is
                // not clipped
                self.active.clear();
                self.active.extend(self.pre_roll.snapshot());
                self.active.extend_from_slice(frame);
                self.emitted_len = 0;
                self.silence_ms = 0;
                self.state = SpeechState::Active;
                self.check_thresholds()
            }

            (SpeechState::Active, true) => {
                self.active.extend_from_slice(frame);
                self.check_thresholds()
            }

            (SpeechState::Active, false) => {
                self.active.extend_from_slice(frame);
                self.state = SpeechState::Cooldown;
                self.silence_ms = FRAME_MS as u64;
                self.check_forced_flush()
            }

            (SpeechState::Cooldown, true) => {
                self.active.extend_from_slice(frame);
                self.state = SpeechState::Active;
                self.silence_ms = 0;
                self.check_thresholds()
            }

            (SpeechState::Cooldown, false) => {
                self.active.extend_from_slice(frame);
                self.silence_ms += FRAME_MS as u64;
                if self.silence_ms >= self.settings.silence_threshold_ms {
                    Some(SegmentEvent::FinalDue(FinalReason::Silence))
                } else {
                    self.check_forced_flush()
                }
            }
        };

        self.pre_roll.push(frame);
        event
    }

    fn check_forced_flush(&self) -> Option<SegmentEvent> {
        if self.active.len() >= self.settings.max_buffer_bytes {
            Some(SegmentEvent::FinalDue(FinalReason::ForcedFlush))
        } else {
            None
        }
    }

    fn check_thresholds(&self) -> Option<SegmentEvent> {
        if let Some(flush) = self.check_forced_flush() {
            return Some(flush);
        }
        if self.active.len() - self.emitted_len >= self.settings.stream_chunk_bytes {
            return Some(SegmentEvent::PartialDue);
        }
        None
    }

    /// Snapshot the whole utterance so far for a partial job.
    ///
    /// Partials carry the entire buffer; the emission marker only gates the
    /// cadence of the next one.
    pub fn take_partial(&mut self) -> Vec<u8> {
        self.emitted_len = self.active.len();
        self.active.clone()
    }

    /// Drain the utterance for a final job and return to INACTIVE.
    ///
    /// The pre-roll ring is preserved: the next utterance on this socket
    /// still gets its last-second context.
    pub fn take_final(&mut self) -> Vec<u8> {
        self.emitted_len = 0;
        self.silence_ms = 0;
        self.state = SpeechState::Inactive;
        std::mem::take(&mut self.active)
    }

    /// Flush on socket close: the in-progress utterance, if any
    pub fn flush_on_close(&mut self) -> Option<Vec<u8>> {
        if matches!(self.state, SpeechState::Active | SpeechState::Cooldown)
            && !self.active.is_empty()
        {
            Some(self.take_final())
        } else {
            None
        }
    }

    /// Discard everything, pre-roll included
    pub fn start_over(&mut self) {
        self.active.clear();
        self.pre_roll.clear();
        self.emitted_len = 0;
        self.silence_ms = 0;
        self.state = SpeechState::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxstream_core::FRAME_BYTES;

    fn settings() -> SegmenterSettings {
        SegmenterSettings {
            silence_threshold_ms: 100,
            pre_roll_bytes: 5 * FRAME_BYTES,
            max_buffer_bytes: 100 * FRAME_BYTES,
            stream_chunk_bytes: 10 * FRAME_BYTES,
        }
    }

    fn frame(value: u8) -> Vec<u8> {
        vec![value; FRAME_BYTES]
    }

    #[test]
    fn test_inactive_frames_only_fill_pre_roll() {
        let mut seg = Segmenter::new(settings());
        for _ in 0..20 {
            assert_eq!(seg.push_frame(&frame(1), false), None);
        }
        assert_eq!(seg.state(), SpeechState::Inactive);
        assert_eq!(seg.active_len(), 0);
        // Ring capped at 5 frames
        assert_eq!(seg.pre_roll.len(), 5 * FRAME_BYTES);
    }

    #[test]
    fn test_speech_onset_stitches_pre_roll() {
        let mut seg = Segmenter::new(settings());
        for _ in 0..3 {
            seg.push_frame(&frame(1), false);
        }
        seg.push_frame(&frame(2), true);

        assert_eq!(seg.state(), SpeechState::Active);
        // 3 pre-roll frames + the triggering frame
        assert_eq!(seg.active_len(), 4 * FRAME_BYTES);

        let buffer = seg.take_partial();
        assert_eq!(&buffer[..FRAME_BYTES], &frame(1)[..]);
        assert_eq!(&buffer[3 * FRAME_BYTES..], &frame(2)[..]);
    }

    #[test]
    fn test_partial_due_after_stream_chunk() {
        let mut seg = Segmenter::new(settings());
        let mut partials = 0;
        for _ in 0..10 {
            if seg.push_frame(&frame(1), true) == Some(SegmentEvent::PartialDue) {
                partials += 1;
                seg.take_partial();
            }
        }
        assert_eq!(partials, 1);
        // Cadence restarts from the emission point
        for _ in 0..10 {
            if seg.push_frame(&frame(1), true) == Some(SegmentEvent::PartialDue) {
                partials += 1;
                seg.take_partial();
            }
        }
        assert_eq!(partials, 2);
    }

    #[test]
    fn test_partial_due_repeats_until_taken() {
        let mut seg = Segmenter::new(settings());
        for _ in 0..10 {
            seg.push_frame(&frame(1), true);
        }
        // Due and not taken: next frame reports again
        assert_eq!(
            seg.push_frame(&frame(1), true),
            Some(SegmentEvent::PartialDue)
        );
        assert_eq!(
            seg.push_frame(&frame(1), true),
            Some(SegmentEvent::PartialDue)
        );
    }

    #[test]
    fn test_silence_finalizes_after_threshold() {
        let mut seg = Segmenter::new(settings());
        seg.push_frame(&frame(1), true);
        assert_eq!(seg.state(), SpeechState::Active);

        // 100ms threshold = 10 silent frames
        let mut event = None;
        for _ in 0..9 {
            event = seg.push_frame(&frame(0), false);
        }
        assert_eq!(seg.state(), SpeechState::Cooldown);
        assert_eq!(event, None);

        let event = seg.push_frame(&frame(0), false);
        assert_eq!(event, Some(SegmentEvent::FinalDue(FinalReason::Silence)));

        let buffer = seg.take_final();
        // Speech frame + 10 silence frames, all in the utterance
        assert_eq!(buffer.len(), 11 * FRAME_BYTES);
        assert_eq!(seg.state(), SpeechState::Inactive);
        assert_eq!(seg.active_len(), 0);
    }

    #[test]
    fn test_speech_resumes_from_cooldown() {
        let mut seg = Segmenter::new(settings());
        seg.push_frame(&frame(1), true);
        for _ in 0..5 {
            seg.push_frame(&frame(0), false);
        }
        assert_eq!(seg.state(), SpeechState::Cooldown);

        seg.push_frame(&frame(1), true);
        assert_eq!(seg.state(), SpeechState::Active);

        // Silence counter restarted: 9 more silent frames stay in cooldown
        for _ in 0..9 {
            assert_eq!(seg.push_frame(&frame(0), false), None);
        }
        assert_eq!(
            seg.push_frame(&frame(0), false),
            Some(SegmentEvent::FinalDue(FinalReason::Silence))
        );
    }

    #[test]
    fn test_forced_flush_at_buffer_cap() {
        let mut seg = Segmenter::new(settings());
        let mut event = None;
        let mut frames = 0;
        while event != Some(SegmentEvent::FinalDue(FinalReason::ForcedFlush)) {
            event = seg.push_frame(&frame(1), true);
            if event == Some(SegmentEvent::PartialDue) {
                seg.take_partial();
                event = None;
            }
            frames += 1;
            assert!(frames <= 100, "forced flush never fired");
        }
        assert_eq!(frames, 100);

        let buffer = seg.take_final();
        assert_eq!(buffer.len(), 100 * FRAME_BYTES);
        assert_eq!(seg.state(), SpeechState::Inactive);
    }

    #[test]
    fn test_pre_roll_preserved_across_utterances() {
        let mut seg = Segmenter::new(settings());
        seg.push_frame(&frame(1), true);
        for _ in 0..10 {
            seg.push_frame(&frame(0), false);
        }
        seg.take_final();

        assert!(!seg.pre_roll.is_empty());

        // Next utterance stitches the rolling tail in
        seg.push_frame(&frame(2), true);
        assert!(seg.active_len() > FRAME_BYTES);
    }

    #[test]
    fn test_start_over_clears_everything() {
        let mut seg = Segmenter::new(settings());
        for _ in 0..5 {
            seg.push_frame(&frame(1), true);
        }
        seg.start_over();

        assert_eq!(seg.state(), SpeechState::Inactive);
        assert_eq!(seg.active_len(), 0);
        assert!(seg.pre_roll.is_empty());
    }

    #[test]
    fn test_flush_on_close_mid_utterance() {
        let mut seg = Segmenter::new(settings());
        for _ in 0..5 {
            seg.push_frame(&frame(1), true);
        }
        let flushed = seg.flush_on_close().unwrap();
        assert_eq!(flushed.len(), 5 * FRAME_BYTES);
        assert_eq!(seg.state(), SpeechState::Inactive);
    }

    #[test]
    fn test_flush_on_close_when_inactive_is_none() {
        let mut seg = Segmenter::new(settings());
        seg.push_frame(&frame(0), false);
        assert!(seg.flush_on_close().is_none());
    }

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring = PreRollRing::new(4);
        ring.push(&[1, 2, 3]);
        ring.push(&[4, 5, 6]);
        assert_eq!(ring.snapshot(), vec![3, 4, 5, 6]);
    }
}
