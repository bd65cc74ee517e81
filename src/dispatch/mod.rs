use crate::{
    audio::CapturedSegment,
    events::{DegradedNotice, LiveUpdate, SessionObserver},
    speech::{SpeechError, TranscriptionWorker},
    transcript::sanitize_fragment,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEGRADED_MIN_ATTEMPTS: u32 = 3;
pub const DEGRADED_FAILURE_RATIO: f32 = 0.70;
const DUPLICATE_SUPPRESS_WINDOW: Duration = Duration::from_secs(1);

/// What happened to a fragment offered to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended {
        fragment: String,
        transcript: String,
    },
    DuplicateSuppressed,
    Empty,
}

/// The session's transcript: an append-only, space-joined fragment sequence.
/// Fragments are never reordered and never rolled back. A fragment equal to
/// the immediately preceding append within a one-second window is dropped,
/// which absorbs double delivery from overlapping live-update callbacks.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    text: String,
    fragment_count: u64,
    last_append: Option<(String, Instant)>,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, raw: &str) -> AppendOutcome {
        self.append_at(raw, Instant::now())
    }

    pub fn append_at(&mut self, raw: &str, at: Instant) -> AppendOutcome {
        let fragment = raw.trim();
        if fragment.is_empty() {
            return AppendOutcome::Empty;
        }

        if let Some((last_text, last_at)) = &self.last_append {
            if last_text == fragment
                && at.saturating_duration_since(*last_at) < DUPLICATE_SUPPRESS_WINDOW
            {
                return AppendOutcome::DuplicateSuppressed;
            }
        }

        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(fragment);
        self.fragment_count += 1;
        self.last_append = Some((fragment.to_string(), at));

        AppendOutcome::Appended {
            fragment: fragment.to_string(),
            transcript: self.text.clone(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fragment_count(&self) -> u64 {
        self.fragment_count
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Failure-rate guard over segment transcription attempts. Raises the
/// degraded notice once the sample is meaningful (>= 3 attempts) and the
/// failure ratio crosses 70%, then stays latched until the ratio recovers,
/// so one qualifying window produces exactly one notice.
#[derive(Debug, Default, Clone)]
pub struct ServiceHealthGuard {
    attempted: u32,
    failed: u32,
    notice_raised: bool,
}

impl ServiceHealthGuard {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        if self.notice_raised && !self.ratio_exceeded() {
            self.notice_raised = false;
        }
    }

    /// Returns true when this failure crosses into a qualifying window and
    /// the notice should be raised.
    pub fn record_failure(&mut self) -> bool {
        self.attempted += 1;
        self.failed += 1;
        if self.attempted >= DEGRADED_MIN_ATTEMPTS && self.ratio_exceeded() && !self.notice_raised {
            self.notice_raised = true;
            return true;
        }
        false
    }

    pub fn attempted(&self) -> u32 {
        self.attempted
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn is_degraded(&self) -> bool {
        self.notice_raised
    }

    fn ratio_exceeded(&self) -> bool {
        if self.attempted == 0 {
            return false;
        }
        (self.failed as f32 / self.attempted as f32) > DEGRADED_FAILURE_RATIO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub session_id: u64,
    pub segments_attempted: u64,
    pub segments_merged: u64,
    pub segments_failed: u64,
    pub duplicates_suppressed: u64,
    pub degraded_notices: u32,
    pub audio_samples: u64,
    pub transcript: String,
}

/// Owns all mutation of the session transcript. Segments arrive in sequence
/// order over the per-session queue and are transcribed one at a time, so
/// merges happen in recording order by construction; the buffer mutex
/// additionally serializes them against snapshot readers. A failed segment
/// contributes no text and never halts the session.
pub struct TranscriptionDispatcher {
    session_id: u64,
    worker: TranscriptionWorker,
    buffer: Arc<Mutex<TranscriptBuffer>>,
    observer: Arc<dyn SessionObserver>,
    guard: ServiceHealthGuard,
    merged: u64,
    suppressed: u64,
    degraded_notices: u32,
    audio_samples: u64,
}

impl TranscriptionDispatcher {
    pub fn new(
        session_id: u64,
        worker: TranscriptionWorker,
        buffer: Arc<Mutex<TranscriptBuffer>>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            session_id,
            worker,
            buffer,
            observer,
            guard: ServiceHealthGuard::default(),
            merged: 0,
            suppressed: 0,
            degraded_notices: 0,
            audio_samples: 0,
        }
    }

    /// Transcribes and merges one segment. Returns the live update when the
    /// segment contributed text.
    pub async fn ingest_segment(
        &mut self,
        segment: CapturedSegment,
        cancel_token: &CancellationToken,
    ) -> Option<LiveUpdate> {
        self.audio_samples += segment.samples.len() as u64;

        let observer = self.observer.clone();
        let session_id = self.session_id;
        let result = self
            .worker
            .transcribe_segment(&segment.samples, cancel_token, |partial, _elapsed_ms| {
                observer.transcript_partial(session_id, partial);
            })
            .await;

        match result {
            Ok(Some(text)) => {
                self.guard.record_success();
                let fragment = sanitize_fragment(&text);
                let outcome = {
                    let mut buffer = self.buffer.lock().await;
                    buffer.append(&fragment)
                };
                match outcome {
                    AppendOutcome::Appended {
                        fragment,
                        transcript,
                    } => {
                        self.merged += 1;
                        let update = LiveUpdate {
                            session_id: self.session_id,
                            segment_seq: segment.sequence,
                            fragment,
                            transcript,
                        };
                        self.observer.transcript_update(update.clone());
                        Some(update)
                    }
                    AppendOutcome::DuplicateSuppressed => {
                        self.suppressed += 1;
                        None
                    }
                    AppendOutcome::Empty => None,
                }
            }
            Ok(None) => {
                self.guard.record_success();
                None
            }
            Err(SpeechError::Cancelled) => None,
            Err(err) => {
                eprintln!(
                    "chartscribe: segment {} transcription failed: {err}",
                    segment.sequence
                );
                if self.guard.record_failure() {
                    self.degraded_notices += 1;
                    self.observer.service_degraded(DegradedNotice {
                        session_id: self.session_id,
                        attempted: self.guard.attempted(),
                        failed: self.guard.failed(),
                        message: "Transcription service is failing for most segments; capture continues."
                            .to_string(),
                    });
                }
                None
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.guard.is_degraded()
    }

    pub async fn into_summary(self) -> DispatchSummary {
        let transcript = self.buffer.lock().await.text().to_string();
        DispatchSummary {
            session_id: self.session_id,
            segments_attempted: self.guard.attempted() as u64,
            segments_merged: self.merged,
            segments_failed: self.guard.failed() as u64,
            duplicates_suppressed: self.suppressed,
            degraded_notices: self.degraded_notices,
            audio_samples: self.audio_samples,
            transcript,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_joins_fragments_with_single_spaces() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("patient stable");
        buffer.append("  vitals normal ");
        assert_eq!(buffer.text(), "patient stable vitals normal");
        assert_eq!(buffer.fragment_count(), 2);
    }

    #[test]
    fn buffer_drops_empty_fragments() {
        let mut buffer = TranscriptBuffer::new();
        assert_eq!(buffer.append("   "), AppendOutcome::Empty);
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_suppresses_immediate_duplicate() {
        let mut buffer = TranscriptBuffer::new();
        let now = Instant::now();
        buffer.append_at("bp one twenty over eighty", now);
        let second = buffer.append_at("bp one twenty over eighty", now + Duration::from_millis(200));
        assert_eq!(second, AppendOutcome::DuplicateSuppressed);
        assert_eq!(buffer.fragment_count(), 1);
    }

    #[test]
    fn buffer_allows_repeat_after_window() {
        let mut buffer = TranscriptBuffer::new();
        let now = Instant::now();
        buffer.append_at("again", now);
        let second = buffer.append_at("again", now + Duration::from_millis(1_100));
        assert!(matches!(second, AppendOutcome::Appended { .. }));
        assert_eq!(buffer.text(), "again again");
    }

    #[test]
    fn guard_raises_once_per_qualifying_window() {
        let mut guard = ServiceHealthGuard::default();
        assert!(!guard.record_failure());
        assert!(!guard.record_failure());
        // third attempt, ratio 3/3 > 0.70: raise
        assert!(guard.record_failure());
        // still inside the same window: no second notice
        assert!(!guard.record_failure());
        assert!(guard.is_degraded());
    }

    #[test]
    fn guard_rearms_after_recovery() {
        let mut guard = ServiceHealthGuard::default();
        for _ in 0..3 {
            guard.record_failure();
        }
        assert!(guard.is_degraded());
        // successes pull the ratio back under the threshold
        for _ in 0..2 {
            guard.record_success();
        }
        assert!(!guard.is_degraded());
        // a fresh qualifying window raises again: 4/6 stays under, 5/7 crosses
        assert!(!guard.record_failure());
        assert!(guard.record_failure());
    }

    #[test]
    fn guard_needs_minimum_attempts() {
        let mut guard = ServiceHealthGuard::default();
        assert!(!guard.record_failure());
        assert!(!guard.record_failure());
        assert!(!guard.is_degraded());
    }
}
