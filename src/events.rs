use serde::{Deserialize, Serialize};

/// Emitted after every successful merge so a consumer can render the
/// transcript incrementally. Tagged with the owning session so stale
/// emissions from an abandoned session can be discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    pub session_id: u64,
    pub segment_seq: u64,
    pub fragment: String,
    pub transcript: String,
}

/// Non-fatal notice that the transcription service is failing for most
/// segments. Capture continues; the consumer decides how to surface it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DegradedNotice {
    pub session_id: u64,
    pub attempted: u32,
    pub failed: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Completed,
    Cancelled,
    StreamError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: u64,
    pub stop_reason: StopReason,
    pub transcript: String,
    pub segments_attempted: u64,
    pub segments_merged: u64,
    pub segments_failed: u64,
    pub duplicates_suppressed: u64,
    pub degraded: bool,
    pub captured_audio_ms: u64,
}

/// Consumer-facing seam for everything a session reports while running.
/// Only `transcript_update` and `service_degraded` carry correctness-
/// relevant state; the rest are presentation hooks with no-op defaults.
pub trait SessionObserver: Send + Sync {
    fn transcript_update(&self, update: LiveUpdate);
    fn service_degraded(&self, notice: DegradedNotice);

    fn transcript_partial(&self, _session_id: u64, _text: &str) {}
    fn segment_rotated(&self, _session_id: u64, _sequence: u64) {}
    fn input_level(&self, _level: f32) {}
    fn session_closed(&self, _summary: &SessionSummary) {}
}

/// Tracks which session the consumer is actually showing and drops updates
/// from any other, so a stale in-flight result from an abandoned session
/// never bleeds into the newly selected session's text.
#[derive(Debug, Default)]
pub struct ActiveTranscriptView {
    active_session: Option<u64>,
    transcript: String,
}

impl ActiveTranscriptView {
    pub fn switch_to(&mut self, session_id: u64) {
        if self.active_session != Some(session_id) {
            self.active_session = Some(session_id);
            self.transcript.clear();
        }
    }

    pub fn clear(&mut self) {
        self.active_session = None;
        self.transcript.clear();
    }

    /// Applies the update if it belongs to the active session; returns
    /// whether it was applied.
    pub fn apply(&mut self, update: &LiveUpdate) -> bool {
        if self.active_session != Some(update.session_id) {
            return false;
        }
        self.transcript = update.transcript.clone();
        true
    }

    pub fn active_session(&self) -> Option<u64> {
        self.active_session
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(session_id: u64, transcript: &str) -> LiveUpdate {
        LiveUpdate {
            session_id,
            segment_seq: 0,
            fragment: transcript.to_string(),
            transcript: transcript.to_string(),
        }
    }

    #[test]
    fn view_ignores_updates_before_any_session_is_selected() {
        let mut view = ActiveTranscriptView::default();
        assert!(!view.apply(&update(1, "hello")));
        assert_eq!(view.transcript(), "");
    }

    #[test]
    fn switching_sessions_clears_the_displayed_text() {
        let mut view = ActiveTranscriptView::default();
        view.switch_to(1);
        assert!(view.apply(&update(1, "first session text")));
        view.switch_to(2);
        assert_eq!(view.transcript(), "");
        assert_eq!(view.active_session(), Some(2));
    }

    #[test]
    fn reselecting_the_same_session_keeps_text() {
        let mut view = ActiveTranscriptView::default();
        view.switch_to(7);
        assert!(view.apply(&update(7, "kept")));
        view.switch_to(7);
        assert_eq!(view.transcript(), "kept");
    }
}
