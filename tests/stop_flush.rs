use chartscribe_core_lib::{
    archive::TranscriptArchive,
    audio::SegmentRotator,
    diagnostics::DiagnosticsManager,
    events::{DegradedNotice, LiveUpdate, SessionObserver, SessionSummary, StopReason},
    session::{CaptureController, CaptureMode, SessionPhase},
    settings::SettingsStore,
    speech::{ScriptedStep, TranscriptionWorker},
};
use std::{
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Default)]
struct RecordingObserver {
    updates: Mutex<Vec<LiveUpdate>>,
    closed: Mutex<Option<SessionSummary>>,
}

impl SessionObserver for RecordingObserver {
    fn transcript_update(&self, update: LiveUpdate) {
        self.updates
            .lock()
            .expect("observer mutex should be available")
            .push(update);
    }

    fn service_degraded(&self, _notice: DegradedNotice) {}

    fn session_closed(&self, summary: &SessionSummary) {
        *self
            .closed
            .lock()
            .expect("observer mutex should be available") = Some(summary.clone());
    }
}

fn temp_controller(stem: &str) -> CaptureController {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be valid")
        .as_nanos();
    let base = std::env::temp_dir();
    let settings_store =
        SettingsStore::from_path(base.join(format!("chartscribe-{stem}-{ts}.json")));
    let archive = TranscriptArchive::from_paths(
        base.join(format!("chartscribe-{stem}-{ts}-archive.json")),
        base.join(format!("chartscribe-{stem}-{ts}-archive.key")),
    )
    .expect("archive should init");
    let diagnostics = DiagnosticsManager::from_paths(
        base.join(format!("chartscribe-{stem}-{ts}-diag.json")),
        base.join(format!("chartscribe-{stem}-{ts}-exports")),
    )
    .expect("diagnostics should init");
    CaptureController::from_parts(settings_store, archive, diagnostics)
        .expect("controller should init")
}

#[test]
fn stop_racing_an_exact_threshold_rotation_yields_no_duplicate_segment() {
    let mut rotator = SegmentRotator::new(1_000, 1_000);
    let emitted = rotator.push_chunk(&vec![0.2_f32; 1_000]);
    assert_eq!(emitted.len(), 1);
    // Manual stop right after the rotation: the flush must not produce a
    // second segment from the same audio.
    assert!(rotator.flush().is_none());
}

#[test]
fn stop_mid_segment_flushes_exactly_one_final_segment() {
    let mut rotator = SegmentRotator::new(1_000, 1_000);
    let emitted = rotator.push_chunk(&vec![0.2_f32; 1_400]);
    assert_eq!(emitted.len(), 1);
    let tail = rotator.flush().expect("in-flight audio should flush");
    assert_eq!(tail.samples.len(), 400);
    assert!(rotator.flush().is_none());
}

#[tokio::test]
async fn manual_stop_waits_for_the_final_segment_transcription() {
    let controller = temp_controller("stop-flush");
    let observer = Arc::new(RecordingObserver::default());
    let worker = TranscriptionWorker::with_script([ScriptedStep::text(
        "final fragment available at stop",
    )
    .with_delay_ms(30)])
    .with_partial_delay_ms(0);

    let session_id = controller
        .start_session_with_worker(observer.clone(), CaptureMode::Fixture, worker)
        .await
        .expect("session should start");

    let summary = controller.stop_session().await.expect("stop should succeed");

    // Fixture audio is shorter than the rotation threshold, so the stop
    // flush is the only segment, and its text is already merged here.
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.segments_attempted, 1);
    assert_eq!(summary.transcript, "final fragment available at stop");

    let archived = controller.archived_session_text(session_id).await;
    assert_eq!(archived.as_deref(), Some("final fragment available at stop"));

    let closed = observer
        .closed
        .lock()
        .expect("observer mutex should be available")
        .clone()
        .expect("session close should have been observed");
    assert_eq!(closed.transcript, summary.transcript);
    assert_eq!(
        observer
            .updates
            .lock()
            .expect("observer mutex should be available")
            .len(),
        1
    );

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Stopped);
    assert!(snapshot.session_id.is_none());
}

#[tokio::test]
async fn second_stop_reports_not_running() {
    let controller = temp_controller("stop-twice");
    let observer = Arc::new(RecordingObserver::default());
    let worker =
        TranscriptionWorker::with_script([ScriptedStep::text("once")]).with_partial_delay_ms(0);

    controller
        .start_session_with_worker(observer, CaptureMode::Fixture, worker)
        .await
        .expect("session should start");
    controller.stop_session().await.expect("first stop succeeds");
    assert!(controller.stop_session().await.is_err());
}
