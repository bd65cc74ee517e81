use chartscribe_core_lib::{
    audio::{CapturedSegment, SegmentClose},
    dispatch::{TranscriptBuffer, TranscriptionDispatcher},
    events::{DegradedNotice, LiveUpdate, SessionObserver},
    speech::{ScriptedStep, TranscriptionWorker},
};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingObserver {
    updates: Mutex<Vec<LiveUpdate>>,
}

impl SessionObserver for RecordingObserver {
    fn transcript_update(&self, update: LiveUpdate) {
        self.updates
            .lock()
            .expect("observer mutex should be available")
            .push(update);
    }

    fn service_degraded(&self, _notice: DegradedNotice) {}
}

fn segment(sequence: u64) -> CapturedSegment {
    CapturedSegment {
        sequence,
        start_offset_ms: sequence * 1_000,
        closed_by: SegmentClose::Rotated,
        samples: vec![0.05; 1_600],
    }
}

#[tokio::test]
async fn transcript_is_space_joined_non_empty_results_in_segment_order() {
    // Varied per-segment latency and a mid-stream failure: the transcript
    // must still be the non-empty results joined in recording order.
    let worker = TranscriptionWorker::with_script([
        ScriptedStep::text("alpha").with_delay_ms(40),
        ScriptedStep::failure("transient backend outage"),
        ScriptedStep::text("gamma").with_delay_ms(5),
        ScriptedStep::text("   "),
        ScriptedStep::text("delta").with_delay_ms(15),
    ])
    .with_partial_delay_ms(0);

    let observer = Arc::new(RecordingObserver::default());
    let buffer = Arc::new(AsyncMutex::new(TranscriptBuffer::new()));
    let mut dispatcher = TranscriptionDispatcher::new(1, worker, buffer, observer.clone());
    let cancel = CancellationToken::new();

    for sequence in 0..5 {
        dispatcher.ingest_segment(segment(sequence), &cancel).await;
    }
    let summary = dispatcher.into_summary().await;

    assert_eq!(summary.transcript, "alpha gamma delta");
    assert_eq!(summary.segments_attempted, 5);
    assert_eq!(summary.segments_merged, 3);
    assert_eq!(summary.segments_failed, 1);
}

#[tokio::test]
async fn live_updates_grow_the_transcript_monotonically() {
    let worker = TranscriptionWorker::with_script([
        ScriptedStep::text("assessment"),
        ScriptedStep::text("and plan"),
        ScriptedStep::text("follows"),
    ])
    .with_partial_delay_ms(0);

    let observer = Arc::new(RecordingObserver::default());
    let buffer = Arc::new(AsyncMutex::new(TranscriptBuffer::new()));
    let mut dispatcher = TranscriptionDispatcher::new(3, worker, buffer, observer.clone());
    let cancel = CancellationToken::new();

    for sequence in 0..3 {
        dispatcher.ingest_segment(segment(sequence), &cancel).await;
    }

    let updates = observer
        .updates
        .lock()
        .expect("observer mutex should be available");
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[0].transcript, "assessment");
    assert_eq!(updates[1].transcript, "assessment and plan");
    assert_eq!(updates[2].transcript, "assessment and plan follows");
    assert!(updates
        .windows(2)
        .all(|pair| pair[0].segment_seq < pair[1].segment_seq));
    assert!(updates.iter().all(|update| update.session_id == 3));
}

#[tokio::test]
async fn failure_never_rolls_back_prior_merges() {
    let worker = TranscriptionWorker::with_script([
        ScriptedStep::text("kept"),
        ScriptedStep::failure("endpoint 500"),
    ])
    .with_partial_delay_ms(0);

    let observer = Arc::new(RecordingObserver::default());
    let buffer = Arc::new(AsyncMutex::new(TranscriptBuffer::new()));
    let mut dispatcher = TranscriptionDispatcher::new(9, worker, buffer, observer);
    let cancel = CancellationToken::new();

    dispatcher.ingest_segment(segment(0), &cancel).await;
    dispatcher.ingest_segment(segment(1), &cancel).await;
    let summary = dispatcher.into_summary().await;

    assert_eq!(summary.transcript, "kept");
    assert_eq!(summary.segments_failed, 1);
}
