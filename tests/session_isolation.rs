use chartscribe_core_lib::events::{ActiveTranscriptView, LiveUpdate};

fn update(session_id: u64, segment_seq: u64, transcript: &str) -> LiveUpdate {
    LiveUpdate {
        session_id,
        segment_seq,
        fragment: transcript.split(' ').last().unwrap_or_default().to_string(),
        transcript: transcript.to_string(),
    }
}

#[test]
fn stale_update_from_an_abandoned_session_never_reaches_the_new_view() {
    let mut view = ActiveTranscriptView::default();

    view.switch_to(1);
    assert!(view.apply(&update(1, 0, "session one text")));
    assert_eq!(view.transcript(), "session one text");

    // The consumer switches sessions while a transcription for session 1 is
    // still in flight; its late result must not bleed into session 2.
    view.switch_to(2);
    assert!(!view.apply(&update(1, 1, "session one text late fragment")));
    assert_eq!(view.transcript(), "");

    assert!(view.apply(&update(2, 0, "session two text")));
    assert_eq!(view.transcript(), "session two text");
}

#[test]
fn updates_are_dropped_after_the_view_is_cleared() {
    let mut view = ActiveTranscriptView::default();
    view.switch_to(5);
    assert!(view.apply(&update(5, 0, "kept")));
    view.clear();
    assert!(!view.apply(&update(5, 1, "kept and more")));
    assert_eq!(view.transcript(), "");
    assert!(view.active_session().is_none());
}

#[test]
fn every_update_carries_its_owning_session_id() {
    let late = update(7, 3, "tagged");
    assert_eq!(late.session_id, 7);

    let mut view = ActiveTranscriptView::default();
    view.switch_to(8);
    assert!(!view.apply(&late));
}
