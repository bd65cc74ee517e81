use crate::{
    archive::{ArchiveError, RetentionPolicy, TranscriptArchive},
    audio::{
        fixture_speech_frames, AudioCaptureService, AudioError, CaptureOptions, CaptureSummary,
        CapturedSegment, SegmentClose, TARGET_SAMPLE_RATE,
    },
    diagnostics::{DiagnosticsError, DiagnosticsManager, DiagnosticsStatus, SessionMetricRecord},
    dispatch::{DispatchSummary, TranscriptBuffer, TranscriptionDispatcher},
    events::{SessionObserver, SessionSummary, StopReason},
    permissions::{classify_capture_error, AccessSnapshot, CaptureAccess, PermissionManager},
    settings::{
        clamp_retry_backoff_ms, clamp_retry_limit, clamp_rotation_threshold_ms, CaptureSettings,
        SettingsError, SettingsStore,
    },
    speech::{RemoteEndpointConfig, SpeechError, TranscriptionWorker},
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Session lifecycle: `SegmentRotating` is the brief window in which the
/// current segment is finalized and the next one begins; only a manual stop
/// reaches `Stopped`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Recording,
    SegmentRotating,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session_id: Option<u64>,
    pub last_fragment: Option<String>,
    pub transcript_chars: u64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    #[default]
    Microphone,
    Fixture,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("a capture session is already active")]
    AlreadyRunning,
    #[error("no capture session is active")]
    NotRunning,
    #[error("capture access {access:?}: {message}")]
    Access {
        access: CaptureAccess,
        message: String,
    },
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("speech error: {0}")]
    Speech(#[from] SpeechError),
    #[error("transcript archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("diagnostics error: {0}")]
    Diagnostics(#[from] DiagnosticsError),
    #[error("{0}")]
    Runtime(String),
}

struct ActiveSession {
    session_id: u64,
    started_at: Instant,
    buffer: Arc<Mutex<TranscriptBuffer>>,
    dispatch: tokio::task::JoinHandle<DispatchSummary>,
    capture: std::thread::JoinHandle<Result<CaptureSummary, AudioError>>,
    observer: Arc<dyn SessionObserver>,
}

/// Owns one capture session at a time: the blocking capture thread that
/// rotates the microphone stream into segments, and the dispatch task that
/// transcribes and merges them in order. Stopping flushes the in-flight
/// segment and waits for its text before returning; cancelling abandons
/// future rotations but lets an already-dispatched transcription finish.
pub struct CaptureController {
    audio: AudioCaptureService,
    settings_store: SettingsStore,
    settings: Mutex<CaptureSettings>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    permission_manager: Mutex<PermissionManager>,
    archive: Arc<Mutex<TranscriptArchive>>,
    diagnostics: Mutex<DiagnosticsManager>,
    cancel_token: Mutex<Option<CancellationToken>>,
    stop_flag: Mutex<Option<Arc<AtomicBool>>>,
    active: Mutex<Option<ActiveSession>>,
    session_counter: AtomicU64,
    level_monitor: Mutex<Option<Arc<AtomicBool>>>,
}

impl CaptureController {
    pub fn new() -> Result<Self, ControllerError> {
        let settings_store = SettingsStore::new()?;
        let archive = TranscriptArchive::new()?;
        let diagnostics = DiagnosticsManager::new()?;
        Self::from_parts(settings_store, archive, diagnostics)
    }

    /// Wires the controller from explicit stores; tests point these at temp
    /// paths.
    pub fn from_parts(
        settings_store: SettingsStore,
        archive: TranscriptArchive,
        diagnostics: DiagnosticsManager,
    ) -> Result<Self, ControllerError> {
        let audio = AudioCaptureService::default();
        let settings = settings_store.load()?;
        let permission_manager = PermissionManager::new(&audio);

        Ok(Self {
            audio,
            settings_store,
            settings: Mutex::new(settings),
            snapshot: Arc::new(Mutex::new(SessionSnapshot {
                phase: SessionPhase::Idle,
                session_id: None,
                last_fragment: None,
                transcript_chars: 0,
                degraded: false,
            })),
            permission_manager: Mutex::new(permission_manager),
            archive: Arc::new(Mutex::new(archive)),
            diagnostics: Mutex::new(diagnostics),
            cancel_token: Mutex::new(None),
            stop_flag: Mutex::new(None),
            active: Mutex::new(None),
            session_counter: AtomicU64::new(0),
            level_monitor: Mutex::new(None),
        })
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub async fn load_settings(&self) -> CaptureSettings {
        self.settings.lock().await.clone()
    }

    pub async fn update_settings(
        &self,
        settings: CaptureSettings,
    ) -> Result<CaptureSettings, ControllerError> {
        let settings = settings.clamped();
        self.settings_store.save(&settings)?;
        {
            let mut current = self.settings.lock().await;
            *current = settings.clone();
        }
        Ok(settings)
    }

    pub async fn is_session_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// The live transcript of the active session, if any.
    pub async fn session_transcript(&self) -> Option<String> {
        let buffer = {
            let active = self.active.lock().await;
            active.as_ref().map(|session| session.buffer.clone())
        }?;
        let buffer = buffer.lock().await;
        Some(buffer.text().to_string())
    }

    /// Starts a session with a transcription worker built from settings.
    pub async fn start_session(
        &self,
        observer: Arc<dyn SessionObserver>,
        mode: CaptureMode,
    ) -> Result<u64, ControllerError> {
        let settings = self.settings.lock().await.clone();
        let worker = build_remote_worker(&settings)?;
        self.start_session_with_worker(observer, mode, worker).await
    }

    /// Starts a session with an explicit worker; the seam the harness and
    /// tests use to substitute a scripted backend.
    pub async fn start_session_with_worker(
        &self,
        observer: Arc<dyn SessionObserver>,
        mode: CaptureMode,
        worker: TranscriptionWorker,
    ) -> Result<u64, ControllerError> {
        {
            let active = self.active.lock().await;
            if active.is_some() {
                return Err(ControllerError::AlreadyRunning);
            }
        }

        let settings = self.settings.lock().await.clone();

        // Microphone acquisition failures are fatal to the start, classified,
        // and never retried.
        if mode == CaptureMode::Microphone {
            if let Err(err) = self.audio.probe_input_device(settings.input_device.as_deref()) {
                let (access, message) = classify_capture_error(&err);
                return Err(ControllerError::Access { access, message });
            }
        }

        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel_token = CancellationToken::new();
        {
            let mut slot = self.cancel_token.lock().await;
            *slot = Some(cancel_token.clone());
        }
        let stop_flag = Arc::new(AtomicBool::new(false));
        {
            let mut slot = self.stop_flag.lock().await;
            *slot = Some(stop_flag.clone());
        }

        {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.phase = SessionPhase::Recording;
            snapshot.session_id = Some(session_id);
            snapshot.last_fragment = None;
            snapshot.transcript_chars = 0;
            snapshot.degraded = false;
        }

        let buffer = Arc::new(Mutex::new(TranscriptBuffer::new()));
        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel::<CapturedSegment>();

        let audio = self.audio.clone();
        let input_device = settings.input_device.clone();
        let options = CaptureOptions {
            rotation_threshold_ms: clamp_rotation_threshold_ms(settings.rotation_threshold_ms),
        };
        let cancel_for_capture = cancel_token.clone();
        let stop_for_capture = stop_flag.clone();
        let observer_for_capture = observer.clone();
        let snapshot_for_capture = self.snapshot.clone();

        let capture = std::thread::spawn(move || {
            let deliver = |segment: CapturedSegment| {
                if segment.closed_by == SegmentClose::Rotated {
                    observer_for_capture.segment_rotated(session_id, segment.sequence);
                    if let Ok(mut snapshot) = snapshot_for_capture.try_lock() {
                        snapshot.phase = SessionPhase::SegmentRotating;
                    }
                }
                let _ = segment_tx.send(segment);
                if let Ok(mut snapshot) = snapshot_for_capture.try_lock() {
                    if snapshot.phase == SessionPhase::SegmentRotating {
                        snapshot.phase = SessionPhase::Recording;
                    }
                }
            };

            match mode {
                CaptureMode::Fixture => {
                    Ok(audio.rotate_prepared_frames(&fixture_speech_frames(), options, deliver))
                }
                CaptureMode::Microphone => audio.capture_rotating_segments(
                    input_device.as_deref(),
                    options,
                    || cancel_for_capture.is_cancelled(),
                    || stop_for_capture.load(Ordering::Relaxed),
                    deliver,
                ),
            }
        });

        let buffer_for_dispatch = buffer.clone();
        let observer_for_dispatch = observer.clone();
        let archive_for_dispatch = self.archive.clone();
        let snapshot_for_dispatch = self.snapshot.clone();
        let cancel_for_dispatch = cancel_token.clone();

        let dispatch = tokio::spawn(async move {
            let mut dispatcher = TranscriptionDispatcher::new(
                session_id,
                worker,
                buffer_for_dispatch,
                observer_for_dispatch,
            );
            while let Some(segment) = segment_rx.recv().await {
                if cancel_for_dispatch.is_cancelled() {
                    break;
                }
                let sequence = segment.sequence;
                let merged = dispatcher.ingest_segment(segment, &cancel_for_dispatch).await;
                {
                    let mut snapshot = snapshot_for_dispatch.lock().await;
                    snapshot.degraded = dispatcher.is_degraded();
                    if let Some(update) = &merged {
                        snapshot.last_fragment = Some(update.fragment.clone());
                        snapshot.transcript_chars = update.transcript.chars().count() as u64;
                    }
                }
                if let Some(update) = merged {
                    let mut archive = archive_for_dispatch.lock().await;
                    if let Err(err) =
                        archive.append_fragment(session_id, sequence, &update.fragment)
                    {
                        eprintln!("chartscribe: transcript archive append failed: {err}");
                    }
                }
            }
            dispatcher.into_summary().await
        });

        let mut active = self.active.lock().await;
        *active = Some(ActiveSession {
            session_id,
            started_at: Instant::now(),
            buffer,
            dispatch,
            capture,
            observer,
        });

        Ok(session_id)
    }

    /// Manual stop. The in-flight segment is flushed and transcribed before
    /// this returns, so the final text is part of the summary.
    pub async fn stop_session(&self) -> Result<SessionSummary, ControllerError> {
        let active = {
            let mut slot = self.active.lock().await;
            slot.take().ok_or(ControllerError::NotRunning)?
        };
        if let Some(flag) = self.stop_flag.lock().await.clone() {
            flag.store(true, Ordering::Relaxed);
        }

        self.finish_session(active, None).await
    }

    /// Cancels the session: no further rotations, no final flush. A
    /// transcription already dispatched for a prior segment is allowed to
    /// complete and may still have merged before teardown.
    pub async fn cancel_session(&self) -> Result<SessionSummary, ControllerError> {
        let active = {
            let mut slot = self.active.lock().await;
            slot.take().ok_or(ControllerError::NotRunning)?
        };
        if let Some(token) = self.cancel_token.lock().await.clone() {
            token.cancel();
        }
        if let Some(flag) = self.stop_flag.lock().await.clone() {
            flag.store(true, Ordering::Relaxed);
        }

        self.finish_session(active, Some(StopReason::Cancelled)).await
    }

    async fn finish_session(
        &self,
        active: ActiveSession,
        forced_reason: Option<StopReason>,
    ) -> Result<SessionSummary, ControllerError> {
        let ActiveSession {
            session_id,
            started_at,
            buffer: _,
            dispatch,
            capture,
            observer,
        } = active;

        let dispatch_summary = dispatch
            .await
            .map_err(|err| ControllerError::Runtime(format!("dispatch join failure: {err}")))?;
        let capture_result = tokio::task::spawn_blocking(move || capture.join())
            .await
            .map_err(|err| ControllerError::Runtime(format!("capture join failure: {err}")))?
            .map_err(|_| ControllerError::Runtime("capture thread panicked".to_string()))?;

        let (capture_summary, stop_reason) = match capture_result {
            Ok(summary) => (summary, forced_reason.unwrap_or(StopReason::Completed)),
            Err(AudioError::Cancelled) => (
                CaptureSummary::default(),
                forced_reason.unwrap_or(StopReason::Cancelled),
            ),
            Err(err) => {
                eprintln!("chartscribe: capture ended with stream error: {err}");
                (CaptureSummary::default(), StopReason::StreamError)
            }
        };

        let captured_audio_ms =
            dispatch_summary.audio_samples * 1_000 / TARGET_SAMPLE_RATE as u64;
        let summary = SessionSummary {
            session_id,
            stop_reason,
            transcript: dispatch_summary.transcript.clone(),
            segments_attempted: dispatch_summary.segments_attempted,
            segments_merged: dispatch_summary.segments_merged,
            segments_failed: dispatch_summary.segments_failed,
            duplicates_suppressed: dispatch_summary.duplicates_suppressed,
            degraded: dispatch_summary.degraded_notices > 0,
            captured_audio_ms,
        };

        self.record_session_metrics(&summary, &dispatch_summary, &capture_summary, started_at)
            .await;

        {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.phase = match stop_reason {
                StopReason::Completed => SessionPhase::Stopped,
                StopReason::Cancelled | StopReason::StreamError => SessionPhase::Idle,
            };
            snapshot.session_id = None;
        }
        {
            let mut slot = self.cancel_token.lock().await;
            *slot = None;
        }
        {
            let mut slot = self.stop_flag.lock().await;
            *slot = None;
        }

        observer.session_closed(&summary);
        Ok(summary)
    }

    async fn record_session_metrics(
        &self,
        summary: &SessionSummary,
        dispatch_summary: &DispatchSummary,
        capture_summary: &CaptureSummary,
        started_at: Instant,
    ) {
        let opt_in = self.settings.lock().await.diagnostics_opt_in;
        if !opt_in {
            return;
        }
        let capture_ms = if capture_summary.captured_ms > 0 {
            capture_summary.captured_ms
        } else {
            started_at.elapsed().as_millis() as u64
        };
        let record = SessionMetricRecord {
            session_id: summary.session_id,
            timestamp_utc_ms: now_utc_ms(),
            segments_captured: capture_summary.segments_emitted,
            segments_attempted: summary.segments_attempted,
            segments_merged: summary.segments_merged,
            segments_failed: summary.segments_failed,
            duplicates_suppressed: summary.duplicates_suppressed,
            degraded_notices: dispatch_summary.degraded_notices,
            audio_duration_ms: summary.captured_audio_ms,
            capture_ms,
            success: summary.stop_reason == StopReason::Completed,
        };
        if let Err(err) = self.diagnostics.lock().await.record_session(record) {
            eprintln!("chartscribe: diagnostics record failed: {err}");
        }
    }

    pub async fn get_diagnostics_status(&self) -> DiagnosticsStatus {
        let opt_in = self.settings.lock().await.diagnostics_opt_in;
        self.diagnostics.lock().await.status(opt_in)
    }

    pub async fn archived_session_text(&self, session_id: u64) -> Option<String> {
        self.archive.lock().await.session_text(session_id)
    }

    pub async fn set_retention_policy(
        &self,
        policy: RetentionPolicy,
    ) -> Result<RetentionPolicy, ControllerError> {
        self.archive
            .lock()
            .await
            .set_retention_policy(policy)
            .map_err(ControllerError::from)
    }

    pub async fn prune_archive_now(&self) -> Result<usize, ControllerError> {
        self.archive
            .lock()
            .await
            .prune_now()
            .map_err(ControllerError::from)
    }

    pub async fn clear_archive(&self) -> Result<usize, ControllerError> {
        self.archive
            .lock()
            .await
            .clear()
            .map_err(ControllerError::from)
    }

    pub async fn list_input_devices(&self) -> Vec<String> {
        self.audio.list_input_devices()
    }

    pub async fn permission_snapshot(&self) -> AccessSnapshot {
        self.permission_manager.lock().await.snapshot()
    }

    pub async fn request_capture_access(&self) -> AccessSnapshot {
        let input_device = self.settings.lock().await.input_device.clone();
        self.permission_manager
            .lock()
            .await
            .request_capture_access(&self.audio, input_device.as_deref())
    }

    /// Drives a UI level meter; losing a sample only affects the meter,
    /// never the transcript.
    pub async fn start_level_monitor(
        &self,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(), ControllerError> {
        let mut slot = self.level_monitor.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let settings = self.settings.lock().await.clone();
        let audio = self.audio.clone();
        let input_device = settings.input_device.clone();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop_flag.clone();

        std::thread::spawn(move || {
            let monitor = match audio.start_level_monitor(input_device.as_deref()) {
                Ok(row) => row,
                Err(err) => {
                    eprintln!("chartscribe: level monitor failed to start: {err}");
                    return;
                }
            };

            let _stream = monitor.stream;
            let mut latest_level = 0.0f32;
            let mut last_emit = Instant::now();
            loop {
                if stop_for_thread.load(Ordering::Relaxed) {
                    break;
                }
                if let Ok(err) = monitor.error_rx.try_recv() {
                    eprintln!("chartscribe: level monitor stream error: {err}");
                    break;
                }
                match monitor.level_rx.recv_timeout(Duration::from_millis(40)) {
                    Ok(level) => {
                        latest_level = level.clamp(0.0, 1.0);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if last_emit.elapsed() >= Duration::from_millis(80) {
                    observer.input_level(latest_level);
                    last_emit = Instant::now();
                }
            }
        });

        *slot = Some(stop_flag);
        Ok(())
    }

    pub async fn stop_level_monitor(&self) {
        if let Some(stop_flag) = self.level_monitor.lock().await.take() {
            stop_flag.store(true, Ordering::Relaxed);
        }
    }
}

fn build_remote_worker(settings: &CaptureSettings) -> Result<TranscriptionWorker, ControllerError> {
    let config = RemoteEndpointConfig {
        endpoint_url: settings.endpoint_url.clone(),
        auth_token_env: settings.auth_token_env.clone(),
        language: settings.language.clone(),
        credential_mode: settings.credential_mode,
        ..RemoteEndpointConfig::default()
    };
    Ok(TranscriptionWorker::new_remote(config)?
        .with_retry_limit(clamp_retry_limit(settings.retry_limit))
        .with_retry_backoff(Duration::from_millis(clamp_retry_backoff_ms(
            settings.retry_backoff_ms,
        ))))
}

fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_controller(stem: &str) -> CaptureController {
        let ts = now_utc_ms();
        let base = std::env::temp_dir();
        let settings_store =
            SettingsStore::from_path(base.join(format!("chartscribe-session-{stem}-{ts}.json")));
        let archive = TranscriptArchive::from_paths(
            base.join(format!("chartscribe-session-{stem}-{ts}-archive.json")),
            base.join(format!("chartscribe-session-{stem}-{ts}-archive.key")),
        )
        .expect("archive should init");
        let diagnostics = DiagnosticsManager::from_paths(
            base.join(format!("chartscribe-session-{stem}-{ts}-diag.json")),
            base.join(format!("chartscribe-session-{stem}-{ts}-exports")),
        )
        .expect("diagnostics should init");
        CaptureController::from_parts(settings_store, archive, diagnostics)
            .expect("controller should init")
    }

    #[tokio::test]
    async fn controller_starts_idle() {
        let controller = temp_controller("idle");
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert!(snapshot.session_id.is_none());
        assert!(!controller.is_session_active().await);
    }

    #[tokio::test]
    async fn stop_without_session_is_not_running() {
        let controller = temp_controller("notrunning");
        let err = controller.stop_session().await.expect_err("must error");
        assert!(matches!(err, ControllerError::NotRunning));
    }

    #[tokio::test]
    async fn settings_update_is_clamped_and_persisted() {
        let controller = temp_controller("clamp");
        let mut settings = controller.load_settings().await;
        settings.rotation_threshold_ms = 60_000;
        let updated = controller
            .update_settings(settings)
            .await
            .expect("update should succeed");
        assert_eq!(updated.rotation_threshold_ms, 23_000);
        assert_eq!(
            controller.load_settings().await.rotation_threshold_ms,
            23_000
        );
    }
}
