use chartscribe_core_lib::{
    archive::TranscriptArchive,
    diagnostics::DiagnosticsManager,
    events::{DegradedNotice, LiveUpdate, SessionObserver},
    session::{CaptureController, CaptureMode},
    settings::SettingsStore,
    speech::{ScriptedStep, TranscriptionWorker},
};
use serde::Serialize;
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug)]
enum HarnessMode {
    Session,
    Soak,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HarnessReport {
    sessions: usize,
    failed_sessions: usize,
    merged_segments: u64,
    live_updates: usize,
    transcripts: Vec<String>,
}

#[derive(Default)]
struct CountingObserver {
    updates: Mutex<Vec<LiveUpdate>>,
}

impl SessionObserver for CountingObserver {
    fn transcript_update(&self, update: LiveUpdate) {
        self.updates
            .lock()
            .expect("observer mutex should be available")
            .push(update);
    }

    fn service_degraded(&self, notice: DegradedNotice) {
        eprintln!(
            "harness: degraded notice for session {} ({}/{} failed)",
            notice.session_id, notice.failed, notice.attempted
        );
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("capture harness failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let mode = parse_mode(args.get(1).map(String::as_str).unwrap_or("session"))?;
    let output_path = parse_arg_value(&args, "--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_output_path(&mode));

    let report = match mode {
        HarnessMode::Session => run_sessions(1).await?,
        HarnessMode::Soak => {
            let sessions = parse_arg_value(&args, "--sessions")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(25);
            run_sessions(sessions).await?
        }
    };

    write_json_report(&output_path, &report)?;
    println!("harness report written to {}", output_path.display());
    Ok(())
}

async fn run_sessions(count: usize) -> Result<HarnessReport, String> {
    let controller = build_controller()?;
    let observer = Arc::new(CountingObserver::default());
    let mut failed = 0usize;
    let mut merged = 0u64;
    let mut transcripts = Vec::new();

    for idx in 0..count {
        let worker = TranscriptionWorker::with_script([ScriptedStep::text(format!(
            "scripted dictation pass {idx}"
        ))])
        .with_partial_delay_ms(0);

        let started = controller
            .start_session_with_worker(observer.clone(), CaptureMode::Fixture, worker)
            .await;
        if started.is_err() {
            failed += 1;
            continue;
        }
        match controller.stop_session().await {
            Ok(summary) => {
                merged += summary.segments_merged;
                transcripts.push(summary.transcript);
            }
            Err(err) => {
                eprintln!("harness: session {idx} failed to stop: {err}");
                failed += 1;
            }
        }
    }

    let live_updates = observer
        .updates
        .lock()
        .expect("observer mutex should be available")
        .len();

    Ok(HarnessReport {
        sessions: count,
        failed_sessions: failed,
        merged_segments: merged,
        live_updates,
        transcripts,
    })
}

fn build_controller() -> Result<CaptureController, String> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| err.to_string())?
        .as_nanos();
    let base = std::env::temp_dir();
    let settings_store =
        SettingsStore::from_path(base.join(format!("chartscribe-harness-{ts}.json")));
    let archive = TranscriptArchive::from_paths(
        base.join(format!("chartscribe-harness-{ts}-archive.json")),
        base.join(format!("chartscribe-harness-{ts}-archive.key")),
    )
    .map_err(|err| err.to_string())?;
    let diagnostics = DiagnosticsManager::from_paths(
        base.join(format!("chartscribe-harness-{ts}-diag.json")),
        base.join(format!("chartscribe-harness-{ts}-exports")),
    )
    .map_err(|err| err.to_string())?;
    CaptureController::from_parts(settings_store, archive, diagnostics)
        .map_err(|err| err.to_string())
}

fn parse_mode(raw: &str) -> Result<HarnessMode, String> {
    match raw {
        "session" => Ok(HarnessMode::Session),
        "soak" => Ok(HarnessMode::Soak),
        _ => Err(format!("unknown mode '{raw}', expected session|soak")),
    }
}

fn parse_arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == key)
        .and_then(|idx| args.get(idx + 1))
        .map(String::as_str)
}

fn default_output_path(mode: &HarnessMode) -> PathBuf {
    let filename = match mode {
        HarnessMode::Session => "capture-harness-session.json",
        HarnessMode::Soak => "capture-harness-soak.json",
    };
    std::env::temp_dir().join(filename)
}

fn write_json_report<T: serde::Serialize>(path: &PathBuf, report: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("failed creating output dir: {err}"))?;
    }
    let data = serde_json::to_string_pretty(report)
        .map_err(|err| format!("failed serializing report: {err}"))?;
    fs::write(path, data).map_err(|err| format!("failed writing report: {err}"))?;
    Ok(())
}
