use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Redacted per-session metrics: counts and durations only, never audio and
/// never transcript text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetricRecord {
    pub session_id: u64,
    pub timestamp_utc_ms: u64,
    pub segments_captured: u64,
    pub segments_attempted: u64,
    pub segments_merged: u64,
    pub segments_failed: u64,
    pub duplicates_suppressed: u64,
    pub degraded_notices: u32,
    pub audio_duration_ms: u64,
    pub capture_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsStatus {
    pub opt_in: bool,
    pub record_count: usize,
    pub last_export_path: Option<String>,
    pub last_exported_at_utc_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsExportResult {
    pub file_path: String,
    pub exported_at_utc_ms: u64,
    pub record_count: usize,
    pub redaction_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsStore {
    records: Vec<SessionMetricRecord>,
    last_export_path: Option<String>,
    last_exported_at_utc_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsBundle {
    version: u8,
    app_version: String,
    exported_at_utc_ms: u64,
    redaction_summary: String,
    aggregate: DiagnosticsAggregate,
    recent_records: Vec<SessionMetricRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsAggregate {
    total_sessions: usize,
    successful_sessions: usize,
    success_rate_percent: f32,
    total_segments_failed: u64,
    p95_capture_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("failed to read diagnostics store: {0}")]
    Read(std::io::Error),
    #[error("failed to write diagnostics store: {0}")]
    Write(std::io::Error),
    #[error("failed to parse diagnostics JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app data directory")]
    AppData,
    #[error("diagnostics export requires opt-in to be enabled")]
    OptInRequired,
}

pub struct DiagnosticsManager {
    store_path: PathBuf,
    export_dir: PathBuf,
    store: DiagnosticsStore,
}

impl DiagnosticsManager {
    const MAX_RECORDS: usize = 5_000;
    const EXPORT_RECENT_LIMIT: usize = 500;

    pub fn new() -> Result<Self, DiagnosticsError> {
        let proj_dirs = ProjectDirs::from("com", "chartscribe", "capturecore")
            .ok_or(DiagnosticsError::AppData)?;
        let store_path = proj_dirs.config_dir().join("diagnostics.json");
        let export_dir = proj_dirs.data_dir().join("diagnostics-exports");
        Self::from_paths(store_path, export_dir)
    }

    pub fn from_paths(
        store_path: impl AsRef<Path>,
        export_dir: impl AsRef<Path>,
    ) -> Result<Self, DiagnosticsError> {
        let mut manager = Self {
            store_path: store_path.as_ref().to_path_buf(),
            export_dir: export_dir.as_ref().to_path_buf(),
            store: DiagnosticsStore::default(),
        };
        manager.load()?;
        Ok(manager)
    }

    pub fn record_session(&mut self, record: SessionMetricRecord) -> Result<(), DiagnosticsError> {
        self.store.records.push(record);
        if self.store.records.len() > Self::MAX_RECORDS {
            let drop_count = self.store.records.len() - Self::MAX_RECORDS;
            self.store.records.drain(0..drop_count);
        }
        self.persist()
    }

    pub fn status(&self, opt_in: bool) -> DiagnosticsStatus {
        DiagnosticsStatus {
            opt_in,
            record_count: self.store.records.len(),
            last_export_path: self.store.last_export_path.clone(),
            last_exported_at_utc_ms: self.store.last_exported_at_utc_ms,
        }
    }

    pub fn export_bundle(
        &mut self,
        opt_in: bool,
        app_version: &str,
    ) -> Result<DiagnosticsExportResult, DiagnosticsError> {
        if !opt_in {
            return Err(DiagnosticsError::OptInRequired);
        }

        fs::create_dir_all(&self.export_dir).map_err(DiagnosticsError::Write)?;
        let exported_at = now_utc_ms();
        let filename = format!("chartscribe-diagnostics-{exported_at}.json");
        let file_path = self.export_dir.join(filename);

        let redaction_summary =
            "Export contains no raw audio and no transcript text; only session counters and durations."
                .to_string();
        let recent_start = self
            .store
            .records
            .len()
            .saturating_sub(Self::EXPORT_RECENT_LIMIT);
        let bundle = DiagnosticsBundle {
            version: 1,
            app_version: app_version.to_string(),
            exported_at_utc_ms: exported_at,
            redaction_summary: redaction_summary.clone(),
            aggregate: self.aggregate(),
            recent_records: self.store.records[recent_start..].to_vec(),
        };

        let raw = serde_json::to_string_pretty(&bundle).map_err(DiagnosticsError::Parse)?;
        fs::write(&file_path, raw).map_err(DiagnosticsError::Write)?;

        self.store.last_export_path = Some(file_path.to_string_lossy().to_string());
        self.store.last_exported_at_utc_ms = Some(exported_at);
        self.persist()?;

        Ok(DiagnosticsExportResult {
            file_path: file_path.to_string_lossy().to_string(),
            exported_at_utc_ms: exported_at,
            record_count: self.store.records.len(),
            redaction_summary,
        })
    }

    fn aggregate(&self) -> DiagnosticsAggregate {
        let total_sessions = self.store.records.len();
        let successful_sessions = self.store.records.iter().filter(|row| row.success).count();
        let success_rate_percent = if total_sessions == 0 {
            0.0
        } else {
            (successful_sessions as f32 / total_sessions as f32) * 100.0
        };
        let total_segments_failed = self
            .store
            .records
            .iter()
            .map(|row| row.segments_failed)
            .sum();
        let mut capture_times = self
            .store
            .records
            .iter()
            .map(|row| row.capture_ms)
            .collect::<Vec<_>>();
        capture_times.sort_unstable();

        DiagnosticsAggregate {
            total_sessions,
            successful_sessions,
            success_rate_percent,
            total_segments_failed,
            p95_capture_ms: percentile_u64(&capture_times, 0.95),
        }
    }

    fn load(&mut self) -> Result<(), DiagnosticsError> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.store_path).map_err(DiagnosticsError::Read)?;
        self.store = serde_json::from_str(&raw).map_err(DiagnosticsError::Parse)?;
        Ok(())
    }

    fn persist(&self) -> Result<(), DiagnosticsError> {
        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent).map_err(DiagnosticsError::Write)?;
        }
        let raw = serde_json::to_string_pretty(&self.store).map_err(DiagnosticsError::Parse)?;
        fs::write(&self.store_path, raw).map_err(DiagnosticsError::Write)?;
        Ok(())
    }
}

fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn percentile_u64(values: &[u64], percentile: f32) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let idx = ((values.len() - 1) as f32 * percentile.clamp(0.0, 1.0)).round() as usize;
    values[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_manager(stem: &str) -> (DiagnosticsManager, PathBuf) {
        let ts = now_utc_ms();
        let store_path = std::env::temp_dir().join(format!("chartscribe-diag-{stem}-{ts}.json"));
        let export_dir = std::env::temp_dir().join(format!("chartscribe-diag-{stem}-{ts}-exports"));
        let manager = DiagnosticsManager::from_paths(&store_path, &export_dir)
            .expect("diagnostics manager should init");
        (manager, store_path)
    }

    fn record(session_id: u64, success: bool) -> SessionMetricRecord {
        SessionMetricRecord {
            session_id,
            timestamp_utc_ms: now_utc_ms(),
            segments_captured: 3,
            segments_attempted: 3,
            segments_merged: if success { 3 } else { 0 },
            segments_failed: if success { 0 } else { 3 },
            duplicates_suppressed: 0,
            degraded_notices: 0,
            audio_duration_ms: 4_200,
            capture_ms: 4_500,
            success,
        }
    }

    #[test]
    fn export_requires_opt_in() {
        let (mut manager, store_path) = temp_manager("optin");
        let err = manager.export_bundle(false, "0.2.0").expect_err("must require opt-in");
        assert!(matches!(err, DiagnosticsError::OptInRequired));
        let _ = fs::remove_file(store_path);
    }

    #[test]
    fn export_writes_redacted_bundle() {
        let (mut manager, store_path) = temp_manager("bundle");
        manager.record_session(record(1, true)).expect("record");
        manager.record_session(record(2, false)).expect("record");

        let result = manager.export_bundle(true, "0.2.0").expect("export should succeed");
        let raw = fs::read_to_string(&result.file_path).expect("bundle should exist");
        assert!(raw.contains("successRatePercent"));
        assert!(raw.contains("no transcript text"));

        let status = manager.status(true);
        assert_eq!(status.record_count, 2);
        assert!(status.last_export_path.is_some());
        let _ = fs::remove_file(result.file_path);
        let _ = fs::remove_file(store_path);
    }
}
