use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The remote endpoint rejects requests longer than roughly this much audio;
/// rotation must always land segments under it.
pub const REMOTE_DURATION_CEILING_MS: u64 = 25_000;

pub const DEFAULT_ROTATION_THRESHOLD_MS: u64 = 23_000;
const MIN_ROTATION_THRESHOLD_MS: u64 = 5_000;
const MAX_ROTATION_THRESHOLD_MS: u64 = 23_000;
const MAX_RETRY_LIMIT: u32 = 5;
const MIN_RETRY_BACKOFF_MS: u64 = 100;
const MAX_RETRY_BACKOFF_MS: u64 = 2_000;

pub fn clamp_rotation_threshold_ms(value: u64) -> u64 {
    value.clamp(MIN_ROTATION_THRESHOLD_MS, MAX_ROTATION_THRESHOLD_MS)
}

pub fn clamp_retry_limit(value: u32) -> u32 {
    value.min(MAX_RETRY_LIMIT)
}

pub fn clamp_retry_backoff_ms(value: u64) -> u64 {
    value.clamp(MIN_RETRY_BACKOFF_MS, MAX_RETRY_BACKOFF_MS)
}

/// Whether transcription calls reuse one HTTP agent and token for the whole
/// session or rebuild both before every call. Some hosted endpoints sour
/// across sequential requests on one connection; `PerRequest` sidesteps that
/// at the cost of connection reuse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CredentialMode {
    #[default]
    Shared,
    PerRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureSettings {
    pub input_device: Option<String>,
    pub endpoint_url: String,
    pub auth_token_env: String,
    pub language: String,
    pub credential_mode: CredentialMode,
    pub rotation_threshold_ms: u64,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub diagnostics_opt_in: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            endpoint_url: "https://speech.chartscribe.dev/v1/transcribe".to_string(),
            auth_token_env: "CHARTSCRIBE_SPEECH_TOKEN".to_string(),
            language: "en".to_string(),
            credential_mode: CredentialMode::Shared,
            rotation_threshold_ms: DEFAULT_ROTATION_THRESHOLD_MS,
            retry_limit: 2,
            retry_backoff_ms: 400,
            diagnostics_opt_in: false,
        }
    }
}

impl CaptureSettings {
    pub fn clamped(mut self) -> Self {
        self.rotation_threshold_ms = clamp_rotation_threshold_ms(self.rotation_threshold_ms);
        self.retry_limit = clamp_retry_limit(self.retry_limit);
        self.retry_backoff_ms = clamp_retry_backoff_ms(self.retry_backoff_ms);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Read(std::io::Error),
    #[error("failed to write settings file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app data directory")]
    AppData,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new() -> Result<Self, SettingsError> {
        let proj_dirs =
            ProjectDirs::from("com", "chartscribe", "capturecore").ok_or(SettingsError::AppData)?;
        let path = proj_dirs.config_dir().join("settings.json");
        Ok(Self { path })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<CaptureSettings, SettingsError> {
        if !self.path.exists() {
            return Ok(CaptureSettings::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(SettingsError::Read)?;
        let settings: CaptureSettings = serde_json::from_str(&raw).map_err(SettingsError::Parse)?;
        Ok(settings.clamped())
    }

    pub fn save(&self, settings: &CaptureSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SettingsError::Write)?;
        }
        let raw = serde_json::to_string_pretty(settings).map_err(SettingsError::Parse)?;
        fs::write(&self.path, raw).map_err(SettingsError::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_settings_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("chartscribe-settings-{ts}.json"))
    }

    #[test]
    fn rotation_threshold_stays_under_remote_ceiling() {
        assert!(clamp_rotation_threshold_ms(u64::MAX) < REMOTE_DURATION_CEILING_MS);
        assert_eq!(clamp_rotation_threshold_ms(0), 5_000);
        assert_eq!(clamp_rotation_threshold_ms(12_000), 12_000);
    }

    #[test]
    fn retry_knobs_are_clamped() {
        assert_eq!(clamp_retry_limit(40), 5);
        assert_eq!(clamp_retry_backoff_ms(1), 100);
        assert_eq!(clamp_retry_backoff_ms(10_000), 2_000);
    }

    #[test]
    fn load_returns_default_if_missing() {
        let store = SettingsStore::from_path(temp_settings_path());
        let loaded = store.load().expect("load should succeed");
        assert_eq!(loaded.rotation_threshold_ms, DEFAULT_ROTATION_THRESHOLD_MS);
        assert_eq!(loaded.language, "en");
    }

    #[test]
    fn save_then_load_round_trip_clamps_out_of_range_values() {
        let path = temp_settings_path();
        let store = SettingsStore::from_path(path.clone());
        let settings = CaptureSettings {
            endpoint_url: "https://speech.example.test/transcribe".to_string(),
            credential_mode: CredentialMode::PerRequest,
            rotation_threshold_ms: 90_000,
            retry_limit: 9,
            retry_backoff_ms: 50,
            diagnostics_opt_in: true,
            ..CaptureSettings::default()
        };

        store.save(&settings).expect("save should succeed");
        let loaded = store.load().expect("load should succeed");

        assert_eq!(loaded.endpoint_url, "https://speech.example.test/transcribe");
        assert_eq!(loaded.credential_mode, CredentialMode::PerRequest);
        assert_eq!(loaded.rotation_threshold_ms, 23_000);
        assert_eq!(loaded.retry_limit, 5);
        assert_eq!(loaded.retry_backoff_ms, 100);
        assert!(loaded.diagnostics_opt_in);
        let _ = std::fs::remove_file(path);
    }
}
