use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use directories::ProjectDirs;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const MAX_FRAGMENT_RECORDS: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    Off,
    Days7,
    Days30,
    Forever,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Days30
    }
}

/// One merged transcript fragment. Records are only ever appended; the
/// archive never rewrites or reorders what a session already produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptFragmentRecord {
    pub record_id: String,
    pub session_id: u64,
    pub segment_seq: u64,
    pub timestamp_utc_ms: u64,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to read transcript archive: {0}")]
    Read(std::io::Error),
    #[error("failed to write transcript archive: {0}")]
    Write(std::io::Error),
    #[error("failed to parse transcript archive JSON: {0}")]
    Parse(serde_json::Error),
    #[error("failed to encrypt transcript archive: {0}")]
    Encrypt(String),
    #[error("failed to decrypt transcript archive: {0}")]
    Decrypt(String),
    #[error("failed to decode transcript archive key: {0}")]
    KeyDecode(String),
    #[error("cannot resolve app data directory")]
    AppData,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ArchiveStore {
    retention_policy: RetentionPolicy,
    next_id: u64,
    records: Vec<TranscriptFragmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedArchiveStore {
    version: u8,
    nonce_b64: String,
    ciphertext_b64: String,
}

/// Append-only transcript store keyed by session id, encrypted at rest.
/// Dictated clinical text never touches disk in plaintext.
pub struct TranscriptArchive {
    path: PathBuf,
    _key_path: PathBuf,
    key: [u8; 32],
    store: ArchiveStore,
}

impl TranscriptArchive {
    pub fn new() -> Result<Self, ArchiveError> {
        let proj_dirs =
            ProjectDirs::from("com", "chartscribe", "capturecore").ok_or(ArchiveError::AppData)?;
        let path = proj_dirs.config_dir().join("transcripts.json");
        let key_path = proj_dirs.config_dir().join("transcripts.key");
        Self::from_paths(path, key_path)
    }

    pub fn from_paths(
        path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();
        let key = load_or_create_key(&key_path)?;
        let mut archive = Self {
            path,
            _key_path: key_path,
            key,
            store: ArchiveStore {
                retention_policy: RetentionPolicy::Days30,
                next_id: 1,
                records: Vec::new(),
            },
        };
        archive.load()?;
        archive.prune_expired();
        Ok(archive)
    }

    pub fn append_fragment(
        &mut self,
        session_id: u64,
        segment_seq: u64,
        text: &str,
    ) -> Result<(), ArchiveError> {
        if self.store.retention_policy == RetentionPolicy::Off {
            return Ok(());
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let record = TranscriptFragmentRecord {
            record_id: self.next_record_id(),
            session_id,
            segment_seq,
            timestamp_utc_ms: now_utc_ms(),
            text: trimmed.to_string(),
        };
        self.store.records.push(record);
        self.prune_expired();
        self.persist()
    }

    /// Reassembles a session's transcript from its fragments, in segment
    /// order, joined with single spaces.
    pub fn session_text(&self, session_id: u64) -> Option<String> {
        let mut fragments = self
            .store
            .records
            .iter()
            .filter(|row| row.session_id == session_id)
            .collect::<Vec<_>>();
        if fragments.is_empty() {
            return None;
        }
        fragments.sort_by_key(|row| row.segment_seq);
        Some(
            fragments
                .iter()
                .map(|row| row.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids = self
            .store
            .records
            .iter()
            .map(|row| row.session_id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn set_retention_policy(
        &mut self,
        policy: RetentionPolicy,
    ) -> Result<RetentionPolicy, ArchiveError> {
        self.store.retention_policy = policy.clone();
        self.prune_expired();
        self.persist()?;
        Ok(policy)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.store.retention_policy.clone()
    }

    pub fn prune_now(&mut self) -> Result<usize, ArchiveError> {
        let before = self.store.records.len();
        self.prune_expired();
        self.persist()?;
        Ok(before.saturating_sub(self.store.records.len()))
    }

    pub fn clear(&mut self) -> Result<usize, ArchiveError> {
        let removed = self.store.records.len();
        self.store.records.clear();
        self.persist()?;
        Ok(removed)
    }

    fn next_record_id(&mut self) -> String {
        let id = self.store.next_id;
        self.store.next_id += 1;
        format!("frag-{id}")
    }

    fn prune_expired(&mut self) {
        match self.store.retention_policy {
            RetentionPolicy::Off => {
                self.store.records.clear();
            }
            RetentionPolicy::Days7 => {
                let cutoff = now_utc_ms().saturating_sub(7 * 24 * 60 * 60 * 1000);
                self.store
                    .records
                    .retain(|row| row.timestamp_utc_ms >= cutoff);
            }
            RetentionPolicy::Days30 => {
                let cutoff = now_utc_ms().saturating_sub(30 * 24 * 60 * 60 * 1000);
                self.store
                    .records
                    .retain(|row| row.timestamp_utc_ms >= cutoff);
            }
            RetentionPolicy::Forever => {}
        }
        if self.store.records.len() > MAX_FRAGMENT_RECORDS {
            let keep_from = self.store.records.len() - MAX_FRAGMENT_RECORDS;
            self.store.records = self.store.records.split_off(keep_from);
        }
    }

    fn load(&mut self) -> Result<(), ArchiveError> {
        if !self.path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.path).map_err(ArchiveError::Read)?;
        if let Ok(encrypted) = serde_json::from_str::<EncryptedArchiveStore>(&raw) {
            self.store = decrypt_archive_store(&encrypted, &self.key)?;
            return Ok(());
        }

        // Plaintext stores predate the encrypted envelope; re-persist them
        // encrypted on first load.
        self.store = serde_json::from_str(&raw).map_err(ArchiveError::Parse)?;
        self.persist()?;
        Ok(())
    }

    fn persist(&self) -> Result<(), ArchiveError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(ArchiveError::Write)?;
        }
        let encrypted = encrypt_archive_store(&self.store, &self.key)?;
        let raw = serde_json::to_string_pretty(&encrypted).map_err(ArchiveError::Parse)?;
        fs::write(&self.path, raw).map_err(ArchiveError::Write)?;
        Ok(())
    }
}

fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn load_or_create_key(path: &PathBuf) -> Result<[u8; 32], ArchiveError> {
    if path.exists() {
        let encoded = fs::read_to_string(path).map_err(ArchiveError::Read)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| ArchiveError::KeyDecode(err.to_string()))?;
        if bytes.len() != 32 {
            return Err(ArchiveError::KeyDecode(
                "transcripts.key must decode to 32 bytes".to_string(),
            ));
        }
        let mut key = [0_u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ArchiveError::Write)?;
    }
    let mut key = [0_u8; 32];
    OsRng.fill_bytes(&mut key);
    let encoded = base64::engine::general_purpose::STANDARD.encode(key);
    fs::write(path, encoded).map_err(ArchiveError::Write)?;
    Ok(key)
}

fn encrypt_archive_store(
    store: &ArchiveStore,
    key: &[u8; 32],
) -> Result<EncryptedArchiveStore, ArchiveError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|err| ArchiveError::Encrypt(err.to_string()))?;
    let mut nonce_bytes = [0_u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = serde_json::to_vec(store).map_err(ArchiveError::Parse)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|err| ArchiveError::Encrypt(err.to_string()))?;

    Ok(EncryptedArchiveStore {
        version: 1,
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
        ciphertext_b64: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    })
}

fn decrypt_archive_store(
    encrypted: &EncryptedArchiveStore,
    key: &[u8; 32],
) -> Result<ArchiveStore, ArchiveError> {
    if encrypted.version != 1 {
        return Err(ArchiveError::Decrypt(format!(
            "unsupported archive encryption version {}",
            encrypted.version
        )));
    }

    let nonce_bytes = base64::engine::general_purpose::STANDARD
        .decode(encrypted.nonce_b64.as_bytes())
        .map_err(|err| ArchiveError::Decrypt(err.to_string()))?;
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(encrypted.ciphertext_b64.as_bytes())
        .map_err(|err| ArchiveError::Decrypt(err.to_string()))?;
    if nonce_bytes.len() != 12 {
        return Err(ArchiveError::Decrypt("nonce must be 12 bytes".to_string()));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|err| ArchiveError::Decrypt(err.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|err| ArchiveError::Decrypt(err.to_string()))?;
    serde_json::from_slice(&plaintext).map_err(ArchiveError::Parse)
}
