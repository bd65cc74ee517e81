mod remote;

pub use remote::{encode_wav_pcm16, RemoteEndpoint, RemoteEndpointConfig};

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DEFAULT_RETRY_LIMIT: u32 = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 400;
const DEFAULT_SCRIPTED_PARTIAL_DELAY_MS: u64 = 40;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("transcription endpoint rejected credentials: {0}")]
    Auth(String),
    #[error("transcription transport failure: {0}")]
    Transport(String),
    #[error("transcription endpoint returned a malformed payload: {0}")]
    Payload(String),
    #[error("transcription endpoint reported: {0}")]
    Rejected(String),
    #[error("transcription cancelled")]
    Cancelled,
    #[error("transcription task join failed: {0}")]
    RuntimeJoin(String),
}

impl SpeechError {
    /// Transport and auth failures are worth another attempt; a malformed or
    /// explicitly rejecting response will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Auth(_))
    }
}

/// One pre-planned outcome for the scripted backend, consumed per segment.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub text: Option<String>,
    pub failure: Option<String>,
    pub delay_ms: u64,
}

impl ScriptedStep {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            text: Some(value.into()),
            failure: None,
            delay_ms: 0,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            text: None,
            failure: Some(reason.into()),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

enum SpeechBackend {
    Remote(RemoteEndpoint),
    Scripted(Mutex<VecDeque<ScriptedStep>>),
}

/// Turns one captured segment into text. The remote backend speaks the
/// hosted endpoint's JSON contract; the scripted backend replays planned
/// outcomes for tests and the harness.
pub struct TranscriptionWorker {
    backend: SpeechBackend,
    sample_rate: u32,
    retry_limit: u32,
    retry_backoff: Duration,
    partial_delay_ms: u64,
}

impl TranscriptionWorker {
    pub fn new_remote(config: RemoteEndpointConfig) -> Result<Self, SpeechError> {
        let endpoint = RemoteEndpoint::new(config)?;
        Ok(Self {
            backend: SpeechBackend::Remote(endpoint),
            sample_rate: crate::audio::TARGET_SAMPLE_RATE,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            partial_delay_ms: DEFAULT_SCRIPTED_PARTIAL_DELAY_MS,
        })
    }

    pub fn with_script(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            backend: SpeechBackend::Scripted(Mutex::new(steps.into_iter().collect())),
            sample_rate: crate::audio::TARGET_SAMPLE_RATE,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            partial_delay_ms: DEFAULT_SCRIPTED_PARTIAL_DELAY_MS,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_partial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.partial_delay_ms = delay_ms;
        self
    }

    /// Transcribes one segment. `Ok(None)` means the segment carried no
    /// recognizable speech; that is not a failure. Partial text, when the
    /// backend produces it, is streamed through `on_partial` before the final
    /// result is returned.
    pub async fn transcribe_segment<F>(
        &self,
        samples: &[f32],
        cancel_token: &CancellationToken,
        mut on_partial: F,
    ) -> Result<Option<String>, SpeechError>
    where
        F: FnMut(&str, u64),
    {
        if samples.is_empty() {
            return Ok(None);
        }
        if cancel_token.is_cancelled() {
            return Err(SpeechError::Cancelled);
        }

        match &self.backend {
            SpeechBackend::Remote(endpoint) => {
                self.transcribe_remote(endpoint, samples, cancel_token)
                    .await
            }
            SpeechBackend::Scripted(steps) => {
                self.transcribe_scripted(steps, cancel_token, &mut on_partial)
                    .await
            }
        }
    }

    async fn transcribe_remote(
        &self,
        endpoint: &RemoteEndpoint,
        samples: &[f32],
        cancel_token: &CancellationToken,
    ) -> Result<Option<String>, SpeechError> {
        let duration_ms = samples.len() as u64 * 1_000 / self.sample_rate as u64;
        let body = endpoint.request_body(samples, duration_ms)?;
        let mut attempt = 0u32;

        loop {
            if cancel_token.is_cancelled() {
                return Err(SpeechError::Cancelled);
            }

            let endpoint_for_call = endpoint.clone();
            let body_for_call = body.clone();
            let result = tokio::task::spawn_blocking(move || {
                endpoint_for_call.post_transcribe(&body_for_call)
            })
            .await
            .map_err(|err| SpeechError::RuntimeJoin(err.to_string()))?;

            match result {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(trimmed.to_string()));
                }
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    attempt += 1;
                    sleep(self.retry_backoff.saturating_mul(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transcribe_scripted<F>(
        &self,
        steps: &Mutex<VecDeque<ScriptedStep>>,
        cancel_token: &CancellationToken,
        on_partial: &mut F,
    ) -> Result<Option<String>, SpeechError>
    where
        F: FnMut(&str, u64),
    {
        let step = {
            let mut queue = steps
                .lock()
                .map_err(|_| SpeechError::RuntimeJoin("scripted queue poisoned".to_string()))?;
            queue.pop_front()
        };
        let Some(step) = step else {
            return Ok(None);
        };

        let started = Instant::now();
        if step.delay_ms > 0 {
            sleep(Duration::from_millis(step.delay_ms)).await;
        }
        if cancel_token.is_cancelled() {
            return Err(SpeechError::Cancelled);
        }
        if let Some(reason) = step.failure {
            return Err(SpeechError::Rejected(reason));
        }

        let text = step.text.unwrap_or_default();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let words = trimmed.split_whitespace().collect::<Vec<_>>();
        let mut running = String::new();
        for word in &words {
            if cancel_token.is_cancelled() {
                return Err(SpeechError::Cancelled);
            }
            if !running.is_empty() {
                running.push(' ');
            }
            running.push_str(word);
            on_partial(&running, started.elapsed().as_millis() as u64);
            if self.partial_delay_ms > 0 {
                sleep(Duration::from_millis(self.partial_delay_ms)).await;
            }
        }

        Ok(Some(trimmed.to_string()))
    }
}
