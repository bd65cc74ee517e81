use super::SpeechError;
use crate::settings::CredentialMode;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const WIRE_CONTENT_TYPE: &str = "audio/wav";

#[derive(Debug, Clone)]
pub struct RemoteEndpointConfig {
    pub endpoint_url: String,
    pub auth_token_env: String,
    pub language: String,
    pub credential_mode: CredentialMode,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RemoteEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "https://speech.chartscribe.dev/v1/transcribe".to_string(),
            auth_token_env: "CHARTSCRIBE_SPEECH_TOKEN".to_string(),
            language: "en".to_string(),
            credential_mode: CredentialMode::Shared,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeRequest<'a> {
    audio: String,
    content_type: &'a str,
    language: &'a str,
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeResponse {
    text: Option<String>,
    error: Option<String>,
}

/// Blocking HTTP client for the hosted transcription endpoint. With
/// `CredentialMode::Shared` one agent and one token resolution serve the
/// whole session; `CredentialMode::PerRequest` rebuilds both before every
/// call, for endpoints whose sessions sour across sequential requests.
#[derive(Clone)]
pub struct RemoteEndpoint {
    config: RemoteEndpointConfig,
    shared_agent: ureq::Agent,
    shared_token: Option<String>,
}

impl RemoteEndpoint {
    pub fn new(config: RemoteEndpointConfig) -> Result<Self, SpeechError> {
        if config.endpoint_url.trim().is_empty() {
            return Err(SpeechError::Transport(
                "transcription endpoint URL is not configured".to_string(),
            ));
        }
        let shared_agent = build_agent(&config);
        let shared_token = resolve_token(&config.auth_token_env);
        Ok(Self {
            config,
            shared_agent,
            shared_token,
        })
    }

    pub fn request_body(&self, samples: &[f32], duration_ms: u64) -> Result<String, SpeechError> {
        let wav = encode_wav_pcm16(samples);
        let request = TranscribeRequest {
            audio: base64::engine::general_purpose::STANDARD.encode(wav),
            content_type: WIRE_CONTENT_TYPE,
            language: &self.config.language,
            duration_ms,
        };
        serde_json::to_string(&request).map_err(|err| SpeechError::Payload(err.to_string()))
    }

    pub fn post_transcribe(&self, body: &str) -> Result<String, SpeechError> {
        let (agent, token) = match self.config.credential_mode {
            CredentialMode::Shared => (self.shared_agent.clone(), self.shared_token.clone()),
            CredentialMode::PerRequest => (
                build_agent(&self.config),
                resolve_token(&self.config.auth_token_env),
            ),
        };

        let mut request = agent
            .post(&self.config.endpoint_url)
            .set("Content-Type", "application/json")
            .set("User-Agent", "chartscribe/0.2");
        if let Some(token) = token.as_deref() {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        match request.send_string(body) {
            Ok(response) => {
                let raw = response
                    .into_string()
                    .map_err(|err| SpeechError::Transport(err.to_string()))?;
                let parsed: TranscribeResponse = serde_json::from_str(&raw)
                    .map_err(|err| SpeechError::Payload(err.to_string()))?;
                if let Some(error) = parsed.error {
                    return Err(SpeechError::Rejected(error));
                }
                Ok(parsed.text.unwrap_or_default())
            }
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                if code == 401 || code == 403 {
                    Err(SpeechError::Auth(format!("status {code}: {detail}")))
                } else {
                    Err(SpeechError::Transport(format!("status {code}: {detail}")))
                }
            }
            Err(err) => Err(SpeechError::Transport(err.to_string())),
        }
    }
}

fn build_agent(config: &RemoteEndpointConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(config.connect_timeout)
        .timeout_read(config.read_timeout)
        .build()
}

fn resolve_token(env_name: &str) -> Option<String> {
    std::env::var(env_name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Encodes mono 16 kHz float samples as a PCM16 WAV byte buffer, the shape
/// the endpoint expects inside the base64 payload.
pub fn encode_wav_pcm16(samples: &[f32]) -> Vec<u8> {
    let sample_rate = crate::audio::TARGET_SAMPLE_RATE;
    let channels = 1u16;
    let bits_per_sample = 16u16;
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = (samples.len() * 2) as u32;
    let riff_len = 36u32.saturating_add(data_len);

    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let pcm = (clamped * i16::MAX as f32) as i16;
        out.extend_from_slice(&pcm.to_le_bytes());
    }
    out
}
