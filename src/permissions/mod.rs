use crate::audio::{AudioCaptureService, AudioError};
use serde::{Deserialize, Serialize};

/// Classification of why capture could not start. These are fatal to a
/// session and never retried; the consumer routes the user to the right fix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CaptureAccess {
    Granted,
    PermissionDenied,
    DeviceNotFound,
    Unsupported,
    PolicyRestricted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessSnapshot {
    pub access: CaptureAccess,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PermissionManager {
    snapshot: AccessSnapshot,
}

impl PermissionManager {
    pub fn new(audio: &AudioCaptureService) -> Self {
        Self {
            snapshot: probe_capture_access(audio, None),
        }
    }

    pub fn snapshot(&self) -> AccessSnapshot {
        self.snapshot.clone()
    }

    pub fn request_capture_access(
        &mut self,
        audio: &AudioCaptureService,
        requested_device: Option<&str>,
    ) -> AccessSnapshot {
        self.snapshot = probe_capture_access(audio, requested_device);
        self.snapshot()
    }
}

fn probe_capture_access(
    audio: &AudioCaptureService,
    requested_device: Option<&str>,
) -> AccessSnapshot {
    match audio.probe_input_device(requested_device) {
        Ok(()) => AccessSnapshot {
            access: CaptureAccess::Granted,
            message: Some("Microphone input is ready.".to_string()),
        },
        Err(err) => {
            let (access, message) = classify_capture_error(&err);
            AccessSnapshot {
                access,
                message: Some(message),
            }
        }
    }
}

pub fn classify_capture_error(err: &AudioError) -> (CaptureAccess, String) {
    match err {
        AudioError::MissingInputDevice | AudioError::DeviceNotFound(_) => (
            CaptureAccess::DeviceNotFound,
            "No usable microphone was found. Connect an input device and retry.".to_string(),
        ),
        AudioError::BuildStream(_) | AudioError::PlayStream(_) => (
            CaptureAccess::PermissionDenied,
            "The microphone exists but could not be opened. Check the OS microphone permission for this app."
                .to_string(),
        ),
        AudioError::UnsupportedSampleFormat(format) => (
            CaptureAccess::Unsupported,
            format!("This input device produces an unsupported sample format ({format})."),
        ),
        AudioError::Devices(_) | AudioError::DefaultInputConfig(_) => (
            CaptureAccess::PolicyRestricted,
            "Audio input is blocked by a device policy or exclusive-mode setting. Adjust sound settings and retry."
                .to_string(),
        ),
        AudioError::RuntimeStream(detail) => (
            CaptureAccess::PolicyRestricted,
            format!("The audio stack rejected the capture stream: {detail}"),
        ),
        AudioError::Cancelled => (
            CaptureAccess::Unsupported,
            "Capture probe was interrupted.".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_classifies_as_not_found() {
        let (access, message) = classify_capture_error(&AudioError::MissingInputDevice);
        assert_eq!(access, CaptureAccess::DeviceNotFound);
        assert!(message.contains("microphone"));
    }

    #[test]
    fn unsupported_format_carries_the_format_name() {
        let (access, message) =
            classify_capture_error(&AudioError::UnsupportedSampleFormat("F64".to_string()));
        assert_eq!(access, CaptureAccess::Unsupported);
        assert!(message.contains("F64"));
    }

    #[test]
    fn request_updates_snapshot_message() {
        let audio = AudioCaptureService::default();
        let mut manager = PermissionManager::new(&audio);
        let snapshot = manager.request_capture_access(&audio, None);
        assert!(snapshot.message.is_some());
    }
}
