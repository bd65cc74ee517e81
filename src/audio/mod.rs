use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;
const FIXTURE_FRAME_SIZE: usize = 320;
const CHUNK_RECV_TIMEOUT_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct AudioCaptureService {
    pub target_sample_rate: u32,
}

pub struct MicLevelStream {
    pub stream: Stream,
    pub level_rx: Receiver<f32>,
    pub error_rx: Receiver<String>,
}

/// How a segment reached its end: the rotation threshold, or the final flush
/// when capture stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClose {
    Rotated,
    Flushed,
}

/// A bounded slice of the capture stream, handed to transcription as one
/// remote request. Sequence indices increase monotonically from zero within
/// a session.
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    pub sequence: u64,
    pub start_offset_ms: u64,
    pub closed_by: SegmentClose,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub rotation_threshold_ms: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            rotation_threshold_ms: 23_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureSummary {
    pub segments_emitted: u64,
    pub samples_captured: u64,
    pub captured_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("failed to query input devices: {0}")]
    Devices(cpal::DevicesError),
    #[error("no input device is available")]
    MissingInputDevice,
    #[error("requested input device '{0}' was not found")]
    DeviceNotFound(String),
    #[error("failed to query default input config: {0}")]
    DefaultInputConfig(cpal::DefaultStreamConfigError),
    #[error("failed to build input stream: {0}")]
    BuildStream(cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    PlayStream(cpal::PlayStreamError),
    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),
    #[error("audio stream runtime error: {0}")]
    RuntimeStream(String),
    #[error("audio capture cancelled")]
    Cancelled,
}

impl Default for AudioCaptureService {
    fn default() -> Self {
        Self {
            target_sample_rate: TARGET_SAMPLE_RATE,
        }
    }
}

impl AudioCaptureService {
    pub fn list_input_devices(&self) -> Vec<String> {
        let host = cpal::default_host();
        let Ok(devices) = host.input_devices() else {
            return Vec::new();
        };
        devices.filter_map(|d| d.name().ok()).collect()
    }

    pub fn normalize_frame(&self, frame: AudioFrame) -> Vec<f32> {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        resample_linear(&mono, frame.sample_rate, self.target_sample_rate)
    }

    /// Cheap readiness check run before a session starts, so microphone
    /// acquisition failures surface immediately instead of on the capture
    /// thread.
    pub fn probe_input_device(
        &self,
        requested_device_name: Option<&str>,
    ) -> Result<(), AudioError> {
        let host = cpal::default_host();
        let device = self.select_input_device(&host, requested_device_name)?;
        let _ = device
            .default_input_config()
            .map_err(AudioError::DefaultInputConfig)?;
        Ok(())
    }

    /// Captures the microphone continuously, slicing the normalized stream
    /// into rotation-bounded segments that are handed to `on_segment` in
    /// sequence order. Returns when `should_stop` is observed (the in-flight
    /// remainder is flushed as the final segment) or when `should_cancel` is
    /// observed (nothing is flushed).
    pub fn capture_rotating_segments<F, G, H>(
        &self,
        requested_device_name: Option<&str>,
        options: CaptureOptions,
        should_cancel: F,
        should_stop: G,
        mut on_segment: H,
    ) -> Result<CaptureSummary, AudioError>
    where
        F: Fn() -> bool,
        G: Fn() -> bool,
        H: FnMut(CapturedSegment),
    {
        let host = cpal::default_host();
        let device = self.select_input_device(&host, requested_device_name)?;
        let supported_config = device
            .default_input_config()
            .map_err(AudioError::DefaultInputConfig)?;

        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels();
        let stream_config: StreamConfig = supported_config.clone().into();
        let sample_format = supported_config.sample_format();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        let (error_tx, error_rx) = mpsc::channel::<String>();

        let stream =
            build_input_stream(&device, &stream_config, sample_format, audio_tx, error_tx)?;
        stream.play().map_err(AudioError::PlayStream)?;

        let summary = self.collect_rotating_segments(
            sample_rate,
            channels,
            audio_rx,
            error_rx,
            options,
            should_cancel,
            should_stop,
            &mut on_segment,
        )?;

        drop(stream);
        Ok(summary)
    }

    /// Hardware-free twin of `capture_rotating_segments`: pushes the supplied
    /// frames (already at the target rate, mono) through the same rotation
    /// path. Used by tests and the harness.
    pub fn rotate_prepared_frames<H>(
        &self,
        frames: &[Vec<f32>],
        options: CaptureOptions,
        mut on_segment: H,
    ) -> CaptureSummary
    where
        H: FnMut(CapturedSegment),
    {
        let started = Instant::now();
        let mut rotator =
            SegmentRotator::new(self.target_sample_rate, options.rotation_threshold_ms);
        let mut samples_captured = 0u64;
        let mut segments_emitted = 0u64;

        for frame in frames {
            samples_captured += frame.len() as u64;
            for segment in rotator.push_chunk(frame) {
                segments_emitted += 1;
                on_segment(segment);
            }
        }
        if let Some(segment) = rotator.flush() {
            segments_emitted += 1;
            on_segment(segment);
        }

        CaptureSummary {
            segments_emitted,
            samples_captured,
            captured_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn start_level_monitor(
        &self,
        requested_device_name: Option<&str>,
    ) -> Result<MicLevelStream, AudioError> {
        let host = cpal::default_host();
        let device = self.select_input_device(&host, requested_device_name)?;
        let supported_config = device
            .default_input_config()
            .map_err(AudioError::DefaultInputConfig)?;

        let stream_config: StreamConfig = supported_config.clone().into();
        let sample_format = supported_config.sample_format();

        let (level_tx, level_rx) = mpsc::channel::<f32>();
        let (error_tx, error_rx) = mpsc::channel::<String>();

        let stream =
            build_input_level_stream(&device, &stream_config, sample_format, level_tx, error_tx)?;
        stream.play().map_err(AudioError::PlayStream)?;

        Ok(MicLevelStream {
            stream,
            level_rx,
            error_rx,
        })
    }

    fn select_input_device(
        &self,
        host: &cpal::Host,
        requested_device_name: Option<&str>,
    ) -> Result<cpal::Device, AudioError> {
        if let Some(name) = requested_device_name {
            let devices = host.input_devices().map_err(AudioError::Devices)?;
            for device in devices {
                if let Ok(device_name) = device.name() {
                    if device_name == name {
                        return Ok(device);
                    }
                }
            }
            if let Some(default_device) = host.default_input_device() {
                let default_name = default_device.name().unwrap_or_default();
                if is_likely_low_quality_dictation_input(&default_name) {
                    let devices = host.input_devices().map_err(AudioError::Devices)?;
                    for device in devices {
                        if let Ok(device_name) = device.name() {
                            if !is_likely_low_quality_dictation_input(&device_name) {
                                eprintln!(
                                    "chartscribe: requested input '{}' missing; using higher-quality fallback '{}' instead of low-quality default '{}'",
                                    name, device_name, default_name
                                );
                                return Ok(device);
                            }
                        }
                    }
                }
                eprintln!(
                    "chartscribe: requested input device '{}' not found; falling back to default input device",
                    name
                );
                return Ok(default_device);
            }
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }

        host.default_input_device()
            .ok_or(AudioError::MissingInputDevice)
    }

    fn collect_rotating_segments(
        &self,
        sample_rate: u32,
        channels: u16,
        audio_rx: Receiver<Vec<f32>>,
        error_rx: Receiver<String>,
        options: CaptureOptions,
        should_cancel: impl Fn() -> bool,
        should_stop: impl Fn() -> bool,
        on_segment: &mut impl FnMut(CapturedSegment),
    ) -> Result<CaptureSummary, AudioError> {
        let started = Instant::now();
        let mut rotator =
            SegmentRotator::new(self.target_sample_rate, options.rotation_threshold_ms);
        let mut samples_captured = 0u64;
        let mut segments_emitted = 0u64;

        loop {
            if should_cancel() {
                return Err(AudioError::Cancelled);
            }
            if should_stop() {
                break;
            }
            if let Ok(stream_err) = error_rx.try_recv() {
                return Err(AudioError::RuntimeStream(stream_err));
            }

            match audio_rx.recv_timeout(Duration::from_millis(CHUNK_RECV_TIMEOUT_MS)) {
                Ok(raw_chunk) => {
                    let normalized = self.normalize_frame(AudioFrame {
                        sample_rate,
                        channels,
                        samples: raw_chunk,
                    });
                    samples_captured += normalized.len() as u64;
                    for segment in rotator.push_chunk(&normalized) {
                        segments_emitted += 1;
                        on_segment(segment);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(segment) = rotator.flush() {
            segments_emitted += 1;
            on_segment(segment);
        }

        Ok(CaptureSummary {
            segments_emitted,
            samples_captured,
            captured_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// Hands-free Bluetooth profiles deliver narrowband audio that recognizers
// handle poorly; prefer any other input when falling back.
fn is_likely_low_quality_dictation_input(device_name: &str) -> bool {
    let normalized = device_name.to_ascii_lowercase();
    normalized.contains("hands-free")
        || normalized.contains("bluetooth headset")
        || normalized.contains("headset")
        || normalized.contains("hfp")
        || normalized.contains("sco")
}

fn build_input_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    sample_format: SampleFormat,
    audio_tx: Sender<Vec<f32>>,
    error_tx: Sender<String>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                stream_config,
                move |data: &[f32], _| {
                    let _ = audio_tx.send(data.to_vec());
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::I16 => device
            .build_input_stream(
                stream_config,
                move |data: &[i16], _| {
                    let converted = data
                        .iter()
                        .map(|sample| *sample as f32 / i16::MAX as f32)
                        .collect::<Vec<_>>();
                    let _ = audio_tx.send(converted);
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::U16 => device
            .build_input_stream(
                stream_config,
                move |data: &[u16], _| {
                    let converted = data
                        .iter()
                        .map(|sample| (*sample as f32 / u16::MAX as f32) * 2.0 - 1.0)
                        .collect::<Vec<_>>();
                    let _ = audio_tx.send(converted);
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        _ => Err(AudioError::UnsupportedSampleFormat(format!(
            "{sample_format:?}"
        ))),
    }
}

fn build_input_level_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    sample_format: SampleFormat,
    level_tx: Sender<f32>,
    error_tx: Sender<String>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                stream_config,
                move |data: &[f32], _| {
                    let _ = level_tx.send(rms(data));
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::I16 => device
            .build_input_stream(
                stream_config,
                move |data: &[i16], _| {
                    let _ = level_tx.send(rms_i16(data));
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        SampleFormat::U16 => device
            .build_input_stream(
                stream_config,
                move |data: &[u16], _| {
                    let _ = level_tx.send(rms_u16(data));
                },
                move |err| {
                    let _ = error_tx.send(err.to_string());
                },
                None,
            )
            .map_err(AudioError::BuildStream),
        _ => Err(AudioError::UnsupportedSampleFormat(format!(
            "{sample_format:?}"
        ))),
    }
}

pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let ch = channels as usize;
    samples
        .chunks(ch)
        .map(|chunk| chunk.iter().copied().sum::<f32>() / chunk.len() as f32)
        .collect()
}

pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(output_len);

    for idx in 0..output_len {
        let src_pos = idx as f64 / ratio;
        let left_idx = src_pos.floor() as usize;
        let right_idx = (left_idx + 1).min(samples.len() - 1);
        let alpha = (src_pos - left_idx as f64) as f32;
        let left = samples[left_idx];
        let right = samples[right_idx];
        out.push(left + alpha * (right - left));
    }
    out
}

/// Slices the normalized capture stream into bounded segments by sample
/// count. Every full segment is exactly the rotation target; only the flush
/// remainder may be shorter. The concatenation of everything emitted equals
/// the pushed input, so rotation never drops or repeats audio. A flush
/// immediately after an exact-threshold rotation yields nothing, which keeps
/// a manual stop racing an auto-rotation from producing a duplicate final
/// segment.
#[derive(Debug, Clone)]
pub struct SegmentRotator {
    sample_rate: u32,
    samples_per_segment: usize,
    pending: Vec<f32>,
    next_sequence: u64,
    emitted_samples: u64,
}

impl SegmentRotator {
    pub fn new(sample_rate: u32, rotation_threshold_ms: u64) -> Self {
        let samples_per_segment =
            ((sample_rate as u64).saturating_mul(rotation_threshold_ms) / 1_000).max(1) as usize;
        Self {
            sample_rate,
            samples_per_segment,
            pending: Vec::with_capacity(samples_per_segment),
            next_sequence: 0,
            emitted_samples: 0,
        }
    }

    pub fn samples_per_segment(&self) -> usize {
        self.samples_per_segment
    }

    pub fn push_chunk(&mut self, chunk: &[f32]) -> Vec<CapturedSegment> {
        let mut emitted = Vec::new();
        let mut remaining = chunk;

        while !remaining.is_empty() {
            let room = self.samples_per_segment - self.pending.len();
            let take = room.min(remaining.len());
            self.pending.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.pending.len() == self.samples_per_segment {
                emitted.push(self.close_pending(SegmentClose::Rotated));
            }
        }

        emitted
    }

    pub fn flush(&mut self) -> Option<CapturedSegment> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.close_pending(SegmentClose::Flushed))
    }

    fn close_pending(&mut self, closed_by: SegmentClose) -> CapturedSegment {
        let samples = std::mem::take(&mut self.pending);
        let start_offset_ms = self.emitted_samples * 1_000 / self.sample_rate as u64;
        self.emitted_samples += samples.len() as u64;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        CapturedSegment {
            sequence,
            start_offset_ms,
            closed_by,
            samples,
        }
    }
}

/// Synthetic speech-shaped frames so the full pipeline can run without a
/// microphone.
pub fn fixture_speech_frames() -> Vec<Vec<f32>> {
    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(vec![0.0; FIXTURE_FRAME_SIZE]);
    }
    for i in 0..50 {
        let amplitude = 0.02 + (i % 7) as f32 * 0.003;
        let frame = (0..FIXTURE_FRAME_SIZE)
            .map(|s| (((s as f32 * 0.04).sin()) * amplitude).clamp(-1.0, 1.0))
            .collect::<Vec<_>>();
        frames.push(frame);
    }
    for _ in 0..8 {
        frames.push(vec![0.0; FIXTURE_FRAME_SIZE]);
    }
    frames
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power_sum: f32 = samples.iter().map(|s| s * s).sum();
    (power_sum / samples.len() as f32).sqrt()
}

fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power_sum: f32 = samples
        .iter()
        .map(|s| {
            let normalized = *s as f32 / i16::MAX as f32;
            normalized * normalized
        })
        .sum();
    (power_sum / samples.len() as f32).sqrt()
}

fn rms_u16(samples: &[u16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power_sum: f32 = samples
        .iter()
        .map(|s| {
            let normalized = (*s as f32 / u16::MAX as f32) * 2.0 - 1.0;
            normalized * normalized
        })
        .sum();
    (power_sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_downmix_is_averaged() {
        let stereo = vec![1.0, -1.0, 0.5, 0.5];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn resample_changes_length() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample_linear(&samples, 8_000, 16_000);
        assert!(out.len() > samples.len());
    }

    #[test]
    fn rotator_emits_full_segments_and_flush_remainder() {
        let mut rotator = SegmentRotator::new(1_000, 1_000); // 1000 samples per segment
        let chunk = (0..2_500).map(|i| i as f32).collect::<Vec<_>>();

        let emitted = rotator.push_chunk(&chunk);
        assert_eq!(emitted.len(), 2);
        assert!(emitted
            .iter()
            .all(|segment| segment.samples.len() == 1_000
                && segment.closed_by == SegmentClose::Rotated));

        let tail = rotator.flush().expect("remainder should flush");
        assert_eq!(tail.samples.len(), 500);
        assert_eq!(tail.closed_by, SegmentClose::Flushed);
        assert_eq!(tail.sequence, 2);
    }

    #[test]
    fn rotator_flush_after_exact_threshold_is_empty() {
        let mut rotator = SegmentRotator::new(1_000, 1_000);
        let chunk = vec![0.25_f32; 1_000];

        let emitted = rotator.push_chunk(&chunk);
        assert_eq!(emitted.len(), 1);
        assert!(rotator.flush().is_none());
    }

    #[test]
    fn rotator_offsets_are_contiguous() {
        let mut rotator = SegmentRotator::new(1_000, 500);
        let mut segments = rotator.push_chunk(&vec![0.0_f32; 1_250]);
        if let Some(tail) = rotator.flush() {
            segments.push(tail);
        }

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].start_offset_ms, 0);
        assert_eq!(segments[1].start_offset_ms, 500);
        assert_eq!(segments[2].start_offset_ms, 1_000);
    }

    #[test]
    fn fixture_frames_contain_speech_energy() {
        let frames = fixture_speech_frames();
        assert!(frames.iter().any(|frame| rms(frame) > 0.01));
    }

    #[test]
    fn rotate_prepared_frames_accounts_for_every_sample() {
        let service = AudioCaptureService::default();
        let frames = fixture_speech_frames();
        let pushed = frames.iter().map(Vec::len).sum::<usize>() as u64;

        let mut collected = 0u64;
        let summary = service.rotate_prepared_frames(
            &frames,
            CaptureOptions {
                rotation_threshold_ms: 500,
            },
            |segment| collected += segment.samples.len() as u64,
        );

        assert_eq!(summary.samples_captured, pushed);
        assert_eq!(collected, pushed);
        assert!(summary.segments_emitted > 1);
    }
}
