pub mod archive;
pub mod audio;
pub mod diagnostics;
pub mod dispatch;
pub mod events;
pub mod permissions;
pub mod session;
pub mod settings;
pub mod speech;
pub mod transcript;

pub use events::{
    ActiveTranscriptView, DegradedNotice, LiveUpdate, SessionObserver, SessionSummary, StopReason,
};
pub use session::{
    CaptureController, CaptureMode, ControllerError, SessionPhase, SessionSnapshot,
};
