use crate::transcript::{TranscriptLog, TranscriptionEntry};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

/// Overall session status. Exactly one value at a time; drives which
/// components may be running. `Error` is only held for the non-retryable
/// missing-credentials condition; every other failure reports its message
/// and returns to `Idle` so a new start request is always accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Active,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Error => "error",
        }
    }
}

/// Events sent from background tasks to the display collaborator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    StatusUpdate {
        status: SessionStatus,
        message: String,
    },
    Transcript(TranscriptionEntry),
    KeyValidated {
        index: usize,
        ok: bool,
        message: String,
    },
}

/// State shared between the lifecycle task, the capture thread and the
/// control surface.
pub struct AppState {
    pub status: Mutex<SessionStatus>,
    pub last_error: Mutex<Option<String>>,
    /// Checked in the capture path; while set, blocks are dropped before
    /// encoding so silence is never explicitly sent.
    pub muted: AtomicBool,
    pub transcript: Mutex<TranscriptLog>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Idle),
            last_error: Mutex::new(None),
            muted: AtomicBool::new(false),
            transcript: Mutex::new(TranscriptLog::new()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().map(|s| *s).unwrap_or(SessionStatus::Idle)
    }

    pub fn set_status(&self, status: SessionStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_last_error(&self, message: Option<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = message;
        }
    }
}
