pub mod session;
pub mod wire;

use crate::error::SessionError;
use session::SessionHandle;
use std::sync::Arc;

/// Sample rate of outbound microphone PCM.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of inbound synthesized speech.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Fixed-size outbound audio frame, in samples (256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;
/// Target width for outbound snapshots; height follows the aspect ratio.
pub const SNAPSHOT_WIDTH: u32 = 320;
pub const SNAPSHOT_JPEG_QUALITY: u8 = 70;
/// Cadence of the snapshot timer while a session is active.
pub const VIDEO_INTERVAL_SECS: u64 = 1;

pub const LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const LIVE_VOICE: &str = "Puck";
pub const TOOL_STOP_NAVIGATION: &str = "stopNavigation";

/// Fixed persona. Phrasing is deliberately deterministic so guidance is
/// predictable in the three cases the guide handles.
pub const SYSTEM_INSTRUCTION: &str = "\
You are a calm walking-navigation guide for a pedestrian who cannot see \
the camera feed. You receive a live microphone stream and one camera \
snapshot per second. Respond with short spoken guidance only. Use exactly \
these phrasing rules: when the path ahead is clear, say 'Clear path ahead' \
followed by at most one short sentence of direction. When you see a hazard, \
start with 'Caution:' then name the hazard and its position (left, right, \
or ahead) in one sentence. When the user sounds unsure and no hazard is \
visible, give one short reassuring sentence. Never speculate about things \
outside the snapshot, and never produce more than two sentences per turn. \
When the user asks to stop navigating, call the stopNavigation tool.";

/// Seam between the lifecycle and the network: the lifecycle owns credential
/// rotation and retry; a connector performs exactly one connect attempt.
#[async_trait::async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, api_key: &str) -> Result<SessionHandle, SessionError>;
}

pub type SharedConnector = Arc<dyn LiveConnector>;
