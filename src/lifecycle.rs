use crate::error::SessionError;
use crate::keys::KeyPool;
use crate::live::session::{LiveEvent, OutboundFrame, SessionHandle};
use crate::live::wire::ServerEvent;
use crate::live::{SharedConnector, VIDEO_INTERVAL_SECS};
use crate::media::{MediaSource, SnapshotSource};
use crate::playback::{PlaybackOutput, PlaybackScheduler};
use crate::state::{AppEvent, AppState, SessionStatus};
use crate::transcript::Role;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender as EventSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Collaborator signals driving the state machine: wake-phrase detection or
/// an explicit user action raises `Start`; the rest come from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Start,
    Stop,
    SetMuted(bool),
    Shutdown,
}

/// Pause between teardown and resuming passive listening.
const RESUME_LISTEN_DELAY_MS: u64 = 400;

enum Flow {
    Idle,
    Quit,
}

/// Owner of everything a session touches: the connection handle, the media
/// capture, the video timer and the playback scheduler, all held as fields
/// for the lifetime of one session and dropped on teardown. The
/// single-active-session invariant falls out of the structure — one
/// lifecycle, one optional session.
pub struct SessionLifecycle<O: PlaybackOutput> {
    state: Arc<AppState>,
    event_tx: EventSender<AppEvent>,
    connector: SharedConnector,
    keys: KeyPool,
    media: Box<dyn MediaSource>,
    playback: PlaybackScheduler<O>,
    /// Pool cursor; sticks to the last credential that worked.
    key_index: usize,
}

impl<O: PlaybackOutput> SessionLifecycle<O> {
    pub fn new(
        state: Arc<AppState>,
        event_tx: EventSender<AppEvent>,
        connector: SharedConnector,
        keys: KeyPool,
        media: Box<dyn MediaSource>,
        playback: PlaybackScheduler<O>,
    ) -> Self {
        Self {
            state,
            event_tx,
            connector,
            keys,
            media,
            playback,
            key_index: 0,
        }
    }

    /// Main loop: idle until a start request, run one session, repeat.
    /// Stop requests while idle are no-ops.
    pub async fn run(mut self, mut control_rx: mpsc::Receiver<Control>) {
        loop {
            let ctl = match control_rx.recv().await {
                Some(c) => c,
                None => break,
            };
            match ctl {
                Control::Start => {
                    if matches!(self.run_session(&mut control_rx).await, Flow::Quit) {
                        break;
                    }
                }
                Control::Stop => {}
                Control::SetMuted(m) => self.state.muted.store(m, Ordering::SeqCst),
                Control::Shutdown => break,
            }
        }
        self.media.release();
        log::info!("[session] lifecycle stopped");
    }

    async fn run_session(&mut self, control_rx: &mut mpsc::Receiver<Control>) -> Flow {
        if self.keys.is_empty() {
            // Non-retryable: rotation cannot help, so park in the error
            // state instead of bouncing back to idle.
            let err = SessionError::CredentialsMissing;
            self.state.set_last_error(Some(err.to_string()));
            self.set_status(SessionStatus::Error, &err.to_string());
            return Flow::Idle;
        }

        self.set_status(SessionStatus::Connecting, "connecting");

        let mut session: Option<SessionHandle> = None;
        let mut last_err: Option<SessionError> = None;
        // One attempt per distinct credential; the pool is deduplicated, so
        // walking its length visits each exactly once.
        for attempt in 0..self.keys.len() {
            let key = self.keys.get(self.key_index).to_string();
            log::info!(
                "[session] connect attempt {}/{} (key #{})",
                attempt + 1,
                self.keys.len(),
                self.key_index
            );
            match self.connector.connect(&key).await {
                Ok(handle) => {
                    session = Some(handle);
                    break;
                }
                Err(e) => {
                    log::warn!("[session] connect failed: {}", e);
                    last_err = Some(e);
                    self.key_index = self.keys.rotate(self.key_index);
                }
            }
        }

        let mut session = match session {
            Some(s) => s,
            None => {
                let message = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "connect failed".into());
                self.state.set_last_error(Some(message.clone()));
                self.set_status(SessionStatus::Idle, &message);
                tokio::time::sleep(Duration::from_millis(RESUME_LISTEN_DELAY_MS)).await;
                return Flow::Idle;
            }
        };

        let outbound = match session.outbound() {
            Some(tx) => tx,
            None => {
                self.set_status(SessionStatus::Idle, "session closed during setup");
                return Flow::Idle;
            }
        };

        let snapshot = match self.media.acquire(outbound.clone(), self.state.clone()).await {
            Ok(s) => s,
            Err(e) => {
                session.close();
                self.state.set_last_error(Some(e.to_string()));
                self.set_status(SessionStatus::Idle, &e.to_string());
                tokio::time::sleep(Duration::from_millis(RESUME_LISTEN_DELAY_MS)).await;
                return Flow::Idle;
            }
        };

        self.state.muted.store(false, Ordering::SeqCst);
        self.state.set_last_error(None);
        if let Ok(mut log) = self.state.transcript.lock() {
            log.clear();
        }
        self.set_status(SessionStatus::Active, "navigation session active");

        let video_timer = spawn_video_timer(snapshot, outbound);
        let flow = self.active_loop(control_rx, &mut session).await;
        video_timer.abort();
        self.teardown(&mut session).await;
        flow
    }

    /// Reacts to control signals and inbound session events until something
    /// ends the session. Every exit path runs the same teardown.
    async fn active_loop(
        &mut self,
        control_rx: &mut mpsc::Receiver<Control>,
        session: &mut SessionHandle,
    ) -> Flow {
        loop {
            tokio::select! {
                ctl = control_rx.recv() => match ctl {
                    None | Some(Control::Shutdown) => return Flow::Quit,
                    Some(Control::Stop) => {
                        log::info!("[session] user stop");
                        return Flow::Idle;
                    }
                    // Single-session invariant: a start while active is a no-op.
                    Some(Control::Start) => {}
                    Some(Control::SetMuted(m)) => {
                        self.state.muted.store(m, Ordering::SeqCst);
                    }
                },
                ev = session.next_event() => match ev {
                    None => return Flow::Idle,
                    Some(LiveEvent::Server(event)) => {
                        if self.handle_server_event(session, event).await {
                            return Flow::Idle;
                        }
                    }
                    Some(LiveEvent::Closed) => {
                        log::info!("[session] remote closed");
                        self.record_exit(SessionError::TransportClosed);
                        return Flow::Idle;
                    }
                    Some(LiveEvent::TransportError(msg)) => {
                        let err = SessionError::TransportError(msg);
                        log::error!("[session] {}", err);
                        self.record_exit(err);
                        return Flow::Idle;
                    }
                },
            }
        }
    }

    /// Returns true when the event ends the session.
    async fn handle_server_event(
        &mut self,
        session: &mut SessionHandle,
        event: ServerEvent,
    ) -> bool {
        match event {
            ServerEvent::ToolStop { id, name } => {
                log::info!("[session] tool stop requested");
                // Respond before teardown so the reply still reaches the wire.
                let _ = session
                    .send(OutboundFrame::ToolResponse { id, name })
                    .await;
                true
            }
            ServerEvent::InputTranscription(text) => {
                self.push_transcript(Role::User, &text);
                false
            }
            ServerEvent::OutputTranscription(text) => {
                self.push_transcript(Role::Model, &text);
                false
            }
            ServerEvent::AudioChunk(pcm) => {
                self.playback.schedule(&pcm);
                false
            }
            ServerEvent::Interrupted => {
                log::debug!("[session] interrupted, flushing playback");
                self.playback.flush();
                false
            }
        }
    }

    /// Full teardown back to idle: stop the capture graph, cancel scheduled
    /// playback, close the connection, then resume passive listening after
    /// a short fixed delay. Safe to run against an already-closed session.
    async fn teardown(&mut self, session: &mut SessionHandle) {
        self.media.release();
        self.playback.flush();
        session.close();
        self.set_status(SessionStatus::Idle, "ready");
        tokio::time::sleep(Duration::from_millis(RESUME_LISTEN_DELAY_MS)).await;
    }

    fn push_transcript(&self, role: Role, text: &str) {
        if let Ok(mut log) = self.state.transcript.lock() {
            let entry = log.push(role, text);
            let _ = self.event_tx.send(AppEvent::Transcript(entry));
        }
    }

    /// Records why the session ended. Clean remote closes are expected and
    /// stay out of the surfaced error slot.
    fn record_exit(&self, err: SessionError) {
        if err.is_surfaced() {
            self.state.set_last_error(Some(err.to_string()));
        }
    }

    fn set_status(&self, status: SessionStatus, message: &str) {
        self.state.set_status(status);
        let _ = self.event_tx.send(AppEvent::StatusUpdate {
            status,
            message: message.to_string(),
        });
    }
}

/// Snapshot cadence while a session is active. A tick with no decodable
/// frame is skipped; there is no catch-up and no lock on the encode path,
/// so a slow encode never delays the next tick.
fn spawn_video_timer(
    snapshot: Arc<dyn SnapshotSource>,
    outbound: mpsc::Sender<OutboundFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(VIDEO_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = snapshot.clone();
            let outbound = outbound.clone();
            tokio::task::spawn_blocking(move || {
                if let Some(jpeg) = snapshot.grab_jpeg() {
                    let _ = outbound.try_send(OutboundFrame::Video(jpeg));
                }
            });
        }
    })
}
