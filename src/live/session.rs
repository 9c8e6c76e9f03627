use crate::error::SessionError;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite};

use super::wire::{
    audio_frame_message, dispatch, setup_message, tool_response_message, video_frame_message,
};
use super::LiveConnector;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound channel depth. Audio frames arrive every 256 ms, snapshots once
/// a second; the channel only backs up when the socket stalls, and capture
/// drops frames rather than block.
const OUTBOUND_CHANNEL_DEPTH: usize = 64;
const EVENT_CHANNEL_DEPTH: usize = 64;
/// Session is torn down when neither direction moves for this long.
const INACTIVITY_TIMEOUT_SECS: u64 = 30;
/// Log a peak-level line once per this many audio frames.
const AUDIO_LOG_EVERY_FRAMES: u64 = 200;

/// Last moment traffic moved in either direction, on the runtime clock.
type ActivityClock = Arc<Mutex<tokio::time::Instant>>;

fn touch(activity: &ActivityClock) {
    if let Ok(mut t) = activity.lock() {
        *t = tokio::time::Instant::now();
    }
}

fn idle_for(activity: &ActivityClock) -> Duration {
    activity.lock().map(|t| t.elapsed()).unwrap_or_default()
}

/// One unit of outbound media or control, queued onto the open session.
/// Ordering within the channel preserves per-producer arrival order.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Fixed-size 16-bit LE PCM block at the input sample rate.
    Audio(Vec<u8>),
    /// Encoded JPEG snapshot.
    Video(Vec<u8>),
    ToolResponse { id: String, name: String },
}

/// Events surfaced from the receive task to the lifecycle.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Server(super::wire::ServerEvent),
    /// Graceful remote close.
    Closed,
    TransportError(String),
}

/// Handle to one live session: the outbound queue, the inbound event
/// stream, and the two pump tasks. Owned by the lifecycle from successful
/// connect to teardown; at most one exists at a time.
pub struct SessionHandle {
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    events: mpsc::Receiver<LiveEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        events: mpsc::Receiver<LiveEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            events,
            tasks,
        }
    }

    /// Clone of the outbound sender, if the session has not been closed.
    pub fn outbound(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        self.outbound.clone()
    }

    pub async fn next_event(&mut self) -> Option<LiveEvent> {
        self.events.recv().await
    }

    pub async fn send(&self, frame: OutboundFrame) -> Result<(), SessionError> {
        match &self.outbound {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| SessionError::TransportError("outbound queue closed".into())),
            None => Err(SessionError::TransportError("session closed".into())),
        }
    }

    /// Idempotent. Dropping the outbound sender lets the send task drain any
    /// queued frames (tool responses included) and close the socket; a
    /// delayed abort covers a socket that no longer answers.
    pub fn close(&mut self) {
        self.outbound = None;
        if self.tasks.is_empty() {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.drain(..).collect();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    for task in tasks {
                        task.abort();
                    }
                });
            }
            Err(_) => {
                for task in tasks {
                    task.abort();
                }
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_ws_request(url: &str) -> Result<tungstenite::http::Request<()>, String> {
    tungstenite::http::Request::builder()
        .uri(url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Host", "generativelanguage.googleapis.com")
        .body(())
        .map_err(|e| format!("Failed to build request: {}", e))
}

fn frame_peak(pcm: &[u8]) -> i32 {
    let mut peak: i32 = 0;
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        let abs = (sample as i32).abs();
        if abs > peak {
            peak = abs;
        }
    }
    peak
}

async fn send_wire_message<S>(ws_tx: &mut S, msg: serde_json::Value) -> Result<(), ()>
where
    S: futures_util::Sink<tungstenite::Message> + Unpin,
{
    ws_tx
        .send(tungstenite::Message::Text(msg.to_string().into()))
        .await
        .map_err(|_| ())
}

/// Outbound pump: queued frames onto the sink, with the inactivity
/// watchdog. Exits when the queue closes, a send fails, or neither
/// direction has moved for the timeout window; the sink is closed on
/// every exit path.
async fn run_send_pump<S>(
    mut ws_tx: S,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
    evt_tx: mpsc::Sender<LiveEvent>,
    activity: ActivityClock,
) where
    S: futures_util::Sink<tungstenite::Message> + Unpin + Send,
{
    let mut frames: u64 = 0;
    let mut bytes: u64 = 0;
    let mut inactivity_check = tokio::time::interval(Duration::from_secs(1));
    inactivity_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    inactivity_check.tick().await;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let frame = match frame {
                    Some(f) => f,
                    None => break,
                };
                let msg = match frame {
                    OutboundFrame::Audio(pcm) => {
                        frames += 1;
                        bytes += pcm.len() as u64;
                        if frames % AUDIO_LOG_EVERY_FRAMES == 0 {
                            log::debug!(
                                "[live] audio sent: frames={}, bytes_total={}, peak={}",
                                frames,
                                bytes,
                                frame_peak(&pcm)
                            );
                        }
                        audio_frame_message(&pcm)
                    }
                    OutboundFrame::Video(jpeg) => video_frame_message(&jpeg),
                    OutboundFrame::ToolResponse { id, name } => {
                        log::info!("[live] sending tool response for {}", name);
                        tool_response_message(&id, &name)
                    }
                };
                if send_wire_message(&mut ws_tx, msg).await.is_err() {
                    let _ = evt_tx
                        .send(LiveEvent::TransportError("send failed".into()))
                        .await;
                    break;
                }
                touch(&activity);
            }
            _ = inactivity_check.tick() => {
                if idle_for(&activity) >= Duration::from_secs(INACTIVITY_TIMEOUT_SECS) {
                    log::warn!(
                        "[live] inactivity timeout after {}s, closing",
                        INACTIVITY_TIMEOUT_SECS
                    );
                    let _ = evt_tx
                        .send(LiveEvent::TransportError(format!(
                            "no traffic for {}s",
                            INACTIVITY_TIMEOUT_SECS
                        )))
                        .await;
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Production connector against the live endpoint. Performs exactly one
/// connect attempt; credential rotation and retry live in the lifecycle.
pub struct GeminiConnector;

#[async_trait::async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(&self, api_key: &str) -> Result<SessionHandle, SessionError> {
        let url = format!("{}?key={}", LIVE_ENDPOINT, api_key);
        let request =
            build_ws_request(&url).map_err(SessionError::ConnectFailure)?;

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SessionError::ConnectFailure(e.to_string()))?;
        log::info!("[live] websocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        send_wire_message(&mut ws_tx, setup_message())
            .await
            .map_err(|_| SessionError::ConnectFailure("failed to send setup".into()))?;

        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_DEPTH);
        let (evt_tx, evt_rx) = mpsc::channel::<LiveEvent>(EVENT_CHANNEL_DEPTH);

        let last_activity: ActivityClock = Arc::new(Mutex::new(tokio::time::Instant::now()));

        let send_task = tokio::spawn(run_send_pump(
            ws_tx,
            out_rx,
            evt_tx.clone(),
            last_activity.clone(),
        ));

        // Task: demultiplex inbound messages into events.
        let activity_recv = last_activity;
        let recv_task = tokio::spawn(async move {
            loop {
                let msg = match ws_rx.next().await {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        log::error!("[live] websocket error: {}", e);
                        let _ = evt_tx.send(LiveEvent::TransportError(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = evt_tx.send(LiveEvent::Closed).await;
                        break;
                    }
                };

                let text = match msg {
                    tungstenite::Message::Text(t) => t.to_string(),
                    // The live endpoint delivers JSON in binary frames too.
                    tungstenite::Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                        Ok(t) => t,
                        Err(_) => {
                            log::warn!("[live] dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    tungstenite::Message::Close(frame) => {
                        if let Some(frame) = frame {
                            log::info!(
                                "[live] websocket closed: {} {}",
                                frame.code,
                                frame.reason
                            );
                        } else {
                            log::info!("[live] websocket closed");
                        }
                        let _ = evt_tx.send(LiveEvent::Closed).await;
                        break;
                    }
                    _ => continue,
                };

                touch(&activity_recv);

                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("[live] unparseable message: {}", e);
                        continue;
                    }
                };
                for event in dispatch(&value) {
                    if evt_tx.send(LiveEvent::Server(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(SessionHandle::new(out_tx, evt_rx, vec![send_task, recv_task]))
    }
}

/// Connect-and-close probe used by the `keys` control command. A key that
/// survives the handshake plus setup send is considered usable.
pub async fn validate_key(api_key: &str) -> Result<(), String> {
    let url = format!("{}?key={}", LIVE_ENDPOINT, api_key);
    let request = build_ws_request(&url)?;

    let ws_stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => return Err(format!("auth failed: {}", e)),
    };

    let (mut ws_tx, _) = ws_stream.split();
    if send_wire_message(&mut ws_tx, setup_message()).await.is_err() {
        return Err("setup send failed".into());
    }
    let _ = ws_tx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_drops_outbound() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_evt_tx, evt_rx) = mpsc::channel(4);
        let mut handle = SessionHandle::new(out_tx, evt_rx, vec![]);
        assert!(handle.outbound().is_some());
        handle.close();
        handle.close();
        assert!(handle.outbound().is_none());
        assert!(handle.send(OutboundFrame::Audio(vec![0, 0])).await.is_err());
    }

    fn pump_under_test() -> (
        mpsc::Sender<OutboundFrame>,
        mpsc::Receiver<LiveEvent>,
        JoinHandle<()>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (evt_tx, evt_rx) = mpsc::channel(8);
        let activity = Arc::new(Mutex::new(tokio::time::Instant::now()));
        let pump = tokio::spawn(run_send_pump(
            futures_util::sink::drain(),
            out_rx,
            evt_tx,
            activity,
        ));
        (out_tx, evt_rx, pump)
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_the_inactivity_window_raises_one_error_and_exits() {
        let (_out_tx, mut evt_rx, pump) = pump_under_test();

        tokio::time::sleep(Duration::from_secs(INACTIVITY_TIMEOUT_SECS + 1)).await;

        let event = evt_rx.recv().await.expect("watchdog fires");
        assert!(matches!(event, LiveEvent::TransportError(_)));
        pump.await.unwrap();
        // Task exit drops the event sender; nothing further arrives.
        assert!(evt_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_traffic_resets_the_inactivity_window() {
        let (out_tx, mut evt_rx, pump) = pump_under_test();

        // Total elapsed time far exceeds the window, but every frame
        // lands inside it.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(INACTIVITY_TIMEOUT_SECS - 5)).await;
            out_tx.send(OutboundFrame::Audio(vec![0, 0])).await.unwrap();
        }
        assert!(evt_rx.try_recv().is_err());

        drop(out_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn events_arriving_after_close_are_discarded_with_the_receiver() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (evt_tx, evt_rx) = mpsc::channel(4);
        let handle = SessionHandle::new(out_tx, evt_rx, vec![]);
        drop(handle);
        // The sender observes the drop instead of delivering to a dead session.
        assert!(evt_tx.send(LiveEvent::Closed).await.is_err());
    }
}
