use crate::error::SessionError;
use crate::live::session::OutboundFrame;
use crate::live::{FRAME_SAMPLES, INPUT_SAMPLE_RATE, SNAPSHOT_JPEG_QUALITY, SNAPSHOT_WIDTH};
use crate::state::AppState;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Source of the periodic outbound snapshots. `grab_jpeg` returns `None`
/// when no frame is currently decodable; the caller skips that tick.
pub trait SnapshotSource: Send + Sync {
    fn grab_jpeg(&self) -> Option<Vec<u8>>;
}

/// Device seam for the lifecycle: acquires microphone capture plus a
/// snapshot source, releases both on teardown. Exclusive owner of the
/// underlying hardware between the two calls.
#[async_trait::async_trait]
pub trait MediaSource: Send {
    async fn acquire(
        &mut self,
        audio_tx: mpsc::Sender<OutboundFrame>,
        state: Arc<AppState>,
    ) -> Result<Arc<dyn SnapshotSource>, SessionError>;

    /// Idempotent; safe to call when nothing was acquired.
    fn release(&mut self);
}

/// Bound on how long a capture stream may take to report it started.
const DEVICE_INIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Accumulates PCM bytes and emits fixed-size frames. Partial tails stay
/// buffered until the next block arrives.
pub struct FrameChunker {
    buf: Vec<u8>,
    frame_bytes: usize,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            buf: Vec::new(),
            frame_bytes: frame_samples * 2,
        }
    }

    pub fn push(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(pcm);
        let mut frames = Vec::new();
        while self.buf.len() >= self.frame_bytes {
            frames.push(self.buf.drain(..self.frame_bytes).collect());
        }
        frames
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Mute gate plus framing for one captured block. While muted the block is
/// dropped before any encoding; nothing is queued, not even silence.
/// Returns the number of frames submitted.
pub fn forward_block(
    muted: bool,
    pcm: &[u8],
    chunker: &mut FrameChunker,
    audio_tx: &mpsc::Sender<OutboundFrame>,
) -> usize {
    if muted {
        return 0;
    }
    let mut sent = 0;
    for frame in chunker.push(pcm) {
        // try_send: the capture thread never blocks on the network.
        if audio_tx.try_send(OutboundFrame::Audio(frame)).is_ok() {
            sent += 1;
        }
    }
    sent
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
        if i + 1 >= buf.len() {
            break;
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            clamped.to_le_bytes()
        })
        .collect()
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(config);
        }
    }
    // Stereo configs are fine too; the callback downmixes.
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            return Some(StreamConfig {
                channels: range.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    None
}

/// Microphone capture pipeline: cpal stream on a dedicated thread (the
/// stream handle is not Send), raw blocks into a processing thread that
/// resamples to the wire rate, applies the mute gate and frames the PCM.
pub struct AudioCapture {
    shutdown: Arc<AtomicBool>,
    _stream_thread: Option<std::thread::JoinHandle<()>>,
    _processor: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    pub fn start(
        audio_tx: mpsc::Sender<OutboundFrame>,
        state: Arc<AppState>,
        target_rate: u32,
    ) -> Result<Self, String> {
        let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(128);
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<u32, String>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_stream = shutdown.clone();

        let stream_thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    let _ = init_tx.send(Err("no default input device".into()));
                    return;
                }
            };
            let device_name = device.name().unwrap_or_else(|_| "unknown".into());
            log::info!("[audio] using device: {}", device_name);

            // Target rate mono first, then 48 kHz, then whatever the device
            // offers; the processing thread resamples the rest of the way.
            let config = match try_config(&device, target_rate)
                .or_else(|| try_config(&device, 48_000))
            {
                Some(cfg) => cfg,
                None => match device.default_input_config() {
                    Ok(default) => StreamConfig {
                        channels: default.channels(),
                        sample_rate: default.sample_rate(),
                        buffer_size: cpal::BufferSize::Default,
                    },
                    Err(e) => {
                        let _ = init_tx.send(Err(format!("no input config: {}", e)));
                        return;
                    }
                },
            };
            let capture_rate = config.sample_rate.0;
            log::info!(
                "[audio] stream config: {}Hz, {}ch",
                capture_rate,
                config.channels
            );

            let channels = config.channels as usize;
            let stream = match device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };
                    let _ = raw_tx.try_send(mono);
                },
                |err| {
                    log::error!("[audio] stream error: {}", err);
                },
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = init_tx.send(Err(format!("failed to build stream: {}", e)));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = init_tx.send(Err(format!("failed to start stream: {}", e)));
                return;
            }
            // A failed send means the caller timed out and gave up; stop
            // instead of parking an orphaned stream.
            if init_tx.send(Ok(capture_rate)).is_err() {
                return;
            }

            while !shutdown_stream.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            drop(stream);
            log::info!("[audio] capture stream stopped");
        });

        let capture_rate = match init_rx.recv_timeout(DEVICE_INIT_TIMEOUT) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                return Err(format!(
                    "capture stream did not start within {:?}",
                    DEVICE_INIT_TIMEOUT
                ))
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err("capture thread exited before init".into())
            }
        };

        let processor = std::thread::spawn(move || {
            let mut resampler = ResamplerState::default();
            let mut chunker = FrameChunker::new(FRAME_SAMPLES);
            while let Ok(samples) = raw_rx.recv() {
                let muted = state.muted.load(Ordering::SeqCst);
                if muted {
                    // Dropped before any encoding: silence is omitted, not sent.
                    continue;
                }
                let resampled = if capture_rate == target_rate {
                    samples
                } else {
                    resample_linear(&samples, capture_rate, target_rate, &mut resampler)
                };
                let pcm = samples_to_pcm16(&resampled);
                forward_block(muted, &pcm, &mut chunker, &audio_tx);
            }
            log::info!("[audio] processing thread stopped");
        });

        Ok(Self {
            shutdown,
            _stream_thread: Some(stream_thread),
            _processor: Some(processor),
        })
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Snapshot source over the platform capture API. The preferred
/// outward-facing target is picked at acquire time; when it is unavailable
/// the constraint is relaxed once to any available target.
pub struct SnapshotGrabber {
    target_id: u32,
}

impl SnapshotGrabber {
    pub fn open() -> Result<Self, String> {
        let monitors =
            xcap::Monitor::all().map_err(|e| format!("capture enumeration failed: {:?}", e))?;
        let preferred = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or("no capture target available")?;
        let target_id = preferred
            .id()
            .map_err(|e| format!("capture target has no id: {:?}", e))?;
        Ok(Self { target_id })
    }
}

impl SnapshotSource for SnapshotGrabber {
    fn grab_jpeg(&self) -> Option<Vec<u8>> {
        let monitors = xcap::Monitor::all().ok()?;
        let monitor = monitors
            .iter()
            .find(|m| m.id().map(|id| id == self.target_id).unwrap_or(false))?;
        let image = monitor.capture_image().ok()?;
        encode_snapshot(&image)
    }
}

/// Resize to the fixed small resolution and encode as JPEG.
pub fn encode_snapshot(image: &image::RgbaImage) -> Option<Vec<u8>> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let target_w = SNAPSHOT_WIDTH.min(w);
    let target_h = ((h as u64 * target_w as u64) / w as u64).max(1) as u32;
    let resized = image::imageops::resize(
        image,
        target_w,
        target_h,
        image::imageops::FilterType::Triangle,
    );

    let rgb_data: Vec<u8> = resized
        .as_raw()
        .chunks_exact(4)
        .flat_map(|px| &px[..3])
        .copied()
        .collect();

    use image::codecs::jpeg::JpegEncoder;
    use image::ImageEncoder;
    let mut jpeg_bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg_bytes, SNAPSHOT_JPEG_QUALITY)
        .write_image(
            &rgb_data,
            target_w,
            target_h,
            image::ExtendedColorType::Rgb8,
        )
        .ok()?;
    Some(jpeg_bytes)
}

/// Production media source: microphone + snapshot grabber.
#[derive(Default)]
pub struct DeviceMedia {
    audio: Option<AudioCapture>,
    snapshot: Option<Arc<SnapshotGrabber>>,
}

impl DeviceMedia {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MediaSource for DeviceMedia {
    async fn acquire(
        &mut self,
        audio_tx: mpsc::Sender<OutboundFrame>,
        state: Arc<AppState>,
    ) -> Result<Arc<dyn SnapshotSource>, SessionError> {
        // Device enumeration and stream startup are blocking driver calls;
        // run them off the async workers so a stalled driver cannot wedge
        // the lifecycle task.
        let init = tokio::task::spawn_blocking(move || {
            let grabber = Arc::new(SnapshotGrabber::open()?);
            let audio = AudioCapture::start(audio_tx, state, INPUT_SAMPLE_RATE)?;
            Ok::<_, String>((audio, grabber))
        })
        .await
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        let (audio, grabber) = init.map_err(SessionError::DeviceUnavailable)?;
        self.audio = Some(audio);
        self.snapshot = Some(grabber.clone());
        Ok(grabber)
    }

    fn release(&mut self) {
        // Dropping the capture handle signals its threads to stop.
        self.audio = None;
        self.snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_emits_fixed_frames_and_keeps_the_tail() {
        let mut chunker = FrameChunker::new(4); // 8 bytes per frame
        assert!(chunker.push(&[0; 6]).is_empty());
        let frames = chunker.push(&[0; 12]); // 18 buffered -> 2 frames + 2 left
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 8));
        let frames = chunker.push(&[0; 6]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn muted_blocks_are_never_submitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut chunker = FrameChunker::new(2);
        for _ in 0..10 {
            assert_eq!(forward_block(true, &[1; 64], &mut chunker, &tx), 0);
        }
        assert!(rx.try_recv().is_err());

        // Unmuting resumes submission on the next block, no reconnect needed.
        assert!(forward_block(false, &[1; 64], &mut chunker, &tx) > 0);
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Audio(_))));
    }

    #[test]
    fn submission_preserves_block_arrival_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut chunker = FrameChunker::new(2);
        forward_block(false, &[1, 1, 2, 2], &mut chunker, &tx);
        forward_block(false, &[3, 3, 4, 4], &mut chunker, &tx);
        let mut seen = Vec::new();
        while let Ok(OutboundFrame::Audio(f)) = rx.try_recv() {
            seen.push(f[0]);
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn resampler_halves_sample_count_at_two_to_one() {
        let mut state = ResamplerState::default();
        let input: Vec<f32> = (0..1000).map(|i| (i as f32 / 1000.0).sin()).collect();
        let out = resample_linear(&input, 48_000, 24_000, &mut state);
        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 0.5).abs() < 0.05, "ratio was {}", ratio);
    }

    #[test]
    fn snapshot_encoding_bounds_the_resolution() {
        let image = image::RgbaImage::from_pixel(1280, 720, image::Rgba([10, 20, 30, 255]));
        let jpeg = encode_snapshot(&image).expect("encode");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!(decoded.width(), SNAPSHOT_WIDTH);
        assert_eq!(decoded.height(), 180);
    }

    #[test]
    fn empty_snapshot_is_skipped() {
        let image = image::RgbaImage::new(0, 0);
        assert!(encode_snapshot(&image).is_none());
    }
}
