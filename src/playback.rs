use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Output device abstraction the scheduler drives: a clock on the output
/// timeline, buffer starts at absolute times, best-effort stops, and
/// completion notification. The production implementation is a cpal mixer;
/// tests substitute a fake clock.
pub trait PlaybackOutput: Send {
    /// Current position on the output timeline, in seconds.
    fn now(&self) -> f64;
    /// Begin playing `samples` at `start_at` seconds; returns a handle id.
    fn begin(&mut self, samples: Vec<i16>, start_at: f64) -> u64;
    /// Stop one buffer. Stopping a finished or unknown id is a no-op.
    fn stop(&mut self, id: u64);
    /// Ids that completed naturally since the last call.
    fn finished(&mut self) -> Vec<u64>;
}

/// Gapless scheduler for inbound speech chunks.
///
/// `next_start` is the single timeline cursor: the earliest time the next
/// chunk may begin. Scheduling each chunk immediately after the previous
/// one keeps playback back-to-back regardless of network jitter, as long
/// as chunks arrive in order. The cursor only moves forward, except for
/// the explicit reset in `flush`.
pub struct PlaybackScheduler<O: PlaybackOutput> {
    output: O,
    sample_rate: u32,
    next_start: f64,
    pending: HashSet<u64>,
}

impl<O: PlaybackOutput> PlaybackScheduler<O> {
    pub fn new(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            next_start: 0.0,
            pending: HashSet::new(),
        }
    }

    /// Decode one 16-bit LE PCM chunk and schedule it right after the
    /// previously scheduled chunk (or now, whichever is later).
    pub fn schedule(&mut self, pcm: &[u8]) {
        self.reap();
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.is_empty() {
            return;
        }
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start_at = self.next_start.max(self.output.now());
        let id = self.output.begin(samples, start_at);
        self.next_start = start_at + duration;
        self.pending.insert(id);
    }

    /// Interruption: stop everything still pending and rewind the cursor so
    /// the next chunk starts immediately instead of at a stale offset.
    pub fn flush(&mut self) {
        for id in self.pending.drain() {
            self.output.stop(id);
        }
        self.next_start = 0.0;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn pending_len(&mut self) -> usize {
        self.reap();
        self.pending.len()
    }

    fn reap(&mut self) {
        for id in self.output.finished() {
            self.pending.remove(&id);
        }
    }
}

struct ScheduledBuffer {
    id: u64,
    /// Start offset in output-clock samples.
    start: u64,
    samples: Vec<i16>,
}

struct MixState {
    /// Output frames rendered so far; the output clock.
    cursor: u64,
    next_id: u64,
    buffers: Vec<ScheduledBuffer>,
    finished: Vec<u64>,
}

/// `PlaybackOutput` over a cpal stream. The stream handle is not Send, so a
/// dedicated thread owns it; this handle only touches the shared mix state.
pub struct MixerOutput {
    shared: Arc<Mutex<MixState>>,
    /// Device rate the clock runs at. The mix thread steps through the
    /// scheduled buffers at chunk_rate / device_rate.
    device_rate: u32,
    shutdown: Arc<AtomicBool>,
}

impl MixerOutput {
    /// Opens the default output device on its own thread and returns once
    /// the stream is running.
    pub fn spawn(chunk_rate: u32) -> Result<Self, String> {
        let shared = Arc::new(Mutex::new(MixState {
            cursor: 0,
            next_id: 1,
            buffers: Vec::new(),
            finished: Vec::new(),
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<u32, String>>();

        let shared_thread = shared.clone();
        let shutdown_thread = shutdown.clone();
        std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    let _ = init_tx.send(Err("no default output device".into()));
                    return;
                }
            };
            let default = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = init_tx.send(Err(format!("no output config: {}", e)));
                    return;
                }
            };
            let device_rate = default.sample_rate().0;
            let channels = default.channels() as usize;
            let config = cpal::StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            log::info!("[playback] output: {}Hz, {}ch", device_rate, channels);

            let step = chunk_rate as f64 / device_rate as f64;
            let mix = shared_thread;
            let stream = match device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut state = match mix.lock() {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    let frames = data.len() / channels;
                    for i in 0..frames {
                        let t = state.cursor + i as u64;
                        let mut acc: f32 = 0.0;
                        for buf in &state.buffers {
                            if t < buf.start {
                                continue;
                            }
                            let idx = ((t - buf.start) as f64 * step) as usize;
                            if let Some(&s) = buf.samples.get(idx) {
                                acc += s as f32 / 32768.0;
                            }
                        }
                        let sample = acc.clamp(-1.0, 1.0);
                        for c in 0..channels {
                            data[i * channels + c] = sample;
                        }
                    }
                    state.cursor += frames as u64;
                    let cursor = state.cursor;
                    let mut done = Vec::new();
                    state.buffers.retain(|buf| {
                        let len_device =
                            (buf.samples.len() as f64 / step).ceil() as u64;
                        if cursor >= buf.start + len_device {
                            done.push(buf.id);
                            false
                        } else {
                            true
                        }
                    });
                    state.finished.extend(done);
                },
                |err| {
                    log::error!("[playback] stream error: {}", err);
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
            let _ = init_tx.send(Ok(device_rate));

            while !shutdown_thread.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            drop(stream);
            log::info!("[playback] output stream stopped");
        });

        let device_rate = match init_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err("playback thread exited before init".into()),
        };

        Ok(Self {
            shared,
            device_rate,
            shutdown,
        })
    }
}

impl PlaybackOutput for MixerOutput {
    fn now(&self) -> f64 {
        self.shared
            .lock()
            .map(|s| s.cursor as f64 / self.device_rate as f64)
            .unwrap_or(0.0)
    }

    fn begin(&mut self, samples: Vec<i16>, start_at: f64) -> u64 {
        let mut state = match self.shared.lock() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        let id = state.next_id;
        state.next_id += 1;
        let start = (start_at * self.device_rate as f64) as u64;
        state.buffers.push(ScheduledBuffer { id, start, samples });
        id
    }

    fn stop(&mut self, id: u64) {
        if let Ok(mut state) = self.shared.lock() {
            state.buffers.retain(|b| b.id != id);
        }
    }

    fn finished(&mut self) -> Vec<u64> {
        self.shared
            .lock()
            .map(|mut s| std::mem::take(&mut s.finished))
            .unwrap_or_default()
    }
}

impl Drop for MixerOutput {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub mod testing {
    use super::PlaybackOutput;
    use std::collections::HashMap;

    /// Deterministic output with a manually advanced clock.
    #[derive(Default)]
    pub struct FakeOutput {
        pub clock: f64,
        next_id: u64,
        pub playing: HashMap<u64, (f64, usize)>,
        pub stopped: Vec<u64>,
        done: Vec<u64>,
    }

    impl FakeOutput {
        pub fn finish(&mut self, id: u64) {
            if self.playing.remove(&id).is_some() {
                self.done.push(id);
            }
        }
    }

    impl PlaybackOutput for FakeOutput {
        fn now(&self) -> f64 {
            self.clock
        }

        fn begin(&mut self, samples: Vec<i16>, start_at: f64) -> u64 {
            self.next_id += 1;
            self.playing.insert(self.next_id, (start_at, samples.len()));
            self.next_id
        }

        fn stop(&mut self, id: u64) {
            self.playing.remove(&id);
            self.stopped.push(id);
        }

        fn finished(&mut self) -> Vec<u64> {
            std::mem::take(&mut self.done)
        }
    }
}
