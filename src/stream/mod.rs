//! Fan-out of the audio thread's PCM feed to every broadcast worker.
//!
//! The audio thread calls [`NetworkStream::write`] from its real-time
//! context: nothing here blocks, allocates or takes a contended lock.
//! Each worker owns a [`SampleRing`]; the stream holds the producer side
//! of every registered ring plus the shared clock used for drift
//! correction.
//!
//! [`SampleRing`]: crate::fifo::SampleRing

use crate::constants::{ENGINE_CHANNELS, MAX_WORKERS};
use crate::fifo::SampleRing;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

lazy_static! {
    static ref PROCESS_EPOCH: Instant = Instant::now();
}

/// Microseconds of monotonic process time.
pub(crate) fn network_time_us() -> u64 {
    PROCESS_EPOCH.elapsed().as_micros() as u64
}

/// Shared stream clock: latched sample rate and start timestamp.
#[derive(Debug)]
pub(crate) struct StreamClock {
    running: AtomicBool,
    sample_rate: AtomicU32,
    start_us: AtomicU64,
}

impl StreamClock {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            sample_rate: AtomicU32::new(44_100),
            start_us: AtomicU64::new(0),
        }
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// Frames the stream "should" have carried since it started.
    pub(crate) fn stream_time_frames(&self) -> u64 {
        if !self.running.load(Ordering::Acquire) {
            return 0;
        }
        let elapsed = network_time_us().saturating_sub(self.start_us.load(Ordering::Acquire));
        elapsed * u64::from(self.sample_rate()) / 1_000_000
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriftAction {
    None,
    Duplicate,
    Drop,
}

impl DriftAction {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Duplicate,
            2 => Self::Drop,
            _ => Self::None,
        }
    }
}

/// The per-worker share of the stream: the sample ring plus the clocks
/// and counters drift correction needs.
///
/// The audio thread is the only writer of the producer-side fields; the
/// owning worker only consumes the ring.
pub struct StreamSlot {
    name: String,
    pub(crate) ring: SampleRing,
    pub(crate) clock: Arc<StreamClock>,
    /// Codec frame length in frames; the drift correction unit.
    out_chunk: usize,
    frames_written: AtomicU64,
    overflow_count: AtomicU64,
    drifting: AtomicBool,
    drift_action: AtomicU8,
    data_signal: flume::Sender<()>,
}

impl StreamSlot {
    pub(crate) fn new(
        name: String,
        ring_frames: usize,
        out_chunk: usize,
        clock: Arc<StreamClock>,
        data_signal: flume::Sender<()>,
    ) -> Self {
        Self {
            name,
            ring: SampleRing::new(ring_frames, ENGINE_CHANNELS),
            clock,
            out_chunk,
            frames_written: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            drifting: AtomicBool::new(false),
            drift_action: AtomicU8::new(0),
            data_signal,
        }
    }

    /// Profile name this slot feeds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cumulative frames lost to a full ring.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Pushes `frames` frames, applying drift correction. Audio thread
    /// only.
    fn push_audio(&self, buf: &[f32], frames: usize) {
        let mut buf = buf;
        let mut frames = frames;

        match DriftAction::from_u8(self.drift_action.swap(0, Ordering::Relaxed)) {
            DriftAction::Duplicate if frames > 0 => {
                // Repeat the first frame to slow the stream down a hair.
                let written = self.ring.write(&buf[..ENGINE_CHANNELS], 1);
                self.frames_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                debug!(worker = %self.name, "drift: duplicated one frame");
            },
            DriftAction::Drop if frames > 0 => {
                buf = &buf[ENGINE_CHANNELS..];
                frames -= 1;
                debug!(worker = %self.name, "drift: dropped one frame");
            },
            _ => {},
        }

        // A freshly drained ring means the worker stalled (or just
        // connected): pad with silence until the frame count matches the
        // stream clock again.
        let expected = self
            .clock
            .stream_time_frames()
            .saturating_sub(self.frames_written.load(Ordering::Relaxed));
        if self.ring.write_available() >= self.out_chunk * 2 && expected > frames as u64 {
            let missing = (expected - frames as u64) as usize;
            let padded = self.ring.write_silence(missing);
            self.frames_written
                .fetch_add(padded as u64, Ordering::Relaxed);
            if padded > 0 {
                debug!(worker = %self.name, padded, "drift: silence fill to re-sync");
            }
        }

        let written = self.ring.write(buf, frames);
        self.frames_written
            .fetch_add(written as u64, Ordering::Relaxed);
        if written < frames {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = %self.name,
                lost = frames - written,
                "worker ring overflow, dropping samples"
            );
        }

        self.plan_drift();
        let _ = self.data_signal.try_send(());
    }

    /// Decides whether next cycle should duplicate or drop one frame.
    fn plan_drift(&self) {
        let write_available = self.ring.write_available();
        let read_available = self.ring.read_available();
        let drifting = self.drifting.load(Ordering::Relaxed);

        if write_available > read_available + self.out_chunk / 2 && !drifting {
            self.drifting.store(true, Ordering::Relaxed);
            self.drift_action
                .store(DriftAction::Duplicate as u8, Ordering::Relaxed);
        } else if write_available < self.out_chunk / 2 && !drifting {
            self.drifting.store(true, Ordering::Relaxed);
            self.drift_action
                .store(DriftAction::Drop as u8, Ordering::Relaxed);
        } else {
            self.drifting.store(false, Ordering::Relaxed);
        }
    }

    /// Resets producer-side accounting; called when a worker (re)joins
    /// the stream.
    pub(crate) fn reset_counters(&self) {
        self.frames_written.store(0, Ordering::Relaxed);
        self.drifting.store(false, Ordering::Relaxed);
        self.drift_action.store(0, Ordering::Relaxed);
    }
}

/// One producer, many workers: the audio engine's network output.
pub struct NetworkStream {
    clock: Arc<StreamClock>,
    slots: RwLock<Vec<Arc<StreamSlot>>>,
}

impl NetworkStream {
    /// Creates a stream with no workers registered.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(StreamClock::new()),
            slots: RwLock::new(Vec::with_capacity(MAX_WORKERS)),
        }
    }

    pub(crate) fn clock(&self) -> Arc<StreamClock> {
        Arc::clone(&self.clock)
    }

    /// Latches the sample rate and starts the stream clock.
    pub fn start_stream(&self, sample_rate: u32) {
        self.clock.sample_rate.store(sample_rate, Ordering::Release);
        self.clock
            .start_us
            .store(network_time_us(), Ordering::Release);
        self.clock.running.store(true, Ordering::Release);
        for slot in self.slots.read().iter() {
            slot.reset_counters();
        }
        debug!(sample_rate, "network stream started");
    }

    /// Stops the stream clock; writes become no-ops.
    pub fn stop_stream(&self) {
        self.clock.running.store(false, Ordering::Release);
    }

    /// Sample rate latched by [`start_stream`](Self::start_stream).
    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    /// Microseconds since the stream started.
    pub fn stream_time_us(&self) -> u64 {
        if !self.clock.running.load(Ordering::Acquire) {
            return 0;
        }
        network_time_us().saturating_sub(self.clock.start_us.load(Ordering::Acquire))
    }

    /// Fans `frames` frames of interleaved stereo out to every worker.
    /// Real-time safe: a worker whose ring is full just loses samples.
    pub fn write(&self, buf: &[f32], frames: usize) {
        if !self.clock.running.load(Ordering::Acquire) {
            return;
        }
        // Registration changes are rare; if the list is momentarily held
        // by the control thread, skip the cycle instead of blocking.
        let Some(slots) = self.slots.try_read() else {
            return;
        };
        for slot in slots.iter() {
            slot.push_audio(buf, frames);
        }
    }

    /// Fans out silence, e.g. while the engine is paused.
    pub fn write_silence(&self, frames: usize) {
        let zeros = vec![0.0f32; frames * ENGINE_CHANNELS];
        self.write(&zeros, frames);
    }

    /// Registers a worker's slot. Fails once [`MAX_WORKERS`] are
    /// registered.
    pub(crate) fn add_worker(&self, slot: Arc<StreamSlot>) -> bool {
        let mut slots = self.slots.write();
        if slots.len() >= MAX_WORKERS {
            warn!(worker = %slot.name(), "no free worker slots");
            return false;
        }
        slot.reset_counters();
        slots.push(slot);
        true
    }

    /// Removes a worker's slot.
    pub(crate) fn remove_worker(&self, slot: &Arc<StreamSlot>) {
        self.slots
            .write()
            .retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.slots.read().len()
    }
}

impl Default for NetworkStream {
    fn default() -> Self {
        Self::new()
    }
}
