//! Single-producer single-consumer sample transport between the audio
//! thread and a broadcast worker.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A lock-free ring of interleaved `f32` frames.
///
/// One producer thread may call [`write`]/[`write_silence`] while one
/// consumer thread calls [`read`], [`acquire_read_regions`] and
/// [`release_read_regions`]; no other concurrent access is permitted.
/// Cursors are monotonic counters synchronised with acquire/release
/// ordering, which is sufficient on x86 and ARM. No operation blocks:
/// overflow is observed by the caller as a short write.
///
/// [`write`]: SampleRing::write
/// [`write_silence`]: SampleRing::write_silence
/// [`read`]: SampleRing::read
/// [`acquire_read_regions`]: SampleRing::acquire_read_regions
/// [`release_read_regions`]: SampleRing::release_read_regions
pub struct SampleRing {
    buf: UnsafeCell<Box<[f32]>>,
    capacity: usize,
    channels: usize,
    // Frame counts, monotonically increasing; in-flight frames are
    // `write_pos - read_pos`.
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

// The raw buffer is only touched through the disjoint regions granted by
// the cursor pair below.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Creates a ring holding up to `capacity` frames of `channels`
    /// interleaved samples.
    pub fn new(capacity: usize, channels: usize) -> Self {
        assert!(capacity > 0 && channels > 0);
        Self {
            buf: UnsafeCell::new(vec![0.0; capacity * channels].into_boxed_slice()),
            capacity,
            channels,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    /// Total capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames the producer may currently write without overwriting
    /// unread data.
    pub fn write_available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        self.capacity - w.wrapping_sub(r)
    }

    /// Frames the consumer may currently read.
    pub fn read_available(&self) -> usize {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Copies up to `frames` frames from `src` into the ring, returning
    /// how many were accepted. Producer side only.
    pub fn write(&self, src: &[f32], frames: usize) -> usize {
        let frames = frames.min(src.len() / self.channels);
        self.produce(frames, |dst, taken| {
            let at = taken * self.channels;
            dst.copy_from_slice(&src[at..at + dst.len()]);
        })
    }

    /// Writes up to `frames` frames of silence. Producer side only.
    pub fn write_silence(&self, frames: usize) -> usize {
        self.produce(frames, |dst, _| {
            dst.fill(0.0);
        })
    }

    fn produce(&self, frames: usize, mut fill: impl FnMut(&mut [f32], usize)) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        let n = frames.min(self.capacity - w.wrapping_sub(r));
        if n == 0 {
            return 0;
        }

        let idx = w % self.capacity;
        let first = n.min(self.capacity - idx);
        // SAFETY: the region `[w, w + n)` is unread space; the consumer
        // only touches `[r, w)` and there is exactly one producer.
        unsafe {
            let base = (*self.buf.get()).as_mut_ptr();
            fill(
                std::slice::from_raw_parts_mut(base.add(idx * self.channels), first * self.channels),
                0,
            );
            if n > first {
                fill(
                    std::slice::from_raw_parts_mut(base, (n - first) * self.channels),
                    first,
                );
            }
        }

        self.write_pos.store(w.wrapping_add(n), Ordering::Release);
        n
    }

    /// Copies up to `frames` frames into `dst`, returning how many were
    /// read. Consumer side only.
    pub fn read(&self, dst: &mut [f32], frames: usize) -> usize {
        let want = frames.min(dst.len() / self.channels);
        let (a, b) = self.acquire_read_regions(want);
        let got = (a.len() + b.len()) / self.channels;
        dst[..a.len()].copy_from_slice(a);
        dst[a.len()..a.len() + b.len()].copy_from_slice(b);
        self.release_read_regions(got);
        got
    }

    /// Grants direct access to up to `frames` readable frames as at most
    /// two contiguous slices; the second is non-empty only when the data
    /// wraps around the end of the ring. Consumer side only.
    ///
    /// The regions stay valid until the matching
    /// [`release_read_regions`](SampleRing::release_read_regions).
    pub fn acquire_read_regions(&self, frames: usize) -> (&[f32], &[f32]) {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        let n = frames.min(w.wrapping_sub(r));

        let idx = r % self.capacity;
        let first = n.min(self.capacity - idx);
        // SAFETY: `[r, r + n)` is committed data the producer will not
        // touch until the read cursor passes it; only one consumer exists.
        unsafe {
            let base = (*self.buf.get()).as_ptr();
            let a = std::slice::from_raw_parts(base.add(idx * self.channels), first * self.channels);
            let b = std::slice::from_raw_parts(base, (n - first) * self.channels);
            (a, b)
        }
    }

    /// Advances the read cursor by `frames` previously acquired frames.
    /// Consumer side only.
    pub fn release_read_regions(&self, frames: usize) {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        let n = frames.min(w.wrapping_sub(r));
        self.read_pos.store(r.wrapping_add(n), Ordering::Release);
    }

    /// Discards everything currently readable, returning the frame count.
    /// Consumer side only.
    pub fn discard_all(&self) -> usize {
        let n = self.read_available();
        self.release_read_regions(n);
        n
    }
}
