//! Disk Stream Coordination
//!
//! The transport never reads media itself; it drives registered disk
//! streams through the `DiskStream` trait. `RingStream` is the in-tree
//! implementation: a lock-free SPSC ring filled from a pluggable
//! `SampleSource` on the Butler side and drained on the realtime side.
//!
//! Realtime rules:
//! - The audio callback NEVER waits for the source
//! - The audio callback NEVER allocates
//! - Refill, locate and recovery happen on the Butler thread

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use sl_core::{FrameDelta, FramePos, SlError, SlResult};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default ring capacity in samples (~2.7s mono @ 48kHz)
pub const DEFAULT_RING_CAPACITY: usize = 131072;

/// Samples pulled from the source per refill pass
const REFILL_CHUNK: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// COLLABORATOR TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a stream's samples come from. Implementations may hit the disk;
/// they are only ever called from non-realtime threads.
pub trait SampleSource: Send {
    /// Fill `out` with the samples starting at `start`. Positions past the
    /// end of the material should produce silence, not an error.
    fn read(&mut self, start: FramePos, out: &mut [f32]) -> SlResult<()>;
}

/// The operations the transport needs from a disk stream. Split by thread:
/// `non_realtime_*`, `overwrite_existing_buffers` and `recover` run on the
/// Butler; the seek pair runs on the audio thread and must not block.
pub trait DiskStream: Send + Sync {
    fn name(&self) -> &str;

    /// Flush and refill at `frame`. Butler thread.
    fn non_realtime_locate(&self, frame: FramePos) -> SlResult<()>;

    /// Re-prime buffers for a new speed/direction. Butler thread.
    fn non_realtime_set_speed(&self, speed: f64) -> SlResult<()>;

    /// Whether `delta` frames of travel lie inside already-buffered data
    fn can_internal_playback_seek(&self, delta: FrameDelta) -> bool;

    /// Move the read point by `delta` without touching the source.
    /// Callers must have checked `can_internal_playback_seek` first.
    fn internal_playback_seek(&self, delta: FrameDelta);

    /// Rebuild buffer contents around the current read point. Butler thread.
    fn overwrite_existing_buffers(&self) -> SlResult<()>;

    /// Force the stream into a safe empty state after a failure
    fn recover(&self);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPSC RING (Lock-Free, Wait-Free)
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-producer single-consumer sample ring.
///
/// Producer: Butler refill. Consumer: audio callback.
struct Ring {
    data: Box<[f32]>,
    capacity: usize,
    /// Write position in samples (producer only)
    write_pos: AtomicU32,
    /// Read position in samples (consumer only)
    read_pos: AtomicU32,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0f32; capacity].into_boxed_slice(),
            capacity,
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
        }
    }

    /// Samples available for reading
    #[inline]
    fn read_space(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire) as i64;
        let r = self.read_pos.load(Ordering::Acquire) as i64;
        let mut diff = w - r;
        if diff < 0 {
            diff += self.capacity as i64;
        }
        diff as usize
    }

    /// Samples available for writing.
    /// Leaves a 1-sample gap to distinguish full from empty.
    #[inline]
    fn write_space(&self) -> usize {
        self.capacity.saturating_sub(1).saturating_sub(self.read_space())
    }

    /// Read into `out`, zero-filling past an underrun. Returns samples read.
    #[inline]
    fn read(&self, out: &mut [f32]) -> usize {
        let to_read = out.len().min(self.read_space());
        let r = self.read_pos.load(Ordering::Relaxed) as usize;

        for (i, slot) in out.iter_mut().enumerate().take(to_read) {
            *slot = self.data[(r + i) % self.capacity];
        }
        for slot in out.iter_mut().skip(to_read) {
            *slot = 0.0;
        }

        if to_read > 0 {
            let new_r = (r + to_read) % self.capacity;
            self.read_pos.store(new_r as u32, Ordering::Release);
        }
        to_read
    }

    /// Write from `input`. Returns samples written (less than requested when full).
    #[inline]
    fn write(&self, input: &[f32]) -> usize {
        let to_write = input.len().min(self.write_space());
        if to_write == 0 {
            return 0;
        }

        let w = self.write_pos.load(Ordering::Relaxed) as usize;

        // SAFETY: single producer (SPSC guarantee); the consumer never
        // touches slots between write_pos and read_pos-1.
        let data_ptr = self.data.as_ptr() as *mut f32;
        for (i, sample) in input.iter().enumerate().take(to_write) {
            unsafe {
                *data_ptr.add((w + i) % self.capacity) = *sample;
            }
        }

        let new_w = (w + to_write) % self.capacity;
        self.write_pos.store(new_w as u32, Ordering::Release);
        to_write
    }

    /// Advance the read position without copying. Returns samples skipped.
    #[inline]
    fn skip(&self, count: usize) -> usize {
        let to_skip = count.min(self.read_space());
        if to_skip == 0 {
            return 0;
        }
        let r = self.read_pos.load(Ordering::Relaxed) as usize;
        let new_r = (r + to_skip) % self.capacity;
        self.read_pos.store(new_r as u32, Ordering::Release);
        to_skip
    }

    fn clear(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }
}

// SAFETY: designed for single-producer single-consumer use. The write side
// is only driven from the Butler, the read side only from the audio thread.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

// ═══════════════════════════════════════════════════════════════════════════════
// RING STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Butler-side refill state, behind a mutex the audio thread never takes
struct FillState {
    source: Box<dyn SampleSource>,
    /// Next frame to pull from the source (in playback direction)
    fill_frame: FramePos,
    /// Set when the source errored; cleared by `recover`
    failed: bool,
    scratch: Vec<f32>,
}

/// A mono disk stream: SPSC ring + pluggable source.
pub struct RingStream {
    name: String,
    ring: Ring,
    /// Frame the next realtime `pull` will deliver
    read_frame: AtomicI64,
    /// +1 forward, -1 reverse
    direction: AtomicI64,
    fill: Mutex<FillState>,
}

impl RingStream {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        source: Box<dyn SampleSource>,
    ) -> SlResult<Self> {
        if capacity < 2 {
            return Err(SlError::InvalidParam(
                "ring capacity must be at least 2 samples".into(),
            ));
        }
        Ok(Self {
            name: name.into(),
            ring: Ring::new(capacity),
            read_frame: AtomicI64::new(0),
            direction: AtomicI64::new(1),
            fill: Mutex::new(FillState {
                source,
                fill_frame: 0,
                failed: false,
                scratch: Vec::new(),
            }),
        })
    }

    /// Realtime read. Underruns zero-fill the tail and return the short count.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let n = self.ring.read(out);
        if n > 0 {
            let dir = self.direction.load(Ordering::Relaxed);
            self.read_frame.fetch_add(dir * n as i64, Ordering::Relaxed);
        }
        n
    }

    /// Frame the next `pull` will deliver
    pub fn read_frame(&self) -> FramePos {
        self.read_frame.load(Ordering::Relaxed)
    }

    /// Samples currently buffered ahead of the read point
    pub fn buffered(&self) -> usize {
        self.ring.read_space()
    }

    /// Top the ring up from the source. Butler thread.
    pub fn refill(&self) -> SlResult<()> {
        let mut st = self.fill.lock();
        self.refill_locked(&mut st)
    }

    fn refill_locked(&self, st: &mut FillState) -> SlResult<()> {
        if st.failed {
            return Err(SlError::DiskStream {
                name: self.name.clone(),
                what: "source previously failed, awaiting recover".into(),
            });
        }

        let dir = self.direction.load(Ordering::Relaxed);
        loop {
            let chunk = REFILL_CHUNK.min(self.ring.write_space());
            if chunk == 0 {
                return Ok(());
            }
            st.scratch.resize(chunk, 0.0);

            let start = if dir >= 0 {
                st.fill_frame
            } else {
                st.fill_frame - chunk as i64 + 1
            };
            if let Err(e) = st.source.read(start, &mut st.scratch) {
                st.failed = true;
                return Err(SlError::DiskStream {
                    name: self.name.clone(),
                    what: e.to_string(),
                });
            }
            if dir < 0 {
                st.scratch.reverse();
            }

            self.ring.write(&st.scratch);
            st.fill_frame += dir * chunk as i64;
        }
    }
}

impl DiskStream for RingStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn non_realtime_locate(&self, frame: FramePos) -> SlResult<()> {
        let mut st = self.fill.lock();
        self.ring.clear();
        self.read_frame.store(frame, Ordering::Relaxed);
        st.fill_frame = frame;
        self.refill_locked(&mut st)
    }

    fn non_realtime_set_speed(&self, speed: f64) -> SlResult<()> {
        let mut st = self.fill.lock();
        let dir: i64 = if speed < 0.0 { -1 } else { 1 };
        if dir != self.direction.load(Ordering::Relaxed) {
            self.direction.store(dir, Ordering::Relaxed);
            self.ring.clear();
            st.fill_frame = self.read_frame.load(Ordering::Relaxed);
        }
        self.refill_locked(&mut st)
    }

    fn can_internal_playback_seek(&self, delta: FrameDelta) -> bool {
        let ahead = delta * self.direction.load(Ordering::Relaxed);
        ahead >= 0 && (ahead as usize) <= self.ring.read_space()
    }

    fn internal_playback_seek(&self, delta: FrameDelta) {
        let dir = self.direction.load(Ordering::Relaxed);
        let ahead = delta * dir;
        if ahead <= 0 {
            return;
        }
        let skipped = self.ring.skip(ahead as usize) as i64;
        self.read_frame.fetch_add(dir * skipped, Ordering::Relaxed);
    }

    fn overwrite_existing_buffers(&self) -> SlResult<()> {
        let mut st = self.fill.lock();
        self.ring.clear();
        st.fill_frame = self.read_frame.load(Ordering::Relaxed);
        self.refill_locked(&mut st)
    }

    fn recover(&self) {
        let mut st = self.fill.lock();
        self.ring.clear();
        st.failed = false;
        st.fill_frame = self.read_frame.load(Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STREAM REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared set of registered streams. Written only while the transport is
/// stopped; the realtime path takes the uncontended read lock.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<RwLock<Vec<Arc<dyn DiskStream>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stream: Arc<dyn DiskStream>) {
        self.streams.write().push(stream);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut streams = self.streams.write();
        let before = streams.len();
        streams.retain(|s| s.name() != name);
        streams.len() != before
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// First failure aborts the pass; the Butler decides what to do with it
    pub(crate) fn locate_all(&self, frame: FramePos) -> SlResult<()> {
        for s in self.streams.read().iter() {
            s.non_realtime_locate(frame)?;
        }
        Ok(())
    }

    pub(crate) fn set_speed_all(&self, speed: f64) -> SlResult<()> {
        for s in self.streams.read().iter() {
            s.non_realtime_set_speed(speed)?;
        }
        Ok(())
    }

    pub(crate) fn overwrite_all(&self) -> SlResult<()> {
        for s in self.streams.read().iter() {
            s.overwrite_existing_buffers()?;
        }
        Ok(())
    }

    pub(crate) fn recover_all(&self) {
        for s in self.streams.read().iter() {
            s.recover();
        }
    }

    /// Realign every stream by `delta` if they can all do it without a
    /// full relocate. Audio thread.
    pub(crate) fn try_micro_seek(&self, delta: FrameDelta) -> bool {
        let streams = self.streams.read();
        if !streams.iter().all(|s| s.can_internal_playback_seek(delta)) {
            return false;
        }
        for s in streams.iter() {
            s.internal_playback_seek(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source whose sample value equals its frame position
    struct RampSource {
        fail: bool,
    }

    impl SampleSource for RampSource {
        fn read(&mut self, start: FramePos, out: &mut [f32]) -> SlResult<()> {
            if self.fail {
                return Err(SlError::InvalidParam("simulated read failure".into()));
            }
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = (start + i as i64) as f32;
            }
            Ok(())
        }
    }

    fn ramp_stream(capacity: usize) -> RingStream {
        RingStream::new("test", capacity, Box::new(RampSource { fail: false })).unwrap()
    }

    #[test]
    fn test_ring_wraps_and_keeps_order() {
        let ring = Ring::new(8);
        let mut out = [0.0f32; 4];

        assert_eq!(ring.write(&[1.0, 2.0, 3.0, 4.0, 5.0]), 5);
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        // Wrap across the end of the backing buffer
        assert_eq!(ring.write(&[6.0, 7.0, 8.0, 9.0]), 4);
        let mut out = [0.0f32; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(out, [5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_ring_keeps_one_slot_gap() {
        let ring = Ring::new(8);
        assert_eq!(ring.write_space(), 7);
        assert_eq!(ring.write(&[0.0; 16]), 7);
        assert_eq!(ring.write_space(), 0);
        assert_eq!(ring.read_space(), 7);
    }

    #[test]
    fn test_underrun_zero_fills() {
        let ring = Ring::new(8);
        ring.write(&[1.0, 2.0]);
        let mut out = [9.0f32; 4];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_locate_refills_at_position() {
        let stream = ramp_stream(64);
        stream.non_realtime_locate(1000).unwrap();

        let mut out = [0.0f32; 8];
        assert_eq!(stream.pull(&mut out), 8);
        assert_eq!(out[0], 1000.0);
        assert_eq!(out[7], 1007.0);
        assert_eq!(stream.read_frame(), 1008);
    }

    #[test]
    fn test_micro_seek_within_buffer() {
        let stream = ramp_stream(64);
        stream.non_realtime_locate(0).unwrap();

        assert!(stream.can_internal_playback_seek(16));
        assert!(!stream.can_internal_playback_seek(-4));
        assert!(!stream.can_internal_playback_seek(1000));

        stream.internal_playback_seek(16);
        let mut out = [0.0f32; 2];
        stream.pull(&mut out);
        assert_eq!(out[0], 16.0);
    }

    #[test]
    fn test_reverse_direction_delivers_descending() {
        let stream = ramp_stream(64);
        stream.non_realtime_set_speed(-1.0).unwrap();
        stream.non_realtime_locate(100).unwrap();

        let mut out = [0.0f32; 4];
        stream.pull(&mut out);
        assert_eq!(out, [100.0, 99.0, 98.0, 97.0]);
        assert_eq!(stream.read_frame(), 96);
    }

    #[test]
    fn test_overwrite_keeps_read_point() {
        let stream = ramp_stream(64);
        stream.non_realtime_locate(0).unwrap();

        let mut out = [0.0f32; 10];
        stream.pull(&mut out);
        assert_eq!(stream.read_frame(), 10);

        stream.overwrite_existing_buffers().unwrap();
        let mut out = [0.0f32; 4];
        stream.pull(&mut out);
        assert_eq!(out[0], 10.0);
    }

    #[test]
    fn test_failed_source_poisons_until_recover() {
        let stream =
            RingStream::new("bad", 64, Box::new(RampSource { fail: true })).unwrap();

        let err = stream.non_realtime_locate(0).unwrap_err();
        assert!(matches!(err, SlError::DiskStream { .. }));
        // Still poisoned even though this call would not touch the source
        assert!(stream.overwrite_existing_buffers().is_err());

        stream.recover();
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn test_registry_drives_all_streams() {
        let registry = StreamRegistry::new();
        registry.add(Arc::new(ramp_stream(64)));
        registry.add(Arc::new(ramp_stream(64)));
        assert_eq!(registry.len(), 2);

        registry.locate_all(500).unwrap();
        assert!(registry.try_micro_seek(8));
        assert!(!registry.try_micro_seek(10_000));

        assert!(registry.remove("test"));
        assert!(registry.is_empty());
    }
}
