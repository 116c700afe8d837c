//! PostTransportWork Registry
//!
//! The handoff protocol between the audio callback and the Butler. The
//! callback describes deferred work as bits OR-ed into one shared word,
//! with a few scalar side fields (locate target, return frame) written
//! before the bits that make them visible. The Butler reads the word,
//! services each bit, and clears exactly what it processed, so bits OR-ed
//! in concurrently survive for the next pass.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use log::error;

use sl_core::FramePos;

/// CAS attempts before the registry declares a logic fault
const ADD_RETRY_BUDGET: u32 = 8;

// ═══════════════════════════════════════════════════════════════════════════════
// WORK BITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Deferred-work bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostTransportWork(u32);

impl PostTransportWork {
    /// Full non-realtime stop cleanup
    pub const STOP: u32 = 1 << 0;
    /// Disarm record after an aborted capture
    pub const DISABLE_RECORD: u32 = 1 << 1;
    /// Re-align stream positions to the transport frame
    pub const POSITION: u32 = 1 << 2;
    /// A capture pass ended and must be flushed
    pub const DID_RECORD: u32 = 1 << 3;
    /// Session length changed
    pub const DURATION: u32 = 1 << 4;
    /// Seek every stream to the registry's locate target
    pub const LOCATE: u32 = 1 << 5;
    /// Resume rolling once the pass completes
    pub const ROLL: u32 = 1 << 6;
    /// The stop was an abort; skip auto-return and capture flush
    pub const ABORT: u32 = 1 << 7;
    /// Rebuild stream buffers around the current position
    pub const OVERWRITE: u32 = 1 << 8;
    /// Propagate a new transport speed to the streams
    pub const SPEED: u32 = 1 << 9;
    /// Audition setup
    pub const AUDITION: u32 = 1 << 10;
    /// Scrub setup
    pub const SCRUB: u32 = 1 << 11;
    /// Playback direction flipped; streams must refill the other way
    pub const REVERSE: u32 = 1 << 12;
    /// Input monitoring routing changed
    pub const INPUT_CHANGE: u32 = 1 << 13;
    /// Automation curves must be resized for the new speed
    pub const CURVE_REALLOC: u32 = 1 << 14;
    /// Clear auto-return/loop substate when the pass completes
    pub const CLEAR_SUBSTATE: u32 = 1 << 15;

    #[inline]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    #[inline]
    pub const fn intersects(self, bits: u32) -> bool {
        self.0 & bits != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared deferred-work state.
///
/// Scalar fields are written before the bit that publishes them (Release on
/// the OR, Acquire on the Butler's read), so a set `LOCATE` bit guarantees
/// `locate_target` holds the frame that goes with it.
pub struct WorkRegistry {
    bits: AtomicU32,
    locate_target: AtomicI64,
    return_frame: AtomicI64,
    roll_after_locate: AtomicBool,
    /// Requested speed for `SPEED`/`REVERSE` work, as f64 bits
    target_speed: AtomicU64,
    /// Monotonic summon counter, bumped by every summon
    requests: AtomicU64,
    /// Value of `requests` after the last clean Butler pass
    serviced: AtomicU64,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            locate_target: AtomicI64::new(0),
            return_frame: AtomicI64::new(0),
            roll_after_locate: AtomicBool::new(false),
            target_speed: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            serviced: AtomicU64::new(0),
        }
    }

    /// OR bits into the shared word. Realtime-safe.
    ///
    /// Contention here is a handful of threads at worst, so exhausting the
    /// retry budget means a broken caller, not bad luck; that is fatal.
    pub fn add(&self, work: u32) {
        let mut current = self.bits.load(Ordering::Relaxed);
        for _ in 0..ADD_RETRY_BUDGET {
            match self.bits.compare_exchange_weak(
                current,
                current | work,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
        error!("work registry CAS retry budget exhausted, aborting");
        std::process::abort();
    }

    /// Current work bits
    #[inline]
    pub fn load(&self) -> PostTransportWork {
        PostTransportWork(self.bits.load(Ordering::Acquire))
    }

    /// True while any deferred work is outstanding
    #[inline]
    pub fn pending(&self) -> bool {
        self.bits.load(Ordering::Acquire) != 0
    }

    /// Clear exactly the bits a completed pass processed
    pub fn complete(&self, done: PostTransportWork) {
        self.bits.fetch_and(!done.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn set_locate_target(&self, frame: FramePos) {
        self.locate_target.store(frame, Ordering::Release);
    }

    #[inline]
    pub fn locate_target(&self) -> FramePos {
        self.locate_target.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_return_frame(&self, frame: FramePos) {
        self.return_frame.store(frame, Ordering::Release);
    }

    #[inline]
    pub fn return_frame(&self) -> FramePos {
        self.return_frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_roll_after_locate(&self, roll: bool) {
        self.roll_after_locate.store(roll, Ordering::Release);
    }

    #[inline]
    pub fn roll_after_locate(&self) -> bool {
        self.roll_after_locate.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_target_speed(&self, speed: f64) {
        self.target_speed.store(speed.to_bits(), Ordering::Release);
    }

    #[inline]
    pub fn target_speed(&self) -> f64 {
        f64::from_bits(self.target_speed.load(Ordering::Acquire))
    }

    /// Record a summon; returns the new request count
    #[inline]
    pub fn bump_requests(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_serviced(&self, up_to: u64) {
        self.serviced.store(up_to, Ordering::Release);
    }

    #[inline]
    pub fn serviced(&self) -> u64 {
        self.serviced.load(Ordering::Acquire)
    }
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
