//! Transport State
//!
//! The realtime-private state of the transport state machine, plus the
//! lock-free snapshot other threads read. Position and speed have exactly
//! one writer, the audio thread; everyone else sees the snapshot published
//! at the end of each cycle and must tolerate one cycle of staleness.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use sl_core::FramePos;

// ═══════════════════════════════════════════════════════════════════════════════
// SUBSTATE FLAGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport sub-state flags, private to the audio thread.
///
/// `DECLICK_OUT` and `PENDING_LOCATE` only carry meaning together: a locate
/// requested while rolling is parked behind the fade-out and executes the
/// cycle after the fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Substate(u16);

impl Substate {
    /// Fade-in pending on the next rolling cycle
    pub const DECLICK_IN: u16 = 1 << 0;
    /// Fade-out in progress; motion change deferred one cycle
    pub const DECLICK_OUT: u16 = 1 << 1;
    /// Stop must flush a capture pass before completing
    pub const STOP_PENDING_CAPTURE: u16 = 1 << 2;
    /// Next stop locates back to the recorded return frame
    pub const AUTO_RETURNING: u16 = 1 << 3;
    /// A locate is parked behind the current declick
    pub const PENDING_LOCATE: u16 = 1 << 4;
    /// Loop establishment deferred to the next safe point
    pub const PENDING_SET_LOOP: u16 = 1 << 5;

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, flags: u16) -> bool {
        self.0 & flags == flags
    }

    #[inline]
    pub const fn intersects(self, flags: u16) -> bool {
        self.0 & flags != 0
    }

    #[inline]
    pub fn insert(&mut self, flags: u16) {
        self.0 |= flags;
    }

    #[inline]
    pub fn remove(&mut self, flags: u16) {
        self.0 &= !flags;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REALTIME-PRIVATE STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// The transport fields only the audio thread touches
#[derive(Debug)]
pub(crate) struct TransportState {
    /// Authoritative playhead position
    pub frame: FramePos,
    /// Speed the transport is moving at this cycle
    pub speed: f64,
    /// Speed the transport is heading toward (requests land here first)
    pub target_speed: f64,
    /// Last nonzero speed, for direction-flip detection across stops
    pub last_nonzero_speed: f64,
    /// Sub-state flags
    pub substate: Substate,
    /// Record arm
    pub record_enabled: bool,
}

impl TransportState {
    pub(crate) fn new() -> Self {
        Self {
            frame: 0,
            speed: 0.0,
            target_speed: 0.0,
            last_nonzero_speed: 1.0,
            substate: Substate::empty(),
            record_enabled: false,
        }
    }

    #[inline]
    pub(crate) fn rolling(&self) -> bool {
        self.speed != 0.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLISHED SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Lock-free transport snapshot for non-realtime readers.
///
/// Published once per cycle. The three fields are written independently, so
/// a reader can observe position from one cycle and speed from the next;
/// callers needing consistency poll until two reads agree.
pub struct TransportSnapshot {
    frame: AtomicI64,
    speed_bits: AtomicU64,
    rolling: AtomicBool,
}

impl TransportSnapshot {
    pub(crate) fn new() -> Self {
        Self {
            frame: AtomicI64::new(0),
            speed_bits: AtomicU64::new(0.0f64.to_bits()),
            rolling: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn publish(&self, frame: FramePos, speed: f64) {
        self.frame.store(frame, Ordering::Release);
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
        self.rolling.store(speed != 0.0, Ordering::Release);
    }

    #[inline]
    pub fn frame(&self) -> FramePos {
        self.frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }
}
