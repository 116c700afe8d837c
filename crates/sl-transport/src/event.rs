//! Transport Events
//!
//! Every control request becomes a `TransportEvent` in a lock-free queue.
//! At the top of each audio cycle the processor merges pending events into
//! a frame-ordered list and applies them at their action frame, so a locate
//! scheduled for frame N lands at frame N no matter which thread asked or
//! when the request arrived.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::Mutex;
use rtrb::{Producer, PushError};

use sl_core::{FramePos, FrameRange};
use sl_sync::Slave;

/// A transport control request
pub enum EventKind {
    /// Head toward the given speed (0 stops without flags)
    SetSpeed { speed: f64 },
    /// Stop; `abort` skips auto-return and capture, `clear_state` drops
    /// loop/range substate before the next roll
    Stop { abort: bool, clear_state: bool },
    /// Move the playhead; `force` relocates even when already there
    Locate {
        target: FramePos,
        with_roll: bool,
        force: bool,
    },
    /// Locate to `start`, roll, and return to `return_to` on the next stop
    RollAndReturn {
        start: FramePos,
        return_to: FramePos,
    },
    /// Enable or disable loop play over the configured loop range
    SetLoop { enabled: bool, leave_rolling: bool },
    /// Play the given ranges in order; empty cancels range play
    SetPlayRange {
        ranges: Vec<FrameRange>,
        leave_rolling: bool,
    },
    /// Auto event: stop at the end of the last range
    RangeStop,
    /// Auto event: jump to `target` (loop wrap, next range)
    RangeLocate { target: FramePos },
    /// Rebuild stream buffers around the current position
    Overwrite,
    /// Arm or disarm record
    SetRecord { enabled: bool },
    /// Install a new sync source (`None` returns to the internal clock)
    SetSyncSource { slave: Option<Box<dyn Slave>> },
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetSpeed { speed } => write!(f, "SetSpeed({speed})"),
            Self::Stop { abort, clear_state } => {
                write!(f, "Stop(abort={abort}, clear_state={clear_state})")
            }
            Self::Locate {
                target,
                with_roll,
                force,
            } => write!(f, "Locate({target}, roll={with_roll}, force={force})"),
            Self::RollAndReturn { start, return_to } => {
                write!(f, "RollAndReturn({start} -> {return_to})")
            }
            Self::SetLoop {
                enabled,
                leave_rolling,
            } => write!(f, "SetLoop({enabled}, leave_rolling={leave_rolling})"),
            Self::SetPlayRange { ranges, .. } => write!(f, "SetPlayRange({} ranges)", ranges.len()),
            Self::RangeStop => write!(f, "RangeStop"),
            Self::RangeLocate { target } => write!(f, "RangeLocate({target})"),
            Self::Overwrite => write!(f, "Overwrite"),
            Self::SetRecord { enabled } => write!(f, "SetRecord({enabled})"),
            Self::SetSyncSource { slave } => match slave {
                Some(s) => write!(f, "SetSyncSource({})", s.name()),
                None => write!(f, "SetSyncSource(internal)"),
            },
        }
    }
}

/// An event plus when to apply it. `action_frame == None` means "at the
/// next safe point", i.e. the top of the next cycle.
#[derive(Debug)]
pub struct TransportEvent {
    pub action_frame: Option<FramePos>,
    pub serial: u64,
    pub kind: EventKind,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING QUEUE (any thread -> audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer side of the pending-event queue. The Mutex covers only the
/// producer handle so multiple request threads can share it; the audio
/// thread owns the consumer and never takes this lock.
pub(crate) struct EventQueue {
    tx: Mutex<Producer<TransportEvent>>,
    serial: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub(crate) fn new(tx: Producer<TransportEvent>) -> Self {
        Self {
            tx: Mutex::new(tx),
            serial: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, action_frame: Option<FramePos>, kind: EventKind) {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let event = TransportEvent {
            action_frame,
            serial,
            kind,
        };
        if let Err(PushError::Full(rejected)) = self.tx.lock().push(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("transport event queue full, dropped {:?}", rejected.kind);
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SORTED EVENT LIST (audio thread only)
// ═══════════════════════════════════════════════════════════════════════════════

/// Frame-ordered event list. Ties sort by submission serial, so two events
/// landing on the same frame apply in the order they were requested.
#[derive(Debug, Default)]
pub(crate) struct EventList {
    events: Vec<TransportEvent>,
}

impl EventList {
    pub(crate) fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Preallocated list for the realtime side
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, event: TransportEvent) {
        debug_assert!(event.action_frame.is_some());
        let key = (event.action_frame.unwrap_or(0), event.serial);
        let at = self
            .events
            .partition_point(|e| (e.action_frame.unwrap_or(0), e.serial) <= key);
        self.events.insert(at, event);
    }

    /// Pop the earliest event with `action_frame <= up_to`
    pub(crate) fn pop_due(&mut self, up_to: FramePos) -> Option<TransportEvent> {
        match self.events.first() {
            Some(e) if e.action_frame.unwrap_or(0) <= up_to => Some(self.events.remove(0)),
            _ => None,
        }
    }

    /// Frame of the earliest queued event
    pub(crate) fn next_frame(&self) -> Option<FramePos> {
        self.events.first().and_then(|e| e.action_frame)
    }

    /// Drop the auto events (loop wraps, range boundaries)
    pub(crate) fn clear_auto(&mut self) {
        self.events.retain(|e| {
            !matches!(
                e.kind,
                EventKind::RangeStop | EventKind::RangeLocate { .. }
            )
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}
