//! Peer audio-backend transport clock
//!
//! Models a JACK-style peer transport: the backend glue publishes the
//! peer's binary running state and sample position, the engine chases it
//! as a slave, and outbound start/stop/locate commands travel back over a
//! bounded channel tap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::debug;

use sl_core::{FrameCount, FramePos};

use crate::Slave;

/// Outbound capacity; redundant commands beyond this are dropped
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Transport commands the engine sends to the peer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Start,
    Stop,
    Locate(FramePos),
}

struct PeerShared {
    running: AtomicBool,
    starting: AtomicBool,
    position: AtomicI64,
    cycle_frames: AtomicI64,
    command_tx: Sender<PeerCommand>,
}

/// Backend-side handle: publishes the peer's transport state
pub struct PeerClock {
    shared: Arc<PeerShared>,
}

impl PeerClock {
    /// Peer entered or left the rolling state
    pub fn set_running(&self, running: bool) {
        self.shared.starting.store(false, Ordering::Release);
        self.shared.running.store(running, Ordering::Release);
    }

    /// Peer is preparing to roll (sync handshake in progress)
    pub fn set_starting(&self) {
        self.shared.starting.store(true, Ordering::Release);
    }

    pub fn set_position(&self, frame: FramePos) {
        self.shared.position.store(frame, Ordering::Release);
    }

    /// Advance the published position by one cycle if rolling
    pub fn advance(&self, frames: FrameCount) {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.position.fetch_add(frames, Ordering::AcqRel);
        }
    }

    /// Backend buffer size changed
    pub fn set_cycle_frames(&self, frames: FrameCount) {
        self.shared.cycle_frames.store(frames.max(1), Ordering::Release);
    }
}

/// Engine-side slave chasing the peer clock
pub struct PeerSlave {
    shared: Arc<PeerShared>,
}

impl PeerSlave {
    /// Ask the peer to start rolling
    pub fn transport_start(&self) {
        let _ = self.shared.command_tx.try_send(PeerCommand::Start);
    }

    /// Ask the peer to stop
    pub fn transport_stop(&self) {
        let _ = self.shared.command_tx.try_send(PeerCommand::Stop);
    }

    /// Ask the peer to relocate
    pub fn transport_locate(&self, frame: FramePos) {
        debug!("peer: requesting locate to {frame}");
        let _ = self.shared.command_tx.try_send(PeerCommand::Locate(frame));
    }
}

impl Slave for PeerSlave {
    fn speed_and_position(&mut self, _now: FramePos) -> Option<(f64, FramePos)> {
        let speed = if self.shared.running.load(Ordering::Acquire) {
            1.0
        } else {
            0.0
        };
        Some((speed, self.shared.position.load(Ordering::Acquire)))
    }

    fn locked(&self) -> bool {
        true
    }

    fn starting(&self) -> bool {
        self.shared.starting.load(Ordering::Acquire)
    }

    // Peers publish position at cycle granularity; a finer resolution
    // would force a hard locate on every sub-cycle sampling offset.
    fn resolution(&self) -> FrameCount {
        self.shared.cycle_frames.load(Ordering::Acquire)
    }

    fn owns_transport_speed(&self) -> bool {
        true
    }

    fn is_always_synced(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "peer"
    }
}

/// Create a connected peer clock: backend handle, engine slave, and the
/// receiver for outbound transport commands. `cycle_frames` is the
/// backend's period size, which bounds the slave's position resolution.
pub fn create_peer_clock(cycle_frames: FrameCount) -> (PeerClock, PeerSlave, Receiver<PeerCommand>) {
    let (command_tx, command_rx) = bounded(COMMAND_QUEUE_CAPACITY);
    let shared = Arc::new(PeerShared {
        running: AtomicBool::new(false),
        starting: AtomicBool::new(false),
        position: AtomicI64::new(0),
        cycle_frames: AtomicI64::new(cycle_frames.max(1)),
        command_tx,
    });
    let clock = PeerClock {
        shared: Arc::clone(&shared),
    };
    let slave = PeerSlave { shared };
    (clock, slave, command_rx)
}
