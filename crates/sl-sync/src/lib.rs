//! sl-sync: External clock sources for the Syncline transport
//!
//! - `Slave`: the trait the transport follower polls once per audio cycle
//! - `Dll`: second-order delay-locked loop for clock recovery
//! - `LtcDecoder`/`LtcEncoder`: biphase-mark SMPTE linear timecode
//! - `LtcSlave`: chases an LTC signal carried in an audio buffer
//! - `PeerClock`/`PeerSlave`: JACK-style peer backend transport

mod decoder;
mod dll;
mod ltc;
mod peer;

pub use decoder::{LtcDecoder, LtcEncoder, LtcFrame};
pub use dll::Dll;
pub use ltc::LtcSlave;
pub use peer::{PeerClock, PeerCommand, PeerSlave, create_peer_clock};

use sl_core::{FrameCount, FramePos};

/// An external clock source the transport can lock to.
///
/// Polled once per audio cycle from the realtime thread; every method must
/// be realtime-safe. `now` is the engine's monotonic sample clock, which
/// advances every cycle whether or not the transport moves.
pub trait Slave: Send {
    /// Current estimate of the source's speed and position.
    ///
    /// `None` means the source has no usable estimate this cycle (no signal
    /// yet, or the fly-wheel timed out); the follower holds the transport
    /// still and waits. A stopped-but-present source reports `Some((0.0, pos))`.
    fn speed_and_position(&mut self, now: FramePos) -> Option<(f64, FramePos)>;

    /// Deliver one cycle of sync input to sources that decode an audio
    /// signal. Sources with their own clock ignore it.
    fn feed_audio(&mut self, _input: &[f32], _cycle_start: FramePos) {}

    /// True once the source has a stable clock estimate
    fn locked(&self) -> bool;

    /// True while the source is spinning up but not yet delivering motion
    fn starting(&self) -> bool {
        false
    }

    /// Source is healthy. Returning false makes the transport drop the
    /// sync source entirely.
    fn ok(&self) -> bool {
        true
    }

    /// Worst-case positional error the source considers normal, in samples.
    /// Persistent drift beyond this makes the follower fall back to silent
    /// motion instead of fine-tracking.
    fn resolution(&self) -> FrameCount;

    /// The source needs the transport parked ahead of it before locking
    /// (linear media chased from behind)
    fn requires_seekahead(&self) -> bool {
        false
    }

    /// How far ahead to park when `requires_seekahead` is set
    fn seekahead_distance(&self) -> FrameCount {
        0
    }

    /// The source dictates transport speed verbatim; the follower applies
    /// no proportional correction on top
    fn owns_transport_speed(&self) -> bool {
        false
    }

    /// Speed is effectively binary (0/1) and position is sample-accurate,
    /// so the follower skips drift smoothing
    fn is_always_synced(&self) -> bool {
        false
    }

    /// Display name for logs and notices
    fn name(&self) -> &str;
}
