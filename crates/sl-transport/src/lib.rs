//! Session transport and deferred-work engine
//!
//! The heart of the Syncline engine: a realtime transport state machine
//! that owns playback position and speed, applies queued control requests
//! at safe points inside the audio callback, and hands every operation
//! that could block (disk seeks, buffer rebuilds, teardown) to a single
//! background worker, the Butler.
//!
//! ## Thread Safety Design
//!
//! The transport is split into two parts:
//! - `TransportHandle`: Thread-safe control surface for UI/automation
//! - `TransportProcessor`: Audio-thread-only state machine (not Sync)
//!
//! Control requests become [`TransportEvent`]s in a lock-free queue; the
//! processor merges them into a frame-ordered list each cycle and applies
//! them in order. Work the callback must not do itself is encoded in the
//! [`PostTransportWork`] bitmask and serviced by the [`Butler`] thread.
//! When a [`Slave`](sl_sync::Slave) sync source is selected, the follower
//! chases its clock instead of free-running.

pub mod butler;
pub mod config;
pub mod event;
pub mod follower;
pub mod notice;
pub mod state;
pub mod streams;
pub mod transport;
pub mod work;

pub use butler::Butler;
pub use config::TransportConfig;
pub use event::{EventKind, TransportEvent};
pub use follower::ChaseState;
pub use notice::TransportNotice;
pub use state::{Substate, TransportSnapshot};
pub use streams::{DiskStream, RingStream, SampleSource, StreamRegistry};
pub use transport::{
    CycleSummary, Declick, Motion, TransportHandle, TransportProcessor, create_transport,
};
pub use work::{PostTransportWork, WorkRegistry};
