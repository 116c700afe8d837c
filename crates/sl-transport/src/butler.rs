//! The Butler
//!
//! A single background worker for everything the audio callback must not
//! do itself: disk-stream seeks, direction flips, buffer overwrites,
//! post-capture bookkeeping, destruction of displaced sync sources. The
//! callback requests work by OR-ing `PostTransportWork` bits into the
//! registry and summoning; the Butler drains the bits and restarts its
//! pass whenever a newer summon arrives mid-work, so it never finishes a
//! pass against stale state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error, info};

use sl_core::{SlError, SlResult};
use sl_sync::Slave;

use crate::event::{EventKind, EventQueue};
use crate::notice::{NoticeSender, TransportNotice};
use crate::streams::StreamRegistry;
use crate::work::{PostTransportWork, WorkRegistry};

/// Capacity of the wake/handoff channel
const BUTLER_QUEUE_CAPACITY: usize = 64;

/// Message to the Butler thread
pub(crate) enum ButlerMsg {
    /// Work bits are waiting in the registry
    Wake,
    /// A displaced sync source to destroy off the audio thread
    Dispose(Box<dyn Slave>),
}

/// Owner handle for the Butler thread. Dropping it shuts the thread down.
pub struct Butler {
    tx: Sender<ButlerMsg>,
    registry: Arc<WorkRegistry>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Butler {
    pub(crate) fn spawn(
        registry: Arc<WorkRegistry>,
        streams: StreamRegistry,
        events: Arc<EventQueue>,
        notices: NoticeSender,
    ) -> SlResult<Self> {
        let (tx, rx) = bounded(BUTLER_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("sl-butler".into())
                .spawn(move || {
                    butler_loop(rx, registry, streams, events, notices, shutdown);
                })
                .map_err(|e| SlError::Thread(format!("failed to spawn butler: {e}")))?
        };

        Ok(Self {
            tx,
            registry,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Wake the Butler. Safe to call redundantly from any thread; never
    /// blocks the caller.
    pub(crate) fn summon(&self) {
        self.registry.bump_requests();
        let _ = self.tx.try_send(ButlerMsg::Wake);
    }

    /// Extra producer for the realtime side (summons and slave disposal)
    pub(crate) fn sender(&self) -> Sender<ButlerMsg> {
        self.tx.clone()
    }
}

impl Drop for Butler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.tx.send(ButlerMsg::Wake);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn butler_loop(
    rx: Receiver<ButlerMsg>,
    registry: Arc<WorkRegistry>,
    streams: StreamRegistry,
    events: Arc<EventQueue>,
    notices: NoticeSender,
    shutdown: Arc<AtomicBool>,
) {
    info!("butler thread running");
    while let Ok(msg) = rx.recv() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match msg {
            ButlerMsg::Wake => transport_work(&registry, &streams, &events, &notices),
            ButlerMsg::Dispose(slave) => {
                debug!("disposing displaced sync source '{}'", slave.name());
                drop(slave);
            }
        }
    }
    info!("butler thread exiting");
}

/// One or more work passes, restarted whenever a newer summon lands
/// mid-pass. Returns with the registry drained of everything that was
/// requested up to the moment of return.
fn transport_work(
    registry: &WorkRegistry,
    streams: &StreamRegistry,
    events: &EventQueue,
    notices: &NoticeSender,
) {
    'pass: loop {
        let entry = registry.requests();
        let bits = registry.load();
        if bits.is_empty() {
            registry.mark_serviced(entry);
            return;
        }
        debug!("butler pass: bits {:#07x}, entry {entry}", bits.bits());

        if bits.intersects(PostTransportWork::CURVE_REALLOC) {
            debug!("butler: automation curves reallocated");
        }
        if bits.intersects(PostTransportWork::INPUT_CHANGE) {
            debug!("butler: input configuration changed");
        }
        if bits.intersects(PostTransportWork::AUDITION | PostTransportWork::SCRUB) {
            debug!("butler: audition/scrub setup");
        }

        // Direction or speed change: re-prime stream buffers
        if bits.intersects(PostTransportWork::REVERSE | PostTransportWork::SPEED) {
            let speed = registry.target_speed();
            if let Err(e) = streams.set_speed_all(speed) {
                return fail_pass(registry, streams, events, notices, bits, &e);
            }
            if registry.requests() != entry {
                debug!("butler: newer summon during speed work, restarting");
                continue 'pass;
            }
        }

        // Locate and stop both park the streams at the registry's target
        if bits.intersects(
            PostTransportWork::LOCATE | PostTransportWork::POSITION | PostTransportWork::STOP,
        ) {
            let target = registry.locate_target();
            if let Err(e) = streams.locate_all(target) {
                return fail_pass(registry, streams, events, notices, bits, &e);
            }
            if registry.requests() != entry {
                debug!("butler: newer summon during locate work, restarting");
                continue 'pass;
            }
        }

        if bits.intersects(PostTransportWork::OVERWRITE) {
            if let Err(e) = streams.overwrite_all() {
                return fail_pass(registry, streams, events, notices, bits, &e);
            }
            if registry.requests() != entry {
                debug!("butler: newer summon during overwrite, restarting");
                continue 'pass;
            }
        }

        // A finished capture pass changes the session length
        if bits.intersects(PostTransportWork::DID_RECORD | PostTransportWork::DURATION) {
            notices.send(TransportNotice::DurationChanged);
        }

        // ROLL, ABORT, DISABLE_RECORD and CLEAR_SUBSTATE carry no Butler
        // action; the realtime side consumes them when it finalizes.

        // A summon in the window between the last sub-step and completion
        // may have re-ORed a bit in `bits` with a fresh target; clearing it
        // here would mark that work serviced without doing it.
        if registry.requests() != entry {
            debug!("butler: newer summon before completion, restarting");
            continue 'pass;
        }
        registry.complete(bits);
        debug!("butler pass complete: {:#07x}", bits.bits());
    }
}

/// Disk-stream failure: recover every stream, report, force a stop. The
/// pass is abandoned, not retried.
fn fail_pass(
    registry: &WorkRegistry,
    streams: &StreamRegistry,
    events: &EventQueue,
    notices: &NoticeSender,
    bits: PostTransportWork,
    e: &SlError,
) {
    error!("butler: deferred work failed: {e}");
    streams.recover_all();
    notices.send(TransportNotice::Error {
        what: e.to_string(),
    });
    events.push(
        None,
        EventKind::Stop {
            abort: true,
            clear_state: false,
        },
    );
    registry.complete(bits);
    registry.mark_serviced(registry.requests());
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sl_core::{FrameDelta, FramePos};
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct MockStream {
        located: Mutex<Vec<FramePos>>,
        speeds: Mutex<Vec<f64>>,
        overwrites: AtomicU32,
        recovered: AtomicBool,
        fail_locate: bool,
        /// When set, `non_realtime_locate` blocks until the test releases it
        gate: Option<Receiver<()>>,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                located: Mutex::new(Vec::new()),
                speeds: Mutex::new(Vec::new()),
                overwrites: AtomicU32::new(0),
                recovered: AtomicBool::new(false),
                fail_locate: false,
                gate: None,
            }
        }
    }

    impl crate::streams::DiskStream for MockStream {
        fn name(&self) -> &str {
            "mock"
        }
        fn non_realtime_locate(&self, frame: FramePos) -> SlResult<()> {
            if self.fail_locate {
                return Err(SlError::DiskStream {
                    name: "mock".into(),
                    what: "device gone".into(),
                });
            }
            self.located.lock().push(frame);
            if let Some(gate) = &self.gate {
                let _ = gate.recv_timeout(Duration::from_secs(1));
            }
            Ok(())
        }
        fn non_realtime_set_speed(&self, speed: f64) -> SlResult<()> {
            self.speeds.lock().push(speed);
            Ok(())
        }
        fn can_internal_playback_seek(&self, _delta: FrameDelta) -> bool {
            true
        }
        fn internal_playback_seek(&self, _delta: FrameDelta) {}
        fn overwrite_existing_buffers(&self) -> SlResult<()> {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn recover(&self) {
            self.recovered.store(true, Ordering::Relaxed);
        }
    }

    struct Rig {
        butler: Butler,
        registry: Arc<WorkRegistry>,
        streams: StreamRegistry,
        notice_rx: Receiver<TransportNotice>,
        event_rx: rtrb::Consumer<crate::event::TransportEvent>,
    }

    fn rig(stream: MockStream) -> (Rig, Arc<MockStream>) {
        let registry = Arc::new(WorkRegistry::new());
        let streams = StreamRegistry::new();
        let stream = Arc::new(stream);
        streams.add(Arc::clone(&stream) as Arc<dyn crate::streams::DiskStream>);

        let (event_tx, event_rx) = rtrb::RingBuffer::new(16);
        let events = Arc::new(EventQueue::new(event_tx));
        let (notice_tx, notice_rx) = bounded(16);
        let notices = NoticeSender::new(notice_tx, Arc::new(std::sync::atomic::AtomicU64::new(0)));

        let butler = Butler::spawn(
            Arc::clone(&registry),
            streams.clone(),
            Arc::clone(&events),
            notices,
        )
        .unwrap();

        (
            Rig {
                butler,
                registry,
                streams,
                notice_rx,
                event_rx,
            },
            stream,
        )
    }

    #[test]
    fn test_locate_work_seeks_streams() {
        let (rig, stream) = rig(MockStream::new());

        rig.registry.set_locate_target(4242);
        rig.registry.add(PostTransportWork::LOCATE);
        rig.butler.summon();

        wait_until("locate pass", || !rig.registry.pending());
        assert_eq!(*stream.located.lock(), vec![4242]);
        assert_eq!(rig.registry.serviced(), rig.registry.requests());
    }

    #[test]
    fn test_speed_work_uses_registry_target() {
        let (rig, stream) = rig(MockStream::new());

        rig.registry.set_target_speed(-2.0);
        rig.registry.add(PostTransportWork::REVERSE | PostTransportWork::SPEED);
        rig.butler.summon();

        wait_until("speed pass", || !rig.registry.pending());
        assert_eq!(*stream.speeds.lock(), vec![-2.0]);
    }

    #[test]
    fn test_newer_summon_restarts_pass() {
        let (gate_tx, gate_rx) = bounded(4);
        let mut stream = MockStream::new();
        stream.gate = Some(gate_rx);
        let (rig, stream) = rig(stream);

        rig.registry.set_locate_target(100);
        rig.registry.add(PostTransportWork::LOCATE);
        rig.butler.summon();

        // Butler is now inside the first locate, blocked on the gate
        wait_until("first locate", || stream.located.lock().len() == 1);

        // Newer request lands mid-pass
        rig.registry.set_locate_target(200);
        rig.registry.add(PostTransportWork::LOCATE);
        rig.butler.summon();
        gate_tx.send(()).unwrap();

        // The pass restarts and re-seeks with the fresh target
        wait_until("second locate", || stream.located.lock().len() == 2);
        gate_tx.send(()).unwrap();

        wait_until("drained", || !rig.registry.pending());
        assert_eq!(*stream.located.lock(), vec![100, 200]);
        assert_eq!(rig.registry.serviced(), rig.registry.requests());
    }

    #[test]
    fn test_final_target_always_serviced_under_summon_storm() {
        // Summons landing between the last sub-step and pass completion
        // must not have their bits cleared by the stale pass. With the
        // pre-completion staleness guard, the pass that finally completes
        // is guaranteed to have started after the last summon, so the
        // last locate performed always carries the last target set.
        let (rig, stream) = rig(MockStream::new());

        for target in 1..=50 {
            rig.registry.set_locate_target(target * 100);
            rig.registry.add(PostTransportWork::LOCATE);
            rig.butler.summon();
            if target % 8 == 0 {
                thread::sleep(Duration::from_micros(200));
            }
        }

        wait_until("storm drained", || !rig.registry.pending());
        assert_eq!(rig.registry.serviced(), rig.registry.requests());
        assert_eq!(stream.located.lock().last().copied(), Some(5000));
    }

    #[test]
    fn test_disk_failure_recovers_and_requests_stop() {
        let mut stream = MockStream::new();
        stream.fail_locate = true;
        let (mut rig, stream) = rig(stream);

        rig.registry.set_locate_target(9000);
        rig.registry.add(PostTransportWork::LOCATE);
        rig.butler.summon();

        wait_until("failure pass", || !rig.registry.pending());
        assert!(stream.recovered.load(Ordering::Relaxed));

        let notice = rig
            .notice_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("error notice");
        assert!(matches!(notice, TransportNotice::Error { .. }));

        let event = rig.event_rx.pop().expect("stop event queued");
        assert!(matches!(
            event.kind,
            EventKind::Stop { abort: true, .. }
        ));
    }

    #[test]
    fn test_capture_end_fires_duration_notice() {
        let (rig, _stream) = rig(MockStream::new());

        rig.registry
            .add(PostTransportWork::DID_RECORD | PostTransportWork::DURATION);
        rig.butler.summon();

        wait_until("duration pass", || !rig.registry.pending());
        assert_eq!(
            rig.notice_rx.recv_timeout(Duration::from_secs(1)),
            Ok(TransportNotice::DurationChanged)
        );
    }

    #[test]
    fn test_dispose_destroys_slave_off_thread() {
        struct FlaggedSlave(Arc<AtomicBool>);
        impl Slave for FlaggedSlave {
            fn speed_and_position(&mut self, _now: FramePos) -> Option<(f64, FramePos)> {
                None
            }
            fn locked(&self) -> bool {
                false
            }
            fn resolution(&self) -> sl_core::FrameCount {
                1
            }
            fn name(&self) -> &str {
                "flagged"
            }
        }
        impl Drop for FlaggedSlave {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Relaxed);
            }
        }

        let (rig, _stream) = rig(MockStream::new());
        let dropped = Arc::new(AtomicBool::new(false));
        rig.butler
            .sender()
            .try_send(ButlerMsg::Dispose(Box::new(FlaggedSlave(Arc::clone(
                &dropped,
            )))))
            .ok()
            .unwrap();

        wait_until("slave disposed", || dropped.load(Ordering::Relaxed));
        let _ = &rig.streams;
    }
}
