//! Deferred-work behavior through the whole engine.
//!
//! The in-crate unit tests cover single butler passes against mock
//! streams; these drive the processor as well, so butler outcomes have to
//! round-trip: failures come back as events, work bits coalesce across a
//! cycle, and a storm of concurrent requests must drain to quiescence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use sl_core::{FrameDelta, FramePos, SlError, SlResult};
use sl_transport::{
    DiskStream, TransportConfig, TransportHandle, TransportNotice, TransportProcessor,
    create_transport,
};

const CYCLE: usize = 256;

fn engine() -> (TransportHandle, TransportProcessor, Receiver<TransportNotice>) {
    create_transport(TransportConfig::default(), 48000).unwrap()
}

fn settle(handle: &TransportHandle, processor: &mut TransportProcessor) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.work_pending() {
        assert!(Instant::now() < deadline, "butler never finished");
        processor.process(CYCLE, None);
        thread::sleep(Duration::from_millis(1));
    }
    processor.process(CYCLE, None);
}

fn drain(rx: &Receiver<TransportNotice>) -> Vec<TransportNotice> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[derive(Default)]
struct FailingStream {
    attempts: AtomicU32,
    recovered: AtomicBool,
}

impl DiskStream for FailingStream {
    fn name(&self) -> &str {
        "failing"
    }
    fn non_realtime_locate(&self, _frame: FramePos) -> SlResult<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SlError::DiskStream {
            name: "failing".into(),
            what: "device gone".into(),
        })
    }
    fn non_realtime_set_speed(&self, _speed: f64) -> SlResult<()> {
        Ok(())
    }
    fn can_internal_playback_seek(&self, _delta: FrameDelta) -> bool {
        false
    }
    fn internal_playback_seek(&self, _delta: FrameDelta) {}
    fn overwrite_existing_buffers(&self) -> SlResult<()> {
        Ok(())
    }
    fn recover(&self) {
        self.recovered.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CountingStream {
    overwrites: AtomicU32,
}

impl DiskStream for CountingStream {
    fn name(&self) -> &str {
        "counting"
    }
    fn non_realtime_locate(&self, _frame: FramePos) -> SlResult<()> {
        Ok(())
    }
    fn non_realtime_set_speed(&self, _speed: f64) -> SlResult<()> {
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
    fn recover(&self) {}
}

#[test]
fn test_disk_failure_aborts_the_transport() {
    let (handle, mut processor, rx) = engine();
    let stream = Arc::new(FailingStream::default());
    handle.add_disk_stream(stream.clone()).unwrap();

    handle.request_locate(5000, true);
    processor.process(CYCLE, None);

    // The butler's locate fails: streams recover, an error notice fires,
    // and an abort-stop comes back through the event queue. The transport
    // may roll for the one cycle between completion and the abort landing.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        assert!(Instant::now() < deadline, "failure never settled");
        processor.process(CYCLE, None);
        if !handle.work_pending() && !handle.rolling() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert!(stream.recovered.load(Ordering::Relaxed), "recover not called");
    assert!(stream.attempts.load(Ordering::Relaxed) >= 1);
    let notices = drain(&rx);
    assert!(
        notices
            .iter()
            .any(|n| matches!(n, TransportNotice::Error { .. })),
        "no error notice in {notices:?}"
    );
}

#[test]
fn test_same_cycle_overwrites_coalesce_into_one_pass() {
    let (handle, mut processor, _rx) = engine();
    let stream = Arc::new(CountingStream::default());
    handle.add_disk_stream(stream.clone()).unwrap();

    for _ in 0..5 {
        handle.request_overwrite_buffers();
    }
    processor.process(CYCLE, None);
    settle(&handle, &mut processor);

    assert_eq!(
        stream.overwrites.load(Ordering::Relaxed),
        1,
        "five requests applied in one cycle should make one butler pass"
    );
}

#[test]
fn test_request_storm_reaches_quiescence() {
    let (handle, mut processor, _rx) = engine();
    let finished = AtomicU32::new(0);

    thread::scope(|s| {
        for t in 0..3u64 {
            let handle = &handle;
            let finished = &finished;
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(0xbad5_eed0 + t);
                let speeds = [0.5, 1.0, 2.0, -1.0];
                for _ in 0..400 {
                    match rng.random_range(0..6u32) {
                        0 | 1 => handle
                            .request_transport_speed(speeds[rng.random_range(0..speeds.len())]),
                        2 | 3 => {
                            handle.request_locate(rng.random_range(0..200_000), rng.random_bool(0.5))
                        }
                        4 => handle.request_stop(rng.random_bool(0.2), false),
                        _ => handle.request_overwrite_buffers(),
                    }
                    if rng.random_bool(0.1) {
                        thread::yield_now();
                    }
                }
                finished.fetch_add(1, Ordering::Release);
            });
        }

        // Play the audio callback while the storm runs
        while finished.load(Ordering::Acquire) < 3 {
            processor.process(CYCLE, None);
            thread::sleep(Duration::from_millis(1));
        }
    });

    // Drain the backlog: four consecutive cycles without butler work means
    // every queued event, fade and deferred action has played out
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut clean = 0;
    while clean < 4 {
        assert!(Instant::now() < deadline, "storm never quiesced");
        processor.process(CYCLE, None);
        if handle.work_pending() {
            clean = 0;
            thread::sleep(Duration::from_millis(1));
        } else {
            clean += 1;
        }
    }

    let speed = handle.speed();
    assert!(
        speed.abs() <= TransportConfig::default().max_speed,
        "speed {speed} out of bounds"
    );
    assert!(
        handle.frame() >= 0,
        "transport frame went negative: {}",
        handle.frame()
    );
}
