//! LTC Chase Demo
//!
//! Renders ten seconds of linear timecode starting at 01:00:00:00, feeds
//! it to a transport cycle by cycle the way an audio callback would, and
//! prints the chase as it locks, parks ahead of the master, and rolls.
//!
//! Run with: cargo run --example chase_ltc
//! Set RUST_LOG=debug to see the follower's internal decisions.

use sl_core::{FramePos, Timecode, TimecodeRate};
use sl_sync::{LtcEncoder, LtcSlave};
use sl_transport::{ChaseState, TransportConfig, create_transport};

const SAMPLE_RATE: u32 = 48000;
const CYCLE: usize = 480;
const LTC_FRAMES: usize = 250;

fn main() {
    env_logger::init();

    let rate = TimecodeRate::Fps25;
    let start = Timecode::new(1, 0, 0, 0, rate).expect("valid timecode");
    let audio = LtcEncoder::new(rate, SAMPLE_RATE).render(start, LTC_FRAMES, 1.0);
    println!(
        "rendered {} samples of LTC starting at {start}",
        audio.len()
    );

    let (handle, mut processor, notices) =
        create_transport(TransportConfig::default(), SAMPLE_RATE).expect("transport");
    handle.request_sync_source(Box::new(LtcSlave::new(rate, SAMPLE_RATE)));

    let mut last_state = ChaseState::Stopped;
    for (cycle, chunk) in audio.chunks(CYCLE).enumerate() {
        processor.process(chunk.len(), Some(chunk));
        if handle.work_pending() {
            // Give the butler a moment to service the seek
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let state = processor.chase_state();
        if state != last_state {
            println!(
                "cycle {cycle:4}: chase {last_state:?} -> {state:?} at frame {}",
                processor.frame()
            );
            last_state = state;
        }
        while let Ok(notice) = notices.try_recv() {
            println!("cycle {cycle:4}: {notice:?}");
        }
    }

    let expected = start.to_sample_position(rate, SAMPLE_RATE) + audio.len() as FramePos;
    println!(
        "done: rolling={} frame={} expected~{expected} drift={}",
        handle.rolling(),
        processor.frame(),
        processor.frame() - expected
    );
}
