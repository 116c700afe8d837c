//! LTC slave: chases SMPTE linear timecode carried in an audio buffer
//!
//! Per decoded frame the slave computes the master position at the frame
//! boundary (one timecode ahead going forward, the frame start going in
//! reverse) and feeds the boundary's arrival time on the local clock into
//! a DLL with a one-frame-period nominal step. The loop's smoothed
//! boundary interval gives the master's rate; between boundaries the
//! position fly-wheels forward from the last decoded one at that rate. A
//! gap longer than four frame periods drops the lock.

use log::{debug, warn};

use sl_core::{FrameCount, FramePos, TimecodeRate};

use crate::decoder::{LtcDecoder, LtcFrame};
use crate::dll::Dll;
use crate::Slave;

/// Consecutive frames required before the slave reports a stable lock
const LOCK_SEQUENCE: u32 = 10;

/// Rates beyond this are treated as scrubbing noise, not motion
const MAX_PLAUSIBLE_SPEED: f64 = 10.0;

pub struct LtcSlave {
    decoder: LtcDecoder,
    rate: TimecodeRate,
    sample_rate: u32,
    /// Local samples per LTC frame at 1:1
    frame_period: f64,
    /// Session frame corresponding to LTC 00:00:00:00
    timecode_offset: FramePos,
    /// Monotonic time of the newest decoded boundary; 0 = none yet
    last_timestamp: FramePos,
    last_position: FramePos,
    frames_in_sequence: u32,
    /// Tracks boundary arrival times, one update per decoded frame
    dll: Option<Dll>,
    dll_direction: i32,
    rate_mismatch_logged: bool,
}

impl LtcSlave {
    pub fn new(rate: TimecodeRate, sample_rate: u32) -> Self {
        Self {
            decoder: LtcDecoder::new(rate, sample_rate),
            rate,
            sample_rate,
            frame_period: rate.frame_period(sample_rate),
            timecode_offset: 0,
            last_timestamp: 0,
            last_position: 0,
            frames_in_sequence: 0,
            dll: None,
            dll_direction: 0,
            rate_mismatch_logged: false,
        }
    }

    /// Map LTC 00:00:00:00 to a session frame other than 0
    pub fn set_timecode_offset(&mut self, offset: FramePos) {
        self.timecode_offset = offset;
    }

    /// Decode one cycle worth of timecode audio. Must be called every
    /// cycle, before `speed_and_position`, with the cycle's monotonic
    /// start frame.
    pub fn feed(&mut self, input: &[f32], cycle_start: FramePos) {
        self.decoder.feed(input, cycle_start);
        while let Some(frame) = self.decoder.pop_frame() {
            self.apply_frame(frame);
        }
    }

    fn apply_frame(&mut self, frame: LtcFrame) {
        if frame.drop_frame != self.rate.is_drop_frame() && !self.rate_mismatch_logged {
            warn!(
                "ltc: drop-frame flag mismatch (signal {}, configured {:?})",
                frame.drop_frame, self.rate
            );
            self.rate_mismatch_logged = true;
        }

        // A fully received frame refers to the interval that just ended:
        // going forward the boundary is the start of the next timecode,
        // going backward it is the start of the frame itself.
        let boundary = if frame.reverse {
            frame.timecode
        } else {
            frame.timecode.next(self.rate)
        };
        let position = boundary.to_sample_position(self.rate, self.sample_rate) + self.timecode_offset;
        let timestamp = frame.end_offset + 1;
        let dir = if frame.reverse { -1 } else { 1 };

        if self.last_timestamp == 0 {
            debug!("ltc: first frame {} at {}", frame.timecode, timestamp);
            self.frames_in_sequence = 1;
            self.seed_dll(timestamp, dir);
        } else {
            let gap = (timestamp - self.last_timestamp) as f64;
            if gap <= 0.0 {
                warn!("ltc: non-monotonic frame timestamps, ignoring frame");
                return;
            }
            let raw = (position - self.last_position) as f64 / gap;
            if gap > 4.0 * self.frame_period {
                debug!("ltc: resync after {gap:.0}-sample gap");
                self.restart_sequence();
                self.seed_dll(timestamp, dir);
            } else if raw.abs() > MAX_PLAUSIBLE_SPEED {
                warn!("ltc: implausible rate {raw:.2}, restarting sequence");
                self.restart_sequence();
                self.seed_dll(timestamp, dir);
            } else if dir != self.dll_direction {
                debug!("ltc: direction change, restarting sequence");
                self.restart_sequence();
                self.seed_dll(timestamp, dir);
            } else if let Some(dll) = self.dll.as_mut() {
                dll.update(timestamp as f64);
                self.frames_in_sequence = self.frames_in_sequence.saturating_add(1);
            } else {
                self.seed_dll(timestamp, dir);
            }
        }
        self.last_timestamp = timestamp;
        self.last_position = position;
    }

    fn seed_dll(&mut self, timestamp: FramePos, dir: i32) {
        self.dll = Some(Dll::init(timestamp as f64, self.frame_period, self.sample_rate));
        self.dll_direction = dir;
    }

    fn restart_sequence(&mut self) {
        self.frames_in_sequence = 1;
        self.dll = None;
        self.dll_direction = 0;
    }

    fn reset(&mut self) {
        self.last_timestamp = 0;
        self.last_position = 0;
        self.frames_in_sequence = 0;
        self.dll = None;
        self.dll_direction = 0;
    }
}

impl Slave for LtcSlave {
    fn feed_audio(&mut self, input: &[f32], cycle_start: FramePos) {
        self.feed(input, cycle_start);
    }

    fn speed_and_position(&mut self, now: FramePos) -> Option<(f64, FramePos)> {
        if self.last_timestamp == 0 {
            return None;
        }
        let elapsed = (now - self.last_timestamp) as f64;
        if elapsed > 4.0 * self.frame_period {
            debug!("ltc: fly-wheel timeout after {elapsed:.0} samples, lock lost");
            self.reset();
            return None;
        }
        let Some(dll) = self.dll.as_ref() else {
            return Some((0.0, self.last_position));
        };
        if self.frames_in_sequence < 2 {
            // a single boundary gives a position but no rate yet
            return Some((0.0, self.last_position));
        }

        // dll.speed() is the smoothed boundary interval over one nominal
        // frame period; the master's rate is its reciprocal
        let pace = dll.speed().max(1.0 / MAX_PLAUSIBLE_SPEED);
        let mut speed = f64::from(self.dll_direction) / pace;

        // 0.1% deadzone locks the common case to exactly 1:1
        if (speed - 1.0).abs() <= 0.001 {
            speed = 1.0;
        } else if (speed + 1.0).abs() <= 0.001 {
            speed = -1.0;
        }
        let pos = self.last_position + (elapsed * speed).round() as FramePos;
        Some((speed, pos))
    }

    fn locked(&self) -> bool {
        self.last_timestamp != 0 && self.frames_in_sequence > LOCK_SEQUENCE
    }

    fn resolution(&self) -> FrameCount {
        self.frame_period.round() as FrameCount
    }

    fn requires_seekahead(&self) -> bool {
        true
    }

    fn seekahead_distance(&self) -> FrameCount {
        // one second of chase-up headroom
        FrameCount::from(self.sample_rate)
    }

    fn name(&self) -> &str {
        "LTC"
    }
}
