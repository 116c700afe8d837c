//! Biphase-mark SMPTE linear timecode decode and encode
//!
//! LTC carries one 80-bit word per timecode frame as a biphase-mark audio
//! signal: every bit cell starts with a level transition, a one bit has an
//! extra transition at mid-cell. The decoder runs directly on `f32` samples
//! with a signal-adaptive threshold and a self-adjusting cell period, so
//! signal level and moderate varispeed do not matter. Frames are delimited
//! by the 16-bit sync word; the bit-reversed sync word marks reverse
//! playback.

use std::collections::VecDeque;

use log::warn;

use sl_core::{FramePos, Timecode, TimecodeRate};

/// Sync word occupying bits 64..79, stored LSB-first
/// (0011 1111 1111 1101 in transmission order)
const SYNC_WORD: u16 = 0xBFFC;

/// The same pattern as seen when the signal plays backwards
const SYNC_WORD_REVERSE: u16 = 0x3FFD;

/// Decoded frames kept before the oldest is dropped
const FRAME_QUEUE_LIMIT: usize = 32;

/// Peak envelope decay per sample (~0.2 s at 48 kHz)
const PEAK_DECAY: f32 = 0.9999;

/// Smallest level treated as signal rather than noise floor
const MIN_LEVEL: f32 = 1e-3;

/// One fully decoded LTC frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LtcFrame {
    /// Timecode carried by the frame
    pub timecode: Timecode,
    /// Drop-frame flag from the frame itself
    pub drop_frame: bool,
    /// Frame arrived in reverse bit order (signal playing backwards)
    pub reverse: bool,
    /// Monotonic sample position of the transition that completed the frame
    pub end_offset: FramePos,
}

/// Streaming biphase-mark decoder
#[derive(Debug)]
pub struct LtcDecoder {
    /// Adaptive bit-cell length in samples
    cell: f64,
    nominal_cell: f64,
    /// Schmitt comparator state
    high: bool,
    peak: f32,
    /// Samples since the previous transition
    since_edge: i64,
    /// A lone half-cell interval waiting for its second half
    pending_half: bool,
    /// 80-bit shift register, newest bit at position 79
    reg: u128,
    queue: VecDeque<LtcFrame>,
}

impl LtcDecoder {
    pub fn new(rate: TimecodeRate, sample_rate: u32) -> Self {
        let nominal = rate.frame_period(sample_rate) / 80.0;
        Self {
            cell: nominal,
            nominal_cell: nominal,
            high: false,
            peak: 0.0,
            since_edge: 0,
            pending_half: false,
            reg: 0,
            queue: VecDeque::with_capacity(FRAME_QUEUE_LIMIT),
        }
    }

    /// Decode one buffer. `cycle_start` is the monotonic position of
    /// `input[0]`; decoded frames carry offsets on that clock.
    pub fn feed(&mut self, input: &[f32], cycle_start: FramePos) {
        for (i, &x) in input.iter().enumerate() {
            self.peak = (self.peak * PEAK_DECAY).max(x.abs());
            let hyst = (self.peak * 0.2).max(MIN_LEVEL);
            let crossed = if self.high { x < -hyst } else { x > hyst };
            self.since_edge += 1;
            if crossed {
                self.high = !self.high;
                let dt = self.since_edge as f64;
                self.since_edge = 0;
                self.on_edge(dt, cycle_start + i as FramePos);
            }
        }
    }

    /// Next fully decoded frame, oldest first
    pub fn pop_frame(&mut self) -> Option<LtcFrame> {
        self.queue.pop_front()
    }

    /// Current adapted bit-cell estimate in samples
    pub fn cell_period(&self) -> f64 {
        self.cell
    }

    fn on_edge(&mut self, dt: f64, at: FramePos) {
        if dt > 1.5 * self.cell {
            // signal resumed after a gap; restart bit assembly
            self.reg = 0;
            self.pending_half = false;
            return;
        }
        if dt > 0.75 * self.cell {
            // full cell: zero bit. A lone buffered half cell here means we
            // came in mid-bit; the sync check absorbs the slip.
            self.pending_half = false;
            self.cell += (dt - self.cell) * 0.15;
            self.push_bit(0, at);
        } else if dt > 0.3 * self.cell {
            if self.pending_half {
                self.pending_half = false;
                self.cell += (2.0 * dt - self.cell) * 0.15;
                self.push_bit(1, at);
            } else {
                self.pending_half = true;
            }
        }
        // anything shorter is a glitch and is ignored
        self.cell = self.cell.clamp(0.5 * self.nominal_cell, 2.0 * self.nominal_cell);
    }

    fn push_bit(&mut self, bit: u32, at: FramePos) {
        self.reg = (self.reg >> 1) | ((bit as u128) << 79);
        if (self.reg >> 64) as u16 == SYNC_WORD {
            self.complete_frame(self.reg, false, at);
        } else if self.reg as u16 == SYNC_WORD_REVERSE {
            // whole word arrived bit-reversed; flip it back
            let frame = self.reg.reverse_bits() >> 48;
            self.complete_frame(frame, true, at);
        }
    }

    fn complete_frame(&mut self, bits: u128, reverse: bool, at: FramePos) {
        let frames = bcd(bits, 0, 4) + 10 * bcd(bits, 8, 2);
        let drop_frame = bcd(bits, 10, 1) == 1;
        let seconds = bcd(bits, 16, 4) + 10 * bcd(bits, 24, 3);
        let minutes = bcd(bits, 32, 4) + 10 * bcd(bits, 40, 3);
        let hours = bcd(bits, 48, 4) + 10 * bcd(bits, 56, 2);
        let timecode = Timecode {
            hours,
            minutes,
            seconds,
            frames,
        };
        self.reg = 0;
        if hours >= 24 || minutes >= 60 || seconds >= 60 || frames >= 30 {
            warn!("ltc: discarding malformed frame {timecode}");
            return;
        }
        if self.queue.len() == FRAME_QUEUE_LIMIT {
            self.queue.pop_front();
        }
        self.queue.push_back(LtcFrame {
            timecode,
            drop_frame,
            reverse,
            end_offset: at,
        });
    }
}

/// Extract a BCD field from the 80-bit frame word
#[inline]
fn bcd(bits: u128, lo: u32, len: u32) -> u8 {
    ((bits >> lo) & ((1u128 << len) - 1)) as u8
}

/// Renders timecode as biphase-mark audio (generator/master mode)
#[derive(Debug)]
pub struct LtcEncoder {
    rate: TimecodeRate,
    sample_rate: u32,
    level: f32,
    /// One-pole edge softening coefficient
    smooth: f32,
    high: bool,
    cur: f32,
    frac: f64,
}

impl LtcEncoder {
    pub fn new(rate: TimecodeRate, sample_rate: u32) -> Self {
        Self {
            rate,
            sample_rate,
            level: 0.8,
            smooth: 0.6,
            high: false,
            cur: 0.0,
            frac: 0.0,
        }
    }

    pub fn set_level(&mut self, level: f32) {
        self.level = level;
    }

    /// Render `count` consecutive frames starting at `start`.
    /// `speed` scales the signal rate (1.0 = realtime, 2.0 = double speed).
    pub fn render(&mut self, start: Timecode, count: usize, speed: f64) -> Vec<f32> {
        let cell = self.rate.frame_period(self.sample_rate) / (80.0 * speed);
        let mut out = Vec::with_capacity((cell * 80.0 * count as f64) as usize + 1);
        let mut tc = start;
        for _ in 0..count {
            let bits = frame_bits(tc, self.rate);
            for b in 0..80 {
                self.high = !self.high;
                if (bits >> b) & 1 == 1 {
                    self.emit(cell / 2.0, &mut out);
                    self.high = !self.high;
                    self.emit(cell / 2.0, &mut out);
                } else {
                    self.emit(cell, &mut out);
                }
            }
            tc = tc.next(self.rate);
        }
        out
    }

    fn emit(&mut self, len: f64, out: &mut Vec<f32>) {
        self.frac += len;
        let n = self.frac as usize;
        self.frac -= n as f64;
        let target = if self.high { self.level } else { -self.level };
        for _ in 0..n {
            self.cur += (target - self.cur) * self.smooth;
            out.push(self.cur);
        }
    }
}

fn frame_bits(tc: Timecode, rate: TimecodeRate) -> u128 {
    let mut bits = (SYNC_WORD as u128) << 64;
    put(&mut bits, 0, tc.frames % 10);
    put(&mut bits, 8, tc.frames / 10);
    if rate.is_drop_frame() {
        put(&mut bits, 10, 1);
    }
    put(&mut bits, 16, tc.seconds % 10);
    put(&mut bits, 24, tc.seconds / 10);
    put(&mut bits, 32, tc.minutes % 10);
    put(&mut bits, 40, tc.minutes / 10);
    put(&mut bits, 48, tc.hours % 10);
    put(&mut bits, 56, tc.hours / 10);
    bits
}

#[inline]
fn put(bits: &mut u128, lo: u32, v: u8) {
    *bits |= (v as u128) << lo;
}
