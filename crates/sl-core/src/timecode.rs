//! SMPTE timecode representation and frame arithmetic
//!
//! Supports the four broadcast rates (24, 25, 29.97 drop, 30) with exact
//! conversion between timecode fields, running frame numbers, and absolute
//! sample positions. Drop-frame counting skips frame numbers 0 and 1 at the
//! start of every minute that is not a multiple of ten, which keeps the
//! 30 fps numbering aligned with the true 29.97 Hz NTSC rate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SlError, SlResult};
use crate::time::FramePos;

/// Frames in one ten-minute block of drop-frame timecode (10 * 60 * 30 - 18)
const DROP_FRAMES_PER_10MIN: i64 = 17_982;

/// Frames in a dropped minute (60 * 30 - 2)
const DROP_FRAMES_PER_MIN: i64 = 1_798;

/// Timecode frame rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimecodeRate {
    Fps24,
    #[default]
    Fps25,
    /// 29.97 fps NTSC with drop-frame counting
    Fps2997Drop,
    Fps30,
}

impl TimecodeRate {
    /// Nominal frames per timecode second
    #[inline]
    pub const fn frames_per_second(self) -> u32 {
        match self {
            TimecodeRate::Fps24 => 24,
            TimecodeRate::Fps25 => 25,
            TimecodeRate::Fps2997Drop | TimecodeRate::Fps30 => 30,
        }
    }

    /// True frame rate in Hz (29.97... for drop-frame)
    #[inline]
    pub fn rate_hz(self) -> f64 {
        match self {
            TimecodeRate::Fps2997Drop => 30_000.0 / 1_001.0,
            other => other.frames_per_second() as f64,
        }
    }

    #[inline]
    pub const fn is_drop_frame(self) -> bool {
        matches!(self, TimecodeRate::Fps2997Drop)
    }

    /// Duration of one timecode frame in samples (fractional)
    #[inline]
    pub fn frame_period(self, sample_rate: u32) -> f64 {
        sample_rate as f64 / self.rate_hz()
    }

    /// Running frame count in one 24-hour day
    #[inline]
    pub const fn frames_per_day(self) -> i64 {
        match self {
            TimecodeRate::Fps2997Drop => 24 * 6 * DROP_FRAMES_PER_10MIN,
            other => 24 * 3600 * other.frames_per_second() as i64,
        }
    }
}

/// One SMPTE timecode value (fields only; the rate travels separately)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
}

impl Timecode {
    pub const ZERO: Self = Self {
        hours: 0,
        minutes: 0,
        seconds: 0,
        frames: 0,
    };

    /// Build a validated timecode
    pub fn new(hours: u8, minutes: u8, seconds: u8, frames: u8, rate: TimecodeRate) -> SlResult<Self> {
        let tc = Self {
            hours,
            minutes,
            seconds,
            frames,
        };
        if tc.is_valid(rate) {
            Ok(tc)
        } else {
            Err(SlError::InvalidTimecode(format!("{tc} at {rate:?}")))
        }
    }

    /// Field ranges plus the drop-frame exclusion (frames 0 and 1 do not
    /// exist at the start of minutes not divisible by ten)
    pub fn is_valid(&self, rate: TimecodeRate) -> bool {
        if self.hours >= 24
            || self.minutes >= 60
            || self.seconds >= 60
            || u32::from(self.frames) >= rate.frames_per_second()
        {
            return false;
        }
        if rate.is_drop_frame() && self.seconds == 0 && self.frames < 2 && self.minutes % 10 != 0 {
            return false;
        }
        true
    }

    /// Running frame number since 00:00:00:00
    pub fn to_frame_number(&self, rate: TimecodeRate) -> i64 {
        let fps = i64::from(rate.frames_per_second());
        let total_minutes = i64::from(self.hours) * 60 + i64::from(self.minutes);
        let raw = (total_minutes * 60 + i64::from(self.seconds)) * fps + i64::from(self.frames);
        if rate.is_drop_frame() {
            raw - 2 * (total_minutes - total_minutes / 10)
        } else {
            raw
        }
    }

    /// Timecode fields for a running frame number (wraps at 24 hours)
    pub fn from_frame_number(number: i64, rate: TimecodeRate) -> Self {
        let n = number.rem_euclid(rate.frames_per_day());
        if rate.is_drop_frame() {
            let ten_min = n / DROP_FRAMES_PER_10MIN;
            let mut frame = n % DROP_FRAMES_PER_10MIN;
            let minutes_total = if frame >= 1800 {
                frame -= 1800;
                let min_in_ten = 1 + frame / DROP_FRAMES_PER_MIN;
                frame = frame % DROP_FRAMES_PER_MIN + 2;
                ten_min * 10 + min_in_ten
            } else {
                ten_min * 10
            };
            Self {
                hours: (minutes_total / 60) as u8,
                minutes: (minutes_total % 60) as u8,
                seconds: (frame / 30) as u8,
                frames: (frame % 30) as u8,
            }
        } else {
            let fps = i64::from(rate.frames_per_second());
            let total_seconds = n / fps;
            Self {
                hours: (total_seconds / 3600) as u8,
                minutes: (total_seconds / 60 % 60) as u8,
                seconds: (total_seconds % 60) as u8,
                frames: (n % fps) as u8,
            }
        }
    }

    /// First sample of this timecode frame at the given audio rate
    pub fn to_sample_position(&self, rate: TimecodeRate, sample_rate: u32) -> FramePos {
        let period = rate.frame_period(sample_rate);
        (self.to_frame_number(rate) as f64 * period).round() as FramePos
    }

    /// Timecode frame containing the given sample position
    pub fn from_sample_position(pos: FramePos, rate: TimecodeRate, sample_rate: u32) -> Self {
        let period = rate.frame_period(sample_rate);
        Self::from_frame_number((pos as f64 / period).floor() as i64, rate)
    }

    /// Next timecode frame, handling drop-frame skips and 24-hour wrap
    #[inline]
    pub fn next(&self, rate: TimecodeRate) -> Self {
        Self::from_frame_number(self.to_frame_number(rate) + 1, rate)
    }

    /// Previous timecode frame
    #[inline]
    pub fn prev(&self, rate: TimecodeRate) -> Self {
        Self::from_frame_number(self.to_frame_number(rate) - 1, rate)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_number_round_trip_all_rates() {
        let rates = [
            TimecodeRate::Fps24,
            TimecodeRate::Fps25,
            TimecodeRate::Fps2997Drop,
            TimecodeRate::Fps30,
        ];
        let probes = [0i64, 1, 23, 1799, 1800, 17_981, 17_982, 107_891, 107_892, 1_000_000];
        for rate in rates {
            for &n in &probes {
                let tc = Timecode::from_frame_number(n, rate);
                assert!(tc.is_valid(rate), "{tc} invalid for {rate:?}");
                assert_eq!(
                    tc.to_frame_number(rate),
                    n,
                    "round trip failed for frame {n} at {rate:?}"
                );
            }
        }
    }

    #[test]
    fn test_drop_frame_minute_skip() {
        let rate = TimecodeRate::Fps2997Drop;
        let before = Timecode::new(0, 0, 59, 29, rate).unwrap();
        let after = before.next(rate);
        assert_eq!(after, Timecode::new(0, 1, 0, 2, rate).unwrap());
        assert_eq!(after.prev(rate), before);
    }

    #[test]
    fn test_drop_frame_tenth_minute_not_skipped() {
        let rate = TimecodeRate::Fps2997Drop;
        let before = Timecode::new(0, 9, 59, 29, rate).unwrap();
        assert_eq!(before.next(rate), Timecode::new(0, 10, 0, 0, rate).unwrap());
    }

    #[test]
    fn test_drop_frame_invalid_fields_rejected() {
        let rate = TimecodeRate::Fps2997Drop;
        assert!(Timecode::new(0, 1, 0, 0, rate).is_err());
        assert!(Timecode::new(0, 1, 0, 1, rate).is_err());
        assert!(Timecode::new(0, 1, 0, 2, rate).is_ok());
        assert!(Timecode::new(0, 10, 0, 0, rate).is_ok());
        assert!(Timecode::new(24, 0, 0, 0, TimecodeRate::Fps25).is_err());
        assert!(Timecode::new(0, 0, 0, 25, TimecodeRate::Fps25).is_err());
    }

    #[test]
    fn test_sample_position_25fps_exact() {
        let rate = TimecodeRate::Fps25;
        let tc = Timecode::new(0, 0, 1, 0, rate).unwrap();
        assert_eq!(tc.to_sample_position(rate, 48000), 48000);
        let one_frame = Timecode::new(0, 0, 0, 1, rate).unwrap();
        assert_eq!(one_frame.to_sample_position(rate, 48000), 1920);
        assert_eq!(
            Timecode::from_sample_position(1920, rate, 48000),
            one_frame
        );
        // Any sample inside the frame maps back to the same timecode
        assert_eq!(
            Timecode::from_sample_position(1921, rate, 48000),
            one_frame
        );
    }

    #[test]
    fn test_sample_position_drop_frame() {
        let rate = TimecodeRate::Fps2997Drop;
        // 30000 NTSC frames last exactly 1001 seconds
        let tc = Timecode::from_frame_number(30_000, rate);
        assert_eq!(tc.to_sample_position(rate, 48000), 48000 * 1001);
    }

    #[test]
    fn test_day_wrap() {
        let rate = TimecodeRate::Fps25;
        assert_eq!(
            Timecode::from_frame_number(rate.frames_per_day(), rate),
            Timecode::ZERO
        );
        assert_eq!(
            Timecode::from_frame_number(-1, rate),
            Timecode::new(23, 59, 59, 24, rate).unwrap()
        );
    }

    #[test]
    fn test_rate_serde_round_trip() {
        // the session layer persists the rate as part of the sync config
        let json = serde_json::to_string(&TimecodeRate::Fps2997Drop).unwrap();
        assert_eq!(json, "\"Fps2997Drop\"");
        let back: TimecodeRate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TimecodeRate::Fps2997Drop);
        assert_eq!(
            serde_json::from_str::<TimecodeRate>("\"Fps25\"").unwrap(),
            TimecodeRate::default()
        );
    }

    #[test]
    fn test_display_format() {
        let tc = Timecode {
            hours: 1,
            minutes: 2,
            seconds: 3,
            frames: 4,
        };
        assert_eq!(tc.to_string(), "01:02:03:04");
    }
}
