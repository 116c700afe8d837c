//! Frame-domain time types
//!
//! The playhead is a signed 64-bit sample count. Signed so the transport can
//! sit before session start during pre-roll and so position deltas subtract
//! without underflow.

use serde::{Deserialize, Serialize};

/// Absolute position on the session timeline, in samples
pub type FramePos = i64;

/// A length in samples
pub type FrameCount = i64;

/// A signed offset between two positions, in samples
pub type FrameDelta = i64;

/// Convert seconds to a frame count at the given rate
#[inline]
pub fn frames_from_seconds(seconds: f64, sample_rate: u32) -> FrameCount {
    (seconds * sample_rate as f64).round() as FrameCount
}

/// Convert a frame count to seconds at the given rate
#[inline]
pub fn seconds_from_frames(frames: FrameCount, sample_rate: u32) -> f64 {
    frames as f64 / sample_rate as f64
}

/// Half-open range `[start, end)` on the session timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: FramePos,
    pub end: FramePos,
}

impl FrameRange {
    #[inline]
    pub const fn new(start: FramePos, end: FramePos) -> Self {
        Self { start, end }
    }

    #[inline]
    pub const fn length(&self) -> FrameCount {
        self.end - self.start
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub const fn contains(&self, frame: FramePos) -> bool {
        frame >= self.start && frame < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_round_trip() {
        let frames = frames_from_seconds(1.5, 48000);
        assert_eq!(frames, 72000);
        assert!((seconds_from_frames(frames, 48000) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_range_contains() {
        let r = FrameRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(199));
        assert!(!r.contains(200));
        assert!(!r.is_empty());
        assert!(FrameRange::new(50, 50).is_empty());
    }
}
