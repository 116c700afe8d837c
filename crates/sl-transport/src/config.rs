//! Transport Configuration
//!
//! Tunable parameters for the transport state machine and the slave
//! follower. The session layer persists this as JSON alongside the rest
//! of the project state; everything validates on the way in so a stale
//! or hand-edited file cannot put the engine into a nonsense state.

use serde::{Deserialize, Serialize};

use sl_core::{FrameCount, FrameRange, SlError, SlResult};

/// Transport and chase tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum transport speed magnitude (1.0 = realtime)
    pub max_speed: f64,
    /// Moving-average window for the slave delta, in cycles
    pub delta_window: usize,
    /// Proportional gain applied to the smoothed slave delta
    pub chase_gain: f64,
    /// Stop the transport when the sync source is lost (false = free-run)
    pub stop_on_sync_loss: bool,
    /// Seek-ahead distance when a slave requires one but reports 0
    pub seek_ahead_fallback: FrameCount,
    /// Loop range used by `request_play_loop`
    pub loop_range: Option<FrameRange>,
    /// Outbound notice channel capacity
    pub notice_capacity: usize,
    /// Pending control-event queue capacity
    pub event_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_speed: 8.0,
            delta_window: 25,
            chase_gain: 1.5,
            stop_on_sync_loss: false,
            seek_ahead_fallback: 48000,
            loop_range: None,
            notice_capacity: 256,
            event_queue_capacity: 128,
        }
    }
}

impl TransportConfig {
    /// Check every field holds a usable value
    pub fn validate(&self) -> SlResult<()> {
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(SlError::InvalidParam("max_speed must be positive".into()));
        }
        if self.delta_window == 0 {
            return Err(SlError::InvalidParam(
                "delta_window must be at least 1".into(),
            ));
        }
        if !self.chase_gain.is_finite() || self.chase_gain < 0.0 {
            return Err(SlError::InvalidParam(
                "chase_gain must be non-negative".into(),
            ));
        }
        if self.seek_ahead_fallback < 0 {
            return Err(SlError::InvalidParam(
                "seek_ahead_fallback must be non-negative".into(),
            ));
        }
        if let Some(range) = &self.loop_range {
            if range.is_empty() {
                return Err(SlError::InvalidParam("loop_range must not be empty".into()));
            }
        }
        if self.notice_capacity == 0 || self.event_queue_capacity == 0 {
            return Err(SlError::InvalidParam(
                "channel capacities must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Serialize for the session-state collaborator
    pub fn to_json(&self) -> SlResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SlError::Serialization(e.to_string()))
    }

    /// Parse and validate a persisted configuration
    pub fn from_json(json: &str) -> SlResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SlError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
