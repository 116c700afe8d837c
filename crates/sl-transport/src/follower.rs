//! Generic Slave Follower
//!
//! Once per cycle the follower compares the engine position against the
//! active slave's estimate and decides the transport's motion: run at a
//! corrected speed, realign with a micro-seek or a full locate, fall back
//! to silent motion when drift exceeds the source's resolution, or stop.

use log::{debug, info};

use sl_core::{FrameDelta, FramePos};
use sl_sync::Slave;

/// Lifecycle of a chase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChaseState {
    #[default]
    Stopped,
    /// Parked ahead of the master, waiting for it to arrive
    Waiting,
    Running,
}

/// What the transport should do this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ChaseDecision {
    /// No usable motion yet (not locked, starting up, still waiting);
    /// keep the source and hold still
    Hold,
    /// A running chase lost its estimate; caller decides stop vs free-run
    LockLost,
    /// Source reported failure; drop it
    DropSource,
    /// Master stopped; relocate if it parked somewhere else
    Stop { relocate: Option<FramePos> },
    /// Coarse relocate, either to the master or to a seek-ahead target
    Locate { target: FramePos },
    /// Sample-accurate realign inside buffered data, then run
    MicroSeek { delta: FrameDelta, speed: f64 },
    /// Drift beyond resolution: advance silently at the master's speed
    Silent { speed: f64 },
    /// Normal chase at the given speed
    Run { speed: f64 },
}

/// Circular buffer of recent master-vs-engine deltas.
///
/// The mean is only meaningful once the buffer has filled; until then the
/// instantaneous delta stands in. Once filled it stays primed for the life
/// of the follower, including across stalls.
struct DeltaWindow {
    deltas: Vec<f64>,
    idx: usize,
    primed: bool,
}

impl DeltaWindow {
    fn new(len: usize) -> Self {
        Self {
            deltas: vec![0.0; len.max(1)],
            idx: 0,
            primed: false,
        }
    }

    fn push(&mut self, delta: f64) {
        self.deltas[self.idx] = delta;
        self.idx += 1;
        if self.idx == self.deltas.len() {
            self.idx = 0;
            self.primed = true;
        }
    }

    fn smoothed(&self, instantaneous: f64) -> f64 {
        if self.primed {
            self.deltas.iter().sum::<f64>() / self.deltas.len() as f64
        } else {
            instantaneous
        }
    }
}

pub(crate) struct Follower {
    state: ChaseState,
    window: DeltaWindow,
    gain: f64,
    sample_rate: f64,
    seek_ahead_fallback: i64,
    wait_target: FramePos,
    wait_dir: i64,
    silent: bool,
}

impl Follower {
    pub(crate) fn new(
        delta_window: usize,
        chase_gain: f64,
        seek_ahead_fallback: i64,
        sample_rate: u32,
    ) -> Self {
        Self {
            state: ChaseState::Stopped,
            window: DeltaWindow::new(delta_window),
            gain: chase_gain,
            sample_rate: f64::from(sample_rate),
            seek_ahead_fallback,
            wait_target: 0,
            wait_dir: 1,
            silent: false,
        }
    }

    pub(crate) fn state(&self) -> ChaseState {
        self.state
    }

    pub(crate) fn is_silent(&self) -> bool {
        self.silent
    }

    pub(crate) fn evaluate(
        &mut self,
        slave: &mut dyn Slave,
        now: FramePos,
        engine_frame: FramePos,
    ) -> ChaseDecision {
        if !slave.ok() {
            self.state = ChaseState::Stopped;
            self.silent = false;
            return ChaseDecision::DropSource;
        }

        let Some((slave_speed, slave_pos)) = slave.speed_and_position(now) else {
            if self.state == ChaseState::Running {
                self.state = ChaseState::Stopped;
                self.silent = false;
                return ChaseDecision::LockLost;
            }
            return ChaseDecision::Hold;
        };

        if !slave.locked() || slave.starting() {
            return ChaseDecision::Hold;
        }

        if slave_speed == 0.0 {
            if self.state != ChaseState::Stopped {
                debug!("chase: master stopped at {slave_pos}");
            }
            self.state = ChaseState::Stopped;
            self.silent = false;
            let relocate = if slave_pos != engine_frame {
                Some(slave_pos)
            } else {
                None
            };
            return ChaseDecision::Stop { relocate };
        }

        let dir: i64 = if slave_speed < 0.0 { -1 } else { 1 };

        match self.state {
            ChaseState::Stopped => {
                if slave.requires_seekahead() {
                    let mut dist = slave.seekahead_distance();
                    if dist <= 0 {
                        dist = self.seek_ahead_fallback;
                    }
                    self.wait_target = slave_pos + dir * dist;
                    self.wait_dir = dir;
                    self.state = ChaseState::Waiting;
                    info!("chase: parking at {} ahead of master", self.wait_target);
                    return ChaseDecision::Locate {
                        target: self.wait_target,
                    };
                }
                self.state = ChaseState::Running;
                info!("chase: running after {}", slave.name());
                if slave_pos != engine_frame {
                    return ChaseDecision::Locate { target: slave_pos };
                }
            }
            ChaseState::Waiting => {
                let arrived = if self.wait_dir >= 0 {
                    slave_pos >= self.wait_target
                } else {
                    slave_pos <= self.wait_target
                };
                if !arrived {
                    return ChaseDecision::Hold;
                }
                self.state = ChaseState::Running;
                let residual = slave_pos - engine_frame;
                if residual != 0 {
                    debug!("chase: master arrived, realigning by {residual}");
                    return ChaseDecision::MicroSeek {
                        delta: residual,
                        speed: slave_speed,
                    };
                }
            }
            ChaseState::Running => {}
        }

        let delta = (slave_pos - engine_frame) as f64;

        if slave.is_always_synced() {
            if delta.abs() as i64 > slave.resolution() {
                return ChaseDecision::Locate { target: slave_pos };
            }
            return ChaseDecision::Run { speed: slave_speed };
        }

        self.window.push(delta);
        let smoothed = self.window.smoothed(delta);

        if self.silent {
            if smoothed.abs() as i64 <= slave.resolution() {
                self.silent = false;
                info!("chase: re-locked within {} samples", slave.resolution());
            } else {
                return ChaseDecision::Silent { speed: slave_speed };
            }
        } else if smoothed.abs() as i64 > slave.resolution() {
            self.silent = true;
            info!(
                "chase: drift {:.1} beyond resolution {}, silent motion",
                smoothed,
                slave.resolution()
            );
            return ChaseDecision::Silent { speed: slave_speed };
        }

        if slave.owns_transport_speed() {
            return ChaseDecision::Run { speed: slave_speed };
        }
        ChaseDecision::Run {
            speed: slave_speed + self.gain * (smoothed / self.sample_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_core::FrameCount;

    struct FakeSlave {
        speed: f64,
        pos: FramePos,
        has_estimate: bool,
        locked: bool,
        starting: bool,
        ok: bool,
        resolution: FrameCount,
        seekahead: Option<FrameCount>,
        authority: bool,
        always: bool,
    }

    impl FakeSlave {
        fn new() -> Self {
            Self {
                speed: 1.0,
                pos: 0,
                has_estimate: true,
                locked: true,
                starting: false,
                ok: true,
                resolution: 25,
                seekahead: None,
                authority: false,
                always: false,
            }
        }
    }

    impl Slave for FakeSlave {
        fn speed_and_position(&mut self, _now: FramePos) -> Option<(f64, FramePos)> {
            if self.has_estimate {
                Some((self.speed, self.pos))
            } else {
                None
            }
        }
        fn locked(&self) -> bool {
            self.locked
        }
        fn starting(&self) -> bool {
            self.starting
        }
        fn ok(&self) -> bool {
            self.ok
        }
        fn resolution(&self) -> FrameCount {
            self.resolution
        }
        fn requires_seekahead(&self) -> bool {
            self.seekahead.is_some()
        }
        fn seekahead_distance(&self) -> FrameCount {
            self.seekahead.unwrap_or(0)
        }
        fn owns_transport_speed(&self) -> bool {
            self.authority
        }
        fn is_always_synced(&self) -> bool {
            self.always
        }
        fn name(&self) -> &str {
            "fake"
        }
    }

    fn follower() -> Follower {
        Follower::new(4, 1.5, 1000, 48000)
    }

    #[test]
    fn test_stopped_master_relocates_engine() {
        let mut f = follower();
        let mut s = FakeSlave::new();
        s.speed = 0.0;
        s.pos = 777;

        assert_eq!(
            f.evaluate(&mut s, 0, 0),
            ChaseDecision::Stop {
                relocate: Some(777)
            }
        );
        assert_eq!(
            f.evaluate(&mut s, 512, 777),
            ChaseDecision::Stop { relocate: None }
        );
    }

    #[test]
    fn test_start_locates_to_master_then_runs() {
        let mut f = follower();
        let mut s = FakeSlave::new();
        s.pos = 5000;

        assert_eq!(
            f.evaluate(&mut s, 0, 0),
            ChaseDecision::Locate { target: 5000 }
        );
        assert_eq!(f.state(), ChaseState::Running);

        s.pos = 5512;
        assert_eq!(
            f.evaluate(&mut s, 512, 5512),
            ChaseDecision::Run { speed: 1.0 }
        );
    }

    #[test]
    fn test_seekahead_waits_then_micro_seeks() {
        let mut f = follower();
        let mut s = FakeSlave::new();
        s.seekahead = Some(2000);
        s.pos = 100;

        assert_eq!(
            f.evaluate(&mut s, 0, 0),
            ChaseDecision::Locate { target: 2100 }
        );
        assert_eq!(f.state(), ChaseState::Waiting);

        s.pos = 600;
        assert_eq!(f.evaluate(&mut s, 512, 2100), ChaseDecision::Hold);

        s.pos = 2103;
        assert_eq!(
            f.evaluate(&mut s, 1024, 2100),
            ChaseDecision::MicroSeek {
                delta: 3,
                speed: 1.0
            }
        );
        assert_eq!(f.state(), ChaseState::Running);
    }

    #[test]
    fn test_nudge_is_proportional_to_delta() {
        let mut f = follower();
        let mut s = FakeSlave::new();

        // Engine 20 samples behind the master, within resolution
        s.pos = 0;
        let _ = f.evaluate(&mut s, 0, 0);
        s.pos = 532;
        match f.evaluate(&mut s, 512, 512) {
            ChaseDecision::Run { speed } => {
                assert!((speed - (1.0 + 1.5 * 20.0 / 48000.0)).abs() < 1e-12);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_steady_state_issues_no_nudges() {
        let mut f = follower();
        let mut s = FakeSlave::new();

        let mut engine = 0;
        let _ = f.evaluate(&mut s, 0, engine);
        for cycle in 1..20 {
            engine += 512;
            s.pos = engine;
            let decision = f.evaluate(&mut s, cycle * 512, engine);
            assert_eq!(decision, ChaseDecision::Run { speed: 1.0 });
        }
    }

    #[test]
    fn test_silent_motion_beyond_resolution() {
        let mut f = follower();
        let mut s = FakeSlave::new();

        // Prime the 4-slot window with aligned cycles
        let mut engine = 0;
        let _ = f.evaluate(&mut s, 0, engine);
        for cycle in 1..=4 {
            engine += 512;
            s.pos = engine;
            let _ = f.evaluate(&mut s, cycle * 512, engine);
        }

        // One cycle 2000 samples out pushes the window mean to 500, far
        // beyond the 25-sample resolution: silent within one cycle
        engine += 512;
        s.pos = engine + 2000;
        assert_eq!(
            f.evaluate(&mut s, 5 * 512, engine),
            ChaseDecision::Silent { speed: 1.0 }
        );
        assert!(f.is_silent());

        // Master snaps back into alignment, but the spike still dominates
        // the window mean: stay silent rather than flap Run/Silent
        for cycle in 6..=8 {
            engine += 512;
            s.pos = engine;
            assert_eq!(
                f.evaluate(&mut s, cycle * 512, engine),
                ChaseDecision::Silent { speed: 1.0 }
            );
        }

        // Spike falls out of the window: fine-tracking resumes for good
        for cycle in 9..=12 {
            engine += 512;
            s.pos = engine;
            assert_eq!(
                f.evaluate(&mut s, cycle * 512, engine),
                ChaseDecision::Run { speed: 1.0 }
            );
        }
        assert!(!f.is_silent());
    }

    #[test]
    fn test_lock_loss_reported_once_then_holds() {
        let mut f = follower();
        let mut s = FakeSlave::new();

        let _ = f.evaluate(&mut s, 0, 0);
        assert_eq!(f.state(), ChaseState::Running);

        s.has_estimate = false;
        assert_eq!(f.evaluate(&mut s, 512, 512), ChaseDecision::LockLost);
        assert_eq!(f.evaluate(&mut s, 1024, 512), ChaseDecision::Hold);
    }

    #[test]
    fn test_failed_source_is_dropped() {
        let mut f = follower();
        let mut s = FakeSlave::new();
        s.ok = false;

        assert_eq!(f.evaluate(&mut s, 0, 0), ChaseDecision::DropSource);
    }

    #[test]
    fn test_window_mean_takes_over_once_primed() {
        let mut f = follower();
        let mut s = FakeSlave::new();

        // Fill the 4-slot window with zero deltas
        let mut engine = 0;
        let _ = f.evaluate(&mut s, 0, engine);
        for cycle in 1..=4 {
            engine += 512;
            s.pos = engine;
            let _ = f.evaluate(&mut s, cycle * 512, engine);
        }

        // One 80-sample outlier now contributes mean 80/4 = 20, not 80
        engine += 512;
        s.pos = engine + 80;
        match f.evaluate(&mut s, 5 * 512, engine) {
            ChaseDecision::Run { speed } => {
                assert!((speed - (1.0 + 1.5 * 20.0 / 48000.0)).abs() < 1e-12);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_always_synced_skips_smoothing() {
        let mut f = follower();
        let mut s = FakeSlave::new();
        s.always = true;
        s.authority = true;
        s.resolution = 1;

        let _ = f.evaluate(&mut s, 0, 0);
        s.pos = 512;
        assert_eq!(
            f.evaluate(&mut s, 512, 512),
            ChaseDecision::Run { speed: 1.0 }
        );

        // A peer-side relocate shows up as a big delta: hard locate
        s.pos = 90000;
        assert_eq!(
            f.evaluate(&mut s, 1024, 1024),
            ChaseDecision::Locate { target: 90000 }
        );
    }
}
