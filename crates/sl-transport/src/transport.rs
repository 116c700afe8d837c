//! Transport State Machine
//!
//! Split into a thread-safe `TransportHandle` (control surface) and a
//! `TransportProcessor` owned by the audio thread. Requests become events
//! in a lock-free queue; the processor merges them into a frame-ordered
//! list at the top of each cycle and applies them at their action frames,
//! so motion changes land sample-accurately no matter which thread asked.
//!
//! Anything that could block (stream seeks, buffer re-primes, teardown)
//! becomes PostTransportWork for the Butler; rolling resumes only after
//! the Butler reports the work done.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info, warn};
use rtrb::{Consumer, RingBuffer};

use sl_core::{FramePos, FrameRange, SlError, SlResult};
use sl_sync::Slave;

use crate::butler::{Butler, ButlerMsg};
use crate::config::TransportConfig;
use crate::event::{EventKind, EventList, EventQueue, TransportEvent};
use crate::follower::{ChaseDecision, ChaseState, Follower};
use crate::notice::{NoticeSender, TransportNotice};
use crate::state::{Substate, TransportState, TransportSnapshot};
use crate::streams::{DiskStream, StreamRegistry};
use crate::work::{PostTransportWork, WorkRegistry};

// ═══════════════════════════════════════════════════════════════════════════════
// CYCLE OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

/// Fade phase the audio path should render this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declick {
    None,
    FadeIn,
    FadeOut,
}

/// What the audio path should do with this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    /// Transport stopped; render silence
    NoRoll,
    /// Normal playback
    Roll { speed: f64, declick: Declick },
    /// Advance position and run routes without audible output
    Silent { speed: f64 },
}

/// Result of one `process` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    pub motion: Motion,
    /// Playhead at the top of the cycle
    pub start_frame: FramePos,
    /// Playhead after this cycle's motion
    pub end_frame: FramePos,
}

/// Motion change parked behind a declick fade-out
enum Deferred {
    Stop { abort: bool, clear_state: bool },
    Locate { target: FramePos, with_roll: bool },
    SetSpeed { speed: f64 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE (any thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe transport control surface.
///
/// Every `request_*` call is fire-and-forget: it enqueues an event and
/// returns. State readers see the snapshot published at the end of each
/// cycle. Dropping the handle shuts down the Butler.
pub struct TransportHandle {
    events: Arc<EventQueue>,
    snapshot: Arc<TransportSnapshot>,
    work: Arc<WorkRegistry>,
    streams: StreamRegistry,
    dropped_notices: Arc<AtomicU64>,
    _butler: Butler,
}

impl TransportHandle {
    /// Head toward `speed`; 0.0 stops
    pub fn request_transport_speed(&self, speed: f64) {
        self.events.push(None, EventKind::SetSpeed { speed });
    }

    /// Stop rolling. `abort` discards capture and skips auto-return;
    /// `clear_state` also drops loop/range play state.
    pub fn request_stop(&self, abort: bool, clear_state: bool) {
        self.events.push(None, EventKind::Stop { abort, clear_state });
    }

    /// Move the playhead, optionally rolling once the seek completes
    pub fn request_locate(&self, frame: FramePos, with_roll: bool) {
        self.events.push(
            None,
            EventKind::Locate {
                target: frame,
                with_roll,
                force: false,
            },
        );
    }

    /// Enable or disable loop play over the configured loop range
    pub fn request_play_loop(&self, yn: bool, leave_rolling: bool) {
        self.events.push(
            None,
            EventKind::SetLoop {
                enabled: yn,
                leave_rolling,
            },
        );
    }

    /// Play the given ranges in order; empty cancels range play
    pub fn request_play_range(&self, ranges: &[FrameRange], leave_rolling: bool) {
        self.events.push(
            None,
            EventKind::SetPlayRange {
                ranges: ranges.to_vec(),
                leave_rolling,
            },
        );
    }

    /// Roll from `start` and return the playhead to `return_to` on the
    /// next stop
    pub fn request_roll_at_and_return(&self, start: FramePos, return_to: FramePos) {
        self.events
            .push(None, EventKind::RollAndReturn { start, return_to });
    }

    /// Chase the given sync source instead of free-running
    pub fn request_sync_source(&self, slave: Box<dyn Slave>) {
        self.events
            .push(None, EventKind::SetSyncSource { slave: Some(slave) });
    }

    /// Return to the internal clock
    pub fn drop_sync_source(&self) {
        self.events
            .push(None, EventKind::SetSyncSource { slave: None });
    }

    /// Arm or disarm record
    pub fn request_record_enable(&self, enabled: bool) {
        self.events.push(None, EventKind::SetRecord { enabled });
    }

    /// Rebuild stream buffers around the current position
    pub fn request_overwrite_buffers(&self) {
        self.events.push(None, EventKind::Overwrite);
    }

    /// Register a disk stream. Only legal while stopped.
    pub fn add_disk_stream(&self, stream: Arc<dyn DiskStream>) -> SlResult<()> {
        if self.snapshot.rolling() {
            return Err(SlError::InvalidParam(
                "streams can only be registered while stopped".into(),
            ));
        }
        self.streams.add(stream);
        Ok(())
    }

    /// Remove a registered stream by name. Only legal while stopped.
    pub fn remove_disk_stream(&self, name: &str) -> SlResult<bool> {
        if self.snapshot.rolling() {
            return Err(SlError::InvalidParam(
                "streams can only be removed while stopped".into(),
            ));
        }
        Ok(self.streams.remove(name))
    }

    /// Playhead as of the last published cycle
    pub fn frame(&self) -> FramePos {
        self.snapshot.frame()
    }

    /// Speed as of the last published cycle
    pub fn speed(&self) -> f64 {
        self.snapshot.speed()
    }

    pub fn rolling(&self) -> bool {
        self.snapshot.rolling()
    }

    /// True while the Butler still owes deferred work
    pub fn work_pending(&self) -> bool {
        self.work.pending()
    }

    /// Notices lost to a full channel
    pub fn dropped_notices(&self) -> u64 {
        self.dropped_notices.load(Ordering::Relaxed)
    }

    /// Control events lost to a full queue
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSOR (audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// The realtime half of the transport. Not `Sync`; it moves to the audio
/// thread and stays there.
pub struct TransportProcessor {
    state: TransportState,
    config: TransportConfig,
    sample_rate: u32,

    events: Consumer<TransportEvent>,
    list: EventList,
    immediates: Vec<TransportEvent>,
    scratch: Vec<TransportEvent>,
    auto_serial: u64,

    snapshot: Arc<TransportSnapshot>,
    work: Arc<WorkRegistry>,
    streams: StreamRegistry,
    notices: NoticeSender,
    butler_tx: Sender<ButlerMsg>,

    slave: Option<Box<dyn Slave>>,
    follower: Follower,

    /// Engine sample clock; advances every cycle whether rolling or not
    monotonic: FramePos,
    /// Sub-sample position carry for fractional speeds
    frac: f64,
    deferred: Option<Deferred>,

    waiting_for_butler: bool,
    /// Bits we are waiting on; consumed by `butler_work_completed`
    pending_work: PostTransportWork,
    /// Speed to adopt once the Butler finishes (0.0 = stay stopped)
    resume_speed: f64,
    needs_summon: bool,

    loop_active: bool,
    play_ranges: Vec<FrameRange>,
    range_index: usize,
    auto_return_frame: Option<FramePos>,
    silent_this_cycle: bool,
}

impl TransportProcessor {
    /// Run one audio cycle: merge requests, settle deferred work, follow
    /// the sync source or free-run, advance position, fire notices.
    pub fn process(&mut self, nframes: usize, sync_input: Option<&[f32]>) -> CycleSummary {
        let start_frame = self.state.frame;

        // 1. Merge pending requests: immediates apply this cycle, framed
        //    events join the sorted list
        while let Ok(event) = self.events.pop() {
            if event.action_frame.is_none() {
                self.immediates.push(event);
            } else {
                self.list.insert(event);
            }
        }

        // 2. Butler gate: while deferred work is outstanding the transport
        //    holds still, but the sync source keeps decoding
        if self.waiting_for_butler {
            if self.work.pending() {
                self.feed_slave(sync_input);
                return self.finish_cycle(nframes, start_frame, start_frame, Declick::None);
            }
            self.butler_work_completed();
        }

        // 3. Declick completion: the fade-out rendered last cycle, so the
        //    deferred motion change happens now
        if self.state.substate.contains(Substate::DECLICK_OUT) {
            self.state.substate.remove(Substate::DECLICK_OUT);
            if let Some(action) = self.deferred.take() {
                self.execute_deferred(action);
            }
        }

        // 4. Apply immediate events in submission order. An event that
        //    starts gated work holds the rest of the batch for next cycle.
        mem::swap(&mut self.immediates, &mut self.scratch);
        self.scratch.reverse();
        while let Some(event) = self.scratch.pop() {
            if self.waiting_for_butler {
                self.immediates.push(event);
                continue;
            }
            self.apply_event(event);
        }

        // 5. Chase the sync source, if one is active
        self.follow_slave(sync_input);

        // 6. Motion: walk the event list across this cycle's frame span,
        //    applying events at their frames and moving between them
        let mut samples_left = nframes as f64;
        while self.state.speed != 0.0 && samples_left > 0.0 {
            let speed = self.state.speed;
            let from = self.state.frame as f64 + self.frac;
            let to = from + samples_left * speed;

            // Framed events only apply in normal forward motion. Silent
            // motion is pure position catch-up, so loop wraps and range
            // boundaries do not fire while it is active.
            let next = if speed > 0.0 && !self.silent_this_cycle {
                self.list.next_frame()
            } else {
                None
            };
            match next {
                Some(f) if (f as f64) < to => {
                    let fpos = f as f64;
                    if fpos > from {
                        samples_left -= (fpos - from) / speed;
                        self.state.frame = f;
                        self.frac = 0.0;
                    }
                    if let Some(event) = self.list.pop_due(f) {
                        self.apply_event(event);
                    }
                    if self.waiting_for_butler {
                        break;
                    }
                }
                _ => {
                    self.state.frame = to.floor() as FramePos;
                    self.frac = to - to.floor();
                    samples_left = 0.0;
                    if speed < 0.0 && self.state.frame <= 0 {
                        // Reverse play ran out of timeline
                        self.state.frame = 0;
                        self.frac = 0.0;
                        self.begin_stop(false, false);
                    }
                }
            }
        }

        // 7. Resolve this cycle's declick phase
        let declick = if !self.state.rolling() {
            Declick::None
        } else if self.state.substate.contains(Substate::DECLICK_OUT) {
            Declick::FadeOut
        } else if self.state.substate.contains(Substate::DECLICK_IN) {
            self.state.substate.remove(Substate::DECLICK_IN);
            Declick::FadeIn
        } else {
            Declick::None
        };

        self.finish_cycle(nframes, start_frame, self.state.frame, declick)
    }

    /// Publish the snapshot, summon the Butler if work was queued, and
    /// classify this cycle's motion
    fn finish_cycle(
        &mut self,
        nframes: usize,
        start_frame: FramePos,
        end_frame: FramePos,
        declick: Declick,
    ) -> CycleSummary {
        self.monotonic += nframes as FramePos;
        self.snapshot.publish(self.state.frame, self.state.speed);
        if mem::take(&mut self.needs_summon) {
            self.work.bump_requests();
            let _ = self.butler_tx.try_send(ButlerMsg::Wake);
        }

        let motion = if !self.state.rolling() {
            Motion::NoRoll
        } else if mem::take(&mut self.silent_this_cycle) {
            Motion::Silent {
                speed: self.state.speed,
            }
        } else {
            Motion::Roll {
                speed: self.state.speed,
                declick,
            }
        };
        CycleSummary {
            motion,
            start_frame,
            end_frame,
        }
    }

    /// Playhead position (audio-thread view)
    pub fn frame(&self) -> FramePos {
        self.state.frame
    }

    /// Current speed (audio-thread view)
    pub fn speed(&self) -> f64 {
        self.state.speed
    }

    pub fn chase_state(&self) -> ChaseState {
        self.follower.state()
    }

    pub fn has_sync_source(&self) -> bool {
        self.slave.is_some()
    }

    // ─── event application ─────────────────────────────────────────────────

    fn apply_event(&mut self, event: TransportEvent) {
        debug!("apply {:?}", event.kind);
        match event.kind {
            EventKind::SetSpeed { speed } => self.set_speed_request(speed),
            EventKind::Stop { abort, clear_state } => self.begin_stop(abort, clear_state),
            EventKind::Locate {
                target,
                with_roll,
                force,
            } => self.start_locate(target, with_roll, force),
            EventKind::RollAndReturn { start, return_to } => {
                self.auto_return_frame = Some(return_to);
                self.state.substate.insert(Substate::AUTO_RETURNING);
                self.start_locate(start, true, false);
            }
            EventKind::SetLoop {
                enabled,
                leave_rolling,
            } => self.set_loop(enabled, leave_rolling),
            EventKind::SetPlayRange {
                ranges,
                leave_rolling,
            } => self.set_play_range(ranges, leave_rolling),
            EventKind::RangeStop => {
                self.play_ranges.clear();
                self.range_index = 0;
                self.begin_stop(false, false);
            }
            EventKind::RangeLocate { target } => self.range_locate(target),
            EventKind::Overwrite => self.queue_work(PostTransportWork::OVERWRITE),
            EventKind::SetRecord { enabled } => self.set_record(enabled),
            EventKind::SetSyncSource { slave } => self.set_sync_source(slave),
        }
    }

    fn set_speed_request(&mut self, speed: f64) {
        let speed = speed.clamp(-self.config.max_speed, self.config.max_speed);
        if speed == self.state.speed && speed == self.state.target_speed {
            return;
        }
        if speed == 0.0 {
            self.begin_stop(false, false);
            return;
        }
        if self.state.speed == 0.0 {
            // Starting. A direction flip relative to the speed before the
            // last stop re-primes stream buffers first.
            if speed.signum() != self.state.last_nonzero_speed.signum() {
                self.state.target_speed = speed;
                self.work.set_target_speed(speed);
                self.enter_wait(
                    PostTransportWork::REVERSE | PostTransportWork::SPEED,
                    speed,
                );
                return;
            }
            self.start_roll(speed);
            return;
        }
        if speed.signum() != self.state.speed.signum() {
            // Flip while rolling: fade out, then re-prime and resume
            if self.state.substate.contains(Substate::DECLICK_OUT) {
                return;
            }
            self.state.substate.insert(Substate::DECLICK_OUT);
            self.deferred = Some(Deferred::SetSpeed { speed });
            return;
        }
        // Same-direction varispeed applies now; buffers re-prime in the
        // background without stopping the transport
        self.state.speed = speed;
        self.state.target_speed = speed;
        self.state.last_nonzero_speed = speed;
        self.work.set_target_speed(speed);
        self.queue_work(PostTransportWork::SPEED | PostTransportWork::CURVE_REALLOC);
    }

    fn start_roll(&mut self, speed: f64) {
        self.state.speed = speed;
        self.state.target_speed = speed;
        self.state.last_nonzero_speed = speed;
        self.state.substate.insert(Substate::DECLICK_IN);
        self.notices
            .send(TransportNotice::StateChanged { rolling: true });
    }

    fn begin_stop(&mut self, abort: bool, clear_state: bool) {
        if !self.state.rolling() {
            // Idempotent: no transition, no work bits
            if clear_state {
                self.clear_play_state();
            }
            return;
        }
        if self.state.substate.contains(Substate::DECLICK_OUT) {
            return;
        }
        self.state.substate.insert(Substate::DECLICK_OUT);
        self.deferred = Some(Deferred::Stop { abort, clear_state });
    }

    /// The actual stop, reached after the declick fade (or directly by
    /// the deferred path)
    fn stop_now(&mut self, abort: bool, clear_state: bool) {
        self.state.speed = 0.0;
        self.state.target_speed = 0.0;
        self.frac = 0.0;

        let mut bits = PostTransportWork::STOP;
        if abort {
            bits |= PostTransportWork::ABORT;
            self.auto_return_frame = None;
            self.state.substate.remove(Substate::AUTO_RETURNING);
            if self.state.record_enabled {
                bits |= PostTransportWork::DISABLE_RECORD;
                self.state.record_enabled = false;
                self.notices
                    .send(TransportNotice::RecordStateChanged { enabled: false });
            }
        } else if self.state.record_enabled {
            self.state.substate.insert(Substate::STOP_PENDING_CAPTURE);
            bits |= PostTransportWork::DID_RECORD | PostTransportWork::DURATION;
        }

        let mut resting = self.state.frame;
        if !abort {
            if let Some(ret) = self.auto_return_frame.take() {
                self.state.substate.remove(Substate::AUTO_RETURNING);
                self.state.frame = ret;
                self.frac = 0.0;
                resting = ret;
                bits |= PostTransportWork::LOCATE;
                self.work.set_roll_after_locate(false);
                self.notices
                    .send(TransportNotice::PositionChanged { frame: ret });
            }
        }
        if clear_state {
            bits |= PostTransportWork::CLEAR_SUBSTATE;
        }

        self.work.set_locate_target(resting);
        self.enter_wait(bits, 0.0);
        self.notices
            .send(TransportNotice::StateChanged { rolling: false });
    }

    fn start_locate(&mut self, target: FramePos, with_roll: bool, force: bool) {
        if self.state.rolling() {
            // Fade out first; re-requests during the fade are dropped
            if self.state.substate.contains(Substate::DECLICK_OUT) {
                return;
            }
            self.state
                .substate
                .insert(Substate::DECLICK_OUT | Substate::PENDING_LOCATE);
            self.deferred = Some(Deferred::Locate { target, with_roll });
            return;
        }
        if !force && target == self.state.frame {
            self.notices.send(TransportNotice::Located {
                frame: target,
                rolling: false,
            });
            return;
        }
        self.do_locate(target, with_roll);
    }

    /// Move the playhead: position changes now, streams seek on the
    /// Butler, rolling (if requested) resumes on completion
    fn do_locate(&mut self, target: FramePos, with_roll: bool) {
        if self.state.rolling() {
            self.state.speed = 0.0;
            self.state.target_speed = 0.0;
            self.notices
                .send(TransportNotice::StateChanged { rolling: false });
        }
        self.state.frame = target;
        self.frac = 0.0;
        self.state.substate.insert(Substate::PENDING_LOCATE);
        self.work.set_locate_target(target);
        self.work.set_roll_after_locate(with_roll);

        let mut bits = PostTransportWork::LOCATE;
        let resume = if with_roll {
            bits |= PostTransportWork::ROLL;
            1.0
        } else {
            0.0
        };
        self.notices
            .send(TransportNotice::PositionChanged { frame: target });
        self.enter_wait(bits, resume);
    }

    fn execute_deferred(&mut self, action: Deferred) {
        match action {
            Deferred::Stop { abort, clear_state } => self.stop_now(abort, clear_state),
            Deferred::Locate { target, with_roll } => self.do_locate(target, with_roll),
            Deferred::SetSpeed { speed } => {
                if self.state.rolling() {
                    self.notices
                        .send(TransportNotice::StateChanged { rolling: false });
                }
                self.state.speed = 0.0;
                self.state.target_speed = speed;
                self.work.set_target_speed(speed);
                self.enter_wait(
                    PostTransportWork::REVERSE | PostTransportWork::SPEED,
                    speed,
                );
            }
        }
    }

    /// Finalize after the Butler cleared everything we were waiting on
    fn butler_work_completed(&mut self) {
        self.waiting_for_butler = false;
        let finished = mem::replace(&mut self.pending_work, PostTransportWork::empty());
        let resume = mem::replace(&mut self.resume_speed, 0.0);

        if finished.intersects(PostTransportWork::LOCATE) {
            self.state
                .substate
                .remove(Substate::PENDING_LOCATE | Substate::PENDING_SET_LOOP);
            self.notices.send(TransportNotice::Located {
                frame: self.state.frame,
                rolling: resume != 0.0,
            });
        }
        if finished.intersects(PostTransportWork::STOP) {
            self.state.substate.remove(Substate::STOP_PENDING_CAPTURE);
        }
        if finished.intersects(PostTransportWork::CLEAR_SUBSTATE) {
            self.clear_play_state();
        }
        debug!("deferred work complete: {:#07x}", finished.bits());

        if resume != 0.0 {
            self.start_roll(resume);
        }
    }

    fn clear_play_state(&mut self) {
        self.loop_active = false;
        self.play_ranges.clear();
        self.range_index = 0;
        self.list.clear_auto();
        self.state
            .substate
            .remove(Substate::AUTO_RETURNING | Substate::PENDING_SET_LOOP);
        self.auto_return_frame = None;
    }

    // ─── loop and range play ───────────────────────────────────────────────

    fn set_loop(&mut self, enabled: bool, leave_rolling: bool) {
        if !enabled {
            if self.loop_active {
                self.loop_active = false;
                self.list.clear_auto();
                self.state.substate.remove(Substate::PENDING_SET_LOOP);
                if !leave_rolling && self.state.rolling() {
                    self.begin_stop(false, false);
                }
            }
            return;
        }
        let Some(range) = self.config.loop_range else {
            warn!("loop play requested without a configured loop range");
            return;
        };
        if self.loop_active {
            return;
        }
        self.loop_active = true;
        self.list.clear_auto();
        self.arm_loop_wrap(range);
        if !range.contains(self.state.frame) {
            // flagged until the relocate into the loop range lands, so
            // observers can tell loop setup from an ordinary locate
            self.state.substate.insert(Substate::PENDING_SET_LOOP);
            self.start_locate(range.start, leave_rolling || self.state.rolling(), false);
        } else if leave_rolling && !self.state.rolling() {
            self.set_speed_request(1.0);
        }
    }

    fn arm_loop_wrap(&mut self, range: FrameRange) {
        let serial = self.next_auto_serial();
        self.list.insert(TransportEvent {
            action_frame: Some(range.end),
            serial,
            kind: EventKind::RangeLocate {
                target: range.start,
            },
        });
    }

    fn set_play_range(&mut self, ranges: Vec<FrameRange>, leave_rolling: bool) {
        self.list.clear_auto();
        self.play_ranges = ranges;
        self.range_index = 0;
        if self.play_ranges.is_empty() {
            if !leave_rolling && self.state.rolling() {
                self.begin_stop(false, false);
            }
            return;
        }
        let first = self.play_ranges[0];
        self.arm_range_events();
        self.start_locate(first.start, leave_rolling, true);
    }

    /// Queue the auto event for the end of the current range
    fn arm_range_events(&mut self) {
        self.list.clear_auto();
        if self.loop_active {
            if let Some(range) = self.config.loop_range {
                self.arm_loop_wrap(range);
            }
        }
        if let Some(range) = self.play_ranges.get(self.range_index).copied() {
            let kind = if self.range_index + 1 < self.play_ranges.len() {
                EventKind::RangeLocate {
                    target: self.play_ranges[self.range_index + 1].start,
                }
            } else {
                EventKind::RangeStop
            };
            let serial = self.next_auto_serial();
            self.list.insert(TransportEvent {
                action_frame: Some(range.end),
                serial,
                kind,
            });
        }
    }

    /// Auto event: wrap the loop or jump to the next play range. The
    /// playhead moves in the realtime thread; streams refill around the
    /// new position in the background without stopping the transport.
    fn range_locate(&mut self, target: FramePos) {
        if self.loop_active {
            if let Some(range) = self.config.loop_range {
                self.state.frame = target;
                self.frac = 0.0;
                self.arm_loop_wrap(range);
                self.work.set_locate_target(target);
                self.queue_work(PostTransportWork::LOCATE);
                self.notices.send(TransportNotice::TransportLooped);
                return;
            }
        }
        self.range_index += 1;
        self.state.frame = target;
        self.frac = 0.0;
        self.work.set_locate_target(target);
        self.queue_work(PostTransportWork::LOCATE);
        self.arm_range_events();
        self.notices
            .send(TransportNotice::PositionChanged { frame: target });
    }

    fn next_auto_serial(&mut self) -> u64 {
        // Auto events sort after user events on the same frame
        self.auto_serial += 1;
        u64::MAX / 2 + self.auto_serial
    }

    // ─── record ────────────────────────────────────────────────────────────

    fn set_record(&mut self, enabled: bool) {
        if enabled == self.state.record_enabled {
            return;
        }
        self.state.record_enabled = enabled;
        self.notices
            .send(TransportNotice::RecordStateChanged { enabled });
        if !enabled && self.state.rolling() {
            // Capture pass ends while still rolling
            self.queue_work(PostTransportWork::DID_RECORD | PostTransportWork::DURATION);
        }
    }

    // ─── sync source ───────────────────────────────────────────────────────

    fn set_sync_source(&mut self, new: Option<Box<dyn Slave>>) {
        match new {
            Some(slave) => {
                self.ship_old_slave();
                let name = slave.name().to_string();
                info!("sync source: {name}");
                self.slave = Some(slave);
                self.reset_follower();
                self.notices
                    .send(TransportNotice::SyncSourceChanged { name });
            }
            None => {
                if self.slave.is_some() {
                    self.ship_old_slave();
                    self.reset_follower();
                    self.notices.send(TransportNotice::SyncSourceChanged {
                        name: "internal".into(),
                    });
                }
            }
        }
    }

    fn ship_old_slave(&mut self) {
        if let Some(old) = self.slave.take() {
            if let Err(e) = self.butler_tx.try_send(ButlerMsg::Dispose(old)) {
                warn!("butler queue full, disposing sync source inline");
                drop(e.into_inner());
            }
        }
    }

    fn reset_follower(&mut self) {
        self.follower = Follower::new(
            self.config.delta_window,
            self.config.chase_gain,
            self.config.seek_ahead_fallback,
            self.sample_rate,
        );
    }

    fn feed_slave(&mut self, sync_input: Option<&[f32]>) {
        if let Some(slave) = self.slave.as_mut() {
            if let Some(input) = sync_input {
                slave.feed_audio(input, self.monotonic);
            }
        }
    }

    fn follow_slave(&mut self, sync_input: Option<&[f32]>) {
        let Some(slave) = self.slave.as_mut() else {
            return;
        };
        if let Some(input) = sync_input {
            slave.feed_audio(input, self.monotonic);
        }
        if self.waiting_for_butler {
            // Mid-seek position is not worth comparing against
            return;
        }
        let decision = self
            .follower
            .evaluate(slave.as_mut(), self.monotonic, self.state.frame);

        match decision {
            // No usable estimate yet: leave the transport as it is. The
            // stop-on-loss policy acts on LockLost, not on quiet cycles.
            ChaseDecision::Hold => {}
            ChaseDecision::LockLost => {
                let name = self
                    .slave
                    .as_ref()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                warn!("sync source '{name}' lost lock");
                self.notices.send(TransportNotice::SyncSourceLost { name });
                if self.config.stop_on_sync_loss && self.state.rolling() {
                    self.begin_stop(false, false);
                }
                // Otherwise free-run at the current speed until estimates
                // resume
            }
            ChaseDecision::DropSource => {
                let name = self
                    .slave
                    .as_ref()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                warn!("sync source '{name}' failed, dropping");
                self.ship_old_slave();
                self.reset_follower();
                self.notices.send(TransportNotice::SyncSourceLost { name });
                self.notices.send(TransportNotice::SyncSourceChanged {
                    name: "internal".into(),
                });
                if self.config.stop_on_sync_loss && self.state.rolling() {
                    self.begin_stop(false, false);
                }
            }
            ChaseDecision::Stop { relocate } => {
                if self.state.rolling() {
                    self.begin_stop(false, false);
                } else if !self.waiting_for_butler {
                    if let Some(target) = relocate {
                        self.start_locate(target, false, false);
                    }
                }
            }
            ChaseDecision::Locate { target } => {
                if self.state.rolling() {
                    self.begin_stop(false, false);
                } else if !self.waiting_for_butler {
                    self.start_locate(target, false, false);
                }
            }
            ChaseDecision::MicroSeek { delta, speed } => {
                if self.streams.try_micro_seek(delta) {
                    self.state.frame += delta;
                    self.frac = 0.0;
                    self.notices.send(TransportNotice::PositionChanged {
                        frame: self.state.frame,
                    });
                    self.sync_set_speed(speed);
                } else if !self.waiting_for_butler {
                    // Residual too large for the buffers; full locate
                    self.start_locate(self.state.frame + delta, false, false);
                }
            }
            ChaseDecision::Silent { speed } => {
                self.silent_this_cycle = true;
                self.state.speed = speed.clamp(-self.config.max_speed, self.config.max_speed);
                self.state.target_speed = self.state.speed;
                if self.state.speed != 0.0 {
                    self.state.last_nonzero_speed = self.state.speed;
                }
            }
            ChaseDecision::Run { speed } => self.sync_set_speed(speed),
        }
    }

    /// Chase-path speed change: continuous adjustments skip the declick
    /// and curve ceremony, but direction flips still re-prime buffers
    fn sync_set_speed(&mut self, speed: f64) {
        let speed = speed.clamp(-self.config.max_speed, self.config.max_speed);
        if speed == self.state.speed {
            return;
        }
        if self.state.speed == 0.0 {
            if speed.signum() != self.state.last_nonzero_speed.signum() {
                self.state.target_speed = speed;
                self.work.set_target_speed(speed);
                self.enter_wait(
                    PostTransportWork::REVERSE | PostTransportWork::SPEED,
                    speed,
                );
                return;
            }
            self.start_roll(speed);
            return;
        }
        if speed.signum() != self.state.speed.signum() {
            if self.state.substate.contains(Substate::DECLICK_OUT) {
                return;
            }
            self.state.substate.insert(Substate::DECLICK_OUT);
            self.deferred = Some(Deferred::SetSpeed { speed });
            return;
        }
        self.state.speed = speed;
        self.state.target_speed = speed;
        self.state.last_nonzero_speed = speed;
    }

    // ─── deferred-work plumbing ────────────────────────────────────────────

    /// Add gated work: the transport holds still until the Butler clears
    /// it, then resumes at `resume_speed`
    fn enter_wait(&mut self, bits: u32, resume_speed: f64) {
        self.pending_work = PostTransportWork::new(self.pending_work.bits() | bits);
        self.waiting_for_butler = true;
        self.resume_speed = resume_speed;
        self.queue_work(bits);
    }

    /// Add background work that does not gate the transport
    fn queue_work(&mut self, bits: u32) {
        self.work.add(bits);
        self.needs_summon = true;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Build a transport: the control handle, the audio-thread processor, and
/// the notice stream. Spawns the Butler thread.
pub fn create_transport(
    config: TransportConfig,
    sample_rate: u32,
) -> SlResult<(TransportHandle, TransportProcessor, Receiver<TransportNotice>)> {
    config.validate()?;
    if sample_rate == 0 {
        return Err(SlError::InvalidSampleRate(sample_rate));
    }

    let (event_tx, event_rx) = RingBuffer::new(config.event_queue_capacity);
    let events = Arc::new(EventQueue::new(event_tx));
    let (notice_tx, notice_rx) = bounded(config.notice_capacity);
    let dropped_notices = Arc::new(AtomicU64::new(0));
    let notices = NoticeSender::new(notice_tx, Arc::clone(&dropped_notices));
    let snapshot = Arc::new(TransportSnapshot::new());
    let work = Arc::new(WorkRegistry::new());
    let streams = StreamRegistry::new();

    let butler = Butler::spawn(
        Arc::clone(&work),
        streams.clone(),
        Arc::clone(&events),
        notices.clone(),
    )?;
    let butler_tx = butler.sender();

    let follower = Follower::new(
        config.delta_window,
        config.chase_gain,
        config.seek_ahead_fallback,
        sample_rate,
    );
    let queue_capacity = config.event_queue_capacity;

    let processor = TransportProcessor {
        state: TransportState::new(),
        config,
        sample_rate,
        events: event_rx,
        list: EventList::with_capacity(queue_capacity),
        immediates: Vec::with_capacity(queue_capacity),
        scratch: Vec::with_capacity(queue_capacity),
        auto_serial: 0,
        snapshot: Arc::clone(&snapshot),
        work: Arc::clone(&work),
        streams: streams.clone(),
        notices,
        butler_tx,
        slave: None,
        follower,
        monotonic: 0,
        frac: 0.0,
        deferred: None,
        waiting_for_butler: false,
        pending_work: PostTransportWork::empty(),
        resume_speed: 0.0,
        needs_summon: false,
        loop_active: false,
        play_ranges: Vec::new(),
        range_index: 0,
        auto_return_frame: None,
        silent_this_cycle: false,
    };

    let handle = TransportHandle {
        events,
        snapshot,
        work,
        streams,
        dropped_notices,
        _butler: butler,
    };

    Ok((handle, processor, notice_rx))
}
