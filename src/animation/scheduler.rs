//! # Viseme Scheduler
//!
//! Turns viseme input into a stream of weight changes for a rendering sink.
//! All timing lives in one time-ordered task list (a min-heap keyed by fire
//! time) that is polled by a single driver through [`VisemeScheduler::advance`].
//! The scheduler never reads a clock: callers pass `now` as the elapsed time
//! since the animation session started, which keeps it deterministic in tests.
//!
//! ## Modes (share one `AnimationState`):
//! - **Discrete**: `enqueue` timed events; a fixed-interval tick pops one event
//!   per tick, raises its visemes to the activation level and arms a one-shot
//!   release back to 0 after the event's duration. Pacing comes from the tick
//!   alone; an event's nominal `start` is not a fire time
//! - **Continuous**: `set_target` / `set_target_at` move targets; a per-frame
//!   task interpolates `current` toward `target` and only emits changed values
//!
//! ## Phases:
//! `Idle → Active` on the first enqueue or target. `Active → Draining` when
//! the discrete queue empties; Draining waits for outstanding releases, then
//! resets the sink to neutral and returns to `Idle`. Continuous mode has no
//! Draining phase: it goes idle once every viseme has reached its target.
//!
//! Running both modes on one scheduler is allowed but their interleaving is
//! unspecified; a deployment picks one.

use crate::animation::viseme::{clamp_weight, ScheduledVisemeEvent, Viseme, VisemeWeightSet};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

/// Receiver of animation output. Fire-and-forget.
pub trait AnimationSink {
    /// Set one morph weight (always within [0, 1]).
    fn set_weight(&mut self, viseme: Viseme, weight: f32);

    /// Clear every weight back to the neutral face.
    fn reset(&mut self);
}

/// Timing and interpolation parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Discrete driver period (200ms = 5 ticks per second)
    pub tick_interval: Duration,
    /// Weight a discrete event raises its visemes to
    pub activation_level: f32,
    /// Continuous driver period (~60 Hz)
    pub frame_interval: Duration,
    /// Interpolation speed; `factor = min(1, dt * smoothing_rate)`
    pub smoothing_rate: f32,
    /// Distance below which `current` snaps onto `target`
    pub settle_epsilon: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            activation_level: 0.5,
            frame_interval: Duration::from_millis(16),
            smoothing_rate: 15.0,
            settle_epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Active,
    Draining,
}

/// Per-scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub events_enqueued: u64,
    pub ticks: u64,
    pub frames: u64,
    pub updates_emitted: u64,
    pub resets: u64,
}

/// Interpolation state for one viseme.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VisemeChannel {
    pub current: f32,
    pub target: f32,
    last_emitted: Option<f32>,
    /// Bumped on every discrete activation so stale releases can be ignored
    generation: u64,
}

/// Per-session viseme state: `(current, target)` for every tracked viseme
/// plus the time of the last interpolation step.
#[derive(Debug, Clone, Default)]
pub struct AnimationState {
    channels: BTreeMap<Viseme, VisemeChannel>,
    last_update: Option<Duration>,
}

impl AnimationState {
    pub fn channel(&self, viseme: Viseme) -> Option<&VisemeChannel> {
        self.channels.get(&viseme)
    }

    #[cfg(test)]
    pub fn current(&self, viseme: Viseme) -> f32 {
        self.channel(viseme).map(|c| c.current).unwrap_or(0.0)
    }

    #[cfg(test)]
    pub fn target(&self, viseme: Viseme) -> f32 {
        self.channel(viseme).map(|c| c.target).unwrap_or(0.0)
    }

    /// True when every tracked viseme sits on its target.
    pub fn is_settled(&self) -> bool {
        self.channels.values().all(|c| c.current == c.target)
    }

    fn channel_mut(&mut self, viseme: Viseme) -> &mut VisemeChannel {
        self.channels.entry(viseme).or_default()
    }

    fn clear(&mut self) {
        self.channels.clear();
        self.last_update = None;
    }
}

#[derive(Debug)]
enum Task {
    Tick,
    Release { viseme: Viseme, generation: u64 },
    Frame,
    Target(VisemeWeightSet),
}

#[derive(Debug)]
struct TimedTask {
    at: Duration,
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    // Ties on fire time keep insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

fn lerp(start: f32, end: f32, t: f32) -> f32 {
    start + (end - start) * t
}

/// Next fire time for a periodic task. A late poll does not try to replay
/// missed periods; it continues one period after `now`.
fn next_period(scheduled: Duration, period: Duration, now: Duration) -> Duration {
    let next = scheduled + period;
    if next > now {
        next
    } else {
        now + period
    }
}

fn emit_channel<S: AnimationSink>(
    channel: &mut VisemeChannel,
    viseme: Viseme,
    sink: &mut S,
    stats: &mut SchedulerStats,
) {
    let value = clamp_weight(channel.current);
    if channel.last_emitted != Some(value) {
        channel.last_emitted = Some(value);
        sink.set_weight(viseme, value);
        stats.updates_emitted += 1;
    }
}

/// Time-ordered viseme driver. See the module docs for the mode semantics.
#[derive(Debug)]
pub struct VisemeScheduler {
    config: SchedulerConfig,
    state: AnimationState,
    phase: SchedulerPhase,
    queue: VecDeque<ScheduledVisemeEvent>,
    tasks: BinaryHeap<Reverse<TimedTask>>,
    next_seq: u64,
    ticking: bool,
    frame_pending: bool,
    outstanding_releases: usize,
    stats: SchedulerStats,
}

impl VisemeScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: AnimationState::default(),
            phase: SchedulerPhase::Idle,
            queue: VecDeque::new(),
            tasks: BinaryHeap::new(),
            next_seq: 0,
            ticking: false,
            frame_pending: false,
            outstanding_releases: 0,
            stats: SchedulerStats::default(),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn state(&self) -> &AnimationState {
        &self.state
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Events waiting for a discrete tick.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether any timed task (tick, release, frame, deferred target) is armed.
    pub fn is_driving(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Fire time of the earliest armed task.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.tasks.peek().map(|Reverse(task)| task.at)
    }

    /// Queue a discrete event. Starts the tick driver if it is not running;
    /// the first tick fires at `now`.
    pub fn enqueue(&mut self, event: ScheduledVisemeEvent, now: Duration) {
        self.stats.events_enqueued += 1;
        self.queue.push_back(event);

        if !self.ticking {
            self.ticking = true;
            self.phase = SchedulerPhase::Active;
            self.push(now, Task::Tick);
            debug!(queued = self.queue.len(), "Discrete viseme driver started");
        }
    }

    /// Update the target of every viseme named in `weights`. Visemes not
    /// named keep their current target.
    pub fn set_target(&mut self, weights: &VisemeWeightSet, now: Duration) {
        for (viseme, weight) in weights.iter() {
            self.state.channel_mut(viseme).target = clamp_weight(weight);
        }

        if !self.frame_pending {
            // Restart the interpolation clock so an idle gap is not one giant step
            self.state.last_update = Some(now);
            self.frame_pending = true;
            self.push(now + self.config.frame_interval, Task::Frame);
        }

        if self.phase == SchedulerPhase::Idle {
            self.phase = SchedulerPhase::Active;
        }
    }

    /// Apply `weights` as a new target once `at` is reached.
    pub fn set_target_at(&mut self, weights: VisemeWeightSet, at: Duration) {
        self.push(at, Task::Target(weights));
        if self.phase == SchedulerPhase::Idle {
            self.phase = SchedulerPhase::Active;
        }
    }

    /// Drop every pending event and task and return the sink to neutral.
    pub fn clear<S: AnimationSink>(&mut self, sink: &mut S) {
        self.queue.clear();
        self.tasks.clear();
        self.ticking = false;
        self.frame_pending = false;
        self.outstanding_releases = 0;
        self.reset_to_neutral(sink);
    }

    /// Run every task due at or before `now`, in fire-time order.
    ///
    /// Returns the number of tasks executed. Late polls are tolerated: due
    /// tasks simply run together and the interpolation step grows with the
    /// elapsed time.
    pub fn advance<S: AnimationSink>(&mut self, now: Duration, sink: &mut S) -> usize {
        let mut executed = 0;

        while self.next_deadline().is_some_and(|at| at <= now) {
            let Some(Reverse(timed)) = self.tasks.pop() else {
                break;
            };
            executed += 1;

            match timed.task {
                Task::Tick => self.on_tick(timed.at, now, sink),
                Task::Release { viseme, generation } => self.on_release(viseme, generation, sink),
                Task::Frame => self.on_frame(now, sink),
                Task::Target(weights) => self.set_target(&weights, timed.at),
            }
        }

        self.settle_phase();
        executed
    }

    fn push(&mut self, at: Duration, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(Reverse(TimedTask { at, seq, task }));
    }

    fn on_tick<S: AnimationSink>(&mut self, scheduled: Duration, now: Duration, sink: &mut S) {
        self.stats.ticks += 1;

        let Some(event) = self.queue.pop_front() else {
            self.ticking = false;
            self.phase = SchedulerPhase::Draining;
            debug!(outstanding = self.outstanding_releases, "Discrete queue drained");
            if self.outstanding_releases == 0 {
                self.reset_to_neutral(sink);
            }
            return;
        };

        let level = clamp_weight(self.config.activation_level);
        for (viseme, weight) in event.weights.iter() {
            if weight <= 0.0 {
                continue;
            }

            let channel = self.state.channel_mut(viseme);
            channel.generation += 1;
            channel.current = level;
            channel.target = level;
            let generation = channel.generation;
            emit_channel(channel, viseme, sink, &mut self.stats);

            self.outstanding_releases += 1;
            self.push(now + event.duration, Task::Release { viseme, generation });
        }

        trace!(
            nominal_start_ms = event.start.as_millis() as u64,
            fired_at_ms = now.as_millis() as u64,
            remaining = self.queue.len(),
            "Discrete tick"
        );
        let next = next_period(scheduled, self.config.tick_interval, now);
        self.push(next, Task::Tick);
    }

    fn on_release<S: AnimationSink>(&mut self, viseme: Viseme, generation: u64, sink: &mut S) {
        self.outstanding_releases = self.outstanding_releases.saturating_sub(1);

        // A newer activation owns the viseme now
        if self.state.channel(viseme).map(|c| c.generation) == Some(generation) {
            let channel = self.state.channel_mut(viseme);
            channel.current = 0.0;
            channel.target = 0.0;
            emit_channel(channel, viseme, sink, &mut self.stats);
        }

        if self.phase == SchedulerPhase::Draining && !self.ticking && self.outstanding_releases == 0 {
            self.reset_to_neutral(sink);
        }
    }

    fn on_frame<S: AnimationSink>(&mut self, now: Duration, sink: &mut S) {
        self.frame_pending = false;
        self.stats.frames += 1;

        let dt = self
            .state
            .last_update
            .map(|last| now.saturating_sub(last))
            .unwrap_or_default();
        self.state.last_update = Some(now);

        let factor = (dt.as_secs_f32() * self.config.smoothing_rate).min(1.0);
        let epsilon = self.config.settle_epsilon;
        let mut unsettled = false;

        for (viseme, channel) in self.state.channels.iter_mut() {
            let mut next = lerp(channel.current, channel.target, factor);
            if (next - channel.target).abs() <= epsilon {
                next = channel.target;
            }
            channel.current = clamp_weight(next);
            if channel.current != channel.target {
                unsettled = true;
            }
            emit_channel(channel, *viseme, sink, &mut self.stats);
        }

        if unsettled {
            self.frame_pending = true;
            self.push(now + self.config.frame_interval, Task::Frame);
        }
    }

    fn reset_to_neutral<S: AnimationSink>(&mut self, sink: &mut S) {
        sink.reset();
        self.stats.resets += 1;
        self.state.clear();
        self.phase = SchedulerPhase::Idle;
        debug!("Animation reset to neutral");
    }

    fn settle_phase(&mut self) {
        if self.phase == SchedulerPhase::Draining {
            return;
        }
        self.phase = if self.tasks.is_empty() {
            SchedulerPhase::Idle
        } else {
            SchedulerPhase::Active
        };
    }
}
