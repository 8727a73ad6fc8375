//! The simulation timeline: clock, stop-time contract, and counters.
//!
//! The timeline owns the event queue and the current simulation time, and
//! enforces the scheduling contract:
//!
//! - events may never be scheduled in the past;
//! - `now()` is monotonically non-decreasing during a run;
//! - the run ends when the queue drains, when the next event's time reaches
//!   the stop time, or when `stop()` is called.
//!
//! Dispatch itself lives in the engine layer: the timeline hands out due
//! events through [`Timeline::pop_due`] and the engine interprets them.

use tracing::info;

use crate::error::KernelError;
use crate::event::{Event, EventId, EventQueue};

// ============================================================================
// Stop Time
// ============================================================================

/// The stop-time contract for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTime {
    /// Run until the event queue is empty.
    Never,
    /// Stop before dispatching any event at or after this time (ps).
    At(u64),
}

impl StopTime {
    fn reached(self, time: u64) -> bool {
        match self {
            StopTime::Never => false,
            StopTime::At(stop) => time >= stop,
        }
    }
}

// ============================================================================
// Timeline
// ============================================================================

/// Simulation clock and event scheduler.
///
/// `K` is the engine-defined event payload.
pub struct Timeline<K> {
    events: EventQueue<K>,
    time: u64,
    stop_time: StopTime,
    is_running: bool,
    seed: u64,
    schedule_counter: u64,
    run_counter: u64,
}

impl<K> Timeline<K> {
    /// Creates a timeline with the given stop time and master seed.
    pub fn new(stop_time: StopTime, seed: u64) -> Self {
        Self {
            events: EventQueue::new(),
            time: 0,
            stop_time,
            is_running: false,
            seed,
            schedule_counter: 0,
            run_counter: 0,
        }
    }

    /// Current simulation time (ps).
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Master seed for this run. Entity RNG streams derive from it.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Replaces the master seed (before the run starts).
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// Configured stop time.
    pub fn stop_time(&self) -> StopTime {
        self.stop_time
    }

    /// Whether the run loop is currently executing.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Number of events scheduled so far.
    pub fn schedule_counter(&self) -> u64 {
        self.schedule_counter
    }

    /// Number of events dispatched so far.
    pub fn run_counter(&self) -> u64 {
        self.run_counter
    }

    /// Live events awaiting dispatch.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Schedules an event at an absolute time with the default priority.
    pub fn schedule(&mut self, time: u64, kind: K) -> Result<EventId, KernelError> {
        self.check_time(time)?;
        self.schedule_counter += 1;
        Ok(self.events.push_default(time, kind))
    }

    /// Schedules an event with an explicit priority (lower dispatches first
    /// on time ties).
    pub fn schedule_priority(
        &mut self,
        time: u64,
        priority: u64,
        kind: K,
    ) -> Result<EventId, KernelError> {
        self.check_time(time)?;
        self.schedule_counter += 1;
        Ok(self.events.push(time, priority, kind))
    }

    /// Schedules an event whose tie-break priority is pinned to the current
    /// insertion counter, preserving submission order among same-time
    /// events. Used where simultaneous events must resolve deterministically
    /// regardless of which endpoint is closer.
    pub fn schedule_counter_priority(&mut self, time: u64, kind: K) -> Result<EventId, KernelError> {
        self.check_time(time)?;
        self.schedule_counter += 1;
        Ok(self.events.push_counter_priority(time, kind))
    }

    fn check_time(&self, time: u64) -> Result<(), KernelError> {
        if time < self.time {
            return Err(KernelError::ScheduleInPast {
                time,
                now: self.time,
            });
        }
        Ok(())
    }

    /// Cancels a scheduled event via the removed-flag mechanism.
    pub fn remove_event(&mut self, id: EventId) {
        self.events.remove(id);
    }

    /// Returns true if the event is still scheduled.
    pub fn event_is_live(&self, id: EventId) -> bool {
        self.events.is_live(id)
    }

    /// Moves a scheduled event to a new time (same payload), returning the
    /// replacement id. Used by memory expiration updates.
    pub fn reschedule_event(&mut self, id: EventId, time: u64, kind: K) -> Option<EventId> {
        self.events.reschedule(id, time.max(self.time), kind)
    }

    /// Marks the run as started.
    pub fn begin_run(&mut self) {
        self.is_running = true;
        info!(seed = self.seed, "timeline start simulation");
    }

    /// Pops the next due event, advancing the clock to its time.
    ///
    /// Returns `None` when the run is over: queue empty, stop time reached
    /// (the event is pushed back for a later resumed run), or `stop()`
    /// called.
    pub fn pop_due(&mut self) -> Option<Event<K>> {
        if !self.is_running {
            return None;
        }
        let event = self.events.pop()?;
        if self.stop_time.reached(event.time) {
            self.events.push_back(event);
            return None;
        }
        debug_assert!(
            self.time <= event.time,
            "event time {} before now {}",
            event.time,
            self.time
        );
        self.time = event.time;
        self.run_counter += 1;
        Some(event)
    }

    /// Marks the run as finished and reports counters.
    pub fn end_run(&mut self) -> TimelineSummary {
        self.is_running = false;
        let summary = TimelineSummary {
            final_time: self.time,
            scheduled: self.schedule_counter,
            executed: self.run_counter,
            seed: self.seed,
        };
        info!(
            final_time_ps = summary.final_time,
            scheduled = summary.scheduled,
            executed = summary.executed,
            "timeline end simulation"
        );
        summary
    }

    /// Stops the simulation: the stop time is set to the current time, so
    /// no further event dispatches.
    pub fn stop(&mut self) {
        info!(now = self.time, "timeline stopped");
        self.stop_time = StopTime::At(self.time);
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSummary {
    /// Simulation time when the run ended (ps).
    pub final_time: u64,
    /// Events scheduled over the run.
    pub scheduled: u64,
    /// Events dispatched over the run.
    pub executed: u64,
    /// Master seed of the run.
    pub seed: u64,
}

// ============================================================================
// Tests
// ============================================================================
