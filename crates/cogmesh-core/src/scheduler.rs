//! Discrete-event scheduler
//!
//! Single-threaded cooperative scheduling: callbacks are [`Event`]s ordered
//! by timestamp, with an insertion sequence number breaking ties so
//! same-time events fire in the order they were scheduled. Cancellation is
//! by [`TimerHandle`]: a cancelled entry is skipped when it surfaces, so a
//! callback that was cancelled after scheduling is a guaranteed no-op, and
//! cancelling an already-fired handle does nothing.

use crate::event::Event;
use crate::time::Timestamp;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle to a scheduled callback, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct ScheduledEvent {
    time: Timestamp,
    seq: u64,
    handle: TimerHandle,
    event: Event,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behaviour on BinaryHeap; ties break
        // on the insertion sequence.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// The event queue driving a simulation run.
pub struct Scheduler {
    queue: BinaryHeap<ScheduledEvent>,
    /// Handles scheduled but neither fired nor cancelled.
    live: HashSet<TimerHandle>,
    now: Timestamp,
    next_seq: u64,
    next_handle: u64,
}

impl Scheduler {
    /// Create an empty scheduler at time zero.
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            now: Timestamp::ZERO,
            next_seq: 0,
            next_handle: 0,
        }
    }

    /// The current simulated time.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Schedule `event` to fire `delay` from now.
    pub fn schedule_after(&mut self, delay: Duration, event: Event) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(handle);
        self.queue.push(ScheduledEvent {
            time: self.now + delay,
            seq,
            handle,
            event,
        });
        handle
    }

    /// Schedule `event` to fire at the current time, after everything
    /// already queued for this instant.
    pub fn schedule_now(&mut self, event: Event) -> TimerHandle {
        self.schedule_after(Duration::ZERO, event)
    }

    /// Cancel a scheduled callback. No-op if it already fired or was
    /// already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.live.remove(&handle);
    }

    /// Whether `handle` is still waiting to fire.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle)
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Pop the next live event, advancing the clock to its timestamp.
    /// Cancelled entries are silently discarded.
    pub fn pop_next(&mut self) -> Option<(Timestamp, Event)> {
        while let Some(entry) = self.queue.pop() {
            if !self.live.remove(&entry.handle) {
                continue; // cancelled
            }
            debug_assert!(entry.time >= self.now);
            self.now = entry.time;
            return Some((entry.time, entry.event));
        }
        None
    }

    /// Advance the clock to `t` without firing anything (end-of-run).
    pub fn advance_to(&mut self, t: Timestamp) {
        if t > self.now {
            self.now = t;
        }
    }

    /// Pop the next live event only if it fires at or before `until`.
    pub fn pop_next_until(&mut self, until: Timestamp) -> Option<(Timestamp, Event)> {
        loop {
            let entry = self.queue.peek()?;
            if entry.time > until {
                return None;
            }
            let entry = self.queue.pop().expect("peeked entry");
            if !self.live.remove(&entry.handle) {
                continue;
            }
            self.now = entry.time;
            return Some((entry.time, entry.event));
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
