use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::event::{EventExecution, EventId, EventStatus};
use crate::{SimError, TIME_EPSILON};

#[inline]
fn is_due(execution_time: f64, t: f64) -> bool {
    execution_time <= t + TIME_EPSILON * t.abs().max(1.0)
}

/// Entry of the persistent delay queue.
///
/// `BinaryHeap` is a max-heap; ordering is reversed so the earliest
/// execution sits at the top, with insertion order breaking time ties.
#[derive(Clone, Debug)]
struct DelayedExecution {
    seq: u64,
    event_id: EventId,
    execution: EventExecution,
}

impl Ord for DelayedExecution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.execution
            .execution_time()
            .total_cmp(&other.execution.execution_time())
            .then_with(|| self.seq.cmp(&other.seq))
            .reverse()
    }
}

impl PartialOrd for DelayedExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedExecution {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedExecution {}

/// Per-run event scheduler: trigger edge detection, delayed and volatile
/// queues, and priority-ordered execution.
#[derive(Clone, Debug, Default)]
pub struct EventState {
    events: Vec<Arc<EventStatus>>,
    trigger_state: Vec<bool>,
    trigger_pool: BTreeSet<EventId>,
    delay_queue: BinaryHeap<DelayedExecution>,
    volatile_queue: VecDeque<(EventId, EventExecution)>,
    next_seq: u64,
    executed: u64,
}

impl EventState {
    /// Builds the scheduler and seeds every trigger with its value at `t0`.
    ///
    /// Event ids must be dense: the event at position `i` must carry id `i`.
    pub fn new(
        events: Vec<EventStatus>,
        t0: f64,
        state: &[f64],
        parameters: &[f64],
    ) -> Result<Self, SimError> {
        let events: Vec<Arc<EventStatus>> = events.into_iter().map(Arc::new).collect();
        Self::from_shared(events, t0, state, parameters)
    }

    pub fn from_shared(
        events: Vec<Arc<EventStatus>>,
        t0: f64,
        state: &[f64],
        parameters: &[f64],
    ) -> Result<Self, SimError> {
        if let Some((position, event)) = events
            .iter()
            .enumerate()
            .find(|(position, event)| event.id() != *position)
        {
            return Err(SimError::InvalidArgument(format!(
                "event at position {} has id {}; event ids must be dense and ordered",
                position,
                event.id()
            )));
        }
        let mut event_state = Self {
            events,
            ..Self::default()
        };
        event_state.reset(t0, state, parameters);
        Ok(event_state)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, t0: f64, state: &[f64], parameters: &[f64]) {
        self.trigger_state = self
            .events
            .iter()
            .map(|event| event.initial_value(t0, state, parameters))
            .collect();
        self.trigger_pool.clear();
        self.delay_queue.clear();
        self.volatile_queue.clear();
        self.next_seq = 0;
        self.executed = 0;
    }

    pub fn events(&self) -> &[Arc<EventStatus>] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn has_active_events(&self) -> bool {
        !self.trigger_pool.is_empty()
    }

    pub fn is_active(&self, event_id: EventId) -> bool {
        self.trigger_pool.contains(&event_id)
    }

    pub fn trigger_state(&self, event_id: EventId) -> Result<bool, SimError> {
        self.trigger_state
            .get(event_id)
            .copied()
            .ok_or_else(|| self.unknown_event(event_id))
    }

    pub fn executed_count(&self) -> u64 {
        self.executed
    }

    pub fn pending_count(&self) -> usize {
        self.delay_queue.len() + self.volatile_queue.len()
    }

    pub fn next_scheduled_time(&self) -> Option<f64> {
        let persistent = self
            .delay_queue
            .peek()
            .map(|head| head.execution.execution_time());
        let volatile = self
            .volatile_queue
            .iter()
            .map(|(_, execution)| execution.execution_time())
            .min_by(f64::total_cmp);
        match (persistent, volatile) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn evaluate_triggers(&mut self, state: &[f64], parameters: &[f64], t: f64) -> bool {
        for (event_id, event) in self.events.iter().enumerate() {
            if event.trigger(t, state, parameters) != self.trigger_state[event_id] {
                self.trigger_pool.insert(event_id);
            }
        }
        self.has_active_events()
    }

    /// Processes the current time point: detects trigger edges, promotes
    /// ready delayed executions, runs everything due in priority order and
    /// refreshes the trigger states.
    ///
    /// Returns whether events remain active afterwards.
    pub fn evaluate(
        &mut self,
        state: &mut [f64],
        parameters: &mut [f64],
        t: f64,
        events_found: &BTreeSet<EventId>,
    ) -> Result<bool, SimError> {
        if let Some(&unknown) = events_found.iter().find(|&&id| id >= self.events.len()) {
            return Err(self.unknown_event(unknown));
        }
        if self.events.is_empty() {
            return Ok(false);
        }
        if !events_found.is_empty() {
            trace!(t, ?events_found, "root finder reported event triggers");
        }

        let mut firing: Vec<(EventId, EventExecution)> = Vec::new();

        // Edge detection and scheduling.
        for event_id in 0..self.events.len() {
            let event = Arc::clone(&self.events[event_id]);
            let current = event.trigger(t, state, parameters);
            if current == self.trigger_state[event_id] {
                continue;
            }
            let delay = event.delay(t, state, parameters);
            if delay <= 0.0 {
                trace!(event_id, t, "trigger edge scheduled for immediate execution");
                self.trigger_pool.insert(event_id);
                firing.push((event_id, event.get_execution(t, state, parameters)));
            } else if event.is_persistent() {
                trace!(event_id, t, delay, "trigger edge scheduled on delay queue");
                self.trigger_pool.insert(event_id);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.delay_queue.push(DelayedExecution {
                    seq,
                    event_id,
                    execution: event.get_execution(t + delay, state, parameters),
                });
            } else if let Some(position) = self
                .volatile_queue
                .iter()
                .position(|(queued, _)| *queued == event_id)
            {
                self.volatile_queue.remove(position);
                self.trigger_pool.remove(&event_id);
                self.trigger_state[event_id] = current;
                debug!(event_id, t, "volatile execution cancelled by opposing trigger edge");
            } else {
                trace!(event_id, t, delay, "trigger edge scheduled on volatile queue");
                self.trigger_pool.insert(event_id);
                self.volatile_queue
                    .push_back((event_id, event.get_execution(t + delay, state, parameters)));
            }
        }

        // Volatile executions whose time has come.
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .volatile_queue
            .drain(..)
            .partition(|(_, execution)| is_due(execution.execution_time(), t));
        self.volatile_queue = waiting;
        firing.extend(ready);

        // Persistent executions, in chronological order.
        while self
            .delay_queue
            .peek()
            .is_some_and(|head| is_due(head.execution.execution_time(), t))
        {
            if let Some(entry) = self.delay_queue.pop() {
                firing.push((entry.event_id, entry.execution));
            }
        }

        // Drain by priority against the state as it evolves.
        while !firing.is_empty() {
            let next = highest_priority(&firing, t, state, parameters);
            let (event_id, execution) = firing.remove(next);
            execution.execute(t, state, parameters);
            self.executed += 1;
            trace!(event_id, t, "event executed");
            if !self.has_outstanding(event_id, &firing) {
                self.trigger_pool.remove(&event_id);
            }
        }

        // Refresh triggers so assignments that flip predicates are absorbed
        // before the next edge detection.
        for (event_id, event) in self.events.iter().enumerate() {
            self.trigger_state[event_id] = event.trigger(t, state, parameters);
        }
        self.reconcile_trigger_pool();

        Ok(self.has_active_events())
    }

    fn has_outstanding(&self, event_id: EventId, firing: &[(EventId, EventExecution)]) -> bool {
        firing.iter().any(|(queued, _)| *queued == event_id)
            || self.volatile_queue.iter().any(|(queued, _)| *queued == event_id)
            || self.delay_queue.iter().any(|entry| entry.event_id == event_id)
    }

    fn reconcile_trigger_pool(&mut self) {
        let volatile = &self.volatile_queue;
        let delayed = &self.delay_queue;
        self.trigger_pool.retain(|event_id| {
            volatile.iter().any(|(queued, _)| queued == event_id)
                || delayed.iter().any(|entry| entry.event_id == *event_id)
        });
    }

    fn unknown_event(&self, event_id: EventId) -> SimError {
        SimError::NotFound(format!(
            "event id {} ({} events configured)",
            event_id,
            self.events.len()
        ))
    }
}

/// Index of the execution to fire next: highest priority, earliest
/// insertion among equals. NaN priorities rank last.
fn highest_priority(
    firing: &[(EventId, EventExecution)],
    t: f64,
    state: &[f64],
    parameters: &[f64],
) -> usize {
    let mut best = 0;
    let mut best_priority = f64::NEG_INFINITY;
    for (idx, (_, execution)) in firing.iter().enumerate() {
        let priority = execution.priority(t, state, parameters);
        let priority = if priority.is_nan() { f64::NEG_INFINITY } else { priority };
        if idx == 0 || priority > best_priority {
            best = idx;
            best_priority = priority;
        }
    }
    best
}
