use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub type EventId = usize;

/// View handed to an event assignment.
///
/// Writes go to the live buffers. Reads go through [`EventOutput::species`]
/// and [`EventOutput::variables`], which resolve to the trigger-time snapshot
/// when the execution carries one and to the live buffers otherwise.
pub struct EventOutput<'a> {
    pub species_out: &'a mut [f64],
    pub variable_out: &'a mut [f64],
    snapshot: Option<(&'a [f64], &'a [f64])>,
}

impl<'a> EventOutput<'a> {
    pub fn live(species_out: &'a mut [f64], variable_out: &'a mut [f64]) -> Self {
        Self {
            species_out,
            variable_out,
            snapshot: None,
        }
    }

    pub fn from_snapshot(
        species_out: &'a mut [f64],
        variable_out: &'a mut [f64],
        species: &'a [f64],
        variables: &'a [f64],
    ) -> Self {
        Self {
            species_out,
            variable_out,
            snapshot: Some((species, variables)),
        }
    }

    pub fn species(&self) -> &[f64] {
        match self.snapshot {
            Some((species, _)) => species,
            None => &self.species_out[..],
        }
    }

    pub fn variables(&self) -> &[f64] {
        match self.snapshot {
            Some((_, variables)) => variables,
            None => &self.variable_out[..],
        }
    }
}

/// Behaviour of a single event: when it triggers, how long it waits, how it
/// ranks against simultaneous firings and what it writes.
pub trait EventBehavior: Send + Sync {
    fn trigger(&self, t: f64, state: &[f64], parameters: &[f64]) -> bool;

    fn delay(&self, _t: f64, _state: &[f64], _parameters: &[f64]) -> f64 {
        0.0
    }

    fn priority(&self, _t: f64, _state: &[f64], _parameters: &[f64]) -> f64 {
        0.0
    }

    fn assign(&self, t: f64, output: &mut EventOutput<'_>);
}

type TriggerFn = dyn Fn(f64, &[f64], &[f64]) -> bool + Send + Sync;
type ScalarFn = dyn Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync;
type AssignFn = dyn Fn(f64, &mut EventOutput<'_>) + Send + Sync;

pub struct EventFunctions {
    trigger: Box<TriggerFn>,
    delay: Option<Box<ScalarFn>>,
    priority: Option<Box<ScalarFn>>,
    assign: Box<AssignFn>,
}

impl EventFunctions {
    pub fn new<T, A>(trigger: T, assign: A) -> Self
    where
        T: Fn(f64, &[f64], &[f64]) -> bool + Send + Sync + 'static,
        A: Fn(f64, &mut EventOutput<'_>) + Send + Sync + 'static,
    {
        Self {
            trigger: Box::new(trigger),
            delay: None,
            priority: None,
            assign: Box::new(assign),
        }
    }

    pub fn with_delay<D>(mut self, delay: D) -> Self
    where
        D: Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn with_constant_delay(self, delay: f64) -> Self {
        self.with_delay(move |_, _, _| delay)
    }

    pub fn with_priority<P>(mut self, priority: P) -> Self
    where
        P: Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.priority = Some(Box::new(priority));
        self
    }
}

impl EventBehavior for EventFunctions {
    fn trigger(&self, t: f64, state: &[f64], parameters: &[f64]) -> bool {
        (self.trigger)(t, state, parameters)
    }

    fn delay(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self.delay.as_ref().map_or(0.0, |delay| delay(t, state, parameters))
    }

    fn priority(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self.priority
            .as_ref()
            .map_or(0.0, |priority| priority(t, state, parameters))
    }

    fn assign(&self, t: f64, output: &mut EventOutput<'_>) {
        (self.assign)(t, output)
    }
}

/// Immutable descriptor of one event, shared by every execution it spawns.
#[derive(Clone)]
pub struct EventStatus {
    id: EventId,
    behavior: Arc<dyn EventBehavior>,
    use_trigger_state: bool,
    use_persist: bool,
}

impl EventStatus {
    pub fn new(id: EventId, behavior: impl EventBehavior + 'static) -> Self {
        Self {
            id,
            behavior: Arc::new(behavior),
            use_trigger_state: false,
            use_persist: false,
        }
    }

    /// Snapshot state and parameters when the trigger fires so a delayed
    /// assignment reads trigger-time values.
    pub fn with_trigger_state(mut self, use_trigger_state: bool) -> Self {
        self.use_trigger_state = use_trigger_state;
        self
    }

    pub fn with_persistence(mut self, use_persist: bool) -> Self {
        self.use_persist = use_persist;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn uses_trigger_state(&self) -> bool {
        self.use_trigger_state
    }

    pub fn is_persistent(&self) -> bool {
        self.use_persist
    }

    #[inline]
    pub fn trigger(&self, t: f64, state: &[f64], parameters: &[f64]) -> bool {
        self.behavior.trigger(t, state, parameters)
    }

    #[inline]
    pub fn delay(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self.behavior.delay(t, state, parameters)
    }

    #[inline]
    pub fn priority(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self.behavior.priority(t, state, parameters)
    }

    #[inline]
    pub fn assign(&self, t: f64, output: &mut EventOutput<'_>) {
        self.behavior.assign(t, output)
    }

    /// Trigger value at the start of the run, used to seed edge detection so
    /// nothing counts as having just triggered at t0.
    pub fn initial_value(&self, t0: f64, state: &[f64], parameters: &[f64]) -> bool {
        self.trigger(t0, state, parameters)
    }

    pub fn get_execution(
        self: &Arc<Self>,
        execution_time: f64,
        state: &[f64],
        parameters: &[f64],
    ) -> EventExecution {
        if self.use_trigger_state {
            EventExecution::with_snapshot(Arc::clone(self), execution_time, state, parameters)
        } else {
            EventExecution::new(Arc::clone(self), execution_time)
        }
    }
}

impl fmt::Debug for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStatus")
            .field("id", &self.id)
            .field("use_trigger_state", &self.use_trigger_state)
            .field("use_persist", &self.use_persist)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq)]
struct Snapshot {
    state: Box<[f64]>,
    variables: Box<[f64]>,
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            variables: self.variables.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.state.len() == source.state.len() {
            self.state.copy_from_slice(&source.state);
        } else {
            self.state = source.state.clone();
        }
        if self.variables.len() == source.variables.len() {
            self.variables.copy_from_slice(&source.variables);
        } else {
            self.variables = source.variables.clone();
        }
    }
}

#[derive(Debug)]
pub struct EventExecution {
    event: Arc<EventStatus>,
    execution_time: f64,
    snapshot: Option<Snapshot>,
    assignments: Vec<Arc<EventStatus>>,
}

impl EventExecution {
    fn new(event: Arc<EventStatus>, execution_time: f64) -> Self {
        let assignments = vec![Arc::clone(&event)];
        Self {
            event,
            execution_time,
            snapshot: None,
            assignments,
        }
    }

    fn with_snapshot(
        event: Arc<EventStatus>,
        execution_time: f64,
        state: &[f64],
        variables: &[f64],
    ) -> Self {
        let mut execution = Self::new(event, execution_time);
        execution.snapshot = Some(Snapshot {
            state: state.into(),
            variables: variables.into(),
        });
        execution
    }

    pub fn event(&self) -> &Arc<EventStatus> {
        &self.event
    }

    pub fn event_id(&self) -> EventId {
        self.event.id()
    }

    pub fn execution_time(&self) -> f64 {
        self.execution_time
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn snapshot_state(&self) -> Option<&[f64]> {
        self.snapshot.as_ref().map(|snapshot| &*snapshot.state)
    }

    /// Batches another event's assignment into this execution; chained
    /// assignments run in order after this execution's own.
    pub fn chain(&mut self, other: &EventExecution) {
        self.assignments.extend(other.assignments.iter().cloned());
    }

    #[inline]
    pub fn priority(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self.event.priority(t, state, parameters)
    }

    #[inline]
    pub fn trigger(&self, t: f64, state: &[f64], parameters: &[f64]) -> bool {
        self.event.trigger(t, state, parameters)
    }

    pub fn execute_with(&self, t: f64, output: &mut EventOutput<'_>) {
        for assignment in &self.assignments {
            assignment.assign(t, output);
        }
    }

    pub fn execute(&self, t: f64, state: &mut [f64], parameters: &mut [f64]) {
        let mut output = match &self.snapshot {
            Some(snapshot) => {
                EventOutput::from_snapshot(state, parameters, &snapshot.state, &snapshot.variables)
            }
            None => EventOutput::live(state, parameters),
        };
        self.execute_with(t, &mut output);
    }
}

impl Clone for EventExecution {
    fn clone(&self) -> Self {
        Self {
            event: Arc::clone(&self.event),
            execution_time: self.execution_time,
            snapshot: self.snapshot.clone(),
            assignments: self.assignments.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.event = Arc::clone(&source.event);
        self.execution_time = source.execution_time;
        self.assignments.clone_from(&source.assignments);
        match (&mut self.snapshot, &source.snapshot) {
            (Some(own), Some(theirs)) => own.clone_from(theirs),
            (own, theirs) => *own = theirs.clone(),
        }
    }
}

impl PartialEq for EventExecution {
    fn eq(&self, other: &Self) -> bool {
        self.execution_time == other.execution_time
    }
}

impl PartialOrd for EventExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.execution_time.partial_cmp(&other.execution_time)
    }
}
