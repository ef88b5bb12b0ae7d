use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::clock::{Clock, SystemClock};
use crate::error::{CallbackFailure, JobOutput, TickError};
use crate::phase::{Phase, TickType};
use crate::queue::{EventQueue, GeneralQueue, ProcessQueue, job, job_with};
use crate::ration::{RationAccountant, RationConfig, RationConfigUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    /// A tick was interrupted and will be resumed by the next `fire_tick`.
    Suspended,
}

/// Where inside the current phase a suspended tick stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Main,
    PostPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every phase of the tick was drained.
    Completed,
    /// Pressure went critical; the tick stopped between two callbacks.
    Suspended,
    /// Still paused from an earlier tick; nothing ran.
    Throttled,
}

enum Drain {
    Emptied,
    Yielded,
    Aborted,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickStats {
    pub current_phase: Option<Phase>,
    /// When the running event callback was queued. Only set while an
    /// `events` callback executes.
    pub current_queued_at: Option<f64>,
    pub current_tick_type: Option<TickType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCycleStats {
    pub cycle_id: i64,
    /// Runtime used within the current cycle, in ms.
    pub cycle_runtime_used: f64,
    pub is_paused: bool,
    /// Pressure at the time of the snapshot.
    pub pressure: f64,
}

/// The phase queue scheduler.
///
/// Work is queued onto phases and executed by [`fire_tick`], which the host
/// calls from its own callbacks. Each callback's runtime is charged to the
/// current ration cycle; once pressure turns critical the tick is suspended
/// between two callbacks and picked up again by a later `fire_tick`.
///
/// The scheduler is single-threaded. Callbacks usually hold an
/// `Rc<TickScheduler>` so they can queue more work while a tick runs.
///
/// [`fire_tick`]: TickScheduler::fire_tick
pub struct TickScheduler {
    queues: [Box<dyn ProcessQueue>; Phase::COUNT],
    clock: Rc<dyn Clock>,
    ration: RefCell<RationAccountant>,
    state: Cell<EngineState>,
    phase_stack: RefCell<SmallVec<[Phase; 2]>>,
    stage: Cell<Stage>,
    current_phase: Cell<Option<Phase>>,
    current_tick_type: Cell<Option<TickType>>,
    current_queued_at: Cell<Option<f64>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self::build(clock, RationConfig::default())
    }

    /// Builds a scheduler whose launch time is the clock's current time.
    /// Fails if `config` does not pass [`RationConfig::validate`].
    pub fn with_config(
        clock: impl Clock + 'static,
        config: RationConfig,
    ) -> Result<Self, TickError> {
        config.validate()?;
        Ok(Self::build(clock, config))
    }

    fn build(clock: impl Clock + 'static, config: RationConfig) -> Self {
        let clock: Rc<dyn Clock> = Rc::new(clock);
        let launch_time = clock.now();
        Self {
            queues: [
                Box::new(GeneralQueue::new()),
                Box::new(GeneralQueue::new()),
                Box::new(EventQueue::new(clock.clone())),
                Box::new(GeneralQueue::new()),
                Box::new(GeneralQueue::new()),
            ],
            ration: RefCell::new(RationAccountant::new(config, launch_time)),
            clock,
            state: Cell::new(EngineState::Idle),
            phase_stack: RefCell::new(SmallVec::new()),
            stage: Cell::new(Stage::Main),
            current_phase: Cell::new(None),
            current_tick_type: Cell::new(None),
            current_queued_at: Cell::new(None),
        }
    }

    /// Queues `callback` onto `phase`. Prefer [`post_phase`](Self::post_phase)
    /// or [`defer`](Self::defer) unless you know which phase you need.
    pub fn queue<F, R>(&self, phase: Phase, callback: F)
    where
        F: FnOnce() -> R + 'static,
        R: JobOutput,
    {
        self.queues[phase.index()].enqueue(job(callback));
    }

    /// Queues `callback`, to be called with `args`, onto `phase`.
    pub fn enqueue_with<A, F, R>(&self, phase: Phase, callback: F, args: A)
    where
        A: 'static,
        F: FnOnce(A) -> R + 'static,
        R: JobOutput,
    {
        self.queues[phase.index()].enqueue(job_with(callback, args));
    }

    /// Like [`queue`](Self::queue), with the phase given by name.
    pub fn queue_named<F, R>(&self, phase: &str, callback: F) -> Result<(), TickError>
    where
        F: FnOnce() -> R + 'static,
        R: JobOutput,
    {
        let phase = phase.parse::<Phase>()?;
        self.queue(phase, callback);
        Ok(())
    }

    /// Queues `callback` to run right after the current phase's own queue.
    ///
    /// Similar to Node's `process.nextTick`.
    pub fn post_phase<F, R>(&self, callback: F)
    where
        F: FnOnce() -> R + 'static,
        R: JobOutput,
    {
        self.queue(Phase::PostPhase, callback);
    }

    /// Wraps `callback` so that calling the wrapper queues it onto the
    /// deferrables phase instead of running it.
    ///
    /// Deferred callbacks run during `loop` ticks and are the first work to
    /// be postponed under pressure, so they should not expect to run soon.
    pub fn defer<A, F, R>(self: &Rc<Self>, callback: F) -> impl Fn(A) + 'static
    where
        A: 'static,
        F: Fn(A) -> R + 'static,
        R: JobOutput,
    {
        let scheduler = Rc::clone(self);
        let callback = Rc::new(callback);
        move |args: A| {
            let callback = Rc::clone(&callback);
            scheduler.enqueue_with(Phase::Deferrables, move |args| callback(args), args);
        }
    }

    pub fn pending(&self, phase: Phase) -> usize {
        self.queues[phase.index()].len()
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.get() == EngineState::Suspended
    }

    pub fn launch_time(&self) -> f64 {
        self.ration.borrow().launch_time()
    }

    /// Like [`fire_tick`](Self::fire_tick), with the tick type given by name.
    pub fn fire_tick_named(&self, tick: &str) -> Result<TickOutcome, TickError> {
        let tick = tick.parse::<TickType>()?;
        self.fire_tick(tick)
    }

    /// Runs a tick of type `tick`.
    ///
    /// If an earlier tick was suspended, that tick is resumed instead and
    /// `tick` is ignored; if pressure is still critical nothing runs.
    ///
    /// Callbacks that return an error stop the queue they were drained from.
    /// The post-phase queue and the remaining phases still run, and all the
    /// errors are returned once the tick finishes or suspends.
    pub fn fire_tick(&self, tick: TickType) -> Result<TickOutcome, TickError> {
        match self.state.get() {
            EngineState::Running => return Err(TickError::Reentrant),
            EngineState::Suspended => {
                self.runtime_check();
                if self.ration.borrow().is_paused() {
                    tracing::debug!(requested = %tick, "tick throttled");
                    return Ok(TickOutcome::Throttled);
                }
                tracing::debug!(
                    requested = %tick,
                    resumed = ?self.current_tick_type.get(),
                    "resuming suspended tick"
                );
            }
            EngineState::Idle => {
                self.current_tick_type.set(Some(tick));
                *self.phase_stack.borrow_mut() = tick.sequence().iter().rev().copied().collect();
                self.stage.set(Stage::Main);
                tracing::debug!(tick = %tick, "tick started");
            }
        }

        self.state.set(EngineState::Running);
        let guard = RunGuard(self);
        let mut failures = Vec::new();
        let outcome = self.run(&mut failures);
        std::mem::forget(guard);

        if failures.is_empty() {
            Ok(outcome)
        } else {
            Err(TickError::Callbacks { outcome, failures })
        }
    }

    fn run(&self, failures: &mut Vec<CallbackFailure>) -> TickOutcome {
        loop {
            let top = self.phase_stack.borrow().last().copied();
            let Some(phase) = top else {
                self.state.set(EngineState::Idle);
                tracing::debug!(tick = ?self.current_tick_type.get(), "tick completed");
                return TickOutcome::Completed;
            };
            self.current_phase.set(Some(phase));

            match self.stage.get() {
                Stage::Main => {
                    self.runtime_check();
                    if self.ration.borrow().is_paused() {
                        return self.suspend(phase);
                    }

                    let yield_early = |pressure: f64| {
                        phase == Phase::Deferrables
                            && pressure > self.ration.borrow().config().ration_level_medium
                    };
                    if let Drain::Paused = self.drain(phase, yield_early, failures) {
                        return self.suspend(phase);
                    }
                    self.stage.set(Stage::PostPhase);
                }
                Stage::PostPhase => {
                    // An aborted drain may have left us paused.
                    if self.ration.borrow().is_paused() {
                        return self.suspend(phase);
                    }
                    if let Drain::Paused = self.drain(Phase::PostPhase, |_| false, failures) {
                        return self.suspend(phase);
                    }
                    self.phase_stack.borrow_mut().pop();
                    self.stage.set(Stage::Main);
                }
            }
        }
    }

    /// Dequeues from `phase` one callback at a time, charging each one's
    /// runtime, until the queue is empty or something stops it.
    fn drain(
        &self,
        phase: Phase,
        yield_early: impl Fn(f64) -> bool,
        failures: &mut Vec<CallbackFailure>,
    ) -> Drain {
        let queue = &self.queues[phase.index()];
        loop {
            let start = self.clock.now();
            let Some(result) = queue.dequeue(&self.current_queued_at) else {
                return Drain::Emptied;
            };
            self.ration.borrow_mut().record(self.clock.now() - start);
            let pressure = self.runtime_check();

            if let Err(error) = result {
                tracing::error!(%phase, %error, "callback failed");
                failures.push(CallbackFailure { phase, error });
                return Drain::Aborted;
            }
            if self.ration.borrow().is_paused() {
                return Drain::Paused;
            }
            if yield_early(pressure) {
                tracing::debug!(%phase, pressure, "yielding to later ticks");
                return Drain::Yielded;
            }
        }
    }

    fn suspend(&self, phase: Phase) -> TickOutcome {
        self.state.set(EngineState::Suspended);
        tracing::debug!(
            %phase,
            stage = ?self.stage.get(),
            remaining = self.pending(phase),
            "tick suspended"
        );
        TickOutcome::Suspended
    }

    fn runtime_check(&self) -> f64 {
        let now = self.clock.now();
        self.ration.borrow_mut().check(now)
    }

    pub fn tick_stats(&self) -> TickStats {
        TickStats {
            current_phase: self.current_phase.get(),
            current_queued_at: self.current_queued_at.get(),
            current_tick_type: self.current_tick_type.get(),
        }
    }

    pub fn runtime_cycle_stats(&self) -> RuntimeCycleStats {
        let state = self.ration.borrow().state();
        RuntimeCycleStats {
            cycle_id: state.cycle_id,
            cycle_runtime_used: state.cycle_runtime_used,
            is_paused: state.is_paused,
            pressure: self.calculate_ration_pressure(),
        }
    }

    /// Current ration pressure. Does not roll the cycle or change the pause
    /// state.
    pub fn calculate_ration_pressure(&self) -> f64 {
        let ration = self.ration.borrow();
        ration.pressure_at(ration.time_since_launch(self.clock.now()))
    }

    pub fn process_queue_opts(&self) -> RationConfig {
        self.ration.borrow().config()
    }

    /// Merges `update` into the options. Nothing changes if any supplied
    /// value is invalid.
    pub fn set_process_queue_opts(&self, update: RationConfigUpdate) -> Result<(), TickError> {
        self.ration.borrow_mut().config_mut().merge(update)?;
        tracing::debug!(?update, "process queue options updated");
        Ok(())
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Leaves the engine resumable when a callback panics out of `fire_tick`:
/// the interrupted tick continues on the next call.
struct RunGuard<'a>(&'a TickScheduler);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.current_queued_at.set(None);
        self.0.state.set(EngineState::Suspended);
    }
}
