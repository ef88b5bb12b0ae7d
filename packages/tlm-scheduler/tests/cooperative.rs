//! Budget accounting, suspension and resumption.
//!
//! Every test launches the scheduler at t = 0 and starts work at t = 2150 ms,
//! so the cycle (4000 ms, shifted by the 150 ms launch offset) has 2000 ms
//! left and the time component of the pressure is about 10. Jobs advance the
//! manual clock by their cost.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tlm_scheduler::{
    EngineState, ManualClock, Phase, RationConfig, RationConfigUpdate, TickError, TickOutcome,
    TickScheduler, TickType,
};

type Log = Rc<RefCell<Vec<&'static str>>>;

struct Harness {
    clock: ManualClock,
    scheduler: Rc<TickScheduler>,
    log: Log,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(0.0);
        let scheduler = Rc::new(TickScheduler::with_clock(clock.clone()));
        clock.set(2150.0);
        Self {
            clock,
            scheduler,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn timed(&self, phase: Phase, name: &'static str, cost: f64) {
        let log = self.log.clone();
        let clock = self.clock.clone();
        self.scheduler.queue(phase, move || {
            clock.advance(cost);
            log.borrow_mut().push(name);
        });
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.borrow().clone()
    }
}

#[test]
fn test_scheduler_yielding() {
    let h = Harness::new();
    assert_eq!(h.scheduler.state(), EngineState::Idle);

    // 20 ms each: pressure is ~37 after A, ~73 after B and ~105 after C.
    for name in ["A", "B", "C"] {
        h.timed(Phase::Events, name, 20.0);
    }
    h.timed(Phase::Events, "D", 1.0);
    h.timed(Phase::Events, "E", 1.0);
    h.timed(Phase::Close, "close", 0.0);
    h.timed(Phase::Timers, "timer", 0.0);

    assert_eq!(
        h.scheduler.fire_tick(TickType::Event).unwrap(),
        TickOutcome::Suspended
    );
    assert_eq!(h.log(), vec!["A", "B", "C"]);
    assert!(h.scheduler.is_suspended());
    assert!(h.scheduler.runtime_cycle_stats().is_paused);
    assert_eq!(h.scheduler.tick_stats().current_phase, Some(Phase::Events));
    assert_eq!(h.scheduler.pending(Phase::Events), 2);

    // Same cycle: still critical, nothing runs.
    h.clock.advance(50.0);
    assert_eq!(
        h.scheduler.fire_tick(TickType::Timer).unwrap(),
        TickOutcome::Throttled
    );
    assert_eq!(h.log(), vec!["A", "B", "C"]);

    // Next cycle: the interrupted event tick finishes, the timer request is ignored.
    h.clock.set(4200.0);
    assert_eq!(
        h.scheduler.fire_tick(TickType::Timer).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["A", "B", "C", "D", "E", "close"]);
    assert_eq!(h.scheduler.tick_stats().current_tick_type, Some(TickType::Event));
    assert_eq!(h.scheduler.pending(Phase::Timers), 1);
    assert_eq!(h.scheduler.state(), EngineState::Idle);

    h.scheduler.fire_tick(TickType::Timer).unwrap();
    assert_eq!(h.log().last(), Some(&"timer"));
}

#[test]
fn test_suspension_inside_post_phase_resumes_there() {
    let h = Harness::new();
    {
        let log = h.log.clone();
        let clock = h.clock.clone();
        let sch = h.scheduler.clone();
        h.scheduler.queue(Phase::Events, move || {
            clock.advance(10.0);
            log.borrow_mut().push("X");
            for name in ["P1", "P2", "P3"] {
                let log = log.clone();
                let clock = clock.clone();
                sch.post_phase(move || {
                    clock.advance(20.0);
                    log.borrow_mut().push(name);
                });
            }
        });
    }
    h.timed(Phase::Close, "close", 0.0);

    // X + P1 + P2 = 50 ms, pressure ~89.
    assert_eq!(
        h.scheduler.fire_tick(TickType::Event).unwrap(),
        TickOutcome::Suspended
    );
    assert_eq!(h.log(), vec!["X", "P1", "P2"]);
    assert_eq!(h.scheduler.pending(Phase::PostPhase), 1);

    h.timed(Phase::Events, "late event", 0.0);
    h.clock.set(4200.0);
    assert_eq!(
        h.scheduler.fire_tick(TickType::Loop).unwrap(),
        TickOutcome::Completed
    );
    // The events queue is not revisited once its post-phase drain started.
    assert_eq!(h.log(), vec!["X", "P1", "P2", "P3", "close"]);
    assert_eq!(h.scheduler.pending(Phase::Events), 1);
}

#[test]
fn test_deferrables_yield_at_medium_pressure() {
    let h = Harness::new();
    for name in ["D1", "D2", "D3"] {
        h.timed(Phase::Deferrables, name, 20.0);
    }
    h.timed(Phase::Close, "close", 0.0);

    // After D2 pressure is ~73: over medium (60), under critical (80).
    assert_eq!(
        h.scheduler.fire_tick(TickType::Loop).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["D1", "D2", "close"]);
    assert_eq!(h.scheduler.pending(Phase::Deferrables), 1);
    assert!(!h.scheduler.runtime_cycle_stats().is_paused);

    // The yielded item is still queued and runs on the next loop tick of a
    // fresh cycle.
    h.clock.set(4200.0);
    assert_eq!(
        h.scheduler.fire_tick(TickType::Loop).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["D1", "D2", "close", "D3"]);
    assert_eq!(h.scheduler.pending(Phase::Deferrables), 0);
}

#[test]
fn test_runtime_use_is_the_sum_of_measured_callbacks() {
    let h = Harness::new();
    h.timed(Phase::Timers, "a", 5.0);
    h.timed(Phase::Timers, "b", 7.0);
    h.timed(Phase::PostPhase, "c", 11.0);

    h.scheduler.fire_tick(TickType::Timer).unwrap();

    let stats = h.scheduler.runtime_cycle_stats();
    assert_eq!(stats.cycle_id, 0);
    assert_eq!(stats.cycle_runtime_used, 23.0);

    // Idle time between ticks is not charged.
    h.clock.advance(500.0);
    h.timed(Phase::Timers, "d", 2.0);
    h.scheduler.fire_tick(TickType::Timer).unwrap();
    assert_eq!(h.scheduler.runtime_cycle_stats().cycle_runtime_used, 25.0);

    // A new cycle starts from zero.
    h.clock.set(4200.0);
    h.scheduler.fire_tick(TickType::Timer).unwrap();
    let stats = h.scheduler.runtime_cycle_stats();
    assert_eq!(stats.cycle_id, 1);
    assert_eq!(stats.cycle_runtime_used, 0.0);
}

#[test]
fn test_pressure_snapshot_has_no_side_effects() {
    let h = Harness::new();
    h.timed(Phase::Timers, "a", 30.0);
    h.scheduler.fire_tick(TickType::Timer).unwrap();

    h.clock.set(4200.0);
    let before = h.scheduler.runtime_cycle_stats();
    assert_eq!(before.cycle_id, 0);
    assert_eq!(before.cycle_runtime_used, 30.0);
    // 50% usage weighs 80; 3950 ms left of the cycle adds 19.75.
    assert!((h.scheduler.calculate_ration_pressure() - 59.75).abs() < 1e-9);
    assert_eq!(h.scheduler.runtime_cycle_stats().cycle_runtime_used, 30.0);
}

#[test]
fn test_options_setter_merges_partial_updates() {
    let h = Harness::new();
    h.scheduler
        .set_process_queue_opts(RationConfigUpdate {
            runtime_limit: Some(1000.0),
            ..Default::default()
        })
        .unwrap();
    let opts = h.scheduler.process_queue_opts();
    assert_eq!(opts.runtime_limit, 1000.0);
    assert_eq!(opts.cycle_duration, 4000.0);
    assert_eq!(opts.ration_level_medium, 60.0);
    assert_eq!(opts.ration_level_critical, 80.0);

    // With the larger limit the same work no longer suspends.
    for name in ["A", "B", "C", "D"] {
        h.timed(Phase::Events, name, 20.0);
    }
    assert_eq!(
        h.scheduler.fire_tick(TickType::Event).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["A", "B", "C", "D"]);
}

#[test]
fn test_options_setter_rejects_invalid_values() {
    let h = Harness::new();
    let err = h
        .scheduler
        .set_process_queue_opts(RationConfigUpdate {
            runtime_limit: Some(1000.0),
            cycle_duration: Some(0.0),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(
        err,
        TickError::InvalidOption { name: "cycleDuration", value } if value == 0.0
    ));
    // Nothing was applied, not even the valid field.
    assert_eq!(h.scheduler.process_queue_opts(), RationConfig::default());

    for update in [
        RationConfigUpdate {
            runtime_limit: Some(0.0),
            ..Default::default()
        },
        RationConfigUpdate {
            cycle_duration: Some(-4000.0),
            ..Default::default()
        },
        RationConfigUpdate {
            ration_level_medium: Some(f64::NAN),
            ..Default::default()
        },
    ] {
        assert!(h.scheduler.set_process_queue_opts(update).is_err());
    }
    assert_eq!(h.scheduler.process_queue_opts(), RationConfig::default());

    // The budget still applies after the rejected updates.
    for _ in 0..20 {
        h.timed(Phase::Events, "work", 20.0);
    }
    assert_eq!(
        h.scheduler.fire_tick(TickType::Event).unwrap(),
        TickOutcome::Suspended
    );
    assert_eq!(h.log().len(), 3);
    assert!(h.scheduler.calculate_ration_pressure().is_finite());

    let config = RationConfig {
        runtime_limit: 0.0,
        ..RationConfig::default()
    };
    assert!(matches!(
        TickScheduler::with_config(ManualClock::new(0.0), config),
        Err(TickError::InvalidOption { name: "runtimeLimit", .. })
    ));
}

#[test]
fn test_failed_callback_aborts_its_phase_only() {
    let h = Harness::new();
    {
        let log = h.log.clone();
        let sch = h.scheduler.clone();
        h.scheduler.queue(Phase::Events, move || {
            log.borrow_mut().push("A");
            let log = log.clone();
            sch.post_phase(move || log.borrow_mut().push("post"));
        });
    }
    {
        let log = h.log.clone();
        h.scheduler.queue(Phase::Events, move || -> Result<(), String> {
            log.borrow_mut().push("B");
            Err("boom".to_string())
        });
    }
    h.timed(Phase::Events, "C", 0.0);
    h.timed(Phase::Close, "close", 0.0);

    let err = h.scheduler.fire_tick(TickType::Event).unwrap_err();
    match err {
        TickError::Callbacks { outcome, failures } => {
            assert_eq!(outcome, TickOutcome::Completed);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].phase, Phase::Events);
            assert_eq!(failures[0].to_string(), "events callback failed: boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.log(), vec!["A", "B", "post", "close"]);
    assert_eq!(h.scheduler.state(), EngineState::Idle);
    assert_eq!(h.scheduler.pending(Phase::Events), 1);

    h.scheduler.fire_tick(TickType::Event).unwrap();
    assert_eq!(h.log().last(), Some(&"C"));
}

#[test]
fn test_failed_callback_reports_suspension() {
    let h = Harness::new();
    {
        let log = h.log.clone();
        h.scheduler.queue(Phase::Events, move || -> Result<(), String> {
            log.borrow_mut().push("A");
            Err("boom".to_string())
        });
    }
    // Post-phase work pushes the pressure past critical after P2.
    h.timed(Phase::PostPhase, "P1", 30.0);
    h.timed(Phase::PostPhase, "P2", 30.0);
    h.timed(Phase::PostPhase, "P3", 0.0);
    h.timed(Phase::Close, "close", 0.0);

    match h.scheduler.fire_tick(TickType::Event).unwrap_err() {
        TickError::Callbacks { outcome, failures } => {
            assert_eq!(outcome, TickOutcome::Suspended);
            assert_eq!(failures.len(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.scheduler.is_suspended());
    assert_eq!(h.log(), vec!["A", "P1", "P2"]);
    assert_eq!(h.scheduler.pending(Phase::PostPhase), 1);

    h.clock.set(4200.0);
    assert_eq!(
        h.scheduler.fire_tick(TickType::Loop).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["A", "P1", "P2", "P3", "close"]);
}

#[test]
fn test_panicking_callback_leaves_tick_resumable() {
    let h = Harness::new();
    h.timed(Phase::Events, "A", 0.0);
    h.scheduler
        .queue(Phase::Events, || -> Result<(), String> { panic!("callback exploded") });
    h.timed(Phase::Events, "C", 0.0);
    h.timed(Phase::Close, "close", 0.0);

    let scheduler = h.scheduler.clone();
    let result = catch_unwind(AssertUnwindSafe(|| scheduler.fire_tick(TickType::Event)));
    assert!(result.is_err());
    assert_eq!(h.scheduler.state(), EngineState::Suspended);

    assert_eq!(
        h.scheduler.fire_tick(TickType::Loop).unwrap(),
        TickOutcome::Completed
    );
    assert_eq!(h.log(), vec!["A", "C", "close"]);
}

#[test]
fn test_fire_tick_from_a_callback_is_rejected() {
    let h = Harness::new();
    let nested = Rc::new(RefCell::new(None));
    {
        let sch = h.scheduler.clone();
        let nested = nested.clone();
        h.scheduler.queue(Phase::Timers, move || {
            *nested.borrow_mut() = Some(sch.fire_tick(TickType::Loop));
        });
    }

    h.scheduler.fire_tick(TickType::Timer).unwrap();

    assert!(matches!(
        nested.borrow().as_ref(),
        Some(Err(TickError::Reentrant))
    ));
}
