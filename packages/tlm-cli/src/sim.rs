//! Host simulator.
//!
//! Each host invocation mimics a script environment calling back into the
//! script: a batch of player events is emitted and handled on the `events`
//! phase, then the event loop callback fires a `loop` tick that works
//! through deferred bookkeeping.

use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use tlm_events::EventEmitter;
use tlm_scheduler::{
    ManualClock, Phase, Promise, RationConfig, RationConfigUpdate, SystemClock, TickError,
    TickOutcome, TickScheduler, TickType,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of host invocations to simulate
    #[arg(long, default_value_t = 20)]
    pub ticks: u32,
    /// Time between host invocations
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,
    /// Player events emitted per invocation
    #[arg(long, default_value_t = 4)]
    pub events: u32,
    /// Runtime each event handler burns
    #[arg(long, default_value_t = 3.0)]
    pub work_ms: f64,
    #[arg(long)]
    pub cycle_duration: Option<f64>,
    #[arg(long)]
    pub runtime_limit: Option<f64>,
    #[arg(long)]
    pub medium: Option<f64>,
    #[arg(long)]
    pub critical: Option<f64>,
    /// Use a simulated clock instead of burning real time
    #[arg(long = "virtual")]
    pub virtual_clock: bool,
}

/// How simulated runtime and idle time are spent.
#[derive(Clone)]
enum Host {
    Virtual(ManualClock),
    Real,
}

impl Host {
    fn burn(&self, ms: f64) {
        match self {
            Host::Virtual(clock) => clock.advance(ms),
            Host::Real => {
                let budget = Duration::from_secs_f64(ms / 1000.0);
                let start = Instant::now();
                while start.elapsed() < budget {
                    std::hint::spin_loop();
                }
            }
        }
    }

    async fn idle(&self, ms: u64) {
        match self {
            Host::Virtual(clock) => clock.advance(ms as f64),
            Host::Real => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = RationConfig::default();
    config
        .merge(RationConfigUpdate {
            cycle_duration: args.cycle_duration,
            runtime_limit: args.runtime_limit,
            ration_level_medium: args.medium,
            ration_level_critical: args.critical,
        })
        .context("invalid ration options")?;

    let (host, scheduler) = if args.virtual_clock {
        let clock = ManualClock::new(0.0);
        let scheduler = TickScheduler::with_config(clock.clone(), config)?;
        (Host::Virtual(clock), scheduler)
    } else {
        (Host::Real, TickScheduler::with_config(SystemClock::new(), config)?)
    };
    let scheduler = Rc::new(scheduler);
    let players = EventEmitter::<u32>::new();

    let save_progress = {
        let host = host.clone();
        Rc::new(scheduler.defer(move |player: u32| {
            host.burn(1.0);
            tracing::debug!(player, "progress saved");
        }))
    };
    {
        let scheduler = scheduler.clone();
        let host = host.clone();
        let work_ms = args.work_ms;
        players.on("playerAction", move |&player| {
            let host = host.clone();
            let save_progress = save_progress.clone();
            let (scored, resolver) = Promise::<u32, String>::pending(&scheduler);
            scheduler.queue(Phase::Events, move || {
                host.burn(work_ms);
                resolver.resolve(player);
            });
            scored.then(move |player| (*save_progress)(player));
        });
    }

    for invocation in 0..args.ticks {
        for player in 0..args.events {
            players.emit("playerAction", &player);
        }

        let outcome = describe(
            scheduler
                .fire_tick(TickType::Event)
                .with_context(|| format!("event tick of invocation {invocation}")),
        );
        let looped = describe(
            scheduler
                .fire_tick(TickType::Loop)
                .with_context(|| format!("loop tick of invocation {invocation}")),
        );

        let stats = scheduler.runtime_cycle_stats();
        println!(
            "#{invocation:<3} event={outcome:<10} loop={looped:<10} cycle={} used={:.1}ms pressure={:.1} queued events={} deferrables={}",
            stats.cycle_id,
            stats.cycle_runtime_used,
            stats.pressure,
            scheduler.pending(Phase::Events),
            scheduler.pending(Phase::Deferrables),
        );

        host.idle(args.interval_ms).await;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&scheduler.runtime_cycle_stats())?
    );
    Ok(())
}

fn describe(result: Result<TickOutcome>) -> String {
    match result {
        Ok(outcome) => format!("{outcome:?}"),
        Err(err) => {
            tracing::warn!("{err:#}");
            match err.downcast_ref::<TickError>() {
                Some(TickError::Callbacks { outcome, .. }) => format!("{outcome:?} with failures"),
                _ => "Failed".to_string(),
            }
        }
    }
}
