//! Cooperative, runtime-budgeted tick scheduler.
//!
//! The host invokes script callbacks under a strict per-cycle runtime
//! budget. [`TickScheduler`] holds work in phase queues and runs as much of
//! it per host callback as the budget allows, suspending between two
//! callbacks when ration pressure turns critical.
//!
//! **Phases in a tick**
//! 1. timers
//! 2. deferrables: callbacks deferred to the next loop iteration(s)
//! 3. events
//! 4. close: objects are destroyed and variables dereferenced here
//!
//! After every phase the post-phase queue is drained completely.
//!
//! **Tick types**
//! - `loop`, fired from the host's event loop callback: deferrables, close
//! - `event`, fired from a host event callback: events, close
//! - `timer`, fired from a host timer: timers, close

pub mod clock;
pub mod engine;
pub mod error;
pub mod phase;
pub mod promise;
pub mod queue;
pub mod ration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineState, RuntimeCycleStats, TickOutcome, TickScheduler, TickStats};
pub use error::{CallbackFailure, JobError, JobOutput, JobResult, TickError};
pub use phase::{Phase, TickType};
pub use promise::{FromCallback, Promise, Resolver, Settle, Thenable, reasync};
pub use queue::{EventQueue, GeneralQueue, Job, ProcessQueue};
pub use ration::{RationAccountant, RationConfig, RationConfigUpdate, RationState};
