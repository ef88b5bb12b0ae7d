use std::error::Error;
use std::fmt;

use thiserror::Error;

use crate::engine::TickOutcome;
use crate::phase::Phase;

pub type JobResult = Result<(), JobError>;

/// Failure returned by a scheduled callback.
pub struct JobError {
    source: Box<dyn Error + Send + Sync + 'static>,
}

impl JobError {
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl fmt::Debug for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobError").field(&self.source).finish()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl Error for JobError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.source)
    }
}

/// Return types a scheduled callback may have.
///
/// Plain `()` callbacks never fail. `Result<(), E>` callbacks surface their
/// error to the host through [`TickError::Callbacks`].
pub trait JobOutput {
    fn into_job_result(self) -> JobResult;
}

impl JobOutput for () {
    fn into_job_result(self) -> JobResult {
        Ok(())
    }
}

impl<E> JobOutput for Result<(), E>
where
    E: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    fn into_job_result(self) -> JobResult {
        self.map_err(JobError::new)
    }
}

/// A callback that returned an error, and the queue it was drained from.
#[derive(Debug, Error)]
#[error("{phase} callback failed: {error}")]
pub struct CallbackFailure {
    pub phase: Phase,
    #[source]
    pub error: JobError,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("invalid queue type `{0}`")]
    UnknownPhase(String),

    #[error("invalid tick type `{0}`")]
    UnknownTickType(String),

    #[error("fire_tick called from inside a running tick")]
    Reentrant,

    #[error("invalid process queue option `{name}`: {value}")]
    InvalidOption { name: &'static str, value: f64 },

    /// Callbacks failed. `outcome` is how the tick itself ended, so a
    /// suspended tick is still reported as suspended.
    #[error("{} callback(s) failed during the tick ({outcome:?})", failures.len())]
    Callbacks {
        outcome: TickOutcome,
        failures: Vec<CallbackFailure>,
    },
}
