use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TickError;

/// A stage of a tick. Every phase owns exactly one queue.
///
/// `PostPhase` is not part of any tick sequence; its queue is drained after
/// each of the other phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Timers,
    Deferrables,
    Events,
    Close,
    PostPhase,
}

impl Phase {
    pub const COUNT: usize = 5;

    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::Timers,
        Phase::Deferrables,
        Phase::Events,
        Phase::Close,
        Phase::PostPhase,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Timers => "timers",
            Phase::Deferrables => "deferrables",
            Phase::Events => "events",
            Phase::Close => "close",
            Phase::PostPhase => "postPhase",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| TickError::UnknownPhase(s.to_string()))
    }
}

/// The kind of host callback that fired a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TickType {
    /// The host's periodic loop callback.
    Loop,
    /// A host event callback.
    Event,
    /// A host timer callback.
    Timer,
}

impl TickType {
    /// Phases drained for this tick, in order.
    pub fn sequence(self) -> &'static [Phase] {
        match self {
            TickType::Loop => &[Phase::Deferrables, Phase::Close],
            TickType::Event => &[Phase::Events, Phase::Close],
            TickType::Timer => &[Phase::Timers, Phase::Close],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TickType::Loop => "loop",
            TickType::Event => "event",
            TickType::Timer => "timer",
        }
    }
}

impl fmt::Display for TickType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickType {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loop" => Ok(TickType::Loop),
            "event" => Ok(TickType::Event),
            "timer" => Ok(TickType::Timer),
            _ => Err(TickError::UnknownTickType(s.to_string())),
        }
    }
}
