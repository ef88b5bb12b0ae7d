//! Runtime rationing.
//!
//! The host grants a fixed amount of runtime per cycle (by default 60 ms
//! every 4 seconds). The accountant sums the measured runtime of every
//! callback within the current cycle and turns it into a *pressure* score.
//! Above the medium level the deferrables phase yields early; above the
//! critical level the scheduler pauses until a new cycle begins.

use serde::{Deserialize, Serialize};

use crate::error::TickError;

/// Shift applied to the time since launch before deriving the cycle.
///
/// Moving our cycle boundary slightly earlier than the host's keeps us from
/// resetting usage before the host has.
pub const LAUNCH_OFFSET_MS: f64 = -150.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RationConfig {
    /// Length of one runtime cycle, in ms.
    pub cycle_duration: f64,
    /// Runtime allowed per cycle, in ms.
    pub runtime_limit: f64,
    /// Pressure above which non-essential work is deferred to later ticks.
    pub ration_level_medium: f64,
    /// Pressure above which all work stops until the next cycle.
    pub ration_level_critical: f64,
}

impl Default for RationConfig {
    fn default() -> Self {
        Self {
            cycle_duration: 4000.0,
            runtime_limit: 60.0,
            ration_level_medium: 60.0,
            ration_level_critical: 80.0,
        }
    }
}

/// A partial [`RationConfig`]. Unset fields are left unchanged on merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RationConfigUpdate {
    pub cycle_duration: Option<f64>,
    pub runtime_limit: Option<f64>,
    pub ration_level_medium: Option<f64>,
    pub ration_level_critical: Option<f64>,
}

impl RationConfig {
    /// Applies the supplied fields of `update`. The config is left untouched
    /// when the merged result fails [`validate`](Self::validate).
    pub fn merge(&mut self, update: RationConfigUpdate) -> Result<(), TickError> {
        let merged = Self {
            cycle_duration: update.cycle_duration.unwrap_or(self.cycle_duration),
            runtime_limit: update.runtime_limit.unwrap_or(self.runtime_limit),
            ration_level_medium: update
                .ration_level_medium
                .unwrap_or(self.ration_level_medium),
            ration_level_critical: update
                .ration_level_critical
                .unwrap_or(self.ration_level_critical),
        };
        merged.validate()?;
        *self = merged;
        Ok(())
    }

    /// Durations must be finite and positive, levels finite. Anything else
    /// turns the pressure into NaN and disables pausing.
    pub fn validate(&self) -> Result<(), TickError> {
        let positive = [
            ("cycleDuration", self.cycle_duration),
            ("runtimeLimit", self.runtime_limit),
        ];
        let levels = [
            ("rationLevelMedium", self.ration_level_medium),
            ("rationLevelCritical", self.ration_level_critical),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(TickError::InvalidOption { name, value });
            }
        }
        for (name, value) in levels {
            if !value.is_finite() {
                return Err(TickError::InvalidOption { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RationState {
    pub cycle_id: i64,
    /// Runtime used within `cycle_id`, in ms.
    pub cycle_runtime_used: f64,
    pub is_paused: bool,
}

#[derive(Debug, Clone)]
pub struct RationAccountant {
    config: RationConfig,
    state: RationState,
    launch_time: f64,
}

impl RationAccountant {
    pub fn new(config: RationConfig, launch_time: f64) -> Self {
        Self {
            config,
            state: RationState::default(),
            launch_time,
        }
    }

    pub fn config(&self) -> RationConfig {
        self.config
    }

    pub fn config_mut(&mut self) -> &mut RationConfig {
        &mut self.config
    }

    pub fn state(&self) -> RationState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused
    }

    pub fn launch_time(&self) -> f64 {
        self.launch_time
    }

    pub fn time_since_launch(&self, now: f64) -> f64 {
        now - self.launch_time + LAUNCH_OFFSET_MS
    }

    /// Adds the measured runtime of one callback to the current cycle.
    pub fn record(&mut self, elapsed: f64) {
        // Clocks are monotonic; a negative delta can only be rounding noise.
        self.state.cycle_runtime_used += elapsed.max(0.0);
    }

    /// Rolls the cycle over if due, recomputes pressure and pauses when it
    /// is critical. Returns the pressure.
    pub fn check(&mut self, now: f64) -> f64 {
        let time_since_launch = self.time_since_launch(now);
        let current_cycle_id = (time_since_launch / self.config.cycle_duration).floor() as i64;

        if current_cycle_id > self.state.cycle_id {
            self.state.cycle_runtime_used = 0.0;
            self.state.cycle_id = current_cycle_id;
            if self.state.is_paused {
                self.state.is_paused = false;
                tracing::info!(cycle_id = current_cycle_id, "ration resumed");
            } else {
                tracing::debug!(cycle_id = current_cycle_id, "ration cycle reset");
            }
        }

        let pressure = self.pressure_at(time_since_launch);
        if pressure > self.config.ration_level_critical && !self.state.is_paused {
            self.state.is_paused = true;
            tracing::info!(
                cycle_id = self.state.cycle_id,
                pressure,
                runtime_used = self.state.cycle_runtime_used,
                "ration paused"
            );
        }

        tracing::trace!(pressure, runtime_used = self.state.cycle_runtime_used);
        pressure
    }

    /// Pressure for the current usage at `time_since_launch`. Pure.
    pub fn pressure_at(&self, time_since_launch: f64) -> f64 {
        let RationConfig {
            cycle_duration,
            runtime_limit,
            ration_level_medium,
            ..
        } = self.config;

        let time_left_to_reset = (cycle_duration - time_since_launch).rem_euclid(cycle_duration);
        let usage_ratio = self.state.cycle_runtime_used / runtime_limit;

        // Usage dominates, and weighs more once past the medium level.
        let usage = if usage_ratio * 100.0 > ration_level_medium {
            usage_ratio * 95.0
        } else {
            usage_ratio * 80.0
        };
        // A nearing reset lowers the pressure.
        usage + (time_left_to_reset / cycle_duration) * 20.0
    }
}
