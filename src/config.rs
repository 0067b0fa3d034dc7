//! Runtime configuration and environment variable overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — values set via [`RuntimeConfig`] builder methods
//! 2. **Environment variables** — values from `MELON_FIBER_*` env vars
//! 3. **Defaults** — derived from CPU topology
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `MELON_FIBER_WORKERS` | `usize` | `workers_per_group` |
//! | `MELON_FIBER_GROUPS` | `usize` | `groups` |
//! | `MELON_FIBER_STACK_SIZE` | `usize` | `normal_stack_size` |
//! | `MELON_FIBER_TIMER_TICK_US` | `u64` | `timer_tick` |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Environment variable name for worker count per group.
pub const ENV_WORKERS: &str = "MELON_FIBER_WORKERS";
/// Environment variable name for the number of scheduling groups.
pub const ENV_GROUPS: &str = "MELON_FIBER_GROUPS";
/// Environment variable name for the normal-class stack size.
pub const ENV_STACK_SIZE: &str = "MELON_FIBER_STACK_SIZE";
/// Environment variable name for the timer wheel tick, in microseconds.
pub const ENV_TIMER_TICK_US: &str = "MELON_FIBER_TIMER_TICK_US";

/// Error produced while building or validating a [`RuntimeConfig`].
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// What a valid value looks like.
        expected: &'static str,
        /// The offending value.
        value: String,
    },
    /// A field combination fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the fiber runtime.
///
/// All fields are public; the builder-style methods exist for fluent
/// construction. Policy knobs the scheduler consults on hot paths
/// (`steal_retries`, `overflow_drain_interval`, `parking_slots`) are
/// deliberately exposed rather than hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads in each scheduling group.
    pub workers_per_group: usize,
    /// Number of scheduling groups. Two groups separate ordinary workload
    /// from system fibers; more is rarely useful.
    pub groups: usize,
    /// Stack size for [`StackClass::Small`](crate::StackClass) fibers.
    pub small_stack_size: usize,
    /// Stack size for [`StackClass::Normal`](crate::StackClass) fibers.
    pub normal_stack_size: usize,
    /// Stack size for [`StackClass::Large`](crate::StackClass) fibers.
    pub large_stack_size: usize,
    /// Whether fiber stacks carry `PROT_NONE` guard pages at both ends.
    pub guard_pages: bool,
    /// Capacity of the per-group parking array. Workers beyond this many
    /// simultaneous sleepers spin-wait briefly instead of parking.
    pub parking_slots: usize,
    /// Resolution of the near timer wheel.
    pub timer_tick: Duration,
    /// Victim probes a worker makes per idle scan before parking.
    pub steal_retries: usize,
    /// A worker drains the group overflow deque every this many local pops.
    pub overflow_drain_interval: u32,
    /// Bound on each worker's local ready queue; pushes beyond it spill into
    /// the group overflow deque.
    pub ready_queue_capacity: usize,
    /// Maximum stacks kept per size class in each group's pool.
    pub stack_pool_capacity: usize,
    /// Name prefix for worker OS threads.
    pub worker_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            workers_per_group: cpus,
            groups: 1,
            small_stack_size: 32 * 1024,
            normal_stack_size: 256 * 1024,
            large_stack_size: 4 * 1024 * 1024,
            guard_pages: true,
            parking_slots: 64,
            timer_tick: Duration::from_millis(1),
            steal_retries: 3,
            overflow_drain_interval: 61,
            ready_queue_capacity: 512,
            stack_pool_capacity: 128,
            worker_name_prefix: "fiber-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration with defaults, environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Sets the worker count per group.
    #[must_use]
    pub fn workers_per_group(mut self, workers: usize) -> Self {
        self.workers_per_group = workers;
        self
    }

    /// Sets the number of scheduling groups.
    #[must_use]
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Sets the normal-class stack size.
    #[must_use]
    pub fn normal_stack_size(mut self, bytes: usize) -> Self {
        self.normal_stack_size = bytes;
        self
    }

    /// Sets the timer wheel tick.
    #[must_use]
    pub fn timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick;
        self
    }

    /// Sets the victim-probe bound per idle scan.
    #[must_use]
    pub fn steal_retries(mut self, retries: usize) -> Self {
        self.steal_retries = retries;
        self
    }

    /// Sets the overflow drain cadence.
    #[must_use]
    pub fn overflow_drain_interval(mut self, interval: u32) -> Self {
        self.overflow_drain_interval = interval;
        self
    }

    /// Validates field combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers_per_group == 0 {
            return Err(ConfigError::Invalid(
                "workers_per_group must be at least 1".into(),
            ));
        }
        if self.groups == 0 {
            return Err(ConfigError::Invalid("groups must be at least 1".into()));
        }
        let page = crate::stack::page_size();
        for (name, size) in [
            ("small_stack_size", self.small_stack_size),
            ("normal_stack_size", self.normal_stack_size),
            ("large_stack_size", self.large_stack_size),
        ] {
            if size < page {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at least one page ({page} bytes)"
                )));
            }
        }
        if self.timer_tick < Duration::from_micros(10) {
            return Err(ConfigError::Invalid(
                "timer_tick below 10us burns a core".into(),
            ));
        }
        if self.overflow_drain_interval == 0 {
            return Err(ConfigError::Invalid(
                "overflow_drain_interval must be at least 1".into(),
            ));
        }
        if self.ready_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "ready_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied. Returns an
/// error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_WORKERS) {
        config.workers_per_group = parse_usize(ENV_WORKERS, &val)?;
    }
    if let Some(val) = read_env(ENV_GROUPS) {
        config.groups = parse_usize(ENV_GROUPS, &val)?;
    }
    if let Some(val) = read_env(ENV_STACK_SIZE) {
        config.normal_stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_TIMER_TICK_US) {
        let micros = parse_u64(ENV_TIMER_TICK_US, &val)?;
        config.timer_tick = Duration::from_micros(micros);
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RuntimeConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn zero_workers_rejected() {
        let config = RuntimeConfig::default().workers_per_group(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_methods_apply() {
        let config = RuntimeConfig::default()
            .workers_per_group(2)
            .groups(2)
            .steal_retries(5)
            .overflow_drain_interval(7)
            .timer_tick(Duration::from_millis(2));
        assert_eq!(config.workers_per_group, 2);
        assert_eq!(config.groups, 2);
        assert_eq!(config.steal_retries, 5);
        assert_eq!(config.overflow_drain_interval, 7);
        assert_eq!(config.timer_tick, Duration::from_millis(2));
    }

    #[test]
    fn env_parse_failure_is_reported() {
        let err = parse_usize(ENV_WORKERS, "not-a-number").unwrap_err();
        assert!(err.to_string().contains(ENV_WORKERS));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = RuntimeConfig::default().workers_per_group(3).groups(2);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: RuntimeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.workers_per_group, 3);
        assert_eq!(back.groups, 2);
        assert_eq!(back.timer_tick, config.timer_tick);
    }
}
