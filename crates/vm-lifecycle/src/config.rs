use std::time::Duration;

use crate::{Error, Result};

/// Endpoint-wide timing knobs. Per-VM timeouts live on the VM's declaration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Bound for ordinary remote tasks (create, reconfigure, power, destroy).
    pub task_timeout: Duration,
    pub task_poll_interval: Duration,
    /// Poll interval for guest network readiness and guest shutdown.
    pub guest_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            task_poll_interval: Duration::from_millis(1000),
            guest_poll_interval: Duration::from_secs(5),
        }
    }
}

impl LifecycleConfig {
    /// Load from env vars: `VIM_TASK_TIMEOUT_SECS`, `VIM_TASK_POLL_INTERVAL_MS`,
    /// `VIM_GUEST_POLL_INTERVAL_SECS`. All optional, and zero is rejected.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            task_timeout: parse_nonzero(&get, "VIM_TASK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            task_poll_interval: parse_nonzero(&get, "VIM_TASK_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.task_poll_interval),
            guest_poll_interval: parse_nonzero(&get, "VIM_GUEST_POLL_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.guest_poll_interval),
        })
    }
}

fn parse(get: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<u64>> {
    match get(var) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| Error::InvalidEnv {
            var: var.to_string(),
            value,
        }),
    }
}

fn parse_nonzero(get: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<u64>> {
    match parse(get, var)? {
        Some(0) => Err(Error::InvalidEnv {
            var: var.to_string(),
            value: "0".into(),
        }),
        n => Ok(n),
    }
}
