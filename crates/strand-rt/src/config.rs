// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime tuning knobs.
//!
//! Defaults are fine for tests and small programs. `from_env` lets a
//! deployment override them without recompiling.

use std::env;

/// Max epoll events collected per reactor wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;
/// Initial ready-queue capacity.
pub const DEFAULT_READY_CAPACITY: usize = 256;

const MAX_EVENTS_VAR: &str = "STRAND_MAX_EVENTS";
const READY_CAPACITY_VAR: &str = "STRAND_READY_CAPACITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Upper bound on events handled per `epoll_wait` call.
    pub max_events: usize,
    /// Slots preallocated in the ready queue.
    pub ready_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            ready_capacity: DEFAULT_READY_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_MAX_EVENTS` / `STRAND_READY_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_positive(MAX_EVENTS_VAR, lookup(MAX_EVENTS_VAR)) {
            config.max_events = n;
        }
        if let Some(n) = parse_positive(READY_CAPACITY_VAR, lookup(READY_CAPACITY_VAR)) {
            config.ready_capacity = n;
        }
        config
    }

    pub fn with_max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    pub fn with_ready_capacity(mut self, n: usize) -> Self {
        self.ready_capacity = n;
        self
    }
}

fn parse_positive(key: &str, raw: Option<String>) -> Option<usize> {
    let raw = raw?;
    match raw.trim().parse::<usize>() {
        Ok(0) => {
            tracing::warn!(key, "ignoring zero value");
            None
        }
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!(key, value = %raw, %err, "ignoring unparsable value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_without_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.max_events, 64);
    }

    #[test]
    fn env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("STRAND_MAX_EVENTS", "8"),
            ("STRAND_READY_CAPACITY", " 1024 "),
        ]));
        assert_eq!(config.max_events, 8);
        assert_eq!(config.ready_capacity, 1024);
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("STRAND_MAX_EVENTS", "0"),
            ("STRAND_READY_CAPACITY", "lots"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn builder_clamps_events() {
        assert_eq!(RuntimeConfig::default().with_max_events(0).max_events, 1);
    }
}
