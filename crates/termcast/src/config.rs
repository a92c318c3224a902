// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream tunables, read once at broker construction.
//!
//! Every cap has an environment-variable override and a minimum clamp.
//! Misconfiguration is never fatal: an unparseable override lands on the
//! minimum, an absent one on the default.

use std::time::Duration;

use tracing::warn;

/// Per-terminal replay-ring byte budget.
pub const DEFAULT_RING_MAX_BYTES: usize = 256 * 1024;
pub const MIN_RING_MAX_BYTES: usize = 1;

/// Per-attachment outbound queue byte budget.
pub const DEFAULT_QUEUE_MAX_BYTES: usize = 128 * 1024;
pub const MIN_QUEUE_MAX_BYTES: usize = 1;

/// Flush batch byte budget.
pub const DEFAULT_BATCH_MAX_BYTES: usize = 64 * 1024;
pub const MIN_BATCH_MAX_BYTES: usize = 1024;

/// Deferred flush delay while an attachment is blocked.
pub const DEFAULT_RETRY_FLUSH_DELAY_MS: u64 = 50;
pub const MIN_RETRY_FLUSH_DELAY_MS: u64 = 1;

/// Outgoing buffered bytes beyond which an attachment counts as stalled.
pub const DEFAULT_CATASTROPHIC_BUFFERED_BYTES: u64 = 16 * 1024 * 1024;
pub const MIN_CATASTROPHIC_BUFFERED_BYTES: u64 = 1024;

/// How long a stall may persist before the connection is closed.
pub const DEFAULT_CATASTROPHIC_STALL_MS: u64 = 10_000;
pub const MIN_CATASTROPHIC_STALL_MS: u64 = 1;

/// Runtime caps for the streaming broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub ring_max_bytes: usize,
    pub queue_max_bytes: usize,
    pub batch_max_bytes: usize,
    pub retry_flush_delay: Duration,
    pub catastrophic_buffered_bytes: u64,
    pub catastrophic_stall: Duration,
    /// Log a warning when an oversized append loses its prefix to the ring
    /// budget.
    pub warn_on_truncated_append: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_max_bytes: DEFAULT_RING_MAX_BYTES,
            queue_max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
            retry_flush_delay: Duration::from_millis(DEFAULT_RETRY_FLUSH_DELAY_MS),
            catastrophic_buffered_bytes: DEFAULT_CATASTROPHIC_BUFFERED_BYTES,
            catastrophic_stall: Duration::from_millis(DEFAULT_CATASTROPHIC_STALL_MS),
            warn_on_truncated_append: true,
        }
    }
}

impl StreamConfig {
    /// Build a config from `TERMCAST_*` environment overrides.
    pub fn from_env() -> Self {
        Self {
            ring_max_bytes: env_cap(
                "TERMCAST_RING_MAX_BYTES",
                DEFAULT_RING_MAX_BYTES,
                MIN_RING_MAX_BYTES,
            ),
            queue_max_bytes: env_cap(
                "TERMCAST_QUEUE_MAX_BYTES",
                DEFAULT_QUEUE_MAX_BYTES,
                MIN_QUEUE_MAX_BYTES,
            ),
            batch_max_bytes: env_cap(
                "TERMCAST_BATCH_MAX_BYTES",
                DEFAULT_BATCH_MAX_BYTES,
                MIN_BATCH_MAX_BYTES,
            ),
            retry_flush_delay: Duration::from_millis(env_cap(
                "TERMCAST_RETRY_FLUSH_DELAY_MS",
                DEFAULT_RETRY_FLUSH_DELAY_MS,
                MIN_RETRY_FLUSH_DELAY_MS,
            )),
            catastrophic_buffered_bytes: env_cap(
                "TERMCAST_CATASTROPHIC_BUFFERED_BYTES",
                DEFAULT_CATASTROPHIC_BUFFERED_BYTES,
                MIN_CATASTROPHIC_BUFFERED_BYTES,
            ),
            catastrophic_stall: Duration::from_millis(env_cap(
                "TERMCAST_CATASTROPHIC_STALL_MS",
                DEFAULT_CATASTROPHIC_STALL_MS,
                MIN_CATASTROPHIC_STALL_MS,
            )),
            warn_on_truncated_append: env_flag("TERMCAST_WARN_ON_TRUNCATED_APPEND", true),
        }
    }
}

/// Read a numeric cap: absent → default, unparseable → minimum, otherwise
/// clamped to the minimum.
fn env_cap<T>(name: &str, default: T, min: T) -> T
where
    T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value >= min => value,
        Ok(_) => {
            warn!(var = name, value = %raw, min = %min, "cap below minimum, clamping");
            min
        }
        Err(_) => {
            warn!(var = name, value = %raw, min = %min, "unparseable cap, clamping to minimum");
            min
        }
    }
}

/// Read a boolean flag: accepts 1/0, true/false, on/off, yes/no.
fn env_flag(name: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => default,
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
