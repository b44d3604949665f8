//! Explicit, field-based configuration, replacing the scattered numeric literals and variadic
//! "options" pattern this system historically used for timing knobs.

use std::time::Duration;

/// Timing knobs for the election/heartbeat tickers.
///
/// `heartbeat_interval` should be well under half of `election_timeout_min` so a healthy leader
/// suppresses followers' timeouts with margin; `new` does not enforce this (a misconfigured
/// cluster should fail by electing too often, not by panicking at startup), but the defaults
/// respect it.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout (`election_timeout_min + random_range`).
    pub election_timeout_max: Duration,
    /// How often a leader sends AppendEntries to each follower.
    pub heartbeat_interval: Duration,
    /// How often the election ticker wakes up to check for a timeout.
    pub tick_interval: Duration,
}

impl RaftConfig {
    pub fn new(
        election_timeout_min: Duration,
        election_timeout_max: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        RaftConfig {
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            tick_interval: Duration::from_millis(10),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig::new(
            Duration::from_millis(400),
            Duration::from_millis(600),
            Duration::from_millis(100),
        )
    }
}
