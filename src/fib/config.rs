//! Tunables of a [Scope](super::Scope).
//!
//! The defaults are the values the framework is designed around. Tests and
//! embedders that want faster reaction times shorten the delays.
//!
//! ```
//! use fib_algo::fib::FibAlgoConfig;
//!
//! let config = FibAlgoConfig::from_json(r#"{ "callout_delay_ms": 5 }"#)
//!     .unwrap_or_default();
//! assert_eq!(config.callout_delay_ms, 5);
//! assert_eq!(config.eval_num_routes, 100);
//! ```

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FibAlgoConfig {
    /// Initial number of table slots per family.
    pub num_tables: u32,
    /// Delay between the first change to an instance and the re-check of
    /// the preference scores.
    pub eval_delay_ms: u64,
    /// Number of changes after which the re-check is brought forward to
    /// `callout_delay_ms`.
    pub eval_num_routes: u32,
    /// Base delay for rebuilds, doubled for each consecutive failure.
    pub callout_delay_ms: u64,
    /// Upper bound for the rebuild delay.
    pub max_callout_delay_ms: u64,
    /// A candidate module has to beat the current one by more than this many
    /// percent to be switched to.
    pub best_diff_percent: u32,
    /// Attempts per setup while the module keeps asking for a rebuild.
    pub max_tries: u32,
    /// Nexthop Index Table size for a fresh instance.
    pub min_nhops: u32,
    /// Nexthop Index Table size limit.
    pub max_nhops: u32,
}

impl Default for FibAlgoConfig {
    fn default() -> Self {
        Self {
            num_tables: 1,
            eval_delay_ms: 30_000,
            eval_num_routes: 100,
            callout_delay_ms: 50,
            max_callout_delay_ms: 1_000,
            best_diff_percent: 5,
            max_tries: 32,
            min_nhops: 16,
            max_nhops: 262_144,
        }
    }
}

impl FibAlgoConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn eval_delay(&self) -> Duration {
        Duration::from_millis(self.eval_delay_ms)
    }

    pub fn callout_delay(&self) -> Duration {
        Duration::from_millis(self.callout_delay_ms)
    }

    /// The delay before the next rebuild of an instance that failed to
    /// rebuild `failures` times in a row.
    pub fn rebuild_delay(&self, failures: u32) -> Duration {
        let shift = failures.min(10);
        let delay = self.callout_delay_ms.saturating_mul(1 << shift);
        Duration::from_millis(delay.min(self.max_callout_delay_ms))
    }
}
