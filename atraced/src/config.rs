//! Daemon configuration, loaded the way `cognitod::config::Config::load`
//! does: an overridable path via an environment variable, `#[serde(default)]`
//! fields throughout, falling back to defaults on a missing or malformed
//! file rather than refusing to start.

use serde::Deserialize;
use std::fs;

const DEFAULT_CONFIG_PATH: &str = "/etc/atrace/atrace.toml";
const ENV_CONFIG_PATH: &str = "ATRACE_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Ring capacity in slots (spec.md §4.1's install default, floor 16).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: u32,
    /// Extra high-frequency functions to start disabled, beyond the static
    /// noise-function table (spec.md §4.1's noise policy).
    #[serde(default)]
    pub extra_noise_functions: Vec<String>,
    /// Poll tick, matching the host scheduler's ~20ms tick (spec.md §2/§4.4).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-poll drain bound (spec.md §4.4 step 3).
    #[serde(default = "default_batch_bound")]
    pub batch_bound: usize,
    /// Name the anchor is published under (spec.md §6).
    #[serde(default = "default_anchor_name")]
    pub anchor_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            extra_noise_functions: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_bound: default_batch_bound(),
            anchor_name: default_anchor_name(),
        }
    }
}

fn default_ring_capacity() -> u32 {
    atrace_common::DEFAULT_RING_CAPACITY
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_batch_bound() -> usize {
    atrace_consumer::BATCH_BOUND
}

fn default_anchor_name() -> String {
    atrace_common::ANCHOR_NAME.to_string()
}

impl Config {
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}
