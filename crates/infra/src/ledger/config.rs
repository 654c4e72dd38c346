//! Ledger configuration.

use tracing::warn;

use stockledger_inventory::AllocationMode;

pub const ENV_MAX_RETRIES: &str = "STOCKLEDGER_MAX_RETRIES";
pub const ENV_MAX_CANDIDATES: &str = "STOCKLEDGER_MAX_CANDIDATES";
pub const ENV_ALLOCATION_MODE: &str = "STOCKLEDGER_ALLOCATION_MODE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Re-reads of one candidate batch after a lost race before moving on.
    pub max_retries_per_candidate: u32,
    /// Upper bound on batches considered for one product in one request.
    pub max_candidates_per_product: usize,
    pub allocation_mode: AllocationMode,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries_per_candidate: 3,
            max_candidates_per_product: 64,
            allocation_mode: AllocationMode::Fefo,
        }
    }
}

impl LedgerConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries_per_candidate = retries;
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates_per_product = max.max(1);
        self
    }

    pub fn with_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.allocation_mode = mode;
        self
    }

    /// Read overrides from the process environment. Malformed values keep
    /// the default and log a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            match raw.trim().parse::<u32>() {
                Ok(v) => config.max_retries_per_candidate = v,
                Err(_) => warn!(key = ENV_MAX_RETRIES, value = %raw, "ignoring malformed setting"),
            }
        }
        if let Some(raw) = lookup(ENV_MAX_CANDIDATES) {
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => config.max_candidates_per_product = v,
                _ => warn!(key = ENV_MAX_CANDIDATES, value = %raw, "ignoring malformed setting"),
            }
        }
        if let Some(raw) = lookup(ENV_ALLOCATION_MODE) {
            match raw.parse::<AllocationMode>() {
                Ok(mode) => config.allocation_mode = mode,
                Err(_) => warn!(key = ENV_ALLOCATION_MODE, value = %raw, "ignoring malformed setting"),
            }
        }
        config
    }
}
