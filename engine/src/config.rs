//! Engine configuration
//!
//! All tunables of the pipeline, the fraud rules and the broadcast hub live
//! here with their defaults. The binary maps command line flags onto these
//! structs; embedders construct them directly.

use std::time::Duration;

/// What the gating step does when the fraud scorer cannot produce a score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Proceed with a suspicion score of 0 and log the incident
    FailOpen,
    /// Proceed, but mark the submission suspicious with the failure reason
    FlagForReview,
}

/// Thresholds for the built-in fraud rules
#[derive(Debug, Clone)]
pub struct FraudConfig {
    /// Number of trailing completions used for the average reward (default: 10)
    pub trailing_completions: usize,
    /// Reward above this multiple of the trailing average is flagged (default: 5)
    pub reward_multiplier: u64,
    /// Accounts younger than this are flagged (default: 24 hours)
    pub new_account_age: Duration,
    /// Window for the completion burst check (default: 5 minutes)
    pub burst_window: Duration,
    /// More completions than this inside `burst_window` are flagged (default: 20)
    pub burst_threshold: usize,
    /// Scores strictly above this are suspicious (default: 70)
    pub suspicious_threshold: u8,
    /// Behaviour when a rule fails (default: fail open)
    pub failure_policy: FailurePolicy,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            trailing_completions: 10,
            reward_multiplier: 5,
            new_account_age: Duration::from_secs(24 * 60 * 60),
            burst_window: Duration::from_secs(5 * 60),
            burst_threshold: 20,
            suspicious_threshold: 70,
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

/// Subscriber queue limits for the broadcast hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered per subscriber before dropping (default: 256)
    pub subscriber_capacity: usize,
    /// Ranks whose changes are kept in preference when dropping (default: 10)
    pub watched_top_n: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            watched_top_n: 10,
        }
    }
}

/// Top level configuration for [`crate::Engine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum wait for a per-user lock before answering `Busy` (default: 250 ms)
    pub lock_wait: Duration,
    /// How long finalized request ids are remembered for replay (default: 24 hours)
    pub idempotency_retention: Duration,
    pub fraud: FraudConfig,
    pub hub: HubConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(250),
            idempotency_retention: Duration::from_secs(24 * 60 * 60),
            fraud: FraudConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Completions the ledger keeps per user: enough for the trailing average
    /// and for one more than the burst threshold
    pub fn history_len(&self) -> usize {
        self.fraud
            .trailing_completions
            .max(self.fraud.burst_threshold.saturating_add(1))
    }
}
