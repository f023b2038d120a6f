//! Advisory fraud scoring
//!
//! A [`FraudScorer`] is an ordered list of independent [`FraudRule`]s. Each
//! rule looks at the submission and the user's recent history and either
//! stays silent or contributes a fixed weight with a reason. Weights are
//! summed and capped at 100. The scorer never mutates state and never
//! rejects anything; what to do with a high score is decided elsewhere.
//!
//! New checks are added by appending a rule with [`FraudScorer::push_rule`].

use crate::config::FraudConfig;
use crate::error::FraudError;
use crate::ledger::UserHistory;
use crate::utils::duration_ms;
use shared::CompletionRecord;
use std::net::IpAddr;

pub const MAX_SUSPICION: u8 = 100;

pub const EXCESSIVE_REWARD_WEIGHT: u8 = 30;
pub const NEW_ACCOUNT_WEIGHT: u8 = 20;
pub const COMPLETION_BURST_WEIGHT: u8 = 40;
pub const ORIGIN_CHANGED_WEIGHT: u8 = 25;

/// Everything a rule may look at
#[derive(Debug, Clone, Copy)]
pub struct FraudContext<'a> {
    pub user_id: &'a str,
    pub action_id: &'a str,
    pub reward_amount: u64,
    pub source_ip: IpAddr,
    pub now: u64,
    pub account_created_at: u64,
    pub history: &'a UserHistory,
}

/// Contribution of one triggered rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub weight: u8,
    pub reason: String,
}

pub trait FraudRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` when the rule does not trigger
    fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    pub suspicion_score: u8,
    pub reasons: Vec<String>,
}

impl Assessment {
    pub fn clean() -> Self {
        Self::default()
    }
}

pub struct FraudScorer {
    rules: Vec<Box<dyn FraudRule>>,
    suspicious_threshold: u8,
}

impl FraudScorer {
    /// Scorer with no rules; every submission scores 0
    pub fn new(suspicious_threshold: u8) -> Self {
        Self {
            rules: Vec::new(),
            suspicious_threshold,
        }
    }

    /// Scorer with the four built-in rules, in their canonical order
    pub fn with_default_rules(config: &FraudConfig) -> Self {
        let mut scorer = Self::new(config.suspicious_threshold);
        scorer.push_rule(ExcessiveReward {
            multiplier: config.reward_multiplier,
            trailing: config.trailing_completions,
        });
        scorer.push_rule(NewAccount {
            min_age_ms: duration_ms(config.new_account_age),
        });
        scorer.push_rule(CompletionBurst {
            window_ms: duration_ms(config.burst_window),
            threshold: config.burst_threshold,
        });
        scorer.push_rule(OriginChanged);
        scorer
    }

    pub fn push_rule(&mut self, rule: impl FraudRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Runs every rule in order. The first failing rule aborts the evaluation;
    /// the caller applies its failure policy.
    pub fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Assessment, FraudError> {
        let mut total: u16 = 0;
        let mut reasons = Vec::new();

        for rule in &self.rules {
            if let Some(hit) = rule.evaluate(ctx)? {
                total = total.saturating_add(u16::from(hit.weight));
                reasons.push(hit.reason);
            }
        }

        Ok(Assessment {
            suspicion_score: total.min(u16::from(MAX_SUSPICION)) as u8,
            reasons,
        })
    }

    pub fn is_suspicious(&self, assessment: &Assessment) -> bool {
        assessment.suspicion_score > self.suspicious_threshold
    }
}

/// Mean reward of the last `trailing` completions, if there are any
pub fn trailing_average(recent: &[CompletionRecord], trailing: usize) -> Option<f64> {
    let window = &recent[recent.len().saturating_sub(trailing)..];
    if window.is_empty() {
        return None;
    }
    let sum: f64 = window.iter().map(|r| r.reward_applied as f64).sum();
    Some(sum / window.len() as f64)
}

/// Reward far above what the user usually earns
pub struct ExcessiveReward {
    pub multiplier: u64,
    pub trailing: usize,
}

impl FraudRule for ExcessiveReward {
    fn name(&self) -> &'static str {
        "excessive_reward"
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError> {
        let recent = &ctx.history.recent;
        let window = &recent[recent.len().saturating_sub(self.trailing)..];
        if window.is_empty() {
            return Ok(None);
        }

        let overflow = || FraudError::RuleFailed {
            rule: self.name(),
            detail: "reward arithmetic overflow".to_string(),
        };

        // reward > multiplier * (sum / n)  <=>  reward * n > multiplier * sum
        let sum = window
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r.reward_applied))
            .ok_or_else(overflow)?;
        let lhs = ctx
            .reward_amount
            .checked_mul(window.len() as u64)
            .ok_or_else(overflow)?;
        let rhs = self.multiplier.checked_mul(sum).ok_or_else(overflow)?;

        if lhs <= rhs {
            return Ok(None);
        }

        let average = trailing_average(window, self.trailing).unwrap_or_default();
        Ok(Some(RuleHit {
            weight: EXCESSIVE_REWARD_WEIGHT,
            reason: format!(
                "reward {} exceeds {}x trailing average {:.1}",
                ctx.reward_amount, self.multiplier, average
            ),
        }))
    }
}

pub struct NewAccount {
    pub min_age_ms: u64,
}

impl FraudRule for NewAccount {
    fn name(&self) -> &'static str {
        "new_account"
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError> {
        let age = ctx.now.saturating_sub(ctx.account_created_at);
        if age >= self.min_age_ms {
            return Ok(None);
        }
        Ok(Some(RuleHit {
            weight: NEW_ACCOUNT_WEIGHT,
            reason: format!("account age {}s under {}s", age / 1_000, self.min_age_ms / 1_000),
        }))
    }
}

/// Too many completions in a short trailing window
pub struct CompletionBurst {
    pub window_ms: u64,
    pub threshold: usize,
}

impl FraudRule for CompletionBurst {
    fn name(&self) -> &'static str {
        "completion_burst"
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError> {
        let since = ctx.now.saturating_sub(self.window_ms);
        let count = ctx
            .history
            .recent
            .iter()
            .filter(|r| r.applied_at > since)
            .count();

        if count <= self.threshold {
            return Ok(None);
        }
        Ok(Some(RuleHit {
            weight: COMPLETION_BURST_WEIGHT,
            reason: format!(
                "{} completions in the last {}s (limit {})",
                count,
                self.window_ms / 1_000,
                self.threshold
            ),
        }))
    }
}

pub struct OriginChanged;

impl FraudRule for OriginChanged {
    fn name(&self) -> &'static str {
        "origin_changed"
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError> {
        match ctx.history.previous_origin {
            Some(previous) if previous != ctx.source_ip => Ok(Some(RuleHit {
                weight: ORIGIN_CHANGED_WEIGHT,
                reason: format!("origin changed from {} to {}", previous, ctx.source_ip),
            })),
            _ => Ok(None),
        }
    }
}
