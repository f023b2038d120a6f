//! Submission pipeline and the engine facade
//!
//! A submission moves through `Received -> Gated -> Annotated -> Committed`
//! or ends `Rejected`:
//!
//! 1. the action is looked up in the current catalog snapshot,
//! 2. the idempotency ledger reserves the request or answers with a replay or
//!    a cooldown,
//! 3. the user's lock is taken (bounded wait) and the fraud scorer annotates
//!    the submission,
//! 4. under the lock the new score is computed, the rank index is updated,
//!    the reservation is finalized and the score is stored,
//! 5. the resulting rank change goes to the broadcast hub and the audit log.
//!
//! Steps 4 and 5 either all happen or none do: a failure after the index
//! update restores the previous index entry and releases the reservation so
//! the same request id can be retried.

use crate::audit::{AuditLog, AuditWriter};
use crate::catalog::ActionCatalog;
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::EngineError;
use crate::fraud::{Assessment, FraudContext, FraudScorer, MAX_SUSPICION};
use crate::hub::{BroadcastHub, Subscription};
use crate::ledger::{Gate, IdempotencyLedger, Replay, Reservation};
use crate::rank::{RankIndex, RankMove};
use crate::store::{ScoreStore, UserScore};
use crate::utils::{duration_ms, Clock, SystemClock};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::{
    ActionDefinition, Adjustment, AuditRecord, CompletionRecord, RankChange, RankEntry, Submission,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Cooldown,
    Busy,
    UnknownAction,
    InternalError,
}

/// Definitive answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Accepted {
        new_score: u64,
        new_rank: u64,
        version: u64,
        suspicious: bool,
        suspicion_score: u8,
        reasons: Vec<String>,
    },
    Duplicate(Replay),
    Rejected {
        reason: RejectReason,
        /// Earliest time in ms at which a retry can succeed, for cooldowns
        retry_after: Option<u64>,
    },
}

impl SubmitOutcome {
    fn rejected(reason: RejectReason) -> Self {
        SubmitOutcome::Rejected {
            reason,
            retry_after: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

/// Owns one instance of every component. All operations take `&self`; wrap the
/// engine in an `Arc` to share it between workers.
pub struct Engine {
    config: EngineConfig,
    catalog: RwLock<Arc<ActionCatalog>>,
    ledger: IdempotencyLedger,
    fraud: FraudScorer,
    store: ScoreStore,
    rank: RankIndex,
    hub: BroadcastHub,
    audit: Option<AuditWriter>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Creates an engine with the built-in fraud rules and the wall clock.
    /// Must be called from within a Tokio runtime.
    pub fn new(catalog: ActionCatalog, config: EngineConfig) -> Self {
        info!(
            "Starting engine with {} actions, lock wait {:?}, subscriber capacity {}",
            catalog.len(),
            config.lock_wait,
            config.hub.subscriber_capacity
        );

        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            ledger: IdempotencyLedger::new(config.history_len()),
            fraud: FraudScorer::with_default_rules(&config.fraud),
            store: ScoreStore::new(),
            rank: RankIndex::new(),
            hub: BroadcastHub::start(config.hub.clone()),
            audit: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persists every applied mutation to `log` from a background writer
    pub fn with_audit_log(mut self, log: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(AuditWriter::start(log));
        self
    }

    pub fn with_fraud_scorer(mut self, scorer: FraudScorer) -> Self {
        self.fraud = scorer;
        self
    }

    /// Uses a deterministic rank index; only the internal tree shape depends on it
    pub fn with_rank_seed(mut self, seed: u64) -> Self {
        self.rank = RankIndex::with_seed(seed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> Arc<ActionCatalog> {
        Arc::clone(&self.catalog.read())
    }

    /// Swaps in a new catalog. Submissions already past validation keep the
    /// definition they read.
    pub fn replace_catalog(&self, catalog: ActionCatalog) {
        info!("Replacing action catalog ({} actions)", catalog.len());
        *self.catalog.write() = Arc::new(catalog);
    }

    /// Records the creation time of an externally managed account
    pub fn register_user(&self, user_id: &str, created_at: u64) -> Result<(), EngineError> {
        if self.store.register(user_id, created_at) {
            debug!("Registered user {} created at {}", user_id, created_at);
            Ok(())
        } else {
            Err(EngineError::Busy(user_id.to_string()))
        }
    }

    pub async fn submit(&self, submission: Submission) -> SubmitOutcome {
        let now = self.clock.now_ms();

        let action = match self.catalog().get(&submission.action_id) {
            Some(action) => action.clone(),
            None => {
                debug!(
                    "Rejecting {} from {}: unknown action {}",
                    submission.request_id, submission.user_id, submission.action_id
                );
                return SubmitOutcome::rejected(RejectReason::UnknownAction);
            }
        };

        let (reservation, history) =
            match self
                .ledger
                .check_and_reserve(&submission, action.cooldown_ms(), now)
            {
                Gate::Accepted {
                    reservation,
                    history,
                } => (reservation, history),
                Gate::Duplicate(replay) => {
                    debug!(
                        "Replaying request {} of {}",
                        submission.request_id, submission.user_id
                    );
                    return SubmitOutcome::Duplicate(replay);
                }
                Gate::OnCooldown { retry_after } => {
                    debug!(
                        "{} on cooldown for {} until {}",
                        submission.user_id, submission.action_id, retry_after
                    );
                    return SubmitOutcome::Rejected {
                        reason: RejectReason::Cooldown,
                        retry_after: Some(retry_after),
                    };
                }
            };

        let mut user = match self
            .store
            .lock(&submission.user_id, now, self.config.lock_wait)
            .await
        {
            Ok(user) => user,
            Err(e) => {
                debug!("{}", e);
                self.ledger.release(&reservation);
                return SubmitOutcome::rejected(RejectReason::Busy);
            }
        };

        let ctx = FraudContext {
            user_id: &submission.user_id,
            action_id: &submission.action_id,
            reward_amount: action.reward_amount,
            source_ip: submission.source_ip,
            now,
            account_created_at: user.created_at,
            history: &history,
        };
        let (assessment, suspicious) = self.annotate(&ctx);
        if suspicious {
            warn!(
                "Suspicious submission {} from {} (score {}): {}",
                submission.request_id,
                submission.user_id,
                assessment.suspicion_score,
                assessment.reasons.join(", ")
            );
        }

        match self.commit(&submission, &action, &reservation, &mut *user, now) {
            Ok((record, moved)) => {
                let change = RankChange {
                    user_id: record.user_id.clone(),
                    previous_rank: moved.previous_rank,
                    new_rank: moved.new_rank,
                    previous_score: record.new_score - record.reward_applied,
                    new_score: record.new_score,
                    version: record.version,
                    suspicious,
                    reasons: assessment.reasons.clone(),
                };
                self.emit(AuditRecord::Completion(record.clone()), change);
                drop(user);

                debug!(
                    "Applied {} for {}: score {} rank {} version {}",
                    record.action_id, record.user_id, record.new_score, moved.new_rank, record.version
                );
                SubmitOutcome::Accepted {
                    new_score: record.new_score,
                    new_rank: moved.new_rank,
                    version: record.version,
                    suspicious,
                    suspicion_score: assessment.suspicion_score,
                    reasons: assessment.reasons,
                }
            }
            Err(e) => {
                warn!(
                    "Rolled back request {} of {}: {}",
                    submission.request_id, submission.user_id, e
                );
                self.ledger.release(&reservation);
                SubmitOutcome::rejected(RejectReason::InternalError)
            }
        }
    }

    // Fraud scoring never blocks a submission; failures follow the policy
    fn annotate(&self, ctx: &FraudContext<'_>) -> (Assessment, bool) {
        match self.fraud.evaluate(ctx) {
            Ok(assessment) => {
                let suspicious = self.fraud.is_suspicious(&assessment);
                (assessment, suspicious)
            }
            Err(e) => {
                let reason = format!("fraud scorer unavailable: {}", e);
                match self.config.fraud.failure_policy {
                    FailurePolicy::FailOpen => {
                        warn!("{} for {}, proceeding unscored", reason, ctx.user_id);
                        (
                            Assessment {
                                suspicion_score: 0,
                                reasons: vec![reason],
                            },
                            false,
                        )
                    }
                    FailurePolicy::FlagForReview => {
                        warn!("{} for {}, flagging for review", reason, ctx.user_id);
                        (
                            Assessment {
                                suspicion_score: MAX_SUSPICION,
                                reasons: vec![reason],
                            },
                            true,
                        )
                    }
                }
            }
        }
    }

    // Runs with the user's lock held. On error nothing has changed.
    fn commit(
        &self,
        submission: &Submission,
        action: &ActionDefinition,
        reservation: &Reservation,
        user: &mut UserScore,
        now: u64,
    ) -> Result<(CompletionRecord, RankMove), EngineError> {
        let new_score = user
            .score
            .checked_add(action.reward_amount)
            .ok_or_else(|| EngineError::Overflow(submission.user_id.clone()))?;
        let version = user.version + 1;

        let moved = self.rank.upsert(&submission.user_id, new_score, version)?;

        let record = CompletionRecord {
            user_id: submission.user_id.clone(),
            action_id: submission.action_id.clone(),
            request_id: submission.request_id.clone(),
            reward_applied: action.reward_amount,
            applied_at: now,
            source_ip: submission.source_ip,
            new_score,
            version,
        };

        if let Err(e) = self.ledger.finalize(reservation, record.clone()) {
            self.restore_rank(&submission.user_id, user);
            return Err(e);
        }

        user.score = new_score;
        user.version = version;
        Ok((record, moved))
    }

    // Puts the index entry back to the user's committed state
    fn restore_rank(&self, user_id: &str, user: &UserScore) {
        let restored = if user.version == 0 {
            self.rank.remove(user_id).map(|_| ())
        } else {
            self.rank.upsert(user_id, user.score, user.version).map(|_| ())
        };
        if let Err(e) = restored {
            error!("Failed to restore rank entry of {}: {}", user_id, e);
        }
    }

    // Called with the user's lock held so hub order follows commit order
    fn emit(&self, record: AuditRecord, change: RankChange) {
        if let Some(audit) = &self.audit {
            audit.record(record);
            audit.record(AuditRecord::RankChanged(change.clone()));
        }
        self.hub.publish(change);
    }

    /// Applies an administrative score correction to an existing user
    pub async fn adjust(
        &self,
        user_id: &str,
        delta: i64,
        reason: &str,
    ) -> Result<Adjustment, EngineError> {
        let now = self.clock.now_ms();
        let mut user = self
            .store
            .lock_existing(user_id, self.config.lock_wait)
            .await?;

        let new_score = if delta >= 0 {
            user.score
                .checked_add(delta.unsigned_abs())
                .ok_or_else(|| EngineError::Overflow(user_id.to_string()))?
        } else {
            user.score
                .checked_sub(delta.unsigned_abs())
                .ok_or_else(|| EngineError::InvalidAdjustment {
                    user_id: user_id.to_string(),
                    delta,
                    score: user.score,
                })?
        };
        let version = user.version + 1;
        let previous_score = user.score;

        let moved = self.rank.upsert(user_id, new_score, version)?;
        user.score = new_score;
        user.version = version;

        let adjustment = Adjustment {
            user_id: user_id.to_string(),
            delta,
            reason: reason.to_string(),
            applied_at: now,
            new_score,
            version,
        };
        let change = RankChange {
            user_id: user_id.to_string(),
            previous_rank: moved.previous_rank,
            new_rank: moved.new_rank,
            previous_score,
            new_score,
            version,
            suspicious: false,
            reasons: Vec::new(),
        };
        self.emit(AuditRecord::Adjustment(adjustment.clone()), change);

        info!(
            "Adjusted {} by {} ({}): score {} version {}",
            user_id, delta, reason, new_score, version
        );
        Ok(adjustment)
    }

    /// Rebuilds scores, ranks and request ids from an audit stream. Records at
    /// or below a user's current version are skipped, so replaying twice is
    /// harmless. Returns the number of records applied.
    pub async fn restore(
        &self,
        records: impl IntoIterator<Item = AuditRecord>,
    ) -> Result<usize, EngineError> {
        let catalog = self.catalog();
        let mut applied = 0;

        for record in records {
            let (user_id, at, score, version) = match &record {
                AuditRecord::Completion(c) => (&c.user_id, c.applied_at, c.new_score, c.version),
                AuditRecord::Adjustment(a) => (&a.user_id, a.applied_at, a.new_score, a.version),
                AuditRecord::RankChanged(_) => continue,
            };

            let mut user = self.store.lock(user_id, at, self.config.lock_wait).await?;
            if version <= user.version {
                continue;
            }

            self.rank.upsert(user_id, score, version)?;
            user.score = score;
            user.version = version;

            if let AuditRecord::Completion(completion) = record {
                let cooldown_ms = catalog
                    .get(&completion.action_id)
                    .map(|action| action.cooldown_ms())
                    .unwrap_or(0);
                self.ledger.restore(completion, cooldown_ms);
            }
            applied += 1;
        }

        info!(
            "Restored {} records for {} users",
            applied,
            self.store.len()
        );
        Ok(applied)
    }

    /// Forgets request ids older than the idempotency retention. Cooldowns
    /// still running are kept.
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        let dropped = self
            .ledger
            .prune(now, duration_ms(self.config.idempotency_retention));
        if dropped > 0 {
            debug!("Pruned {} request ids", dropped);
        }
        dropped
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn top_n(&self, n: usize) -> Vec<RankEntry> {
        self.rank.top_n(n)
    }

    pub fn rank_of(&self, user_id: &str) -> Option<u64> {
        self.rank.rank_of(user_id)
    }

    pub fn window(&self, rank: u64, span: usize) -> Vec<RankEntry> {
        self.rank.window(rank, span)
    }

    pub async fn score_of(&self, user_id: &str) -> Option<UserScore> {
        self.store.get(user_id).await
    }

    pub fn user_count(&self) -> usize {
        self.store.len()
    }

    pub async fn total_score(&self) -> u64 {
        self.store.total_score().await
    }

    /// Waits until every change committed so far reached the subscriber
    /// queues and the audit backend
    pub async fn flush(&self) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.flush().await {
                warn!("Audit flush failed: {}", e);
            }
        }
        self.hub.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::error::FraudError;
    use crate::fraud::{FraudRule, RuleHit};
    use crate::utils::ManualClock;
    use shared::HubMessage;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));

    fn catalog() -> ActionCatalog {
        ActionCatalog::from_definitions([
            ActionDefinition::new("a1", 50, 5),
            ActionDefinition::new("daily", 10, 0),
        ])
        .unwrap()
    }

    fn engine_at(start_ms: u64) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let engine = Engine::new(catalog(), EngineConfig::default()).with_clock(clock.clone());
        (engine, clock)
    }

    fn submission(user: &str, action: &str, request: &str) -> Submission {
        Submission::new(user, action, request, IP)
    }

    struct BrokenRule;

    impl FraudRule for BrokenRule {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn evaluate(&self, _ctx: &FraudContext<'_>) -> Result<Option<RuleHit>, FraudError> {
            Err(FraudError::RuleFailed {
                rule: "broken",
                detail: "no data".to_string(),
            })
        }
    }

    fn broken_scorer() -> FraudScorer {
        let mut scorer = FraudScorer::new(70);
        scorer.push_rule(BrokenRule);
        scorer
    }

    #[tokio::test]
    async fn test_accepts_and_ranks() {
        let (engine, _) = engine_at(0);

        let outcome = engine.submit(submission("u1", "a1", "r1")).await;
        match outcome {
            SubmitOutcome::Accepted {
                new_score,
                new_rank,
                version,
                ..
            } => {
                assert_eq!(new_score, 50);
                assert_eq!(new_rank, 1);
                assert_eq!(version, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(engine.rank_of("u1"), Some(1));
        assert_eq!(engine.score_of("u1").await.unwrap().score, 50);
    }

    #[tokio::test]
    async fn test_unknown_action_has_no_side_effects() {
        let (engine, _) = engine_at(0);

        let outcome = engine.submit(submission("u1", "nope", "r1")).await;
        assert_eq!(outcome, SubmitOutcome::rejected(RejectReason::UnknownAction));
        assert_eq!(engine.user_count(), 0);
        assert!(engine.top_n(10).is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back() {
        let (engine, clock) = engine_at(0);
        assert!(engine.submit(submission("u1", "daily", "r1")).await.is_accepted());

        clock.advance(Duration::from_secs(1));
        engine.rank.fail_next_upsert();
        let outcome = engine.submit(submission("u1", "daily", "r2")).await;
        assert_eq!(outcome, SubmitOutcome::rejected(RejectReason::InternalError));

        let user = engine.score_of("u1").await.unwrap();
        assert_eq!((user.score, user.version), (10, 1));
        assert_eq!(engine.top_n(1)[0].score, 10);

        // Reservation was released, the same request id goes through
        let retry = engine.submit(submission("u1", "daily", "r2")).await;
        assert!(retry.is_accepted());
        let user = engine.score_of("u1").await.unwrap();
        assert_eq!((user.score, user.version), (20, 2));
    }

    #[tokio::test]
    async fn test_first_submission_rollback_leaves_user_unranked() {
        let (engine, _) = engine_at(0);
        engine.rank.fail_next_upsert();

        let outcome = engine.submit(submission("u1", "a1", "r1")).await;
        assert_eq!(outcome, SubmitOutcome::rejected(RejectReason::InternalError));
        assert_eq!(engine.rank_of("u1"), None);

        // Cooldown was not consumed by the failed attempt
        assert!(engine.submit(submission("u1", "a1", "r1")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_fail_open_scorer() {
        let (engine, _) = engine_at(0);
        let engine = engine.with_fraud_scorer(broken_scorer());

        match engine.submit(submission("u1", "a1", "r1")).await {
            SubmitOutcome::Accepted {
                suspicious,
                suspicion_score,
                reasons,
                ..
            } => {
                assert!(!suspicious);
                assert_eq!(suspicion_score, 0);
                assert!(reasons[0].starts_with("fraud scorer unavailable"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flag_for_review_scorer() {
        let mut config = EngineConfig::default();
        config.fraud.failure_policy = FailurePolicy::FlagForReview;
        let engine = Engine::new(catalog(), config)
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_fraud_scorer(broken_scorer());

        match engine.submit(submission("u1", "a1", "r1")).await {
            SubmitOutcome::Accepted {
                suspicious,
                new_score,
                ..
            } => {
                assert!(suspicious);
                assert_eq!(new_score, 50);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_busy_when_user_locked() {
        let mut config = EngineConfig::default();
        config.lock_wait = Duration::from_millis(20);
        let engine = Engine::new(catalog(), config).with_clock(Arc::new(ManualClock::new(0)));

        let _held = engine
            .store
            .lock("u1", 0, Duration::from_millis(20))
            .await
            .unwrap();
        let outcome = engine.submit(submission("u1", "a1", "r1")).await;
        assert_eq!(outcome, SubmitOutcome::rejected(RejectReason::Busy));
        assert_eq!(engine.ledger.applied("u1", "r1"), None);
    }

    #[tokio::test]
    async fn test_adjust_below_zero_rejected() {
        let (engine, _) = engine_at(0);
        engine.submit(submission("u1", "daily", "r1")).await;

        let result = engine.adjust("u1", -11, "chargeback").await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidAdjustment { score: 10, .. })
        ));
        let user = engine.score_of("u1").await.unwrap();
        assert_eq!((user.score, user.version), (10, 1));

        let adjustment = engine.adjust("u1", -10, "chargeback").await.unwrap();
        assert_eq!(adjustment.new_score, 0);
        assert_eq!(adjustment.version, 2);
        assert!(matches!(
            engine.adjust("ghost", 5, "bonus").await,
            Err(EngineError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn test_adjustment_is_broadcast_and_audited() {
        let log = Arc::new(MemoryAuditLog::new());
        let (engine, _) = engine_at(0);
        let engine = engine.with_audit_log(log.clone());
        let mut subscription = engine.subscribe();

        engine.submit(submission("u1", "daily", "r1")).await;
        engine.adjust("u1", 5, "bonus").await.unwrap();
        engine.flush().await;

        let first = subscription.try_recv();
        let second = subscription.try_recv();
        match (first, second) {
            (Some(HubMessage::Change(a)), Some(HubMessage::Change(b))) => {
                assert_eq!((a.version, a.new_score), (1, 10));
                assert_eq!((b.version, b.new_score, b.previous_score), (2, 15, 10));
            }
            other => panic!("unexpected messages {:?}", other),
        }

        let records = log.records();
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], AuditRecord::Completion(_)));
        assert!(matches!(records[2], AuditRecord::Adjustment(_)));
    }

    #[tokio::test]
    async fn test_replace_catalog() {
        let (engine, _) = engine_at(0);
        engine.replace_catalog(
            ActionCatalog::from_definitions([ActionDefinition::new("quest", 7, 0)]).unwrap(),
        );

        let outcome = engine.submit(submission("u1", "a1", "r1")).await;
        assert_eq!(outcome, SubmitOutcome::rejected(RejectReason::UnknownAction));
        assert!(engine.submit(submission("u1", "quest", "r2")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_registered_account_age() {
        let day = 24 * 60 * 60 * 1_000;
        let (engine, _) = engine_at(2 * day);
        engine.register_user("veteran", 0).unwrap();

        let reasons = |outcome: SubmitOutcome| match outcome {
            SubmitOutcome::Accepted { reasons, .. } => reasons,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(reasons(engine.submit(submission("veteran", "a1", "r1")).await).is_empty());
        assert_eq!(
            reasons(engine.submit(submission("newbie", "a1", "r1")).await).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_prune_forgets_old_requests() {
        let (engine, clock) = engine_at(0);
        engine.submit(submission("u1", "daily", "r1")).await;

        clock.advance(Duration::from_secs(25 * 60 * 60));
        assert_eq!(engine.prune(), 1);
        assert!(engine.submit(submission("u1", "daily", "r1")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_prune_keeps_weekly_cooldown() {
        let week = 7 * 24 * 60 * 60;
        let (engine, clock) = engine_at(0);
        engine.replace_catalog(
            ActionCatalog::from_definitions([ActionDefinition::new("weekly", 100, week)]).unwrap(),
        );
        assert!(engine.submit(submission("u1", "weekly", "r1")).await.is_accepted());

        clock.advance(Duration::from_secs(25 * 60 * 60));
        let on_cooldown = SubmitOutcome::Rejected {
            reason: RejectReason::Cooldown,
            retry_after: Some(week * 1_000),
        };
        assert_eq!(engine.submit(submission("u1", "weekly", "r2")).await, on_cooldown);

        assert_eq!(engine.prune(), 1);
        assert_eq!(engine.submit(submission("u1", "weekly", "r3")).await, on_cooldown);
        assert_eq!(engine.score_of("u1").await.map(|user| user.score), Some(100));

        clock.set(week * 1_000);
        assert!(engine.submit(submission("u1", "weekly", "r4")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_restore_keeps_weekly_cooldown() {
        let week = 7 * 24 * 60 * 60;
        let weekly = || {
            ActionCatalog::from_definitions([ActionDefinition::new("weekly", 100, week)]).unwrap()
        };
        let (original, _) = engine_at(0);
        original.replace_catalog(weekly());
        let log = Arc::new(MemoryAuditLog::new());
        let original = original.with_audit_log(log.clone());
        assert!(original.submit(submission("u1", "weekly", "r1")).await.is_accepted());
        original.flush().await;

        let (restored, _) = engine_at(25 * 60 * 60 * 1_000);
        restored.replace_catalog(weekly());
        assert_eq!(restored.restore(log.records()).await.unwrap(), 1);
        restored.prune();

        let outcome = restored.submit(submission("u1", "weekly", "r2")).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected {
                reason: RejectReason::Cooldown,
                retry_after: Some(week * 1_000),
            }
        );
    }
}
