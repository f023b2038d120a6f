//! Idempotency and cooldown gate
//!
//! The ledger remembers every request id a user has had applied and when each
//! action was last completed. [`IdempotencyLedger::check_and_reserve`] is an
//! atomic test-and-set per user: the user's entry stays locked for the whole
//! check, so two identical submissions racing each other cannot both be
//! accepted. An accepted submission holds a [`Reservation`] until the commit
//! either finalizes it into a [`CompletionRecord`] or releases it.

use crate::error::EngineError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::{ActionId, CompletionRecord, RequestId, Submission, UserId};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

/// Result of replaying a request id that was already seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replay {
    /// The original submission was applied with this result
    Applied(CompletionRecord),
    /// The original submission is still being committed
    Pending,
}

/// Outcome of the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Accepted {
        reservation: Reservation,
        history: UserHistory,
    },
    Duplicate(Replay),
    OnCooldown {
        retry_after: u64,
    },
}

/// Slot held by an accepted submission until commit or rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: UserId,
    pub action_id: ActionId,
    pub request_id: RequestId,
    pub reserved_at: u64,
    /// Cooldown of the action when the gate let the submission through
    pub cooldown_ms: u64,
    pub source_ip: IpAddr,
    /// Origin recorded before this reservation, put back on release
    pub previous_origin: Option<IpAddr>,
}

/// Recent activity of a user, as seen by the fraud scorer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserHistory {
    /// Applied completions, oldest first
    pub recent: Vec<CompletionRecord>,
    /// Origin of the submission that passed the gate before this one
    pub previous_origin: Option<IpAddr>,
}

#[derive(Debug, Clone)]
enum RequestState {
    InFlight { action_id: ActionId, reserved_at: u64 },
    Applied(CompletionRecord),
}

/// Last completion of an action and the end of the cooldown it started
#[derive(Debug, Clone, Copy)]
struct CooldownStamp {
    applied_at: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct UserLedger {
    requests: HashMap<RequestId, RequestState>,
    last_applied: HashMap<ActionId, CooldownStamp>,
    /// Reservation times of in-flight requests per action
    in_flight: HashMap<ActionId, Vec<u64>>,
    recent: VecDeque<CompletionRecord>,
    last_origin: Option<IpAddr>,
}

impl UserLedger {
    /// Latest completion or in-flight reservation of `action_id`
    fn latest_activity(&self, action_id: &str) -> Option<u64> {
        let pending = self
            .in_flight
            .get(action_id)
            .and_then(|reserved| reserved.iter().max().copied());
        let applied = self.last_applied.get(action_id).map(|stamp| stamp.applied_at);

        match (applied, pending) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn reserve(&mut self, submission: &Submission, now: u64) {
        self.in_flight
            .entry(submission.action_id.clone())
            .or_default()
            .push(now);
        self.requests.insert(
            submission.request_id.clone(),
            RequestState::InFlight {
                action_id: submission.action_id.clone(),
                reserved_at: now,
            },
        );
    }

    /// Drops an in-flight request, returning false if it was not in flight
    fn take_in_flight(&mut self, request_id: &str) -> bool {
        let (action_id, reserved_at) = match self.requests.get(request_id) {
            Some(RequestState::InFlight {
                action_id,
                reserved_at,
            }) => (action_id.clone(), *reserved_at),
            _ => return false,
        };
        self.requests.remove(request_id);

        if let Some(pending) = self.in_flight.get_mut(&action_id) {
            if let Some(pos) = pending.iter().position(|at| *at == reserved_at) {
                pending.swap_remove(pos);
            }
            if pending.is_empty() {
                self.in_flight.remove(&action_id);
            }
        }
        true
    }

    fn record_completion(&mut self, record: CompletionRecord, cooldown_ms: u64, history_len: usize) {
        let expires_at = record.applied_at.saturating_add(cooldown_ms);
        let stamp = self
            .last_applied
            .entry(record.action_id.clone())
            .or_insert(CooldownStamp {
                applied_at: record.applied_at,
                expires_at,
            });
        stamp.applied_at = stamp.applied_at.max(record.applied_at);
        stamp.expires_at = stamp.expires_at.max(expires_at);

        self.recent.push_back(record.clone());
        while self.recent.len() > history_len {
            self.recent.pop_front();
        }

        self.requests
            .insert(record.request_id.clone(), RequestState::Applied(record));
    }
}

pub struct IdempotencyLedger {
    users: DashMap<UserId, UserLedger>,
    /// Completions kept per user for fraud history
    history_len: usize,
}

impl IdempotencyLedger {
    pub fn new(history_len: usize) -> Self {
        Self {
            users: DashMap::new(),
            history_len: history_len.max(1),
        }
    }

    /// Checks for a replayed request id, then for the action cooldown, and
    /// reserves the request if both pass
    pub fn check_and_reserve(&self, submission: &Submission, cooldown_ms: u64, now: u64) -> Gate {
        let mut ledger = self.users.entry(submission.user_id.clone()).or_default();

        if let Some(state) = ledger.requests.get(&submission.request_id) {
            let replay = match state {
                RequestState::Applied(record) => Replay::Applied(record.clone()),
                RequestState::InFlight { .. } => Replay::Pending,
            };
            return Gate::Duplicate(replay);
        }

        if cooldown_ms > 0 {
            if let Some(latest) = ledger.latest_activity(&submission.action_id) {
                let retry_after = latest.saturating_add(cooldown_ms);
                if now < retry_after {
                    return Gate::OnCooldown { retry_after };
                }
            }
        }

        let history = UserHistory {
            recent: ledger.recent.iter().cloned().collect(),
            previous_origin: ledger.last_origin,
        };

        ledger.last_origin = Some(submission.source_ip);
        ledger.reserve(submission, now);

        Gate::Accepted {
            reservation: Reservation {
                user_id: submission.user_id.clone(),
                action_id: submission.action_id.clone(),
                request_id: submission.request_id.clone(),
                reserved_at: now,
                cooldown_ms,
                source_ip: submission.source_ip,
                previous_origin: history.previous_origin,
            },
            history,
        }
    }

    /// Turns a reservation into an applied completion
    pub fn finalize(
        &self,
        reservation: &Reservation,
        record: CompletionRecord,
    ) -> Result<(), EngineError> {
        let mut ledger = self
            .users
            .get_mut(&reservation.user_id)
            .ok_or_else(|| EngineError::ReservationLost(reservation.user_id.clone()))?;

        if !ledger.take_in_flight(&reservation.request_id) {
            return Err(EngineError::ReservationLost(reservation.user_id.clone()));
        }

        ledger.record_completion(record, reservation.cooldown_ms, self.history_len);
        Ok(())
    }

    /// Rolls a reservation back so the same request id can be retried. The
    /// origin goes back to what it was unless a later gate replaced it.
    pub fn release(&self, reservation: &Reservation) {
        if let Some(mut ledger) = self.users.get_mut(&reservation.user_id) {
            if ledger.take_in_flight(&reservation.request_id)
                && ledger.last_origin == Some(reservation.source_ip)
            {
                ledger.last_origin = reservation.previous_origin;
            }
        }
    }

    /// Re-seeds request ids and cooldowns from an audited completion
    pub fn restore(&self, record: CompletionRecord, cooldown_ms: u64) {
        let mut ledger = self.users.entry(record.user_id.clone()).or_default();
        ledger.last_origin = Some(record.source_ip);
        ledger.record_completion(record, cooldown_ms, self.history_len);
    }

    /// Recent completions and last seen origin of a user
    pub fn history(&self, user_id: &str) -> UserHistory {
        self.users
            .get(user_id)
            .map(|ledger| UserHistory {
                recent: ledger.recent.iter().cloned().collect(),
                previous_origin: ledger.last_origin,
            })
            .unwrap_or_default()
    }

    pub fn applied(&self, user_id: &str, request_id: &str) -> Option<CompletionRecord> {
        let ledger = self.users.get(user_id)?;
        match ledger.requests.get(request_id) {
            Some(RequestState::Applied(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// Number of requests of `action_id` currently in flight for a user
    pub fn in_flight(&self, user_id: &str, action_id: &str) -> usize {
        self.users
            .get(user_id)
            .and_then(|ledger| ledger.in_flight.get(action_id).map(Vec::len))
            .unwrap_or(0)
    }

    /// Forgets applied request ids older than `retention_ms`. Cooldown stamps
    /// stay while their cooldown is running, however long it is. In-flight
    /// reservations are never pruned. Returns the number of request ids
    /// dropped.
    pub fn prune(&self, now: u64, retention_ms: u64) -> usize {
        let cutoff = now.saturating_sub(retention_ms);
        let mut dropped = 0;

        self.users.retain(|_, ledger| {
            let before = ledger.requests.len();
            ledger.requests.retain(|_, state| match state {
                RequestState::InFlight { .. } => true,
                RequestState::Applied(record) => record.applied_at > cutoff,
            });
            dropped += before - ledger.requests.len();

            ledger
                .last_applied
                .retain(|_, stamp| stamp.applied_at > cutoff || stamp.expires_at > now);
            ledger.recent.retain(|record| record.applied_at > cutoff);

            !ledger.requests.is_empty() || !ledger.last_applied.is_empty()
        });

        dropped
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn submission(user: &str, action: &str, request: &str) -> Submission {
        Submission {
            user_id: user.to_string(),
            action_id: action.to_string(),
            client_timestamp: 0,
            request_id: request.to_string(),
            source_ip: ip(1),
        }
    }

    fn record_for(reservation: &Reservation, reward: u64, at: u64) -> CompletionRecord {
        CompletionRecord {
            user_id: reservation.user_id.clone(),
            action_id: reservation.action_id.clone(),
            request_id: reservation.request_id.clone(),
            reward_applied: reward,
            applied_at: at,
            source_ip: ip(1),
            new_score: reward,
            version: 1,
        }
    }

    fn reservation(user: &str, action: &str, request: &str, at: u64) -> Reservation {
        Reservation {
            user_id: user.to_string(),
            action_id: action.to_string(),
            request_id: request.to_string(),
            reserved_at: at,
            cooldown_ms: 0,
            source_ip: ip(1),
            previous_origin: None,
        }
    }

    fn accept(gate: Gate) -> (Reservation, UserHistory) {
        match gate {
            Gate::Accepted {
                reservation,
                history,
            } => (reservation, history),
            other => panic!("Expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_first_submission_accepted() {
        let ledger = IdempotencyLedger::new(8);
        let (reservation, history) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 5_000, 0));

        assert_eq!(reservation.request_id, "r1");
        assert!(history.recent.is_empty());
        assert_eq!(history.previous_origin, None);
    }

    #[test]
    fn test_in_flight_duplicate_is_pending() {
        let ledger = IdempotencyLedger::new(8);
        let sub = submission("u1", "a1", "r1");
        accept(ledger.check_and_reserve(&sub, 0, 0));

        assert_eq!(
            ledger.check_and_reserve(&sub, 0, 10),
            Gate::Duplicate(Replay::Pending)
        );
    }

    #[test]
    fn test_finalized_duplicate_replays_record() {
        let ledger = IdempotencyLedger::new(8);
        let sub = submission("u1", "a1", "r1");
        let (reservation, _) = accept(ledger.check_and_reserve(&sub, 5_000, 0));
        let record = record_for(&reservation, 50, 0);
        ledger.finalize(&reservation, record.clone()).unwrap();

        assert_eq!(
            ledger.check_and_reserve(&sub, 5_000, 1_000),
            Gate::Duplicate(Replay::Applied(record.clone()))
        );
        assert_eq!(ledger.applied("u1", "r1"), Some(record));
    }

    #[test]
    fn test_cooldown_blocks_until_expiry() {
        let ledger = IdempotencyLedger::new(8);
        let (reservation, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 5_000, 0));
        ledger
            .finalize(&reservation, record_for(&reservation, 50, 0))
            .unwrap();

        assert_eq!(
            ledger.check_and_reserve(&submission("u1", "a1", "r2"), 5_000, 2_000),
            Gate::OnCooldown { retry_after: 5_000 }
        );

        // The rejected request id was not remembered
        accept(ledger.check_and_reserve(&submission("u1", "a1", "r2"), 5_000, 6_000));
    }

    #[test]
    fn test_in_flight_reservation_counts_for_cooldown() {
        let ledger = IdempotencyLedger::new(8);
        accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 5_000, 100));

        assert_eq!(
            ledger.check_and_reserve(&submission("u1", "a1", "r2"), 5_000, 200),
            Gate::OnCooldown { retry_after: 5_100 }
        );
    }

    #[test]
    fn test_cooldown_is_per_action_and_user() {
        let ledger = IdempotencyLedger::new(8);
        accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 5_000, 0));

        accept(ledger.check_and_reserve(&submission("u1", "a2", "r2"), 5_000, 0));
        accept(ledger.check_and_reserve(&submission("u2", "a1", "r1"), 5_000, 0));
    }

    #[test]
    fn test_release_allows_retry() {
        let ledger = IdempotencyLedger::new(8);
        let sub = submission("u1", "a1", "r1");
        let (reservation, _) = accept(ledger.check_and_reserve(&sub, 5_000, 0));

        ledger.release(&reservation);

        accept(ledger.check_and_reserve(&sub, 5_000, 1));
    }

    #[test]
    fn test_release_does_not_touch_applied_request() {
        let ledger = IdempotencyLedger::new(8);
        let (reservation, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 0, 0));
        ledger
            .finalize(&reservation, record_for(&reservation, 5, 0))
            .unwrap();

        ledger.release(&reservation);

        assert!(ledger.applied("u1", "r1").is_some());
    }

    #[test]
    fn test_finalize_without_reservation_fails() {
        let ledger = IdempotencyLedger::new(8);
        let reservation = reservation("u1", "a1", "r1", 0);

        let result = ledger.finalize(&reservation, record_for(&reservation, 5, 0));
        assert!(matches!(result, Err(EngineError::ReservationLost(_))));
    }

    #[test]
    fn test_history_tracks_origin_and_completions() {
        let ledger = IdempotencyLedger::new(2);

        for (i, request) in ["r1", "r2", "r3"].iter().enumerate() {
            let mut sub = submission("u1", "a1", request);
            sub.source_ip = ip(i as u8 + 1);
            let (reservation, history) = accept(ledger.check_and_reserve(&sub, 0, i as u64));
            if i > 0 {
                assert_eq!(history.previous_origin, Some(ip(i as u8)));
            }
            ledger
                .finalize(&reservation, record_for(&reservation, 10, i as u64))
                .unwrap();
        }

        let (_, history) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r4"), 0, 9));
        assert_eq!(history.recent.len(), 2);
        assert_eq!(history.recent[0].request_id, "r2");
        assert_eq!(history.recent[1].request_id, "r3");
    }

    #[test]
    fn test_prune_forgets_old_requests_only() {
        let ledger = IdempotencyLedger::new(8);
        let (old, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "old"), 0, 0));
        ledger.finalize(&old, record_for(&old, 5, 0)).unwrap();
        accept(ledger.check_and_reserve(&submission("u2", "a1", "pending"), 0, 0));

        let dropped = ledger.prune(10_000, 1_000);

        assert_eq!(dropped, 1);
        assert!(ledger.applied("u1", "old").is_none());
        assert_eq!(ledger.user_count(), 1);
        assert_eq!(
            ledger.check_and_reserve(&submission("u2", "a1", "pending"), 0, 10_000),
            Gate::Duplicate(Replay::Pending)
        );
    }

    #[test]
    fn test_in_flight_cleared_on_finalize_and_release() {
        let ledger = IdempotencyLedger::new(8);
        let (first, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 0, 0));
        let (second, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r2"), 0, 5));
        assert_eq!(ledger.in_flight("u1", "a1"), 2);

        ledger
            .finalize(&first, record_for(&first, 5, 0))
            .unwrap();
        assert_eq!(ledger.in_flight("u1", "a1"), 1);

        ledger.release(&second);
        assert_eq!(ledger.in_flight("u1", "a1"), 0);

        // A released reservation no longer holds the cooldown; the applied one does
        assert_eq!(
            ledger.check_and_reserve(&submission("u1", "a1", "r3"), 1_000, 500),
            Gate::OnCooldown { retry_after: 1_000 }
        );
    }

    #[test]
    fn test_release_restores_previous_origin() {
        let ledger = IdempotencyLedger::new(8);
        let (applied, _) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r1"), 0, 0));
        ledger
            .finalize(&applied, record_for(&applied, 5, 0))
            .unwrap();

        let mut elsewhere = submission("u1", "a1", "r2");
        elsewhere.source_ip = ip(9);
        let (failed, history) = accept(ledger.check_and_reserve(&elsewhere, 0, 10));
        assert_eq!(history.previous_origin, Some(ip(1)));
        assert_eq!(ledger.history("u1").previous_origin, Some(ip(9)));

        ledger.release(&failed);

        assert_eq!(ledger.history("u1").previous_origin, Some(ip(1)));
        let (_, history) = accept(ledger.check_and_reserve(&submission("u1", "a1", "r3"), 0, 20));
        assert_eq!(history.previous_origin, Some(ip(1)));
    }

    #[test]
    fn test_prune_keeps_cooldowns_longer_than_retention() {
        let ledger = IdempotencyLedger::new(8);
        let week = 7 * 24 * 3_600_000;
        let (weekly, _) = accept(ledger.check_and_reserve(&submission("u1", "weekly", "r1"), week, 0));
        ledger
            .finalize(&weekly, record_for(&weekly, 100, 0))
            .unwrap();
        let (daily, _) = accept(ledger.check_and_reserve(&submission("u1", "daily", "r2"), 1_000, 0));
        ledger
            .finalize(&daily, record_for(&daily, 10, 0))
            .unwrap();

        // Request ids age out after the retention; the weekly cooldown does not
        let now = 25 * 3_600_000;
        assert_eq!(ledger.prune(now, 24 * 3_600_000), 2);
        assert!(ledger.applied("u1", "r1").is_none());
        assert_eq!(ledger.user_count(), 1);

        assert_eq!(
            ledger.check_and_reserve(&submission("u1", "weekly", "r3"), week, now),
            Gate::OnCooldown { retry_after: week }
        );
        accept(ledger.check_and_reserve(&submission("u1", "daily", "r4"), 1_000, now));

        // Once the cooldown has run out the stamp goes too
        ledger.prune(week + 1, 24 * 3_600_000);
        accept(ledger.check_and_reserve(&submission("u1", "weekly", "r5"), week, week + 1));
    }

    #[test]
    fn test_restore_seeds_duplicates_and_cooldown() {
        let ledger = IdempotencyLedger::new(8);
        let reservation = reservation("u1", "a1", "r1", 1_000);
        ledger.restore(record_for(&reservation, 50, 1_000), 5_000);

        assert!(matches!(
            ledger.check_and_reserve(&submission("u1", "a1", "r1"), 5_000, 2_000),
            Gate::Duplicate(Replay::Applied(_))
        ));
        assert_eq!(
            ledger.check_and_reserve(&submission("u1", "a1", "r2"), 5_000, 2_000),
            Gate::OnCooldown { retry_after: 6_000 }
        );

        let history = ledger.history("u1");
        assert_eq!(history.recent.len(), 1);
        assert_eq!(history.previous_origin, Some(ip(1)));
        assert_eq!(ledger.history("nobody"), UserHistory::default());
    }

    #[test]
    fn test_concurrent_identical_submissions_accept_once() {
        let ledger = Arc::new(IdempotencyLedger::new(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    matches!(
                        ledger.check_and_reserve(&submission("u1", "a1", "r1"), 0, 0),
                        Gate::Accepted { .. }
                    )
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
    }
}
