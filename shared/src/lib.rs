use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type UserId = String;
pub type ActionId = String;
pub type RequestId = String;

pub const MILLIS_PER_SECOND: u64 = 1_000;

/// Reward and cooldown for one action, as loaded into the catalog snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ActionDefinition {
    pub action_id: ActionId,
    pub reward_amount: u64,
    pub cooldown_seconds: u64,
}

impl ActionDefinition {
    pub fn new(action_id: impl Into<ActionId>, reward_amount: u64, cooldown_seconds: u64) -> Self {
        Self {
            action_id: action_id.into(),
            reward_amount,
            cooldown_seconds,
        }
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_seconds.saturating_mul(MILLIS_PER_SECOND)
    }
}

/// One "action completed" request from an already authenticated user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Submission {
    pub user_id: UserId,
    pub action_id: ActionId,
    pub client_timestamp: u64,
    pub request_id: RequestId,
    pub source_ip: IpAddr,
}

impl Submission {
    pub fn new(
        user_id: impl Into<UserId>,
        action_id: impl Into<ActionId>,
        request_id: impl Into<RequestId>,
        source_ip: IpAddr,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action_id: action_id.into(),
            client_timestamp: get_timestamp(),
            request_id: request_id.into(),
            source_ip,
        }
    }
}

/// Append-only fact written once per applied submission.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub user_id: UserId,
    pub action_id: ActionId,
    pub request_id: RequestId,
    pub reward_applied: u64,
    pub applied_at: u64,
    pub source_ip: IpAddr,
    pub new_score: u64,
    pub version: u64,
}

/// Administrative score delta, audited like a completion.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub user_id: UserId,
    pub delta: i64,
    pub reason: String,
    pub applied_at: u64,
    pub new_score: u64,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RankEntry {
    pub user_id: UserId,
    pub score: u64,
    pub version: u64,
    /// 1-based position in the leaderboard
    pub rank: u64,
}

/// One user's score/rank transition, emitted once per applied mutation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RankChange {
    pub user_id: UserId,
    pub previous_rank: Option<u64>,
    pub new_rank: u64,
    pub previous_score: u64,
    pub new_score: u64,
    pub version: u64,
    pub suspicious: bool,
    pub reasons: Vec<String>,
}

impl RankChange {
    /// Whether this change enters, leaves or moves inside the first `top_n` ranks.
    pub fn touches_top(&self, top_n: u64) -> bool {
        let inside = |rank: u64| rank >= 1 && rank <= top_n;
        inside(self.new_rank) || self.previous_rank.map_or(false, inside)
    }
}

/// What a subscriber receives from the broadcast hub.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum HubMessage {
    Change(RankChange),
    /// Events were dropped for this subscriber; re-fetch the top-N.
    Refresh,
}

/// Records handed to the durable audit log after a commit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum AuditRecord {
    Completion(CompletionRecord),
    Adjustment(Adjustment),
    RankChanged(RankChange),
}

impl AuditRecord {
    pub fn user_id(&self) -> &str {
        match self {
            AuditRecord::Completion(record) => &record.user_id,
            AuditRecord::Adjustment(adjustment) => &adjustment.user_id,
            AuditRecord::RankChanged(change) => &change.user_id,
        }
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
