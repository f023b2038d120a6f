//! Incrementally maintained leaderboard
//!
//! Users are ordered by `(score DESC, version ASC, user_id ASC)`: among equal
//! scores the user whose version was lower when reaching it ranks first, and
//! the user id makes the order total. The ordered structure is a treap whose
//! nodes carry subtree sizes, so rank lookups and positional reads are
//! logarithmic. A map from user id to the user's current key lets an upsert
//! remove the old key and insert the new one in the same critical section.
//!
//! Every operation runs under one `RwLock`. Writers are serialized and never
//! suspend while holding it; readers observe a single point-in-time state.

use crate::error::RankError;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{RankEntry, UserId};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankKey {
    pub score: u64,
    pub version: u64,
    pub user_id: UserId,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.user_id.cmp(&other.user_id))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Where a user was and is after an upsert; ranks are 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankMove {
    pub previous_rank: Option<u64>,
    pub new_rank: u64,
}

#[derive(Debug)]
struct Node {
    key: RankKey,
    priority: u64,
    size: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Arena allocated treap with subtree sizes
struct Treap {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Option<usize>,
    rng: StdRng,
}

impl Treap {
    fn new(rng: StdRng) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            rng,
        }
    }

    fn len(&self) -> usize {
        self.size(self.root)
    }

    fn size(&self, node: Option<usize>) -> usize {
        node.map_or(0, |i| self.nodes[i].size)
    }

    fn update(&mut self, i: usize) {
        self.nodes[i].size = 1 + self.size(self.nodes[i].left) + self.size(self.nodes[i].right);
    }

    fn alloc(&mut self, key: RankKey) -> usize {
        let node = Node {
            key,
            priority: self.rng.gen(),
            size: 1,
            left: None,
            right: None,
        };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Splits into keys `< key` and keys `>= key`
    fn split(&mut self, node: Option<usize>, key: &RankKey) -> (Option<usize>, Option<usize>) {
        let Some(i) = node else {
            return (None, None);
        };
        if self.nodes[i].key < *key {
            let (l, r) = self.split(self.nodes[i].right, key);
            self.nodes[i].right = l;
            self.update(i);
            (Some(i), r)
        } else {
            let (l, r) = self.split(self.nodes[i].left, key);
            self.nodes[i].left = r;
            self.update(i);
            (l, Some(i))
        }
    }

    /// Every key in `a` must sort before every key in `b`
    fn merge(&mut self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(x), Some(y)) => {
                if self.nodes[x].priority > self.nodes[y].priority {
                    let right = self.merge(self.nodes[x].right, Some(y));
                    self.nodes[x].right = right;
                    self.update(x);
                    Some(x)
                } else {
                    let left = self.merge(Some(x), self.nodes[y].left);
                    self.nodes[y].left = left;
                    self.update(y);
                    Some(y)
                }
            }
        }
    }

    fn insert(&mut self, key: RankKey) {
        let (l, r) = self.split(self.root, &key);
        let node = self.alloc(key);
        let left = self.merge(l, Some(node));
        self.root = self.merge(left, r);
    }

    /// Returns false if the key was not present
    fn remove(&mut self, key: &RankKey) -> bool {
        let (removed, root) = self.remove_from(self.root, key);
        self.root = root;
        removed
    }

    fn remove_from(&mut self, node: Option<usize>, key: &RankKey) -> (bool, Option<usize>) {
        let Some(i) = node else {
            return (false, None);
        };
        match key.cmp(&self.nodes[i].key) {
            Ordering::Equal => {
                let merged = self.merge(self.nodes[i].left, self.nodes[i].right);
                self.free.push(i);
                (true, merged)
            }
            Ordering::Less => {
                let (removed, left) = self.remove_from(self.nodes[i].left, key);
                self.nodes[i].left = left;
                self.update(i);
                (removed, Some(i))
            }
            Ordering::Greater => {
                let (removed, right) = self.remove_from(self.nodes[i].right, key);
                self.nodes[i].right = right;
                self.update(i);
                (removed, Some(i))
            }
        }
    }

    /// Number of keys ordered before `key`
    fn count_before(&self, key: &RankKey) -> usize {
        let mut count = 0;
        let mut node = self.root;
        while let Some(i) = node {
            if self.nodes[i].key < *key {
                count += self.size(self.nodes[i].left) + 1;
                node = self.nodes[i].right;
            } else {
                node = self.nodes[i].left;
            }
        }
        count
    }

    /// In-order keys from 0-based position `start`, at most `count` of them
    fn range(&self, start: usize, count: usize) -> Vec<&RankKey> {
        let mut out = Vec::with_capacity(count.min(self.len().saturating_sub(start)));
        if start >= self.len() || count == 0 {
            return out;
        }

        // Descend to position `start`, keeping the ancestors that follow it
        let mut stack = Vec::new();
        let mut node = self.root;
        let mut k = start;
        while let Some(i) = node {
            let left = self.size(self.nodes[i].left);
            match k.cmp(&left) {
                Ordering::Less => {
                    stack.push(i);
                    node = self.nodes[i].left;
                }
                Ordering::Equal => {
                    stack.push(i);
                    break;
                }
                Ordering::Greater => {
                    k -= left + 1;
                    node = self.nodes[i].right;
                }
            }
        }

        while out.len() < count {
            let Some(i) = stack.pop() else {
                break;
            };
            out.push(&self.nodes[i].key);
            let mut next = self.nodes[i].right;
            while let Some(j) = next {
                stack.push(j);
                next = self.nodes[j].left;
            }
        }
        out
    }
}

struct IndexState {
    tree: Treap,
    keys: HashMap<UserId, RankKey>,
}

impl IndexState {
    fn entry(key: &RankKey, rank: usize) -> RankEntry {
        RankEntry {
            user_id: key.user_id.clone(),
            score: key.score,
            version: key.version,
            rank: rank as u64,
        }
    }

    fn rank(&self, key: &RankKey) -> u64 {
        self.tree.count_before(key) as u64 + 1
    }

    fn remove_user(&mut self, user_id: &str) -> Result<Option<u64>, RankError> {
        let Some(old) = self.keys.get(user_id) else {
            return Ok(None);
        };
        let rank = self.rank(old);
        if !self.tree.remove(old) {
            return Err(RankError::Inconsistent(user_id.to_string()));
        }
        self.keys.remove(user_id);
        Ok(Some(rank))
    }
}

pub struct RankIndex {
    state: RwLock<IndexState>,
    #[cfg(test)]
    fail_next_upsert: std::sync::atomic::AtomicBool,
}

impl RankIndex {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Index with reproducible tree shapes
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: RwLock::new(IndexState {
                tree: Treap::new(rng),
                keys: HashMap::new(),
            }),
            #[cfg(test)]
            fail_next_upsert: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_upsert(&self) {
        self.fail_next_upsert
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> bool {
        self.fail_next_upsert
            .swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> bool {
        false
    }

    /// Moves `user_id` to its new key, removing the old one first
    pub fn upsert(&self, user_id: &str, score: u64, version: u64) -> Result<RankMove, RankError> {
        if self.injected_failure() {
            return Err(RankError::Inconsistent(user_id.to_string()));
        }

        let mut state = self.state.write();
        let previous_rank = state.remove_user(user_id)?;

        let key = RankKey {
            score,
            version,
            user_id: user_id.to_string(),
        };
        state.tree.insert(key.clone());
        let new_rank = state.rank(&key);
        state.keys.insert(key.user_id.clone(), key);

        Ok(RankMove {
            previous_rank,
            new_rank,
        })
    }

    /// Drops a user from the ranking, returning the rank it held
    pub fn remove(&self, user_id: &str) -> Result<Option<u64>, RankError> {
        self.state.write().remove_user(user_id)
    }

    pub fn top_n(&self, n: usize) -> Vec<RankEntry> {
        self.window(1, n)
    }

    /// `span` entries starting at 1-based `rank`; rank 0 is treated as 1
    pub fn window(&self, rank: u64, span: usize) -> Vec<RankEntry> {
        let start = rank.saturating_sub(1) as usize;
        let state = self.state.read();
        state
            .tree
            .range(start, span)
            .into_iter()
            .enumerate()
            .map(|(offset, key)| IndexState::entry(key, start + offset + 1))
            .collect()
    }

    pub fn rank_of(&self, user_id: &str) -> Option<u64> {
        let state = self.state.read();
        state.keys.get(user_id).map(|key| state.rank(key))
    }

    pub fn entry(&self, user_id: &str) -> Option<RankEntry> {
        let state = self.state.read();
        let key = state.keys.get(user_id)?;
        Some(IndexState::entry(key, state.rank(key) as usize))
    }

    pub fn len(&self) -> usize {
        self.state.read().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RankIndex {
    fn default() -> Self {
        Self::new()
    }
}
