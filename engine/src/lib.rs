//! # Leaderboard Engine Library
//!
//! This library implements the score-update and live-leaderboard pipeline of a
//! competitive scoring service. Many users concurrently report completed
//! actions; the engine applies every reward exactly once, annotates
//! implausible submissions, keeps an exact ranking of all users and streams
//! ranking changes to live observers.
//!
//! ## Core Responsibilities
//!
//! ### Exactly-once Application
//! Every submission carries a request id. The idempotency ledger answers a
//! replayed request with the original result and enforces per-action
//! cooldowns as a separate check. Reservations are rolled back when a commit
//! fails, so callers may always retry with the same request id.
//!
//! ### Advisory Fraud Scoring
//! Accepted submissions are scored by an ordered list of weighted rules.
//! The score is attached to the result and to the broadcast change; it never
//! rejects a submission on its own.
//!
//! ### Ranking
//! The rank index orders users by score, then by the version at which they
//! reached it, then by user id. Reads observe one point-in-time state.
//!
//! ### Live Updates
//! Rank changes are handed to the broadcast hub without waiting. Each
//! subscriber owns a bounded queue; slow subscribers lose non-critical
//! changes and receive a refresh signal instead.
//!
//! ## Concurrency Model
//!
//! Commits for one user serialize on that user's lock, commits for different
//! users run in parallel. Lock waits are bounded and answer `Busy` when
//! exceeded. The rank index is guarded by a single read/write lock that is
//! never held across an await point.
//!
//! ## Module Organization
//!
//! - `catalog`: immutable action definitions, swapped as a whole
//! - `ledger`: request ids, cooldowns and recent history per user
//! - `fraud`: rule trait, built-in rules and the scorer
//! - `store`: authoritative score and version per user
//! - `rank`: order-statistic index for top-N, rank and window reads
//! - `hub`: fan-out of rank changes to subscribers
//! - `audit`: durable record of applied mutations, used for replay
//! - `pipeline`: the [`Engine`] facade tying everything together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use engine::catalog::ActionCatalog;
//! use engine::config::EngineConfig;
//! use engine::Engine;
//! use shared::{ActionDefinition, Submission};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = ActionCatalog::from_definitions([
//!         ActionDefinition::new("daily-login", 10, 60 * 60 * 24),
//!     ])?;
//!     let engine = Engine::new(catalog, EngineConfig::default());
//!     let mut updates = engine.subscribe();
//!
//!     let outcome = engine
//!         .submit(Submission::new("u1", "daily-login", "req-1", "10.0.0.1".parse()?))
//!         .await;
//!     println!("{:?}", outcome);
//!
//!     if let Some(message) = updates.recv().await {
//!         println!("{:?}", message);
//!     }
//!     println!("{:?}", engine.top_n(10));
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fraud;
pub mod hub;
pub mod ledger;
pub mod pipeline;
pub mod rank;
pub mod store;
pub mod utils;

pub use pipeline::{Engine, RejectReason, SubmitOutcome};
