use clap::Parser;
use engine::audit::FileAuditLog;
use engine::catalog::ActionCatalog;
use engine::config::{EngineConfig, FailurePolicy};
use engine::{Engine, RejectReason, SubmitOutcome};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{ActionDefinition, HubMessage, Submission};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives a synthetic load of concurrent submissions through the engine and
/// reports throughput, rejections and the final leaderboard.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Number of distinct users submitting
    #[clap(short, long, default_value = "1000")]
    users: usize,
    /// Concurrent submission workers
    #[clap(short, long, default_value = "8")]
    workers: usize,
    /// Total submissions across all workers
    #[clap(short, long, default_value = "100000")]
    submissions: usize,
    /// Number of catalog actions
    #[clap(short, long, default_value = "20")]
    actions: usize,
    /// Per-subscriber queue capacity
    #[clap(short, long, default_value = "256")]
    capacity: usize,
    /// Leaderboard size printed at the end and watched by the subscriber
    #[clap(short = 'n', long, default_value = "10")]
    top_n: usize,
    /// Append applied mutations to this file; existing records are replayed first
    #[clap(long)]
    audit: Option<PathBuf>,
    /// Flag submissions for review when a fraud rule fails instead of failing open
    #[clap(long)]
    flag_on_fraud_failure: bool,
    /// Seed for the generated workload
    #[clap(long, default_value = "42")]
    seed: u64,
}

#[derive(Debug, Default)]
struct WorkerStats {
    accepted: usize,
    suspicious: usize,
    duplicates: usize,
    cooldowns: usize,
    busy: usize,
    failed: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &SubmitOutcome) {
        match outcome {
            SubmitOutcome::Accepted { suspicious, .. } => {
                self.accepted += 1;
                if *suspicious {
                    self.suspicious += 1;
                }
            }
            SubmitOutcome::Duplicate(_) => self.duplicates += 1,
            SubmitOutcome::Rejected { reason, .. } => match reason {
                RejectReason::Cooldown => self.cooldowns += 1,
                RejectReason::Busy => self.busy += 1,
                RejectReason::UnknownAction | RejectReason::InternalError => self.failed += 1,
            },
        }
    }

    fn merge(&mut self, other: WorkerStats) {
        self.accepted += other.accepted;
        self.suspicious += other.suspicious;
        self.duplicates += other.duplicates;
        self.cooldowns += other.cooldowns;
        self.busy += other.busy;
        self.failed += other.failed;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let definitions = (0..args.actions.max(1)).map(|i| {
        // Every fifth action has a short cooldown so the gate gets exercised
        let cooldown = if i % 5 == 0 { 1 } else { 0 };
        ActionDefinition::new(format!("action-{}", i), rng.gen_range(1..=100), cooldown)
    });
    let catalog = ActionCatalog::from_definitions(definitions.collect::<Vec<_>>())?;

    let mut config = EngineConfig::default();
    config.hub.subscriber_capacity = args.capacity;
    config.hub.watched_top_n = args.top_n as u64;
    if args.flag_on_fraud_failure {
        config.fraud.failure_policy = FailurePolicy::FlagForReview;
    }

    let mut engine = Engine::new(catalog, config).with_rank_seed(args.seed);

    if let Some(path) = &args.audit {
        if path.exists() {
            let records = FileAuditLog::read_all(path)?;
            let restored = engine.restore(records).await?;
            info!("Replayed {} records from {}", restored, path.display());
        }
        engine = engine.with_audit_log(Arc::new(FileAuditLog::open(path)?));
    }
    let engine = Arc::new(engine);

    // Observer counting what a live subscriber would see
    let mut subscription = engine.subscribe();
    let observer = tokio::spawn(async move {
        let (mut changes, mut refreshes) = (0usize, 0usize);
        while let Some(message) = subscription.recv().await {
            match message {
                HubMessage::Change(_) => changes += 1,
                HubMessage::Refresh => refreshes += 1,
            }
        }
        (changes, refreshes, subscription.dropped())
    });

    let started = Instant::now();
    let workers = args.workers.max(1);
    let per_worker = args.submissions / workers;
    let users = args.users.max(1);
    let actions = args.actions.max(1);

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let engine = Arc::clone(&engine);
        let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(worker as u64 + 1));

        handles.push(tokio::spawn(async move {
            let mut stats = WorkerStats::default();
            for i in 0..per_worker {
                let user = rng.gen_range(0..users);
                let action = rng.gen_range(0..actions);
                // A small share of retries reuses the previous request id
                let request = if i > 0 && rng.gen_bool(0.02) { i - 1 } else { i };
                let ip = IpAddr::V4(Ipv4Addr::new(10, 0, (user % 256) as u8, rng.gen_range(1..=3)));

                let outcome = engine
                    .submit(Submission::new(
                        format!("user-{}", user),
                        format!("action-{}", action),
                        format!("w{}-r{}", worker, request),
                        ip,
                    ))
                    .await;
                stats.record(&outcome);
            }
            stats
        }));
    }

    let mut stats = WorkerStats::default();
    for handle in handles {
        match handle.await {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(e) => warn!("Worker task panicked: {}", e),
        }
    }
    let elapsed = started.elapsed();

    engine.flush().await;
    let top = engine.top_n(args.top_n);
    let users_seen = engine.user_count();
    let total_score = engine.total_score().await;
    drop(engine);

    let (changes, refreshes, dropped) =
        match tokio::time::timeout(Duration::from_secs(5), observer).await {
            Ok(Ok(counts)) => counts,
            _ => {
                warn!("Observer did not finish");
                (0, 0, 0)
            }
        };

    info!(
        "{} submissions in {:.2?} ({:.0}/s)",
        per_worker * workers,
        elapsed,
        (per_worker * workers) as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    info!(
        "accepted {} (suspicious {}), duplicates {}, cooldowns {}, busy {}, failed {}",
        stats.accepted, stats.suspicious, stats.duplicates, stats.cooldowns, stats.busy, stats.failed
    );
    info!(
        "{} users, total score {}; observer saw {} changes, {} refreshes, {} dropped",
        users_seen, total_score, changes, refreshes, dropped
    );

    for entry in top {
        println!(
            "{:>4}. {:<12} {:>8} (v{})",
            entry.rank, entry.user_id, entry.score, entry.version
        );
    }

    Ok(())
}
