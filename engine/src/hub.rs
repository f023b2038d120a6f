//! Fan-out of rank changes to live observers
//!
//! Publishing only pushes onto an unbounded channel, so the commit path never
//! waits on observers. A single fan-out task drains that channel and copies
//! each change into every subscriber's bounded queue. Because commits for a
//! user publish while holding that user's lock and the fan-out task is the
//! only producer, every subscriber sees a user's changes in version order.
//!
//! A slow subscriber whose queue fills up loses its oldest change that does
//! not touch the watched top ranks (or its oldest change, if they all do) and
//! gets a single coalesced [`HubMessage::Refresh`] at the tail of its queue,
//! telling it to re-read the top of the leaderboard.

use crate::config::HubConfig;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{HubMessage, RankChange};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Notify};

/// Messages from publishers to the fan-out task
#[derive(Debug)]
pub enum HubCommand {
    Publish(RankChange),
    /// Answered once every earlier command has been fanned out
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<HubMessage>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    watched_top_n: u64,
}

impl SubscriberQueue {
    fn new(capacity: usize, watched_top_n: u64, closed: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            watched_top_n,
        }
    }

    fn push(&self, change: RankChange) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let refresh_at = state
            .messages
            .iter()
            .position(|m| matches!(m, HubMessage::Refresh));
        let pending_changes = state.messages.len() - usize::from(refresh_at.is_some());

        if pending_changes < self.capacity {
            state.messages.push_back(HubMessage::Change(change));
        } else {
            let victim = state
                .messages
                .iter()
                .position(|m| matches!(m, HubMessage::Change(c) if !c.touches_top(self.watched_top_n)))
                .or_else(|| {
                    state
                        .messages
                        .iter()
                        .position(|m| matches!(m, HubMessage::Change(_)))
                });

            if let Some(index) = victim {
                state.messages.remove(index);
                state.dropped += 1;
            }
            state.messages.retain(|m| !matches!(m, HubMessage::Refresh));
            state.messages.push_back(HubMessage::Change(change));
            state.messages.push_back(HubMessage::Refresh);
        }

        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

struct Registry {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: HubConfig,
}

impl Registry {
    fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
    }
}

/// Receiving end handed to one observer
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next message; `None` once the hub has shut down and the
    /// queue is drained
    pub async fn recv(&mut self) -> Option<HubMessage> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(message) = state.messages.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.queue.state.lock().messages.pop_front()
    }

    /// Changes dropped for this subscriber so far
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    pub fn pending(&self) -> usize {
        self.queue.state.lock().messages.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.remove(&self.id);
            debug!("Subscriber {} unsubscribed", self.id);
        }
    }
}

pub struct BroadcastHub {
    tx: mpsc::UnboundedSender<HubCommand>,
    registry: Arc<Registry>,
}

impl BroadcastHub {
    /// Creates the hub and spawns its fan-out task on the current runtime
    pub fn start(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        });

        tokio::spawn(Self::fan_out(Arc::clone(&registry), rx));

        Self { tx, registry }
    }

    async fn fan_out(registry: Arc<Registry>, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Publish(change) => {
                    for entry in registry.subscribers.iter() {
                        entry.value().push(change.clone());
                    }
                }
                HubCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }

        debug!("Broadcast hub shutting down");
        registry.close_all();
    }

    /// Hands a change to the fan-out task; never blocks and never fails the caller
    pub fn publish(&self, change: RankChange) {
        if self.tx.send(HubCommand::Publish(change)).is_err() {
            warn!("Broadcast hub is closed, change not delivered");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let config = &self.registry.config;
        let queue = Arc::new(SubscriberQueue::new(
            config.subscriber_capacity,
            config.watched_top_n,
            self.registry.closed.load(Ordering::SeqCst),
        ));
        self.registry.subscribers.insert(id, Arc::clone(&queue));
        debug!("Subscriber {} subscribed", id);

        Subscription {
            id,
            queue,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Resolves once everything published before the call has been fanned out
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HubCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }
}
