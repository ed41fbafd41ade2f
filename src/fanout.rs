//! Fanout (C10): per-connection subscriber registry, batched sending,
//! backpressure and drop policy.
//!
//! Grounded on the teacher's `websocket::connection::ConnectionManager`
//! (`DashMap`-keyed registry, add/remove/send/stats shape) generalized from
//! a single per-user sender list to a per-connection outbox with
//! byte/message watermarks, and on `websocket::service::WsService::run`'s
//! interval-tick batch-drain loop for the background flush worker.

use crate::config::WsConfig;
use crate::core_types::{ApiFlavor, ConnId, SessionId, SubscriptionKind, SubscriptionTarget, Symbol};
use crate::event::{Event, EventPayload};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HIGH_WATERMARK_BYTES: usize = 1024 * 1024;
const HIGH_WATERMARK_MSGS: usize = 10_000;
const LOW_WATERMARK_BYTES: usize = 256 * 1024;
const LOW_WATERMARK_MSGS: usize = 5_000;

pub type Outbound = mpsc::UnboundedSender<Vec<u8>>;

struct Outbox {
    messages: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    slow: bool,
    messages_dropped: u64,
    policy: crate::config::OverflowPolicy,
}

impl Outbox {
    fn new(policy: crate::config::OverflowPolicy) -> Self {
        Self {
            messages: VecDeque::new(),
            pending_bytes: 0,
            slow: false,
            messages_dropped: 0,
            policy,
        }
    }

    /// Enqueues `bytes`, applying the overflow policy while `slow` (spec
    /// §4.9 Backpressure). Never blocks.
    fn push(&mut self, bytes: Vec<u8>) {
        if self.slow {
            match self.policy {
                crate::config::OverflowPolicy::DropNewest => {
                    self.messages_dropped += 1;
                    return;
                }
                crate::config::OverflowPolicy::DropOldest => {
                    if let Some(evicted) = self.messages.pop_front() {
                        self.pending_bytes -= evicted.len();
                        self.messages_dropped += 1;
                    }
                }
            }
        }
        self.pending_bytes += bytes.len();
        self.messages.push_back(bytes);
        self.recompute_slow();
    }

    fn drain(&mut self, max: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(max.min(self.messages.len()));
        while out.len() < max {
            let Some(bytes) = self.messages.pop_front() else {
                break;
            };
            self.pending_bytes -= bytes.len();
            out.push(bytes);
        }
        self.recompute_slow();
        out
    }

    fn recompute_slow(&mut self) {
        if self.pending_bytes > HIGH_WATERMARK_BYTES || self.messages.len() > HIGH_WATERMARK_MSGS {
            self.slow = true;
        } else if self.pending_bytes < LOW_WATERMARK_BYTES && self.messages.len() < LOW_WATERMARK_MSGS
        {
            self.slow = false;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriberStats {
    pub pending_bytes: usize,
    pub pending_messages: usize,
    pub messages_dropped: u64,
    pub slow: bool,
}

struct Subscriber {
    session_id: SessionId,
    api_flavor: ApiFlavor,
    sender: Outbound,
    subs: Mutex<Vec<(SubscriptionKind, SubscriptionTarget)>>,
    outbox: Mutex<Outbox>,
}

fn event_kind(payload: &EventPayload) -> SubscriptionKind {
    match payload {
        EventPayload::Trade(_) => SubscriptionKind::Trades,
        EventPayload::Quote(_) => SubscriptionKind::Quotes,
        EventPayload::Bar(_) => SubscriptionKind::Bars,
        EventPayload::OrderUpdate(_) => SubscriptionKind::OrderUpdates,
        EventPayload::CorporateAction(_) => SubscriptionKind::OrderUpdates,
    }
}

fn subscription_matches(
    subs: &[(SubscriptionKind, SubscriptionTarget)],
    kind: SubscriptionKind,
    symbol: &Symbol,
) -> bool {
    subs.iter().any(|(sub_kind, target)| {
        let kind_matches = *sub_kind == kind || *sub_kind == SubscriptionKind::All;
        let target_matches = match target {
            SubscriptionTarget::All => true,
            SubscriptionTarget::Symbol(s) => s == symbol,
        };
        kind_matches && target_matches
    })
}

/// Owns every connected subscriber, keyed by connection id, with a
/// secondary index from session to its subscribers so `publish` doesn't
/// scan the whole registry (spec §5 "broadcast iterates a snapshot of the
/// subscriber list under a read lock" — `DashMap`'s sharded locking plays
/// that role here).
pub struct Fanout {
    subscribers: DashMap<ConnId, Arc<Subscriber>>,
    by_session: DashMap<SessionId, Vec<ConnId>>,
    next_conn_id: AtomicU64,
    policy: crate::config::OverflowPolicy,
    batch_size: usize,
    flush_interval_ms: u64,
}

impl Fanout {
    pub fn new(config: &WsConfig) -> Self {
        Self {
            subscribers: DashMap::new(),
            by_session: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            policy: config.overflow_policy,
            batch_size: config.batch_size,
            flush_interval_ms: config.flush_interval_ms,
        }
    }

    pub fn register(&self, session_id: SessionId, api_flavor: ApiFlavor, sender: Outbound) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            session_id,
            api_flavor,
            sender,
            subs: Mutex::new(Vec::new()),
            outbox: Mutex::new(Outbox::new(self.policy)),
        });
        self.subscribers.insert(conn_id, subscriber);
        self.by_session.entry(session_id).or_default().push(conn_id);
        tracing::info!(conn_id, session_id = %session_id, "subscriber registered");
        conn_id
    }

    /// Connection ids currently subscribed to `session_id` (used by
    /// `SessionManager::destroy` to close subscribers on teardown).
    pub fn conn_ids_for_session(&self, session_id: SessionId) -> Vec<ConnId> {
        self.by_session
            .get(&session_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn unregister(&self, conn_id: ConnId) {
        if let Some((_, subscriber)) = self.subscribers.remove(&conn_id) {
            if let Some(mut conns) = self.by_session.get_mut(&subscriber.session_id) {
                conns.retain(|id| *id != conn_id);
            }
            tracing::info!(conn_id, "subscriber unregistered");
        }
    }

    pub fn subscribe(&self, conn_id: ConnId, kind: SubscriptionKind, target: SubscriptionTarget) {
        if let Some(subscriber) = self.subscribers.get(&conn_id) {
            subscriber
                .subs
                .lock()
                .expect("subscriber subs lock poisoned")
                .push((kind, target));
        }
    }

    pub fn stats(&self, conn_id: ConnId) -> Option<SubscriberStats> {
        let subscriber = self.subscribers.get(&conn_id)?;
        let outbox = subscriber.outbox.lock().expect("outbox lock poisoned");
        Some(SubscriberStats {
            pending_bytes: outbox.pending_bytes,
            pending_messages: outbox.messages.len(),
            messages_dropped: outbox.messages_dropped,
            slow: outbox.slow,
        })
    }

    /// Formats and enqueues `event` for every subscriber of `session_id`
    /// whose subscriptions match (spec §4.9 "the Fanout only formats
    /// messages for which at least one subscriber exists").
    pub fn publish(&self, session_id: SessionId, event: &Event) {
        let Some(conns) = self.by_session.get(&session_id) else {
            return;
        };
        let kind = event_kind(&event.payload);
        for conn_id in conns.iter() {
            let Some(subscriber) = self.subscribers.get(conn_id) else {
                continue;
            };
            let matches = {
                let subs = subscriber.subs.lock().expect("subscriber subs lock poisoned");
                subscription_matches(&subs, kind, &event.symbol)
            };
            if !matches {
                continue;
            }
            let bytes = crate::adapters::format_outbound(subscriber.api_flavor, session_id, event);
            subscriber
                .outbox
                .lock()
                .expect("outbox lock poisoned")
                .push(bytes);
        }
    }

    /// Spawns the background batching worker (spec §4.9 "a background
    /// worker drains outboxes in batches of `batch_size` at most every
    /// `flush_interval_ms`"). Socket-send failures remove the subscriber
    /// without affecting the session (spec §4.10).
    pub fn spawn_worker(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let dead: Vec<ConnId> = self
                    .subscribers
                    .iter()
                    .filter_map(|entry| {
                        let conn_id = *entry.key();
                        let subscriber = entry.value().clone();
                        let batch = {
                            let mut outbox = subscriber.outbox.lock().expect("outbox lock poisoned");
                            outbox.drain(self.batch_size)
                        };
                        for bytes in batch {
                            if subscriber.sender.send(bytes).is_err() {
                                return Some(conn_id);
                            }
                        }
                        None
                    })
                    .collect();
                for conn_id in dead {
                    tracing::warn!(conn_id, "fanout send failed, removing subscriber");
                    self.unregister(conn_id);
                }
            }
        })
    }
}
