//! Fan-out sink for live-socket sessions
//!
//! The sink owns one subscriber set per session and pushes every transcoder
//! output chunk to all of them.
//!
//! ```text
//!   transcoder stdout ──► output reader ──► FanoutSink::on_chunk(key, Bytes)
//!                                                │ try_send (never blocks)
//!                      ┌─────────────────────────┼─────────────────────────┐
//!                      ▼                         ▼                         ▼
//!               [queue: socket A]         [queue: socket B]         [queue: socket C]
//!                      │                         │                         │
//!                  WebSocket                 WebSocket                 HTTP body
//! ```
//!
//! Each subscriber has a bounded queue. A chunk that does not fit drops the
//! subscriber instead of stalling the feed: dropping the queue sender ends the
//! socket's forwarding task, which closes the socket and unsubscribes.
//! `Bytes` is reference counted, so every subscriber shares one allocation
//! per chunk.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::registry::SessionKey;
use crate::stats::{SessionStats, StatsSnapshot};

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of an attached socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A socket attached to a session
///
/// Media subscribers carry the sending half of the socket's outbound queue.
/// Lease subscribers (administrative start requests, segmented viewers) keep
/// a session alive without receiving media.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    tx: Option<mpsc::Sender<Bytes>>,
}

enum Delivery {
    Sent,
    Lease,
    Full,
    Closed,
}

impl Subscriber {
    /// Create a media subscriber and the receiving half of its queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: SubscriberId::next(),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// Create a subscriber that holds the session open without media
    pub fn lease() -> Self {
        Self {
            id: SubscriberId::next(),
            tx: None,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_lease(&self) -> bool {
        self.tx.is_none()
    }

    fn deliver(&self, chunk: &Bytes) -> Delivery {
        match &self.tx {
            None => Delivery::Lease,
            Some(tx) => match tx.try_send(chunk.clone()) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

struct SubscriberSet {
    members: HashMap<SubscriberId, Subscriber>,
    stats: Arc<SessionStats>,
}

impl SubscriberSet {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            stats: Arc::new(SessionStats::new()),
        }
    }
}

/// Per-session broadcast sets
#[derive(Default)]
pub struct FanoutSink {
    sets: DashMap<SessionKey, SubscriberSet>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket to the session's broadcast set
    pub fn attach(&self, key: &SessionKey, subscriber: Subscriber) {
        let id = subscriber.id();
        let mut set = self.sets.entry(*key).or_insert_with(SubscriberSet::new);
        set.members.insert(id, subscriber);

        tracing::debug!(
            session = %key,
            subscriber = %id,
            subscribers = set.members.len(),
            "Subscriber attached"
        );
    }

    /// Remove a socket from the session's broadcast set
    ///
    /// Returns `true` if the subscriber was attached.
    pub fn detach(&self, key: &SessionKey, id: SubscriberId) -> bool {
        let Some(mut set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.members.remove(&id).is_some();
        if removed {
            tracing::debug!(
                session = %key,
                subscriber = %id,
                subscribers = set.members.len(),
                "Subscriber detached"
            );
        }
        removed
    }

    /// Push a chunk to every attached socket
    ///
    /// Never waits on a socket. Subscribers whose queue is full or closed are
    /// removed. Returns the number of queues that accepted the chunk.
    pub fn on_chunk(&self, key: &SessionKey, chunk: Bytes) -> usize {
        let Some(mut set) = self.sets.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        let mut slow = 0;
        set.members.retain(|id, subscriber| match subscriber.deliver(&chunk) {
            Delivery::Sent => {
                delivered += 1;
                true
            }
            Delivery::Lease => true,
            Delivery::Full => {
                tracing::warn!(session = %key, subscriber = %id, "Subscriber too slow, dropping");
                slow += 1;
                false
            }
            Delivery::Closed => {
                tracing::debug!(session = %key, subscriber = %id, "Subscriber queue closed");
                false
            }
        });

        set.stats.record_chunk(chunk.len(), delivered);
        for _ in 0..slow {
            set.stats.record_slow_drop();
        }
        delivered
    }

    /// Number of sockets attached to the session
    pub fn subscriber_count(&self, key: &SessionKey) -> usize {
        self.sets.get(key).map(|set| set.members.len()).unwrap_or(0)
    }

    /// Whether a given socket is attached to the session
    pub fn contains(&self, key: &SessionKey, id: SubscriberId) -> bool {
        self.sets
            .get(key)
            .map(|set| set.members.contains_key(&id))
            .unwrap_or(false)
    }

    /// Drop the whole broadcast set
    ///
    /// Dropping the queue senders closes every attached socket. Returns the
    /// number of subscribers that were attached.
    pub fn close(&self, key: &SessionKey) -> usize {
        match self.sets.remove(key) {
            Some((_, set)) => {
                let count = set.members.len();
                tracing::debug!(session = %key, subscribers = count, "Broadcast set closed");
                count
            }
            None => 0,
        }
    }

    pub fn stats(&self, key: &SessionKey) -> Option<StatsSnapshot> {
        self.sets.get(key).map(|set| set.stats.snapshot())
    }
}
