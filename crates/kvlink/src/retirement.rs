//! Deferred closing of invalidated clients.
//!
//! Clients evicted by an invalidation may still be in use by callers that
//! fetched them moments earlier. Instead of closing them on the spot, the
//! registry parks them here; a sweep closes each one once it has been
//! retired for at least the grace period.
//!
//! Entries are ordered by retirement time, so a sweep only walks the
//! expired prefix. The queue is bounded: when configuration churns faster
//! than the grace period drains it, the oldest entries are closed early.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::client::{ClusterClient, RedisClient};

/// Default grace period before a retired client is closed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(600);

/// A handle evicted from the registry.
#[derive(Clone, Debug)]
pub enum RetiredClient {
    Single(Arc<RedisClient>),
    Cluster(Arc<ClusterClient>),
}

impl RetiredClient {
    /// Mode tag used in retirement keys and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Single(_) => "client",
            Self::Cluster(_) => "cluster",
        }
    }

    pub fn close(&self) {
        match self {
            Self::Single(c) => c.close(),
            Self::Cluster(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Single(c) => c.is_closed(),
            Self::Cluster(c) => c.is_closed(),
        }
    }
}

/// Collision-free identity of a retirement entry.
///
/// `seq` disambiguates entries retired at the same instant under the same
/// router name, so repeated invalidations never overwrite each other.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetiredKey {
    pub retired_at: Instant,
    pub seq: u64,
    pub router: String,
    pub tag: &'static str,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<RetiredKey, RetiredClient>,
    next_seq: u64,
}

/// Time-ordered, bounded holding area for retired clients.
pub struct RetirementQueue {
    grace: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for RetirementQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetirementQueue")
            .field("grace", &self.grace)
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .finish()
    }
}

impl RetirementQueue {
    pub fn new(grace: Duration, max_entries: usize) -> Self {
        Self {
            grace,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().entries.is_empty()
    }

    /// Retire one client, stamped now.
    pub fn retire(&self, router: &str, client: RetiredClient) {
        self.retire_all([(router.to_string(), client)], Instant::now());
    }

    /// Retire a batch of clients under one timestamp.
    pub fn retire_all(
        &self,
        clients: impl IntoIterator<Item = (String, RetiredClient)>,
        retired_at: Instant,
    ) {
        let evicted = {
            let mut inner = self.inner();
            for (router, client) in clients {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let key = RetiredKey {
                    retired_at,
                    seq,
                    router,
                    tag: client.tag(),
                };
                inner.entries.insert(key, client);
            }
            let mut evicted = Vec::new();
            while inner.entries.len() > self.max_entries {
                match inner.entries.pop_first() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            tracing::warn!(
                evicted = evicted.len(),
                max_entries = self.max_entries,
                "retirement queue full, closing oldest clients before grace period"
            );
            close_entries(evicted);
        }
    }

    /// Close every entry retired at least `grace` ago. Returns the count.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired = {
            let mut inner = self.inner();
            let mut expired = Vec::new();
            while let Some(entry) = inner.entries.first_entry() {
                if now.saturating_duration_since(entry.key().retired_at) < self.grace {
                    break;
                }
                expired.push(entry.remove_entry());
            }
            expired
        };

        let closed = expired.len();
        if closed > 0 {
            close_entries(expired);
            tracing::info!(closed, remaining = self.len(), "swept retired clients");
        }
        closed
    }

    /// Close everything regardless of age.
    pub fn drain(&self) -> usize {
        let all = std::mem::take(&mut self.inner().entries);
        let closed = all.len();
        close_entries(all);
        if closed > 0 {
            tracing::info!(closed, "drained retirement queue");
        }
        closed
    }
}

/// Close outside the queue lock.
fn close_entries(entries: impl IntoIterator<Item = (RetiredKey, RetiredClient)>) {
    for (key, client) in entries {
        client.close();
        tracing::debug!(router = %key.router, tag = key.tag, "closed retired client");
    }
}
