//! Local event store access.
//!
//! [`EventStore`] is the narrow interface the engine needs from an embedded
//! store. [`StoreGate`] coordinates every access with shutdown: any number
//! of transactions may run while the store is open, close waits for the
//! ones in flight, and anything attempted afterwards fails with
//! `StoreClosed`. [`MemoryEventStore`] is an indexed in-memory backend.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::Stream;
use nostr_core::{Event, EventId, EventPredicate, Filter, Record, is_ephemeral_kind};
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{RwLock as AsyncRwLock, mpsc};
use tracing::{debug, info};

/// Backend operations. Callers go through a [`StoreGate`].
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    async fn lookup(&self, id: &EventId) -> Result<Option<Arc<Event>>>;

    /// Every stored event matching any filter, newest first. Each filter's
    /// `limit` applies to that filter alone.
    async fn enumerate(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>>;

    /// `(created_at, id)` of every stored event matching `filter`, ignoring
    /// its limit.
    async fn negentropy_records(&self, filter: &Filter) -> Result<Vec<Record>>;

    /// Events written from now on that match any filter.
    async fn subscribe_live(&self, filters: Vec<Filter>) -> Result<LiveEvents>;

    /// Returns true if the event was newly inserted.
    async fn write(&self, event: Event) -> Result<bool>;

    /// Release resources. Live streams end.
    async fn close(&self);
}

/// Stream of live events from a store.
pub struct LiveEvents {
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
}

impl LiveEvents {
    pub fn new(rx: mpsc::UnboundedReceiver<Arc<Event>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }
}

impl Stream for LiveEvents {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Shutdown coordinator in front of an [`EventStore`].
pub struct StoreGate {
    closed: AtomicBool,
    lock: AsyncRwLock<()>,
    store: Arc<dyn EventStore>,
    read_timeout: Duration,
}

impl StoreGate {
    pub fn new(store: Arc<dyn EventStore>, read_timeout: Duration) -> Self {
        Self {
            closed: AtomicBool::new(false),
            lock: AsyncRwLock::new(()),
            store,
            read_timeout,
        }
    }

    /// Gate over a fresh [`MemoryEventStore`].
    pub fn memory(read_timeout: Duration) -> Self {
        Self::new(Arc::new(MemoryEventStore::new()), read_timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `body` against the store while holding a shared slot.
    ///
    /// The closed flag is checked before waiting for the slot and again once
    /// it is held, so a close that completes in between is never missed.
    /// Writes use the same shared slot; only close is exclusive.
    pub async fn with_read_transaction<T, F, Fut>(&self, timeout: Duration, body: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn EventStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_closed() {
            return Err(ClientError::StoreClosed);
        }
        let _slot = tokio::time::timeout(timeout, self.lock.read())
            .await
            .map_err(|_| ClientError::Timeout(format!("local store busy for {:?}", timeout)))?;
        if self.is_closed() {
            return Err(ClientError::StoreClosed);
        }
        body(Arc::clone(&self.store)).await
    }

    pub async fn lookup(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        self.with_read_transaction(self.read_timeout, |store| async move { store.lookup(id).await })
            .await
    }

    pub async fn enumerate(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        self.with_read_transaction(self.read_timeout, |store| async move {
            store.enumerate(filters).await
        })
        .await
    }

    pub async fn negentropy_records(&self, filter: &Filter) -> Result<Vec<Record>> {
        self.with_read_transaction(self.read_timeout, |store| async move {
            store.negentropy_records(filter).await
        })
        .await
    }

    pub async fn subscribe_live(&self, filters: Vec<Filter>) -> Result<LiveEvents> {
        self.with_read_transaction(self.read_timeout, |store| async move {
            store.subscribe_live(filters).await
        })
        .await
    }

    pub async fn write(&self, event: Event) -> Result<bool> {
        self.with_read_transaction(self.read_timeout, |store| async move { store.write(event).await })
            .await
    }

    /// Mark the store closed, wait for in-flight transactions, then release
    /// the backend. Returns false if it was already closed.
    pub async fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        let _exclusive = self.lock.write().await;
        if first {
            info!("Closing local event store");
            self.store.close().await;
        }
        first
    }
}

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum number of events to keep (0 = unlimited). The oldest by
    /// `created_at` are evicted first.
    pub max_events: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { max_events: 0 }
    }
}

#[derive(Default)]
struct Index {
    events: HashMap<EventId, Arc<Event>>,
    /// Newest first.
    ordered: BTreeSet<(Reverse<u64>, EventId)>,
    by_kind: HashMap<u16, HashSet<EventId>>,
    by_author: HashMap<String, HashSet<EventId>>,
    /// Replaceable events by author + kind
    replaceable: HashMap<(String, u16), EventId>,
    /// Addressable events by author + kind + d-tag
    addressable: HashMap<(String, u16, String), EventId>,
}

impl Index {
    fn insert(&mut self, event: Event, max_events: usize) -> bool {
        let event_id = event.id;
        if self.events.contains_key(&event_id) {
            return false;
        }

        if is_replaceable_kind(event.kind) {
            let key = (event.pubkey.clone(), event.kind);
            if !self.supersede(self.replaceable.get(&key).copied(), &event) {
                return false;
            }
            self.replaceable.insert(key, event_id);
        } else if is_addressable_kind(event.kind)
            && let Some(d) = d_tag(&event)
        {
            let key = (event.pubkey.clone(), event.kind, d);
            if !self.supersede(self.addressable.get(&key).copied(), &event) {
                return false;
            }
            self.addressable.insert(key, event_id);
        }

        if max_events != 0 && self.events.len() >= max_events {
            match self.ordered.last().copied() {
                Some((Reverse(oldest_at), oldest)) if oldest_at <= event.created_at => {
                    self.remove(&oldest);
                }
                // Older than everything in a full store.
                _ => return false,
            }
        }

        self.by_kind.entry(event.kind).or_default().insert(event_id);
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event_id);
        self.ordered.insert((Reverse(event.created_at), event_id));
        self.events.insert(event_id, Arc::new(event));
        true
    }

    /// Remove `current` if `event` replaces it. False if `event` is stale.
    fn supersede(&mut self, current: Option<EventId>, event: &Event) -> bool {
        let Some(current) = current else {
            return true;
        };
        let Some(old) = self.events.get(&current) else {
            return true;
        };
        if (event.created_at, event.id) > (old.created_at, old.id) {
            self.remove(&current);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, event_id: &EventId) -> Option<Arc<Event>> {
        let event = self.events.remove(event_id)?;
        self.ordered.remove(&(Reverse(event.created_at), *event_id));
        if let Some(ids) = self.by_kind.get_mut(&event.kind) {
            ids.remove(event_id);
        }
        if let Some(ids) = self.by_author.get_mut(&event.pubkey) {
            ids.remove(event_id);
        }

        let key = (event.pubkey.clone(), event.kind);
        if self.replaceable.get(&key) == Some(event_id) {
            self.replaceable.remove(&key);
        }
        if let Some(d) = d_tag(&event) {
            let key = (event.pubkey.clone(), event.kind, d);
            if self.addressable.get(&key) == Some(event_id) {
                self.addressable.remove(&key);
            }
        }
        Some(event)
    }

    /// Matches for one filter, newest first, limit applied.
    fn query(&self, filter: &Filter) -> Vec<Arc<Event>> {
        let limit = filter
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        if limit == 0 {
            return Vec::new();
        }

        let candidates: Option<HashSet<EventId>> = if let Some(ids) = &filter.ids {
            Some(ids.iter().copied().collect())
        } else if let Some(kinds) = &filter.kinds {
            Some(
                kinds
                    .iter()
                    .filter_map(|k| self.by_kind.get(k))
                    .flatten()
                    .copied()
                    .collect(),
            )
        } else {
            filter.authors.as_ref().map(|authors| {
                authors
                    .iter()
                    .filter_map(|a| self.by_author.get(a))
                    .flatten()
                    .copied()
                    .collect()
            })
        };

        match candidates {
            Some(ids) => {
                let mut found: Vec<&Arc<Event>> = ids
                    .iter()
                    .filter_map(|id| self.events.get(id))
                    .filter(|e| filter.matches(e))
                    .collect();
                found.sort_by_key(|e| (Reverse(e.created_at), e.id));
                found.into_iter().take(limit).cloned().collect()
            }
            None => self
                .ordered
                .iter()
                .filter_map(|(_, id)| self.events.get(id))
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}

struct LiveSubscriber {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

/// Indexed in-memory [`EventStore`].
pub struct MemoryEventStore {
    config: MemoryStoreConfig,
    index: RwLock<Index>,
    live: Mutex<Vec<LiveSubscriber>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            index: RwLock::new(Index::default()),
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.index.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn lookup(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        Ok(self.index.read().events.get(id).cloned())
    }

    async fn enumerate(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        let index = self.index.read();
        let mut seen = HashSet::new();
        let mut out: Vec<Arc<Event>> = filters
            .iter()
            .flat_map(|f| index.query(f))
            .filter(|e| seen.insert(e.id))
            .collect();
        out.sort_by_key(|e| (Reverse(e.created_at), e.id));
        Ok(out)
    }

    async fn negentropy_records(&self, filter: &Filter) -> Result<Vec<Record>> {
        let unlimited = filter.without_limit();
        let index = self.index.read();
        Ok(index
            .query(&unlimited)
            .iter()
            .map(|e| Record::from(e.as_ref()))
            .collect())
    }

    async fn subscribe_live(&self, filters: Vec<Filter>) -> Result<LiveEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live.lock().push(LiveSubscriber { filters, tx });
        Ok(LiveEvents::new(rx))
    }

    async fn write(&self, event: Event) -> Result<bool> {
        let shared = Arc::new(event.clone());
        let inserted = if is_ephemeral_kind(event.kind) {
            false
        } else {
            self.index.write().insert(event, self.config.max_events)
        };

        if inserted || is_ephemeral_kind(shared.kind) {
            self.live.lock().retain(|sub| {
                !sub.filters.matches(&shared) || sub.tx.send(Arc::clone(&shared)).is_ok()
            });
        } else {
            debug!("Event {} not stored (duplicate or superseded)", shared.id);
        }
        Ok(inserted)
    }

    async fn close(&self) {
        self.live.lock().clear();
        *self.index.write() = Index::default();
    }
}

/// Replaceable kinds (NIP-01): 0, 3 and 10000..20000.
pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Addressable kinds (NIP-01): 30000..40000.
pub fn is_addressable_kind(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

fn d_tag(event: &Event) -> Option<String> {
    event.tag_values("d").next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::event;
    use nostr_core::compute_id;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn tagged(created_at: u64, kind: u16, tags: Vec<Vec<String>>) -> Event {
        let pubkey = "cd".repeat(32);
        Event {
            id: compute_id(&pubkey, created_at, kind, &tags, "").unwrap(),
            pubkey,
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "00".repeat(64),
        }
    }

    #[tokio::test]
    async fn test_write_and_lookup() {
        let store = MemoryEventStore::new();
        let note = event(10, 1, "hello");

        assert!(store.write(note.clone()).await.unwrap());
        assert!(!store.write(note.clone()).await.unwrap());
        assert_eq!(store.lookup(&note.id).await.unwrap().as_deref(), Some(&note));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_enumerate_newest_first_with_limits() {
        let store = MemoryEventStore::new();
        for (at, kind) in [(1, 1), (5, 1), (3, 7), (9, 1), (7, 7)] {
            store.write(event(at, kind, &format!("{}", at))).await.unwrap();
        }

        let filters = vec![
            Filter::new().kinds(vec![1]).limit(2),
            Filter::new().kinds(vec![7]),
        ];
        let found: Vec<u64> = store
            .enumerate(&filters)
            .await
            .unwrap()
            .iter()
            .map(|e| e.created_at)
            .collect();
        assert_eq!(found, vec![9, 7, 5, 3]);

        let all = store.enumerate(&[Filter::new()]).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_negentropy_records_ignore_limit() {
        let store = MemoryEventStore::new();
        for at in 0..5 {
            store.write(event(at, 1, "x")).await.unwrap();
        }
        let records = store
            .negentropy_records(&Filter::new().kinds(vec![1]).limit(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn test_replaceable_keeps_newest() {
        let store = MemoryEventStore::new();
        let old = tagged(1, 0, vec![]);
        let new = tagged(2, 0, vec![]);

        assert!(store.write(new.clone()).await.unwrap());
        assert!(!store.write(old.clone()).await.unwrap());
        assert!(store.lookup(&old.id).await.unwrap().is_none());
        assert_eq!(store.len(), 1);

        let newer = tagged(3, 0, vec![]);
        assert!(store.write(newer.clone()).await.unwrap());
        assert!(store.lookup(&new.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_addressable_keyed_by_d_tag() {
        let store = MemoryEventStore::new();
        let d = |v: &str| vec![vec!["d".to_string(), v.to_string()]];
        store.write(tagged(1, 30023, d("a"))).await.unwrap();
        store.write(tagged(1, 30023, d("b"))).await.unwrap();
        store.write(tagged(2, 30023, d("a"))).await.unwrap();

        let all = store.enumerate(&[Filter::new().kinds(vec![30023])]).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryEventStore::with_config(MemoryStoreConfig { max_events: 2 });
        store.write(event(5, 1, "a")).await.unwrap();
        store.write(event(6, 1, "b")).await.unwrap();
        assert!(store.write(event(7, 1, "c")).await.unwrap());
        assert!(!store.write(event(1, 1, "ancient")).await.unwrap());

        let kept: Vec<u64> = store
            .enumerate(&[Filter::new()])
            .await
            .unwrap()
            .iter()
            .map(|e| e.created_at)
            .collect();
        assert_eq!(kept, vec![7, 6]);
    }

    #[tokio::test]
    async fn test_live_subscription() {
        let store = MemoryEventStore::new();
        let mut live = store
            .subscribe_live(vec![Filter::new().kinds(vec![1])])
            .await
            .unwrap();

        store.write(event(1, 7, "reaction")).await.unwrap();
        store.write(event(2, 1, "note")).await.unwrap();
        store.write(event(3, 20001, "ephemeral")).await.unwrap();

        assert_eq!(live.recv().await.unwrap().content, "note");
        store.close().await;
        assert!(live.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_gate_fails_after_close() {
        let gate = StoreGate::memory(Duration::from_secs(1));
        gate.write(event(1, 1, "a")).await.unwrap();

        assert!(gate.close().await);
        assert!(!gate.close().await);
        assert!(matches!(gate.enumerate(&[Filter::new()]).await, Err(ClientError::StoreClosed)));
        assert!(matches!(gate.write(event(2, 1, "b")).await, Err(ClientError::StoreClosed)));
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_readers() {
        let gate = Arc::new(StoreGate::memory(Duration::from_secs(1)));
        let finished = Arc::new(AtomicUsize::new(0));

        let reader = {
            let gate = Arc::clone(&gate);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                gate.with_read_transaction(Duration::from_secs(1), |store| async move {
                    sleep(Duration::from_millis(100)).await;
                    let found = store.enumerate(&[Filter::new()]).await?;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ClientError>(found.len())
                })
                .await
            })
        };
        sleep(Duration::from_millis(20)).await;

        gate.close().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(reader.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_between_check_and_acquire_is_caught() {
        let gate = Arc::new(StoreGate::memory(Duration::from_secs(1)));

        // Hold the exclusive side as a close in progress would.
        let exclusive = gate.lock.write().await;
        let reader = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.with_read_transaction(Duration::from_secs(1), |_| async { Ok(()) })
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;

        gate.closed.store(true, Ordering::Release);
        drop(exclusive);

        assert!(matches!(reader.await.unwrap(), Err(ClientError::StoreClosed)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let gate = StoreGate::memory(Duration::from_millis(20));
        let _exclusive = gate.lock.write().await;
        assert!(matches!(
            gate.lookup(&event(1, 1, "x").id).await,
            Err(ClientError::Timeout(_))
        ));
    }
}
