//! Local + network subscription streams.
//!
//! [`SubscriptionEngine::advanced_stream`] merges the local store with relay
//! subscriptions into one stream of [`StreamItem`]s. Every event id is
//! delivered at most once per stream. Events yielded before
//! [`StreamItem::LocalEose`] come from the local store; everything after it
//! comes from the network.
//!
//! Each stream is driven by a producer task. The network side runs in its own
//! task and buffers into a channel, so in parallel modes relay events that
//! arrive during local enumeration are held until `LocalEose` has been
//! emitted. Dropping the stream aborts both tasks, which drops their pool
//! subscriptions (sending CLOSE) and endpoint leases.

use crate::config::{ClientConfig, SubscriptionConfig};
use crate::endpoint::EndpointId;
use crate::error::ClientError;
use crate::pool::{ConnectionPool, RelayNotification};
use crate::reconciliation::ReconciliationAdapter;
use crate::store::StoreGate;
use crate::subscription::{EoseTracker, generate_subscription_id};
use futures::Stream;
use futures::future::join_all;
use nostr_core::{Event, EventId, Filter};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// How the network phase fetches stored events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimization {
    /// Plain REQ to every endpoint.
    None,
    /// Negentropy per endpoint, fetching only what is missing.
    Reconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    LocalOnly,
    NetworkOnly,
    /// Drain the local store, then start the network phase.
    LocalThenNetworkSequential,
    /// Run the local store and the network phase concurrently.
    LocalAndNetworkParallel(Optimization),
}

/// Why a stream ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StoreClosed,
    PoolClosed,
}

/// Shared handle to an event held by the store or the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLender(Arc<Event>);

impl EventLender {
    pub fn id(&self) -> EventId {
        self.0.id
    }

    /// Scoped access without copying the event.
    pub fn borrow<R>(&self, f: impl FnOnce(&Event) -> R) -> R {
        f(&self.0)
    }

    pub fn into_owned(self) -> Event {
        Arc::unwrap_or_clone(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(EventLender),
    /// The local store has been fully enumerated.
    LocalEose,
    /// Every endpoint finished sending stored events (or timed out).
    NetworkEose,
    /// All phases finished.
    Eose,
    Closed(CloseReason),
}

/// A running stream. Dropping it cancels the producer.
pub struct AdvancedStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    task: JoinHandle<()>,
}

impl AdvancedStream {
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

impl Stream for AdvancedStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AdvancedStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens [`AdvancedStream`]s over a pool and a local store.
#[derive(Clone)]
pub struct SubscriptionEngine {
    pool: ConnectionPool,
    store: Arc<StoreGate>,
    adapter: ReconciliationAdapter,
    config: SubscriptionConfig,
}

impl SubscriptionEngine {
    pub fn new(pool: ConnectionPool, store: Arc<StoreGate>, config: &ClientConfig) -> Self {
        let adapter = ReconciliationAdapter::new(pool.clone(), config.reconciliation.clone());
        Self {
            pool,
            store,
            adapter,
            config: config.subscription.clone(),
        }
    }

    pub fn store(&self) -> &Arc<StoreGate> {
        &self.store
    }

    pub fn adapter(&self) -> &ReconciliationAdapter {
        &self.adapter
    }

    /// Stream that ends after `Eose` (`LocalEose` for local-only).
    ///
    /// `to` picks the relays for this stream. Relays that are not pool
    /// members join as ephemeral endpoints and are leased until the stream
    /// is dropped. `None` uses the configured endpoints, or every readable
    /// pool member when none are configured.
    pub fn advanced_stream(
        &self,
        filters: Vec<Filter>,
        mode: StreamMode,
        to: Option<Vec<EndpointId>>,
    ) -> AdvancedStream {
        self.open(filters, mode, to, false)
    }

    /// Stream that keeps forwarding live events after the EOSE markers.
    pub fn stream_indefinitely(
        &self,
        filters: Vec<Filter>,
        mode: StreamMode,
        to: Option<Vec<EndpointId>>,
    ) -> AdvancedStream {
        self.open(filters, mode, to, true)
    }

    /// Collect every event a network stream yields before `Eose`.
    pub async fn query(
        &self,
        filters: Vec<Filter>,
        to: Option<Vec<EndpointId>>,
    ) -> crate::error::Result<Vec<Event>> {
        let mut stream = self.advanced_stream(filters, StreamMode::NetworkOnly, to);
        let mut events = Vec::new();
        while let Some(item) = stream.recv().await {
            match item {
                StreamItem::Event(lender) => events.push(lender.into_owned()),
                StreamItem::Eose => break,
                StreamItem::Closed(CloseReason::PoolClosed) => return Err(ClientError::PoolClosed),
                StreamItem::Closed(CloseReason::StoreClosed) => return Err(ClientError::StoreClosed),
                StreamItem::LocalEose | StreamItem::NetworkEose => {}
            }
        }
        Ok(events)
    }

    fn open(
        &self,
        filters: Vec<Filter>,
        mode: StreamMode,
        to: Option<Vec<EndpointId>>,
        indefinite: bool,
    ) -> AdvancedStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer = Producer {
            engine: self.clone(),
            filters,
            to,
            indefinite,
            out: tx,
            seen: HashSet::new(),
        };
        debug!("Opening {:?} stream (indefinite: {})", mode, indefinite);
        let task = tokio::spawn(producer.run(mode));
        AdvancedStream { rx, task }
    }

    /// Configured endpoints, or every readable pool member.
    fn endpoints(&self) -> Vec<EndpointId> {
        if !self.config.endpoints.is_empty() {
            return self.config.endpoints.clone();
        }
        self.pool
            .all_descriptors()
            .into_iter()
            .filter(|d| d.read_write.can_read())
            .map(|d| d.id)
            .collect()
    }
}

/// Aborts a task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Halt {
    Closed(CloseReason),
    /// The consumer went away.
    Detached,
}

/// What the network task hands to the producer.
enum NetItem {
    Event(Event),
    Eose,
    Closed(CloseReason),
}

impl From<Event> for NetItem {
    fn from(event: Event) -> Self {
        NetItem::Event(event)
    }
}

struct Producer {
    engine: SubscriptionEngine,
    filters: Vec<Filter>,
    /// Relays picked by the caller
    to: Option<Vec<EndpointId>>,
    indefinite: bool,
    out: mpsc::UnboundedSender<StreamItem>,
    /// Every id delivered on this stream
    seen: HashSet<EventId>,
}

impl Producer {
    async fn run(mut self, mode: StreamMode) {
        if let Err(Halt::Closed(reason)) = self.drive(mode).await {
            info!("Stream closed: {:?}", reason);
            let _ = self.out.send(StreamItem::Closed(reason));
        }
    }

    async fn drive(&mut self, mode: StreamMode) -> Result<(), Halt> {
        match mode {
            StreamMode::LocalOnly => self.local_only().await,
            StreamMode::NetworkOnly => {
                let (net, _task) = self.spawn_network(Optimization::None);
                self.forward_network(net).await
            }
            StreamMode::LocalThenNetworkSequential => {
                self.local_phase().await?;
                let (net, _task) = self.spawn_network(Optimization::None);
                self.forward_network(net).await
            }
            StreamMode::LocalAndNetworkParallel(optimization) => {
                let (net, _task) = self.spawn_network(optimization);
                self.local_phase().await?;
                self.forward_network(net).await
            }
        }
    }

    fn emit(&self, item: StreamItem) -> Result<(), Halt> {
        self.out.send(item).map_err(|_| Halt::Detached)
    }

    fn emit_new(&mut self, event: Arc<Event>) -> Result<(), Halt> {
        if self.seen.insert(event.id) {
            self.emit(StreamItem::Event(EventLender(event)))?;
        }
        Ok(())
    }

    async fn local_phase(&mut self) -> Result<(), Halt> {
        let timeout = self.engine.config.local_read_timeout;
        let filters = &self.filters;
        let found = self
            .engine
            .store
            .with_read_transaction(timeout, |store| async move { store.enumerate(filters).await })
            .await;

        let events = match found {
            Ok(events) => events,
            Err(ClientError::StoreClosed) => return Err(Halt::Closed(CloseReason::StoreClosed)),
            Err(e) => {
                warn!("Local store read failed: {}", e);
                Vec::new()
            }
        };
        debug!("Local store yielded {} event(s)", events.len());
        for event in events {
            self.emit_new(event)?;
        }
        self.emit(StreamItem::LocalEose)
    }

    async fn local_only(&mut self) -> Result<(), Halt> {
        if !self.indefinite {
            return self.local_phase().await;
        }

        // Subscribe first so nothing written during enumeration is missed.
        let mut live = match self.engine.store.subscribe_live(self.filters.clone()).await {
            Ok(live) => live,
            Err(ClientError::StoreClosed) => return Err(Halt::Closed(CloseReason::StoreClosed)),
            Err(e) => {
                warn!("Live local subscription failed: {}", e);
                return self.local_phase().await;
            }
        };
        self.local_phase().await?;
        while let Some(event) = live.recv().await {
            self.emit_new(event)?;
        }
        Err(Halt::Closed(CloseReason::StoreClosed))
    }

    async fn forward_network(&mut self, mut net: mpsc::UnboundedReceiver<NetItem>) -> Result<(), Halt> {
        while let Some(item) = net.recv().await {
            match item {
                NetItem::Event(event) => {
                    if self.seen.contains(&event.id) {
                        continue;
                    }
                    if self.engine.config.persist_network_events {
                        self.persist(&event).await;
                    }
                    self.emit_new(Arc::new(event))?;
                }
                NetItem::Eose => {
                    self.emit(StreamItem::NetworkEose)?;
                    self.emit(StreamItem::Eose)?;
                    if !self.indefinite {
                        return Ok(());
                    }
                }
                NetItem::Closed(reason) => return Err(Halt::Closed(reason)),
            }
        }
        Ok(())
    }

    async fn persist(&self, event: &Event) {
        match self.engine.store.write(event.clone()).await {
            Ok(_) => {}
            Err(ClientError::StoreClosed) => debug!("Not persisting {}: store closed", event.id),
            Err(e) => warn!("Failed to persist {}: {}", event.id, e),
        }
    }

    fn spawn_network(&self, optimization: Optimization) -> (mpsc::UnboundedReceiver<NetItem>, AbortOnDrop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoints = match &self.to {
            Some(to) => to.clone(),
            None => self.engine.endpoints(),
        };
        let network = Network {
            engine: self.engine.clone(),
            filters: self.filters.clone(),
            endpoints,
            indefinite: self.indefinite,
            tx,
        };
        let task = match optimization {
            Optimization::None => tokio::spawn(network.plain()),
            Optimization::Reconciliation => tokio::spawn(network.reconciled()),
        };
        (rx, AbortOnDrop(task))
    }
}

struct Network {
    engine: SubscriptionEngine,
    filters: Vec<Filter>,
    endpoints: Vec<EndpointId>,
    indefinite: bool,
    tx: mpsc::UnboundedSender<NetItem>,
}

impl Network {
    async fn plain(self) {
        let endpoints = &self.endpoints;
        if endpoints.is_empty() {
            debug!("No endpoints; network phase finished");
            let _ = self.tx.send(NetItem::Eose);
            return;
        }

        let pool = &self.engine.pool;
        let (connected, _leases) = pool
            .ensure_connected_leased(endpoints, self.engine.config.connect_timeout)
            .await;
        let subscription = pool.subscribe(
            generate_subscription_id(),
            self.filters.clone(),
            endpoints.iter().cloned(),
        );
        let mut subscription = match subscription {
            Ok(subscription) => subscription,
            Err(_) => {
                let _ = self.tx.send(NetItem::Closed(CloseReason::PoolClosed));
                return;
            }
        };

        let mut tracker = EoseTracker::new(connected);
        let mut eose_sent = false;
        let deadline = Instant::now() + self.engine.config.eose_timeout;
        loop {
            if !eose_sent && tracker.is_complete() {
                eose_sent = true;
                if self.tx.send(NetItem::Eose).is_err() || !self.indefinite {
                    return;
                }
            }

            let next = if eose_sent {
                subscription.recv().await
            } else {
                match timeout_at(deadline, subscription.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            "EOSE timeout on {}; still waiting for {:?}",
                            subscription.id(),
                            tracker.pending().collect::<Vec<_>>()
                        );
                        eose_sent = true;
                        if self.tx.send(NetItem::Eose).is_err() || !self.indefinite {
                            return;
                        }
                        continue;
                    }
                }
            };

            match next {
                Some((_, RelayNotification::Event(event))) => {
                    if self.tx.send(NetItem::Event(event)).is_err() {
                        return;
                    }
                }
                Some((endpoint, RelayNotification::Eose | RelayNotification::Disconnected)) => {
                    tracker.mark_finished(&endpoint);
                }
                Some((endpoint, RelayNotification::Closed(reason))) => {
                    debug!("{} closed {}: {}", endpoint, subscription.id(), reason);
                    tracker.mark_finished(&endpoint);
                }
                Some((_, RelayNotification::Terminated)) | None => {
                    let _ = self.tx.send(NetItem::Closed(CloseReason::PoolClosed));
                    return;
                }
                Some(_) => {}
            }
        }
    }

    /// Negentropy sync with every endpoint that connected within
    /// `connect_timeout`. Endpoints that come up later are not synced and get
    /// no fallback REQ; in indefinite mode they still receive the live tail.
    async fn reconciled(self) {
        let started = unix_now();
        let endpoints = &self.endpoints;
        if endpoints.is_empty() {
            debug!("No endpoints; network phase finished");
            let _ = self.tx.send(NetItem::Eose);
            return;
        }

        let pool = &self.engine.pool;
        let (connected, _leases) = pool
            .ensure_connected_leased(endpoints, self.engine.config.connect_timeout)
            .await;
        let mut connected: Vec<EndpointId> = connected.into_iter().collect();
        connected.sort();

        let adapter = &self.engine.adapter;
        let store = self.engine.store.as_ref();
        let results = join_all(
            connected
                .iter()
                .map(|endpoint| adapter.sync(endpoint, &self.filters, store, &self.tx)),
        )
        .await;

        for (endpoint, result) in connected.iter().zip(results) {
            match result {
                Ok(summary) => debug!("Synced with {}: {:?}", endpoint, summary),
                Err(ClientError::PoolClosed) => {
                    let _ = self.tx.send(NetItem::Closed(CloseReason::PoolClosed));
                    return;
                }
                Err(ClientError::StoreClosed) => {
                    let _ = self.tx.send(NetItem::Closed(CloseReason::StoreClosed));
                    return;
                }
                Err(e) => warn!("Sync with {} failed: {}", endpoint, e),
            }
        }
        if self.tx.send(NetItem::Eose).is_err() || !self.indefinite {
            return;
        }

        // Live tail from when the stream opened; the dedup set absorbs overlap.
        let live = live_filters(&self.filters, started);
        let mut subscription =
            match pool.subscribe(generate_subscription_id(), live, endpoints.iter().cloned()) {
                Ok(subscription) => subscription,
                Err(_) => {
                    let _ = self.tx.send(NetItem::Closed(CloseReason::PoolClosed));
                    return;
                }
            };
        while let Some((_, notification)) = subscription.recv().await {
            match notification {
                RelayNotification::Event(event) => {
                    if self.tx.send(NetItem::Event(event)).is_err() {
                        return;
                    }
                }
                RelayNotification::Terminated => break,
                _ => {}
            }
        }
        let _ = self.tx.send(NetItem::Closed(CloseReason::PoolClosed));
    }
}

fn live_filters(filters: &[Filter], since: u64) -> Vec<Filter> {
    filters
        .iter()
        .map(|f| Filter {
            since: Some(f.since.map_or(since, |s| s.max(since))),
            limit: None,
            ..f.clone()
        })
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
