//! NIP-77 negentropy reconciliation against a single relay.
//!
//! A session opens with NEG-OPEN carrying the initial message built from the
//! local records for a filter, then trades NEG-MSG rounds until our side has
//! nothing left to say. The relay must answer the first message within
//! `first_response_timeout` and each later one within `inactivity_timeout`,
//! and the whole exchange must fit inside the session timeout.
//!
//! A session that stalls, errors or is refused is never taken to mean
//! "nothing missing": the filter falls back to a plain REQ.

use crate::config::ReconciliationConfig;
use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use crate::pool::{ConnectionPool, PoolSubscription, RelayNotification};
use crate::store::StoreGate;
use crate::subscription::prefixed_subscription_id;
use nostr_core::{ClientMessage, Event, EventId, Filter, Negentropy, NegentropyStorage, Record};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

/// What a relay is known to do with NEG-OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported,
    Unknown,
}

/// Per-endpoint negentropy support verdicts that expire after a TTL.
#[derive(Debug)]
pub struct SupportCache {
    ttl: Duration,
    entries: Mutex<HashMap<EndpointId, (bool, Instant)>>,
}

impl SupportCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, endpoint: &EndpointId) -> Support {
        let mut entries = self.entries.lock();
        match entries.get(endpoint) {
            Some((_, at)) if at.elapsed() >= self.ttl => {
                entries.remove(endpoint);
                Support::Unknown
            }
            Some((true, _)) => Support::Supported,
            Some((false, _)) => Support::Unsupported,
            None => Support::Unknown,
        }
    }

    pub fn mark_supported(&self, endpoint: &EndpointId) {
        self.entries
            .lock()
            .insert(endpoint.clone(), (true, Instant::now()));
    }

    pub fn mark_unsupported(&self, endpoint: &EndpointId) {
        self.entries
            .lock()
            .insert(endpoint.clone(), (false, Instant::now()));
    }

    pub fn forget(&self, endpoint: &EndpointId) {
        self.entries.lock().remove(endpoint);
    }
}

/// Outcome of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Ids we hold that the relay lacks
    pub have_only_local: HashSet<EventId>,
    /// Ids the relay holds that we lack
    pub need_from_remote: HashSet<EventId>,
}

/// Outcome of reconciling a list of filters with one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub have_only_local: HashSet<EventId>,
    /// Union over every filter that reconciled
    pub need_from_remote: HashSet<EventId>,
    /// Filters that could not be reconciled and need a plain REQ
    pub fallback: Vec<Filter>,
}

/// Counts from a full [`ReconciliationAdapter::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub fetched: usize,
    pub fallback_events: usize,
    pub fallback_filters: usize,
}

/// Drives negentropy sessions through the pool.
#[derive(Clone)]
pub struct ReconciliationAdapter {
    pool: ConnectionPool,
    config: ReconciliationConfig,
    support: Arc<SupportCache>,
}

impl ReconciliationAdapter {
    pub fn new(pool: ConnectionPool, config: ReconciliationConfig) -> Self {
        let support = Arc::new(SupportCache::new(config.support_cache_ttl));
        Self {
            pool,
            config,
            support,
        }
    }

    pub fn support(&self) -> &SupportCache {
        &self.support
    }

    /// Reconcile `filter` with `endpoint` starting from `local_vector`.
    pub async fn run(
        &self,
        endpoint: &EndpointId,
        filter: &Filter,
        local_vector: Vec<Record>,
        timeout: Duration,
    ) -> Result<ReconciliationResult> {
        if self.support.get(endpoint) == Support::Unsupported {
            return Err(ClientError::ReconciliationUnsupported {
                endpoint: endpoint.clone(),
                reason: "negentropy unsupported (cached)".to_string(),
            });
        }

        let local_len = local_vector.len();
        let mut negentropy = Negentropy::new(
            NegentropyStorage::new(local_vector),
            self.config.negentropy(),
        )?;
        let subscription_id = prefixed_subscription_id("neg");
        let mut handler =
            self.pool
                .register_handler(subscription_id.clone(), None, [endpoint.clone()])?;

        debug!(
            "Opening negentropy session {} with {} ({} local records)",
            subscription_id,
            endpoint,
            local_len
        );
        self.pool.send(
            &ClientMessage::NegOpen {
                subscription_id: subscription_id.clone(),
                filter: filter.without_limit(),
                message: negentropy.initiate_hex(),
            },
            [endpoint],
        )?;

        let outcome = self
            .exchange(endpoint, &subscription_id, &mut handler, &mut negentropy, timeout)
            .await;

        // Best effort; the relay may already have dropped the session.
        let _ = self.pool.send(
            &ClientMessage::NegClose {
                subscription_id: subscription_id.clone(),
            },
            [endpoint],
        );
        outcome?;

        let to_ids = |ids: &[[u8; 32]]| ids.iter().map(|id| EventId::from_bytes(*id)).collect();
        let result = ReconciliationResult {
            have_only_local: to_ids(negentropy.have_ids()),
            need_from_remote: to_ids(negentropy.need_ids()),
        };
        debug!(
            "Negentropy session {} with {} done: have {} need {}",
            subscription_id,
            endpoint,
            result.have_only_local.len(),
            result.need_from_remote.len()
        );
        Ok(result)
    }

    async fn exchange(
        &self,
        endpoint: &EndpointId,
        subscription_id: &str,
        handler: &mut PoolSubscription,
        negentropy: &mut Negentropy,
        timeout: Duration,
    ) -> Result<()> {
        let session_deadline = Instant::now() + timeout;
        let mut round_deadline =
            session_deadline.min(Instant::now() + self.config.first_response_timeout);

        loop {
            let notification = match timeout_at(round_deadline, handler.recv()).await {
                Ok(Some((_, notification))) => notification,
                Ok(None) => return Err(ClientError::PoolClosed),
                Err(_) => {
                    return Err(ClientError::ReconciliationTimeout {
                        endpoint: endpoint.clone(),
                    });
                }
            };

            match notification {
                RelayNotification::NegMsg(message) => {
                    self.support.mark_supported(endpoint);
                    match negentropy.reconcile_hex(&message)? {
                        Some(next) => {
                            self.pool.send(
                                &ClientMessage::NegMsg {
                                    subscription_id: subscription_id.to_string(),
                                    message: next,
                                },
                                [endpoint],
                            )?;
                            round_deadline = session_deadline
                                .min(Instant::now() + self.config.inactivity_timeout);
                        }
                        None => return Ok(()),
                    }
                }
                RelayNotification::NegErr(reason) | RelayNotification::Closed(reason) => {
                    warn!("{} refused negentropy: {}", endpoint, reason);
                    self.support.mark_unsupported(endpoint);
                    return Err(ClientError::ReconciliationUnsupported {
                        endpoint: endpoint.clone(),
                        reason,
                    });
                }
                RelayNotification::Disconnected => {
                    return Err(ClientError::Connection(format!(
                        "{} disconnected during reconciliation",
                        endpoint
                    )));
                }
                RelayNotification::Terminated => return Err(ClientError::PoolClosed),
                RelayNotification::Notice(message) => {
                    debug!("Notice from {} during reconciliation: {}", endpoint, message);
                }
                RelayNotification::Event(_) | RelayNotification::Eose => {}
            }
        }
    }

    /// Reconcile each filter independently and union what is missing.
    ///
    /// Filters that stall or are refused land in `fallback`. A closed store
    /// or pool is returned as an error.
    pub async fn reconcile(
        &self,
        endpoint: &EndpointId,
        filters: &[Filter],
        store: &StoreGate,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for filter in filters {
            if self.support.get(endpoint) == Support::Unsupported {
                report.fallback.push(filter.clone());
                continue;
            }

            let local = store.negentropy_records(filter).await?;
            match self
                .run(endpoint, filter, local, self.config.session_timeout)
                .await
            {
                Ok(result) => {
                    report.have_only_local.extend(result.have_only_local);
                    report.need_from_remote.extend(result.need_from_remote);
                }
                Err(e @ (ClientError::PoolClosed | ClientError::StoreClosed)) => return Err(e),
                Err(e) => {
                    info!("Falling back to REQ on {}: {}", endpoint, e);
                    report.fallback.push(filter.clone());
                }
            }
        }
        Ok(report)
    }

    /// Fetch `need` from `endpoint` by id, in batches.
    pub async fn fetch<T: From<Event>>(
        &self,
        endpoint: &EndpointId,
        need: &HashSet<EventId>,
        sink: &mpsc::UnboundedSender<T>,
    ) -> Result<usize> {
        let mut ids: Vec<EventId> = need.iter().copied().collect();
        ids.sort_unstable();

        let mut fetched = 0;
        for (i, batch) in ids.chunks(self.config.fetch_batch_size.max(1)).enumerate() {
            if i > 0 {
                sleep(self.config.fetch_batch_pause).await;
            }
            let wanted: HashSet<EventId> = batch.iter().copied().collect();
            let subscription = self.pool.subscribe(
                prefixed_subscription_id("neg-fetch"),
                vec![Filter::new().ids(batch.iter().copied())],
                [endpoint.clone()],
            )?;
            fetched += self
                .drain(endpoint, subscription, |e| wanted.contains(&e.id), sink)
                .await;
        }
        if fetched > 0 {
            debug!("Fetched {} of {} missing events from {}", fetched, need.len(), endpoint);
        }
        Ok(fetched)
    }

    /// Plain REQ for `filters` until EOSE.
    pub async fn fallback<T: From<Event>>(
        &self,
        endpoint: &EndpointId,
        filters: Vec<Filter>,
        sink: &mpsc::UnboundedSender<T>,
    ) -> Result<usize> {
        let subscription = self.pool.subscribe(
            prefixed_subscription_id("neg-fallback"),
            filters,
            [endpoint.clone()],
        )?;
        Ok(self.drain(endpoint, subscription, |_| true, sink).await)
    }

    /// Reconcile, fetch what is missing, and fall back where needed.
    pub async fn sync<T: From<Event>>(
        &self,
        endpoint: &EndpointId,
        filters: &[Filter],
        store: &StoreGate,
        sink: &mpsc::UnboundedSender<T>,
    ) -> Result<SyncSummary> {
        let report = self.reconcile(endpoint, filters, store).await?;
        let fetched = self.fetch(endpoint, &report.need_from_remote, sink).await?;

        let fallback_filters = report.fallback.len();
        let fallback_events = if report.fallback.is_empty() {
            0
        } else {
            self.fallback(endpoint, report.fallback, sink).await?
        };
        Ok(SyncSummary {
            fetched,
            fallback_events,
            fallback_filters,
        })
    }

    /// Forward events until EOSE, CLOSED or the fetch timeout.
    ///
    /// A disconnect does not end the wait: the REQ is replayed when the
    /// endpoint comes back.
    async fn drain<T: From<Event>>(
        &self,
        endpoint: &EndpointId,
        mut subscription: PoolSubscription,
        accept: impl Fn(&Event) -> bool,
        sink: &mpsc::UnboundedSender<T>,
    ) -> usize {
        let deadline = Instant::now() + self.config.fetch_timeout;
        let mut forwarded = 0;

        loop {
            match timeout_at(deadline, subscription.recv()).await {
                Ok(Some((_, RelayNotification::Event(event)))) => {
                    if accept(&event) {
                        if sink.send(T::from(event)).is_err() {
                            break;
                        }
                        forwarded += 1;
                    }
                }
                Ok(Some((_, RelayNotification::Eose))) => break,
                Ok(Some((_, RelayNotification::Closed(reason)))) => {
                    debug!("{} closed {}: {}", endpoint, subscription.id(), reason);
                    break;
                }
                Ok(Some((_, RelayNotification::Terminated))) | Ok(None) => break,
                Ok(Some(_)) => {}
                Err(_) => {
                    warn!(
                        "No EOSE from {} for {} within {:?}",
                        endpoint,
                        subscription.id(),
                        self.config.fetch_timeout
                    );
                    break;
                }
            }
        }
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTransport, NegentropyPolicy};
    use crate::test_support::{event, fast_pool, relay};
    use pretty_assertions::assert_eq;

    const RELAY: &str = "wss://sync.example";

    fn quick_config() -> ReconciliationConfig {
        ReconciliationConfig {
            first_response_timeout: Duration::from_millis(150),
            inactivity_timeout: Duration::from_millis(150),
            session_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(1),
            fetch_batch_pause: Duration::from_millis(5),
            ..ReconciliationConfig::default()
        }
    }

    async fn setup(
        config: ReconciliationConfig,
    ) -> (ReconciliationAdapter, crate::memory::MemoryRelay, EndpointId) {
        let transport = MemoryTransport::new();
        let relay = relay(&transport, RELAY);
        let pool = fast_pool(&transport);
        let id = relay.endpoint();
        let connected = pool
            .ensure_connected(std::slice::from_ref(&id), Duration::from_secs(1))
            .await;
        assert!(connected.contains(&id));
        (ReconciliationAdapter::new(pool, config), relay, id)
    }

    fn drain_sink(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn count_neg_opens(relay: &crate::memory::MemoryRelay) -> usize {
        relay
            .received()
            .iter()
            .filter(|m| matches!(m, ClientMessage::NegOpen { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_run_finds_missing_and_extra() {
        let (adapter, relay, id) = setup(quick_config()).await;
        let (a, b, c) = (event(1, 1, "a"), event(2, 1, "b"), event(3, 1, "c"));
        relay.add_events([a.clone(), b.clone()]);

        let local = vec![Record::from(&a), Record::from(&c)];
        let result = adapter
            .run(&id, &Filter::new().kinds(vec![1]), local, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(result.need_from_remote, HashSet::from([b.id]));
        assert_eq!(result.have_only_local, HashSet::from([c.id]));
        assert_eq!(adapter.support().get(&id), Support::Supported);
        assert!(
            relay
                .wait_until(
                    |m| m.iter().any(|m| matches!(m, ClientMessage::NegClose { .. })),
                    Duration::from_secs(1)
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_silent_relay_times_out() {
        let (adapter, relay, id) = setup(quick_config()).await;
        relay.set_negentropy_policy(NegentropyPolicy::Silent);

        let started = Instant::now();
        let result = adapter
            .run(&id, &Filter::new(), vec![], Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ClientError::ReconciliationTimeout { .. })));
        // First-response bound, not the session bound.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stalled_session_falls_back_to_req() {
        let (adapter, relay, id) = setup(quick_config()).await;
        relay.set_negentropy_policy(NegentropyPolicy::Silent);
        let remote: Vec<Event> = (0..3).map(|i| event(i, 1, &format!("r{}", i))).collect();
        relay.add_events(remote.clone());

        let store = StoreGate::memory(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = adapter
            .sync(&id, &[Filter::new().kinds(vec![1])], &store, &tx)
            .await
            .unwrap();

        assert_eq!(summary.fallback_filters, 1);
        assert_eq!(summary.fallback_events, 3);
        let mut got: Vec<EventId> = drain_sink(&mut rx).iter().map(|e| e.id).collect();
        let mut want: Vec<EventId> = remote.iter().map(|e| e.id).collect();
        got.sort();
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_refusal_is_cached() {
        let (adapter, relay, id) = setup(quick_config()).await;
        relay.set_negentropy_policy(NegentropyPolicy::Refuse("blocked: no sync".into()));
        let store = StoreGate::memory(Duration::from_secs(1));
        let filters = [Filter::new().kinds(vec![1])];

        let report = adapter.reconcile(&id, &filters, &store).await.unwrap();
        assert_eq!(report.fallback, filters.to_vec());
        assert_eq!(adapter.support().get(&id), Support::Unsupported);

        let report = adapter.reconcile(&id, &filters, &store).await.unwrap();
        assert_eq!(report.fallback.len(), 1);
        assert_eq!(count_neg_opens(&relay), 1);
    }

    #[tokio::test]
    async fn test_filters_reconciled_independently_and_unioned() {
        let (adapter, relay, id) = setup(quick_config()).await;
        let note = event(1, 1, "note");
        let reaction = event(2, 7, "+");
        let shared = event(3, 1, "shared");
        relay.add_events([note.clone(), reaction.clone(), shared.clone()]);

        let store = StoreGate::memory(Duration::from_secs(1));
        store.write(shared.clone()).await.unwrap();

        let filters = [Filter::new().kinds(vec![1]), Filter::new().kinds(vec![7])];
        let report = adapter.reconcile(&id, &filters, &store).await.unwrap();

        assert_eq!(report.need_from_remote, HashSet::from([note.id, reaction.id]));
        assert!(report.fallback.is_empty());
        assert_eq!(count_neg_opens(&relay), 2);
    }

    #[tokio::test]
    async fn test_fetch_in_batches() {
        let config = ReconciliationConfig {
            fetch_batch_size: 2,
            ..quick_config()
        };
        let (adapter, relay, id) = setup(config).await;
        let remote: Vec<Event> = (0..5).map(|i| event(i, 1, &format!("{}", i))).collect();
        relay.add_events(remote.clone());

        let need: HashSet<EventId> = remote.iter().map(|e| e.id).collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetched = adapter.fetch(&id, &need, &tx).await.unwrap();

        assert_eq!(fetched, 5);
        assert_eq!(drain_sink(&mut rx).len(), 5);
        let fetch_reqs: Vec<ClientMessage> = relay
            .received()
            .into_iter()
            .filter(|m| {
                matches!(m, ClientMessage::Req { subscription_id, .. }
                    if subscription_id.starts_with("neg-fetch-"))
            })
            .collect();
        assert_eq!(fetch_reqs.len(), 3);
    }

    #[tokio::test]
    async fn test_sync_fetches_only_missing() {
        let (adapter, relay, id) = setup(quick_config()).await;
        let (a, b) = (event(1, 1, "a"), event(2, 1, "b"));
        relay.add_events([a.clone(), b.clone()]);
        let store = StoreGate::memory(Duration::from_secs(1));
        store.write(a.clone()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = adapter
            .sync(&id, &[Filter::new().kinds(vec![1])], &store, &tx)
            .await
            .unwrap();

        assert_eq!(summary, SyncSummary { fetched: 1, fallback_events: 0, fallback_filters: 0 });
        assert_eq!(drain_sink(&mut rx), vec![b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_support_cache_expires() {
        let cache = SupportCache::new(Duration::from_secs(60));
        let id = EndpointId::parse(RELAY).unwrap();
        assert_eq!(cache.get(&id), Support::Unknown);

        cache.mark_unsupported(&id);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&id), Support::Unsupported);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&id), Support::Unknown);
    }
}
