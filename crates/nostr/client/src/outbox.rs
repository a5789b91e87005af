//! Reliable publishing.
//!
//! The outbox keeps one entry per event id until every target relay has
//! answered with an OK (accepted or rejected), or until the entry is
//! cancelled. Targets that are offline are not retried on a timer; the
//! event is resent to an endpoint when the pool reports it connected.
//!
//! Sending an event that is already pending merges the new targets into the
//! existing entry. A delay given on such a re-send is ignored; the existing
//! schedule wins.

use crate::config::OutboxConfig;
use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use crate::pool::{ConnectionPool, PoolEvent, PoolEvents};
use nostr_core::{ClientMessage, Event, EventId, EventTemplate, Signer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    pub success: bool,
    pub message: String,
}

/// Per-endpoint outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub event_id: EventId,
    pub acks: BTreeMap<EndpointId, AckResult>,
    /// Targets that had not answered. Empty unless the entry was cancelled.
    pub unanswered: BTreeSet<EndpointId>,
}

impl FlushReport {
    /// Negative acknowledgements as errors.
    pub fn errors(&self) -> Vec<ClientError> {
        self.acks
            .iter()
            .filter(|(_, ack)| !ack.success)
            .map(|(endpoint, ack)| ClientError::Ack {
                endpoint: endpoint.clone(),
                event_id: self.event_id,
                message: ack.message.clone(),
            })
            .collect()
    }

    pub fn accepted(&self) -> impl Iterator<Item = &EndpointId> {
        self.acks
            .iter()
            .filter(|(_, ack)| ack.success)
            .map(|(endpoint, _)| endpoint)
    }
}

/// How an outbox entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every target answered.
    Flushed(FlushReport),
    /// Removed by [`Outbox::cancel`] before every target answered.
    Cancelled(FlushReport),
}

impl FlushOutcome {
    pub fn report(&self) -> &FlushReport {
        match self {
            FlushOutcome::Flushed(report) | FlushOutcome::Cancelled(report) => report,
        }
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self, FlushOutcome::Flushed(_))
    }
}

pub type FlushCallback = Box<dyn FnOnce(&FlushOutcome) + Send>;

#[derive(Default)]
pub struct SendOptions {
    /// Hold the event this long before the first send.
    pub delay: Option<Duration>,
    pub on_flush: Option<FlushCallback>,
}

impl SendOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            on_flush: None,
        }
    }

    pub fn on_flush(mut self, callback: impl FnOnce(&FlushOutcome) + Send + 'static) -> Self {
        self.on_flush = Some(Box::new(callback));
        self
    }
}

/// Read-only view of a pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntrySnapshot {
    pub event: Event,
    pub targets: BTreeSet<EndpointId>,
    pub remaining: BTreeSet<EndpointId>,
    pub acks: BTreeMap<EndpointId, AckResult>,
    pub created_at: Instant,
    /// Set while a delayed entry waits for its first send.
    pub send_at: Option<Instant>,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

struct OutboxEntry {
    event: Event,
    generation: u64,
    targets: HashSet<EndpointId>,
    remaining: HashSet<EndpointId>,
    acks: HashMap<EndpointId, AckResult>,
    created_at: Instant,
    send_at: Option<Instant>,
    attempts: u32,
    last_attempt: Option<Instant>,
    waiters: Vec<oneshot::Sender<FlushOutcome>>,
    callbacks: Vec<FlushCallback>,
}

impl OutboxEntry {
    fn report(&self) -> FlushReport {
        FlushReport {
            event_id: self.event.id,
            acks: self
                .acks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            unanswered: self.remaining.iter().cloned().collect(),
        }
    }

    fn snapshot(&self) -> OutboxEntrySnapshot {
        OutboxEntrySnapshot {
            event: self.event.clone(),
            targets: self.targets.iter().cloned().collect(),
            remaining: self.remaining.iter().cloned().collect(),
            acks: self
                .acks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created_at: self.created_at,
            send_at: self.send_at,
            attempts: self.attempts,
            last_attempt: self.last_attempt,
        }
    }

    /// Resolve waiters with `outcome` and hand back the callbacks, which the
    /// caller runs once the lock is released.
    fn settle(mut self, outcome: &FlushOutcome) -> Vec<FlushCallback> {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.callbacks
    }
}

struct OutboxInner {
    pool: ConnectionPool,
    config: OutboxConfig,
    entries: Mutex<HashMap<EventId, OutboxEntry>>,
    next_generation: AtomicU64,
}

/// Reliable-publish queue on top of a [`ConnectionPool`].
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl Outbox {
    /// Create an outbox and start following the pool's OK and connect events.
    pub fn new(pool: ConnectionPool, config: OutboxConfig) -> Self {
        let events = pool.events();
        let inner = Arc::new(OutboxInner {
            pool,
            config,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        });
        tokio::spawn(follow_pool(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Queue `event` for every endpoint in `to`.
    pub fn send(
        &self,
        event: Event,
        to: impl IntoIterator<Item = EndpointId>,
        options: SendOptions,
    ) -> FlushHandle {
        let event_id = event.id;
        let targets = self.inner.writable_targets(to);
        let (tx, rx) = oneshot::channel();
        let handle = FlushHandle { event_id, rx };

        let mut entries = self.inner.entries.lock();

        if let Some(entry) = entries.get_mut(&event_id) {
            let added: Vec<EndpointId> = targets
                .into_iter()
                .filter(|t| !entry.targets.contains(t))
                .collect();
            debug!(
                "Event {} already queued; merging {} new target(s)",
                event_id,
                added.len()
            );
            entry.waiters.push(tx);
            entry.callbacks.extend(options.on_flush);
            for target in &added {
                entry.targets.insert(target.clone());
                entry.remaining.insert(target.clone());
            }
            if entry.send_at.is_none() && !added.is_empty() {
                self.inner.dispatch(entry, &added);
            }
            return handle;
        }

        let mut entry = OutboxEntry {
            event,
            generation: self.inner.generation(),
            remaining: targets.clone(),
            targets,
            acks: HashMap::new(),
            created_at: Instant::now(),
            send_at: options.delay.map(|d| Instant::now() + d),
            attempts: 0,
            last_attempt: None,
            waiters: vec![tx],
            callbacks: options.on_flush.into_iter().collect(),
        };

        if entry.remaining.is_empty() {
            drop(entries);
            debug!("Event {} has no writable targets; flushed", event_id);
            let outcome = FlushOutcome::Flushed(entry.report());
            for callback in entry.settle(&outcome) {
                callback(&outcome);
            }
            return handle;
        }

        match options.delay {
            Some(delay) => {
                debug!("Event {} scheduled in {:?}", event_id, delay);
                let weak = Arc::downgrade(&self.inner);
                let generation = entry.generation;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.send_delayed(&event_id, generation);
                    }
                });
            }
            None => {
                let targets: Vec<EndpointId> = entry.remaining.iter().cloned().collect();
                self.inner.dispatch(&mut entry, &targets);
            }
        }
        entries.insert(event_id, entry);
        handle
    }

    /// Queue `event` for every writable pool member.
    pub fn broadcast(&self, event: Event, options: SendOptions) -> FlushHandle {
        let to: Vec<EndpointId> = self
            .inner
            .pool
            .all_descriptors()
            .into_iter()
            .filter(|d| d.read_write.can_write())
            .map(|d| d.id)
            .collect();
        self.send(event, to, options)
    }

    /// Sign `template` and queue the result.
    pub fn publish(
        &self,
        template: &EventTemplate,
        signer: &dyn Signer,
        to: impl IntoIterator<Item = EndpointId>,
        options: SendOptions,
    ) -> Result<FlushHandle> {
        let event = signer.sign_template(template)?;
        info!("Publishing event {} (kind {})", event.id, event.kind);
        Ok(self.send(event, to, options))
    }

    /// Record one relay's answer. Unknown events and non-target endpoints
    /// are ignored.
    pub fn handle_ack(&self, endpoint: &EndpointId, event_id: &EventId, success: bool, message: &str) {
        self.inner.handle_ack(endpoint, event_id, success, message);
    }

    /// Drop a pending entry. Its waiters and callbacks see
    /// [`FlushOutcome::Cancelled`].
    pub fn cancel(&self, event_id: &EventId) -> Result<()> {
        let (callbacks, outcome) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .remove(event_id)
                .ok_or_else(|| ClientError::NotFound(format!("outbox entry {}", event_id)))?;
            info!("Cancelled event {} ({} unanswered)", event_id, entry.remaining.len());
            let outcome = FlushOutcome::Cancelled(entry.report());
            (entry.settle(&outcome), outcome)
        };

        for callback in callbacks {
            callback(&outcome);
        }
        Ok(())
    }

    pub fn entry(&self, event_id: &EventId) -> Option<OutboxEntrySnapshot> {
        self.inner.entries.lock().get(event_id).map(OutboxEntry::snapshot)
    }

    pub fn pending_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<_> = self.inner.entries.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboxInner {
    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn writable_targets(&self, to: impl IntoIterator<Item = EndpointId>) -> HashSet<EndpointId> {
        to.into_iter()
            .filter(|id| {
                let keep = !self.config.drop_unwritable_targets
                    || self
                        .pool
                        .descriptor(id)
                        .is_none_or(|d| d.read_write.can_write());
                if !keep {
                    debug!("Dropping unwritable target {}", id);
                }
                keep
            })
            .collect()
    }

    fn dispatch(&self, entry: &mut OutboxEntry, targets: &[EndpointId]) {
        entry.attempts += 1;
        entry.last_attempt = Some(Instant::now());
        match self
            .pool
            .send(&ClientMessage::Event(entry.event.clone()), targets)
        {
            Ok(sent) => debug!(
                "Event {} handed to {}/{} endpoint(s)",
                entry.event.id,
                sent,
                targets.len()
            ),
            Err(e) => warn!("Event {} not sent: {}", entry.event.id, e),
        }
    }

    fn send_delayed(&self, event_id: &EventId, generation: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(event_id) else {
            return;
        };
        if entry.generation != generation || entry.send_at.is_none() {
            return;
        }
        entry.send_at = None;
        let targets: Vec<EndpointId> = entry.remaining.iter().cloned().collect();
        self.dispatch(entry, &targets);
    }

    fn resend_to(&self, endpoint: &EndpointId) {
        let mut entries = self.entries.lock();
        let targets = [endpoint.clone()];
        for entry in entries.values_mut() {
            if entry.send_at.is_none() && entry.remaining.contains(endpoint) {
                debug!("Resending {} to reconnected {}", entry.event.id, endpoint);
                self.dispatch(entry, &targets);
            }
        }
    }

    fn handle_ack(&self, endpoint: &EndpointId, event_id: &EventId, success: bool, message: &str) {
        let (callbacks, outcome) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(event_id) else {
                return;
            };
            if !entry.remaining.remove(endpoint) {
                return;
            }
            if !success {
                debug!("{} rejected {}: {}", endpoint, event_id, message);
            }
            entry.acks.insert(
                endpoint.clone(),
                AckResult {
                    success,
                    message: message.to_string(),
                },
            );
            if !entry.remaining.is_empty() {
                return;
            }

            let Some(entry) = entries.remove(event_id) else {
                return;
            };
            debug!("Event {} flushed", event_id);
            let outcome = FlushOutcome::Flushed(entry.report());
            (entry.settle(&outcome), outcome)
        };

        for callback in callbacks {
            callback(&outcome);
        }
    }
}

async fn follow_pool(outbox: Weak<OutboxInner>, mut events: PoolEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = outbox.upgrade() else {
            break;
        };
        match event {
            PoolEvent::Ok {
                endpoint,
                event_id,
                success,
                message,
            } => inner.handle_ack(&endpoint, &event_id, success, &message),
            PoolEvent::Connected(endpoint) => inner.resend_to(&endpoint),
            PoolEvent::Disconnected(_) | PoolEvent::Notice { .. } => {}
        }
    }
}

/// Resolves when the entry flushes or is cancelled.
pub struct FlushHandle {
    event_id: EventId,
    rx: oneshot::Receiver<FlushOutcome>,
}

impl FlushHandle {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }
}

impl Future for FlushHandle {
    type Output = Result<FlushOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| ClientError::Internal("outbox dropped before flush".to_string())))
    }
}
