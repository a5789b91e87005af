//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`ConnectionLink`] per endpoint and routes frames in
//! both directions. Outbound frames are gated by each endpoint's read/write
//! mode. Inbound frames carrying a subscription id go to the handler
//! registered under that id; everything else becomes a [`PoolEvent`].
//!
//! Ephemeral endpoints are lease counted. When the last lease is released
//! the endpoint is removed after a grace window unless it is leased again
//! first. Membership, leases and the handler table share one lock, so a
//! removal can never race a re-acquire.

use crate::config::{ClientConfig, LinkConfig, PoolConfig};
use crate::endpoint::{EndpointDescriptor, EndpointId, Lifetime};
use crate::error::{ClientError, Result};
use crate::link::{ConnectionLink, LinkEvent};
use crate::transport::{Transport, WebSocketTransport};
use futures::Stream;
use nostr_core::{ClientMessage, Event, EventId, Filter, RelayMessage, encode_frame};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A relay connected
    Connected(EndpointId),
    /// A relay disconnected
    Disconnected(EndpointId),
    /// OK response for a published event
    Ok {
        endpoint: EndpointId,
        event_id: EventId,
        success: bool,
        message: String,
    },
    /// Notice from a relay
    Notice { endpoint: EndpointId, message: String },
}

/// What a subscription handler receives, tagged with the endpoint it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotification {
    Event(Event),
    Eose,
    Closed(String),
    Notice(String),
    /// The endpoint dropped; it may come back and be resubscribed.
    Disconnected,
    NegMsg(String),
    NegErr(String),
    /// The pool closed or the subscription id was taken over. Nothing follows.
    Terminated,
}

type NotificationSender = mpsc::UnboundedSender<(EndpointId, RelayNotification)>;

struct Handler {
    token: u64,
    /// Encoded REQ, absent for handlers that only listen (reconciliation).
    request: Option<String>,
    targets: HashSet<EndpointId>,
    tx: NotificationSender,
}

struct Member {
    descriptor: EndpointDescriptor,
    link: ConnectionLink,
    /// Set once the router has seen the link's Connected event.
    online: bool,
    pending_removal: Option<u64>,
    /// Subscriptions with a REQ outstanding on this connection.
    open: HashSet<String>,
    /// Subscriptions waiting for a free slot.
    waiting: VecDeque<String>,
    /// Handler frames sent while offline, flushed on connect.
    queue: VecDeque<(String, String)>,
}

impl Member {
    fn request(&mut self, subscription_id: &str, frame: &str, max_open: usize) {
        if self.open.contains(subscription_id) || self.open.len() < max_open {
            match self.link.send(frame.to_string()) {
                Ok(()) => {
                    self.open.insert(subscription_id.to_string());
                }
                Err(e) => debug!("REQ {} not sent: {}", subscription_id, e),
            }
        } else if !self.waiting.iter().any(|w| w == subscription_id) {
            debug!(
                "{} has {} open subscriptions; {} waits",
                self.descriptor.id,
                self.open.len(),
                subscription_id
            );
            self.waiting.push_back(subscription_id.to_string());
        }
    }

    fn release_slot(&mut self, subscription_id: &str, handlers: &HashMap<String, Handler>, max_open: usize) {
        self.waiting.retain(|w| w != subscription_id);
        if !self.open.remove(subscription_id) || !self.online {
            return;
        }
        while self.open.len() < max_open {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            if let Some(frame) = handlers.get(&next).and_then(|h| h.request.as_deref()) {
                self.request(&next, frame, max_open);
            }
        }
    }
}

#[derive(Default)]
struct PoolState {
    members: HashMap<EndpointId, Member>,
    handlers: HashMap<String, Handler>,
    listeners: Vec<mpsc::UnboundedSender<PoolEvent>>,
    next_token: u64,
    closed: bool,
}

impl PoolState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn broadcast(&mut self, event: PoolEvent) {
        self.listeners.retain(|l| l.send(event.clone()).is_ok());
    }

    /// Tell handlers and listeners an endpoint went away.
    fn announce_offline(&mut self, endpoint: &EndpointId) {
        for handler in self.handlers.values() {
            if handler.targets.contains(endpoint) {
                let _ = handler
                    .tx
                    .send((endpoint.clone(), RelayNotification::Disconnected));
            }
        }
        self.broadcast(PoolEvent::Disconnected(endpoint.clone()));
    }
}

struct PoolInner {
    transport: Arc<dyn Transport>,
    link_config: LinkConfig,
    config: PoolConfig,
    link_events: mpsc::UnboundedSender<(EndpointId, LinkEvent)>,
    /// Bumped whenever an endpoint goes online or offline.
    online: watch::Sender<u64>,
    state: Mutex<PoolState>,
}

/// A pool of Nostr relay connections.
///
/// Cloning is cheap; clones share the same connections. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, link_config: LinkConfig, config: PoolConfig) -> Self {
        let (link_events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            transport,
            link_config,
            config,
            link_events,
            online: watch::Sender::new(0),
            state: Mutex::new(PoolState::default()),
        });
        tokio::spawn(route_link_events(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        Self::new(transport, config.link.clone(), config.pool.clone())
    }

    /// Pool backed by real websocket connections.
    pub fn websocket(config: &ClientConfig) -> Self {
        Self::from_config(Arc::new(WebSocketTransport::new()), config)
    }

    /// Add a relay to the pool.
    ///
    /// Adding an endpoint that is already present is a no-op, except that a
    /// persistent descriptor upgrades an ephemeral one. Adding a persistent
    /// endpoint twice is `AlreadyExists`.
    pub fn add_endpoint(&self, descriptor: EndpointDescriptor) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }

        if let Some(member) = state.members.get_mut(&descriptor.id) {
            return match (member.descriptor.lifetime, descriptor.lifetime) {
                (Lifetime::Persistent, Lifetime::Persistent) => {
                    Err(ClientError::AlreadyExists(descriptor.id))
                }
                (Lifetime::Ephemeral { .. }, Lifetime::Persistent) => {
                    info!("Upgrading {} to persistent", descriptor.id);
                    member.descriptor.lifetime = Lifetime::Persistent;
                    member.descriptor.read_write = descriptor.read_write;
                    member.pending_removal = None;
                    Ok(())
                }
                _ => Ok(()),
            };
        }

        self.inner.insert_member(&mut state, descriptor);
        Ok(())
    }

    /// Remove a relay from the pool, closing its connection.
    pub fn remove_endpoint(&self, id: &EndpointId) -> Option<EndpointDescriptor> {
        self.inner.remove_member(id, |_| true)
    }

    /// Increment the lease count of existing ephemeral endpoints.
    pub fn acquire_lease<'a>(&self, ids: impl IntoIterator<Item = &'a EndpointId>) {
        let mut state = self.inner.state.lock();
        for id in ids {
            match state.members.get_mut(id) {
                Some(member) => {
                    if let Lifetime::Ephemeral { leases } = &mut member.descriptor.lifetime {
                        *leases += 1;
                        member.pending_removal = None;
                    }
                }
                None => debug!("Lease requested for unknown endpoint {}", id),
            }
        }
    }

    /// Decrement lease counts. Endpoints that reach zero are removed after
    /// the grace window unless leased again in the meantime.
    pub fn release_lease<'a>(&self, ids: impl IntoIterator<Item = &'a EndpointId>) {
        self.inner.release(ids);
    }

    /// Make sure every id is a pool member and wait until they connect.
    ///
    /// Unknown ids join as ephemeral endpoints holding one lease. Returns the
    /// ids connected when all of them are up or `timeout` elapses, whichever
    /// comes first.
    pub async fn ensure_connected(
        &self,
        ids: &[EndpointId],
        timeout: Duration,
    ) -> HashSet<EndpointId> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return HashSet::new();
            }
            for id in ids {
                if !state.members.contains_key(id) {
                    self.inner.insert_leased(&mut state, id);
                }
            }
        }
        self.wait_connected(ids, timeout).await
    }

    /// Like [`ensure_connected`](Self::ensure_connected), but the returned
    /// guard holds a lease on every ephemeral endpoint it touched and gives
    /// them back when dropped.
    pub async fn ensure_connected_leased(
        &self,
        ids: &[EndpointId],
        timeout: Duration,
    ) -> (HashSet<EndpointId>, LeaseGuard) {
        let mut leased = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                for id in ids {
                    match state.members.get_mut(id) {
                        Some(member) => {
                            if let Lifetime::Ephemeral { leases } = &mut member.descriptor.lifetime {
                                *leases += 1;
                                member.pending_removal = None;
                                leased.push(id.clone());
                            }
                        }
                        None => {
                            self.inner.insert_leased(&mut state, id);
                            leased.push(id.clone());
                        }
                    }
                }
            }
        }

        let guard = LeaseGuard {
            pool: Arc::downgrade(&self.inner),
            ids: leased,
        };
        (self.wait_connected(ids, timeout).await, guard)
    }

    async fn wait_connected(&self, ids: &[EndpointId], timeout: Duration) -> HashSet<EndpointId> {
        let wanted: HashSet<&EndpointId> = ids.iter().collect();
        let mut changes = self.inner.online.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let online: HashSet<EndpointId> = {
                let state = self.inner.state.lock();
                wanted
                    .iter()
                    .filter(|id| state.members.get(**id).is_some_and(|m| m.online))
                    .map(|id| (*id).clone())
                    .collect()
            };
            if online.len() == wanted.len() {
                return online;
            }
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    debug!(
                        "ensure_connected gave up after {:?} with {}/{} online",
                        timeout,
                        online.len(),
                        wanted.len()
                    );
                    return online;
                }
            }
        }
    }

    /// Best-effort send to each target that is connected and whose
    /// read/write mode allows the frame. Returns how many endpoints took it.
    ///
    /// Frames for a live handler (other than REQ, which is replayed on
    /// reconnect) are queued while its endpoint is offline.
    pub fn send<'a>(
        &self,
        message: &ClientMessage,
        to: impl IntoIterator<Item = &'a EndpointId>,
    ) -> Result<usize> {
        let frame = encode_frame(message)?;
        let is_write = matches!(message, ClientMessage::Event(_));
        let queue_for = match message {
            ClientMessage::NegOpen { subscription_id, .. }
            | ClientMessage::NegMsg { subscription_id, .. }
            | ClientMessage::NegClose { subscription_id } => Some(subscription_id.as_str()),
            _ => None,
        };

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::PoolClosed);
        }

        let limit = self.inner.config.request_queue_limit;
        let mut delivered = 0;
        for id in to {
            let Some(member) = state.members.get_mut(id) else {
                debug!("Dropping frame for {}: not in pool", id);
                continue;
            };
            let mode = member.descriptor.read_write;
            if (is_write && !mode.can_write()) || (!is_write && !mode.can_read()) {
                debug!("Skipping {}: {:?} endpoint", id, mode);
                continue;
            }

            if member.online && member.link.send(frame.clone()).is_ok() {
                delivered += 1;
                continue;
            }

            match queue_for {
                Some(sub) if state.handlers.get(sub).is_some_and(|h| h.targets.contains(id)) => {
                    if member.queue.len() >= limit {
                        warn!("Request queue for {} is full; dropping oldest frame", id);
                        member.queue.pop_front();
                    }
                    member.queue.push_back((sub.to_string(), frame.clone()));
                }
                _ => debug!("Dropping frame for disconnected {}", id),
            }
        }
        Ok(delivered)
    }

    /// Register a handler for `subscription_id` and send its REQ to every
    /// readable target that is connected now or connects later.
    pub fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
        targets: impl IntoIterator<Item = EndpointId>,
    ) -> Result<PoolSubscription> {
        self.register_handler(subscription_id, Some(filters), targets)
    }

    /// Register a handler. With `filters` of `None` no REQ is sent; the
    /// caller drives the subscription id itself.
    ///
    /// An id already in use is taken over: the previous handler receives
    /// [`RelayNotification::Terminated`].
    pub fn register_handler(
        &self,
        subscription_id: impl Into<String>,
        filters: Option<Vec<Filter>>,
        targets: impl IntoIterator<Item = EndpointId>,
    ) -> Result<PoolSubscription> {
        let subscription_id = subscription_id.into();
        let request = match filters {
            Some(filters) => Some(encode_frame(&ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters,
            })?),
            None => None,
        };
        let targets: HashSet<EndpointId> = targets.into_iter().collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ClientError::PoolClosed);
        }

        let token = state.token();
        let handler = Handler {
            token,
            request,
            targets,
            tx,
        };
        if let Some(previous) = state.handlers.insert(subscription_id.clone(), handler) {
            debug!("Subscription {} replaced", subscription_id);
            for endpoint in &previous.targets {
                let _ = previous
                    .tx
                    .send((endpoint.clone(), RelayNotification::Terminated));
            }
        }

        let max_open = self.inner.config.max_subscriptions_per_endpoint;
        if let Some(handler) = state.handlers.get(&subscription_id)
            && let Some(frame) = handler.request.as_deref()
        {
            info!(
                "Creating subscription {} on {} endpoint(s)",
                subscription_id,
                handler.targets.len()
            );
            for endpoint in &handler.targets {
                if let Some(member) = state.members.get_mut(endpoint)
                    && member.online
                    && member.descriptor.read_write.can_read()
                {
                    member.request(&subscription_id, frame, max_open);
                }
            }
        }

        Ok(PoolSubscription {
            subscription_id,
            token,
            rx,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Listen to connection, OK and NOTICE events from every endpoint.
    pub fn events(&self) -> PoolEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.listeners.push(tx);
        }
        PoolEvents { rx }
    }

    /// Close every connection. Live handlers receive
    /// [`RelayNotification::Terminated`]; later calls fail with `PoolClosed`.
    pub fn close(&self) {
        let (members, handlers) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.listeners.clear();
            (
                std::mem::take(&mut state.members),
                std::mem::take(&mut state.handlers),
            )
        };

        info!("Closing connection pool ({} endpoints)", members.len());
        for (subscription_id, handler) in handlers {
            debug!("Terminating subscription {}", subscription_id);
            for endpoint in &handler.targets {
                let _ = handler
                    .tx
                    .send((endpoint.clone(), RelayNotification::Terminated));
            }
        }
        for member in members.values() {
            member.link.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Every member's descriptor, ordered by endpoint.
    pub fn all_descriptors(&self) -> Vec<EndpointDescriptor> {
        let state = self.inner.state.lock();
        let mut descriptors: Vec<_> = state.members.values().map(|m| m.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn descriptor(&self, id: &EndpointId) -> Option<EndpointDescriptor> {
        self.inner
            .state
            .lock()
            .members
            .get(id)
            .map(|m| m.descriptor.clone())
    }

    /// Endpoints whose connection the pool has seen come up.
    pub fn connected_endpoints(&self) -> HashSet<EndpointId> {
        let state = self.inner.state.lock();
        state
            .members
            .iter()
            .filter(|(_, m)| m.online)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_connected(&self, id: &EndpointId) -> bool {
        self.inner
            .state
            .lock()
            .members
            .get(id)
            .is_some_and(|m| m.online)
    }

    /// `None` for unknown and persistent endpoints.
    pub fn lease_count(&self, id: &EndpointId) -> Option<u32> {
        self.inner
            .state
            .lock()
            .members
            .get(id)
            .and_then(|m| m.descriptor.leases())
    }

    /// Ids of every registered handler.
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.state.lock().handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl PoolInner {
    /// Join `id` as an ephemeral endpoint already holding one lease.
    fn insert_leased(&self, state: &mut PoolState, id: &EndpointId) {
        let descriptor = EndpointDescriptor {
            lifetime: Lifetime::Ephemeral { leases: 1 },
            ..EndpointDescriptor::ephemeral(id.clone())
        };
        self.insert_member(state, descriptor);
    }

    fn insert_member(&self, state: &mut PoolState, descriptor: EndpointDescriptor) {
        info!("Adding relay to pool: {} ({:?})", descriptor.id, descriptor.lifetime);
        let link = ConnectionLink::spawn(
            descriptor.id.clone(),
            Arc::clone(&self.transport),
            self.link_config.clone(),
            self.link_events.clone(),
        );
        state.members.insert(
            descriptor.id.clone(),
            Member {
                descriptor,
                link,
                online: false,
                pending_removal: None,
                open: HashSet::new(),
                waiting: VecDeque::new(),
                queue: VecDeque::new(),
            },
        );
    }

    /// Remove a member if `should_remove` agrees. The link is closed after
    /// the lock is released.
    fn remove_member(
        &self,
        id: &EndpointId,
        should_remove: impl FnOnce(&Member) -> bool,
    ) -> Option<EndpointDescriptor> {
        let member = {
            let mut state = self.state.lock();
            if !state.members.get(id).is_some_and(should_remove) {
                return None;
            }
            let member = state.members.remove(id)?;
            if member.online {
                state.announce_offline(id);
            }
            member
        };

        info!("Removing relay from pool: {}", id);
        member.link.close();
        Some(member.descriptor)
    }

    fn release<'a>(self: &Arc<Self>, ids: impl IntoIterator<Item = &'a EndpointId>) {
        let mut expired = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for id in ids {
                let Some(member) = state.members.get_mut(id) else {
                    continue;
                };
                let Lifetime::Ephemeral { leases } = &mut member.descriptor.lifetime else {
                    continue;
                };
                if *leases == 0 {
                    warn!("Lease released below zero for {}; clamping", id);
                    continue;
                }
                *leases -= 1;
                if *leases != 0 {
                    continue;
                }
                let token = state.token();
                if let Some(member) = state.members.get_mut(id) {
                    member.pending_removal = Some(token);
                }
                expired.push((id.clone(), token));
            }
        }

        for (id, token) in expired {
            self.schedule_removal(id, token);
        }
    }

    fn schedule_removal(self: &Arc<Self>, id: EndpointId, token: u64) {
        let grace = self.config.lease_grace;
        debug!("{} unleased; removing in {:?}", id, grace);

        let remove = move |inner: &PoolInner, id: &EndpointId| {
            inner.remove_member(id, |m| {
                m.pending_removal == Some(token) && m.descriptor.leases() == Some(0)
            });
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        remove(&inner, &id);
                    }
                });
            }
            Err(_) => remove(self, &id),
        }
    }

    fn unregister(&self, subscription_id: &str, token: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.handlers.get(subscription_id).is_none_or(|h| h.token != token) {
            return;
        }
        let Some(handler) = state.handlers.remove(subscription_id) else {
            return;
        };
        debug!("Unregistering subscription {}", subscription_id);

        let max_open = self.config.max_subscriptions_per_endpoint;
        let close = encode_frame(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        });
        for endpoint in &handler.targets {
            let Some(member) = state.members.get_mut(endpoint) else {
                continue;
            };
            member.queue.retain(|(sub, _)| sub != subscription_id);
            if member.online && member.open.contains(subscription_id) {
                match &close {
                    Ok(frame) => {
                        let _ = member.link.send(frame.clone());
                    }
                    Err(e) => warn!("Could not encode CLOSE: {}", e),
                }
            }
            member.release_slot(subscription_id, &state.handlers, max_open);
        }
    }

    /// Apply one link event. Frames no handler claims come back as
    /// `SubscriptionMismatch`.
    fn route(&self, endpoint: &EndpointId, event: LinkEvent) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let max_open = self.config.max_subscriptions_per_endpoint;

        match event {
            LinkEvent::Connected => {
                let Some(member) = state.members.get_mut(endpoint) else {
                    return Ok(());
                };
                member.online = true;
                member.open.clear();
                member.waiting.clear();

                if member.descriptor.read_write.can_read() {
                    let mut replay: Vec<_> = state
                        .handlers
                        .iter()
                        .filter(|(_, h)| h.targets.contains(endpoint))
                        .filter_map(|(id, h)| h.request.as_deref().map(|r| (h.token, id, r)))
                        .collect();
                    replay.sort_by_key(|(token, _, _)| *token);
                    for (_, id, frame) in replay {
                        member.request(id, frame, max_open);
                    }
                }
                while let Some((sub, frame)) = member.queue.pop_front() {
                    if state.handlers.contains_key(&sub) {
                        let _ = member.link.send(frame);
                    }
                }
                state.broadcast(PoolEvent::Connected(endpoint.clone()));
                self.online.send_modify(|n| *n += 1);
                Ok(())
            }
            LinkEvent::Disconnected => {
                let Some(member) = state.members.get_mut(endpoint) else {
                    return Ok(());
                };
                member.online = false;
                member.open.clear();
                member.waiting.clear();
                state.announce_offline(endpoint);
                self.online.send_modify(|n| *n += 1);
                Ok(())
            }
            LinkEvent::Frame(message) => match message {
                RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                } => {
                    if !success {
                        debug!("{} rejected {}: {}", endpoint, event_id, message);
                    }
                    state.broadcast(PoolEvent::Ok {
                        endpoint: endpoint.clone(),
                        event_id,
                        success,
                        message,
                    });
                    Ok(())
                }
                RelayMessage::Notice { message } => {
                    info!("Notice from {}: {}", endpoint, message);
                    for handler in state.handlers.values() {
                        if handler.targets.contains(endpoint) {
                            let _ = handler
                                .tx
                                .send((endpoint.clone(), RelayNotification::Notice(message.clone())));
                        }
                    }
                    state.broadcast(PoolEvent::Notice {
                        endpoint: endpoint.clone(),
                        message,
                    });
                    Ok(())
                }
                RelayMessage::Auth { .. } => {
                    debug!("Ignoring AUTH challenge from {}", endpoint);
                    Ok(())
                }
                RelayMessage::Event {
                    subscription_id,
                    event,
                } => {
                    if let Err(e) = event.verify_id() {
                        warn!("Dropping event from {}: {}", endpoint, e);
                        return Ok(());
                    }
                    state.notify(endpoint, &subscription_id, RelayNotification::Event(event))
                }
                RelayMessage::Eose { subscription_id } => {
                    state.notify(endpoint, &subscription_id, RelayNotification::Eose)
                }
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    warn!(
                        "Subscription {} closed by {}: {}",
                        subscription_id, endpoint, message
                    );
                    let result = state.notify(
                        endpoint,
                        &subscription_id,
                        RelayNotification::Closed(message),
                    );
                    let PoolState {
                        members, handlers, ..
                    } = state;
                    if let Some(member) = members.get_mut(endpoint) {
                        member.release_slot(&subscription_id, handlers, max_open);
                    }
                    result
                }
                RelayMessage::NegMsg {
                    subscription_id,
                    message,
                } => state.notify(endpoint, &subscription_id, RelayNotification::NegMsg(message)),
                RelayMessage::NegErr {
                    subscription_id,
                    reason,
                } => state.notify(endpoint, &subscription_id, RelayNotification::NegErr(reason)),
            },
        }
    }
}

impl PoolState {
    fn notify(
        &self,
        endpoint: &EndpointId,
        subscription_id: &str,
        notification: RelayNotification,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(subscription_id)
            .filter(|h| h.targets.contains(endpoint))
            .ok_or_else(|| ClientError::SubscriptionMismatch {
                subscription_id: subscription_id.to_string(),
            })?;
        let _ = handler.tx.send((endpoint.clone(), notification));
        Ok(())
    }
}

async fn route_link_events(
    pool: Weak<PoolInner>,
    mut rx: mpsc::UnboundedReceiver<(EndpointId, LinkEvent)>,
) {
    while let Some((endpoint, event)) = rx.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if let Err(e) = inner.route(&endpoint, event) {
            // One stray frame must not end routing for everyone else.
            debug!("Dropping frame from {}: {}", endpoint, e);
            continue;
        }
    }
    debug!("Pool router stopped");
}

/// Notifications for one registered subscription id.
///
/// Dropping it unregisters the handler and sends CLOSE where a REQ is open.
pub struct PoolSubscription {
    subscription_id: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<(EndpointId, RelayNotification)>,
    pool: Weak<PoolInner>,
}

impl PoolSubscription {
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    /// Next notification, or `None` once the handler is gone.
    pub async fn recv(&mut self) -> Option<(EndpointId, RelayNotification)> {
        self.rx.recv().await
    }
}

impl Stream for PoolSubscription {
    type Item = (EndpointId, RelayNotification);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.pool.upgrade() {
            inner.unregister(&self.subscription_id, self.token);
        }
    }
}

/// Per-listener stream of [`PoolEvent`]s.
pub struct PoolEvents {
    rx: mpsc::UnboundedReceiver<PoolEvent>,
}

impl PoolEvents {
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.rx.recv().await
    }
}

impl Stream for PoolEvents {
    type Item = PoolEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Leases taken by [`ConnectionPool::ensure_connected_leased`].
pub struct LeaseGuard {
    pool: Weak<PoolInner>,
    ids: Vec<EndpointId>,
}

impl LeaseGuard {
    pub fn endpoints(&self) -> &[EndpointId] {
        &self.ids
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.pool.upgrade() {
            inner.release(&self.ids);
        }
    }
}
