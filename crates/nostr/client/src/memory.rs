//! In-process relays.
//!
//! [`MemoryRelay`] speaks the relay side of the wire protocol over channels:
//! it stores published events, answers REQs with stored matches followed by
//! EOSE, delivers live events to open subscriptions, and runs the responder
//! half of negentropy. [`MemoryTransport`] plugs a set of them into the
//! engine in place of real sockets. Each behavior can be switched off to
//! model slow, silent or hostile relays.

use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use crate::transport::{Socket, Transport, WireFrame};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use nostr_core::{
    ClientMessage, Event, EventPredicate, Filter, Negentropy, NegentropyConfig, NegentropyStorage,
    Record, RelayMessage, sort_events,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

/// How a relay answers published events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckPolicy {
    #[default]
    Accept,
    Reject(String),
    /// Store nothing and never answer.
    Silent,
}

/// How a relay answers NEG-OPEN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NegentropyPolicy {
    #[default]
    Supported,
    Refuse(String),
    /// Never answer.
    Silent,
}

/// Registry of in-process relays keyed by endpoint.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    relays: Arc<Mutex<HashMap<EndpointId, MemoryRelay>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relay(&self, relay: MemoryRelay) {
        self.relays.lock().insert(relay.endpoint(), relay);
    }

    pub fn remove_relay(&self, endpoint: &EndpointId) -> Option<MemoryRelay> {
        self.relays.lock().remove(endpoint)
    }

    pub fn relay(&self, endpoint: &EndpointId) -> Option<MemoryRelay> {
        self.relays.lock().get(endpoint).cloned()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &EndpointId) -> Result<Socket> {
        let relay = self
            .relay(endpoint)
            .ok_or_else(|| ClientError::Connection(format!("no relay at {}", endpoint)))?;
        relay.accept()
    }
}

struct Connection {
    to_client: mpsc::UnboundedSender<Result<WireFrame>>,
    subscriptions: HashMap<String, Vec<Filter>>,
    negentropy: HashMap<String, Negentropy>,
}

impl Connection {
    fn send(&self, message: &RelayMessage) {
        match message.to_json() {
            Ok(text) => {
                let _ = self.to_client.unbounded_send(Ok(WireFrame::Text(text)));
            }
            Err(e) => debug!("memory relay could not encode frame: {}", e),
        }
    }
}

struct RelayState {
    events: Vec<Event>,
    received: Vec<ClientMessage>,
    ack: AckPolicy,
    negentropy: NegentropyPolicy,
    negentropy_config: NegentropyConfig,
    answer_requests: bool,
    answer_pings: bool,
    accepting: bool,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    total_connections: usize,
}

struct RelayInner {
    endpoint: EndpointId,
    state: Mutex<RelayState>,
    changed: Notify,
}

/// A relay living inside the test process.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                endpoint,
                state: Mutex::new(RelayState {
                    events: Vec::new(),
                    received: Vec::new(),
                    ack: AckPolicy::Accept,
                    negentropy: NegentropyPolicy::Supported,
                    negentropy_config: NegentropyConfig::default(),
                    answer_requests: true,
                    answer_pings: true,
                    accepting: true,
                    connections: HashMap::new(),
                    next_connection: 0,
                    total_connections: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn with_url(url: &str) -> Result<Self> {
        Ok(Self::new(EndpointId::parse(url)?))
    }

    pub fn endpoint(&self) -> EndpointId {
        self.inner.endpoint.clone()
    }

    /// Store events as if they had been published earlier.
    pub fn add_events(&self, events: impl IntoIterator<Item = Event>) {
        let mut state = self.inner.state.lock();
        for event in events {
            if !state.events.iter().any(|e| e.id == event.id) {
                state.events.push(event);
            }
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.state.lock().events.clone()
    }

    pub fn set_ack_policy(&self, policy: AckPolicy) {
        self.inner.state.lock().ack = policy;
    }

    pub fn set_negentropy_policy(&self, policy: NegentropyPolicy) {
        self.inner.state.lock().negentropy = policy;
    }

    pub fn set_negentropy_config(&self, config: NegentropyConfig) {
        self.inner.state.lock().negentropy_config = config;
    }

    /// When false, REQs are recorded but never answered (no events, no EOSE).
    pub fn set_answer_requests(&self, answer: bool) {
        self.inner.state.lock().answer_requests = answer;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.inner.state.lock().answer_pings = answer;
    }

    /// When false, new connection attempts fail.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.state.lock().accepting = accepting;
    }

    /// Every client frame received so far, in arrival order.
    pub fn received(&self) -> Vec<ClientMessage> {
        self.inner.state.lock().received.clone()
    }

    /// Wait until the received frames satisfy `pred`. Returns false on timeout.
    pub async fn wait_until<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&[ClientMessage]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if pred(&self.inner.state.lock().received) {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return pred(&self.inner.state.lock().received);
            }
        }
    }

    /// Send a frame to every connected client.
    pub fn inject(&self, message: &RelayMessage) {
        let state = self.inner.state.lock();
        for connection in state.connections.values() {
            connection.send(message);
        }
    }

    /// Send raw text to every connected client.
    pub fn inject_raw(&self, text: &str) {
        let state = self.inner.state.lock();
        for connection in state.connections.values() {
            let _ = connection
                .to_client
                .unbounded_send(Ok(WireFrame::Text(text.to_string())));
        }
    }

    /// Hang up on every client.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.inner.state.lock().connections);
        debug!("{} dropping {} connection(s)", self.inner.endpoint, dropped.len());
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Connections accepted since creation.
    pub fn total_connections(&self) -> usize {
        self.inner.state.lock().total_connections
    }

    /// Subscription ids currently open across all connections.
    pub fn open_subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state
            .connections
            .values()
            .flat_map(|c| c.subscriptions.keys().cloned())
            .collect();
        ids.sort();
        ids
    }

    fn accept(&self) -> Result<Socket> {
        let (to_relay, mut from_client) = mpsc::unbounded::<WireFrame>();
        let (to_client, from_relay) = mpsc::unbounded::<Result<WireFrame>>();

        let id = {
            let mut state = self.inner.state.lock();
            if !state.accepting {
                return Err(ClientError::Connection(format!(
                    "{} is not accepting connections",
                    self.inner.endpoint
                )));
            }
            let id = state.next_connection;
            state.next_connection += 1;
            state.total_connections += 1;
            state.connections.insert(
                id,
                Connection {
                    to_client,
                    subscriptions: HashMap::new(),
                    negentropy: HashMap::new(),
                },
            );
            id
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(frame) = from_client.next().await {
                if !inner.handle_frame(id, frame) {
                    break;
                }
            }
            inner.state.lock().connections.remove(&id);
            trace!("{} connection {} finished", inner.endpoint, id);
        });

        let sink = to_relay.sink_map_err(|e| ClientError::Connection(e.to_string()));
        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(from_relay),
        })
    }
}

impl RelayInner {
    /// Returns false once the connection should end.
    fn handle_frame(&self, id: u64, frame: WireFrame) -> bool {
        match frame {
            WireFrame::Text(text) => {
                match ClientMessage::from_json(&text) {
                    Ok(message) => self.handle_message(id, message),
                    Err(e) => {
                        let state = self.state.lock();
                        if let Some(connection) = state.connections.get(&id) {
                            connection.send(&RelayMessage::Notice {
                                message: format!("error: {}", e),
                            });
                        }
                    }
                }
                true
            }
            WireFrame::Ping(data) => {
                let state = self.state.lock();
                if state.answer_pings
                    && let Some(connection) = state.connections.get(&id)
                {
                    let _ = connection.to_client.unbounded_send(Ok(WireFrame::Pong(data)));
                }
                true
            }
            WireFrame::Pong(_) => true,
            WireFrame::Close => false,
        }
    }

    fn handle_message(&self, id: u64, message: ClientMessage) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.received.push(message.clone());

        // A dropped connection keeps draining frames the client already sent.
        if state.connections.contains_key(&id) {
            match message {
                ClientMessage::Event(event) => state.publish(id, event),
                ClientMessage::Req {
                    subscription_id,
                    filters,
                } => state.request(id, subscription_id, filters),
                ClientMessage::Close { subscription_id } => {
                    if let Some(connection) = state.connections.get_mut(&id) {
                        connection.subscriptions.remove(&subscription_id);
                    }
                }
                ClientMessage::NegOpen {
                    subscription_id,
                    filter,
                    message,
                } => state.negentropy_open(id, subscription_id, filter, message),
                ClientMessage::NegMsg {
                    subscription_id,
                    message,
                } => state.negentropy_message(id, subscription_id, message),
                ClientMessage::NegClose { subscription_id } => {
                    if let Some(connection) = state.connections.get_mut(&id) {
                        connection.negentropy.remove(&subscription_id);
                    }
                }
            }
        }

        drop(guard);
        self.changed.notify_waiters();
    }
}

impl RelayState {
    fn publish(&mut self, id: u64, event: Event) {
        let (success, message) = match &self.ack {
            AckPolicy::Silent => return,
            AckPolicy::Reject(reason) => (false, reason.clone()),
            AckPolicy::Accept => (true, String::new()),
        };

        if let Some(connection) = self.connections.get(&id) {
            connection.send(&RelayMessage::Ok {
                event_id: event.id,
                success,
                message,
            });
        }
        if !success {
            return;
        }

        let duplicate = self.events.iter().any(|e| e.id == event.id);
        if !duplicate && !event.is_ephemeral() {
            self.events.push(event.clone());
        }
        if duplicate {
            return;
        }

        for connection in self.connections.values() {
            for (subscription_id, filters) in &connection.subscriptions {
                if filters.matches(&event) {
                    connection.send(&RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
    }

    fn request(&mut self, id: u64, subscription_id: String, filters: Vec<Filter>) {
        let answer = self.answer_requests;
        let stored = answer.then(|| self.stored_matches(&filters));

        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        connection
            .subscriptions
            .insert(subscription_id.clone(), filters);

        if let Some(events) = stored {
            for event in events {
                connection.send(&RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                });
            }
            connection.send(&RelayMessage::Eose { subscription_id });
        }
    }

    /// Newest first, each filter's limit applied on its own.
    fn stored_matches(&self, filters: &[Filter]) -> Vec<Event> {
        let mut sorted = self.events.clone();
        sort_events(&mut sorted);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let limit = filter.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
            for event in sorted.iter().filter(|e| filter.matches(e)).take(limit) {
                if seen.insert(event.id) {
                    out.push(event.clone());
                }
            }
        }
        sort_events(&mut out);
        out
    }

    fn negentropy_open(&mut self, id: u64, subscription_id: String, filter: Filter, message: String) {
        let records: Vec<Record> = self
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .map(Record::from)
            .collect();
        let policy = self.negentropy.clone();
        let config = self.negentropy_config;

        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        match policy {
            NegentropyPolicy::Silent => {}
            NegentropyPolicy::Refuse(reason) => connection.send(&RelayMessage::NegErr {
                subscription_id,
                reason,
            }),
            NegentropyPolicy::Supported => {
                let reply = Negentropy::new(NegentropyStorage::new(records), config).and_then(
                    |mut session| {
                        let reply = session.respond_hex(&message)?;
                        Ok((session, reply))
                    },
                );
                match reply {
                    Ok((session, reply)) => {
                        connection.negentropy.insert(subscription_id.clone(), session);
                        connection.send(&RelayMessage::NegMsg {
                            subscription_id,
                            message: reply,
                        });
                    }
                    Err(e) => connection.send(&RelayMessage::NegErr {
                        subscription_id,
                        reason: format!("error: {}", e),
                    }),
                }
            }
        }
    }

    fn negentropy_message(&mut self, id: u64, subscription_id: String, message: String) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let reply = match connection.negentropy.get_mut(&subscription_id) {
            Some(session) => session.respond_hex(&message).map_err(|e| format!("error: {}", e)),
            None => Err("closed: unknown session".to_string()),
        };
        match reply {
            Ok(reply) => connection.send(&RelayMessage::NegMsg {
                subscription_id,
                message: reply,
            }),
            Err(reason) => {
                connection.negentropy.remove(&subscription_id);
                connection.send(&RelayMessage::NegErr {
                    subscription_id,
                    reason,
                });
            }
        }
    }
}
