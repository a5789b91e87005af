//! Single relay connection management
//!
//! A [`ConnectionLink`] owns one background task that connects to a relay,
//! pumps frames in both directions while connected, answers pings, checks
//! liveness with its own pings, and reconnects with bounded exponential
//! backoff after failures. Inbound frames and state transitions are reported
//! to the owning pool through a channel.

use crate::backoff::ExponentialBackoff;
use crate::config::LinkConfig;
use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use crate::transport::{Socket, Transport, WireFrame};
use futures::{SinkExt, StreamExt};
use nostr_core::{RelayMessage, decode_frame};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Shutting down for good; the link will not reconnect.
    Closing,
}

/// What a link reports to its pool.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Frame(RelayMessage),
}

pub(crate) type LinkEventSender = mpsc::UnboundedSender<(EndpointId, LinkEvent)>;

/// One logical connection to one relay endpoint.
pub struct ConnectionLink {
    endpoint: EndpointId,
    state: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLink {
    /// Start the connection task. The link begins connecting immediately.
    pub(crate) fn spawn(
        endpoint: EndpointId,
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        events: LinkEventSender,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let state = Arc::new(state);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let runner = LinkTask {
            endpoint: endpoint.clone(),
            transport,
            config,
            events,
            state: Arc::clone(&state),
            shutdown: Arc::clone(&shutdown),
            outbound: outbound_rx,
        };
        let handle = tokio::spawn(runner.run());

        Self {
            endpoint,
            state,
            outbound,
            shutdown,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Get current connection state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Watch state transitions.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Queue a text frame. Fails unless the link is currently connected.
    pub fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected(self.endpoint.clone()));
        }
        self.outbound
            .send(text)
            .map_err(|_| ClientError::Connection(format!("link task for {} stopped", self.endpoint)))
    }

    /// Stop the link for good. Calling this again is a no-op.
    pub fn close(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == LinkState::Closing {
                false
            } else {
                *state = LinkState::Closing;
                true
            }
        });
        if !started {
            return;
        }

        info!("Closing link to {}", self.endpoint);
        self.shutdown.notify_one();

        // A task that already gave up will never report the final state.
        let finished = self.task.lock().as_ref().is_none_or(JoinHandle::is_finished);
        if finished {
            self.state.send_replace(LinkState::Disconnected);
        }
    }
}

impl Drop for ConnectionLink {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Closed,
    Lost,
}

struct LinkTask {
    endpoint: EndpointId,
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    events: LinkEventSender,
    state: Arc<watch::Sender<LinkState>>,
    shutdown: Arc<Notify>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl LinkTask {
    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_delay,
            self.config.max_reconnect_delay,
            self.config.max_reconnect_attempts,
        );

        loop {
            if !self.set_state(LinkState::Connecting) {
                break;
            }
            info!("Connecting to relay: {}", self.endpoint);

            let connect_start = Instant::now();
            let attempt = tokio::select! {
                result = timeout(self.config.connect_timeout, self.transport.connect(&self.endpoint)) => result,
                _ = self.shutdown.notified() => break,
            };

            match attempt {
                Ok(Ok(socket)) => {
                    // Frames queued for a previous session are stale.
                    while self.outbound.try_recv().is_ok() {}

                    if !self.set_state(LinkState::Connected) {
                        break;
                    }
                    backoff.reset();
                    info!(
                        "Connected to relay: {} (took {:?})",
                        self.endpoint,
                        connect_start.elapsed()
                    );
                    self.report(LinkEvent::Connected);

                    let end = self.session(socket).await;
                    self.set_state(LinkState::Disconnected);
                    self.report(LinkEvent::Disconnected);
                    if matches!(end, SessionEnd::Closed) {
                        break;
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to {}: {}", self.endpoint, e),
                Err(_) => warn!(
                    "Connection to {} timed out after {:?}",
                    self.endpoint, self.config.connect_timeout
                ),
            }

            if !self.set_state(LinkState::Disconnected) {
                break;
            }

            let Some(delay) = backoff.next_delay() else {
                warn!("Max reconnection attempts exhausted for {}", self.endpoint);
                break;
            };
            debug!("Waiting {:?} before reconnecting to {}", delay, self.endpoint);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        debug!("Link task for {} finished", self.endpoint);
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let Socket {
            mut sink,
            mut stream,
        } = socket;
        let ping_every = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let pong_wait = async {
                match pong_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = sink.send(WireFrame::Close).await;
                    info!("Disconnected from relay: {}", self.endpoint);
                    return SessionEnd::Closed;
                }
                Some(text) = self.outbound.recv() => {
                    debug!("Sending to {}: {}", self.endpoint, text);
                    if let Err(e) = sink.send(WireFrame::Text(text)).await {
                        warn!("Send to {} failed: {}", self.endpoint, e);
                        return SessionEnd::Lost;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(WireFrame::Text(text))) => match decode_frame(&text) {
                        Ok(message) => self.report(LinkEvent::Frame(message)),
                        Err(e) => debug!("Ignoring frame from {}: {}", self.endpoint, e),
                    },
                    Some(Ok(WireFrame::Ping(data))) => {
                        if let Err(e) = sink.send(WireFrame::Pong(data)).await {
                            warn!("Pong to {} failed: {}", self.endpoint, e);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(WireFrame::Pong(_))) => pong_deadline = None,
                    Some(Ok(WireFrame::Close)) | None => {
                        info!("Relay {} closed connection", self.endpoint);
                        return SessionEnd::Lost;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", self.endpoint, e);
                        return SessionEnd::Lost;
                    }
                },
                _ = ping.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = sink.send(WireFrame::Ping(Vec::new())).await {
                            warn!("Ping to {} failed: {}", self.endpoint, e);
                            return SessionEnd::Lost;
                        }
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }
                _ = pong_wait => {
                    warn!("Relay {} missed its pong deadline", self.endpoint);
                    return SessionEnd::Lost;
                }
            }
        }
    }

    /// Move to `next` unless the link is closing. Returns false when closing.
    fn set_state(&self, next: LinkState) -> bool {
        let mut closing = false;
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closing {
                closing = true;
                false
            } else if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        !closing
    }

    fn report(&self, event: LinkEvent) {
        if self.events.send((self.endpoint.clone(), event)).is_err() {
            debug!("Pool for {} is gone; dropping link event", self.endpoint);
        }
    }
}
