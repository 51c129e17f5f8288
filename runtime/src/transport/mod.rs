//! Broker connectivity.
//!
//! [`ConnectivityTransport`] keeps one broker connection alive for the
//! lifetime of a login. A supervisor task waits for the session to become
//! authenticated, connects with the credential current at that moment,
//! and reconnects with backoff after every loss. On each (re)connect it
//! re-subscribes, flushes the reconnect buffer in FIFO order, and only then
//! publishes `true` on the connection state.

mod broker;
mod memory;
mod retry;

pub use broker::{Broker, BrokerEvent, OutboundMessage, Qos};
pub use memory::MemoryBroker;
pub use retry::RetryPolicy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use fieldsync_engine::{DropOldestBuffer, Envelope};

use crate::auth::{AuthSession, LoginStatus};
use crate::config::Config;
use crate::context::{shutdown_requested, RuntimeContext};
use crate::error::TransportError;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Transport tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Broker client id; also names the device inbox
    pub client_id: String,
    pub buffer_capacity: usize,
    /// Buffer publishes while disconnected instead of dropping them
    pub buffer_offline: bool,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_id: config.device_id.clone(),
            buffer_capacity: config.reconnect_buffer,
            buffer_offline: config.buffer_offline,
            request_timeout: config.request_timeout,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Prefix of per-request reply topics.
    pub fn inbox_prefix(&self) -> String {
        format!("devices/{}/inbox", self.client_id)
    }
}

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Buffered,
    Dropped,
}

/// A decoded message that was not a reply to a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOutcome {
    Connected,
    LoggedOut,
    GaveUp,
    Shutdown,
}

/// Supervised broker connection with offline buffering.
#[derive(Clone)]
pub struct ConnectivityTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    ctx: RuntimeContext,
    broker: Arc<dyn Broker>,
    auth: AuthSession,
    options: TransportOptions,
    connected: watch::Sender<bool>,
    /// Completed connects, first one included
    reconnects: watch::Sender<u64>,
    outbox: Mutex<DropOldestBuffer<OutboundMessage>>,
    subscriptions: Mutex<Vec<(String, Qos)>>,
    inbound: broadcast::Sender<InboundMessage>,
    replies: DashMap<String, oneshot::Sender<Envelope>>,
    supervision: Mutex<Option<Supervision>>,
}

struct Supervision {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectivityTransport {
    pub fn new(
        ctx: RuntimeContext,
        broker: Arc<dyn Broker>,
        auth: AuthSession,
        options: TransportOptions,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        let (reconnects, _) = watch::channel(0);
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TransportInner {
                ctx,
                broker,
                auth,
                outbox: Mutex::new(DropOldestBuffer::new(options.buffer_capacity)),
                options,
                connected,
                reconnects,
                subscriptions: Mutex::new(Vec::new()),
                inbound,
                replies: DashMap::new(),
                supervision: Mutex::new(None),
            }),
        }
    }

    /// Spawn the supervisor on the network runtime. Idempotent.
    pub async fn start(&self) {
        let mut supervision = self.inner.supervision.lock().await;
        if supervision.is_some() {
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let events = self.inner.broker.events();
        let net = self.inner.ctx.net();
        let handles = vec![
            net.spawn(self.clone().pump(events, lost_tx, shutdown.subscribe())),
            net.spawn(self.clone().supervise(lost_rx, shutdown.subscribe())),
        ];
        *supervision = Some(Supervision { shutdown, handles });
        tracing::info!(client_id = %self.inner.options.client_id, "transport started");
    }

    /// Stop supervising and close the connection. Pending requests fail
    /// with `Closed`; buffered messages are kept.
    pub async fn stop(&self) {
        let Some(supervision) = self.inner.supervision.lock().await.take() else {
            return;
        };
        supervision.shutdown.send_replace(true);
        for handle in supervision.handles {
            handle.abort();
        }
        self.inner.broker.disconnect().await;
        self.inner.connected.send_replace(false);
        self.inner.replies.clear();
        tracing::info!(client_id = %self.inner.options.client_id, "transport stopped");
    }

    /// Publish a message.
    ///
    /// While disconnected the message goes to the drop-oldest reconnect
    /// buffer, or is dropped when buffering is disabled.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> Result<PublishOutcome, TransportError> {
        let message = OutboundMessage::new(topic, payload, qos);
        let mut outbox = self.inner.outbox.lock().await;

        if self.is_connected() {
            match self.inner.broker.publish(message.clone()).await {
                Ok(()) => return Ok(PublishOutcome::Sent),
                Err(err) if !self.inner.options.buffer_offline => return Err(err),
                Err(err) => tracing::debug!(topic, error = %err, "publish failed, buffering"),
            }
        } else if !self.inner.options.buffer_offline {
            tracing::debug!(topic, "not connected, message dropped");
            return Ok(PublishOutcome::Dropped);
        }

        if outbox.push(message).is_some() {
            tracing::debug!(topic, "reconnect buffer full, oldest message dropped");
        }
        Ok(PublishOutcome::Buffered)
    }

    /// Subscribe to `topic`, now if connected and again after every
    /// reconnect.
    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            if !subscriptions.iter().any(|(t, _)| t == topic) {
                subscriptions.push((topic.to_string(), qos));
            }
        }
        if self.is_connected() {
            self.inner.broker.subscribe(topic, qos).await?;
        }
        tracing::debug!(topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.inner
            .subscriptions
            .lock()
            .await
            .retain(|(t, _)| t != topic);
        if self.is_connected() {
            self.inner.broker.unsubscribe(topic).await?;
        }
        Ok(())
    }

    /// Send a request envelope and wait for the reply on a fresh topic in
    /// the device inbox.
    pub async fn request(
        &self,
        topic: &str,
        action: i32,
        payload: impl Into<String>,
    ) -> Result<Envelope, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let reply_to = format!("{}/{}", self.inner.options.inbox_prefix(), Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.inner.replies.insert(reply_to.clone(), tx);

        let envelope = Envelope::request(action, payload, &reply_to);
        let outcome = self.exchange(topic, envelope, &reply_to, rx).await;

        self.inner.replies.remove(&reply_to);
        let _ = self.inner.broker.unsubscribe(&reply_to).await;
        outcome
    }

    async fn exchange(
        &self,
        topic: &str,
        envelope: Envelope,
        reply_to: &str,
        reply: oneshot::Receiver<Envelope>,
    ) -> Result<Envelope, TransportError> {
        self.inner
            .broker
            .subscribe(reply_to, Qos::AtLeastOnce)
            .await?;
        self.publish(topic, envelope.to_bytes(), Qos::AtLeastOnce)
            .await?;

        match tokio::time::timeout(self.inner.options.request_timeout, reply).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Inbound messages that are not replies to a pending request.
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.inbound.subscribe()
    }

    /// Connection state; `true` once connected and flushed.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Number of completed connects. Bumps after each reconnect.
    pub fn reconnects(&self) -> watch::Receiver<u64> {
        self.inner.reconnects.subscribe()
    }

    /// Messages waiting in the reconnect buffer, oldest first.
    pub async fn buffered(&self) -> Vec<OutboundMessage> {
        self.inner.outbox.lock().await.iter().cloned().collect()
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    async fn pump(
        self,
        mut events: broadcast::Receiver<BrokerEvent>,
        lost: mpsc::UnboundedSender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                event = events.recv() => event,
            };
            match event {
                Ok(BrokerEvent::ConnectionLost { reason }) => {
                    let _ = lost.send(reason);
                }
                Ok(BrokerEvent::MessageArrived { topic, payload }) => self.dispatch(topic, &payload),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "broker events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn dispatch(&self, topic: String, payload: &[u8]) {
        let envelope = match Envelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = TransportError::Decode {
                    topic,
                    reason: err.to_string(),
                };
                tracing::warn!(error = %err, "inbound message dropped");
                return;
            }
        };

        if let Some((_, reply)) = self.inner.replies.remove(&topic) {
            let _ = reply.send(envelope);
            return;
        }
        let _ = self.inner.inbound.send(InboundMessage { topic, envelope });
    }

    async fn supervise(
        self,
        mut lost: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut login = self.inner.auth.status();
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return,
                authenticated = until_authenticated(&mut login) => {
                    if !authenticated {
                        return;
                    }
                }
            }

            // Loss notices from an earlier connection are stale now.
            while lost.try_recv().is_ok() {}

            match self.connect_with_retry(&mut login, &mut shutdown).await {
                ConnectOutcome::Connected => {}
                ConnectOutcome::LoggedOut => continue,
                ConnectOutcome::Shutdown => return,
                ConnectOutcome::GaveUp => {
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => return,
                        _ = login.changed() => continue,
                    }
                }
            }

            self.on_connected().await;

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return,
                reason = lost.recv() => {
                    self.inner.connected.send_replace(false);
                    match reason {
                        Some(reason) => tracing::info!(%reason, "broker connection lost"),
                        None => return,
                    }
                }
                _ = until_logged_out(&mut login) => {
                    tracing::info!("session ended, disconnecting");
                    self.inner.connected.send_replace(false);
                    self.inner.broker.disconnect().await;
                }
            }
        }
    }

    async fn connect_with_retry(
        &self,
        login: &mut watch::Receiver<LoginStatus>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectOutcome {
        let retry = &self.inner.options.retry;
        let mut attempt = 0usize;
        loop {
            if *shutdown.borrow() {
                return ConnectOutcome::Shutdown;
            }
            if *login.borrow_and_update() != LoginStatus::Authenticated {
                return ConnectOutcome::LoggedOut;
            }
            // Read per attempt; a re-login may have replaced it.
            let Some(credential) = self.inner.auth.credential().await else {
                return ConnectOutcome::LoggedOut;
            };

            let err = match self
                .inner
                .broker
                .connect(&self.inner.options.client_id, &credential)
                .await
            {
                Ok(()) => return ConnectOutcome::Connected,
                Err(err) => err,
            };

            attempt += 1;
            if !retry.allows(attempt) {
                self.inner.ctx.faults().report(
                    "transport",
                    format!("broker unreachable after {attempt} attempts: {err}"),
                );
                return ConnectOutcome::GaveUp;
            }
            let delay = retry.delay_for_attempt(attempt);
            tracing::warn!(attempt, ?delay, error = %err, "broker connect failed");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(shutdown) => return ConnectOutcome::Shutdown,
                _ = login.changed() => {}
            }
        }
    }

    async fn on_connected(&self) {
        let subscriptions = self.inner.subscriptions.lock().await.clone();
        for (topic, qos) in &subscriptions {
            if let Err(err) = self.inner.broker.subscribe(topic, *qos).await {
                tracing::warn!(topic = %topic, error = %err, "resubscribe failed");
            }
        }

        // Publishers wait on the outbox lock, so nothing overtakes the flush.
        let mut outbox = self.inner.outbox.lock().await;
        let pending = outbox.drain();
        let total = pending.len();
        let mut flushed = 0usize;
        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if let Err(err) = self.inner.broker.publish(message.clone()).await {
                tracing::warn!(error = %err, remaining = total - flushed, "flush interrupted");
                let mut rest = vec![message];
                rest.extend(pending);
                outbox.requeue_front(rest);
                break;
            }
            flushed += 1;
        }
        self.inner.connected.send_replace(true);
        drop(outbox);

        self.inner.reconnects.send_modify(|n| *n += 1);
        let generation = *self.inner.reconnects.borrow();
        tracing::info!(
            client_id = %self.inner.options.client_id,
            generation,
            flushed,
            resubscribed = subscriptions.len(),
            "broker connected"
        );
    }
}

impl fmt::Debug for ConnectivityTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityTransport")
            .field("client_id", &self.inner.options.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn until_authenticated(login: &mut watch::Receiver<LoginStatus>) -> bool {
    login
        .wait_for(|status| *status == LoginStatus::Authenticated)
        .await
        .is_ok()
}

async fn until_logged_out(login: &mut watch::Receiver<LoginStatus>) {
    let _ = login
        .wait_for(|status| *status != LoginStatus::Authenticated)
        .await;
}
