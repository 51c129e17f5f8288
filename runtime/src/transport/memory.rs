//! In-process broker.
//!
//! Behaves like a single-client broker with a clean session: subscriptions
//! are forgotten when the connection drops. The network can be switched off
//! and on to simulate coverage loss.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use fieldsync_engine::Envelope;

use super::broker::{Broker, BrokerEvent, OutboundMessage, Qos};
use crate::auth::Credential;
use crate::error::TransportError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type Responder = Box<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    online: bool,
    connected: bool,
    subscriptions: HashSet<String>,
    published: Vec<OutboundMessage>,
    connect_tokens: Vec<String>,
    responders: HashMap<String, Responder>,
}

/// A broker living in the same process.
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<BrokerEvent>,
}

impl MemoryBroker {
    /// A broker whose network is up.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState {
                online: true,
                ..MemoryState::default()
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch the simulated network. Going offline drops the connection.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.online = online;
        if !online && state.connected {
            state.connected = false;
            state.subscriptions.clear();
            let _ = self.events.send(BrokerEvent::ConnectionLost {
                reason: "network unreachable".to_string(),
            });
        }
    }

    /// Answer requests published on `topic` with `respond`.
    pub fn respond_to<F>(&self, topic: impl Into<String>, respond: F)
    where
        F: Fn(&Envelope) -> Option<Envelope> + Send + Sync + 'static,
    {
        self.state().responders.insert(topic.into(), Box::new(respond));
    }

    /// Deliver a message to the client if it is subscribed to `topic`.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) -> bool {
        let state = self.state();
        self.deliver(&state, topic, payload)
    }

    /// Everything published so far, oldest first.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state().published.clone()
    }

    /// Messages published on `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<OutboundMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.state().subscriptions.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Access tokens presented on each successful connect.
    pub fn connect_tokens(&self) -> Vec<String> {
        self.state().connect_tokens.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn deliver(&self, state: &MemoryState, topic: &str, payload: Vec<u8>) -> bool {
        if !state.connected || !state.subscriptions.contains(topic) {
            return false;
        }
        self.events
            .send(BrokerEvent::MessageArrived {
                topic: topic.to_string(),
                payload,
            })
            .is_ok()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn connect<'a>(
        &'a self,
        client_id: &'a str,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.online {
                return Err(TransportError::Broker("network unreachable".to_string()));
            }
            state.connected = true;
            state.connect_tokens.push(credential.access_token.clone());
            tracing::debug!(client_id, "memory broker accepted connection");
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.connected = false;
            state.subscriptions.clear();
        })
    }

    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.published.push(message.clone());

            let reply = state.responders.get(&message.topic).and_then(|respond| {
                let request = Envelope::from_bytes(&message.payload).ok()?;
                let reply = respond(&request)?;
                Some((request.reply_to, reply))
            });
            if let Some((reply_to, reply)) = reply {
                self.deliver(&state, &reply_to, reply.to_bytes());
            }
            self.deliver(&state, &message.topic, message.payload);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        _qos: Qos,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.subscriptions.insert(topic.to_string());
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.state().subscriptions.remove(topic);
            Ok(())
        })
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}
