//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use fieldsync_engine::{FeatureKey, ServiceId, SyncItem, SyncOperation};
use fieldsync_runtime::auth::{AuthStrategy, Credential};
use fieldsync_runtime::error::{AuthError, Result, RuntimeError, SyncError};
use fieldsync_runtime::graph::Service;
use fieldsync_runtime::sync::{RemoteAck, RemoteSink};
use fieldsync_runtime::{Config, RuntimeContext};

pub fn test_context() -> RuntimeContext {
    RuntimeContext::for_current(Config::default()).unwrap()
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Service that logs its lifecycle calls.
pub struct TestService {
    id: ServiceId,
    dependencies: Vec<ServiceId>,
    fail_start: bool,
    start_delay: Option<Duration>,
    log: Arc<Mutex<Vec<String>>>,
}

impl TestService {
    pub fn new(id: &str, dependencies: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: ServiceId::new(id),
            dependencies: dependencies.iter().map(|d| ServiceId::new(*d)).collect(),
            fail_start: false,
            start_delay: None,
            log: Arc::clone(log),
        })
    }

    pub fn failing(id: &str, dependencies: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: ServiceId::new(id),
            dependencies: dependencies.iter().map(|d| ServiceId::new(*d)).collect(),
            fail_start: true,
            start_delay: None,
            log: Arc::clone(log),
        })
    }

    pub fn slow(id: &str, delay: Duration, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: ServiceId::new(id),
            dependencies: Vec::new(),
            fail_start: false,
            start_delay: Some(delay),
            log: Arc::clone(log),
        })
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(format!("{call} {}", self.id));
    }
}

impl Service for TestService {
    fn id(&self) -> ServiceId {
        self.id.clone()
    }

    fn dependencies(&self) -> Vec<ServiceId> {
        self.dependencies.clone()
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("start");
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_start {
                return Err(RuntimeError::Service(format!("{} refused to start", self.id)));
            }
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("stop");
            Ok(())
        })
    }
}

/// Accepts password "pw" and hands out a new token on every login.
#[derive(Default)]
pub struct CountingStrategy {
    logins: AtomicUsize,
}

impl AuthStrategy for CountingStrategy {
    fn authenticate<'a>(
        &'a self,
        _username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Credential, AuthError>> {
        Box::pin(async move {
            if password != "pw" {
                return Err(AuthError::InvalidCredentials);
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential::new(format!("token-{n}")))
        })
    }

    fn authenticate_from_cache(&self) -> BoxFuture<'_, std::result::Result<Credential, AuthError>> {
        Box::pin(async { Err(AuthError::CacheMiss) })
    }

    fn logout(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[derive(Default)]
struct SinkState {
    sent: Vec<(FeatureKey, SyncOperation)>,
    in_flight: HashSet<FeatureKey>,
    overlaps: usize,
    failing: HashMap<FeatureKey, usize>,
}

/// Remote sink that records every send.
///
/// Creates are acknowledged with remote id `remote-{local_row_id}`. A send
/// may be slowed down, and keys can be made to fail a number of times.
#[derive(Default)]
pub struct RecordingSink {
    delay: Option<Duration>,
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            state: Mutex::default(),
        })
    }

    /// Fail the next `times` sends of `key`.
    pub fn fail(&self, key: &FeatureKey, times: usize) {
        self.state.lock().unwrap().failing.insert(key.clone(), times);
    }

    /// Successful and failed sends, in order.
    pub fn sent(&self) -> Vec<(FeatureKey, SyncOperation)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sends_of(&self, key: &FeatureKey) -> usize {
        self.sent().iter().filter(|(k, _)| k == key).count()
    }

    /// Sends that started while another send of the same key was running.
    pub fn overlaps(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }
}

impl RemoteSink for RecordingSink {
    fn send<'a>(
        &'a self,
        item: &'a SyncItem,
    ) -> BoxFuture<'a, std::result::Result<RemoteAck, SyncError>> {
        Box::pin(async move {
            let key = item.key().clone();
            let fails = {
                let mut state = self.state.lock().unwrap();
                state.sent.push((key.clone(), item.operation));
                if !state.in_flight.insert(key.clone()) {
                    state.overlaps += 1;
                }
                match state.failing.get_mut(&key) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.state.lock().unwrap().in_flight.remove(&key);

            if fails {
                return Err(SyncError::Network("connection reset".to_string()));
            }
            Ok(match item.operation {
                SyncOperation::Create => {
                    RemoteAck::with_remote_id(format!("remote-{}", key.local_row_id))
                }
                SyncOperation::Update | SyncOperation::Delete => RemoteAck::default(),
            })
        })
    }
}
