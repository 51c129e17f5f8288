//! Offline-first upload of local mutations.
//!
//! The [`SyncEngine`] drains each registered store's audit queue through a
//! [`RemoteSink`] whenever the sync gate (connected and authenticated) is
//! open. Two triggers start a drain:
//!
//! - an edit recorded in a store drains that store;
//! - the gate opening, or the connection coming back while the session is
//!   authenticated, drains every store.
//!
//! At most one drain per store runs at a time. A trigger that arrives while
//! a drain is running schedules exactly one follow-up pass. Failed items
//! stay queued and are retried by the next trigger; there is no retry loop.

mod http;
mod remote;
mod store;

pub use http::HttpBackend;
pub use remote::{RemoteAck, RemoteSink};
pub use store::{LocalStore, StoreEdit, SyncableStore};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use fieldsync_engine::{FeatureKey, StoreId, SyncItem, SyncOperation};

use crate::auth::LoginStatus;
use crate::context::{shutdown_requested, RuntimeContext};
use crate::error::SyncError;

const FAILURE_CHANNEL_CAPACITY: usize = 128;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edit,
    Reconnect,
    Manual,
}

/// A send that failed; the item is still queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub key: FeatureKey,
    pub operation: SyncOperation,
    pub error: SyncError,
}

/// Outcome of one pass over a store's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    /// Items replaced or claimed elsewhere since the pass began
    pub skipped: usize,
    /// Acknowledged items whose entry stays queued with a newer mutation
    pub requeued: usize,
    /// The gate closed before the pass finished
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct DrainSlot {
    running: AtomicBool,
    rerun: AtomicBool,
}

struct Armed {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Drains audit queues to the remote system.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: RuntimeContext,
    sink: Arc<dyn RemoteSink>,
    connected: watch::Receiver<bool>,
    login: watch::Receiver<LoginStatus>,
    stores: DashMap<StoreId, Arc<dyn SyncableStore>>,
    slots: DashMap<StoreId, Arc<DrainSlot>>,
    failures: broadcast::Sender<SyncFailure>,
    idle: Notify,
    armed: Mutex<Option<Armed>>,
}

impl SyncEngine {
    pub fn new(
        ctx: RuntimeContext,
        sink: Arc<dyn RemoteSink>,
        connected: watch::Receiver<bool>,
        login: watch::Receiver<LoginStatus>,
    ) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                ctx,
                sink,
                connected,
                login,
                stores: DashMap::new(),
                slots: DashMap::new(),
                failures,
                idle: Notify::new(),
                armed: Mutex::new(None),
            }),
        }
    }

    /// Register a store. If the engine is armed its edits are followed
    /// immediately.
    pub async fn add_store(&self, store: Arc<dyn SyncableStore>) {
        let store_id = store.store_id().clone();
        self.inner.stores.insert(store_id.clone(), Arc::clone(&store));

        if let Some(armed) = self.inner.armed.lock().await.as_mut() {
            let listener = self.spawn_listener(store, armed.shutdown.subscribe());
            armed.tasks.push(listener);
        }
        tracing::debug!(store = %store_id, "store registered for sync");
    }

    /// Unregister a store. A drain already running for it keeps its slot,
    /// so a store re-added under the same id waits for that drain.
    pub fn remove_store(&self, store_id: &str) -> bool {
        self.inner
            .slots
            .remove_if(store_id, |_, slot| !slot.running.load(Ordering::Acquire));
        self.inner.stores.remove(store_id).is_some()
    }

    pub fn store_ids(&self) -> Vec<StoreId> {
        let mut ids: Vec<_> = self.inner.stores.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Start following edits and the sync gate. If the gate is already
    /// open every store is drained right away.
    pub async fn arm(&self) {
        let mut armed = self.inner.armed.lock().await;
        if armed.is_some() {
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let stores: Vec<_> = self
            .inner
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut tasks = Vec::with_capacity(stores.len() + 1);
        for store in stores {
            tasks.push(self.spawn_listener(store, shutdown.subscribe()));
        }
        tasks.push(
            self.inner
                .ctx
                .net()
                .spawn(self.clone().watch_gate(shutdown.subscribe())),
        );

        tracing::info!(stores = tasks.len() - 1, "sync engine armed");
        *armed = Some(Armed { shutdown, tasks });
    }

    /// Stop following triggers. A drain already running finishes its
    /// current item and the rest of its pass.
    pub async fn disarm(&self) {
        let Some(armed) = self.inner.armed.lock().await.take() else {
            return;
        };
        armed.shutdown.send_replace(true);
        for task in armed.tasks {
            task.abort();
        }
        tracing::info!("sync engine disarmed");
    }

    pub async fn is_armed(&self) -> bool {
        self.inner.armed.lock().await.is_some()
    }

    /// Whether items may be sent right now.
    pub fn gate_open(&self) -> bool {
        *self.inner.connected.borrow() && *self.inner.login.borrow() == LoginStatus::Authenticated
    }

    /// Drain one store now.
    pub fn sync_now(&self, store_id: &str) -> bool {
        self.trigger(store_id, Trigger::Manual)
    }

    /// Drain every registered store now.
    pub fn sync_all(&self) {
        self.trigger_all(Trigger::Manual);
    }

    /// Failed sends, as they happen.
    pub fn failures(&self) -> broadcast::Receiver<SyncFailure> {
        self.inner.failures.subscribe()
    }

    /// Queued items across all stores.
    pub async fn pending_count(&self) -> usize {
        let stores: Vec<_> = self
            .inner
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut total = 0;
        for store in stores {
            total += store.pending_count().await;
        }
        total
    }

    /// Whether no drain is running.
    pub fn is_idle(&self) -> bool {
        self.inner
            .slots
            .iter()
            .all(|slot| !slot.running.load(Ordering::Acquire))
    }

    /// Wait until no drain is running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Request a drain of `store_id`. Returns `true` if a new drain task
    /// was spawned, `false` if one was running and a follow-up pass was
    /// scheduled instead, or the store is unknown.
    pub fn trigger(&self, store_id: &str, trigger: Trigger) -> bool {
        if !self.inner.stores.contains_key(store_id) {
            tracing::debug!(store = %store_id, ?trigger, "trigger for unknown store");
            return false;
        }
        let slot = self
            .inner
            .slots
            .entry(store_id.to_string())
            .or_default()
            .value()
            .clone();

        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            slot.rerun.store(true, Ordering::Release);
            tracing::debug!(store = %store_id, ?trigger, "drain running, follow-up scheduled");
            return false;
        }

        let engine = self.clone();
        let store_id = store_id.to_string();
        self.inner.ctx.net().spawn(async move {
            loop {
                slot.rerun.store(false, Ordering::Release);
                // Looked up per pass: the store may have been removed or replaced.
                let store = engine
                    .inner
                    .stores
                    .get(&store_id)
                    .map(|entry| Arc::clone(entry.value()));
                let report = match store {
                    Some(store) => engine.drain(store.as_ref(), trigger).await,
                    None => DrainReport::default(),
                };
                tracing::debug!(
                    store = %store_id,
                    ?trigger,
                    sent = report.sent,
                    failed = report.failed,
                    skipped = report.skipped,
                    requeued = report.requeued,
                    interrupted = report.interrupted,
                    "drain finished"
                );

                if slot.rerun.load(Ordering::Acquire)
                    || (report.requeued > 0 && !report.interrupted)
                {
                    continue;
                }
                slot.running.store(false, Ordering::Release);
                // A trigger may have landed between the check and the release.
                let raced = slot.rerun.load(Ordering::Acquire)
                    && slot
                        .running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                if !raced {
                    break;
                }
            }
            engine.inner.idle.notify_waiters();
        });
        true
    }

    fn trigger_all(&self, trigger: Trigger) {
        for store_id in self.store_ids() {
            self.trigger(&store_id, trigger);
        }
    }

    async fn drain(&self, store: &dyn SyncableStore, trigger: Trigger) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.gate_open() {
            tracing::debug!(store = %store.store_id(), ?trigger, "sync gate closed, drain skipped");
            report.interrupted = true;
            return report;
        }

        let items = store.ready_items().await;
        for item in &items {
            if !self.gate_open() {
                tracing::debug!(store = %store.store_id(), "sync gate closed mid-drain");
                report.interrupted = true;
                break;
            }
            if !store.begin(item).await {
                report.skipped += 1;
                continue;
            }

            match self.inner.sink.send(item).await {
                Ok(ack) => match store.acknowledge(item, ack.remote_id).await {
                    Ok(removed) => {
                        report.sent += 1;
                        if !removed {
                            report.requeued += 1;
                        }
                    }
                    Err(err) => {
                        self.inner.ctx.faults().report("sync", &err);
                        report.failed += 1;
                    }
                },
                Err(error) => {
                    store.abort(item).await;
                    self.report_failure(item, error);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn report_failure(&self, item: &SyncItem, error: SyncError) {
        tracing::warn!(
            key = %item.key(),
            operation = %item.operation,
            error = %error,
            "send failed, item stays queued"
        );
        let _ = self.inner.failures.send(SyncFailure {
            key: item.key().clone(),
            operation: item.operation,
            error,
        });
    }

    fn spawn_listener(
        &self,
        store: Arc<dyn SyncableStore>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let edits = store.edits();
        let store_id = store.store_id().clone();
        self.inner
            .ctx
            .net()
            .spawn(self.clone().follow_edits(store_id, edits, shutdown))
    }

    async fn follow_edits(
        self,
        store_id: StoreId,
        mut edits: broadcast::Receiver<StoreEdit>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let edit = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                edit = edits.recv() => edit,
            };
            match edit {
                Ok(edit) => {
                    tracing::debug!(key = %edit.feature.key, operation = %edit.operation, "edit recorded");
                    self.trigger(&store_id, Trigger::Edit);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(store = %store_id, skipped, "edit events lagged");
                    self.trigger(&store_id, Trigger::Edit);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn watch_gate(self, mut shutdown: watch::Receiver<bool>) {
        let mut connected = self.inner.connected.clone();
        let mut login = self.inner.login.clone();

        let mut was_open = {
            let is_connected = *connected.borrow_and_update();
            is_connected && *login.borrow_and_update() == LoginStatus::Authenticated
        };
        if was_open {
            self.trigger_all(Trigger::Reconnect);
        }

        loop {
            let connection_changed = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    true
                }
                changed = login.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };

            let is_connected = *connected.borrow_and_update();
            let open = is_connected && *login.borrow_and_update() == LoginStatus::Authenticated;
            if open && (!was_open || connection_changed) {
                tracing::info!("sync gate open, resyncing all stores");
                self.trigger_all(Trigger::Reconnect);
            }
            was_open = open;
        }
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("stores", &self.store_ids())
            .field("gate_open", &self.gate_open())
            .finish_non_exhaustive()
    }
}
