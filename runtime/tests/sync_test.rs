//! Integration tests for the sync engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use fieldsync_engine::SyncOperation;
use fieldsync_runtime::auth::LoginStatus;
use fieldsync_runtime::sync::{LocalStore, SyncEngine};

use common::{eventually, test_context, RecordingSink};

const LAYER: &str = "plots";

struct Harness {
    engine: SyncEngine,
    store: Arc<LocalStore>,
    sink: Arc<RecordingSink>,
    connected: watch::Sender<bool>,
    login: watch::Sender<LoginStatus>,
}

impl Harness {
    async fn new(sink: Arc<RecordingSink>) -> Self {
        let (connected, connected_rx) = watch::channel(false);
        let (login, login_rx) = watch::channel(LoginStatus::Authenticated);
        let engine = SyncEngine::new(test_context(), sink.clone(), connected_rx, login_rx);

        let store = Arc::new(LocalStore::with_layers("survey", [LAYER]));
        engine.add_store(store.clone()).await;
        engine.arm().await;

        Self {
            engine,
            store,
            sink,
            connected,
            login,
        }
    }

    async fn drained(&self) -> bool {
        let engine = self.engine.clone();
        eventually(|| {
            let engine = engine.clone();
            async move { engine.pending_count().await == 0 && engine.is_idle() }
        })
        .await
    }
}

/// Let pending edit triggers run while the gate is still closed.
async fn settle(h: &Harness) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.idle().await;
}

#[cfg(test)]
mod trigger_tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_drains_queue_in_insertion_order() {
        let h = Harness::new(RecordingSink::new()).await;

        let f1 = h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        let f2 = h.store.insert(LAYER, json!({ "name": "f2" })).await.unwrap();
        settle(&h).await;
        assert!(h.sink.sent().is_empty());
        assert_eq!(h.store.pending().await.len(), 2);

        h.connected.send_replace(true);
        assert!(h.drained().await);

        assert_eq!(
            h.sink.sent(),
            vec![
                (f1.key.clone(), SyncOperation::Create),
                (f2.key.clone(), SyncOperation::Create),
            ]
        );
        let row = h.store.get(LAYER, f1.key.local_row_id).await.unwrap();
        assert_eq!(
            row.remote_id,
            Some(format!("remote-{}", f1.key.local_row_id))
        );
    }

    #[tokio::test]
    async fn test_edit_drains_while_gate_open() {
        let h = Harness::new(RecordingSink::new()).await;
        h.connected.send_replace(true);

        let f1 = h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        assert!(h.drained().await);
        assert_eq!(h.sink.sends_of(&f1.key), 1);

        h.store
            .update(LAYER, f1.key.local_row_id, json!({ "name": "renamed" }))
            .await
            .unwrap();
        assert!(h.drained().await);
        assert_eq!(h.sink.sent().last(), Some(&(f1.key.clone(), SyncOperation::Update)));
    }

    #[tokio::test]
    async fn test_login_gates_draining() {
        let h = Harness::new(RecordingSink::new()).await;
        h.login.send_replace(LoginStatus::NotAuthenticated);
        h.connected.send_replace(true);

        h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.idle().await;
        assert!(h.sink.sent().is_empty());

        h.login.send_replace(LoginStatus::Authenticated);
        assert!(h.drained().await);
        assert_eq!(h.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_every_store() {
        let h = Harness::new(RecordingSink::new()).await;
        let other = Arc::new(LocalStore::with_layers("sensors", ["observations"]));
        h.engine.add_store(other.clone()).await;

        h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        other
            .insert("observations", json!({ "value": 0.3 }))
            .await
            .unwrap();

        h.connected.send_replace(true);
        assert!(h.drained().await);
        assert_eq!(h.sink.sent().len(), 2);
        assert!(other.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_engine_ignores_edits() {
        let h = Harness::new(RecordingSink::new()).await;
        h.connected.send_replace(true);
        h.engine.disarm().await;
        assert!(!h.engine.is_armed().await);

        h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.sink.sent().is_empty());

        // Re-arming with the gate open drains right away.
        h.engine.arm().await;
        assert!(h.drained().await);
        assert_eq!(h.sink.sent().len(), 1);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_item_is_retried_by_next_edit() {
        let h = Harness::new(RecordingSink::new()).await;
        let mut failures = h.engine.failures();

        let f1 = h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        h.sink.fail(&f1.key, 1);
        settle(&h).await;

        h.connected.send_replace(true);
        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.key, f1.key);
        assert_eq!(failure.operation, SyncOperation::Create);
        h.engine.idle().await;
        assert_eq!(h.store.pending().await.len(), 1);
        assert_eq!(h.sink.sends_of(&f1.key), 1);

        let f2 = h.store.insert(LAYER, json!({ "name": "f2" })).await.unwrap();
        assert!(h.drained().await);
        assert_eq!(h.sink.sends_of(&f1.key), 2);
        assert_eq!(h.sink.sends_of(&f2.key), 1);

        // Acknowledged items are never sent again.
        let f3 = h.store.insert(LAYER, json!({ "name": "f3" })).await.unwrap();
        assert!(h.drained().await);
        assert_eq!(h.sink.sends_of(&f1.key), 2);
        assert_eq!(h.sink.sends_of(&f2.key), 1);
        assert_eq!(h.sink.sends_of(&f3.key), 1);
    }

    #[tokio::test]
    async fn test_delete_after_failed_create_reaches_remote() {
        let h = Harness::new(RecordingSink::new()).await;
        let mut failures = h.engine.failures();

        let f1 = h.store.insert(LAYER, json!({ "name": "f1" })).await.unwrap();
        h.sink.fail(&f1.key, 1);
        settle(&h).await;
        h.connected.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        h.engine.idle().await;

        // The failed create may have landed, so the delete must follow it.
        h.store.delete(LAYER, f1.key.local_row_id).await.unwrap();
        assert!(h.drained().await);

        assert_eq!(
            h.sink.sent(),
            vec![
                (f1.key.clone(), SyncOperation::Create),
                (f1.key.clone(), SyncOperation::Create),
                (f1.key.clone(), SyncOperation::Delete),
            ]
        );
        let tombstone = h
            .store
            .read()
            .await
            .get_including_deleted(LAYER, f1.key.local_row_id)
            .cloned();
        assert!(tombstone.is_none());
    }

    #[tokio::test]
    async fn test_gate_closing_stops_new_sends() {
        let h = Harness::new(RecordingSink::slow(Duration::from_millis(50))).await;
        for n in 0..3 {
            h.store.insert(LAYER, json!({ "n": n })).await.unwrap();
        }
        settle(&h).await;

        h.connected.send_replace(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.connected.send_replace(false);
        h.engine.idle().await;

        // The send in flight completed; nothing new started.
        assert_eq!(h.sink.sent().len(), 1);
        assert_eq!(h.store.pending().await.len(), 2);

        h.connected.send_replace(true);
        assert!(h.drained().await);
        assert_eq!(h.sink.sent().len(), 3);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_triggers_never_overlap_sends() {
        let h = Harness::new(RecordingSink::slow(Duration::from_millis(10))).await;
        let mut features = Vec::new();
        for n in 0..5 {
            features.push(h.store.insert(LAYER, json!({ "n": n })).await.unwrap());
        }

        // Reconnect trigger, edit triggers and manual syncs all at once.
        h.connected.send_replace(true);
        let edits = {
            let store = h.store.clone();
            let features = features.clone();
            tokio::spawn(async move {
                for feature in features {
                    store
                        .update(LAYER, feature.key.local_row_id, json!({ "edited": true }))
                        .await
                        .unwrap();
                }
            })
        };
        for _ in 0..5 {
            h.engine.sync_now("survey");
            h.engine.sync_all();
            tokio::task::yield_now().await;
        }
        edits.await.unwrap();

        assert!(h.drained().await);
        assert_eq!(h.sink.overlaps(), 0);
        for feature in &features {
            let row = h.store.get(LAYER, feature.key.local_row_id).await.unwrap();
            assert!(row.remote_id.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_re_added_store_waits_for_running_drain() {
        let h = Harness::new(RecordingSink::slow(Duration::from_millis(30))).await;
        h.store.insert(LAYER, json!({ "n": 1 })).await.unwrap();
        settle(&h).await;

        h.connected.send_replace(true);
        let engine = h.engine.clone();
        assert!(
            eventually(|| {
                let engine = engine.clone();
                async move { !engine.is_idle() }
            })
            .await
        );

        assert!(h.engine.remove_store("survey"));
        let again = Arc::new(LocalStore::with_layers("survey", [LAYER]));
        h.engine.add_store(again.clone()).await;
        assert!(!h.engine.sync_now("survey"));

        // Same local row id as the row still in flight.
        again.insert(LAYER, json!({ "n": 2 })).await.unwrap();
        assert!(h.drained().await);
        assert!(again.pending().await.is_empty());
        assert_eq!(h.sink.sent().len(), 2);
        assert_eq!(h.sink.overlaps(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_during_drain_schedules_follow_up() {
        let h = Harness::new(RecordingSink::slow(Duration::from_millis(30))).await;
        h.store.insert(LAYER, json!({ "n": 1 })).await.unwrap();
        settle(&h).await;

        h.connected.send_replace(true);
        let engine = h.engine.clone();
        assert!(
            eventually(|| {
                let engine = engine.clone();
                async move { !engine.is_idle() }
            })
            .await
        );
        assert!(!h.engine.sync_now("survey"));

        let late = h.store.insert(LAYER, json!({ "n": 2 })).await.unwrap();
        assert!(h.drained().await);
        assert_eq!(h.sink.sends_of(&late.key), 1);
    }
}
