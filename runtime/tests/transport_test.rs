//! Integration tests for the broker transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use fieldsync_engine::envelope::{ACTION_CONFIG, ACTION_FETCH_CONFIG};
use fieldsync_engine::Envelope;
use fieldsync_runtime::auth::AuthSession;
use fieldsync_runtime::error::TransportError;
use fieldsync_runtime::transport::{
    ConnectivityTransport, MemoryBroker, PublishOutcome, Qos, RetryPolicy, TransportOptions,
};

use common::{test_context, CountingStrategy};

struct Harness {
    broker: Arc<MemoryBroker>,
    auth: AuthSession,
    transport: ConnectivityTransport,
}

impl Harness {
    async fn new(buffer_offline: bool) -> Self {
        let ctx = test_context();
        let broker = Arc::new(MemoryBroker::new());
        let auth = AuthSession::new(ctx.clone(), Arc::new(CountingStrategy::default()));
        let options = TransportOptions {
            client_id: "device-1".to_string(),
            buffer_capacity: 100,
            buffer_offline,
            request_timeout: Duration::from_millis(500),
            retry: RetryPolicy::testing(),
        };
        let transport = ConnectivityTransport::new(ctx, broker.clone(), auth.clone(), options);
        transport.start().await;
        Self {
            broker,
            auth,
            transport,
        }
    }

    async fn wait_connected(&self, connected: bool) {
        let mut state = self.transport.connection_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|c| *c == connected))
            .await
            .expect("connection state did not change")
            .unwrap();
    }

    async fn login(&self) {
        self.auth.authenticate("ana", "pw").await.unwrap();
        self.wait_connected(true).await;
    }
}

fn text(payload: &[u8]) -> String {
    String::from_utf8(payload.to_vec()).unwrap()
}

#[cfg(test)]
mod buffer_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_buffer_drops_oldest() {
        let h = Harness::new(true).await;

        for n in 1..=101 {
            let outcome = h
                .transport
                .publish("readings", format!("m{n}").into_bytes(), Qos::AtLeastOnce)
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Buffered);
        }

        let buffered: Vec<_> = h.transport.buffered().await.iter().map(|m| text(&m.payload)).collect();
        assert_eq!(buffered.len(), 100);
        assert_eq!(buffered.first().map(String::as_str), Some("m2"));
        assert_eq!(buffered.last().map(String::as_str), Some("m101"));
        assert!(!buffered.iter().any(|m| m == "m1"));
    }

    #[tokio::test]
    async fn test_buffer_is_flushed_in_order_on_connect() {
        let h = Harness::new(true).await;
        for n in 1..=101 {
            h.transport
                .publish("readings", format!("m{n}").into_bytes(), Qos::AtLeastOnce)
                .await
                .unwrap();
        }

        h.login().await;

        let published: Vec<_> = h.broker.published_on("readings").iter().map(|m| text(&m.payload)).collect();
        let expected: Vec<_> = (2..=101).map(|n| format!("m{n}")).collect();
        assert_eq!(published, expected);
        assert!(h.transport.buffered().await.is_empty());

        let outcome = h
            .transport
            .publish("readings", b"live".to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Sent);
    }

    #[tokio::test]
    async fn test_unbuffered_publish_is_dropped_offline() {
        let h = Harness::new(false).await;
        let outcome = h
            .transport
            .publish("readings", b"lost".to_vec(), Qos::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Dropped);
        assert!(h.transport.buffered().await.is_empty());
    }
}

#[cfg(test)]
mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_waits_for_login() {
        let h = Harness::new(true).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!h.broker.is_connected());
        assert!(!h.transport.is_connected());

        h.login().await;
        assert!(h.broker.is_connected());
        assert_eq!(*h.transport.reconnects().borrow(), 1);
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let h = Harness::new(true).await;
        h.login().await;
        h.transport.subscribe("alerts", Qos::AtLeastOnce).await.unwrap();
        assert_eq!(h.broker.subscriptions(), vec!["alerts".to_string()]);

        h.broker.set_online(false);
        h.wait_connected(false).await;
        assert!(h.broker.subscriptions().is_empty());

        h.broker.set_online(true);
        h.wait_connected(true).await;
        assert_eq!(h.broker.subscriptions(), vec!["alerts".to_string()]);
        assert_eq!(*h.transport.reconnects().borrow(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_uses_fresh_credential() {
        let h = Harness::new(true).await;
        h.login().await;

        h.auth.logout().await;
        h.wait_connected(false).await;

        h.login().await;
        assert_eq!(
            h.broker.connect_tokens(),
            vec!["token-1".to_string(), "token-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stop_disconnects() {
        let h = Harness::new(true).await;
        h.login().await;

        h.transport.stop().await;
        assert!(!h.transport.is_connected());
        assert!(!h.broker.is_connected());
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[tokio::test]
    async fn test_request_receives_correlated_reply() {
        let h = Harness::new(true).await;
        h.broker.respond_to("backend/config", |request| {
            Some(Envelope::new(ACTION_CONFIG, request.payload.clone()))
        });
        h.login().await;

        let reply = h
            .transport
            .request("backend/config", ACTION_FETCH_CONFIG, r#"{"deviceId":"device-1"}"#)
            .await
            .unwrap();
        assert_eq!(reply.action, ACTION_CONFIG);
        assert_eq!(reply.payload, r#"{"deviceId":"device-1"}"#);

        let request = Envelope::from_bytes(&h.broker.published_on("backend/config")[0].payload).unwrap();
        assert!(request.reply_to.starts_with("devices/device-1/inbox/"));
        // The reply topic is released afterwards.
        assert!(!h.broker.subscriptions().contains(&request.reply_to));
    }

    #[tokio::test]
    async fn test_request_requires_connection() {
        let h = Harness::new(true).await;
        let err = h
            .transport
            .request("backend/config", ACTION_FETCH_CONFIG, "{}")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let h = Harness::new(true).await;
        h.login().await;
        let err = h
            .transport
            .request("backend/silent", ACTION_FETCH_CONFIG, "{}")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn test_inbound_messages_are_decoded() {
        let h = Harness::new(true).await;
        let mut messages = h.transport.messages();
        h.login().await;
        h.transport.subscribe("alerts", Qos::AtLeastOnce).await.unwrap();

        assert!(h.broker.inject("alerts", Envelope::new(7, "storm warning").to_bytes()));
        assert!(!h.broker.inject("elsewhere", Envelope::new(7, "ignored").to_bytes()));

        let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "alerts");
        assert_eq!(message.envelope.action, 7);
        assert_eq!(message.envelope.payload, "storm warning");
    }
}
