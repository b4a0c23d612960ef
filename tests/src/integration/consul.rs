//! # Consul Adapter Flows
//!
//! Drives `ConsulEventLog` and full buses against the stub agent in
//! [`crate::stub_consul`], covering the HTTP details the in-memory log
//! cannot: base64 payloads, `null` listings, `X-Consul-Index` blocking
//! queries, ACL token and datacenter propagation, and HTTP failures.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use pong_bus::{
        BusConfig, BusError, ConsulEventLog, EventBus, EventLog, LogError, Message,
        ShutdownCode, WatchOptions, EVENT_NAME,
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::stub_consul::StubConsul;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn config_for(stub: &StubConsul) -> BusConfig {
        BusConfig::default()
            .with_consul_uri(&stub.uri())
            .with_watch(WatchOptions {
                wait: Duration::from_millis(200),
                max_retries: 1,
                retry_base: Duration::from_millis(1),
                retry_max: Duration::from_millis(5),
            })
    }

    #[tokio::test]
    async fn test_fire_and_list_round_trip_through_agent() {
        let stub = StubConsul::spawn().await.unwrap();
        let log = ConsulEventLog::new(&config_for(&stub)).unwrap();

        let empty = log.list(EVENT_NAME).await.unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.index, 1);

        let id = log.fire(EVENT_NAME, b"{\"address\":\"a\"}".to_vec()).await.unwrap();
        assert_eq!(stub.events()[0].id, id);
        assert_eq!(stub.events()[0].payload, b"{\"address\":\"a\"}".to_vec());

        let batch = log.list(EVENT_NAME).await.unwrap();
        assert_eq!(batch.index, 2);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].id, id);
        assert_eq!(batch.events[0].payload, b"{\"address\":\"a\"}".to_vec());
    }

    #[tokio::test]
    async fn test_list_filters_other_event_names() {
        let stub = StubConsul::spawn().await.unwrap();
        stub.insert("d1", "deploy", b"v2", 1);
        stub.insert("p1", EVENT_NAME, b"{}", 2);

        let log = ConsulEventLog::new(&config_for(&stub)).unwrap();
        let batch = log.list(EVENT_NAME).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].id, "p1");
    }

    #[tokio::test]
    async fn test_blocking_query_waits_for_new_index() {
        let stub = StubConsul::spawn().await.unwrap();
        let log = Arc::new(ConsulEventLog::new(&config_for(&stub)).unwrap());

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move {
                log.list_blocking(EVENT_NAME, 1, Duration::from_secs(10)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        stub.insert("e1", EVENT_NAME, b"{}", 1);
        let batch = timeout(DEADLINE, waiter)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(batch.index, 2);
        assert_eq!(stub.blocking_queries(), 1);
    }

    #[tokio::test]
    async fn test_token_and_datacenter_are_sent() {
        let stub = StubConsul::spawn().await.unwrap();
        let config = config_for(&stub)
            .with_token("secret")
            .with_datacenter("dc2");
        let log = ConsulEventLog::new(&config).unwrap();

        log.fire(EVENT_NAME, b"{}".to_vec()).await.unwrap();
        assert_eq!(stub.last_token().as_deref(), Some("secret"));
        assert_eq!(stub.last_datacenter().as_deref(), Some("dc2"));

        log.list(EVENT_NAME).await.unwrap();
        assert_eq!(stub.last_datacenter().as_deref(), Some("dc2"));
    }

    #[tokio::test]
    async fn test_end_to_end_scenario_over_http() {
        let stub = StubConsul::spawn().await.unwrap();
        let bus = EventBus::new(config_for(&stub));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.consume("a", move |m| {
            let _ = tx.send(m.clone());
        });

        bus.start().await.unwrap();
        assert_eq!(bus.watermark(), 0);

        let payload = Message::new("a", "x").to_json().unwrap();
        stub.insert("42", EVENT_NAME, &payload, 7);

        let received = timeout(DEADLINE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, Message::new("a", "x").with_id("42"));
        assert_eq!(bus.watermark(), 7);
    }

    #[tokio::test]
    async fn test_publish_reaches_remote_subscriber() {
        let stub = StubConsul::spawn().await.unwrap();
        stub.insert("old", EVENT_NAME, br#"{"address":"orders"}"#, 1);

        let subscriber = EventBus::new(config_for(&stub));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.consume("orders", move |m| {
            let _ = tx.send(m.clone());
        });
        subscriber.start().await.unwrap();
        assert_eq!(subscriber.watermark(), 1);

        let config = config_for(&stub);
        let publisher = EventBus::with_log(
            Arc::new(ConsulEventLog::new(&config).unwrap()),
            config,
        );
        let id = publisher
            .publish(&Message::new("orders", json!({"sku": 7})))
            .await
            .unwrap();

        let received = timeout(DEADLINE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.payload, json!({"sku": 7}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_error_fails_start() {
        let stub = StubConsul::spawn().await.unwrap();
        stub.fail_with(Some(StatusCode::FORBIDDEN));

        let bus = EventBus::new(config_for(&stub));
        let err = bus.start().await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Query(LogError::Status { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails_start() {
        // Reserve a port, then free it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bus = EventBus::new(BusConfig::default().with_consul_uri(&format!("http://{addr}")));
        let err = bus.start().await.unwrap_err();
        assert!(matches!(err, BusError::Query(LogError::Connection(_))));
    }

    #[tokio::test]
    async fn test_agent_outage_ends_watch_with_fatal_code() {
        let stub = StubConsul::spawn().await.unwrap();
        let bus = EventBus::new(config_for(&stub));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on_error(move |text| {
            let _ = tx.send(text.to_string());
        });
        let signal = bus.shutdown_signal().unwrap();

        bus.start().await.unwrap();
        stub.fail_with(Some(StatusCode::INTERNAL_SERVER_ERROR));

        let code = timeout(DEADLINE, signal).await.expect("timeout");
        assert_eq!(code, ShutdownCode::Fatal);
        let diagnostic = rx.recv().await.unwrap();
        assert!(diagnostic.starts_with("error accessing event log"));
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_poll() {
        let stub = StubConsul::spawn().await.unwrap();
        let config = config_for(&stub).with_watch(WatchOptions {
            wait: Duration::from_secs(60),
            ..WatchOptions::default()
        });
        let bus = EventBus::new(config);
        let signal = bus.shutdown_signal().unwrap();

        bus.start().await.unwrap();
        timeout(DEADLINE, async {
            while stub.blocking_queries() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watch never reached a long poll");

        bus.stop().unwrap();
        let code = timeout(Duration::from_secs(1), signal).await.expect("timeout");
        assert_eq!(code, ShutdownCode::Clean);
    }
}
