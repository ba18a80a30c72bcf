//! Core tests: registry, state cell, demultiplexer, diagnostics.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_protocol::{ConnectionState, CorrelationId, Message};
    use courier_transport::*;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    // ─────────────────────────────────────────────────────────────────────
    // CorrelationRegistry
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn registry_add_and_drop() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new("a1");

        assert!(registry.is_empty());
        assert!(registry.add(&id));
        assert!(registry.is_pending(&id));
        assert_eq!(registry.len(), 1);

        assert!(registry.drop(&id));
        assert!(!registry.is_pending(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_rejects_second_add_of_same_id() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new("dup");
        assert!(registry.add(&id));
        assert!(!registry.add(&id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_drop_of_unknown_id_is_noop() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.drop(&CorrelationId::new("never")));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_clones_share_state() {
        let registry = CorrelationRegistry::new();
        let other = registry.clone();
        registry.add(&CorrelationId::new("shared"));
        assert!(other.is_pending(&CorrelationId::new("shared")));
        assert_eq!(other.snapshot(), vec![CorrelationId::new("shared")]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // StateCell
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn state_starts_disconnected() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn state_publish_suppresses_duplicates() {
        let cell = StateCell::new();
        assert!(!cell.publish(ConnectionState::Disconnected));
        assert!(cell.publish(ConnectionState::Connecting));
        assert!(!cell.publish(ConnectionState::Connecting));
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn state_subscription_replays_current_then_follows() {
        let cell = StateCell::new();
        cell.publish(ConnectionState::Connecting);

        let mut sub = cell.subscribe();
        cell.publish(ConnectionState::Connected);
        cell.publish(ConnectionState::Disconnected);

        assert_eq!(sub.next().await, Some(ConnectionState::Connecting));
        assert_eq!(sub.next().await, Some(ConnectionState::Connected));
        assert_eq!(sub.next().await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn state_subscription_ends_when_cell_dropped() {
        let cell = StateCell::new();
        let mut sub = cell.subscribe();
        drop(cell);
        assert_eq!(sub.next().await, Some(ConnectionState::Disconnected));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn state_wait_for_observes_target() {
        let cell = Arc::new(StateCell::new());
        let mut sub = cell.subscribe();

        let publisher = cell.clone();
        tokio::spawn(async move {
            publisher.publish(ConnectionState::Connecting);
            publisher.publish(ConnectionState::Connected);
        });

        let reached = timeout(WAIT, sub.wait_for(ConnectionState::Connected))
            .await
            .expect("Timeout waiting for Connected");
        assert!(reached);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Demultiplexer
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn pending_id_is_classified_as_response() {
        let registry = CorrelationRegistry::new();
        let demux = Demultiplexer::new(registry.clone(), 16);
        registry.add(&CorrelationId::new("a1"));

        let msg = Message::with_id("a1", 2, json!({}));
        assert_eq!(demux.classify(&msg), Route::Response);
    }

    #[test]
    fn unknown_or_missing_id_is_classified_as_event() {
        let demux = Demultiplexer::new(CorrelationRegistry::new(), 16);
        assert_eq!(demux.classify(&Message::with_id("zz", 1, json!(null))), Route::Event);
        assert_eq!(demux.classify(&Message::new(1, json!(null))), Route::Event);
    }

    #[tokio::test]
    async fn demux_routes_to_separate_streams_in_order() {
        let registry = CorrelationRegistry::new();
        let demux = Demultiplexer::new(registry.clone(), 16);
        let mut responses = demux.subscribe_responses();
        let mut events = demux.subscribe_events();
        registry.add(&CorrelationId::new("r"));

        demux.route(Message::new(10, json!(1)));
        demux.route(Message::with_id("r", 2, json!("reply")));
        demux.route(Message::new(10, json!(2)));

        assert_eq!(responses.recv().await.unwrap().payload, json!("reply"));
        assert_eq!(events.recv().await.unwrap().payload, json!(1));
        assert_eq!(events.recv().await.unwrap().payload, json!(2));
    }

    #[test]
    fn demux_never_drops_ids() {
        let registry = CorrelationRegistry::new();
        let demux = Demultiplexer::new(registry.clone(), 16);
        let id = CorrelationId::new("keep");
        registry.add(&id);

        demux.route(Message::with_id("keep", 2, json!(null)));
        assert!(registry.is_pending(&id));
    }

    #[test]
    fn routing_without_subscribers_is_not_an_error() {
        let demux = Demultiplexer::new(CorrelationRegistry::new(), 1);
        for i in 0..4 {
            assert_eq!(demux.route(Message::new(i, json!(null))), Route::Event);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Channel + Diagnostics
    // ─────────────────────────────────────────────────────────────────────

    fn memory_channel(memory: &Arc<MemoryDiagnostics>) -> Channel {
        Channel::new(
            ChannelOptions::default()
                .with_prefix("test")
                .with_diagnostics(memory.clone())
                .with_namer(|kind| match kind {
                    1 => "PING".to_string(),
                    2 => "PONG".to_string(),
                    other => format!("KIND_{other}"),
                }),
        )
    }

    #[test]
    fn outbound_is_logged_as_request_only_when_pending() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let channel = memory_channel(&memory);

        let msg = Message::with_id("a1", 1, json!({}));
        channel.log_outbound(&msg);
        channel.registry().add(&CorrelationId::new("a1"));
        channel.log_outbound(&msg);

        let logs = memory.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Event);
        assert_eq!(logs[1].level, LogLevel::Request);
        assert_eq!(logs[1].name.as_deref(), Some("PING"));
        assert_eq!(logs[1].prefix, "test");
    }

    #[test]
    fn deliver_logs_response_or_event() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let channel = memory_channel(&memory);
        channel.registry().add(&CorrelationId::new("a1"));

        assert_eq!(channel.deliver(Message::with_id("a1", 2, json!(null))), Route::Response);
        assert_eq!(channel.deliver(Message::new(7, json!(null))), Route::Event);

        let logs = memory.logs();
        assert_eq!(logs[0].level, LogLevel::Response);
        assert_eq!(logs[0].name.as_deref(), Some("PONG"));
        assert_eq!(logs[1].level, LogLevel::Event);
        assert_eq!(logs[1].name.as_deref(), Some("KIND_7"));
    }

    #[test]
    fn reject_logs_invalid_message_error() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let channel = memory_channel(&memory);

        channel.reject("expected value at line 1 column 1");

        let logs = memory.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert!(logs[0].text.as_deref().unwrap().starts_with("InvalidMessage"));
    }

    #[tokio::test]
    async fn fault_is_logged_and_broadcast() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let channel = memory_channel(&memory);
        let mut faults = channel.subscribe_faults();

        channel.fault(courier_protocol::TransportError::socket(Some(4001), "kicked"));

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.code(), courier_protocol::ErrorCode::SocketError);
        assert!(memory.logs()[0].text.as_deref().unwrap().starts_with("SocketError"));
    }

    #[test]
    fn memory_diagnostics_evicts_oldest() {
        let memory = MemoryDiagnostics::with_capacity(2);
        memory.info("p", "one");
        memory.info("p", "two");
        memory.info("p", "three");

        let texts: Vec<_> = memory.logs().into_iter().filter_map(|e| e.text).collect();
        assert_eq!(texts, vec!["two", "three"]);

        memory.clear();
        assert!(memory.logs().is_empty());
    }

    #[test]
    fn tracing_diagnostics_keeps_no_history() {
        let diagnostics = TracingDiagnostics;
        diagnostics.info("p", "hello");
        assert!(diagnostics.logs().is_empty());
    }

    #[test]
    fn log_entries_serialize_with_lowercase_level() {
        let memory = MemoryDiagnostics::new();
        memory.error("p", "boom");
        let json = serde_json::to_value(&memory.logs()[0]).unwrap();
        assert_eq!(json["level"], "error");
        assert_eq!(json["text"], "boom");
        assert!(json.get("message").is_none());
    }
}
