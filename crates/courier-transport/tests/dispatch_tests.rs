//! Dispatcher and facade tests: request/response correlation, cleanup on
//! every exit path, event routing, and lifecycle, driven over the in-process
//! message bus and a loopback binding.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_protocol::{
        ConnectionState, CorrelationId, Direction, Envelope, ErrorCode, Message, Result,
        TransportError,
    };
    use courier_transport::*;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// A connected client transport and the host binding on the other end of
    /// the same bus.
    async fn post_pair() -> (Transport<PostBinding>, Arc<PostBinding>, MessageBus) {
        post_pair_with(ChannelOptions::default().with_prefix("client")).await
    }

    async fn post_pair_with(
        options: ChannelOptions,
    ) -> (Transport<PostBinding>, Arc<PostBinding>, MessageBus) {
        let bus = MessageBus::new();
        let host = Arc::new(PostBinding::host(bus.clone()));
        host.connect().await.unwrap();

        let client = PostBinding::new(bus.clone(), PostConfig::client().with_options(options));
        let transport = Transport::new("client", client);
        transport.connect().await.unwrap();
        (transport, host, bus)
    }

    /// Answer every request the host sees with `respond`.
    fn spawn_responder(
        host: Arc<PostBinding>,
        respond: impl Fn(&Message) -> Option<Message> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let mut requests = host.subscribe_events();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                if let Some(reply) = respond(&request) {
                    let _ = host.send(reply).await;
                }
            }
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Condition not reached in time");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Request / response
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn request_resolves_with_matching_reply() {
        let (transport, host, _bus) = post_pair().await;
        spawn_responder(host, |req| {
            let x = req.payload["x"].as_i64().unwrap_or(0);
            Some(req.reply(2, json!({ "x": x + 1 })))
        });

        let reply = timeout(WAIT, transport.request(Message::with_id("a1", 1, json!({"x": 1}))))
            .await
            .expect("Timeout")
            .unwrap();

        assert_eq!(reply.kind, 2);
        assert_eq!(reply.payload, json!({"x": 2}));
        assert!(reply.answers(&CorrelationId::new("a1")));
        assert!(transport.binding().channel().registry().is_empty());
    }

    #[tokio::test]
    async fn send_returns_reply_payload() {
        let (transport, host, _bus) = post_pair().await;
        spawn_responder(host, |req| Some(req.reply(2, json!("pong"))));

        let payload = timeout(WAIT, transport.send(Message::new(1, json!("ping"))))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(payload, json!("pong"));
    }

    #[tokio::test]
    async fn generated_id_is_sent_on_the_wire() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();

        let sender = transport.clone();
        let call = tokio::spawn(async move { sender.request(Message::new(1, json!(null))).await });

        let request = timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap();
        let id = request.id().cloned().expect("request carries an id");
        assert_eq!(id.as_str().len(), 36);

        host.send(request.reply(2, json!(null))).await.unwrap();
        let reply = timeout(WAIT, call).await.expect("Timeout").unwrap().unwrap();
        assert!(reply.answers(&id));
    }

    #[tokio::test]
    async fn id_is_pending_while_waiting_and_dropped_after() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();
        let id = CorrelationId::new("p1");

        let sender = transport.clone();
        let call = tokio::spawn(async move {
            sender.request(Message::with_id("p1", 1, json!(null))).await
        });

        let request = timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap();
        assert!(transport.binding().is_pending(&id));

        host.send(request.reply(2, json!(null))).await.unwrap();
        timeout(WAIT, call).await.expect("Timeout").unwrap().unwrap();
        assert!(!transport.binding().is_pending(&id));
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_own_callers() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();

        let first = transport.clone();
        let a = tokio::spawn(async move {
            first.request(Message::with_id("a", 1, json!("first"))).await
        });
        let second = transport.clone();
        let b = tokio::spawn(async move {
            second.request(Message::with_id("b", 1, json!("second"))).await
        });

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap());
        }
        // Reply in reverse arrival order.
        for request in seen.iter().rev() {
            let echoed = request.payload.clone();
            host.send(request.reply(2, echoed)).await.unwrap();
        }

        let a = timeout(WAIT, a).await.expect("Timeout").unwrap().unwrap();
        let b = timeout(WAIT, b).await.expect("Timeout").unwrap().unwrap();
        assert_eq!(a.payload, json!("first"));
        assert_eq!(b.payload, json!("second"));
        assert!(transport.binding().channel().registry().is_empty());
    }

    #[tokio::test]
    async fn reply_kind_marked_as_error_fails_with_application_error() {
        let (transport, host, _bus) = post_pair().await;
        let transport = transport.with_error_kinds([50]);
        spawn_responder(host, |req| Some(req.reply(50, json!({"description": "denied"}))));

        let err = timeout(WAIT, transport.request(Message::new(1, json!(null))))
            .await
            .expect("Timeout")
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ApplicationError);
        let reply = err.reply().unwrap();
        assert_eq!(reply.kind, 50);
        assert_eq!(reply.payload["description"], "denied");
    }

    #[tokio::test]
    async fn error_predicate_sees_the_whole_reply() {
        let (transport, host, _bus) = post_pair().await;
        let transport = transport.with_error_predicate(|reply| reply.payload.get("error").is_some());
        spawn_responder(host, |req| {
            if req.kind == 1 {
                Some(req.reply(2, json!({"ok": true})))
            } else {
                Some(req.reply(2, json!({"error": "nope"})))
            }
        });

        assert!(transport.request(Message::new(1, json!(null))).await.is_ok());
        let err = transport.request(Message::new(3, json!(null))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ApplicationError);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cleanup paths
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn disconnect_fails_pending_request_with_closed_connection() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();

        let sender = transport.clone();
        let call = tokio::spawn(async move {
            sender.request(Message::with_id("c1", 7, json!(null))).await
        });
        timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap();

        transport.disconnect().await;

        let err = timeout(WAIT, call).await.expect("Timeout").unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ClosedConnection { kind: 7 }));
        assert_eq!(err.to_string(), "Message 7 was not sent. Connection is closed");
        assert!(transport.binding().channel().registry().is_empty());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_request_drops_its_id() {
        let (transport, _host, _bus) = post_pair().await;
        let id = CorrelationId::new("cancel-me");

        let result = timeout(
            Duration::from_millis(50),
            transport.request(Message::with_id("cancel-me", 1, json!(null))),
        )
        .await;

        assert!(result.is_err(), "no reply should have arrived");
        assert!(!transport.binding().is_pending(&id));
    }

    #[tokio::test]
    async fn send_on_disconnected_binding_fails_to_transmit() {
        let bus = MessageBus::new();
        let transport = Transport::new("client", PostBinding::client(bus));

        let err = transport.request(Message::new(1, json!(null))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransmissionFailure);
        assert!(transport.binding().channel().registry().is_empty());
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_rejected_before_transmit() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();
        let id = CorrelationId::new("d1");

        let sender = transport.clone();
        let first = tokio::spawn(async move {
            sender.request(Message::with_id("d1", 1, json!("first"))).await
        });
        timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap();

        let err = transport
            .request(Message::with_id("d1", 1, json!("second")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::DuplicateCorrelationId(ref dup) if *dup == id));
        // The first request keeps its registration.
        assert!(transport.binding().is_pending(&id));
        // And the duplicate never reached the wire.
        assert!(timeout(Duration::from_millis(50), requests.recv()).await.is_err());

        first.abort();
        let _ = first.await;
        wait_until(|| !transport.binding().is_pending(&id)).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fire-and-forget
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fire_and_forget_resolves_without_registering() {
        let (transport, host, _bus) = post_pair().await;
        let mut inbound = host.subscribe_events();

        let result = transport
            .send_with(Message::new(9, json!({"note": 1})), SendOptions::fire_and_forget())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(transport.binding().channel().registry().is_empty());

        let seen = timeout(WAIT, inbound.recv()).await.expect("Timeout").unwrap();
        assert_eq!(seen.kind, 9);
        assert!(seen.id().is_some());
    }

    #[tokio::test]
    async fn fire_and_forget_with_pending_id_leaves_registration_alone() {
        let (transport, host, _bus) = post_pair().await;
        let mut requests = host.subscribe_events();
        let id = CorrelationId::new("shared");

        let sender = transport.clone();
        let call = tokio::spawn(async move {
            sender.request(Message::with_id("shared", 1, json!(null))).await
        });
        let request = timeout(WAIT, requests.recv()).await.expect("Timeout").unwrap();

        transport
            .send_with(Message::with_id("shared", 9, json!(null)), SendOptions::fire_and_forget())
            .await
            .unwrap();
        assert!(transport.binding().is_pending(&id));

        host.send(request.reply(2, json!("done"))).await.unwrap();
        let reply = timeout(WAIT, call).await.expect("Timeout").unwrap().unwrap();
        assert_eq!(reply.payload, json!("done"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events and invalid input
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_id_is_delivered_as_event() {
        let (transport, host, _bus) = post_pair().await;
        let mut events = transport.subscribe_events();

        host.send(Message::with_id("zz", 30, json!({"tick": 1}))).await.unwrap();
        host.send(Message::new(31, json!({"tick": 2}))).await.unwrap();

        let first = timeout(WAIT, events.recv()).await.expect("Timeout").unwrap();
        let second = timeout(WAIT, events.recv()).await.expect("Timeout").unwrap();
        assert_eq!(first.kind, 30);
        assert_eq!(second.kind, 31);
    }

    #[tokio::test]
    async fn invalid_item_is_logged_and_later_items_still_flow() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let options = ChannelOptions::default()
            .with_prefix("client")
            .with_diagnostics(memory.clone());
        let (transport, _host, bus) = post_pair_with(options).await;
        let mut events = transport.subscribe_events();

        bus.publish(Envelope::new(Direction::FromHost, json!("garbage")));
        bus.publish(Envelope::new(
            Direction::FromHost,
            json!({"payloadType": 5, "payload": "fine"}),
        ));

        let event = timeout(WAIT, events.recv()).await.expect("Timeout").unwrap();
        assert_eq!(event.kind, 5);

        let logs = transport.get_logs();
        let error = logs
            .iter()
            .find(|entry| entry.level == LogLevel::Error)
            .expect("invalid item was logged");
        assert!(error.text.as_deref().unwrap().starts_with("InvalidMessage"));
        assert_eq!(error.prefix, "client");
    }

    #[tokio::test]
    async fn own_outbound_traffic_is_not_echoed_back() {
        let (transport, host, _bus) = post_pair().await;
        let mut events = transport.subscribe_events();

        transport
            .send_with(Message::new(1, json!("mine")), SendOptions::fire_and_forget())
            .await
            .unwrap();
        host.send(Message::new(2, json!("theirs"))).await.unwrap();

        let event = timeout(WAIT, events.recv()).await.expect("Timeout").unwrap();
        assert_eq!(event.payload, json!("theirs"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn state_subscription_replays_and_follows_transitions() {
        let bus = MessageBus::new();
        let transport = Transport::new("client", PostBinding::client(bus));
        let mut states = transport.subscribe_state();

        transport.connect().await.unwrap();
        transport.disconnect().await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(timeout(WAIT, states.next()).await.expect("Timeout").unwrap());
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn late_subscriber_sees_current_state_first() {
        let (transport, _host, _bus) = post_pair().await;
        let mut states = transport.subscribe_state();
        assert_eq!(states.next().await, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn connect_while_connected_is_a_noop() {
        let (transport, _host, _bus) = post_pair().await;
        let mut states = transport.subscribe_state();
        states.next().await;

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(timeout(Duration::from_millis(50), states.next()).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_when_disconnected_is_a_noop() {
        let bus = MessageBus::new();
        let transport = Transport::new("client", PostBinding::client(bus));
        timeout(WAIT, transport.disconnect()).await.expect("Timeout");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_serves_requests_again() {
        let (transport, host, _bus) = post_pair().await;
        spawn_responder(host, |req| Some(req.reply(2, json!("again"))));

        transport.disconnect().await;
        transport.connect().await.unwrap();

        let payload = timeout(WAIT, transport.send(Message::new(1, json!(null))))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(payload, json!("again"));
    }

    #[tokio::test]
    async fn logs_record_request_and_response_with_names() {
        let memory = Arc::new(MemoryDiagnostics::new());
        let options = ChannelOptions::default()
            .with_prefix("client")
            .with_diagnostics(memory)
            .with_namer(|kind| match kind {
                1 => "PING_REQ".into(),
                2 => "PING_RES".into(),
                other => other.to_string(),
            });
        let (transport, host, _bus) = post_pair_with(options).await;
        spawn_responder(host, |req| Some(req.reply(2, json!(null))));

        transport.request(Message::new(1, json!(null))).await.unwrap();

        let logs = transport.get_logs();
        let request = logs.iter().find(|e| e.level == LogLevel::Request).unwrap();
        let response = logs.iter().find(|e| e.level == LogLevel::Response).unwrap();
        assert_eq!(request.name.as_deref(), Some("PING_REQ"));
        assert_eq!(response.name.as_deref(), Some("PING_RES"));
        assert!(logs.iter().any(|e| e.text.as_deref() == Some("connected to host")));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loopback binding
    // ─────────────────────────────────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Reply, then disconnect, before the dispatcher starts waiting.
        ReplyThenClose,
        /// Disconnect without replying.
        Close,
        /// Fail the transmit.
        Fail,
        /// Reply, then push `n` replies for the bystander id after it.
        ReplyThenFlood(usize),
        /// Push `n` replies for the bystander id, then reply.
        FloodThenReply(usize),
    }

    const BYSTANDER: &str = "bystander";

    struct Loopback {
        channel: Channel,
        behavior: Behavior,
    }

    impl Loopback {
        fn new(behavior: Behavior) -> Self {
            Self::with_options(behavior, ChannelOptions::default())
        }

        fn with_options(behavior: Behavior, options: ChannelOptions) -> Self {
            Self {
                channel: Channel::new(options.with_prefix("loopback")),
                behavior,
            }
        }

        fn flood(&self, n: usize) {
            for i in 0..n {
                self.channel.deliver(Message::with_id(BYSTANDER, 0, json!(i)));
            }
        }
    }

    impl ChannelBinding for Loopback {
        fn channel(&self) -> &Channel {
            &self.channel
        }

        async fn connect(&self) -> Result<()> {
            self.channel.publish_state(ConnectionState::Connecting);
            self.channel.publish_state(ConnectionState::Connected);
            Ok(())
        }

        async fn disconnect(&self) {
            self.channel.publish_state(ConnectionState::Disconnected);
        }

        async fn send(&self, message: Message) -> Result<()> {
            match self.behavior {
                Behavior::ReplyThenClose => {
                    self.channel.log_outbound(&message);
                    self.channel.deliver(message.reply(message.kind + 1, json!("late but queued")));
                    self.channel.publish_state(ConnectionState::Disconnected);
                    Ok(())
                }
                Behavior::Close => {
                    self.channel.publish_state(ConnectionState::Disconnected);
                    Ok(())
                }
                Behavior::Fail => Err(TransportError::transmission("wire cut")),
                Behavior::ReplyThenFlood(n) => {
                    self.channel.deliver(message.reply(message.kind + 1, json!("mine")));
                    self.flood(n);
                    Ok(())
                }
                Behavior::FloodThenReply(n) => {
                    self.flood(n);
                    self.channel.deliver(message.reply(message.kind + 1, json!("mine")));
                    Ok(())
                }
            }
        }
    }

    #[tokio::test]
    async fn queued_reply_wins_over_queued_disconnect() {
        let transport = Transport::new("loop", Loopback::new(Behavior::ReplyThenClose));
        transport.connect().await.unwrap();

        let reply = timeout(WAIT, transport.request(Message::new(1, json!(null))))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(reply.kind, 2);
        assert_eq!(reply.payload, json!("late but queued"));
        assert!(transport.binding().channel().registry().is_empty());
    }

    #[tokio::test]
    async fn disconnect_during_transmit_fails_request() {
        let transport = Transport::new("loop", Loopback::new(Behavior::Close));
        transport.connect().await.unwrap();

        let err = timeout(WAIT, transport.request(Message::new(4, json!(null))))
            .await
            .expect("Timeout")
            .unwrap_err();
        assert!(matches!(err, TransportError::ClosedConnection { kind: 4 }));
        assert!(transport.binding().channel().registry().is_empty());
    }

    #[tokio::test]
    async fn transmit_failure_propagates_and_drops_id() {
        let transport = Transport::new("loop", Loopback::new(Behavior::Fail));
        transport.connect().await.unwrap();

        let err = transport
            .request(Message::with_id("f1", 1, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransmissionFailure);
        assert!(!transport.binding().is_pending(&CorrelationId::new("f1")));
    }

    #[tokio::test]
    async fn send_request_works_directly_on_a_binding() {
        let binding = Loopback::new(Behavior::ReplyThenClose);
        binding.connect().await.unwrap();

        let reply = send_request(&binding, Message::new(1, json!(null)), SendOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, 2);
    }

    #[tokio::test]
    async fn reply_lost_to_lag_fails_instead_of_hanging() {
        let binding = Loopback::with_options(
            Behavior::ReplyThenFlood(1),
            ChannelOptions::default().with_capacity(1),
        );
        let transport = Transport::new("loop", binding);
        transport.connect().await.unwrap();
        assert!(transport.binding().add(&CorrelationId::new(BYSTANDER)));

        let err = timeout(WAIT, transport.request(Message::with_id("x", 1, json!(null))))
            .await
            .expect("Request hung after its reply was overwritten")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChannelError);
        assert!(err.to_string().contains("lagged"));
        assert!(!transport.binding().is_pending(&CorrelationId::new("x")));
        assert!(transport.binding().is_pending(&CorrelationId::new(BYSTANDER)));
    }

    #[tokio::test]
    async fn lagged_subscriber_still_finds_buffered_reply() {
        let binding = Loopback::with_options(
            Behavior::FloodThenReply(2),
            ChannelOptions::default().with_capacity(1),
        );
        let transport = Transport::new("loop", binding);
        transport.connect().await.unwrap();
        assert!(transport.binding().add(&CorrelationId::new(BYSTANDER)));

        let reply = timeout(WAIT, transport.request(Message::with_id("y", 1, json!(null))))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(reply.payload, json!("mine"));
        assert!(!transport.binding().is_pending(&CorrelationId::new("y")));
    }
}
