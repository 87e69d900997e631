//! # Messaging Integration
//!
//! End-to-end delivery scenarios through the facade: authorization gating,
//! retry/dead-letter behavior, circuit breakers, and dead-letter replay.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    use async_trait::async_trait;
    use lattice_bus::{BusConfig, BusEvent};
    use lattice_facade::{CommsFacade, FacadeConfig, FacadeError};
    use serde_json::json;
    use shared_types::{
        AuthContext, CommsError, Handler, HandlerError, Message, MessagePriority, ModuleId,
        ModuleInfo, PermissionSet,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Fast bus config so retry and breaker paths finish within test budget.
    fn fast_config() -> FacadeConfig {
        FacadeConfig {
            bus: BusConfig {
                request_timeout: Duration::from_secs(2),
                handler_timeout: Duration::from_millis(200),
                retry_base: Duration::from_millis(10),
                retry_cap: Duration::from_millis(40),
                breaker_failure_threshold: 3,
                breaker_cooldown: Duration::from_millis(100),
                ..BusConfig::default()
            },
            ..FacadeConfig::default()
        }
    }

    fn anyone() -> AuthContext {
        AuthContext::for_module(ModuleId::new("caller"), PermissionSet::new())
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, message: Message) -> Result<serde_json::Value, HandlerError> {
            Ok(json!({ "echo": message.payload }))
        }
    }

    /// Handler that always fails with a retryable error.
    struct AlwaysFails {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn handle(&self, _message: Message) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Failed("persistent fault".to_string()))
        }
    }

    /// Handler that fails a fixed number of times, then recovers.
    struct FailsThenRecovers {
        remaining_failures: Arc<AtomicU32>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Handler for FailsThenRecovers {
        async fn handle(&self, _message: Message) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                Err(HandlerError::Failed("warming up".to_string()))
            } else {
                Ok(json!({ "ok": true }))
            }
        }
    }

    fn register(facade: &CommsFacade, id: &str, handler: Arc<dyn Handler>) {
        facade.register_module(ModuleInfo::new(ModuleId::new(id), id), handler);
    }

    // =============================================================================
    // DELIVERY AND RETRIES
    // =============================================================================

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let facade = CommsFacade::new(fast_config());
        register(&facade, "billing", Arc::new(Echo));

        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("billing"),
            "charge",
            json!({"amount": 12}),
        );
        let response = facade.send_request(&anyone(), message).await.unwrap();
        assert_eq!(response["echo"]["amount"], json!(12));

        let metrics = facade.metrics();
        assert_eq!(metrics.bus.sent, 1);
        assert_eq!(metrics.bus.delivered, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_recovered_by_retry() {
        let facade = CommsFacade::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        register(
            &facade,
            "flaky",
            Arc::new(FailsThenRecovers {
                remaining_failures: Arc::new(AtomicU32::new(2)),
                calls: calls.clone(),
            }),
        );

        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("flaky"),
            "work",
            json!({}),
        );
        let response = facade.send_request(&anyone(), message).await.unwrap();
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_a_hard_bound() {
        let facade = CommsFacade::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        register(&facade, "broken", Arc::new(AlwaysFails { calls: calls.clone() }));

        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("broken"),
            "work",
            json!({}),
        )
        .with_max_attempts(2);

        let err = facade.send_request(&anyone(), message).await.unwrap_err();
        assert!(matches!(
            err,
            FacadeError::Comms(CommsError::DeadLettered { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dead_letter_event_emitted_exactly_once() {
        let facade = CommsFacade::new(fast_config());
        register(
            &facade,
            "broken",
            Arc::new(AlwaysFails {
                calls: Arc::new(AtomicU32::new(0)),
            }),
        );

        let mut events = facade.bus_events();
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("broken"),
            "work",
            json!({}),
        )
        .with_max_attempts(2);
        let message_id = message.id;

        let _ = facade.send_request(&anyone(), message).await;

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timeout")
            .expect("event");
        match event {
            BusEvent::DeadLettered {
                message_id: dead_id,
                attempts,
                ..
            } => {
                assert_eq!(dead_id, message_id);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // No second dead-letter event for the same message.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_letter_replay_after_fault_fixed() {
        let facade = CommsFacade::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        // Fails long enough to dead-letter the first message, then recovers.
        register(
            &facade,
            "billing",
            Arc::new(FailsThenRecovers {
                remaining_failures: Arc::new(AtomicU32::new(2)),
                calls: calls.clone(),
            }),
        );

        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("billing"),
            "charge",
            json!({"invoice": 9}),
        )
        .with_max_attempts(2);
        let original_id = message.id;

        let _ = facade.send_request(&anyone(), message).await;

        let parked = facade.dead_letters();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].message_id, original_id);
        assert_eq!(parked[0].action, "charge");

        // Replay gets a fresh id and a fresh attempt budget.
        let new_id = facade.replay_dead_letter(original_id).expect("replayed");
        assert_ne!(new_id, original_id);

        // The replayed copy is fire-and-forget; wait for the handler to see it.
        timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replayed message was never delivered");

        // Original record stays parked for audit.
        assert_eq!(facade.dead_letters().len(), 1);
    }

    // =============================================================================
    // CIRCUIT BREAKER
    // =============================================================================

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let facade = CommsFacade::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        register(&facade, "broken", Arc::new(AlwaysFails { calls: calls.clone() }));

        // Burn through enough attempts to trip the threshold (3).
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("broken"),
            "work",
            json!({}),
        )
        .with_max_attempts(3);
        let _ = facade.send_request(&anyone(), message).await;

        let calls_when_open = calls.load(Ordering::SeqCst);
        assert!(facade
            .metrics()
            .bus
            .open_breakers
            .contains(&ModuleId::new("broken")));

        // Next request is rejected without invoking the handler.
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("broken"),
            "work",
            json!({}),
        );
        let err = facade.send_request(&anyone(), message).await.unwrap_err();
        assert!(matches!(
            err,
            FacadeError::Comms(CommsError::TargetUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), calls_when_open);
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_half_open_probe() {
        let facade = CommsFacade::new(fast_config());
        let remaining = Arc::new(AtomicU32::new(3));
        register(
            &facade,
            "recovering",
            Arc::new(FailsThenRecovers {
                remaining_failures: remaining,
                calls: Arc::new(AtomicU32::new(0)),
            }),
        );

        // Trip the breaker (threshold 3).
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("recovering"),
            "work",
            json!({}),
        )
        .with_max_attempts(3);
        let _ = facade.send_request(&anyone(), message).await;
        assert!(!facade.metrics().bus.open_breakers.is_empty());

        // After the cooldown the probe succeeds and the breaker closes.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("recovering"),
            "work",
            json!({}),
        );
        let response = facade.send_request(&anyone(), message).await.unwrap();
        assert_eq!(response, json!({ "ok": true }));
        assert!(facade.metrics().bus.open_breakers.is_empty());
    }

    // =============================================================================
    // AUTHORIZATION AND PRIORITIES
    // =============================================================================

    #[tokio::test]
    async fn test_authorization_fails_closed_before_queueing() {
        let facade = CommsFacade::new(fast_config());
        register(&facade, "billing", Arc::new(Echo));
        facade.policy().require_for_module(
            ModuleId::new("billing"),
            PermissionSet::from_names(["billing.invoke"]),
        );

        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("billing"),
            "charge",
            json!({}),
        );
        let err = facade.send_request(&anyone(), message).await.unwrap_err();
        match err {
            FacadeError::Comms(CommsError::AuthorizationDenied { missing, .. }) => {
                assert_eq!(missing, vec!["billing.invoke".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(facade.metrics().bus.sent, 0);

        // Granting the permission makes the same call succeed.
        let granted = AuthContext::for_module(
            ModuleId::new("caller"),
            PermissionSet::from_names(["billing.invoke"]),
        );
        let message = Message::request(
            ModuleId::new("caller"),
            ModuleId::new("billing"),
            "charge",
            json!({"amount": 1}),
        );
        assert!(facade.send_request(&granted, message).await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_delivery() {
        let facade = CommsFacade::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        register(
            &facade,
            "audit",
            Arc::new(FailsThenRecovers {
                remaining_failures: Arc::new(AtomicU32::new(0)),
                calls: calls.clone(),
            }),
        );

        let message = Message::point_to_point(
            ModuleId::new("caller"),
            ModuleId::new("audit"),
            "record",
            json!({"entry": 1}),
        )
        .with_priority(MessagePriority::High);
        facade.send_notification(&anyone(), message).unwrap();

        timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notification was never delivered");
    }
}
