//! # Discovery Integration
//!
//! Capability advertising, matching, ranking with live failure rates, and
//! contract negotiation followed by schema-validated sends.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use lattice_discovery::{
        Capability, CapabilityVersion, DiscoveryConfig, DiscoveryQuery, DiscoveryService,
        FailureRateSource, NegotiationOutcome,
    };
    use lattice_facade::{CommsFacade, FacadeConfig, FacadeError};
    use serde_json::json;
    use shared_types::{
        AuthContext, CommsError, Handler, HandlerError, Message, ModuleId, ModuleInfo,
        PermissionSet,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, message: Message) -> Result<serde_json::Value, HandlerError> {
            Ok(json!({ "echo": message.payload }))
        }
    }

    fn payment_capability(module: &str, version: CapabilityVersion) -> Capability {
        Capability::new("charge", ModuleId::new(module), "payment-processor", version)
            .with_tags(["cards", "refunds"])
            .with_input_schema(json!({"amount": "number", "currency": "string"}))
            .with_output_schema(json!({"receipt_id": "string"}))
    }

    /// Fixed failure rates per module for ranking tests.
    struct FixedRates(Vec<(ModuleId, f64)>);

    impl FailureRateSource for FixedRates {
        fn failure_rate(&self, module: &ModuleId) -> f64 {
            self.0
                .iter()
                .find(|(id, _)| id == module)
                .map_or(0.0, |(_, rate)| *rate)
        }
    }

    // =============================================================================
    // MATCHING AND RANKING
    // =============================================================================

    #[test]
    fn test_version_and_tag_matching() {
        let service = DiscoveryService::new();
        service.advertise(
            ModuleId::new("stripe-adapter"),
            payment_capability("stripe-adapter", CapabilityVersion::new(1, 2, 0)),
        );
        service.advertise(
            ModuleId::new("legacy-payments"),
            payment_capability("legacy-payments", CapabilityVersion::new(0, 9, 0)),
        );

        // Caret matching: ^1.0 admits 1.2.0 but not 0.9.0.
        let query = DiscoveryQuery::of_type("payment-processor")
            .with_min_version(CapabilityVersion::new(1, 0, 0))
            .with_tags(["cards"]);
        let matches = service.query(&query);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].module_id, ModuleId::new("stripe-adapter"));
    }

    #[test]
    fn test_ranking_prefers_reliable_provider() {
        let service = DiscoveryService::with_config(
            DiscoveryConfig::default(),
            Arc::new(FixedRates(vec![
                (ModuleId::new("unreliable"), 0.4),
                (ModuleId::new("reliable"), 0.01),
            ])),
        );

        // Same version; failure rate decides.
        service.advertise(
            ModuleId::new("unreliable"),
            payment_capability("unreliable", CapabilityVersion::new(1, 0, 0)),
        );
        service.advertise(
            ModuleId::new("reliable"),
            payment_capability("reliable", CapabilityVersion::new(1, 0, 0)),
        );

        let matches = service.query(&DiscoveryQuery::of_type("payment-processor"));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].module_id, ModuleId::new("reliable"));
    }

    #[test]
    fn test_higher_version_outranks_failure_rate() {
        let service = DiscoveryService::with_config(
            DiscoveryConfig::default(),
            Arc::new(FixedRates(vec![(ModuleId::new("v2"), 0.3)])),
        );

        service.advertise(
            ModuleId::new("v2"),
            payment_capability("v2", CapabilityVersion::new(2, 0, 0)),
        );
        service.advertise(
            ModuleId::new("v1"),
            payment_capability("v1", CapabilityVersion::new(1, 5, 0)),
        );

        // Version dominates; failure rate only breaks ties.
        let matches = service.query(&DiscoveryQuery::of_type("payment-processor"));
        assert_eq!(matches[0].module_id, ModuleId::new("v2"));
    }

    // =============================================================================
    // NEGOTIATION THROUGH THE FACADE
    // =============================================================================

    #[tokio::test]
    async fn test_negotiate_then_send_via_contract() {
        let facade = CommsFacade::new(FacadeConfig::default());
        facade.register_module(
            ModuleInfo::new(ModuleId::new("stripe-adapter"), "Stripe Adapter"),
            Arc::new(Echo),
        );
        facade.advertise_capability(
            ModuleId::new("stripe-adapter"),
            payment_capability("stripe-adapter", CapabilityVersion::new(1, 0, 0)),
        );

        let auth = AuthContext::for_module(ModuleId::new("orders"), PermissionSet::new());
        let query = DiscoveryQuery::of_type("payment-processor");

        let NegotiationOutcome::Agreed(contract) = facade.negotiate(&auth, &query) else {
            panic!("expected an agreed contract");
        };
        assert_eq!(contract.provider, ModuleId::new("stripe-adapter"));
        assert_eq!(contract.version, "1.0.0");

        // Payload violating the contract schema is rejected before queueing.
        let err = facade
            .send_via_contract(
                &auth,
                ModuleId::new("orders"),
                &contract,
                json!({"amount": "ten", "currency": "EUR"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FacadeError::Comms(CommsError::SchemaValidationFailure { .. })
        ));

        // A conforming payload goes through to the provider.
        let response = facade
            .send_via_contract(
                &auth,
                ModuleId::new("orders"),
                &contract,
                json!({"amount": 10, "currency": "EUR"}),
            )
            .await
            .unwrap();
        assert_eq!(response["echo"]["currency"], json!("EUR"));
    }

    #[tokio::test]
    async fn test_negotiation_respects_capability_permissions() {
        let facade = CommsFacade::new(FacadeConfig::default());
        facade.advertise_capability(
            ModuleId::new("vault"),
            payment_capability("vault", CapabilityVersion::new(1, 0, 0))
                .with_permissions(PermissionSet::from_names(["payments.execute"])),
        );

        let query = DiscoveryQuery::of_type("payment-processor");

        let unprivileged = AuthContext::for_module(ModuleId::new("orders"), PermissionSet::new());
        match facade.negotiate(&unprivileged, &query) {
            NegotiationOutcome::InsufficientPermissions { missing } => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].as_str(), "payments.execute");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let privileged = AuthContext::for_module(
            ModuleId::new("orders"),
            PermissionSet::from_names(["payments.execute"]),
        );
        assert!(matches!(
            facade.negotiate(&privileged, &query),
            NegotiationOutcome::Agreed(_)
        ));
    }

    #[tokio::test]
    async fn test_deregistration_cascades_to_discovery() {
        let facade = CommsFacade::new(FacadeConfig::default());
        facade.register_module(
            ModuleInfo::new(ModuleId::new("stripe-adapter"), "Stripe Adapter"),
            Arc::new(Echo),
        );
        facade.advertise_capability(
            ModuleId::new("stripe-adapter"),
            payment_capability("stripe-adapter", CapabilityVersion::new(1, 0, 0)),
        );

        let query = DiscoveryQuery::of_type("payment-processor");
        assert_eq!(facade.discover(&query).len(), 1);

        facade.deregister_module(&ModuleId::new("stripe-adapter"));

        // Stale cache entries must not resurrect the dead provider.
        assert!(facade.discover(&query).is_empty());
    }

    #[test]
    fn test_advertise_invalidates_cached_results() {
        let service = DiscoveryService::new();
        let query = DiscoveryQuery::of_type("payment-processor");

        // Prime the cache with an empty result.
        assert!(service.query(&query).is_empty());

        service.advertise(
            ModuleId::new("stripe-adapter"),
            payment_capability("stripe-adapter", CapabilityVersion::new(1, 0, 0)),
        );

        // The new capability is visible immediately, not after TTL expiry.
        assert_eq!(service.query(&query).len(), 1);
    }
}
