// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Webhook Reconciler
//!
//! Tests full deliveries against in-memory stores and a mock Stripe:
//! - Signature gate (WH-S01 to WH-S04)
//! - User resolution (WH-R01 to WH-R05)
//! - Subscription lifecycle (WH-L01 to WH-L07)
//! - Checkout
//! - Invoices (WH-I01 to WH-I05)
//! - Audit log and modes (WH-A01 to WH-A05)

#[cfg(test)]
mod harness {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use uuid::Uuid;

    use crate::config::ReconcilerConfig;
    use crate::error::BillingResult;
    use crate::signature::sign_payload;
    use crate::subscriptions::SubscriptionRecord;
    use crate::testing::{
        MemoryEventStore, MemorySubscriptionStore, MemoryUserDirectory, MockBillingProvider,
    };
    use crate::webhooks::{WebhookDependencies, WebhookHandler, WebhookOutcome};

    pub const SECRET: &str = "whsec_edge_case_secret";
    pub const U1: &str = "11111111-1111-4111-8111-111111111111";
    pub const U2: &str = "22222222-2222-4222-8222-222222222222";

    pub fn uid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    pub fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    pub struct Harness {
        pub handler: WebhookHandler,
        pub provider: Arc<MockBillingProvider>,
        pub subscriptions: Arc<MemorySubscriptionStore>,
        pub events: Arc<MemoryEventStore>,
        pub users: Arc<MemoryUserDirectory>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(ReconcilerConfig::default())
        }

        pub fn with_config(config: ReconcilerConfig) -> Self {
            let provider = Arc::new(MockBillingProvider::new());
            let subscriptions = Arc::new(MemorySubscriptionStore::new());
            let events = Arc::new(MemoryEventStore::new());
            let users = Arc::new(MemoryUserDirectory::new());

            let handler = WebhookHandler::new(
                SECRET,
                &config,
                WebhookDependencies {
                    provider: provider.clone(),
                    subscriptions: subscriptions.clone(),
                    events: events.clone(),
                    users: users.clone(),
                },
            );

            Self {
                handler,
                provider,
                subscriptions,
                events,
                users,
            }
        }

        /// Sign and deliver an event envelope
        pub async fn deliver(&self, event: &Value) -> BillingResult<WebhookOutcome> {
            let body = event.to_string();
            let sig = sign_payload(SECRET, now(), body.as_bytes());
            self.handler.handle_delivery(body.as_bytes(), Some(&sig)).await
        }

        pub fn record(&self, id: &str) -> SubscriptionRecord {
            self.subscriptions.get(id).unwrap()
        }
    }

    pub fn envelope(id: &str, event_type: &str, created: i64, object: Value) -> Value {
        json!({
            "id": id,
            "object": "event",
            "type": event_type,
            "created": created,
            "livemode": true,
            "data": { "object": object }
        })
    }

    pub fn subscription(id: &str, status: &str, metadata: Value) -> Value {
        json!({
            "id": id,
            "object": "subscription",
            "customer": "cus_1",
            "status": status,
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "cancel_at_period_end": false,
            "canceled_at": null,
            "ended_at": null,
            "start_date": 1_700_000_000,
            "metadata": metadata,
            "items": { "object": "list", "data": [{
                "id": "si_1",
                "price": {
                    "id": "price_pro",
                    "currency": "usd",
                    "unit_amount": 2900,
                    "recurring": { "interval": "month" }
                }
            }] }
        })
    }
}

#[cfg(test)]
mod signature_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::signature::sign_payload;
    use serde_json::json;

    // =========================================================================
    // WH-S01: Body signed with another secret - rejected, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_wrong_secret_is_rejected_without_side_effects() {
        let h = Harness::new();
        let body = envelope(
            "evt_1",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        )
        .to_string();
        let sig = sign_payload("whsec_attacker", now(), body.as_bytes());

        let err = h
            .handler
            .handle_delivery(body.as_bytes(), Some(&sig))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
        assert!(err.is_client_error());
        assert!(h.events.all().is_empty());
        assert!(h.subscriptions.is_empty());
    }

    // =========================================================================
    // WH-S02: Valid signature, body modified afterwards - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_body_is_rejected() {
        let h = Harness::new();
        let body = envelope(
            "evt_1",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        )
        .to_string();
        let sig = sign_payload(SECRET, now(), body.as_bytes());
        let tampered = body.replace(U1, U2);

        let err = h
            .handler
            .handle_delivery(tampered.as_bytes(), Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
        assert!(h.subscriptions.is_empty());
    }

    // =========================================================================
    // WH-S03: Signed timestamp outside the tolerance window - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_replayed_old_signature_is_rejected() {
        let h = Harness::new();
        let body = envelope("evt_1", "customer.updated", now(), json!({ "id": "cus_1" })).to_string();
        let sig = sign_payload(SECRET, now() - 3_600, body.as_bytes());

        let err = h
            .handler
            .handle_delivery(body.as_bytes(), Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid(_)));
    }

    // =========================================================================
    // WH-S04: Verified body that is not an event envelope - 400, no audit row
    // =========================================================================
    #[tokio::test]
    async fn test_verified_non_event_body_is_invalid_input() {
        let h = Harness::new();
        let body = br#"{"hello":"world"}"#;
        let sig = sign_payload(SECRET, now(), body);

        let err = h.handler.handle_delivery(body, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(h.events.all().is_empty());
    }
}

#[cfg(test)]
mod resolution_tests {
    use super::harness::*;
    use crate::config::{ReconcilerConfig, StaleEventPolicy};
    use crate::error::BillingError;
    use crate::objects::USER_ID_KEY;
    use serde_json::json;

    // =========================================================================
    // WH-R01: metadata.user_id and customer email disagree - metadata wins
    // =========================================================================
    #[tokio::test]
    async fn test_metadata_user_beats_email_match() {
        let h = Harness::new();
        h.provider.add_customer("cus_1", Some("a@b.com"));
        h.users.add(uid(U2), "a@b.com");

        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        assert_eq!(h.record("sub_1").user_id, uid(U1));
        assert_eq!(h.provider.customer_retrievals(), 0);
        assert!(h.provider.metadata_updates().is_empty());
    }

    // =========================================================================
    // WH-R02: Checkout with no user anywhere and an unknown email - 400, no record
    // =========================================================================
    #[tokio::test]
    async fn test_unresolvable_checkout_writes_no_record() {
        let h = Harness::new();
        h.provider.add_customer("cus_1", Some("stranger@b.com"));
        h.provider.add_subscription(
            serde_json::from_value(subscription("sub_9", "active", json!({}))).unwrap(),
        );

        let err = h
            .deliver(&envelope(
                "evt_cs",
                "checkout.session.completed",
                now(),
                json!({
                    "id": "cs_9",
                    "object": "checkout.session",
                    "mode": "subscription",
                    "customer": "cus_1",
                    "subscription": "sub_9",
                    "client_reference_id": null,
                    "metadata": {}
                }),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::UserNotResolved(_)));
        assert!(err.is_client_error());
        assert!(h.subscriptions.is_empty());

        assert_eq!(h.events.all().len(), 1);
        let outcomes = h.events.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].processing_result, "error");
    }

    // =========================================================================
    // WH-R03: Email-resolved subscription gets user_id written back to Stripe
    // =========================================================================
    #[tokio::test]
    async fn test_email_resolution_backfills_stripe_metadata() {
        let h = Harness::new();
        h.provider.add_customer("cus_1", Some("a@b.com"));
        h.users.add(uid(U1), "a@b.com");

        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({})),
        ))
        .await
        .unwrap();

        let updates = h.provider.metadata_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "sub_1");
        assert_eq!(updates[0].1.get(USER_ID_KEY), Some(U1));
    }

    // =========================================================================
    // WH-R04: Backfill failure does not fail the delivery
    // =========================================================================
    #[tokio::test]
    async fn test_backfill_failure_is_best_effort() {
        let h = Harness::new();
        h.provider.add_customer("cus_1", Some("a@b.com"));
        h.provider.fail_metadata_updates();
        h.users.add(uid(U1), "a@b.com");

        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({})),
        ))
        .await
        .unwrap();

        assert_eq!(h.record("sub_1").user_id, uid(U1));
    }

    // =========================================================================
    // WH-R05: Stale event skipped under Skip - no metadata written back
    // =========================================================================
    #[tokio::test]
    async fn test_skipped_stale_event_does_not_backfill() {
        let h = Harness::with_config(ReconcilerConfig {
            stale_event_policy: StaleEventPolicy::Skip,
            ..ReconcilerConfig::default()
        });
        h.provider.add_customer("cus_1", Some("a@b.com"));
        h.users.add(uid(U1), "a@b.com");
        let newer = now();

        h.deliver(&envelope(
            "evt_new",
            "customer.subscription.created",
            newer,
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let outcome = h
            .deliver(&envelope(
                "evt_old",
                "customer.subscription.created",
                newer - 600,
                subscription("sub_1", "incomplete", json!({})),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, crate::webhooks::WebhookOutcome::Ignored(_)));
        assert_eq!(h.provider.customer_retrievals(), 1);
        assert!(h.provider.metadata_updates().is_empty());
        assert_eq!(h.record("sub_1").status, "active");
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::harness::*;
    use crate::config::{ReconcilerConfig, StaleEventPolicy};
    use crate::error::BillingError;
    use crate::objects::PriceSnapshot;
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;

    // =========================================================================
    // WH-L01: Same event delivered twice - one record, same local id
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let h = Harness::new();
        let event = envelope(
            "evt_dup",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        );

        h.deliver(&event).await.unwrap();
        let first = h.record("sub_1");
        h.deliver(&event).await.unwrap();
        let second = h.record("sub_1");

        assert_eq!(h.subscriptions.len(), 1);
        assert_eq!(first, second);
        assert_eq!(h.events.all().len(), 1);
    }

    // =========================================================================
    // WH-L02: Deleted while incomplete_expired - stored as canceled
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_forces_canceled_status() {
        let h = Harness::new();
        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.created",
            now() - 60,
            subscription("sub_1", "incomplete", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let deleted_at = now();
        h.deliver(&envelope(
            "evt_2",
            "customer.subscription.deleted",
            deleted_at,
            subscription("sub_1", "incomplete_expired", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let record = h.record("sub_1");
        assert_eq!(record.status, "canceled");
        assert_eq!(record.canceled_at, Some(deleted_at));
        assert_eq!(h.subscriptions.len(), 1);
    }

    // =========================================================================
    // WH-L03: Deletion for a subscription never seen locally - created as canceled
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_without_record_creates_canceled_record() {
        let h = Harness::new();
        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.deleted",
            now(),
            subscription("sub_gone", "active", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let record = h.record("sub_gone");
        assert_eq!(record.status, "canceled");
        assert_eq!(record.user_id, uid(U1));
    }

    // =========================================================================
    // WH-L04: Update patches the record and keeps the resolved user
    // =========================================================================
    #[tokio::test]
    async fn test_update_patches_existing_record() {
        let h = Harness::new();
        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.created",
            now() - 60,
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();
        let created = h.record("sub_1");

        let mut updated = subscription("sub_1", "active", json!({ "user_id": U2, "seats": "5" }));
        updated["cancel_at_period_end"] = json!(true);
        h.deliver(&envelope("evt_2", "customer.subscription.updated", now(), updated))
            .await
            .unwrap();

        let record = h.record("sub_1");
        assert_eq!(record.id, created.id);
        assert!(record.cancel_at_period_end);
        assert_eq!(record.user_id, uid(U1));
        assert_eq!(record.metadata.get("user_id"), Some(U1));
        assert_eq!(record.metadata.get("seats"), Some("5"));
    }

    // =========================================================================
    // WH-L05: Update without a record falls back to a full sync
    // =========================================================================
    #[tokio::test]
    async fn test_update_without_record_runs_full_sync() {
        let h = Harness::new();
        h.deliver(&envelope(
            "evt_1",
            "customer.subscription.updated",
            now(),
            subscription("sub_new", "trialing", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let record = h.record("sub_new");
        assert_eq!(record.status, "trialing");
        assert_eq!(record.amount, 2900);
        assert_eq!(record.billing_interval, "month");
    }

    // =========================================================================
    // WH-L06: Out-of-order delivery - applied by default, skipped under Skip
    // =========================================================================
    #[tokio::test]
    async fn test_stale_event_policy() {
        for (policy, expected_status) in [
            (StaleEventPolicy::Apply, "past_due"),
            (StaleEventPolicy::Skip, "active"),
        ] {
            let h = Harness::with_config(ReconcilerConfig {
                stale_event_policy: policy,
                ..ReconcilerConfig::default()
            });
            let newer = now();

            h.deliver(&envelope(
                "evt_new",
                "customer.subscription.updated",
                newer,
                subscription("sub_1", "active", json!({ "user_id": U1 })),
            ))
            .await
            .unwrap();

            let outcome = h
                .deliver(&envelope(
                    "evt_old",
                    "customer.subscription.updated",
                    newer - 120,
                    subscription("sub_1", "past_due", json!({ "user_id": U1 })),
                ))
                .await
                .unwrap();

            let record = h.record("sub_1");
            assert_eq!(record.status, expected_status, "policy {:?}", policy);
            assert_eq!(record.last_event_at, Some(newer));
            if policy == StaleEventPolicy::Skip {
                assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
            }
        }
    }

    // =========================================================================
    // WH-L07: Incomplete embedded price - looked up; lookup failure is a 500
    // =========================================================================
    #[tokio::test]
    async fn test_incomplete_price_is_retrieved() {
        let h = Harness::new();
        h.provider.add_price(PriceSnapshot {
            id: "price_pro".into(),
            currency: Some("eur".into()),
            unit_amount: Some(1900),
            recurring: Some(crate::objects::Recurring {
                interval: "year".into(),
            }),
        });

        let mut sub = subscription("sub_1", "active", json!({ "user_id": U1 }));
        sub["items"]["data"][0]["price"] = json!({ "id": "price_pro" });
        h.deliver(&envelope("evt_1", "customer.subscription.created", now(), sub.clone()))
            .await
            .unwrap();

        let record = h.record("sub_1");
        assert_eq!(record.currency, "eur");
        assert_eq!(record.amount, 1900);
        assert_eq!(h.provider.price_retrievals(), 1);

        let failing = Harness::new();
        failing.provider.fail_price_lookups();
        let err = failing
            .deliver(&envelope("evt_2", "customer.subscription.created", now(), sub))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(!err.is_client_error());
        assert!(failing.subscriptions.is_empty());
    }
}

#[cfg(test)]
mod checkout_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;

    fn session(subscription: Option<&str>) -> serde_json::Value {
        json!({
            "id": "cs_1",
            "object": "checkout.session",
            "mode": if subscription.is_some() { "subscription" } else { "payment" },
            "customer": "cus_1",
            "subscription": subscription,
            "client_reference_id": null,
            "metadata": {}
        })
    }

    // =========================================================================
    // Checkout end to end: subscription and customer retrieved, record created for u1
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_completed_end_to_end() {
        let h = Harness::new();
        h.provider.add_subscription(
            serde_json::from_value(subscription("sub_123", "active", json!({}))).unwrap(),
        );
        h.provider.add_customer("cus_1", Some("a@b.com"));
        h.users.add(uid(U1), "a@b.com");

        let outcome = h
            .deliver(&envelope(
                "evt_checkout",
                "checkout.session.completed",
                now(),
                session(Some("sub_123")),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Processed(_)));
        assert_eq!(h.provider.subscription_retrievals(), vec!["sub_123".to_string()]);
        assert_eq!(h.provider.customer_retrievals(), 1);

        let record = h.record("sub_123");
        assert_eq!(record.user_id, uid(U1));
        assert_eq!(record.billing_subscription_id, "sub_123");
        assert_eq!(record.status, "active");
        assert_eq!(record.customer_id.as_deref(), Some("cus_1"));

        let rows = h.events.all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "checkout");
        assert_eq!(h.events.outcomes()[0].processing_result, "success");
    }

    #[tokio::test]
    async fn test_one_time_checkout_is_ignored() {
        let h = Harness::new();
        let outcome = h
            .deliver(&envelope("evt_pay", "checkout.session.completed", now(), session(None)))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert!(h.provider.subscription_retrievals().is_empty());
        assert!(h.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_client_reference_resolves_checkout() {
        let h = Harness::new();
        h.provider.add_subscription(
            serde_json::from_value(subscription("sub_123", "active", json!({}))).unwrap(),
        );
        let mut body = session(Some("sub_123"));
        body["client_reference_id"] = json!(U2);

        h.deliver(&envelope("evt_checkout", "checkout.session.completed", now(), body))
            .await
            .unwrap();

        assert_eq!(h.record("sub_123").user_id, uid(U2));
        assert_eq!(h.provider.customer_retrievals(), 0);
    }

    #[tokio::test]
    async fn test_subscription_retrieve_failure_is_retryable() {
        let h = Harness::new();
        h.provider.fail_subscription_lookups();

        let err = h
            .deliver(&envelope(
                "evt_checkout",
                "checkout.session.completed",
                now(),
                session(Some("sub_123")),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(!err.is_client_error());
    }
}

#[cfg(test)]
mod invoice_tests {
    use super::harness::*;
    use crate::config::{ReconcilerConfig, StaleEventPolicy};
    use crate::webhooks::{WebhookOutcome, PAYMENT_FAILED, PAYMENT_SUCCEEDED};
    use serde_json::json;

    fn invoice(subscription: &str) -> serde_json::Value {
        json!({
            "id": "in_1",
            "object": "invoice",
            "customer": "cus_1",
            "subscription": subscription,
            "amount_due": 2900,
            "amount_paid": 0,
            "currency": "usd",
            "attempt_count": 2
        })
    }

    async fn seeded() -> Harness {
        let h = Harness::new();
        h.deliver(&envelope(
            "evt_seed",
            "customer.subscription.created",
            now() - 60,
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();
        h
    }

    // =========================================================================
    // WH-I01: Payment failed - past_due plus a payment.failed audit row
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failed_marks_past_due_and_logs() {
        let h = seeded().await;

        h.deliver(&envelope("evt_inv", "invoice.payment_failed", now(), invoice("sub_1")))
            .await
            .unwrap();

        assert_eq!(h.record("sub_1").status, "past_due");

        let rows = h.events.of_type(PAYMENT_FAILED);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "payment");
        assert_eq!(rows[0].user_id, Some(uid(U1)));
        assert_eq!(rows[0].payload["status"], "failed");
        assert_eq!(rows[0].payload["amount"], 2900);
        assert_eq!(rows[0].payload["attempt_count"], 2);
        assert_eq!(rows[0].payload["subscription_id"], "sub_1");
    }

    // =========================================================================
    // WH-I02: Payment succeeded - audit row only, status untouched
    // =========================================================================
    #[tokio::test]
    async fn test_payment_succeeded_logs_without_state_change() {
        let h = seeded().await;
        let mut paid = invoice("sub_1");
        paid["amount_paid"] = json!(2900);

        h.deliver(&envelope("evt_inv", "invoice.payment_succeeded", now(), paid))
            .await
            .unwrap();

        assert_eq!(h.record("sub_1").status, "active");
        let rows = h.events.of_type(PAYMENT_SUCCEEDED);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["status"], "succeeded");
        assert_eq!(rows[0].payload["amount"], 2900);
    }

    // =========================================================================
    // WH-I03: Invoice for an unknown subscription - 200, no record created
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_for_unknown_subscription_is_acknowledged() {
        let h = Harness::new();

        let outcome = h
            .deliver(&envelope("evt_inv", "invoice.payment_failed", now(), invoice("sub_unknown")))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert!(h.subscriptions.is_empty());
        assert_eq!(h.events.of_type(PAYMENT_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn test_invoice_subscription_from_parent_details() {
        let h = seeded().await;
        let body = json!({
            "id": "in_2",
            "object": "invoice",
            "customer": "cus_1",
            "parent": { "subscription_details": { "subscription": "sub_1" } },
            "amount_due": 2900,
            "currency": "usd",
            "attempt_count": 1
        });

        h.deliver(&envelope("evt_inv", "invoice.payment_failed", now(), body))
            .await
            .unwrap();

        assert_eq!(h.record("sub_1").status, "past_due");
    }

    // =========================================================================
    // WH-I04: Payment failed after deletion - record stays canceled
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failed_does_not_revive_canceled_record() {
        let h = seeded().await;
        h.deliver(&envelope(
            "evt_del",
            "customer.subscription.deleted",
            now() - 30,
            subscription("sub_1", "canceled", json!({ "user_id": U1 })),
        ))
        .await
        .unwrap();

        let outcome = h
            .deliver(&envelope("evt_inv", "invoice.payment_failed", now(), invoice("sub_1")))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert_eq!(h.record("sub_1").status, "canceled");

        let rows = h.events.of_type(PAYMENT_FAILED);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, Some(uid(U1)));
    }

    // =========================================================================
    // WH-I05: Out-of-order payment failure - applied by default, skipped under Skip
    // =========================================================================
    #[tokio::test]
    async fn test_stale_payment_failure_follows_policy() {
        for (policy, expected_status) in [
            (StaleEventPolicy::Apply, "past_due"),
            (StaleEventPolicy::Skip, "active"),
        ] {
            let h = Harness::with_config(ReconcilerConfig {
                stale_event_policy: policy,
                ..ReconcilerConfig::default()
            });
            let newer = now();

            h.deliver(&envelope(
                "evt_upd",
                "customer.subscription.updated",
                newer,
                subscription("sub_1", "active", json!({ "user_id": U1 })),
            ))
            .await
            .unwrap();

            let outcome = h
                .deliver(&envelope(
                    "evt_inv",
                    "invoice.payment_failed",
                    newer - 600,
                    invoice("sub_1"),
                ))
                .await
                .unwrap();

            let record = h.record("sub_1");
            assert_eq!(record.status, expected_status, "policy {:?}", policy);
            assert_eq!(record.last_event_at, Some(newer));
            assert_eq!(h.events.of_type(PAYMENT_FAILED).len(), 1);
            if policy == StaleEventPolicy::Skip {
                assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
            }
        }
    }
}

#[cfg(test)]
mod audit_tests {
    use super::harness::*;
    use crate::config::{BillingMode, ReconcilerConfig};
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;

    // =========================================================================
    // WH-A01: Unhandled type - 200, audit row, no state change
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_is_acknowledged_and_logged() {
        let h = Harness::new();
        let outcome = h
            .deliver(&envelope(
                "evt_cu",
                "customer.updated",
                now(),
                json!({ "id": "cus_1", "object": "customer", "email": "a@b.com" }),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert!(h.subscriptions.is_empty());

        let rows = h.events.all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "customer.updated");
        assert_eq!(rows[0].category, "customer");
        assert_eq!(rows[0].provider_event_id, "evt_cu");
        assert_eq!(rows[0].payload["email"], "a@b.com");
        assert_eq!(h.events.outcomes()[0].processing_result, "ignored");
    }

    // =========================================================================
    // WH-A02: Audit table down - subscription state still applied
    // =========================================================================
    #[tokio::test]
    async fn test_logging_failure_does_not_block_state() {
        let h = Harness::new();
        h.events.set_failing(true);

        let outcome = h
            .deliver(&envelope(
                "evt_1",
                "customer.subscription.created",
                now(),
                subscription("sub_1", "active", json!({ "user_id": U1 })),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Processed(_)));
        assert_eq!(h.record("sub_1").status, "active");
    }

    // =========================================================================
    // WH-A03: Test-mode event on a live deployment - logged, acknowledged, not applied
    // =========================================================================
    #[tokio::test]
    async fn test_mode_mismatch_is_not_applied() {
        let h = Harness::new();
        let mut event = envelope(
            "evt_test",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        );
        event["livemode"] = json!(false);

        let outcome = h.deliver(&event).await.unwrap();

        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert!(h.subscriptions.is_empty());
        let rows = h.events.all();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].livemode);
    }

    // =========================================================================
    // WH-A04: Test deployment applies test-mode events
    // =========================================================================
    #[tokio::test]
    async fn test_test_mode_deployment_applies_test_events() {
        let h = Harness::with_config(ReconcilerConfig {
            mode: BillingMode::Test,
            ..ReconcilerConfig::default()
        });
        let mut event = envelope(
            "evt_test",
            "customer.subscription.created",
            now(),
            subscription("sub_1", "active", json!({ "user_id": U1 })),
        );
        event["livemode"] = json!(false);

        h.deliver(&event).await.unwrap();
        assert_eq!(h.record("sub_1").user_id, uid(U1));
    }

    // =========================================================================
    // WH-A05: Persistence failure - 500 and the audit row records the error
    // =========================================================================
    #[tokio::test]
    async fn test_persistence_failure_recorded_in_audit_row() {
        let h = Harness::new();
        h.subscriptions.fail_writes();

        let err = h
            .deliver(&envelope(
                "evt_1",
                "customer.subscription.created",
                now(),
                subscription("sub_1", "active", json!({ "user_id": U1 })),
            ))
            .await
            .unwrap_err();
        assert!(!err.is_client_error());

        let failed = h.handler.event_logger().failed_deliveries(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].provider_event_id, "evt_1");
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Database error"));
    }
}
