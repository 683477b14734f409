//! Billing provider integration.
//!
//! [`BillingEventProcessor`] is the only path from provider webhooks to the
//! entitlement store: it verifies the delivery signature over the raw body,
//! parses and classifies the event, and applies one idempotent store
//! transition. [`BillingProvider`] is the outbound client used for the
//! authoritative subscription fetch during activation and for creating
//! checkout and portal sessions.

use std::sync::Arc;

use agentlearn_entitlements::events::{self, BillingEventKind, ProviderStatus};
use agentlearn_entitlements::{BillingEventEnvelope, SignatureError, verify_signature};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::entitlement_store::{ActivationResult, EntitlementStore, EntitlementStoreError};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("{message}")]
    NotConfigured { message: String },
    #[error("webhook payload could not be parsed: {message}")]
    MalformedPayload { message: String },
    #[error("entitlement store failure: {0}")]
    Store(#[from] EntitlementStoreError),
    #[error("{message}")]
    Provider { message: String },
}

impl BillingError {
    /// Whether the provider should redeliver. Signature and payload failures
    /// will never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidSignature(_) | Self::MalformedPayload { .. } => false,
            Self::NotConfigured { .. } | Self::Store(_) | Self::Provider { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnhandledEventType,
    NotSubscriptionCheckout,
    MissingCorrelationIdentity,
    MissingSubscriptionReference,
    UnresolvedSubscriptionReference,
    UnknownUser,
    CancelledSubscription,
    PaymentFailedNotice,
}

impl IgnoreReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnhandledEventType => "unhandled_event_type",
            Self::NotSubscriptionCheckout => "not_subscription_checkout",
            Self::MissingCorrelationIdentity => "missing_correlation_identity",
            Self::MissingSubscriptionReference => "missing_subscription_reference",
            Self::UnresolvedSubscriptionReference => "unresolved_subscription_reference",
            Self::UnknownUser => "unknown_user",
            Self::CancelledSubscription => "cancelled_subscription",
            Self::PaymentFailedNotice => "payment_failed_notice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        user_id: String,
        subscription_ref: String,
    },
    Ignored {
        reason: IgnoreReason,
        subscription_ref: Option<String>,
    },
}

impl WebhookOutcome {
    fn ignored(reason: IgnoreReason, subscription_ref: Option<String>) -> Self {
        Self::Ignored {
            reason,
            subscription_ref,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Ignored { reason, .. } => reason.as_str(),
        }
    }
}

/// A verified, classified delivery together with what it did.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub kind: BillingEventKind,
    pub outcome: WebhookOutcome,
}

#[derive(Debug, Clone)]
pub struct CustomerRequest {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub customer_ref: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Authoritative subscription object, as the provider returns it.
    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Value, BillingError>;

    /// Returns the new customer reference.
    async fn create_customer(&self, request: CustomerRequest) -> Result<String, BillingError>;

    /// Returns the hosted checkout URL.
    async fn create_checkout_session(&self, request: CheckoutRequest)
    -> Result<String, BillingError>;

    /// Returns the hosted billing portal URL.
    async fn create_portal_session(
        &self,
        customer_ref: &str,
        return_url: &str,
    ) -> Result<String, BillingError>;

    fn name(&self) -> &'static str;
}

pub fn provider_from_config(config: &Config) -> Arc<dyn BillingProvider> {
    match (&config.stripe_secret_key, &config.stripe_price_id) {
        (Some(secret_key), Some(price_id)) => Arc::new(StripeBillingProvider::new(
            secret_key.clone(),
            price_id.clone(),
            config.stripe_api_base_url.clone(),
        )),
        _ => Arc::new(UnavailableBillingProvider {
            message: "Billing is not configured. Set STRIPE_SECRET_KEY and STRIPE_PRICE_ID."
                .to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct StripeBillingProvider {
    secret_key: String,
    price_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl StripeBillingProvider {
    pub fn new(secret_key: String, price_id: String, base_url: String) -> Self {
        Self {
            secret_key,
            price_id,
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, BillingError> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|error| BillingError::Provider {
                message: format!("Unable to contact Stripe: {error}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Provider {
                message: format!("Stripe request failed ({status}): {body}"),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|error| BillingError::Provider {
                message: format!("Invalid Stripe response payload: {error}"),
            })
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<Value, BillingError> {
        self.send(self.http.post(self.url(path)).form(form)).await
    }
}

fn required_string(payload: &Value, field: &str) -> Result<String, BillingError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| BillingError::Provider {
            message: format!("Stripe response is missing '{field}'"),
        })
}

fn form_field(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

#[async_trait]
impl BillingProvider for StripeBillingProvider {
    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Value, BillingError> {
        let path = format!("v1/subscriptions/{}", subscription_ref.trim());
        self.send(self.http.get(self.url(&path))).await
    }

    async fn create_customer(&self, request: CustomerRequest) -> Result<String, BillingError> {
        let mut form = vec![
            form_field("email", request.email),
            form_field("metadata[userId]", request.user_id),
        ];
        if let Some(name) = request.name {
            form.push(form_field("name", name));
        }
        let customer = self.post_form("v1/customers", &form).await?;
        required_string(&customer, "id")
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<String, BillingError> {
        let form = vec![
            form_field("customer", request.customer_ref),
            form_field("mode", "subscription"),
            form_field("payment_method_types[0]", "card"),
            form_field("line_items[0][price]", self.price_id.clone()),
            form_field("line_items[0][quantity]", "1"),
            form_field("success_url", request.success_url),
            form_field("cancel_url", request.cancel_url),
            form_field("metadata[userId]", request.user_id.clone()),
            form_field("subscription_data[metadata][userId]", request.user_id),
            form_field("allow_promotion_codes", "true"),
        ];
        let session = self.post_form("v1/checkout/sessions", &form).await?;
        required_string(&session, "url")
    }

    async fn create_portal_session(
        &self,
        customer_ref: &str,
        return_url: &str,
    ) -> Result<String, BillingError> {
        let form = vec![
            form_field("customer", customer_ref),
            form_field("return_url", return_url),
        ];
        let session = self.post_form("v1/billing_portal/sessions", &form).await?;
        required_string(&session, "url")
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

#[derive(Debug, Clone)]
pub struct UnavailableBillingProvider {
    message: String,
}

#[async_trait]
impl BillingProvider for UnavailableBillingProvider {
    async fn retrieve_subscription(&self, _subscription_ref: &str) -> Result<Value, BillingError> {
        Err(BillingError::NotConfigured {
            message: self.message.clone(),
        })
    }

    async fn create_customer(&self, _request: CustomerRequest) -> Result<String, BillingError> {
        Err(BillingError::NotConfigured {
            message: self.message.clone(),
        })
    }

    async fn create_checkout_session(
        &self,
        _request: CheckoutRequest,
    ) -> Result<String, BillingError> {
        Err(BillingError::NotConfigured {
            message: self.message.clone(),
        })
    }

    async fn create_portal_session(
        &self,
        _customer_ref: &str,
        _return_url: &str,
    ) -> Result<String, BillingError> {
        Err(BillingError::NotConfigured {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[derive(Clone)]
pub struct BillingEventProcessor {
    store: EntitlementStore,
    provider: Arc<dyn BillingProvider>,
    webhook_secret: Option<String>,
    tolerance_seconds: u64,
}

impl BillingEventProcessor {
    pub fn new(
        store: EntitlementStore,
        provider: Arc<dyn BillingProvider>,
        webhook_secret: Option<String>,
        tolerance_seconds: u64,
    ) -> Self {
        Self {
            store,
            provider,
            webhook_secret: webhook_secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            tolerance_seconds,
        }
    }

    pub fn from_config(
        config: &Config,
        store: EntitlementStore,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self::new(
            store,
            provider,
            config.stripe_webhook_secret.clone(),
            config.webhook_tolerance_seconds,
        )
    }

    pub fn provider(&self) -> &Arc<dyn BillingProvider> {
        &self.provider
    }

    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ProcessedEvent, BillingError> {
        self.handle_at(raw_body, signature_header, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent, BillingError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::NotConfigured {
                message: "Billing webhook secret is not configured.".to_string(),
            })?;

        // Nothing below this line runs for an unverified body.
        verify_signature(
            raw_body,
            signature_header,
            secret,
            now.timestamp(),
            self.tolerance_seconds,
        )?;

        let envelope: BillingEventEnvelope =
            serde_json::from_slice(raw_body).map_err(|error| BillingError::MalformedPayload {
                message: error.to_string(),
            })?;

        let kind = envelope.kind();
        let object = envelope.object();
        let outcome = match kind {
            BillingEventKind::CheckoutCompleted => self.checkout_completed(object, now).await?,
            BillingEventKind::InvoicePaid => self.invoice_paid(object, now).await?,
            BillingEventKind::InvoicePaymentFailed => WebhookOutcome::ignored(
                IgnoreReason::PaymentFailedNotice,
                events::subscription_ref(object),
            ),
            BillingEventKind::SubscriptionUpdated => self.subscription_updated(object, now).await?,
            BillingEventKind::SubscriptionDeleted => self.subscription_deleted(object).await?,
            BillingEventKind::Unhandled => {
                WebhookOutcome::ignored(IgnoreReason::UnhandledEventType, None)
            }
        };

        Ok(ProcessedEvent {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            kind,
            outcome,
        })
    }

    async fn checkout_completed(
        &self,
        session: &Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        if !events::checkout_is_subscription_mode(session) {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::NotSubscriptionCheckout,
                None,
            ));
        }
        let Some(subscription_ref) = events::subscription_ref(session) else {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::MissingSubscriptionReference,
                None,
            ));
        };
        let Some(user_id) = events::metadata_user_id(session) else {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::MissingCorrelationIdentity,
                Some(subscription_ref),
            ));
        };

        // Single round trip; a failure here is returned so the provider
        // redelivers the event.
        let subscription = self.provider.retrieve_subscription(&subscription_ref).await?;
        let subscription_ref = events::object_id(&subscription).unwrap_or(subscription_ref);
        let price_ref = events::subscription_price_ref(&subscription);
        let expires_at = events::subscription_period_end(&subscription, now);

        match self
            .store
            .apply_activation(&user_id, &subscription_ref, price_ref.as_deref(), expires_at)
            .await
        {
            Ok(ActivationResult::Activated(user)) => Ok(WebhookOutcome::Applied {
                user_id: user.id,
                subscription_ref,
            }),
            Ok(ActivationResult::SubscriptionCancelled) => Ok(WebhookOutcome::ignored(
                IgnoreReason::CancelledSubscription,
                Some(subscription_ref),
            )),
            Err(EntitlementStoreError::NotFound) => Ok(WebhookOutcome::ignored(
                IgnoreReason::UnknownUser,
                Some(subscription_ref),
            )),
            Err(error) => Err(error.into()),
        }
    }

    /// Renewal takes its expiry from the paid invoice line's service period,
    /// which is the period the payment covers, so no subscription fetch is
    /// made. The subscription-level then item-level precedence applies to
    /// subscription objects only (activation and status sync).
    async fn invoice_paid(
        &self,
        invoice: &Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(subscription_ref) = events::subscription_ref(invoice) else {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::MissingSubscriptionReference,
                None,
            ));
        };
        let expires_at = events::invoice_period_end(invoice, now);
        let renewed = self.store.apply_renewal(&subscription_ref, expires_at).await?;
        Ok(applied_or_unresolved(renewed.map(|user| user.id), subscription_ref))
    }

    async fn subscription_updated(
        &self,
        subscription: &Value,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(subscription_ref) = events::object_id(subscription) else {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::MissingSubscriptionReference,
                None,
            ));
        };
        let status = ProviderStatus::from_status(events::status(subscription));
        let expires_at = events::subscription_period_end(subscription, now);
        let synced = self
            .store
            .apply_status_sync(&subscription_ref, status.is_active(), expires_at)
            .await?;
        Ok(applied_or_unresolved(synced.map(|user| user.id), subscription_ref))
    }

    async fn subscription_deleted(
        &self,
        subscription: &Value,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(subscription_ref) = events::object_id(subscription) else {
            return Ok(WebhookOutcome::ignored(
                IgnoreReason::MissingSubscriptionReference,
                None,
            ));
        };
        let cancelled = self.store.apply_cancellation(&subscription_ref).await?;
        Ok(applied_or_unresolved(
            cancelled.map(|user| user.id),
            subscription_ref,
        ))
    }
}

fn applied_or_unresolved(user_id: Option<String>, subscription_ref: String) -> WebhookOutcome {
    match user_id {
        Some(user_id) => WebhookOutcome::Applied {
            user_id,
            subscription_ref,
        },
        None => WebhookOutcome::ignored(
            IgnoreReason::UnresolvedSubscriptionReference,
            Some(subscription_ref),
        ),
    }
}


#[cfg(test)]
mod tests {
    use agentlearn_entitlements::{SubscriptionTier, UserRole, sign_payload};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::testing::FakeBillingProvider;
    use super::*;
    use crate::entitlement_store::EnsureUserInput;

    const SECRET: &str = "whsec_processor_test";
    const PERIOD_END: i64 = 1_800_000_000;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_771_000_000, 0).single().expect("valid now")
    }

    fn subscription(id: &str, status: &str, period_end: i64) -> Value {
        json!({
            "id": id,
            "object": "subscription",
            "status": status,
            "items": {"data": [{"price": {"id": "price_pro"}, "current_period_end": period_end}]}
        })
    }

    async fn processor_with(provider: FakeBillingProvider) -> (BillingEventProcessor, EntitlementStore) {
        let store = EntitlementStore::open(None);
        store
            .ensure_user(EnsureUserInput {
                user_id: "U1".to_string(),
                email: "u1@agentlearn.test".to_string(),
                name: None,
                role: UserRole::Standard,
            })
            .await
            .expect("seed user");
        let processor =
            BillingEventProcessor::new(store.clone(), Arc::new(provider), Some(SECRET.to_string()), 300);
        (processor, store)
    }

    fn signed(event: &Value) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(event).expect("encode event");
        let header = sign_payload(&body, SECRET, now().timestamp()).expect("sign event");
        (body, header)
    }

    async fn deliver(processor: &BillingEventProcessor, event: Value) -> Result<ProcessedEvent, BillingError> {
        let (body, header) = signed(&event);
        processor.handle_at(&body, Some(&header), now()).await
    }

    fn checkout_event(user_id: Option<&str>, subscription_ref: &str) -> Value {
        let metadata = user_id.map_or_else(|| json!({}), |user_id| json!({"userId": user_id}));
        json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "mode": "subscription",
                "subscription": subscription_ref,
                "metadata": metadata
            }}
        })
    }

    #[tokio::test]
    async fn checkout_activates_from_fetched_subscription() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;

        let processed = deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("handle checkout");
        assert_eq!(
            processed.outcome,
            WebhookOutcome::Applied {
                user_id: "U1".to_string(),
                subscription_ref: "sub_1".to_string(),
            }
        );

        let user = store.user("U1").await.expect("user");
        assert_eq!(user.tier, SubscriptionTier::Pro);
        assert_eq!(user.price_ref.as_deref(), Some("price_pro"));
        assert_eq!(user.expires_at.map(|at| at.timestamp()), Some(PERIOD_END));
    }

    #[tokio::test]
    async fn checkout_without_correlation_or_for_unknown_user_is_ignored() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;

        let missing = deliver(&processor, checkout_event(None, "sub_1")).await.expect("handle");
        assert_eq!(missing.outcome.label(), "missing_correlation_identity");

        let unknown = deliver(&processor, checkout_event(Some("U404"), "sub_1"))
            .await
            .expect("handle");
        assert_eq!(unknown.outcome.label(), "unknown_user");

        let payment_mode = json!({
            "type": "checkout.session.completed",
            "data": {"object": {"mode": "payment", "metadata": {"userId": "U1"}}}
        });
        let payment = deliver(&processor, payment_mode).await.expect("handle");
        assert_eq!(payment.outcome.label(), "not_subscription_checkout");

        assert_eq!(store.get("U1").await.expect("get").tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn provider_fetch_failure_is_retryable() {
        let provider = FakeBillingProvider {
            fail_retrieval: true,
            ..FakeBillingProvider::default()
        };
        let (processor, store) = processor_with(provider).await;

        let error = deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect_err("fetch failure should surface");
        assert!(matches!(error, BillingError::Provider { .. }));
        assert!(error.is_retryable());
        assert_eq!(store.get("U1").await.expect("get").tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn invalid_signature_and_malformed_payload_never_mutate() {
        let (processor, store) = processor_with(FakeBillingProvider::default()).await;
        let event = json!({
            "type": "customer.subscription.deleted",
            "data": {"object": {"id": "sub_1"}}
        });
        let (body, _) = signed(&event);
        let forged = sign_payload(&body, "whsec_wrong", now().timestamp()).expect("sign");

        let error = processor
            .handle_at(&body, Some(&forged), now())
            .await
            .expect_err("bad signature");
        assert!(matches!(error, BillingError::InvalidSignature(SignatureError::Mismatch)));
        assert!(!error.is_retryable());

        let garbage = b"not json at all";
        let header = sign_payload(garbage, SECRET, now().timestamp()).expect("sign");
        let error = processor
            .handle_at(garbage, Some(&header), now())
            .await
            .expect_err("malformed payload");
        assert!(matches!(error, BillingError::MalformedPayload { .. }));

        assert!(processor.handle_at(&body, None, now()).await.is_err());
        assert_eq!(store.get("U1").await.expect("get").tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn missing_webhook_secret_is_not_configured() {
        let store = EntitlementStore::open(None);
        let processor = BillingEventProcessor::new(
            store,
            Arc::new(FakeBillingProvider::default()),
            None,
            300,
        );
        let error = processor
            .handle_at(b"{}", Some("t=1,v1=00"), now())
            .await
            .expect_err("no secret");
        assert!(matches!(error, BillingError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn invoice_paid_renews_with_line_period_and_parent_reference() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;
        deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("activate");

        let renewed_end = PERIOD_END + 31_536_000;
        let invoice = json!({
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_1",
                "parent": {"subscription_details": {"subscription": "sub_1"}},
                "lines": {"data": [{"period": {"start": PERIOD_END, "end": renewed_end}}]}
            }}
        });
        let processed = deliver(&processor, invoice).await.expect("renew");
        assert_eq!(processed.outcome.label(), "applied");
        let user = store.user("U1").await.expect("user");
        assert_eq!(user.expires_at.map(|at| at.timestamp()), Some(renewed_end));

        let orphan = json!({
            "type": "invoice.paid",
            "data": {"object": {"subscription": "sub_elsewhere"}}
        });
        let processed = deliver(&processor, orphan).await.expect("orphan");
        assert_eq!(processed.outcome.label(), "unresolved_subscription_reference");
    }

    #[tokio::test]
    async fn invoice_paid_renews_without_fetching_the_subscription() {
        let provider = FakeBillingProvider {
            fail_retrieval: true,
            ..FakeBillingProvider::default()
        };
        let (processor, store) = processor_with(provider).await;
        store
            .apply_activation("U1", "sub_1", None, now())
            .await
            .expect("seed activation");

        let renewed_end = PERIOD_END + 86_400;
        let invoice = json!({
            "type": "invoice.paid",
            "data": {"object": {
                "subscription": "sub_1",
                "lines": {"data": [{"period": {"end": renewed_end}}]}
            }}
        });
        let processed = deliver(&processor, invoice).await.expect("renew");
        assert_eq!(processed.outcome.label(), "applied");
        let user = store.user("U1").await.expect("user");
        assert_eq!(user.expires_at.map(|at| at.timestamp()), Some(renewed_end));
    }

    #[tokio::test]
    async fn payment_failed_and_unknown_types_are_acknowledged_without_mutation() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;
        deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("activate");
        let before = store.user("U1").await.expect("user");

        let failed = deliver(
            &processor,
            json!({"type": "invoice.payment_failed", "data": {"object": {"subscription": "sub_1"}}}),
        )
        .await
        .expect("payment failed");
        assert_eq!(
            failed.outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::PaymentFailedNotice,
                subscription_ref: Some("sub_1".to_string()),
            }
        );

        let unknown = deliver(
            &processor,
            json!({"type": "customer.tax_id.created", "data": {"object": {}}}),
        )
        .await
        .expect("unknown type");
        assert_eq!(unknown.outcome.label(), "unhandled_event_type");

        let after = store.user("U1").await.expect("user");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn status_sync_uses_subscription_period_fallbacks() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;
        deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("activate");

        let unpaid = json!({
            "type": "customer.subscription.updated",
            "data": {"object": {"id": "sub_1", "status": "unpaid"}}
        });
        deliver(&processor, unpaid).await.expect("sync unpaid");
        let user = store.user("U1").await.expect("user");
        assert_eq!(user.tier, SubscriptionTier::Free);
        assert_eq!(user.expires_at, Some(now() + Duration::days(365)));

        let past_due = json!({
            "type": "customer.subscription.updated",
            "data": {"object": {"id": "sub_1", "status": "past_due", "current_period_end": PERIOD_END}}
        });
        deliver(&processor, past_due).await.expect("sync past_due");
        let user = store.user("U1").await.expect("user");
        assert_eq!(user.tier, SubscriptionTier::Pro);
        assert_eq!(user.subscription_ref.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_late_renewal() {
        let provider =
            FakeBillingProvider::with_subscription("sub_1", subscription("sub_1", "active", PERIOD_END));
        let (processor, store) = processor_with(provider).await;
        deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("activate");

        let deleted = json!({
            "type": "customer.subscription.deleted",
            "data": {"object": {"id": "sub_1", "status": "canceled"}}
        });
        let processed = deliver(&processor, deleted.clone()).await.expect("cancel");
        assert_eq!(processed.outcome.label(), "applied");

        let stale_renewal = json!({
            "type": "invoice.paid",
            "data": {"object": {"subscription": "sub_1"}}
        });
        let processed = deliver(&processor, stale_renewal).await.expect("late renewal");
        assert_eq!(processed.outcome.label(), "unresolved_subscription_reference");

        let replayed_checkout = deliver(&processor, checkout_event(Some("U1"), "sub_1"))
            .await
            .expect("replayed checkout");
        assert_eq!(replayed_checkout.outcome.label(), "cancelled_subscription");

        let redelivered = deliver(&processor, deleted).await.expect("cancel again");
        assert_eq!(redelivered.outcome.label(), "unresolved_subscription_reference");

        let user = store.user("U1").await.expect("user");
        assert_eq!(user.tier, SubscriptionTier::Free);
        assert_eq!(user.subscription_ref, None);
        assert_eq!(user.price_ref, None);
        assert_eq!(user.expires_at, None);
    }
}
