//! Interpretation of billing provider event payloads.
//!
//! Provider payloads move fields around between API versions, so every value
//! the processor needs is pulled through an explicit, ordered list of
//! candidate locations instead of ad hoc lookups in each handler.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_INVOICE_PAID: &str = "invoice.paid";
pub const EVENT_INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const EVENT_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// Fallback horizon when a payload carries no usable period end.
pub const DEFAULT_PERIOD_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventKind {
    CheckoutCompleted,
    InvoicePaid,
    InvoicePaymentFailed,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Unhandled,
}

impl BillingEventKind {
    pub fn classify(event_type: &str) -> Self {
        match event_type.trim() {
            EVENT_CHECKOUT_COMPLETED => Self::CheckoutCompleted,
            EVENT_INVOICE_PAID => Self::InvoicePaid,
            EVENT_INVOICE_PAYMENT_FAILED => Self::InvoicePaymentFailed,
            EVENT_SUBSCRIPTION_UPDATED => Self::SubscriptionUpdated,
            EVENT_SUBSCRIPTION_DELETED | "customer.subscription.cancelled" => {
                Self::SubscriptionDeleted
            }
            _ => Self::Unhandled,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckoutCompleted => "checkout_completed",
            Self::InvoicePaid => "invoice_paid",
            Self::InvoicePaymentFailed => "invoice_payment_failed",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::Unhandled => "unhandled",
        }
    }
}

/// The verified delivery envelope. Only `type` is required; the object is
/// kept as raw JSON and read through the extraction helpers below.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEventEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: BillingEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingEventData {
    #[serde(default)]
    pub object: Value,
}

impl BillingEventEnvelope {
    pub fn kind(&self) -> BillingEventKind {
        BillingEventKind::classify(&self.event_type)
    }

    pub fn object(&self) -> &Value {
        &self.data.object
    }
}

/// Provider-reported subscription status, reduced to what the entitlement
/// store needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    /// `active`, `trialing`, and `past_due`. A past-due subscription is observed
    /// without downgrading; the provider follows up with a renewal or a
    /// cancellation.
    ActiveEquivalent,
    Inactive,
}

impl ProviderStatus {
    pub fn from_status(status: Option<&str>) -> Self {
        match status.map(str::trim) {
            Some("active" | "trialing" | "past_due") => Self::ActiveEquivalent,
            _ => Self::Inactive,
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(self, Self::ActiveEquivalent)
    }
}

fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|text| !text.is_empty())
}

/// A reference field may be a bare id or an expanded object carrying `id`.
fn reference(value: &Value) -> Option<String> {
    non_empty_str(value)
        .or_else(|| value.get("id").and_then(non_empty_str))
        .map(ToString::to_string)
}

fn first_item(object: &Value, list_field: &str) -> Option<Value> {
    object
        .get(list_field)
        .and_then(|list| list.get("data"))
        .and_then(|data| data.get(0))
        .cloned()
}

/// Returns the first candidate timestamp, or `now + 365 days` when none of the
/// candidates are present. Never returns `None`.
pub fn first_period_end(candidates: &[Option<i64>], now: DateTime<Utc>) -> DateTime<Utc> {
    candidates
        .iter()
        .flatten()
        .find_map(|seconds| Utc.timestamp_opt(*seconds, 0).single())
        .unwrap_or_else(|| now + Duration::days(DEFAULT_PERIOD_DAYS))
}

/// Subscription object period end: subscription level, then the first line
/// item, then the default horizon.
pub fn subscription_period_end(subscription: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
    let item_level = first_item(subscription, "items")
        .and_then(|item| item.get("current_period_end").and_then(epoch_seconds));
    first_period_end(
        &[
            subscription.get("current_period_end").and_then(epoch_seconds),
            item_level,
        ],
        now,
    )
}

/// Invoice period end: the first invoice line's service period, then the
/// default horizon.
pub fn invoice_period_end(invoice: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
    let line_level = first_item(invoice, "lines").and_then(|line| {
        line.get("period")
            .and_then(|period| period.get("end"))
            .and_then(epoch_seconds)
    });
    first_period_end(&[line_level], now)
}

/// Price/plan reference of the first subscription item.
pub fn subscription_price_ref(subscription: &Value) -> Option<String> {
    let item = first_item(subscription, "items")?;
    item.get("price")
        .and_then(reference)
        .or_else(|| item.get("plan").and_then(reference))
}

/// Subscription reference carried by an invoice or checkout session:
/// top-level `subscription`, then `parent.subscription_details.subscription`.
pub fn subscription_ref(object: &Value) -> Option<String> {
    object.get("subscription").and_then(reference).or_else(|| {
        object
            .get("parent")
            .and_then(|parent| parent.get("subscription_details"))
            .and_then(|details| details.get("subscription"))
            .and_then(reference)
    })
}

pub fn object_id(object: &Value) -> Option<String> {
    object.get("id").and_then(non_empty_str).map(ToString::to_string)
}

pub fn metadata_user_id(object: &Value) -> Option<String> {
    object
        .get("metadata")
        .and_then(|metadata| metadata.get("userId").or_else(|| metadata.get("user_id")))
        .and_then(non_empty_str)
        .map(ToString::to_string)
}

pub fn checkout_is_subscription_mode(session: &Value) -> bool {
    session.get("mode").and_then(Value::as_str) == Some("subscription")
}

pub fn status(object: &Value) -> Option<&str> {
    object.get("status").and_then(non_empty_str)
}
