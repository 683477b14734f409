//! Entitlement domain for agentlearn.
//!
//! Pure types and decisions shared by the content service and its tooling:
//! subscription tiers and roles, the access gate, billing event
//! interpretation, and webhook signature verification. Nothing here performs
//! I/O.

pub mod events;
pub mod gate;
pub mod signature;
pub mod tier;

pub use events::{BillingEventEnvelope, BillingEventKind, ProviderStatus};
pub use gate::{AccessDecision, decide};
pub use signature::{SignatureError, sign_payload, verify_signature};
pub use tier::{Entitlement, ParseError, Sensitivity, SubscriptionTier, UserRole};
