use serde::Serialize;

use crate::tier::{Entitlement, Sensitivity, SubscriptionTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Allow,
    Deny,
}

impl AccessDecision {
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether a viewer may receive the body of a resource.
///
/// Public resources are always readable. Restricted resources are readable
/// only by `pro` viewers. Expiry is informational and is not consulted here:
/// tier truth comes from the billing provider's event stream.
pub fn decide(sensitivity: Sensitivity, entitlement: &Entitlement) -> AccessDecision {
    match (sensitivity, entitlement.tier) {
        (Sensitivity::Public, _) => AccessDecision::Allow,
        (Sensitivity::Restricted, SubscriptionTier::Pro) => AccessDecision::Allow,
        (Sensitivity::Restricted, SubscriptionTier::Free) => AccessDecision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn viewers() -> Vec<Entitlement> {
        vec![
            Entitlement::anonymous(),
            Entitlement::new(SubscriptionTier::Free, None),
            Entitlement::new(SubscriptionTier::Free, Some(Utc::now() - Duration::days(3))),
            Entitlement::new(SubscriptionTier::Pro, Some(Utc::now() + Duration::days(30))),
            Entitlement::new(SubscriptionTier::Pro, None),
        ]
    }

    #[test]
    fn public_resources_are_allowed_for_every_viewer() {
        for viewer in viewers() {
            assert_eq!(decide(Sensitivity::Public, &viewer), AccessDecision::Allow);
        }
    }

    #[test]
    fn restricted_resources_are_allowed_only_for_pro() {
        for viewer in viewers() {
            let expected = if viewer.is_pro() {
                AccessDecision::Allow
            } else {
                AccessDecision::Deny
            };
            assert_eq!(decide(Sensitivity::Restricted, &viewer), expected);
        }
    }

    #[test]
    fn anonymous_viewer_is_denied_restricted_content() {
        assert_eq!(
            decide(Sensitivity::Restricted, &Entitlement::anonymous()),
            AccessDecision::Deny
        );
    }
}
