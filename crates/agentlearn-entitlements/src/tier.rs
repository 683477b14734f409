use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown subscription tier '{0}'")]
    UnknownTier(String),
    #[error("unknown user role '{0}'")]
    UnknownRole(String),
}

/// Coarse-grained subscription level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
}

impl SubscriptionTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(ParseError::UnknownTier(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    Standard,
    Admin,
}

impl UserRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Admin => "admin",
        }
    }

    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "admin" => Ok(Self::Admin),
            other => Err(ParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Per-resource flag, independent of tier. Authored content marks restricted
/// articles with `isPremium: true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Public,
    Restricted,
}

impl Sensitivity {
    pub const fn from_premium_flag(is_premium: bool) -> Self {
        if is_premium {
            Self::Restricted
        } else {
            Self::Public
        }
    }

    pub const fn is_restricted(self) -> bool {
        matches!(self, Self::Restricted)
    }
}

/// Read-time projection of a user's subscription state. This is the only
/// thing the access gate ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub const fn new(tier: SubscriptionTier, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { tier, expires_at }
    }

    /// Viewers without a session are treated exactly like `free`.
    pub const fn anonymous() -> Self {
        Self {
            tier: SubscriptionTier::Free,
            expires_at: None,
        }
    }

    pub const fn is_pro(&self) -> bool {
        matches!(self.tier, SubscriptionTier::Pro)
    }
}
