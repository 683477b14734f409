use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use agentlearn_entitlements::{Entitlement, SubscriptionTier, UserRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::Config;

/// Durable record of users and their subscription state.
///
/// Every mutation touches a single user row (plus the subscription index
/// entries that point at it) under one write lock, then persists a full
/// snapshot with a temp-file rename. Snapshots reach disk in the order their
/// mutations were applied.
#[derive(Clone)]
pub struct EntitlementStore {
    state: Arc<RwLock<EntitlementStoreState>>,
    /// Held from before the state write lock until the snapshot is renamed
    /// into place.
    persist_guard: Arc<Mutex<()>>,
    path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum EntitlementStoreError {
    #[error("record not found")]
    NotFound,
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: UserRole,
    pub tier: SubscriptionTier,
    pub billing_customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub price_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn entitlement(&self) -> Entitlement {
        Entitlement::new(self.tier, self.expires_at)
    }
}

#[derive(Debug, Clone)]
pub struct EnsureUserInput {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationResult {
    Activated(UserRecord),
    /// The subscription was cancelled earlier; a cancelled subscription is
    /// never re-activated.
    SubscriptionCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct EntitlementStoreState {
    users: HashMap<String, UserRecord>,
    /// subscription ref -> user id. Survives a downgrade to free so a later
    /// recovery event still correlates; removed by cancellation.
    subscription_owners: HashMap<String, String>,
    cancelled_subscriptions: HashSet<String>,
}

impl EntitlementStore {
    pub fn from_config(config: &Config) -> Self {
        Self::open(config.store_path.clone())
    }

    pub fn open(path: Option<PathBuf>) -> Self {
        let state = Self::load_state(path.as_ref());
        Self {
            state: Arc::new(RwLock::new(state)),
            persist_guard: Arc::new(Mutex::new(())),
            path,
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<Entitlement, EntitlementStoreError> {
        self.user(user_id).await.map(|user| user.entitlement())
    }

    pub async fn user(&self, user_id: &str) -> Result<UserRecord, EntitlementStoreError> {
        let user_id = normalize_non_empty(user_id, "user_id")?;
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .cloned()
            .ok_or(EntitlementStoreError::NotFound)
    }

    pub async fn list_users(&self) -> Vec<UserRecord> {
        let state = self.state.read().await;
        let mut users: Vec<UserRecord> = state.users.values().cloned().collect();
        users.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        users
    }

    /// Creates the row on first sight of an identity, otherwise refreshes the
    /// profile fields. Billing fields are never touched here.
    pub async fn ensure_user(
        &self,
        input: EnsureUserInput,
    ) -> Result<UserRecord, EntitlementStoreError> {
        let user_id = normalize_non_empty(&input.user_id, "user_id")?;
        let email = normalize_non_empty(&input.email, "email")?.to_lowercase();
        let name = normalize_optional_string(input.name.as_deref());

        self.mutate(|state| {
            let now = Utc::now();
            let user = state
                .users
                .entry(user_id.clone())
                .or_insert_with(|| UserRecord {
                    id: user_id.clone(),
                    email: email.clone(),
                    name: name.clone(),
                    role: input.role,
                    tier: SubscriptionTier::Free,
                    billing_customer_ref: None,
                    subscription_ref: None,
                    price_ref: None,
                    expires_at: None,
                    created_at: now,
                    updated_at: now,
                });

            if user.email != email || user.name != name || user.role != input.role {
                user.email = email;
                user.name = name;
                user.role = input.role;
                user.updated_at = now;
            }
            Ok(user.clone())
        })
        .await
    }

    pub async fn record_billing_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
    ) -> Result<UserRecord, EntitlementStoreError> {
        let user_id = normalize_non_empty(user_id, "user_id")?;
        let customer_ref = normalize_non_empty(customer_ref, "customer_ref")?;

        self.mutate(|state| {
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or(EntitlementStoreError::NotFound)?;
            user.billing_customer_ref = Some(customer_ref);
            user.updated_at = Utc::now();
            Ok(user.clone())
        })
        .await
    }

    /// Upsert keyed by user: applying the same activation twice leaves the
    /// same row behind.
    pub async fn apply_activation(
        &self,
        user_id: &str,
        subscription_ref: &str,
        price_ref: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<ActivationResult, EntitlementStoreError> {
        let user_id = normalize_non_empty(user_id, "user_id")?;
        let subscription_ref = normalize_non_empty(subscription_ref, "subscription_ref")?;
        let price_ref = normalize_optional_string(price_ref);

        self.mutate(|state| {
            if state.cancelled_subscriptions.contains(&subscription_ref) {
                return Ok(ActivationResult::SubscriptionCancelled);
            }
            if !state.users.contains_key(&user_id) {
                return Err(EntitlementStoreError::NotFound);
            }

            state
                .subscription_owners
                .retain(|reference, owner| owner != &user_id || reference == &subscription_ref);
            state
                .subscription_owners
                .insert(subscription_ref.clone(), user_id.clone());

            let user = state
                .users
                .get_mut(&user_id)
                .ok_or(EntitlementStoreError::NotFound)?;
            user.tier = SubscriptionTier::Pro;
            user.subscription_ref = Some(subscription_ref);
            user.price_ref = price_ref;
            user.expires_at = Some(expires_at);
            user.updated_at = Utc::now();
            Ok(ActivationResult::Activated(user.clone()))
        })
        .await
    }

    /// Returns `None` when no user owns `subscription_ref`.
    pub async fn apply_renewal(
        &self,
        subscription_ref: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<UserRecord>, EntitlementStoreError> {
        let subscription_ref = normalize_non_empty(subscription_ref, "subscription_ref")?;

        self.mutate(|state| {
            let Some(user) = owner_of(state, &subscription_ref) else {
                return Ok(None);
            };
            user.tier = SubscriptionTier::Pro;
            user.subscription_ref = Some(subscription_ref);
            user.expires_at = Some(expires_at);
            user.updated_at = Utc::now();
            Ok(Some(user.clone()))
        })
        .await
    }

    /// Returns `None` when no user owns `subscription_ref`. The expiry is
    /// refreshed whatever the status.
    pub async fn apply_status_sync(
        &self,
        subscription_ref: &str,
        is_active: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<UserRecord>, EntitlementStoreError> {
        let subscription_ref = normalize_non_empty(subscription_ref, "subscription_ref")?;

        self.mutate(|state| {
            let Some(user) = owner_of(state, &subscription_ref) else {
                return Ok(None);
            };
            if is_active {
                user.tier = SubscriptionTier::Pro;
                user.subscription_ref = Some(subscription_ref);
            } else {
                user.tier = SubscriptionTier::Free;
                user.subscription_ref = None;
            }
            user.expires_at = Some(expires_at);
            user.updated_at = Utc::now();
            Ok(Some(user.clone()))
        })
        .await
    }

    /// Terminal downgrade. The reference is remembered as cancelled even when
    /// no user owns it, so a late activation for it is refused.
    pub async fn apply_cancellation(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<UserRecord>, EntitlementStoreError> {
        let subscription_ref = normalize_non_empty(subscription_ref, "subscription_ref")?;

        self.mutate(|state| {
            state.cancelled_subscriptions.insert(subscription_ref.clone());
            let owner_id = state.subscription_owners.remove(&subscription_ref);
            let Some(user) = owner_id.and_then(|owner_id| state.users.get_mut(&owner_id)) else {
                return Ok(None);
            };
            user.tier = SubscriptionTier::Free;
            user.subscription_ref = None;
            user.price_ref = None;
            user.expires_at = None;
            user.updated_at = Utc::now();
            Ok(Some(user.clone()))
        })
        .await
    }

    /// Sets a tier without provider backing. Pro requires an expiry.
    pub async fn grant_direct(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRecord, EntitlementStoreError> {
        let user_id = normalize_non_empty(user_id, "user_id")?;

        self.mutate(|state| {
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or(EntitlementStoreError::NotFound)?;
            match tier {
                SubscriptionTier::Pro => {
                    let expires_at = expires_at.or(user.expires_at);
                    if expires_at.is_none() && user.subscription_ref.is_none() {
                        return Err(EntitlementStoreError::Validation {
                            field: "expires_at",
                            message: "pro tier without a subscription needs an expiry"
                                .to_string(),
                        });
                    }
                    user.tier = SubscriptionTier::Pro;
                    user.expires_at = expires_at;
                }
                SubscriptionTier::Free => {
                    user.tier = SubscriptionTier::Free;
                    user.subscription_ref = None;
                    user.expires_at = None;
                }
            }
            user.updated_at = Utc::now();
            Ok(user.clone())
        })
        .await
    }

    fn load_state(path: Option<&PathBuf>) -> EntitlementStoreState {
        let Some(path) = path else {
            return EntitlementStoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return EntitlementStoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "agentlearn.entitlement_store",
                    path = %path.display(),
                    error = %error,
                    "failed to read entitlement store; booting with empty state",
                );
                return EntitlementStoreState::default();
            }
        };

        match serde_json::from_str::<EntitlementStoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "agentlearn.entitlement_store",
                    path = %path.display(),
                    error = %error,
                    "failed to parse entitlement store; booting with empty state",
                );
                EntitlementStoreState::default()
            }
        }
    }

    async fn persist_state(
        &self,
        snapshot: &EntitlementStoreState,
    ) -> Result<(), EntitlementStoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                EntitlementStoreError::Persistence {
                    message: format!("failed to prepare entitlement store directory: {error}"),
                }
            })?;
        }

        let payload =
            serde_json::to_vec(snapshot).map_err(|error| EntitlementStoreError::Persistence {
                message: format!("failed to encode entitlement store payload: {error}"),
            })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| EntitlementStoreError::Persistence {
                message: format!("failed to write entitlement store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path).await.map_err(|error| {
            EntitlementStoreError::Persistence {
                message: format!("failed to finalize entitlement store payload: {error}"),
            }
        })?;

        Ok(())
    }

    async fn mutate<T, F>(&self, operation: F) -> Result<T, EntitlementStoreError>
    where
        F: FnOnce(&mut EntitlementStoreState) -> Result<T, EntitlementStoreError>,
    {
        let _persist = self.persist_guard.lock().await;
        let (result, snapshot) = {
            let mut state = self.state.write().await;
            let result = operation(&mut state)?;
            (result, state.clone())
        };

        self.persist_state(&snapshot).await?;
        Ok(result)
    }
}

fn owner_of<'a>(
    state: &'a mut EntitlementStoreState,
    subscription_ref: &str,
) -> Option<&'a mut UserRecord> {
    let owner_id = state.subscription_owners.get(subscription_ref)?;
    state.users.get_mut(owner_id)
}

fn normalize_non_empty(value: &str, field: &'static str) -> Result<String, EntitlementStoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EntitlementStoreError::Validation {
            field,
            message: "value is required".to_string(),
        });
    }

    Ok(trimmed.to_string())
}

fn normalize_optional_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
