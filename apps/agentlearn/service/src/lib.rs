use std::sync::Arc;
use std::time::{Duration, SystemTime};

use agentlearn_entitlements::{SubscriptionTier, UserRole, decide};
use axum::body::Bytes;
use axum::extract::{Extension, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod billing;
pub mod catalog;
pub mod config;
pub mod content_gate;
pub mod entitlement_store;
pub mod identity;
pub mod observability;
pub mod render;


use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, error_response_with_status, forbidden_error, not_found_error,
    ok_data, unauthorized_error, validation_error,
};
use crate::billing::{
    BillingError, BillingEventProcessor, BillingProvider, CheckoutRequest, CustomerRequest,
    IgnoreReason, SIGNATURE_HEADER, WebhookOutcome, provider_from_config,
};
use crate::catalog::{ArticleMeta, CatalogError, ContentCatalog};
use crate::config::Config;
use crate::content_gate::{ContentGateError, open_article, viewer_entitlement};
use crate::entitlement_store::{EnsureUserInput, EntitlementStore, EntitlementStoreError, UserRecord};
use crate::identity::{IdentityError, SessionTokenCodec, access_token_from_headers};
use crate::observability::{AuditEvent, Observability};
use crate::render::{MarkdownRenderer, PulldownRenderer};

const SERVICE_NAME: &str = "agentlearn";

pub const ROUTE_HEALTHZ: &str = "/healthz";
pub const ROUTE_READYZ: &str = "/readyz";
pub const ROUTE_CONTENT_SECTIONS: &str = "/api/content/sections";
pub const ROUTE_CONTENT_STATS: &str = "/api/content/stats";
pub const ROUTE_CONTENT_ARTICLE: &str = "/api/content/articles/:slug";
pub const ROUTE_ME: &str = "/api/me";
pub const ROUTE_SUBSCRIBE: &str = "/api/subscribe";
pub const ROUTE_BILLING_CHECKOUT: &str = "/api/billing/checkout";
pub const ROUTE_BILLING_PORTAL: &str = "/api/billing/portal";
pub const ROUTE_BILLING_WEBHOOK: &str = "/api/webhooks/billing";
pub const ROUTE_ADMIN_USERS: &str = "/api/admin/users";

const DIRECT_GRANT_DAYS: i64 = 365;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: EntitlementStore,
    catalog: Arc<ContentCatalog>,
    renderer: Arc<dyn MarkdownRenderer>,
    billing: BillingEventProcessor,
    sessions: SessionTokenCodec,
    observability: Observability,
    started_at: SystemTime,
}

/// Long-lived collaborators the router is built around. Everything a handler
/// touches comes from here, so tests can swap any of them.
pub struct ServiceDependencies {
    pub store: EntitlementStore,
    pub catalog: ContentCatalog,
    pub renderer: Arc<dyn MarkdownRenderer>,
    pub billing_provider: Arc<dyn BillingProvider>,
    pub observability: Observability,
}

impl ServiceDependencies {
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_with_observability(config, Observability::default())
    }

    pub fn from_config_with_observability(config: &Config, observability: Observability) -> Self {
        let catalog = match ContentCatalog::load(&config.content_dir) {
            Ok(catalog) => {
                let stats = catalog.stats();
                tracing::info!(
                    target: "agentlearn.catalog",
                    content_dir = %config.content_dir.display(),
                    articles = stats.total,
                    premium = stats.premium,
                    sections = stats.sections,
                    "content catalog loaded"
                );
                catalog
            }
            Err(error) => {
                tracing::error!(
                    target: "agentlearn.catalog",
                    content_dir = %config.content_dir.display(),
                    error = %error,
                    "content catalog failed to load"
                );
                ContentCatalog::unavailable(config.content_dir.clone())
            }
        };

        Self {
            store: EntitlementStore::from_config(config),
            catalog,
            renderer: Arc::new(PulldownRenderer),
            billing_provider: provider_from_config(config),
            observability,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    billing_provider: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    content_dir: String,
    articles: usize,
}

#[derive(Debug, Serialize)]
struct ArticleListing<'a> {
    #[serde(flatten)]
    article: &'a ArticleMeta,
    locked: bool,
}

#[derive(Debug, Serialize)]
struct SectionListing<'a> {
    slug: &'a str,
    name: &'a str,
    description: &'a str,
    icon: &'a str,
    order: i64,
    articles: Vec<ArticleListing<'a>>,
}

#[derive(Debug, Serialize)]
struct ViewerSummary {
    tier: SubscriptionTier,
    is_pro: bool,
}

#[derive(Debug, Serialize)]
struct SectionsResponse<'a> {
    sections: Vec<SectionListing<'a>>,
    viewer: ViewerSummary,
}

#[derive(Debug, Serialize)]
struct MeResponse {
    user: UserView,
    entitlement: EntitlementView,
}

#[derive(Debug, Serialize)]
struct UserView {
    id: String,
    email: String,
    name: Option<String>,
    role: UserRole,
    tier: SubscriptionTier,
    expires_at: Option<DateTime<Utc>>,
    has_billing_account: bool,
    created_at: DateTime<Utc>,
}

impl From<&UserRecord> for UserView {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            tier: user.tier,
            expires_at: user.expires_at,
            has_billing_account: user.billing_customer_ref.is_some(),
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct EntitlementView {
    tier: SubscriptionTier,
    expires_at: Option<DateTime<Utc>>,
    is_pro: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequestPayload {
    plan: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminUpdateRequestPayload {
    user_id: String,
    #[serde(alias = "subscriptionStatus")]
    tier: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct RedirectUrlResponse {
    url: String,
}

pub fn build_router(config: Config) -> Router {
    let dependencies = ServiceDependencies::from_config(&config);
    build_router_with_dependencies(config, dependencies)
}

pub fn build_router_with_observability(config: Config, observability: Observability) -> Router {
    let dependencies = ServiceDependencies::from_config_with_observability(&config, observability);
    build_router_with_dependencies(config, dependencies)
}

pub fn build_router_with_dependencies(config: Config, dependencies: ServiceDependencies) -> Router {
    let request_timeout = Duration::from_millis(config.request_timeout_ms);
    let billing = BillingEventProcessor::from_config(
        &config,
        dependencies.store.clone(),
        dependencies.billing_provider,
    );
    let state = AppState {
        sessions: SessionTokenCodec::from_config(&config),
        config: Arc::new(config),
        store: dependencies.store,
        catalog: Arc::new(dependencies.catalog),
        renderer: dependencies.renderer,
        billing,
        observability: dependencies.observability,
        started_at: SystemTime::now(),
    };

    let public_router = Router::new()
        .route(ROUTE_HEALTHZ, get(health))
        .route(ROUTE_READYZ, get(readiness))
        .route(ROUTE_CONTENT_SECTIONS, get(content_sections))
        .route(ROUTE_CONTENT_STATS, get(content_stats))
        .route(ROUTE_CONTENT_ARTICLE, get(content_article));

    // Webhook handling runs to completion; the provider owns delivery
    // timeouts and redelivers on failure.
    let webhook_router = Router::new().route(ROUTE_BILLING_WEBHOOK, post(billing_webhook));

    let member_router = Router::new()
        .route(ROUTE_ME, get(me))
        .route(ROUTE_SUBSCRIBE, post(subscribe))
        .route(ROUTE_BILLING_CHECKOUT, post(billing_checkout))
        .route(ROUTE_BILLING_PORTAL, post(billing_portal))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_session_gate,
        ));

    let admin_router = Router::new()
        .route(
            ROUTE_ADMIN_USERS,
            get(admin_list_users).patch(admin_update_user),
        )
        .route_layer(middleware::from_fn(admin_role_gate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_session_gate,
        ));

    let timed_router = Router::new()
        .merge(public_router)
        .merge(member_router)
        .merge(admin_router)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new()
        .merge(timed_router)
        .merge(webhook_router)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

/// Binds the configured address and serves until ctrl-c.
pub async fn serve(config: Config) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        target: "agentlearn.service",
        service = SERVICE_NAME,
        bind_addr = %config.bind_addr,
        "agentlearn service listening"
    );
    axum::serve(listener, build_router(config))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(
                    target: "agentlearn.service",
                    error = %error,
                    "failed to listen for shutdown signal"
                );
            }
        })
        .await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_seconds = SystemTime::now()
        .duration_since(state.started_at)
        .map_or(0, |duration| duration.as_secs());

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        billing_provider: state.billing.provider().name(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let content_dir = state.catalog.root().to_string_lossy().to_string();
    let articles = state.catalog.stats().total;

    if state.catalog.is_loaded() {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                content_dir,
                articles,
            }),
        );
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            content_dir,
            articles,
        }),
    )
}

async fn auth_session_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticated_user(&state, request.headers()).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(response) => response.into_response(),
    }
}

async fn admin_role_gate(request: Request, next: Next) -> Response {
    let is_admin = request
        .extensions()
        .get::<UserRecord>()
        .is_some_and(|user| user.role.is_admin());
    if !is_admin {
        return forbidden_error("Forbidden.").into_response();
    }

    next.run(request).await
}

/// Verifies the access token, then makes sure the user row exists and carries
/// the role the admin allowlist currently implies.
async fn authenticated_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserRecord, ApiErrorTuple> {
    let token = access_token_from_headers(headers)
        .ok_or_else(|| unauthorized_error("Unauthenticated."))?;
    let claims = state
        .sessions
        .verify(&token, Utc::now())
        .map_err(map_identity_error)?;

    let role = if state.config.is_admin_email(&claims.email) {
        UserRole::Admin
    } else {
        UserRole::Standard
    };

    if let Ok(existing) = state.store.user(&claims.sub).await
        && existing.email == claims.email.trim().to_lowercase()
        && existing.name == claims.name
        && existing.role == role
    {
        return Ok(existing);
    }

    state
        .store
        .ensure_user(EnsureUserInput {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
            role,
        })
        .await
        .map_err(map_store_error)
}

/// Content routes work without a session. A missing or unusable token is an
/// anonymous viewer, never an error.
async fn optional_viewer(state: &AppState, headers: &HeaderMap) -> Option<UserRecord> {
    access_token_from_headers(headers)?;
    match authenticated_user(state, headers).await {
        Ok(user) => Some(user),
        Err((status, _)) => {
            tracing::debug!(
                target: "agentlearn.identity",
                status = status.as_u16(),
                "ignoring unusable access token on public route"
            );
            None
        }
    }
}

async fn content_sections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let viewer = optional_viewer(&state, &headers).await;
    let entitlement = viewer_entitlement(&state.store, viewer.as_ref().map(|user| user.id.as_str()))
        .await
        .map_err(map_store_error)?;

    let sections = state
        .catalog
        .sections()
        .iter()
        .map(|section| SectionListing {
            slug: &section.slug,
            name: &section.name,
            description: &section.description,
            icon: &section.icon,
            order: section.order,
            articles: section
                .articles
                .iter()
                .map(|article| ArticleListing {
                    article,
                    locked: !decide(article.sensitivity, &entitlement).is_allowed(),
                })
                .collect(),
        })
        .collect();

    let response = SectionsResponse {
        sections,
        viewer: ViewerSummary {
            tier: entitlement.tier,
            is_pro: entitlement.is_pro(),
        },
    };
    let body = serde_json::to_value(&response).map_err(|error| {
        error_response_with_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError,
            format!("Failed to encode sections: {error}"),
        )
    })?;

    Ok(ok_data(body))
}

async fn content_stats(State(state): State<AppState>) -> impl IntoResponse {
    ok_data(state.catalog.stats())
}

async fn content_article(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let viewer = optional_viewer(&state, &headers).await;
    let viewer_id = viewer.as_ref().map(|user| user.id.as_str());

    let gated = open_article(
        &state.catalog,
        &state.store,
        state.renderer.as_ref(),
        &slug,
        viewer_id,
    )
    .await
    .map_err(map_content_gate_error)?;

    let decision = gated.access.decision();
    let counter = if decision.is_allowed() {
        "content.article.allowed"
    } else {
        "content.article.denied"
    };
    state.observability.increment_counter(counter, &request_id);

    let mut event = AuditEvent::new("content.article.viewed", request_id)
        .with_outcome(if decision.is_allowed() { "allowed" } else { "denied" })
        .with_attribute("slug", gated.article.slug.clone())
        .with_attribute(
            "sensitivity",
            if gated.article.sensitivity.is_restricted() {
                "restricted"
            } else {
                "public"
            },
        );
    if let Some(viewer_id) = viewer_id {
        event = event.with_user_id(viewer_id);
    }
    state.observability.audit(event);

    Ok(ok_data(gated))
}

async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<UserRecord>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let entitlement = state.store.get(&user.id).await.map_err(map_store_error)?;

    Ok(ok_data(MeResponse {
        user: UserView::from(&user),
        entitlement: EntitlementView {
            tier: entitlement.tier,
            expires_at: entitlement.expires_at,
            is_pro: entitlement.is_pro(),
        },
    }))
}

async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(user): Extension<UserRecord>,
    Json(payload): Json<SubscribeRequestPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    if !state.config.demo_grant_enabled {
        return Err(not_found_error("Not found."));
    }
    if payload
        .user_id
        .as_deref()
        .is_some_and(|requested| requested.trim() != user.id)
    {
        return Err(forbidden_error("Plans can only be granted to yourself."));
    }

    let tier = payload.plan.parse::<SubscriptionTier>().ok();
    if tier != Some(SubscriptionTier::Pro) {
        return Err(validation_error("plan", "Unknown plan."));
    }

    let expires_at = Utc::now() + chrono::Duration::days(DIRECT_GRANT_DAYS);
    let updated = state
        .store
        .grant_direct(&user.id, SubscriptionTier::Pro, Some(expires_at))
        .await
        .map_err(map_store_error)?;

    state.observability.audit(
        AuditEvent::new("entitlement.direct_grant", request_id(&headers))
            .with_outcome("granted")
            .with_user_id(updated.id.clone())
            .with_attribute("tier", updated.tier.as_str()),
    );

    Ok(ok_data(UserView::from(&updated)))
}

async fn billing_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(user): Extension<UserRecord>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    if user.entitlement().is_pro() {
        return Err(error_response_with_status(
            StatusCode::CONFLICT,
            ApiErrorCode::Conflict,
            "You already have an active Pro subscription.",
        ));
    }

    let provider = state.billing.provider();
    let customer_ref = match user.billing_customer_ref.clone() {
        Some(existing) => existing,
        None => {
            let created = provider
                .create_customer(CustomerRequest {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                    name: user.name.clone(),
                })
                .await
                .map_err(map_billing_error)?;
            state
                .store
                .record_billing_customer(&user.id, &created)
                .await
                .map_err(map_store_error)?;
            created
        }
    };

    let base_url = state.config.public_base_url.trim_end_matches('/');
    let url = provider
        .create_checkout_session(CheckoutRequest {
            user_id: user.id.clone(),
            customer_ref,
            success_url: format!("{base_url}/success?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{base_url}/pricing?cancelled=1"),
        })
        .await
        .map_err(map_billing_error)?;

    state.observability.audit(
        AuditEvent::new("billing.checkout.created", request_id(&headers))
            .with_outcome("created")
            .with_user_id(user.id.clone())
            .with_attribute("provider", provider.name()),
    );

    Ok(ok_data(RedirectUrlResponse { url }))
}

async fn billing_portal(
    State(state): State<AppState>,
    Extension(user): Extension<UserRecord>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let Some(customer_ref) = user.billing_customer_ref.as_deref() else {
        return Err(validation_error(
            "customer",
            "No billing account is linked to this user.",
        ));
    };

    let return_url = format!(
        "{}/dashboard",
        state.config.public_base_url.trim_end_matches('/')
    );
    let url = state
        .billing
        .provider()
        .create_portal_session(customer_ref, &return_url)
        .await
        .map_err(map_billing_error)?;

    Ok(ok_data(RedirectUrlResponse { url }))
}

async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let processed = match state.billing.handle(&body, signature).await {
        Ok(processed) => processed,
        Err(error) => {
            let outcome = match &error {
                BillingError::InvalidSignature(_) => "rejected_signature",
                BillingError::MalformedPayload { .. } => "rejected_payload",
                _ => "failed",
            };
            state
                .observability
                .increment_counter(&format!("billing.webhook.{outcome}"), &request_id);
            state.observability.audit(
                AuditEvent::new("billing.webhook.processed", request_id.clone())
                    .with_outcome(outcome)
                    .with_attribute("retryable", error.is_retryable().to_string()),
            );
            if error.is_retryable() {
                tracing::error!(
                    target: "agentlearn.billing",
                    request_id = %request_id,
                    error = %error,
                    "billing webhook failed; provider will redeliver"
                );
            } else {
                tracing::warn!(
                    target: "agentlearn.billing",
                    request_id = %request_id,
                    error = %error,
                    "billing webhook rejected"
                );
            }
            return Err(map_billing_error(error));
        }
    };

    state
        .observability
        .increment_counter("billing.webhook.accepted", &request_id);

    let mut event = AuditEvent::new("billing.webhook.processed", request_id.clone())
        .with_outcome(processed.outcome.label())
        .with_attribute("event_type", processed.event_type.clone())
        .with_attribute("kind", processed.kind.as_str());
    if let Some(event_id) = &processed.event_id {
        event = event.with_attribute("event_id", event_id.clone());
    }
    match &processed.outcome {
        WebhookOutcome::Applied {
            user_id,
            subscription_ref,
        } => {
            event = event
                .with_user_id(user_id.clone())
                .with_attribute("subscription_ref", subscription_ref.clone());
        }
        WebhookOutcome::Ignored {
            reason,
            subscription_ref,
        } => {
            if let Some(subscription_ref) = subscription_ref {
                event = event.with_attribute("subscription_ref", subscription_ref.clone());
            }
            if *reason == IgnoreReason::PaymentFailedNotice {
                state.observability.audit(
                    AuditEvent::new("billing.payment_failed", request_id.clone())
                        .with_outcome("notice")
                        .with_attribute(
                            "subscription_ref",
                            subscription_ref.clone().unwrap_or_default(),
                        ),
                );
            }
        }
    }
    state.observability.audit(event);

    Ok((StatusCode::OK, Json(serde_json::json!({ "received": true }))))
}

async fn admin_list_users(State(state): State<AppState>) -> impl IntoResponse {
    let users = state
        .store
        .list_users()
        .await
        .iter()
        .map(UserView::from)
        .collect::<Vec<_>>();
    ok_data(users)
}

async fn admin_update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(admin): Extension<UserRecord>,
    Json(payload): Json<AdminUpdateRequestPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let tier = payload
        .tier
        .parse::<SubscriptionTier>()
        .map_err(|_| validation_error("tier", "Tier must be one of: free, pro."))?;

    let target = state
        .store
        .user(&payload.user_id)
        .await
        .map_err(map_store_error)?;

    let expires_at = match (tier, payload.expires_at) {
        (SubscriptionTier::Pro, None)
            if target.expires_at.is_none() && target.subscription_ref.is_none() =>
        {
            Some(Utc::now() + chrono::Duration::days(DIRECT_GRANT_DAYS))
        }
        (_, requested) => requested,
    };

    let updated = state
        .store
        .grant_direct(&target.id, tier, expires_at)
        .await
        .map_err(map_store_error)?;

    state.observability.audit(
        AuditEvent::new("admin.entitlement.override", request_id(&headers))
            .with_outcome("updated")
            .with_user_id(admin.id.clone())
            .with_attribute("target_user_id", updated.id.clone())
            .with_attribute("tier", updated.tier.as_str()),
    );

    Ok(ok_data(UserView::from(&updated)))
}

fn map_identity_error(error: IdentityError) -> ApiErrorTuple {
    match error {
        IdentityError::Unavailable => error_response_with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::ServiceUnavailable,
            "Sessions are not configured.",
        ),
        IdentityError::Expired => unauthorized_error("Session has expired."),
        IdentityError::Malformed | IdentityError::BadSignature => {
            unauthorized_error("Unauthenticated.")
        }
    }
}

fn map_store_error(error: EntitlementStoreError) -> ApiErrorTuple {
    match error {
        EntitlementStoreError::NotFound => not_found_error("Requested resource was not found."),
        EntitlementStoreError::Validation { field, message } => validation_error(field, &message),
        EntitlementStoreError::Persistence { message } => {
            tracing::error!(
                target: "agentlearn.entitlement_store",
                error = %message,
                "entitlement store write failed"
            );
            error_response_with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorCode::ServiceUnavailable,
                message,
            )
        }
    }
}

fn map_content_gate_error(error: ContentGateError) -> ApiErrorTuple {
    match error {
        ContentGateError::Catalog(CatalogError::NotFound { slug }) => {
            not_found_error(format!("Article '{slug}' was not found."))
        }
        ContentGateError::Catalog(other) => {
            tracing::error!(
                target: "agentlearn.catalog",
                error = %other,
                "article body could not be loaded"
            );
            error_response_with_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorCode::InternalError,
                "Article could not be loaded.",
            )
        }
        ContentGateError::Store(error) => map_store_error(error),
    }
}

fn map_billing_error(error: BillingError) -> ApiErrorTuple {
    match error {
        BillingError::InvalidSignature(_) => error_response_with_status(
            StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidSignature,
            "Webhook signature verification failed.",
        ),
        BillingError::MalformedPayload { message } => error_response_with_status(
            StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidPayload,
            message,
        ),
        BillingError::NotConfigured { message } => error_response_with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::ServiceUnavailable,
            message,
        ),
        BillingError::Store(_) | BillingError::Provider { .. } => error_response_with_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError,
            "Billing operation failed.",
        ),
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(
            || format!("req_{}", uuid::Uuid::new_v4().simple()),
            ToString::to_string,
        )
}
