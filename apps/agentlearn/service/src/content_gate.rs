//! Resolve, decide, then materialize.
//!
//! An article's body is read and rendered only after the access gate has
//! allowed the viewer. A denied response is a distinct variant with no body
//! field at all, so nothing downstream can serialize one by accident.

use agentlearn_entitlements::{AccessDecision, Entitlement, decide};
use serde::Serialize;

use crate::catalog::{ArticleMeta, CatalogError, ContentCatalog};
use crate::entitlement_store::{EntitlementStore, EntitlementStoreError};
use crate::render::MarkdownRenderer;

const UPGRADE_PATH: &str = "/pricing";

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub slug: String,
    pub name: String,
    pub icon: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Paywall {
    pub message: String,
    pub upgrade_path: &'static str,
    pub premium_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum ArticleAccess {
    Unlocked { content_html: String },
    Locked { paywall: Paywall },
}

impl ArticleAccess {
    pub fn decision(&self) -> AccessDecision {
        match self {
            Self::Unlocked { .. } => AccessDecision::Allow,
            Self::Locked { .. } => AccessDecision::Deny,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatedArticle {
    pub article: ArticleMeta,
    pub section: Option<SectionSummary>,
    pub next_article: Option<ArticleMeta>,
    pub premium_count: usize,
    #[serde(flatten)]
    pub access: ArticleAccess,
}

#[derive(Debug, thiserror::Error)]
pub enum ContentGateError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] EntitlementStoreError),
}

/// Entitlement for this request, read fresh from the store. Viewers without a
/// session, or whose row has gone away, are anonymous.
pub async fn viewer_entitlement(
    store: &EntitlementStore,
    viewer_id: Option<&str>,
) -> Result<Entitlement, EntitlementStoreError> {
    let Some(viewer_id) = viewer_id else {
        return Ok(Entitlement::anonymous());
    };
    match store.get(viewer_id).await {
        Ok(entitlement) => Ok(entitlement),
        Err(EntitlementStoreError::NotFound) => Ok(Entitlement::anonymous()),
        Err(error) => Err(error),
    }
}

pub async fn open_article(
    catalog: &ContentCatalog,
    store: &EntitlementStore,
    renderer: &dyn MarkdownRenderer,
    slug: &str,
    viewer_id: Option<&str>,
) -> Result<GatedArticle, ContentGateError> {
    let article = catalog.resolve(slug)?;

    let entitlement = viewer_entitlement(store, viewer_id).await?;
    let premium_count = catalog.stats().premium;

    let access = match decide(article.sensitivity, &entitlement) {
        AccessDecision::Allow => {
            let markdown = catalog.load_body(article).await?;
            ArticleAccess::Unlocked {
                content_html: renderer.render(&markdown),
            }
        }
        AccessDecision::Deny => ArticleAccess::Locked {
            paywall: Paywall {
                message: "This article is part of the Pro library.".to_string(),
                upgrade_path: UPGRADE_PATH,
                premium_count,
            },
        },
    };

    Ok(GatedArticle {
        section: catalog.section(&article.section).map(|section| SectionSummary {
            slug: section.slug.clone(),
            name: section.name.clone(),
            icon: section.icon.clone(),
        }),
        next_article: catalog.next_article(article).cloned(),
        premium_count,
        article: article.clone(),
        access,
    })
}
