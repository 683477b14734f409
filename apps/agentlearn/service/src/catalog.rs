//! Metadata index over the markdown content directory.
//!
//! Layout: `<content>/<section>/_category.json` describes a section and every
//! `NN-slug.md` file next to it is one article. Loading reads frontmatter only
//! into memory; article bodies are read from disk on demand through
//! [`ContentCatalog::load_body`], which the content gate calls after an
//! access decision.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use agentlearn_entitlements::Sensitivity;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

const CATEGORY_FILE: &str = "_category.json";
const DEFAULT_ARTICLE_ORDER: i64 = 99;
const DEFAULT_READING_TIME_MINUTES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("article '{slug}' was not found")]
    NotFound { slug: String },
    #[error("slug '{slug}' is used by both {first} and {second}")]
    DuplicateSlug {
        slug: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid metadata in {path}: {message}")]
    Frontmatter { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleMeta {
    pub slug: String,
    pub section: String,
    pub title: String,
    pub excerpt: String,
    pub sensitivity: Sensitivity,
    pub is_premium: bool,
    pub order: i64,
    pub reading_time: u32,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(skip)]
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub order: i64,
    pub articles: Vec<ArticleMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub free: usize,
    pub premium: usize,
    pub sections: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategoryFile {
    name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    order: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentCatalog {
    root: PathBuf,
    sections: Vec<Section>,
    /// slug -> (section index, article index)
    slugs: HashMap<String, (usize, usize)>,
    loaded: bool,
}

impl ContentCatalog {
    /// Placeholder used when the content directory could not be indexed.
    /// Every lookup misses and readiness reports not ready.
    pub fn unavailable(root: PathBuf) -> Self {
        Self {
            root,
            ..Self::default()
        }
    }

    pub fn load(root: &Path) -> Result<Self, CatalogError> {
        let mut section_dirs = sorted_entries(root)?
            .into_iter()
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        section_dirs.sort();

        let mut sections = Vec::with_capacity(section_dirs.len());
        for dir in section_dirs {
            sections.push(load_section(&dir)?);
        }
        sections.sort_by(|left, right| {
            left.order
                .cmp(&right.order)
                .then_with(|| left.slug.cmp(&right.slug))
        });

        let mut slugs: HashMap<String, (usize, usize)> = HashMap::new();
        for (section_index, section) in sections.iter().enumerate() {
            for (article_index, article) in section.articles.iter().enumerate() {
                if let Some((previous_section, previous_article)) =
                    slugs.insert(article.slug.clone(), (section_index, article_index))
                {
                    let first = sections[previous_section].articles[previous_article]
                        .source_path
                        .clone();
                    return Err(CatalogError::DuplicateSlug {
                        slug: article.slug.clone(),
                        first,
                        second: article.source_path.clone(),
                    });
                }
            }
        }

        tracing::info!(
            target: "agentlearn.catalog",
            root = %root.display(),
            sections = sections.len(),
            articles = slugs.len(),
            "content catalog indexed",
        );

        Ok(Self {
            root: root.to_path_buf(),
            sections,
            slugs,
            loaded: true,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, slug: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.slug == slug)
    }

    /// Metadata-only lookup. Never touches the article file.
    pub fn resolve(&self, slug: &str) -> Result<&ArticleMeta, CatalogError> {
        self.slugs
            .get(slug.trim())
            .and_then(|(section, article)| self.sections.get(*section)?.articles.get(*article))
            .ok_or_else(|| CatalogError::NotFound {
                slug: slug.trim().to_string(),
            })
    }

    /// First article in the same section ordered after `article`.
    pub fn next_article(&self, article: &ArticleMeta) -> Option<&ArticleMeta> {
        self.section(&article.section)?
            .articles
            .iter()
            .find(|candidate| candidate.order > article.order)
    }

    pub fn stats(&self) -> CatalogStats {
        let (free, premium) = self
            .sections
            .iter()
            .flat_map(|section| section.articles.iter())
            .fold((0, 0), |(free, premium), article| {
                if article.sensitivity.is_restricted() {
                    (free, premium + 1)
                } else {
                    (free + 1, premium)
                }
            });
        CatalogStats {
            total: free + premium,
            free,
            premium,
            sections: self.sections.len(),
        }
    }

    /// Reads the markdown body of an already-resolved article, without its
    /// frontmatter.
    pub async fn load_body(&self, article: &ArticleMeta) -> Result<String, CatalogError> {
        let raw = tokio::fs::read_to_string(&article.source_path)
            .await
            .map_err(|source| CatalogError::Io {
                path: article.source_path.clone(),
                source,
            })?;
        let (_, body) = split_frontmatter(&raw);
        Ok(body.to_string())
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let entries = fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn load_section(dir: &Path) -> Result<Section, CatalogError> {
    let slug = file_name(dir);
    let category_path = dir.join(CATEGORY_FILE);
    let category = match fs::read_to_string(&category_path) {
        Ok(raw) => serde_json::from_str::<CategoryFile>(&raw).map_err(|error| {
            CatalogError::Frontmatter {
                path: category_path.clone(),
                message: error.to_string(),
            }
        })?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => CategoryFile::default(),
        Err(source) => {
            return Err(CatalogError::Io {
                path: category_path,
                source,
            });
        }
    };

    let mut articles = Vec::new();
    for path in sorted_entries(dir)? {
        let name = file_name(&path);
        if !path.is_file() || name.starts_with('_') || !name.ends_with(".md") {
            continue;
        }
        articles.push(load_article_meta(&path, &slug)?);
    }
    articles.sort_by(|left, right| {
        left.order
            .cmp(&right.order)
            .then_with(|| left.slug.cmp(&right.slug))
    });

    Ok(Section {
        name: category.name.unwrap_or_else(|| slug.clone()),
        description: category.description.unwrap_or_default(),
        icon: category.icon.unwrap_or_default(),
        order: category.order.unwrap_or(DEFAULT_ARTICLE_ORDER),
        slug,
        articles,
    })
}

fn load_article_meta(path: &Path, section: &str) -> Result<ArticleMeta, CatalogError> {
    let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let slug = slug_from_file_name(&file_name(path));

    let (frontmatter, _) = split_frontmatter(&raw);
    let data = match frontmatter {
        Some(block) if !block.trim().is_empty() => serde_yaml::from_str::<YamlValue>(block)
            .map_err(|error| CatalogError::Frontmatter {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?,
        _ => YamlValue::Null,
    };

    let is_premium = data.get("isPremium").and_then(YamlValue::as_bool) == Some(true);
    let tags = data
        .get("tags")
        .and_then(YamlValue::as_sequence)
        .map(|items| {
            items
                .iter()
                .filter_map(YamlValue::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ArticleMeta {
        title: yaml_string(&data, "title").unwrap_or_else(|| slug.clone()),
        excerpt: yaml_string(&data, "excerpt").unwrap_or_default(),
        sensitivity: Sensitivity::from_premium_flag(is_premium),
        is_premium,
        order: data
            .get("order")
            .and_then(yaml_integer)
            .unwrap_or(DEFAULT_ARTICLE_ORDER),
        reading_time: data
            .get("readingTime")
            .and_then(yaml_integer)
            .and_then(|minutes| u32::try_from(minutes).ok())
            .unwrap_or(DEFAULT_READING_TIME_MINUTES),
        tags,
        video: yaml_string(&data, "video"),
        section: section.to_string(),
        source_path: path.to_path_buf(),
        slug,
    })
}

fn yaml_string(data: &YamlValue, key: &str) -> Option<String> {
    data.get(key)
        .and_then(YamlValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn yaml_integer(value: &YamlValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|number| number as i64))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `01-what-is-an-agent.md` -> `what-is-an-agent`.
fn slug_from_file_name(file_name: &str) -> String {
    let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
    let digits = stem.bytes().take_while(u8::is_ascii_digit).count();
    match stem[digits..].strip_prefix('-') {
        Some(rest) if digits > 0 => rest.to_string(),
        _ => stem.to_string(),
    }
}

/// Splits a leading `---` delimited YAML block from the markdown body.
fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (None, raw);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(block), body);
        }
        offset += line.len();
    }
    (None, raw)
}
