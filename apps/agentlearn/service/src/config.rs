use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_FORMAT: &str = "text";
const DEFAULT_CONTENT_DIR: &str = "content";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_ADMIN_EMAILS: &str = "";
const DEFAULT_DEMO_GRANT_ENABLED: bool = false;
const DEFAULT_WEBHOOK_TOLERANCE_SECONDS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_STRIPE_API_BASE_URL: &str = "https://api.stripe.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_format: String,
    pub content_dir: PathBuf,
    pub store_path: Option<PathBuf>,
    pub public_base_url: String,
    pub session_signing_key: Option<String>,
    pub admin_emails: Vec<String>,
    pub demo_grant_enabled: bool,
    pub webhook_tolerance_seconds: u64,
    pub request_timeout_ms: u64,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_api_base_url: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid AGENTLEARN_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid {name} value '{value}': expected an unsigned integer")]
    InvalidNumber { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw =
            env_non_empty("AGENTLEARN_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter =
            env_non_empty("AGENTLEARN_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let log_format = env_non_empty("AGENTLEARN_LOG_FORMAT")
            .map(|value| value.to_lowercase())
            .unwrap_or_else(|| DEFAULT_LOG_FORMAT.to_string());

        let content_dir = env_non_empty("AGENTLEARN_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_DIR));
        let store_path = env_non_empty("AGENTLEARN_STORE_PATH").map(PathBuf::from);

        let public_base_url = env_non_empty("AGENTLEARN_PUBLIC_BASE_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let session_signing_key = env_non_empty("AGENTLEARN_SESSION_SIGNING_KEY");
        let admin_emails = parse_csv(
            env_non_empty("AGENTLEARN_ADMIN_EMAILS")
                .unwrap_or_else(|| DEFAULT_ADMIN_EMAILS.to_string()),
        )
        .into_iter()
        .map(|email| email.to_lowercase())
        .collect();

        let demo_grant_enabled = env_non_empty("AGENTLEARN_DEMO_GRANT_ENABLED")
            .map(|value| parse_bool(&value))
            .unwrap_or(DEFAULT_DEMO_GRANT_ENABLED);

        let webhook_tolerance_seconds = env_u64(
            "AGENTLEARN_WEBHOOK_TOLERANCE_SECONDS",
            DEFAULT_WEBHOOK_TOLERANCE_SECONDS,
        )?;
        let request_timeout_ms =
            env_u64("AGENTLEARN_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;

        let stripe_secret_key = env_non_empty("STRIPE_SECRET_KEY");
        let stripe_webhook_secret = env_non_empty("STRIPE_WEBHOOK_SECRET");
        let stripe_price_id = env_non_empty("STRIPE_PRICE_ID");
        let stripe_api_base_url = env_non_empty("STRIPE_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bind_addr,
            log_filter,
            log_format,
            content_dir,
            store_path,
            public_base_url,
            session_signing_key,
            admin_emails,
            demo_grant_enabled,
            webhook_tolerance_seconds,
            request_timeout_ms,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_price_id,
            stripe_api_base_url,
        })
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        let normalized = email.trim().to_lowercase();
        !normalized.is_empty() && self.admin_emails.iter().any(|admin| admin == &normalized)
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests(content_dir: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_format: DEFAULT_LOG_FORMAT.to_string(),
            content_dir,
            store_path: None,
            public_base_url: "https://agentlearn.test".to_string(),
            session_signing_key: Some("session-test-signing-key".to_string()),
            admin_emails: vec!["admin@agentlearn.test".to_string()],
            demo_grant_enabled: true,
            webhook_tolerance_seconds: DEFAULT_WEBHOOK_TOLERANCE_SECONDS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            stripe_secret_key: None,
            stripe_webhook_secret: Some("whsec_agentlearn_test".to_string()),
            stripe_price_id: Some("price_pro_yearly".to_string()),
            stripe_api_base_url: DEFAULT_STRIPE_API_BASE_URL.to_string(),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_non_empty(key) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { name: key, value }),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_csv(value: String) -> Vec<String> {
    value
        .split(',')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}
