use std::fs;
use std::io::Read;
use std::path::PathBuf;

use agentlearn_entitlements::sign_payload;
use agentlearn_service::catalog::ContentCatalog;
use agentlearn_service::config::Config;
use agentlearn_service::identity::SessionTokenCodec;
use anyhow::{Context, Result, bail};
use chrono::{Duration, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentlearn-ops")]
#[command(about = "Operator commands for the agentlearn service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "session:issue-token")]
    IssueToken(IssueTokenArgs),
    #[command(name = "billing:sign-event")]
    SignEvent(SignEventArgs),
    #[command(name = "content:stats")]
    ContentStats(ContentStatsArgs),
}

#[derive(Args)]
struct IssueTokenArgs {
    user_id: String,
    email: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value_t = 60)]
    minutes: i64,
    #[arg(long)]
    signing_key: Option<String>,
}

#[derive(Args)]
struct SignEventArgs {
    /// JSON event body; reads stdin when omitted.
    payload: Option<PathBuf>,
    #[arg(long)]
    secret: Option<String>,
    #[arg(long)]
    timestamp: Option<i64>,
}

#[derive(Args)]
struct ContentStatsArgs {
    #[arg(long)]
    content_dir: Option<PathBuf>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::IssueToken(args) => run_issue_token(args),
        Commands::SignEvent(args) => run_sign_event(args),
        Commands::ContentStats(args) => run_content_stats(args),
    }
}

fn run_issue_token(args: IssueTokenArgs) -> Result<()> {
    if args.minutes < 1 || args.minutes > 10_080 {
        bail!("--minutes must be between 1 and 10080");
    }

    let config = Config::from_env().context("failed to load service config from environment")?;
    let codec = SessionTokenCodec::new(resolve_signing_key(
        args.signing_key.as_deref(),
        config.session_signing_key.as_deref(),
    ));

    let now = Utc::now();
    let token = codec
        .issue(
            &args.user_id,
            &args.email,
            args.name.as_deref(),
            Duration::minutes(args.minutes),
            now,
        )
        .context("failed to issue token; is AGENTLEARN_SESSION_SIGNING_KEY set?")?;

    println!("{token}");
    println!();
    println!("metadata:");
    println!("  user_id={}", args.user_id.trim());
    println!("  email={}", args.email.trim().to_lowercase());
    println!(
        "  expires_at={}",
        (now + Duration::minutes(args.minutes)).to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if config.is_admin_email(&args.email) {
        println!("  role=admin");
    }

    Ok(())
}

fn run_sign_event(args: SignEventArgs) -> Result<()> {
    let payload = match &args.payload {
        Some(path) => fs::read(path).with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .context("failed to read payload from stdin")?;
            buffer
        }
    };
    serde_json::from_slice::<serde_json::Value>(&payload).context("payload is not valid JSON")?;

    let secret = match args.secret.and_then(|secret| non_empty(&secret)) {
        Some(secret) => secret,
        None => Config::from_env()
            .context("failed to load service config from environment")?
            .stripe_webhook_secret
            .context("--secret or STRIPE_WEBHOOK_SECRET is required")?,
    };

    let timestamp = args.timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let header = sign_payload(&payload, &secret, timestamp).context("failed to sign payload")?;
    println!("stripe-signature: {header}");
    Ok(())
}

fn run_content_stats(args: ContentStatsArgs) -> Result<()> {
    let content_dir = match args.content_dir {
        Some(path) => path,
        None => {
            Config::from_env()
                .context("failed to load service config from environment")?
                .content_dir
        }
    };

    let catalog = ContentCatalog::load(&content_dir)
        .with_context(|| format!("failed to load catalog from {}", content_dir.display()))?;
    let stats = catalog.stats();

    println!("content_dir={}", content_dir.display());
    println!(
        "articles={} free={} premium={} sections={}",
        stats.total, stats.free, stats.premium, stats.sections
    );
    for section in catalog.sections() {
        println!(
            "  {} ({}): {} articles",
            section.slug,
            section.name,
            section.articles.len()
        );
    }

    Ok(())
}

/// `--signing-key` wins over the configured key; blank values count as unset.
fn resolve_signing_key(cli_key: Option<&str>, configured: Option<&str>) -> Option<String> {
    cli_key
        .and_then(non_empty)
        .or_else(|| configured.and_then(non_empty))
}

fn non_empty(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_signing_key_overrides_configured_key() {
        assert_eq!(
            resolve_signing_key(Some("cli-key"), Some("env-key")).as_deref(),
            Some("cli-key")
        );
        assert_eq!(
            resolve_signing_key(Some("  "), Some("env-key")).as_deref(),
            Some("env-key")
        );
        assert_eq!(resolve_signing_key(None, Some(" ")), None);
    }

    #[test]
    fn issued_token_verifies_with_the_resolved_key() {
        let key = resolve_signing_key(None, Some("ops-test-key"));
        let codec = SessionTokenCodec::new(key);
        let now = Utc::now();
        let token = codec
            .issue("usr_ops", "Ops@AgentLearn.test", None, Duration::minutes(5), now)
            .expect("issue token");
        let claims = codec.verify(&token, now).expect("verify token");
        assert_eq!(claims.email, "ops@agentlearn.test");
    }
}
