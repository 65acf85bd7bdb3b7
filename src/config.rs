use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Upload and quota limits shared by the services.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Quota assigned to an account the first time it is seen.
    pub default_quota_bytes: u64,
    /// Largest single document accepted, chunked or not.
    pub max_file_size: u64,
    /// Lower-case extensions accepted for upload.
    pub allowed_extensions: Vec<String>,
    /// Idle time after the last accepted chunk before a session expires.
    pub session_ttl: Duration,
    /// Hard cap on a session's lifetime regardless of activity.
    pub max_session_lifetime: Duration,
    /// Upper bound on concurrently running batch items.
    pub batch_concurrency: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            default_quota_bytes: GIB,
            max_file_size: 100 * MIB,
            allowed_extensions: ["pdf", "doc", "docx", "txt"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            session_ttl: Duration::from_secs(60 * 60),
            max_session_lifetime: Duration::from_secs(24 * 60 * 60),
            batch_concurrency: 4,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub spool_dir: String,
    pub database_url: String,
    pub sweep_interval: Duration,
    pub limits: UploadLimits,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Document store with chunked uploads and per-user quotas")]
pub struct Args {
    /// Host to bind to (overrides DOC_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOC_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where document payloads are stored (overrides DOC_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for in-flight chunks (overrides DOC_STORE_SPOOL_DIR)
    #[arg(long)]
    pub spool_dir: Option<String>,

    /// Database URL (overrides DOC_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default per-user quota in bytes (overrides DOC_STORE_DEFAULT_QUOTA)
    #[arg(long)]
    pub default_quota: Option<u64>,

    /// Maximum document size in bytes (overrides DOC_STORE_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Comma-separated list of accepted extensions (overrides DOC_STORE_ALLOWED_EXTENSIONS)
    #[arg(long)]
    pub allowed_extensions: Option<String>,

    /// Idle seconds before a chunked upload expires (overrides DOC_STORE_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Hard session lifetime in seconds (overrides DOC_STORE_MAX_SESSION_LIFETIME_SECS)
    #[arg(long)]
    pub max_session_lifetime_secs: Option<u64>,

    /// Seconds between expiry sweeps (overrides DOC_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Concurrent items per batch request (overrides DOC_STORE_BATCH_CONCURRENCY)
    #[arg(long)]
    pub batch_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = UploadLimits::default();

        // --- Environment fallback ---
        let env_host = env::var("DOC_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("DOC_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("DOC_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_spool = env::var("DOC_STORE_SPOOL_DIR").unwrap_or_else(|_| "./data/spool".into());
        let env_db = env::var("DOC_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/doc_store.db".into());
        let env_quota = env_or("DOC_STORE_DEFAULT_QUOTA", defaults.default_quota_bytes)?;
        let env_max_file = env_or("DOC_STORE_MAX_FILE_SIZE", defaults.max_file_size)?;
        let env_extensions = env::var("DOC_STORE_ALLOWED_EXTENSIONS").ok();
        let env_ttl = env_or("DOC_STORE_SESSION_TTL_SECS", defaults.session_ttl.as_secs())?;
        let env_lifetime = env_or(
            "DOC_STORE_MAX_SESSION_LIFETIME_SECS",
            defaults.max_session_lifetime.as_secs(),
        )?;
        let env_sweep = env_or("DOC_STORE_SWEEP_INTERVAL_SECS", 60u64)?;
        let env_batch = env_or("DOC_STORE_BATCH_CONCURRENCY", defaults.batch_concurrency)?;

        // --- Merge ---
        let allowed_extensions = args
            .allowed_extensions
            .or(env_extensions)
            .map(|raw| parse_extensions(&raw))
            .unwrap_or(defaults.allowed_extensions);

        let limits = UploadLimits {
            default_quota_bytes: args.default_quota.unwrap_or(env_quota),
            max_file_size: args.max_file_size.unwrap_or(env_max_file),
            allowed_extensions,
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
            max_session_lifetime: Duration::from_secs(
                args.max_session_lifetime_secs.unwrap_or(env_lifetime),
            ),
            batch_concurrency: args.batch_concurrency.unwrap_or(env_batch).max(1),
        };

        if limits.default_quota_bytes == 0 {
            anyhow::bail!("default quota must be greater than zero");
        }

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            spool_dir: args.spool_dir.unwrap_or(env_spool),
            database_url: args.database_url.unwrap_or(env_db),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep).max(1)),
            limits,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_normalized() {
        assert_eq!(
            parse_extensions(" PDF, .docx,,txt "),
            vec!["pdf".to_string(), "docx".to_string(), "txt".to_string()]
        );
    }

    #[test]
    fn default_limits_match_documented_values() {
        let limits = UploadLimits::default();
        assert_eq!(limits.default_quota_bytes, 1024 * 1024 * 1024);
        assert_eq!(limits.max_file_size, 100 * 1024 * 1024);
        assert!(limits.session_ttl < limits.max_session_lifetime);
    }
}
