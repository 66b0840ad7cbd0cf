use std::env;
use std::path::PathBuf;
use std::time::Duration;

use nexus_client::Credentials;

/// Default listen port
const DEFAULT_PORT: u16 = 9900;

/// Default per-request body limit (one upload chunk)
const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024 * 1024;

/// Remote tier settings
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Full repository URL, e.g. `https://nexus/repository/gh-cache/act-cache`
    pub store_endpoint: String,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl NexusConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.secret) {
            (Some(username), Some(secret)) => Some(Credentials::new(username, secret)),
            (Some(username), None) => Some(Credentials::new(username, "")),
            _ => None,
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Holds the metadata database and the blob directory
    pub cache_dir: PathBuf,
    /// Base URL clients use to reach this server
    pub external_url: String,
    pub max_body_size: usize,
    /// Remote tier; disabled when `NEXUS_STORE_ENDPOINT` is unset
    pub nexus: Option<NexusConfig>,
}

impl Config {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Parse configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);

        let external_url = lookup("EXTERNAL_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let max_body_size = lookup("MAX_BODY_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_BODY_SIZE);

        let nexus = lookup("NEXUS_STORE_ENDPOINT")
            .filter(|s| !s.is_empty())
            .map(|store_endpoint| NexusConfig {
                store_endpoint,
                username: lookup("NEXUS_USERNAME"),
                secret: lookup("NEXUS_SECRET"),
                timeout: Duration::from_secs(
                    lookup("NEXUS_TIMEOUT_SECS")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(30),
                ),
            });

        Self {
            port,
            cache_dir,
            external_url,
            max_body_size,
            nexus,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("actcache")
}
