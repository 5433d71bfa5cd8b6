//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults. Every
//! field carries a default, so the gateway starts with no file at all. The
//! API key is taken from the API_KEY env var only, never from the TOML,
//! and lives in a `common::Secret` so it cannot leak through logs.

use cloudcode::ApiConfig;
use common::Secret;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub api: ApiSection,
    pub storage: StorageConfig,
    pub defaults: GenerationDefaults,
    pub rotation: RotationConfig,
    /// Bearer guard for `/v1/*`; absent means the surface is open.
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

/// Listener settings for the two HTTP surfaces.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API binds loopback unless deployed behind its own access
    /// control.
    pub admin_addr: SocketAddr,
    pub max_connections: usize,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8045),
            admin_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090),
            max_connections: 1000,
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Upstream endpoint overrides. The eligibility probe keeps its stock URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub url: String,
    pub no_stream_url: String,
    pub models_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        let api = ApiConfig::default();
        Self {
            url: api.stream_url,
            no_stream_url: api.generate_url,
            models_url: api.models_url,
            user_agent: api.user_agent,
            timeout_secs: api.timeout.as_secs(),
        }
    }
}

impl ApiSection {
    pub fn to_api_config(&self) -> ApiConfig {
        ApiConfig {
            stream_url: self.url.clone(),
            generate_url: self.no_stream_url.clone(),
            models_url: self.models_url.clone(),
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            ..ApiConfig::default()
        }
    }
}

/// Locations of the durable credential and quota files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub accounts_path: PathBuf,
    pub quotas_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            accounts_path: PathBuf::from("data/accounts.json"),
            quotas_path: PathBuf::from("data/quotas.json"),
        }
    }
}

/// Sampling parameters applied when a chat request leaves them unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.85,
            top_k: 50,
            max_tokens: 8096,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Skip the eligibility probe and synthesize project ids instead.
    pub skip_eligibility_check: bool,
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. A missing file yields the defaults; an unreadable or
    /// invalid one is an error.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&contents)?
        } else {
            Config::default()
        };

        for (field, url) in [
            ("api.url", &config.api.url),
            ("api.no_stream_url", &config.api.no_stream_url),
            ("api.models_url", &config.api.models_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.server.max_body_bytes == 0 {
            return Err(common::Error::Config(
                "max_body_bytes must be greater than 0".into(),
            ));
        }

        if let Ok(key) = std::env::var("API_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.api_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-gateway.toml")
    }
}
