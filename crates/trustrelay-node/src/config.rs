//! Node configuration loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use trustrelay_core::Keys;
use trustrelay_engine::AdmissionConfig;

/// Environment variable consulted for the oracle signing key when the config
/// file does not carry one.
pub const ORACLE_SECRET_ENV: &str = "TRUSTRELAY_ORACLE_SECRET";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub info: InfoSection,
    pub admission: AdmissionSection,
    pub oracle: OracleSection,
    pub storage: StorageSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3334".into(),
            data_dir: PathBuf::from("./data"),
            info: InfoSection::default(),
            admission: AdmissionSection::default(),
            oracle: OracleSection::default(),
            storage: StorageSection::default(),
        }
    }
}

/// Self-description served in the service descriptor and the landing page.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfoSection {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
    pub software: String,
    pub version: String,
}

impl Default for InfoSection {
    fn default() -> Self {
        Self {
            name: "trustrelay".into(),
            description: "A reputation-gated messaging relay".into(),
            pubkey: String::new(),
            contact: String::new(),
            software: "trustrelay".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    pub mid_threshold: f64,
    pub high_threshold: Option<f64>,
    pub url_policy_enabled: bool,
    pub rank_queue_ip_daily_limit: f64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        let defaults = AdmissionConfig::default();
        Self {
            mid_threshold: defaults.mid_threshold,
            high_threshold: defaults.high_threshold,
            url_policy_enabled: defaults.url_policy_enabled,
            rank_queue_ip_daily_limit: defaults.rank_queue_ip_daily_limit,
        }
    }
}

impl AdmissionSection {
    pub fn to_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            mid_threshold: self.mid_threshold,
            high_threshold: self.high_threshold,
            url_policy_enabled: self.url_policy_enabled,
            rank_queue_ip_daily_limit: self.rank_queue_ip_daily_limit,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    /// Bus URL of the relay the ranking oracle listens on. Empty disables
    /// lookups; every identity then scores 0.
    pub relay_url: String,
    /// Hex public key the oracle signs responses with.
    pub pubkey: String,
    /// Hex secret key for signing requests. Falls back to the
    /// `TRUSTRELAY_ORACLE_SECRET` environment variable, then to an
    /// ephemeral key.
    pub secret_key: Option<String>,
}

impl OracleSection {
    pub fn is_configured(&self) -> bool {
        !self.relay_url.is_empty() && !self.pubkey.is_empty()
    }

    /// Resolves the request-signing keypair: config value, then the
    /// environment, then a generated key for this run only.
    pub fn signing_keys(&self) -> anyhow::Result<Keys> {
        if let Some(secret) = self.secret_key.as_deref().filter(|s| !s.is_empty()) {
            return Keys::parse(secret)
                .map_err(|e| anyhow::anyhow!("invalid oracle.secret_key: {e}"));
        }
        if let Ok(secret) = std::env::var(ORACLE_SECRET_ENV) {
            if !secret.is_empty() {
                return Keys::parse(&secret)
                    .map_err(|e| anyhow::anyhow!("invalid {ORACLE_SECRET_ENV}: {e}"));
            }
        }
        let keys = Keys::generate();
        info!(pubkey = %keys.public_key(), "no oracle signing key configured, generated one for this session");
        Ok(keys)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub flush_on_write: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            flush_on_write: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigWrapper {
    #[serde(default)]
    node: NodeConfig,
}

/// Loads configuration from `path`. A missing file yields the defaults so a
/// bare checkout runs out of the box.
pub fn load_config(path: &str) -> anyhow::Result<NodeConfig> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, using defaults");
        return Ok(NodeConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    let wrapper: ConfigWrapper = toml::from_str(&text)?;
    let config = wrapper.node;
    config
        .admission
        .to_config()
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid [admission] config: {e}"))?;
    Ok(config)
}
