use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{crypto::KeyType, error::Error, model::OutputFormat};

pub const DEFAULT_CONFIG: &str = include_str!("certflow.toml");

const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1000);
const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(20000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub acme: AcmeSettings,
    pub storage: StorageSettings,
    pub issuer_cache: IssuerCacheSettings,
    pub output: OutputSettings,
    pub http_challenge: HttpChallengeSettings,
    pub preflight: PreflightSettings,
    pub renewal: RenewalSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityMode {
    #[default]
    Standard,
    AltProvider1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub user_agent: String,
    pub allow_untrusted_tls: bool,
    #[serde(with = "serde_duration")]
    pub retry_interval: Duration,
    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub request_spacing: Duration,
    pub compatibility_mode: CompatibilityMode,
    pub challenge_status_from_authorization: bool,
    #[serde(with = "serde_duration")]
    pub account_stale_after: Duration,
}

impl AcmeSettings {
    /// Wait between polling attempts, kept within 1s..=20s.
    pub fn retry_wait(&self) -> Duration {
        self.retry_interval
            .clamp(MIN_RETRY_INTERVAL, MAX_RETRY_INTERVAL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub settings_path: PathBuf,
    #[serde(default)]
    pub legacy_settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerCacheSettings {
    pub enabled: bool,
    pub allow_unknown_roots: bool,
    #[serde(default)]
    pub trust_bundles: Vec<PathBuf>,
    /// PEM encoded well-known CA roots and intermediates.
    #[serde(default)]
    pub known_roots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub default_format: OutputFormat,
    pub modern_pfx_algorithms: bool,
    pub pfx_keep: usize,
    pub default_key_type: KeyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpChallengeSettings {
    #[serde(default)]
    pub config_templates_dir: Option<PathBuf>,
    pub config_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightSettings {
    pub max_concurrent_lookups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalSettings {
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    #[serde(with = "serde_duration")]
    pub renew_before_expiry: Duration,
}

fn merge_config_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

impl Settings {
    /// Built-in defaults, then `path` (TOML or JSON), then `CERTFLOW_*` environment overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            info!("loading config file: {}", path.display());
            figment = merge_config_file(figment, path);
        }
        figment.merge(Env::prefixed("CERTFLOW_").split("__"))
    }

    /// The built-in defaults alone.
    pub fn defaults() -> Result<Self, Error> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .extract()
            .map_err(|e| Error::ConfigInvalid(format!("invalid built-in configuration: {e}")))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        Self::figment(path)
            .extract()
            .map_err(|e| Error::ConfigInvalid(format!("invalid configuration: {e}")))
    }
}
