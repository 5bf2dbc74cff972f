use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{ActionResult, DnsRecord, DnsZone};

pub use cloudflare::{CloudflareProvider, CLOUDFLARE_PROVIDER_ID};
pub use manual::{ManualProvider, MANUAL_PROVIDER_ID};
pub use registry::{provider_factory, DnsProviderRegistry, ProviderContext, ProviderFactory};

mod cloudflare;
mod manual;
mod registry;

/// Marker a provider puts in a result message when a human has to act.
pub const ACTION_REQUIRED: &str = "[Action Required]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    #[default]
    Internal,
    Manual,
    CustomScript,
    PythonHelper,
    PowerShell,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderParameter {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_required: bool,
    /// Supplied from the credentials store rather than the challenge config.
    #[serde(default)]
    pub is_credential: bool,
}

impl ProviderParameter {
    pub fn credential(key: &str, name: &str) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            is_required: true,
            is_credential: true,
            ..Default::default()
        }
    }

    pub fn optional(key: &str, name: &str) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Static description of a DNS provider; the registry is a table of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub help_url: String,
    pub propagation_delay_seconds: i32,
    #[serde(default)]
    pub parameters: Vec<ProviderParameter>,
    #[serde(default)]
    pub handler_type: HandlerType,
    #[serde(default = "default_true")]
    pub is_test_mode_supported: bool,
    /// Dry runs must create the real `_acme-challenge` record (e.g. CNAME-delegated setups).
    #[serde(default)]
    pub requires_real_record_name: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            help_url: String::new(),
            propagation_delay_seconds: 0,
            parameters: vec![],
            handler_type: HandlerType::default(),
            is_test_mode_supported: default_true(),
            requires_real_record_name: false,
        }
    }
}

/// A DNS API capable of creating and removing TXT records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn definition(&self) -> &ProviderDefinition;

    fn provider_id(&self) -> &str {
        &self.definition().id
    }

    fn provider_title(&self) -> &str {
        &self.definition().title
    }

    fn propagation_delay_seconds(&self) -> i32 {
        self.definition().propagation_delay_seconds
    }

    fn is_test_mode_supported(&self) -> bool {
        self.definition().is_test_mode_supported
    }

    fn provider_parameters(&self) -> &[ProviderParameter] {
        &self.definition().parameters
    }

    /// Prepare the provider for use; `false` means it cannot be used with these settings.
    async fn init(&mut self) -> Result<bool>;

    async fn create_record(&self, record: &DnsRecord) -> Result<ActionResult>;

    async fn delete_record(&self, record: &DnsRecord) -> Result<ActionResult>;

    async fn get_zones(&self) -> Result<Vec<DnsZone>>;

    async fn test(&self) -> Result<ActionResult>;
}
