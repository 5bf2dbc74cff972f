use anyhow::Result;
use async_trait::async_trait;

use super::{DnsProvider, HandlerType, ProviderDefinition, ACTION_REQUIRED};
use crate::model::{ActionResult, DnsRecord, DnsZone};

pub const MANUAL_PROVIDER_ID: &str = "DNS01.Manual";

/// Asks a human to create the record; nothing is changed automatically.
pub struct ManualProvider {
    definition: ProviderDefinition,
}

impl ManualProvider {
    pub fn provider_definition() -> ProviderDefinition {
        ProviderDefinition {
            id: MANUAL_PROVIDER_ID.into(),
            title: "(Update DNS Manually)".into(),
            description: "When a DNS update is required, you will be prompted to create the TXT record yourself.".into(),
            propagation_delay_seconds: -1,
            handler_type: HandlerType::Manual,
            is_test_mode_supported: false,
            ..Default::default()
        }
    }

    pub fn new() -> Self {
        Self {
            definition: Self::provider_definition(),
        }
    }
}

impl Default for ManualProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsProvider for ManualProvider {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    async fn init(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn create_record(&self, record: &DnsRecord) -> Result<ActionResult> {
        Ok(ActionResult::ok(format!(
            "{ACTION_REQUIRED} Please create a DNS TXT record named {} with the value {}. \
             Once the record is visible in DNS, resume this request.",
            record.record_name, record.record_value
        )))
    }

    async fn delete_record(&self, record: &DnsRecord) -> Result<ActionResult> {
        Ok(ActionResult::ok(format!(
            "The DNS TXT record {} can now be removed.",
            record.record_name
        )))
    }

    async fn get_zones(&self) -> Result<Vec<DnsZone>> {
        Ok(vec![])
    }

    async fn test(&self) -> Result<ActionResult> {
        Ok(ActionResult::ok("Manual DNS updates need no connectivity test."))
    }
}
