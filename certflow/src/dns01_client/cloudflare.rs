use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{DnsProvider, ProviderContext, ProviderDefinition, ProviderParameter};
use crate::model::{ActionResult, DnsRecord, DnsZone};

pub const CLOUDFLARE_PROVIDER_ID: &str = "DNS01.API.Cloudflare";

const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
    name: String,
    content: String,
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Response<T> {
    result: T,
}

/// Cloudflare DNS API with a scoped API token.
pub struct CloudflareProvider {
    definition: ProviderDefinition,
    api_url: String,
    api_token: String,
    zone_id: Option<String>,
    client: Client,
}

impl CloudflareProvider {
    pub fn provider_definition() -> ProviderDefinition {
        ProviderDefinition {
            id: CLOUDFLARE_PROVIDER_ID.into(),
            title: "Cloudflare DNS API".into(),
            description: "Validates via Cloudflare DNS APIs using an API token".into(),
            help_url: "https://developers.cloudflare.com/fundamentals/api/get-started/create-token/".into(),
            propagation_delay_seconds: 60,
            parameters: vec![
                ProviderParameter::credential("api_token", "API Token"),
                ProviderParameter::optional("zoneid", "DNS Zone Id"),
            ],
            ..Default::default()
        }
    }

    pub fn from_context(ctx: ProviderContext) -> Result<Self> {
        let api_token = ctx
            .credentials
            .get("api_token")
            .cloned()
            .context("Cloudflare API token is missing")?;
        Ok(Self {
            definition: ctx.definition,
            api_url: CLOUDFLARE_API_URL.into(),
            api_token,
            zone_id: ctx.parameters.get("zoneid").cloned(),
            client: Client::new(),
        })
    }

    fn zone_for(&self, record: &DnsRecord) -> Result<String> {
        record
            .zone_id
            .clone()
            .or_else(|| self.zone_id.clone())
            .filter(|z| !z.trim().is_empty())
            .context("Cloudflare zone id is not configured")
    }

    async fn txt_records(&self, zone_id: &str, name: &str) -> Result<Vec<Record>> {
        let url = format!("{}/zones/{}/dns_records", self.api_url, zone_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(&[("type", "TXT"), ("name", name)])
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("failed to get dns records: {}", response.text().await?);
        }
        let response: Response<Vec<Record>> =
            response.json().await.context("failed to parse response")?;
        Ok(response
            .result
            .into_iter()
            .filter(|r| r.r#type == "TXT" && r.name.eq_ignore_ascii_case(name))
            .collect())
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    async fn init(&mut self) -> Result<bool> {
        Ok(!self.api_token.trim().is_empty())
    }

    async fn create_record(&self, record: &DnsRecord) -> Result<ActionResult> {
        let zone_id = self.zone_for(record)?;
        if self
            .txt_records(&zone_id, &record.record_name)
            .await?
            .iter()
            .any(|r| r.content.trim_matches('"') == record.record_value)
        {
            return Ok(ActionResult::ok("DNS record already exists"));
        }
        let url = format!("{}/zones/{}/dns_records", self.api_url, zone_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({
                "type": "TXT",
                "name": record.record_name,
                "content": record.record_value,
                "ttl": 120
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("failed to create acme challenge: {}", response.text().await?);
        }
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let response: Response<Created> =
            response.json().await.context("failed to parse response")?;
        debug!("created TXT record {} ({})", record.record_name, response.result.id);
        Ok(ActionResult::ok(format!(
            "DNS record added: {}",
            record.record_name
        )))
    }

    async fn delete_record(&self, record: &DnsRecord) -> Result<ActionResult> {
        let zone_id = self.zone_for(record)?;
        let matching = self
            .txt_records(&zone_id, &record.record_name)
            .await?
            .into_iter()
            .filter(|r| r.content.trim_matches('"') == record.record_value);
        for existing in matching {
            let url = format!(
                "{}/zones/{}/dns_records/{}",
                self.api_url, zone_id, existing.id
            );
            let response = self
                .client
                .delete(&url)
                .bearer_auth(&self.api_token)
                .send()
                .await?;
            if !response.status().is_success() {
                bail!("failed to remove acme challenge: {}", response.text().await?);
            }
        }
        Ok(ActionResult::ok(format!(
            "DNS record removed: {}",
            record.record_name
        )))
    }

    async fn get_zones(&self) -> Result<Vec<DnsZone>> {
        let url = format!("{}/zones", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("failed to list zones: {}", response.text().await?);
        }
        let response: Response<Vec<Zone>> =
            response.json().await.context("failed to parse response")?;
        Ok(response
            .result
            .into_iter()
            .map(|z| DnsZone {
                zone_id: z.id,
                name: z.name,
            })
            .collect())
    }

    async fn test(&self) -> Result<ActionResult> {
        let url = format!("{}/user/tokens/verify", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(ActionResult::ok("Cloudflare API token is valid"))
        } else {
            Ok(ActionResult::fail(format!(
                "Cloudflare API token check failed: {}",
                response.text().await?
            )))
        }
    }
}
