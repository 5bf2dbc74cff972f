//! Network checks used before and during challenge preparation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::{error::ResolveErrorKind, TokioAsyncResolver};
use reqwest::Client;
use tracing::debug;

/// Fetches a challenge resource the way the CA would.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// `true` when `url` answers with a success status and, if given, a body equal to `expected`.
    async fn check_url(&self, url: &str, expected: Option<&str>) -> Result<bool>;
}

pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceProbe for HttpProbe {
    async fn check_url(&self, url: &str, expected: Option<&str>) -> Result<bool> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(url, %status, "challenge resource not served");
            return Ok(false);
        }
        let body = response.text().await?;
        Ok(expected.map_or(true, |expected| body.trim() == expected))
    }
}

/// Answers whether a domain currently resolves.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// `Ok(false)` when the name has no address records.
    async fn resolves(&self, domain: &str) -> Result<bool>;
}

/// Resolver using the host's DNS configuration.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().context("failed to create dns resolver")?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DomainResolver for SystemResolver {
    async fn resolves(&self, domain: &str) -> Result<bool> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(err).with_context(|| format!("failed to resolve {domain}")),
            },
        }
    }
}
