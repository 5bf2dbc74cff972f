use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use tracing::{debug, warn};

use super::{CloudflareProvider, DnsProvider, ManualProvider, ProviderDefinition};
use crate::error::Error;

/// Everything a factory needs to build one provider instance.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub definition: ProviderDefinition,
    pub credentials: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
}

pub type ProviderFactory =
    Arc<dyn Fn(ProviderContext) -> Result<Box<dyn DnsProvider>> + Send + Sync>;

/// Wrap a constructor closure as a [`ProviderFactory`].
pub fn provider_factory<F>(f: F) -> ProviderFactory
where
    F: Fn(ProviderContext) -> Result<Box<dyn DnsProvider>> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Registered {
    definition: ProviderDefinition,
    factory: ProviderFactory,
}

/// Provider catalog, built once at startup and passed to whoever needs it.
#[derive(Default)]
pub struct DnsProviderRegistry {
    providers: HashMap<String, Registered>,
}

impl DnsProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers that ship with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            ManualProvider::provider_definition(),
            provider_factory(|_| Ok(Box::new(ManualProvider::new()))),
        );
        registry.register(
            CloudflareProvider::provider_definition(),
            provider_factory(|ctx| Ok(Box::new(CloudflareProvider::from_context(ctx)?))),
        );
        registry
    }

    pub fn register(&mut self, definition: ProviderDefinition, factory: ProviderFactory) {
        let key = definition.id.to_lowercase();
        if self.providers.contains_key(&key) {
            warn!("replacing DNS provider registration {}", definition.id);
        }
        self.providers.insert(
            key,
            Registered {
                definition,
                factory,
            },
        );
    }

    pub fn definition(&self, provider_id: &str) -> Option<&ProviderDefinition> {
        self.providers
            .get(&provider_id.to_lowercase())
            .map(|r| &r.definition)
    }

    pub fn definitions(&self) -> Vec<&ProviderDefinition> {
        let mut all: Vec<_> = self.providers.values().map(|r| &r.definition).collect();
        all.sort_by(|a, b| a.title.cmp(&b.title));
        all
    }

    /// Build and initialise a live provider.
    pub async fn resolve(
        &self,
        provider_id: Option<&str>,
        credentials: HashMap<String, String>,
        parameters: HashMap<String, String>,
    ) -> Result<Arc<dyn DnsProvider>, Error> {
        let provider_id = provider_id.map(str::trim).unwrap_or_default();
        if provider_id.is_empty() {
            return Err(Error::ProviderNotConfigured(
                "DNS Challenge Type is set but no DNS provider is selected.".into(),
            ));
        }
        let registered = self
            .providers
            .get(&provider_id.to_lowercase())
            .ok_or_else(|| {
                Error::ProviderNotConfigured(format!(
                    "DNS Challenge Provider {provider_id} is not recognised."
                ))
            })?;

        let definition = &registered.definition;
        let missing: Vec<&str> = definition
            .parameters
            .iter()
            .filter(|p| p.is_credential && p.is_required)
            .filter(|p| credentials.get(&p.key).map_or(true, |v| v.trim().is_empty()))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::CredentialsInvalid(format!(
                "DNS Challenge API Credentials for {} are incomplete. Missing: {}",
                definition.title,
                missing.join(", ")
            )));
        }

        let ctx = ProviderContext {
            definition: definition.clone(),
            credentials,
            parameters,
        };
        let mut provider = (registered.factory)(ctx).map_err(|e| {
            Error::CredentialsInvalid(format!(
                "DNS Challenge API Credentials for {} could not be used: {e:#}",
                definition.title
            ))
        })?;
        match provider.init().await {
            Ok(true) => {
                debug!("initialised DNS provider {}", definition.id);
                Ok(Arc::from(provider))
            }
            Ok(false) => Err(Error::ProviderNotConfigured(format!(
                "DNS Challenge Provider {} could not be initialised with the supplied settings.",
                definition.title
            ))),
            Err(e) => Err(Error::ProviderNotConfigured(format!(
                "DNS Challenge Provider {} failed to initialise: {e:#}",
                definition.title
            ))),
        }
    }
}
