//! Dry runs of challenge preparation against simulated challenges, so configuration
//! problems show up before a real order is spent.

use std::{collections::HashSet, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    challenge::{reject_wildcard_http, ChallengeResponder, CONFIG_CHECK_CONTENT, CONFIG_CHECK_FILE},
    config::PreflightSettings,
    crypto::simulated_key_auth,
    model::{
        AuthorizationChallengeItem, ChallengeType, Cleanup, Identifier, IdentifierType,
        ManagedCertificate, StatusMessage,
    },
    probe::DomainResolver,
};

const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

pub struct PreflightDiagnostics {
    responder: Arc<ChallengeResponder>,
    resolver: Option<Arc<dyn DomainResolver>>,
    settings: PreflightSettings,
}

impl PreflightDiagnostics {
    pub fn new(responder: Arc<ChallengeResponder>, settings: PreflightSettings) -> Self {
        Self {
            responder,
            resolver: None,
            settings,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Check every identifier of `managed` without contacting the CA.
    ///
    /// The first failing http-01 check stops the run; dns-01 checks are independent.
    /// Simulated artifacts are always removed before returning.
    pub async fn test_challenge_response(
        &self,
        managed: &ManagedCertificate,
        check_dns: bool,
    ) -> Vec<StatusMessage> {
        let request = &managed.request;
        if request.primary_domain.trim().is_empty() {
            return vec![StatusMessage::fail(
                "There is no primary domain set for this certificate.",
            )];
        }
        let identifiers = match request.identifiers() {
            Ok(identifiers) => identifiers,
            Err(err) => return vec![StatusMessage::fail(format!("{err:#}"))],
        };
        if let Some(msg) = mixed_wildcard(&identifiers) {
            return vec![StatusMessage::fail(msg)];
        }

        let mut results = vec![];
        if check_dns {
            results.extend(self.resolve_all(&identifiers).await);
        }

        let mut cleanup = Cleanup::default();
        for identifier in &identifiers {
            let domain = identifier.value.as_str();
            let config = request.challenge_config(domain);
            let mut kind = config.kind();
            if identifier.kind == IdentifierType::TnAuthList || kind == ChallengeType::TkAuth01 {
                debug!(identifier = %domain, "authority tokens are not tested");
                continue;
            }
            if kind == ChallengeType::TlsSni01 {
                warn!("tls-sni-01 is no longer offered by CAs, testing http-01 instead");
                results.push(StatusMessage::warning(format!(
                    "tls-sni-01 is not supported for {domain}; http-01 was tested instead."
                )));
                kind = ChallengeType::Http01;
            }

            match kind {
                ChallengeType::Http01 => {
                    if let Err(err) = reject_wildcard_http(domain) {
                        results.push(StatusMessage::fail(err.to_string()));
                        break;
                    }
                    let item = AuthorizationChallengeItem {
                        challenge_type: Some(ChallengeType::Http01),
                        key: CONFIG_CHECK_FILE.into(),
                        value: CONFIG_CHECK_CONTENT.into(),
                        resource_path: Some(format!("{CHALLENGE_DIR}/{CONFIG_CHECK_FILE}")),
                        resource_uri: Some(format!(
                            "http://{domain}/{CHALLENGE_DIR}/{CONFIG_CHECK_FILE}"
                        )),
                        ..Default::default()
                    };
                    let status = self
                        .responder
                        .prepare_http(managed, domain, &config, &item, &mut cleanup)
                        .await
                        .unwrap_or_else(|err| StatusMessage::fail(err.to_string()));
                    let failed = !status.is_ok;
                    results.push(status);
                    if failed {
                        warn!(domain, "http-01 check failed, skipping remaining checks");
                        break;
                    }
                }
                ChallengeType::Dns01 => {
                    let real_name = config
                        .challenge_provider
                        .as_deref()
                        .and_then(|id| self.responder.registry().definition(id))
                        .is_some_and(|d| d.requires_real_record_name);
                    let base = domain.trim_start_matches("*.");
                    let record_name = if real_name {
                        format!("_acme-challenge.{base}")
                    } else {
                        format!("_acme-challenge-test.{base}")
                    };
                    let value = simulated_key_auth().dns_value;
                    let status = match self
                        .responder
                        .complete_dns(&config, domain, &record_name, &value, true, &mut cleanup)
                        .await
                    {
                        Ok(outcome) => outcome.status(),
                        Err(err) => StatusMessage::fail(err.to_string()),
                    };
                    results.push(status);
                }
                other => results.push(StatusMessage::fail(format!(
                    "Challenge type not supported: {other}"
                ))),
            }
        }

        debug!("running {} preflight cleanups", cleanup.len());
        cleanup.run().await;
        info!(
            name = %managed.name,
            failed = results.iter().filter(|r| !r.is_ok).count(),
            "preflight finished"
        );
        results
    }

    /// Resolve every DNS identifier, at most `max_concurrent_lookups` at a time.
    /// Names that do not resolve are warnings.
    async fn resolve_all(&self, identifiers: &[Identifier]) -> Vec<StatusMessage> {
        let Some(resolver) = self.resolver.clone() else {
            return vec![];
        };
        let mut seen = HashSet::new();
        let domains: Vec<String> = identifiers
            .iter()
            .filter(|i| i.kind == IdentifierType::Dns)
            .map(|i| i.value.trim_start_matches("*.").to_string())
            .filter(|d| seen.insert(d.clone()))
            .collect();

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_lookups.max(1)));
        let mut join_set = JoinSet::new();
        for (index, domain) in domains.into_iter().enumerate() {
            let resolver = resolver.clone();
            let permits = permits.clone();
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let status = match resolver.resolves(&domain).await {
                    Ok(true) => StatusMessage::ok(format!("{domain} resolves")),
                    Ok(false) => {
                        StatusMessage::warning(format!("{domain} does not resolve to an address"))
                    }
                    Err(err) => {
                        StatusMessage::warning(format!("DNS lookup for {domain} failed: {err:#}"))
                    }
                };
                (index, status)
            });
        }

        let mut results = vec![];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!("dns check task failed: {err}"),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, status)| status).collect()
    }
}

/// `*.example.com` cannot be combined with `www.example.com`, only with deeper or
/// unrelated names.
fn mixed_wildcard(identifiers: &[Identifier]) -> Option<String> {
    for wildcard in identifiers.iter().filter(|i| i.is_wildcard()) {
        let suffix = wildcard.value.trim_start_matches('*');
        let labels = wildcard.value.matches('.').count();
        let clash = identifiers.iter().find(|i| {
            i.kind == IdentifierType::Dns
                && i.value != wildcard.value
                && i.value.ends_with(suffix)
                && i.value.matches('.').count() == labels
        });
        if let Some(clash) = clash {
            return Some(format!(
                "Wildcard domain certificate requests (e.g. {wildcard}) cannot be mixed with requests including immediate subdomains (e.g. {clash})."
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests;
