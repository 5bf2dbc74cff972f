//! Prepares the proof for each challenge type and registers its cleanup.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::HttpChallengeSettings,
    credentials::CredentialsStore,
    dns01_client::DnsProviderRegistry,
    error::{Error, Result},
    model::{ChallengeType, Cleanup, ManagedCertificate, PendingAuthorization, StatusMessage},
    probe::ResourceProbe,
    web_server::TargetWebServer,
};

pub use delegation::apply_delegation_rule;
pub use dns01::DnsChallengeOutcome;

mod delegation;
mod dns01;
mod http01;
mod tls_sni;

pub(crate) use http01::{CONFIG_CHECK_CONTENT, CONFIG_CHECK_FILE};

pub struct ChallengeResponder {
    http: HttpChallengeSettings,
    registry: Arc<DnsProviderRegistry>,
    credentials: Arc<dyn CredentialsStore>,
    probe: Arc<dyn ResourceProbe>,
    web_server: Option<Arc<dyn TargetWebServer>>,
}

impl ChallengeResponder {
    pub fn new(
        http: HttpChallengeSettings,
        registry: Arc<DnsProviderRegistry>,
        credentials: Arc<dyn CredentialsStore>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            http,
            registry,
            credentials,
            probe,
            web_server: None,
        }
    }

    pub fn with_web_server(mut self, web_server: Arc<dyn TargetWebServer>) -> Self {
        self.web_server = Some(web_server);
        self
    }

    pub fn registry(&self) -> &DnsProviderRegistry {
        &self.registry
    }

    /// Select the challenge configured for this identifier, prepare its proof and attach
    /// the matching cleanup to `authz`.
    ///
    /// Each cleanup is attached before the step that creates its artifact, so dropping
    /// this future part way still leaves `authz` able to remove what was created.
    /// Config, credential and provider problems are errors; a proof that was put in place
    /// but could not be verified is reported through the returned status.
    pub async fn prepare(
        &self,
        managed: &ManagedCertificate,
        authz: &mut PendingAuthorization,
    ) -> Result<StatusMessage> {
        let identifier = authz.identifier_value().to_string();
        let config = managed.request.challenge_config(&identifier);
        let kind = config.kind();
        if kind == ChallengeType::Http01 {
            reject_wildcard_http(&identifier)?;
        }

        let Some(mut attempted) = authz.challenge(kind).cloned() else {
            let msg = format!(
                "No {kind} challenge to complete for {}. Request cannot continue.",
                managed.name
            );
            warn!("{msg}");
            authz.authorization_error = Some(msg.clone());
            return Ok(StatusMessage::fail(msg));
        };
        info!(domain = %identifier, challenge = %kind, "preparing challenge response");

        let cleanup = authz.cleanup.get_or_insert_with(Cleanup::default);
        let status = match kind {
            ChallengeType::Http01 => {
                let status = self
                    .prepare_http(managed, &identifier, &config, &attempted, cleanup)
                    .await?;
                if managed.request.perform_extensionless_config_checks {
                    attempted.config_checked_ok = status.is_ok && !status.has_warning;
                }
                status
            }
            ChallengeType::Dns01 => {
                let outcome = self
                    .complete_dns(
                        &config,
                        &identifier,
                        &attempted.key,
                        &attempted.value,
                        false,
                        cleanup,
                    )
                    .await?;
                attempted.challenge_result_msg = Some(outcome.result.message.clone());
                attempted.is_awaiting_user = outcome.is_awaiting_user;
                attempted.propagation_seconds = outcome.propagation_seconds;
                attempted.config_checked_ok = outcome.result.is_success;
                if !outcome.result.is_success {
                    authz.authorization_error = Some(outcome.result.message.clone());
                }
                outcome.status()
            }
            ChallengeType::TlsSni01 => {
                let status = self
                    .prepare_tls_sni(managed, &identifier, &attempted, cleanup)
                    .await?;
                attempted.config_checked_ok = status.is_ok;
                status
            }
            ChallengeType::TkAuth01 => {
                attempted.config_checked_ok = true;
                StatusMessage::ok(format!("Authority token ready for {identifier}"))
            }
            ChallengeType::Unknown => {
                return Err(Error::ConfigInvalid(format!(
                    "Challenge type not supported for {identifier}"
                )))
            }
        };
        authz.attempted_challenge = Some(attempted);
        Ok(status)
    }
}

pub(crate) fn reject_wildcard_http(identifier: &str) -> Result<()> {
    if crate::model::is_wildcard(identifier) {
        return Err(Error::ConfigInvalid(format!(
            "http-01 authorization cannot be used for wildcard domains: {identifier}. Use DNS (dns-01) validation instead."
        )));
    }
    Ok(())
}
