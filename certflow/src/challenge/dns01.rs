use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, info, warn};

use super::{apply_delegation_rule, ChallengeResponder};
use crate::{
    dns01_client::{DnsProvider, HandlerType, ACTION_REQUIRED},
    error::{Error, Result},
    model::{to_ascii_domain, ActionResult, ChallengeConfig, Cleanup, DnsRecord, StatusMessage},
};

/// What happened when the TXT record was requested.
#[derive(Debug, Clone)]
pub struct DnsChallengeOutcome {
    pub result: ActionResult,
    pub propagation_seconds: i32,
    /// A human has to create the record before the CA is asked to validate.
    pub is_awaiting_user: bool,
    /// Record name after IDN conversion and delegation.
    pub record_name: String,
}

impl DnsChallengeOutcome {
    pub fn status(&self) -> StatusMessage {
        if self.result.is_success {
            StatusMessage::ok(self.result.message.clone())
        } else {
            StatusMessage::fail(self.result.message.clone())
        }
    }
}

impl ChallengeResponder {
    /// Resolve a live provider for a challenge config, decrypting its credentials first.
    pub(crate) async fn dns_provider(&self, config: &ChallengeConfig) -> Result<Arc<dyn DnsProvider>> {
        let credentials = match config
            .challenge_credential_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        {
            Some(key) => self
                .credentials
                .get_unlocked_credentials(key)
                .await
                .map_err(|e| {
                    warn!("failed to unlock credentials {key}: {e:#}");
                    Error::CredentialsInvalid(
                        "DNS Challenge API Credentials could not be decrypted. The original user must be used for decryption."
                            .into(),
                    )
                })?,
            None => HashMap::new(),
        };
        self.registry
            .resolve(
                config.challenge_provider.as_deref(),
                credentials,
                config.parameters.clone(),
            )
            .await
    }

    /// Create the TXT record for one identifier. Its removal is added to `cleanup` before
    /// the provider is called.
    ///
    /// In test mode a provider that cannot run tests is not called at all.
    pub(crate) async fn complete_dns(
        &self,
        config: &ChallengeConfig,
        domain: &str,
        record_name: &str,
        record_value: &str,
        test_mode: bool,
        cleanup: &mut Cleanup,
    ) -> Result<DnsChallengeOutcome> {
        let provider = self.dns_provider(config).await?;
        let title = provider.provider_title().to_string();

        let ascii_name = to_ascii_domain(record_name)
            .map_err(|e| Error::ConfigInvalid(format!("{e:#}")))?;
        let record_name =
            apply_delegation_rule(&ascii_name, config.challenge_delegation_rule.as_deref());
        if record_name != ascii_name {
            info!("DNS: {ascii_name} is delegated to {record_name}");
        }

        if test_mode && !provider.is_test_mode_supported() {
            return Ok(DnsChallengeOutcome {
                result: ActionResult::ok(format!(
                    "{title} :: Provider does not support testing, record creation skipped."
                )),
                propagation_seconds: 0,
                is_awaiting_user: false,
                record_name,
            });
        }

        let zone_id = config
            .parameters
            .get("zoneid")
            .or(config.zone_id.as_ref())
            .map(|z| z.trim().to_string())
            .filter(|z| !z.is_empty());
        let record = DnsRecord::txt(domain, &record_name, record_value, zone_id);
        info!(
            "DNS: creating TXT record '{}' with value '{}' in zone '{}' using provider '{title}'",
            record.record_name,
            record.record_value,
            record.zone_id.as_deref().unwrap_or_default()
        );

        let (cleanup_provider, cleanup_record) = (provider.clone(), record.clone());
        cleanup.push(move || async move {
            debug!("DNS: deleting TXT record '{}'", cleanup_record.record_name);
            match cleanup_provider.delete_record(&cleanup_record).await {
                Ok(result) if result.is_success => debug!("DNS: {}", result.message),
                Ok(result) => warn!("DNS record cleanup failed: {}", result.message),
                Err(err) => warn!("DNS record cleanup failed: {err:#}"),
            }
        });

        let is_manual = provider.definition().handler_type == HandlerType::Manual;
        let outcome = match provider.create_record(&record).await {
            Ok(result) => {
                let is_awaiting_user = is_manual || result.message.contains(ACTION_REQUIRED);
                let result = ActionResult {
                    is_success: result.is_success,
                    message: format!("{title} :: {}", result.message),
                };
                if !result.is_success {
                    error!("DNS update failed: {}", result.message);
                } else if is_awaiting_user {
                    warn!("{}", result.message);
                } else {
                    info!("DNS: {}", result.message);
                }
                DnsChallengeOutcome {
                    result,
                    propagation_seconds: provider.propagation_delay_seconds(),
                    is_awaiting_user,
                    record_name: record_name.clone(),
                }
            }
            Err(err) => {
                error!("DNS update failed: {err:?}");
                DnsChallengeOutcome {
                    result: ActionResult::fail(format!("Failed [{title}]: {err:#}")),
                    propagation_seconds: 0,
                    is_awaiting_user: false,
                    record_name: record_name.clone(),
                }
            }
        };
        Ok(outcome)
    }
}
