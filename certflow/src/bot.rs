use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    account::AccountManager,
    acme_client::{AcmeApi, ExternalAccountBinding, HttpAcmeClient},
    challenge::ChallengeResponder,
    config::Settings,
    error::{Error, Result},
    model::{ChallengeType, ManagedCertificate, PendingAuthorization, StatusMessage},
    order::OrderOrchestrator,
    packager::{read_pem, CertificatePackager, PackagedCertificate},
    preflight::PreflightDiagnostics,
};

#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
pub struct CertBotConfig {
    settings: Settings,
    /// Contact used when a new account has to be registered.
    contact_email: String,
    auto_create_account: bool,
    eab: Option<ExternalAccountBinding>,
    pfx_password: Option<String>,
}

impl CertBotConfig {
    /// Build a bot talking to the configured CA over HTTPS.
    pub async fn build_bot(&self, responder: ChallengeResponder) -> Result<CertBot> {
        let api = HttpAcmeClient::new(&self.settings.acme)?;
        CertBot::build(self.clone(), Arc::new(api), responder).await
    }
}

/// Outcome of one certificate request.
#[derive(Debug, Clone, Default)]
pub struct CertificateRequestResult {
    pub is_success: bool,
    /// A human has to act (e.g. create a DNS record) before the order can continue.
    pub is_awaiting_user: bool,
    pub message: String,
    pub order_uri: Option<String>,
    pub certificate: Option<PackagedCertificate>,
}

impl CertificateRequestResult {
    fn failed(message: impl Into<String>, order_uri: Option<String>) -> Self {
        Self {
            message: message.into(),
            order_uri,
            ..Default::default()
        }
    }
}

/// Drives a certificate through order, challenges and packaging.
pub struct CertBot {
    config: CertBotConfig,
    accounts: Arc<AccountManager>,
    orders: OrderOrchestrator,
    responder: Arc<ChallengeResponder>,
    packager: CertificatePackager,
    preflight: PreflightDiagnostics,
    in_flight: Mutex<HashSet<String>>,
}

impl CertBot {
    /// Load the ACME account, registering one when allowed, and wire the components.
    pub async fn build(
        config: CertBotConfig,
        api: Arc<dyn AcmeApi>,
        responder: ChallengeResponder,
    ) -> Result<Self> {
        let settings = &config.settings;
        let accounts = Arc::new(AccountManager::new(
            api.clone(),
            &settings.storage,
            &settings.acme,
        ));
        if !accounts.init(None).await? {
            if !config.auto_create_account {
                return Err(Error::ConfigInvalid(
                    "No ACME account is configured and automatic registration is disabled.".into(),
                ));
            }
            info!("creating new ACME account");
            let details = accounts
                .register(&config.contact_email, config.eab.clone(), None, None)
                .await?;
            info!("created new ACME account: {}", details.id);
        }

        let responder = Arc::new(responder);
        let orders = OrderOrchestrator::new(api.clone(), accounts.clone(), settings.acme.clone());
        let packager = CertificatePackager::new(api, accounts.clone(), settings);
        let preflight = PreflightDiagnostics::new(responder.clone(), settings.preflight.clone());
        Ok(Self {
            config,
            accounts,
            orders,
            responder,
            packager,
            preflight,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn orders(&self) -> &OrderOrchestrator {
        &self.orders
    }

    pub fn packager(&self) -> &CertificatePackager {
        &self.packager
    }

    /// Dry-run the challenge configuration of `managed` without contacting the CA.
    pub async fn preflight(&self, managed: &ManagedCertificate, check_dns: bool) -> Vec<StatusMessage> {
        self.preflight.test_challenge_response(managed, check_dns).await
    }

    /// Request a certificate when `live_cert_pem` is missing or expires within the renewal
    /// window. `None` when the live certificate is still good.
    pub async fn renew_if_needed(
        &self,
        managed: &mut ManagedCertificate,
        live_cert_pem: Option<&str>,
    ) -> Result<Option<CertificateRequestResult>> {
        let expires_in = self.config.settings.renewal.renew_before_expiry;
        if let Some(cert_pem) = live_cert_pem {
            if !need_renew(cert_pem, expires_in)? {
                info!(name = %managed.name, "certificate is up to date");
                return Ok(None);
            }
        }
        info!(name = %managed.name, "certificate needs to be renewed");
        Ok(Some(self.request_certificate(managed, None).await))
    }

    pub async fn request_certificate(
        &self,
        managed: &mut ManagedCertificate,
        resume_uri: Option<&str>,
    ) -> CertificateRequestResult {
        self.request_certificate_until(managed, resume_uri, std::future::pending())
            .await
    }

    /// Like `request_certificate`, abandoning the request when `cancel` completes or the
    /// renewal timeout passes. Cleanups registered so far run either way.
    pub async fn request_certificate_until(
        &self,
        managed: &mut ManagedCertificate,
        resume_uri: Option<&str>,
        cancel: impl Future<Output = ()>,
    ) -> CertificateRequestResult {
        let Some(_guard) = self.enter(&managed.request.primary_domain) else {
            return CertificateRequestResult::failed(
                format!(
                    "A request for {} is already in progress. Please retry later.",
                    managed.request.primary_domain
                ),
                None,
            );
        };

        let timeout = self.config.settings.renewal.timeout;
        let mut authorizations = vec![];
        let mut order_uri = resume_uri.map(str::to_string);
        let finished = tokio::select! {
            result = self.run_request(managed, resume_uri, &mut authorizations, &mut order_uri) => Ok(result),
            _ = sleep(timeout) => {
                warn!(name = %managed.name, "certificate request timed out");
                Err(format!(
                    "The certificate request did not complete within {}s.",
                    timeout.as_secs()
                ))
            }
            _ = cancel => {
                warn!(name = %managed.name, "certificate request cancelled");
                Err("The certificate request was cancelled.".to_string())
            }
        };
        let result = finished
            .unwrap_or_else(|message| CertificateRequestResult::failed(message, order_uri.clone()));

        for authz in &mut authorizations {
            authz.run_cleanup().await;
        }
        if let Some(uri) = &order_uri {
            self.orders.forget_order(uri);
        }

        if result.is_success {
            managed.date_renewed = Some(OffsetDateTime::now_utc());
            managed.renewal_failure_count = 0;
            managed.current_order_uri = None;
        } else if result.is_awaiting_user {
            managed.current_order_uri = result.order_uri.clone();
        } else {
            managed.renewal_failure_count += 1;
            managed.current_order_uri = None;
            error!(name = %managed.name, "certificate request failed: {}", result.message);
        }
        result
    }

    /// Prepared authorizations are kept in `authorizations` so their cleanups survive the
    /// request being dropped part way.
    async fn run_request(
        &self,
        managed: &ManagedCertificate,
        resume_uri: Option<&str>,
        authorizations: &mut Vec<PendingAuthorization>,
        order_uri: &mut Option<String>,
    ) -> CertificateRequestResult {
        let pending = self.orders.begin_order(managed, resume_uri).await;
        if pending.order_uri.is_some() {
            order_uri.clone_from(&pending.order_uri);
        }
        if pending.is_failure {
            let message = pending
                .failure_message
                .unwrap_or_else(|| "Failed to begin order.".into());
            return CertificateRequestResult::failed(message, pending.order_uri);
        }
        let Some(uri) = pending.order_uri.clone() else {
            return CertificateRequestResult::failed("The CA did not return an order.", None);
        };

        let mut awaiting = vec![];
        let mut propagation = 0;
        for authz in pending.authorizations {
            if authz.is_validated {
                debug!(domain = %authz.identifier_value(), "authorization already valid");
                continue;
            }
            let index = authorizations.len();
            authorizations.push(authz);
            let authz = &mut authorizations[index];
            let status = match self.responder.prepare(managed, authz).await {
                Ok(status) => status,
                Err(err) => return CertificateRequestResult::failed(err.classify().message, Some(uri)),
            };
            if !status.is_ok {
                return CertificateRequestResult::failed(status.message, Some(uri));
            }
            if let Some(attempted) = &authz.attempted_challenge {
                if attempted.is_awaiting_user {
                    awaiting.push(
                        attempted
                            .challenge_result_msg
                            .clone()
                            .unwrap_or_else(|| status.message.clone()),
                    );
                }
                if attempted.kind() == ChallengeType::Dns01 {
                    propagation = propagation.max(attempted.propagation_seconds);
                }
            }
        }

        // a resumed order means the user has already acted
        if !awaiting.is_empty() && resume_uri.is_none() {
            info!(order = %uri, "waiting for manual DNS updates");
            return CertificateRequestResult {
                is_awaiting_user: true,
                message: awaiting.join("\n"),
                order_uri: Some(uri),
                ..Default::default()
            };
        }
        if propagation > 0 {
            info!(seconds = propagation, "waiting for DNS propagation");
            sleep(Duration::from_secs(propagation as u64)).await;
        }

        for authz in authorizations.iter_mut() {
            let status = self.orders.submit_challenge(authz).await;
            if !status.is_ok {
                return CertificateRequestResult::failed(status.message, Some(uri));
            }
            if authz.is_validated {
                continue;
            }
            self.orders.poll_validation(authz).await;
            if !authz.is_validated {
                let message = authz.authorization_error.clone().unwrap_or_else(|| {
                    format!("Validation of {} failed.", authz.identifier_value())
                });
                return CertificateRequestResult::failed(message, Some(uri));
            }
        }

        let password = self.config.pfx_password.as_deref();
        match self.packager.finalize(managed, &uri, password).await {
            Ok(certificate) => {
                info!(order = %uri, cert_id = %certificate.cert_id, "certificate issued");
                CertificateRequestResult {
                    is_success: true,
                    message: format!("Certificate issued for {}", managed.name),
                    order_uri: Some(uri),
                    certificate: Some(certificate),
                    ..Default::default()
                }
            }
            Err(err) => {
                let classified = err.classify();
                error!(order = %uri, "failed to finalize order: {err:?}");
                CertificateRequestResult::failed(classified.message, Some(uri))
            }
        }
    }

    fn enter(&self, primary_domain: &str) -> Option<InFlight<'_>> {
        let key = primary_domain.trim().to_lowercase();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(InFlight { bot: self, key })
    }
}

/// Marks a primary domain as busy until dropped.
struct InFlight<'a> {
    bot: &'a CertBot,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.bot
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn need_renew(cert_pem: &str, expires_in: Duration) -> anyhow::Result<bool> {
    let pem = read_pem(cert_pem)?;
    let cert = pem.parse_x509().context("Invalid x509 certificate")?;
    let not_after = cert.validity().not_after.to_datetime();
    let now = OffsetDateTime::now_utc();
    debug!("will expire in {:?}", not_after - now);

    Ok(not_after < now + expires_in)
}

#[cfg(test)]
mod tests;
