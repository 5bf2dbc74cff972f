//! The order state machine: create or resume an order, collect the challenges each
//! authorization offers, submit the chosen one and wait for the CA's verdict.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::json;
use time::{OffsetDateTime, Time};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    account::AccountManager,
    acme_client::{
        AccountContext, AcmeApi, Authorization, AuthorizationStatus, ChallengeStatus, Order,
        OrderStatus,
    },
    config::{AcmeSettings, CompatibilityMode},
    error::{Disposition, Error, Result},
    model::{
        AuthorizationChallengeItem, CertRequestConfig, ChallengeType, Identifier,
        ManagedCertificate, PendingAuthorization, PendingOrder, StatusMessage,
    },
};

const ORDER_ATTEMPTS: u32 = 3;
const VALIDATION_ATTEMPTS: u32 = 10;
const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// An order known to be in progress.
#[derive(Debug)]
pub struct TrackedOrder {
    pub uri: String,
    pub identifiers: Vec<Identifier>,
    pub started: OffsetDateTime,
}

/// Orders in flight, keyed by order URI.
#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: Mutex<HashMap<String, Arc<TrackedOrder>>>,
}

impl OrderTracker {
    /// Track `uri`, or return the existing handle when it is already tracked for the same
    /// identifiers. `None` when the URI is tracked for a different identifier set.
    pub fn track(&self, uri: &str, identifiers: &[Identifier]) -> Option<Arc<TrackedOrder>> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        let tracked = orders.entry(uri.to_string()).or_insert_with(|| {
            Arc::new(TrackedOrder {
                uri: uri.to_string(),
                identifiers: identifiers.to_vec(),
                started: OffsetDateTime::now_utc(),
            })
        });
        if tracked.identifiers != identifiers {
            return None;
        }
        Some(tracked.clone())
    }

    pub fn get(&self, uri: &str) -> Option<Arc<TrackedOrder>> {
        let orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        orders.get(uri).cloned()
    }

    pub fn remove(&self, uri: &str) -> Option<Arc<TrackedOrder>> {
        let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        orders.remove(uri)
    }

    pub fn len(&self) -> usize {
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct OrderOrchestrator {
    api: Arc<dyn AcmeApi>,
    accounts: Arc<AccountManager>,
    settings: AcmeSettings,
    tracker: OrderTracker,
}

impl OrderOrchestrator {
    pub fn new(api: Arc<dyn AcmeApi>, accounts: Arc<AccountManager>, settings: AcmeSettings) -> Self {
        Self {
            api,
            accounts,
            settings,
            tracker: OrderTracker::default(),
        }
    }

    pub fn tracker(&self) -> &OrderTracker {
        &self.tracker
    }

    pub fn tracked_order(&self, uri: &str) -> Option<Arc<TrackedOrder>> {
        self.tracker.get(uri)
    }

    pub fn forget_order(&self, uri: &str) {
        if self.tracker.remove(uri).is_some() {
            debug!(order = %uri, "order no longer tracked");
        }
    }

    /// Create a new order for the certificate's identifiers, or resume `resume_uri`.
    ///
    /// Never fails outright: every failure is reported through `PendingOrder::is_failure`.
    pub async fn begin_order(
        &self,
        managed: &ManagedCertificate,
        resume_uri: Option<&str>,
    ) -> PendingOrder {
        if self.accounts.is_stale().await {
            info!("account context is stale, reinitialising");
            if let Err(err) = self.accounts.reinit().await {
                return failed("Failed to reinitialise the ACME account", &err);
            }
        }
        if let Err(err) = self.api.directory().await {
            return failed("The Certificate Authority could not be reached", &err);
        }
        let ctx = match self.accounts.context().await {
            Ok(ctx) => ctx,
            Err(err) => return failed("Failed to begin order", &err),
        };
        if let Err(err) = self.api.consume_nonce().await {
            debug!("failed to refresh nonce: {err}");
        }
        let identifiers = match managed.request.identifiers() {
            Ok(identifiers) if !identifiers.is_empty() => identifiers,
            Ok(_) => return PendingOrder::failed("The certificate request has no identifiers."),
            Err(err) => {
                return PendingOrder::failed(format!("Invalid certificate identifiers: {err:#}"))
            }
        };

        let not_after = preferred_not_after(managed.request.preferred_expiry_days);
        let order = match self
            .create_or_resume(&ctx, &identifiers, not_after, resume_uri)
            .await
        {
            Ok(order) => order,
            Err(message) => {
                error!("failed to begin order: {message}");
                return PendingOrder::failed(format!("Failed to begin order: {message}"));
            }
        };

        let uri = order.url.clone();
        let tracked_ids = if order.identifiers.is_empty() {
            identifiers
        } else {
            order.identifiers.clone()
        };
        if self.tracker.track(&uri, &tracked_ids).is_none() {
            warn!(order = %uri, "order is already tracked for different identifiers");
            return PendingOrder::failed(format!(
                "Order {uri} could not be tracked. Please retry the request batch."
            ));
        }
        info!(order = %uri, status = ?order.status, "order started");

        let mut pending = PendingOrder {
            order_uri: Some(uri.clone()),
            ..Default::default()
        };
        match order.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                info!(order = %uri, "authorizations already complete");
                return pending;
            }
            OrderStatus::Invalid => {
                self.forget_order(&uri);
                let detail = order
                    .error
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "no detail given".into());
                return PendingOrder {
                    order_uri: Some(uri),
                    ..PendingOrder::failed(format!("The order is invalid: {detail}"))
                };
            }
            OrderStatus::Pending | OrderStatus::Processing => {}
        }

        pending.is_pending_authorizations = true;
        let wanted = wanted_challenges(&managed.request);
        for authz_url in &order.authorizations {
            match self
                .pending_authorization(&ctx, &managed.request, &uri, authz_url, &wanted)
                .await
            {
                Ok(authz) => pending.authorizations.push(authz),
                Err(err) => {
                    self.forget_order(&uri);
                    return PendingOrder {
                        order_uri: Some(uri),
                        ..failed("Failed to fetch authorizations", &err)
                    };
                }
            }
        }
        pending
    }

    async fn create_or_resume(
        &self,
        ctx: &AccountContext,
        identifiers: &[Identifier],
        not_after: Option<OffsetDateTime>,
        resume_uri: Option<&str>,
    ) -> std::result::Result<Order, String> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=ORDER_ATTEMPTS {
            let result = match resume_uri {
                Some(uri) => {
                    debug!(order = %uri, attempt, "resuming order");
                    self.api.order(ctx, uri).await
                }
                None => {
                    debug!(attempt, "creating order");
                    self.api.new_order(ctx, identifiers, not_after).await
                }
            };
            let err = match result {
                Ok(order) => return Ok(order),
                Err(err) => err,
            };
            let classified = err.classify();
            warn!(attempt, "order request failed: {}", classified.message);
            last_error = classified.message;
            if classified.disposition == Disposition::Abandon {
                break;
            }
            if attempt < ORDER_ATTEMPTS {
                sleep(self.settings.retry_wait()).await;
            }
        }
        Err(last_error)
    }

    fn status_from_authorization(&self) -> bool {
        self.settings.challenge_status_from_authorization
            || self.settings.compatibility_mode == CompatibilityMode::AltProvider1
    }

    async fn pending_authorization(
        &self,
        ctx: &AccountContext,
        request: &CertRequestConfig,
        order_uri: &str,
        url: &str,
        wanted: &[ChallengeType],
    ) -> Result<PendingAuthorization> {
        let authz = self.api.authorization(ctx, url).await?;
        let domain = authz.domain();
        debug!(domain = %domain, status = ?authz.status, "fetched authorization");

        let mut pending = PendingAuthorization {
            identifier: Some(Identifier {
                kind: authz.identifier.kind,
                value: domain.clone(),
            }),
            authorization_url: url.to_string(),
            is_validated: authz.status == AuthorizationStatus::Valid,
            order_uri: Some(order_uri.to_string()),
            ..Default::default()
        };

        for &kind in wanted {
            let Some(challenge) = authz.challenge(kind) else {
                continue;
            };
            let status = if self.status_from_authorization() {
                challenge.status
            } else {
                self.api.challenge(ctx, &challenge.url).await?.status
            };
            let token = challenge.token.clone().unwrap_or_default();
            let mut item = AuthorizationChallengeItem {
                challenge_type: Some(kind),
                challenge_url: challenge.url.clone(),
                is_validated: status == ChallengeStatus::Valid,
                ..Default::default()
            };
            match kind {
                ChallengeType::Http01 => {
                    item.key = token.clone();
                    item.value = ctx.key.key_authorization(&token)?;
                    item.resource_path = Some(format!("{CHALLENGE_DIR}/{token}"));
                    item.resource_uri = Some(format!("http://{domain}/{CHALLENGE_DIR}/{token}"));
                }
                ChallengeType::Dns01 => {
                    item.key = format!("_acme-challenge.{}", domain.trim_start_matches("*."));
                    item.value = ctx.key.dns_txt_value(&token)?;
                }
                ChallengeType::TkAuth01 => {
                    let Some(token) = request.authority_token_for(&authz.identifier.value) else {
                        warn!("no authority token for {domain}");
                        continue;
                    };
                    item.key = domain.clone();
                    item.value = token.token.clone();
                }
                ChallengeType::TlsSni01 | ChallengeType::Unknown => continue,
            }
            pending.challenges.push(item);
        }
        Ok(pending)
    }

    /// Ask the CA to validate the attempted challenge.
    pub async fn submit_challenge(&self, authz: &PendingAuthorization) -> StatusMessage {
        let identifier = authz.identifier_value();
        let Some(attempted) = &authz.attempted_challenge else {
            return StatusMessage::fail(format!("No challenge was attempted for {identifier}"));
        };
        if authz.is_validated || attempted.is_validated {
            return StatusMessage::ok(format!("{identifier} is already validated"));
        }
        let ctx = match self.accounts.context().await {
            Ok(ctx) => ctx,
            Err(err) => return StatusMessage::fail(err.classify().message),
        };
        if let Err(err) = self.api.consume_nonce().await {
            debug!("failed to refresh nonce: {err}");
        }
        let payload = match attempted.kind() {
            ChallengeType::TkAuth01 => json!({ "atc": attempted.value }),
            _ => json!({}),
        };
        info!(domain = %identifier, challenge = %attempted.kind(), "submitting challenge");
        match self
            .api
            .respond_challenge(&ctx, &attempted.challenge_url, payload)
            .await
        {
            Ok(challenge) if challenge.status == ChallengeStatus::Invalid => {
                let detail = challenge
                    .error
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "no detail given".into());
                warn!(domain = %identifier, "challenge is invalid: {detail}");
                StatusMessage::fail(format!("Challenge for {identifier} is invalid: {detail}"))
            }
            Ok(_) => StatusMessage::ok(format!("Submitted challenge response for {identifier}")),
            Err(err) => {
                let classified = err.classify();
                warn!(domain = %identifier, "challenge submission failed: {}", classified.message);
                StatusMessage::fail(classified.message)
            }
        }
    }

    /// Poll the authorization until the CA decides, giving up after a fixed number of checks.
    pub async fn poll_validation(&self, authz: &mut PendingAuthorization) {
        let identifier = authz.identifier_value().to_string();
        let ctx = match self.accounts.context().await {
            Ok(ctx) => ctx,
            Err(err) => {
                authz.is_validated = false;
                authz.authorization_error = Some(err.classify().message);
                return;
            }
        };
        let wait = self.settings.retry_wait();
        for attempt in 1..=VALIDATION_ATTEMPTS {
            sleep(wait).await;
            let current = match self.api.authorization(&ctx, &authz.authorization_url).await {
                Ok(current) => current,
                Err(err) => {
                    let classified = err.classify();
                    warn!(domain = %identifier, attempt, "failed to check authorization: {}", classified.message);
                    if classified.disposition == Disposition::Abandon {
                        authz.is_validated = false;
                        authz.authorization_error = Some(classified.message);
                        return;
                    }
                    continue;
                }
            };
            match current.status {
                AuthorizationStatus::Valid => {
                    info!(domain = %identifier, "authorization is valid");
                    authz.is_validated = true;
                    authz.authorization_error = None;
                    if let Some(attempted) = &mut authz.attempted_challenge {
                        attempted.is_validated = true;
                    }
                    return;
                }
                AuthorizationStatus::Pending => {
                    debug!(domain = %identifier, attempt, "authorization still pending");
                }
                _ => {
                    let detail = failure_detail(&current);
                    warn!(domain = %identifier, "authorization failed: {detail}");
                    authz.is_validated = false;
                    authz.authorization_error = Some(detail);
                    return;
                }
            }
        }
        warn!(domain = %identifier, "authorization did not complete in time");
        authz.is_validated = false;
        authz.authorization_error = Some(format!(
            "Validation of {identifier} did not complete after {VALIDATION_ATTEMPTS} checks."
        ));
    }
}

fn failed(context: &str, err: &Error) -> PendingOrder {
    let classified = err.classify();
    error!("{context}: {}", classified.message);
    PendingOrder::failed(format!("{context}: {}", classified.message))
}

/// Challenge types worth fetching for this request.
fn wanted_challenges(request: &CertRequestConfig) -> Vec<ChallengeType> {
    let mut wanted = vec![];
    if request.challenges.is_empty() {
        wanted.push(ChallengeType::Http01);
    }
    for config in &request.challenges {
        let kind = config.kind();
        if !wanted.contains(&kind) {
            wanted.push(kind);
        }
    }
    if !request.authority_tokens.is_empty() && !wanted.contains(&ChallengeType::TkAuth01) {
        wanted.push(ChallengeType::TkAuth01);
    }
    wanted
}

fn failure_detail(authz: &Authorization) -> String {
    let problems: Vec<String> = authz
        .challenges
        .iter()
        .filter_map(|c| c.error.as_ref())
        .map(|p| p.to_string())
        .collect();
    if problems.is_empty() {
        format!("Authorization for {} is {:?}", authz.domain(), authz.status)
    } else {
        problems.join("; ")
    }
}

/// Requested expiry, rounded down to the hour.
fn preferred_not_after(days: Option<u32>) -> Option<OffsetDateTime> {
    let days = days.filter(|d| *d > 0)?;
    let at = OffsetDateTime::now_utc() + time::Duration::days(days.into());
    let hour = Time::from_hms(at.hour(), 0, 0).ok()?;
    Some(at.replace_time(hour))
}
