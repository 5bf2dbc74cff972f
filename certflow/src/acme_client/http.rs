use std::{sync::Mutex, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use x509_parser::prelude::{Pem, X509Certificate};

use super::{
    jws::{self, KeyId},
    AccountContext, AccountResource, AcmeApi, Authorization, Challenge, Directory,
    NewAccountRequest, Order,
};
use crate::{
    config::AcmeSettings,
    crypto::{b64, PrivateKey},
    error::{Error, Problem, Result},
    model::Identifier,
};

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const BAD_NONCE_RETRIES: usize = 2;

/// RFC 8555 client over HTTPS.
pub struct HttpAcmeClient {
    http: Client,
    directory_url: String,
    directory: tokio::sync::Mutex<Option<Directory>>,
    nonce: Mutex<Option<String>>,
    spacing: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl HttpAcmeClient {
    pub fn new(settings: &AcmeSettings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.allow_untrusted_tls)
            .build()
            .context("failed to build http client")?;
        if settings.allow_untrusted_tls {
            warn!("TLS certificate validation of the CA endpoint is disabled");
        }
        Ok(Self {
            http,
            directory_url: settings.directory_url.clone(),
            directory: Default::default(),
            nonce: Default::default(),
            spacing: settings.request_spacing,
            last_request: Default::default(),
        })
    }

    /// Keep at least `request_spacing` between requests to the CA.
    async fn throttle(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.spacing {
                sleep(self.spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn store_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = headers.get("Replay-Nonce").and_then(|v| v.to_str().ok()) {
            if let Ok(mut slot) = self.nonce.lock() {
                *slot = Some(nonce.to_string());
            }
        }
    }

    fn take_nonce(&self) -> Option<String> {
        self.nonce.lock().ok().and_then(|mut n| n.take())
    }

    async fn fetch_nonce(&self) -> Result<String> {
        let directory = self.directory().await?;
        self.throttle().await;
        let response = self.http.head(&directory.new_nonce).send().await?;
        debug!(status = %response.status(), "HEAD {}", directory.new_nonce);
        response
            .headers()
            .get("Replay-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| Error::Unhandled(anyhow::anyhow!("no Replay-Nonce in newNonce response")))
    }

    async fn nonce(&self) -> Result<String> {
        match self.take_nonce() {
            Some(nonce) => Ok(nonce),
            None => self.fetch_nonce().await,
        }
    }

    /// Signed POST, retried on `badNonce`. Non-2xx responses become `CaRejected`.
    async fn post(
        &self,
        url: &str,
        key: &PrivateKey,
        key_id: KeyId<'_>,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let nonce = self.nonce().await?;
            let body = jws::sign(key, key_id, url, Some(&nonce), payload)?;
            self.throttle().await;
            let mut request = self
                .http
                .post(url)
                .header("Content-Type", JOSE_JSON)
                .body(body.to_string());
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            let response = request.send().await?;
            let status = response.status();
            debug!(%status, "POST {url}");
            self.store_nonce(response.headers());
            if status.is_success() {
                return Ok(response);
            }
            let problem = read_problem(status, response).await;
            if problem.is_bad_nonce() && attempt < BAD_NONCE_RETRIES {
                attempt += 1;
                debug!(attempt, "bad nonce, retrying {url}");
                continue;
            }
            return Err(Error::CaRejected(problem));
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        ctx: &AccountContext,
        payload: Option<&Value>,
    ) -> Result<(T, HeaderMap)> {
        let response = self
            .post(url, &ctx.key, KeyId::Kid(&ctx.kid), payload, None)
            .await?;
        let headers = response.headers().clone();
        let body = response
            .json::<T>()
            .await
            .with_context(|| format!("invalid response from {url}"))?;
        Ok((body, headers))
    }

    async fn fetch_chain(&self, ctx: &AccountContext, url: &str) -> Result<(String, Vec<String>)> {
        let response = self
            .post(url, &ctx.key, KeyId::Kid(&ctx.kid), None, Some(PEM_CHAIN))
            .await?;
        let alternates = alternate_links(response.headers());
        let pem = response.text().await?;
        Ok((pem, alternates))
    }
}

async fn read_problem(status: StatusCode, response: Response) -> Problem {
    let body = response.text().await.unwrap_or_default();
    let mut problem = serde_json::from_str::<Problem>(&body)
        .unwrap_or_else(|_| Problem::new("about:blank", body.trim().to_string()));
    if problem.status.is_none() {
        problem.status = Some(status.as_u16());
    }
    problem
}

fn location(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// URLs of `Link: <url>;rel="alternate"` headers.
pub(crate) fn alternate_links(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("Link")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|link| {
            let (target, params) = link.trim().split_once(';')?;
            let is_alternate = params
                .split(';')
                .any(|p| p.trim().replace(' ', "") == "rel=\"alternate\"");
            is_alternate.then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
        })
        .collect()
}

/// True when any certificate in the chain was issued by a CA whose common name is `name`.
pub(crate) fn chain_issued_by(pem_chain: &str, name: &str) -> bool {
    Pem::iter_from_buffer(pem_chain.as_bytes())
        .filter_map(|pem| pem.ok())
        .any(|pem| {
            let Ok(cert) = pem.parse_x509() else {
                return false;
            };
            issuer_common_name(&cert).is_some_and(|cn| cn.eq_ignore_ascii_case(name.trim()))
        })
}

fn issuer_common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string())
}

#[async_trait]
impl AcmeApi for HttpAcmeClient {
    async fn reset(&self) {
        *self.directory.lock().await = None;
        self.take_nonce();
    }

    async fn directory(&self) -> Result<Directory> {
        let mut cached = self.directory.lock().await;
        if let Some(directory) = &*cached {
            return Ok(directory.clone());
        }
        self.throttle().await;
        let response = self.http.get(&self.directory_url).send().await?;
        let status = response.status();
        debug!(%status, "GET {}", self.directory_url);
        if !status.is_success() {
            return Err(Error::CaRejected(read_problem(status, response).await));
        }
        let directory: Directory = response
            .json()
            .await
            .context("invalid ACME directory document")?;
        *cached = Some(directory.clone());
        Ok(directory)
    }

    async fn consume_nonce(&self) -> Result<()> {
        self.take_nonce();
        let nonce = self.fetch_nonce().await?;
        if let Ok(mut slot) = self.nonce.lock() {
            *slot = Some(nonce);
        }
        Ok(())
    }

    async fn new_account(
        &self,
        key: &PrivateKey,
        request: &NewAccountRequest,
    ) -> Result<(String, AccountResource)> {
        let directory = self.directory().await?;
        let mut payload = json!({
            "contact": request.contact,
            "termsOfServiceAgreed": request.terms_of_service_agreed,
        });
        if request.only_return_existing {
            payload["onlyReturnExisting"] = Value::Bool(true);
        }
        if let Some(eab) = &request.external_account_binding {
            payload["externalAccountBinding"] =
                jws::external_account_binding(eab, key, &directory.new_account)?;
        }
        let response = self
            .post(&directory.new_account, key, KeyId::Jwk, Some(&payload), None)
            .await?;
        let uri = location(response.headers())
            .context("CA did not return an account location")?;
        let account = response
            .json::<AccountResource>()
            .await
            .context("invalid account resource")?;
        info!("account ready: {uri}");
        Ok((uri, account))
    }

    async fn account(&self, ctx: &AccountContext) -> Result<AccountResource> {
        let (account, _) = self
            .post_json(&ctx.kid, ctx, Some(&json!({})))
            .await?;
        Ok(account)
    }

    async fn update_account(
        &self,
        ctx: &AccountContext,
        contact: &[String],
        terms_of_service_agreed: bool,
    ) -> Result<AccountResource> {
        let mut payload = json!({ "contact": contact });
        if terms_of_service_agreed {
            payload["termsOfServiceAgreed"] = Value::Bool(true);
        }
        let (account, _) = self.post_json(&ctx.kid, ctx, Some(&payload)).await?;
        Ok(account)
    }

    async fn deactivate_account(&self, ctx: &AccountContext) -> Result<AccountResource> {
        let payload = json!({ "status": "deactivated" });
        let (account, _) = self.post_json(&ctx.kid, ctx, Some(&payload)).await?;
        Ok(account)
    }

    async fn change_key(&self, ctx: &AccountContext, new_key: &PrivateKey) -> Result<()> {
        let directory = self.directory().await?;
        let url = directory
            .key_change
            .context("CA does not support account key rollover")?;
        let inner = jws::key_change_inner(&ctx.key, new_key, &ctx.kid, &url)?;
        self.post(&url, &ctx.key, KeyId::Kid(&ctx.kid), Some(&inner), None)
            .await?;
        Ok(())
    }

    async fn new_order(
        &self,
        ctx: &AccountContext,
        identifiers: &[Identifier],
        not_after: Option<OffsetDateTime>,
    ) -> Result<Order> {
        let directory = self.directory().await?;
        let mut payload = json!({ "identifiers": identifiers });
        if let Some(not_after) = not_after {
            payload["notAfter"] = Value::String(
                not_after
                    .format(&Rfc3339)
                    .context("failed to format notAfter")?,
            );
        }
        let (mut order, headers): (Order, _) = self
            .post_json(&directory.new_order, ctx, Some(&payload))
            .await?;
        order.url = location(&headers).context("CA did not return an order location")?;
        order.retry_after = retry_after(&headers);
        Ok(order)
    }

    async fn order(&self, ctx: &AccountContext, url: &str) -> Result<Order> {
        let (mut order, headers): (Order, _) = self.post_json(url, ctx, None).await?;
        order.url = url.to_string();
        order.retry_after = retry_after(&headers);
        Ok(order)
    }

    async fn authorization(&self, ctx: &AccountContext, url: &str) -> Result<Authorization> {
        let (authz, _) = self.post_json(url, ctx, None).await?;
        Ok(authz)
    }

    async fn challenge(&self, ctx: &AccountContext, url: &str) -> Result<Challenge> {
        let (challenge, _) = self.post_json(url, ctx, None).await?;
        Ok(challenge)
    }

    async fn respond_challenge(
        &self,
        ctx: &AccountContext,
        url: &str,
        payload: Value,
    ) -> Result<Challenge> {
        let (challenge, _) = self.post_json(url, ctx, Some(&payload)).await?;
        Ok(challenge)
    }

    async fn finalize(&self, ctx: &AccountContext, url: &str, csr_der: &[u8]) -> Result<Order> {
        let payload = json!({ "csr": b64(csr_der) });
        let (mut order, headers): (Order, _) = self.post_json(url, ctx, Some(&payload)).await?;
        if let Some(url) = location(&headers) {
            order.url = url;
        }
        order.retry_after = retry_after(&headers);
        Ok(order)
    }

    async fn certificate(
        &self,
        ctx: &AccountContext,
        url: &str,
        preferred_chain: Option<&str>,
    ) -> Result<String> {
        let (pem, alternates) = self.fetch_chain(ctx, url).await?;
        let Some(preferred) = preferred_chain.filter(|p| !p.trim().is_empty()) else {
            return Ok(pem);
        };
        if chain_issued_by(&pem, preferred) {
            return Ok(pem);
        }
        for alternate in alternates {
            let (alt_pem, _) = self.fetch_chain(ctx, &alternate).await?;
            if chain_issued_by(&alt_pem, preferred) {
                info!("using alternate chain issued by {preferred}");
                return Ok(alt_pem);
            }
        }
        info!("preferred chain {preferred} not offered, using default chain");
        Ok(pem)
    }

    async fn revoke_certificate(&self, ctx: &AccountContext, cert_der: &[u8]) -> Result<()> {
        let directory = self.directory().await?;
        let url = directory
            .revoke_cert
            .context("CA does not support revocation")?;
        let payload = json!({ "certificate": b64(cert_der) });
        self.post(&url, &ctx.key, KeyId::Kid(&ctx.kid), Some(&payload), None)
            .await?;
        Ok(())
    }
}
