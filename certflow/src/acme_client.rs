//! The protocol seam between the orchestration layer and an ACME CA.
//!
//! [`AcmeApi`] is everything the core asks of a CA. [`HttpAcmeClient`] speaks RFC 8555
//! over HTTPS; tests drive the core through an in-memory CA instead.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    crypto::PrivateKey,
    error::{Problem, Result},
    model::{ChallengeType, Identifier},
};

pub use http::HttpAcmeClient;

mod http;
mod jws;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResource {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(default)]
    pub orders: Option<String>,
}

/// The signing identity for requests made on behalf of an existing account.
#[derive(Debug, Clone)]
pub struct AccountContext {
    pub key: PrivateKey,
    pub kid: String,
}

#[derive(Debug, Clone)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    /// base64url HMAC key issued by the CA.
    pub hmac_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewAccountRequest {
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub only_return_existing: bool,
    pub external_account_binding: Option<ExternalAccountBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// Order URL, from `Location` or the request URL.
    #[serde(skip)]
    pub url: String,
    /// CA `Retry-After` hint from the response that produced this snapshot.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default)]
    pub expires: Option<String>,
}

impl Authorization {
    pub fn challenge(&self, kind: ChallengeType) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }

    /// Identifier as the order knows it, with the wildcard label restored.
    pub fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    #[serde(default)]
    pub validated: Option<String>,
}

#[async_trait]
pub trait AcmeApi: Send + Sync {
    /// Drop cached directory and nonce state.
    async fn reset(&self);

    async fn directory(&self) -> Result<Directory>;

    /// Replace any cached anti-replay nonce with a fresh one.
    async fn consume_nonce(&self) -> Result<()>;

    /// Returns the account URL and resource.
    async fn new_account(
        &self,
        key: &PrivateKey,
        request: &NewAccountRequest,
    ) -> Result<(String, AccountResource)>;

    async fn account(&self, ctx: &AccountContext) -> Result<AccountResource>;

    async fn update_account(
        &self,
        ctx: &AccountContext,
        contact: &[String],
        terms_of_service_agreed: bool,
    ) -> Result<AccountResource>;

    async fn deactivate_account(&self, ctx: &AccountContext) -> Result<AccountResource>;

    /// Roll the account over to `new_key`.
    async fn change_key(&self, ctx: &AccountContext, new_key: &PrivateKey) -> Result<()>;

    async fn new_order(
        &self,
        ctx: &AccountContext,
        identifiers: &[Identifier],
        not_after: Option<OffsetDateTime>,
    ) -> Result<Order>;

    async fn order(&self, ctx: &AccountContext, url: &str) -> Result<Order>;

    async fn authorization(&self, ctx: &AccountContext, url: &str) -> Result<Authorization>;

    async fn challenge(&self, ctx: &AccountContext, url: &str) -> Result<Challenge>;

    /// Ask the CA to validate a challenge. `payload` is `{}` except for tkauth-01.
    async fn respond_challenge(
        &self,
        ctx: &AccountContext,
        url: &str,
        payload: Value,
    ) -> Result<Challenge>;

    async fn finalize(&self, ctx: &AccountContext, url: &str, csr_der: &[u8]) -> Result<Order>;

    /// Download the PEM chain, preferring one issued under `preferred_chain` when offered.
    async fn certificate(
        &self,
        ctx: &AccountContext,
        url: &str,
        preferred_chain: Option<&str>,
    ) -> Result<String>;

    async fn revoke_certificate(&self, ctx: &AccountContext, cert_der: &[u8]) -> Result<()>;
}
