use std::{collections::HashMap, fmt, future::Future, pin::Pin};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::crypto::KeyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierType {
    #[serde(rename = "dns")]
    Dns,
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "TNAuthList")]
    TnAuthList,
}

/// An ACME identifier. Immutable once an order starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }

    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Ip,
            value: value.into(),
        }
    }

    pub fn tn_auth_list(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::TnAuthList,
            value: value.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.kind == IdentifierType::Dns && is_wildcard(&self.value)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Convert a (possibly internationalised) domain to its lower-case ASCII form.
/// The wildcard label is preserved.
pub fn to_ascii_domain(domain: &str) -> Result<String> {
    let domain = domain.trim();
    let (prefix, rest) = match domain.strip_prefix("*.") {
        Some(rest) => ("*.", rest),
        None => ("", domain),
    };
    let ascii = idna::domain_to_ascii(rest)
        .map_err(|e| anyhow::anyhow!("invalid domain name {domain}: {e:?}"))?;
    Ok(format!("{prefix}{}", ascii.to_lowercase()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-sni-01")]
    TlsSni01,
    #[serde(rename = "tkauth-01")]
    TkAuth01,
    #[serde(other)]
    Unknown,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsSni01 => "tls-sni-01",
            Self::TkAuth01 => "tkauth-01",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a step that either succeeded or explains why not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub is_success: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub is_ok: bool,
    pub has_warning: bool,
    pub message: String,
}

impl StatusMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            is_ok: true,
            has_warning: false,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            is_ok: false,
            has_warning: false,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            is_ok: true,
            has_warning: true,
            message: message.into(),
        }
    }
}

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Deferred removal of proof artifacts.
///
/// Actions run in registration order when `run` consumes the list, so each
/// action runs at most once. Actions log their own failures.
#[derive(Default)]
pub struct Cleanup {
    actions: Vec<CleanupAction>,
}

impl Cleanup {
    pub fn push<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    pub fn append(&mut self, mut other: Cleanup) {
        self.actions.append(&mut other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub async fn run(self) {
        debug!("running {} cleanup actions", self.actions.len());
        for action in self.actions {
            action().await;
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// One challenge offered by the CA for an identifier, with the proof material it needs.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationChallengeItem {
    pub challenge_type: Option<ChallengeType>,
    /// HTTP token, DNS record name, or the identifier for TKAuth.
    pub key: String,
    /// Key authorization, DNS TXT value, or the authority token.
    pub value: String,
    pub challenge_url: String,
    /// Local resource written for HTTP-01.
    pub resource_path: Option<String>,
    /// Public URL the CA will fetch for HTTP-01.
    pub resource_uri: Option<String>,
    pub hash_iteration_count: u32,
    pub is_validated: bool,
    pub config_checked_ok: bool,
    pub challenge_result_msg: Option<String>,
    pub is_awaiting_user: bool,
    pub propagation_seconds: i32,
}

impl AuthorizationChallengeItem {
    pub fn kind(&self) -> ChallengeType {
        self.challenge_type.unwrap_or(ChallengeType::Unknown)
    }
}

#[derive(Debug, Default)]
pub struct PendingAuthorization {
    pub identifier: Option<Identifier>,
    pub authorization_url: String,
    pub challenges: Vec<AuthorizationChallengeItem>,
    pub attempted_challenge: Option<AuthorizationChallengeItem>,
    pub is_validated: bool,
    pub authorization_error: Option<String>,
    pub cleanup: Option<Cleanup>,
    pub order_uri: Option<String>,
}

impl PendingAuthorization {
    pub fn identifier_value(&self) -> &str {
        self.identifier
            .as_ref()
            .map(|i| i.value.as_str())
            .unwrap_or_default()
    }

    pub fn challenge(&self, kind: ChallengeType) -> Option<&AuthorizationChallengeItem> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == Some(kind))
    }

    pub fn add_cleanup(&mut self, cleanup: Cleanup) {
        match &mut self.cleanup {
            Some(existing) => existing.append(cleanup),
            None => self.cleanup = Some(cleanup),
        }
    }

    /// Run registered cleanups. Later calls are no-ops.
    pub async fn run_cleanup(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingOrder {
    pub order_uri: Option<String>,
    pub is_pending_authorizations: bool,
    pub authorizations: Vec<PendingAuthorization>,
    pub is_failure: bool,
    pub failure_message: Option<String>,
}

impl PendingOrder {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            is_failure: true,
            failure_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Request handed to a DNS provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub record_type: String,
    pub target_domain_name: String,
    pub record_name: String,
    pub record_value: String,
    pub zone_id: Option<String>,
}

impl DnsRecord {
    pub fn txt(target: &str, name: &str, value: &str, zone_id: Option<String>) -> Self {
        Self {
            record_type: "TXT".into(),
            target_domain_name: target.into(),
            record_name: name.into(),
            record_value: value.into(),
            zone_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    pub zone_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub id: String,
    pub account_key: String,
    pub account_uri: String,
    pub email: String,
    pub account_fingerprint: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pfx,
    Pem,
    All,
}

impl OutputFormat {
    pub fn wants_pem(&self) -> bool {
        matches!(self, Self::Pem | Self::All)
    }

    pub fn wants_pfx(&self) -> bool {
        matches!(self, Self::Pfx | Self::All)
    }
}

/// A JWT authority token plus the CRL the resulting certificate must reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityToken {
    pub token: String,
    #[serde(default)]
    pub crl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AtcClaim {
    #[serde(default)]
    pub tktype: String,
    #[serde(default)]
    pub tkvalue: String,
    #[serde(default)]
    pub ca: Option<bool>,
    #[serde(default)]
    pub fingerprint: String,
}

impl AuthorityToken {
    /// Decode the `atc` claim of the JWT payload. The signature is not checked.
    pub fn atc(&self) -> Result<AtcClaim> {
        let payload = self
            .token
            .split('.')
            .nth(1)
            .context("authority token is not a JWT")?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .context("authority token payload is not base64url")?;
        #[derive(Deserialize)]
        struct Claims {
            atc: AtcClaim,
        }
        let claims: Claims =
            serde_json::from_slice(&payload).context("authority token has no atc claim")?;
        Ok(claims.atc)
    }

    /// DER bytes of the TNAuthList carried by the token.
    pub fn tn_auth_list_der(&self) -> Result<Vec<u8>> {
        let atc = self.atc()?;
        URL_SAFE_NO_PAD
            .decode(atc.tkvalue.trim_end_matches('='))
            .context("tkvalue is not base64url")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub challenge_type: Option<ChallengeType>,
    /// Identifier of the DNS provider for dns-01.
    pub challenge_provider: Option<String>,
    /// Key into the credentials store.
    pub challenge_credential_key: Option<String>,
    /// Domains this config applies to, separated by `;` or `,`.
    pub domain_match: Option<String>,
    pub zone_id: Option<String>,
    pub parameters: HashMap<String, String>,
    pub challenge_root_path: Option<String>,
    pub challenge_delegation_rule: Option<String>,
}

impl ChallengeConfig {
    pub fn kind(&self) -> ChallengeType {
        self.challenge_type.unwrap_or(ChallengeType::Http01)
    }

    fn domain_match_list(&self) -> Vec<String> {
        self.domain_match
            .as_deref()
            .unwrap_or_default()
            .split([';', ','])
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertRequestConfig {
    pub primary_domain: String,
    pub subject_alternative_names: Vec<String>,
    pub subject_ip_addresses: Vec<String>,
    pub authority_tokens: Vec<AuthorityToken>,
    pub challenges: Vec<ChallengeConfig>,
    pub website_root_path: Option<String>,
    pub perform_challenge_file_copy: bool,
    pub perform_extensionless_config_checks: bool,
    pub perform_auto_config: bool,
    pub key_type: Option<KeyType>,
    pub reuse_private_key: bool,
    pub custom_private_key: Option<String>,
    pub custom_csr: Option<String>,
    pub require_ocsp_must_staple: bool,
    pub preferred_expiry_days: Option<u32>,
    pub preferred_chain: Option<String>,
    pub output_format: Option<OutputFormat>,
}

impl Default for CertRequestConfig {
    fn default() -> Self {
        Self {
            primary_domain: String::new(),
            subject_alternative_names: Vec::new(),
            subject_ip_addresses: Vec::new(),
            authority_tokens: Vec::new(),
            challenges: Vec::new(),
            website_root_path: None,
            perform_challenge_file_copy: true,
            perform_extensionless_config_checks: true,
            perform_auto_config: true,
            key_type: None,
            reuse_private_key: false,
            custom_private_key: None,
            custom_csr: None,
            require_ocsp_must_staple: false,
            preferred_expiry_days: None,
            preferred_chain: None,
            output_format: None,
        }
    }
}

impl CertRequestConfig {
    pub fn for_domains(primary: &str, sans: &[&str]) -> Self {
        Self {
            primary_domain: primary.into(),
            subject_alternative_names: sans.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Primary domain followed by distinct SANs, in order.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        let primary = self.primary_domain.trim();
        if !primary.is_empty() {
            domains.push(primary.to_string());
        }
        for san in &self.subject_alternative_names {
            let san = san.trim();
            if !san.is_empty() && !domains.iter().any(|d| d.eq_ignore_ascii_case(san)) {
                domains.push(san.to_string());
            }
        }
        domains
    }

    /// Every identifier the order must authorize.
    pub fn identifiers(&self) -> Result<Vec<Identifier>> {
        let mut identifiers = Vec::new();
        for domain in self.domains() {
            let ascii = to_ascii_domain(&domain)?;
            let id = Identifier::dns(ascii);
            if !identifiers.contains(&id) {
                identifiers.push(id);
            }
        }
        for ip in &self.subject_ip_addresses {
            identifiers.push(Identifier::ip(ip.trim()));
        }
        for token in &self.authority_tokens {
            let atc = token.atc()?;
            identifiers.push(Identifier::tn_auth_list(atc.tkvalue));
        }
        Ok(identifiers)
    }

    pub fn authority_token_for(&self, tkvalue: &str) -> Option<&AuthorityToken> {
        self.authority_tokens
            .iter()
            .find(|t| t.atc().map(|a| a.tkvalue == tkvalue).unwrap_or(false))
    }

    pub fn wants_challenge(&self, kind: ChallengeType) -> bool {
        self.challenges.iter().any(|c| c.kind() == kind)
    }

    /// Pick the challenge configuration for one identifier.
    pub fn challenge_config(&self, identifier: &str) -> ChallengeConfig {
        match self.challenges.len() {
            0 => return ChallengeConfig::default(),
            1 => return self.challenges[0].clone(),
            _ => {}
        }
        let identifier = identifier.trim().to_lowercase();
        let with_list: Vec<(&ChallengeConfig, Vec<String>)> = self
            .challenges
            .iter()
            .map(|c| (c, c.domain_match_list()))
            .filter(|(_, list)| !list.is_empty())
            .collect();

        // exact match, including an explicitly listed wildcard
        if let Some((config, _)) = with_list.iter().find(|(_, l)| l.contains(&identifier)) {
            return (*config).clone();
        }

        if !is_wildcard(&identifier) {
            // a wildcard entry matching exactly one label, longest first
            let mut wildcard_matches: Vec<(&ChallengeConfig, &String)> = with_list
                .iter()
                .flat_map(|(c, l)| l.iter().map(move |d| (*c, d)))
                .filter(|(_, d)| is_wildcard(d) && wildcard_covers(d, &identifier))
                .collect();
            wildcard_matches.sort_by_key(|(_, d)| std::cmp::Reverse(d.len()));
            if let Some((config, _)) = wildcard_matches.first() {
                return (*config).clone();
            }
        }

        // longest configured parent domain
        let base = identifier.trim_start_matches("*.");
        let mut parent_matches: Vec<(&ChallengeConfig, &String)> = with_list
            .iter()
            .flat_map(|(c, l)| l.iter().map(move |d| (*c, d)))
            .filter(|(_, d)| !is_wildcard(d) && (base == d.as_str() || base.ends_with(&format!(".{d}"))))
            .collect();
        parent_matches.sort_by_key(|(_, d)| std::cmp::Reverse(d.len()));
        if let Some((config, _)) = parent_matches.first() {
            return (*config).clone();
        }

        self.challenges
            .iter()
            .find(|c| c.domain_match_list().is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

fn wildcard_covers(wildcard: &str, domain: &str) -> bool {
    let Some(suffix) = wildcard.strip_prefix("*.") else {
        return false;
    };
    match domain.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest == suffix,
        None => false,
    }
}

/// A certificate managed over time: its request plus renewal history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedCertificate {
    pub id: String,
    pub name: String,
    pub server_site_id: Option<String>,
    pub request: CertRequestConfig,
    #[serde(with = "time::serde::rfc3339::option")]
    pub date_renewed: Option<OffsetDateTime>,
    pub renewal_failure_count: u32,
    pub current_order_uri: Option<String>,
}

impl ManagedCertificate {
    pub fn new(id: impl Into<String>, request: CertRequestConfig) -> Self {
        let name = request.primary_domain.clone();
        Self {
            id: id.into(),
            name,
            request,
            ..Default::default()
        }
    }

    /// Renewal history is healthy enough to skip HTTP probing and auto-config.
    pub fn has_healthy_renewals(&self) -> bool {
        self.date_renewed.is_some() && self.renewal_failure_count < 2
    }
}
