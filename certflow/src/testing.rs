//! Fakes shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{extension::SubjectAlternativeName, X509Builder, X509NameBuilder, X509Req, X509},
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    account::AccountManager,
    acme_client::{
        AccountContext, AccountResource, AccountStatus, AcmeApi, Authorization,
        AuthorizationStatus, Challenge, ChallengeStatus, Directory, NewAccountRequest, Order,
        OrderStatus,
    },
    config::Settings,
    credentials::CredentialsStore,
    crypto::PrivateKey,
    dns01_client::{
        provider_factory, DnsProvider, DnsProviderRegistry, ProviderDefinition, ProviderParameter,
    },
    error::{Error, Problem, Result},
    model::{ActionResult, DnsRecord, DnsZone, Identifier, IdentifierType},
    probe::{DomainResolver, ResourceProbe},
    web_server::{BindingCertificate, SiteInfo, TargetWebServer},
};

const CA_BASE: &str = "https://ca.test";

/// An account manager with a freshly registered account at `ca`.
pub(crate) async fn registered_accounts(ca: &Arc<FakeCa>, settings: &Settings) -> Arc<AccountManager> {
    let accounts = AccountManager::new(ca.clone(), &settings.storage, &settings.acme);
    accounts.init(None).await.unwrap();
    accounts
        .register("admin@example.com", None, None, None)
        .await
        .unwrap();
    Arc::new(accounts)
}

pub(crate) fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::defaults().unwrap();
    settings.acme.directory_url = format!("{CA_BASE}/directory");
    settings.acme.retry_interval = Duration::from_millis(1000);
    settings.storage.settings_path = dir.to_path_buf();
    settings.issuer_cache.trust_bundles = vec![];
    settings
}

/// A root and intermediate minted for one test.
pub(crate) struct TestCa {
    root: rcgen::Certificate,
    intermediate: rcgen::Certificate,
    intermediate_key: KeyPair,
    intermediate_x509: X509,
    intermediate_pkey: PKey<Private>,
    serial: AtomicUsize,
}

pub(crate) struct TestChain {
    /// Leaf followed by the intermediate.
    pub full_chain_pem: String,
    pub leaf_key_pem: String,
    pub root_pem: String,
    pub intermediate_pem: String,
}

impl TestCa {
    pub fn new(root_cn: &str) -> Self {
        let root_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(DnType::CommonName, root_cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root = params.self_signed(&root_key).unwrap();

        let intermediate_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{root_cn} Intermediate"));
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let intermediate = params
            .signed_by(&intermediate_key, &root, &root_key)
            .unwrap();

        let intermediate_x509 = X509::from_pem(intermediate.pem().as_bytes()).unwrap();
        let intermediate_pkey =
            PKey::private_key_from_pem(intermediate_key.serialize_pem().as_bytes()).unwrap();
        Self {
            root,
            intermediate,
            intermediate_key,
            intermediate_x509,
            intermediate_pkey,
            serial: AtomicUsize::new(1),
        }
    }

    pub fn root_pem(&self) -> String {
        self.root.pem()
    }

    pub fn intermediate_pem(&self) -> String {
        self.intermediate.pem()
    }

    /// Leaf plus intermediate for `domain`, with a fresh key.
    pub fn issue(&self, domain: &str) -> TestChain {
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec![domain.to_string()])
            .unwrap()
            .signed_by(&leaf_key, &self.intermediate, &self.intermediate_key)
            .unwrap();
        TestChain {
            full_chain_pem: format!("{}{}", leaf.pem(), self.intermediate.pem()),
            leaf_key_pem: leaf_key.serialize_pem(),
            root_pem: self.root.pem(),
            intermediate_pem: self.intermediate.pem(),
        }
    }

    /// Sign a CSR the way a CA would: subject and DNS names copied, key from the request.
    pub fn sign_csr(&self, csr_der: &[u8], names: &[String]) -> anyhow::Result<String> {
        let req = X509Req::from_der(csr_der).context("invalid csr")?;
        let public_key = req.public_key()?;
        if !req.verify(&public_key)? {
            bail!("csr signature does not verify");
        }
        let cn = req
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
            .or_else(|| names.first().cloned())
            .unwrap_or_else(|| "certflow test".into());

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = BigNum::from_u32(self.serial.fetch_add(1, Ordering::SeqCst) as u32)?;
        let serial: openssl::asn1::Asn1Integer = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        let mut subject = X509NameBuilder::new()?;
        subject.append_entry_by_text("CN", &cn)?;
        builder.set_subject_name(&subject.build())?;
        builder.set_issuer_name(self.intermediate_x509.subject_name())?;
        builder.set_pubkey(&public_key)?;
        let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after: Asn1Time = Asn1Time::days_from_now(90)?;
        builder.set_not_after(&not_after)?;
        if !names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for name in names {
                san.dns(name);
            }
            let san = san.build(&builder.x509v3_context(Some(&self.intermediate_x509), None))?;
            builder.append_extension(san)?;
        }
        builder.sign(&self.intermediate_pkey, MessageDigest::sha256())?;
        let leaf = builder.build();
        Ok(format!(
            "{}{}",
            String::from_utf8(leaf.to_pem()?)?,
            self.intermediate.pem()
        ))
    }
}

pub(crate) fn issue_chain(domain: &str, root_cn: &str) -> TestChain {
    TestCa::new(root_cn).issue(domain)
}

struct FakeOrder {
    order: Order,
    processing_left: usize,
    chain: Option<String>,
}

/// Knobs and counters of the in-memory CA.
pub(crate) struct FakeCaState {
    pub directory_available: bool,
    pub new_order_failures: VecDeque<Problem>,
    /// Status an authorization moves to once its challenge is answered; `None` keeps it pending.
    pub validation_outcome: Option<AuthorizationStatus>,
    /// Number of `processing` responses after finalize, counting the finalize response itself.
    pub processing_rounds: usize,
    pub retry_after: Option<Duration>,
    pub orders_start_ready: bool,
    pub key_change_fails: bool,
    pub tos_agreed: Option<bool>,

    pub resets: usize,
    pub new_orders: usize,
    pub order_fetches: usize,
    pub authz_fetches: usize,
    pub challenge_fetches: usize,
    pub finalize_calls: usize,
    pub downloads: usize,
    pub nonces_consumed: usize,
    pub revoked: usize,
    pub key_changes: usize,
    pub responded: Vec<(String, Value)>,
    pub last_not_after: Option<OffsetDateTime>,

    accounts: HashMap<String, AccountResource>,
    orders: HashMap<String, FakeOrder>,
    authorizations: HashMap<String, Authorization>,
}

impl Default for FakeCaState {
    fn default() -> Self {
        Self {
            directory_available: true,
            new_order_failures: VecDeque::new(),
            validation_outcome: Some(AuthorizationStatus::Valid),
            processing_rounds: 0,
            retry_after: None,
            orders_start_ready: false,
            key_change_fails: false,
            tos_agreed: Some(true),
            resets: 0,
            new_orders: 0,
            order_fetches: 0,
            authz_fetches: 0,
            challenge_fetches: 0,
            finalize_calls: 0,
            downloads: 0,
            nonces_consumed: 0,
            revoked: 0,
            key_changes: 0,
            responded: vec![],
            last_not_after: None,
            accounts: HashMap::new(),
            orders: HashMap::new(),
            authorizations: HashMap::new(),
        }
    }
}

impl FakeCaState {
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Pending orders whose authorizations are all valid become ready.
    fn refresh(&mut self, order_url: &str) {
        let Some(fake) = self.orders.get(order_url) else {
            return;
        };
        if fake.order.status != OrderStatus::Pending {
            return;
        }
        let all_valid = fake.order.authorizations.iter().all(|url| {
            self.authorizations
                .get(url)
                .is_some_and(|a| a.status == AuthorizationStatus::Valid)
        });
        let any_invalid = fake.order.authorizations.iter().any(|url| {
            self.authorizations
                .get(url)
                .is_some_and(|a| a.status == AuthorizationStatus::Invalid)
        });
        if let Some(fake) = self.orders.get_mut(order_url) {
            if any_invalid {
                fake.order.status = OrderStatus::Invalid;
            } else if all_valid {
                fake.order.status = OrderStatus::Ready;
            }
        }
    }
}

fn malformed(detail: &str) -> Error {
    Error::ca(Problem::new("urn:ietf:params:acme:error:malformed", detail))
}

pub(crate) struct FakeCa {
    ca: TestCa,
    state: Mutex<FakeCaState>,
}

impl FakeCa {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ca: TestCa::new("Fake Root X1"),
            state: Mutex::new(FakeCaState::default()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeCaState> {
        self.state.lock().unwrap()
    }

    pub fn test_ca(&self) -> &TestCa {
        &self.ca
    }

    fn challenges_for(order_no: usize, index: usize, identifier: &Identifier) -> Vec<Challenge> {
        let kinds: &[&str] = match identifier.kind {
            IdentifierType::TnAuthList => &["tkauth-01"],
            _ if identifier.is_wildcard() => &["dns-01"],
            _ => &["http-01", "dns-01", "tls-alpn-01"],
        };
        kinds
            .iter()
            .map(|kind| {
                serde_json::from_value(serde_json::json!({
                    "type": kind,
                    "url": format!("{CA_BASE}/chall/{order_no}/{index}/{kind}"),
                    "status": "pending",
                    "token": format!("token-{order_no}-{index}"),
                }))
                .unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl AcmeApi for FakeCa {
    async fn reset(&self) {
        self.state().resets += 1;
    }

    async fn directory(&self) -> Result<Directory> {
        if !self.state().directory_available {
            return Err(Error::NetworkFailure("connection refused".into()));
        }
        Ok(Directory {
            new_nonce: format!("{CA_BASE}/nonce"),
            new_account: format!("{CA_BASE}/new-acct"),
            new_order: format!("{CA_BASE}/new-order"),
            revoke_cert: Some(format!("{CA_BASE}/revoke")),
            key_change: Some(format!("{CA_BASE}/key-change")),
            ..Default::default()
        })
    }

    async fn consume_nonce(&self) -> Result<()> {
        self.state().nonces_consumed += 1;
        Ok(())
    }

    async fn new_account(
        &self,
        _key: &PrivateKey,
        request: &NewAccountRequest,
    ) -> Result<(String, AccountResource)> {
        let mut state = self.state();
        let url = format!("{CA_BASE}/acct/{}", state.accounts.len() + 1);
        let account = AccountResource {
            status: AccountStatus::Valid,
            contact: request.contact.clone(),
            terms_of_service_agreed: Some(request.terms_of_service_agreed),
            orders: None,
        };
        state.accounts.insert(url.clone(), account.clone());
        Ok((url, account))
    }

    async fn account(&self, ctx: &AccountContext) -> Result<AccountResource> {
        let state = self.state();
        match state.accounts.get(&ctx.kid) {
            Some(account) => {
                let mut account = account.clone();
                account.terms_of_service_agreed = state.tos_agreed;
                Ok(account)
            }
            None => Err(Error::ca(Problem::new(
                "urn:ietf:params:acme:error:accountDoesNotExist",
                "No account exists with the provided key",
            ))),
        }
    }

    async fn update_account(
        &self,
        ctx: &AccountContext,
        contact: &[String],
        _terms_of_service_agreed: bool,
    ) -> Result<AccountResource> {
        let mut state = self.state();
        let account = state
            .accounts
            .get_mut(&ctx.kid)
            .ok_or_else(|| malformed("no such account"))?;
        account.contact = contact.to_vec();
        Ok(account.clone())
    }

    async fn deactivate_account(&self, ctx: &AccountContext) -> Result<AccountResource> {
        let mut state = self.state();
        let account = state
            .accounts
            .get_mut(&ctx.kid)
            .ok_or_else(|| malformed("no such account"))?;
        account.status = AccountStatus::Deactivated;
        Ok(account.clone())
    }

    async fn change_key(&self, _ctx: &AccountContext, _new_key: &PrivateKey) -> Result<()> {
        let mut state = self.state();
        if state.key_change_fails {
            return Err(malformed("key rollover rejected"));
        }
        state.key_changes += 1;
        Ok(())
    }

    async fn new_order(
        &self,
        _ctx: &AccountContext,
        identifiers: &[Identifier],
        not_after: Option<OffsetDateTime>,
    ) -> Result<Order> {
        let mut state = self.state();
        state.new_orders += 1;
        state.last_not_after = not_after;
        if let Some(problem) = state.new_order_failures.pop_front() {
            return Err(Error::ca(problem));
        }
        let order_no = state.orders.len() + 1;
        let url = format!("{CA_BASE}/order/{order_no}");
        let mut authorizations = vec![];
        for (index, identifier) in identifiers.iter().enumerate() {
            let authz_url = format!("{CA_BASE}/authz/{order_no}/{index}");
            let wildcard = identifier.is_wildcard();
            let authz = Authorization {
                identifier: Identifier {
                    kind: identifier.kind,
                    value: identifier.value.trim_start_matches("*.").to_string(),
                },
                status: if state.orders_start_ready {
                    AuthorizationStatus::Valid
                } else {
                    AuthorizationStatus::Pending
                },
                challenges: Self::challenges_for(order_no, index, identifier),
                wildcard,
                expires: None,
            };
            state.authorizations.insert(authz_url.clone(), authz);
            authorizations.push(authz_url);
        }
        let order = Order {
            status: if state.orders_start_ready {
                OrderStatus::Ready
            } else {
                OrderStatus::Pending
            },
            expires: None,
            identifiers: identifiers.to_vec(),
            authorizations,
            finalize: format!("{url}/finalize"),
            certificate: None,
            error: None,
            url: url.clone(),
            retry_after: None,
        };
        state.orders.insert(
            url,
            FakeOrder {
                order: order.clone(),
                processing_left: 0,
                chain: None,
            },
        );
        Ok(order)
    }

    async fn order(&self, _ctx: &AccountContext, url: &str) -> Result<Order> {
        let mut state = self.state();
        state.order_fetches += 1;
        state.refresh(url);
        let retry_after = state.retry_after;
        let fake = state
            .orders
            .get_mut(url)
            .ok_or_else(|| malformed("no such order"))?;
        if fake.order.status == OrderStatus::Processing {
            if fake.processing_left > 0 {
                fake.processing_left -= 1;
            } else {
                fake.order.status = OrderStatus::Valid;
                fake.order.certificate = Some(format!("{url}/cert"));
            }
        }
        let mut order = fake.order.clone();
        if order.status == OrderStatus::Processing {
            order.retry_after = retry_after;
        }
        Ok(order)
    }

    async fn authorization(&self, _ctx: &AccountContext, url: &str) -> Result<Authorization> {
        let mut state = self.state();
        state.authz_fetches += 1;
        state
            .authorizations
            .get(url)
            .cloned()
            .ok_or_else(|| malformed("no such authorization"))
    }

    async fn challenge(&self, _ctx: &AccountContext, url: &str) -> Result<Challenge> {
        let mut state = self.state();
        state.challenge_fetches += 1;
        state
            .authorizations
            .values()
            .flat_map(|a| a.challenges.iter())
            .find(|c| c.url == url)
            .cloned()
            .ok_or_else(|| malformed("no such challenge"))
    }

    async fn respond_challenge(
        &self,
        _ctx: &AccountContext,
        url: &str,
        payload: Value,
    ) -> Result<Challenge> {
        let mut state = self.state();
        state.responded.push((url.to_string(), payload));
        let outcome = state.validation_outcome;
        let authz = state
            .authorizations
            .values_mut()
            .find(|a| a.challenges.iter().any(|c| c.url == url))
            .ok_or_else(|| malformed("no such challenge"))?;
        let domain = authz.domain();
        if let Some(outcome) = outcome {
            authz.status = outcome;
        }
        let challenge = authz
            .challenges
            .iter_mut()
            .find(|c| c.url == url)
            .ok_or_else(|| malformed("no such challenge"))?;
        challenge.status = match outcome {
            Some(AuthorizationStatus::Valid) => ChallengeStatus::Valid,
            Some(AuthorizationStatus::Invalid) => {
                challenge.error = Some(Problem::new(
                    "urn:ietf:params:acme:error:unauthorized",
                    format!("Invalid response from http://{domain}/.well-known/acme-challenge/"),
                ));
                ChallengeStatus::Invalid
            }
            _ => ChallengeStatus::Processing,
        };
        Ok(challenge.clone())
    }

    async fn finalize(&self, _ctx: &AccountContext, url: &str, csr_der: &[u8]) -> Result<Order> {
        let mut state = self.state();
        state.finalize_calls += 1;
        let order_url = url.trim_end_matches("/finalize").to_string();
        state.refresh(&order_url);
        let rounds = state.processing_rounds;
        let retry_after = state.retry_after;
        let fake = state
            .orders
            .get_mut(&order_url)
            .ok_or_else(|| malformed("no such order"))?;
        if fake.order.status != OrderStatus::Ready {
            return Err(Error::ca(Problem::new(
                "urn:ietf:params:acme:error:orderNotReady",
                "Order is not ready for finalization",
            )));
        }
        let names: Vec<String> = fake
            .order
            .identifiers
            .iter()
            .filter(|i| i.kind == IdentifierType::Dns)
            .map(|i| i.value.clone())
            .collect();
        let chain = self
            .ca
            .sign_csr(csr_der, &names)
            .map_err(|e| malformed(&format!("bad csr: {e:#}")))?;
        fake.chain = Some(chain);
        if rounds > 0 {
            fake.order.status = OrderStatus::Processing;
            fake.processing_left = rounds - 1;
        } else {
            fake.order.status = OrderStatus::Valid;
            fake.order.certificate = Some(format!("{order_url}/cert"));
        }
        let mut order = fake.order.clone();
        if order.status == OrderStatus::Processing {
            order.retry_after = retry_after;
        }
        Ok(order)
    }

    async fn certificate(
        &self,
        _ctx: &AccountContext,
        url: &str,
        _preferred_chain: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        state.downloads += 1;
        let order_url = url.trim_end_matches("/cert");
        state
            .orders
            .get(order_url)
            .and_then(|o| o.chain.clone())
            .ok_or_else(|| malformed("no such certificate"))
    }

    async fn revoke_certificate(&self, _ctx: &AccountContext, _cert_der: &[u8]) -> Result<()> {
        self.state().revoked += 1;
        Ok(())
    }
}

pub(crate) const FAKE_PROVIDER_ID: &str = "DNS01.API.Fake";

/// Calls made against fake DNS providers, shared with the test.
#[derive(Default, Clone)]
pub(crate) struct DnsLog {
    inner: Arc<Mutex<Vec<(String, DnsRecord)>>>,
}

impl DnsLog {
    pub fn entries(&self) -> Vec<(String, DnsRecord)> {
        self.inner.lock().unwrap().clone()
    }

    fn push(&self, op: &str, record: &DnsRecord) {
        self.inner
            .lock()
            .unwrap()
            .push((op.to_string(), record.clone()));
    }
}

pub(crate) struct FakeDnsProvider {
    definition: ProviderDefinition,
    log: DnsLog,
    fail_delete: bool,
}

#[async_trait]
impl DnsProvider for FakeDnsProvider {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    async fn init(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn create_record(&self, record: &DnsRecord) -> anyhow::Result<ActionResult> {
        self.log.push("create", record);
        Ok(ActionResult::ok(format!("created {}", record.record_name)))
    }

    async fn delete_record(&self, record: &DnsRecord) -> anyhow::Result<ActionResult> {
        self.log.push("delete", record);
        if self.fail_delete {
            bail!("zone is locked");
        }
        Ok(ActionResult::ok(format!("deleted {}", record.record_name)))
    }

    async fn get_zones(&self) -> anyhow::Result<Vec<DnsZone>> {
        Ok(vec![DnsZone {
            zone_id: "zone-1".into(),
            name: "example.com".into(),
        }])
    }

    async fn test(&self) -> anyhow::Result<ActionResult> {
        Ok(ActionResult::ok("ok"))
    }
}

pub(crate) fn fake_provider_definition() -> ProviderDefinition {
    ProviderDefinition {
        id: FAKE_PROVIDER_ID.into(),
        title: "Fake DNS".into(),
        propagation_delay_seconds: 5,
        parameters: vec![ProviderParameter::credential("api_key", "API Key")],
        ..Default::default()
    }
}

/// Built-in providers plus the fake one, which records into `log`.
pub(crate) fn fake_registry(log: &DnsLog, fail_delete: bool) -> DnsProviderRegistry {
    let mut registry = DnsProviderRegistry::with_builtin();
    let log = log.clone();
    registry.register(
        fake_provider_definition(),
        provider_factory(move |ctx| {
            Ok(Box::new(FakeDnsProvider {
                definition: ctx.definition,
                log: log.clone(),
                fail_delete,
            }))
        }),
    );
    registry
}

#[derive(Default)]
pub(crate) struct FakeCredentials {
    entries: HashMap<String, HashMap<String, String>>,
    locked: HashSet<String>,
}

impl FakeCredentials {
    pub fn with(mut self, key: &str, values: &[(&str, &str)]) -> Self {
        self.entries.insert(
            key.into(),
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    /// Entries under `key` exist but cannot be decrypted.
    pub fn locked(mut self, key: &str) -> Self {
        self.locked.insert(key.into());
        self
    }
}

#[async_trait]
impl CredentialsStore for FakeCredentials {
    async fn get_unlocked_credentials(
        &self,
        storage_key: &str,
    ) -> anyhow::Result<HashMap<String, String>> {
        if self.locked.contains(storage_key) {
            bail!("the data protection key is not available");
        }
        self.entries
            .get(storage_key)
            .cloned()
            .context("credentials not found")
    }
}

#[derive(Default)]
pub(crate) struct FakeWebServer {
    pub site_path: Option<PathBuf>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeWebServer {
    pub fn with_site(path: &Path) -> Self {
        Self {
            site_path: Some(path.to_path_buf()),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetWebServer for FakeWebServer {
    async fn get_site_by_id(&self, id: &str) -> anyhow::Result<Option<SiteInfo>> {
        Ok(self.site_path.as_ref().map(|p| SiteInfo {
            id: id.into(),
            name: "Default Web Site".into(),
            path: p.display().to_string(),
        }))
    }

    async fn install_certificate_for_binding(
        &self,
        _site_id: &str,
        host: &str,
        _cert: &BindingCertificate,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("install {host}"));
        Ok(())
    }

    async fn remove_https_binding(&self, _site_id: &str, host: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("unbind {host}"));
        Ok(())
    }

    async fn remove_certificate(&self, thumbprint: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {}", &thumbprint[..8]));
        Ok(())
    }

    async fn get_server_version(&self) -> anyhow::Result<String> {
        Ok("10.0".into())
    }
}

/// Answers URL checks from a script; once exhausted every check fails.
#[derive(Default)]
pub(crate) struct FakeProbe {
    answers: Mutex<VecDeque<bool>>,
    pub checked: Mutex<Vec<String>>,
    /// Never answer, like a web server that accepts the connection and stalls.
    hang: bool,
}

impl FakeProbe {
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn check_count(&self) -> usize {
        self.checked.lock().unwrap().len()
    }
}

#[async_trait]
impl ResourceProbe for FakeProbe {
    async fn check_url(&self, url: &str, _expected: Option<&str>) -> anyhow::Result<bool> {
        self.checked.lock().unwrap().push(url.to_string());
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
    }
}

/// Resolves everything except `missing`, taking a while to do so.
#[derive(Default)]
pub(crate) struct FakeResolver {
    pub missing: HashSet<String>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl FakeResolver {
    pub fn without(domains: &[&str]) -> Self {
        Self {
            missing: domains.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DomainResolver for FakeResolver {
    async fn resolves(&self, domain: &str) -> anyhow::Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(!self.missing.contains(domain))
    }
}

