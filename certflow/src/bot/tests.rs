use std::path::Path;

use tokio::time::Instant;

use super::*;
use crate::{
    acme_client::AuthorizationStatus,
    config::HttpChallengeSettings,
    crypto::KeyType,
    dns01_client::MANUAL_PROVIDER_ID,
    model::{CertRequestConfig, ChallengeConfig},
    testing::{
        fake_registry, test_settings, DnsLog, FakeCa, FakeCredentials, FakeProbe, TestCa,
        FAKE_PROVIDER_ID,
    },
};

fn settings(dir: &Path) -> Settings {
    let mut settings = test_settings(dir);
    settings.output.default_key_type = KeyType::Ecdsa256;
    settings.issuer_cache.allow_unknown_roots = true;
    settings
}

fn responder(log: &DnsLog) -> ChallengeResponder {
    responder_with_checker(log, FakeProbe::default())
}

fn responder_with_checker(log: &DnsLog, checker: FakeProbe) -> ChallengeResponder {
    ChallengeResponder::new(
        HttpChallengeSettings {
            config_templates_dir: None,
            config_file_name: "web.config".into(),
        },
        Arc::new(fake_registry(log, false)),
        Arc::new(FakeCredentials::default().with("dns-creds", &[("api_key", "secret")])),
        Arc::new(checker),
    )
}

async fn bot(ca: &Arc<FakeCa>, settings: Settings, log: &DnsLog) -> CertBot {
    bot_with(ca, settings, responder(log)).await
}

async fn bot_with(ca: &Arc<FakeCa>, settings: Settings, responder: ChallengeResponder) -> CertBot {
    let config = CertBotConfig::builder()
        .settings(settings)
        .contact_email("admin@example.com")
        .auto_create_account(true)
        .pfx_password("secret".to_string())
        .build();
    CertBot::build(config, ca.clone(), responder).await.unwrap()
}

fn dns_cert(provider: &str) -> ManagedCertificate {
    let mut request = CertRequestConfig::for_domains("www.example.com", &["api.example.com"]);
    request.challenges = vec![ChallengeConfig {
        challenge_type: Some(ChallengeType::Dns01),
        challenge_provider: Some(provider.into()),
        challenge_credential_key: Some("dns-creds".into()),
        ..Default::default()
    }];
    ManagedCertificate::new("cert-1", request)
}

fn ops(log: &DnsLog) -> Vec<String> {
    log.entries().into_iter().map(|(op, _)| op).collect()
}

#[tokio::test(start_paused = true)]
async fn dns_request_issues_certificate() {
    tracing_subscriber::fmt::try_init().ok();

    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut managed = dns_cert(FAKE_PROVIDER_ID);

    let start = Instant::now();
    let result = bot.request_certificate(&mut managed, None).await;
    assert!(result.is_success, "{}", result.message);
    // the provider's propagation delay is waited once
    assert!(start.elapsed() >= Duration::from_secs(5));

    let certificate = result.certificate.unwrap();
    assert!(certificate.pfx_path.unwrap().exists());
    assert_eq!(ops(&log), ["create", "create", "delete", "delete"]);
    assert!(bot.orders().tracker().is_empty());
    assert!(managed.date_renewed.is_some());
    assert_eq!(managed.renewal_failure_count, 0);
    assert_eq!(ca.state().responded.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_dns_pauses_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut managed = dns_cert(MANUAL_PROVIDER_ID);

    let paused = bot.request_certificate(&mut managed, None).await;
    assert!(!paused.is_success);
    assert!(paused.is_awaiting_user);
    assert!(paused.message.contains("_acme-challenge.www.example.com"));
    let uri = paused.order_uri.clone().unwrap();
    assert_eq!(managed.current_order_uri.as_deref(), Some(uri.as_str()));
    assert_eq!(managed.renewal_failure_count, 0);
    assert!(ca.state().responded.is_empty());

    let resumed = bot.request_certificate(&mut managed, Some(&uri)).await;
    assert!(resumed.is_success, "{}", resumed.message);
    assert_eq!(resumed.order_uri.as_deref(), Some(uri.as_str()));
    assert_eq!(ca.state().new_orders, 1);
    assert!(managed.current_order_uri.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_validation_still_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    ca.state().validation_outcome = Some(AuthorizationStatus::Invalid);
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut managed = dns_cert(FAKE_PROVIDER_ID);

    let result = bot.request_certificate(&mut managed, None).await;
    assert!(!result.is_success);
    assert!(result.message.contains("invalid"), "{}", result.message);
    assert_eq!(ops(&log), ["create", "create", "delete", "delete"]);
    assert!(bot.orders().tracker().is_empty());
    assert_eq!(managed.renewal_failure_count, 1);
    assert_eq!(ca.state().finalize_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_runs_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut managed = dns_cert(FAKE_PROVIDER_ID);

    let result = bot
        .request_certificate_until(&mut managed, None, sleep(Duration::from_secs(3)))
        .await;
    assert!(!result.is_success);
    assert!(result.message.contains("cancelled"), "{}", result.message);
    assert!(result.order_uri.is_some());
    assert_eq!(ops(&log), ["create", "create", "delete", "delete"]);
    assert!(ca.state().responded.is_empty());
    assert!(bot.orders().tracker().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_checking_http_removes_challenge_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot_with(
        &ca,
        settings(dir.path()),
        responder_with_checker(&log, FakeProbe::hanging()),
    )
    .await;
    let mut request = CertRequestConfig::for_domains("www.example.com", &[]);
    request.website_root_path = Some(root.path().display().to_string());
    let mut managed = ManagedCertificate::new("cert-1", request);

    let result = bot
        .request_certificate_until(&mut managed, None, sleep(Duration::from_secs(3)))
        .await;
    assert!(!result.is_success);
    assert!(result.message.contains("cancelled"), "{}", result.message);

    let challenge_dir = root.path().join(".well-known/acme-challenge");
    let left: Vec<_> = fs_err::read_dir(&challenge_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(left.is_empty(), "challenge files left: {left:?}");
    assert!(ca.state().responded.is_empty());
}

#[tokio::test(start_paused = true)]
async fn renewal_timeout_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    // never leaves pending, so polling would take ten checks
    ca.state().validation_outcome = None;
    let mut settings = settings(dir.path());
    settings.renewal.timeout = Duration::from_secs(8);
    let log = DnsLog::default();
    let bot = bot(&ca, settings, &log).await;
    let mut managed = dns_cert(FAKE_PROVIDER_ID);

    let start = Instant::now();
    let result = bot.request_certificate(&mut managed, None).await;
    assert_eq!(start.elapsed(), Duration::from_secs(8));
    assert!(result.message.contains("8s"), "{}", result.message);
    assert_eq!(ops(&log).iter().filter(|op| *op == "delete").count(), 2);
    assert_eq!(managed.renewal_failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_request_for_same_domain_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut first = dns_cert(FAKE_PROVIDER_ID);
    let mut second = dns_cert(FAKE_PROVIDER_ID);

    let (a, b) = tokio::join!(
        bot.request_certificate(&mut first, None),
        bot.request_certificate(&mut second, None)
    );
    assert!(a.is_success, "{}", a.message);
    assert!(!b.is_success);
    assert!(b.message.contains("already in progress"));
    assert_eq!(ca.state().new_orders, 1);

    // the guard is released afterwards
    let again = bot.request_certificate(&mut second, None).await;
    assert!(again.is_success, "{}", again.message);
}

#[tokio::test(start_paused = true)]
async fn renew_only_when_expiring() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let log = DnsLog::default();
    let bot = bot(&ca, settings(dir.path()), &log).await;
    let mut managed = dns_cert(FAKE_PROVIDER_ID);

    // rcgen defaults to a validity far in the future
    let live = TestCa::new("Live Root").issue("www.example.com").full_chain_pem;
    assert!(bot
        .renew_if_needed(&mut managed, Some(&live))
        .await
        .unwrap()
        .is_none());
    assert_eq!(ca.state().new_orders, 0);

    let result = bot.renew_if_needed(&mut managed, None).await.unwrap().unwrap();
    assert!(result.is_success, "{}", result.message);

    // issued by the fake CA for 90 days, inside a 100 day window
    let issued = result.certificate.unwrap().full_chain_pem;
    assert!(need_renew(&issued, Duration::from_secs(100 * 86400)).unwrap());
    assert!(!need_renew(&issued, Duration::from_secs(30 * 86400)).unwrap());
}

#[tokio::test]
async fn missing_account_without_auto_create_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let ca = FakeCa::new();
    let config = CertBotConfig::builder()
        .settings(settings(dir.path()))
        .contact_email("admin@example.com")
        .auto_create_account(false)
        .build();
    match CertBot::build(config, ca.clone(), responder(&DnsLog::default())).await {
        Err(Error::ConfigInvalid(msg)) => assert!(msg.contains("registration is disabled")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("bot built without an account"),
    }
    assert_eq!(ca.state().new_orders, 0);
}
