use std::{path::Path, sync::atomic::Ordering};

use fs_err as fs;

use super::*;
use crate::{
    config::HttpChallengeSettings,
    model::{CertRequestConfig, ChallengeConfig},
    testing::{fake_registry, DnsLog, FakeCredentials, FakeProbe, FakeResolver, FAKE_PROVIDER_ID},
};

fn diagnostics(probe: Arc<FakeProbe>, log: &DnsLog) -> PreflightDiagnostics {
    let responder = ChallengeResponder::new(
        HttpChallengeSettings {
            config_templates_dir: None,
            config_file_name: "web.config".into(),
        },
        Arc::new(fake_registry(log, false)),
        Arc::new(FakeCredentials::default().with("dns-creds", &[("api_key", "secret")])),
        probe,
    );
    PreflightDiagnostics::new(
        Arc::new(responder),
        PreflightSettings {
            max_concurrent_lookups: 8,
        },
    )
}

fn http_cert(root: &Path, sans: &[&str]) -> ManagedCertificate {
    let mut request = CertRequestConfig::for_domains("www.example.com", sans);
    request.website_root_path = Some(root.display().to_string());
    ManagedCertificate::new("cert-1", request)
}

fn dns_cert(primary: &str, sans: &[&str]) -> ManagedCertificate {
    let mut request = CertRequestConfig::for_domains(primary, sans);
    request.challenges = vec![ChallengeConfig {
        challenge_type: Some(ChallengeType::Dns01),
        challenge_provider: Some(FAKE_PROVIDER_ID.into()),
        challenge_credential_key: Some("dns-creds".into()),
        ..Default::default()
    }];
    ManagedCertificate::new("cert-1", request)
}

#[tokio::test]
async fn primary_domain_is_required() {
    let preflight = diagnostics(Arc::new(FakeProbe::default()), &DnsLog::default());
    let managed = ManagedCertificate::new("cert-1", CertRequestConfig::default());
    let results = preflight.test_challenge_response(&managed, false).await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_ok);
    assert!(results[0].message.contains("no primary domain"));
}

#[tokio::test]
async fn wildcard_cannot_mix_with_immediate_subdomain() {
    let preflight = diagnostics(Arc::new(FakeProbe::default()), &DnsLog::default());
    let results = preflight
        .test_challenge_response(&dns_cert("*.example.com", &["www.example.com"]), false)
        .await;
    assert_eq!(results.len(), 1);
    assert!(results[0].message.contains("*.example.com"));
    assert!(results[0].message.contains("www.example.com"));

    // the bare domain and deeper names are fine
    let log = DnsLog::default();
    let preflight = diagnostics(Arc::new(FakeProbe::default()), &log);
    let results = preflight
        .test_challenge_response(
            &dns_cert("*.example.com", &["example.com", "a.b.example.com"]),
            false,
        )
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_ok));
}

#[tokio::test]
async fn http_failure_stops_remaining_checks() {
    let root = tempfile::tempdir().unwrap();
    let probe = Arc::new(FakeProbe::answering(&[false]));
    let preflight = diagnostics(probe.clone(), &DnsLog::default());

    let results = preflight
        .test_challenge_response(&http_cert(root.path(), &["api.example.com"]), false)
        .await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_ok);
    assert_eq!(probe.check_count(), 1);
    assert_eq!(
        probe.checked.lock().unwrap()[0],
        "http://www.example.com/.well-known/acme-challenge/configcheck"
    );

    // the probe file stays for later checks
    let check_file = root.path().join(".well-known/acme-challenge/configcheck");
    assert_eq!(fs::read_to_string(check_file).unwrap(), CONFIG_CHECK_CONTENT);
}

#[tokio::test]
async fn tls_sni_is_tested_as_http() {
    let root = tempfile::tempdir().unwrap();
    let probe = Arc::new(FakeProbe::answering(&[true]));
    let preflight = diagnostics(probe.clone(), &DnsLog::default());
    let mut managed = http_cert(root.path(), &[]);
    managed.request.challenges = vec![ChallengeConfig {
        challenge_type: Some(ChallengeType::TlsSni01),
        ..Default::default()
    }];

    let results = preflight.test_challenge_response(&managed, false).await;
    assert_eq!(results.len(), 2);
    assert!(results[0].has_warning);
    assert!(results[1].is_ok && !results[1].has_warning);
    assert_eq!(probe.check_count(), 1);
}

#[tokio::test]
async fn dns_checks_use_test_records_and_clean_up() {
    let log = DnsLog::default();
    let preflight = diagnostics(Arc::new(FakeProbe::default()), &log);
    let results = preflight
        .test_challenge_response(&dns_cert("example.com", &["*.example.com"]), false)
        .await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok));

    let entries = log.entries();
    let ops: Vec<&str> = entries.iter().map(|(op, _)| op.as_str()).collect();
    assert_eq!(ops, ["create", "create", "delete", "delete"]);
    for (_, record) in &entries {
        assert_eq!(record.record_name, "_acme-challenge-test.example.com");
        assert_eq!(record.record_value.len(), 43);
    }
}

#[tokio::test(start_paused = true)]
async fn dns_resolution_is_bounded_and_only_warns() {
    let log = DnsLog::default();
    let resolver = Arc::new(FakeResolver::without(&["d3.example.com"]));
    let preflight =
        diagnostics(Arc::new(FakeProbe::default()), &log).with_resolver(resolver.clone());
    let sans: Vec<String> = (1..20).map(|n| format!("d{n}.example.com")).collect();
    let sans: Vec<&str> = sans.iter().map(String::as_str).collect();

    let results = preflight
        .test_challenge_response(&dns_cert("d0.example.com", &sans), true)
        .await;
    // one resolution status and one dns check per name
    assert_eq!(results.len(), 40);
    let lookups = &results[..20];
    assert!(lookups.iter().all(|r| r.is_ok));
    assert_eq!(lookups.iter().filter(|r| r.has_warning).count(), 1);
    assert!(lookups[3].message.contains("d3.example.com"));

    let peak = resolver.peak.load(Ordering::SeqCst);
    assert!(peak > 1 && peak <= 8, "peak concurrency {peak}");
}

#[tokio::test(start_paused = true)]
async fn wildcard_and_bare_domain_are_resolved_once() {
    let resolver = Arc::new(FakeResolver::default());
    let preflight = diagnostics(Arc::new(FakeProbe::default()), &DnsLog::default())
        .with_resolver(resolver.clone());

    let results = preflight
        .test_challenge_response(
            &dns_cert("example.com", &["www.other.com", "*.example.com"]),
            true,
        )
        .await;
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 2);
    // two resolution statuses, then one dns check per identifier
    assert_eq!(results.len(), 5);
    assert!(results[0].message.contains("example.com"));
    assert!(results[1].message.contains("www.other.com"));
}
